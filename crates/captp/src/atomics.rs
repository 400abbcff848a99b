//! Trap delivery through a shared transfer buffer.
//!
//! The guest thread blocks in [`Consumer::recv_chunk`] while the host's
//! event loop writes the reply one chunk at a time. The reply is the JSON
//! text `[is_reject, {"body": ..., "slots": [...]}]`. Before each chunk the
//! guest sends a `next` iteration so the host knows to write it, and once it
//! has the whole reply it sends `return`.
//!
//! Both sides must be given clones of the same [`SharedTransferBuffer`], and
//! one buffer serves one trap call at a time.

use futures_util::future::LocalBoxFuture;
use shm_primitives::{Chunk, Producer, SharedTransferBuffer, TransferError};

use captp_core::{
    CapData, CapTpError, IterMethod, TrapGuest, TrapHost, TrapProducer, TrapRequest, Value,
};

/// Writes trap replies into the buffer.
#[derive(Clone)]
pub struct AtomicsTrapHost {
    buffer: SharedTransferBuffer,
}

impl AtomicsTrapHost {
    pub fn new(buffer: SharedTransferBuffer) -> Self {
        Self { buffer }
    }
}

impl TrapHost for AtomicsTrapHost {
    fn start(&self, is_reject: bool, data: CapData) -> Option<Box<dyn TrapProducer>> {
        let text = match encode_reply(is_reject, &data) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "cannot encode trap reply");
                encode_reply(true, &CapData::default()).unwrap_or_default()
            }
        };
        tracing::trace!(len = text.len(), capacity = self.buffer.data_capacity(), "trap reply queued");
        Some(Box::new(ReplyProducer {
            producer: self.buffer.producer(text),
            _buffer: self.buffer.clone(),
        }))
    }
}

struct ReplyProducer {
    producer: Producer,
    // `Producer` is a plain view; this keeps the memory it writes to alive.
    _buffer: SharedTransferBuffer,
}

impl TrapProducer for ReplyProducer {
    fn step(
        &mut self,
        method: IterMethod,
        _args: Vec<Value>,
    ) -> LocalBoxFuture<'_, Result<bool, CapTpError>> {
        Box::pin(async move {
            if method != IterMethod::Next {
                self.producer.finish();
                return Ok(true);
            }
            match self.producer.send_chunk().await {
                Ok(chunk) => {
                    tracing::trace!(last = chunk.is_last(), "wrote trap reply chunk");
                    Ok(chunk.is_last())
                }
                Err(TransferError::Finished) => Ok(true),
                Err(err) => Err(transfer_error(err)),
            }
        })
    }
}

/// Blocks the calling thread until the reply is in.
#[derive(Clone)]
pub struct AtomicsTrapGuest {
    buffer: SharedTransferBuffer,
}

impl AtomicsTrapGuest {
    pub fn new(buffer: SharedTransferBuffer) -> Self {
        Self { buffer }
    }
}

impl TrapGuest for AtomicsTrapGuest {
    fn deliver(&self, request: &TrapRequest<'_>) -> Result<(bool, CapData), CapTpError> {
        // Claim the buffer before the host can start writing.
        let mut consumer = self.buffer.begin_transfer();
        request.start()?;

        let mut bytes = Vec::new();
        loop {
            request.iterate(IterMethod::Next, Vec::new())?;
            match consumer.recv_chunk(&mut bytes) {
                Ok(Chunk::Last) => break,
                Ok(Chunk::More) => {}
                Err(err) => {
                    // Best effort; the transfer is already lost.
                    let _ = request.iterate(IterMethod::Throw, Vec::new());
                    return Err(transfer_error(err));
                }
            }
        }
        tracing::trace!(
            question = %request.question_id(),
            generation = consumer.generation(),
            len = bytes.len(),
            "trap reply received"
        );
        request.iterate(IterMethod::Return, Vec::new())?;
        decode_reply(&bytes)
    }
}

fn encode_reply(is_reject: bool, data: &CapData) -> Result<String, CapTpError> {
    serde_json::to_string(&(is_reject, data)).map_err(|e| CapTpError::Codec(e.to_string()))
}

fn decode_reply(bytes: &[u8]) -> Result<(bool, CapData), CapTpError> {
    serde_json::from_slice(bytes).map_err(|e| CapTpError::Codec(e.to_string()))
}

fn transfer_error(err: TransferError) -> CapTpError {
    CapTpError::TrapTransport(err.to_string())
}
