use crate::slot::{Slot, SlotParseError};
use crate::value::Value;

/// Errors raised by the engine.
///
/// Protocol violations (`UnknownQuestion`, `DropNonExport`, ...) are kept
/// apart from `Rejected`, which carries an ordinary application rejection,
/// and from `Disconnected`, which is terminal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapTpError {
    #[error("CapTP {our_id} can only be one of either trap guest or trap host")]
    TrapRoleConflict { our_id: String },

    #[error("got an answer to a question we have not asked (answerID = {0})")]
    UnknownQuestion(Slot),

    #[error("unknown export {0}")]
    UnknownExport(Slot),

    #[error("cannot drop non-exported {0}")]
    DropNonExport(Slot),

    #[error("cannot import slot {0}")]
    UnexpectedSlot(Slot),

    #[error("trap iteration did not expect {0}")]
    UnexpectedTrapIteration(Slot),

    #[error("cannot answer a trap without a trap host")]
    NoTrapHost,

    #[error("refused trap on {0} because the target was not registered as a trap handler")]
    NotTrapHandler(Slot),

    #[error("invalid trap target: {0}")]
    InvalidTrapTarget(#[from] TrapTargetError),

    #[error("trap reply cannot be a promise")]
    TrapReplyPromise,

    #[error("trap transport failed: {0}")]
    TrapTransport(String),

    #[error("rejected: {0:?}")]
    Rejected(Value),

    #[error("disconnected: {0:?}")]
    Disconnected(Value),

    #[error("marshal error: {0}")]
    Marshal(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Slot(#[from] SlotParseError),

    #[error(transparent)]
    Send(#[from] SendError),
}

impl CapTpError {
    /// The value to reject a promise with when this error ends a call.
    pub fn to_reason(&self) -> Value {
        match self {
            CapTpError::Rejected(reason) | CapTpError::Disconnected(reason) => reason.clone(),
            other => Value::error("Error", other.to_string()),
        }
    }

    /// Whether the peer broke the protocol, as opposed to an application
    /// rejection or a local failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CapTpError::UnknownQuestion(_)
                | CapTpError::UnknownExport(_)
                | CapTpError::DropNonExport(_)
                | CapTpError::UnexpectedSlot(_)
                | CapTpError::UnexpectedTrapIteration(_)
                | CapTpError::NoTrapHost
                | CapTpError::NotTrapHandler(_)
        )
    }
}

/// Why a value cannot be the target of a synchronous trap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrapTargetError {
    #[error("this connection has no trap guest")]
    NoTrapGuest,
    #[error("target cannot be a promise")]
    Promise,
    #[error("target was not imported")]
    NotImported,
    #[error("imported target was not created as a trap handler")]
    NotTrapHandler,
}

/// The raw channel refused a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("raw send failed: {0}")]
pub struct SendError(pub String);
