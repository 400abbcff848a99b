//! Turning wire messages into bytes for byte-oriented channels.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::CapTpError;
use crate::message::Message;

/// Codec trait for message serialization.
pub trait Codec {
    type EncodeError: std::error::Error;
    type DecodeError: std::error::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;

    /// Encode one wire message.
    fn encode_message(msg: &Message) -> Result<Vec<u8>, CapTpError> {
        Self::encode(msg).map_err(|e| CapTpError::Codec(e.to_string()))
    }

    /// Decode one wire message.
    fn decode_message(buf: &[u8]) -> Result<Message, CapTpError> {
        Self::decode(buf).map_err(|e| CapTpError::Codec(e.to_string()))
    }
}

/// JSON codec using serde_json.
pub struct JsonCodec;

impl Codec for JsonCodec {
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}
