//! Body model for CALL packets.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::transcode::{Encoded, Transcoder};

/// Body of a CALL request: which method to invoke on which target, and with
/// what arguments.
///
/// `method` is a method identity string of the form `name(type1,type2,...)`;
/// the parenthesized list disambiguates overloads and fixes the declared
/// parameter count (see [`crate::service::parameter_count`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Target service (interface) identifier.
    pub target: String,
    /// Method identity within the target.
    pub method: String,
    /// Ordered argument list, possibly empty.
    pub args: Vec<Value>,
}

impl RequestMessage {
    pub fn encode(&self, transcoder: &dyn Transcoder) -> anyhow::Result<Encoded> {
        let value = serde_json::to_value(self).context("building request message")?;
        transcoder.encode(&value)
    }

    pub fn decode(
        bytes: &[u8],
        serializer: u8,
        compression: u8,
        transcoder: &dyn Transcoder,
    ) -> anyhow::Result<RequestMessage> {
        let value = transcoder.decode(bytes, serializer, compression)?;
        serde_json::from_value(value).context("parsing request message")
    }
}

/// Encodes a fault message for an error response body.
pub fn encode_fault(message: &str, transcoder: &dyn Transcoder) -> anyhow::Result<Encoded> {
    transcoder.encode(&Value::String(message.to_string()))
}

/// Decodes a fault message from an error response body, if one is present.
pub fn decode_fault(
    bytes: &[u8],
    serializer: u8,
    compression: u8,
    transcoder: &dyn Transcoder,
) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match transcoder.decode(bytes, serializer, compression) {
        Ok(Value::String(message)) => Some(message),
        Ok(other) => Some(other.to_string()),
        Err(_) => None,
    }
}
