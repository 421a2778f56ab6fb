//! Payload transcoding: value graph to body bytes and back.
//!
//! A transcoder turns a value into `(serializer id, compression id, bytes)`
//! and reverses the mapping on receipt. The two peers must agree on the ids;
//! there is no negotiation frame. The default implementation serializes the
//! value as a self-describing JSON document and compresses the result with
//! LZ4 block compression once it exceeds a configured threshold.

use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::Value;

use crate::monitor::Monitors;

/// Serializer id of the default self-describing JSON codec.
pub const SERIALIZER_JSON: u8 = 1;

/// Compression id for verbatim bodies.
pub const COMPRESSION_NONE: u8 = 0;
/// Compression id for LZ4 block compression with a prepended raw size.
pub const COMPRESSION_LZ4: u8 = 1;

/// Bodies at or below this many serialized bytes are stored verbatim.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 65536;

/// An encoded body together with the ids a peer needs to decode it.
#[derive(Clone, Debug)]
pub struct Encoded {
    pub serializer: u8,
    pub compression: u8,
    pub bytes: Vec<u8>,
}

/// Pluggable payload codec shared by one side of a connection.
pub trait Transcoder: Send + Sync {
    fn encode(&self, value: &Value) -> anyhow::Result<Encoded>;

    fn decode(&self, bytes: &[u8], serializer: u8, compression: u8) -> anyhow::Result<Value>;
}

/// Default transcoder: JSON serialization, LZ4 above the threshold.
pub struct JsonTranscoder {
    compress_threshold: usize,
    monitors: Arc<Monitors>,
}

impl JsonTranscoder {
    pub fn new(compress_threshold: usize, monitors: Arc<Monitors>) -> JsonTranscoder {
        JsonTranscoder { compress_threshold, monitors }
    }
}

impl Transcoder for JsonTranscoder {
    fn encode(&self, value: &Value) -> anyhow::Result<Encoded> {
        let raw = serde_json::to_vec(value).context("serializing call payload")?;
        if raw.len() <= self.compress_threshold {
            return Ok(Encoded {
                serializer: SERIALIZER_JSON,
                compression: COMPRESSION_NONE,
                bytes: raw,
            });
        }
        let compressed =
            lz4::block::compress(&raw, None, true).context("compressing call payload")?;
        Monitors::add(
            &self.monitors.compression_saved_bytes,
            raw.len().saturating_sub(compressed.len()) as u64,
        );
        Ok(Encoded {
            serializer: SERIALIZER_JSON,
            compression: COMPRESSION_LZ4,
            bytes: compressed,
        })
    }

    fn decode(&self, bytes: &[u8], serializer: u8, compression: u8) -> anyhow::Result<Value> {
        let raw = match compression {
            COMPRESSION_NONE => None,
            COMPRESSION_LZ4 => {
                Some(lz4::block::decompress(bytes, None).context("decompressing body")?)
            }
            other => bail!("unsupported compression id {other}"),
        };
        let bytes = raw.as_deref().unwrap_or(bytes);
        match serializer {
            SERIALIZER_JSON => serde_json::from_slice(bytes).context("deserializing body"),
            other => bail!("unsupported serializer id {other}"),
        }
    }
}
