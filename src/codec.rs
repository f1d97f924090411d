//! Serialization of job-log events to and from log entry payloads.
//!
//! The wire format is pluggable: a [`JobShard`](crate::job_shard::JobShard)
//! takes any [`EventCodec`], and the default [`JsonEventCodec`] round-trips
//! the full field set through JSON. The codec is purely data-shape; it holds
//! no state.

use thiserror::Error;

use crate::job::JobOperation;

/// Error type for codec operations.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Encode/decode strategy for job-log event payloads.
///
/// Implementations must round-trip exactly: `decode(encode(op)) == op` for
/// every representable operation, including absent optional fields.
pub trait EventCodec: Send + Sync {
    fn encode(&self, op: &JobOperation) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, payload: &[u8]) -> Result<JobOperation, CodecError>;
}

/// The default JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventCodec;

impl EventCodec for JsonEventCodec {
    fn encode(&self, op: &JobOperation) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(op).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<JobOperation, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
