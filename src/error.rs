//! Error taxonomy surfaced to `execute` callers.

use std::time::Duration;

use thiserror::Error;

/// Why a call failed, as seen by the caller.
///
/// A call either returns a value or fails with one of these four kinds.
/// Channel-internal I/O failures never leak through directly; pending calls
/// observe them as [`CallError::IllegalState`] or [`CallError::Timeout`].
#[derive(Debug, Error)]
pub enum CallError {
    /// The client, channel or cluster cannot take new calls.
    #[error("client unavailable: {0}")]
    IllegalState(String),

    /// The deadline elapsed with no response. The server is never told; a
    /// late response is discarded.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The peer signaled overload. Retried by the cluster client.
    #[error("server too busy")]
    TooBusy,

    /// The call reached the peer and failed there, or its response could
    /// not be understood.
    #[error(transparent)]
    Rpc(#[from] RpcFault),
}

/// Remote or decode-level failure detail behind [`CallError::Rpc`].
#[derive(Debug, Error)]
pub enum RpcFault {
    #[error("unknown service `{0}`")]
    ClassNotFound(String),

    #[error("unknown method `{0}`")]
    NoSuchMethod(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The target method raised; carries the peer-provided message.
    #[error("remote invocation failed: {0}")]
    Invocation(String),

    #[error("internal server error")]
    Internal,

    #[error("response decode failed: {0}")]
    Decode(String),

    #[error("unrecognized response status {0}")]
    UnknownStatus(i8),
}

/// Failure raised by a service method implementation.
///
/// `IllegalArgument` maps to the ILLEGAL_ARGUMENT wire status, anything
/// else to INVOCATION_ERROR with the message as the response body.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("{0}")]
    Failed(String),
}
