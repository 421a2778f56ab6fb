//! Names of the `tracing` targets the framework emits on.
//!
//! These strings are the contract with the embedding application's logging
//! configuration: subscribers can route or silence each stream by target.
//! Emission is always best-effort.

/// Connection lifecycle: connect, accept, close, offline, rescue.
pub const CONNECTION: &str = "fleet_rpc::connection";

/// Errors that belong to no single side (codec faults, worker failures).
pub const ERROR: &str = "fleet_rpc::error";

/// Server-side dispatch failures.
pub const SERVER_ERROR: &str = "fleet_rpc::server::error";

/// Server-side invocations that exceeded the slow threshold.
pub const SERVER_SLOW: &str = "fleet_rpc::server::slow";

/// Client-side call failures.
pub const CLIENT_ERROR: &str = "fleet_rpc::client::error";

/// Client-side calls that exceeded the slow threshold.
pub const CLIENT_SLOW: &str = "fleet_rpc::client::slow";
