//! fleet-rpc - a TCP request/response RPC framework in Rust
//!
//! This library provides the core of an RPC framework: a length-prefixed
//! binary wire protocol, a duplex per-connection channel that multiplexes
//! concurrent in-flight calls over a single socket, a server dispatcher,
//! and client-side cluster and broadcast dispatchers over a statically
//! configured fleet of backend hosts.
//!
//! ## Main Components
//!
//! - `protocol`: The wire layer. Packet framing (fixed 24-byte header plus
//!   body), payload transcoding (JSON serialization with LZ4 compression
//!   above a threshold) and the duplex channel with write-side merging,
//!   heartbeats and the graceful offline protocol.
//!
//! - `server`: TCP accept loop, service registry and request dispatcher
//!   with a bounded worker pool; overload is answered TOO_BUSY instead of
//!   queueing.
//!
//! - `client`: The client stack. A direct client correlates calls with
//!   responses by packet id over one channel; the client list tracks
//!   per-host liveness and rescues dead hosts in the background; the
//!   cluster client adds round-robin selection with warm-up protection for
//!   freshly recovered hosts; the broadcast client fans one call out to
//!   every host and aggregates per-host results.
//!
//! - `service`: Service descriptors, the method identity scheme and the
//!   invocation closure table the server dispatches into.
//!
//! ## Usage
//!
//! Register [`ServiceDescriptor`]s on an [`RpcServer`] and drive it with
//! `serve`. On the caller side, connect a [`ClusterClient`] or
//! [`BroadcastClient`] to the configured host list and issue calls with
//! `execute`.

pub mod client;
pub mod error;
pub mod logs;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod service;

pub use client::{
    BroadcastClient, BroadcastListener, BroadcastResponse, ClientConfig, ClientListListener,
    ClusterClient, DirectClient, DirectClientList, DirectClientListener,
};
pub use error::{CallError, InvokeError, RpcFault};
pub use monitor::Monitors;
pub use server::{RpcServer, ServerConfig, DEFAULT_PORT};
pub use service::{MethodHandler, MethodResult, ServiceDescriptor};
