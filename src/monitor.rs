//! Shared lock-free counters updated at well-defined points of the call path.
//!
//! The core increments these counters and nothing else; exporting them as
//! concrete metrics is a concern of the embedding application.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counter set shared by channels, clients and servers.
///
/// All fields are monotonic counters. Readers should treat a snapshot of a
/// single field as approximate; no cross-field consistency is promised.
#[derive(Debug, Default)]
pub struct Monitors {
    /// Bytes saved by body compression (raw length minus compressed length).
    pub compression_saved_bytes: AtomicU64,
    /// Calls executed, on whichever side of the wire this instance lives.
    pub executed_calls: AtomicU64,
    /// Calls whose wall time exceeded the slow-execution threshold.
    pub slow_calls: AtomicU64,
    /// Server dispatch submissions rejected by the worker pool.
    pub rejected_dispatches: AtomicU64,
    /// Broadcast submissions rejected by the fan-out pool.
    pub rejected_broadcasts: AtomicU64,
    /// Cluster calls that found no healthy client at all.
    pub cluster_unavailable: AtomicU64,
    /// Bytes read from sockets, headers included.
    pub socket_bytes_read: AtomicU64,
    /// Bytes written to sockets, headers included.
    pub socket_bytes_written: AtomicU64,
}

impl Monitors {
    pub fn new() -> Arc<Monitors> {
        Arc::new(Monitors::default())
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        Monitors::add(counter, 1);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
