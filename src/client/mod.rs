//! Client-side surfaces: single-host, fleet, cluster and broadcast.
//!
//! - [`DirectClient`]: one channel to one host, request/response
//!   correlation by packet id.
//! - [`DirectClientList`]: an ordered fleet of direct clients with per-slot
//!   liveness and background rescue.
//! - [`ClusterClient`]: round-robin dispatch over the list with warm-up
//!   protection for freshly recovered hosts and too-busy retry.
//! - [`BroadcastClient`]: the same call fanned out to every host with
//!   per-host result aggregation.

mod broadcast;
mod cluster;
mod direct;
mod list;

use std::time::Duration;

use crate::protocol::channel::ChannelConfig;
use crate::protocol::transcode::DEFAULT_COMPRESS_THRESHOLD;

pub use broadcast::{BroadcastClient, BroadcastListener, BroadcastResponse};
pub use cluster::ClusterClient;
pub use direct::{DirectClient, DirectClientListener};
pub use list::{ClientListListener, DirectClientList};

/// Tunables shared across the client stack.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Fallback deadline for calls issued without an explicit timeout.
    pub default_timeout: Duration,
    /// Calls slower than this are reported on the client slow stream.
    pub slow_threshold: Duration,
    /// Request bodies above this many serialized bytes are compressed.
    pub compress_threshold: usize,
    /// Pause between rescue sweeps while some host is still down.
    pub rescue_interval: Duration,
    /// Size of the broadcast fan-out pool.
    pub broadcast_workers: usize,
    /// Settings for client channels.
    pub channel: ChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            default_timeout: Duration::from_secs(5),
            slow_threshold: Duration::from_millis(50),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            rescue_interval: Duration::from_secs(5),
            broadcast_workers: 500,
            channel: ChannelConfig::client(),
        }
    }
}

impl ClientConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> ClientConfig {
        self.default_timeout = timeout;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> ClientConfig {
        self.slow_threshold = threshold;
        self
    }

    pub fn with_rescue_interval(mut self, interval: Duration) -> ClientConfig {
        self.rescue_interval = interval;
        self
    }

    pub fn with_broadcast_workers(mut self, workers: usize) -> ClientConfig {
        self.broadcast_workers = workers;
        self
    }
}
