//! Round-robin dispatch over the fleet with warm-up protection.
//!
//! Selection advances a shared counter modulo the host count. A slot whose
//! client was rescued within the last minute is in its protection window
//! and is skipped probabilistically, ramping traffic back up over the
//! window instead of hitting a cold backend with its full share at once:
//!
//! | seconds since rescue | skip probability |
//! |----------------------|------------------|
//! | [0, 15)              | 0.70             |
//! | [15, 30)             | 0.50             |
//! | [30, 45)             | 0.30             |
//! | [45, 60)             | 0.10             |
//! | 60 and beyond        | none             |
//!
//! After N consecutive skips (N = host count) the current index is
//! accepted regardless, so selection always makes forward progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::debug;

use crate::client::{ClientConfig, DirectClientList};
use crate::error::CallError;
use crate::logs;
use crate::monitor::Monitors;

/// Extra attempts after a TOO_BUSY response before giving up.
const TOO_BUSY_RETRIES: usize = 3;

/// Skip probability for a slot rescued `since_rescue` ago.
fn skip_probability(since_rescue: Duration) -> f64 {
    match since_rescue.as_secs() {
        0..=14 => 0.70,
        15..=29 => 0.50,
        30..=44 => 0.30,
        45..=59 => 0.10,
        _ => 0.0,
    }
}

/// Round-robin dispatcher over a [`DirectClientList`].
pub struct ClusterClient {
    list: DirectClientList,
    counter: AtomicU64,
}

impl ClusterClient {
    pub async fn connect(
        hosts: Vec<String>,
        config: ClientConfig,
    ) -> anyhow::Result<ClusterClient> {
        Ok(ClusterClient::new(DirectClientList::connect(hosts, config).await?))
    }

    pub fn new(list: DirectClientList) -> ClusterClient {
        ClusterClient { list, counter: AtomicU64::new(0) }
    }

    pub fn list(&self) -> &DirectClientList {
        &self.list
    }

    /// Executes a call on the next healthy host.
    ///
    /// The selected slot is used when healthy; otherwise a random healthy
    /// peer takes the call. TOO_BUSY responses re-enter selection up to
    /// three more times so a different host is likely to be picked; other
    /// failures are not retried.
    pub async fn execute(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let mut attempt = 0;
        loop {
            let index = self.select_slot();
            let Some(client) = self.list.get_or_available(index) else {
                Monitors::bump(&self.list.monitors().cluster_unavailable);
                return Err(CallError::IllegalState(format!(
                    "no healthy client in cluster {:?}",
                    self.list.hosts()
                )));
            };
            match client.execute(service, method, args.clone(), timeout).await {
                Err(CallError::TooBusy) if attempt < TOO_BUSY_RETRIES => {
                    attempt += 1;
                    debug!(
                        target: logs::CLIENT_ERROR,
                        "{} too busy, retry {attempt}/{TOO_BUSY_RETRIES}", client.host()
                    );
                }
                other => return other,
            }
        }
    }

    /// Advances the round-robin counter, honoring warm-up skips up to the
    /// budget of one full rotation.
    fn select_slot(&self) -> usize {
        let hosts = self.list.len() as u64;
        let mut index = 0;
        for _ in 0..hosts {
            index = (self.counter.fetch_add(1, Ordering::Relaxed) % hosts) as usize;
            let Some(since) = self.list.since_rescue(index) else {
                return index;
            };
            let probability = skip_probability(since);
            if probability <= 0.0 || rand::thread_rng().gen::<f64>() >= probability {
                return index;
            }
        }
        index
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("hosts", &self.list.hosts())
            .field("counter", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn skip_table_matches_protection_window() {
        assert_eq!(skip_probability(Duration::from_secs(0)), 0.70);
        assert_eq!(skip_probability(Duration::from_millis(14_999)), 0.70);
        assert_eq!(skip_probability(Duration::from_secs(15)), 0.50);
        assert_eq!(skip_probability(Duration::from_secs(29)), 0.50);
        assert_eq!(skip_probability(Duration::from_secs(30)), 0.30);
        assert_eq!(skip_probability(Duration::from_secs(45)), 0.10);
        assert_eq!(skip_probability(Duration::from_secs(59)), 0.10);
        assert_eq!(skip_probability(Duration::from_secs(60)), 0.0);
        assert_eq!(skip_probability(Duration::from_secs(3600)), 0.0);
    }

    #[test]
    fn observed_skip_rate_tracks_the_table() {
        // Ten thousand draws in the [0, 15) window; the observed rate must
        // sit within two points of 0.70.
        let mut rng = StdRng::seed_from_u64(42);
        let probability = skip_probability(Duration::from_secs(5));
        let mut skipped = 0usize;
        for _ in 0..10_000 {
            if rng.gen::<f64>() < probability {
                skipped += 1;
            }
        }
        let rate = skipped as f64 / 10_000.0;
        assert!((rate - 0.70).abs() < 0.02, "skip rate {rate} too far from 0.70");
    }
}
