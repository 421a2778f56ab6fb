//! Fleet of direct clients with per-slot liveness and background rescue.
//!
//! The list keeps one slot per configured host. A slot holds an active
//! client or nothing. Slot transitions (active to empty on death, empty to
//! active on rescue) are performed under the slot lock so that exactly one
//! observer carries out each transition and the listener fires once.
//!
//! Removal happens on two converging paths: reactively, when a lookup
//! observes an inactive client, and proactively, through a close hook the
//! list plants in every client it creates. Either path empties the slot and
//! wakes the rescue task.
//!
//! At most one rescue task runs per list. It sweeps the empty slots,
//! reconnects what it can, records the recovery wall-clock (which drives
//! the cluster client's warm-up protection) and sleeps between sweeps until
//! every slot is filled again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::ensure;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::client::direct::{CloseHook, DirectClient, DirectClientListener, NoopClientListener};
use crate::client::ClientConfig;
use crate::logs;
use crate::monitor::Monitors;

/// Observer for fleet membership changes.
pub trait ClientListListener: Send + Sync {
    /// A slot lost its client; `offline` tells whether the host announced
    /// a graceful drain first.
    fn on_closed(&self, _host: &str, _offline: bool) {}

    /// A slot got a fresh client from the rescue task.
    fn on_recovered(&self, _host: &str) {}
}

struct NoopListListener;

impl ClientListListener for NoopListListener {}

/// Ordered fleet of direct clients, one slot per configured host.
pub struct DirectClientList {
    inner: Arc<ListInner>,
}

struct ListInner {
    hosts: Vec<String>,
    slots: Vec<RwLock<Option<Arc<DirectClient>>>>,
    rescue_time: Vec<AtomicU64>,
    rescue_running: AtomicBool,
    closed: AtomicBool,
    config: ClientConfig,
    monitors: Arc<Monitors>,
    listener: Arc<dyn ClientListListener>,
    client_listener: Arc<dyn DirectClientListener>,
}

impl DirectClientList {
    /// Connects to the fleet with default monitors and no listeners.
    pub async fn connect(
        hosts: Vec<String>,
        config: ClientConfig,
    ) -> anyhow::Result<DirectClientList> {
        DirectClientList::connect_with(
            hosts,
            config,
            Monitors::new(),
            Arc::new(NoopListListener),
            Arc::new(NoopClientListener),
        )
        .await
    }

    /// Connects to the fleet. At least one host must be reachable;
    /// unreachable hosts start empty and are left to the rescue task.
    pub async fn connect_with(
        hosts: Vec<String>,
        config: ClientConfig,
        monitors: Arc<Monitors>,
        listener: Arc<dyn ClientListListener>,
        client_listener: Arc<dyn DirectClientListener>,
    ) -> anyhow::Result<DirectClientList> {
        ensure!(!hosts.is_empty(), "host list is empty");
        let inner = Arc::new(ListInner {
            slots: hosts.iter().map(|_| RwLock::new(None)).collect(),
            rescue_time: hosts.iter().map(|_| AtomicU64::new(0)).collect(),
            hosts,
            rescue_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config,
            monitors,
            listener,
            client_listener,
        });

        let mut healthy = 0;
        for index in 0..inner.hosts.len() {
            match inner.spawn_client(index).await {
                Ok(client) => {
                    *inner.slots[index].write().expect("slot lock poisoned") = Some(client);
                    healthy += 1;
                }
                Err(e) => {
                    warn!(
                        target: logs::CONNECTION,
                        "initial connect to {} failed: {e:#}", inner.hosts[index]
                    );
                }
            }
        }
        ensure!(healthy > 0, "no reachable host in {:?}", inner.hosts);
        if healthy < inner.hosts.len() {
            inner.ensure_rescue();
        }
        Ok(DirectClientList { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[String] {
        &self.inner.hosts
    }

    pub fn monitors(&self) -> Arc<Monitors> {
        self.inner.monitors.clone()
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The client at `index`, if it is alive.
    ///
    /// Observing a dead client empties its slot (first observer only),
    /// notifies the listener and wakes the rescue task.
    ///
    /// # Panics
    ///
    /// Panics when `index` is out of range; slot indices are derived from
    /// the configured host list and an unknown index is a programming
    /// error.
    pub fn get(&self, index: usize) -> Option<Arc<DirectClient>> {
        let slot = self.inner.slots.get(index).expect("slot index out of range");
        let current = slot.read().expect("slot lock poisoned").clone();
        match current {
            Some(client) if client.is_active() => Some(client),
            Some(_) => {
                self.inner.clear_if_dead(index);
                None
            }
            None => {
                self.inner.ensure_rescue();
                None
            }
        }
    }

    /// A uniformly sampled healthy client whose index is not excluded.
    pub fn get_available(&self, exclude: &[usize]) -> Option<Arc<DirectClient>> {
        let mut healthy = Vec::new();
        for (index, slot) in self.inner.slots.iter().enumerate() {
            if exclude.contains(&index) {
                continue;
            }
            if let Some(client) = slot.read().expect("slot lock poisoned").as_ref() {
                if client.is_active() {
                    healthy.push(client.clone());
                }
            }
        }
        healthy.choose(&mut rand::thread_rng()).cloned()
    }

    /// Slot `index` if healthy, else a random healthy peer.
    pub fn get_or_available(&self, index: usize) -> Option<Arc<DirectClient>> {
        self.get(index).or_else(|| self.get_available(&[index]))
    }

    /// Wall-clock millis of the slot's last successful rescue, 0 if the
    /// slot never recovered after startup.
    pub fn rescue_time_millis(&self, index: usize) -> u64 {
        self.inner.rescue_time[index].load(Ordering::SeqCst)
    }

    /// Time since the slot's last rescue, `None` if it never recovered.
    pub fn since_rescue(&self, index: usize) -> Option<Duration> {
        let at = self.rescue_time_millis(index);
        if at == 0 {
            return None;
        }
        Some(Duration::from_millis(now_millis().saturating_sub(at)))
    }

    /// Closes every client and stops the rescue task.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in &self.inner.slots {
            let client = slot.write().expect("slot lock poisoned").take();
            if let Some(client) = client {
                client.close();
            }
        }
    }
}

impl ListInner {
    async fn spawn_client(self: &Arc<Self>, index: usize) -> anyhow::Result<Arc<DirectClient>> {
        let weak = Arc::downgrade(self);
        let hook: CloseHook = Box::new(move |_offline| {
            if let Some(inner) = weak.upgrade() {
                inner.clear_if_dead(index);
            }
        });
        DirectClient::connect_with(
            &self.hosts[index],
            self.config.clone(),
            self.monitors.clone(),
            self.client_listener.clone(),
            Some(hook),
        )
        .await
    }

    /// Empties the slot if its client is dead. Only the caller that
    /// performs the store notifies the listener.
    fn clear_if_dead(self: &Arc<Self>, index: usize) {
        let removed = {
            let mut slot = self.slots[index].write().expect("slot lock poisoned");
            match slot.as_ref() {
                Some(client) if !client.is_active() => {
                    let client = client.clone();
                    *slot = None;
                    Some(client)
                }
                _ => None,
            }
        };
        if let Some(client) = removed {
            info!(
                target: logs::CONNECTION,
                "removing dead client for {}{}",
                client.host(),
                if client.is_offline() { " (offline)" } else { "" }
            );
            self.listener.on_closed(client.host(), client.is_offline());
        }
        self.ensure_rescue();
    }

    /// Starts the rescue task unless one is already running.
    fn ensure_rescue(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .rescue_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            debug!(target: logs::CONNECTION, "rescue task started");
            loop {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let mut missing = 0;
                for index in 0..inner.hosts.len() {
                    if inner.slots[index].read().expect("slot lock poisoned").is_some() {
                        continue;
                    }
                    match inner.spawn_client(index).await {
                        Ok(client) => {
                            *inner.slots[index].write().expect("slot lock poisoned") = Some(client);
                            inner.rescue_time[index].store(now_millis(), Ordering::SeqCst);
                            info!(
                                target: logs::CONNECTION,
                                "recovered client for {}", inner.hosts[index]
                            );
                            inner.listener.on_recovered(&inner.hosts[index]);
                        }
                        Err(e) => {
                            missing += 1;
                            debug!(
                                target: logs::CONNECTION,
                                "rescue of {} failed: {e:#}", inner.hosts[index]
                            );
                        }
                    }
                }
                if missing == 0 {
                    break;
                }
                tokio::time::sleep(inner.config.rescue_interval).await;
            }
            inner.rescue_running.store(false, Ordering::SeqCst);
            debug!(target: logs::CONNECTION, "rescue task finished");
            // A client may have died between the final sweep and the flag
            // clear; restart rather than wait for the next lookup.
            if !inner.closed.load(Ordering::SeqCst)
                && inner
                    .slots
                    .iter()
                    .any(|slot| slot.read().expect("slot lock poisoned").is_none())
            {
                inner.ensure_rescue();
            }
        });
    }
}

impl std::fmt::Debug for DirectClientList {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let live: Vec<bool> = self
            .inner
            .slots
            .iter()
            .map(|slot| {
                slot.read()
                    .expect("slot lock poisoned")
                    .as_ref()
                    .is_some_and(|client| client.is_active())
            })
            .collect();
        f.debug_struct("DirectClientList")
            .field("hosts", &self.inner.hosts)
            .field("live", &live)
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
