//! Fan-out dispatch: the same call to every requested host, results
//! aggregated per host.
//!
//! A broadcast never fails as a whole; the outcome for each requested host
//! is encoded in the response map, which always contains every requested
//! host as a key. Fan-out runs on a bounded pool with direct-handoff
//! semantics: a host whose task cannot acquire a worker fails immediately
//! instead of queueing unboundedly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::{ClientConfig, DirectClientList};
use crate::error::CallError;
use crate::logs;
use crate::monitor::Monitors;

/// Per-host outcome of a broadcast.
#[derive(Debug)]
pub enum BroadcastResponse {
    /// The call succeeded; the value is null for void methods.
    Success(Value),
    /// The host is not part of the configured set.
    UnknownHost,
    /// The host is configured but currently has no healthy client.
    InvalidHost,
    /// The call was attempted and failed, or the fan-out pool rejected it.
    Error(CallError),
}

impl BroadcastResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, BroadcastResponse::Success(_))
    }
}

/// Observer for per-host broadcast outcomes.
pub trait BroadcastListener: Send + Sync {
    fn on_success(&self, _host: &str, _value: &Value) {}

    fn on_fail(&self, _host: &str, _response: &BroadcastResponse) {}
}

struct NoopBroadcastListener;

impl BroadcastListener for NoopBroadcastListener {}

/// Fan-out dispatcher over a [`DirectClientList`].
pub struct BroadcastClient {
    list: DirectClientList,
    host_index: HashMap<String, usize>,
    workers: Arc<Semaphore>,
    listener: Arc<dyn BroadcastListener>,
}

impl BroadcastClient {
    pub async fn connect(
        hosts: Vec<String>,
        config: ClientConfig,
    ) -> anyhow::Result<BroadcastClient> {
        let list = DirectClientList::connect(hosts, config).await?;
        Ok(BroadcastClient::new(list, Arc::new(NoopBroadcastListener)))
    }

    pub fn new(list: DirectClientList, listener: Arc<dyn BroadcastListener>) -> BroadcastClient {
        let host_index = list
            .hosts()
            .iter()
            .enumerate()
            .map(|(index, host)| (host.clone(), index))
            .collect();
        let workers = Arc::new(Semaphore::new(list.config().broadcast_workers));
        BroadcastClient { list, host_index, workers, listener }
    }

    pub fn list(&self) -> &DirectClientList {
        &self.list
    }

    /// Broadcasts to every configured host.
    pub async fn execute_all(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> HashMap<String, BroadcastResponse> {
        let hosts = self.list.hosts().to_vec();
        self.execute(&hosts, service, method, args, timeout).await
    }

    /// Broadcasts to the requested hosts.
    ///
    /// The returned map contains every requested host. Hosts outside the
    /// configured set come back as `UnknownHost`, configured hosts with no
    /// healthy client as `InvalidHost`, and per-host call failures as
    /// `Error`; the remaining hosts ran the call and report `Success`.
    pub async fn execute(
        &self,
        hosts: &[String],
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> HashMap<String, BroadcastResponse> {
        let mut results: HashMap<String, BroadcastResponse> = HashMap::with_capacity(hosts.len());
        let mut tasks: Vec<(String, JoinHandle<Result<Value, CallError>>)> = Vec::new();

        for host in hosts {
            let Some(&index) = self.host_index.get(host) else {
                debug!(target: logs::CLIENT_ERROR, "broadcast to unknown host {host}");
                results.insert(host.clone(), BroadcastResponse::UnknownHost);
                continue;
            };
            let Some(client) = self.list.get(index) else {
                debug!(target: logs::CLIENT_ERROR, "broadcast to {host} with no healthy client");
                results.insert(host.clone(), BroadcastResponse::InvalidHost);
                continue;
            };
            match self.workers.clone().try_acquire_owned() {
                Ok(permit) => {
                    let service = service.to_string();
                    let method = method.to_string();
                    let args = args.clone();
                    tasks.push((
                        host.clone(),
                        tokio::spawn(async move {
                            let _permit = permit;
                            client.execute(&service, &method, args, timeout).await
                        }),
                    ));
                }
                Err(_) => {
                    Monitors::bump(&self.list.monitors().rejected_broadcasts);
                    debug!(
                        target: logs::CLIENT_ERROR,
                        "broadcast pool full, failing host {host}"
                    );
                    results.insert(host.clone(), BroadcastResponse::Error(CallError::TooBusy));
                }
            }
        }

        for (host, task) in tasks {
            let response = match task.await {
                Ok(Ok(value)) => BroadcastResponse::Success(value),
                Ok(Err(e)) => BroadcastResponse::Error(e),
                Err(join_error) => BroadcastResponse::Error(CallError::IllegalState(format!(
                    "broadcast task failed: {join_error}"
                ))),
            };
            results.insert(host, response);
        }

        for (host, response) in &results {
            match response {
                BroadcastResponse::Success(value) => self.listener.on_success(host, value),
                other => self.listener.on_fail(host, other),
            }
        }
        results
    }
}

impl std::fmt::Debug for BroadcastClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BroadcastClient").field("hosts", &self.list.hosts()).finish()
    }
}
