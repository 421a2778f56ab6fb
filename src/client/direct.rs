//! Single-host client: issue a call, await the correlated response.
//!
//! A direct client owns exactly one channel. Each call allocates a fresh
//! packet id from a monotonic counter, parks a one-shot rendezvous slot in
//! the pending map, enqueues the request and waits on the slot with a hard
//! deadline. The channel listener resolves slots as responses arrive; on
//! channel close every parked slot is woken with a closed marker so callers
//! fail fast instead of waiting out their timeouts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use num_traits::cast::FromPrimitive;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::client::ClientConfig;
use crate::error::{CallError, RpcFault};
use crate::logs;
use crate::monitor::Monitors;
use crate::protocol::channel::{ChannelListener, RpcChannel};
use crate::protocol::message::{decode_fault, RequestMessage};
use crate::protocol::packet::{Packet, ResponseStatus};
use crate::protocol::transcode::{JsonTranscoder, Transcoder};
use crate::service::parameter_count;

/// Observer for client-side call events.
pub trait DirectClientListener: Send + Sync {
    fn on_slow_call(&self, _host: &str, _service: &str, _method: &str, _elapsed: Duration) {}
}

pub(crate) struct NoopClientListener;

impl DirectClientListener for NoopClientListener {}

/// Invoked once when the client's channel dies; the flag tells whether the
/// peer had announced OFFLINE first.
pub(crate) type CloseHook = Box<dyn FnOnce(bool) + Send>;

/// What a parked caller is woken with.
enum Wakeup {
    Response(Packet),
    Closed,
}

/// A client bound to a single `hostname:port` backend.
pub struct DirectClient {
    host: String,
    channel: Arc<RpcChannel>,
    pending: Arc<DashMap<u64, oneshot::Sender<Wakeup>>>,
    next_packet_id: AtomicU64,
    transcoder: Arc<dyn Transcoder>,
    monitors: Arc<Monitors>,
    config: ClientConfig,
    listener: Arc<dyn DirectClientListener>,
}

impl DirectClient {
    /// Connects with default monitors and no listener.
    pub async fn connect(host: &str, config: ClientConfig) -> anyhow::Result<Arc<DirectClient>> {
        DirectClient::connect_with(host, config, Monitors::new(), Arc::new(NoopClientListener), None)
            .await
    }

    /// Connects with injected monitors, listener and an optional close hook
    /// (used by [`crate::client::DirectClientList`] for proactive removal).
    pub(crate) async fn connect_with(
        host: &str,
        config: ClientConfig,
        monitors: Arc<Monitors>,
        listener: Arc<dyn DirectClientListener>,
        close_hook: Option<CloseHook>,
    ) -> anyhow::Result<Arc<DirectClient>> {
        let pending: Arc<DashMap<u64, oneshot::Sender<Wakeup>>> = Arc::new(DashMap::new());
        let correlator = Arc::new(Correlator {
            pending: pending.clone(),
            close_hook: Mutex::new(close_hook),
        });
        let channel =
            RpcChannel::connect(host, config.channel.clone(), correlator, monitors.clone()).await?;
        let transcoder: Arc<dyn Transcoder> =
            Arc::new(JsonTranscoder::new(config.compress_threshold, monitors.clone()));
        Ok(Arc::new(DirectClient {
            host: host.to_string(),
            channel,
            pending,
            next_packet_id: AtomicU64::new(1),
            transcoder,
            monitors,
            config,
            listener,
        }))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_active()
    }

    pub fn is_offline(&self) -> bool {
        self.channel.is_offline()
    }

    /// Calls still waiting for a response or a timeout.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn close(&self) {
        self.channel.close();
    }

    /// Executes `method` on the `service` interface of this host.
    ///
    /// Fails locally, without touching the wire, when the argument list
    /// does not match the method identity or cannot be serialized.
    pub async fn execute(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let started = Instant::now();
        let result = self.execute_inner(service, method, args, timeout).await;
        Monitors::bump(&self.monitors.executed_calls);
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_threshold {
            Monitors::bump(&self.monitors.slow_calls);
            warn!(
                target: logs::CLIENT_SLOW,
                "{service}.{method} on {} took {elapsed:?}", self.host
            );
            self.listener.on_slow_call(&self.host, service, method, elapsed);
        }
        result
    }

    async fn execute_inner(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let Some(arity) = parameter_count(method) else {
            return Err(RpcFault::IllegalArgument(format!(
                "malformed method identity `{method}`"
            ))
            .into());
        };
        if args.len() != arity {
            return Err(RpcFault::IllegalArgument(format!(
                "method `{method}` declares {arity} parameters, got {}",
                args.len()
            ))
            .into());
        }
        if !self.channel.is_active() {
            return Err(self.illegal_state());
        }

        let message = RequestMessage {
            target: service.to_string(),
            method: method.to_string(),
            args,
        };
        let encoded = message
            .encode(self.transcoder.as_ref())
            .map_err(|e| CallError::Rpc(RpcFault::IllegalArgument(format!("{e:#}"))))?;

        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(packet_id, tx);

        let packet =
            Packet::call_request(packet_id, encoded.serializer, encoded.compression, encoded.bytes);
        if let Err(e) = self.channel.send(packet) {
            self.pending.remove(&packet_id);
            debug!(target: logs::CLIENT_ERROR, "send to {} failed: {e:#}", self.host);
            return Err(CallError::IllegalState(format!("{e:#}")));
        }
        // The channel may have closed between the send and the drain of
        // the pending map; reclaim the slot ourselves in that case. An
        // offline announcement landing here is not a close: the request is
        // already enqueued and must be allowed to complete.
        if self.channel.is_closed() && self.pending.remove(&packet_id).is_some() {
            return Err(self.illegal_state());
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                // Late responses for this id are discarded by the listener.
                self.pending.remove(&packet_id);
                debug!(
                    target: logs::CLIENT_ERROR,
                    "{service}.{method} on {} timed out after {timeout:?}", self.host
                );
                Err(CallError::Timeout(timeout))
            }
            Ok(Err(_)) | Ok(Ok(Wakeup::Closed)) => Err(self.illegal_state()),
            Ok(Ok(Wakeup::Response(response))) => self.interpret(service, method, response),
        }
    }

    fn interpret(
        &self,
        service: &str,
        method: &str,
        response: Packet,
    ) -> Result<Value, CallError> {
        let fault = |response: &Packet| {
            decode_fault(
                &response.body,
                response.serializer,
                response.compression,
                self.transcoder.as_ref(),
            )
        };
        match ResponseStatus::from_i8(response.status) {
            Some(ResponseStatus::Success) => self
                .transcoder
                .decode(&response.body, response.serializer, response.compression)
                .map_err(|e| CallError::Rpc(RpcFault::Decode(format!("{e:#}")))),
            Some(ResponseStatus::TooBusy) => Err(CallError::TooBusy),
            Some(ResponseStatus::ClassNotFound) => {
                Err(RpcFault::ClassNotFound(service.to_string()).into())
            }
            Some(ResponseStatus::NoSuchMethod) => {
                Err(RpcFault::NoSuchMethod(format!("{service}.{method}")).into())
            }
            Some(ResponseStatus::IllegalArgument) => Err(RpcFault::IllegalArgument(
                fault(&response).unwrap_or_else(|| "rejected by peer".to_string()),
            )
            .into()),
            Some(ResponseStatus::InvocationError) => Err(RpcFault::Invocation(
                fault(&response).unwrap_or_else(|| "unknown failure".to_string()),
            )
            .into()),
            Some(ResponseStatus::InternalError) => Err(RpcFault::Internal.into()),
            None => Err(RpcFault::UnknownStatus(response.status).into()),
        }
    }

    fn illegal_state(&self) -> CallError {
        let state = if self.channel.is_offline() { "going offline" } else { "closed" };
        CallError::IllegalState(format!("channel to {} is {state}", self.host))
    }
}

impl std::fmt::Debug for DirectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DirectClient")
            .field("host", &self.host)
            .field("active", &self.is_active())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

/// Channel listener that resolves rendezvous slots by packet id.
struct Correlator {
    pending: Arc<DashMap<u64, oneshot::Sender<Wakeup>>>,
    close_hook: Mutex<Option<CloseHook>>,
}

impl ChannelListener for Correlator {
    fn on_packet(&self, channel: &Arc<RpcChannel>, packet: Packet) -> anyhow::Result<()> {
        if !packet.is_response() {
            warn!(
                target: logs::CLIENT_ERROR,
                "ignoring request packet {} from {}", packet.packet_id, channel.remote()
            );
            return Ok(());
        }
        match self.pending.remove(&packet.packet_id) {
            Some((_, slot)) => {
                // A receiver dropped right at its deadline is not an error.
                let _ = slot.send(Wakeup::Response(packet));
            }
            None => {
                trace!("discarding late response {} from {}", packet.packet_id, channel.remote());
            }
        }
        Ok(())
    }

    fn on_closed(&self, channel: &RpcChannel) {
        let waiting: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for packet_id in waiting {
            if let Some((_, slot)) = self.pending.remove(&packet_id) {
                let _ = slot.send(Wakeup::Closed);
            }
        }
        if let Some(hook) = self.close_hook.lock().expect("close hook poisoned").take() {
            hook(channel.is_offline());
        }
    }
}
