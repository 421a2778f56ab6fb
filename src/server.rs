//! The RPC server: accept loop, service registry and request dispatcher.
//!
//! The server listens for TCP connections, wraps each accepted socket in an
//! [`RpcChannel`] whose listener is the dispatcher, and keeps the set of
//! live channels for the offline drain. Every received CALL request is
//! submitted to a bounded worker pool; a request that cannot acquire a
//! worker is answered TOO_BUSY immediately on the accepting side, which is
//! the only backpressure this layer applies.
//!
//! Dispatch of an admitted request:
//!
//! 1. Decode the body into a request message; reply INTERNAL_ERROR if that
//!    fails.
//! 2. Look up the service by target name; reply CLASS_NOT_FOUND on a miss.
//! 3. Look up the method by identity; reply NO_SUCH_METHOD on a miss.
//! 4. Check argument arity, invoke, encode the return value with status
//!    SUCCESS. Void methods encode null.
//! 5. Map invocation failures: illegal arguments to ILLEGAL_ARGUMENT, a
//!    raised error to INVOCATION_ERROR with the message as the body, and
//!    anything unexpected to INTERNAL_ERROR.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::InvokeError;
use crate::logs;
use crate::monitor::Monitors;
use crate::protocol::channel::{ChannelConfig, ChannelListener, RpcChannel};
use crate::protocol::message::{encode_fault, RequestMessage};
use crate::protocol::packet::{Packet, ResponseStatus};
use crate::protocol::transcode::{JsonTranscoder, Transcoder, DEFAULT_COMPRESS_THRESHOLD};
use crate::service::{parameter_count, ServiceDescriptor};

/// Default RPC listen port.
pub const DEFAULT_PORT: u16 = 4182;

/// Server tunables.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address, `"IP:PORT"`. Port 0 binds an ephemeral port.
    pub bind_addr: String,
    /// Maximum concurrently dispatched requests; excess is answered
    /// TOO_BUSY.
    pub max_workers: usize,
    /// Invocations slower than this are reported on the slow stream.
    pub slow_threshold: Duration,
    /// Response bodies above this many serialized bytes are compressed.
    pub compress_threshold: usize,
    /// Settings for accepted channels. Heartbeats are always disabled on
    /// the server side regardless of this value.
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_workers: 500,
            slow_threshold: Duration::from_millis(50),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            channel: ChannelConfig::server(),
        }
    }
}

impl ServerConfig {
    /// Config listening on the given address, defaults elsewhere.
    pub fn on<S: Into<String>>(bind_addr: S) -> ServerConfig {
        ServerConfig { bind_addr: bind_addr.into(), ..ServerConfig::default() }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> ServerConfig {
        self.max_workers = max_workers;
        self
    }

    pub fn with_slow_threshold(mut self, slow_threshold: Duration) -> ServerConfig {
        self.slow_threshold = slow_threshold;
        self
    }
}

/// Handle to a bound RPC server. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    config: ServerConfig,
    services: RwLock<HashMap<String, ServiceDescriptor>>,
    channels: Mutex<HashMap<u64, Arc<RpcChannel>>>,
    workers: Arc<Semaphore>,
    transcoder: Arc<dyn Transcoder>,
    monitors: Arc<Monitors>,
    shutdown_tx: watch::Sender<bool>,
    draining: AtomicBool,
    dispatcher: Arc<Dispatcher>,
}

/// Channel listener routing received requests into the worker pool.
struct Dispatcher {
    inner: Weak<ServerInner>,
}

impl RpcServer {
    /// Binds the listen socket. The server does not accept connections
    /// until [`RpcServer::serve`] is awaited.
    pub async fn bind(config: ServerConfig) -> std::io::Result<RpcServer> {
        let addr = tokio::net::lookup_host(&config.bind_addr)
            .await?
            .next()
            .ok_or_else(|| std::io::Error::other("no address to bind"))?;
        let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }?;
        // Lets a drained server be replaced on the same port right away.
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;
        let local_addr = listener.local_addr()?;
        info!(target: logs::CONNECTION, "listening on {local_addr}");

        let monitors = Monitors::new();
        let transcoder: Arc<dyn Transcoder> =
            Arc::new(JsonTranscoder::new(config.compress_threshold, monitors.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(config.max_workers));
        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| ServerInner {
            listener: Mutex::new(Some(listener)),
            local_addr,
            config,
            services: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            workers,
            transcoder,
            monitors,
            shutdown_tx,
            draining: AtomicBool::new(false),
            dispatcher: Arc::new(Dispatcher { inner: weak.clone() }),
        });
        Ok(RpcServer { inner })
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn monitors(&self) -> Arc<Monitors> {
        self.inner.monitors.clone()
    }

    /// Installs a service under its interface name.
    ///
    /// Registering a name twice replaces the previous target and logs a
    /// warning.
    pub fn register(&self, service: ServiceDescriptor) {
        let mut services = self.inner.services.write().expect("service registry poisoned");
        if let Some(previous) = services.insert(service.name().to_string(), service) {
            warn!(
                target: logs::SERVER_ERROR,
                "service `{}` re-registered; previous target replaced", previous.name()
            );
        }
    }

    /// Accepts connections until the server goes offline or is shut down.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .expect("listener slot poisoned")
            .take()
            .ok_or_else(|| std::io::Error::other("server is already running"))?;
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(target: logs::CONNECTION, "accept loop on {} stopped", self.inner.local_addr);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    info!(target: logs::CONNECTION, "accepted connection from {peer}");
                    let dispatcher: Arc<dyn ChannelListener> = self.inner.dispatcher.clone();
                    let channel = RpcChannel::serve(
                        socket,
                        self.inner.config.channel.clone(),
                        dispatcher,
                        self.inner.monitors.clone(),
                    );
                    self.inner.channels.lock().expect("channel set poisoned")
                        .insert(channel.id(), channel);
                }
            }
        }
    }

    /// Starts the graceful drain: stops accepting and announces OFFLINE on
    /// every live channel. Clients acknowledge, stop issuing new calls and
    /// close after their grace period; calls in flight complete normally.
    pub fn offline(&self) {
        if self.inner.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: logs::CONNECTION, "server on {} going offline", self.inner.local_addr);
        let _ = self.inner.shutdown_tx.send(true);
        let channels: Vec<Arc<RpcChannel>> =
            self.inner.channels.lock().expect("channel set poisoned").values().cloned().collect();
        for channel in channels {
            channel.offline();
        }
    }

    /// Hard stop: stops accepting and closes every live channel now.
    pub fn shutdown(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);
        let channels: Vec<Arc<RpcChannel>> = {
            let mut set = self.inner.channels.lock().expect("channel set poisoned");
            set.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.close();
        }
    }
}

impl ServerInner {
    async fn handle_call(&self, channel: Arc<RpcChannel>, packet: Packet) {
        let started = Instant::now();
        let id = packet.packet_id;

        let decoded = RequestMessage::decode(
            &packet.body,
            packet.serializer,
            packet.compression,
            self.transcoder.as_ref(),
        );
        let (reply, label) = match decoded {
            Err(e) => {
                error!(
                    target: logs::SERVER_ERROR,
                    "undecodable request {id} from {}: {e:#}", channel.remote()
                );
                (Packet::status_response(id, ResponseStatus::InternalError), None)
            }
            Ok(message) => {
                let label = format!("{}.{}", message.target, message.method);
                (self.dispatch(id, message).await, Some(label))
            }
        };

        Monitors::bump(&self.monitors.executed_calls);
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_threshold {
            Monitors::bump(&self.monitors.slow_calls);
            warn!(
                target: logs::SERVER_SLOW,
                "{} from {} took {elapsed:?}",
                label.as_deref().unwrap_or("<undecodable>"),
                channel.remote()
            );
        }

        if let Err(e) = channel.send(reply) {
            debug!(
                target: logs::SERVER_ERROR,
                "dropping response for request {id}: {e:#}"
            );
        }
    }

    async fn dispatch(&self, id: u64, message: RequestMessage) -> Packet {
        let handler = {
            let services = self.services.read().expect("service registry poisoned");
            let Some(service) = services.get(&message.target) else {
                warn!(
                    target: logs::SERVER_ERROR,
                    "call for unregistered service `{}`", message.target
                );
                return Packet::status_response(id, ResponseStatus::ClassNotFound);
            };
            let Some(handler) = service.lookup(&message.method) else {
                warn!(
                    target: logs::SERVER_ERROR,
                    "unknown method `{}` on service `{}`", message.method, message.target
                );
                return Packet::status_response(id, ResponseStatus::NoSuchMethod);
            };
            handler.clone()
        };

        if parameter_count(&message.method) != Some(message.args.len()) {
            return self.fault_response(
                id,
                ResponseStatus::IllegalArgument,
                format!(
                    "method `{}` declares {:?} parameters, got {}",
                    message.method,
                    parameter_count(&message.method),
                    message.args.len()
                ),
            );
        }

        match AssertUnwindSafe(handler(message.args)).catch_unwind().await {
            Ok(Ok(value)) => match self.transcoder.encode(&value) {
                Ok(enc) => Packet::call_response(
                    id,
                    ResponseStatus::Success,
                    enc.serializer,
                    enc.compression,
                    enc.bytes,
                ),
                Err(e) => {
                    error!(
                        target: logs::SERVER_ERROR,
                        "unencodable return value from `{}`: {e:#}", message.method
                    );
                    Packet::status_response(id, ResponseStatus::InternalError)
                }
            },
            Ok(Err(InvokeError::IllegalArgument(reason))) => {
                self.fault_response(id, ResponseStatus::IllegalArgument, reason)
            }
            Ok(Err(InvokeError::Failed(reason))) => {
                warn!(
                    target: logs::SERVER_ERROR,
                    "invocation of `{}` failed: {reason}", message.method
                );
                self.fault_response(id, ResponseStatus::InvocationError, reason)
            }
            Err(_) => {
                error!(
                    target: logs::SERVER_ERROR,
                    "invocation of `{}` panicked", message.method
                );
                Packet::status_response(id, ResponseStatus::InternalError)
            }
        }
    }

    fn fault_response(&self, id: u64, status: ResponseStatus, message: String) -> Packet {
        match encode_fault(&message, self.transcoder.as_ref()) {
            Ok(enc) => Packet::call_response(id, status, enc.serializer, enc.compression, enc.bytes),
            Err(_) => Packet::status_response(id, status),
        }
    }
}

impl ChannelListener for Dispatcher {
    fn on_packet(&self, channel: &Arc<RpcChannel>, packet: Packet) -> anyhow::Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        if !packet.is_request() {
            warn!(
                target: logs::SERVER_ERROR,
                "ignoring response packet {} from {}", packet.packet_id, channel.remote()
            );
            return Ok(());
        }
        match inner.workers.clone().try_acquire_owned() {
            Ok(permit) => {
                let channel = channel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    inner.handle_call(channel, packet).await;
                });
            }
            Err(_) => {
                Monitors::bump(&inner.monitors.rejected_dispatches);
                debug!(
                    target: logs::SERVER_ERROR,
                    "worker pool full, rejecting request {} from {}",
                    packet.packet_id,
                    channel.remote()
                );
                channel.send(Packet::status_response(packet.packet_id, ResponseStatus::TooBusy))?;
            }
        }
        Ok(())
    }

    fn on_closed(&self, channel: &RpcChannel) {
        if let Some(inner) = self.inner.upgrade() {
            inner.channels.lock().expect("channel set poisoned").remove(&channel.id());
            info!(target: logs::CONNECTION, "connection from {} closed", channel.remote());
        }
    }
}
