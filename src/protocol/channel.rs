//! The duplex channel: one TCP connection carrying packets both ways.
//!
//! A channel runs the same state machine on either side of the wire. The
//! client originates requests and consumes responses; the server originates
//! responses and consumes requests. Two cooperating workers serve each
//! channel:
//!
//! - a **write worker** draining an outbound queue and writing merged
//!   batches to the socket;
//! - a **read worker** decoding packets off the socket and handing them to
//!   the channel listener.
//!
//! Callers of [`RpcChannel::send`] never block on the socket: enqueueing is
//! non-blocking and unbounded, and backpressure is applied by the layers
//! above (worker-pool admission on the server, bounded fan-out pools on the
//! broadcast client).
//!
//! The write worker also drives heartbeats: with a heartbeat period
//! configured it bounds its queue wait and, on timeout, feeds a HEARTBEAT
//! request through the normal write path. The read worker answers incoming
//! HEARTBEAT requests and consumes HEARTBEAT responses silently.
//!
//! The OFFLINE protocol lets a server drain gracefully: it enqueues an
//! OFFLINE request, the client flags the channel inactive, acknowledges with
//! an OFFLINE response and closes the channel after a grace period. Calls
//! already in flight complete during the grace window; new calls are
//! rejected upstream because `is_active` reports false.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::logs;
use crate::monitor::Monitors;
use crate::protocol::packet::{read_packet, Opcode, Packet};

/// Default merge window when the socket send-buffer size is unavailable.
pub const DEFAULT_MERGE_WINDOW: usize = 32 * 1024;

/// Default cap on a single packet body.
pub const DEFAULT_MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Default delay between the offline acknowledgement and the channel close.
pub const DEFAULT_OFFLINE_GRACE: Duration = Duration::from_secs(60);

const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Heartbeat responses beyond sent requests tolerated before warning.
const UNSOLICITED_HEARTBEAT_BURST: u64 = 8;

const STATE_NORMAL: u8 = 1;
const STATE_CLOSED: u8 = 2;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables of a single channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Bounded queue wait between heartbeats; `None` disables them.
    /// Server-accepted channels always run with heartbeats disabled since
    /// the client drives them.
    pub heartbeat_period: Option<Duration>,
    /// Byte budget for one merged socket write. Client connections replace
    /// this with the socket send-buffer size read at connect time.
    pub merge_window: usize,
    /// Decode guard against corrupt headers.
    pub max_body_len: usize,
    /// How long an offline channel keeps draining before it closes.
    pub offline_grace: Duration,
}

impl ChannelConfig {
    pub fn client() -> ChannelConfig {
        ChannelConfig {
            heartbeat_period: Some(DEFAULT_HEARTBEAT_PERIOD),
            merge_window: DEFAULT_MERGE_WINDOW,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            offline_grace: DEFAULT_OFFLINE_GRACE,
        }
    }

    pub fn server() -> ChannelConfig {
        ChannelConfig { heartbeat_period: None, ..ChannelConfig::client() }
    }
}

impl Default for ChannelConfig {
    fn default() -> ChannelConfig {
        ChannelConfig::client()
    }
}

/// Hook through which upper layers observe a channel.
///
/// `on_packet` receives every CALL packet the read worker decodes; control
/// frames (heartbeat, offline) are consumed by the channel itself. Errors
/// returned from `on_packet` are logged and swallowed; they never fail the
/// channel. `on_closed` fires exactly once when the channel transitions to
/// CLOSED.
pub trait ChannelListener: Send + Sync {
    fn on_packet(&self, channel: &Arc<RpcChannel>, packet: Packet) -> anyhow::Result<()>;

    fn on_closed(&self, channel: &RpcChannel);
}

/// A live duplex connection. See the module docs for the state machine.
pub struct RpcChannel {
    id: u64,
    remote: String,
    server_side: bool,
    config: ChannelConfig,
    outbound: mpsc::UnboundedSender<Packet>,
    state: AtomicU8,
    offline: AtomicBool,
    closed_tx: watch::Sender<bool>,
    listener: Arc<dyn ChannelListener>,
    monitors: Arc<Monitors>,
    heartbeats_sent: AtomicU64,
    heartbeats_acked: AtomicU64,
}

impl RpcChannel {
    /// Establishes a client-side channel to `host` ("hostname:port").
    ///
    /// The socket send-buffer size is read once before connecting and
    /// becomes the merge window for this channel.
    pub async fn connect(
        host: &str,
        mut config: ChannelConfig,
        listener: Arc<dyn ChannelListener>,
        monitors: Arc<Monitors>,
    ) -> anyhow::Result<Arc<RpcChannel>> {
        let addr = tokio::net::lookup_host(host)
            .await
            .with_context(|| format!("resolving {host}"))?
            .next()
            .ok_or_else(|| anyhow!("no address found for {host}"))?;
        let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }?;
        if let Ok(send_buffer) = socket.send_buffer_size() {
            if send_buffer > 0 {
                config.merge_window = send_buffer as usize;
            }
        }
        let stream =
            socket.connect(addr).await.with_context(|| format!("connecting to {host}"))?;
        info!(target: logs::CONNECTION, "connected to {host}");
        Ok(RpcChannel::start(stream, host.to_string(), config, listener, false, monitors))
    }

    /// Wraps an accepted socket in a server-side channel.
    pub fn serve(
        stream: TcpStream,
        mut config: ChannelConfig,
        listener: Arc<dyn ChannelListener>,
        monitors: Arc<Monitors>,
    ) -> Arc<RpcChannel> {
        let remote =
            stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
        config.heartbeat_period = None;
        RpcChannel::start(stream, remote, config, listener, true, monitors)
    }

    fn start(
        stream: TcpStream,
        remote: String,
        config: ChannelConfig,
        listener: Arc<dyn ChannelListener>,
        server_side: bool,
        monitors: Arc<Monitors>,
    ) -> Arc<RpcChannel> {
        let _ = stream.set_nodelay(true);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (read_half, write_half) = stream.into_split();
        let channel = Arc::new(RpcChannel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            server_side,
            config,
            outbound,
            state: AtomicU8::new(STATE_NORMAL),
            offline: AtomicBool::new(false),
            closed_tx,
            listener,
            monitors,
            heartbeats_sent: AtomicU64::new(0),
            heartbeats_acked: AtomicU64::new(0),
        });
        tokio::spawn(write_worker(channel.clone(), write_half, outbound_rx, closed_rx.clone()));
        tokio::spawn(read_worker(channel.clone(), read_half, closed_rx));
        channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer this channel talks to, for logging and correlation.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// True while the channel accepts new outbound work.
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_NORMAL && !self.offline.load(Ordering::SeqCst)
    }

    /// True once the peer has announced OFFLINE.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// True once the channel reached CLOSED. An offline channel that is
    /// still draining reports inactive but not closed.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Enqueues a packet for the write worker.
    ///
    /// Fails when the channel is inactive; packets already queued at that
    /// point are still written.
    pub fn send(&self, packet: Packet) -> anyhow::Result<()> {
        ensure!(self.is_active(), "channel to {} is not active", self.remote);
        self.enqueue(packet)
    }

    fn enqueue(&self, packet: Packet) -> anyhow::Result<()> {
        self.outbound.send(packet).map_err(|_| anyhow!("channel to {} is closed", self.remote))
    }

    /// Announces graceful drain to the peer. No-op on client-side channels.
    pub fn offline(&self) {
        if !self.server_side {
            return;
        }
        debug!(target: logs::CONNECTION, "announcing offline to {}", self.remote);
        let _ = self.enqueue(Packet::offline_request());
    }

    /// Transitions to CLOSED, stops both workers and fires `on_closed`.
    /// Idempotent; only the first call observes the transition.
    pub fn close(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        let _ = self.closed_tx.send(true);
        debug!(target: logs::CONNECTION, "channel {} to {} closed", self.id, self.remote);
        self.listener.on_closed(self);
    }

    fn handle_offline_request(self: &Arc<Self>) {
        if self.offline.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: logs::CONNECTION, "peer {} is going offline", self.remote);
        let _ = self.enqueue(Packet::offline_response());
        let grace = self.config.offline_grace;
        let channel = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            channel.close();
        });
    }

    fn note_heartbeat_ack(&self) {
        let acked = self.heartbeats_acked.fetch_add(1, Ordering::Relaxed) + 1;
        let sent = self.heartbeats_sent.load(Ordering::Relaxed);
        if acked > sent + UNSOLICITED_HEARTBEAT_BURST {
            warn!(
                target: logs::CONNECTION,
                "peer {} sent {acked} heartbeat responses for {sent} requests", self.remote
            );
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("server_side", &self.server_side)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Drains the outbound queue, merging packets into batched socket writes.
///
/// A batch grows while the next packet still fits under the merge window and
/// is flushed as one contiguous write as soon as the queue runs empty, so
/// bursts amortize syscalls while isolated packets go out immediately.
async fn write_worker(
    channel: Arc<RpcChannel>,
    mut sock: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Packet>,
    mut closed: watch::Receiver<bool>,
) {
    let merge_window = channel.config.merge_window;
    let heartbeat = channel.config.heartbeat_period;
    let mut pending: Vec<u8> = Vec::with_capacity(merge_window.min(DEFAULT_MERGE_WINDOW));

    let result: anyhow::Result<()> = async {
        loop {
            // Block for the next packet, synthesizing a heartbeat when the
            // bounded wait elapses.
            let first = tokio::select! {
                _ = closed.changed() => return Ok(()),
                next = next_outbound(&mut queue, heartbeat) => match next {
                    Some(packet) => packet,
                    None => return Ok(()),
                },
            };

            let mut packet = first;
            loop {
                if packet.opcode == Opcode::Heartbeat && packet.is_request() {
                    channel.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                }
                let size = packet.encoded_len();
                if pending.len() + size < merge_window {
                    packet.encode_into(&mut pending);
                } else {
                    if !pending.is_empty() {
                        flush(&mut sock, &mut pending, &channel.monitors).await?;
                    }
                    match queue.try_recv() {
                        Ok(next) => {
                            // More work queued: this packet opens a new batch.
                            packet.encode_into(&mut pending);
                            packet = next;
                            continue;
                        }
                        Err(_) => {
                            let mut alone = Vec::with_capacity(size);
                            packet.encode_into(&mut alone);
                            sock.write_all(&alone).await?;
                            Monitors::add(
                                &channel.monitors.socket_bytes_written,
                                alone.len() as u64,
                            );
                            break;
                        }
                    }
                }
                match queue.try_recv() {
                    Ok(next) => packet = next,
                    Err(_) => {
                        flush(&mut sock, &mut pending, &channel.monitors).await?;
                        break;
                    }
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        warn!(target: logs::CONNECTION, "write worker for {} failed: {e:#}", channel.remote());
    }
    let _ = sock.shutdown().await;
    channel.close();
}

async fn next_outbound(
    queue: &mut mpsc::UnboundedReceiver<Packet>,
    heartbeat: Option<Duration>,
) -> Option<Packet> {
    match heartbeat {
        Some(period) => match tokio::time::timeout(period, queue.recv()).await {
            Ok(packet) => packet,
            Err(_) => {
                trace!("idle for {period:?}, sending heartbeat");
                Some(Packet::heartbeat_request())
            }
        },
        None => queue.recv().await,
    }
}

async fn flush(
    sock: &mut OwnedWriteHalf,
    pending: &mut Vec<u8>,
    monitors: &Monitors,
) -> std::io::Result<()> {
    sock.write_all(pending).await?;
    Monitors::add(&monitors.socket_bytes_written, pending.len() as u64);
    pending.clear();
    Ok(())
}

/// Decodes packets off the socket, answers control frames and forwards CALL
/// packets to the listener.
async fn read_worker(
    channel: Arc<RpcChannel>,
    mut sock: OwnedReadHalf,
    mut closed: watch::Receiver<bool>,
) {
    let result: anyhow::Result<()> = async {
        loop {
            let packet = tokio::select! {
                _ = closed.changed() => return Ok(()),
                decoded = read_packet(&mut sock, channel.config.max_body_len) => decoded?,
            };
            let Some(packet) = packet else {
                info!(target: logs::CONNECTION, "peer {} closed the connection", channel.remote());
                return Ok(());
            };
            Monitors::add(&channel.monitors.socket_bytes_read, packet.encoded_len() as u64);

            match packet.opcode {
                Opcode::Heartbeat if packet.is_request() => {
                    let _ = channel.enqueue(Packet::heartbeat_response());
                }
                Opcode::Heartbeat => channel.note_heartbeat_ack(),
                Opcode::Offline if packet.is_request() => channel.handle_offline_request(),
                Opcode::Offline => {
                    debug!(target: logs::CONNECTION, "offline acknowledged by {}", channel.remote());
                }
                Opcode::Call => {
                    if let Err(e) = channel.listener.on_packet(&channel, packet) {
                        warn!(
                            target: logs::ERROR,
                            "listener error on channel to {}: {e:#}", channel.remote()
                        );
                    }
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        warn!(target: logs::CONNECTION, "read worker for {} failed: {e:#}", channel.remote());
    }
    channel.close();
}
