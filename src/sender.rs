//! Sender session: control plane, authenticated-client registry, and the
//! capture → gate → encrypt → fan-out pipeline.
//!
//! One UDP socket carries both control text and audio datagrams; the clock
//! sync service runs on the next port up. Every client gets a bounded
//! drop-oldest queue and a dedicated drain task, so a slow or dead receiver
//! can never stall capture or the other receivers.

use crate::audio::{Capture, CaptureRead};
use crate::clock::{self, monotonic_ns};
use crate::crypto::{self, SessionCipher};
use crate::messages::{self, ClientMessage, ServerReply};
use crate::pairing::{self, Pairing};
use crate::send_queue::PacketQueue;
use crate::silence::{silent_frame, SilenceGate};
use crate::{
    packet, CLIENT_TTL, CONTROL_TICK, DEFAULT_AUDIO_PORT, DEFAULT_BUFFER_MS,
    DEFAULT_SILENCE_THRESHOLD, FRAME_BYTES, KEEPALIVE_AFTER, MAX_DATAGRAM, SEND_QUEUE_CAPACITY,
};
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const KEEPALIVE_TICK: Duration = Duration::from_millis(500);
const CAPTURE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Six decimal digits; generated when absent.
    pub pin: Option<String>,
    /// Pre-roll the sender advertises to authenticating receivers.
    pub buffer_ms: u32,
    pub silence_threshold: i16,
}

impl Default for SenderConfig {
    fn default() -> SenderConfig {
        SenderConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_AUDIO_PORT,
            pin: None,
            buffer_ms: DEFAULT_BUFFER_MS,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
        }
    }
}

struct Client {
    queue: Arc<PacketQueue>,
    task: JoinHandle<()>,
    last_seen: Instant,
}

type ClientMap = Arc<Mutex<HashMap<SocketAddr, Client>>>;

/// Packet production shared by the fan-out and keep-alive paths. The emit
/// lock keeps sequence numbers and timestamps ordered consistently when both
/// race to emit.
struct Pipeline {
    cipher: SessionCipher,
    sequence: AtomicU32,
    last_sent_ns: AtomicI64,
    clients: ClientMap,
    emit_lock: Mutex<()>,
}

impl Pipeline {
    fn emit(&self, pcm: &[u8]) {
        let _guard = self.emit_lock.lock().unwrap();

        let sealed = match self.cipher.seal(pcm) {
            Ok(sealed) => sealed,
            Err(e) => {
                log::warn!("dropping frame - {}", e);
                return;
            }
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let timestamp_ns = monotonic_ns();
        let datagram = packet::encode(sequence, timestamp_ns, &sealed);

        {
            let clients = self.clients.lock().unwrap();
            for (addr, client) in clients.iter() {
                if !client.queue.push(datagram.clone()) {
                    log::trace!("queue for {} is closed", addr);
                }
            }
        }

        self.last_sent_ns.store(timestamp_ns, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!("austream_datagrams_emitted").increment(1);
    }

    fn has_clients(&self) -> bool {
        !self.clients.lock().unwrap().is_empty()
    }
}

pub struct SenderSession {
    pin: String,
    host_label: String,
    local_addr: SocketAddr,
    clients: ClientMap,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SenderSession {
    /// Bind both sockets, derive the session key, and spawn the control,
    /// clock, capture, fan-out, and keep-alive tasks.
    pub async fn start(config: SenderConfig, capture: Box<dyn Capture>) -> Result<SenderSession> {
        let pin = match config.pin {
            Some(pin) => {
                if pin.len() != 6 || !pin.chars().all(|c| c.is_ascii_digit()) {
                    bail!("PIN must be exactly 6 decimal digits");
                }
                pin
            }
            None => format!("{:06}", rand::thread_rng().gen_range(0..1_000_000)),
        };

        let key = crypto::derive_key(&pin);
        let expected_hash = crypto::hash_pin(&pin);

        let socket = UdpSocket::bind((config.bind_ip, config.port))
            .await
            .with_context(|| format!("failed to bind audio/control port {}", config.port))?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;

        let time_socket = UdpSocket::bind((config.bind_ip, local_addr.port() + 1))
            .await
            .with_context(|| {
                format!("failed to bind clock-sync port {}", local_addr.port() + 1)
            })?;

        let host_label = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let cancel = CancellationToken::new();
        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        let pipeline = Arc::new(Pipeline {
            cipher: SessionCipher::new(&key),
            sequence: AtomicU32::new(0),
            last_sent_ns: AtomicI64::new(monotonic_ns()),
            clients: clients.clone(),
            emit_lock: Mutex::new(()),
        });

        log::info!(
            "sender session on {} (clock sync on port {})",
            local_addr,
            local_addr.port() + 1
        );

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(clock::run_time_server(
            time_socket,
            cancel.clone(),
        )));

        tasks.push(tokio::spawn(run_control(ControlState {
            socket: socket.clone(),
            clients: clients.clone(),
            expected_hash,
            buffer_ms: config.buffer_ms,
            host_label: host_label.clone(),
            cancel: cancel.clone(),
        })));

        let (frame_tx, frame_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);
        tasks.push(spawn_capture_worker(capture, frame_tx, cancel.clone()));

        tasks.push(tokio::spawn(run_pump(
            frame_rx,
            SilenceGate::new(config.silence_threshold),
            pipeline.clone(),
            cancel.clone(),
        )));

        tasks.push(tokio::spawn(run_keepalive(pipeline, cancel.clone())));

        Ok(SenderSession {
            pin,
            host_label,
            local_addr,
            clients,
            cancel,
            tasks,
        })
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// The pairing string shown next to the PIN for QR or manual entry.
    pub fn pairing(&self) -> Pairing {
        let host = match self.local_addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => pairing::local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST),
        };
        Pairing {
            host,
            port: self.local_addr.port(),
            pin: Some(self.pin.clone()),
            name: Some(self.host_label.clone()),
        }
    }

    /// Cancel every task, close the per-client queues, and wait for the
    /// session to wind down. Key material and the sequence counter die with
    /// the session value.
    pub async fn stop(mut self) {
        self.cancel.cancel();

        let client_tasks: Vec<JoinHandle<()>> = {
            let mut clients = self.clients.lock().unwrap();
            clients
                .drain()
                .map(|(_, client)| {
                    client.queue.close();
                    client.task
                })
                .collect()
        };
        let _ = join_all(client_tasks).await;
        let _ = join_all(self.tasks.drain(..)).await;

        log::info!("sender session stopped");
    }
}

struct ControlState {
    socket: Arc<UdpSocket>,
    clients: ClientMap,
    expected_hash: String,
    buffer_ms: u32,
    host_label: String,
    cancel: CancellationToken,
}

/// Control loop: a 100 ms read timeout keeps message handling, heartbeat
/// bookkeeping, and stale-client reaping all moving on one task.
async fn run_control(state: ControlState) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = state.cancel.cancelled() => break,
            result = timeout(CONTROL_TICK, state.socket.recv_from(&mut buf)) => result,
        };

        match received {
            Ok(Ok((len, addr))) => handle_control(&state, &buf[..len], addr).await,
            Ok(Err(e)) => log::error!("control socket receive error - {}", e),
            Err(_elapsed) => {}
        }

        reap_stale(&state.clients, CLIENT_TTL);
    }

    log::info!("control loop stopped");
}

async fn handle_control(state: &ControlState, datagram: &[u8], addr: SocketAddr) {
    let Some(message) = messages::parse_client(datagram) else {
        log::trace!("ignoring unrecognized datagram from {}", addr);
        return;
    };

    match message {
        ClientMessage::Probe => {
            send_reply(
                state,
                ServerReply::Alive {
                    host: state.host_label.clone(),
                },
                addr,
            )
            .await;
        }
        ClientMessage::Auth { pin_hash } => {
            if pin_hash == state.expected_hash {
                send_reply(
                    state,
                    ServerReply::Ok {
                        buffer_ms: state.buffer_ms,
                    },
                    addr,
                )
                .await;
                register_client(state, addr);
            } else {
                log::warn!("rejected authentication from {}", addr);
                send_reply(state, ServerReply::Fail, addr).await;
            }
        }
        ClientMessage::LegacyHello => {
            send_reply(state, ServerReply::NeedPin, addr).await;
        }
        ClientMessage::Heartbeat => {
            let mut clients = state.clients.lock().unwrap();
            match clients.get_mut(&addr) {
                Some(client) => client.last_seen = Instant::now(),
                None => log::debug!("heartbeat from unknown client {}", addr),
            }
        }
    }
}

async fn send_reply(state: &ControlState, reply: ServerReply, addr: SocketAddr) {
    if let Err(e) = state.socket.send_to(&reply.encode(), addr).await {
        log::debug!("control reply to {} failed - {}", addr, e);
    }
}

fn register_client(state: &ControlState, addr: SocketAddr) {
    let queue = PacketQueue::new(SEND_QUEUE_CAPACITY);
    let task = tokio::spawn(run_client_sender(
        state.socket.clone(),
        addr,
        queue.clone(),
    ));

    let mut clients = state.clients.lock().unwrap();
    let replaced = clients.insert(
        addr,
        Client {
            queue,
            task,
            last_seen: Instant::now(),
        },
    );

    match replaced {
        Some(old) => {
            // Re-auth from the same endpoint: the fresh task takes over.
            old.queue.close();
            old.task.abort();
            log::info!("client {} re-authenticated", addr);
        }
        None => log::info!("client {} authenticated", addr),
    }
}

/// Dedicated drain task: one per authenticated client. Exits when its queue
/// closes. A failed send drops that packet only.
async fn run_client_sender(socket: Arc<UdpSocket>, addr: SocketAddr, queue: Arc<PacketQueue>) {
    while let Some(datagram) = queue.pop().await {
        if let Err(e) = socket.send_to(&datagram, addr).await {
            log::debug!("send to {} failed - {}", addr, e);
        }
    }
    log::debug!("drain task for {} finished", addr);
}

fn reap_stale(clients: &Mutex<HashMap<SocketAddr, Client>>, ttl: Duration) {
    let mut clients = clients.lock().unwrap();
    clients.retain(|addr, client| {
        if client.last_seen.elapsed() > ttl {
            log::info!("reaping stale client {}", addr);
            client.queue.close();
            client.task.abort();
            false
        } else {
            true
        }
    });
}

/// Blocking capture poll on a worker thread; frames cross into the async
/// side over a small channel.
fn spawn_capture_worker(
    mut capture: Box<dyn Capture>,
    frames: tokio::sync::mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            match capture.read_frame(CAPTURE_POLL) {
                Ok(CaptureRead::Frame(frame)) => {
                    if frames.blocking_send(frame).is_err() {
                        break;
                    }
                }
                Ok(CaptureRead::Idle) => {}
                Ok(CaptureRead::Finished) => {
                    log::info!("capture source finished");
                    break;
                }
                Err(e) => {
                    log::error!("capture error - {}", e);
                    break;
                }
            }
        }
    })
}

/// Silence-gate + fan-out: every loud frame becomes exactly one datagram in
/// every client queue. Never blocks on a client.
async fn run_pump(
    mut frames: tokio::sync::mpsc::Receiver<Vec<u8>>,
    gate: SilenceGate,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if frame.len() != FRAME_BYTES {
            log::trace!("ignoring {}-byte capture frame", frame.len());
            continue;
        }
        if gate.is_silent(&frame) {
            log::trace!("frame gated as silence");
            continue;
        }

        pipeline.emit(&frame);
    }

    log::info!("fan-out stopped");
}

/// When the gate has swallowed everything for two seconds and someone is
/// listening, emit one synthetic silence frame so receivers keep seeing a
/// live stream.
async fn run_keepalive(pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(KEEPALIVE_TICK);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let idle_ns = monotonic_ns() - pipeline.last_sent_ns.load(Ordering::Relaxed);
        if idle_ns >= KEEPALIVE_AFTER.as_nanos() as i64 && pipeline.has_clients() {
            log::debug!("emitting keep-alive frame");
            pipeline.emit(&silent_frame());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ScriptedCapture;
    use crate::crypto::hash_pin;
    use crate::messages::parse_reply;

    fn loud_frame() -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_BYTES);
        for _ in 0..FRAME_BYTES / 2 {
            frame.extend_from_slice(&5000i16.to_le_bytes());
        }
        frame
    }

    fn quiet_frame() -> Vec<u8> {
        silent_frame()
    }

    async fn start_test_session(frames: Vec<Vec<u8>>) -> SenderSession {
        let config = SenderConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            pin: Some("123456".to_string()),
            ..SenderConfig::default()
        };
        let capture = ScriptedCapture::with_idle_tail(frames).start_delay(Duration::from_millis(300));
        SenderSession::start(config, Box::new(capture))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn probe_gets_alive_reply_without_auth() {
        let session = start_test_session(vec![]).await;

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.connect(session.local_addr()).await.unwrap();
        probe.send(messages::PROBE.as_bytes()).await.unwrap();

        let mut buf = [0u8; 256];
        let len = timeout(Duration::from_secs(2), probe.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            parse_reply(&buf[..len]),
            Some(ServerReply::Alive { .. })
        ));
        assert_eq!(session.client_count(), 0);

        session.stop().await;
    }

    #[tokio::test]
    async fn wrong_pin_is_rejected_and_not_registered() {
        let session = start_test_session(vec![]).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(session.local_addr()).await.unwrap();
        client
            .send(&messages::auth_request(&hash_pin("000000")))
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let len = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse_reply(&buf[..len]), Some(ServerReply::Fail));
        assert_eq!(session.client_count(), 0);

        session.stop().await;
    }

    #[tokio::test]
    async fn legacy_client_is_told_to_upgrade() {
        let session = start_test_session(vec![]).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(session.local_addr()).await.unwrap();
        client.send(b"AUSTREAM_CLIENT hello").await.unwrap();

        let mut buf = [0u8; 256];
        let len = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse_reply(&buf[..len]), Some(ServerReply::NeedPin));
        assert_eq!(session.client_count(), 0);

        session.stop().await;
    }

    #[tokio::test]
    async fn loud_frames_reach_an_authenticated_client_in_sequence() {
        // Three loud frames with a silent one mixed in; the silent frame
        // must not consume a sequence number.
        let session = start_test_session(vec![
            loud_frame(),
            quiet_frame(),
            loud_frame(),
            loud_frame(),
        ])
        .await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(session.local_addr()).await.unwrap();
        client
            .send(&messages::auth_request(&hash_pin("123456")))
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            parse_reply(&buf[..len]),
            Some(ServerReply::Ok { buffer_ms: 50 })
        );
        assert_eq!(session.client_count(), 1);

        let cipher = SessionCipher::new(&crypto::derive_key("123456"));
        let mut last_ts = i64::MIN;
        for expected_seq in 1u32..=3 {
            let len = timeout(Duration::from_secs(3), client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let (header, sealed) = packet::decode(&buf[..len]).unwrap();
            assert_eq!(header.sequence, expected_seq);
            assert!(header.timestamp_ns >= last_ts);
            last_ts = header.timestamp_ns;

            let pcm = cipher.open(sealed).unwrap();
            assert_eq!(pcm.len(), FRAME_BYTES);
            assert_eq!(i16::from_le_bytes([pcm[0], pcm[1]]), 5000);
        }

        session.stop().await;
    }

    #[tokio::test]
    async fn reap_with_zero_ttl_removes_clients() {
        let session = start_test_session(vec![]).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(session.local_addr()).await.unwrap();
        client
            .send(&messages::auth_request(&hash_pin("123456")))
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.client_count(), 1);

        reap_stale(&session.clients, Duration::ZERO);
        assert_eq!(session.client_count(), 0);

        session.stop().await;
    }

    #[tokio::test]
    async fn invalid_pin_config_fails_session_start() {
        let config = SenderConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            pin: Some("12ab56".to_string()),
            ..SenderConfig::default()
        };
        let capture = ScriptedCapture::new(vec![]);
        assert!(SenderSession::start(config, Box::new(capture))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn port_collision_is_fatal_for_session_start() {
        let session = start_test_session(vec![]).await;

        let config = SenderConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: session.local_addr().port(),
            pin: Some("123456".to_string()),
            ..SenderConfig::default()
        };
        let capture = ScriptedCapture::new(vec![]);
        assert!(SenderSession::start(config, Box::new(capture))
            .await
            .is_err());

        session.stop().await;
    }
}
