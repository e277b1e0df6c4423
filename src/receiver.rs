//! Receiver session: authenticate against a sender, ingest the encrypted
//! stream, keep loss/error accounting, and feed the play-out scheduler.

use crate::audio::Sink;
use crate::clock::{self, monotonic_ns, ClockSnapshot, ClockState};
use crate::crypto::{self, SessionCipher};
use crate::messages::{self, ServerReply};
use crate::playout::{self, PlayoutBuffer};
use crate::{
    packet, HANDSHAKE_TIMEOUT, HEARTBEAT_PERIOD, MAX_DATAGRAM, PROBE_TIMEOUT, STREAM_RECV_TIMEOUT,
};
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle as surfaced to whatever UI hosts the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    NotAuthenticated,
    Authenticating,
    Authenticated,
    Failed(String),
    Disconnected,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::NotAuthenticated => write!(f, "not authenticated"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Authenticated => write!(f, "authenticated"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Default)]
pub struct ReceiverStats {
    packets_received: AtomicU64,
    packets_lost: AtomicU64,
    decryption_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub decryption_errors: u64,
}

impl ReceiverStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            decryption_errors: self.decryption_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub server: SocketAddr,
    pub pin: String,
}

pub struct ReceiverSession {
    state: Arc<Mutex<ConnectionState>>,
    stats: Arc<ReceiverStats>,
    clock: Arc<ClockState>,
    sink: Arc<dyn Sink>,
    buffer_ms: u32,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ReceiverSession {
    /// Authenticate and bring up the heartbeat, clock-sync, ingress, and
    /// play-out tasks. Handshake failures surface here; the session never
    /// starts half-connected.
    pub async fn connect(config: ReceiverConfig, sink: Arc<dyn Sink>) -> Result<ReceiverSession> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind receiver socket")?;
        socket
            .connect(config.server)
            .await
            .with_context(|| format!("failed to connect to {}", config.server))?;
        let socket = Arc::new(socket);

        log::info!("authenticating with {}", config.server);
        socket
            .send(&messages::auth_request(&crypto::hash_pin(&config.pin)))
            .await
            .context("failed to send authentication request")?;

        let mut buf = vec![0u8; 256];
        let len = match timeout(HANDSHAKE_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => bail!("authentication failed - {}", e),
            Err(_) => bail!("timed out waiting for authentication reply"),
        };
        let buffer_ms = match messages::parse_reply(&buf[..len]) {
            Some(ServerReply::Ok { buffer_ms }) => buffer_ms,
            Some(ServerReply::Fail) => bail!("Invalid PIN"),
            _ => bail!("Unknown response"),
        };
        log::info!("authenticated; server pre-roll is {} ms", buffer_ms);

        let cancel = CancellationToken::new();
        let stats = Arc::new(ReceiverStats::default());
        let clock = Arc::new(ClockState::default());
        let buffer = PlayoutBuffer::new(buffer_ms);
        let cipher = SessionCipher::new(&crypto::derive_key(&config.pin));

        let time_server = SocketAddr::new(config.server.ip(), config.server.port() + 1);

        let tasks = vec![
            tokio::spawn(run_heartbeat(socket.clone(), cancel.clone())),
            tokio::spawn(clock::run_sync_client(
                time_server,
                clock.clone(),
                cancel.clone(),
            )),
            tokio::spawn(run_ingress(
                socket,
                cipher,
                stats.clone(),
                buffer.clone(),
                cancel.clone(),
            )),
            tokio::spawn(playout::run_playout(buffer, sink.clone(), cancel.clone())),
        ];

        Ok(ReceiverSession {
            state: Arc::new(Mutex::new(ConnectionState::Authenticated)),
            stats,
            clock,
            sink,
            buffer_ms,
            cancel,
            tasks,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn clock(&self) -> ClockSnapshot {
        self.clock.snapshot()
    }

    pub fn buffer_ms(&self) -> u32 {
        self.buffer_ms
    }

    pub fn set_volume(&self, gain: f32) {
        self.sink.set_volume(gain);
    }

    pub fn volume(&self) -> f32 {
        self.sink.volume()
    }

    pub async fn stop(mut self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.cancel.cancel();
        let _ = join_all(self.tasks.drain(..)).await;
        log::info!("receiver session stopped");
    }
}

/// Send one probe and return the sender's advertised hostname.
pub async fn probe(server: SocketAddr) -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind probe socket")?;
    socket
        .send_to(messages::PROBE.as_bytes(), server)
        .await
        .with_context(|| format!("failed to send probe to {}", server))?;

    let mut buf = [0u8; 256];
    let (len, _) = timeout(PROBE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("probe timed out")??;

    match messages::parse_reply(&buf[..len]) {
        Some(ServerReply::Alive { host }) => Ok(host),
        _ => bail!("unexpected probe reply"),
    }
}

async fn run_heartbeat(socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = socket.send(messages::HEARTBEAT.as_bytes()).await {
            log::debug!("heartbeat failed - {}", e);
        }
    }
}

/// Stream ingress: parse, decrypt, account, and schedule every datagram.
/// Malformed or unauthenticated datagrams are dropped without touching the
/// buffer.
async fn run_ingress(
    socket: Arc<UdpSocket>,
    cipher: SessionCipher,
    stats: Arc<ReceiverStats>,
    buffer: Arc<PlayoutBuffer>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut last_seq: Option<u32> = None;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(STREAM_RECV_TIMEOUT, socket.recv(&mut buf)) => result,
        };

        let len = match received {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                log::debug!("stream receive error - {}", e);
                continue;
            }
            Err(_elapsed) => continue,
        };

        let datagram = &buf[..len];
        if datagram.starts_with(b"AUSTREAM_") {
            log::trace!("ignoring control message on the stream path");
            continue;
        }

        let (header, sealed) = match packet::decode(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::trace!("dropping malformed datagram - {}", e);
                continue;
            }
        };

        let pcm = match cipher.open(sealed) {
            Ok(pcm) => pcm,
            Err(_) => {
                stats.decryption_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("dropping datagram {} - authentication failed", header.sequence);
                continue;
            }
        };

        stats.packets_received.fetch_add(1, Ordering::Relaxed);

        match last_seq {
            None => last_seq = Some(header.sequence),
            Some(prev) => {
                let gap = header.sequence.wrapping_sub(prev);
                if gap == 0 {
                    log::trace!("duplicate datagram {}", header.sequence);
                } else if gap < u32::MAX / 2 {
                    if gap > 1 {
                        stats
                            .packets_lost
                            .fetch_add((gap - 1) as u64, Ordering::Relaxed);
                        log::debug!(
                            "lost {} datagram(s) before sequence {}",
                            gap - 1,
                            header.sequence
                        );
                    }
                    last_seq = Some(header.sequence);
                } else {
                    log::trace!("late datagram {}", header.sequence);
                }
            }
        }

        buffer.insert(header.timestamp_ns, pcm, monotonic_ns());
    }

    log::info!("stream ingress stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CollectingSink;
    use std::time::Duration;

    /// A one-shot server that answers the first datagram with the canned
    /// reply, or holds the port open silently when given none.
    async fn fake_sender(reply: Option<Vec<u8>>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((_, from)) = socket.recv_from(&mut buf).await {
                match &reply {
                    Some(reply) => {
                        let _ = socket.send_to(reply, from).await;
                    }
                    None => tokio::time::sleep(Duration::from_secs(10)).await,
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn wrong_pin_reply_fails_with_invalid_pin() {
        let addr = fake_sender(Some(ServerReply::Fail.encode())).await;

        let result = ReceiverSession::connect(
            ReceiverConfig {
                server: addr,
                pin: "123456".to_string(),
            },
            CollectingSink::new(),
        )
        .await;

        let err = result.err().unwrap().to_string();
        assert_eq!(err, "Invalid PIN");
    }

    #[tokio::test]
    async fn garbage_reply_fails_with_unknown_response() {
        let addr = fake_sender(Some(b"WAT".to_vec())).await;

        let result = ReceiverSession::connect(
            ReceiverConfig {
                server: addr,
                pin: "123456".to_string(),
            },
            CollectingSink::new(),
        )
        .await;

        let err = result.err().unwrap().to_string();
        assert_eq!(err, "Unknown response");
    }

    #[tokio::test]
    async fn silent_server_times_out_the_handshake() {
        // Socket exists but never answers.
        let addr = fake_sender(None).await;

        let started = std::time::Instant::now();
        let result = ReceiverSession::connect(
            ReceiverConfig {
                server: addr,
                pin: "123456".to_string(),
            },
            CollectingSink::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(started.elapsed() >= HANDSHAKE_TIMEOUT);
        assert!(result.err().unwrap().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn probe_does_not_hang_on_a_dead_port() {
        let addr = {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.local_addr().unwrap()
        };

        // The port is closed; either an ICMP-driven error or the probe
        // timeout is acceptable, but it must not hang.
        let result = timeout(Duration::from_secs(3), probe(addr)).await;
        assert!(result.unwrap().is_err());
    }

    #[test]
    fn stats_start_at_zero() {
        let stats = ReceiverStats::default();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn connection_state_displays_reasons() {
        let state = ConnectionState::Failed("Invalid PIN".to_string());
        assert_eq!(state.to_string(), "failed: Invalid PIN");
    }
}
