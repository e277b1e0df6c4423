//! Clock synchronization between sender and receivers.
//!
//! The sender runs a stateless time server one port above the audio socket.
//! Receivers poll it every two seconds with the classic four-timestamp
//! exchange and keep the resulting offset/RTT pair in atomics for display.
//! Play-out deadlines never consume the offset; they are computed from
//! server-timestamp deltas against a session anchor.

use crate::{SYNC_PERIOD, SYNC_TIMEOUT};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Request: i64 t1, client monotonic nanoseconds. Big-endian.
pub const SYNC_REQUEST_LEN: usize = 8;
/// Response: i64 t1_echo | i64 t2 | i64 t3. Big-endian.
pub const SYNC_RESPONSE_LEN: usize = 24;

const ACTIVE_ENTRY_TTL: Duration = Duration::from_secs(60);
const ACTIVE_PRUNE_PERIOD: Duration = Duration::from_secs(30);

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Process-monotonic nanoseconds. Both peers timestamp with their own
/// monotonic clock; only deltas and the sync offset relate the two.
pub fn monotonic_ns() -> i64 {
    CLOCK_EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub offset_ns: i64,
    pub rtt_ns: i64,
}

/// offset = ((t2 - t1) + (t3 - t4)) / 2, rtt = (t4 - t1) - (t3 - t2).
pub fn compute_offset(t1: i64, t2: i64, t3: i64, t4: i64) -> ClockSnapshot {
    ClockSnapshot {
        offset_ns: ((t2 - t1) + (t3 - t4)) / 2,
        rtt_ns: (t4 - t1) - (t3 - t2),
    }
}

/// Latest sync result, updated atomically every cadence tick.
#[derive(Default)]
pub struct ClockState {
    offset_ns: AtomicI64,
    rtt_ns: AtomicI64,
}

impl ClockState {
    pub fn update(&self, snapshot: ClockSnapshot) {
        self.offset_ns.store(snapshot.offset_ns, Ordering::Relaxed);
        self.rtt_ns.store(snapshot.rtt_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            offset_ns: self.offset_ns.load(Ordering::Relaxed),
            rtt_ns: self.rtt_ns.load(Ordering::Relaxed),
        }
    }
}

/// Sender-side time server. Stateless per request; the recently-active set
/// exists only so operators can see how many receivers are syncing.
pub async fn run_time_server(socket: UdpSocket, cancel: CancellationToken) {
    let mut buf = [0u8; 64];
    let mut recently_active: HashMap<SocketAddr, Instant> = HashMap::new();
    let mut prune = tokio::time::interval(ACTIVE_PRUNE_PERIOD);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = prune.tick() => {
                recently_active.retain(|_, seen| seen.elapsed() < ACTIVE_ENTRY_TTL);
                log::debug!("{} receiver(s) active on clock sync", recently_active.len());
            }
            result = socket.recv_from(&mut buf) => {
                let (len, addr) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("clock-sync socket receive error - {}", e);
                        continue;
                    }
                };
                let t2 = monotonic_ns();

                if len != SYNC_REQUEST_LEN {
                    log::trace!("ignoring {}-byte clock-sync request from {}", len, addr);
                    continue;
                }

                recently_active.insert(addr, Instant::now());

                let mut reply = [0u8; SYNC_RESPONSE_LEN];
                reply[0..8].copy_from_slice(&buf[0..8]);
                reply[8..16].copy_from_slice(&t2.to_be_bytes());
                // t3 as late as possible so the reply brackets only our
                // processing time.
                let t3 = monotonic_ns();
                reply[16..24].copy_from_slice(&t3.to_be_bytes());

                if let Err(e) = socket.send_to(&reply, addr).await {
                    log::debug!("clock-sync reply to {} failed - {}", addr, e);
                }
            }
        }
    }

    log::info!("clock-sync server stopped");
}

/// Receiver-side sync loop. A dropped reply is silently retried on the next
/// cadence tick.
pub async fn run_sync_client(
    server: SocketAddr,
    state: Arc<ClockState>,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("failed to bind clock-sync client socket - {}", e);
            return;
        }
    };
    if let Err(e) = socket.connect(server).await {
        log::error!("failed to connect clock-sync socket to {} - {}", server, e);
        return;
    }

    let mut ticker = tokio::time::interval(SYNC_PERIOD);
    let mut buf = [0u8; SYNC_RESPONSE_LEN];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let t1 = monotonic_ns();
        if let Err(e) = socket.send(&t1.to_be_bytes()).await {
            log::debug!("clock-sync request failed - {}", e);
            continue;
        }

        let len = match timeout(SYNC_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                log::debug!("clock-sync receive failed - {}", e);
                continue;
            }
            Err(_) => {
                log::trace!("clock-sync reply timed out");
                continue;
            }
        };
        let t4 = monotonic_ns();

        if len != SYNC_RESPONSE_LEN {
            log::trace!("ignoring {}-byte clock-sync reply", len);
            continue;
        }

        let t1_echo = i64::from_be_bytes(buf[0..8].try_into().unwrap());
        if t1_echo != t1 {
            // Reply to an earlier request that beat its timeout. Skip it;
            // its t4 belongs to a different exchange.
            continue;
        }
        let t2 = i64::from_be_bytes(buf[8..16].try_into().unwrap());
        let t3 = i64::from_be_bytes(buf[16..24].try_into().unwrap());

        let snapshot = compute_offset(t1_echo, t2, t3, t4);
        state.update(snapshot);
        log::trace!(
            "clock sync: offset={}ns rtt={}ns",
            snapshot.offset_ns,
            snapshot.rtt_ns
        );
    }
}
