//! Receiver play-out: a deadline-keyed buffer and the scheduler that drains
//! it against the wall clock.
//!
//! Deadlines come from server-timestamp deltas against a per-session anchor,
//! not from offset-converted absolute times, so slow drift in the sync
//! offset between polls cannot bend the schedule.

use crate::audio::{self, Sink};
use crate::clock::monotonic_ns;
use crate::PLAYOUT_BUFFER_CAPACITY;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const PREROLL_CAP: Duration = Duration::from_secs(3);
const REFILL_CAP: Duration = Duration::from_secs(5);
const NS_PER_MS: i64 = 1_000_000;

/// Minimum buffered packets before play-out starts or resumes.
pub fn refill_target(buffer_ms: u32) -> usize {
    (buffer_ms / 10).max(5) as usize
}

struct BufferInner {
    entries: BTreeMap<i64, Vec<u8>>,
    first_server_ts: Option<i64>,
    playback_start_local: Option<i64>,
}

/// Ordered-by-deadline packet buffer, bounded to 50 entries with
/// evict-earliest overflow.
pub struct PlayoutBuffer {
    inner: Mutex<BufferInner>,
    buffer_ms: u32,
}

impl PlayoutBuffer {
    pub fn new(buffer_ms: u32) -> Arc<PlayoutBuffer> {
        Arc::new(PlayoutBuffer {
            inner: Mutex::new(BufferInner {
                entries: BTreeMap::new(),
                first_server_ts: None,
                playback_start_local: None,
            }),
            buffer_ms,
        })
    }

    pub fn buffer_ms(&self) -> u32 {
        self.buffer_ms
    }

    /// Schedule a packet. The first packet after (re)anchoring pins the
    /// session anchors; every deadline is the anchor plus the packet's
    /// server-timestamp delta.
    pub fn insert(&self, server_ts: i64, pcm: Vec<u8>, now_local_ns: i64) {
        let mut inner = self.inner.lock().unwrap();

        let (first, start) = match (inner.first_server_ts, inner.playback_start_local) {
            (Some(first), Some(start)) => (first, start),
            _ => {
                let start = now_local_ns + self.buffer_ms as i64 * NS_PER_MS;
                inner.first_server_ts = Some(server_ts);
                inner.playback_start_local = Some(start);
                log::debug!("playback anchored: first_server_ts={}", server_ts);
                (server_ts, start)
            }
        };

        let deadline = start + (server_ts - first);
        inner.entries.insert(deadline, pcm);

        while inner.entries.len() > PLAYOUT_BUFFER_CAPACITY {
            inner.entries.pop_first();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peek_deadline(&self) -> Option<i64> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .first_key_value()
            .map(|(&deadline, _)| deadline)
    }

    pub fn pop_first(&self) -> Option<(i64, Vec<u8>)> {
        self.inner.lock().unwrap().entries.pop_first()
    }

    /// Forget the session anchors. The next inserted packet re-anchors.
    pub fn reset_anchors(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.first_server_ts = None;
        inner.playback_start_local = None;
    }

    pub fn is_anchored(&self) -> bool {
        self.inner.lock().unwrap().first_server_ts.is_some()
    }
}

/// Sleep that yields early on cancellation. Returns true when cancelled.
async fn idle(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

async fn wait_for_refill(
    buffer: &PlayoutBuffer,
    target: usize,
    cancel: &CancellationToken,
) -> bool {
    let started = Instant::now();
    while buffer.len() < target && started.elapsed() < REFILL_CAP {
        if idle(cancel, Duration::from_millis(10)).await {
            return true;
        }
    }
    false
}

/// Drive the sink from the buffer until cancelled.
pub async fn run_playout(
    buffer: Arc<PlayoutBuffer>,
    sink: Arc<dyn Sink>,
    cancel: CancellationToken,
) {
    let buffer_ms = buffer.buffer_ms();
    let target = refill_target(buffer_ms);
    let preroll = Duration::from_millis(buffer_ms as u64);

    // Pre-roll: both enough packets and enough wall clock, capped so a thin
    // stream cannot stall the start forever.
    let started = Instant::now();
    loop {
        if (buffer.len() >= target && started.elapsed() >= preroll)
            || started.elapsed() >= PREROLL_CAP
        {
            break;
        }
        if idle(&cancel, Duration::from_millis(5)).await {
            return;
        }
    }
    log::info!("play-out started with {} buffered packet(s)", buffer.len());

    let mut underrun_streak: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        #[cfg(feature = "metrics")]
        metrics::gauge!("austream_playout_buffered").set(buffer.len() as f64);

        let Some(deadline) = buffer.peek_deadline() else {
            underrun_streak += 1;
            match underrun_streak {
                0..=9 => {
                    if idle(&cancel, Duration::from_millis(2)).await {
                        break;
                    }
                }
                10..=29 => {
                    if idle(&cancel, Duration::from_millis(5)).await {
                        break;
                    }
                }
                _ => {
                    // The stream paused. Drop the anchors, wait for it to
                    // come back, then rebuild lead time before playing.
                    log::info!("stream paused; waiting for audio to resume");
                    buffer.reset_anchors();
                    if wait_for_refill(&buffer, target, &cancel).await {
                        break;
                    }
                    if idle(&cancel, preroll).await {
                        break;
                    }
                    underrun_streak = 0;
                    log::info!("stream resumed with {} buffered packet(s)", buffer.len());
                }
            }
            continue;
        };

        let now = monotonic_ns();
        if now >= deadline {
            if let Some((_, pcm)) = buffer.pop_first() {
                let samples = audio::decode_pcm(&pcm);
                if let Err(e) = sink.write(&samples) {
                    log::debug!("sink write failed - {}", e);
                }
            }
            underrun_streak = 0;
        } else {
            let wait_ns = (deadline - now).clamp(NS_PER_MS, 10 * NS_PER_MS);
            if idle(&cancel, Duration::from_nanos(wait_ns as u64)).await {
                break;
            }
        }
    }

    log::info!("play-out stopped");
}
