pub mod audio;
pub mod clock;
pub mod crypto;
pub mod messages;
pub mod packet;
pub mod pairing;
pub mod playout;
pub mod receiver;
pub mod send_queue;
pub mod sender;
pub mod silence;

use std::time::Duration;

/// Default UDP port for control messages and audio datagrams. The clock-sync
/// socket binds the next port up.
pub const DEFAULT_AUDIO_PORT: u16 = 5004;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 2;
pub const FRAME_MS: u32 = 10;

/// One capture unit: 10 ms of 48 kHz stereo s16le PCM.
pub const FRAME_BYTES: usize = (SAMPLE_RATE as usize / 100) * CHANNELS as usize * 2;

/// Largest datagram the system emits: header + nonce + frame + tag.
pub const MAX_DATAGRAM: usize = packet::HEADER_LEN + crypto::SEALED_OVERHEAD + FRAME_BYTES;

pub const DEFAULT_BUFFER_MS: u32 = 50;
pub const DEFAULT_SILENCE_THRESHOLD: i16 = 200;

pub const SEND_QUEUE_CAPACITY: usize = 50;
pub const PLAYOUT_BUFFER_CAPACITY: usize = 50;

pub const CONTROL_TICK: Duration = Duration::from_millis(100);
pub const CLIENT_TTL: Duration = Duration::from_secs(10);
pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(2);
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const STREAM_RECV_TIMEOUT: Duration = Duration::from_millis(100);
pub const SYNC_PERIOD: Duration = Duration::from_secs(2);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(1);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
