//! Pre-emission silence detection.
//!
//! Frames whose sampled peak stays at or below the threshold are not
//! transmitted. Receivers use the resulting gap to detect a paused stream
//! and re-anchor when audio returns.

use crate::FRAME_BYTES;

/// How many samples of a frame the gate inspects at most.
const MAX_PROBES: usize = 100;

pub struct SilenceGate {
    threshold: i16,
}

impl SilenceGate {
    pub fn new(threshold: i16) -> SilenceGate {
        SilenceGate { threshold }
    }

    /// Probes up to [`MAX_PROBES`] 16-bit samples spaced evenly across the
    /// frame and reports whether every probed sample is at or below the
    /// threshold.
    pub fn is_silent(&self, frame: &[u8]) -> bool {
        let sample_count = frame.len() / 2;
        if sample_count == 0 {
            return true;
        }

        let step = sample_count.div_ceil(MAX_PROBES).max(1);
        let threshold = self.threshold as i32;

        let mut index = 0;
        while index < sample_count {
            let offset = index * 2;
            let sample = i16::from_le_bytes([frame[offset], frame[offset + 1]]);
            if (sample as i32).abs() > threshold {
                return false;
            }
            index += step;
        }

        true
    }
}

/// One 10 ms frame of digital silence, used by the keep-alive path.
pub fn silent_frame() -> Vec<u8> {
    vec![0u8; FRAME_BYTES]
}
