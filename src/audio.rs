//! Capture and sink capability interfaces plus their cpal-backed adapters.
//!
//! The streaming core only sees these two traits, so the whole pipeline can
//! be driven without real hardware.

use crate::{CHANNELS, FRAME_BYTES, SAMPLE_RATE};
use anyhow::{anyhow, bail, Context, Result};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, InputCallbackInfo, OutputCallbackInfo, SampleFormat, SampleRate, SizedSample,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of one capture poll.
pub enum CaptureRead {
    /// A complete 1920-byte PCM frame.
    Frame(Vec<u8>),
    /// Nothing arrived within the wait window; poll again.
    Idle,
    /// The source ended and will yield no more frames.
    Finished,
}

/// A source of 10 ms PCM frames (48 kHz, stereo, s16le). Blocking; the
/// sender session polls it from a dedicated worker.
pub trait Capture: Send {
    fn read_frame(&mut self, wait: Duration) -> Result<CaptureRead>;
}

/// A PCM consumer with a user-controlled linear gain in [0, 1]. Gain changes
/// apply to the next write.
pub trait Sink: Send + Sync {
    fn write(&self, samples: &[i16]) -> Result<()>;
    fn set_volume(&self, gain: f32);
    fn volume(&self) -> f32;
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// The wire payload already is s16le stereo PCM; decoding is just byte
/// pairing.
pub fn decode_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

// ---------------------------------------------------------------------------
// cpal capture
// ---------------------------------------------------------------------------

struct FrameAssembler {
    pending: Vec<u8>,
    frames: crossbeam_channel::Sender<Vec<u8>>,
}

impl FrameAssembler {
    fn new(frames: crossbeam_channel::Sender<Vec<u8>>) -> FrameAssembler {
        FrameAssembler {
            pending: Vec::with_capacity(FRAME_BYTES),
            frames,
        }
    }

    fn extend(&mut self, samples: impl Iterator<Item = i16>) {
        for sample in samples {
            self.pending.extend_from_slice(&sample.to_le_bytes());
            if self.pending.len() == FRAME_BYTES {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(FRAME_BYTES));
                if self.frames.try_send(frame).is_err() {
                    log::trace!("capture frame channel full, dropping frame");
                }
            }
        }
    }
}

/// Captures from a cpal input device, converting f32 sources to s16le and
/// assembling exact capture units.
pub struct CpalCapture {
    frames: crossbeam_channel::Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CpalCapture {
    pub fn open(device_name: Option<String>) -> Result<CpalCapture> {
        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Vec<u8>>(32);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        // cpal::Stream is !Send so it must be built and kept on a dedicated
        // thread.
        let worker = std::thread::spawn(move || {
            let stream = match build_input_stream(device_name, frame_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
            }
            drop(stream);
        });

        ready_rx
            .recv()
            .context("capture worker exited before reporting status")??;

        Ok(CpalCapture {
            frames: frame_rx,
            stop,
            worker: Some(worker),
        })
    }
}

impl Capture for CpalCapture {
    fn read_frame(&mut self, wait: Duration) -> Result<CaptureRead> {
        match self.frames.recv_timeout(wait) {
            Ok(frame) => Ok(CaptureRead::Frame(frame)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(CaptureRead::Idle),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Ok(CaptureRead::Finished),
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn build_input_stream(
    device_name: Option<String>,
    frames: crossbeam_channel::Sender<Vec<u8>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = match &device_name {
        Some(name) => host
            .input_devices()
            .context("failed to get list of input devices")?
            .find(|device| device.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("there is no input device named \"{}\"", name))?,
        None => host
            .default_input_device()
            .ok_or_else(|| anyhow!("failed to get a default input device"))?,
    };

    let supported = device
        .supported_input_configs()
        .context("failed to get supported input configs")?
        .find(|range| {
            range.channels() == CHANNELS
                && range.min_sample_rate().0 <= SAMPLE_RATE
                && SAMPLE_RATE <= range.max_sample_rate().0
                && matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        })
        .ok_or_else(|| {
            anyhow!(
                "no stereo 48 kHz input config on device \"{}\"",
                device.name().unwrap_or_default()
            )
        })?
        .with_sample_rate(SampleRate(SAMPLE_RATE));

    let config = cpal::StreamConfig {
        channels: CHANNELS,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let err_fn = |err| log::error!("audio input stream error - {}", err);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let mut assembler = FrameAssembler::new(frames);
            device.build_input_stream(
                &config,
                move |input: &[f32], _: &InputCallbackInfo| {
                    assembler.extend(input.iter().map(|&s| f32_to_i16(s)));
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::I16 => {
            let mut assembler = FrameAssembler::new(frames);
            device.build_input_stream(
                &config,
                move |input: &[i16], _: &InputCallbackInfo| {
                    assembler.extend(input.iter().copied());
                },
                err_fn,
                None,
            )?
        }
        other => bail!("unsupported input sample format {}", other),
    };

    Ok(stream)
}

// ---------------------------------------------------------------------------
// cpal sink
// ---------------------------------------------------------------------------

const SINK_RING_CAPACITY: usize = 1024 * 16;

/// Plays to a cpal output device. Writes land in a bounded ring the output
/// callback drains; the callback fills with equilibrium when the ring runs
/// dry.
pub struct CpalSink {
    ring: Arc<Mutex<VecDeque<i16>>>,
    gain_bits: AtomicU32,
    stop: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CpalSink {
    pub fn open(device_name: Option<String>, gain: f32) -> Result<CpalSink> {
        let ring: Arc<Mutex<VecDeque<i16>>> =
            Arc::new(Mutex::new(VecDeque::with_capacity(SINK_RING_CAPACITY)));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let callback_ring = ring.clone();

        let worker = std::thread::spawn(move || {
            let stream = match build_output_stream(device_name, callback_ring) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
            }
            drop(stream);
        });

        ready_rx
            .recv()
            .context("playback worker exited before reporting status")??;

        Ok(CpalSink {
            ring,
            gain_bits: AtomicU32::new(gain.clamp(0.0, 1.0).to_bits()),
            stop,
            worker: Some(worker),
        })
    }
}

impl Sink for CpalSink {
    fn write(&self, samples: &[i16]) -> Result<()> {
        let gain = f32::from_bits(self.gain_bits.load(Ordering::Relaxed));
        let mut ring = self.ring.lock().unwrap();

        // Prevent buffer overflow.
        while ring.len() + samples.len() > SINK_RING_CAPACITY {
            ring.pop_front();
        }
        for &sample in samples {
            ring.push_back((sample as f32 * gain) as i16);
        }
        Ok(())
    }

    fn set_volume(&self, gain: f32) {
        self.gain_bits
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn build_output_stream(
    device_name: Option<String>,
    ring: Arc<Mutex<VecDeque<i16>>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = match &device_name {
        Some(name) => host
            .output_devices()
            .context("failed to get list of output devices")?
            .find(|device| device.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("there is no output device named \"{}\"", name))?,
        None => host
            .default_output_device()
            .ok_or_else(|| anyhow!("failed to get a default output device"))?,
    };

    let supported = device
        .supported_output_configs()
        .context("failed to get supported output configs")?
        .find(|range| {
            range.channels() == CHANNELS
                && range.min_sample_rate().0 <= SAMPLE_RATE
                && SAMPLE_RATE <= range.max_sample_rate().0
                && matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        })
        .ok_or_else(|| {
            anyhow!(
                "no stereo 48 kHz output config on device \"{}\"",
                device.name().unwrap_or_default()
            )
        })?
        .with_sample_rate(SampleRate(SAMPLE_RATE));

    match supported.sample_format() {
        SampleFormat::F32 => build_output_stream_for::<f32>(&device, ring),
        SampleFormat::I16 => build_output_stream_for::<i16>(&device, ring),
        other => bail!("unsupported output sample format {}", other),
    }
}

fn build_output_stream_for<T>(
    device: &cpal::Device,
    ring: Arc<Mutex<VecDeque<i16>>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let config = cpal::StreamConfig {
        channels: CHANNELS,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device.build_output_stream(
        &config,
        move |output: &mut [T], _: &OutputCallbackInfo| {
            let mut ring = ring.lock().unwrap();
            for sample in output.iter_mut() {
                *sample = match ring.pop_front() {
                    Some(value) => T::from_sample(value as f32 / 32768.0),
                    None => cpal::Sample::EQUILIBRIUM,
                };
            }
        },
        move |err| {
            log::error!("audio output stream error - {}", err);
        },
        None,
    )?;

    Ok(stream)
}

/// Print every host, device, and default config to stdout.
pub fn list_devices() -> Result<()> {
    for host_id in cpal::available_hosts() {
        let host = cpal::host_from_id(host_id)?;
        println!("Host \"{}\"", host_id.name());

        for device in host.devices()? {
            let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
            let input = device
                .default_input_config()
                .map(|c| format!("{}x{}x{}", c.channels(), c.sample_rate().0, c.sample_format()))
                .ok();
            let output = device
                .default_output_config()
                .map(|c| format!("{}x{}x{}", c.channels(), c.sample_rate().0, c.sample_format()))
                .ok();

            print!("  Device \"{}\"", name);
            if let Some(input) = input {
                print!(" input={}", input);
            }
            if let Some(output) = output {
                print!(" output={}", output);
            }
            println!();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Feeds a prepared frame sequence, then either idles or finishes. Lets
/// tests drive the sender pipeline without a capture device.
pub struct ScriptedCapture {
    frames: VecDeque<Vec<u8>>,
    idle_tail: bool,
    start_delay: Duration,
    frame_interval: Duration,
    started: bool,
}

impl ScriptedCapture {
    /// Yields the frames, then reports the source as finished.
    pub fn new(frames: Vec<Vec<u8>>) -> ScriptedCapture {
        ScriptedCapture {
            frames: frames.into(),
            idle_tail: false,
            start_delay: Duration::ZERO,
            frame_interval: Duration::ZERO,
            started: false,
        }
    }

    /// Yields the frames, then idles forever, like a live source with
    /// nothing playing.
    pub fn with_idle_tail(frames: Vec<Vec<u8>>) -> ScriptedCapture {
        ScriptedCapture {
            idle_tail: true,
            ..ScriptedCapture::new(frames)
        }
    }

    /// Hold the first frame back for `delay`.
    pub fn start_delay(mut self, delay: Duration) -> ScriptedCapture {
        self.start_delay = delay;
        self
    }

    /// Space frames apart like a real capture cadence would.
    pub fn frame_interval(mut self, interval: Duration) -> ScriptedCapture {
        self.frame_interval = interval;
        self
    }
}

impl Capture for ScriptedCapture {
    fn read_frame(&mut self, wait: Duration) -> Result<CaptureRead> {
        if !self.started {
            self.started = true;
            std::thread::sleep(self.start_delay);
        }

        match self.frames.pop_front() {
            Some(frame) => {
                std::thread::sleep(self.frame_interval);
                Ok(CaptureRead::Frame(frame))
            }
            None if self.idle_tail => {
                std::thread::sleep(wait);
                Ok(CaptureRead::Idle)
            }
            None => Ok(CaptureRead::Finished),
        }
    }
}

/// Records every written sample, honoring the gain contract.
#[derive(Default)]
pub struct CollectingSink {
    samples: Mutex<Vec<i16>>,
    writes: AtomicU64,
    gain_bits: AtomicU32,
}

impl CollectingSink {
    pub fn new() -> Arc<CollectingSink> {
        Arc::new(CollectingSink {
            samples: Mutex::new(Vec::new()),
            writes: AtomicU64::new(0),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
        })
    }

    pub fn samples(&self) -> Vec<i16> {
        self.samples.lock().unwrap().clone()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl Sink for CollectingSink {
    fn write(&self, samples: &[i16]) -> Result<()> {
        let gain = f32::from_bits(self.gain_bits.load(Ordering::Relaxed));
        let mut stored = self.samples.lock().unwrap();
        stored.extend(samples.iter().map(|&s| (s as f32 * gain) as i16));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_volume(&self, gain: f32) {
        self.gain_bits
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_conversion_clamps() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), 32767);
        assert_eq!(f32_to_i16(-1.0), -32767);
        assert_eq!(f32_to_i16(2.0), 32767);
        assert_eq!(f32_to_i16(-2.0), -32768);
    }

    #[test]
    fn decode_pcm_is_little_endian() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x00, 0x80];
        assert_eq!(decode_pcm(&bytes), vec![1, -1, i16::MIN]);
    }

    #[test]
    fn decode_pcm_ignores_trailing_odd_byte() {
        assert_eq!(decode_pcm(&[0x02, 0x00, 0x7f]), vec![2]);
    }

    #[test]
    fn scripted_capture_plays_out_then_finishes() {
        let mut capture = ScriptedCapture::new(vec![vec![1u8; 4], vec![2u8; 4]]);
        assert!(matches!(
            capture.read_frame(Duration::ZERO).unwrap(),
            CaptureRead::Frame(f) if f[0] == 1
        ));
        assert!(matches!(
            capture.read_frame(Duration::ZERO).unwrap(),
            CaptureRead::Frame(f) if f[0] == 2
        ));
        assert!(matches!(
            capture.read_frame(Duration::ZERO).unwrap(),
            CaptureRead::Finished
        ));
    }

    #[test]
    fn collecting_sink_applies_gain_immediately() {
        let sink = CollectingSink::new();
        sink.write(&[1000, -1000]).unwrap();
        sink.set_volume(0.5);
        sink.write(&[1000, -1000]).unwrap();

        assert_eq!(sink.samples(), vec![1000, -1000, 500, -500]);
        assert_eq!(sink.writes(), 2);
    }

    #[test]
    fn volume_is_clamped_to_unit_range() {
        let sink = CollectingSink::new();
        sink.set_volume(2.5);
        assert_eq!(sink.volume(), 1.0);
        sink.set_volume(-1.0);
        assert_eq!(sink.volume(), 0.0);
    }
}
