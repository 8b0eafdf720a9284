//! Microphone capture: device acquisition and the capture worker.
//!
//! The worker runs on a dedicated OS thread named `audio-record`. It reads
//! `processor_frames` mono samples at the device rate, feeds the amplitude
//! tap, downsamples to the agent input rate and hands linear16 frames to the
//! orchestrator through a bounded channel. A full channel drops the frame.

use parking_lot::Mutex;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use alsa::pcm::PCM;

use super::alsa_device::{self, AlsaParams};
use super::analyser::AmplitudeTap;
use super::pcm;
use crate::error::MicError;

// Linux errno value, not exposed by std.
const ENODEV: i32 = 19;
const MAX_RECOVERY_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicState {
    Uninitialized,
    Acquiring,
    Ready,
    Streaming,
}

/// An opened capture stream.
pub trait CaptureDevice: Send {
    fn sample_rate(&self) -> u32;

    /// Fill `buf` with mono samples in [-1, 1]. Returns the number written.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize, MicError>;

    /// Bring the stream back after an overrun or read error.
    fn recover(&mut self) -> Result<(), MicError>;
}

/// Opens capture devices.
pub trait CaptureBackend: Send {
    fn acquire(&self) -> Result<Box<dyn CaptureDevice>, MicError>;
}

pub struct AlsaCaptureBackend {
    device: String,
    sample_rate: u32,
}

impl AlsaCaptureBackend {
    pub fn new(device: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            device: device.into(),
            sample_rate,
        }
    }
}

impl CaptureBackend for AlsaCaptureBackend {
    fn acquire(&self) -> Result<Box<dyn CaptureDevice>, MicError> {
        let (pcm, params) =
            alsa_device::open_capture(&self.device, self.sample_rate).map_err(classify)?;
        let read_buf = vec![0i16; params.period_size.max(1) * params.channels as usize];
        Ok(Box::new(AlsaCapture {
            pcm,
            params,
            read_buf,
        }))
    }
}

fn classify(err: anyhow::Error) -> MicError {
    match alsa_device::errno(&err) {
        Some(code) if code == ENODEV => MicError::NoDevice,
        Some(code) => match std::io::Error::from_raw_os_error(code).kind() {
            ErrorKind::PermissionDenied => MicError::PermissionDenied,
            ErrorKind::NotFound => MicError::NoDevice,
            _ => MicError::Device(format!("{:#}", err)),
        },
        None => MicError::Device(format!("{:#}", err)),
    }
}

struct AlsaCapture {
    pcm: PCM,
    params: AlsaParams,
    read_buf: Vec<i16>,
}

impl CaptureDevice for AlsaCapture {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize, MicError> {
        let channels = self.params.channels.max(1) as usize;
        let want = buf.len().min(self.read_buf.len() / channels);
        let io = self
            .pcm
            .io_i16()
            .map_err(|e| MicError::Device(e.to_string()))?;
        let frames = io
            .readi(&mut self.read_buf[..want * channels])
            .map_err(|e| MicError::Device(e.to_string()))?;

        // Downmix to mono.
        for (i, out) in buf.iter_mut().take(frames).enumerate() {
            let frame = &self.read_buf[i * channels..(i + 1) * channels];
            let sum: f32 = frame.iter().map(|&s| pcm::i16_to_f32(s)).sum();
            *out = sum / channels as f32;
        }
        Ok(frames)
    }

    fn recover(&mut self) -> Result<(), MicError> {
        self.pcm
            .prepare()
            .map_err(|e| MicError::Device(e.to_string()))
    }
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct MicrophoneManager {
    backend: Box<dyn CaptureBackend>,
    state: MicState,
    device: Option<Arc<Mutex<Box<dyn CaptureDevice>>>>,
    worker: Option<Worker>,
    frames_tx: mpsc::Sender<Vec<u8>>,
    tap: AmplitudeTap,
    processor_frames: usize,
    target_rate: u32,
}

impl MicrophoneManager {
    pub fn new(
        backend: Box<dyn CaptureBackend>,
        frames_tx: mpsc::Sender<Vec<u8>>,
        processor_frames: usize,
        target_rate: u32,
    ) -> Self {
        Self {
            backend,
            state: MicState::Uninitialized,
            device: None,
            worker: None,
            frames_tx,
            tap: AmplitudeTap::new(),
            processor_frames: processor_frames.max(1),
            target_rate,
        }
    }

    pub fn state(&self) -> MicState {
        self.state
    }

    /// Analyser over the captured (pre-downsample) signal.
    pub fn tap(&self) -> AmplitudeTap {
        self.tap.clone()
    }

    /// Acquire the capture device. Does nothing once acquisition has begun.
    pub fn setup(&mut self) -> Result<(), MicError> {
        if self.state != MicState::Uninitialized {
            return Ok(());
        }
        self.state = MicState::Acquiring;
        match self.backend.acquire() {
            Ok(device) => {
                log::info!("Microphone ready at {} Hz", device.sample_rate());
                self.device = Some(Arc::new(Mutex::new(device)));
                self.state = MicState::Ready;
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to acquire microphone: {}", e);
                self.state = MicState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Begin streaming. Returns whether the worker was started.
    pub fn start(&mut self) -> bool {
        if self.state != MicState::Ready {
            return false;
        }
        let Some(device) = self.device.clone() else {
            return false;
        };

        let running = Arc::new(AtomicBool::new(true));
        let spawned = {
            let running = running.clone();
            let frames_tx = self.frames_tx.clone();
            let tap = self.tap.clone();
            let processor_frames = self.processor_frames;
            let target_rate = self.target_rate;
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    capture_loop(device, frames_tx, tap, &running, processor_frames, target_rate)
                })
        };

        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker { running, handle });
                self.state = MicState::Streaming;
                log::info!("Microphone streaming started");
                true
            }
            Err(e) => {
                log::error!("Failed to spawn capture thread: {}", e);
                false
            }
        }
    }

    /// Stop streaming but keep the device for a later `start()`.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::SeqCst);
            if worker.handle.join().is_err() {
                log::warn!("Capture thread panicked while stopping");
            }
            log::info!("Microphone streaming stopped");
        }
        if self.state == MicState::Streaming {
            self.state = MicState::Ready;
        }
    }
}

impl Drop for MicrophoneManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    device: Arc<Mutex<Box<dyn CaptureDevice>>>,
    frames_tx: mpsc::Sender<Vec<u8>>,
    tap: AmplitudeTap,
    running: &AtomicBool,
    processor_frames: usize,
    target_rate: u32,
) {
    let mut block = vec![0f32; processor_frames];
    let mut filled = 0usize;
    let mut retry_count = 0u32;

    while running.load(Ordering::Relaxed) {
        let mut dev = device.lock();
        let result = dev.read(&mut block[filled..]);
        match result {
            Ok(0) => {
                drop(dev);
                thread::sleep(Duration::from_millis(5));
            }
            Ok(n) => {
                retry_count = 0;
                filled += n;
                if filled < block.len() {
                    continue;
                }
                filled = 0;
                let rate = dev.sample_rate();
                drop(dev);

                tap.push(&block);
                let frame = pcm::float_to_linear16(&pcm::downsample(&block, rate, target_rate));
                match frames_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::debug!("Capture channel full, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => {
                        log::warn!("Capture receiver dropped, stopping capture");
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("Capture error: {}, recovering...", e);
                retry_count += 1;
                if let Err(e2) = dev.recover() {
                    log::error!("Failed to recover capture device: {}", e2);
                    return;
                }
                if retry_count >= MAX_RECOVERY_RETRIES {
                    log::error!("Max capture recovery retries ({}) reached", retry_count);
                    return;
                }
            }
        }
    }
}
