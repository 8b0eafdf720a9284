//! Gapless playback of agent audio on a sample-clock timeline.
//!
//! Each decoded frame becomes a scheduled source starting at
//! `max(cursor, position)`, where `position` is the number of samples already
//! rendered and `cursor` is the end of the last scheduled source. The output
//! thread (`audio-play`) renders the timeline period by period into ALSA;
//! barge-in calls [`PlaybackEngine::clear`].

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::alsa_device;
use super::analyser::AmplitudeTap;
use super::pcm;
use super::stream_decoder::StreamDecoder;

const MAX_RECOVERY_RETRIES: u32 = 3;

#[derive(Debug)]
struct ScheduledSource {
    id: u64,
    start: u64,
    samples: Vec<f32>,
}

impl ScheduledSource {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Debug, Default)]
pub struct Timeline {
    sources: VecDeque<ScheduledSource>,
    position: u64,
    cursor: u64,
    next_id: u64,
}

impl Timeline {
    pub fn schedule(&mut self, samples: Vec<f32>) -> u64 {
        let start = self.cursor.max(self.position);
        let id = self.next_id;
        self.next_id += 1;
        self.cursor = start + samples.len() as u64;
        self.sources.push_back(ScheduledSource { id, start, samples });
        id
    }

    /// Mix the timeline into `out` and advance the position past it.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let block_start = self.position;
        let block_end = block_start + out.len() as u64;

        for source in &self.sources {
            let from = source.start.max(block_start);
            let to = source.end().min(block_end);
            if from >= to {
                continue;
            }
            let src = &source.samples[(from - source.start) as usize..(to - source.start) as usize];
            let dst = &mut out[(from - block_start) as usize..(to - block_start) as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }

        self.position = block_end;
        while self
            .sources
            .front()
            .is_some_and(|source| source.end() <= self.position)
        {
            self.sources.pop_front();
        }
    }

    /// Drop every scheduled source. Returns how many were stopped.
    pub fn clear(&mut self) -> usize {
        let stopped = self.sources.len();
        self.sources.clear();
        self.cursor = self.position;
        stopped
    }

    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    #[cfg(test)]
    fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Start sample of a scheduled source, if it is still pending.
    #[cfg(test)]
    fn start_of(&self, id: u64) -> Option<u64> {
        self.sources.iter().find(|s| s.id == id).map(|s| s.start)
    }
}

/// Render side of the engine, handed to the output thread.
#[derive(Clone)]
pub struct Renderer {
    timeline: Arc<Mutex<Timeline>>,
    tap: AmplitudeTap,
}

impl Renderer {
    pub fn render(&self, out: &mut [f32]) {
        self.timeline.lock().render(out);
        self.tap.push(out);
    }
}

pub struct PlaybackEngine {
    timeline: Arc<Mutex<Timeline>>,
    decoder: Box<dyn StreamDecoder>,
    tap: AmplitudeTap,
}

impl PlaybackEngine {
    pub fn new(decoder: Box<dyn StreamDecoder>) -> Self {
        Self {
            timeline: Arc::new(Mutex::new(Timeline::default())),
            decoder,
            tap: AmplitudeTap::new(),
        }
    }

    /// Decode and schedule one frame. Undecodable or empty frames are
    /// dropped and yield `None`.
    pub fn enqueue(&mut self, frame: &[u8]) -> Option<u64> {
        let samples = match self.decoder.decode(frame) {
            Ok(samples) if samples.is_empty() => return None,
            Ok(samples) => samples,
            Err(e) => {
                log::debug!("Dropping agent audio frame: {}", e);
                return None;
            }
        };
        let samples: Vec<f32> = samples.into_iter().map(pcm::i16_to_f32).collect();
        Some(self.timeline.lock().schedule(samples))
    }

    pub fn clear(&self) -> usize {
        let stopped = self.timeline.lock().clear();
        if stopped > 0 {
            log::debug!("Stopped {} scheduled audio sources", stopped);
        }
        stopped
    }

    pub fn active_sources(&self) -> usize {
        self.timeline.lock().active_sources()
    }

    /// Analyser over the rendered output (agent voice).
    pub fn tap(&self) -> AmplitudeTap {
        self.tap.clone()
    }

    pub fn renderer(&self) -> Renderer {
        Renderer {
            timeline: self.timeline.clone(),
            tap: self.tap.clone(),
        }
    }

    #[cfg(test)]
    fn with_timeline<T>(&self, f: impl FnOnce(&Timeline) -> T) -> T {
        f(&self.timeline.lock())
    }
}

/// Handle to the running `audio-play` thread. Stops it on drop.
pub struct PlaybackOutput {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackOutput {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the ALSA output thread driving `renderer`.
pub fn spawn_alsa_output(
    renderer: Renderer,
    device: &str,
    sample_rate: u32,
    period_size: usize,
) -> Result<PlaybackOutput> {
    let running = Arc::new(AtomicBool::new(true));
    let handle = {
        let running = running.clone();
        let device = device.to_string();
        thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || {
                if let Err(e) = play_loop(&renderer, &device, sample_rate, period_size, &running) {
                    log::error!("Playback thread error: {:#}", e);
                }
            })?
    };
    Ok(PlaybackOutput {
        running,
        handle: Some(handle),
    })
}

fn play_loop(
    renderer: &Renderer,
    device: &str,
    sample_rate: u32,
    period_size: usize,
    running: &AtomicBool,
) -> Result<()> {
    let period = if period_size > 0 { Some(period_size) } else { None };
    let (pcm, params) = alsa_device::open_playback(device, sample_rate, period)?;
    if params.sample_rate != sample_rate {
        log::warn!(
            "Playback device runs at {} Hz, agent audio is {} Hz",
            params.sample_rate,
            sample_rate
        );
    }
    let channels = params.channels.max(1) as usize;
    let frames = params.period_size.max(1);

    let mut mono = vec![0f32; frames];
    let mut interleaved = vec![0i16; frames * channels];
    let io = pcm.io_i16()?;

    log::info!("Playback started: rate={}, ch={}, period={}", params.sample_rate, channels, frames);

    while running.load(Ordering::Relaxed) {
        renderer.render(&mut mono);
        for (i, &sample) in mono.iter().enumerate() {
            let value = pcm::f32_to_i16(sample);
            interleaved[i * channels..(i + 1) * channels].fill(value);
        }

        // Retry short writes and recover from XRUN without losing the period.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < frames {
            match io.writei(&interleaved[frames_written * channels..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }
                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stream_decoder::Linear16Decoder;

    fn frame(samples: usize, value: i16) -> Vec<u8> {
        (0..samples).flat_map(|_| value.to_le_bytes()).collect()
    }

    #[test]
    fn frames_play_back_to_back() {
        let mut engine = PlaybackEngine::new(Box::new(Linear16Decoder));
        let first = engine.enqueue(&frame(480, 1000)).unwrap();
        let second = engine.enqueue(&frame(240, 1000)).unwrap();

        engine.with_timeline(|t| {
            assert_eq!(t.start_of(first), Some(0));
            assert_eq!(t.start_of(second), Some(480));
            assert_eq!(t.cursor(), 720);
        });
        assert_eq!(engine.active_sources(), 2);
    }

    #[test]
    fn late_frame_starts_at_current_position() {
        let mut engine = PlaybackEngine::new(Box::new(Linear16Decoder));
        let renderer = engine.renderer();
        engine.enqueue(&frame(100, 1000));

        let mut out = vec![0f32; 256];
        renderer.render(&mut out);
        assert!(out[..100].iter().all(|&s| s > 0.0));
        assert!(out[100..].iter().all(|&s| s == 0.0));
        assert_eq!(engine.active_sources(), 0);

        let id = engine.enqueue(&frame(100, 1000)).unwrap();
        engine.with_timeline(|t| assert_eq!(t.start_of(id), Some(256)));
    }

    #[test]
    fn render_spans_source_boundaries() {
        let mut timeline = Timeline::default();
        timeline.schedule(vec![0.25; 3]);
        timeline.schedule(vec![0.5; 3]);

        let mut out = [0f32; 4];
        timeline.render(&mut out);
        assert_eq!(out, [0.25, 0.25, 0.25, 0.5]);
        assert_eq!(timeline.active_sources(), 1);

        timeline.render(&mut out);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
        assert_eq!(timeline.active_sources(), 0);
    }

    #[test]
    fn clear_stops_everything_scheduled() {
        let mut engine = PlaybackEngine::new(Box::new(Linear16Decoder));
        let renderer = engine.renderer();
        engine.enqueue(&frame(480, 1000));
        engine.enqueue(&frame(480, 1000));

        let mut out = vec![0f32; 100];
        renderer.render(&mut out);
        assert_eq!(engine.clear(), 2);
        assert_eq!(engine.active_sources(), 0);

        let id = engine.enqueue(&frame(10, 1000)).unwrap();
        engine.with_timeline(|t| assert_eq!(t.start_of(id), Some(100)));
    }

    #[test]
    fn empty_and_odd_frames_are_dropped() {
        let mut engine = PlaybackEngine::new(Box::new(Linear16Decoder));
        assert!(engine.enqueue(&[]).is_none());
        assert!(engine.enqueue(&[1, 2, 3]).is_none());
        assert_eq!(engine.active_sources(), 0);
    }
}
