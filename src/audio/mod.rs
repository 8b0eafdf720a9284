//! audio - microphone capture, linear16 conversion and agent playback.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks. ALSA is the only device backend.

mod alsa_device;
pub mod analyser;
pub mod microphone;
pub mod pcm;
pub mod playback;
pub mod stream_decoder;

pub use microphone::{AlsaCaptureBackend, MicState, MicrophoneManager};
pub use playback::{spawn_alsa_output, PlaybackEngine};
pub use stream_decoder::Linear16Decoder;
