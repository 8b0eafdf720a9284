//! Stream decoder trait for agent audio and the linear16 implementation.

use anyhow::{bail, Result};

/// A trait for audio stream decoders that convert encoded audio data
/// into interleaved i16 PCM samples ready for scheduling.
pub trait StreamDecoder: Send {
    /// Decode audio bytes into interleaved i16 PCM samples.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>>;
}

/// Raw little-endian signed 16-bit PCM, the format the agent speaks in.
#[derive(Debug, Default)]
pub struct Linear16Decoder;

impl StreamDecoder for Linear16Decoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        if data.len() % 2 != 0 {
            bail!("linear16 frame has odd length {}", data.len());
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_samples() {
        let mut decoder = Linear16Decoder;
        let samples = decoder.decode(&[0x01, 0x00, 0xff, 0x7f, 0x00, 0x80]).unwrap();
        assert_eq!(samples, vec![1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn rejects_odd_length() {
        let mut decoder = Linear16Decoder;
        assert!(decoder.decode(&[0x01, 0x00, 0x02]).is_err());
        assert!(decoder.decode(&[]).unwrap().is_empty());
    }
}
