//! Sample conversions between the capture graph and the wire format.

/// Downsample by averaging every input sample that falls into each output bin.
///
/// Returns the input unchanged when `out_rate` is not below `in_rate`.
pub fn downsample(buffer: &[f32], in_rate: u32, out_rate: u32) -> Vec<f32> {
    if out_rate == 0 || out_rate >= in_rate {
        if out_rate > in_rate {
            log::warn!("Cannot upsample from {} Hz to {} Hz, passing through", in_rate, out_rate);
        }
        return buffer.to_vec();
    }

    let ratio = in_rate as f64 / out_rate as f64;
    let new_len = (buffer.len() as f64 / ratio).round() as usize;
    let mut result = Vec::with_capacity(new_len);

    let mut offset = 0usize;
    for i in 0..new_len {
        let next = (((i + 1) as f64) * ratio).round() as usize;
        let end = next.min(buffer.len());
        let bin = if offset < end { &buffer[offset..end] } else { &[][..] };
        if bin.is_empty() {
            result.push(0.0);
        } else {
            result.push(bin.iter().sum::<f32>() / bin.len() as f32);
        }
        offset = next;
    }
    result
}

/// Clamp to [-1, 1] and scale asymmetrically onto the i16 range.
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode float samples as little-endian 16-bit PCM bytes.
pub fn float_to_linear16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_averages_bins() {
        let input = [0.3, 0.3, 0.3, 0.6, 0.6, 0.6];
        let output = downsample(&input, 48000, 16000);
        assert_eq!(output.len(), 2);
        assert!((output[0] - 0.3).abs() < 1e-6);
        assert!((output[1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn processor_block_becomes_a_third() {
        let input = vec![0.0f32; 4096];
        assert_eq!(downsample(&input, 48000, 16000).len(), 1365);
    }

    #[test]
    fn equal_rates_pass_through() {
        let input = [0.1, -0.2, 0.3];
        assert_eq!(downsample(&input, 16000, 16000), input.to_vec());
    }

    #[test]
    fn encodes_with_clamping() {
        let bytes = float_to_linear16(&[1.5, -1.0, 0.0]);
        assert_eq!(bytes, vec![0xff, 0x7f, 0x00, 0x80, 0x00, 0x00]);
    }
}
