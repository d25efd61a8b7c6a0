//! PCM helpers: byte/sample conversions, resampling and capture framing.

use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree};

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, rubato::ResamplerConstructionError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )
}

/// Decodes little-endian PCM16 bytes. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Encodes samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// A fixed-size frame of captured PCM16 audio, ready to transmit.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundAudioFrame {
    pub sequence: u64,
    pub pcm: Bytes,
}

/// Cuts an arbitrary stream of samples into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<i16>,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples * 2),
            next_sequence: 0,
        }
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<OutboundAudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let frame = std::mem::replace(&mut self.pending, rest);
            frames.push(OutboundAudioFrame {
                sequence: self.next_sequence,
                pcm: encode_pcm16(&frame),
            });
            self.next_sequence += 1;
        }
        frames
    }

    /// Discards a partial frame, e.g. when capture stops.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rubato::Resampler;

    #[test]
    fn test_create_resampler() {
        let mut resampler = create_resampler(48_000.0, 16_000.0, 480).unwrap();
        let input = vec![vec![0.25f32; resampler.input_frames_next()]];
        let output = resampler.process(&input, None).unwrap();
        assert_eq!(output.len(), 1);
        assert!(!output[0].is_empty());
    }

    #[test]
    fn test_pcm16_bytes() {
        let samples = vec![256i16, -256, 0, i16::MAX, i16::MIN];
        let bytes = encode_pcm16(&samples);
        assert_eq!(&bytes[..4], &[0x00, 0x01, 0x00, 0xFF]);
        assert_eq!(decode_pcm16(&bytes), samples);

        // Odd trailing byte is dropped.
        assert_eq!(decode_pcm16(&[0x00, 0x40, 0x01]), vec![16384]);
    }

    #[test]
    fn test_convert_f32_to_i16() {
        let result = convert_f32_to_i16(&[1.0, -1.0, 0.0, 2.0, -2.0]);
        assert_eq!(result[0], i16::MAX);
        assert_eq!(result[1], -32767);
        assert_eq!(result[2], 0);
        assert_eq!(result[3], i16::MAX);
        assert_eq!(result[4], i16::MIN);
    }

    #[test]
    fn test_convert_i16_to_f32() {
        let result = convert_i16_to_f32(&[16384, i16::MIN, 0]);
        assert_abs_diff_eq!(result[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.0, epsilon = 0.0001);
    }

    #[test]
    fn test_frame_assembler_emits_fixed_frames_with_sequence() {
        let mut assembler = FrameAssembler::new(4);

        assert!(assembler.push(&[1, 2, 3]).is_empty());
        let frames = assembler.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(decode_pcm16(&frames[0].pcm), vec![1, 2, 3, 4]);
        assert_eq!(frames[1].sequence, 1);
        assert_eq!(decode_pcm16(&frames[1].pcm), vec![5, 6, 7, 8]);

        assembler.clear();
        let frames = assembler.push(&[10, 11, 12, 13]);
        assert_eq!(decode_pcm16(&frames[0].pcm), vec![10, 11, 12, 13]);
        assert_eq!(frames[0].sequence, 2);
    }
}
