//! PCM Conversion
//!
//! Opus relay frames become the provider's PCM format: 48 kHz, 16-bit
//! little-endian, mono. Submissions are split into ≤25 KB chunks.

use bytes::Bytes;

use super::provider::SttError;

/// Sample rate submitted to the provider.
pub const SAMPLE_RATE: u32 = 48_000;

/// Maximum bytes per provider submission.
pub const MAX_CHUNK_BYTES: usize = 25 * 1024;

/// Largest Opus frame is 120 ms.
const MAX_FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * 120;

/// Decodes Opus packets to mono s16le PCM.
///
/// The decoder is opened mono; libopus downmixes stereo streams itself. A
/// packet that fails to decode is concealed (PLC) rather than dropped so the
/// provider's timeline stays continuous.
pub struct PcmConverter {
    decoder: opus::Decoder,
    scratch: Vec<i16>,
}

impl PcmConverter {
    /// Open a mono decoder at the provider sample rate.
    pub fn new() -> Result<Self, SttError> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| SttError::Fatal(format!("opus decoder init: {e}")))?;
        Ok(Self {
            decoder,
            scratch: vec![0i16; MAX_FRAME_SAMPLES],
        })
    }

    /// Decode one Opus packet to s16le bytes.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Bytes, SttError> {
        let samples = match self.decoder.decode(packet, &mut self.scratch, false) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Opus decode failed, concealing");
                self.decoder
                    .decode(&[], &mut self.scratch, false)
                    .map_err(|e| SttError::Transient(format!("opus plc: {e}")))?
            }
        };

        let mut out = Vec::with_capacity(samples * 2);
        for sample in &self.scratch[..samples] {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(Bytes::from(out))
    }
}

/// Split a PCM buffer into provider-sized submissions.
pub fn split_chunks(pcm: Bytes) -> impl Iterator<Item = Bytes> {
    let mut rest = pcm;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let take = rest.len().min(MAX_CHUNK_BYTES);
        Some(rest.split_to(take))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_chunks_respects_limit() {
        let big = Bytes::from(vec![0u8; MAX_CHUNK_BYTES * 2 + 100]);
        let chunks: Vec<_> = split_chunks(big).collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= MAX_CHUNK_BYTES));
        assert_eq!(
            chunks.iter().map(Bytes::len).sum::<usize>(),
            MAX_CHUNK_BYTES * 2 + 100
        );
    }

    #[test]
    fn split_chunks_passes_small_buffers_through() {
        let small = Bytes::from(vec![1u8; 1920]);
        let chunks: Vec<_> = split_chunks(small.clone()).collect();
        assert_eq!(chunks, vec![small]);
    }

    #[test]
    fn split_chunks_empty_is_empty() {
        assert_eq!(split_chunks(Bytes::new()).count(), 0);
    }
}
