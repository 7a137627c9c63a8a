use crate::AudioArc;

/// Normalized amplitude buckets for waveform display.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformSummary {
    /// One value per bucket in `[0, 1]`; the loudest bucket is exactly 1.0.
    pub buckets: Vec<f32>,
    /// Frames of the first channel averaged into each bucket.
    pub frames_per_bucket: usize,
}

impl WaveformSummary {
    /// Average absolute magnitude of the first channel over `bucket_count`
    /// equal windows, normalized to the loudest window.
    ///
    /// Trailing frames that do not fill a whole window are ignored. Silent
    /// audio, or audio shorter than `bucket_count` frames, yields all zeros.
    ///
    /// ```
    /// use studio_transport::{AudioArc, WaveformSummary};
    ///
    /// let audio = AudioArc::new(vec![0.5, 0.5, -0.25, 0.25], 44100, 1);
    /// let summary = WaveformSummary::from_audio_arc(&audio, 2);
    /// assert_eq!(summary.buckets, vec![1.0, 0.5]);
    /// ```
    pub fn from_audio_arc(audio: &AudioArc, bucket_count: usize) -> Self {
        if bucket_count == 0 {
            return Self {
                buckets: Vec::new(),
                frames_per_bucket: 0,
            };
        }

        let frames_per_bucket = audio.frames() / bucket_count;
        if frames_per_bucket == 0 {
            return Self {
                buckets: vec![0.0; bucket_count],
                frames_per_bucket,
            };
        }

        let first_channel: Vec<f32> = audio.channel(0).collect();
        let mut buckets: Vec<f32> = first_channel
            .chunks_exact(frames_per_bucket)
            .take(bucket_count)
            .map(|window| window.iter().map(|s| s.abs()).sum::<f32>() / frames_per_bucket as f32)
            .collect();

        let max = buckets.iter().copied().fold(0.0f32, f32::max);
        if max > 0.0 {
            for bucket in &mut buckets {
                *bucket /= max;
            }
        }

        Self {
            buckets,
            frames_per_bucket,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loudest_bucket_is_one() {
        let mut samples = vec![0.1f32; 100];
        samples.extend(vec![-0.4f32; 100]);
        let audio = AudioArc::new(samples, 44100, 1);

        let summary = WaveformSummary::from_audio_arc(&audio, 2);
        assert_eq!(summary.frames_per_bucket, 100);
        assert!((summary.buckets[0] - 0.25).abs() < 1e-6);
        assert_eq!(summary.buckets[1], 1.0);
    }

    #[test]
    fn test_only_first_channel_is_read() {
        // Left is quiet then loud, right is the opposite
        let samples = vec![0.1, 1.0, 0.1, 1.0, 0.8, 0.0, 0.8, 0.0];
        let audio = AudioArc::new(samples, 44100, 2);

        let summary = WaveformSummary::from_audio_arc(&audio, 2);
        assert!((summary.buckets[0] - 0.125).abs() < 1e-6);
        assert_eq!(summary.buckets[1], 1.0);
    }

    #[test]
    fn test_remainder_frames_are_ignored() {
        let audio = AudioArc::new(vec![0.5, 0.5, 0.5, 9.0], 44100, 1);
        let summary = WaveformSummary::from_audio_arc(&audio, 3);
        assert_eq!(summary.buckets, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_silence_yields_zeros() {
        let audio = AudioArc::new(vec![0.0; 400], 44100, 1);
        let summary = WaveformSummary::from_audio_arc(&audio, 4);
        assert_eq!(summary.buckets, vec![0.0; 4]);
    }

    #[test]
    fn test_short_audio_yields_zeros() {
        let audio = AudioArc::new(vec![0.5; 3], 44100, 1);
        let summary = WaveformSummary::from_audio_arc(&audio, 200);
        assert_eq!(summary.len(), 200);
        assert!(summary.buckets.iter().all(|&b| b == 0.0));
    }
}
