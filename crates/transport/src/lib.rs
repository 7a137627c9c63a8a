//! Shared data model: decoded audio, tracks and clips placed on the
//! arrangement timeline.

mod audio;
mod model;
mod waveform;

pub use audio::AudioArc;
pub use model::{AudioClip, ClipId, SourceRef, Track, TrackId, arrangement_end};
pub use waveform::WaveformSummary;

/// Convert arrangement seconds to a frame count at `sample_rate`.
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    (seconds.max(0.0) * sample_rate as f64).round() as u64
}

pub fn frames_to_seconds(frames: u64, sample_rate: u32) -> f64 {
    frames as f64 / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_to_frames_rounds() {
        assert_eq!(seconds_to_frames(1.0, 44100), 44100);
        assert_eq!(seconds_to_frames(0.3, 44100), 13230);
        assert_eq!(seconds_to_frames(-1.0, 44100), 0);
    }

    #[test]
    fn test_frames_to_seconds() {
        assert_eq!(frames_to_seconds(22050, 44100), 0.5);
    }
}
