use std::sync::Arc;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Decoded clip audio, shared by every voice that plays it.
///
/// Interleaved `f32` samples behind an `Arc<[f32]>`, so cloning never copies.
/// Nothing writes to the samples after construction.
///
/// ```
/// use studio_transport::AudioArc;
///
/// let audio = AudioArc::new(vec![0.0, 0.5, 1.0, 0.5], 44100, 2);
/// assert_eq!(audio.frames(), 2);
/// assert_eq!(audio.clone().samples()[2], 1.0);
/// ```
#[derive(Clone)]
pub struct AudioArc {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioArc {
    /// A trailing partial frame is dropped. Zero channels is read as mono.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let ragged = samples.len() % channels as usize;
        if ragged != 0 {
            samples.truncate(samples.len() - ragged);
        }
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
        }
    }

    /// Interleaved, `[L, R, L, R, ...]` for stereo.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_arc(&self) -> &Arc<[f32]> {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Samples of one channel. Empty when `channel` does not exist.
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        let stride = self.channels as usize;
        let start = if channel < stride { channel } else { self.samples.len() };
        self.samples[start..].iter().step_by(stride).copied()
    }

    /// Resample to `target_sample_rate`; a cheap clone when the rate already matches.
    ///
    /// The result is exactly `ceil(frames * target / source)` frames long.
    pub fn resample(&self, target_sample_rate: u32) -> anyhow::Result<Self> {
        if self.sample_rate == target_sample_rate || self.is_empty() {
            return Ok(Self {
                sample_rate: target_sample_rate,
                ..self.clone()
            });
        }

        let ratio = target_sample_rate as f64 / self.sample_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let mut resampler =
            SincFixedIn::<f32>::new(ratio, 2.0, params, self.frames(), self.channels as usize)?;
        let expected = (self.frames() as f64 * ratio).ceil() as usize;
        let mut planar = resampler.process(&self.deinterleave(), None)?;

        // The filter holds back the last frames until it sees input past them.
        while planar.first().map_or(0, Vec::len) < expected {
            let tail = resampler.process_partial(None::<&[Vec<f32>]>, None)?;
            if tail.first().is_none_or(Vec::is_empty) {
                break;
            }
            for (channel, rest) in planar.iter_mut().zip(tail) {
                channel.extend(rest);
            }
        }
        for channel in &mut planar {
            channel.truncate(expected);
        }

        Ok(Self::new(interleave(&planar), target_sample_rate, self.channels))
    }

    fn deinterleave(&self) -> Vec<Vec<f32>> {
        (0..self.channels as usize)
            .map(|channel| self.channel(channel).collect())
            .collect()
    }
}

fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let frames = planar.iter().map(Vec::len).min().unwrap_or(0);
    (0..frames)
        .flat_map(|frame| planar.iter().map(move |channel| channel[frame]))
        .collect()
}

impl std::fmt::Debug for AudioArc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AudioArc({} frames, {} Hz, {} ch)",
            self.frames(),
            self.sample_rate,
            self.channels
        )
    }
}
