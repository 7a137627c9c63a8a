use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use basedrop::{Collector, Shared};
use studio_engine::mixer::Mixer;
use studio_engine::schedule::{SoloPolicy, audible_tracks, plan_voices};
use studio_engine::{FrameClock, MixCommand, VoiceId, VoiceSpec};
use studio_transport::{AudioArc, ClipId, Track, seconds_to_frames};

pub const EXPORT_SAMPLE_RATE: u32 = 44100;
pub const EXPORT_CHANNELS: u16 = 2;

const RENDER_BLOCK_FRAMES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    #[error("an export is already running")]
    InProgress,
    #[error("failed to encode wav: {0}")]
    Encode(String),
    #[error("render worker failed: {0}")]
    Worker(String),
}

/// Renders arrangements to WAV, one at a time.
#[derive(Debug, Clone, Default)]
pub struct OfflineRenderer {
    busy: Arc<AtomicBool>,
}

/// Held for the lifetime of a render; clears the busy flag on drop.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Result<BusyGuard, ExportError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| BusyGuard(self.busy.clone()))
            .map_err(|_| ExportError::InProgress)
    }

    /// Mix `tracks` from position 0 for `total_duration` seconds and encode
    /// the result as a 16-bit stereo WAV at 44.1 kHz.
    ///
    /// The renderer is claimed when this is called, not when the future is
    /// first polled, so a second call made while one is outstanding fails
    /// with [`ExportError::InProgress`] straight away.
    pub fn render(
        &self,
        tracks: Vec<Track>,
        buffers: HashMap<ClipId, AudioArc>,
        total_duration: f64,
    ) -> impl Future<Output = Result<Vec<u8>, ExportError>> + Send + 'static {
        let guard = self.try_acquire();
        async move {
            let guard = guard?;
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                let samples = render_timeline(&tracks, &buffers, total_duration, EXPORT_SAMPLE_RATE);
                encode_wav(&samples, EXPORT_SAMPLE_RATE, EXPORT_CHANNELS)
            })
            .await
            .map_err(|e| ExportError::Worker(e.to_string()))?
        }
    }
}

/// Run the mix graph over the arrangement without a device.
///
/// Returns interleaved stereo at `sample_rate`, exactly
/// `round(total_duration * sample_rate)` frames long. Solo is ignored; muted
/// tracks and clips without a buffer contribute nothing.
pub fn render_timeline(
    tracks: &[Track],
    buffers: &HashMap<ClipId, AudioArc>,
    total_duration: f64,
    sample_rate: u32,
) -> Vec<f32> {
    let total_frames = seconds_to_frames(total_duration, sample_rate) as usize;
    let mut collector = Collector::new();
    let handle = collector.handle();
    let mut mixer = Mixer::new(FrameClock::new(sample_rate), None);
    let generation = mixer.generation().current();

    for track in audible_tracks(tracks, SoloPolicy::Ignore) {
        mixer.apply(MixCommand::CreateStage {
            generation,
            track: track.id,
            gain: track.volume,
            pan: track.pan,
        });
    }

    // Resample each buffer once, even if several clips were planned from it
    let mut ready: HashMap<ClipId, Shared<AudioArc>> = HashMap::new();
    for (index, plan) in plan_voices(tracks, 0.0, SoloPolicy::Ignore)
        .into_iter()
        .enumerate()
    {
        let source = match ready.get(&plan.clip) {
            Some(source) => source.clone(),
            None => {
                let Some(buffer) = buffers.get(&plan.clip) else {
                    log::debug!("{} has no buffer, omitted from export", plan.clip);
                    continue;
                };
                let buffer = if buffer.sample_rate() == sample_rate {
                    buffer.clone()
                } else {
                    match buffer.resample(sample_rate) {
                        Ok(resampled) => resampled,
                        Err(err) => {
                            log::warn!("{} omitted from export: {err}", plan.clip);
                            continue;
                        }
                    }
                };
                let source = Shared::new(&handle, buffer);
                ready.insert(plan.clip, source.clone());
                source
            }
        };

        mixer.apply(MixCommand::StartVoice(VoiceSpec {
            id: VoiceId(index as u64),
            generation,
            track: plan.track,
            source,
            start_frame: seconds_to_frames(plan.delay, sample_rate),
            source_frame: seconds_to_frames(plan.source_offset, sample_rate),
            length_frames: seconds_to_frames(plan.length, sample_rate),
        }));
    }
    drop(ready);

    let mut output = vec![0.0f32; total_frames * 2];
    for block in output.chunks_mut(RENDER_BLOCK_FRAMES * 2) {
        mixer.process(block);
    }

    drop(mixer);
    collector.collect();

    output
}

/// Clamp to [-1, 1], then scale negative values by 32768 and the rest by
/// 32767, truncating toward zero.
pub fn quantize(sample: f32) -> i16 {
    let sample = sample.clamp(-1.0, 1.0);
    if sample < 0.0 {
        (sample * 32768.0) as i16
    } else {
        (sample * 32767.0) as i16
    }
}

/// 16-bit PCM WAV with the canonical 44-byte header.
pub fn encode_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>, ExportError> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).map_err(|e| ExportError::Encode(e.to_string()))?;

    for &sample in samples {
        writer
            .write_sample(quantize(sample))
            .map_err(|e| ExportError::Encode(e.to_string()))?;
    }

    writer
        .finalize()
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    Ok(cursor.into_inner())
}
