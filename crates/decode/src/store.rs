use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use studio_transport::{AudioArc, ClipId, SourceRef, WaveformSummary};
use tokio::sync::OnceCell;

use crate::{DecodeError, decode_source};

/// Turns a source reference into decoded audio. Runs on the blocking pool.
pub trait SourceDecoder: Send + Sync + 'static {
    fn decode(&self, source: &SourceRef) -> Result<AudioArc, DecodeError>;
}

/// The default decoder, backed by symphonia.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl SourceDecoder for SymphoniaDecoder {
    fn decode(&self, source: &SourceRef) -> Result<AudioArc, DecodeError> {
        decode_source(source)
    }
}

/// A clip as decoded, and as the engine plays it. The two share samples when
/// no resampling was needed.
#[derive(Clone)]
struct Decoded {
    native: AudioArc,
    playback: AudioArc,
}

type Slot = Arc<OnceCell<Result<Decoded, DecodeError>>>;

/// Decoded buffers keyed by clip, shared by every playback instance.
///
/// Each clip gets one slot; all concurrent `load` calls for the same clip await
/// the same slot, so a clip is decoded at most once no matter how many
/// callers ask for it. Failures are memoized too, until [`forget`] clears them.
///
/// [`forget`]: ClipBufferStore::forget
pub struct ClipBufferStore {
    decoder: Arc<dyn SourceDecoder>,
    /// When set, buffers are resampled to this rate right after decoding.
    target_sample_rate: Option<u32>,
    slots: Mutex<HashMap<ClipId, Slot>>,
    summaries: Mutex<HashMap<(ClipId, usize), Arc<WaveformSummary>>>,
}

impl ClipBufferStore {
    pub fn new(target_sample_rate: Option<u32>) -> Self {
        Self::with_decoder(Arc::new(SymphoniaDecoder), target_sample_rate)
    }

    pub fn with_decoder(decoder: Arc<dyn SourceDecoder>, target_sample_rate: Option<u32>) -> Self {
        Self {
            decoder,
            target_sample_rate,
            slots: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
        }
    }

    pub fn target_sample_rate(&self) -> Option<u32> {
        self.target_sample_rate
    }

    /// Decode `source` for `clip`, or return the memoized result.
    pub async fn load(&self, clip: ClipId, source: &SourceRef) -> Result<AudioArc, DecodeError> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(clip).or_default().clone()
        };

        let result = slot
            .get_or_init(|| {
                let decoder = self.decoder.clone();
                let source = source.clone();
                let target = self.target_sample_rate;
                async move {
                    log::debug!("decoding {clip} from {source:?}");
                    let decoded = tokio::task::spawn_blocking(move || {
                        let native = decoder.decode(&source)?;
                        let playback = match target {
                            Some(rate) => native
                                .resample(rate)
                                .map_err(|e| DecodeError::Resample(e.to_string()))?,
                            None => native.clone(),
                        };
                        Ok(Decoded { native, playback })
                    })
                    .await
                    .unwrap_or_else(|e| Err(DecodeError::Task(e.to_string())));

                    if let Err(err) = &decoded {
                        log::warn!("{clip} will be silent: {err}");
                    }
                    decoded
                }
            })
            .await;

        result.as_ref().map(|decoded| decoded.playback.clone()).map_err(Clone::clone)
    }

    /// The playback buffer for `clip`, if a load has already completed successfully.
    pub fn get(&self, clip: ClipId) -> Option<AudioArc> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&clip)?.get()? {
            Ok(decoded) => Some(decoded.playback.clone()),
            Err(_) => None,
        }
    }

    /// All successfully decoded buffers, at the playback rate.
    pub fn snapshot(&self) -> HashMap<ClipId, AudioArc> {
        self.collect_buffers(|decoded| &decoded.playback)
    }

    /// All successfully decoded buffers at the rate they were decoded at.
    /// Offline renders start from these so they resample at most once.
    pub fn native_snapshot(&self) -> HashMap<ClipId, AudioArc> {
        self.collect_buffers(|decoded| &decoded.native)
    }

    fn collect_buffers(&self, pick: impl Fn(&Decoded) -> &AudioArc) -> HashMap<ClipId, AudioArc> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .filter_map(|(clip, slot)| match slot.get()? {
                Ok(decoded) => Some((*clip, pick(decoded).clone())),
                Err(_) => None,
            })
            .collect()
    }

    /// Drop the memoized result for `clip` so the next `load` decodes again.
    pub fn forget(&self, clip: ClipId) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&clip);
        self.summaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _), _| *id != clip);
    }

    /// Waveform buckets for a buffer; see [`WaveformSummary::from_audio_arc`].
    pub fn summarize(buffer: &AudioArc, bucket_count: usize) -> WaveformSummary {
        WaveformSummary::from_audio_arc(buffer, bucket_count)
    }

    /// Memoized waveform summary for a decoded clip.
    pub fn summary(&self, clip: ClipId, bucket_count: usize) -> Option<Arc<WaveformSummary>> {
        let mut summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(summary) = summaries.get(&(clip, bucket_count)) {
            return Some(summary.clone());
        }

        let buffer = self.get(clip)?;
        let summary = Arc::new(Self::summarize(&buffer, bucket_count));
        summaries.insert((clip, bucket_count), summary.clone());
        Some(summary)
    }
}

impl std::fmt::Debug for ClipBufferStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ClipBufferStore")
            .field("target_sample_rate", &self.target_sample_rate)
            .field("clips", &slots.len())
            .finish()
    }
}
