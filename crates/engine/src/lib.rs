use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use basedrop::{Handle, Shared};
use studio_transport::{AudioArc, TrackId};

pub mod analysis;
pub mod capture;
mod direct;
pub mod mixer;
mod realtime;
pub mod schedule;

pub use analysis::AnalysisTap;
pub use capture::{CaptureBlob, CaptureError, CpalInput, InputBackend, Recorder};
pub use direct::DirectBackend;
pub use mixer::Mixer;
pub use realtime::{AudioEngineHandle, start};
pub use schedule::{SoloPolicy, VoicePlan, plan_voices};

/// Frames rendered by the mix graph since it was created.
///
/// This is the engine's monotonic clock. It only moves while the output
/// callback (or an offline render) is pulling blocks, so it is immune to
/// scheduling jitter on the control side.
#[derive(Debug, Clone)]
pub struct FrameClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn seconds(&self) -> f64 {
        studio_transport::frames_to_seconds(self.frames(), self.sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }
}

/// Number of the playback session the mixer is allowed to sound.
///
/// Advancing it retires every stage and voice stamped with an older number.
/// It is shared memory, not a queued command, so it takes effect even when the
/// command queue is full.
#[derive(Debug, Clone, Default)]
pub struct SessionGeneration(Arc<AtomicU64>);

impl SessionGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Retire the current session and return the number of the next one.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

/// A one-shot read of a source buffer, placed on the engine clock.
#[derive(Clone)]
pub struct VoiceSpec {
    pub id: VoiceId,
    /// Session the voice belongs to; see [`SessionGeneration`].
    pub generation: u64,
    pub track: TrackId,
    pub source: Shared<AudioArc>,
    /// Engine frame at which the voice begins to sound.
    pub start_frame: u64,
    /// First frame of `source` to read.
    pub source_frame: u64,
    /// Upper bound on frames to play; the end of `source` also ends the voice.
    pub length_frames: u64,
}

impl std::fmt::Debug for VoiceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSpec")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("track", &self.track)
            .field("source", &format!("<{} frames>", self.source.frames()))
            .field("start_frame", &self.start_frame)
            .field("source_frame", &self.source_frame)
            .field("length_frames", &self.length_frames)
            .finish()
    }
}

/// Everything the control side can ask of the mix graph.
#[derive(Debug, Clone)]
pub enum MixCommand {
    /// Create (or reset) the gain → pan stage for a track.
    CreateStage {
        generation: u64,
        track: TrackId,
        gain: f32,
        pan: f32,
    },
    SetStageGain { track: TrackId, gain: f32 },
    SetStagePan { track: TrackId, pan: f32 },
    StartVoice(VoiceSpec),
    StopVoice(VoiceId),
    SetMasterGain(f32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine command queue is full")]
    QueueFull,
}

/// The control side's view of a running mix graph.
pub trait MixBackend {
    fn sample_rate(&self) -> u32;

    fn clock(&self) -> &FrameClock;

    fn analysis(&self) -> Option<&AnalysisTap>;

    /// Advancing this silences the previous session without a queued command.
    fn generation(&self) -> &SessionGeneration;

    /// Handle for allocating buffers the audio thread may drop.
    fn gc_handle(&self) -> Handle;

    fn send(&mut self, command: MixCommand) -> Result<(), EngineError>;

    /// Reclaim memory released by the audio thread.
    fn collect(&mut self);
}
