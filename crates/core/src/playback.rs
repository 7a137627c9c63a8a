//! One playback session: the stages and voices created by a single `play`.
//!
//! Everything here is torn down together on stop. Nothing outlives the
//! session it was created for.

use std::collections::HashMap;

use basedrop::Shared;
use studio_engine::{EngineError, MixBackend, MixCommand, VoiceId, VoiceSpec};
use studio_transport::{AudioArc, Track, TrackId, seconds_to_frames};

/// A track's gain → pan stage in the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageHandle {
    track: TrackId,
}

impl StageHandle {
    pub fn track(&self) -> TrackId {
        self.track
    }
}

#[derive(Debug, Clone, Copy)]
struct VoiceRecord {
    track: TrackId,
    start_frame: u64,
    end_frame: u64,
}

/// Where a voice reads from and when it sounds, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct VoicePlacement {
    /// Engine frame the voice starts on.
    pub start_frame: u64,
    pub trim_offset: f64,
    pub length: f64,
}

#[derive(Debug)]
pub struct PlaybackSession {
    generation: u64,
    stages: HashMap<TrackId, StageHandle>,
    voices: Vec<VoiceRecord>,
    next_voice: u64,
}

fn log_send_failure(result: Result<(), EngineError>, what: &str) {
    if let Err(err) = result {
        log::warn!("dropped {what}: {err}");
    }
}

/// Stage gain for a track: its volume when audible, otherwise silence.
pub fn stage_gain(track: &Track, audible: bool) -> f32 {
    if audible { track.volume } else { 0.0 }
}

impl PlaybackSession {
    /// Open a new session on `backend`, retiring whatever the previous one
    /// left in the mix graph.
    pub fn begin<B: MixBackend>(backend: &B) -> Self {
        Self {
            generation: backend.generation().advance(),
            stages: HashMap::new(),
            voices: Vec::new(),
            next_voice: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stage(&self, track: TrackId) -> Option<StageHandle> {
        self.stages.get(&track).copied()
    }

    /// The stage for `track`, created on first use with parameters taken from
    /// the model.
    pub fn ensure_track_stage<B: MixBackend>(
        &mut self,
        backend: &mut B,
        track: &Track,
        audible: bool,
    ) -> Result<StageHandle, EngineError> {
        if let Some(stage) = self.stages.get(&track.id) {
            return Ok(*stage);
        }

        backend.send(MixCommand::CreateStage {
            generation: self.generation,
            track: track.id,
            gain: stage_gain(track, audible),
            pan: track.pan,
        })?;
        let stage = StageHandle { track: track.id };
        self.stages.insert(track.id, stage);
        Ok(stage)
    }

    /// Wire a one-shot read of `buffer` through `stage`.
    ///
    /// `buffer` must already be at the backend's sample rate. The voice stops
    /// after `length` seconds or at the end of the buffer, whichever is first.
    /// A voice the backend refused is not recorded.
    pub fn connect_voice<B: MixBackend>(
        &mut self,
        backend: &mut B,
        stage: StageHandle,
        buffer: &AudioArc,
        placement: VoicePlacement,
    ) -> Result<VoiceId, EngineError> {
        let rate = backend.sample_rate();
        let source_frame = seconds_to_frames(placement.trim_offset, rate);
        let available = (buffer.frames() as u64).saturating_sub(source_frame);
        let length_frames = seconds_to_frames(placement.length, rate).min(available);

        let id = VoiceId(self.next_voice);
        self.next_voice += 1;

        backend.send(MixCommand::StartVoice(VoiceSpec {
            id,
            generation: self.generation,
            track: stage.track,
            source: Shared::new(&backend.gc_handle(), buffer.clone()),
            start_frame: placement.start_frame,
            source_frame,
            length_frames,
        }))?;

        self.voices.push(VoiceRecord {
            track: stage.track,
            start_frame: placement.start_frame,
            end_frame: placement.start_frame + length_frames,
        });
        Ok(id)
    }

    pub fn set_stage_gain<B: MixBackend>(&self, backend: &mut B, track: TrackId, gain: f32) {
        if self.stages.contains_key(&track) {
            log_send_failure(backend.send(MixCommand::SetStageGain { track, gain }), "gain change");
        }
    }

    pub fn set_stage_pan<B: MixBackend>(&self, backend: &mut B, track: TrackId, pan: f32) {
        if self.stages.contains_key(&track) {
            log_send_failure(backend.send(MixCommand::SetStagePan { track, pan }), "pan change");
        }
    }

    /// Voices connected and not yet known to have finished.
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Voices whose start frame is still ahead of `now_frame`.
    pub fn pending_voices(&self, now_frame: u64) -> usize {
        self.voices
            .iter()
            .filter(|voice| voice.start_frame > now_frame)
            .count()
    }

    pub fn is_bound_to(&self, track: TrackId) -> bool {
        self.stages.contains_key(&track) || self.voices.iter().any(|voice| voice.track == track)
    }

    /// Forget voices that have played out by `now_frame`.
    pub fn prune(&mut self, now_frame: u64) {
        self.voices.retain(|voice| voice.end_frame > now_frame);
    }

    /// Silence every voice of this session, started or not, and drop its
    /// stages. Does not go through the command queue, so it cannot fail.
    pub fn teardown<B: MixBackend>(self, backend: &mut B) {
        if backend.generation().current() == self.generation {
            backend.generation().advance();
        }
        log::debug!(
            "session torn down: {} voice(s), {} stage(s)",
            self.voices.len(),
            self.stages.len()
        );
    }
}
