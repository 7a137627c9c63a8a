//! The mix graph: per-track stages (gain → pan) feeding one master bus.
//!
//! The mixer is driven one block at a time. It is the same code on the
//! real-time thread and in offline rendering; only the caller of
//! [`Mixer::process`] differs.

use std::f32::consts::FRAC_PI_2;

use studio_transport::TrackId;

use crate::analysis::AnalysisTap;
use crate::{FrameClock, MixCommand, SessionGeneration, VoiceId, VoiceSpec};

const INITIAL_VOICE_CAPACITY: usize = 256;
const INITIAL_STAGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Stage {
    generation: u64,
    track: TrackId,
    gain: f32,
    target_gain: f32,
    pan: f32,
    target_pan: f32,
}

impl Stage {
    fn new(generation: u64, track: TrackId, gain: f32, pan: f32) -> Self {
        Self {
            generation,
            track,
            gain,
            target_gain: gain,
            pan,
            target_pan: pan,
        }
    }

    /// Linear ramp from the current to the target value across one block.
    fn at(&self, t: f32) -> (f32, f32) {
        (
            self.gain + (self.target_gain - self.gain) * t,
            self.pan + (self.target_pan - self.pan) * t,
        )
    }

    fn settle(&mut self) {
        self.gain = self.target_gain;
        self.pan = self.target_pan;
    }
}

struct ActiveVoice {
    spec: VoiceSpec,
    /// First frame at which the voice is silent again.
    end_frame: u64,
}

/// Stage parameters as the mixer currently targets them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageParams {
    pub gain: f32,
    pub pan: f32,
}

pub struct Mixer {
    sample_rate: u32,
    clock: FrameClock,
    generation: SessionGeneration,
    /// Generation the stages and voices below were last checked against.
    live: u64,
    stages: Vec<Stage>,
    voices: Vec<ActiveVoice>,
    master_gain: f32,
    target_master_gain: f32,
    tap: Option<AnalysisTap>,
}

impl Mixer {
    pub fn new(clock: FrameClock, tap: Option<AnalysisTap>) -> Self {
        Self {
            sample_rate: clock.sample_rate(),
            clock,
            generation: SessionGeneration::new(),
            live: 0,
            stages: Vec::with_capacity(INITIAL_STAGE_CAPACITY),
            voices: Vec::with_capacity(INITIAL_VOICE_CAPACITY),
            master_gain: 1.0,
            target_master_gain: 1.0,
            tap,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    /// Shared with the control side; see [`SessionGeneration`].
    pub fn generation(&self) -> &SessionGeneration {
        &self.generation
    }

    /// Drop stages and voices of sessions that have been retired.
    fn retire_stale(&mut self) {
        let current = self.generation.current();
        if current != self.live {
            self.voices.retain(|voice| voice.spec.generation == current);
            self.stages.retain(|stage| stage.generation == current);
            self.live = current;
        }
    }

    pub fn apply(&mut self, command: MixCommand) {
        self.retire_stale();
        match command {
            MixCommand::CreateStage {
                generation,
                track,
                gain,
                pan,
            } => {
                if generation != self.live {
                    return;
                }
                let stage = Stage::new(generation, track, gain, pan);
                match self.stages.iter_mut().find(|s| s.track == track) {
                    Some(existing) => *existing = stage,
                    None => self.stages.push(stage),
                }
            }
            MixCommand::SetStageGain { track, gain } => {
                if let Some(stage) = self.stage_mut(track) {
                    stage.target_gain = gain;
                }
            }
            MixCommand::SetStagePan { track, pan } => {
                if let Some(stage) = self.stage_mut(track) {
                    stage.target_pan = pan;
                }
            }
            MixCommand::StartVoice(spec) => {
                if spec.generation != self.live {
                    return;
                }
                let available = (spec.source.frames() as u64).saturating_sub(spec.source_frame);
                let length = spec.length_frames.min(available);
                if length > 0 {
                    let end_frame = spec.start_frame + length;
                    self.voices.push(ActiveVoice { spec, end_frame });
                }
            }
            MixCommand::StopVoice(id) => {
                self.voices.retain(|voice| voice.spec.id != id);
            }
            MixCommand::SetMasterGain(gain) => {
                self.target_master_gain = gain;
            }
        }
    }

    fn stage_mut(&mut self, track: TrackId) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.track == track)
    }

    pub fn stage_params(&self, track: TrackId) -> Option<StageParams> {
        let current = self.generation.current();
        self.stages
            .iter()
            .find(|s| s.track == track && s.generation == current)
            .map(|s| StageParams {
                gain: s.target_gain,
                pan: s.target_pan,
            })
    }

    /// Voices connected and not yet finished, including ones waiting for
    /// their start frame.
    pub fn voice_count(&self) -> usize {
        let current = self.generation.current();
        self.voices
            .iter()
            .filter(|voice| voice.spec.generation == current)
            .count()
    }

    pub fn has_voice(&self, id: VoiceId) -> bool {
        let current = self.generation.current();
        self.voices
            .iter()
            .any(|voice| voice.spec.id == id && voice.spec.generation == current)
    }

    pub fn stage_count(&self) -> usize {
        let current = self.generation.current();
        self.stages.iter().filter(|s| s.generation == current).count()
    }

    /// Render one block of interleaved stereo into `out` and advance the clock.
    pub fn process(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        self.retire_stale();
        let frames = out.len() / 2;
        if frames == 0 {
            return;
        }

        let block_start = self.clock.frames();
        let block_end = block_start + frames as u64;

        for voice in &self.voices {
            let stage = self.stages.iter().find(|s| s.track == voice.spec.track);
            render_voice(voice, stage, block_start, block_end, out);
        }

        self.voices.retain(|voice| voice.end_frame > block_end);
        for stage in &mut self.stages {
            stage.settle();
        }

        let from = self.master_gain;
        let to = self.target_master_gain;
        for (i, frame) in out.chunks_exact_mut(2).enumerate() {
            let gain = from + (to - from) * ((i + 1) as f32 / frames as f32);
            frame[0] *= gain;
            frame[1] *= gain;
        }
        self.master_gain = to;

        if let Some(tap) = &self.tap {
            tap.write(out);
        }

        self.clock.advance(frames as u64);
    }
}

fn render_voice(
    voice: &ActiveVoice,
    stage: Option<&Stage>,
    block_start: u64,
    block_end: u64,
    out: &mut [f32],
) {
    let first = voice.spec.start_frame.max(block_start);
    let last = voice.end_frame.min(block_end);
    if first >= last {
        return;
    }

    let frames = (block_end - block_start) as f32;
    let source = &*voice.spec.source;
    let channels = source.channels() as usize;
    let samples = source.samples();

    for frame in first..last {
        let i = (frame - block_start) as usize;
        let src = (voice.spec.source_frame + (frame - voice.spec.start_frame)) as usize * channels;

        // Voices without a stage go straight to the master bus at unity
        let (gain, pan) = stage.map_or((1.0, 0.0), |s| s.at((i + 1) as f32 / frames));

        let (left, right) = if channels == 1 {
            pan_mono(samples[src], pan)
        } else {
            pan_stereo(samples[src], samples[src + 1], pan)
        };

        out[i * 2] += left * gain;
        out[i * 2 + 1] += right * gain;
    }
}

/// Equal-power placement of a mono signal.
pub fn pan_mono(sample: f32, pan: f32) -> (f32, f32) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * 0.5 * FRAC_PI_2;
    (sample * angle.cos(), sample * angle.sin())
}

/// Stereo balance: pan 0 passes both channels through, panning left folds the
/// right channel into the left and vice versa.
pub fn pan_stereo(left: f32, right: f32, pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    if pan <= 0.0 {
        let angle = (pan + 1.0) * FRAC_PI_2;
        (left + right * angle.cos(), right * angle.sin())
    } else {
        let angle = pan * FRAC_PI_2;
        (left * angle.cos(), right + left * angle.sin())
    }
}
