use basedrop::{Collector, Handle};

use crate::analysis::AnalysisTap;
use crate::mixer::Mixer;
use crate::{EngineError, FrameClock, MixBackend, MixCommand, SessionGeneration};

/// A mix graph driven by the caller instead of an audio device.
///
/// Commands apply immediately and time only moves when [`render`] is called.
/// Used for headless sessions and offline rendering.
///
/// [`render`]: DirectBackend::render
pub struct DirectBackend {
    mixer: Mixer,
    tap: AnalysisTap,
    collector: Collector,
}

impl DirectBackend {
    pub fn new(sample_rate: u32) -> Self {
        let tap = AnalysisTap::new();
        Self {
            mixer: Mixer::new(FrameClock::new(sample_rate), Some(tap.clone())),
            tap,
            collector: Collector::new(),
        }
    }

    /// Pull `frames` frames of interleaved stereo from the graph.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * 2];
        self.mixer.process(&mut out);
        out
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }
}

impl MixBackend for DirectBackend {
    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn clock(&self) -> &FrameClock {
        self.mixer.clock()
    }

    fn analysis(&self) -> Option<&AnalysisTap> {
        Some(&self.tap)
    }

    fn generation(&self) -> &SessionGeneration {
        self.mixer.generation()
    }

    fn gc_handle(&self) -> Handle {
        self.collector.handle()
    }

    fn send(&mut self, command: MixCommand) -> Result<(), EngineError> {
        self.mixer.apply(command);
        Ok(())
    }

    fn collect(&mut self) {
        self.collector.collect();
    }
}

impl std::fmt::Debug for DirectBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectBackend")
            .field("sample_rate", &self.mixer.sample_rate())
            .field("frames", &self.mixer.clock().frames())
            .field("voices", &self.mixer.voice_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VoiceId, VoiceSpec};
    use basedrop::Shared;
    use studio_transport::{AudioArc, TrackId};

    #[test]
    fn test_render_advances_clock_and_mixes() {
        let mut backend = DirectBackend::new(1000);
        let audio = AudioArc::new(vec![0.5; 100], 1000, 1);
        backend
            .send(MixCommand::StartVoice(VoiceSpec {
                id: VoiceId(1),
                generation: backend.generation().current(),
                track: TrackId(1),
                source: Shared::new(&backend.gc_handle(), audio),
                start_frame: 0,
                source_frame: 0,
                length_frames: 100,
            }))
            .expect("send");

        let out = backend.render(10);
        assert_eq!(out.len(), 20);
        assert!(out[0] > 0.0);
        assert_eq!(backend.clock().frames(), 10);

        backend.render(100);
        backend.collect();
        assert_eq!(backend.mixer().voice_count(), 0);
    }
}
