use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use studio_decode::{ClipBufferStore, DecodeError};
use studio_engine::schedule::{any_solo, plan_track, track_is_audible};
use studio_engine::{
    AudioEngineHandle, CaptureBlob, CaptureError, InputBackend, MixBackend, MixCommand, Recorder,
};
use studio_render::OfflineRenderer;
use studio_transport::{AudioClip, ClipId, Track, TrackId, arrangement_end, seconds_to_frames};
use tokio::sync::watch;

use crate::clock::TransportClock;
use crate::config::StudioConfig;
use crate::display::{self, DisplayFrame, DisplayLoop};
use crate::error::SessionError;
use crate::playback::{PlaybackSession, VoicePlacement, stage_gain};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportState {
    pub is_playing: bool,
    pub is_recording: bool,
    /// Arrangement position in seconds.
    pub current_time: f64,
    pub loop_start: f64,
    pub loop_end: f64,
    pub loop_enabled: bool,
}

impl TransportState {
    /// Where scheduling entered at `from` has to stop because of the loop.
    fn loop_horizon(&self, from: f64) -> Option<f64> {
        (self.loop_enabled && from < self.loop_end).then_some(self.loop_end)
    }
}

pub struct Session<B: MixBackend = AudioEngineHandle> {
    backend: B,
    tracks: Vec<Track>,
    store: Arc<ClipBufferStore>,
    clock: TransportClock,
    active: Option<PlaybackSession>,
    transport: TransportState,
    renderer: OfflineRenderer,
    config: StudioConfig,
    runtime: Option<tokio::runtime::Handle>,
    display: Option<DisplayLoop>,
    display_tx: Arc<watch::Sender<DisplayFrame>>,
}

impl Session<AudioEngineHandle> {
    /// Open the default output device and build a session around it.
    pub fn new(tracks: Vec<Track>, config: StudioConfig) -> anyhow::Result<Self> {
        let engine = studio_engine::start(config.command_queue_capacity)?;
        Ok(Self::with_backend(engine, tracks, config))
    }
}

/// Start a voice for every clip of `track` sounding at or after `from`.
fn schedule_track<B: MixBackend>(
    backend: &mut B,
    playback: &mut PlaybackSession,
    store: &ClipBufferStore,
    track: &Track,
    from: f64,
    base_frame: u64,
    until: Option<f64>,
) {
    let stage = match playback.ensure_track_stage(backend, track, true) {
        Ok(stage) => stage,
        Err(err) => {
            log::warn!("{} left out of playback: {err}", track.id);
            return;
        }
    };
    let rate = backend.sample_rate();

    for plan in plan_track(track, from) {
        let Some(buffer) = store.get(plan.clip) else {
            log::debug!("{} has no decoded buffer, skipped", plan.clip);
            continue;
        };
        if buffer.sample_rate() != rate {
            log::warn!(
                "{} is at {} Hz but the engine runs at {rate} Hz, skipped",
                plan.clip,
                buffer.sample_rate()
            );
            continue;
        }

        let mut length = plan.length;
        if let Some(until) = until {
            let starts_at = from + plan.delay;
            if starts_at >= until {
                continue;
            }
            length = length.min(until - starts_at);
        }

        let placement = VoicePlacement {
            start_frame: base_frame + seconds_to_frames(plan.delay, rate),
            trim_offset: plan.source_offset,
            length,
        };
        if let Err(err) = playback.connect_voice(backend, stage, &buffer, placement) {
            log::warn!("{} dropped from playback: {err}", plan.clip);
        }
    }
}

impl<B: MixBackend> Session<B> {
    pub fn with_backend(backend: B, tracks: Vec<Track>, config: StudioConfig) -> Self {
        let store = Arc::new(ClipBufferStore::new(Some(backend.sample_rate())));
        let clock = TransportClock::new(backend.clock().clone());
        let (display_tx, _) = watch::channel(DisplayFrame::default());

        Self {
            backend,
            tracks,
            store,
            clock,
            active: None,
            transport: TransportState::default(),
            renderer: OfflineRenderer::new(),
            config,
            runtime: None,
            display: None,
            display_tx: Arc::new(display_tx),
        }
    }

    /// Use a different buffer store. It should resample to the backend rate.
    pub fn with_store(mut self, store: Arc<ClipBufferStore>) -> Self {
        self.store = store;
        self
    }

    /// Runtime on which the display loop is spawned during playback.
    pub fn attach_runtime(&mut self, runtime: tokio::runtime::Handle) {
        self.runtime = Some(runtime);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn store(&self) -> &Arc<ClipBufferStore> {
        &self.store
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn clock(&self) -> &TransportClock {
        &self.clock
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|track| track.id == id)
    }

    pub fn add_track(&mut self, track: Track) {
        self.tracks.push(track);
    }

    /// Takes effect for playback on the next `play`.
    pub fn insert_clip(&mut self, track: TrackId, clip: AudioClip) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == track) {
            Some(t) => {
                t.insert_clip(clip);
                true
            }
            None => {
                log::debug!("insert_clip: unknown {track}");
                false
            }
        }
    }

    /// Remove a track, stopping playback first if the track is part of it.
    pub fn remove_track(&mut self, id: TrackId) -> Option<Track> {
        let index = self.tracks.iter().position(|track| track.id == id)?;
        if self.active.as_ref().is_some_and(|p| p.is_bound_to(id)) {
            self.stop();
        }
        let track = self.tracks.remove(index);
        for clip in track.clips() {
            self.store.forget(clip.id);
        }
        Some(track)
    }

    /// Decode every clip concurrently. Returns the clips that failed; they
    /// stay silent and the rest of the arrangement plays normally.
    pub async fn preload(&self) -> Vec<(ClipId, DecodeError)> {
        let mut jobs = tokio::task::JoinSet::new();
        for clip in self.tracks.iter().flat_map(Track::clips) {
            let store = self.store.clone();
            let id = clip.id;
            let source = clip.source.clone();
            jobs.spawn(async move { (id, store.load(id, &source).await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((id, Err(err))) => failures.push((id, err)),
                Ok(_) => {}
                Err(err) => log::warn!("preload task failed: {err}"),
            }
        }
        failures
    }

    /// Attach waveform summaries to every clip that has a decoded buffer.
    pub fn refresh_waveforms(&mut self) {
        let buckets = self.config.waveform_buckets;
        for clip in self.tracks.iter_mut().flat_map(Track::clips_mut) {
            clip.waveform = self.store.summary(clip.id, buckets);
        }
    }

    pub fn play(&mut self, from: f64) {
        if self.active.is_some() {
            self.stop();
        }

        let from = from.max(0.0);
        let base_frame = self.backend.clock().frames();
        self.clock.start(from);

        let mut playback = PlaybackSession::begin(&self.backend);
        let any_solo = any_solo(&self.tracks);
        let until = self.transport.loop_horizon(from);
        for track in &self.tracks {
            if track_is_audible(track, any_solo) {
                schedule_track(
                    &mut self.backend,
                    &mut playback,
                    &self.store,
                    track,
                    from,
                    base_frame,
                    until,
                );
            }
        }

        log::debug!("playing from {from:.3}s with {} voice(s)", playback.voice_count());
        self.active = Some(playback);
        self.transport.is_playing = true;
        self.start_display();
    }

    /// Silence everything, including voices that have not started yet, and
    /// freeze the position.
    pub fn stop(&mut self) {
        if let Some(playback) = self.active.take() {
            playback.teardown(&mut self.backend);
        }
        self.clock.stop();
        self.transport.is_playing = false;
        self.display = None;
        self.display_tx
            .send_replace(display::sample(&self.clock, self.backend.analysis()));
    }

    pub fn seek(&mut self, to: f64) {
        if self.active.is_some() {
            self.play(to);
        } else {
            self.clock.seek(to);
        }
    }

    /// Play from wherever the transport was stopped.
    pub fn resume(&mut self) {
        if self.active.is_none() {
            self.play(self.clock.position());
        }
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    pub fn position(&self) -> f64 {
        self.clock.position()
    }

    /// Housekeeping; call regularly from the control thread.
    ///
    /// Forgets finished voices, reclaims buffers the audio thread let go of,
    /// and wraps around the loop. Returns the current position.
    pub fn poll(&mut self) -> f64 {
        let now = self.backend.clock().frames();
        if let Some(playback) = &mut self.active {
            playback.prune(now);
        }
        self.backend.collect();

        let position = self.clock.position();
        let TransportState {
            loop_start,
            loop_end,
            loop_enabled,
            ..
        } = self.transport;
        if self.active.is_some() && loop_enabled && position >= loop_end {
            // Carry the overshoot into the next lap
            let lap = loop_end - loop_start;
            self.seek(loop_start + (position - loop_end) % lap);
            return self.clock.position();
        }
        position
    }

    pub fn pending_voices(&self) -> usize {
        let now = self.backend.clock().frames();
        self.active
            .as_ref()
            .map_or(0, |playback| playback.pending_voices(now))
    }

    pub fn voice_count(&self) -> usize {
        self.active.as_ref().map_or(0, PlaybackSession::voice_count)
    }

    pub fn set_track_volume(&mut self, id: TrackId, volume: f32) {
        let any_solo = any_solo(&self.tracks);
        let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) else {
            log::debug!("set_track_volume: unknown {id}");
            return;
        };
        track.set_volume(volume);
        if let Some(playback) = &self.active {
            let gain = stage_gain(track, track_is_audible(track, any_solo));
            playback.set_stage_gain(&mut self.backend, id, gain);
        }
    }

    pub fn set_track_pan(&mut self, id: TrackId, pan: f32) {
        let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) else {
            log::debug!("set_track_pan: unknown {id}");
            return;
        };
        track.set_pan(pan);
        if let Some(playback) = &self.active {
            playback.set_stage_pan(&mut self.backend, id, track.pan);
        }
    }

    pub fn set_track_muted(&mut self, id: TrackId, muted: bool) {
        let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) else {
            log::debug!("set_track_muted: unknown {id}");
            return;
        };
        track.muted = muted;
        self.reconcile_audibility();
    }

    pub fn set_track_solo(&mut self, id: TrackId, solo: bool) {
        let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) else {
            log::debug!("set_track_solo: unknown {id}");
            return;
        };
        track.solo = solo;
        self.reconcile_audibility();
    }

    /// Re-apply effective mute to every stage after a mute or solo change.
    /// Tracks that became audible without a stage join playback where the
    /// transport is now.
    fn reconcile_audibility(&mut self) {
        let from = self.clock.position();
        let base_frame = self.backend.clock().frames();
        let until = self.transport.loop_horizon(from);
        let Some(playback) = self.active.as_mut() else {
            return;
        };

        let any_solo = any_solo(&self.tracks);
        for track in &self.tracks {
            let audible = track_is_audible(track, any_solo);
            if playback.stage(track.id).is_some() {
                playback.set_stage_gain(&mut self.backend, track.id, stage_gain(track, audible));
            } else if audible {
                log::debug!("{} joins playback at {from:.3}s", track.id);
                schedule_track(
                    &mut self.backend,
                    playback,
                    &self.store,
                    track,
                    from,
                    base_frame,
                    until,
                );
            }
        }
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        if let Err(err) = self.backend.send(MixCommand::SetMasterGain(volume.clamp(0.0, 1.0))) {
            log::warn!("dropped master volume change: {err}");
        }
    }

    pub fn set_loop(&mut self, start: f64, end: f64) -> Result<(), SessionError> {
        if !(start >= 0.0 && end > start) {
            return Err(SessionError::InvalidLoop { start, end });
        }
        let changed = self.transport.loop_start != start || self.transport.loop_end != end;
        self.transport.loop_start = start;
        self.transport.loop_end = end;
        if changed && self.transport.loop_enabled {
            self.reschedule();
        }
        Ok(())
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        let enabled = enabled && self.transport.loop_end > self.transport.loop_start;
        if enabled != self.transport.loop_enabled {
            self.transport.loop_enabled = enabled;
            self.reschedule();
        }
    }

    /// Rebuild the active session from the current position, so voices cut
    /// short for an old loop horizon play on.
    fn reschedule(&mut self) {
        if self.active.is_some() {
            self.play(self.clock.position());
        }
    }

    pub fn transport_state(&self) -> TransportState {
        TransportState {
            is_playing: self.active.is_some(),
            current_time: self.clock.position(),
            ..self.transport
        }
    }

    /// Current spectrum of the master bus.
    pub fn analysis_snapshot(&self) -> Vec<u8> {
        display::sample(&self.clock, self.backend.analysis()).spectrum
    }

    /// Frames published by the display loop while playing, plus one on every stop.
    pub fn subscribe_display(&self) -> watch::Receiver<DisplayFrame> {
        self.display_tx.subscribe()
    }

    fn start_display(&mut self) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        self.display = Some(DisplayLoop::spawn(
            runtime,
            self.config.display_refresh(),
            self.clock.clone(),
            self.backend.analysis().cloned(),
            self.display_tx.clone(),
        ));
    }

    /// Mix the arrangement offline to 16-bit stereo WAV bytes.
    ///
    /// `total_duration` defaults to the end of the last clip. The returned
    /// job owns everything it needs, so the session stays usable while it runs.
    pub fn export(
        &self,
        total_duration: Option<f64>,
    ) -> impl Future<Output = Result<Vec<u8>, SessionError>> + Send + 'static {
        let total = total_duration.unwrap_or_else(|| arrangement_end(&self.tracks));
        let job = self
            .renderer
            .render(self.tracks.clone(), self.store.native_snapshot(), total);
        async move { Ok(job.await?) }
    }

    pub fn render_to_file(
        &self,
        path: &Path,
        total_duration: Option<f64>,
    ) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let path = path.to_path_buf();
        let job = self.export(total_duration);
        async move {
            let bytes = job.await?;
            tokio::fs::write(&path, &bytes).await?;
            log::info!("wrote {} bytes to {}", bytes.len(), path.display());
            Ok(())
        }
    }

    pub fn start_capture<I: InputBackend>(
        &mut self,
        recorder: &mut Recorder<I>,
    ) -> Result<(), CaptureError> {
        recorder.start_capture()?;
        self.transport.is_recording = true;
        Ok(())
    }

    pub fn stop_capture<I: InputBackend>(
        &mut self,
        recorder: &mut Recorder<I>,
    ) -> Result<CaptureBlob, CaptureError> {
        self.transport.is_recording = false;
        recorder.stop_capture()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::f32::consts::FRAC_1_SQRT_2;
    use std::path::PathBuf;
    use studio_decode::SourceDecoder;
    use basedrop::{Collector, Handle};
    use studio_engine::capture::{InputHandle, OpenInput};
    use studio_engine::{
        AnalysisTap, DirectBackend, EngineError, FrameClock, Mixer, SessionGeneration,
    };
    use studio_transport::{AudioArc, SourceRef};

    const RATE: u32 = 1000;
    const EPS: f32 = 1e-4;

    /// Serves fixed buffers by file path.
    struct MapDecoder(HashMap<PathBuf, AudioArc>);

    impl SourceDecoder for MapDecoder {
        fn decode(&self, source: &SourceRef) -> Result<AudioArc, DecodeError> {
            match source {
                SourceRef::File(path) => self.0.get(path).cloned().ok_or_else(|| DecodeError::Read {
                    source_name: path.display().to_string(),
                    message: "no such fixture".to_string(),
                }),
                SourceRef::Memory { .. } => Err(DecodeError::Unsupported("memory".to_string())),
            }
        }
    }

    fn constant(value: f32, secs: usize) -> AudioArc {
        AudioArc::new(vec![value; secs * RATE as usize], RATE, 1)
    }

    /// Sample `i` holds `i / 10000`, so a read position can be recovered from output.
    fn ramp(secs: usize) -> AudioArc {
        let samples = (0..secs * RATE as usize).map(|i| i as f32 / 10_000.0).collect();
        AudioArc::new(samples, RATE, 1)
    }

    fn clip(id: u64, file: &str, start: f64, duration: f64, offset: f64) -> AudioClip {
        AudioClip::new(ClipId(id), SourceRef::file(file), start, duration, offset)
    }

    fn track(id: u64, clips: Vec<AudioClip>) -> Track {
        Track::from_clips(TrackId(id), format!("Track {id}"), clips)
    }

    async fn session(tracks: Vec<Track>, fixtures: Vec<(&str, AudioArc)>) -> Session<DirectBackend> {
        session_on(DirectBackend::new(RATE), tracks, fixtures).await
    }

    async fn session_on<B: MixBackend>(
        backend: B,
        tracks: Vec<Track>,
        fixtures: Vec<(&str, AudioArc)>,
    ) -> Session<B> {
        let fixtures = fixtures
            .into_iter()
            .map(|(path, audio)| (PathBuf::from(path), audio))
            .collect();
        let store = Arc::new(ClipBufferStore::with_decoder(
            Arc::new(MapDecoder(fixtures)),
            Some(RATE),
        ));
        let session = Session::with_backend(backend, tracks, StudioConfig::default()).with_store(store);
        session.preload().await;
        session
    }

    fn render(session: &mut Session<DirectBackend>, frames: usize) -> Vec<f32> {
        session.backend_mut().render(frames)
    }

    /// Commands wait in a bounded queue until the next callback, like the
    /// device backend.
    struct QueuedBackend {
        commands: rtrb::Producer<MixCommand>,
        pending: rtrb::Consumer<MixCommand>,
        mixer: Mixer,
        collector: Collector,
    }

    impl QueuedBackend {
        fn new(capacity: usize) -> Self {
            let (commands, pending) = rtrb::RingBuffer::new(capacity);
            Self {
                commands,
                pending,
                mixer: Mixer::new(FrameClock::new(RATE), None),
                collector: Collector::new(),
            }
        }

        /// One audio callback: drain the queue, then render `frames` frames.
        fn callback(&mut self, frames: usize) -> Vec<f32> {
            while let Ok(command) = self.pending.pop() {
                self.mixer.apply(command);
            }
            let mut out = vec![0.0; frames * 2];
            self.mixer.process(&mut out);
            out
        }
    }

    impl MixBackend for QueuedBackend {
        fn sample_rate(&self) -> u32 {
            self.mixer.sample_rate()
        }

        fn clock(&self) -> &FrameClock {
            self.mixer.clock()
        }

        fn analysis(&self) -> Option<&AnalysisTap> {
            None
        }

        fn generation(&self) -> &SessionGeneration {
            self.mixer.generation()
        }

        fn gc_handle(&self) -> Handle {
            self.collector.handle()
        }

        fn send(&mut self, command: MixCommand) -> Result<(), EngineError> {
            self.commands.push(command).map_err(|_| EngineError::QueueFull)
        }

        fn collect(&mut self) {
            self.collector.collect();
        }
    }

    /// Mono input at pan 0 lands on both sides at -3 dB.
    fn centered(value: f32) -> f32 {
        value * FRAC_1_SQRT_2
    }

    #[tokio::test]
    async fn test_mid_clip_entry_reads_from_elapsed_offset() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 2.0, 3.0, 0.0)])], vec![("a.wav", ramp(10))]).await;

        s.play(3.0);
        assert_eq!(s.voice_count(), 1);
        assert_eq!(s.pending_voices(), 0);

        let out = render(&mut s, 4);
        // One second into the clip: source frame 1000
        assert!((out[0] - centered(0.1)).abs() < EPS);
        assert!((out[2] - centered(0.1001)).abs() < EPS);
    }

    #[tokio::test]
    async fn test_mid_clip_voice_ends_with_the_clip() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 2.0, 3.0, 0.0)])], vec![("a.wav", constant(0.5, 10))]).await;

        s.play(3.0);
        let out = render(&mut s, 2100);
        assert!(out[2 * 1999] > 0.0);
        assert_eq!(out[2 * 2000], 0.0, "only two seconds of the clip remained");

        s.poll();
        assert_eq!(s.voice_count(), 0);
    }

    #[tokio::test]
    async fn test_future_clip_waits_for_its_start() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 1.0, 1.0, 0.25)])], vec![("a.wav", ramp(2))]).await;

        s.play(0.5);
        assert_eq!(s.pending_voices(), 1);

        let out = render(&mut s, 501);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[2 * 499], 0.0);
        assert!((out[2 * 500] - centered(0.025)).abs() < EPS);
        assert_eq!(s.pending_voices(), 0);
    }

    #[tokio::test]
    async fn test_finished_clips_are_not_instantiated() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 2.0, 0.0)])], vec![("a.wav", constant(0.5, 4))]).await;

        s.play(2.0);
        assert_eq!(s.voice_count(), 0);
        assert_eq!(s.backend().mixer().voice_count(), 0);
    }

    #[tokio::test]
    async fn test_solo_silences_other_tracks_whatever_their_mute() {
        let mut soloed = track(1, vec![clip(1, "a.wav", 0.0, 1.0, 0.0)]);
        soloed.solo = true;
        let plain = track(2, vec![clip(2, "b.wav", 0.0, 1.0, 0.0)]);
        let mut muted = track(3, vec![clip(3, "c.wav", 0.0, 1.0, 0.0)]);
        muted.muted = true;
        let mut s = session(
            vec![soloed, plain, muted],
            vec![
                ("a.wav", constant(0.5, 1)),
                ("b.wav", constant(0.25, 1)),
                ("c.wav", constant(0.125, 1)),
            ],
        )
        .await;

        s.play(0.0);
        assert_eq!(s.voice_count(), 1);
        let out = render(&mut s, 10);
        assert!((out[0] - centered(0.5)).abs() < EPS);
        assert!((out[18] - centered(0.5)).abs() < EPS);
        assert!(!s.track(TrackId(2)).expect("track").muted, "solo never rewrites mute");
        assert!(s.track(TrackId(3)).expect("track").muted);

        // Dropping the solo brings back only the unmuted track
        s.set_track_solo(TrackId(1), false);
        render(&mut s, 64);
        let out = render(&mut s, 4);
        assert!((out[0] - centered(0.5 + 0.25)).abs() < EPS);
    }

    #[tokio::test]
    async fn test_unsolo_joins_suppressed_track_at_current_position() {
        let mut soloed = track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)]);
        soloed.solo = true;
        let plain = track(2, vec![clip(2, "b.wav", 0.0, 5.0, 0.0)]);
        let mut s = session(
            vec![soloed, plain],
            vec![("a.wav", constant(0.5, 5)), ("b.wav", ramp(5))],
        )
        .await;

        s.play(0.0);
        assert_eq!(s.voice_count(), 1);
        render(&mut s, 1000);

        s.set_track_solo(TrackId(1), false);
        assert_eq!(s.voice_count(), 2);

        let out = render(&mut s, 2);
        // Track 2 enters one second into its clip
        assert!((out[0] - centered(0.5 + 0.1)).abs() < EPS);
    }

    #[tokio::test]
    async fn test_mute_during_playback_silences_without_touching_voices() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)])], vec![("a.wav", constant(0.5, 5))]).await;

        s.play(0.0);
        s.set_track_muted(TrackId(1), true);
        render(&mut s, 64);
        let out = render(&mut s, 64);
        assert!(out.iter().all(|v| v.abs() < EPS));
        assert_eq!(s.voice_count(), 1);

        s.set_track_muted(TrackId(1), false);
        render(&mut s, 64);
        let out = render(&mut s, 4);
        assert!((out[0] - centered(0.5)).abs() < EPS);
    }

    #[tokio::test]
    async fn test_volume_changes_never_add_voices() {
        let mut s = session(
            vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0), clip(2, "a.wav", 6.0, 1.0, 0.0)])],
            vec![("a.wav", constant(0.5, 5))],
        )
        .await;

        s.play(0.0);
        let before = s.voice_count();
        for step in 0..20 {
            s.set_track_volume(TrackId(1), step as f32 / 20.0);
            render(&mut s, 8);
        }
        assert_eq!(s.voice_count(), before);
        assert_eq!(s.backend().mixer().stage_params(TrackId(1)).map(|p| p.gain), Some(0.95));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_voices_and_freezes_position() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 3.0, 1.0, 0.0)])], vec![("a.wav", constant(0.5, 1))]).await;

        s.play(0.0);
        assert_eq!(s.pending_voices(), 1);
        render(&mut s, 500);
        s.stop();

        assert_eq!(s.pending_voices(), 0);
        assert_eq!(s.backend().mixer().voice_count(), 0);
        assert!((s.position() - 0.5).abs() < 1e-9);

        let out = render(&mut s, 4000);
        assert!(out.iter().all(|&v| v == 0.0));
        assert!((s.position() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_seek_while_playing_matches_fresh_play() {
        let tracks = vec![track(1, vec![clip(1, "a.wav", 1.0, 3.0, 0.5)])];

        let mut seeked = session(tracks.clone(), vec![("a.wav", ramp(5))]).await;
        seeked.play(0.0);
        seeked.seek(2.0);

        let mut fresh = session(tracks, vec![("a.wav", ramp(5))]).await;
        fresh.play(2.0);

        assert_eq!(seeked.voice_count(), fresh.voice_count());
        assert_eq!(render(&mut seeked, 100), render(&mut fresh, 100));
    }

    #[tokio::test]
    async fn test_seek_while_stopped_then_resume() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)])], vec![("a.wav", ramp(5))]).await;

        s.seek(2.0);
        assert!(!s.is_playing());
        assert_eq!(s.voice_count(), 0);

        s.resume();
        let out = render(&mut s, 2);
        assert!((out[0] - centered(0.2)).abs() < EPS);
    }

    #[tokio::test]
    async fn test_unknown_tracks_are_ignored() {
        let mut s = session(vec![track(1, vec![])], vec![]).await;
        s.set_track_volume(TrackId(99), 0.5);
        s.set_track_solo(TrackId(99), true);
        assert!(!s.tracks().iter().any(|t| t.solo));
    }

    #[tokio::test]
    async fn test_missing_buffer_skips_only_that_clip() {
        let mut s = session(
            vec![track(1, vec![clip(1, "missing.wav", 0.0, 1.0, 0.0), clip(2, "a.wav", 0.0, 1.0, 0.0)])],
            vec![("a.wav", constant(0.5, 1))],
        )
        .await;

        let failures = s.preload().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ClipId(1));

        s.play(0.0);
        assert_eq!(s.voice_count(), 1);
    }

    #[tokio::test]
    async fn test_loop_wraps_on_poll() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)])], vec![("a.wav", ramp(5))]).await;

        assert!(matches!(s.set_loop(2.0, 1.0), Err(SessionError::InvalidLoop { .. })));
        assert!(s.set_loop(-1.0, 1.0).is_err());
        s.set_loop(0.0, 1.0).expect("loop");
        s.set_loop_enabled(true);

        s.play(0.0);
        let out = render(&mut s, 1010);
        assert!(out[2 * 999] > 0.0);
        assert_eq!(out[2 * 1000], 0.0, "voices stop at the loop end");

        // Ten frames past the end land ten frames into the next lap
        let position = s.poll();
        assert!((position - 0.01).abs() < 1e-9, "wrapped to {position}");
        assert!(s.is_playing());
        assert!(s.transport_state().loop_enabled);

        let out = render(&mut s, 2);
        assert!((out[0] - centered(0.001)).abs() < EPS);
    }

    #[tokio::test]
    async fn test_loop_wrap_carries_overshoot_within_one_lap() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)])], vec![("a.wav", ramp(5))]).await;
        s.set_loop(1.0, 1.5).expect("loop");
        s.set_loop_enabled(true);

        s.play(1.0);
        render(&mut s, 1200);
        // 2.2s is 0.7s past the end of a 0.5s lap
        let position = s.poll();
        assert!((position - 1.2).abs() < 1e-9, "wrapped to {position}");
    }

    #[tokio::test]
    async fn test_disabling_loop_while_playing_lets_clips_run_on() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)])], vec![("a.wav", constant(0.5, 5))]).await;
        s.set_loop(0.0, 1.0).expect("loop");
        s.set_loop_enabled(true);

        s.play(0.0);
        render(&mut s, 500);
        s.set_loop_enabled(false);
        assert!(s.is_playing());
        assert!((s.position() - 0.5).abs() < 1e-9);

        // Covers 0.5s to 1.5s of the arrangement
        let out = render(&mut s, 1000);
        assert!(out[2 * 600..].iter().all(|v| (v - centered(0.5)).abs() < EPS));
        assert!(s.poll() > 1.0, "no wrap once the loop is off");
    }

    #[tokio::test]
    async fn test_moving_loop_end_while_playing_extends_voices() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)])], vec![("a.wav", constant(0.5, 5))]).await;
        s.set_loop(0.0, 1.0).expect("loop");
        s.set_loop_enabled(true);

        s.play(0.0);
        render(&mut s, 500);
        s.set_loop(0.0, 2.0).expect("loop");

        let out = render(&mut s, 1000);
        assert!(out[2 * 600..].iter().all(|v| (v - centered(0.5)).abs() < EPS));

        // Same bounds again: nothing is rebuilt
        let before = s.backend().generation().current();
        s.set_loop(0.0, 2.0).expect("loop");
        s.set_loop_enabled(true);
        assert_eq!(s.voice_count(), 1);
        assert_eq!(s.backend().generation().current(), before);
    }

    #[tokio::test]
    async fn test_loop_changes_while_stopped_schedule_nothing() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)])], vec![("a.wav", constant(0.5, 5))]).await;
        s.set_loop(0.0, 1.0).expect("loop");
        s.set_loop_enabled(true);
        s.set_loop_enabled(false);

        assert!(!s.is_playing());
        assert_eq!(s.backend().mixer().voice_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_silences_voices_stuck_behind_full_queue() {
        let mut s = session_on(
            QueuedBackend::new(4),
            vec![track(1, vec![clip(1, "a.wav", 1.0, 1.0, 0.0)])],
            vec![("a.wav", constant(0.5, 1))],
        )
        .await;

        s.play(0.0);
        s.backend_mut().callback(100);
        assert_eq!(s.pending_voices(), 1);

        // Fill the queue so nothing else fits
        for step in 0..4 {
            s.set_track_volume(TrackId(1), 0.5 + step as f32 / 10.0);
        }
        s.stop();
        assert_eq!(s.pending_voices(), 0);

        let out = s.backend_mut().callback(2000);
        assert!(out.iter().all(|&v| v == 0.0), "voice sounded after stop");
    }

    #[tokio::test]
    async fn test_voices_rejected_by_full_queue_are_not_counted() {
        let clips = (0..5).map(|i| clip(i, "a.wav", i as f64, 1.0, 0.0)).collect();
        let mut s = session_on(QueuedBackend::new(4), vec![track(1, clips)], vec![("a.wav", constant(0.5, 1))]).await;

        // One slot goes to the stage, three to voices
        s.play(0.0);
        assert_eq!(s.voice_count(), 3);
        assert_eq!(s.pending_voices(), 2);

        s.backend_mut().callback(1);
        assert_eq!(s.backend().mixer.voice_count(), 3);
    }

    #[tokio::test]
    async fn test_replay_after_stop_ignores_commands_of_old_session() {
        let mut s = session_on(
            QueuedBackend::new(8),
            vec![track(1, vec![clip(1, "a.wav", 0.0, 1.0, 0.0)])],
            vec![("a.wav", ramp(1))],
        )
        .await;

        // Nothing drained between the two sessions
        s.play(0.0);
        s.play(0.5);

        let out = s.backend_mut().callback(2);
        assert_eq!(s.backend().mixer.voice_count(), 1);
        assert!((out[0] - centered(0.05)).abs() < EPS);
    }

    #[tokio::test]
    async fn test_remove_bound_track_stops_playback() {
        let mut s = session(
            vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)]), track(2, vec![])],
            vec![("a.wav", constant(0.5, 5))],
        )
        .await;

        s.play(0.0);
        assert!(s.remove_track(TrackId(1)).is_some());
        assert!(!s.is_playing());
        assert!(s.store().get(ClipId(1)).is_none());
        assert!(s.remove_track(TrackId(1)).is_none());
    }

    #[tokio::test]
    async fn test_export_one_clip() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 1.0, 0.0)])], vec![("a.wav", constant(0.5, 1))]).await;
        s.refresh_waveforms();
        assert!(s.tracks()[0].clips()[0].waveform.is_some());

        let bytes = s.export(None).await.expect("export");
        let data_len = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]);
        assert_eq!(data_len, 44100 * 2 * 2);
    }

    #[tokio::test]
    async fn test_export_resamples_from_decoded_rate() {
        // Decoded at 44.1 kHz, played at 1 kHz, exported at 44.1 kHz
        let native = AudioArc::new(vec![0.5; 44100], 44100, 1);
        let s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 1.0, 0.0)])], vec![("a.wav", native)]).await;
        assert_eq!(s.store().get(ClipId(1)).map(|a| a.sample_rate()), Some(RATE));

        let bytes = s.export(None).await.expect("export");
        let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes)).expect("wav");
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.expect("sample")).collect();

        // Full level right up to the last frame
        let last = samples[samples.len() - 2] as f32 / i16::MAX as f32;
        assert!((last - centered(0.5)).abs() < 0.01, "last frame {last}");
        let middle = samples[44100] as f32 / i16::MAX as f32;
        assert!((middle - centered(0.5)).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_render_to_file() {
        let s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 1.0, 0.0)])], vec![("a.wav", constant(0.5, 1))]).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mix.wav");

        s.render_to_file(&path, Some(0.5)).await.expect("render");
        let reader = hound::WavReader::open(&path).expect("wav");
        assert_eq!(reader.duration(), 22050);
    }

    #[tokio::test]
    async fn test_display_frames_follow_transport() {
        let mut s = session(vec![track(1, vec![clip(1, "a.wav", 0.0, 5.0, 0.0)])], vec![("a.wav", constant(0.5, 5))]).await;
        s.attach_runtime(tokio::runtime::Handle::current());
        let mut frames = s.subscribe_display();

        s.play(1.0);
        frames.changed().await.expect("frame");
        assert!(frames.borrow_and_update().playing);

        s.stop();
        let last = frames.borrow_and_update().clone();
        assert!(!last.playing);
        assert_eq!(last.position, 1.0);
    }

    struct FakeInput;
    struct FakeHandle;

    impl InputHandle for FakeHandle {
        fn release(self: Box<Self>) {}
    }

    impl InputBackend for FakeInput {
        fn open(&mut self, _buffer_secs: f32) -> Result<OpenInput, CaptureError> {
            let (mut producer, consumer) = rtrb::RingBuffer::new(4);
            producer.push(0.5).expect("room");
            Ok(OpenInput {
                sample_rate: 8000,
                channels: 1,
                samples: consumer,
                handle: Box::new(FakeHandle),
            })
        }
    }

    #[tokio::test]
    async fn test_capture_flag_follows_recorder() {
        let mut s = session(vec![], vec![]).await;
        let mut recorder = Recorder::new(FakeInput, 1.0);

        s.start_capture(&mut recorder).expect("start");
        assert!(s.transport_state().is_recording);

        let blob = s.stop_capture(&mut recorder).expect("stop");
        assert!(!s.transport_state().is_recording);
        assert_eq!(blob.mime, "audio/wav");
        assert!(!blob.is_empty());
    }
}
