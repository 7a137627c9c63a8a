//! Voice placement: which clips sound, when, and from where in their source,
//! for playback entering the arrangement at a given position.
//!
//! This is pure arithmetic over the track model so the live session and the
//! offline renderer place voices identically.

use studio_transport::{AudioClip, ClipId, Track, TrackId};

/// How solo flags affect audibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoloPolicy {
    /// Live monitoring: when any track is soloed, only soloed tracks sound.
    Monitor,
    /// Export: solo is a monitoring aid and is ignored.
    Ignore,
}

/// Effective mute decision for one track.
///
/// A muted track is always silent, even when soloed. When `any_solo` is set,
/// tracks without solo are suppressed without touching their stored flag.
pub fn track_is_audible(track: &Track, any_solo: bool) -> bool {
    !track.muted && (!any_solo || track.solo)
}

pub fn any_solo(tracks: &[Track]) -> bool {
    tracks.iter().any(|track| track.solo)
}

/// One voice to instantiate, in arrangement seconds relative to the entry
/// position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoicePlan {
    pub track: TrackId,
    pub clip: ClipId,
    /// Seconds from the moment playback starts until the voice sounds.
    pub delay: f64,
    /// Position in the source buffer to start reading from.
    pub source_offset: f64,
    /// How long the voice sounds before terminating on its own.
    pub length: f64,
}

/// Place one clip for playback entering the timeline at `from`.
///
/// Clips that end at or before `from` produce nothing. A clip already under
/// way at `from` starts immediately, reading from the point the transport
/// would have reached, and sounds only for what is left of it.
pub fn plan_clip(track: TrackId, clip: &AudioClip, from: f64) -> Option<VoicePlan> {
    if !clip.sounds_after(from) {
        return None;
    }

    if clip.start_time >= from {
        Some(VoicePlan {
            track,
            clip: clip.id,
            delay: clip.start_time - from,
            source_offset: clip.offset,
            length: clip.duration,
        })
    } else {
        let elapsed = from - clip.start_time;
        Some(VoicePlan {
            track,
            clip: clip.id,
            delay: 0.0,
            source_offset: clip.offset + elapsed,
            length: clip.duration - elapsed,
        })
    }
}

pub fn plan_track(track: &Track, from: f64) -> impl Iterator<Item = VoicePlan> + '_ {
    track
        .clips()
        .iter()
        .filter_map(move |clip| plan_clip(track.id, clip, from))
}

/// Tracks that get a stage for a session entered under `policy`.
pub fn audible_tracks(tracks: &[Track], policy: SoloPolicy) -> impl Iterator<Item = &Track> {
    let any_solo = policy == SoloPolicy::Monitor && any_solo(tracks);
    tracks
        .iter()
        .filter(move |track| track_is_audible(track, any_solo))
}

/// Every voice for every audible track, for playback entering at `from`.
pub fn plan_voices(tracks: &[Track], from: f64, policy: SoloPolicy) -> Vec<VoicePlan> {
    let from = from.max(0.0);
    audible_tracks(tracks, policy)
        .flat_map(|track| plan_track(track, from))
        .collect()
}
