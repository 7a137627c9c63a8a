use std::path::PathBuf;
use std::sync::Arc;

use crate::waveform::WaveformSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

impl std::fmt::Display for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "clip#{}", self.0)
    }
}

/// Where a clip's audio comes from.
#[derive(Clone)]
pub enum SourceRef {
    /// A file on disk.
    File(PathBuf),
    /// Bytes already in memory (an upload, a capture blob). `hint` is a file
    /// extension used to pick a demuxer, e.g. `"wav"`.
    Memory {
        bytes: Arc<[u8]>,
        hint: Option<String>,
    },
}

impl SourceRef {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn memory(bytes: impl Into<Arc<[u8]>>, hint: Option<&str>) -> Self {
        Self::Memory {
            bytes: bytes.into(),
            hint: hint.map(str::to_owned),
        }
    }

    /// Extension used as a demuxer hint, if any.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::File(path) => path.extension().and_then(|e| e.to_str()),
            Self::Memory { hint, .. } => hint.as_deref(),
        }
    }
}

impl std::fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Memory { bytes, hint } => f
                .debug_struct("Memory")
                .field("len", &bytes.len())
                .field("hint", hint)
                .finish(),
        }
    }
}

/// A region of a source placed on the arrangement timeline. All times are in
/// arrangement seconds.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub id: ClipId,
    /// Display name for UI
    pub name: String,
    pub source: SourceRef,
    /// Where the clip begins sounding on the timeline.
    pub start_time: f64,
    /// Sounding length.
    pub duration: f64,
    /// Trim into the source buffer.
    pub offset: f64,
    pub color: String,
    pub waveform: Option<Arc<WaveformSummary>>,
}

impl AudioClip {
    /// Negative `start_time` and `offset` are clamped to 0, as is `duration`.
    pub fn new(id: ClipId, source: SourceRef, start_time: f64, duration: f64, offset: f64) -> Self {
        Self {
            id,
            name: format!("Clip {}", id.0),
            source,
            start_time: start_time.max(0.0),
            duration: duration.max(0.0),
            offset: offset.max(0.0),
            color: String::new(),
            waveform: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Whether `[start_time, end_time)` reaches past `position`.
    pub fn sounds_after(&self, position: f64) -> bool {
        self.duration > 0.0 && self.end_time() > position
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub color: String,
    /// Linear gain in `[0, 1]`.
    pub volume: f32,
    /// `-1.0` hard left, `1.0` hard right.
    pub pan: f32,
    pub muted: bool,
    pub solo: bool,
    pub armed: bool,
    /// Sorted by start_time. Overlaps are allowed; overlapping clips sum.
    clips: Vec<AudioClip>,
}

impl Track {
    pub fn new(id: TrackId, name: String) -> Self {
        Self {
            id,
            name,
            color: String::new(),
            volume: 1.0,
            pan: 0.0,
            muted: false,
            solo: false,
            armed: false,
            clips: Vec::new(),
        }
    }

    pub fn clips(&self) -> &[AudioClip] {
        &self.clips
    }

    pub fn clips_mut(&mut self) -> impl Iterator<Item = &mut AudioClip> {
        self.clips.iter_mut()
    }

    pub fn clear_clips(&mut self) {
        self.clips.clear();
    }

    /// Insert keeping start-time order. Clips starting at the same time keep
    /// their insertion order.
    pub fn insert_clip(&mut self, clip: AudioClip) {
        let index = self
            .clips
            .partition_point(|existing| existing.start_time <= clip.start_time);
        self.clips.insert(index, clip);
    }

    pub fn remove_clip(&mut self, id: ClipId) -> Option<AudioClip> {
        let index = self.clips.iter().position(|clip| clip.id == id)?;
        Some(self.clips.remove(index))
    }

    pub fn from_clips(id: TrackId, name: String, clips: Vec<AudioClip>) -> Self {
        let mut track = Self::new(id, name);
        for clip in clips {
            track.insert_clip(clip);
        }
        track
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
    }

    /// End of the last sounding clip, in arrangement seconds.
    pub fn end_time(&self) -> f64 {
        self.clips
            .iter()
            .map(AudioClip::end_time)
            .fold(0.0, f64::max)
    }
}

/// End of the arrangement: the latest clip end across all tracks.
pub fn arrangement_end(tracks: &[Track]) -> f64 {
    tracks.iter().map(Track::end_time).fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(id: u64, start: f64, duration: f64) -> AudioClip {
        AudioClip::new(ClipId(id), SourceRef::file("a.wav"), start, duration, 0.0)
    }

    #[test]
    fn test_negative_times_are_clamped() {
        let clip = AudioClip::new(ClipId(1), SourceRef::file("a.wav"), -2.0, 1.0, -0.5);
        assert_eq!(clip.start_time, 0.0);
        assert_eq!(clip.offset, 0.0);
    }

    #[test]
    fn test_insert_keeps_start_order() {
        let mut track = Track::new(TrackId(1), "Drums".to_string());
        track.insert_clip(clip(1, 4.0, 1.0));
        track.insert_clip(clip(2, 0.0, 1.0));
        track.insert_clip(clip(3, 2.0, 1.0));

        let ids: Vec<u64> = track.clips().iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_overlapping_clips_are_kept() {
        let track = Track::from_clips(
            TrackId(1),
            "Vox".to_string(),
            vec![clip(1, 0.0, 4.0), clip(2, 1.0, 4.0), clip(3, 1.0, 1.0)],
        );

        assert_eq!(track.clips().len(), 3);
        // Same start time keeps insertion order
        assert_eq!(track.clips()[1].id, ClipId(2));
        assert_eq!(track.clips()[2].id, ClipId(3));
    }

    #[test]
    fn test_remove_clip() {
        let mut track = Track::from_clips(TrackId(1), "T".to_string(), vec![clip(1, 0.0, 1.0)]);
        assert!(track.remove_clip(ClipId(1)).is_some());
        assert!(track.remove_clip(ClipId(1)).is_none());
        assert!(track.clips().is_empty());
    }

    #[test]
    fn test_parameter_clamping() {
        let mut track = Track::new(TrackId(1), "T".to_string());
        track.set_volume(1.5);
        track.set_pan(-3.0);
        assert_eq!(track.volume, 1.0);
        assert_eq!(track.pan, -1.0);
    }

    #[test]
    fn test_sounds_after_is_end_exclusive() {
        let clip = clip(1, 2.0, 3.0);
        assert!(clip.sounds_after(4.999));
        assert!(!clip.sounds_after(5.0));
        assert!(clip.sounds_after(0.0));
    }

    #[test]
    fn test_arrangement_end() {
        let tracks = vec![
            Track::from_clips(TrackId(1), "A".to_string(), vec![clip(1, 0.0, 2.0)]),
            Track::from_clips(TrackId(2), "B".to_string(), vec![clip(2, 3.0, 1.5)]),
        ];
        assert_eq!(arrangement_end(&tracks), 4.5);
        assert_eq!(arrangement_end(&[]), 0.0);
    }

    #[test]
    fn test_source_hint() {
        assert_eq!(SourceRef::file("kick.wav").hint(), Some("wav"));
        assert_eq!(SourceRef::memory(vec![1u8, 2, 3], Some("flac")).hint(), Some("flac"));
        assert_eq!(SourceRef::memory(Vec::<u8>::new(), None).hint(), None);
    }
}
