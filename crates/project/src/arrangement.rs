use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use studio_transport::{AudioClip, ClipId, SourceRef, Track, TrackId};

use crate::ProjectError;

/// A saved arrangement: tracks, their mix settings and file-backed clips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrangementDoc {
    pub id: String,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub updated_at: u64,
    pub tracks: Vec<TrackDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDoc {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub color: String,
    pub volume: f32,
    pub pan: f32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub solo: bool,
    #[serde(default)]
    pub armed: bool,
    pub clips: Vec<ClipDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipDoc {
    pub id: u64,
    pub name: String,
    pub source: PathBuf,
    pub start_time: f64,
    pub duration: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub color: String,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl ArrangementDoc {
    /// Snapshot `tracks` into a document stamped with the current time.
    ///
    /// Clips backed by in-memory bytes have no path to point at and are left out.
    pub fn from_tracks(id: impl Into<String>, name: impl Into<String>, tracks: &[Track]) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            updated_at: now_millis(),
            tracks: tracks.iter().map(TrackDoc::from_track).collect(),
        }
    }

    pub fn into_tracks(self) -> Vec<Track> {
        self.tracks.into_iter().map(TrackDoc::into_track).collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProjectError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse JSON, falling back to MessagePack.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProjectError> {
        serde_json::from_slice(bytes)
            .or_else(|_| rmp_serde::decode::from_slice(bytes).map_err(ProjectError::from))
    }

    pub fn save(&self, path: &Path) -> Result<(), ProjectError> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        // Try JSON first, fall back to MessagePack
        serde_json::from_reader(reader).or_else(|_| {
            let file = File::open(path)?;
            let reader = BufReader::new(file);
            rmp_serde::decode::from_read(reader).map_err(ProjectError::from)
        })
    }
}

impl TrackDoc {
    fn from_track(track: &Track) -> Self {
        Self {
            id: track.id.0,
            name: track.name.clone(),
            color: track.color.clone(),
            volume: track.volume,
            pan: track.pan,
            muted: track.muted,
            solo: track.solo,
            armed: track.armed,
            clips: track
                .clips()
                .iter()
                .filter_map(|clip| match &clip.source {
                    SourceRef::File(path) => Some(ClipDoc {
                        id: clip.id.0,
                        name: clip.name.clone(),
                        source: path.clone(),
                        start_time: clip.start_time,
                        duration: clip.duration,
                        offset: clip.offset,
                        color: clip.color.clone(),
                    }),
                    SourceRef::Memory { .. } => {
                        log::debug!("{} has no file behind it and is not saved", clip.id);
                        None
                    }
                })
                .collect(),
        }
    }

    fn into_track(self) -> Track {
        let clips = self
            .clips
            .into_iter()
            .map(|doc| {
                let mut clip = AudioClip::new(
                    ClipId(doc.id),
                    SourceRef::File(doc.source),
                    doc.start_time,
                    doc.duration,
                    doc.offset,
                )
                .with_name(doc.name);
                clip.color = doc.color;
                clip
            })
            .collect();

        let mut track = Track::from_clips(TrackId(self.id), self.name, clips);
        track.color = self.color;
        track.set_volume(self.volume);
        track.set_pan(self.pan);
        track.muted = self.muted;
        track.solo = self.solo;
        track.armed = self.armed;
        track
    }
}
