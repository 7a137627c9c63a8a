pub mod clock;
pub mod config;
pub mod display;
pub mod error;
pub mod playback;
pub mod session;

pub use clock::{ManualTime, TimeSource, TransportClock};
pub use config::StudioConfig;
pub use display::{DisplayFrame, DisplayLoop};
pub use error::SessionError;
pub use playback::{PlaybackSession, StageHandle, VoicePlacement};
pub use session::{Session, TransportState};

pub use studio_decode::{ClipBufferStore, DecodeError, SourceDecoder, decode_source};
pub use studio_engine::{
    AudioEngineHandle, CaptureBlob, CaptureError, CpalInput, DirectBackend, MixBackend, Recorder,
    SessionGeneration, SoloPolicy,
};
pub use studio_project::{
    AiAction, AiClient, AiRequest, AiResponse, ArrangementDoc, DirectoryStore, ProjectError,
    ProjectStore, ProjectSummary,
};
pub use studio_render::{EXPORT_CHANNELS, EXPORT_SAMPLE_RATE, ExportError, OfflineRenderer};
pub use studio_transport::{
    AudioArc, AudioClip, ClipId, SourceRef, Track, TrackId, WaveformSummary, arrangement_end,
};
