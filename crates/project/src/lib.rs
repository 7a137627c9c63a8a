mod ai;
mod arrangement;
mod store;

use std::path::PathBuf;

pub use ai::{AiAction, AiClient, AiDispatcher, AiError, AiRequest, AiResponse};
pub use arrangement::{ArrangementDoc, ClipDoc, TrackDoc};
pub use store::{DirectoryStore, PROJECT_EXTENSION, ProjectStore, ProjectSummary};

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),

    #[error("Invalid project id '{0}'")]
    InvalidId(String),

    #[error("Project file '{path}' is unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}
