//! Request/response shapes for the remote audio-processing service.
//!
//! The service itself is out of process; [`AiDispatcher`] is the seam where a
//! transport (HTTP, a queue, a test double) plugs in.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiAction {
    CleanVocals,
    IsolateVocals,
    GenerateBeat,
    AutoMix,
    Master,
}

impl AiAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AiAction::CleanVocals => "clean_vocals",
            AiAction::IsolateVocals => "isolate_vocals",
            AiAction::GenerateBeat => "generate_beat",
            AiAction::AutoMix => "auto_mix",
            AiAction::Master => "master",
        }
    }
}

impl std::fmt::Display for AiAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body sent to the service: the action plus its parameters, flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequest {
    pub action: AiAction,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl AiRequest {
    pub fn new(action: AiAction) -> Self {
        Self {
            action,
            payload: Map::new(),
        }
    }

    /// Add a parameter. `None` values are left out entirely.
    pub fn with(mut self, key: &str, value: Option<impl Into<Value>>) -> Self {
        if let Some(value) = value {
            self.payload.insert(key.to_string(), value.into());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub success: bool,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AiResponse {
    pub fn failure(action: AiAction, error: impl Into<String>) -> Self {
        Self {
            success: false,
            action: action.as_str().to_string(),
            message: None,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AiError {
    #[error("{0}")]
    Transport(String),
}

pub trait AiDispatcher: Send + Sync {
    fn dispatch(&self, request: AiRequest) -> impl Future<Output = Result<AiResponse, AiError>> + Send;
}

/// Typed entry points for each action. Transport failures never escape; they
/// come back as a response with `success: false`.
#[derive(Debug, Clone)]
pub struct AiClient<D> {
    dispatcher: D,
}

impl<D: AiDispatcher> AiClient<D> {
    pub fn new(dispatcher: D) -> Self {
        Self { dispatcher }
    }

    async fn call(&self, request: AiRequest) -> AiResponse {
        let action = request.action;
        match self.dispatcher.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("{action} failed: {err}");
                AiResponse::failure(action, err.to_string())
            }
        }
    }

    pub async fn clean_vocals(&self, audio_url: Option<&str>) -> AiResponse {
        self.call(AiRequest::new(AiAction::CleanVocals).with("audioUrl", audio_url))
            .await
    }

    pub async fn isolate_vocals(&self, audio_url: Option<&str>) -> AiResponse {
        self.call(AiRequest::new(AiAction::IsolateVocals).with("audioUrl", audio_url))
            .await
    }

    pub async fn generate_beat(&self, genre: &str, bpm: Option<u32>, key: Option<&str>) -> AiResponse {
        let request = AiRequest::new(AiAction::GenerateBeat)
            .with("genre", Some(genre))
            .with("bpm", bpm)
            .with("key", key);
        self.call(request).await
    }

    pub async fn auto_mix(&self) -> AiResponse {
        self.call(AiRequest::new(AiAction::AutoMix)).await
    }

    pub async fn master(&self, preset: &str) -> AiResponse {
        self.call(AiRequest::new(AiAction::Master).with("preset", Some(preset)))
            .await
    }
}
