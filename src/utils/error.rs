// src/utils/error.rs
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

use crate::api::types::ApiResult;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("plugin {0} does not exist")]
    NotFound(String),

    #[error("plugin {0} is not running")]
    NotRunning(String),

    #[error("plugin {id} is unreachable: {reason}")]
    Unreachable { id: String, reason: String },

    #[error("{0}")]
    Timeout(String),

    #[error("stop plugin {0} failed")]
    StopFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Upstream API error: {0}")]
    Upstream(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn unreachable(id: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::Unreachable {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// Envelope code reported to gateway clients. `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            AgentError::NotFound(_) => 1,
            AgentError::Config(_)
            | AgentError::Manifest(_)
            | AgentError::Upstream(_)
            | AgentError::Launch(_)
            | AgentError::Io(_) => 3,
            AgentError::NotRunning(_) => 4,
            AgentError::Unreachable { .. } => 5,
            AgentError::Timeout(_) => 6,
            AgentError::StopFailed(_) => 7,
            AgentError::DownloadFailed(_) => 8,
            AgentError::InstallFailed(_) => 9,
            AgentError::Unauthorized => 10,
        }
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, AgentError::NotRunning(_))
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(error: config::ConfigError) -> Self {
        AgentError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(error: serde_json::Error) -> Self {
        AgentError::Manifest(error.to_string())
    }
}

impl From<zip::result::ZipError> for AgentError {
    fn from(error: zip::result::ZipError) -> Self {
        AgentError::InstallFailed(error.to_string())
    }
}

impl ResponseError for AgentError {
    fn status_code(&self) -> StatusCode {
        match self {
            AgentError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::OK,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ApiResult::<()>::error(self))
    }
}
