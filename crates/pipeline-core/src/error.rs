use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for a pipeline run.
///
/// Configuration errors are raised before any stage touches the filesystem.
/// Stage errors abort the whole run with the original diagnostic; outputs of
/// already-completed stages stay on disk. Per-sample failures never become a
/// `PipelineError`; adapters recover from them locally and count them in
/// their stage summary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("source directory not found: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("required external tool not available: {tool} ({hint})")]
    MissingTool { tool: String, hint: String },

    #[error("{stage} stage failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },

    #[error("feature export failed: {message}")]
    Export { message: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn missing_tool<S: Into<String>>(tool: S, hint: S) -> Self {
        Self::MissingTool {
            tool: tool.into(),
            hint: hint.into(),
        }
    }

    pub fn stage<S: Into<String>>(stage: &'static str, message: S) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
        }
    }

    pub fn export<S: Into<String>>(message: S) -> Self {
        Self::Export {
            message: message.into(),
        }
    }

    /// True for errors that must be reported before execution starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::SourceNotFound { .. }
        )
    }
}
