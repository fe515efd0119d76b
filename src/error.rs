//! Error types for the screenshot pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while turning example scripts into screenshots
#[derive(Error, Debug)]
pub enum Error {
    /// The entry point returned something other than the registry snapshot
    #[error("{}: main() must return get_saved_models(), got {found}", path.display())]
    InvalidReturnError { path: PathBuf, found: String },

    /// The example script threw (or could not be run at all)
    #[error("{}: script execution failed: {cause}", path.display())]
    ScriptExecutionError { path: PathBuf, cause: String },

    /// The registered object exposes no recognized export capability
    #[error("model '{model}' could not be serialized: {reason}")]
    SerializationError { model: String, reason: String },

    /// The viewer never signalled render completion
    #[error("model '{model}' did not finish rendering within {timeout_ms}ms")]
    RenderTimeoutError { model: String, timeout_ms: u64 },

    /// The viewport could not be captured
    #[error("model '{model}' could not be captured: {reason}")]
    CaptureError { model: String, reason: String },

    /// Failed to start the browser or the viewer page
    #[error("Viewer initialization failed: {0}")]
    InitializationError(String),

    /// The viewer reported an error while rendering
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// File-level failures abort the current example file; everything else
    /// only aborts the model being processed.
    pub fn is_file_level(&self) -> bool {
        matches!(
            self,
            Error::InvalidReturnError { .. } | Error::ScriptExecutionError { .. }
        )
    }

    /// Short name of the error kind, used in the batch summary
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidReturnError { .. } => "InvalidReturnError",
            Error::ScriptExecutionError { .. } => "ScriptExecutionError",
            Error::SerializationError { .. } => "SerializationError",
            Error::RenderTimeoutError { .. } => "RenderTimeoutError",
            Error::CaptureError { .. } => "CaptureError",
            Error::InitializationError(_) => "InitializationError",
            Error::RenderError(_) => "RenderError",
            Error::ConfigError(_) => "ConfigError",
            Error::IoError(_) => "IoError",
            #[cfg(feature = "cdp")]
            Error::CdpError(_) => "CdpError",
            Error::Other(_) => "Error",
        }
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(err.to_string())
    }
}
