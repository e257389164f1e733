//! Error types and handling
//!
//! Common error type aggregating the per-module errors of the crate.

use crate::commands::remote::CommandError;
use crate::config::ConfigError;
use crate::export::ExportError;
use crate::peer::PeerError;
use crate::recorder::encoder::EncoderError;
use crate::recorder::state::RecorderError;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecorderError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

impl AppError {
    /// Stable machine-readable code, used in log fields
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Recording(_) => "RECORDING_ERROR",
            AppError::Encoder(_) => "ENCODER_ERROR",
            AppError::Export(_) => "EXPORT_ERROR",
            AppError::Peer(_) => "PEER_ERROR",
            AppError::Command(_) => "COMMAND_ERROR",
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_source() {
        let err: AppError = RecorderError::NotRecording.into();
        assert_eq!(err.code(), "RECORDING_ERROR");

        let err: AppError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(err.to_string().contains("boom"));
    }
}
