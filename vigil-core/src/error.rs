use thiserror::Error;

use crate::session::ConnectionId;

/// All errors produced by vigil-core.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("audio decode error: {0}")]
    AudioDecode(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("transcription model not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("speech engine is not ready: {0}")]
    EngineNotReady(String),

    #[error("classifier returned HTTP {status}")]
    ClassifierStatus { status: u16 },

    #[error("classifier transport error: {0}")]
    ClassifierTransport(String),

    #[error("classifier response could not be decoded: {0}")]
    ClassifierDecode(String),

    #[error("classifier did not answer within {timeout_ms} ms")]
    ClassifierTimeout { timeout_ms: u64 },

    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    #[error("telemetry sink error: {0}")]
    Telemetry(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_registered_names_the_connection() {
        let err = VigilError::AlreadyRegistered(ConnectionId::new(42));
        assert_eq!(err.to_string(), "connection conn-42 is already registered");
    }

    #[test]
    fn timeout_reports_budget() {
        let err = VigilError::ClassifierTimeout { timeout_ms: 2000 };
        assert!(err.to_string().contains("2000 ms"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "stats.csv");
        let err: VigilError = io.into();
        assert!(matches!(err, VigilError::Io(_)));
    }
}
