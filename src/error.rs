use thiserror::Error;

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// Control-plane errors surfaced to callers of mutating operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state for {subject}: {reason}")]
    InvalidState { subject: String, reason: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("persistent failure after {attempts} attempts: {reason}")]
    PersistentFailure { attempts: u32, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ControlError {
    pub(crate) fn invalid_state(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

/// Errors reported by a sandbox runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("sandbox {name} already exists")]
    ResourceConflict { name: String },

    #[error("sandbox {id} not found")]
    NotFound { id: String },

    #[error("sandbox {id} is in the wrong state: {reason}")]
    InvalidState { id: String, reason: String },

    #[error("runtime transport error: {0}")]
    Transport(String),
}

impl RuntimeError {
    /// Whether repeating the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(err))
    }
}

impl Error {
    /// The control-plane classification of this error, if it has one.
    #[must_use]
    pub fn as_control(&self) -> Option<&ControlError> {
        match self {
            Error::Control(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(RuntimeError::Transport("reset".into()).is_transient());
        assert!(!RuntimeError::ResourceConflict { name: "a".into() }.is_transient());
        assert!(!RuntimeError::NotFound { id: "a".into() }.is_transient());
    }

    #[test]
    fn control_error_display() {
        let err = ControlError::invalid_state("bot1", "not running");
        assert_eq!(err.to_string(), "invalid state for bot1: not running");

        let err = ControlError::PersistentFailure {
            attempts: 3,
            reason: "disk full".into(),
        };
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn as_control_unwraps_control_variant() {
        let err: Error = ControlError::NotFound("bot1".into()).into();
        assert_eq!(
            err.as_control(),
            Some(&ControlError::NotFound("bot1".into()))
        );

        let err: Error = ConfigError::MissingField { field: "url" }.into();
        assert!(err.as_control().is_none());
    }
}
