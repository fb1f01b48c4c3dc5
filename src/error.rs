use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Audio error: {0}")]
    Audio(#[from] crate::audio::AudioError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session is not connected")]
    NotConnected,

    #[error("A result was already sent for tool call {0}")]
    DuplicateResult(String),

    #[error("Session task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// Fatal errors end the session in `Error` without consulting the reconnection policy.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Audio(_) | SessionError::Config(_) => true,
            SessionError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}
