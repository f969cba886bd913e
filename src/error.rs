use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Media graph error: {0}")]
    Graph(String),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Display error: {0}")]
    Display(String),

    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error("Another instance is already running: {0}")]
    AlreadyRunning(String),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;
