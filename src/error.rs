use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Frame extraction error: {0}")]
    Extraction(String),

    #[error("Transient inference error: {0}")]
    InferenceTransient(String),

    #[error("Unparseable inference response: {0}")]
    InferenceParse(String),

    #[error("Event store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
