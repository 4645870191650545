use thiserror::Error;

/// Errors that can occur in convrec-core.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A required vocabulary key is absent.
    #[error("missing required vocabulary key: {0}")]
    MissingVocabKey(&'static str),
    /// A graph references a node outside its node range.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    /// A record lacks the supervised target a batch kind needs.
    #[error("record {index} has no {field} target")]
    MissingTarget { index: usize, field: &'static str },
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for convrec-core.
pub type Result<T> = std::result::Result<T, Error>;
