use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown participant {0}")]
    UnknownParticipant(String),
    #[error("unknown parent {0}")]
    UnknownParent(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("self-parent index mismatch for event {0}")]
    SelfParentIndexMismatch(String),
    #[error("index {0} is below the cache window")]
    TooLate(i64),
    #[error("nothing past the requested index")]
    Empty,
    #[error("index {0} skips ahead of the cache window")]
    SkippedIndex(i64),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("proxy did not respond in time")]
    ProxyTimeout,
    #[error("shutting down")]
    Shutdown,

    #[error("{0}")]
    Serde(#[from] bincode::Error),
}

impl Error {
    /// An empty window read is a normal result for callers that only want
    /// "whatever is newer".
    pub fn is_empty(&self) -> bool {
        matches!(self, Error::Empty)
    }
}
