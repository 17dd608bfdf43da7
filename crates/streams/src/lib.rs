pub mod cell;
pub mod local;
pub mod record;
pub mod shard;
pub mod transport;

pub use cell::{CellValue, TypedCell};
pub use record::{ChangeRecord, Checkpoint, OperationType, Origin, SequenceNumber, StreamRecord};
pub use shard::{HashRange, Shard};
pub use transport::{ShardIterator, ShardPage, StreamLabel, StreamTransport};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The single error taxonomy shared by every component of the connector.
/// The per-shard processor pattern-matches on this set to decide whether a
/// failure is record-, batch-, shard-, or process-fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("transient failure during {op}: {message}")]
    Transient { op: &'static str, message: String },
    #[error("{failed} of {total} records failed delivery: {}", messages.join("; "))]
    PartialFailure {
        total: usize,
        failed: usize,
        messages: Vec<String>,
    },
    #[error("all {total} records failed delivery: {}", messages.join("; "))]
    TotalFailure { total: usize, messages: Vec<String> },
    #[error("lease is no longer held by this worker")]
    LeaseLost,
    #[error("shard reached its end")]
    ShardEnded,
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl Error {
    pub fn transient(op: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Transient {
            op,
            message: message.to_string(),
        }
    }

    /// Transient errors are the only ones the retry harness will re-attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Fatal(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(anyhow::Error::new(err))
    }
}
