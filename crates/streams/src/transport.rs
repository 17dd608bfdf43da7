use crate::{Checkpoint, Result, Shard, StreamRecord};

/// One CDC stream of a `(keyspace, table)` pair, as enumerated by the
/// transport. Streams carry an optional human label used for selection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamLabel {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// An ordered batch of records pulled from a shard iterator.
#[derive(Debug, Clone)]
pub struct ShardPage {
    pub records: Vec<StreamRecord>,
    /// The position to resume from after consuming this page. Unchanged from
    /// the request position when the page is empty.
    pub next_checkpoint: Checkpoint,
    /// Set once the shard is fully consumed; child shards may then be drained.
    pub end_of_shard: bool,
}

/// A positioned reader over one shard. Records are yielded in stream order;
/// calls may fail with transient (retryable) or permanent errors.
#[async_trait::async_trait]
pub trait ShardIterator: Send {
    async fn next(&mut self) -> Result<ShardPage>;
}

/// The abstract CDC transport consumed by the coordinator and processors.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync {
    /// Enumerate the CDC streams of a table, oldest first.
    async fn list_streams(&self, keyspace: &str, table: &str) -> Result<Vec<StreamLabel>>;

    /// Enumerate the stream's shards with parent/child relationships.
    async fn list_shards(&self, stream_id: &str) -> Result<Vec<Shard>>;

    /// Open an iterator positioned just past `from`.
    async fn open_iterator(
        &self,
        stream_id: &str,
        shard_id: &str,
        from: &Checkpoint,
    ) -> Result<Box<dyn ShardIterator>>;
}
