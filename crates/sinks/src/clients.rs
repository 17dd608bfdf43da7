//! Abstract sink transports and the process-wide client registry.
//!
//! Concrete cloud clients live outside this repository; they implement
//! these traits and are installed into the [`ClientRegistry`] by the
//! embedding binary. Clients are constructed lazily exactly once and
//! shared by every shard processor.

use futures::future::BoxFuture;
use std::sync::Arc;
use streams::{CellValue, Error, Result};

/// Object storage: durable `put` of an immutable object.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, body: bytes::Bytes) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Upsert,
    Delete,
}

/// A parameterized write against the materialized secondary table.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub kind: StatementKind,
    pub table: String,
    /// Named bind variables in column order.
    pub bindings: Vec<(String, CellValue)>,
}

#[async_trait::async_trait]
pub trait TableWriter: Send + Sync {
    async fn execute(&self, statement: &BoundStatement) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorUpsert {
    pub key: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    async fn put_vectors(&self, bucket: &str, index: &str, vectors: &[VectorUpsert])
        -> Result<()>;
}

#[async_trait::async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed `text` into exactly `dimensions` floats.
    async fn embed(&self, model: &str, text: &str, dimensions: usize) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: String,
    pub body: String,
    pub delay_seconds: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedEntry {
    pub id: String,
    pub code: String,
    pub message: String,
}

/// Per-entry outcome of one transport batch publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSendOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<FailedEntry>,
}

#[async_trait::async_trait]
pub trait QueueClient: Send + Sync {
    async fn send_batch(
        &self,
        queue_address: &str,
        entries: Vec<QueueEntry>,
    ) -> Result<BatchSendOutcome>;
}

type Init<T> = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync>;

/// One lazily-constructed shared client. The `OnceCell` is the
/// initialization latch: concurrent shards race to initialize and all end
/// up sharing the single constructed client.
struct Lazy<T: ?Sized + Send + Sync> {
    cell: tokio::sync::OnceCell<Arc<T>>,
    init: Init<T>,
}

impl<T: ?Sized + Send + Sync> Lazy<T> {
    fn deferred(init: Init<T>) -> Self {
        Self {
            cell: tokio::sync::OnceCell::new(),
            init,
        }
    }

    fn ready(client: Arc<T>) -> Self {
        Self {
            cell: tokio::sync::OnceCell::new_with(Some(client)),
            init: Box::new(|| unreachable!("client is pre-initialized")),
        }
    }

    async fn get(&self) -> Result<Arc<T>> {
        self.cell
            .get_or_try_init(|| (self.init)())
            .await
            .cloned()
    }
}

/// The registry of sink clients owned by the scheduler and handed to each
/// mapper at construction.
#[derive(Default)]
pub struct ClientRegistry {
    object_store: Option<Lazy<dyn ObjectStore>>,
    table_writer: Option<Lazy<dyn TableWriter>>,
    vector_index: Option<Lazy<dyn VectorIndex>>,
    embedding: Option<Lazy<dyn EmbeddingClient>>,
    queue: Option<Lazy<dyn QueueClient>>,
}

macro_rules! client_accessors {
    ($field:ident, $with:ident, $with_deferred:ident, $trait:ident, $label:literal) => {
        pub fn $with(mut self, client: Arc<dyn $trait>) -> Self {
            self.$field = Some(Lazy::ready(client));
            self
        }

        pub fn $with_deferred<F>(mut self, init: F) -> Self
        where
            F: Fn() -> BoxFuture<'static, Result<Arc<dyn $trait>>> + Send + Sync + 'static,
        {
            self.$field = Some(Lazy::deferred(Box::new(init)));
            self
        }

        pub async fn $field(&self) -> Result<Arc<dyn $trait>> {
            match &self.$field {
                Some(lazy) => lazy.get().await,
                None => Err(Error::Config(format!(
                    "no {} client is registered",
                    $label
                ))),
            }
        }
    };
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    client_accessors!(
        object_store,
        with_object_store,
        with_deferred_object_store,
        ObjectStore,
        "object-store"
    );
    client_accessors!(
        table_writer,
        with_table_writer,
        with_deferred_table_writer,
        TableWriter,
        "table-writer"
    );
    client_accessors!(
        vector_index,
        with_vector_index,
        with_deferred_vector_index,
        VectorIndex,
        "vector-index"
    );
    client_accessors!(
        embedding,
        with_embedding,
        with_deferred_embedding,
        EmbeddingClient,
        "embedding-model"
    );
    client_accessors!(queue, with_queue, with_deferred_queue, QueueClient, "queue");
}
