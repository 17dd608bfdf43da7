//! Filesystem-backed sink clients for local development. Cloud clients
//! implement the same traits out of tree; these keep the binary runnable
//! end-to-end without credentials.

use crate::clients::{
    BatchSendOutcome, BoundStatement, EmbeddingClient, ObjectStore, QueueClient, QueueEntry,
    TableWriter, VectorIndex, VectorUpsert,
};
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use streams::Result;
use tokio::io::AsyncWriteExt;

/// Objects become files under `<root>/<bucket>/<key>`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, body: bytes::Bytes) -> Result<()> {
        let path = self.root.join(bucket).join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &body).await?;
        tracing::debug!(path = %path.display(), bytes = body.len(), "stored object");
        Ok(())
    }
}

/// Appends one JSON line per write to a journal file.
pub struct JsonlWriter {
    path: PathBuf,
    guard: tokio::sync::Mutex<()>,
}

impl JsonlWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    async fn append(&self, line: &serde_json::Value) -> Result<()> {
        let _guard = self.guard.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TableWriter for JsonlWriter {
    async fn execute(&self, statement: &BoundStatement) -> Result<()> {
        let bindings: serde_json::Map<String, serde_json::Value> = statement
            .bindings
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        self.append(&serde_json::json!({
            "kind": format!("{:?}", statement.kind).to_ascii_lowercase(),
            "table": statement.table,
            "bindings": bindings,
        }))
        .await
    }
}

#[async_trait::async_trait]
impl VectorIndex for JsonlWriter {
    async fn put_vectors(
        &self,
        bucket: &str,
        index: &str,
        vectors: &[VectorUpsert],
    ) -> Result<()> {
        for vector in vectors {
            self.append(&serde_json::json!({
                "bucket": bucket,
                "index": index,
                "key": vector.key,
                "vector": vector.vector,
                "metadata": vector.metadata,
            }))
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueClient for JsonlWriter {
    async fn send_batch(
        &self,
        queue_address: &str,
        entries: Vec<QueueEntry>,
    ) -> Result<BatchSendOutcome> {
        let mut outcome = BatchSendOutcome::default();
        for entry in entries {
            self.append(&serde_json::json!({
                "queue": queue_address,
                "id": entry.id,
                "delaySeconds": entry.delay_seconds,
                "body": serde_json::from_str::<serde_json::Value>(&entry.body)?,
            }))
            .await?;
            outcome.successful.push(entry.id);
        }
        Ok(outcome)
    }
}

/// Deterministic stand-in for a hosted embedding model: the vector is
/// seeded from the text, so equal inputs embed equally.
pub struct HashEmbedder;

#[async_trait::async_trait]
impl EmbeddingClient for HashEmbedder {
    async fn embed(&self, _model: &str, text: &str, dimensions: usize) -> Result<Vec<f32>> {
        let mut seed = 0xcbf2_9ce4_8422_2325u64;
        for byte in text.bytes() {
            seed ^= byte as u64;
            seed = seed.wrapping_mul(0x1000_0000_01b3);
        }
        let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
        Ok((0..dimensions).map(|_| rng.gen_range(-1.0..1.0)).collect())
    }
}
