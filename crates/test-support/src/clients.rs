use sinks::clients::{
    BatchSendOutcome, BoundStatement, EmbeddingClient, FailedEntry, ObjectStore, QueueClient,
    QueueEntry, TableWriter, VectorIndex, VectorUpsert,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use streams::{Error, Result};

fn take_scripted_failure(fail_next: &AtomicU32, what: &'static str) -> Result<()> {
    let remaining = fail_next.load(Ordering::SeqCst);
    if remaining > 0 {
        fail_next.store(remaining - 1, Ordering::SeqCst);
        return Err(Error::transient(what, "scripted failure"));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<Vec<(String, String, Vec<u8>)>>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` puts with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn objects(&self) -> Vec<(String, String, Vec<u8>)> {
        self.objects.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, body: bytes::Bytes) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        take_scripted_failure(&self.fail_next, "object-store put")?;
        self.objects
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string(), body.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTableWriter {
    statements: Mutex<Vec<BoundStatement>>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryTableWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<BoundStatement> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TableWriter for MemoryTableWriter {
    async fn execute(&self, statement: &BoundStatement) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        take_scripted_failure(&self.fail_next, "table write")?;
        self.statements.lock().unwrap().push(statement.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryVectorIndex {
    puts: Mutex<Vec<(String, String, Vec<VectorUpsert>)>>,
    fail_next: AtomicU32,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn puts(&self) -> Vec<(String, String, Vec<VectorUpsert>)> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn put_vectors(
        &self,
        bucket: &str,
        index: &str,
        vectors: &[VectorUpsert],
    ) -> Result<()> {
        take_scripted_failure(&self.fail_next, "vector put")?;
        self.puts.lock().unwrap().push((
            bucket.to_string(),
            index.to_string(),
            vectors.to_vec(),
        ));
        Ok(())
    }
}

/// Embeds every text as a constant vector of the requested width.
pub struct FixedEmbedder;

#[async_trait::async_trait]
impl EmbeddingClient for FixedEmbedder {
    async fn embed(&self, _model: &str, _text: &str, dimensions: usize) -> Result<Vec<f32>> {
        Ok(vec![0.5; dimensions])
    }
}

#[derive(Default)]
pub struct MemoryQueue {
    sends: Mutex<Vec<(String, Vec<QueueEntry>)>>,
    fail_entries: Mutex<Option<(String, String, String)>>,
    fail_next_send: AtomicU32,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report per-entry failure for every entry whose id contains
    /// `id_fragment`.
    pub fn fail_entries_containing(&self, id_fragment: &str, code: &str, message: &str) {
        *self.fail_entries.lock().unwrap() = Some((
            id_fragment.to_string(),
            code.to_string(),
            message.to_string(),
        ));
    }

    /// Fail the next `n` whole sends with a transient error.
    pub fn fail_next_send(&self, n: u32) {
        self.fail_next_send.store(n, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<(String, Vec<QueueEntry>)> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl QueueClient for MemoryQueue {
    async fn send_batch(
        &self,
        queue_address: &str,
        entries: Vec<QueueEntry>,
    ) -> Result<BatchSendOutcome> {
        take_scripted_failure(&self.fail_next_send, "queue publish")?;
        self.sends
            .lock()
            .unwrap()
            .push((queue_address.to_string(), entries.clone()));

        let mut outcome = BatchSendOutcome::default();
        let scripted = self.fail_entries.lock().unwrap().clone();
        for entry in entries {
            match &scripted {
                Some((fragment, code, message)) if entry.id.contains(fragment) => {
                    outcome.failed.push(FailedEntry {
                        id: entry.id,
                        code: code.clone(),
                        message: message.clone(),
                    });
                }
                _ => outcome.successful.push(entry.id),
            }
        }
        Ok(outcome)
    }
}
