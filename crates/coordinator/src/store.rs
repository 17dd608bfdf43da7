use crate::Lease;
use std::path::PathBuf;
use streams::{Error, Result};

/// Outcome of a conditional store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    Conflict,
}

/// The durable coordination store: a conditional key-value surface over
/// lease documents. Single-writer semantics per lease row are enforced by
/// compare-and-swap on the lease counter.
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, shard_id: &str) -> Result<Option<Lease>>;

    /// Create the lease unless a row for its shard already exists.
    async fn put_if_absent(&self, lease: &Lease) -> Result<CasOutcome>;

    /// Replace the row if its current counter equals `expected_counter`.
    /// `lease.counter` must already carry the incremented version.
    async fn update_if(&self, lease: &Lease, expected_counter: u64) -> Result<CasOutcome>;

    async fn delete_if(&self, shard_id: &str, expected_counter: u64) -> Result<CasOutcome>;

    async fn scan(&self) -> Result<Vec<Lease>>;
}

/// Lease rows as JSON documents under a directory, with a process-wide
/// mutex providing the conditional semantics. Suitable for the local
/// single-process transport; multi-worker deployments use a shared
/// conditional store behind the same trait.
pub struct FsLeaseStore {
    root: PathBuf,
    guard: tokio::sync::Mutex<()>,
}

impl FsLeaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    fn path(&self, shard_id: &str) -> PathBuf {
        self.root.join(format!("{shard_id}.json"))
    }

    fn read(&self, shard_id: &str) -> Result<Option<Lease>> {
        match std::fs::read_to_string(self.path(shard_id)) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::transient("lease store read", err)),
        }
    }

    fn write(&self, lease: &Lease) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|err| Error::transient("lease store write", err))?;
        let raw = serde_json::to_vec(lease)?;
        std::fs::write(self.path(&lease.shard_id), raw)
            .map_err(|err| Error::transient("lease store write", err))
    }
}

#[async_trait::async_trait]
impl LeaseStore for FsLeaseStore {
    async fn get(&self, shard_id: &str) -> Result<Option<Lease>> {
        let _guard = self.guard.lock().await;
        self.read(shard_id)
    }

    async fn put_if_absent(&self, lease: &Lease) -> Result<CasOutcome> {
        let _guard = self.guard.lock().await;
        if self.read(&lease.shard_id)?.is_some() {
            return Ok(CasOutcome::Conflict);
        }
        self.write(lease)?;
        Ok(CasOutcome::Applied)
    }

    async fn update_if(&self, lease: &Lease, expected_counter: u64) -> Result<CasOutcome> {
        let _guard = self.guard.lock().await;
        match self.read(&lease.shard_id)? {
            Some(current) if current.counter == expected_counter => {
                self.write(lease)?;
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn delete_if(&self, shard_id: &str, expected_counter: u64) -> Result<CasOutcome> {
        let _guard = self.guard.lock().await;
        match self.read(shard_id)? {
            Some(current) if current.counter == expected_counter => {
                std::fs::remove_file(self.path(shard_id))
                    .map_err(|err| Error::transient("lease store delete", err))?;
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn scan(&self) -> Result<Vec<Lease>> {
        let _guard = self.guard.lock().await;
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::transient("lease store scan", err)),
        };

        let mut leases = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::transient("lease store scan", err))?;
            if entry.path().extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(entry.path())
                .map_err(|err| Error::transient("lease store scan", err))?;
            leases.push(serde_json::from_str(&raw)?);
        }
        leases.sort_by(|a: &Lease, b: &Lease| a.shard_id.cmp(&b.shard_id));
        Ok(leases)
    }
}
