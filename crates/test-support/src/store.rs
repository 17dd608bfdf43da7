use coordinator::{CasOutcome, Lease, LeaseStore};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use streams::{Error, Result};

/// An in-memory conditional lease store shared by any number of simulated
/// workers.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<BTreeMap<String, Lease>>,
    fail_next: AtomicU32,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` store operations with a transient error,
    /// simulating a coordination-store outage.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Directly install a lease, bypassing CAS; for test setup only.
    pub fn seed(&self, lease: Lease) {
        self.leases
            .lock()
            .unwrap()
            .insert(lease.shard_id.clone(), lease);
    }

    pub fn leases(&self) -> Vec<Lease> {
        self.leases.lock().unwrap().values().cloned().collect()
    }

    fn check_outage(&self) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::transient("lease store", "scripted outage"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, shard_id: &str) -> Result<Option<Lease>> {
        self.check_outage()?;
        Ok(self.leases.lock().unwrap().get(shard_id).cloned())
    }

    async fn put_if_absent(&self, lease: &Lease) -> Result<CasOutcome> {
        self.check_outage()?;
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(&lease.shard_id) {
            return Ok(CasOutcome::Conflict);
        }
        leases.insert(lease.shard_id.clone(), lease.clone());
        Ok(CasOutcome::Applied)
    }

    async fn update_if(&self, lease: &Lease, expected_counter: u64) -> Result<CasOutcome> {
        self.check_outage()?;
        let mut leases = self.leases.lock().unwrap();
        match leases.get(&lease.shard_id) {
            Some(current) if current.counter == expected_counter => {
                leases.insert(lease.shard_id.clone(), lease.clone());
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn delete_if(&self, shard_id: &str, expected_counter: u64) -> Result<CasOutcome> {
        self.check_outage()?;
        let mut leases = self.leases.lock().unwrap();
        match leases.get(shard_id) {
            Some(current) if current.counter == expected_counter => {
                leases.remove(shard_id);
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn scan(&self) -> Result<Vec<Lease>> {
        self.check_outage()?;
        Ok(self.leases.lock().unwrap().values().cloned().collect())
    }
}
