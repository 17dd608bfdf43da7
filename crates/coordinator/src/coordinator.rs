use crate::{CasOutcome, Lease, LeaseStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use streams::{Checkpoint, Error, Result, Shard, StreamTransport};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub worker_id: String,
    pub stream_id: String,
    pub shard_sync_interval: Duration,
    pub assignment_interval: Duration,
    pub renewal_interval: Duration,
    pub steal_after: Duration,
    pub auditor_interval: Duration,
    pub auditor_confidence: u32,
}

/// A lease this worker has just acquired; handed to the scheduler, which
/// spawns a processor resuming from `checkpoint`. `lease_lost` fires if the
/// lease is stolen or cannot be renewed.
#[derive(Debug)]
pub struct ShardAssignment {
    pub shard_id: String,
    pub checkpoint: Checkpoint,
    pub lease_lost: CancellationToken,
}

struct HeldLease {
    lease: Lease,
    lease_lost: CancellationToken,
    last_renewal: Instant,
}

/// Locally observed counter of a foreign lease; a lease whose counter has
/// not moved for `steal_after` is eligible for theft.
struct Observation {
    counter: u64,
    since: Instant,
}

struct Inner {
    config: CoordinatorConfig,
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn LeaseStore>,
    held: Mutex<HashMap<String, HeldLease>>,
    observations: Mutex<HashMap<String, Observation>>,
    garbage_votes: Mutex<HashMap<String, u32>>,
    latest_shards: Mutex<Option<Vec<Shard>>>,
    assignments: mpsc::UnboundedSender<ShardAssignment>,
}

/// Distributes the stream's shards across workers: discovers shards,
/// creates and claims leases, renews them, advances checkpoints under CAS,
/// and garbage-collects completed leases.
pub struct Coordinator {
    inner: Arc<Inner>,
}

/// Cloneable handle used by shard processors to advance checkpoints.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn LeaseStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ShardAssignment>) {
        let (assignments, assignments_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            transport,
            store,
            held: Mutex::new(HashMap::new()),
            observations: Mutex::new(HashMap::new()),
            garbage_votes: Mutex::new(HashMap::new()),
            latest_shards: Mutex::new(None),
            assignments,
        });
        (Self { inner }, assignments_rx)
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            inner: self.inner.clone(),
        }
    }

    /// Drive discovery, assignment, renewal and auditing until cancelled,
    /// then release every held lease.
    pub async fn run(self, cancel: CancellationToken) {
        let inner = self.inner;

        let mut sync = tokio::time::interval(inner.config.shard_sync_interval);
        let mut assign = tokio::time::interval(inner.config.assignment_interval);
        let mut renew = tokio::time::interval(inner.config.renewal_interval);
        let mut audit = tokio::time::interval(inner.config.auditor_interval);
        for interval in [&mut sync, &mut assign, &mut renew, &mut audit] {
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        tracing::info!(
            worker_id = %inner.config.worker_id,
            stream_id = %inner.config.stream_id,
            "coordinator started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = sync.tick() => inner.sync_shards().await,
                _ = assign.tick() => inner.assign_one().await,
                _ = renew.tick() => inner.renew_held().await,
                _ = audit.tick() => inner.audit().await,
            }
        }

        inner.release_all().await;
        tracing::info!(worker_id = %inner.config.worker_id, "coordinator stopped");
    }
}

impl Inner {
    /// Enumerate shards and create owner-less leases for new ones.
    /// Transport errors are logged and retried at the next tick.
    async fn sync_shards(&self) {
        let shards = match self.transport.list_shards(&self.config.stream_id).await {
            Ok(shards) => shards,
            Err(err) => {
                tracing::warn!(%err, "shard enumeration failed; will retry");
                return;
            }
        };

        let known: HashSet<String> = match self.store.scan().await {
            Ok(leases) => leases.into_iter().map(|lease| lease.shard_id).collect(),
            Err(err) => {
                tracing::warn!(%err, "lease scan failed during discovery; will retry");
                return;
            }
        };

        let children = Shard::children_by_parent(&shards);
        for shard in &shards {
            if known.contains(&shard.shard_id) {
                continue;
            }
            // A leased descendant means this shard was already fully
            // drained and its lease garbage-collected; recreating it would
            // replay the shard from the trim horizon.
            if has_leased_descendant(&shard.shard_id, &children, &known) {
                continue;
            }
            match self.store.put_if_absent(&Lease::initial(shard)).await {
                Ok(CasOutcome::Applied) => {
                    tracing::info!(shard_id = %shard.shard_id, "created lease");
                }
                // Another worker created it concurrently.
                Ok(CasOutcome::Conflict) => {}
                Err(err) => {
                    tracing::warn!(shard_id = %shard.shard_id, %err, "lease creation failed");
                }
            }
        }

        *self.latest_shards.lock().await = Some(shards);
    }

    /// Scan leases and claim at most one: an unowned lease, or an owned one
    /// whose counter has been stale for `steal_after`. A shard whose parent
    /// lease rows still exist is never claimed; succession waits for the
    /// auditor to delete the drained parents.
    async fn assign_one(&self) {
        let leases = match self.store.scan().await {
            Ok(leases) => leases,
            Err(err) => {
                tracing::warn!(%err, "lease scan failed during assignment");
                return;
            }
        };

        let now = Instant::now();
        let stale: HashSet<String> = {
            let mut observations = self.observations.lock().await;
            observations.retain(|shard_id, _| {
                leases.iter().any(|lease| &lease.shard_id == shard_id)
            });
            leases
                .iter()
                .filter_map(|lease| {
                    let observation = observations
                        .entry(lease.shard_id.clone())
                        .or_insert(Observation {
                            counter: lease.counter,
                            since: now,
                        });
                    if observation.counter != lease.counter {
                        observation.counter = lease.counter;
                        observation.since = now;
                    }
                    (now.duration_since(observation.since) >= self.config.steal_after)
                        .then(|| lease.shard_id.clone())
                })
                .collect()
        };

        let lease_ids: HashSet<&str> = leases.iter().map(|lease| lease.shard_id.as_str()).collect();
        let held = self.held.lock().await;

        let candidate = leases.iter().find(|lease| {
            if lease.is_completed() || held.contains_key(&lease.shard_id) {
                return false;
            }
            let claimable = match &lease.owner {
                None => true,
                Some(owner) => *owner == self.config.worker_id || stale.contains(&lease.shard_id),
            };
            claimable
                && lease
                    .parent_shard_ids
                    .iter()
                    .all(|parent| !lease_ids.contains(parent.as_str()))
        });
        let Some(candidate) = candidate else { return };
        drop(held);

        self.claim(candidate.clone()).await;
    }

    async fn claim(&self, current: Lease) {
        let stolen_from = current
            .owner
            .as_ref()
            .filter(|owner| **owner != self.config.worker_id)
            .cloned();

        let mut claimed = current.clone();
        claimed.counter += 1;
        claimed.owner = Some(self.config.worker_id.clone());
        if current.owner.as_deref() != Some(&self.config.worker_id) {
            claimed.owner_switches_since_checkpoint += 1;
        }
        claimed.last_renewal_time = Some(chrono::Utc::now());

        match self.store.update_if(&claimed, current.counter).await {
            Ok(CasOutcome::Applied) => {}
            // Lost the race to another worker.
            Ok(CasOutcome::Conflict) => return,
            Err(err) => {
                tracing::warn!(shard_id = %current.shard_id, %err, "lease claim failed");
                return;
            }
        }

        if let Some(previous) = stolen_from {
            metrics::counter!("lease_steals").increment(1);
            tracing::info!(
                shard_id = %claimed.shard_id,
                previous_owner = %previous,
                "took over a stale lease"
            );
        } else {
            tracing::info!(shard_id = %claimed.shard_id, checkpoint = %claimed.checkpoint, "claimed lease");
        }

        let lease_lost = CancellationToken::new();
        let assignment = ShardAssignment {
            shard_id: claimed.shard_id.clone(),
            checkpoint: claimed.checkpoint.clone(),
            lease_lost: lease_lost.clone(),
        };

        let mut held = self.held.lock().await;
        held.insert(
            claimed.shard_id.clone(),
            HeldLease {
                lease: claimed,
                lease_lost,
                last_renewal: Instant::now(),
            },
        );
        metrics::gauge!("leases_held").set(held.len() as f64);
        drop(held);

        // The receiver closing means the scheduler is shutting down; the
        // run loop will be cancelled shortly after.
        let _ = self.assignments.send(assignment);
    }

    /// CAS-renew every held lease. A conflict means the lease was stolen or
    /// deleted; renewal failures beyond `steal_after` abandon the shard.
    async fn renew_held(&self) {
        let mut held = self.held.lock().await;
        let mut lost = Vec::new();

        for (shard_id, entry) in held.iter_mut() {
            let mut renewed = entry.lease.clone();
            renewed.counter += 1;
            renewed.last_renewal_time = Some(chrono::Utc::now());

            match self.store.update_if(&renewed, entry.lease.counter).await {
                Ok(CasOutcome::Applied) => {
                    entry.lease = renewed;
                    entry.last_renewal = Instant::now();
                }
                Ok(CasOutcome::Conflict) => {
                    let current = self.store.get(shard_id).await.ok().flatten();
                    match current {
                        Some(current)
                            if current.owner.as_deref() == Some(&self.config.worker_id) =>
                        {
                            // Raced with our own checkpoint advance.
                            entry.lease = current;
                            entry.last_renewal = Instant::now();
                        }
                        Some(current) => {
                            tracing::warn!(
                                shard_id = %shard_id,
                                new_owner = ?current.owner,
                                "lease was taken over; abandoning shard"
                            );
                            lost.push(shard_id.clone());
                        }
                        // Deleted, usually after the shard completed.
                        None => lost.push(shard_id.clone()),
                    }
                }
                Err(err) => {
                    let outage = Instant::now().duration_since(entry.last_renewal);
                    tracing::warn!(shard_id = %shard_id, %err, ?outage, "lease renewal failed");
                    if outage >= self.config.steal_after {
                        tracing::warn!(
                            shard_id = %shard_id,
                            "renewal outage exceeded steal-after; abandoning shard"
                        );
                        lost.push(shard_id.clone());
                    }
                }
            }
        }

        for shard_id in lost {
            if let Some(entry) = held.remove(&shard_id) {
                entry.lease_lost.cancel();
            }
        }
        metrics::gauge!("leases_held").set(held.len() as f64);
    }

    /// Delete drained leases: checkpoint at the end-of-shard marker, and
    /// the shard either absent from the latest enumeration or fully
    /// succeeded by children that have leases of their own. Deletion waits
    /// for `auditor_confidence` consecutive observations.
    async fn audit(&self) {
        let Some(shards) = self.latest_shards.lock().await.clone() else {
            return;
        };
        let leases = match self.store.scan().await {
            Ok(leases) => leases,
            Err(err) => {
                tracing::warn!(%err, "lease scan failed during audit");
                return;
            }
        };

        let present: HashSet<&str> = shards.iter().map(|shard| shard.shard_id.as_str()).collect();
        let children = Shard::children_by_parent(&shards);
        let lease_ids: HashSet<&str> = leases.iter().map(|lease| lease.shard_id.as_str()).collect();

        let mut votes = self.garbage_votes.lock().await;
        votes.retain(|shard_id, _| lease_ids.contains(shard_id.as_str()));

        for lease in &leases {
            let succeeded = children
                .get(lease.shard_id.as_str())
                .map(|shard_children| {
                    shard_children
                        .iter()
                        .all(|child| lease_ids.contains(child))
                })
                .unwrap_or(false);
            let garbage =
                lease.is_completed() && (!present.contains(lease.shard_id.as_str()) || succeeded);

            if !garbage {
                votes.remove(&lease.shard_id);
                continue;
            }

            let confidence = votes.entry(lease.shard_id.clone()).or_insert(0);
            *confidence += 1;
            if *confidence < self.config.auditor_confidence {
                continue;
            }

            match self.store.delete_if(&lease.shard_id, lease.counter).await {
                Ok(CasOutcome::Applied) => {
                    votes.remove(&lease.shard_id);
                    tracing::info!(shard_id = %lease.shard_id, "deleted drained lease");
                }
                Ok(CasOutcome::Conflict) => {
                    // Mutated since the scan; re-observe from scratch.
                    votes.remove(&lease.shard_id);
                }
                Err(err) => {
                    tracing::warn!(shard_id = %lease.shard_id, %err, "lease deletion failed");
                }
            }
        }
    }

    /// Graceful release: clear ownership of every held lease. Processors
    /// have already written their final checkpoints by the time the
    /// scheduler cancels the coordinator.
    async fn release_all(&self) {
        let mut held = self.held.lock().await;
        for (shard_id, entry) in held.drain() {
            let mut released = entry.lease.clone();
            released.counter += 1;
            released.owner = None;

            match self.store.update_if(&released, entry.lease.counter).await {
                Ok(CasOutcome::Applied) => {
                    tracing::info!(shard_id = %shard_id, "released lease");
                }
                Ok(CasOutcome::Conflict) => {
                    tracing::warn!(shard_id = %shard_id, "lease changed during release; skipping");
                }
                Err(err) => {
                    tracing::warn!(shard_id = %shard_id, %err, "lease release failed");
                }
            }
            entry.lease_lost.cancel();
        }
        metrics::gauge!("leases_held").set(0.0);
    }
}

impl CoordinatorHandle {
    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    /// Durably advance the shard's checkpoint. Checkpoints never regress;
    /// writing the current checkpoint again is permitted and only bumps the
    /// counter. Raises `LeaseLost` when another worker owns the shard.
    pub async fn advance_checkpoint(
        &self,
        shard_id: &str,
        checkpoint: Checkpoint,
    ) -> Result<()> {
        let inner = &self.inner;
        let mut held = inner.held.lock().await;

        let mut updated = match held.get(shard_id) {
            Some(entry) if checkpoint < entry.lease.checkpoint => {
                return Err(Error::Fatal(anyhow::anyhow!(
                    "checkpoint for shard {shard_id} would regress from {} to {}",
                    entry.lease.checkpoint,
                    checkpoint
                )))
            }
            Some(entry) => entry.lease.clone(),
            None => return Err(Error::LeaseLost),
        };
        updated.checkpoint = checkpoint;
        updated.owner_switches_since_checkpoint = 0;

        loop {
            updated.counter += 1;
            let expected = updated.counter - 1;

            match inner.store.update_if(&updated, expected).await {
                Ok(CasOutcome::Applied) => {
                    if let Some(entry) = held.get_mut(shard_id) {
                        entry.lease = updated;
                    }
                    return Ok(());
                }
                Ok(CasOutcome::Conflict) => {
                    metrics::counter!("checkpoint_advance_conflicts").increment(1);
                    let current = inner.store.get(shard_id).await?;
                    match current {
                        Some(current)
                            if current.owner.as_deref() == Some(&inner.config.worker_id) =>
                        {
                            updated.counter = current.counter;
                        }
                        _ => {
                            if let Some(entry) = held.remove(shard_id) {
                                entry.lease_lost.cancel();
                            }
                            metrics::gauge!("leases_held").set(held.len() as f64);
                            return Err(Error::LeaseLost);
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The checkpoint this worker holds for a shard, if any.
    pub async fn checkpoint(&self, shard_id: &str) -> Option<Checkpoint> {
        self.inner
            .held
            .lock()
            .await
            .get(shard_id)
            .map(|entry| entry.lease.checkpoint.clone())
    }
}

fn has_leased_descendant(
    shard_id: &str,
    children: &std::collections::BTreeMap<&str, Vec<&str>>,
    leased: &HashSet<String>,
) -> bool {
    let mut pending: Vec<&str> = children.get(shard_id).cloned().unwrap_or_default();
    while let Some(descendant) = pending.pop() {
        if leased.contains(descendant) {
            return true;
        }
        pending.extend(children.get(descendant).cloned().unwrap_or_default());
    }
    false
}

/// A stable per-process worker identity: the configured one, or derived
/// from the host identity with a random suffix.
pub fn worker_identity(configured: Option<String>) -> String {
    configured.unwrap_or_else(|| {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{host}-{}", &suffix[..8])
    })
}
