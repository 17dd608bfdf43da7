use streams::{Checkpoint, Shard};

/// The coordination record granting one worker exclusive processing rights
/// for one shard. Every mutation is a compare-and-swap on `counter`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Lease {
    pub shard_id: String,
    pub owner: Option<String>,
    /// Monotonically increasing version; the CAS guard.
    pub counter: u64,
    /// The sequence number through which delivery is durably complete.
    pub checkpoint: Checkpoint,
    pub owner_switches_since_checkpoint: u32,
    pub parent_shard_ids: Vec<String>,
    /// Observability only. Theft eligibility is judged from locally
    /// observed counter staleness, never from cross-worker clocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_renewal_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl Lease {
    /// The owner-less lease created at discovery.
    pub fn initial(shard: &Shard) -> Self {
        Self {
            shard_id: shard.shard_id.clone(),
            owner: None,
            counter: 0,
            checkpoint: Checkpoint::TrimHorizon,
            owner_switches_since_checkpoint: 0,
            parent_shard_ids: shard.parent_shard_ids.clone(),
            last_renewal_time: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.checkpoint.is_shard_end()
    }
}
