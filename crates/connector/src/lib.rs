//! The target-mapper contract and the algorithms every sink shares:
//! count/byte-bounded batching, bounded retries with jittered exponential
//! backoff, and partial-failure accounting.

pub mod batch;
pub mod registry;
pub mod retry;

pub use batch::{pack, BatchLimits};
pub use registry::MapperRegistry;
pub use retry::{delivery_failure, with_retries, RetryPolicy};

use config::ConfigDocument;
use streams::{ChangeRecord, Error, Result};
use tokio_util::sync::CancellationToken;

/// A sink-specific adapter delivering decoded change records. One mapper
/// instance serves every shard of the process; implementations keep shared
/// state behind `Arc`s and long-lived clients behind an initialization
/// latch.
#[async_trait::async_trait]
pub trait TargetMapper: Send + Sync {
    /// The mapper's registry key, used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Shared cross-sink state; drives the default `filter_records`.
    fn common(&self) -> &MapperCommon;

    /// Performed once before the first batch; may open long-lived clients.
    /// Must be idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Apply the configured filter expression, if any.
    fn filter_records(&self, batch: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
        self.common().filter_records(batch)
    }

    /// Deliver the batch. Partial and total failures are batch-fatal for
    /// checkpoint purposes; the processor re-fetches and re-delivers.
    /// Implementations must not start a fresh transport attempt once
    /// `cancel` fires.
    async fn handle_records(
        &self,
        batch: &[ChangeRecord],
        cancel: &CancellationToken,
    ) -> Result<()>;
}

impl std::fmt::Debug for dyn TargetMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetMapper").field("name", &self.name()).finish()
    }
}

/// Cross-sink options and filter wiring, embedded by every mapper.
#[derive(Debug, Clone)]
pub struct MapperCommon {
    pub filter: Option<filter_expr::Filter>,
    pub retry: RetryPolicy,
    pub region: Option<String>,
}

impl MapperCommon {
    /// Parse the recognized cross-sink options: `max-retries` (default 3),
    /// `filter-expression`, `region`.
    pub fn from_config(config: &ConfigDocument) -> Result<Self> {
        let max_retries = config.get_i32("connector.max-retries")?.unwrap_or(3);
        if max_retries < 0 {
            return Err(Error::Config(format!(
                "connector.max-retries must be non-negative, got {max_retries}"
            )));
        }

        let filter = config
            .get_string("connector.filter-expression")
            .map(|source| {
                filter_expr::Filter::compile(&source).map_err(|err| {
                    Error::Config(format!("invalid connector.filter-expression: {err}"))
                })
            })
            .transpose()?;

        Ok(Self {
            filter,
            retry: RetryPolicy::new(max_retries as u32),
            region: config.get_string("connector.region"),
        })
    }

    pub fn filter_records(&self, batch: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
        let Some(filter) = &self.filter else {
            return batch;
        };

        let before = batch.len();
        let passed: Vec<_> = batch
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();

        let excluded = before - passed.len();
        if excluded > 0 {
            metrics::counter!("records_filtered").increment(excluded as u64);
        }
        passed
    }
}
