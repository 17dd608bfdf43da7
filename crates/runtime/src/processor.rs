use connector::{RetryPolicy, TargetMapper};
use coordinator::CoordinatorHandle;
use std::sync::Arc;
use std::time::Duration;
use streams::{
    ChangeRecord, Checkpoint, Error, Result, ShardIterator, ShardPage, StreamTransport,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Pause between fetches when the shard has no new records.
const IDLE_FETCH_DELAY: Duration = Duration::from_secs(1);
/// Pause before re-fetching a batch whose delivery failed.
const FAILED_BATCH_DELAY: Duration = Duration::from_secs(1);
/// Consecutive transient fetch failures tolerated before the shard fails.
const FETCH_RETRIES: u32 = 3;

/// How a processor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorOutcome {
    /// End-of-shard reached and the final checkpoint written.
    Terminated,
    /// The lease was lost; no checkpoint was written on the way out.
    Abandoned,
    /// Shutdown was requested and in-flight work was checkpointed.
    Quiesced,
}

/// Drives one shard: fetch → decode → filter → deliver → checkpoint,
/// strictly in stream order, until the shard ends, the lease is lost, or
/// shutdown is requested.
pub struct ShardProcessor {
    transport: Arc<dyn StreamTransport>,
    mapper: Arc<dyn TargetMapper>,
    coordinator: CoordinatorHandle,
    stream_id: String,
    shard_id: String,
    checkpoint: Checkpoint,
    lease_lost: CancellationToken,
    shutdown: CancellationToken,
    checkpoint_interval: Duration,
    fetch_retry: RetryPolicy,
}

impl ShardProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        mapper: Arc<dyn TargetMapper>,
        coordinator: CoordinatorHandle,
        stream_id: String,
        shard_id: String,
        checkpoint: Checkpoint,
        lease_lost: CancellationToken,
        shutdown: CancellationToken,
        checkpoint_interval: Duration,
    ) -> Self {
        Self {
            transport,
            mapper,
            coordinator,
            stream_id,
            shard_id,
            checkpoint,
            lease_lost,
            shutdown,
            checkpoint_interval,
            fetch_retry: RetryPolicy::new(FETCH_RETRIES),
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(shard_id = %self.shard_id, mapper = self.mapper.name())
    )]
    pub async fn run(mut self) -> Result<ProcessorOutcome> {
        self.mapper.initialize().await?;
        let mut last_checkpoint_write = Instant::now();

        tracing::info!(checkpoint = %self.checkpoint, "processor started");

        'reopen: loop {
            let mut iterator = match self.open_iterator().await? {
                Some(iterator) => iterator,
                None => return Ok(self.exit_reason()),
            };

            loop {
                let page = match self.fetch(iterator.as_mut()).await? {
                    Some(page) => page,
                    None => return Ok(self.exit_reason()),
                };

                if !page.records.is_empty() {
                    metrics::counter!("records_in").increment(page.records.len() as u64);

                    let batch = match self.decode(&page) {
                        Ok(batch) => batch,
                        Err(err) if Self::is_batch_fatal(&err) => {
                            self.observe_batch_failure(&err);
                            if !self.sleep(FAILED_BATCH_DELAY).await {
                                return Ok(self.exit_reason());
                            }
                            continue 'reopen;
                        }
                        Err(err) => return Err(err),
                    };
                    let batch = self.mapper.filter_records(batch);

                    if !batch.is_empty() {
                        match self.mapper.handle_records(&batch, &self.shutdown).await {
                            Ok(()) => {
                                metrics::counter!("records_delivered")
                                    .increment(batch.len() as u64);
                            }
                            Err(err) if Self::is_batch_fatal(&err) => {
                                self.observe_batch_failure(&err);
                                // Re-fetch the same range from the
                                // unadvanced checkpoint; duplicate delivery
                                // is possible and sinks tolerate it.
                                if !self.sleep(FAILED_BATCH_DELAY).await {
                                    return Ok(self.exit_reason());
                                }
                                continue 'reopen;
                            }
                            Err(err) => return Err(err),
                        }
                    }

                    // The checkpoint covers the whole fetched page,
                    // including filtered and rejected records.
                    match self.advance(page.next_checkpoint.clone()).await? {
                        Advance::Ok => last_checkpoint_write = Instant::now(),
                        Advance::LeaseLost => return Ok(ProcessorOutcome::Abandoned),
                    }
                } else if last_checkpoint_write.elapsed() >= self.checkpoint_interval
                    && page.next_checkpoint != self.checkpoint
                {
                    // Opportunistic checkpoint of iterator progress over
                    // stretches with no deliverable records.
                    match self.advance(page.next_checkpoint.clone()).await? {
                        Advance::Ok => last_checkpoint_write = Instant::now(),
                        Advance::LeaseLost => return Ok(ProcessorOutcome::Abandoned),
                    }
                }

                if page.end_of_shard {
                    // Drain complete: the terminal checkpoint hands the
                    // stream over to this shard's children.
                    match self.advance(Checkpoint::ShardEnd).await? {
                        Advance::Ok => {}
                        Advance::LeaseLost => return Ok(ProcessorOutcome::Abandoned),
                    }
                    tracing::info!("shard fully drained");
                    return Ok(ProcessorOutcome::Terminated);
                }

                if page.records.is_empty() && !self.sleep(IDLE_FETCH_DELAY).await {
                    return Ok(self.exit_reason());
                }
            }
        }
    }

    /// Open the shard iterator at the current checkpoint, `None` on
    /// cancellation.
    async fn open_iterator(&self) -> Result<Option<Box<dyn ShardIterator>>> {
        if self.cancelled() {
            return Ok(None);
        }
        let iterator = connector::with_retries(
            &self.fetch_retry,
            &self.shutdown,
            "open shard iterator",
            |_| async {
                self.transport
                    .open_iterator(&self.stream_id, &self.shard_id, &self.checkpoint)
                    .await
            },
        )
        .await?;
        Ok(Some(iterator))
    }

    /// Fetch the next page, retrying transient failures; `None` on
    /// cancellation or when the iterator reports the shard already ended.
    async fn fetch(&self, iterator: &mut dyn ShardIterator) -> Result<Option<ShardPage>> {
        let mut attempt = 0u32;
        loop {
            let fetched = tokio::select! {
                fetched = iterator.next() => fetched,
                () = self.lease_lost.cancelled() => return Ok(None),
                () = self.shutdown.cancelled() => return Ok(None),
            };
            match fetched {
                Ok(page) => return Ok(Some(page)),
                Err(Error::ShardEnded) => {
                    return Ok(Some(ShardPage {
                        records: Vec::new(),
                        next_checkpoint: self.checkpoint.clone(),
                        end_of_shard: true,
                    }))
                }
                Err(err) if err.is_transient() && attempt < FETCH_RETRIES => {
                    tracing::warn!(%err, attempt, "shard fetch failed; backing off");
                    if !self.sleep(self.fetch_retry_delay(attempt)).await {
                        return Ok(None);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn fetch_retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(500).saturating_mul(2u32.saturating_pow(attempt.min(8)))
    }

    fn decode(&self, page: &ShardPage) -> Result<Vec<ChangeRecord>> {
        let mut batch = Vec::with_capacity(page.records.len());
        for raw in &page.records {
            match ChangeRecord::decode(raw)? {
                Some(record) => batch.push(record),
                None => {
                    metrics::counter!("records_rejected_unknown_op").increment(1);
                    tracing::warn!(
                        sequence_number = %raw.sequence_number,
                        "record has no discernible operation; rejecting"
                    );
                }
            }
        }
        Ok(batch)
    }

    async fn advance(&mut self, to: Checkpoint) -> Result<Advance> {
        match self
            .coordinator
            .advance_checkpoint(&self.shard_id, to.clone())
            .await
        {
            Ok(()) => {
                self.checkpoint = to;
                Ok(Advance::Ok)
            }
            Err(Error::LeaseLost) => {
                tracing::warn!("lease lost at checkpoint advance; abandoning shard");
                Ok(Advance::LeaseLost)
            }
            Err(err) => Err(err),
        }
    }

    fn observe_batch_failure(&self, err: &Error) {
        match err {
            Error::PartialFailure { total, failed, .. } => {
                metrics::counter!("batch_partial_failures").increment(1);
                tracing::warn!(total, failed, %err, "partial batch failure; will re-deliver");
            }
            Error::TotalFailure { total, .. } => {
                metrics::counter!("batch_total_failures").increment(1);
                tracing::warn!(total, %err, "total batch failure; will re-deliver");
            }
            _ => {
                tracing::warn!(%err, "batch delivery failed; will re-deliver");
            }
        }
    }

    /// Batch-fatal errors re-deliver from the unadvanced checkpoint;
    /// everything else is fatal to the shard.
    fn is_batch_fatal(err: &Error) -> bool {
        matches!(
            err,
            Error::PartialFailure { .. }
                | Error::TotalFailure { .. }
                | Error::Transient { .. }
                | Error::UnsupportedType(_)
        )
    }

    fn cancelled(&self) -> bool {
        self.lease_lost.is_cancelled() || self.shutdown.is_cancelled()
    }

    fn exit_reason(&self) -> ProcessorOutcome {
        if self.lease_lost.is_cancelled() {
            ProcessorOutcome::Abandoned
        } else {
            ProcessorOutcome::Quiesced
        }
    }

    /// Interruptible sleep; false when cancelled.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.lease_lost.cancelled() => false,
            () = self.shutdown.cancelled() => false,
        }
    }
}

enum Advance {
    Ok,
    LeaseLost,
}
