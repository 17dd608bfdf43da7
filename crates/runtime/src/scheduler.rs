use crate::processor::{ProcessorOutcome, ShardProcessor};
use config::Settings;
use connector::TargetMapper;
use coordinator::{Coordinator, CoordinatorConfig, LeaseStore, ShardAssignment};
use std::sync::Arc;
use streams::{Result, StreamTransport};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The top-level per-process loop: binds the lease coordinator to shard
/// processors, spawning one processor task per acquired lease, and drives
/// bounded graceful shutdown.
pub struct Scheduler {
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn LeaseStore>,
    mapper: Arc<dyn TargetMapper>,
    settings: Settings,
    stream_id: String,
    worker_id: String,
}

impl Scheduler {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn LeaseStore>,
        mapper: Arc<dyn TargetMapper>,
        settings: Settings,
        stream_id: String,
        worker_id: String,
    ) -> Self {
        Self {
            transport,
            store,
            mapper,
            settings,
            stream_id,
            worker_id,
        }
    }

    #[tracing::instrument(skip_all, fields(worker_id = %self.worker_id, stream_id = %self.stream_id))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.mapper.initialize().await?;

        let (coordinator, mut assignments) = Coordinator::new(
            CoordinatorConfig {
                worker_id: self.worker_id.clone(),
                stream_id: self.stream_id.clone(),
                shard_sync_interval: self.settings.coordinator.shard_sync_interval,
                assignment_interval: self.settings.lease.assignment_interval,
                renewal_interval: self.settings.lease.renewal_interval,
                steal_after: self.settings.lease.steal_after,
                auditor_interval: self.settings.lease.auditor_interval,
                auditor_confidence: self.settings.lease.auditor_confidence,
            },
            self.transport.clone(),
            self.store.clone(),
        );
        let handle = coordinator.handle();

        let coordinator_cancel = CancellationToken::new();
        let coordinator_task = tokio::spawn(coordinator.run(coordinator_cancel.clone()));

        let processor_shutdown = CancellationToken::new();
        let mut processors: JoinSet<(String, Result<ProcessorOutcome>)> = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,

                assignment = assignments.recv() => {
                    let Some(assignment) = assignment else { break };
                    self.spawn_processor(&mut processors, &handle, &processor_shutdown, assignment);
                }

                Some(joined) = processors.join_next(), if !processors.is_empty() => {
                    log_processor_exit(joined);
                }
            }
        }

        tracing::info!("shutting down; quiescing shard processors");
        assignments.close();
        processor_shutdown.cancel();

        let drain = async {
            while let Some(joined) = processors.join_next().await {
                log_processor_exit(joined);
            }
        };
        if tokio::time::timeout(self.settings.processor.shutdown_timeout, drain)
            .await
            .is_err()
        {
            // Past the deadline we exit with uncheckpointed work, which is
            // safe under at-least-once delivery.
            tracing::warn!("graceful shutdown deadline exceeded; aborting processors");
            processors.abort_all();
        }

        coordinator_cancel.cancel();
        let _ = coordinator_task.await;

        tracing::info!("scheduler stopped");
        Ok(())
    }

    fn spawn_processor(
        &self,
        processors: &mut JoinSet<(String, Result<ProcessorOutcome>)>,
        handle: &coordinator::CoordinatorHandle,
        processor_shutdown: &CancellationToken,
        assignment: ShardAssignment,
    ) {
        let processor = ShardProcessor::new(
            self.transport.clone(),
            self.mapper.clone(),
            handle.clone(),
            self.stream_id.clone(),
            assignment.shard_id.clone(),
            assignment.checkpoint,
            assignment.lease_lost,
            processor_shutdown.clone(),
            self.settings.processor.checkpoint_interval,
        );
        let shard_id = assignment.shard_id;
        processors.spawn(async move { (shard_id.clone(), processor.run().await) });
    }
}

fn log_processor_exit(joined: Result<(String, Result<ProcessorOutcome>), tokio::task::JoinError>) {
    match joined {
        Ok((shard_id, Ok(outcome))) => {
            tracing::info!(shard_id = %shard_id, ?outcome, "processor finished");
        }
        Ok((shard_id, Err(err))) => {
            // The lease stays renewable until abandoned; another worker (or
            // this one, later) will pick the shard back up.
            tracing::error!(shard_id = %shard_id, %err, "processor failed");
        }
        Err(join_error) => {
            tracing::error!(%join_error, "processor task panicked or was aborted");
        }
    }
}
