use crate::ConfigDocument;
use std::time::Duration;
use streams::{Error, Result, StreamTransport};

/// Parsed settings of the non-connector sections. Connector options are
/// read by the resolved mapper itself.
#[derive(Debug, Clone)]
pub struct Settings {
    pub stream: StreamSettings,
    pub coordinator: CoordinatorSettings,
    pub lease: LeaseSettings,
    pub processor: ProcessorSettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub stream_id: Option<String>,
    pub keyspace: Option<String>,
    pub table: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub shard_sync_interval: Duration,
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub assignment_interval: Duration,
    pub renewal_interval: Duration,
    pub steal_after: Duration,
    pub auditor_interval: Duration,
    pub auditor_confidence: u32,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub checkpoint_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Settings {
    pub fn from_config(config: &ConfigDocument) -> Result<Self> {
        let duration = |option: &str, default: Duration| -> Result<Duration> {
            Ok(config.get_duration(option)?.unwrap_or(default))
        };

        let settings = Self {
            stream: StreamSettings {
                stream_id: config.get_string("stream.stream-id"),
                keyspace: config.get_string("stream.keyspace"),
                table: config.get_string("stream.table"),
                label: config.get_string("stream.label"),
            },
            coordinator: CoordinatorSettings {
                shard_sync_interval: duration(
                    "coordinator.shard-sync-interval",
                    Duration::from_secs(60),
                )?,
                worker_id: config.get_string("coordinator.worker-id"),
            },
            lease: LeaseSettings {
                assignment_interval: duration(
                    "lease-management.assignment-interval",
                    Duration::from_secs(1),
                )?,
                renewal_interval: duration(
                    "lease-management.renewal-interval",
                    Duration::from_secs(10),
                )?,
                steal_after: duration("lease-management.steal-after", Duration::from_secs(30))?,
                auditor_interval: duration(
                    "lease-management.auditor-interval",
                    Duration::from_secs(5),
                )?,
                auditor_confidence: config
                    .get_i32("lease-management.auditor-confidence")?
                    .unwrap_or(3)
                    .max(1) as u32,
            },
            processor: ProcessorSettings {
                checkpoint_interval: duration(
                    "processor.checkpoint-interval",
                    Duration::from_secs(60),
                )?,
                shutdown_timeout: duration("processor.shutdown-timeout", Duration::from_secs(30))?,
            },
        };

        // Renewal must complete well before a lease becomes stealable.
        if settings.lease.renewal_interval >= settings.lease.steal_after {
            return Err(Error::Config(format!(
                "lease-management.renewal-interval ({:?}) must be below lease-management.steal-after ({:?})",
                settings.lease.renewal_interval, settings.lease.steal_after,
            )));
        }

        Ok(settings)
    }
}

impl StreamSettings {
    /// Resolve to a concrete stream identifier: the explicit id when
    /// configured, otherwise by enumerating the `(keyspace, table)` streams
    /// and selecting by label (or the newest when no label is set).
    pub async fn resolve(&self, transport: &dyn StreamTransport) -> Result<String> {
        if let Some(stream_id) = &self.stream_id {
            return Ok(stream_id.clone());
        }

        let (keyspace, table) = match (&self.keyspace, &self.table) {
            (Some(keyspace), Some(table)) => (keyspace, table),
            _ => {
                return Err(Error::Config(
                    "either stream.stream-id or both stream.keyspace and stream.table must be set"
                        .to_string(),
                ))
            }
        };

        let streams = transport.list_streams(keyspace, table).await?;
        let resolved = match &self.label {
            Some(label) => streams
                .iter()
                .find(|stream| stream.label.as_deref() == Some(label))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no stream labelled '{label}' found for {keyspace}.{table}"
                    ))
                })?,
            None => streams.last().ok_or_else(|| {
                Error::Config(format!("no CDC stream found for {keyspace}.{table}"))
            })?,
        };

        tracing::info!(
            stream_id = %resolved.stream_id,
            keyspace,
            table,
            "resolved stream identifier"
        );
        Ok(resolved.stream_id.clone())
    }
}
