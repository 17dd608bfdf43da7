use crate::clients::ClientRegistry;
use crate::columnar;
use chrono::{TimeZone, Utc};
use config::ConfigDocument;
use connector::{with_retries, MapperCommon, TargetMapper};
use std::sync::Arc;
use streams::{ChangeRecord, Error, Result};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Columnar,
}

impl Format {
    fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Columnar => "parquet",
        }
    }
}

/// Timestamp partitioning of object keys. Finer granularities append a
/// path segment, so `Hours` yields `YYYY/MM/DD/HH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    None,
    Years,
    Months,
    Days,
    Hours,
    Minutes,
    Seconds,
}

impl Partition {
    fn pattern(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Years => Some("%Y"),
            Self::Months => Some("%Y/%m"),
            Self::Days => Some("%Y/%m/%d"),
            Self::Hours => Some("%Y/%m/%d/%H"),
            Self::Minutes => Some("%Y/%m/%d/%H/%M"),
            Self::Seconds => Some("%Y/%m/%d/%H/%M/%S"),
        }
    }
}

/// Writes each batch as one object, row-oriented JSON or columnar Parquet.
pub struct ObjectStoreMapper {
    common: MapperCommon,
    clients: Arc<ClientRegistry>,
    bucket: String,
    prefix: String,
    format: Format,
    partition: Partition,
}

impl ObjectStoreMapper {
    pub fn from_config(config: &ConfigDocument, clients: Arc<ClientRegistry>) -> Result<Self> {
        let format = match config
            .get_string("connector.format")
            .unwrap_or_else(|| "json".to_string())
            .as_str()
        {
            "json" => Format::Json,
            "columnar" => Format::Columnar,
            other => {
                return Err(Error::Config(format!(
                    "connector.format must be one of json, columnar; got '{other}'"
                )))
            }
        };

        let partition = match config
            .get_string("connector.timestamp-partition")
            .unwrap_or_else(|| "hours".to_string())
            .as_str()
        {
            "none" => Partition::None,
            "years" => Partition::Years,
            "months" => Partition::Months,
            "days" => Partition::Days,
            "hours" => Partition::Hours,
            "minutes" => Partition::Minutes,
            "seconds" => Partition::Seconds,
            other => {
                return Err(Error::Config(format!(
                    "connector.timestamp-partition must be one of seconds, minutes, hours, days, months, years, none; got '{other}'"
                )))
            }
        };

        Ok(Self {
            common: MapperCommon::from_config(config)?,
            clients,
            bucket: config.require_string("connector.bucket")?,
            prefix: config.require_string("connector.prefix")?,
            format,
            partition,
        })
    }

    /// `<prefix>/<partition>/<firstSeq>-<lastSeq>-<epochMillis>.<ext>`,
    /// with the partition derived from the first record's arrival time.
    fn object_key(&self, batch: &[ChangeRecord]) -> String {
        let first = &batch[0];
        let last = &batch[batch.len() - 1];

        let mut segments = vec![self.prefix.clone()];
        if let Some(pattern) = self.partition.pattern() {
            let arrival = Utc
                .timestamp_millis_opt(first.arrival_time)
                .single()
                .unwrap_or_default();
            segments.push(arrival.format(pattern).to_string());
        }
        segments.push(format!(
            "{}-{}-{}.{}",
            first.sequence_number,
            last.sequence_number,
            first.arrival_time,
            self.format.extension()
        ));

        segments.retain(|segment| !segment.is_empty());
        segments.join("/")
    }

    fn body(&self, batch: &[ChangeRecord]) -> Result<Vec<u8>> {
        match self.format {
            Format::Json => {
                let records: Vec<serde_json::Value> = batch
                    .iter()
                    .map(|record| match record.state_image() {
                        Some(image) => ChangeRecord::image_to_json(image),
                        None => serde_json::Value::Null,
                    })
                    .collect();
                Ok(serde_json::to_vec(
                    &serde_json::json!({ "records": records }),
                )?)
            }
            Format::Columnar => columnar::write_batch(batch),
        }
    }
}

#[async_trait::async_trait]
impl TargetMapper for ObjectStoreMapper {
    fn name(&self) -> &'static str {
        "object-store"
    }

    fn common(&self) -> &MapperCommon {
        &self.common
    }

    async fn initialize(&self) -> Result<()> {
        self.clients.object_store().await?;
        Ok(())
    }

    async fn handle_records(
        &self,
        batch: &[ChangeRecord],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let key = self.object_key(batch);
        let body = bytes::Bytes::from(self.body(batch)?);
        let store = self.clients.object_store().await?;

        with_retries(&self.common.retry, cancel, "object-store put", |attempt| {
            let (store, key, body) = (store.clone(), key.clone(), body.clone());
            async move {
                tracing::debug!(key = %key, attempt, bytes = body.len(), "writing object");
                store.put(&self.bucket, &key, body).await
            }
        })
        .await
    }
}
