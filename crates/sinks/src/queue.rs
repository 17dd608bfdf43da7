use crate::clients::{ClientRegistry, QueueEntry};
use config::ConfigDocument;
use connector::{delivery_failure, pack, with_retries, BatchLimits, MapperCommon, TargetMapper};
use std::sync::Arc;
use streams::{ChangeRecord, Error, Result};
use tokio_util::sync::CancellationToken;

/// Default payload byte cap: the smaller of the two transport limits
/// (256 KiB vs 1 MiB). `max-payload-bytes` may lower it further, or raise
/// it up to the absolute 1 000 000-byte ceiling.
const DEFAULT_PAYLOAD_BYTES: usize = 256 * 1024;
const MAX_PAYLOAD_BYTES: usize = 1_000_000;
/// Entries per transport batch publish.
const ENTRIES_PER_SEND: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageFormat {
    Full,
    NewImage,
    OldImage,
}

/// Publishes one logical message per record, packing messages into
/// byte-capped payloads and payloads into transport batches of ten.
pub struct QueueMapper {
    common: MapperCommon,
    clients: Arc<ClientRegistry>,
    queue_address: String,
    format: MessageFormat,
    include_fields: Vec<String>,
    include_metadata: bool,
    delay_seconds: u32,
    max_payload_bytes: usize,
    keyspace: Option<String>,
    table: Option<String>,
}

impl QueueMapper {
    pub fn from_config(config: &ConfigDocument, clients: Arc<ClientRegistry>) -> Result<Self> {
        let format = match config
            .get_string("connector.message-format")
            .unwrap_or_else(|| "full".to_string())
            .as_str()
        {
            "full" => MessageFormat::Full,
            "new-image" => MessageFormat::NewImage,
            "old-image" => MessageFormat::OldImage,
            other => {
                return Err(Error::Config(format!(
                    "connector.message-format must be one of full, new-image, old-image; got '{other}'"
                )))
            }
        };

        let delay = config.get_i64("connector.delay")?.unwrap_or(0);
        if !(0..=900).contains(&delay) {
            return Err(Error::Config(format!(
                "connector.delay must be within 0..=900 seconds, got {delay}"
            )));
        }

        let max_payload_bytes = config
            .get_i64("connector.max-payload-bytes")?
            .map(|bytes| {
                if bytes <= 0 {
                    return Err(Error::Config(format!(
                        "connector.max-payload-bytes must be positive, got {bytes}"
                    )));
                }
                Ok((bytes as usize).min(MAX_PAYLOAD_BYTES))
            })
            .transpose()?
            .unwrap_or(DEFAULT_PAYLOAD_BYTES);

        Ok(Self {
            common: MapperCommon::from_config(config)?,
            clients,
            queue_address: config.require_string("connector.queue-address")?,
            format,
            include_fields: config
                .get_string_list("connector.include-fields")?
                .unwrap_or_default(),
            include_metadata: config.get_bool("connector.include-metadata")?.unwrap_or(true),
            delay_seconds: delay as u32,
            max_payload_bytes,
            keyspace: config.get_string("stream.keyspace"),
            table: config.get_string("stream.table"),
        })
    }

    fn image_json(&self, image: Option<&std::collections::BTreeMap<String, streams::CellValue>>) -> serde_json::Value {
        let Some(image) = image else {
            return serde_json::Value::Null;
        };
        let mut object = serde_json::Map::new();
        for (name, value) in image {
            if self.include_fields.is_empty() || self.include_fields.iter().any(|f| f == name) {
                object.insert(name.clone(), value.to_json());
            }
        }
        serde_json::Value::Object(object)
    }

    /// One logical message in the configured format, with the optional
    /// metadata block (`keyspace`, `table`, `operation`, `timestamp`,
    /// `sequenceNumber`).
    fn logical_message(&self, record: &ChangeRecord) -> serde_json::Value {
        let metadata = self.include_metadata.then(|| {
            serde_json::json!({
                "keyspace": self.keyspace,
                "table": self.table,
                "operation": record.operation.as_str(),
                "timestamp": record.arrival_time,
                "sequenceNumber": record.sequence_number.as_str(),
            })
        });

        match (self.format, metadata) {
            (MessageFormat::Full, metadata) => {
                let mut message = serde_json::Map::new();
                if let Some(metadata) = metadata {
                    message.insert("metadata".to_string(), metadata);
                }
                message.insert(
                    "newImage".to_string(),
                    self.image_json(record.new_image.as_ref()),
                );
                message.insert(
                    "oldImage".to_string(),
                    self.image_json(record.old_image.as_ref()),
                );
                serde_json::Value::Object(message)
            }
            (MessageFormat::NewImage, None) => self.image_json(record.new_image.as_ref()),
            (MessageFormat::OldImage, None) => self.image_json(record.old_image.as_ref()),
            (MessageFormat::NewImage, Some(metadata)) => serde_json::json!({
                "metadata": metadata,
                "newImage": self.image_json(record.new_image.as_ref()),
            }),
            (MessageFormat::OldImage, Some(metadata)) => serde_json::json!({
                "metadata": metadata,
                "oldImage": self.image_json(record.old_image.as_ref()),
            }),
        }
    }

    /// Pack records into sealed payload entries. Each entry body is a JSON
    /// array of logical messages; entry ids carry the covered sequence
    /// range.
    fn build_entries(&self, batch: &[ChangeRecord]) -> Vec<(QueueEntry, usize)> {
        let messages: Vec<(usize, String)> = batch
            .iter()
            .enumerate()
            .map(|(at, record)| (at, self.logical_message(record).to_string()))
            .collect();

        // Account for the enclosing brackets and separating commas.
        let limits = BatchLimits {
            max_count: usize::MAX,
            max_bytes: self.max_payload_bytes.saturating_sub(2),
        };
        pack(messages, &limits, |(_, message)| message.len() + 1)
            .into_iter()
            .map(|payload| {
                let first = &batch[payload[0].0].sequence_number;
                let last = &batch[payload[payload.len() - 1].0].sequence_number;
                let body = format!(
                    "[{}]",
                    payload
                        .iter()
                        .map(|(_, message)| message.as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                );
                (
                    QueueEntry {
                        id: format!("r-{first}-{last}"),
                        body,
                        delay_seconds: self.delay_seconds,
                    },
                    payload.len(),
                )
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl TargetMapper for QueueMapper {
    fn name(&self) -> &'static str {
        "queue"
    }

    fn common(&self) -> &MapperCommon {
        &self.common
    }

    async fn initialize(&self) -> Result<()> {
        self.clients.queue().await?;
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
        let queue = self.clients.queue().await?;
        let entries = self.build_entries(batch);

        let mut failed_records = 0usize;
        let mut failure_messages = Vec::new();

        for send in pack(
            entries,
            &BatchLimits {
                max_count: ENTRIES_PER_SEND,
                max_bytes: usize::MAX,
            },
            |_| 0,
        ) {
            let record_counts: std::collections::BTreeMap<String, usize> = send
                .iter()
                .map(|(entry, records)| (entry.id.clone(), *records))
                .collect();
            let to_send: Vec<QueueEntry> = send.into_iter().map(|(entry, _)| entry).collect();

            let outcome =
                with_retries(&self.common.retry, cancel, "queue publish", |attempt| {
                    let (queue, to_send) = (queue.clone(), to_send.clone());
                    async move {
                        tracing::debug!(
                            queue = %self.queue_address,
                            entries = to_send.len(),
                            attempt,
                            "publishing batch"
                        );
                        queue.send_batch(&self.queue_address, to_send).await
                    }
                })
                .await?;

            for failed in outcome.failed {
                failed_records += record_counts.get(&failed.id).copied().unwrap_or(1);
                failure_messages.push(format!(
                    "id {}: {}: {}",
                    failed.id, failed.code, failed.message
                ));
            }
        }

        if failed_records > 0 {
            return Err(delivery_failure(batch.len(), failed_records, failure_messages));
        }
        Ok(())
    }
}
