use crate::clients::{BoundStatement, ClientRegistry, StatementKind};
use config::ConfigDocument;
use connector::{MapperCommon, TargetMapper};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use streams::{CellValue, ChangeRecord, Error, Result};
use tokio_util::sync::CancellationToken;

/// Base delay of the per-write linear backoff (`delay = base * attempt`).
const LINEAR_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Mirrors changes into a materialized secondary table: upserts carry the
/// configured `include-fields` from `new_image`, deletes are keyed by
/// `partition-keys ++ clustering-keys` from `old_image`.
pub struct TableMapper {
    common: MapperCommon,
    clients: Arc<ClientRegistry>,
    target_table: String,
    include_fields: Vec<String>,
    key_fields: Vec<String>,
}

impl TableMapper {
    pub fn from_config(config: &ConfigDocument, clients: Arc<ClientRegistry>) -> Result<Self> {
        let partition_keys = config.require_string_list("connector.partition-keys")?;
        if partition_keys.is_empty() {
            return Err(Error::Config(
                "connector.partition-keys must name at least one column".to_string(),
            ));
        }
        let clustering_keys = config
            .get_string_list("connector.clustering-keys")?
            .unwrap_or_default();

        let mut key_fields = partition_keys;
        key_fields.extend(clustering_keys);

        Ok(Self {
            common: MapperCommon::from_config(config)?,
            clients,
            target_table: config.require_string("connector.target-table")?,
            include_fields: config.require_string_list("connector.include-fields")?,
            key_fields,
        })
    }

    fn statement(&self, record: &ChangeRecord) -> Result<BoundStatement> {
        let bind = |image: Option<&BTreeMap<String, CellValue>>,
                    fields: &[String],
                    required: bool|
         -> Result<Vec<(String, CellValue)>> {
            let image = image.ok_or_else(|| {
                Error::UnsupportedType(format!(
                    "record {} has no image for a {} write",
                    record.sequence_number, record.operation
                ))
            })?;
            let mut bindings = Vec::with_capacity(fields.len());
            for field in fields {
                match image.get(field) {
                    Some(value) => bindings.push((field.clone(), value.clone())),
                    None if required => {
                        return Err(Error::Config(format!(
                            "key column '{field}' is missing from the record image; \
                             check connector.partition-keys and connector.clustering-keys"
                        )))
                    }
                    None => {}
                }
            }
            Ok(bindings)
        };

        if record.operation.is_upsert() {
            Ok(BoundStatement {
                kind: StatementKind::Upsert,
                table: self.target_table.clone(),
                bindings: bind(record.new_image.as_ref(), &self.include_fields, false)?,
            })
        } else {
            Ok(BoundStatement {
                kind: StatementKind::Delete,
                table: self.target_table.clone(),
                bindings: bind(record.old_image.as_ref(), &self.key_fields, true)?,
            })
        }
    }

    /// One write with up to `max-retries` linear-backoff re-attempts.
    async fn execute(
        &self,
        statement: &BoundStatement,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let writer = self.clients.table_writer().await?;
        let max_retries = self.common.retry.max_retries();
        let mut attempt = 0u32;

        loop {
            match writer.execute(statement).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < max_retries => {
                    if cancel.is_cancelled() {
                        return Err(err);
                    }
                    attempt += 1;
                    metrics::counter!("batch_retries").increment(1);
                    let delay = LINEAR_BACKOFF_BASE * attempt;
                    tracing::warn!(
                        table = %self.target_table,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "table write failed; backing off"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait::async_trait]
impl TargetMapper for TableMapper {
    fn name(&self) -> &'static str {
        "secondary-table"
    }

    fn common(&self) -> &MapperCommon {
        &self.common
    }

    async fn initialize(&self) -> Result<()> {
        self.clients.table_writer().await?;
        Ok(())
    }

    async fn handle_records(
        &self,
        batch: &[ChangeRecord],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for record in batch {
            let statement = self.statement(record)?;
            self.execute(&statement, cancel).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use streams::OperationType;
    use test_support::clients::MemoryTableWriter;

    fn config(extra: &[(&str, &str)]) -> ConfigDocument {
        let mut pairs = vec![
            ("CONNECTOR_TARGET_TABLE", "plays_by_user"),
            ("CONNECTOR_INCLUDE_FIELDS", "id,v"),
            ("CONNECTOR_PARTITION_KEYS", "id"),
            ("CONNECTOR_CLUSTERING_KEYS", ""),
        ];
        pairs.extend_from_slice(extra);
        ConfigDocument::from_env(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn mapper(extra: &[(&str, &str)]) -> (TableMapper, Arc<MemoryTableWriter>) {
        let writer = Arc::new(MemoryTableWriter::new());
        let clients = Arc::new(ClientRegistry::new().with_table_writer(writer.clone()));
        (
            TableMapper::from_config(&config(extra), clients).unwrap(),
            writer,
        )
    }

    fn image(pairs: Vec<(&str, CellValue)>) -> BTreeMap<String, CellValue> {
        pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    #[tokio::test]
    async fn upserts_carry_include_fields_from_the_new_image() {
        let (mapper, writer) = mapper(&[]);
        let record = ChangeRecord {
            sequence_number: "1".into(),
            arrival_time: 0,
            operation: OperationType::Update,
            new_image: Some(image(vec![
                ("id", CellValue::Text("k".to_string())),
                ("v", CellValue::Int(1)),
                ("ignored", CellValue::Int(9)),
            ])),
            old_image: Some(image(vec![("id", CellValue::Text("k".to_string()))])),
        };

        mapper
            .handle_records(&[record], &CancellationToken::new())
            .await
            .unwrap();

        let statements = writer.statements();
        assert_eq!(
            statements,
            vec![BoundStatement {
                kind: StatementKind::Upsert,
                table: "plays_by_user".to_string(),
                bindings: vec![
                    ("id".to_string(), CellValue::Text("k".to_string())),
                    ("v".to_string(), CellValue::Int(1)),
                ],
            }]
        );
    }

    #[tokio::test]
    async fn ttl_expiry_deletes_by_key_from_the_old_image() {
        let (mapper, writer) = mapper(&[]);
        let record = ChangeRecord {
            sequence_number: "1".into(),
            arrival_time: 0,
            operation: OperationType::Ttl,
            new_image: None,
            old_image: Some(image(vec![
                ("id", CellValue::Text("k".to_string())),
                ("v", CellValue::Int(1)),
            ])),
        };

        mapper
            .handle_records(&[record], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            writer.statements(),
            vec![BoundStatement {
                kind: StatementKind::Delete,
                table: "plays_by_user".to_string(),
                bindings: vec![("id".to_string(), CellValue::Text("k".to_string()))],
            }]
        );
    }

    #[tokio::test]
    async fn missing_key_column_is_a_config_error() {
        let (mapper, _) = mapper(&[]);
        let record = ChangeRecord {
            sequence_number: "1".into(),
            arrival_time: 0,
            operation: OperationType::Delete,
            new_image: None,
            old_image: Some(image(vec![("v", CellValue::Int(1))])),
        };

        let err = mapper
            .handle_records(&[record], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn writes_retry_with_linear_backoff() {
        let writer = Arc::new(MemoryTableWriter::new());
        writer.fail_next(2);
        let clients = Arc::new(ClientRegistry::new().with_table_writer(writer.clone()));
        let mapper = TableMapper::from_config(&config(&[]), clients).unwrap();

        let record = ChangeRecord {
            sequence_number: "1".into(),
            arrival_time: 0,
            operation: OperationType::Insert,
            new_image: Some(image(vec![("id", CellValue::Text("k".to_string()))])),
            old_image: None,
        };

        tokio::time::pause();
        let started = tokio::time::Instant::now();
        mapper
            .handle_records(&[record], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(writer.attempts(), 3);
        // 100ms * 1 + 100ms * 2.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }
}
