use crate::clients::{ClientRegistry, VectorUpsert};
use config::ConfigDocument;
use connector::{pack, with_retries, BatchLimits, MapperCommon, RetryPolicy, TargetMapper};
use std::sync::Arc;
use std::time::Duration;
use streams::{CellValue, ChangeRecord, Error, Result};
use tokio_util::sync::CancellationToken;

/// Default embedding model when `connector.embedding-model` is not set.
const DEFAULT_EMBEDDING_MODEL: &str = "amazon.titan-embed-text-v2:0";
/// Upper bound of one `put_vectors` call.
const MAX_VECTORS_PER_PUT: usize = 500;

/// Embeds one field of each record and writes the vectors, with metadata
/// drawn from `metadata-fields`, into a vector index.
pub struct VectorMapper {
    common: MapperCommon,
    clients: Arc<ClientRegistry>,
    bucket: String,
    index_name: String,
    embedding_field: String,
    key_field: String,
    metadata_fields: Vec<String>,
    dimensions: usize,
    model: String,
    /// Model invocations retry independently of the batch put.
    model_retry: RetryPolicy,
}

impl VectorMapper {
    pub fn from_config(config: &ConfigDocument, clients: Arc<ClientRegistry>) -> Result<Self> {
        let common = MapperCommon::from_config(config)?;
        let dimensions = config.get_i64("connector.dimensions")?.unwrap_or(256);
        if dimensions <= 0 {
            return Err(Error::Config(format!(
                "connector.dimensions must be positive, got {dimensions}"
            )));
        }

        Ok(Self {
            model_retry: common.retry.clone().with_base(Duration::from_millis(250)),
            clients,
            bucket: config.require_string("connector.bucket")?,
            index_name: config.require_string("connector.index-name")?,
            embedding_field: config.require_string("connector.embedding-field")?,
            key_field: config.require_string("connector.key-field")?,
            metadata_fields: config
                .get_string_list("connector.metadata-fields")?
                .unwrap_or_default(),
            dimensions: dimensions as usize,
            model: config
                .get_string("connector.embedding-model")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            common,
        })
    }

    /// The text to embed: `embedding-field`, falling back to `key-field`
    /// (with a warning) when empty or absent. Both missing is a
    /// configuration error.
    fn embedding_source(&self, record: &ChangeRecord, key: &str) -> Result<String> {
        let image = record.state_image();
        let text = image
            .and_then(|image| image.get(&self.embedding_field))
            .and_then(|value| match value {
                CellValue::Text(s) if !s.is_empty() => Some(s.clone()),
                _ => None,
            });

        match text {
            Some(text) => Ok(text),
            None if !key.is_empty() => {
                tracing::warn!(
                    sequence_number = %record.sequence_number,
                    embedding_field = %self.embedding_field,
                    "embedding field is empty; falling back to the key field"
                );
                Ok(key.to_string())
            }
            None => Err(Error::Config(format!(
                "record {} carries neither '{}' nor '{}'; check connector.embedding-field \
                 and connector.key-field",
                record.sequence_number, self.embedding_field, self.key_field
            ))),
        }
    }

    fn vector_key(&self, record: &ChangeRecord) -> String {
        match record
            .state_image()
            .and_then(|image| image.get(&self.key_field))
        {
            Some(CellValue::Text(s)) => s.clone(),
            Some(other) => other.to_json().to_string(),
            None => String::new(),
        }
    }

    /// Coerce metadata cells: strings, numbers and booleans pass through;
    /// anything else is unsupported.
    fn metadata(
        &self,
        record: &ChangeRecord,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut metadata = serde_json::Map::new();
        let Some(image) = record.state_image() else {
            return Ok(metadata);
        };

        for field in &self.metadata_fields {
            let Some(value) = image.get(field) else {
                continue;
            };
            match value {
                CellValue::Text(_)
                | CellValue::Int(_)
                | CellValue::BigInt(_)
                | CellValue::Float(_)
                | CellValue::Double(_)
                | CellValue::Boolean(_) => {
                    metadata.insert(field.clone(), value.to_json());
                }
                other => {
                    return Err(Error::UnsupportedType(format!(
                        "metadata field '{field}' has type {} which the vector index \
                         cannot store",
                        other.kind()
                    )))
                }
            }
        }
        Ok(metadata)
    }
}

#[async_trait::async_trait]
impl TargetMapper for VectorMapper {
    fn name(&self) -> &'static str {
        "vector-index"
    }

    fn common(&self) -> &MapperCommon {
        &self.common
    }

    async fn initialize(&self) -> Result<()> {
        self.clients.vector_index().await?;
        self.clients.embedding().await?;
        Ok(())
    }

    async fn handle_records(
        &self,
        batch: &[ChangeRecord],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let embedder = self.clients.embedding().await?;
        let index = self.clients.vector_index().await?;

        let mut upserts = Vec::with_capacity(batch.len());
        for record in batch {
            let key = self.vector_key(record);
            let text = self.embedding_source(record, &key)?;
            if key.is_empty() {
                return Err(Error::Config(format!(
                    "record {} carries no '{}' value to key its vector",
                    record.sequence_number, self.key_field
                )));
            }

            let vector = with_retries(&self.model_retry, cancel, "embedding model", |_| {
                let (embedder, model, text) = (embedder.clone(), self.model.clone(), text.clone());
                async move { embedder.embed(&model, &text, self.dimensions).await }
            })
            .await?;

            if vector.len() != self.dimensions {
                return Err(Error::Fatal(anyhow::anyhow!(
                    "embedding model returned {} dimensions, expected {}",
                    vector.len(),
                    self.dimensions
                )));
            }

            upserts.push(VectorUpsert {
                key,
                vector,
                metadata: self.metadata(record)?,
            });
        }

        for chunk in pack(
            upserts,
            &BatchLimits {
                max_count: MAX_VECTORS_PER_PUT,
                max_bytes: usize::MAX,
            },
            |_| 0,
        ) {
            with_retries(&self.common.retry, cancel, "vector-index put", |attempt| {
                let (index, chunk) = (index.clone(), chunk.clone());
                async move {
                    tracing::debug!(
                        index = %self.index_name,
                        vectors = chunk.len(),
                        attempt,
                        "writing vectors"
                    );
                    index
                        .put_vectors(&self.bucket, &self.index_name, &chunk)
                        .await
                }
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use streams::OperationType;
    use test_support::clients::{FixedEmbedder, MemoryVectorIndex};

    fn config(extra: &[(&str, &str)]) -> ConfigDocument {
        let mut pairs = vec![
            ("CONNECTOR_BUCKET", "vectors"),
            ("CONNECTOR_INDEX_NAME", "plays"),
            ("CONNECTOR_EMBEDDING_FIELD", "title"),
            ("CONNECTOR_KEY_FIELD", "id"),
            ("CONNECTOR_DIMENSIONS", "4"),
        ];
        pairs.extend_from_slice(extra);
        ConfigDocument::from_env(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn record(pairs: Vec<(&str, CellValue)>) -> ChangeRecord {
        let image: BTreeMap<String, CellValue> = pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        ChangeRecord {
            sequence_number: "1".into(),
            arrival_time: 0,
            operation: OperationType::Insert,
            new_image: Some(image),
            old_image: None,
        }
    }

    fn mapper(extra: &[(&str, &str)]) -> (VectorMapper, Arc<MemoryVectorIndex>) {
        let index = Arc::new(MemoryVectorIndex::new());
        let clients = Arc::new(
            ClientRegistry::new()
                .with_vector_index(index.clone())
                .with_embedding(Arc::new(FixedEmbedder)),
        );
        (
            VectorMapper::from_config(&config(extra), clients).unwrap(),
            index,
        )
    }

    #[tokio::test]
    async fn embeds_the_configured_field_with_metadata() {
        let (mapper, index) =
            mapper(&[("CONNECTOR_METADATA_FIELDS", "plays,title")]);
        let record = record(vec![
            ("id", CellValue::Text("song-1".to_string())),
            ("title", CellValue::Text("Prelude".to_string())),
            ("plays", CellValue::BigInt(42)),
        ]);

        mapper
            .handle_records(&[record], &CancellationToken::new())
            .await
            .unwrap();

        let puts = index.puts();
        assert_eq!(puts.len(), 1);
        let (bucket, index_name, vectors) = &puts[0];
        assert_eq!((bucket.as_str(), index_name.as_str()), ("vectors", "plays"));
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].key, "song-1");
        assert_eq!(vectors[0].vector.len(), 4);
        assert_eq!(
            serde_json::Value::Object(vectors[0].metadata.clone()),
            serde_json::json!({"plays": 42, "title": "Prelude"})
        );
    }

    #[tokio::test]
    async fn falls_back_to_the_key_field() {
        let (mapper, index) = mapper(&[]);
        let record = record(vec![
            ("id", CellValue::Text("song-2".to_string())),
            ("title", CellValue::Text(String::new())),
        ]);

        mapper
            .handle_records(&[record], &CancellationToken::new())
            .await
            .unwrap();

        // The key field stood in for the empty embedding field.
        let puts = index.puts();
        assert_eq!(puts[0].2[0].key, "song-2");
    }

    #[tokio::test]
    async fn missing_embedding_and_key_is_a_config_error() {
        let (mapper, _) = mapper(&[]);
        let record = record(vec![("other", CellValue::Int(1))]);

        let err = mapper
            .handle_records(&[record], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn unsupported_metadata_types_fail_the_record() {
        let (mapper, _) = mapper(&[("CONNECTOR_METADATA_FIELDS", "raw")]);
        let record = record(vec![
            ("id", CellValue::Text("song-3".to_string())),
            ("title", CellValue::Text("t".to_string())),
            ("raw", CellValue::Blob(vec![1, 2, 3])),
        ]);

        let err = mapper
            .handle_records(&[record], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)), "{err}");
    }
}
