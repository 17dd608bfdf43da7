use crate::{
    Checkpoint, Error, Result, Shard, ShardIterator, ShardPage, StreamLabel, StreamRecord,
    StreamTransport,
};
use std::collections::VecDeque;
use std::path::PathBuf;

/// A filesystem-backed stream transport for local development and
/// integration tests. The data directory holds a `stream.yaml` topology and
/// one JSONL file of ordered records per shard:
///
/// ```text
/// <root>/stream.yaml
/// <root>/shards/<shard_id>.jsonl
/// ```
///
/// Shard files are finite, so every shard reaches its end-of-shard marker
/// once fully read.
pub struct LocalTransport {
    root: PathBuf,
}

#[derive(Debug, serde::Deserialize)]
struct StreamSpec {
    stream_id: String,
    keyspace: String,
    table: String,
    #[serde(default)]
    label: Option<String>,
    shards: Vec<Shard>,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_spec(&self) -> Result<StreamSpec> {
        let path = self.root.join("stream.yaml");
        let raw = tokio::fs::read_to_string(&path).await.map_err(|err| {
            Error::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|err| Error::Config(format!("invalid {}: {err}", path.display())))
    }
}

#[async_trait::async_trait]
impl StreamTransport for LocalTransport {
    async fn list_streams(&self, keyspace: &str, table: &str) -> Result<Vec<StreamLabel>> {
        let spec = self.read_spec().await?;
        if spec.keyspace == keyspace && spec.table == table {
            Ok(vec![StreamLabel {
                stream_id: spec.stream_id,
                label: spec.label,
            }])
        } else {
            Ok(Vec::new())
        }
    }

    async fn list_shards(&self, stream_id: &str) -> Result<Vec<Shard>> {
        let spec = self.read_spec().await?;
        if spec.stream_id != stream_id {
            return Err(Error::Config(format!(
                "unknown stream '{stream_id}' (local stream is '{}')",
                spec.stream_id
            )));
        }
        Ok(spec.shards)
    }

    async fn open_iterator(
        &self,
        stream_id: &str,
        shard_id: &str,
        from: &Checkpoint,
    ) -> Result<Box<dyn ShardIterator>> {
        // Validates the stream id and shard membership.
        let shards = self.list_shards(stream_id).await?;
        if !shards.iter().any(|shard| shard.shard_id == shard_id) {
            return Err(Error::Config(format!(
                "unknown shard '{shard_id}' in stream '{stream_id}'"
            )));
        }

        let mut pending = VecDeque::new();
        if !from.is_shard_end() {
            let path = self.root.join("shards").join(format!("{shard_id}.jsonl"));
            let raw = tokio::fs::read_to_string(&path).await?;

            for line in raw.lines().filter(|line| !line.trim().is_empty()) {
                let record: StreamRecord = serde_json::from_str(line)?;
                if Checkpoint::Sequence(record.sequence_number.clone()) > *from {
                    pending.push_back(record);
                }
            }
        }

        Ok(Box::new(LocalIterator {
            pending,
            position: from.clone(),
            exhausted: false,
        }))
    }
}

struct LocalIterator {
    pending: VecDeque<StreamRecord>,
    position: Checkpoint,
    exhausted: bool,
}

/// Records per page; small enough to exercise multi-page reads locally.
const PAGE_SIZE: usize = 100;

#[async_trait::async_trait]
impl ShardIterator for LocalIterator {
    async fn next(&mut self) -> Result<ShardPage> {
        if self.exhausted {
            return Err(Error::ShardEnded);
        }

        let take = PAGE_SIZE.min(self.pending.len());
        let records: Vec<_> = self.pending.drain(..take).collect();

        if let Some(last) = records.last() {
            self.position = Checkpoint::Sequence(last.sequence_number.clone());
        }
        let end_of_shard = self.pending.is_empty();
        self.exhausted = end_of_shard;

        Ok(ShardPage {
            records,
            next_checkpoint: self.position.clone(),
            end_of_shard,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Origin;

    async fn fixture(records: &[StreamRecord]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let spec = r#"
stream_id: stream-1
keyspace: ks
table: orders
shards:
  - shard_id: s-0
    parent_shard_ids: []
    hash_range: {start: -100, end: 100}
"#;
        std::fs::write(dir.path().join("stream.yaml"), spec).unwrap();
        std::fs::create_dir(dir.path().join("shards")).unwrap();

        let lines: Vec<String> = records
            .iter()
            .map(|record| serde_json::to_string(record).unwrap())
            .collect();
        std::fs::write(dir.path().join("shards/s-0.jsonl"), lines.join("\n")).unwrap();
        dir
    }

    fn record(seq: &str) -> StreamRecord {
        StreamRecord {
            sequence_number: seq.into(),
            arrival_time: 0,
            origin: Origin::User,
            new_image: Some(Default::default()),
            old_image: None,
        }
    }

    #[tokio::test]
    async fn resolves_streams_by_keyspace_and_table() {
        let dir = fixture(&[]).await;
        let transport = LocalTransport::new(dir.path());

        let streams = transport.list_streams("ks", "orders").await.unwrap();
        assert_eq!(streams[0].stream_id, "stream-1");
        assert!(transport.list_streams("ks", "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn iterates_from_a_checkpoint_to_shard_end() {
        let dir = fixture(&[record("10"), record("11"), record("12")]).await;
        let transport = LocalTransport::new(dir.path());

        let mut iter = transport
            .open_iterator("stream-1", "s-0", &Checkpoint::sequence("10"))
            .await
            .unwrap();
        let page = iter.next().await.unwrap();

        let sequences: Vec<_> = page
            .records
            .iter()
            .map(|r| r.sequence_number.as_str().to_string())
            .collect();
        assert_eq!(sequences, vec!["11", "12"]);
        assert!(page.end_of_shard);
        assert_eq!(page.next_checkpoint, Checkpoint::sequence("12"));

        assert!(matches!(iter.next().await, Err(Error::ShardEnded)));
    }

    #[tokio::test]
    async fn shard_end_checkpoint_opens_an_exhausted_iterator() {
        let dir = fixture(&[record("10")]).await;
        let transport = LocalTransport::new(dir.path());

        let mut iter = transport
            .open_iterator("stream-1", "s-0", &Checkpoint::ShardEnd)
            .await
            .unwrap();
        let page = iter.next().await.unwrap();
        assert!(page.records.is_empty());
        assert!(page.end_of_shard);
    }
}
