use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use streams::{
    Checkpoint, Error, Result, Shard, ShardIterator, ShardPage, StreamLabel, StreamRecord,
    StreamTransport,
};

const PAGE_SIZE: usize = 100;

#[derive(Default)]
struct State {
    shards: Vec<Shard>,
    /// Ordered records per shard.
    records: HashMap<String, Vec<StreamRecord>>,
    /// Shards still open: reaching their tail yields empty non-terminal
    /// pages instead of the end-of-shard marker.
    open: HashMap<String, bool>,
    fail_next_list: u32,
    fail_next_read: u32,
}

/// A scriptable in-memory stream transport. Iterators observe records
/// pushed after they were opened, like a live shard.
pub struct MemoryTransport {
    stream_id: String,
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    pub fn new(stream_id: &str) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Register a shard. `open` shards keep accepting records; closed
    /// shards end once their current records are drained.
    pub fn add_shard(&self, shard: Shard, open: bool) {
        let mut state = self.state.lock().unwrap();
        state.open.insert(shard.shard_id.clone(), open);
        state.records.entry(shard.shard_id.clone()).or_default();
        state.shards.push(shard);
    }

    pub fn push_records(&self, shard_id: &str, records: Vec<StreamRecord>) {
        self.state
            .lock()
            .unwrap()
            .records
            .entry(shard_id.to_string())
            .or_default()
            .extend(records);
    }

    /// Close an open shard; its iterator ends after the remaining records.
    pub fn close_shard(&self, shard_id: &str) {
        self.state
            .lock()
            .unwrap()
            .open
            .insert(shard_id.to_string(), false);
    }

    /// Drop a shard from enumeration (retention expiry).
    pub fn retire_shard(&self, shard_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.shards.retain(|shard| shard.shard_id != shard_id);
    }

    pub fn fail_next_list_shards(&self, n: u32) {
        self.state.lock().unwrap().fail_next_list = n;
    }

    pub fn fail_next_read(&self, n: u32) {
        self.state.lock().unwrap().fail_next_read = n;
    }
}

#[async_trait::async_trait]
impl StreamTransport for MemoryTransport {
    async fn list_streams(&self, _keyspace: &str, _table: &str) -> Result<Vec<StreamLabel>> {
        Ok(vec![StreamLabel {
            stream_id: self.stream_id.clone(),
            label: None,
        }])
    }

    async fn list_shards(&self, stream_id: &str) -> Result<Vec<Shard>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_list > 0 {
            state.fail_next_list -= 1;
            return Err(Error::transient("list shards", "scripted failure"));
        }
        if stream_id != self.stream_id {
            return Err(Error::Config(format!("unknown stream '{stream_id}'")));
        }
        Ok(state.shards.clone())
    }

    async fn open_iterator(
        &self,
        _stream_id: &str,
        shard_id: &str,
        from: &Checkpoint,
    ) -> Result<Box<dyn ShardIterator>> {
        if !self.state.lock().unwrap().records.contains_key(shard_id) {
            return Err(Error::Config(format!("unknown shard '{shard_id}'")));
        }

        Ok(Box::new(MemoryIterator {
            state: self.state.clone(),
            shard_id: shard_id.to_string(),
            position: from.clone(),
        }))
    }
}

struct MemoryIterator {
    state: Arc<Mutex<State>>,
    shard_id: String,
    position: Checkpoint,
}

#[async_trait::async_trait]
impl ShardIterator for MemoryIterator {
    async fn next(&mut self) -> Result<ShardPage> {
        let (all, open) = {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_read > 0 {
                state.fail_next_read -= 1;
                return Err(Error::transient("shard read", "scripted failure"));
            }
            (
                state.records.get(&self.shard_id).cloned().unwrap_or_default(),
                state.open.get(&self.shard_id).copied().unwrap_or(false),
            )
        };

        if self.position.is_shard_end() {
            return Ok(ShardPage {
                records: Vec::new(),
                next_checkpoint: Checkpoint::ShardEnd,
                end_of_shard: true,
            });
        }

        let records: Vec<StreamRecord> = all
            .into_iter()
            .filter(|record| {
                Checkpoint::Sequence(record.sequence_number.clone()) > self.position
            })
            .take(PAGE_SIZE)
            .collect();

        if let Some(last) = records.last() {
            self.position = Checkpoint::Sequence(last.sequence_number.clone());
        }
        let drained = records.len() < PAGE_SIZE;

        Ok(ShardPage {
            records,
            next_checkpoint: self.position.clone(),
            end_of_shard: drained && !open,
        })
    }
}
