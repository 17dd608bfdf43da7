use connector::{MapperCommon, TargetMapper};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use streams::{ChangeRecord, Error, Result};
use tokio_util::sync::CancellationToken;

/// A mapper that records every delivered batch and can be scripted to fail
/// the next deliveries.
pub struct RecordingMapper {
    common: MapperCommon,
    batches: Mutex<Vec<Vec<ChangeRecord>>>,
    fail_next: Mutex<Vec<Error>>,
    initializations: AtomicU32,
}

impl RecordingMapper {
    pub fn new() -> Self {
        let config = config::ConfigDocument::from_env(Default::default());
        Self {
            common: MapperCommon::from_config(&config).expect("empty config is valid"),
            batches: Mutex::new(Vec::new()),
            fail_next: Mutex::new(Vec::new()),
            initializations: AtomicU32::new(0),
        }
    }

    pub fn with_filter(expression: &str) -> Self {
        let env = [(
            "CONNECTOR_FILTER_EXPRESSION".to_string(),
            expression.to_string(),
        )]
        .into_iter()
        .collect();
        let config = config::ConfigDocument::from_env(env);
        Self {
            common: MapperCommon::from_config(&config).expect("filter compiles"),
            ..Self::new()
        }
    }

    /// Queue errors to be returned by upcoming `handle_records` calls, in
    /// order.
    pub fn fail_next(&self, errors: Vec<Error>) {
        self.fail_next.lock().unwrap().extend(errors);
    }

    pub fn batches(&self) -> Vec<Vec<ChangeRecord>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn delivered_sequences(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|record| record.sequence_number.as_str().to_string())
            .collect()
    }

    pub fn initializations(&self) -> u32 {
        self.initializations.load(Ordering::SeqCst)
    }
}

impl Default for RecordingMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TargetMapper for RecordingMapper {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn common(&self) -> &MapperCommon {
        &self.common
    }

    async fn initialize(&self) -> Result<()> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_records(
        &self,
        batch: &[ChangeRecord],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let scripted = {
            let mut fail_next = self.fail_next.lock().unwrap();
            if fail_next.is_empty() {
                None
            } else {
                Some(fail_next.remove(0))
            }
        };
        if let Some(err) = scripted {
            return Err(err);
        }

        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}
