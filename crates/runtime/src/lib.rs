pub mod logging;
pub mod processor;
pub mod scheduler;

pub use processor::{ProcessorOutcome, ShardProcessor};
pub use scheduler::Scheduler;
