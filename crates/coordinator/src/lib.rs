mod coordinator;
mod lease;
mod store;

pub use coordinator::{
    worker_identity, Coordinator, CoordinatorConfig, CoordinatorHandle, ShardAssignment,
};
pub use lease::Lease;
pub use store::{CasOutcome, FsLeaseStore, LeaseStore};
