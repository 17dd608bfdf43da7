//! Scriptable in-memory collaborators for tests: the stream transport, the
//! lease store, every sink client, and a recording target mapper.

pub mod clients;
pub mod mapper;
pub mod records;
pub mod store;
pub mod transport;

pub use clients::{
    FixedEmbedder, MemoryObjectStore, MemoryQueue, MemoryTableWriter, MemoryVectorIndex,
};
pub use mapper::RecordingMapper;
pub use store::MemoryLeaseStore;
pub use transport::MemoryTransport;
