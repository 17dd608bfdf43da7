//! The concrete target mappers and the sink-client seams they write
//! through.

pub mod clients;
mod columnar;
pub mod local;
pub mod object_store;
pub mod queue;
pub mod table;
pub mod vector;

pub use clients::{
    BatchSendOutcome, BoundStatement, ClientRegistry, EmbeddingClient, FailedEntry, ObjectStore,
    QueueClient, QueueEntry, StatementKind, TableWriter, VectorIndex, VectorUpsert,
};
pub use object_store::ObjectStoreMapper;
pub use queue::QueueMapper;
pub use table::TableMapper;
pub use vector::VectorMapper;

use connector::{MapperRegistry, TargetMapper};
use std::sync::Arc;

/// The registry of every in-tree sink, searchable by unqualified name.
pub fn mapper_registry() -> MapperRegistry<Arc<ClientRegistry>> {
    let mut registry = MapperRegistry::new().with_prefix("sinks");

    registry.register("sinks.object-store", |config, clients: &Arc<ClientRegistry>| {
        ObjectStoreMapper::from_config(config, clients.clone())
            .map(|mapper| Box::new(mapper) as Box<dyn TargetMapper>)
    });
    registry.register("sinks.secondary-table", |config, clients: &Arc<ClientRegistry>| {
        TableMapper::from_config(config, clients.clone())
            .map(|mapper| Box::new(mapper) as Box<dyn TargetMapper>)
    });
    registry.register("sinks.vector-index", |config, clients: &Arc<ClientRegistry>| {
        VectorMapper::from_config(config, clients.clone())
            .map(|mapper| Box::new(mapper) as Box<dyn TargetMapper>)
    });
    registry.register("sinks.queue", |config, clients: &Arc<ClientRegistry>| {
        QueueMapper::from_config(config, clients.clone())
            .map(|mapper| Box::new(mapper) as Box<dyn TargetMapper>)
    });

    registry
}
