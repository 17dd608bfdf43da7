use anyhow::Context;
use clap::Parser;
use config::{ConfigDocument, Settings};
use connector::TargetMapper;
use coordinator::FsLeaseStore;
use runtime::{logging, Scheduler};
use sinks::local::{FsObjectStore, HashEmbedder, JsonlWriter};
use sinks::ClientRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use streams::{local::LocalTransport, StreamTransport};
use tokio_util::sync::CancellationToken;

/// A change-data-capture stream consumer: reads ordered change events from
/// a table's CDC stream shards and delivers them to the configured target
/// mapper, coordinating shard ownership and checkpoints across workers.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Path to the connector configuration document.
    #[arg(long, env = "CONFIG_PATH")]
    config: PathBuf,

    /// Data directory holding the local stream (`stream.yaml`, `shards/`),
    /// the lease store and sink outputs. Cloud transports and sinks plug in
    /// behind the same traits and are wired by their own builds.
    #[arg(long, env = "DATA_DIR")]
    data_dir: PathBuf,

    /// Prometheus exporter listen port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();
    let cli = Cli::parse();

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], cli.metrics_port))
        .install()
        .context("failed to install the prometheus metrics exporter")?;

    let config = ConfigDocument::load(&cli.config)?;
    let settings = Settings::from_config(&config)?;

    let transport: Arc<dyn StreamTransport> = Arc::new(LocalTransport::new(&cli.data_dir));
    let store = Arc::new(FsLeaseStore::new(cli.data_dir.join("leases")));

    let stream_id = settings.stream.resolve(transport.as_ref()).await?;
    let worker_id = coordinator::worker_identity(settings.coordinator.worker_id.clone());

    let out = cli.data_dir.join("out");
    let clients = Arc::new(
        ClientRegistry::new()
            .with_object_store(Arc::new(FsObjectStore::new(out.join("objects"))))
            .with_table_writer(Arc::new(JsonlWriter::new(out.join("table.jsonl"))))
            .with_vector_index(Arc::new(JsonlWriter::new(out.join("vectors.jsonl"))))
            .with_queue(Arc::new(JsonlWriter::new(out.join("queue.jsonl"))))
            .with_embedding(Arc::new(HashEmbedder)),
    );

    let target = config.require_string("connector.target")?;
    let mapper: Arc<dyn TargetMapper> =
        Arc::from(sinks::mapper_registry().instantiate(&target, &config, &clients)?);

    tracing::info!(
        worker_id = %worker_id,
        stream_id = %stream_id,
        mapper = mapper.name(),
        "starting connector"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; beginning graceful shutdown");
                shutdown.cancel();
            }
        }
    });

    Scheduler::new(transport, store, mapper, settings, stream_id, worker_id)
        .run(shutdown)
        .await?;
    Ok(())
}
