//! Stagger Dispatcher Binary
//!
//! Runs the dispatcher until Ctrl-C. With `queue.database_url` set, the source
//! queue and dead-letter sinks are pgmq queues; otherwise both are in-memory,
//! which is only useful for local smoke runs.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stagger_dispatch::config::ConfigManager;
use stagger_dispatch::downstream::SimulatedRowOperation;
use stagger_dispatch::logging::init_structured_logging;
use stagger_dispatch::messaging::{
    DeadLetterSink, InMemoryDeadLetterSink, InMemoryQueue, PgmqQueue, QueueClient,
};
use stagger_dispatch::orchestration::Dispatcher;
use stagger_dispatch::storage::FileSystemObjectStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let config_manager = ConfigManager::load().context("failed to load dispatcher configuration")?;
    let config = config_manager.config();
    info!(
        environment = %config_manager.environment(),
        config = %config_manager.debug_config(),
        "Effective configuration"
    );

    let sink_names = [
        config.dead_letter.parse_sink.as_str(),
        config.dead_letter.invoke_sink.as_str(),
        config.dead_letter.dispatch_sink.as_str(),
    ];

    let (queue, sink): (Arc<dyn QueueClient>, Arc<dyn DeadLetterSink>) =
        match &config.queue.database_url {
            Some(database_url) => {
                let pgmq = PgmqQueue::connect(
                    database_url,
                    config.queue.queue_name.clone(),
                    config.queue.visibility_timeout_seconds,
                )
                .await
                .context("failed to connect to pgmq")?;
                pgmq.ensure_queues(&sink_names)
                    .await
                    .context("failed to create queues")?;
                let pgmq = Arc::new(pgmq);
                (pgmq.clone(), pgmq)
            }
            None => {
                warn!("No database_url configured; using in-memory queue and sinks");
                (
                    Arc::new(InMemoryQueue::new(
                        config.queue.queue_name.clone(),
                        Duration::from_secs(u64::from(config.queue.visibility_timeout_seconds)),
                    )),
                    Arc::new(InMemoryDeadLetterSink::new(sink_names)),
                )
            }
        };

    let store = Arc::new(FileSystemObjectStore::new(&config.storage.root_directory));
    let operation = Arc::new(SimulatedRowOperation::default());
    let dispatcher = Arc::new(Dispatcher::new(config, queue, sink, store, operation));

    let cancel = CancellationToken::new();

    let metrics_interval = Duration::from_secs(config.telemetry.metrics_log_interval_seconds.max(1));
    let metrics_task = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(metrics_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = dispatcher.metrics();
                        info!(
                            batches = snapshot.batches,
                            items_processed = snapshot.items_processed,
                            items_failed = snapshot.items_failed,
                            items_released = snapshot.items_released,
                            dead_lettered = snapshot.dead_lettered(),
                            rows_processed = snapshot.rows_processed,
                            rows_failed = snapshot.rows_failed,
                            poll_failures = snapshot.poll_failures,
                            sink_failures = snapshot.sink_failures,
                            "Dispatcher metrics"
                        );
                    }
                }
            }
        })
    };

    let run_task = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    cancel.cancel();

    let grace = config.dispatch.shutdown_grace() + config.row_processing.cancellation_grace();
    match tokio::time::timeout(grace, run_task).await {
        Ok(joined) => joined.context("dispatcher task panicked")??,
        Err(_) => warn!(
            grace_ms = grace.as_millis() as u64,
            "Dispatcher did not stop within the shutdown grace period"
        ),
    }
    metrics_task.abort();

    info!(run_id = %dispatcher.run_id(), "Dispatcher stopped");
    Ok(())
}
