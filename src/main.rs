use std::sync::Arc;

use probebeat::config::{BeatConfig, RuntimeContext};
use probebeat::scheduler::{run_event_writer, Scheduler};
use probebeat::tasks::build_tasks;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("probebeat=info".parse()?))
        .init();

    let mut cfg = BeatConfig::load()?;
    cfg.clean()?;
    let runtime = Arc::new(RuntimeContext::new(&cfg));
    tracing::info!(
        "starting probebeat on node {} (proc root {})",
        cfg.node.node_id(),
        runtime.proc_root.display()
    );

    let (tx, rx) = mpsc::channel(cfg.event_buffer_size);
    let writer = if cfg.output_path.is_empty() {
        tokio::spawn(run_event_writer(rx, tokio::io::stdout()))
    } else {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.output_path)
            .await?;
        tracing::info!("writing events to {}", cfg.output_path);
        tokio::spawn(run_event_writer(rx, file))
    };

    let tasks = build_tasks(&cfg, &runtime);
    if tasks.is_empty() {
        tracing::warn!("no task configured");
    }
    let scheduler = Scheduler::new(cfg.check_interval, tx);
    scheduler.start(tasks).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    scheduler.stop(cfg.clean_up_timeout).await;
    drop(scheduler);
    if tokio::time::timeout(cfg.clean_up_timeout, writer).await.is_err() {
        tracing::warn!("event writer did not drain within {:?}", cfg.clean_up_timeout);
    }

    Ok(())
}
