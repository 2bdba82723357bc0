use anyhow::Context;

use jobrun_scheduler::{App, SchedulerConfig};

fn main() -> anyhow::Result<()> {
    jobrun_observability::init();

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;

    // Store calls block on this runtime from worker threads, so the process
    // drives it explicitly rather than running inside it.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let app = App::build(config, runtime.handle()).context("failed to open run store")?;
    let reaper = app.spawn_reaper().context("failed to spawn reaper")?;

    tracing::info!(
        server_id = %app.config().server_id,
        store = app.store().kind(),
        "scheduler running; press Ctrl-C to stop"
    );

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("shutting down");
    reaper.shutdown();
    Ok(())
}
