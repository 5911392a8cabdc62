//! BatchLoop Scheduler - Main Entry Point
//!
//! Demo node for the batching scheduler: loads a configuration, stands up a
//! coordinator in front of a reference scaling engine, pushes a burst of
//! requests through it and reports the aggregate counters.

use anyhow::Context;
use batchloop_common::config::BatchLoopConfig;
use batchloop_common::metrics::METRICS;
use batchloop_scheduler::{
    BatchCoordinator, ExecutionFlavor, NetworkSpec, PortSpec, ScaleExecutorFactory,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ITEM_LEN: usize = 16;
const BURST: usize = 32;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batchloop_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting BatchLoop scheduler");

    // Load configuration
    let config = match std::env::var("BATCHLOOP_CONFIG") {
        Ok(path) => BatchLoopConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => BatchLoopConfig::default(),
    };

    info!(
        "Configuration loaded: device={}, batch_size={}, window={:?}, fallback={:?}",
        config.device_id,
        config.batching.batch_size,
        config.batching_window(),
        config.fallback_timeout()
    );

    let spec = NetworkSpec::new(
        vec![PortSpec::new("input", vec![ITEM_LEN])],
        vec![PortSpec::new("input", vec![ITEM_LEN])],
    );
    let enable_metrics = config
        .observability
        .as_ref()
        .map(|o| o.enable_metrics)
        .unwrap_or(false);

    let coordinator = BatchCoordinator::new(
        config,
        spec,
        Box::new(ScaleExecutorFactory::new(2.0)),
    )
    .context("creating coordinator")?;

    // Push a burst of requests through the scheduler and collect the
    // completions through user callbacks.
    let (tx, rx) = crossbeam::channel::unbounded();
    let mut pairs = Vec::with_capacity(BURST);

    for i in 0..BURST {
        let (request, async_request) = coordinator
            .create_request()
            .context("creating request")?;

        let item: Vec<f32> = (0..ITEM_LEN).map(|j| (i * ITEM_LEN + j) as f32).collect();
        request.set_input("input", &item).context("setting input")?;

        let tx = tx.clone();
        let id = request.id();
        async_request.set_callback(Box::new(move |result| {
            let _ = tx.send((id, result));
        }));

        async_request.start().context("starting request")?;
        pairs.push((request, async_request));
    }

    let mut failures = 0usize;
    for _ in 0..BURST {
        let (id, result) = rx.recv().context("collecting completions")?;
        if let Err(err) = result {
            failures += 1;
            info!("Request {} failed: {}", id, err);
        }
    }

    let batched = pairs
        .iter()
        .filter(|(request, _)| request.flavor() == ExecutionFlavor::BatchExecuted)
        .count();
    let bypassed = pairs
        .iter()
        .filter(|(request, _)| request.flavor() == ExecutionFlavor::TimeoutExecuted)
        .count();
    info!(
        "Burst complete: {} requests, {} batched, {} bypassed, {} failed",
        BURST, batched, bypassed, failures
    );

    let counters = coordinator.aggregate_performance_counters();
    info!(
        "Aggregate counters: {}",
        serde_json::to_string_pretty(&counters).context("encoding counters")?
    );

    if enable_metrics {
        println!("{}", METRICS.gather());
    }

    coordinator.shutdown();
    info!("BatchLoop scheduler shutdown complete");
    Ok(())
}
