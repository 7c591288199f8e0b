//! Dispatcher process entrypoint.
//!
//! Wires together the step store, throttler registry, resolver, and job
//! registry, then drives one `Dispatcher` tick loop per configured group
//! until interrupted (spec.md §4.2, §6). No job classes are registered
//! here: atomic/lifecycle/orchestrator jobs are the domain crate's concern
//! (spec.md §1 "external collaborator") and register themselves into the
//! `JobRegistry` and `Resolver` before this binary would be handed them in
//! a full deployment. As shipped, this binary demonstrates the dispatcher
//! running an empty step graph end-to-end against either Postgres or the
//! in-process store.

use anyhow::Context;
use log::{info, warn};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use trading_engine::config::EngineConfig;
use trading_engine::dispatcher::{Dispatcher, NoCanonicalLookup};
use trading_engine::job::JobRegistry;
use trading_engine::resolver::Resolver;
use trading_engine::store::memory::MemoryStepStore;
use trading_engine::store::postgres::PostgresStepStore;
use trading_engine::store::StepStore;
use trading_engine::throttler::defaults::registry_with_all_exchanges;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = EngineConfig::from_env();
    info!(
        "engine.start groups={:?} tick_interval={}s batch_size={}",
        config.groups,
        config.tick_interval.as_secs(),
        config.batch_size
    );

    let store: Arc<dyn StepStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            info!("engine.store backend=postgres");
            Arc::new(PostgresStepStore::new(pool))
        }
        None => {
            warn!("engine.store backend=memory (set DATABASE_URL for a durable step store)");
            Arc::new(MemoryStepStore::new())
        }
    };

    let registry = Arc::new(JobRegistry::new());
    let throttlers = Arc::new(registry_with_all_exchanges());
    let resolver = Arc::new(Resolver::new());
    let canonical_lookup = Arc::new(NoCanonicalLookup);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut handles = Vec::new();
    for group in &config.groups {
        let dispatcher = Dispatcher::new(
            group.clone(),
            store.clone(),
            registry.clone(),
            throttlers.clone(),
            resolver.clone(),
            canonical_lookup.clone(),
        )
        .with_batch_size(config.batch_size);

        let tick_interval = config.tick_interval;
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.run(tick_interval, rx).await;
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("engine.shutdown_requested");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("engine.stopped");
    Ok(())
}
