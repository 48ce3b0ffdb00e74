use anyhow::Context;
use tracing::{info, warn};

use tradeflow_events::{EventEnvelope, queues};
use tradeflow_infra::stream::RedisStreamStore;
use tradeflow_infra::{QueueAdmin, QueueConfig};
use tradeflow_worker::Supervisor;
use tradeflow_worker::handlers::handle_event;

/// Queues this worker consumes.
const CONSUMED: [&str; 7] = [
    queues::TRADES,
    queues::PRICE_UPDATES,
    queues::MARKET_MAKING,
    queues::USERS,
    queues::WALLET,
    queues::MARKET_INIT,
    queues::WELCOME,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tradeflow_observability::init();

    let config = QueueConfig::from_env();
    let store = RedisStreamStore::new(&config.redis_url)
        .with_context(|| format!("invalid REDIS_URL {}", config.redis_url))?;

    let admin = QueueAdmin::new(store.clone()).with_monitored_queues(config.monitored_queues.clone());
    let health = admin.health_check();
    if health.values().all(|h| h.is_healthy()) {
        info!(health = %serde_json::to_string(&health)?, "queues healthy");
    } else {
        warn!(health = %serde_json::to_string(&health)?, "some queues are unavailable");
    }

    let supervisor = Supervisor::start(
        store,
        &config,
        &CONSUMED,
        handle_event as fn(&EventEnvelope) -> anyhow::Result<()>,
    )?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    tokio::task::spawn_blocking(move || supervisor.shutdown()).await?;
    Ok(())
}
