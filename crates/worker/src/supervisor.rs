//! Starts and stops the set of consumers a worker process runs.

use tracing::info;

use tradeflow_infra::consumer::{ConsumerHandle, EventConsumer, EventHandler};
use tradeflow_infra::{QueueConfig, QueueError, StreamStore};

/// Running consumers of one worker process.
#[derive(Debug)]
pub struct Supervisor {
    handles: Vec<ConsumerHandle>,
}

impl Supervisor {
    /// Spawn a consumer for each of `queues`, plus a retry processor per queue
    /// when `config.retry_enabled` is set.
    ///
    /// On error, consumers already started are shut down before returning.
    pub fn start<S, H>(
        store: S,
        config: &QueueConfig,
        queues: &[&str],
        handler: H,
    ) -> Result<Self, QueueError>
    where
        S: StreamStore + Clone + 'static,
        H: EventHandler + Clone + 'static,
    {
        let consumer_config = config.consumer_config();
        let mut supervisor = Self {
            handles: Vec::with_capacity(queues.len() * 2),
        };

        for queue in queues {
            let mut consumers = vec![EventConsumer::new(store.clone(), queue, consumer_config.clone())];
            if config.retry_enabled {
                consumers.push(EventConsumer::retry_processor(
                    store.clone(),
                    queue,
                    consumer_config.clone(),
                ));
            }

            for consumer in consumers {
                match consumer.and_then(|c| c.spawn(handler.clone())) {
                    Ok(handle) => supervisor.handles.push(handle),
                    Err(e) => {
                        supervisor.shutdown();
                        return Err(e);
                    }
                }
            }
        }

        info!(
            consumers = supervisor.handles.len(),
            group = %config.group,
            consumer = %config.consumer,
            "worker started"
        );
        Ok(supervisor)
    }

    pub fn consumer_names(&self) -> Vec<&str> {
        self.handles.iter().map(ConsumerHandle::name).collect()
    }

    /// Stop every consumer and wait for their threads.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.stop();
        }
        for handle in self.handles {
            handle.shutdown();
        }
        info!("worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tradeflow_core::UserId;
    use tradeflow_events::{EventEnvelope, WalletCreateEvent, queues};
    use tradeflow_infra::{EventPublisher, InMemoryStreamStore};

    use crate::handlers::handle_event;

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_block_timeout(Duration::from_millis(20))
            .with_retry_enabled(true)
    }

    #[test]
    fn starts_primary_and_retry_consumers() {
        let store = Arc::new(InMemoryStreamStore::new());
        let supervisor = Supervisor::start(
            store,
            &config(),
            &[queues::TRADES, queues::WALLET],
            handle_event as fn(&EventEnvelope) -> anyhow::Result<()>,
        )
        .unwrap();

        assert_eq!(
            supervisor.consumer_names(),
            vec![
                "consumer:queue:trades",
                "consumer:queue:trades:retry",
                "consumer:queue:wallet",
                "consumer:queue:wallet:retry",
            ]
        );
        supervisor.shutdown();
    }

    #[test]
    fn invalid_wallet_is_dead_lettered_through_retries() {
        let store = Arc::new(InMemoryStreamStore::new());
        let supervisor = Supervisor::start(
            store.clone(),
            &config(),
            &[queues::WALLET],
            handle_event as fn(&EventEnvelope) -> anyhow::Result<()>,
        )
        .unwrap();

        EventPublisher::new(store.clone())
            .publish_wallet_create(WalletCreateEvent {
                user_id: UserId::new(7),
                initial_amount: -5,
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.length("queue:wallet:dlq").unwrap() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        supervisor.shutdown();

        assert_eq!(store.length("queue:wallet:dlq").unwrap(), 1);
        assert_eq!(store.length("queue:wallet:retry").unwrap(), 2);
    }

    #[test]
    fn empty_queue_name_fails_start() {
        let store = Arc::new(InMemoryStreamStore::new());
        let err = Supervisor::start(
            store,
            &config(),
            &[queues::TRADES, ""],
            handle_event as fn(&EventEnvelope) -> anyhow::Result<()>,
        )
        .unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueue(_)));
    }
}
