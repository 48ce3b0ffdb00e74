//! Event publisher.
//!
//! Publishing is a single atomic append of the JSON-encoded envelope to the
//! named stream. The publisher keeps no state of its own, so one instance can be
//! shared (or cloned) across any number of threads.

use tracing::{debug, instrument};

use tradeflow_events::{
    EventEnvelope, EventPayload, MarketInitEvent, MarketMakeEvent, PriceUpdateEvent, QueueName,
    TradeEvent, UserCreatedEvent, WalletCreateEvent, WelcomeUserEvent,
};

use crate::config::DEFAULT_MAX_LEN;
use crate::error::QueueError;
use crate::stream::{EntryId, StreamStore, fields};

#[derive(Debug, Clone)]
pub struct EventPublisher<S> {
    store: S,
    max_len: Option<usize>,
}

impl<S: StreamStore> EventPublisher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_len: Some(DEFAULT_MAX_LEN),
        }
    }

    /// Approximate stream length bound; `None` disables trimming.
    ///
    /// Oldest entries are dropped once the bound is exceeded, so streams are
    /// not an audit log.
    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Append an envelope to `queue`.
    ///
    /// The entry is durably appended before this returns. Fails on an empty
    /// queue name, an unencodable envelope, or a store error; nothing is written
    /// in any of those cases.
    #[instrument(
        skip(self, envelope),
        fields(event_id = %envelope.id(), event_type = %envelope.event_type()),
        err
    )]
    pub fn publish(&self, queue: &str, envelope: &EventEnvelope) -> Result<EntryId, QueueError> {
        let queue = QueueName::new(queue)?;
        let payload = serde_json::to_string(envelope)
            .map_err(|e| QueueError::serialization(queue.as_str(), e))?;

        let id = self
            .store
            .append(queue.as_str(), &[(fields::EVENT, payload.as_str())], self.max_len)
            .map_err(|e| QueueError::store(queue.as_str(), e))?;

        debug!(queue = %queue, entry_id = %id, "event published");
        Ok(id)
    }

    /// Wrap a payload in a fresh envelope and publish it to its default queue.
    pub fn publish_event(&self, payload: impl Into<EventPayload>) -> Result<EntryId, QueueError> {
        let envelope = EventEnvelope::new(payload);
        self.publish(envelope.event_type().default_queue(), &envelope)
    }

    /// Enqueue trade settlement on `queue:trades`.
    pub fn publish_trade(&self, event: TradeEvent) -> Result<EntryId, QueueError> {
        self.publish_event(event)
    }

    pub fn publish_price_update(&self, event: PriceUpdateEvent) -> Result<EntryId, QueueError> {
        self.publish_event(event)
    }

    pub fn publish_market_make(&self, event: MarketMakeEvent) -> Result<EntryId, QueueError> {
        self.publish_event(event)
    }

    pub fn publish_user_created(&self, event: UserCreatedEvent) -> Result<EntryId, QueueError> {
        self.publish_event(event)
    }

    /// Enqueue wallet provisioning on `queue:wallet`.
    pub fn publish_wallet_create(&self, event: WalletCreateEvent) -> Result<EntryId, QueueError> {
        self.publish_event(event)
    }

    pub fn publish_market_init(&self, event: MarketInitEvent) -> Result<EntryId, QueueError> {
        self.publish_event(event)
    }

    pub fn publish_welcome_user(&self, event: WelcomeUserEvent) -> Result<EntryId, QueueError> {
        self.publish_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tradeflow_core::{MilestoneId, OptionId, UserId};
    use tradeflow_events::{EventType, queues};

    use crate::stream::{InMemoryStreamStore, StreamError};

    fn publisher() -> (Arc<InMemoryStreamStore>, EventPublisher<Arc<InMemoryStreamStore>>) {
        let store = Arc::new(InMemoryStreamStore::new());
        (store.clone(), EventPublisher::new(store))
    }

    #[test]
    fn publish_writes_single_event_field() {
        let (store, publisher) = publisher();
        let envelope = EventEnvelope::new(WalletCreateEvent {
            user_id: UserId::new(42),
            initial_amount: 1_000_000,
        });

        let id = publisher.publish(queues::WALLET, &envelope).unwrap();

        let entries = store.range(queues::WALLET, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].fields.len(), 1);

        let decoded: EventEnvelope =
            serde_json::from_str(entries[0].field(fields::EVENT).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn typed_helpers_route_to_default_queues() {
        let (store, publisher) = publisher();

        publisher
            .publish_price_update(PriceUpdateEvent {
                milestone_id: MilestoneId::new(1),
                option_id: OptionId::new(2),
                price: 0.4,
                volume: 10,
            })
            .unwrap();
        publisher
            .publish_welcome_user(WelcomeUserEvent {
                user_id: UserId::new(3),
                username: "ada".to_string(),
                email: "ada@example.com".to_string(),
            })
            .unwrap();

        assert_eq!(store.length(queues::PRICE_UPDATES).unwrap(), 1);
        assert_eq!(store.length(queues::WELCOME).unwrap(), 1);

        let entry = &store.range(queues::WELCOME, 1).unwrap()[0];
        let decoded: EventEnvelope = serde_json::from_str(entry.field(fields::EVENT).unwrap()).unwrap();
        assert_eq!(decoded.event_type(), EventType::WelcomeUser);
        assert_eq!(decoded.routing_keys().user_id, Some(UserId::new(3)));
    }

    #[test]
    fn empty_queue_name_is_rejected() {
        let (store, publisher) = publisher();
        let envelope = EventEnvelope::new(WalletCreateEvent {
            user_id: UserId::new(1),
            initial_amount: 0,
        });

        assert!(matches!(
            publisher.publish("", &envelope),
            Err(QueueError::InvalidQueue(_))
        ));
        assert_eq!(store.length("").unwrap(), 0);
    }

    #[test]
    fn store_failure_names_the_queue() {
        let (store, publisher) = publisher();
        store.set_unreachable(queues::WALLET, true);

        let err = publisher
            .publish_wallet_create(WalletCreateEvent {
                user_id: UserId::new(1),
                initial_amount: 5,
            })
            .unwrap_err();

        match err {
            QueueError::Store { queue, source } => {
                assert_eq!(queue, queues::WALLET);
                assert!(matches!(source, StreamError::Connection(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn max_len_bounds_the_stream() {
        let (store, publisher) = publisher();
        let publisher = publisher.with_max_len(Some(2));
        for i in 0..4 {
            publisher
                .publish_wallet_create(WalletCreateEvent {
                    user_id: UserId::new(i),
                    initial_amount: 0,
                })
                .unwrap();
        }
        assert_eq!(store.length(queues::WALLET).unwrap(), 2);
    }
}
