//! Event envelopes, typed payloads and queue naming.
//!
//! Nothing in this crate performs IO: it only describes what travels through
//! the streams and where it is routed. Store adapters and the consume loop live
//! in `tradeflow-infra`.

pub mod envelope;
pub mod event;
pub mod queue;

pub use envelope::{EventEnvelope, EventId, RoutingKeys};
pub use event::{
    EventPayload, EventType, MarketInitEvent, MarketMakeEvent, PriceUpdateEvent, TradeEvent,
    TradeSide, UserCreatedEvent, WalletCreateEvent, WelcomeUserEvent,
};
pub use queue::{QueueName, queues};
