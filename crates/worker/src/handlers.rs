//! Default event handlers.
//!
//! Settlement, pricing and wallet logic live in their own services; the worker
//! validates each payload and records it, so malformed business data surfaces
//! as a handler failure (and therefore in the retry/dead-letter streams).

use anyhow::{Context, ensure};
use tracing::info;

use tradeflow_events::{EventEnvelope, EventPayload};

/// Validate and record a delivered event.
pub fn handle_event(envelope: &EventEnvelope) -> anyhow::Result<()> {
    validate(envelope.payload()).with_context(|| format!("event {}", envelope.id()))?;

    info!(
        event_id = %envelope.id(),
        event_type = %envelope.event_type(),
        retry = envelope.retry_count(),
        timestamp = envelope.timestamp(),
        "event handled"
    );
    Ok(())
}

fn validate(payload: &EventPayload) -> anyhow::Result<()> {
    match payload {
        EventPayload::Trade(e) => {
            ensure!(e.quantity > 0, "trade quantity must be positive, got {}", e.quantity);
            ensure!(
                (0.0..=1.0).contains(&e.price),
                "trade price must be within 0..=1, got {}",
                e.price
            );
        }
        EventPayload::PriceUpdate(e) => {
            ensure!(
                (0.0..=1.0).contains(&e.price),
                "price must be within 0..=1, got {}",
                e.price
            );
            ensure!(e.volume >= 0, "volume must not be negative");
        }
        EventPayload::MarketMake(e) => {
            ensure!(e.quantity > 0, "quote quantity must be positive");
        }
        EventPayload::UserCreated(e) => {
            ensure!(!e.username.trim().is_empty(), "username is empty");
        }
        EventPayload::WalletCreate(e) => {
            ensure!(
                e.initial_amount >= 0,
                "initial wallet amount must not be negative, got {}",
                e.initial_amount
            );
        }
        EventPayload::MarketInit(e) => {
            ensure!(!e.option_ids.is_empty(), "market has no options");
            ensure!(e.initial_liquidity >= 0, "initial liquidity must not be negative");
        }
        EventPayload::WelcomeUser(e) => {
            ensure!(e.email.contains('@'), "invalid email address: {}", e.email);
        }
    }
    Ok(())
}
