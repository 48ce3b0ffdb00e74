use serde::{Deserialize, Serialize};

use tradeflow_core::{MilestoneId, OptionId, TradeId, UserId};

use crate::envelope::RoutingKeys;
use crate::queue::queues;

/// Closed set of event kinds the platform distributes.
///
/// The serialized name doubles as the prefix of every [`crate::EventId`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Trade,
    PriceUpdate,
    MarketMake,
    UserCreated,
    WalletCreate,
    MarketInit,
    WelcomeUser,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Trade => "trade",
            EventType::PriceUpdate => "price_update",
            EventType::MarketMake => "market_make",
            EventType::UserCreated => "user_created",
            EventType::WalletCreate => "wallet_create",
            EventType::MarketInit => "market_init",
            EventType::WelcomeUser => "welcome_user",
        }
    }

    /// Primary stream this kind of event is published to by the typed
    /// publisher helpers.
    pub fn default_queue(self) -> &'static str {
        match self {
            EventType::Trade => queues::TRADES,
            EventType::PriceUpdate => queues::PRICE_UPDATES,
            EventType::MarketMake => queues::MARKET_MAKING,
            EventType::UserCreated => queues::USERS,
            EventType::WalletCreate => queues::WALLET,
            EventType::MarketInit => queues::MARKET_INIT,
            EventType::WelcomeUser => queues::WELCOME,
        }
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// An executed trade awaiting settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: TradeId,
    pub user_id: UserId,
    pub milestone_id: MilestoneId,
    pub option_id: OptionId,
    pub side: TradeSide,
    /// Number of shares.
    pub quantity: i64,
    /// Execution price per share (probability in `0.0..=1.0`).
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdateEvent {
    pub milestone_id: MilestoneId,
    pub option_id: OptionId,
    pub price: f64,
    pub volume: i64,
}

/// Request for the automated market maker to quote an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketMakeEvent {
    pub milestone_id: MilestoneId,
    pub option_id: OptionId,
    pub side: TradeSide,
    pub quantity: i64,
    pub target_price: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreatedEvent {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
}

/// Wallet provisioning for a freshly registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletCreateEvent {
    pub user_id: UserId,
    /// Opening balance in minor currency units.
    pub initial_amount: i64,
}

/// Bootstrap of a milestone's order books and initial liquidity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketInitEvent {
    pub milestone_id: MilestoneId,
    pub option_ids: Vec<OptionId>,
    pub initial_liquidity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeUserEvent {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
}

/// Typed event payload, keyed on the wire by `type` with the body in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Trade(TradeEvent),
    PriceUpdate(PriceUpdateEvent),
    MarketMake(MarketMakeEvent),
    UserCreated(UserCreatedEvent),
    WalletCreate(WalletCreateEvent),
    MarketInit(MarketInitEvent),
    WelcomeUser(WelcomeUserEvent),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Trade(_) => EventType::Trade,
            EventPayload::PriceUpdate(_) => EventType::PriceUpdate,
            EventPayload::MarketMake(_) => EventType::MarketMake,
            EventPayload::UserCreated(_) => EventType::UserCreated,
            EventPayload::WalletCreate(_) => EventType::WalletCreate,
            EventPayload::MarketInit(_) => EventType::MarketInit,
            EventPayload::WelcomeUser(_) => EventType::WelcomeUser,
        }
    }

    /// Entity identifiers carried by this payload.
    pub fn routing_keys(&self) -> RoutingKeys {
        match self {
            EventPayload::Trade(e) => RoutingKeys {
                milestone_id: Some(e.milestone_id),
                option_id: Some(e.option_id),
                user_id: Some(e.user_id),
            },
            EventPayload::PriceUpdate(e) => RoutingKeys {
                milestone_id: Some(e.milestone_id),
                option_id: Some(e.option_id),
                user_id: None,
            },
            EventPayload::MarketMake(e) => RoutingKeys {
                milestone_id: Some(e.milestone_id),
                option_id: Some(e.option_id),
                user_id: None,
            },
            EventPayload::MarketInit(e) => RoutingKeys {
                milestone_id: Some(e.milestone_id),
                ..RoutingKeys::default()
            },
            EventPayload::UserCreated(UserCreatedEvent { user_id, .. })
            | EventPayload::WelcomeUser(WelcomeUserEvent { user_id, .. })
            | EventPayload::WalletCreate(WalletCreateEvent { user_id, .. }) => RoutingKeys {
                user_id: Some(*user_id),
                ..RoutingKeys::default()
            },
        }
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident($t:ty)),* $(,)?) => {
        $(
            impl From<$t> for EventPayload {
                fn from(value: $t) -> Self {
                    EventPayload::$variant(value)
                }
            }
        )*
    };
}

impl_from_payload!(
    Trade(TradeEvent),
    PriceUpdate(PriceUpdateEvent),
    MarketMake(MarketMakeEvent),
    UserCreated(UserCreatedEvent),
    WalletCreate(WalletCreateEvent),
    MarketInit(MarketInitEvent),
    WelcomeUser(WelcomeUserEvent),
);
