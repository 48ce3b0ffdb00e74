//! Stream naming.
//!
//! Primary streams are `queue:<domain>`. Each primary stream has two derived
//! streams: `<queue>:retry` for failed deliveries awaiting another attempt and
//! `<queue>:dlq` for deliveries that exhausted their retry budget.

use serde::{Deserialize, Serialize};

use tradeflow_core::{DomainError, DomainResult};

/// Well-known primary queues.
pub mod queues {
    pub const TRADES: &str = "queue:trades";
    pub const PRICE_UPDATES: &str = "queue:price_updates";
    pub const MARKET_MAKING: &str = "queue:market_making";
    pub const USERS: &str = "queue:users";
    pub const WALLET: &str = "queue:wallet";
    pub const MARKET_INIT: &str = "queue:market_init";
    pub const WELCOME: &str = "queue:welcome";

    /// Queues covered by the default health check.
    pub const MONITORED: [&str; 5] = [TRADES, PRICE_UPDATES, WALLET, MARKET_INIT, WELCOME];
}

const RETRY_SUFFIX: &str = ":retry";
const DLQ_SUFFIX: &str = ":dlq";

/// Validated stream name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Validate a stream name. Empty or whitespace-only names are rejected.
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("queue name must not be empty"));
        }
        Ok(Self(name))
    }

    /// Primary stream for a domain, e.g. `wallet` -> `queue:wallet`.
    pub fn for_domain(domain: &str) -> DomainResult<Self> {
        if domain.trim().is_empty() {
            return Err(DomainError::validation("queue domain must not be empty"));
        }
        Ok(Self(format!("queue:{domain}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn retry(&self) -> QueueName {
        Self(format!("{}{RETRY_SUFFIX}", self.0))
    }

    pub fn dlq(&self) -> QueueName {
        Self(format!("{}{DLQ_SUFFIX}", self.0))
    }

    /// Whether this is a `:retry` or `:dlq` stream rather than a primary one.
    pub fn is_derived(&self) -> bool {
        self.0.ends_with(RETRY_SUFFIX) || self.0.ends_with(DLQ_SUFFIX)
    }
}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for QueueName {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_retry_and_dlq_names() {
        let q = QueueName::new(queues::TRADES).unwrap();
        assert_eq!(q.retry().as_str(), "queue:trades:retry");
        assert_eq!(q.dlq().as_str(), "queue:trades:dlq");
        assert!(!q.is_derived());
        assert!(q.retry().is_derived());
        assert!(q.dlq().is_derived());
    }

    #[test]
    fn rejects_empty_names() {
        assert!(matches!(QueueName::new(""), Err(DomainError::Validation(_))));
        assert!(matches!(QueueName::new("  "), Err(DomainError::Validation(_))));
        assert!(QueueName::for_domain("").is_err());
    }

    #[test]
    fn domain_prefix() {
        assert_eq!(QueueName::for_domain("wallet").unwrap().as_str(), queues::WALLET);
    }

    #[test]
    fn deserialization_validates() {
        assert!(serde_json::from_str::<QueueName>("\"\"").is_err());
        let q: QueueName = serde_json::from_str("\"queue:welcome\"").unwrap();
        assert_eq!(q.as_str(), queues::WELCOME);
    }
}
