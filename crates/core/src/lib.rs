//! `tradeflow-core`: identifiers and errors shared by every tradeflow crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{MilestoneId, OptionId, TradeId, UserId};
