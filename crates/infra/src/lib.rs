//! Infrastructure layer: stream stores, publish/consume pipeline, job queue
//! and operator tooling.
//!
//! Every component takes its [`stream::StreamStore`] by injection. Production
//! wiring uses [`stream::RedisStreamStore`] (feature `redis`); tests and local
//! development use [`stream::InMemoryStreamStore`].

pub mod admin;
pub mod config;
pub mod consumer;
pub mod error;
pub mod jobs;
pub mod publisher;
pub mod stream;


pub use admin::{DeadLetter, QueueAdmin, QueueHealth, QueueStats};
pub use config::QueueConfig;
pub use consumer::{
    ConsumerConfig, ConsumerHandle, Disposition, EventConsumer, EventHandler, PollOutcome,
};
pub use error::QueueError;
pub use jobs::{Job, JobData, JobHandler, JobQueue};
pub use publisher::EventPublisher;
pub use stream::{EntryId, InMemoryStreamStore, StreamEntry, StreamError, StreamInfo, StreamStore};
