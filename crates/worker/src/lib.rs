//! Queue worker: runs a consumer per well-known queue until shut down.

pub mod handlers;
pub mod supervisor;

pub use supervisor::Supervisor;
