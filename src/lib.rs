//! Research plan execution engine.
//!
//! Plans are DAGs of steps routed to named agents. The engine layers steps
//! into execution groups, runs each group on a bounded worker pool with
//! retries and backoff, passes every result through a quality gate (with a
//! human review handoff) and publishes lifecycle events with replay.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod output;
pub mod persistence;
pub mod plan;
pub mod quality;
pub mod runner;

pub use engine::{Engine, EngineBuilder};
pub use error::VeritasError;
