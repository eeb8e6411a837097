//! # loreforge
//!
//! Durable job and polling engine for the Loreforge campaign-content
//! backend.
//!
//! Provides durable queues (Postgres/pgmq-backed, with an in-memory backend
//! for tests), generic workers with bounded-attempt retry, a long-poll state
//! machine for externally-delegated work, idempotent recurring-job
//! scheduling, paginated bulk sweeps, and owner-keyed failure notifications.

pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod notify;
pub mod poll;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod telemetry;
pub mod worker;
