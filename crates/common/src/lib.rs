//! Shared types for the pylon gateway core.
//!
//! Every other crate depends on this one: instance status/metadata,
//! tuning constants, and the error taxonomy.

pub mod error;
pub mod types;

pub use {
    error::GatewayError,
    types::{InstanceMeta, InstanceStatus, now_ms},
};

/// Automatic reconnect attempts before an instance is marked `failed`.
pub const MAX_RETRIES: u32 = 3;

/// How long a session open may take before it is treated as failed.
pub const READY_TIMEOUT_MS: u64 = 60_000;

/// Simultaneously in-flight opens during bulk load.
pub const CONCURRENCY: usize = 5;

/// Per-position stagger applied to a worker's first open at bulk load.
pub const START_STAGGER_MS: u64 = 3_000;

/// Fixed delay between consecutive opens by the same bulk-load worker.
pub const INTER_OPEN_DELAY_MS: u64 = 1_000;

/// Exponential backoff base for session retries.
pub const RETRY_BASE_MS: u64 = 1_000;

/// Backoff ceiling.
pub const RETRY_CAP_MS: u64 = 60_000;

/// Uniform jitter added on top of the computed backoff.
pub const RETRY_JITTER_MS: u64 = 3_000;
