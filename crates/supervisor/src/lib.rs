//! Instance/session orchestration core.
//!
//! One supervisor owns the live-session map and drives the lifecycle state
//! machine for every tenant instance: open with a bounded ready race,
//! persist status transitions, recover from transient closes with capped
//! backoff, and forward inbound traffic to webhook dispatch without ever
//! blocking event processing.

mod events;
mod handle;
mod loader;
mod retry;
mod supervisor;

#[cfg(test)]
mod testing;

pub use {
    handle::PairingArtifact,
    loader::LoadOutcome,
    retry::RetryPolicy,
    supervisor::{InstanceSupervisor, StatusEntry, SupervisorConfig},
};
