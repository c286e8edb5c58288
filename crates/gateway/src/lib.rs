//! Thin HTTP request layer over the instance supervisor.
//!
//! All business logic lives in `pylon-supervisor`; this crate only maps
//! routes and errors. Construct the supervisor once and hand it in — the
//! gateway holds a reference, never a singleton.

mod auth;
mod error;
mod routes;
mod server;

pub use {
    auth::{ResolvedAuth, resolve_auth},
    server::{AppState, build_app, serve},
};
