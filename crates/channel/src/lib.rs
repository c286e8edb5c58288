//! Session-library seam.
//!
//! The wire protocol of the messaging network lives behind these traits;
//! the core only opens, sends, closes, and subscribes to events. Credential
//! material is owned by the driver and persisted under a per-instance
//! directory the core wipes on destroy/logout.

pub mod driver;
pub mod noop;

pub use driver::{CloseReason, ConnEvent, InboundMessage, SessionConn, SessionDriver};
