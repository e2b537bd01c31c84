//! overseek-sync-core: pure coordination state machines for a session spread
//! over many tabs. Leader election, coordinated polling gate, presence
//! session and roster view, plus a loopback presence hub.
//!
//! Nothing in this crate touches a clock, a timer or a socket. Every state
//! machine takes `now_ms` as an argument and returns the messages the caller
//! must send.

pub mod config;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod leader;
pub mod polling;
pub mod presence;
pub mod roster;
pub mod types;

pub use config::SyncConfig;
pub use error::SyncError;
