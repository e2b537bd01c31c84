//! overseek-sync-runtime: tokio drivers for the coordination state machines.
//!
//! Each driver owns one background task and tears it down from `Drop`:
//! [`tab_leader::TabLeader`] runs an election, [`coordinated_poll`] runs the
//! leader-only fetch loop, [`presence_tracker::PresenceTracker`] keeps a
//! room membership alive. [`session::TabContext`] shares them per key
//! within one tab; [`session::SessionRegistry`] owns tabs per session.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod activity;
pub mod bus;
pub mod clock;
pub mod coordinated_poll;
pub mod identity;
pub mod presence_tracker;
pub mod realtime;
pub mod session;
pub mod simulate;
pub mod tab_leader;

pub use overseek_sync_core as core;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
