//! The scheduler process: while holding the leader lease, scan due
//! schedules once a second and dispatch each one inside a transaction
//! serialized by a per-schedule advisory lock.

pub mod dispatch;
pub mod http;

pub use dispatch::{DispatchError, Dispatcher};
