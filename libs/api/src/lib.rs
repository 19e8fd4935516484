//! # flow-api
//!
//! Desired-state data contracts for the flow proxy.
//!
//! The registry and its watchers deliver full snapshots, never deltas:
//!
//! - [`Service`]: a named service and the ports it exposes
//! - [`Endpoints`]: the backend addresses implementing a service
//! - [`DesiredState`]: both lists together, as read from a state file
//!
//! Snapshots are read-only to the proxy core. Reconciliation compares each
//! snapshot against in-memory state and never mutates the snapshot itself.

mod error;
mod types;

pub use error::ApiError;
pub use types::*;
