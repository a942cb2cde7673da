//! Server-side pieces of the `GigaMeta` service (spec.md §4.4/§4.6):
//! the per-directory lock/lease table, the background split coordinator,
//! and the RPC handler they back.

pub mod core;
pub mod error;
mod handler;
pub mod locktable;
pub mod split_coordinator;

pub use core::{Routed, ServerCore, ServerCoreBuilder};
pub use error::HandlerError;
pub use locktable::{DirLockTable, LeaseRecord, LeaseState};
pub use split_coordinator::SplitCoordinator;
