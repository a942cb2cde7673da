//! Wire types (generated from `proto/giga.proto`), the membership and
//! config file parsers, and a backoff-aware connection manager: the
//! pieces of the RPC layer (spec.md §4.5) shared by `giga-server` and
//! `giga-client`.

pub mod config;
pub mod conn;
mod error;
pub mod membership;

pub use error::RpcError;

/// Generated client/server stubs and message types for the `GigaMeta`
/// service.
pub mod pb {
    tonic::include_proto!("giga");
}

/// `kNumRedirect` from spec.md §4.5: the client retry loop gives up after
/// this many `ServerRedirection` responses for a single call.
pub const NUM_REDIRECT: u32 = 10;

/// Default lease window (spec.md §4.4).
pub const LEASE_WINDOW_MICROS: i64 = 1_000_000;

/// Skew allowance `ε` a lease wait is bounded by (spec.md §5).
pub const LEASE_EPSILON_MICROS: i64 = 10_000;

/// Default `FLAGS_mknod_bufsize` (spec.md §4.7).
pub const DEFAULT_MKNOD_BUFSIZE: usize = 128;

/// Default `MaxPartSize` split trigger (spec.md §4.4).
pub const DEFAULT_MAX_PART_SIZE: u64 = 1 << 11;
