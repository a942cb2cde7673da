//! Selects between a single shared connection set and one connection set
//! per OS thread (spec.md §9: "thread-local client handles (one
//! connection set per thread) ... global state"). Either way the caller
//! only ever sees a `ConnectionManager` to hand to a call.

use giga_rpc::conn::{ConnectionManager, ReconnectPolicy};
use giga_rpc::membership::Membership;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static TLS_CONN: RefCell<HashMap<u64, Arc<ConnectionManager>>> = RefCell::new(HashMap::new());
}

struct ThreadLocalConn {
    client_id: u64,
    membership: Membership,
    policy: ReconnectPolicy,
}

impl ThreadLocalConn {
    fn get_or_init(&self) -> Arc<ConnectionManager> {
        TLS_CONN.with(|cell| {
            cell.borrow_mut()
                .entry(self.client_id)
                .or_insert_with(|| ConnectionManager::new(self.membership.clone(), self.policy))
                .clone()
        })
    }
}

pub enum ConnContext {
    /// One `ConnectionManager` (and thus one channel cache) shared by
    /// every caller of this `Client`, behind the `tokio::sync::Mutex`
    /// `ConnectionManager` already carries internally.
    Shared(Arc<ConnectionManager>),
    /// A distinct `ConnectionManager` per OS thread that calls into this
    /// `Client`, so no two threads ever contend on the same cached
    /// transport.
    ThreadLocal(ThreadLocalConn),
}

impl ConnContext {
    pub fn shared(membership: Membership, policy: ReconnectPolicy) -> Self {
        ConnContext::Shared(ConnectionManager::new(membership, policy))
    }

    pub fn thread_local(membership: Membership, policy: ReconnectPolicy) -> Self {
        ConnContext::ThreadLocal(ThreadLocalConn {
            client_id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            membership,
            policy,
        })
    }

    pub fn conn(&self) -> Arc<ConnectionManager> {
        match self {
            ConnContext::Shared(conn) => conn.clone(),
            ConnContext::ThreadLocal(tls) => tls.get_or_init(),
        }
    }
}
