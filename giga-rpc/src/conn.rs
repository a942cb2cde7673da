//! Per-server-id connection management: each logical client holds at
//! most one live transport, opened lazily, reconnected with exponential
//! backoff between membership-file re-reads (spec.md §4.5).

use crate::error::RpcError;
use crate::membership::Membership;
use crate::pb::giga_meta_client::GigaMetaClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::Channel;

/// `[0, 1, 2, 4, 8]` seconds, per spec.md §4.5 and §5.
const BACKOFF_SCHEDULE_SECS: &[u64] = &[0, 1, 2, 4, 8];

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Additional attempts after the first, default 1 (spec.md §4.5).
    pub max_reconnects: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy { max_reconnects: 1 }
    }
}

/// Holds the shared membership map and a lazily-populated, per-server-id
/// channel cache. Cloning is cheap (`Arc` inside); this is what a
/// `ThreadLocalContext` or `SharedContext` wraps in `giga-client`.
pub struct ConnectionManager {
    membership: Mutex<Membership>,
    clients: Mutex<HashMap<i32, GigaMetaClient<Channel>>>,
    policy: ReconnectPolicy,
}

impl ConnectionManager {
    pub fn new(membership: Membership, policy: ReconnectPolicy) -> Arc<Self> {
        Arc::new(ConnectionManager {
            membership: Mutex::new(membership),
            clients: Mutex::new(HashMap::new()),
            policy,
        })
    }

    pub async fn n_servers(&self) -> i64 {
        self.membership.lock().await.n_servers()
    }

    /// Returns a live client for `server_id`, opening (or reopening) the
    /// transport as needed. On any transport failure the reconnect
    /// routine re-reads the membership file before retrying, up to
    /// `policy.max_reconnects` additional attempts.
    pub async fn client(&self, server_id: i32) -> Result<GigaMetaClient<Channel>, RpcError> {
        if let Some(existing) = self.clients.lock().await.get(&server_id) {
            return Ok(existing.clone());
        }
        let client = self.connect_with_backoff(server_id).await?;
        self.clients.lock().await.insert(server_id, client.clone());
        Ok(client)
    }

    /// Drops the cached transport for `server_id` so the next call opens
    /// a fresh one. Called after an RPC fails with a transport error.
    pub async fn invalidate(&self, server_id: i32) {
        self.clients.lock().await.remove(&server_id);
    }

    async fn connect_with_backoff(&self, server_id: i32) -> Result<GigaMetaClient<Channel>, RpcError> {
        let attempts = 1 + self.policy.max_reconnects;
        let mut last_err = None;
        for attempt in 0..attempts {
            let delay = BACKOFF_SCHEDULE_SECS
                .get(attempt as usize)
                .copied()
                .unwrap_or(*BACKOFF_SCHEDULE_SECS.last().unwrap());
            if delay > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            if attempt > 0 {
                // Re-read the address between attempts: the operator may
                // have moved the server to a new host.
                if let Err(e) = self.membership.lock().await.reload() {
                    last_err = Some(e);
                    continue;
                }
            }
            let uri = match self.membership.lock().await.uri(server_id) {
                Ok(uri) => uri,
                Err(e) => return Err(e),
            };
            match Channel::from_shared(uri).map_err(|e| RpcError::Transport {
                server_id,
                source: e,
            }) {
                Ok(endpoint) => match endpoint.connect().await {
                    Ok(channel) => return Ok(GigaMetaClient::new(channel)),
                    Err(e) => {
                        log::warn!("connect attempt {attempt} to server {server_id} failed: {e}");
                        last_err = Some(RpcError::Transport { server_id, source: e });
                    }
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(RpcError::UnknownServer(server_id)))
    }
}
