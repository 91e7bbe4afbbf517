//! Authenticated-client table and the on-disk connection descriptor
//! (SPEC_FULL.md §4.2, §6).
//!
//! Generalizes `api::ws::pool::ConnectionPool`'s `DashMap`-indexed,
//! activity-tracking registry: a `PoolEntry` becomes a [`ClientRecord`]
//! carrying an optional outbound channel (present while the socket is up,
//! `None` during a transient disconnect) and a `resume_token`-keyed
//! offline queue that outlives the socket, per the data model's "the
//! offline queue may outlive the socket to allow reconnect replay".

use crate::message::{Message, MessageQueue};
use dashmap::DashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct ClientRecord {
    pub client_id: String,
    pub resume_token: String,
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// Authenticated clients plus the offline queues reconnects bind to.
/// `offline_queues` is keyed by `resume_token`, not `client_id`, so a
/// reconnecting client with the same token picks up where it left off
/// even after its prior `ClientRecord` was removed.
pub struct ConnectionRegistry {
    clients: DashMap<String, Arc<ClientRecord>>,
    offline_queues: DashMap<String, Arc<MessageQueue>>,
    max_queue_size: usize,
}

impl ConnectionRegistry {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            clients: DashMap::new(),
            offline_queues: DashMap::new(),
            max_queue_size,
        }
    }

    /// Register a freshly authenticated client, binding it to the offline
    /// queue named by `resume_token` (created if this is the first time
    /// that token has been seen). Returns the queue so the caller can
    /// drain and replay any backlog accumulated while disconnected.
    pub fn register(
        &self,
        client_id: &str,
        resume_token: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Arc<MessageQueue> {
        let queue = self
            .offline_queues
            .entry(resume_token.to_string())
            .or_insert_with(|| Arc::new(MessageQueue::new(self.max_queue_size)))
            .clone();

        self.clients.insert(
            client_id.to_string(),
            Arc::new(ClientRecord {
                client_id: client_id.to_string(),
                resume_token: resume_token.to_string(),
                sender: parking_lot::Mutex::new(Some(sender)),
            }),
        );
        queue
    }

    pub fn is_authenticated(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn authenticated_client_ids(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    /// Deliver `message` directly if the socket is up; otherwise append to
    /// the client's offline queue (bounded, dropping on overflow).
    /// Returns `true` iff the direct send succeeded.
    pub fn deliver(&self, client_id: &str, message: Message) -> bool {
        let Some(record) = self.clients.get(client_id).map(|r| r.clone()) else {
            return false;
        };
        let sent = {
            let guard = record.sender.lock();
            guard
                .as_ref()
                .map(|tx| tx.send(message.clone()).is_ok())
                .unwrap_or(false)
        };
        if sent {
            return true;
        }
        if let Some(queue) = self.offline_queues.get(&record.resume_token) {
            queue.try_enqueue(message);
        }
        false
    }

    /// Mark a client's socket as closed without forgetting it: fan-out
    /// keeps routing to its offline queue until [`Self::remove`] is
    /// called.
    pub fn mark_disconnected(&self, client_id: &str) {
        if let Some(record) = self.clients.get(client_id) {
            *record.sender.lock() = None;
        }
    }

    /// Forget a client entirely. The offline queue survives (keyed by
    /// `resume_token`, not `client_id`) so a later reconnect with the same
    /// token still replays it.
    pub fn remove(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn offline_queue_for(&self, resume_token: &str) -> Option<Arc<MessageQueue>> {
        self.offline_queues.get(resume_token).map(|q| q.clone())
    }
}

/// Endpoint and credential persisted so external tooling can discover a
/// running server without a side channel (SPEC_FULL.md §4.2 lifecycle:
/// "persist the resolved endpoint plus the auth token into a well-known
/// connection-descriptor file with owner-only permissions"). Field set
/// matches SPEC_FULL.md §6's literal `{host, port, auth_token,
/// protocol:"ws", version}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub auth_token: String,
    pub protocol: String,
    pub version: String,
}

impl ConnectionDescriptor {
    /// Build a descriptor for `host`/`port`/`auth_token`, filling
    /// `protocol` and `version` with this server's fixed values.
    pub fn new(host: impl Into<String>, port: u16, auth_token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            auth_token: auth_token.into(),
            protocol: "ws".to_string(),
            version: crate::version::VERSION.to_string(),
        }
    }

    /// Write the descriptor to `path`, creating it owner-readable only.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&body)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms)?;
        }
        Ok(())
    }

    pub fn delete(path: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        let body = std::fs::read(path)?;
        serde_json::from_slice(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

pub fn default_descriptor_path(base_dir: &Path) -> PathBuf {
    base_dir.join("server.json")
}
