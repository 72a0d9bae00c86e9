//! Connection manager: one live transport session per host
//!
//! Sessions are created lazily on first use, reused by every command of a
//! run, and closed when the run ends. The transport is a trait so tests can
//! swap SSH for an in-process fake.

use crate::error::Result;
use crate::models::{ConnectionKey, Host};
use crate::retry::{RetryConfig, RetryState};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Raw output of a remote process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A live session to one host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send {
    /// Run a full shell command line and wait for it to exit
    async fn exec(&mut self, command_line: &str) -> Result<RawOutput>;

    /// Copy a local file to `remote_path`, returning bytes written
    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<u64>;

    /// Whether `remote_path` exists and is a directory
    async fn is_dir(&mut self, remote_path: &str) -> Result<bool>;

    async fn close(&mut self) -> Result<()>;
}

/// Factory for connections
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>>;
}

/// A connection borrowed for one operation at a time
pub type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

type Slot = Arc<OnceCell<SharedConnection>>;

/// Owns and pools transport sessions keyed by (address, port, user)
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    connections: DashMap<ConnectionKey, Slot>,
    acquire_calls: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_retry(transport, RetryConfig::default())
    }

    pub fn with_retry(transport: Arc<dyn Transport>, retry: RetryConfig) -> Self {
        Self {
            transport,
            retry,
            connections: DashMap::new(),
            acquire_calls: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    /// Return the live connection for `host`, establishing it if needed.
    ///
    /// Concurrent callers for the same key wait on a single establishment.
    pub async fn acquire(&self, host: &Host) -> Result<SharedConnection> {
        self.acquire_calls.fetch_add(1, Ordering::Relaxed);

        let key = host.connection_key();
        let slot: Slot = Arc::clone(&self.connections.entry(key.clone()).or_default());
        match slot.get_or_try_init(|| self.establish(host)).await {
            Ok(connection) => Ok(Arc::clone(connection)),
            Err(e) => {
                self.connections
                    .remove_if(&key, |_, s| Arc::ptr_eq(s, &slot) && !s.initialized());
                Err(e)
            }
        }
    }

    async fn establish(&self, host: &Host) -> Result<SharedConnection> {
        let mut state = RetryState::new();

        loop {
            self.connect_attempts.fetch_add(1, Ordering::Relaxed);
            debug!("Connecting to {} (attempt {})", host, state.attempt);

            match self.transport.connect(host).await {
                Ok(connection) => {
                    info!("Connection established to {}", host);
                    return Ok(Arc::new(Mutex::new(connection)));
                }
                Err(e) if e.is_transient() && state.should_retry(&self.retry) => {
                    warn!("Connection to {} failed, retrying: {}", host, e);
                    tokio::time::sleep(state.delay(&self.retry)).await;
                    state.record_retry();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close and discard the connection for `host`
    pub async fn release(&self, host: &Host) {
        if let Some((_, slot)) = self.connections.remove(&host.connection_key()) {
            close_slot(host.to_string(), slot).await;
        }
    }

    /// Close every pooled connection
    pub async fn release_all(&self) {
        let keys: Vec<ConnectionKey> = self.connections.iter().map(|e| e.key().clone()).collect();

        for key in keys {
            if let Some((key, slot)) = self.connections.remove(&key) {
                close_slot(format!("{}@{}:{}", key.user, key.address, key.port), slot).await;
            }
        }
    }

    /// Number of live connections
    pub fn active(&self) -> usize {
        self.connections
            .iter()
            .filter(|e| e.value().initialized())
            .count()
    }

    /// Number of `acquire` calls since creation
    pub fn acquire_count(&self) -> usize {
        self.acquire_calls.load(Ordering::Relaxed)
    }

    /// Number of transport connect attempts since creation
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Relaxed)
    }
}

async fn close_slot(label: String, slot: Slot) {
    let Some(connection) = slot.get() else {
        return;
    };

    let mut connection = connection.lock().await;
    match connection.close().await {
        Ok(()) => debug!("Connection to {} closed", label),
        Err(e) => warn!("Error closing connection to {}: {}", label, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectFailure, HostrunError};
    use std::time::Duration;

    fn host() -> Host {
        Host::new("web1", 22, "deploy")
    }

    fn closable() -> Box<dyn Connection> {
        let mut conn = MockConnection::new();
        conn.expect_close().returning(|| Ok(()));
        Box::new(conn)
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(1, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_acquire_reuses_connection() {
        let mut transport = MockTransport::new();
        transport
            .expect_connect()
            .times(1)
            .returning(|_| Ok(closable()));

        let manager = ConnectionManager::new(Arc::new(transport));
        let a = manager.acquire(&host()).await.unwrap();
        let b = manager.acquire(&host()).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.acquire_count(), 2);
        assert_eq!(manager.connect_attempts(), 1);
        assert_eq!(manager.active(), 1);
    }

    #[tokio::test]
    async fn test_distinct_users_get_distinct_connections() {
        let mut transport = MockTransport::new();
        transport
            .expect_connect()
            .times(2)
            .returning(|_| Ok(closable()));

        let manager = ConnectionManager::new(Arc::new(transport));
        let a = manager.acquire(&host()).await.unwrap();
        let b = manager
            .acquire(&Host::new("web1", 22, "root"))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(manager.active(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|h| {
                Err(HostrunError::connection(
                    h,
                    ConnectFailure::Timeout,
                    "timed out",
                ))
            });
        transport
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(closable()));

        let manager = ConnectionManager::with_retry(Arc::new(transport), fast_retry());
        assert!(manager.acquire(&host()).await.is_ok());
        assert_eq!(manager.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_retry_bound_respected() {
        let mut transport = MockTransport::new();
        transport.expect_connect().times(2).returning(|h| {
            Err(HostrunError::connection(
                h,
                ConnectFailure::Refused,
                "connection refused",
            ))
        });

        let manager = ConnectionManager::with_retry(Arc::new(transport), fast_retry());
        let err = manager.acquire(&host()).await.err().unwrap();
        assert!(matches!(
            err,
            HostrunError::Connection {
                kind: ConnectFailure::Refused,
                ..
            }
        ));
        assert_eq!(manager.connect_attempts(), 2);
        assert_eq!(manager.active(), 0);
        assert!(manager.connections.is_empty());
    }

    #[tokio::test]
    async fn test_failed_acquire_leaves_no_slot() {
        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|h| Err(HostrunError::connection(h, ConnectFailure::Dns, "no such host")));
        transport
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(closable()));

        let manager = ConnectionManager::new(Arc::new(transport));
        assert!(manager.acquire(&host()).await.is_err());
        assert!(manager.connections.is_empty());

        manager.acquire(&host()).await.unwrap();
        assert_eq!(manager.connections.len(), 1);
        assert_eq!(manager.active(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let mut transport = MockTransport::new();
        transport.expect_connect().times(1).returning(|h| {
            Err(HostrunError::connection(
                h,
                ConnectFailure::Auth,
                "publickey denied",
            ))
        });

        let manager = ConnectionManager::with_retry(Arc::new(transport), fast_retry());
        assert!(manager.acquire(&host()).await.is_err());
        assert_eq!(manager.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_release_closes_and_reconnects() {
        let mut transport = MockTransport::new();
        transport
            .expect_connect()
            .times(2)
            .returning(|_| Ok(closable()));

        let manager = ConnectionManager::new(Arc::new(transport));
        manager.acquire(&host()).await.unwrap();
        manager.release(&host()).await;
        assert_eq!(manager.active(), 0);

        manager.acquire(&host()).await.unwrap();
        assert_eq!(manager.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_release_all() {
        let mut transport = MockTransport::new();
        transport
            .expect_connect()
            .times(3)
            .returning(|_| Ok(closable()));

        let manager = ConnectionManager::new(Arc::new(transport));
        for name in ["web1", "web2", "web3"] {
            manager
                .acquire(&Host::new(name, 22, "deploy"))
                .await
                .unwrap();
        }
        assert_eq!(manager.active(), 3);

        manager.release_all().await;
        assert_eq!(manager.active(), 0);
    }
}
