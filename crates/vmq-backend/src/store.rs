//! Control Store Client
//!
//! Hierarchical key/value namespace shared with the peer. Each device owns
//! a directory (`nodename`) and reads the peer's directory (`otherend`).
//! Multi-key publishes go through a transaction that is retried on
//! conflict until the store accepts it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::evtchn::DomainId;
use crate::state::BusState;

/// Transaction handle
pub type TxnId = u64;

/// Well-known keys
pub mod keys {
    pub const OSID: &str = "osid";
    pub const IF_NUM: &str = "if-num";
    pub const TX_CHAIN_ID: &str = "tx-chain-id";
    pub const RX_CHAIN_ID: &str = "rx-chain-id";
    pub const REMOTE_CHAIN_ID: &str = "remote-chain-id";
    pub const TX_EVTCHN: &str = "tx-evtch";
    pub const RX_EVTCHN: &str = "rx-evtch";
    pub const STATE: &str = "state";
    pub const ONLINE: &str = "online";
}

/// Control store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("missing key {0}")]
    NotFound(String),

    #[error("malformed value {value:?} at {path}")]
    Malformed { path: String, value: String },

    #[error("transaction conflict")]
    Conflict,

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxnId),

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Join a directory and a key into a full path
pub fn path(dir: &str, key: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), key)
}

/// Control store interface (abstracted for testing)
#[async_trait]
pub trait ControlStore: Send + Sync {
    /// Read a single key; `Ok(None)` when absent
    async fn read(&self, dir: &str, key: &str) -> Result<Option<String>>;

    /// Write a single key outside any transaction
    async fn write(&self, dir: &str, key: &str, value: &str) -> Result<()>;

    /// Open a transaction
    async fn transaction_start(&self) -> Result<TxnId>;

    /// Stage a write inside a transaction
    async fn transaction_write(&self, txn: TxnId, dir: &str, key: &str, value: &str) -> Result<()>;

    /// Commit (`abort == false`) or discard a transaction.
    ///
    /// Returns `StoreError::Conflict` when a commit lost a race; nothing
    /// staged in the transaction is visible in that case.
    async fn transaction_end(&self, txn: TxnId, abort: bool) -> Result<()>;
}

/// A device as announced on the bus
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    /// Backend-owned directory
    pub nodename: String,
    /// Peer-owned directory
    pub otherend: String,
    /// Peer domain
    pub otherend_id: DomainId,
    /// Device type used for driver matching
    pub device_type: String,
}

/// Counters for transactional publishes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub attempts: u64,
    pub conflicts: u64,
}

/// Typed helpers on top of a [`ControlStore`]
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn ControlStore>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn ControlStore>) -> Self {
        Self { store }
    }

    /// Read a required decimal value
    pub async fn read_unsigned(&self, dir: &str, key: &str) -> Result<u32> {
        let value = self
            .store
            .read(dir, key)
            .await?
            .ok_or_else(|| StoreError::NotFound(path(dir, key)))?;

        value.trim().parse::<u32>().map_err(|_| StoreError::Malformed {
            path: path(dir, key),
            value,
        })
    }

    /// Read several required decimal values from one directory
    pub async fn gather(&self, dir: &str, names: &[&str]) -> Result<Vec<u32>> {
        let mut values = Vec::with_capacity(names.len());
        for name in names {
            values.push(self.read_unsigned(dir, name).await?);
        }
        Ok(values)
    }

    /// Whether the backend directory carries the `online` policy flag
    pub async fn is_online(&self, dir: &str) -> bool {
        match self.store.read(dir, keys::ONLINE).await {
            Ok(Some(value)) => value.trim().parse::<u32>().map(|v| v != 0).unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(dir = dir, error = %e, "failed to read online flag");
                false
            }
        }
    }

    /// Publish a state token for the local side
    pub async fn switch_state(&self, dir: &str, state: BusState) -> Result<()> {
        self.store.write(dir, keys::STATE, state.token()).await
    }

    /// Write every entry in one transaction, retrying on conflict.
    ///
    /// The retry is unbounded: the store either accepts the transaction
    /// or fails with something other than a conflict.
    pub async fn publish_atomic(
        &self,
        dir: &str,
        entries: &[(&str, String)],
    ) -> Result<TransactionStats> {
        let mut stats = TransactionStats::default();

        loop {
            stats.attempts += 1;
            let txn = self.store.transaction_start().await?;

            for (key, value) in entries {
                if let Err(e) = self.store.transaction_write(txn, dir, key, value).await {
                    // Best effort: the write error is what gets reported
                    let _ = self.store.transaction_end(txn, true).await;
                    return Err(e);
                }
            }

            match self.store.transaction_end(txn, false).await {
                Ok(()) => return Ok(stats),
                Err(StoreError::Conflict) => {
                    stats.conflicts += 1;
                    tracing::warn!(
                        dir = dir,
                        attempt = stats.attempts,
                        "control store transaction conflict, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
}

#[derive(Debug)]
struct PendingTxn {
    start_version: u64,
    writes: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct MemInner {
    entries: BTreeMap<String, Entry>,
    version: u64,
    txns: HashMap<TxnId, PendingTxn>,
    forced_conflicts: u32,
    failing_writes: Vec<String>,
    log: Vec<(String, String)>,
}

/// In-memory control store.
///
/// Commits are applied under a single lock so readers observe either none
/// or all of a transaction's writes. A commit conflicts when any key it
/// writes changed after the transaction started.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
    next_txn: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key directly
    pub fn set(&self, dir: &str, key: &str, value: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.version += 1;
        let version = inner.version;
        let full = path(dir, key);
        let value = value.into();
        inner.log.push((full.clone(), value.clone()));
        inner.entries.insert(full, Entry { value, version });
    }

    /// Synchronous read for tests and observers
    pub fn get(&self, dir: &str, key: &str) -> Option<String> {
        self.inner
            .lock()
            .entries
            .get(&path(dir, key))
            .map(|e| e.value.clone())
    }

    /// Read several keys under one lock
    pub fn get_many(&self, dir: &str, keys: &[&str]) -> Vec<Option<String>> {
        let inner = self.inner.lock();
        keys.iter()
            .map(|key| inner.entries.get(&path(dir, key)).map(|e| e.value.clone()))
            .collect()
    }

    /// Make the next `count` commits fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.inner.lock().forced_conflicts = count;
    }

    /// Make writes to `dir/key` fail with a backend error
    pub fn fail_writes_to(&self, dir: &str, key: &str) {
        self.inner.lock().failing_writes.push(path(dir, key));
    }

    /// Values written to one path, in order
    pub fn history(&self, dir: &str, key: &str) -> Vec<String> {
        let full = path(dir, key);
        self.inner
            .lock()
            .log
            .iter()
            .filter(|(p, _)| *p == full)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Open transactions
    pub fn open_transactions(&self) -> usize {
        self.inner.lock().txns.len()
    }
}

#[async_trait]
impl ControlStore for MemStore {
    async fn read(&self, dir: &str, key: &str) -> Result<Option<String>> {
        Ok(self.get(dir, key))
    }

    async fn write(&self, dir: &str, key: &str, value: &str) -> Result<()> {
        let full = path(dir, key);
        if self.inner.lock().failing_writes.contains(&full) {
            return Err(StoreError::Backend(format!("write to {} refused", full)));
        }
        self.set(dir, key, value);
        Ok(())
    }

    async fn transaction_start(&self) -> Result<TxnId> {
        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock();
        let start_version = inner.version;
        inner.txns.insert(
            txn,
            PendingTxn {
                start_version,
                writes: Vec::new(),
            },
        );
        Ok(txn)
    }

    async fn transaction_write(&self, txn: TxnId, dir: &str, key: &str, value: &str) -> Result<()> {
        let full = path(dir, key);
        let mut inner = self.inner.lock();
        if inner.failing_writes.contains(&full) {
            return Err(StoreError::Backend(format!("write to {} refused", full)));
        }
        let pending = inner
            .txns
            .get_mut(&txn)
            .ok_or(StoreError::UnknownTransaction(txn))?;
        pending.writes.push((full, value.to_string()));
        Ok(())
    }

    async fn transaction_end(&self, txn: TxnId, abort: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let pending = inner
            .txns
            .remove(&txn)
            .ok_or(StoreError::UnknownTransaction(txn))?;

        if abort {
            return Ok(());
        }

        if inner.forced_conflicts > 0 {
            inner.forced_conflicts -= 1;
            return Err(StoreError::Conflict);
        }

        let stale = pending.writes.iter().any(|(full, _)| {
            inner
                .entries
                .get(full)
                .map(|e| e.version > pending.start_version)
                .unwrap_or(false)
        });
        if stale {
            return Err(StoreError::Conflict);
        }

        inner.version += 1;
        let version = inner.version;
        for (full, value) in pending.writes {
            inner.log.push((full.clone(), value.clone()));
            inner.entries.insert(full, Entry { value, version });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (Arc<MemStore>, StoreClient) {
        let store = Arc::new(MemStore::new());
        (store.clone(), StoreClient::new(store))
    }

    #[tokio::test]
    async fn test_read_unsigned() {
        let (store, client) = client();
        store.set("/fe/1", keys::OSID, "5");
        store.set("/fe/1", keys::IF_NUM, "two");

        assert_eq!(client.read_unsigned("/fe/1", keys::OSID).await.unwrap(), 5);
        assert_eq!(
            client.read_unsigned("/fe/1", keys::IF_NUM).await,
            Err(StoreError::Malformed {
                path: "/fe/1/if-num".into(),
                value: "two".into(),
            })
        );
        assert_eq!(
            client.read_unsigned("/fe/1", keys::TX_EVTCHN).await,
            Err(StoreError::NotFound("/fe/1/tx-evtch".into()))
        );
    }

    #[tokio::test]
    async fn test_publish_retries_conflicts() {
        let (store, client) = client();
        store.inject_conflicts(3);

        let stats = client
            .publish_atomic(
                "/be/1",
                &[(keys::TX_CHAIN_ID, "4".into()), (keys::RX_CHAIN_ID, "5".into())],
            )
            .await
            .unwrap();

        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.conflicts, 3);
        assert_eq!(store.get("/be/1", keys::TX_CHAIN_ID).as_deref(), Some("4"));
        assert_eq!(store.get("/be/1", keys::RX_CHAIN_ID).as_deref(), Some("5"));
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_conflicting_commit_is_invisible() {
        let (store, _) = client();

        let txn = store.transaction_start().await.unwrap();
        store
            .transaction_write(txn, "/be/1", keys::TX_CHAIN_ID, "1")
            .await
            .unwrap();
        store.set("/be/1", keys::TX_CHAIN_ID, "9");

        assert_eq!(store.transaction_end(txn, false).await, Err(StoreError::Conflict));
        assert_eq!(store.get("/be/1", keys::TX_CHAIN_ID).as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_publish_write_failure_aborts() {
        let (store, client) = client();
        store.fail_writes_to("/be/1", keys::RX_CHAIN_ID);

        let err = client
            .publish_atomic(
                "/be/1",
                &[(keys::TX_CHAIN_ID, "4".into()), (keys::RX_CHAIN_ID, "5".into())],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.get("/be/1", keys::TX_CHAIN_ID), None);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_online_flag() {
        let (store, client) = client();
        assert!(!client.is_online("/be/1").await);

        store.set("/be/1", keys::ONLINE, "1");
        assert!(client.is_online("/be/1").await);

        store.set("/be/1", keys::ONLINE, "0");
        assert!(!client.is_online("/be/1").await);
    }
}
