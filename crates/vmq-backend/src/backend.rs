//! Backend Service
//!
//! Driver-level entry point: matches announced devices, owns the registry
//! of live attachments and routes peer state changes and data-ready events
//! to them. Each attachment is serialized behind its own async mutex.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::attachment::{Attachment, AttachmentInfo, BackendContext};
use crate::chain::{AttachmentId, ChainIndex};
use crate::irq::Doorbell;
use crate::state::{drive, peer_directive, BusState, Directive, Transitions};
use crate::store::DeviceNode;
use crate::{BackendError, Result};

/// Where the running domain reports its hypervisor
pub const HYPERVISOR_TYPE_PATH: &str = "/sys/hypervisor/type";

/// Whether this process runs inside a hypervisor domain
pub fn in_hypervisor_domain() -> bool {
    std::fs::read_to_string(HYPERVISOR_TYPE_PATH)
        .map(|t| !t.trim().is_empty())
        .unwrap_or(false)
}

#[derive(Debug, Default)]
struct BackendStats {
    probes: AtomicU64,
    probe_failures: AtomicU64,
    removals: AtomicU64,
    peer_events: AtomicU64,
    rejected_events: AtomicU64,
    doorbells: AtomicU64,
    stray_data: AtomicU64,
}

/// Backend counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatsSnapshot {
    pub attached: usize,
    pub probes: u64,
    pub probe_failures: u64,
    pub removals: u64,
    pub peer_events: u64,
    pub rejected_events: u64,
    pub doorbells: u64,
    pub stray_data: u64,
}

/// Switch queue backend
pub struct VmqBackend {
    ctx: Arc<BackendContext>,
    attachments: DashMap<String, Arc<Mutex<Attachment>>>,
    doorbells: DashMap<AttachmentId, Arc<Doorbell>>,
    next_id: AtomicU64,
    stats: BackendStats,
}

impl VmqBackend {
    /// Start the backend. Refuses to run outside a hypervisor domain.
    pub fn start(ctx: Arc<BackendContext>, virtualized: bool) -> Result<Self> {
        if !virtualized {
            tracing::error!("not running in a hypervisor domain");
            return Err(BackendError::NotVirtualized);
        }
        ctx.config.validate()?;

        tracing::info!(
            device_types = ?ctx.config.device_types,
            base_index = ctx.config.base_index,
            "switch queue backend started"
        );
        Ok(Self {
            ctx,
            attachments: DashMap::new(),
            doorbells: DashMap::new(),
            next_id: AtomicU64::new(0),
            stats: BackendStats::default(),
        })
    }

    /// Whether this backend handles a device type
    pub fn matches(&self, device_type: &str) -> bool {
        self.ctx.config.matches(device_type)
    }

    /// Attach a newly announced device
    pub async fn probe(&self, device: DeviceNode) -> Result<AttachmentInfo> {
        if !self.matches(&device.device_type) {
            return Err(BackendError::UnsupportedDevice(device.device_type));
        }
        if self.attachments.contains_key(&device.nodename) {
            return Err(BackendError::AlreadyAttached(device.nodename));
        }

        self.stats.probes.fetch_add(1, Ordering::Relaxed);
        let id = AttachmentId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let path = device.nodename.clone();

        let attachment = match Attachment::attach(self.ctx.clone(), device, id).await {
            Ok(a) => a,
            Err(e) => {
                self.stats.probe_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let info = attachment.info();
        self.doorbells.insert(id, attachment.doorbell());
        self.attachments
            .insert(path, Arc::new(Mutex::new(attachment)));

        tracing::info!(device = %info.device, id = %id, "device probed");
        Ok(info)
    }

    fn lookup(&self, path: &str) -> Result<Arc<Mutex<Attachment>>> {
        self.attachments
            .get(path)
            .map(|a| a.value().clone())
            .ok_or_else(|| BackendError::UnknownDevice(path.to_string()))
    }

    /// React to the peer publishing a new state token.
    ///
    /// Returns the local state after the reaction.
    pub async fn peer_changed(&self, path: &str, token: &str) -> Result<BusState> {
        let entry = self.lookup(path)?;
        let mut attachment = entry.lock().await;
        if !self.is_current(path, &entry) {
            // Removed while this event waited for the lock
            return Err(BackendError::UnknownDevice(path.to_string()));
        }
        self.stats.peer_events.fetch_add(1, Ordering::Relaxed);

        let peer = BusState::from_peer_token(token);
        attachment.set_peer_state(peer);
        let online = self.ctx.store.is_online(path).await;
        tracing::debug!(
            device = path,
            peer = %peer,
            local = %attachment.state(),
            online = online,
            "peer state changed"
        );

        match peer_directive(peer, online) {
            Directive::Drive(target) => Ok(drive(&mut *attachment, target).await?),
            Directive::AcknowledgeReconfigure => {
                attachment.acknowledge_reconfigure().await?;
                Ok(attachment.state())
            }
            Directive::CloseAndUnregister => {
                let closed = drive(&mut *attachment, BusState::Closed).await;
                attachment.remove().await;
                let id = attachment.id();
                drop(attachment);
                self.forget(path, &entry, id);
                tracing::info!(device = path, peer = %peer, "peer gone, device unregistered");
                Ok(closed?)
            }
            Directive::Reject => {
                self.stats.rejected_events.fetch_add(1, Ordering::Relaxed);
                tracing::error!(device = path, peer = %peer, "peer published a backend-only state");
                Err(BackendError::UnexpectedPeerState(peer))
            }
        }
    }

    fn is_current(&self, path: &str, entry: &Arc<Mutex<Attachment>>) -> bool {
        self.attachments
            .get(path)
            .map(|current| Arc::ptr_eq(current.value(), entry))
            .unwrap_or(false)
    }

    /// Drop `entry` from the registry unless the path was re-probed meanwhile
    fn forget(&self, path: &str, entry: &Arc<Mutex<Attachment>>, id: AttachmentId) -> bool {
        let removed = self
            .attachments
            .remove_if(path, |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if removed {
            self.doorbells.remove(&id);
            self.stats.removals.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Tear a device down; unknown devices are ignored
    pub async fn remove(&self, path: &str) {
        let Some((_, entry)) = self.attachments.remove(path) else {
            return;
        };
        let mut attachment = entry.lock().await;
        attachment.remove().await;
        self.doorbells.remove(&attachment.id());
        self.stats.removals.fetch_add(1, Ordering::Relaxed);
        tracing::info!(device = path, "device removed");
    }

    /// Data-ready notification from the forwarding engine.
    ///
    /// Wakes the peer owning `chain`; returns false when the chain has no
    /// connected owner. Safe to call from interrupt context.
    pub fn on_chain_data(&self, chain: ChainIndex) -> bool {
        let bell = self
            .ctx
            .pool
            .owner_of(chain)
            .and_then(|id| self.doorbells.get(&id).map(|b| b.value().clone()));

        match bell {
            Some(bell) if bell.ring() => {
                self.stats.doorbells.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.stats.stray_data.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(chain = chain, "data ready on chain without connected peer");
                false
            }
        }
    }

    /// Views of every live attachment, ordered by device path
    pub async fn attachments(&self) -> Vec<AttachmentInfo> {
        // Collect handles first; no map guard is held across an await
        let entries: Vec<_> = self.attachments.iter().map(|e| e.value().clone()).collect();

        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            infos.push(entry.lock().await.info());
        }
        infos.sort_by(|a, b| a.device.cmp(&b.device));
        infos
    }

    /// View of one attachment
    pub async fn snapshot(&self, path: &str) -> Option<AttachmentInfo> {
        let entry = self.lookup(path).ok()?;
        let info = entry.lock().await.info();
        Some(info)
    }

    /// Remove every attachment
    pub async fn shutdown(&self) {
        let paths: Vec<String> = self.attachments.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            self.remove(&path).await;
        }
        tracing::info!("switch queue backend stopped");
    }

    pub fn stats(&self) -> BackendStatsSnapshot {
        BackendStatsSnapshot {
            attached: self.attachments.len(),
            probes: self.stats.probes.load(Ordering::Relaxed),
            probe_failures: self.stats.probe_failures.load(Ordering::Relaxed),
            removals: self.stats.removals.load(Ordering::Relaxed),
            peer_events: self.stats.peer_events.load(Ordering::Relaxed),
            rejected_events: self.stats.rejected_events.load(Ordering::Relaxed),
            doorbells: self.stats.doorbells.load(Ordering::Relaxed),
            stray_data: self.stats.stray_data.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::tests::{Fixture, BACK, FRONT};
    use crate::attachment::AttachError;
    use crate::store::keys;

    fn backend(fx: &Fixture) -> VmqBackend {
        VmqBackend::start(fx.ctx.clone(), true).unwrap()
    }

    async fn probed(fx: &Fixture) -> VmqBackend {
        fx.seed_peer(FRONT, 5, 2);
        fx.seed_ports(FRONT, 40, 41);
        let backend = backend(fx);
        backend.probe(Fixture::node(FRONT, BACK)).await.unwrap();
        backend
    }

    #[test]
    fn test_start_requires_hypervisor() {
        let fx = Fixture::new();
        assert!(matches!(
            VmqBackend::start(fx.ctx.clone(), false),
            Err(BackendError::NotVirtualized)
        ));
        assert!(VmqBackend::start(fx.ctx.clone(), true).is_ok());
    }

    #[tokio::test]
    async fn test_probe_rejects_foreign_and_repeated_devices() {
        let fx = Fixture::new();
        let backend = probed(&fx).await;

        let mut vif = Fixture::node(FRONT, "/local/domain/0/backend/vif/1/0");
        vif.device_type = "vif".into();
        assert!(matches!(
            backend.probe(vif).await,
            Err(BackendError::UnsupportedDevice(t)) if t == "vif"
        ));
        assert!(matches!(
            backend.probe(Fixture::node(FRONT, BACK)).await,
            Err(BackendError::AlreadyAttached(_))
        ));
        assert_eq!(backend.stats().attached, 1);
    }

    #[tokio::test]
    async fn test_probe_failure_is_counted() {
        let fx = Fixture::new();
        let backend = backend(&fx);

        let err = backend.probe(Fixture::node(FRONT, BACK)).await.unwrap_err();
        assert!(matches!(err, BackendError::Attach(AttachError::Store(_))));
        assert_eq!(backend.stats().probe_failures, 1);
        assert!(backend.attachments().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_negotiation_with_online_close() {
        let fx = Fixture::new();
        fx.store.set(BACK, keys::ONLINE, "1");
        let backend = probed(&fx).await;

        assert_eq!(
            backend.peer_changed(BACK, "Initialising").await.unwrap(),
            BusState::InitWait
        );
        assert_eq!(
            backend.peer_changed(BACK, "Initialised").await.unwrap(),
            BusState::Connected
        );

        let info = backend.snapshot(BACK).await.unwrap();
        assert_eq!(info.peer_state, BusState::Initialised);
        assert!(info.tx_irq.is_some());

        assert!(backend.on_chain_data(info.tx_chain.unwrap()));
        assert_eq!(fx.hub.signal_count(40), 2);
        assert_eq!(fx.hub.signal_count(41), 2);

        assert_eq!(
            backend.peer_changed(BACK, "Closing").await.unwrap(),
            BusState::Closing
        );
        assert_eq!(fx.hub.bound_count(), 0);
        assert!(!backend.on_chain_data(info.tx_chain.unwrap()));

        assert_eq!(
            backend.peer_changed(BACK, "Closed").await.unwrap(),
            BusState::Closed
        );

        // Online devices survive a peer close
        assert_eq!(fx.registrar.registered_count(), 1);
        assert_eq!(backend.stats().attached, 1);
        assert_eq!(
            fx.store.history(BACK, keys::STATE),
            vec!["InitWait", "Connected", "Closing", "Closed"]
        );
    }

    #[tokio::test]
    async fn test_offline_close_unregisters() {
        let fx = Fixture::new();
        let backend = probed(&fx).await;
        backend.peer_changed(BACK, "Connected").await.unwrap();

        assert_eq!(
            backend.peer_changed(BACK, "Closed").await.unwrap(),
            BusState::Closed
        );

        assert_eq!(fx.registrar.registered_count(), 0);
        assert_eq!(fx.hub.bound_count(), 0);
        assert_eq!(fx.pool.stats().in_use, 0);
        assert!(backend.snapshot(BACK).await.is_none());
        assert_eq!(backend.stats().removals, 1);
        assert_eq!(fx.store.get(BACK, keys::STATE).as_deref(), Some("Closed"));
    }

    #[tokio::test]
    async fn test_unknown_token_unregisters() {
        let fx = Fixture::new();
        fx.store.set(BACK, keys::ONLINE, "1");
        let backend = probed(&fx).await;

        backend.peer_changed(BACK, "bogus").await.unwrap();
        assert_eq!(fx.registrar.registered_count(), 0);
        assert!(backend.attachments().await.is_empty());
        assert!(matches!(
            backend.peer_changed(BACK, "Connected").await,
            Err(BackendError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_reconfigure_is_acknowledged() {
        let fx = Fixture::new();
        let backend = probed(&fx).await;

        assert_eq!(
            backend.peer_changed(BACK, "Reconfiguring").await.unwrap(),
            BusState::InitWait
        );
        assert_eq!(
            fx.store.get(BACK, keys::STATE).as_deref(),
            Some("Reconfigured")
        );
        assert_eq!(backend.snapshot(BACK).await.unwrap().state, BusState::InitWait);
    }

    #[tokio::test]
    async fn test_backend_only_states_are_rejected() {
        let fx = Fixture::new();
        let backend = probed(&fx).await;

        for token in ["InitWait", "Reconfigured"] {
            assert!(matches!(
                backend.peer_changed(BACK, token).await,
                Err(BackendError::UnexpectedPeerState(_))
            ));
        }
        assert_eq!(backend.snapshot(BACK).await.unwrap().state, BusState::InitWait);
        assert_eq!(backend.stats().rejected_events, 2);
    }

    #[tokio::test]
    async fn test_stray_chain_data() {
        let fx = Fixture::new();
        let backend = probed(&fx).await;
        let info = backend.snapshot(BACK).await.unwrap();

        // Not connected yet
        assert!(!backend.on_chain_data(info.tx_chain.unwrap()));
        // Interface-owned chain belongs to no attachment
        let own: ChainIndex = fx
            .store
            .get(BACK, keys::REMOTE_CHAIN_ID)
            .unwrap()
            .parse()
            .unwrap();
        assert!(!backend.on_chain_data(own));
        assert!(!backend.on_chain_data(999));
        assert_eq!(backend.stats().stray_data, 3);
    }

    #[tokio::test]
    async fn test_stale_entry_never_drops_reprobed_device() {
        let fx = Fixture::new();
        let backend = probed(&fx).await;
        let stale = backend.lookup(BACK).unwrap();
        let stale_id = stale.lock().await.id();

        backend.remove(BACK).await;
        let fresh = backend.probe(Fixture::node(FRONT, BACK)).await.unwrap();
        assert_ne!(fresh.id, stale_id);

        assert!(!backend.forget(BACK, &stale, stale_id));
        assert!(!backend.is_current(BACK, &stale));
        assert_eq!(backend.snapshot(BACK).await.unwrap().id, fresh.id);
        assert_eq!(fx.registrar.registered_count(), 1);
        assert_eq!(backend.stats().removals, 1);

        // The fresh device still tears down on an offline peer close
        backend.peer_changed(BACK, "Closed").await.unwrap();
        assert_eq!(fx.registrar.registered_count(), 0);
        assert_eq!(fx.pool.stats().in_use, 0);
        assert_eq!(backend.stats().removals, 2);
    }

    #[tokio::test]
    async fn test_remove_and_shutdown() {
        let fx = Fixture::new();
        let backend = probed(&fx).await;

        let second_front = "/local/domain/2/device/renesas_vmq/0";
        let second_back = "/local/domain/0/backend/renesas_vmq/2/0";
        fx.seed_peer(second_front, 6, 3);
        backend
            .probe(Fixture::node(second_front, second_back))
            .await
            .unwrap();
        assert_eq!(fx.registrar.registered_count(), 2);

        backend.remove(BACK).await;
        backend.remove(BACK).await;
        assert_eq!(fx.registrar.registered_count(), 1);

        backend.shutdown().await;
        assert_eq!(fx.registrar.registered_count(), 0);
        assert_eq!(fx.pool.stats().in_use, 0);
        assert_eq!(backend.stats().removals, 2);
    }
}
