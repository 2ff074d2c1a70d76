//! Net Device Registrar
//!
//! Registers the local virtual interface that fronts a guest queue and
//! exposes the interrupt and poll hooks the notification handlers drive.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::chain::{Chain, ChainDirection, ChainId, ChainIndex, ChainPool, ChainRequest};

/// Registered interface, identified by its slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// What to register
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetDeviceSpec {
    /// Interface name, e.g. `vmq2`
    pub name: String,
    /// Device slot (`base_index + if_num`)
    pub slot: u32,
    /// Receive checksum offload
    pub rx_csum: bool,
}

/// A registered interface
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetDevice {
    pub handle: DeviceHandle,
    pub name: String,
    /// Receive chain the interface itself polls
    pub rx_chain: ChainIndex,
}

/// Registrar errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetDevError {
    #[error("device slot {0} already in use")]
    SlotInUse(u32),

    #[error("device slot {slot} out of range (max {max})")]
    SlotOutOfRange { slot: u32, max: u32 },

    #[error("no DMA chain available for {0}")]
    NoChain(String),

    #[error("registration failed: {0}")]
    Register(String),
}

/// Registrar interface (abstracted for testing)
#[async_trait]
pub trait NetDeviceRegistrar: Send + Sync {
    /// Register an interface
    async fn register(&self, spec: &NetDeviceSpec) -> Result<NetDevice, NetDevError>;

    /// Unregister an interface; unknown handles are ignored
    async fn unregister(&self, device: DeviceHandle);

    /// Re-arm receive interrupts so the poll path drains the queue
    fn enable_rx_interrupts(&self, device: DeviceHandle);

    /// Kick the engine to resume descriptor processing on a chain
    fn trigger_tx_queue(&self, device: DeviceHandle, chain: ChainId);
}

#[derive(Debug)]
struct DeviceRecord {
    name: String,
    rx_chain: Chain,
    rx_irq_enables: AtomicU64,
    tx_triggers: AtomicU64,
}

/// In-process registrar.
///
/// Each registered interface leases its own receive chain from the shared
/// pool, and gives it back on unregister.
pub struct LocalRegistrar {
    max_slots: u32,
    pool: Arc<dyn ChainPool>,
    devices: DashMap<u32, DeviceRecord>,
    fail_next: Mutex<Option<String>>,
    unregistered: Mutex<Vec<DeviceHandle>>,
}

impl LocalRegistrar {
    pub fn new(max_slots: u32, pool: Arc<dyn ChainPool>) -> Self {
        Self {
            max_slots,
            pool,
            devices: DashMap::new(),
            fail_next: Mutex::new(None),
            unregistered: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `register` call fail
    pub fn fail_next_register(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }

    pub fn is_registered(&self, device: DeviceHandle) -> bool {
        self.devices.contains_key(&device.0)
    }

    pub fn device_name(&self, device: DeviceHandle) -> Option<String> {
        self.devices.get(&device.0).map(|d| d.name.clone())
    }

    pub fn registered_count(&self) -> usize {
        self.devices.len()
    }

    /// Receive interrupt re-arms seen by a device
    pub fn rx_irq_enables(&self, device: DeviceHandle) -> u64 {
        self.devices
            .get(&device.0)
            .map(|d| d.rx_irq_enables.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Transmit triggers seen by a device
    pub fn tx_triggers(&self, device: DeviceHandle) -> u64 {
        self.devices
            .get(&device.0)
            .map(|d| d.tx_triggers.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Unregister calls, in order
    pub fn unregister_log(&self) -> Vec<DeviceHandle> {
        self.unregistered.lock().clone()
    }
}

#[async_trait]
impl NetDeviceRegistrar for LocalRegistrar {
    async fn register(&self, spec: &NetDeviceSpec) -> Result<NetDevice, NetDevError> {
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(NetDevError::Register(reason));
        }
        if spec.slot >= self.max_slots {
            return Err(NetDevError::SlotOutOfRange {
                slot: spec.slot,
                max: self.max_slots,
            });
        }

        let entry = match self.devices.entry(spec.slot) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NetDevError::SlotInUse(spec.slot))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => v,
        };

        let rx_chain = self
            .pool
            .acquire(ChainRequest {
                direction: ChainDirection::Rx,
                attachment: None,
            })
            .ok_or_else(|| NetDevError::NoChain(spec.name.clone()))?;
        let device = NetDevice {
            handle: DeviceHandle(spec.slot),
            name: spec.name.clone(),
            rx_chain: rx_chain.index(),
        };

        entry.insert(DeviceRecord {
            name: spec.name.clone(),
            rx_chain,
            rx_irq_enables: AtomicU64::new(0),
            tx_triggers: AtomicU64::new(0),
        });

        tracing::info!(
            name = %spec.name,
            slot = spec.slot,
            rx_chain = device.rx_chain,
            "registered net device"
        );
        Ok(device)
    }

    async fn unregister(&self, device: DeviceHandle) {
        self.unregistered.lock().push(device);
        if let Some((_, record)) = self.devices.remove(&device.0) {
            self.pool.release(&record.rx_chain);
            tracing::info!(name = %record.name, slot = device.0, "unregistered net device");
        }
    }

    fn enable_rx_interrupts(&self, device: DeviceHandle) {
        if let Some(record) = self.devices.get(&device.0) {
            record.rx_irq_enables.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn trigger_tx_queue(&self, device: DeviceHandle, chain: ChainId) {
        if let Some(record) = self.devices.get(&device.0) {
            record.tx_triggers.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(slot = device.0, chain = chain.index, "tx queue triggered");
        }
    }
}
