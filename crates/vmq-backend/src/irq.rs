//! Interrupt Bridging
//!
//! Handlers bound to the peer's notification ports, plus the doorbell used
//! to wake the peer when the hardware reports work on an attachment's
//! chains. Handlers only capture values that stay fixed while the
//! attachment is connected, so they need no access to the attachment.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::chain::ChainId;
use crate::evtchn::{EventChannel, IrqId, NotifyHandler, Port};
use crate::netdev::{DeviceHandle, NetDeviceRegistrar};

/// Peer notifies that receive buffers were posted
pub struct RxNotify {
    events: Arc<dyn EventChannel>,
    registrar: Arc<dyn NetDeviceRegistrar>,
    device: DeviceHandle,
}

impl RxNotify {
    pub fn new(
        events: Arc<dyn EventChannel>,
        registrar: Arc<dyn NetDeviceRegistrar>,
        device: DeviceHandle,
    ) -> Self {
        Self {
            events,
            registrar,
            device,
        }
    }
}

impl NotifyHandler for RxNotify {
    fn notify(&self, irq: IrqId) {
        // Packet drain happens in the device's poll path
        self.registrar.enable_rx_interrupts(self.device);
        self.events.end_of_interrupt(irq);
    }
}

/// Peer notifies that transmit descriptors are ready
pub struct TxNotify {
    events: Arc<dyn EventChannel>,
    registrar: Arc<dyn NetDeviceRegistrar>,
    device: DeviceHandle,
    chain: ChainId,
}

impl TxNotify {
    pub fn new(
        events: Arc<dyn EventChannel>,
        registrar: Arc<dyn NetDeviceRegistrar>,
        device: DeviceHandle,
        chain: ChainId,
    ) -> Self {
        Self {
            events,
            registrar,
            device,
            chain,
        }
    }
}

impl NotifyHandler for TxNotify {
    fn notify(&self, irq: IrqId) {
        self.registrar.trigger_tx_queue(self.device, self.chain);
        self.events.end_of_interrupt(irq);
    }
}

/// Peer ports learned during connect
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerPorts {
    pub tx: Port,
    pub rx: Port,
}

/// Wakes the peer when the engine completes work on an attachment's chains.
///
/// Armed at the end of connect and disarmed before handlers are unbound.
pub struct Doorbell {
    events: Arc<dyn EventChannel>,
    ports: RwLock<Option<PeerPorts>>,
}

impl Doorbell {
    pub fn new(events: Arc<dyn EventChannel>) -> Self {
        Self {
            events,
            ports: RwLock::new(None),
        }
    }

    pub fn arm(&self, ports: PeerPorts) {
        *self.ports.write() = Some(ports);
    }

    pub fn disarm(&self) {
        *self.ports.write() = None;
    }

    pub fn is_armed(&self) -> bool {
        self.ports.read().is_some()
    }

    /// Signal both peer ports; false when not connected
    pub fn ring(&self) -> bool {
        let Some(ports) = *self.ports.read() else {
            return false;
        };
        self.events.signal(ports.rx);
        self.events.signal(ports.tx);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainDirection, MemChainPool};
    use crate::evtchn::LocalEventHub;
    use crate::netdev::{LocalRegistrar, NetDeviceSpec};

    async fn fixture() -> (Arc<LocalEventHub>, Arc<LocalRegistrar>, DeviceHandle) {
        let pool = Arc::new(MemChainPool::new(0, 8));
        let registrar = Arc::new(LocalRegistrar::new(8, pool));
        let dev = registrar
            .register(&NetDeviceSpec {
                name: "vmq0".into(),
                slot: 3,
                rx_csum: true,
            })
            .await
            .unwrap();
        (Arc::new(LocalEventHub::new()), registrar, dev.handle)
    }

    #[tokio::test]
    async fn test_rx_notify_rearms_and_acks() {
        let (hub, registrar, device) = fixture().await;
        let handler = Arc::new(RxNotify::new(hub.clone(), registrar.clone(), device));

        let irq = hub.bind(1, 20, "rx", handler).unwrap();
        hub.raise(20);
        hub.raise(20);

        assert_eq!(registrar.rx_irq_enables(device), 2);
        assert_eq!(registrar.tx_triggers(device), 0);
        assert_eq!(hub.eoi_count(irq), 2);
    }

    #[tokio::test]
    async fn test_tx_notify_triggers_chain() {
        let (hub, registrar, device) = fixture().await;
        let chain = ChainId {
            index: 6,
            direction: ChainDirection::Tx,
        };
        let handler = Arc::new(TxNotify::new(hub.clone(), registrar.clone(), device, chain));

        let irq = hub.bind(1, 21, "tx", handler).unwrap();
        hub.raise(21);

        assert_eq!(registrar.tx_triggers(device), 1);
        assert_eq!(hub.eoi_count(irq), 1);
    }

    #[test]
    fn test_doorbell_arming() {
        let hub = Arc::new(LocalEventHub::new());
        let bell = Doorbell::new(hub.clone());

        assert!(!bell.ring());

        bell.arm(PeerPorts { tx: 7, rx: 8 });
        assert!(bell.ring());
        assert_eq!(hub.signal_count(7), 1);
        assert_eq!(hub.signal_count(8), 1);

        bell.disarm();
        assert!(!bell.ring());
        assert_eq!(hub.signal_count(7), 1);
    }
}
