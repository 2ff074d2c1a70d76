//! Switch Queue Backend
//!
//! Host-side backend for paravirtual network queues on a hardware switch.
//! A guest announces a device on the control bus; the backend leases a
//! pair of DMA chains for it, registers a local interface, negotiates the
//! connection through a shared key/value store and bridges interrupts
//! between the guest's notification ports and the switch.
//!
//! ## Architecture
//!
//! ```text
//!   peer state token          chain data-ready
//!          |                         |
//!          v                         v
//!   +-------------+  lookup   +-------------+  owner_of  +-----------+
//!   | VmqBackend  |---------->| Attachment  |<-----------| ChainPool |
//!   +-------------+           +-------------+            +-----------+
//!          |                   |    |    |
//!    peer_directive       store |    | events  registrar
//!          v                   v    v    v
//!     drive(edge table)  ControlStore  EventChannel  NetDeviceRegistrar
//! ```
//!
//! ## Modules
//!
//! - **state**: bus states, the transition table and the driver loop
//! - **store**: control store client with retried atomic publishes
//! - **chain**: DMA chain leases and the datapath engine seam
//! - **evtchn**: notification channel binding and signalling
//! - **netdev**: local interface registration
//! - **irq**: peer notification handlers and the data-ready doorbell
//! - **attachment**: per-device lifecycle
//! - **backend**: device registry and event routing
//! - **config**: backend configuration

pub mod attachment;
pub mod backend;
pub mod chain;
pub mod config;
pub mod evtchn;
pub mod irq;
pub mod netdev;
pub mod state;
pub mod store;

pub use attachment::{AttachError, Attachment, AttachmentInfo, BackendContext};
pub use backend::{in_hypervisor_domain, BackendStatsSnapshot, VmqBackend};
pub use chain::{
    AttachmentId, Chain, ChainDirection, ChainId, ChainIndex, ChainPool, DatapathEngine,
    MemChainPool, OwnerId,
};
pub use config::BackendConfig;
pub use evtchn::{EventChannel, IrqId, LocalEventHub, NotifyHandler, Port};
pub use netdev::{LocalRegistrar, NetDeviceRegistrar};
pub use state::{BusState, Directive};
pub use store::{ControlStore, DeviceNode, MemStore, StoreClient, StoreError};

use thiserror::Error;

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not running in a hypervisor domain")]
    NotVirtualized,

    #[error("unsupported device type: {0}")]
    UnsupportedDevice(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device already attached: {0}")]
    AlreadyAttached(String),

    #[error("peer published {0}, which only a backend may publish")]
    UnexpectedPeerState(BusState),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("attach error: {0}")]
    Attach(#[from] AttachError),
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BackendError::UnexpectedPeerState(BusState::InitWait);
        assert_eq!(
            err.to_string(),
            "peer published InitWait, which only a backend may publish"
        );

        let err: BackendError = AttachError::NoDevice.into();
        assert!(matches!(err, BackendError::Attach(AttachError::NoDevice)));
    }
}
