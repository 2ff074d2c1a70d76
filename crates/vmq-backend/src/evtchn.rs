//! Notification Channels
//!
//! Doorbell primitive shared with the peer: a peer port is bound to a local
//! handler, and local code can signal a port to wake the peer.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Peer domain identifier
pub type DomainId = u32;

/// Notification channel number
pub type Port = u32;

/// Local interrupt bound to a peer port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IrqId(pub u32);

impl fmt::Display for IrqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irq{}", self.0)
    }
}

/// Notification channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("failed to bind port {port} of domain {peer}: {reason}")]
    BindFailed {
        peer: DomainId,
        port: Port,
        reason: String,
    },
}

/// Callback run when a bound port fires.
///
/// Runs in interrupt context: it must not block, and it must call
/// [`EventChannel::end_of_interrupt`] before returning.
pub trait NotifyHandler: Send + Sync {
    fn notify(&self, irq: IrqId);
}

/// Notification channel interface
pub trait EventChannel: Send + Sync {
    /// Bind a peer port to a handler
    fn bind(
        &self,
        peer: DomainId,
        port: Port,
        name: &str,
        handler: Arc<dyn NotifyHandler>,
    ) -> Result<IrqId, EventError>;

    /// Remove a binding; unknown ids are ignored
    fn unbind(&self, irq: IrqId);

    /// Wake the peer on a port
    fn signal(&self, port: Port);

    /// Acknowledge a delivered notification
    fn end_of_interrupt(&self, irq: IrqId);
}

struct Binding {
    peer: DomainId,
    port: Port,
    name: String,
    handler: Arc<dyn NotifyHandler>,
}

/// In-process event channel hub.
///
/// Peer-side events are injected with [`LocalEventHub::raise`], which runs
/// the bound handler on the caller's thread.
#[derive(Default)]
pub struct LocalEventHub {
    bindings: DashMap<IrqId, Binding>,
    next_irq: AtomicU32,
    signals: DashMap<Port, u64>,
    eois: DashMap<IrqId, u64>,
    unbinds: Mutex<Vec<IrqId>>,
    failing_ports: Mutex<HashSet<Port>>,
}

impl LocalEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make binds of `port` fail
    pub fn fail_bind(&self, port: Port) {
        self.failing_ports.lock().insert(port);
    }

    /// Deliver a peer notification on `port`; returns false if nothing is bound
    pub fn raise(&self, port: Port) -> bool {
        let target = self
            .bindings
            .iter()
            .find(|b| b.port == port)
            .map(|b| (*b.key(), b.handler.clone()));

        // Handler runs without holding a map guard
        match target {
            Some((irq, handler)) => {
                handler.notify(irq);
                true
            }
            None => false,
        }
    }

    /// Times `port` has been signalled
    pub fn signal_count(&self, port: Port) -> u64 {
        self.signals.get(&port).map(|c| *c).unwrap_or(0)
    }

    /// Times `irq` has been acknowledged
    pub fn eoi_count(&self, irq: IrqId) -> u64 {
        self.eois.get(&irq).map(|c| *c).unwrap_or(0)
    }

    /// Whether `port` currently has a handler
    pub fn is_bound(&self, port: Port) -> bool {
        self.bindings.iter().any(|b| b.port == port)
    }

    /// Number of live bindings
    pub fn bound_count(&self) -> usize {
        self.bindings.len()
    }

    /// Unbind calls, in order
    pub fn unbind_log(&self) -> Vec<IrqId> {
        self.unbinds.lock().clone()
    }

    /// Handler name registered for `irq`
    pub fn handler_name(&self, irq: IrqId) -> Option<String> {
        self.bindings.get(&irq).map(|b| b.name.clone())
    }
}

impl EventChannel for LocalEventHub {
    fn bind(
        &self,
        peer: DomainId,
        port: Port,
        name: &str,
        handler: Arc<dyn NotifyHandler>,
    ) -> Result<IrqId, EventError> {
        if self.failing_ports.lock().contains(&port) {
            return Err(EventError::BindFailed {
                peer,
                port,
                reason: "port refused".into(),
            });
        }
        if self.is_bound(port) {
            return Err(EventError::BindFailed {
                peer,
                port,
                reason: "port already bound".into(),
            });
        }

        let irq = IrqId(self.next_irq.fetch_add(1, Ordering::Relaxed) + 1);
        self.bindings.insert(
            irq,
            Binding {
                peer,
                port,
                name: name.to_string(),
                handler,
            },
        );

        tracing::debug!(peer = peer, port = port, irq = %irq, name = name, "bound event channel");
        Ok(irq)
    }

    fn unbind(&self, irq: IrqId) {
        self.unbinds.lock().push(irq);
        if let Some((_, binding)) = self.bindings.remove(&irq) {
            tracing::debug!(
                peer = binding.peer,
                port = binding.port,
                irq = %irq,
                "unbound event channel"
            );
        }
    }

    fn signal(&self, port: Port) {
        *self.signals.entry(port).or_insert(0) += 1;
    }

    fn end_of_interrupt(&self, irq: IrqId) {
        *self.eois.entry(irq).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct Counter {
        hub: Arc<LocalEventHub>,
        hits: AtomicU64,
    }

    impl NotifyHandler for Counter {
        fn notify(&self, irq: IrqId) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.hub.end_of_interrupt(irq);
        }
    }

    #[test]
    fn test_bind_raise_unbind() {
        let hub = Arc::new(LocalEventHub::new());
        let counter = Arc::new(Counter {
            hub: hub.clone(),
            hits: AtomicU64::new(0),
        });

        let irq = hub.bind(1, 12, "test", counter.clone()).unwrap();
        assert_eq!(hub.handler_name(irq).as_deref(), Some("test"));
        assert!(hub.raise(12));
        assert_eq!(counter.hits.load(Ordering::Relaxed), 1);
        assert_eq!(hub.eoi_count(irq), 1);

        hub.unbind(irq);
        assert!(!hub.raise(12));
        assert_eq!(hub.bound_count(), 0);
    }

    #[test]
    fn test_bind_failures() {
        let hub = Arc::new(LocalEventHub::new());
        let counter = Arc::new(Counter {
            hub: hub.clone(),
            hits: AtomicU64::new(0),
        });

        hub.fail_bind(9);
        assert!(matches!(
            hub.bind(1, 9, "test", counter.clone()),
            Err(EventError::BindFailed { port: 9, .. })
        ));

        hub.bind(1, 10, "test", counter.clone()).unwrap();
        assert!(hub.bind(1, 10, "test", counter).is_err());
    }

    #[test]
    fn test_signal_counts() {
        let hub = LocalEventHub::new();
        hub.signal(3);
        hub.signal(3);
        assert_eq!(hub.signal_count(3), 2);
        assert_eq!(hub.signal_count(4), 0);
    }
}
