//! DMA Chain Pool
//!
//! Directional descriptor-ring resources drawn from a fixed shared pool.
//!
//! # Design
//!
//! - A [`Chain`] is a lease: it is not `Clone`, so exactly one holder can
//!   give it back.
//! - The link from a chain to the attachment that owns it is an
//!   [`AttachmentId`] stored in the pool slot, resolved with
//!   [`ChainPool::owner_of`]. Chains never point at attachments.
//! - Every acquisition bumps a slot generation; releasing a stale lease is
//!   a no-op, so double release never frees somebody else's chain.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Index of a chain inside the pool
pub type ChainIndex = u32;

/// Peer session identifier
pub type OwnerId = u32;

/// Owner id carried by chains the local side holds for itself
pub const LOCAL_OWNER: OwnerId = 0;

/// Weak handle to an attachment, resolved through the backend registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentId(pub u64);

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "att-{}", self.0)
    }
}

/// Ring direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainDirection {
    Tx,
    Rx,
}

impl ChainDirection {
    /// Queue role the datapath engine gives a chain of this direction
    pub fn queue_role(&self) -> QueueRole {
        match self {
            ChainDirection::Tx => QueueRole::Transmit,
            ChainDirection::Rx => QueueRole::Receive,
        }
    }
}

impl fmt::Display for ChainDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainDirection::Tx => f.write_str("tx"),
            ChainDirection::Rx => f.write_str("rx"),
        }
    }
}

/// Hardware queue role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueRole {
    Transmit,
    Receive,
}

/// Copyable description of a chain, safe to hand to interrupt handlers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId {
    pub index: ChainIndex,
    pub direction: ChainDirection,
}

/// Parameters for an acquisition
#[derive(Clone, Copy, Debug)]
pub struct ChainRequest {
    pub direction: ChainDirection,
    /// Attachment the chain will belong to, if any
    pub attachment: Option<AttachmentId>,
}

/// A leased chain
#[derive(Debug, PartialEq, Eq)]
pub struct Chain {
    index: ChainIndex,
    generation: u64,
    direction: ChainDirection,
    owner: OwnerId,
}

impl Chain {
    /// Build a lease; pool implementations only
    pub fn lease(index: ChainIndex, generation: u64, direction: ChainDirection) -> Self {
        Self {
            index,
            generation,
            direction,
            owner: LOCAL_OWNER,
        }
    }

    pub fn index(&self) -> ChainIndex {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn direction(&self) -> ChainDirection {
        self.direction
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn id(&self) -> ChainId {
        ChainId {
            index: self.index,
            direction: self.direction,
        }
    }
}

/// Chain pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain {0} is not leased")]
    NotLeased(ChainIndex),
}

/// Shared chain pool (internally synchronized)
pub trait ChainPool: Send + Sync {
    /// Lease a free chain
    fn acquire(&self, request: ChainRequest) -> Option<Chain>;

    /// Return a lease; releasing a stale or already-released lease is a no-op
    fn release(&self, chain: &Chain);

    /// Record the peer session that owns a leased chain
    fn set_owner(&self, chain: &mut Chain, owner: OwnerId) -> Result<(), ChainError>;

    /// Resolve the attachment a chain currently belongs to
    fn owner_of(&self, index: ChainIndex) -> Option<AttachmentId>;
}

/// Hardware forwarding engine the chains are plugged into
pub trait DatapathEngine: Send + Sync {
    /// Start servicing a chain; the role follows the chain's direction
    fn register_queue(&self, chain: ChainId);
}

#[derive(Debug, Default, Clone)]
struct Slot {
    refcount: u32,
    generation: u64,
    direction: Option<ChainDirection>,
    owner: OwnerId,
    attachment: Option<AttachmentId>,
}

/// Pool statistics (atomic, lock-free)
#[derive(Debug, Default)]
struct PoolStats {
    acquired: AtomicU64,
    released: AtomicU64,
    exhausted: AtomicU64,
}

/// Stats snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub size: usize,
    pub in_use: usize,
    pub acquired: u64,
    pub released: u64,
    pub exhausted: u64,
}

/// In-memory chain pool backed by a fixed slot table
#[derive(Debug)]
pub struct MemChainPool {
    /// First index handed out; lower indices are reserved for the host
    first_index: ChainIndex,
    slots: Mutex<Vec<Slot>>,
    registered: Mutex<Vec<(ChainId, QueueRole)>>,
    stats: PoolStats,
}

impl MemChainPool {
    /// Create a pool of `size` chains numbered from `first_index`
    pub fn new(first_index: ChainIndex, size: usize) -> Self {
        Self {
            first_index,
            slots: Mutex::new(vec![Slot::default(); size]),
            registered: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
        }
    }

    fn slot_of(&self, index: ChainIndex) -> Option<usize> {
        index
            .checked_sub(self.first_index)
            .map(|i| i as usize)
            .filter(|i| *i < self.slots.lock().len())
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolSnapshot {
        let slots = self.slots.lock();
        PoolSnapshot {
            size: slots.len(),
            in_use: slots.iter().filter(|s| s.refcount > 0).count(),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Peer session recorded for a chain
    pub fn owner_id(&self, index: ChainIndex) -> Option<OwnerId> {
        let i = self.slot_of(index)?;
        let slots = self.slots.lock();
        (slots[i].refcount > 0).then_some(slots[i].owner)
    }

    /// Queues registered with the engine, in order
    pub fn registered_queues(&self) -> Vec<(ChainId, QueueRole)> {
        self.registered.lock().clone()
    }
}

impl ChainPool for MemChainPool {
    fn acquire(&self, request: ChainRequest) -> Option<Chain> {
        let mut slots = self.slots.lock();
        let Some((i, slot)) = slots.iter_mut().enumerate().find(|(_, s)| s.refcount == 0) else {
            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        slot.refcount = 1;
        slot.generation += 1;
        slot.direction = Some(request.direction);
        slot.owner = LOCAL_OWNER;
        slot.attachment = request.attachment;
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);

        Some(Chain::lease(
            self.first_index + i as ChainIndex,
            slot.generation,
            request.direction,
        ))
    }

    fn release(&self, chain: &Chain) {
        let Some(i) = self.slot_of(chain.index) else {
            return;
        };
        let mut slots = self.slots.lock();
        let slot = &mut slots[i];
        if slot.refcount == 0 || slot.generation != chain.generation {
            return;
        }

        slot.refcount -= 1;
        if slot.refcount == 0 {
            slot.direction = None;
            slot.owner = LOCAL_OWNER;
            slot.attachment = None;
            self.stats.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn set_owner(&self, chain: &mut Chain, owner: OwnerId) -> Result<(), ChainError> {
        let i = self.slot_of(chain.index).ok_or(ChainError::NotLeased(chain.index))?;
        let mut slots = self.slots.lock();
        let slot = &mut slots[i];
        if slot.refcount == 0 || slot.generation != chain.generation {
            return Err(ChainError::NotLeased(chain.index));
        }
        slot.owner = owner;
        chain.owner = owner;
        Ok(())
    }

    fn owner_of(&self, index: ChainIndex) -> Option<AttachmentId> {
        let i = self.slot_of(index)?;
        let slots = self.slots.lock();
        if slots[i].refcount == 0 {
            return None;
        }
        slots[i].attachment
    }
}

impl DatapathEngine for MemChainPool {
    fn register_queue(&self, chain: ChainId) {
        let role = chain.direction.queue_role();
        tracing::debug!(
            chain = chain.index,
            role = ?role,
            "registering chain with datapath engine"
        );
        self.registered.lock().push((chain, role));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(direction: ChainDirection, id: u64) -> ChainRequest {
        ChainRequest {
            direction,
            attachment: Some(AttachmentId(id)),
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let pool = MemChainPool::new(16, 4);

        let tx = pool.acquire(request(ChainDirection::Tx, 1)).unwrap();
        let rx = pool.acquire(request(ChainDirection::Rx, 1)).unwrap();
        assert_eq!(tx.index(), 16);
        assert_eq!(rx.index(), 17);
        assert_eq!(rx.direction(), ChainDirection::Rx);
        assert_eq!(pool.stats().in_use, 2);

        pool.release(&tx);
        pool.release(&rx);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
    }

    #[test]
    fn test_double_release_is_noop() {
        let pool = MemChainPool::new(0, 1);

        let first = pool.acquire(request(ChainDirection::Tx, 1)).unwrap();
        pool.release(&first);
        pool.release(&first);
        assert_eq!(pool.stats().released, 1);

        // Stale lease must not free the slot's next holder
        let second = pool.acquire(request(ChainDirection::Rx, 2)).unwrap();
        assert_eq!(second.index(), first.index());
        pool.release(&first);
        assert_eq!(pool.owner_of(second.index()), Some(AttachmentId(2)));
        assert_eq!(pool.stats().in_use, 1);
    }

    #[test]
    fn test_exhaustion() {
        let pool = MemChainPool::new(0, 2);

        let _a = pool.acquire(request(ChainDirection::Tx, 1)).unwrap();
        let _b = pool.acquire(request(ChainDirection::Rx, 1)).unwrap();
        assert!(pool.acquire(request(ChainDirection::Tx, 2)).is_none());
        assert_eq!(pool.stats().exhausted, 1);
    }

    #[test]
    fn test_owner_tagging() {
        let pool = MemChainPool::new(0, 2);

        let mut tx = pool.acquire(request(ChainDirection::Tx, 7)).unwrap();
        pool.set_owner(&mut tx, 5).unwrap();
        assert_eq!(tx.owner(), 5);
        assert_eq!(pool.owner_id(tx.index()), Some(5));
        assert_eq!(pool.owner_of(tx.index()), Some(AttachmentId(7)));

        pool.release(&tx);
        assert_eq!(pool.owner_of(tx.index()), None);
        assert_eq!(
            pool.set_owner(&mut tx, 6),
            Err(ChainError::NotLeased(tx.index()))
        );
    }

    #[test]
    fn test_queue_role_follows_direction() {
        let pool = MemChainPool::new(0, 2);
        let tx = pool.acquire(request(ChainDirection::Tx, 1)).unwrap();
        let rx = pool.acquire(request(ChainDirection::Rx, 1)).unwrap();

        pool.register_queue(rx.id());
        pool.register_queue(tx.id());

        assert_eq!(
            pool.registered_queues(),
            vec![(rx.id(), QueueRole::Receive), (tx.id(), QueueRole::Transmit)]
        );
    }
}
