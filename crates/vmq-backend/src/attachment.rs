//! Backend Attachment
//!
//! Per-device context: owns the tx/rx chain pair, the local interface, the
//! bound notification handlers and the negotiated state.
//!
//! Every resource is released by [`Attachment::remove`], which is also the
//! rollback path of a failed [`Attachment::attach`].

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::chain::{
    AttachmentId, Chain, ChainDirection, ChainError, ChainIndex, ChainPool, ChainRequest,
    DatapathEngine, OwnerId, LOCAL_OWNER,
};
use crate::config::BackendConfig;
use crate::evtchn::{EventChannel, EventError, IrqId};
use crate::irq::{Doorbell, PeerPorts, RxNotify, TxNotify};
use crate::netdev::{NetDevError, NetDevice, NetDeviceRegistrar, NetDeviceSpec};
use crate::state::{BusState, Transitions};
use crate::store::{keys, DeviceNode, StoreClient, StoreError, TransactionStats};

/// Attach, connect and negotiation errors
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("control store: {0}")]
    Store(#[from] StoreError),

    #[error("no free {0} chain in pool")]
    ChainExhausted(ChainDirection),

    #[error("chain pool: {0}")]
    Chain(#[from] ChainError),

    #[error("notification channel: {0}")]
    Event(#[from] EventError),

    #[error("net device: {0}")]
    NetDev(#[from] NetDevError),

    #[error("interface index {if_num} exceeds {max} guest slots")]
    IfNumOutOfRange { if_num: u32, max: u32 },

    #[error("attachment holds no registered device")]
    NoDevice,

    #[error("attachment holds no {0} chain")]
    MissingChain(ChainDirection),

    #[error("protocol violation: no transition from {current} toward {desired}")]
    Protocol { current: BusState, desired: BusState },

    #[error("owner {osid} interface {if_num} already attached as {existing}")]
    Duplicate {
        osid: OwnerId,
        if_num: u32,
        existing: AttachmentId,
    },
}

/// Shared hardware and bus context every attachment works against
pub struct BackendContext {
    pub store: StoreClient,
    pub pool: Arc<dyn ChainPool>,
    pub engine: Arc<dyn DatapathEngine>,
    pub events: Arc<dyn EventChannel>,
    pub registrar: Arc<dyn NetDeviceRegistrar>,
    pub config: BackendConfig,
    /// (owner id, interface index) pairs currently attached
    claims: DashMap<(OwnerId, u32), AttachmentId>,
}

impl BackendContext {
    pub fn new(
        store: StoreClient,
        pool: Arc<dyn ChainPool>,
        engine: Arc<dyn DatapathEngine>,
        events: Arc<dyn EventChannel>,
        registrar: Arc<dyn NetDeviceRegistrar>,
        config: BackendConfig,
    ) -> Self {
        Self {
            store,
            pool,
            engine,
            events,
            registrar,
            config,
            claims: DashMap::new(),
        }
    }

    fn claim(&self, osid: OwnerId, if_num: u32, id: AttachmentId) -> Result<(), AttachError> {
        match self.claims.entry((osid, if_num)) {
            Entry::Occupied(e) if *e.get() != id => Err(AttachError::Duplicate {
                osid,
                if_num,
                existing: *e.get(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(v) => {
                v.insert(id);
                Ok(())
            }
        }
    }

    fn unclaim(&self, osid: OwnerId, if_num: u32, id: AttachmentId) {
        self.claims.remove_if(&(osid, if_num), |_, owner| *owner == id);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BoundIrqs {
    tx: IrqId,
    rx: IrqId,
}

/// Read-only view of an attachment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub id: AttachmentId,
    pub device: String,
    pub name: String,
    pub osid: OwnerId,
    pub if_num: u32,
    pub state: BusState,
    pub peer_state: BusState,
    pub interface: Option<String>,
    pub tx_chain: Option<ChainIndex>,
    pub rx_chain: Option<ChainIndex>,
    pub remote_chain: Option<ChainIndex>,
    pub tx_irq: Option<IrqId>,
    pub rx_irq: Option<IrqId>,
    pub publish: TransactionStats,
}

/// Per-device backend context
pub struct Attachment {
    id: AttachmentId,
    name: String,
    device: DeviceNode,
    ctx: Arc<BackendContext>,
    osid: OwnerId,
    if_num: u32,
    claimed: bool,
    state: BusState,
    peer_state: BusState,
    tx_chain: Option<Chain>,
    rx_chain: Option<Chain>,
    irqs: Option<BoundIrqs>,
    netdev: Option<NetDevice>,
    remote_chain: Option<ChainIndex>,
    doorbell: Arc<Doorbell>,
    publish: TransactionStats,
}

impl Attachment {
    fn new(ctx: Arc<BackendContext>, device: DeviceNode, id: AttachmentId) -> Self {
        Self {
            id,
            name: device.nodename.clone(),
            doorbell: Arc::new(Doorbell::new(ctx.events.clone())),
            device,
            ctx,
            osid: LOCAL_OWNER,
            if_num: 0,
            claimed: false,
            state: BusState::Closed,
            peer_state: BusState::Unknown,
            tx_chain: None,
            rx_chain: None,
            irqs: None,
            netdev: None,
            remote_chain: None,
            publish: TransactionStats::default(),
        }
    }

    /// Bring up the backend side of a newly announced device.
    ///
    /// On error everything acquired here has already been released.
    pub async fn attach(
        ctx: Arc<BackendContext>,
        device: DeviceNode,
        id: AttachmentId,
    ) -> Result<Self, AttachError> {
        let mut attachment = Self::new(ctx, device, id);

        match attachment.setup().await {
            Ok(()) => {
                tracing::info!(
                    device = %attachment.device.nodename,
                    osid = attachment.osid,
                    if_num = attachment.if_num,
                    "attachment ready"
                );
                Ok(attachment)
            }
            Err(e) => {
                tracing::error!(
                    device = %attachment.device.nodename,
                    error = %e,
                    "attach failed, rolling back"
                );
                attachment.remove().await;
                Err(e)
            }
        }
    }

    async fn setup(&mut self) -> Result<(), AttachError> {
        let ctx = self.ctx.clone();

        self.tx_chain = Some(self.acquire_chain(ChainDirection::Tx)?);
        self.rx_chain = Some(self.acquire_chain(ChainDirection::Rx)?);

        let otherend = &self.device.otherend;
        let osid = ctx.store.read_unsigned(otherend, keys::OSID).await?;
        let if_num = ctx.store.read_unsigned(otherend, keys::IF_NUM).await?;
        let max = ctx.config.guest_slots();
        if if_num >= max {
            return Err(AttachError::IfNumOutOfRange { if_num, max });
        }

        self.osid = osid;
        self.if_num = if_num;
        self.name = ctx.config.handler_name(osid);
        ctx.claim(osid, if_num, self.id)?;
        self.claimed = true;
        for chain in [self.tx_chain.as_mut(), self.rx_chain.as_mut()]
            .into_iter()
            .flatten()
        {
            ctx.pool.set_owner(chain, osid)?;
        }

        let netdev = ctx
            .registrar
            .register(&NetDeviceSpec {
                name: ctx.config.interface_name(if_num),
                slot: ctx.config.base_index + if_num,
                rx_csum: ctx.config.rx_csum,
            })
            .await?;
        let remote_chain = netdev.rx_chain;
        self.netdev = Some(netdev);

        let tx_index = self.chain_index(ChainDirection::Tx)?;
        let rx_index = self.chain_index(ChainDirection::Rx)?;
        self.publish = ctx
            .store
            .publish_atomic(
                &self.device.nodename,
                &[
                    (keys::TX_CHAIN_ID, tx_index.to_string()),
                    (keys::RX_CHAIN_ID, rx_index.to_string()),
                    (keys::REMOTE_CHAIN_ID, remote_chain.to_string()),
                ],
            )
            .await?;

        self.switch_state(BusState::InitWait).await
    }

    fn acquire_chain(&self, direction: ChainDirection) -> Result<Chain, AttachError> {
        self.ctx
            .pool
            .acquire(ChainRequest {
                direction,
                attachment: Some(self.id),
            })
            .ok_or(AttachError::ChainExhausted(direction))
    }

    fn chain_index(&self, direction: ChainDirection) -> Result<ChainIndex, AttachError> {
        let chain = match direction {
            ChainDirection::Tx => self.tx_chain.as_ref(),
            ChainDirection::Rx => self.rx_chain.as_ref(),
        };
        chain
            .map(|c| c.index())
            .ok_or(AttachError::MissingChain(direction))
    }

    /// Bind the peer's notification ports and plug the chains into the
    /// datapath. Leaves nothing bound on failure.
    async fn connect_peer(&mut self) -> Result<(), AttachError> {
        let ctx = self.ctx.clone();
        debug_assert!(self.irqs.is_none(), "connect while handlers are bound");

        let ports = ctx
            .store
            .gather(&self.device.otherend, &[keys::TX_EVTCHN, keys::RX_EVTCHN])
            .await?;
        let ports = PeerPorts {
            tx: ports[0],
            rx: ports[1],
        };

        let device = self.netdev.as_ref().ok_or(AttachError::NoDevice)?.handle;
        let tx_chain = self
            .tx_chain
            .as_ref()
            .ok_or(AttachError::MissingChain(ChainDirection::Tx))?
            .id();
        let rx_chain = self
            .rx_chain
            .as_ref()
            .ok_or(AttachError::MissingChain(ChainDirection::Rx))?
            .id();

        let peer = self.device.otherend_id;
        let tx_handler = Arc::new(TxNotify::new(
            ctx.events.clone(),
            ctx.registrar.clone(),
            device,
            tx_chain,
        ));
        let tx_irq = ctx
            .events
            .bind(peer, ports.tx, &self.name, tx_handler)
            .map_err(|e| {
                tracing::error!(device = %self.device.nodename, error = %e, "failed to bind tx port");
                e
            })?;

        let rx_handler = Arc::new(RxNotify::new(
            ctx.events.clone(),
            ctx.registrar.clone(),
            device,
        ));
        let rx_irq = match ctx.events.bind(peer, ports.rx, &self.name, rx_handler) {
            Ok(irq) => irq,
            Err(e) => {
                tracing::error!(device = %self.device.nodename, error = %e, "failed to bind rx port");
                ctx.events.unbind(tx_irq);
                return Err(e.into());
            }
        };

        ctx.engine.register_queue(tx_chain);
        ctx.engine.register_queue(rx_chain);

        // Prime the peer's consumers once, whether or not data is pending
        ctx.events.signal(ports.tx);
        ctx.events.signal(ports.rx);

        self.remote_chain = Some(rx_chain.index);
        self.irqs = Some(BoundIrqs {
            tx: tx_irq,
            rx: rx_irq,
        });
        self.doorbell.arm(ports);

        tracing::info!(
            device = %self.device.nodename,
            tx_port = ports.tx,
            rx_port = ports.rx,
            tx_irq = %tx_irq,
            rx_irq = %rx_irq,
            "peer connected"
        );
        Ok(())
    }

    /// Unbind both handlers if bound. Idempotent.
    fn release_irqs(&mut self) {
        self.doorbell.disarm();
        if let Some(irqs) = self.irqs.take() {
            self.ctx.events.unbind(irqs.rx);
            self.ctx.events.unbind(irqs.tx);
            tracing::info!(device = %self.device.nodename, "peer disconnected");
        }
    }

    /// Full teardown. Safe on partially built or already removed
    /// attachments.
    pub async fn remove(&mut self) {
        if let Some(netdev) = self.netdev.take() {
            self.release_irqs();
            self.ctx.registrar.unregister(netdev.handle).await;
        }

        if let Some(rx) = self.rx_chain.take() {
            self.ctx.pool.release(&rx);
        }
        if let Some(tx) = self.tx_chain.take() {
            self.ctx.pool.release(&tx);
        }
        self.remote_chain = None;

        if std::mem::take(&mut self.claimed) {
            self.ctx.unclaim(self.osid, self.if_num, self.id);
        }

        tracing::debug!(device = %self.device.nodename, "attachment resources released");
    }

    /// Answer a peer reconfigure request without changing local state
    pub async fn acknowledge_reconfigure(&self) -> Result<(), AttachError> {
        self.ctx
            .store
            .switch_state(&self.device.nodename, BusState::Reconfigured)
            .await?;
        Ok(())
    }

    pub fn id(&self) -> AttachmentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &DeviceNode {
        &self.device
    }

    pub fn osid(&self) -> OwnerId {
        self.osid
    }

    pub fn if_num(&self) -> u32 {
        self.if_num
    }

    pub fn peer_state(&self) -> BusState {
        self.peer_state
    }

    pub fn set_peer_state(&mut self, state: BusState) {
        self.peer_state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.irqs.is_some()
    }

    pub fn netdev(&self) -> Option<&NetDevice> {
        self.netdev.as_ref()
    }

    pub fn remote_chain(&self) -> Option<ChainIndex> {
        self.remote_chain
    }

    /// Doorbell used by data-ready notifications
    pub fn doorbell(&self) -> Arc<Doorbell> {
        self.doorbell.clone()
    }

    pub fn info(&self) -> AttachmentInfo {
        AttachmentInfo {
            id: self.id,
            device: self.device.nodename.clone(),
            name: self.name.clone(),
            osid: self.osid,
            if_num: self.if_num,
            state: self.state,
            peer_state: self.peer_state,
            interface: self.netdev.as_ref().map(|d| d.name.clone()),
            tx_chain: self.tx_chain.as_ref().map(Chain::index),
            rx_chain: self.rx_chain.as_ref().map(Chain::index),
            remote_chain: self.remote_chain,
            tx_irq: self.irqs.map(|i| i.tx),
            rx_irq: self.irqs.map(|i| i.rx),
            publish: self.publish,
        }
    }
}

#[async_trait]
impl Transitions for Attachment {
    fn state(&self) -> BusState {
        self.state
    }

    async fn switch_state(&mut self, next: BusState) -> Result<(), AttachError> {
        if self.state == next {
            return Ok(());
        }
        self.ctx
            .store
            .switch_state(&self.device.nodename, next)
            .await?;
        self.state = next;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), AttachError> {
        self.connect_peer().await
    }

    async fn disconnect(&mut self) {
        self.release_irqs();
    }
}
