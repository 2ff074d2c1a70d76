//! Bus State Machine
//!
//! Transition table and driver loop that move an attachment toward the
//! state requested by the peer, one edge at a time.
//!
//! ```text
//!   Closed ──► InitWait ──► Connected ──► Closing ──► Closed
//!     │           │  (Connect)       (Disconnect)  ▲
//!     │           └──────────────────► Closing ────┘
//!     └──────────────────────────────► Closing
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::attachment::AttachError;

/// Negotiation states shared with the peer through the control store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusState {
    Unknown,
    Initialising,
    InitWait,
    Initialised,
    Connected,
    Closing,
    Closed,
    Reconfiguring,
    Reconfigured,
}

impl BusState {
    /// Every state, in protocol order
    pub const ALL: [BusState; 9] = [
        BusState::Unknown,
        BusState::Initialising,
        BusState::InitWait,
        BusState::Initialised,
        BusState::Connected,
        BusState::Closing,
        BusState::Closed,
        BusState::Reconfiguring,
        BusState::Reconfigured,
    ];

    /// Token written to the control store
    pub fn token(&self) -> &'static str {
        match self {
            BusState::Unknown => "Unknown",
            BusState::Initialising => "Initialising",
            BusState::InitWait => "InitWait",
            BusState::Initialised => "Initialised",
            BusState::Connected => "Connected",
            BusState::Closing => "Closing",
            BusState::Closed => "Closed",
            BusState::Reconfiguring => "Reconfiguring",
            BusState::Reconfigured => "Reconfigured",
        }
    }

    /// Parse a peer token, mapping anything unrecognized to `Unknown`
    pub fn from_peer_token(token: &str) -> Self {
        token.trim().parse().unwrap_or(BusState::Unknown)
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized bus state token: {0:?}")]
pub struct StateParseError(pub String);

impl FromStr for BusState {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BusState::ALL
            .iter()
            .copied()
            .find(|state| state.token() == s)
            .ok_or_else(|| StateParseError(s.to_string()))
    }
}

/// Side effect attached to an edge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    Connect,
    Disconnect,
}

/// A single allowed hop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    pub action: Action,
    pub next: BusState,
}

impl Edge {
    const fn to(next: BusState) -> Self {
        Self { action: Action::None, next }
    }

    const fn with(action: Action, next: BusState) -> Self {
        Self { action, next }
    }
}

/// Look up the edge taken from `current` while heading for `desired`.
///
/// Returns `None` for pairs the protocol does not allow.
pub fn edge(current: BusState, desired: BusState) -> Option<Edge> {
    use BusState::*;

    match current {
        Closed => match desired {
            InitWait | Connected => Some(Edge::to(InitWait)),
            Closing => Some(Edge::to(Closing)),
            _ => None,
        },
        InitWait | Initialised => match desired {
            Connected => Some(Edge::with(Action::Connect, Connected)),
            Closing | Closed => Some(Edge::to(Closing)),
            _ => None,
        },
        Connected => match desired {
            InitWait | Closing | Closed => Some(Edge::with(Action::Disconnect, Closing)),
            _ => None,
        },
        Closing => match desired {
            InitWait | Connected | Closed => Some(Edge::to(Closed)),
            _ => None,
        },
        Unknown | Initialising | Reconfiguring | Reconfigured => None,
    }
}

/// What the backend does in response to a peer state change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Drive the local state toward the target
    Drive(BusState),
    /// Drive to `Closed`, then tear the device down completely
    CloseAndUnregister,
    /// Publish `Reconfigured` and leave the attachment untouched
    AcknowledgeReconfigure,
    /// The peer published a state it must never publish
    Reject,
}

/// Map a peer state onto a backend directive.
///
/// `online` reflects the local policy flag that keeps a device registered
/// across a peer close.
pub fn peer_directive(peer: BusState, online: bool) -> Directive {
    match peer {
        BusState::Initialising => Directive::Drive(BusState::InitWait),
        BusState::Initialised | BusState::Connected => Directive::Drive(BusState::Connected),
        BusState::Reconfiguring => Directive::AcknowledgeReconfigure,
        BusState::Closing => Directive::Drive(BusState::Closing),
        BusState::Closed if online => Directive::Drive(BusState::Closed),
        BusState::Closed | BusState::Unknown => Directive::CloseAndUnregister,
        BusState::InitWait | BusState::Reconfigured => Directive::Reject,
    }
}

/// Operations the driver loop needs from whatever it is driving
#[async_trait]
pub trait Transitions: Send {
    /// Current local state
    fn state(&self) -> BusState;

    /// Publish and adopt a new local state
    async fn switch_state(&mut self, next: BusState) -> Result<(), AttachError>;

    /// Run the connect negotiation
    async fn connect(&mut self) -> Result<(), AttachError>;

    /// Tear down the connection; never fails
    async fn disconnect(&mut self);
}

/// Apply edges until the local state equals `desired`.
///
/// Stops without touching state when no edge applies, or when Connect
/// fails. A connection whose state publish fails is torn down again.
/// Each hop applies exactly one edge.
pub async fn drive<T>(target: &mut T, desired: BusState) -> Result<BusState, AttachError>
where
    T: Transitions + ?Sized,
{
    while target.state() != desired {
        let current = target.state();
        let Some(hop) = edge(current, desired) else {
            tracing::error!(
                current = %current,
                desired = %desired,
                "no transition for requested state"
            );
            return Err(AttachError::Protocol { current, desired });
        };

        match hop.action {
            Action::None => {}
            Action::Connect => target.connect().await?,
            Action::Disconnect => target.disconnect().await,
        }

        tracing::debug!(from = %current, to = %hop.next, "bus state hop");
        if let Err(e) = target.switch_state(hop.next).await {
            // Handlers only stay bound once Connected is published
            if hop.action == Action::Connect {
                target.disconnect().await;
            }
            return Err(e);
        }
    }

    Ok(target.state())
}
