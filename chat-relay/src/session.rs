use std::{fmt, net::SocketAddr};

use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::WireFrame;

/// Registry key for a connection. Allocated in accept order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Regular,
    Admin,
}

/// Server-side lifecycle. `Connecting -> Active` happens once, on the first
/// accepted name; `Closing -> Closed` can be entered from either and never
/// goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Heartbeat bookkeeping for transports without half-open detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The transport detects dead peers itself; never probed.
    Untracked,
    /// The peer answered the last probe (or has not been probed yet).
    Confirmed,
    /// A probe is outstanding.
    Unconfirmed,
}

/// Per-connection state owned by the [`Registry`](crate::registry::Registry).
///
/// Outbound frames go to the connection's writer task, which owns the
/// ordered queue and applies backpressure; handing a frame over never blocks.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    display_name: Option<String>,
    role: Role,
    state: ConnectionState,
    liveness: Liveness,
    outbox: mpsc::UnboundedSender<WireFrame>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: Option<SocketAddr>,
        outbox: mpsc::UnboundedSender<WireFrame>,
        probe: bool,
    ) -> Self {
        Self {
            id,
            peer,
            display_name: None,
            role: Role::Regular,
            state: ConnectionState::Connecting,
            liveness: if probe {
                Liveness::Confirmed
            } else {
                Liveness::Untracked
            },
            outbox,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Queues a frame for the writer task. A writer that already went away
    /// means the connection is being torn down; the frame is dropped.
    pub fn push(&self, frame: WireFrame) {
        if self.outbox.send(frame).is_err() {
            debug!(session = %self.id, "writer gone, dropping frame");
        }
    }

    /// Asks the writer to close after everything queued so far is flushed.
    pub fn close(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        self.state = ConnectionState::Closing;
        self.push(WireFrame::Close);
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.display_name = Some(name);
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Active;
        }
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Marks an outstanding probe and sends it. Returns false for untracked
    /// sessions.
    pub(crate) fn probe(&mut self) -> bool {
        if self.liveness == Liveness::Untracked {
            return false;
        }
        self.liveness = Liveness::Unconfirmed;
        self.push(WireFrame::Ping);
        true
    }

    pub(crate) fn confirm(&mut self) {
        if self.liveness == Liveness::Unconfirmed {
            self.liveness = Liveness::Confirmed;
        }
    }
}
