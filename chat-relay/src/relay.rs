//! The relay task: single owner of the session registry.
//!
//! Connection tasks never touch shared state. They report what happens on
//! their socket as [`Event`]s over one bounded channel, and the relay handles
//! those events one at a time. Because of that the registry needs no lock:
//! name checks, kicks and evictions can never interleave with another
//! session's message.
//!
//! Outbound frames are pushed onto each session's unbounded writer channel,
//! so handling an event never waits on a peer.

use std::{future::Future, net::SocketAddr};

use tokio::{select, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    liveness::LivenessMonitor,
    message::{ClientMessage, DecodeError, ServerMessage, encode},
    registry::Registry,
    router::{Action, Router, WELCOME},
    session::{Session, SessionId},
    transport::WireFrame,
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug)]
pub enum Event {
    Connected {
        id: SessionId,
        peer: Option<SocketAddr>,
        outbox: mpsc::UnboundedSender<WireFrame>,
        probe: bool,
    },
    Received {
        id: SessionId,
        message: ClientMessage,
    },
    Malformed {
        id: SessionId,
        error: DecodeError,
    },
    Pong {
        id: SessionId,
    },
    Disconnected {
        id: SessionId,
    },
}

pub struct Relay {
    registry: Registry,
    router: Router,
    monitor: LivenessMonitor,
    events: mpsc::Receiver<Event>,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> (Self, mpsc::Sender<Event>) {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let relay = Self {
            registry: Registry::new(),
            router: Router::new(config.admin_policy),
            monitor: LivenessMonitor::new(config.heartbeat_interval),
            events,
        };
        (relay, tx)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handles events until `shutdown` resolves or every sender is gone.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut heartbeat = self.monitor.ticker();
        info!(policy = ?self.router.admin_policy(), "relay started");

        loop {
            select! {
                _ = &mut shutdown => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = heartbeat.tick() => self.heartbeat(),
            }
        }

        self.shutdown();
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected {
                id,
                peer,
                outbox,
                probe,
            } => {
                info!(session = %id, ?peer, "client connected");
                self.registry.register(Session::new(id, peer, outbox, probe));
                self.deliver(id, &ServerMessage::info(WELCOME));
            }
            Event::Received { id, message } => {
                debug!(session = %id, kind = message.kind(), "message received");
                let actions = self.router.handle(&mut self.registry, id, message);
                self.apply(actions);
            }
            Event::Malformed { id, error } => {
                warn!(session = %id, %error, "discarding malformed frame");
            }
            Event::Pong { id } => self.monitor.acknowledge(&mut self.registry, id),
            Event::Disconnected { id } => self.close(id, "disconnected"),
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, message } => self.deliver(to, &message),
                Action::Close { target } => self.close(target, "kicked"),
            }
        }
    }

    fn deliver(&self, to: SessionId, message: &ServerMessage) {
        let Some(session) = self.registry.get(to) else {
            debug!(session = %to, "recipient left before delivery");
            return;
        };
        match encode(message) {
            Ok(text) => session.push(WireFrame::Text(text)),
            Err(err) => warn!(session = %to, error = ?err, "failed to encode message"),
        }
    }

    fn close(&mut self, id: SessionId, reason: &str) {
        if let Some(session) = self.registry.get_mut(id) {
            session.close();
        }
        if let Some(session) = self.registry.remove(id) {
            info!(session = %id, name = ?session.display_name(), reason, "session closed");
        }
    }

    fn heartbeat(&mut self) {
        for session in self.monitor.sweep(&mut self.registry) {
            warn!(
                session = %session.id(),
                name = ?session.display_name(),
                "evicting unresponsive session"
            );
        }
    }

    fn shutdown(&mut self) {
        info!(sessions = self.registry.len(), "relay shutting down");
        let ids: Vec<SessionId> = self.registry.all().map(Session::id).collect();
        for id in ids {
            self.deliver(id, &ServerMessage::info("server shutting down"));
            self.close(id, "shutdown");
        }
    }
}
