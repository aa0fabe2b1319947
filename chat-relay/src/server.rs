use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, oneshot},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::{RelayConfig, TransportKind},
    flow::run_outbox,
    message::ClientMessage,
    relay::{Event, Relay},
    session::SessionId,
    transport::{self, FrameWriter, Inbound, InboundStream},
};

pub struct Server {
    listener: TcpListener,
    transport: TransportKind,
    config: RelayConfig,
}

impl Server {
    pub fn new(listener: TcpListener, transport: TransportKind, config: RelayConfig) -> Self {
        Self {
            listener,
            transport,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            transport: kind,
            config,
        } = self;
        tokio::pin!(shutdown);

        let (relay, events) = Relay::new(&config);
        let (stop_relay, relay_stopped) = oneshot::channel::<()>();
        let relay_task = tokio::spawn(relay.run_until(async move {
            let _ = relay_stopped.await;
        }));

        let mut connections = JoinSet::new();
        let mut next_id = 1;
        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    let id = SessionId(next_id);
                    next_id += 1;
                    handle_accept_result(
                        accept_result,
                        id,
                        kind,
                        &events,
                        &mut connections,
                        config.close_grace,
                    );
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    log_connection_exit(finished);
                }
            }
        }
        drop(listener);

        let _ = stop_relay.send(());
        relay_task.await.context("relay task panicked")?;

        // Every session now has its farewell and a Close queued; give the
        // writers `close_grace` to flush before their tasks are dropped.
        drop(events);
        let pending = connections.len();
        let flushed = timeout(config.close_grace, async {
            while let Some(finished) = connections.join_next().await {
                log_connection_exit(finished);
            }
        })
        .await;
        if flushed.is_err() {
            warn!(
                remaining = connections.len(),
                pending,
                grace = ?config.close_grace,
                "dropping connections that did not close in time"
            );
            connections.shutdown().await;
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    id: SessionId,
    kind: TransportKind,
    events: &mpsc::Sender<Event>,
    connections: &mut JoinSet<()>,
    close_grace: Duration,
) {
    match result {
        Ok((stream, peer)) => {
            spawn_connection(stream, peer, id, kind, events, connections, close_grace)
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn log_connection_exit(finished: Result<(), tokio::task::JoinError>) {
    if let Err(err) = finished {
        if err.is_panic() {
            warn!(error = ?err, "connection task panicked");
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    kind: TransportKind,
    events: &mpsc::Sender<Event>,
    connections: &mut JoinSet<()>,
    close_grace: Duration,
) {
    let events = events.clone();
    connections.spawn(async move {
        let connection = Connection {
            id,
            peer,
            events,
            close_grace,
            probe: kind.needs_liveness_probe(),
        };
        let result = match kind {
            TransportKind::Lines => {
                let (writer, inbound) = transport::lines(stream);
                connection.serve(writer, inbound).await
            }
            TransportKind::WebSocket => match transport::accept_websocket(stream).await {
                Ok((writer, inbound)) => connection.serve(writer, inbound).await,
                Err(err) => Err(err),
            },
        };
        if let Err(err) = result {
            warn!(peer = %peer, session = %id, error = ?err, "client connection closed with error");
        }
    });
}

struct Connection {
    id: SessionId,
    peer: SocketAddr,
    events: mpsc::Sender<Event>,
    close_grace: Duration,
    probe: bool,
}

impl Connection {
    /// Forwards everything read from the peer to the relay while a writer task
    /// delivers what the relay queues. Ends when either side finishes.
    async fn serve<W>(self, writer: W, mut inbound: InboundStream<ClientMessage>) -> Result<()>
    where
        W: FrameWriter,
    {
        let Connection {
            id,
            peer,
            events,
            close_grace,
            probe,
        } = self;

        let (outbox, frames) = mpsc::unbounded_channel();
        events
            .send(Event::Connected {
                id,
                peer: Some(peer),
                outbox,
                probe,
            })
            .await
            .context("relay is not running")?;

        let mut writer_task = tokio::spawn(run_outbox(writer, frames, close_grace));
        let mut writer_done = false;

        let outcome = loop {
            select! {
                item = inbound.next() => {
                    let event = match item {
                        Some(Ok(Inbound::Message(message))) => Event::Received { id, message },
                        Some(Ok(Inbound::Malformed(error))) => Event::Malformed { id, error },
                        Some(Ok(Inbound::Pong)) => Event::Pong { id },
                        Some(Err(err)) => {
                            break Err(anyhow::Error::from(err).context("failed to read from client"));
                        }
                        None => break Ok(()),
                    };
                    if events.send(event).await.is_err() {
                        break Ok(());
                    }
                }
                written = &mut writer_task, if !writer_done => {
                    writer_done = true;
                    match written {
                        Ok(Ok(())) => debug!(session = %id, "connection closed by relay"),
                        Ok(Err(err)) => {
                            break Err(anyhow::Error::from(err).context("failed to write to client"));
                        }
                        Err(err) => {
                            break Err(anyhow::Error::from(err).context("writer task failed"));
                        }
                    }
                    break Ok(());
                }
            }
        };

        let _ = events.send(Event::Disconnected { id }).await;

        // The relay dropped the session above, which lets the writer flush
        // and close on its own.
        if !writer_done {
            match writer_task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(session = %id, error = ?err, "writer ended with error"),
                Err(err) => debug!(session = %id, error = ?err, "writer task failed"),
            }
        }

        outcome
    }
}
