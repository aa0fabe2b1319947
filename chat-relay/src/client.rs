use std::{io, time::Duration};

use anyhow::Result;
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    config::{DEFAULT_CLOSE_GRACE, TransportKind},
    flow::{Delivery, Outbox},
    input::Command,
    message::{ClientMessage, ServerMessage, encode},
    transport::{self, FrameWriter, Inbound, InboundStream, WireFrame},
};

/// Client-side view of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, waiting for the relay to accept a username.
    Initializing,
    Chatting,
    /// A write is waiting for the transport to drain; input is refused.
    Paused,
    Exiting,
}

/// A line for the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Line(String),
    Error(String),
}

const PLEASE_WAIT: &str = "*** please wait...";
const ENTER_USERNAME: &str = "*** enter a username";

pub struct ChatClient<W> {
    outbox: Outbox<W>,
    state: ClientState,
    resume_to: ClientState,
    username: Option<String>,
}

impl<W> ChatClient<W>
where
    W: FrameWriter,
{
    pub fn new(writer: W) -> Self {
        Self {
            outbox: Outbox::new(writer),
            state: ClientState::Initializing,
            resume_to: ClientState::Initializing,
            username: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_paused(&self) -> bool {
        self.outbox.is_paused()
    }

    /// Handles one line typed by the user.
    pub async fn handle_input(&mut self, line: &str) -> io::Result<Vec<Output>> {
        if line.trim().is_empty() {
            return Ok(Vec::new());
        }

        let command = Command::parse(line);
        if command == Ok(Command::Exit) {
            self.state = ClientState::Exiting;
            return Ok(vec![Output::Line("*** leaving chat".into())]);
        }

        match self.state {
            ClientState::Paused => Ok(vec![Output::Line(PLEASE_WAIT.into())]),
            ClientState::Exiting => Ok(Vec::new()),
            // Until a name is accepted, whatever is typed is the name.
            ClientState::Initializing => {
                self.submit(ClientMessage::ChangeUsername {
                    data: line.to_string(),
                })
                .await
            }
            ClientState::Chatting => match command {
                Ok(command) => match command.into_message(self.username.as_deref()) {
                    Some(message) => self.submit(message).await,
                    None => Ok(Vec::new()),
                },
                Err(err) => Ok(vec![Output::Error(format!("!!! {err}"))]),
            },
        }
    }

    /// Sends a message, pausing input if the transport is saturated.
    pub async fn submit(&mut self, message: ClientMessage) -> io::Result<Vec<Output>> {
        let text = encode(&message).map_err(io::Error::other)?;
        match self.outbox.send(WireFrame::Text(text)).await? {
            Delivery::Deferred if self.state != ClientState::Paused => {
                self.resume_to = self.state;
                self.state = ClientState::Paused;
                Ok(vec![Output::Line(PLEASE_WAIT.into())])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Waits for pending writes to drain, then resumes input.
    pub async fn drained(&mut self) -> io::Result<()> {
        self.outbox.drained().await?;
        if !self.outbox.is_paused() && self.state == ClientState::Paused {
            self.state = self.resume_to;
        }
        Ok(())
    }

    pub fn handle_server_message(&mut self, message: ServerMessage) -> Vec<Output> {
        match message {
            ServerMessage::Message { data, sender } => {
                vec![Output::Line(format!("{}: {data}", display_sender(sender)))]
            }
            ServerMessage::PrivateMessage { data, sender } => {
                vec![Output::Line(format!(
                    "{} (private): {data}",
                    display_sender(sender)
                ))]
            }
            ServerMessage::UsernameChanged { data } => {
                self.accept_username();
                let line = format!("*** your username is {data}");
                self.username = Some(data);
                vec![Output::Line(line)]
            }
            ServerMessage::UsernameRejected { data } => {
                let mut output = vec![Output::Error(format!("!!! {data}"))];
                if self.awaiting_username() {
                    output.push(Output::Line(ENTER_USERNAME.into()));
                }
                output
            }
            ServerMessage::Info { data } => vec![Output::Line(format!("*** {data}"))],
            ServerMessage::Unknown => {
                vec![Output::Error("!!! unknown message type from server".into())]
            }
        }
    }

    fn awaiting_username(&self) -> bool {
        self.state == ClientState::Initializing
            || (self.state == ClientState::Paused && self.resume_to == ClientState::Initializing)
    }

    fn accept_username(&mut self) {
        match self.state {
            ClientState::Initializing => self.state = ClientState::Chatting,
            ClientState::Paused if self.resume_to == ClientState::Initializing => {
                self.resume_to = ClientState::Chatting;
            }
            _ => {}
        }
    }

    /// Closes the connection, giving queued writes a bounded time to drain.
    pub async fn close(mut self, grace: Duration) {
        let closing = async {
            self.outbox.send(WireFrame::Close).await?;
            while self.outbox.is_paused() {
                self.outbox.drained().await?;
            }
            io::Result::Ok(())
        };
        match timeout(grace, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(?error, "failed to close connection cleanly"),
            Err(_) => warn!("connection did not close within {grace:?}"),
        }
    }
}

fn display_sender(sender: Option<String>) -> String {
    sender.unwrap_or_else(|| "(unnamed)".to_string())
}

pub async fn run(args: ClientArgs) -> Result<()> {
    info!("connecting to {} over {:?}", args.server, args.transport);
    let limit = Duration::from_secs(args.connect_timeout_secs);
    match args.transport {
        TransportKind::Lines => {
            let (writer, inbound) = transport::connect_lines(args.server, limit).await?;
            run_session(writer, inbound, args.username).await
        }
        TransportKind::WebSocket => {
            let (writer, inbound) = transport::connect_websocket(args.server, limit).await?;
            run_session(writer, inbound, args.username).await
        }
    }
}

async fn run_session<W>(
    writer: W,
    mut inbound: InboundStream<ServerMessage>,
    username: Option<String>,
) -> Result<()>
where
    W: FrameWriter,
{
    let mut client = ChatClient::new(writer);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    render(vec![Output::Line(
        "*** commands: :EXIT quits, :HELP prints usage".into(),
    )])
    .await?;
    match username {
        Some(name) => {
            let output = client
                .submit(ClientMessage::ChangeUsername { data: name })
                .await?;
            render(output).await?;
        }
        None => render(vec![Output::Line(ENTER_USERNAME.into())]).await?,
    }

    while client.state() != ClientState::Exiting {
        select! {
            server_message = inbound.next() => {
                if !handle_server_frame(&mut client, server_message).await? {
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => render(client.handle_input(&line).await?).await?,
                None => stdin_open = false,
            },
            drained = client.drained(), if client.is_paused() => drained?,
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    client.close(DEFAULT_CLOSE_GRACE).await;
    Ok(())
}

async fn handle_server_frame<W>(
    client: &mut ChatClient<W>,
    frame: Option<io::Result<Inbound<ServerMessage>>>,
) -> Result<bool>
where
    W: FrameWriter,
{
    match frame {
        Some(Ok(Inbound::Message(message))) => {
            render(client.handle_server_message(message)).await?;
            Ok(true)
        }
        Some(Ok(Inbound::Malformed(error))) => {
            warn!(%error, "malformed frame from server");
            render(vec![Output::Error(
                "!!! received malformed data from server".into(),
            )])
            .await?;
            Ok(true)
        }
        Some(Ok(Inbound::Pong)) => Ok(true),
        Some(Err(err)) => {
            render(vec![Output::Error(format!("!!! connection error: {err}"))]).await?;
            Ok(false)
        }
        None => {
            render(vec![Output::Line("*** server closed the connection".into())]).await?;
            Ok(false)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render(output: Vec<Output>) -> io::Result<()> {
    for line in output {
        match line {
            Output::Line(line) => write_stdout(&line).await?,
            Output::Error(line) => write_stderr(&line).await?,
        }
    }
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
