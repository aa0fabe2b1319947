//! Byte-level transports the relay and client speak.
//!
//! Two framings are supported:
//!
//! - [`TransportKind::Lines`]: newline-delimited JSON over a raw TCP stream,
//!   decoded with [`JsonLinesCodec`].
//! - [`TransportKind::WebSocket`]: one JSON object per WebSocket text message.
//!   The peer has no half-open detection of its own, so these connections are
//!   probed with Ping frames by the liveness monitor.
//!
//! Both directions are split: the read side becomes an [`InboundStream`], the
//! write side a [`FrameWriter`] that the [`Outbox`](crate::flow::Outbox) drives.

use std::{io, net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures::{
    FutureExt, SinkExt, StreamExt,
    future::BoxFuture,
    stream::{BoxStream, SplitSink},
};
use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedWriteHalf},
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tokio_util::codec::FramedRead;

use crate::{
    codec::JsonLinesCodec,
    config::TransportKind,
    message::{DecodeError, decode, decode_bytes},
};

/// One unit handed to a transport for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// An encoded JSON message without any delimiter.
    Text(String),
    /// Liveness probe. Stream transports ignore it.
    Ping,
    /// Close the connection once everything queued before it is written.
    Close,
}

/// Something read from a peer.
#[derive(Debug)]
pub enum Inbound<T> {
    Message(T),
    Malformed(DecodeError),
    Pong,
}

impl<T> From<Result<T, DecodeError>> for Inbound<T> {
    fn from(result: Result<T, DecodeError>) -> Self {
        match result {
            Ok(message) => Inbound::Message(message),
            Err(err) => Inbound::Malformed(err),
        }
    }
}

pub type InboundStream<T> = BoxStream<'static, io::Result<Inbound<T>>>;

/// Write half of a transport.
///
/// Writing takes the writer by value and hands it back with the outcome, so a
/// write that cannot finish right away can be parked while its owner keeps
/// serving other events.
pub trait FrameWriter: Send + Sized + 'static {
    fn write_frame(self, frame: WireFrame) -> BoxFuture<'static, (Self, io::Result<()>)>;
}

/// Newline-delimited JSON writer for stream transports.
pub struct LineWriter<W> {
    inner: W,
}

impl<W> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin,
{
    async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await
    }
}

impl<W> FrameWriter for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn write_frame(mut self, frame: WireFrame) -> BoxFuture<'static, (Self, io::Result<()>)> {
        async move {
            let result = match frame {
                WireFrame::Text(text) => self.write_line(&text).await,
                WireFrame::Ping => Ok(()),
                WireFrame::Close => self.inner.shutdown().await,
            };
            (self, result)
        }
        .boxed()
    }
}

/// WebSocket writer; every text frame carries exactly one JSON message.
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn write_frame(mut self, frame: WireFrame) -> BoxFuture<'static, (Self, io::Result<()>)> {
        async move {
            let result = match frame {
                WireFrame::Text(text) => self.sink.send(Message::text(text)).await,
                WireFrame::Ping => self.sink.send(Message::Ping(Bytes::new())).await,
                // Sends a Close frame, then flushes and shuts the socket.
                WireFrame::Close => self.sink.close().await,
            };
            (self, result.map_err(io::Error::other))
        }
        .boxed()
    }
}

/// Splits a TCP stream into a line writer and a stream of decoded messages.
pub fn lines<T>(stream: TcpStream) -> (LineWriter<OwnedWriteHalf>, InboundStream<T>)
where
    T: DeserializeOwned + Send + 'static,
{
    let (reader, writer) = stream.into_split();
    let inbound = FramedRead::new(reader, JsonLinesCodec::<T>::new())
        .map(|item| item.map(Inbound::from))
        .boxed();
    (LineWriter::new(writer), inbound)
}

fn websocket<S, T>(ws: WebSocketStream<S>) -> (WsWriter<S>, InboundStream<T>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    let (sink, stream) = ws.split();
    let inbound = stream
        .filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(Inbound::from(decode::<T>(text.as_str())))),
                Ok(Message::Binary(bytes)) => {
                    Some(Ok(Inbound::from(decode_bytes::<T>(&bytes))))
                }
                Ok(Message::Pong(_)) => Some(Ok(Inbound::Pong)),
                // Pings are answered by tungstenite; Close ends the stream.
                Ok(Message::Ping(_) | Message::Close(_) | Message::Frame(_)) => None,
                Err(err) => Some(Err(io::Error::other(err))),
            }
        })
        .boxed();
    (WsWriter { sink }, inbound)
}

/// Completes the server side of the WebSocket handshake.
pub async fn accept_websocket<T>(
    stream: TcpStream,
) -> Result<(WsWriter<TcpStream>, InboundStream<T>)>
where
    T: DeserializeOwned + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    Ok(websocket(ws))
}

/// Connects to a relay speaking WebSocket framing. `limit` bounds the TCP
/// connect and the upgrade handshake together.
pub async fn connect_websocket<T>(
    addr: SocketAddr,
    limit: Duration,
) -> Result<(WsWriter<MaybeTlsStream<TcpStream>>, InboundStream<T>)>
where
    T: DeserializeOwned + Send + 'static,
{
    let url = format!("ws://{addr}/");
    let (ws, _response) = timeout(limit, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .map_err(|_| anyhow!("websocket handshake with {url} timed out after {limit:?}"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    Ok(websocket(ws))
}

/// Connects to a relay speaking newline-delimited framing.
pub async fn connect_lines<T>(
    addr: SocketAddr,
    limit: Duration,
) -> Result<(LineWriter<OwnedWriteHalf>, InboundStream<T>)>
where
    T: DeserializeOwned + Send + 'static,
{
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("connecting to {addr} timed out after {limit:?}"))?
        .with_context(|| format!("failed to connect to {addr}"))?;
    Ok(lines(stream))
}

impl TransportKind {
    /// Whether sessions on this transport need heartbeat probing.
    pub fn needs_liveness_probe(self) -> bool {
        matches!(self, TransportKind::WebSocket)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn line_writer_appends_delimiter_and_ignores_ping() {
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(server);
        let writer = LineWriter::new(client);

        let (writer, result) = writer.write_frame(WireFrame::Ping).await;
        result.expect("ping is a no-op");
        let (writer, result) = writer
            .write_frame(WireFrame::Text(r#"{"type":"HELP"}"#.into()))
            .await;
        result.expect("write");
        let (_writer, result) = writer.write_frame(WireFrame::Close).await;
        result.expect("close");

        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read");
        assert_eq!(line, "{\"type\":\"HELP\"}\n");

        line.clear();
        let eof = reader.read_line(&mut line).await.expect("read");
        assert_eq!(eof, 0);
    }

    #[tokio::test]
    async fn websocket_frames_decode_one_message_each() -> Result<()> {
        use crate::message::{ClientMessage, ServerMessage};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (writer, mut inbound) = accept_websocket::<ClientMessage>(stream).await?;
            let first = inbound.next().await;
            anyhow::Ok((writer, first))
        });

        let (writer, _inbound) =
            connect_websocket::<ServerMessage>(addr, Duration::from_secs(1)).await?;
        let (_writer, result) = writer
            .write_frame(WireFrame::Text(r#"{"type":"HELP"}"#.into()))
            .await;
        result?;

        let (_server_writer, first) = server.await??;
        assert!(matches!(first, Some(Ok(Inbound::Message(ClientMessage::Help)))));
        Ok(())
    }

    #[tokio::test]
    async fn stalled_websocket_handshake_times_out() -> Result<()> {
        use crate::message::ServerMessage;

        // The kernel completes the TCP connect, but nobody ever answers the
        // upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let started = tokio::time::Instant::now();
        let result = connect_websocket::<ServerMessage>(addr, Duration::from_millis(200)).await;
        let Err(err) = result else {
            panic!("handshake against a silent listener succeeded");
        };
        assert!(err.to_string().contains("timed out"), "{err:#}");
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(listener);
        Ok(())
    }
}
