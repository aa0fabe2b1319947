//! Backpressure-aware delivery.
//!
//! A write either finishes on its first poll or it is parked: the outbox is
//! paused and every frame submitted afterwards waits in a FIFO backlog. When
//! the parked write resolves (the transport drained its buffer) the backlog is
//! written in submission order until it empties or another write parks. Only
//! one write is ever outstanding per connection, and nothing is dropped.

use std::{collections::VecDeque, io, task::Poll, time::Duration};

use futures::future::BoxFuture;
use tokio::{
    select,
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::debug;

use crate::transport::{FrameWriter, WireFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Flowing,
    Paused,
}

/// Ordering half of the backpressure controller, independent of any I/O.
#[derive(Debug)]
pub struct FlowControl<T> {
    state: FlowState,
    backlog: VecDeque<T>,
}

impl<T> Default for FlowControl<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlowControl<T> {
    pub fn new() -> Self {
        Self {
            state: FlowState::Flowing,
            backlog: VecDeque::new(),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Hands the frame back if it may be written right now, otherwise queues it
    /// behind everything submitted earlier.
    pub fn submit(&mut self, frame: T) -> Option<T> {
        if self.state == FlowState::Flowing && self.backlog.is_empty() {
            Some(frame)
        } else {
            self.backlog.push_back(frame);
            None
        }
    }

    pub fn pause(&mut self) {
        self.state = FlowState::Paused;
    }

    pub fn resume(&mut self) {
        self.state = FlowState::Flowing;
    }

    /// Oldest queued frame, only while flowing.
    pub fn next_ready(&mut self) -> Option<T> {
        match self.state {
            FlowState::Flowing => self.backlog.pop_front(),
            FlowState::Paused => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was fully handed to the transport.
    Written,
    /// The frame is parked or queued until the transport drains.
    Deferred,
    /// The outbox is closing; the frame was dropped.
    Discarded,
}

struct InFlight<W> {
    write: BoxFuture<'static, (W, io::Result<()>)>,
    closes: bool,
}

/// Drives a [`FrameWriter`] through a [`FlowControl`].
pub struct Outbox<W> {
    writer: Option<W>,
    flow: FlowControl<WireFrame>,
    in_flight: Option<InFlight<W>>,
    closing: bool,
    closed: bool,
}

impl<W> Outbox<W>
where
    W: FrameWriter,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
            flow: FlowControl::new(),
            in_flight: None,
            closing: false,
            closed: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.flow.state() == FlowState::Paused
    }

    /// True once a [`WireFrame::Close`] has been written.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queued(&self) -> usize {
        self.flow.backlog_len()
    }

    /// Submits a frame without waiting for the transport.
    ///
    /// Frames submitted after [`WireFrame::Close`] are discarded.
    pub async fn send(&mut self, frame: WireFrame) -> io::Result<Delivery> {
        if self.closing {
            return Ok(Delivery::Discarded);
        }
        if frame == WireFrame::Close {
            self.closing = true;
        }

        match self.flow.submit(frame) {
            Some(frame) => {
                self.start(frame).await?;
                Ok(if self.is_paused() {
                    Delivery::Deferred
                } else {
                    Delivery::Written
                })
            }
            None => Ok(Delivery::Deferred),
        }
    }

    /// Waits for the parked write, then flushes the backlog in order.
    ///
    /// Cancel safe: the parked write stays in place if this future is dropped.
    pub async fn drained(&mut self) -> io::Result<()> {
        if let Some(in_flight) = self.in_flight.as_mut() {
            let (writer, result) = (&mut in_flight.write).await;
            let closes = in_flight.closes;
            self.in_flight = None;
            self.writer = Some(writer);
            self.closed |= closes;
            result?;
        }

        self.flow.resume();
        while let Some(frame) = self.flow.next_ready() {
            self.start(frame).await?;
        }
        Ok(())
    }

    // Polls the write once; parks it and pauses if it is not done yet.
    async fn start(&mut self, frame: WireFrame) -> io::Result<()> {
        let Some(writer) = self.writer.take() else {
            return Err(io::Error::other("outbox writer is busy"));
        };
        let closes = frame == WireFrame::Close;
        let mut write = writer.write_frame(frame);

        let polled = futures::poll!(write.as_mut());
        match polled {
            Poll::Ready((writer, result)) => {
                self.writer = Some(writer);
                self.closed |= closes;
                result
            }
            Poll::Pending => {
                self.in_flight = Some(InFlight { write, closes });
                self.flow.pause();
                Ok(())
            }
        }
    }
}

/// Writer task for one server-side session.
///
/// Frames arrive from the relay over an unbounded channel so the relay never
/// waits on a slow peer. After a [`WireFrame::Close`] arrives the connection
/// has `close_grace` to flush and close; past that the writer is dropped and
/// the connection torn down.
pub async fn run_outbox<W>(
    writer: W,
    mut frames: mpsc::UnboundedReceiver<WireFrame>,
    close_grace: Duration,
) -> io::Result<()>
where
    W: FrameWriter,
{
    let mut outbox = Outbox::new(writer);
    let mut close_deadline: Option<Instant> = None;
    let mut frames_open = true;

    while !outbox.is_closed() {
        select! {
            frame = frames.recv(), if frames_open => {
                let frame = match frame {
                    Some(frame) => frame,
                    None => {
                        frames_open = false;
                        WireFrame::Close
                    }
                };
                if frame == WireFrame::Close && close_deadline.is_none() {
                    close_deadline = Some(Instant::now() + close_grace);
                }
                if outbox.send(frame).await? == Delivery::Discarded {
                    debug!("dropping frame queued after close");
                }
            }
            result = outbox.drained(), if outbox.is_paused() => result?,
            _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection did not close within {close_grace:?}"),
                ));
            }
        }
    }

    Ok(())
}
