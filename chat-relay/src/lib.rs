//! A text-chat relay and its terminal client.
//!
//! The relay accepts TCP connections speaking JSON messages, framed either as
//! newline-delimited lines or as WebSocket text frames, and routes them
//! between named sessions.
//!
//! - [`server`] accepts connections and runs a reader and a writer task for
//!   each one.
//! - [`relay`] is the single task that owns the [`registry`] and applies what
//!   the [`router`] decides.
//! - [`flow`] pauses a session's writes while its transport is saturated and
//!   replays them in order once it drains.
//! - [`liveness`] probes WebSocket sessions and evicts silent ones.
//! - [`message`], [`codec`] and [`transport`] make up the wire protocol.
//! - [`client`] and [`input`] implement the terminal client.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod flow;
pub mod input;
pub mod liveness;
pub mod message;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;
