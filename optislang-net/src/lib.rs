//! This library provides the networking layer used for driving a running
//! optiSLang server.
//!
//! The server speaks a simple private protocol: every message is a UTF-8
//! JSON document prefixed by a fixed size header holding the payload length.
//! Requests are either *queries* (reading state of the project tree) or
//! *commands* (mutating it). Each request travels over its own short-lived
//! connection and is answered by exactly one response.
//!
//!
//! # Layers
//!
//! The crate is split into three layers, leaf-first:
//!
//! - `socket`: a framed byte-stream abstraction over either a TCP stream or
//!   a local inter-process channel, with timeout-bounded connect, accept,
//!   send and receive primitives, plus raw file transfer.
//! - `msg`: typed definitions of the queries and commands understood by the
//!   server, each paired with the shape of its response.
//! - `client`: the request/response `Client`, translating failures of any
//!   of the layers above into a single error taxonomy.
//!
//!
//! # Failure layers
//!
//! Errors are kept apart by where they originate:
//!
//! - *transport*: the socket could not connect, was reset, or timed out
//!   (`Error::Communication`, `Error::TimedOut`), these are generally safe
//!   to retry
//! - *protocol*: the server answered with something that is not a valid
//!   frame (`Error::ResponseFormat`, `Error::EmptyResponse`)
//! - *application*: the server understood the request but reported that it
//!   failed (`Error::Command`)
//!
//!
//! # Local channels
//!
//! Besides TCP the transport supports local channels addressed with an
//! opaque identifier. On unix platforms these are backed by domain sockets.
//! Named pipes are not available, using a local endpoint on other platforms
//! results in `Error::TransportUnavailable`.

#[macro_use]
extern crate log;

pub mod msg;
pub mod socket;

mod client;
mod context;
mod error;

pub use client::{Client, ClientConfig};
pub use context::LogContext;
pub use socket::{Endpoint, Listener, Socket, SocketCloser, SocketConfig, Transport};

pub use error::{Error, Result};
