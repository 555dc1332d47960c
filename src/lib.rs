//! Post-handshake WebSocket (RFC 6455) protocol engine.
//!
//! This crate speaks the WebSocket wire protocol on top of an established
//! byte duplex, typically a TCP stream right after the HTTP upgrade. It
//! parses and generates frames, reassembles fragmented messages, runs the
//! closing handshake and orders outbound frames, with a completion handle
//! per send. The HTTP upgrade itself, TLS and extensions are deliberately
//! someone else's job.
//!
//! The two entry points are [`Connection`], an actor that drives a
//! `Read + Write` transport and delivers events to an [`Endpoint`], and the
//! sans-io [`Session`] underneath it for callers that bring their own I/O.
#![deny(
    missing_docs,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod message;
pub mod policy;
pub mod session;

pub use crate::{
    connection::{registry::Registry, Connection, SendHandle, SendOptions, SendResult},
    endpoint::Endpoint,
    error::{Error, Result},
    frame::{coding::CloseCode, CloseFrame, Frame, Utf8Bytes},
    message::{Message, MessageKind},
    policy::{Policy, Role},
    session::{CloseInfo, Inbound, Session},
};
