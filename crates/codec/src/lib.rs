//! ## The WebSocket Protocol (RFC 6455)
//!
//! [RFC6455]: https://datatracker.ietf.org/doc/html/rfc6455
//! [Section 5]: https://datatracker.ietf.org/doc/html/rfc6455#section-5
//! [Section 4]: https://datatracker.ietf.org/doc/html/rfc6455#section-4
//!
//! The WebSocket Protocol enables two-way communication between a client
//! running untrusted code in a controlled environment to a remote host
//! that has opted-in to communications from that code.  The protocol
//! consists of an opening handshake followed by basic message framing,
//! layered over TCP.
//!
//! This crate holds the byte level pieces of the protocol only: the
//! incremental frame header parser and the frame encoder described in
//! [Section 5], payload masking, and the opening handshake of [Section 4].
//! Nothing in here owns a socket or a session.

pub mod frame;
pub mod handshake;
pub mod mask;

pub use self::{
    frame::{Frame, FrameHeader, OpCode},
    mask::apply_mask,
};

use std::str::Utf8Error;

#[derive(Debug)]
pub enum Error {
    /// The 64-bit extended payload length (length code 127) is not supported,
    /// payloads are limited to 65535 bytes.
    UnsupportedPayloadLength(usize),
    /// The request head grew past the configured limit without a blank line.
    RequestTooLarge,
    /// The upgrade request has no `Sec-WebSocket-Key` header.
    MissingKey,
    /// A buffer could not be allocated.
    Allocation,
    InvalidRequest(httparse::Error),
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        Self::InvalidRequest(value)
    }
}
