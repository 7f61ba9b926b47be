//! Opening handshake.
//!
//! [RFC6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2)
//!
//! The handshake from the client looks as follows:
//!
//! ```text
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Protocol: chat, superchat
//! Sec-WebSocket-Version: 13
//! ```
//!
//! The handshake from the server looks as follows:
//!
//! ```text
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! Sec-WebSocket-Protocol: chat
//! ```

use base64::{Engine, prelude::BASE64_STANDARD};
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

use crate::Error;

/// Fixed GUID appended to the client key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Initial size of the request accumulator.
pub const INITIAL_REQUEST_SIZE: usize = 512;

/// Upper bound for an upgrade request head.
pub const MAX_REQUEST_SIZE: usize = INITIAL_REQUEST_SIZE * 2;

pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400\r\nStatus: 400 Bad Request\r\n\r\n";

pub const INTERNAL_SERVER_ERROR: &[u8] =
    b"HTTP/1.1 500\r\nStatus: 500 Internal Server Error\r\n\r\n";

const MAX_HEADERS: usize = 32;

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// The key is trimmed before hashing.
///
/// # Test
///
/// ```
/// use websocketd_codec::handshake::accept_key;
///
/// assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// assert_eq!(accept_key("  dGhlIHNhbXBsZSBub25jZQ==  "), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Growable buffer collecting the raw request head of one connection.
///
/// The buffer starts at [`INITIAL_REQUEST_SIZE`] on the first push and grows
/// as needed, but never past its limit: a client that does not finish its
/// request head within the limit is rejected. Allocation failures are
/// reported as [`Error::Allocation`] instead of aborting.
pub struct Accumulator {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new(MAX_REQUEST_SIZE)
    }
}

impl Accumulator {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    /// Append received bytes.
    ///
    /// Returns `Some(n)` once the blank line ending the request head has been
    /// seen, where `n` is the number of bytes taken from `bytes`; anything
    /// after the terminator is left to the caller. Returns `None` while the
    /// request is still incomplete, in which case all of `bytes` was taken.
    ///
    /// # Test
    ///
    /// ```
    /// use websocketd_codec::handshake::Accumulator;
    ///
    /// let mut accumulator = Accumulator::default();
    ///
    /// assert_eq!(accumulator.push(b"GET / HTTP/1.1\r\nHost: a\r\n\r").unwrap(), None);
    /// assert_eq!(accumulator.push(b"\n\x81\x80").unwrap(), Some(1));
    /// assert!(accumulator.as_bytes().ends_with(b"\r\n\r\n"));
    ///
    /// let mut accumulator = Accumulator::new(16);
    /// assert!(accumulator.push(&[b'a'; 17]).is_err());
    /// ```
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<usize>, Error> {
        let previous = self.buffer.len();
        if self.buffer.capacity() == 0 {
            self.buffer
                .try_reserve_exact(INITIAL_REQUEST_SIZE.min(self.limit))
                .map_err(|_| Error::Allocation)?;
        }

        self.buffer.try_reserve(bytes.len()).map_err(|_| Error::Allocation)?;
        self.buffer.extend_from_slice(bytes);

        // The terminator may straddle the previous chunk.
        let start = previous.saturating_sub(TERMINATOR.len() - 1);
        if let Some(index) = self.buffer[start..]
            .windows(TERMINATOR.len())
            .position(|window| window == TERMINATOR)
        {
            let end = start + index + TERMINATOR.len();
            self.buffer.truncate(end);

            return Ok(Some(end - previous));
        }

        if self.buffer.len() > self.limit {
            return Err(Error::RequestTooLarge);
        }

        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// The parts of an upgrade request the server cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub path: Option<&'a str>,
    /// Trimmed `Sec-WebSocket-Key` value.
    pub key: &'a str,
    /// Trimmed `Sec-WebSocket-Protocol` value, the raw candidate list.
    pub protocols: Option<&'a str>,
}

impl<'a> Request<'a> {
    /// Parse a complete request head.
    ///
    /// Header names are matched case-insensitively.
    ///
    /// # Test
    ///
    /// ```
    /// use websocketd_codec::{Error, handshake::Request};
    ///
    /// let request = Request::parse(
    ///     b"GET /ws HTTP/1.1\r\n\
    ///       Host: 127.0.0.1\r\n\
    ///       sec-websocket-key:   dGhlIHNhbXBsZSBub25jZQ==  \r\n\
    ///       Sec-WebSocket-Protocol:  chat, superchat \r\n\r\n",
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(request.path, Some("/ws"));
    /// assert_eq!(request.key, "dGhlIHNhbXBsZSBub25jZQ==");
    /// assert_eq!(request.protocols, Some("chat, superchat"));
    /// assert_eq!(request.candidates().collect::<Vec<_>>(), vec!["chat", "superchat"]);
    ///
    /// assert!(matches!(
    ///     Request::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"),
    ///     Err(Error::MissingKey)
    /// ));
    /// ```
    pub fn parse(bytes: &'a [u8]) -> Result<Self, Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        if request.parse(bytes)?.is_partial() {
            return Err(Error::InvalidRequest(httparse::Error::Status));
        }

        let mut key = None;
        let mut protocols = None;

        for header in request.headers.iter() {
            if header.name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
                key = Some(std::str::from_utf8(header.value)?.trim());
            } else if header.name.eq_ignore_ascii_case("Sec-WebSocket-Protocol") {
                protocols = Some(std::str::from_utf8(header.value)?.trim());
            }
        }

        Ok(Self {
            key: key.filter(|key| !key.is_empty()).ok_or(Error::MissingKey)?,
            protocols: protocols.filter(|protocols| !protocols.is_empty()),
            path: request.path,
        })
    }

    /// Requested sub-protocols in the order the client listed them.
    pub fn candidates(&self) -> impl Iterator<Item = &'a str> {
        self.protocols
            .into_iter()
            .flat_map(|protocols| protocols.split(','))
            .map(str::trim)
            .filter(|protocol| !protocol.is_empty())
    }
}

/// The `101 Switching Protocols` answer.
pub struct Response<'a> {
    pub accept: &'a str,
    pub protocol: Option<&'a str>,
}

impl<'a> Response<'a> {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use websocketd_codec::handshake::Response;
    ///
    /// let mut bytes = BytesMut::new();
    /// Response {
    ///     accept: "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
    ///     protocol: Some("chat"),
    /// }
    /// .encode(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     b"HTTP/1.1 101 Switching Protocols\r\n\
    ///       Upgrade: websocket\r\n\
    ///       Connection: Upgrade\r\n\
    ///       Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
    ///       Sec-WebSocket-Protocol: chat\r\n\r\n"
    /// );
    /// ```
    pub fn encode(self, bytes: &mut BytesMut) {
        bytes.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        bytes.put_slice(b"Upgrade: websocket\r\n");
        bytes.put_slice(b"Connection: Upgrade\r\n");
        bytes.put_slice(b"Sec-WebSocket-Accept: ");
        bytes.put_slice(self.accept.as_bytes());
        bytes.put_slice(b"\r\n");

        if let Some(protocol) = self.protocol {
            bytes.put_slice(b"Sec-WebSocket-Protocol: ");
            bytes.put_slice(protocol.as_bytes());
            bytes.put_slice(b"\r\n");
        }

        bytes.put_slice(b"\r\n");
    }
}
