use super::{Session, SessionContext, State};
use crate::{Error, Options, Protocol, SessionHandler, Transport, TransportError};

use std::time::Instant;

use bytes::Bytes;
use codec::handshake::{BAD_REQUEST, INTERNAL_SERVER_ERROR, Request, Response, accept_key};

/// Protocol name that switches outgoing data to binary frames.
const BINARY_PROTOCOL: &str = "arduino";

impl<T> Session<T>
where
    T: Transport,
{
    /// Feed bytes of the upgrade request.
    ///
    /// Once the request head is complete the session either upgrades, in
    /// which case bytes following the request go through the frame engine,
    /// or answers with an HTTP error and releases the slot.
    pub fn handshake<H>(
        &mut self,
        chunk: Bytes,
        handler: &H,
        options: &Options,
        now: Instant,
    ) -> Result<(), Error>
    where
        H: SessionHandler,
    {
        let accumulator = self
            .accumulator
            .get_or_insert_with(|| codec::handshake::Accumulator::new(options.max_request_size));

        let size = match accumulator.push(&chunk) {
            Ok(Some(size)) => size,
            Ok(None) => {
                self.ack(chunk.len());
                return Ok(());
            }
            Err(e) => return self.reject(e.into()),
        };

        self.ack(size);

        let Some(accumulator) = self.accumulator.take() else {
            return Ok(());
        };

        let request = match Request::parse(accumulator.as_bytes()) {
            Ok(it) => it,
            Err(e) => return self.reject(e.into()),
        };

        let candidates = request.candidates().collect::<Vec<_>>();
        let first = candidates.first().copied();

        let selected = if candidates.is_empty() {
            None
        } else {
            handler.on_protocol_select(self.id, &candidates)
        };

        let (protocol, binary) = match selected {
            Some(Protocol { name, binary }) => (Some(name), binary),
            None => (first.map(str::to_string), false),
        };

        let accept = accept_key(request.key);

        self.encoder.clear();
        Response {
            protocol: protocol.as_deref(),
            accept: &accept,
        }
        .encode(&mut self.encoder);

        self.write_encoded()?;

        self.state = State::Connected;
        self.binary = binary || first == Some(BINARY_PROTOCOL);
        self.protocol = protocol;
        self.last_send = now;

        log::info!(
            "session upgrade: id={}, path={:?}, protocol={:?}, binary={}",
            self.id,
            request.path,
            self.protocol,
            self.binary
        );

        handler.on_client_connect(&mut SessionContext {
            id: self.id,
            protocol: self.protocol.as_deref(),
            binary: self.binary,
            stream: &self.stream,
            handlers: &mut self.handlers,
        });

        let rest = chunk.slice(size..);
        if !rest.is_empty() {
            self.pending.push_back(rest);
            self.feed()?;
        }

        Ok(())
    }

    /// Answer a failed upgrade and release the slot.
    fn reject(&mut self, error: Error) -> Result<(), Error> {
        log::warn!("bad upgrade request: id={}, err={}", self.id, error);

        let response = match error {
            Error::Allocation => INTERNAL_SERVER_ERROR,
            _ => BAD_REQUEST,
        };

        self.encoder.clear();
        self.encoder.extend_from_slice(response);

        if let Err(e) = self.write_encoded() {
            log::debug!("failed to send error response: id={}, err={}", self.id, e);
        }

        self.release(false);
        Err(error)
    }

    /// Send the encoder contents, halving the piece size while the
    /// transport refuses it.
    fn write_encoded(&mut self) -> Result<(), Error> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::Transport(TransportError::Closed))?;

        let mut offset = 0;
        while offset < self.encoder.len() {
            let mut size = self.encoder.len() - offset;

            loop {
                match transport.send(&self.encoder[offset..offset + size]) {
                    Ok(()) => break,
                    Err(TransportError::WouldBlock) if size > 1 => size /= 2,
                    Err(e) => return Err(e.into()),
                }
            }

            offset += size;
        }

        Ok(())
    }
}
