pub mod ring;
pub mod session;
pub mod stream;

pub use self::{
    session::{FrameHandler, FrameKind, SessionContext, SessionId, State},
    stream::{RealtimeHandler, Stream},
};

use self::session::Session;

use std::time::{Duration, Instant};

use bytes::Bytes;
use codec::frame::MAX_PAYLOAD_SIZE;

/// Why a transport refused to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The send window is exhausted, try again later.
    WouldBlock,
    /// The connection is gone.
    Closed,
}

impl std::error::Error for TransportError {}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A reliable byte stream connection, one per session.
///
/// The server never blocks on a transport: it asks for the current send
/// window before building outgoing frames and expects `send` to either take
/// the whole buffer or refuse it.
pub trait Transport {
    /// Bytes the transport can take right now.
    fn send_capacity(&self) -> usize;

    /// Queue `bytes` for sending, all or nothing.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Acknowledge `len` received bytes as processed, which lets the peer
    /// send more.
    fn received(&mut self, len: usize);

    /// Graceful close after everything queued has been sent.
    fn close(&mut self);

    /// Drop the connection immediately.
    fn abort(&mut self);
}

/// A sub-protocol picked by [`SessionHandler::on_protocol_select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub name: String,
    /// Send outgoing data as binary frames instead of text frames.
    pub binary: bool,
}

pub trait SessionHandler {
    /// Choose the sub-protocol for a new session.
    ///
    /// `protocols` lists the candidates from the `Sec-WebSocket-Protocol`
    /// header in the order the client sent them. Returning `None` selects
    /// the first candidate, if any, with text frames.
    #[allow(unused_variables)]
    fn on_protocol_select(&self, id: SessionId, protocols: &[&str]) -> Option<Protocol> {
        None
    }

    /// The handshake completed and the session is connected.
    ///
    /// This is where the application takes the character stream or
    /// registers frame handlers.
    #[allow(unused_variables)]
    fn on_client_connect(&self, ctx: &mut SessionContext<'_>) {}

    /// A connected session was torn down, for whatever reason.
    #[allow(unused_variables)]
    fn on_client_disconnect(&self, id: SessionId) {}
}

#[derive(Debug)]
pub enum Error {
    /// No free session slot.
    Busy,
    /// The session id is stale or out of range.
    UnknownSession,
    /// The session has not completed its handshake or is closing.
    NotConnected,
    /// A reassembly or request buffer could not be allocated.
    Allocation,
    /// A fragmented message for a frame handler grew past
    /// [`Options::max_message_size`].
    MessageTooLarge(usize),
    Codec(codec::Error),
    Transport(TransportError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        match value {
            codec::Error::Allocation => Self::Allocation,
            value => Self::Codec(value),
        }
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Size of the session pool.
    pub max_sessions: usize,
    /// Inbound ring buffer size, rounded up to a power of two.
    pub rx_buffer_size: usize,
    /// Outbound ring buffer size, rounded up to a power of two.
    pub tx_buffer_size: usize,
    /// Largest payload drained from the outbound buffer into one frame.
    pub max_frame_size: usize,
    /// Largest accepted upgrade request head.
    pub max_request_size: usize,
    /// Largest message reassembled for a frame handler, over all of its
    /// fragments.
    pub max_message_size: usize,
    /// Quiet time on the outgoing side before a ping is sent.
    pub ping_interval: Duration,
    /// Pings without a pong after which the session is closed.
    pub max_unanswered_pings: u32,
    /// Poll ticks without traffic before the connection is aborted, 0
    /// disables the check.
    pub max_idle_ticks: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            rx_buffer_size: 1024,
            tx_buffer_size: 1024,
            max_frame_size: 1460,
            max_request_size: codec::handshake::MAX_REQUEST_SIZE,
            max_message_size: MAX_PAYLOAD_SIZE * 4,
            ping_interval: Duration::from_secs(3),
            max_unanswered_pings: 4,
            max_idle_ticks: 0,
        }
    }
}

/// WebSocket server.
///
/// Owns a fixed pool of sessions and drives them from transport events and
/// from [`Server::poll`], which the owner calls at a steady rate. Everything
/// runs on the caller's thread, only the character streams are shared with
/// the application.
pub struct Server<T, H> {
    sessions: Vec<Session<T>>,
    options: Options,
    handler: H,
    link_lost: bool,
    sequence: u64,
    now: Instant,
}

impl<T, H> Server<T, H>
where
    T: Transport,
    H: SessionHandler,
{
    pub fn new(mut options: Options, handler: H) -> Self {
        let now = Instant::now();

        // A drained frame has to fit the 16-bit extended length.
        options.max_frame_size = options.max_frame_size.clamp(1, MAX_PAYLOAD_SIZE);

        Self {
            sessions: (0..options.max_sessions)
                .map(|slot| Session::new(slot, now))
                .collect(),
            link_lost: false,
            sequence: 0,
            options,
            handler,
            now,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Time of the last [`Server::poll`].
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Take a new connection into the first free slot.
    ///
    /// When the pool is full the connection is refused with
    /// [`Error::Busy`], unless a link loss has been reported since: then
    /// the oldest session is aborted and its slot reused.
    pub fn accept(&mut self, mut transport: T) -> Result<SessionId, Error> {
        let slot = match self.sessions.iter().position(|it| it.state == State::Free) {
            Some(slot) => slot,
            None if self.link_lost => {
                let Some(slot) = self
                    .sessions
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, it)| it.accepted)
                    .map(|(slot, _)| slot)
                else {
                    transport.abort();
                    return Err(Error::Busy);
                };

                log::warn!(
                    "link was lost, reclaim session: id={}",
                    self.sessions[slot].id
                );

                self.teardown(slot, true);
                self.link_lost = false;
                slot
            }
            None => {
                log::warn!(
                    "refused connection, no free session: max={}",
                    self.options.max_sessions
                );

                transport.abort();
                return Err(Error::Busy);
            }
        };

        self.sequence += 1;

        let session = &mut self.sessions[slot];
        session.accept(transport, &self.options, self.sequence, self.now);

        log::info!("session accept: id={}", session.id);

        Ok(session.id)
    }

    /// Bytes arrived for a session. `None` or an empty chunk means the peer
    /// closed the connection.
    ///
    /// Errors are returned after the session has already been torn down.
    pub fn on_receive(&mut self, id: SessionId, chunk: Option<Bytes>) -> Result<(), Error> {
        let slot = self.slot(id)?;

        let Some(chunk) = chunk.filter(|it| !it.is_empty()) else {
            log::info!("session closed by peer: id={}", id);

            self.teardown(slot, false);
            return Ok(());
        };

        let session = &mut self.sessions[slot];
        session.idle_ticks = 0;

        let result = match session.state {
            State::Connecting => session.handshake(chunk, &self.handler, &self.options, self.now),
            State::Connected => {
                session.pending.push_back(chunk);
                session.feed()
            }
            _ => {
                session.ack(chunk.len());
                Ok(())
            }
        };

        if let Err(e) = result {
            // A rejected upgrade has released its slot already.
            if self.sessions[slot].state != State::Free {
                self.fault(slot, &e);
            }

            return Err(e);
        }

        Ok(())
    }

    /// The transport reports queued bytes as delivered.
    pub fn on_sent(&mut self, id: SessionId) {
        if let Ok(slot) = self.slot(id) {
            self.sessions[slot].idle_ticks = 0;
        }
    }

    /// One tick of the server.
    ///
    /// Connected sessions retry held back input, drain their outbound
    /// buffer and run the ping check. Closing sessions are closed. Every
    /// live session ages by one idle tick.
    pub fn poll(&mut self, now: Instant) {
        self.now = now;

        for slot in 0..self.sessions.len() {
            let session = &mut self.sessions[slot];

            match session.state {
                State::Free => continue,
                State::Closing => {
                    log::info!("session close: id={}", session.id);

                    self.teardown(slot, false);
                    continue;
                }
                State::Connected => {
                    if let Err(e) = session.service(&self.options, now) {
                        self.fault(slot, &e);
                        continue;
                    }
                }
                State::Connecting => (),
            }

            let session = &mut self.sessions[slot];
            session.idle_ticks += 1;

            if self.options.max_idle_ticks > 0 && session.idle_ticks > self.options.max_idle_ticks {
                log::warn!(
                    "session idle timeout: id={}, ticks={}",
                    session.id,
                    session.idle_ticks
                );

                self.teardown(slot, true);
            }
        }
    }

    /// Report the state of the network link. After a loss, the next
    /// connection may reclaim a slot when the pool is full.
    pub fn notify_link_status(&mut self, up: bool) {
        if !up {
            self.link_lost = true;
        }
    }

    /// Send `data` as one frame, bypassing the outbound buffer.
    ///
    /// A full send window is reported as
    /// [`TransportError::WouldBlock`] and leaves the session alone.
    pub fn send_frame(&mut self, id: SessionId, data: &[u8], binary: bool) -> Result<(), Error> {
        let slot = self.slot(id)?;
        let session = &mut self.sessions[slot];
        if session.state != State::Connected {
            return Err(Error::NotConnected);
        }

        match session.send_data(data, binary, self.now) {
            Err(Error::Transport(TransportError::Closed)) => {
                self.teardown(slot, true);
                Err(Error::Transport(TransportError::Closed))
            }
            result => result,
        }
    }

    /// Send `data` to every connected session, returns how many took it.
    pub fn broadcast_frame(&mut self, data: &[u8], binary: bool) -> usize {
        let ids = self
            .sessions
            .iter()
            .filter(|it| it.state == State::Connected)
            .map(|it| it.id)
            .collect::<Vec<_>>();

        ids.into_iter()
            .filter(|id| self.send_frame(*id, data, binary).is_ok())
            .count()
    }

    /// Detach every character stream from its session.
    ///
    /// The connections stay up, but streams held by the application stop
    /// taking output and their sessions discard input from now on.
    pub fn close_connections(&mut self) {
        for session in self.sessions.iter().filter(|it| it.state != State::Free) {
            session.stream.detach();
        }
    }

    /// Abort every session.
    pub fn stop(&mut self) {
        for slot in 0..self.sessions.len() {
            self.teardown(slot, true);
        }
    }

    pub fn stream(&self, id: SessionId) -> Option<Stream> {
        let slot = self.slot(id).ok()?;
        Some(self.sessions[slot].stream.clone())
    }

    /// State of a session, [`State::Free`] for stale ids.
    pub fn state(&self, id: SessionId) -> State {
        self.slot(id)
            .map(|slot| self.sessions[slot].state)
            .unwrap_or(State::Free)
    }

    /// Negotiated sub-protocol of a session.
    pub fn protocol(&self, id: SessionId) -> Option<&str> {
        let slot = self.slot(id).ok()?;
        self.sessions[slot].protocol.as_deref()
    }

    /// Ids of all connected sessions.
    pub fn connected(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions
            .iter()
            .filter(|it| it.state == State::Connected)
            .map(|it| it.id)
    }

    /// Deliver whole text or binary messages of a session to `handler`
    /// instead of the character stream.
    pub fn register_frame_handler(
        &mut self,
        id: SessionId,
        kind: FrameKind,
        handler: FrameHandler,
    ) -> Result<(), Error> {
        let slot = self.slot(id)?;
        let session = &mut self.sessions[slot];
        if session.state != State::Connected {
            return Err(Error::NotConnected);
        }

        session.handlers.set(kind, handler);
        Ok(())
    }

    fn slot(&self, id: SessionId) -> Result<usize, Error> {
        match self.sessions.get(id.slot) {
            Some(session) if session.id == id && session.state != State::Free => Ok(id.slot),
            _ => Err(Error::UnknownSession),
        }
    }

    fn fault(&mut self, slot: usize, error: &Error) {
        log::warn!(
            "session fault: id={}, err={}",
            self.sessions[slot].id,
            error
        );

        self.teardown(slot, true);
    }

    /// Release a slot. Does nothing for a slot that is already free.
    fn teardown(&mut self, slot: usize, abort: bool) {
        let session = &mut self.sessions[slot];
        if session.state == State::Free {
            return;
        }

        let id = session.id;
        let connected = session.release(abort);

        if connected {
            self.handler.on_client_disconnect(id);
        }
    }
}
