mod handshake;
mod processor;

use crate::{Error, Options, Stream, Transport, TransportError};

use std::{collections::VecDeque, fmt, time::Instant};

use bytes::{Bytes, BytesMut};
use codec::{
    frame::{Frame, FrameHeader, MAX_HEADER_SIZE, OpCode},
    handshake::Accumulator,
};

pub(crate) use self::processor::Sink;

/// Identifies a session slot and the connection occupying it.
///
/// The generation grows every time the slot is released, so an id kept
/// after its connection went away never addresses the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub slot: usize,
    pub generation: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// ```text
/// Free -> Connecting -> Connected -> Closing -> Free
///              |                         ^
///              +---- bad request ---> Free
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Free,
    /// Accepted, waiting for the upgrade request.
    Connecting,
    Connected,
    /// Closed on the protocol level, the connection goes away on the next
    /// poll.
    Closing,
}

/// The kind of data message a [`FrameHandler`] is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Receives complete messages, reassembled from all of their fragments.
pub type FrameHandler = Box<dyn FnMut(SessionId, &[u8]) + Send>;

#[derive(Default)]
pub(crate) struct FrameHandlers {
    text: Option<FrameHandler>,
    binary: Option<FrameHandler>,
}

impl FrameHandlers {
    pub fn set(&mut self, kind: FrameKind, handler: FrameHandler) {
        match kind {
            FrameKind::Text => self.text = Some(handler),
            FrameKind::Binary => self.binary = Some(handler),
        }
    }

    pub fn get(&mut self, opcode: OpCode) -> Option<&mut FrameHandler> {
        match opcode {
            OpCode::Text => self.text.as_mut(),
            OpCode::Binary => self.binary.as_mut(),
            _ => None,
        }
    }

    pub fn contains(&self, opcode: OpCode) -> bool {
        match opcode {
            OpCode::Text => self.text.is_some(),
            OpCode::Binary => self.binary.is_some(),
            _ => false,
        }
    }
}

/// A freshly connected session, handed to
/// [`SessionHandler::on_client_connect`](crate::SessionHandler::on_client_connect).
pub struct SessionContext<'a> {
    pub id: SessionId,
    /// The negotiated sub-protocol.
    pub protocol: Option<&'a str>,
    /// Outgoing data is sent as binary frames.
    pub binary: bool,
    stream: &'a Stream,
    handlers: &'a mut FrameHandlers,
}

impl SessionContext<'_> {
    pub fn stream(&self) -> &Stream {
        self.stream
    }

    pub fn register_frame_handler(&mut self, kind: FrameKind, handler: FrameHandler) {
        self.handlers.set(kind, handler);
    }
}

pub(crate) struct Session<T> {
    pub id: SessionId,
    pub state: State,
    pub transport: Option<T>,
    pub stream: Stream,
    /// Header of the frame in progress.
    pub header: FrameHeader,
    /// Where the payload of the frame in progress goes.
    pub sink: Sink,
    /// Opcode of the fragmented message in progress.
    pub fragment: Option<OpCode>,
    /// Reassembled message for a registered frame handler.
    pub message: Vec<u8>,
    pub max_message_size: usize,
    /// Received chunks not fully processed yet, in arrival order.
    pub pending: VecDeque<Bytes>,
    /// The last payload step stopped at a full inbound buffer.
    pub stalled: bool,
    pub accumulator: Option<Accumulator>,
    pub handlers: FrameHandlers,
    pub binary: bool,
    pub protocol: Option<String>,
    pub ping_count: u32,
    pub last_send: Instant,
    pub idle_ticks: u32,
    /// Accept order, the smallest one is the oldest session.
    pub accepted: u64,
    /// Current limit of a drained frame, halved while the transport
    /// refuses writes.
    pub drain_limit: usize,
    pub encoder: BytesMut,
    pub scratch: Vec<u8>,
}

impl<T> Session<T>
where
    T: Transport,
{
    pub fn new(slot: usize, now: Instant) -> Self {
        let stream = Stream::new(0, 0);
        stream.detach();

        Self {
            id: SessionId {
                slot,
                generation: 0,
            },
            state: State::Free,
            transport: None,
            header: FrameHeader::default(),
            sink: Sink::Discard,
            fragment: None,
            message: Vec::new(),
            max_message_size: 0,
            pending: VecDeque::new(),
            stalled: false,
            accumulator: None,
            handlers: FrameHandlers::default(),
            binary: false,
            protocol: None,
            ping_count: 0,
            last_send: now,
            idle_ticks: 0,
            accepted: 0,
            drain_limit: 0,
            encoder: BytesMut::new(),
            scratch: Vec::new(),
            stream,
        }
    }

    /// Reset the slot to defaults for a new connection.
    pub fn accept(&mut self, transport: T, options: &Options, sequence: u64, now: Instant) {
        self.state = State::Connecting;
        self.transport = Some(transport);
        self.stream = Stream::new(options.rx_buffer_size, options.tx_buffer_size);
        self.header.clear();
        self.sink = Sink::Discard;
        self.fragment = None;
        self.max_message_size = options.max_message_size;
        self.stalled = false;
        self.accumulator = Some(Accumulator::new(options.max_request_size));
        self.handlers = FrameHandlers::default();
        self.binary = false;
        self.protocol = None;
        self.ping_count = 0;
        self.last_send = now;
        self.idle_ticks = 0;
        self.accepted = sequence;
        self.drain_limit = options.max_frame_size;
    }

    /// Close or abort the transport and free every buffer, returns whether
    /// the session had been connected.
    pub fn release(&mut self, abort: bool) -> bool {
        let connected = matches!(self.state, State::Connected | State::Closing);

        if let Some(mut transport) = self.transport.take() {
            if abort {
                transport.abort();
            } else {
                transport.close();
            }
        }

        self.stream.detach();
        self.header.clear();
        self.sink = Sink::Discard;
        self.fragment = None;
        self.message = Vec::new();
        self.pending = VecDeque::new();
        self.accumulator = None;
        self.handlers = FrameHandlers::default();
        self.protocol = None;
        self.encoder = BytesMut::new();
        self.scratch = Vec::new();
        self.state = State::Free;
        self.id.generation = self.id.generation.wrapping_add(1);

        connected
    }

    pub fn ack(&mut self, len: usize) {
        if let Some(transport) = self.transport.as_mut() {
            transport.received(len);
        }
    }

    fn transport(&mut self) -> Result<&mut T, Error> {
        self.transport
            .as_mut()
            .ok_or(Error::Transport(TransportError::Closed))
    }

    /// Encode and send a single frame.
    pub fn send(&mut self, frame: Frame<'_>) -> Result<(), Error> {
        self.encoder.clear();
        frame.encode(&mut self.encoder)?;

        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::Transport(TransportError::Closed))?;

        transport.send(&self.encoder)?;
        Ok(())
    }

    /// Send a control frame. A full send window drops it, the peer will
    /// ask again or time out.
    pub fn send_control(&mut self, frame: Frame<'_>) -> Result<(), Error> {
        match self.send(frame) {
            Err(Error::Transport(TransportError::WouldBlock)) => {
                log::debug!(
                    "control frame dropped, send window full: id={}, opcode={:?}",
                    self.id,
                    frame.opcode
                );

                Ok(())
            }
            result => result,
        }
    }

    /// Send application data as one frame of the given kind.
    pub fn send_data(&mut self, data: &[u8], binary: bool, now: Instant) -> Result<(), Error> {
        let frame = if binary {
            Frame::binary(data)
        } else {
            Frame::text(data)
        };

        self.send(frame)?;
        self.last_send = now;
        Ok(())
    }

    /// Poll work of a connected session.
    pub fn service(&mut self, options: &Options, now: Instant) -> Result<(), Error> {
        self.feed()?;

        if self.state == State::Connected {
            self.drain(options, now)?;
            self.keepalive(options, now)?;
        }

        Ok(())
    }

    /// Move pending outbound bytes into one data frame.
    ///
    /// The batch is bounded by the send window minus the largest header,
    /// by the frame size limit and by the current drain limit. Bytes leave
    /// the outbound buffer only once the transport took the frame.
    fn drain(&mut self, options: &Options, now: Instant) -> Result<(), Error> {
        let pending = self.stream.tx_count();
        let capacity = self.transport()?.send_capacity();
        if pending == 0 || capacity <= 4 {
            return Ok(());
        }

        let size = pending
            .min(capacity - 4)
            .min(options.max_frame_size)
            .min(self.drain_limit.max(1));

        self.scratch.resize(size, 0);
        let size = self.stream.peek_outbound(&mut self.scratch);

        let opcode = if self.binary {
            OpCode::Binary
        } else {
            OpCode::Text
        };

        self.encoder.clear();
        self.encoder.reserve(MAX_HEADER_SIZE + size);
        Frame::new(opcode, &self.scratch[..size]).encode(&mut self.encoder)?;

        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::Transport(TransportError::Closed))?;

        match transport.send(&self.encoder) {
            Ok(()) => {
                self.stream.consume_outbound(size);
                self.last_send = now;
                self.drain_limit = self
                    .drain_limit
                    .saturating_mul(2)
                    .min(options.max_frame_size)
                    .max(1);

                log::trace!("drain: id={}, size={}", self.id, size);
            }
            Err(TransportError::WouldBlock) => {
                self.drain_limit = (size / 2).max(1);

                log::debug!(
                    "send window refused frame: id={}, size={}, limit={}",
                    self.id,
                    size,
                    self.drain_limit
                );
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Ping the peer when nothing was sent for a while, and give up on it
    /// once too many pings went unanswered.
    fn keepalive(&mut self, options: &Options, now: Instant) -> Result<(), Error> {
        if self.ping_count >= options.max_unanswered_pings {
            log::warn!(
                "session not responding: id={}, pings={}",
                self.id,
                self.ping_count
            );

            self.state = State::Closing;
            return Ok(());
        }

        if now.saturating_duration_since(self.last_send) < options.ping_interval {
            return Ok(());
        }

        if self.transport()?.send_capacity() > 4 {
            self.send_control(Frame::ping(b"Hi"))?;
            self.last_send = now;
            self.ping_count += 1;
        }

        Ok(())
    }
}
