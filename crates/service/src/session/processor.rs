use super::{Session, State};
use crate::{Error, Transport};

use bytes::Buf;
use codec::{
    frame::{Frame, OpCode},
    mask::apply_mask,
};

/// Destination of the payload of the frame in progress, decided once when
/// its header completes.
pub(crate) enum Sink {
    /// Unmasked into the inbound buffer of the character stream.
    Stream,
    /// Appended to the message reassembled for a frame handler.
    Message(OpCode),
    /// Collected for a Close, Ping or Pong frame.
    Control(OpCode, Vec<u8>),
    /// Dropped, for reserved opcodes and stray continuations.
    Discard,
}

impl<T> Session<T>
where
    T: Transport,
{
    /// Run the frame engine over the queued chunks.
    ///
    /// Stops when the queue is empty, when the inbound buffer is full (the
    /// rest stays queued for the next poll) or when the session stops being
    /// connected, in which case whatever is left is dropped.
    pub fn feed(&mut self) -> Result<(), Error> {
        while self.state == State::Connected {
            let Some(mut chunk) = self.pending.pop_front() else {
                break;
            };

            let size = self.process(&chunk)?;
            if size > 0 {
                chunk.advance(size);
                self.ack(size);
            }

            if !chunk.is_empty() {
                self.pending.push_front(chunk);

                // Retried on the next poll, once the application made room.
                if size == 0 || self.stalled {
                    break;
                }
            }
        }

        if self.state != State::Connected && !self.pending.is_empty() {
            let size: usize = self.pending.drain(..).map(|it| it.len()).sum();
            self.ack(size);
        }

        Ok(())
    }

    /// One step of the frame engine.
    ///
    /// Completes the header of the frame in progress, then routes as much of
    /// its payload as possible. Processes at most one frame and returns how
    /// many bytes of `bytes` were consumed, which is less than all of them
    /// when the frame ends early or the inbound buffer is full.
    pub fn process(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        let mut size = 0;
        self.stalled = false;

        if !self.header.is_complete() {
            size = self.header.parse(bytes)?;
            if !self.header.is_complete() {
                return Ok(size);
            }

            self.begin()?;
        }

        let input = &bytes[size..];
        let input = &input[..input.len().min(self.header.remaining())];
        let offset = self.header.offset();
        let mask = self.header.mask();

        let taken = match &mut self.sink {
            Sink::Stream => {
                let taken = self.stream.push_masked(input, mask, offset);
                self.stalled = taken < input.len();
                taken
            }
            Sink::Message(_) => {
                let start = self.message.len();
                self.message.extend_from_slice(input);
                apply_mask(&mut self.message[start..], mask, offset);
                input.len()
            }
            Sink::Control(_, payload) => {
                let start = payload.len();
                payload.extend_from_slice(input);
                apply_mask(&mut payload[start..], mask, offset);
                input.len()
            }
            Sink::Discard => input.len(),
        };

        self.header.advance(taken);
        size += taken;

        if self.header.is_done() {
            self.finish()?;
        }

        Ok(size)
    }

    /// Resolve the effective opcode of a frame whose header just completed
    /// and pick its sink.
    fn begin(&mut self) -> Result<(), Error> {
        let raw = self.header.opcode();
        let fin = self.header.is_fin();
        let len = self.header.payload_len();

        let opcode = match (raw, self.fragment) {
            (OpCode::Continuation, Some(opcode)) => opcode,
            (OpCode::Continuation, None) => {
                log::debug!("continuation without a message: id={}, len={}", self.id, len);

                self.sink = Sink::Discard;
                return Ok(());
            }
            (opcode, _) => opcode,
        };

        log::trace!(
            "frame: id={}, opcode={:?}, fin={}, len={}",
            self.id,
            opcode,
            fin,
            len
        );

        self.sink = match opcode {
            OpCode::Text | OpCode::Binary => {
                self.fragment = if fin { None } else { Some(opcode) };

                if self.handlers.contains(opcode) {
                    if raw != OpCode::Continuation {
                        self.message.clear();
                    }

                    let size = self.message.len() + len;
                    if size > self.max_message_size {
                        return Err(Error::MessageTooLarge(size));
                    }

                    self.message
                        .try_reserve_exact(len)
                        .map_err(|_| Error::Allocation)?;

                    Sink::Message(opcode)
                } else {
                    Sink::Stream
                }
            }
            OpCode::Close | OpCode::Ping | OpCode::Pong => {
                let mut payload = Vec::new();
                payload
                    .try_reserve_exact(len)
                    .map_err(|_| Error::Allocation)?;

                Sink::Control(opcode, payload)
            }
            _ => {
                log::debug!("unsupported opcode: id={}, opcode={:?}", self.id, opcode);

                Sink::Discard
            }
        };

        Ok(())
    }

    /// Act on a fully received frame and get ready for the next header.
    fn finish(&mut self) -> Result<(), Error> {
        let fin = self.header.is_fin();
        self.header.clear();

        match std::mem::replace(&mut self.sink, Sink::Discard) {
            Sink::Message(opcode) if fin => {
                let message = std::mem::take(&mut self.message);
                if let Some(handler) = self.handlers.get(opcode) {
                    handler(self.id, &message);
                }
            }
            Sink::Control(OpCode::Close, payload) => {
                log::info!("session close requested: id={}", self.id);

                self.send_control(Frame::close(&payload))?;
                self.state = State::Closing;
            }
            Sink::Control(OpCode::Ping, payload) => {
                if self.state != State::Closing {
                    self.send_control(Frame::pong(&payload))?;
                }
            }
            Sink::Control(OpCode::Pong, _) => {
                self.ping_count = 0;
            }
            _ => (),
        }

        Ok(())
    }
}
