use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use codec::mask::unmask_byte;
use parking_lot::Mutex;

use crate::ring::RingBuffer;

/// Claims real-time bytes before they reach the inbound buffer.
///
/// Returns `true` when the byte was consumed. The handler runs on the
/// thread that drives the server and must not install another handler on
/// the stream it is attached to.
///
/// A byte the handler passes on while the inbound buffer is full is offered
/// again once there is room, so returning `false` must have no side
/// effects.
pub type RealtimeHandler = Box<dyn FnMut(u8) -> bool + Send>;

struct Shared {
    rx: Mutex<RingBuffer>,
    tx: Mutex<RingBuffer>,
    realtime: Mutex<Option<RealtimeHandler>>,
    suspended: AtomicBool,
    connected: AtomicBool,
}

/// The character stream of one session.
///
/// This is the interface the application talks to: it reads decoded
/// payload bytes from the inbound buffer and writes response text into the
/// outbound buffer, which the server drains into frames on every poll.
/// Cloning the stream gives another handle to the same buffers, so the
/// application may keep one on another thread.
///
/// Nothing here blocks. Writes return how many bytes fitted and reads
/// return `None` when the buffer is empty.
#[derive(Clone)]
pub struct Stream(Arc<Shared>);

impl Stream {
    pub fn new(rx_size: usize, tx_size: usize) -> Self {
        Self(Arc::new(Shared {
            rx: Mutex::new(RingBuffer::new(rx_size)),
            tx: Mutex::new(RingBuffer::new(tx_size)),
            realtime: Mutex::new(None),
            suspended: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }))
    }

    /// Next inbound byte.
    ///
    /// Always `None` while input is suspended.
    pub fn read_byte(&self) -> Option<u8> {
        if self.0.suspended.load(Ordering::Relaxed) {
            return None;
        }

        self.0.rx.lock().pop()
    }

    pub fn write_str(&self, text: &str) -> usize {
        self.write_bytes(text.as_bytes())
    }

    /// Queue bytes for sending, returns how many were accepted.
    ///
    /// ```
    /// use websocketd_service::Stream;
    ///
    /// let stream = Stream::new(16, 8);
    ///
    /// assert_eq!(stream.write_bytes(b"ok\r\n"), 4);
    /// assert_eq!(stream.write_str("error:1\r\n"), 3);
    /// assert_eq!(stream.tx_count(), 7);
    /// ```
    pub fn write_bytes(&self, bytes: &[u8]) -> usize {
        if !self.is_connected() {
            return 0;
        }

        let mut tx = self.0.tx.lock();
        let size = bytes.len().min(tx.available());
        for byte in &bytes[..size] {
            tx.push(*byte);
        }

        size
    }

    /// Queue a single character, all of its UTF-8 bytes or none.
    pub fn write_char(&self, c: char) -> bool {
        let mut buf = [0u8; 4];
        let bytes = c.encode_utf8(&mut buf).as_bytes();

        if !self.is_connected() {
            return false;
        }

        let mut tx = self.0.tx.lock();
        if tx.available() < bytes.len() {
            return false;
        }

        for byte in bytes {
            tx.push(*byte);
        }

        true
    }

    /// Free space in the inbound buffer.
    pub fn rx_free(&self) -> usize {
        self.0.rx.lock().available()
    }

    pub fn rx_count(&self) -> usize {
        self.0.rx.lock().len()
    }

    /// Bytes waiting to be sent.
    pub fn tx_count(&self) -> usize {
        self.0.tx.lock().len()
    }

    pub fn reset_read_buffer(&self) {
        self.0.rx.lock().flush();
    }

    /// Drop buffered input, the reader sees a single CAN instead.
    pub fn cancel_read_buffer(&self) {
        self.0.rx.lock().cancel();
    }

    /// Suspend or resume reading, returns the new state.
    ///
    /// Input keeps being buffered while reading is suspended.
    pub fn suspend_input(&self, suspend: bool) -> bool {
        self.0.suspended.store(suspend, Ordering::Relaxed);
        suspend
    }

    /// Install a real-time handler, returns the one it replaces.
    pub fn set_realtime_handler(&self, handler: Option<RealtimeHandler>) -> Option<RealtimeHandler> {
        std::mem::replace(&mut *self.0.realtime.lock(), handler)
    }

    /// Whether an inbound byte had to be held back because the buffer was
    /// full.
    pub fn is_overflow(&self) -> bool {
        self.0.rx.lock().is_overflow()
    }

    pub fn clear_overflow(&self) {
        self.0.rx.lock().clear_overflow();
    }

    /// `false` once the session is gone or the stream was detached from
    /// it.
    pub fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::Relaxed)
    }

    /// Unmask payload bytes into the inbound buffer.
    ///
    /// `offset` is the position of `bytes[0]` within the frame payload.
    /// Stops at the first byte that does not fit and returns how many bytes
    /// were taken, real-time bytes claimed by the handler included. The
    /// byte that did not fit has been seen by the handler and is offered to
    /// it again on the retry. A detached stream takes and drops everything.
    pub(crate) fn push_masked(&self, bytes: &[u8], mask: [u8; 4], offset: usize) -> usize {
        if !self.is_connected() {
            return bytes.len();
        }

        for (i, byte) in bytes.iter().enumerate() {
            let byte = unmask_byte(*byte, mask, offset + i);

            if let Some(handler) = self.0.realtime.lock().as_mut() {
                if handler(byte) {
                    continue;
                }
            }

            if !self.0.rx.lock().push(byte) {
                return i;
            }
        }

        bytes.len()
    }

    /// Copy pending outbound bytes without consuming them.
    pub(crate) fn peek_outbound(&self, buf: &mut [u8]) -> usize {
        self.0.tx.lock().peek(buf)
    }

    /// Commit `len` outbound bytes as sent.
    pub(crate) fn consume_outbound(&self, len: usize) {
        self.0.tx.lock().advance(len);
    }

    /// Disconnect the stream from its session and drop both buffers.
    pub(crate) fn detach(&self) {
        self.0.connected.store(false, Ordering::Relaxed);
        self.0.rx.lock().flush();
        self.0.tx.lock().flush();
        self.0.realtime.lock().take();
    }
}
