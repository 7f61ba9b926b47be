/// ASCII CAN, left in a cancelled buffer so the reader drops the current
/// line.
pub const CAN: u8 = 0x18;

/// Fixed-size circular byte buffer.
///
/// The size is rounded up to a power of two and one slot is always kept
/// free, so a buffer of size `n` holds at most `n - 1` bytes. A push into a
/// full buffer is refused and raises the sticky overflow flag, bytes already
/// buffered are never overwritten.
///
/// ```
/// use websocketd_service::ring::RingBuffer;
///
/// let mut ring = RingBuffer::new(4);
///
/// assert_eq!(ring.capacity(), 3);
/// assert!(ring.push(1));
/// assert!(ring.push(2));
/// assert!(ring.push(3));
/// assert!(!ring.push(4));
/// assert!(ring.is_overflow());
///
/// assert_eq!(ring.pop(), Some(1));
/// assert_eq!(ring.len(), 2);
/// assert_eq!(ring.available(), 1);
/// ```
pub struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
    overflow: bool,
}

impl RingBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size.max(2).next_power_of_two()].into_boxed_slice(),
            overflow: false,
            head: 0,
            tail: 0,
        }
    }

    #[inline(always)]
    fn next(&self, index: usize) -> usize {
        (index + 1) & (self.data.len() - 1)
    }

    /// Number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.data.len() - 1
    }

    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail) & (self.data.len() - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Free space left.
    pub fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn push(&mut self, byte: u8) -> bool {
        let next = self.next(self.head);
        if next == self.tail {
            self.overflow = true;
            return false;
        }

        self.data[self.head] = byte;
        self.head = next;
        true
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }

        let byte = self.data[self.tail];
        self.tail = self.next(self.tail);
        Some(byte)
    }

    /// Copy buffered bytes into `buf` without consuming them.
    ///
    /// ```
    /// use websocketd_service::ring::RingBuffer;
    ///
    /// let mut ring = RingBuffer::new(8);
    /// for byte in b"abcdef" {
    ///     ring.push(*byte);
    /// }
    ///
    /// ring.advance(4);
    /// for byte in b"ghi" {
    ///     ring.push(*byte);
    /// }
    ///
    /// let mut buf = [0u8; 8];
    /// assert_eq!(ring.peek(&mut buf), 5);
    /// assert_eq!(&buf[..5], b"efghi");
    ///
    /// ring.advance(2);
    /// assert_eq!(ring.pop(), Some(b'g'));
    /// ```
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        let size = buf.len().min(self.len());
        let first = size.min(self.data.len() - self.tail);

        buf[..first].copy_from_slice(&self.data[self.tail..self.tail + first]);
        buf[first..size].copy_from_slice(&self.data[..size - first]);
        size
    }

    /// Drop `len` bytes from the read side, at most what is buffered.
    pub fn advance(&mut self, len: usize) {
        let len = len.min(self.len());
        self.tail = (self.tail + len) & (self.data.len() - 1);
    }

    /// Discard everything buffered.
    pub fn flush(&mut self) {
        self.tail = self.head;
    }

    /// Discard everything buffered and leave a single [`CAN`] behind.
    ///
    /// ```
    /// use websocketd_service::ring::{CAN, RingBuffer};
    ///
    /// let mut ring = RingBuffer::new(8);
    /// ring.push(b'G');
    /// ring.push(b'0');
    /// ring.cancel();
    ///
    /// assert_eq!(ring.pop(), Some(CAN));
    /// assert_eq!(ring.pop(), None);
    /// ```
    pub fn cancel(&mut self) {
        self.data[self.head] = CAN;
        self.tail = self.head;
        self.head = self.next(self.head);
    }

    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    pub fn clear_overflow(&mut self) {
        self.overflow = false;
    }
}
