//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16)              |
//! |N|V|V|V|       |S|             |   (if payload len==126)       |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                    Masking-key, if MASK set to 1              |
//! +-------------------------------+-------------------------------+
//! |                          Payload Data                         |
//! +---------------------------------------------------------------+
//!
//! Only the 7-bit and 16-bit length forms are implemented. A length code of
//! 127 (64-bit extended length) is rejected in both directions, so a single
//! frame never carries more than 65535 bytes of payload.

use bytes::{BufMut, BytesMut};

use crate::{Error, mask::apply_mask};

/// Largest header the parser will ever hold: 2 base bytes, up to 8 bytes of
/// extended length and 4 mask bytes.
pub const MAX_HEADER_SIZE: usize = 14;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

const FIN: u8 = 0x80;
const RSV: u8 = 0x70;
const OPCODE: u8 = 0x0F;
const MASKED: u8 = 0x80;
const LENGTH: u8 = 0x7F;

const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;

/// WebSocket frame opcode.
///
/// [RFC6455 Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8)
///
/// Reserved values are kept as they are, the payload processor discards
/// frames carrying them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    /// Close, Ping or Pong.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Text or Binary.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value & OPCODE {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(value) => value & OPCODE,
        }
    }
}

/// Read the FIN bit of the first header byte.
#[inline(always)]
pub fn is_fin(token: u8) -> bool {
    token & FIN != 0
}

/// Read the three reserved bits of the first header byte.
#[inline(always)]
pub fn rsv(token: u8) -> u8 {
    (token & RSV) >> 4
}

/// Build the first header byte.
///
/// # Test
///
/// ```
/// use websocketd_codec::frame::*;
///
/// assert_eq!(frame_start(true, OpCode::Text), 0x81);
/// assert_eq!(frame_start(true, OpCode::Binary), 0x82);
/// assert_eq!(frame_start(false, OpCode::Text), 0x01);
/// assert_eq!(frame_start(true, OpCode::Ping), 0x89);
/// ```
#[inline(always)]
pub fn frame_start(fin: bool, opcode: OpCode) -> u8 {
    (if fin { FIN } else { 0 }) | u8::from(opcode)
}

/// Size of the header the encoder writes for an unmasked payload of `len`
/// bytes.
///
/// # Test
///
/// ```
/// use websocketd_codec::frame::header_size;
///
/// assert_eq!(header_size(0), 2);
/// assert_eq!(header_size(125), 2);
/// assert_eq!(header_size(126), 4);
/// assert_eq!(header_size(65535), 4);
/// ```
pub fn header_size(len: usize) -> usize {
    if len < LENGTH_16 as usize { 2 } else { 4 }
}

/// Incrementally parsed header of an incoming frame.
///
/// Bytes are fed with [`FrameHeader::parse`] in whatever pieces the network
/// delivers them. Parsing resumes at exactly the next byte on every call and
/// earlier bytes are never looked at again. Once complete the header stays
/// untouched until [`FrameHeader::clear`], only the remaining payload counter
/// moves.
///
/// Client frames are always masked, so four mask bytes always follow the
/// length: a complete header is 6 bytes long, or 8 with a 16-bit length.
#[derive(Debug, Clone, Default)]
pub struct FrameHeader {
    data: [u8; MAX_HEADER_SIZE],
    len: usize,
    payload_len: usize,
    remaining: usize,
    mask: [u8; 4],
    complete: bool,
}

impl FrameHeader {
    /// Consume header bytes from `bytes`, returns how many were taken.
    ///
    /// Stops as soon as the header is complete, any following payload bytes
    /// are left to the caller.
    ///
    /// # Test
    ///
    /// ```
    /// use websocketd_codec::frame::*;
    ///
    /// let bytes = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f];
    ///
    /// let mut header = FrameHeader::default();
    /// assert_eq!(header.parse(&bytes[..3]).unwrap(), 3);
    /// assert!(!header.is_complete());
    ///
    /// assert_eq!(header.parse(&bytes[3..]).unwrap(), 3);
    /// assert!(header.is_complete());
    /// assert!(header.is_fin());
    /// assert_eq!(header.opcode(), OpCode::Text);
    /// assert_eq!(header.payload_len(), 5);
    /// assert_eq!(header.remaining(), 5);
    /// assert_eq!(header.mask(), [0x37, 0xfa, 0x21, 0x3d]);
    /// ```
    pub fn parse(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        let mut taken = 0;

        while !self.complete && taken < bytes.len() {
            self.data[self.len] = bytes[taken];
            self.len += 1;
            taken += 1;

            if self.len == 2 {
                let code = self.data[1] & LENGTH;
                if code == LENGTH_64 {
                    return Err(Error::UnsupportedPayloadLength(code as usize));
                }

                self.payload_len = code as usize;
            }

            if self.len >= 2 && self.len == self.required() {
                self.complete();
            }
        }

        Ok(taken)
    }

    fn required(&self) -> usize {
        if self.data[1] & LENGTH == LENGTH_16 { 8 } else { 6 }
    }

    fn complete(&mut self) {
        let mask_offset = if self.data[1] & LENGTH == LENGTH_16 {
            self.payload_len = u16::from_be_bytes([self.data[2], self.data[3]]) as usize;
            4
        } else {
            2
        };

        self.mask.copy_from_slice(&self.data[mask_offset..mask_offset + 4]);
        self.remaining = self.payload_len;
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The header is complete and every payload byte has been consumed.
    pub fn is_done(&self) -> bool {
        self.complete && self.remaining == 0
    }

    pub fn is_fin(&self) -> bool {
        is_fin(self.data[0])
    }

    pub fn rsv(&self) -> u8 {
        rsv(self.data[0])
    }

    pub fn opcode(&self) -> OpCode {
        OpCode::from(self.data[0])
    }

    /// The mask bit of the second header byte. Clients always set it.
    pub fn is_masked(&self) -> bool {
        self.data[1] & MASKED != 0
    }

    pub fn mask(&self) -> [u8; 4] {
        self.mask
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Offset of the next payload byte within the frame payload.
    pub fn offset(&self) -> usize {
        self.payload_len - self.remaining
    }

    /// Raw header bytes collected so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Account for `len` payload bytes having been processed.
    pub fn advance(&mut self, len: usize) {
        assert!(len <= self.remaining);

        self.remaining -= len;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A single outgoing WebSocket frame.
///
/// Frames written by the server are not masked. A mask can still be given to
/// produce client frames, which is what the tests and the benchmarks feed back
/// into [`FrameHeader`].
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// A final, unmasked frame.
    pub fn new(opcode: OpCode, payload: &'a [u8]) -> Self {
        Self {
            fin: true,
            mask: None,
            opcode,
            payload,
        }
    }

    pub fn text(payload: &'a [u8]) -> Self {
        Self::new(OpCode::Text, payload)
    }

    pub fn binary(payload: &'a [u8]) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    pub fn ping(payload: &'a [u8]) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    pub fn pong(payload: &'a [u8]) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    pub fn close(payload: &'a [u8]) -> Self {
        Self::new(OpCode::Close, payload)
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Total size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        let mask = if self.mask.is_some() { 4 } else { 0 };

        header_size(self.payload.len()) + mask + self.payload.len()
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use websocketd_codec::frame::*;
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// Frame::text(b"Hi").encode(&mut bytes).unwrap();
    /// assert_eq!(&bytes[..], &[0x81, 0x02, b'H', b'i']);
    ///
    /// bytes.clear();
    /// Frame::binary(&[0u8; 300]).encode(&mut bytes).unwrap();
    /// assert_eq!(&bytes[..4], &[0x82, 126, 0x01, 0x2c]);
    /// assert_eq!(bytes.len(), 304);
    ///
    /// assert!(Frame::binary(&vec![0u8; 65536]).encode(&mut bytes).is_err());
    /// ```
    pub fn encode(self, bytes: &mut BytesMut) -> Result<(), Error> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(Error::UnsupportedPayloadLength(len));
        }

        bytes.reserve(self.encoded_len());
        bytes.put_u8(frame_start(self.fin, self.opcode));

        let masked = if self.mask.is_some() { MASKED } else { 0 };
        if len < LENGTH_16 as usize {
            bytes.put_u8(masked | len as u8);
        } else {
            bytes.put_u8(masked | LENGTH_16);
            bytes.put_u16(len as u16);
        }

        let index = match self.mask {
            Some(mask) => {
                bytes.put_slice(&mask);
                bytes.len()
            }
            None => bytes.len(),
        };

        bytes.put_slice(self.payload);

        if let Some(mask) = self.mask {
            apply_mask(&mut bytes[index..], mask, 0);
        }

        Ok(())
    }
}
