/// Mask or unmask a slice of frame payload in place.
///
/// `offset` is the position of `buf[0]` within the whole frame payload, so a
/// payload that arrives in several chunks is unmasked exactly as if it had
/// arrived in one piece: byte `i` of the payload is always XORed with
/// `mask[i % 4]`.
///
/// # Test
///
/// ```
/// use websocketd_codec::mask::apply_mask;
///
/// let mask = [0x37, 0xfa, 0x21, 0x3d];
/// let mut whole = *b"Hello";
/// apply_mask(&mut whole, mask, 0);
/// assert_eq!(whole, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
///
/// let mut split = *b"Hello";
/// let (head, tail) = split.split_at_mut(3);
/// apply_mask(head, mask, 0);
/// apply_mask(tail, mask, 3);
/// assert_eq!(split, whole);
/// ```
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    let mask = rotate(mask, offset);
    let mut chunks = buf.chunks_exact_mut(4);

    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            ^ u32::from_ne_bytes(mask);

        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i];
    }
}

/// Unmask a single payload byte found at `offset` within the frame payload.
#[inline(always)]
pub fn unmask_byte(byte: u8, mask: [u8; 4], offset: usize) -> u8 {
    byte ^ mask[offset & 3]
}

#[inline(always)]
fn rotate(mask: [u8; 4], offset: usize) -> [u8; 4] {
    let shift = offset & 3;
    [
        mask[shift],
        mask[(shift + 1) & 3],
        mask[(shift + 2) & 3],
        mask[(shift + 3) & 3],
    ]
}
