use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::Rid;

/// Fixed-width little-endian encoding for index keys and values.
///
/// Bucket pages store raw `(key, value)` slots at fixed offsets, so every
/// key and value type must occupy a known number of bytes. The bucket
/// capacity is derived from `ENCODED_SIZE` at index construction time.
pub trait FixedCodec: Sized + Clone + PartialEq + std::fmt::Debug {
    const ENCODED_SIZE: usize;

    /// Write `self` into `buf`, which is exactly `ENCODED_SIZE` bytes.
    fn encode(&self, buf: &mut [u8]);

    /// Read a value back from `buf`, which is exactly `ENCODED_SIZE` bytes.
    fn decode(buf: &[u8]) -> Self;

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ENCODED_SIZE];
        self.encode(&mut buf);
        buf
    }
}

impl FixedCodec for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

impl FixedCodec for i32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl FixedCodec for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}

impl FixedCodec for Rid {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.page_id);
        LittleEndian::write_u32(&mut buf[4..8], self.slot_num);
    }

    fn decode(buf: &[u8]) -> Self {
        Rid {
            page_id: LittleEndian::read_u32(&buf[0..4]),
            slot_num: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}
