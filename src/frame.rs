//! Bounded byte buffers with a read/write cursor.
//!
//! A [`Frame`] is filled with `put_*` calls, flipped with
//! [`Frame::reset_for_reading`] and then drained with `get_*` calls, all
//! without copying. The checked accessors never touch bytes outside the
//! valid region; the `*_unchecked` family trusts the caller and must only
//! follow an explicit [`Frame::has_enough_data`] or
//! [`Frame::has_enough_space`] check.

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::time::Duration;

/// Mask applied to the 24-bit command authentication tag.
pub const MAC_MASK: u32 = 0x00FF_FFFF;

const U24_MAX: u32 = 0x00FF_FFFF;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// Frame is currently handed out by a pool.
        const IN_USE = 0x01;
        /// Frame content has been authenticated.
        const IS_TRUSTED = 0x02;
    }
}

macro_rules! int_accessors {
    ($ty:ty, $put:ident, $put_le:ident, $get:ident, $get_le:ident,
     $put_unchecked:ident, $put_le_unchecked:ident,
     $get_unchecked:ident, $get_le_unchecked:ident) => {
        pub fn $put(&mut self, value: $ty) -> Result<()> {
            self.put_array(value.to_be_bytes())
        }

        pub fn $put_le(&mut self, value: $ty) -> Result<()> {
            self.put_array(value.to_le_bytes())
        }

        pub fn $get(&mut self) -> Result<$ty> {
            self.get_array().map(<$ty>::from_be_bytes)
        }

        pub fn $get_le(&mut self) -> Result<$ty> {
            self.get_array().map(<$ty>::from_le_bytes)
        }

        pub fn $put_unchecked(&mut self, value: $ty) {
            self.put_array_unchecked(value.to_be_bytes())
        }

        pub fn $put_le_unchecked(&mut self, value: $ty) {
            self.put_array_unchecked(value.to_le_bytes())
        }

        pub fn $get_unchecked(&mut self) -> $ty {
            <$ty>::from_be_bytes(self.get_array_unchecked())
        }

        pub fn $get_le_unchecked(&mut self) -> $ty {
            <$ty>::from_le_bytes(self.get_array_unchecked())
        }
    };
}

/// Fixed-capacity byte buffer.
///
/// `capacity` never changes after construction. `length` is the boundary
/// of valid data: it equals `capacity` while writing and is pulled in to
/// the write cursor by [`Frame::reset_for_reading`]. The cursor never
/// passes `length`, so after the flip puts may only overwrite bytes in
/// place.
#[derive(Debug, Clone)]
pub struct Frame {
    buf: Box<[u8]>,
    position: usize,
    length: usize,
    flags: FrameFlags,
    /// Advisory timeout for whoever transmits this frame.
    pub timeout: Option<Duration>,
    /// Advisory retry counter.
    pub retries: u8,
}

impl Frame {
    /// Empty frame ready for writing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            length: capacity,
            flags: FrameFlags::empty(),
            timeout: None,
            retries: 0,
        }
    }

    /// Frame holding `data`, ready for reading.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut frame = Self::with_capacity(data.len());
        frame.buf.copy_from_slice(data);
        frame
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags.insert(flags);
    }

    pub fn clear_flags(&mut self, flags: FrameFlags) {
        self.flags.remove(flags);
    }

    pub fn is_trusted(&self) -> bool {
        self.flags.contains(FrameFlags::IS_TRUSTED)
    }

    /// Bytes left to read before `length`.
    pub fn available_data(&self) -> usize {
        self.length.saturating_sub(self.position)
    }

    /// Bytes left to write before `length`, which is `capacity` until the
    /// frame is flipped for reading.
    pub fn available_space(&self) -> usize {
        self.length.saturating_sub(self.position)
    }

    pub fn has_enough_data(&self, count: usize) -> bool {
        self.available_data() >= count
    }

    pub fn has_enough_space(&self, count: usize) -> bool {
        self.available_space() >= count
    }

    /// Rewinds the cursor for writing.
    pub fn reset(&mut self) {
        self.position = 0;
        self.length = self.capacity();
    }

    /// Marks everything written so far as the readable region and rewinds.
    pub fn reset_for_reading(&mut self) {
        self.length = self.position;
        self.position = 0;
    }

    /// Prepares a reused frame: cursor, boundary and advisory fields are
    /// cleared, trust is revoked.
    pub fn recycle(&mut self) {
        self.reset();
        self.flags.remove(FrameFlags::IS_TRUSTED);
        self.timeout = None;
        self.retries = 0;
    }

    /// Moves the cursor by a signed offset.
    ///
    /// Rewinding is allowed down to 0; going below 0 is `Illegal`. Moving
    /// forward past `length` (`capacity` while writing) is `NoSpace`.
    /// Neither failure moves the cursor.
    pub fn advance(&mut self, offset: isize) -> Result<()> {
        if offset < 0 {
            let back = offset.unsigned_abs();
            if back > self.position {
                return Err(Error::Illegal);
            }
            self.position -= back;
        } else {
            let forward = offset as usize;
            if forward > self.available_space() {
                return Err(Error::NoSpace);
            }
            self.position += forward;
        }
        Ok(())
    }

    /// Bytes written so far (everything before the cursor).
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.position]
    }

    /// Unread bytes between the cursor and `length`.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.position..self.position + self.available_data()]
    }

    /// Writable region between the cursor and `length`. Callers filling it
    /// directly commit with [`Frame::advance`].
    pub fn unwritten_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.position, self.length);
        &mut self.buf[start..end]
    }

    /// Zero-copy view of the next `count` unread bytes; advances past them.
    pub fn take_data(&mut self, count: usize) -> Result<&[u8]> {
        if !self.has_enough_data(count) {
            return Err(Error::NoSpace);
        }
        let start = self.position;
        self.position += count;
        Ok(&self.buf[start..start + count])
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> Result<()> {
        if !self.has_enough_space(data.len()) {
            return Err(Error::NoSpace);
        }
        self.put_bytes_unchecked(data);
        Ok(())
    }

    pub fn put_bytes_unchecked(&mut self, data: &[u8]) {
        let start = self.position;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.position += data.len();
    }

    pub fn get_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        if !self.has_enough_data(out.len()) {
            return Err(Error::NoSpace);
        }
        self.get_bytes_unchecked(out);
        Ok(())
    }

    pub fn get_bytes_unchecked(&mut self, out: &mut [u8]) {
        let start = self.position;
        out.copy_from_slice(&self.buf[start..start + out.len()]);
        self.position += out.len();
    }

    /// Writes `data` as lowercase ASCII hex (two bytes per input byte).
    pub fn put_hex(&mut self, data: &[u8]) -> Result<()> {
        let needed = data.len() * 2;
        if !self.has_enough_space(needed) {
            return Err(Error::NoSpace);
        }
        let start = self.position;
        hex::encode_to_slice(data, &mut self.buf[start..start + needed])
            .map_err(|_| Error::Illegal)?;
        self.position += needed;
        Ok(())
    }

    /// Reads `2 * out.len()` ASCII hex characters into `out`.
    pub fn get_hex(&mut self, out: &mut [u8]) -> Result<()> {
        let needed = out.len() * 2;
        if !self.has_enough_data(needed) {
            return Err(Error::NoSpace);
        }
        let start = self.position;
        hex::decode_to_slice(&self.buf[start..start + needed], out).map_err(|_| Error::Illegal)?;
        self.position += needed;
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_array([value])
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.get_array::<1>().map(|b| b[0])
    }

    pub fn put_u8_unchecked(&mut self, value: u8) {
        self.put_array_unchecked([value]);
    }

    pub fn get_u8_unchecked(&mut self) -> u8 {
        self.get_array_unchecked::<1>()[0]
    }

    pub fn put_i8(&mut self, value: i8) -> Result<()> {
        self.put_array(value.to_be_bytes())
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        self.get_array().map(i8::from_be_bytes)
    }

    /// Big-endian 24-bit write; values above `0xFFFFFF` are `Illegal`.
    pub fn put_u24(&mut self, value: u32) -> Result<()> {
        if value > U24_MAX {
            return Err(Error::Illegal);
        }
        let [_, b0, b1, b2] = value.to_be_bytes();
        self.put_array([b0, b1, b2])
    }

    pub fn put_u24_le(&mut self, value: u32) -> Result<()> {
        if value > U24_MAX {
            return Err(Error::Illegal);
        }
        let [b0, b1, b2, _] = value.to_le_bytes();
        self.put_array([b0, b1, b2])
    }

    pub fn get_u24(&mut self) -> Result<u32> {
        self.get_array::<3>()
            .map(|[b0, b1, b2]| u32::from_be_bytes([0, b0, b1, b2]))
    }

    pub fn get_u24_le(&mut self) -> Result<u32> {
        self.get_array::<3>()
            .map(|[b0, b1, b2]| u32::from_le_bytes([b0, b1, b2, 0]))
    }

    /// Bits above the low 24 are dropped.
    pub fn put_u24_unchecked(&mut self, value: u32) {
        let [_, b0, b1, b2] = value.to_be_bytes();
        self.put_array_unchecked([b0, b1, b2]);
    }

    pub fn put_u24_le_unchecked(&mut self, value: u32) {
        let [b0, b1, b2, _] = value.to_le_bytes();
        self.put_array_unchecked([b0, b1, b2]);
    }

    pub fn get_u24_unchecked(&mut self) -> u32 {
        let [b0, b1, b2] = self.get_array_unchecked::<3>();
        u32::from_be_bytes([0, b0, b1, b2])
    }

    pub fn get_u24_le_unchecked(&mut self) -> u32 {
        let [b0, b1, b2] = self.get_array_unchecked::<3>();
        u32::from_le_bytes([b0, b1, b2, 0])
    }

    int_accessors!(u16, put_u16, put_u16_le, get_u16, get_u16_le,
        put_u16_unchecked, put_u16_le_unchecked, get_u16_unchecked, get_u16_le_unchecked);
    int_accessors!(i16, put_i16, put_i16_le, get_i16, get_i16_le,
        put_i16_unchecked, put_i16_le_unchecked, get_i16_unchecked, get_i16_le_unchecked);
    int_accessors!(u32, put_u32, put_u32_le, get_u32, get_u32_le,
        put_u32_unchecked, put_u32_le_unchecked, get_u32_unchecked, get_u32_le_unchecked);
    int_accessors!(i32, put_i32, put_i32_le, get_i32, get_i32_le,
        put_i32_unchecked, put_i32_le_unchecked, get_i32_unchecked, get_i32_le_unchecked);
    int_accessors!(u64, put_u64, put_u64_le, get_u64, get_u64_le,
        put_u64_unchecked, put_u64_le_unchecked, get_u64_unchecked, get_u64_le_unchecked);
    int_accessors!(f32, put_f32, put_f32_le, get_f32, get_f32_le,
        put_f32_unchecked, put_f32_le_unchecked, get_f32_unchecked, get_f32_le_unchecked);
    int_accessors!(f64, put_f64, put_f64_le, get_f64, get_f64_le,
        put_f64_unchecked, put_f64_le_unchecked, get_f64_unchecked, get_f64_le_unchecked);

    /// Authentication tag over `key || nonce (LE) || unread bytes`: the low
    /// 24 bits of the little-endian word at the start of the MD5 digest.
    pub fn compute_mac(&self, nonce: u32, key: &[u8]) -> u32 {
        let mut context = md5::Context::new();
        context.consume(key);
        context.consume(nonce.to_le_bytes());
        context.consume(self.unread());
        let digest = context.compute().0;
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) & MAC_MASK
    }

    /// `Perm` unless `mac` matches [`Frame::compute_mac`].
    pub fn verify_mac(&self, mac: u32, nonce: u32, key: &[u8]) -> Result<()> {
        if self.compute_mac(nonce, key) == mac & MAC_MASK {
            Ok(())
        } else {
            Err(Error::Perm)
        }
    }

    fn put_array<const N: usize>(&mut self, bytes: [u8; N]) -> Result<()> {
        if !self.has_enough_space(N) {
            return Err(Error::NoSpace);
        }
        self.put_array_unchecked(bytes);
        Ok(())
    }

    fn put_array_unchecked<const N: usize>(&mut self, bytes: [u8; N]) {
        debug_assert!(self.has_enough_space(N), "unchecked put past length");
        let start = self.position;
        self.buf[start..start + N].copy_from_slice(&bytes);
        self.position += N;
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        if !self.has_enough_data(N) {
            return Err(Error::NoSpace);
        }
        Ok(self.get_array_unchecked())
    }

    fn get_array_unchecked<const N: usize>(&mut self) -> [u8; N] {
        debug_assert!(self.has_enough_data(N), "unchecked get past length");
        let start = self.position;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[start..start + N]);
        self.position += N;
        out
    }
}

/// Copies every unread byte of `src` into `dst`.
///
/// Copies as much as fits; `NoSpace` if `dst` filled up before `src` was
/// exhausted. Both cursors advance by the amount copied.
pub fn transfer(dst: &mut Frame, src: &mut Frame) -> Result<()> {
    let pending = src.available_data();
    let copied = copy_between(dst, src, pending);
    if copied < pending {
        return Err(Error::NoSpace);
    }
    Ok(())
}

/// Copies up to `count` unread bytes of `src` into `dst`.
///
/// `NoSpace` if `dst` ran out of room first, `Partial` if `src` held fewer
/// than `count` bytes. The copied prefix stays in place either way.
pub fn transfer_count(dst: &mut Frame, src: &mut Frame, count: usize) -> Result<()> {
    let copied = copy_between(dst, src, count);
    if copied == count {
        Ok(())
    } else if dst.available_space() == 0 {
        Err(Error::NoSpace)
    } else {
        Err(Error::Partial)
    }
}

fn copy_between(dst: &mut Frame, src: &mut Frame, count: usize) -> usize {
    let n = count.min(src.available_data()).min(dst.available_space());
    let start = src.position;
    dst.put_bytes_unchecked(&src.buf[start..start + n]);
    src.position += n;
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_tracks_reading_boundary() {
        let mut frame = Frame::with_capacity(8);
        frame.put_u16(0xBEEF).unwrap();
        frame.reset_for_reading();
        assert_eq!(frame.unread(), &[0xBE, 0xEF]);
        frame.get_u8().unwrap();
        assert_eq!(frame.unread(), &[0xEF]);
    }

    #[test]
    fn test_recycle_revokes_trust() {
        let mut frame = Frame::with_capacity(4);
        frame.set_flags(FrameFlags::IS_TRUSTED | FrameFlags::IN_USE);
        frame.retries = 3;
        frame.recycle();
        assert!(!frame.is_trusted());
        assert!(frame.flags().contains(FrameFlags::IN_USE));
        assert_eq!(frame.retries, 0);
        assert_eq!(frame.available_space(), 4);
    }
}
