//! Framing codecs.
//!
//! A codec answers one question: given the unconsumed prefix of the stream,
//! how many bytes does the next frame occupy? `size_of` may fail with
//! `NotEnoughData` (incomplete prefix; the read loop will come back with
//! more bytes) or `Corrupted` (the declared size cannot be valid, fatal for
//! the channel). `read_batch` is the driver loop shared by every codec:
//! repeatedly size, parse, and emit whole frames until the prefix runs dry
//! or the byte budget is spent.

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::view::{Endian, IoView};

pub trait Codec: Clone + Send + 'static {
    /// Size in bytes of the frame starting at `view`, including any header.
    fn size_of(&self, view: &IoView) -> Result<usize>;

    /// Build a packet over the first `size` bytes of `view`.
    fn parse(&self, view: &IoView, size: usize) -> Packet {
        Packet::new(view.clone(), size)
    }

    /// Peel whole frames from `view` and hand them to `emit`, stopping when
    /// the next frame is incomplete or would exceed `max_bytes`. Adds the
    /// bytes peeled to `*consumed`. A `Corrupted` size is returned as-is;
    /// frames already emitted in this batch stay emitted.
    fn read_batch(
        &self,
        view: &IoView,
        max_bytes: usize,
        emit: &mut dyn FnMut(Packet),
        consumed: &mut usize,
    ) -> Result<()> {
        let mut view = view.clone();
        while *consumed < max_bytes {
            let size = match self.size_of(&view) {
                Ok(size) => size,
                Err(err) if err.is_not_enough_data() => break,
                Err(err) => return Err(err),
            };
            if size == 0 {
                return Err(Error::Corrupted {
                    reason: "zero-length frame",
                });
            }
            if *consumed + size > max_bytes {
                break;
            }
            emit(self.parse(&view, size));
            view.consume(size)?;
            *consumed += size;
        }
        Ok(())
    }
}

/// Width of the length prefix of [`LengthCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixWidth {
    U8,
    U16,
    U32,
}

impl PrefixWidth {
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            PrefixWidth::U8 => 1,
            PrefixWidth::U16 => 2,
            PrefixWidth::U32 => 4,
        }
    }
}

/// The default codec: each frame starts with its own total length (prefix
/// included) as a 1-, 2-, or 4-byte integer in the configured byte order.
/// A length smaller than the prefix itself is corrupt.
#[derive(Debug, Clone, Copy)]
pub struct LengthCodec {
    width: PrefixWidth,
    endian: Endian,
}

impl LengthCodec {
    pub fn new(width: PrefixWidth, endian: Endian) -> Self {
        Self { width, endian }
    }

    pub fn u8() -> Self {
        Self::new(PrefixWidth::U8, Endian::Little)
    }

    pub fn u16(endian: Endian) -> Self {
        Self::new(PrefixWidth::U16, endian)
    }

    pub fn u32(endian: Endian) -> Self {
        Self::new(PrefixWidth::U32, endian)
    }
}

impl Default for LengthCodec {
    fn default() -> Self {
        Self::new(PrefixWidth::U16, Endian::Little)
    }
}

impl Codec for LengthCodec {
    fn size_of(&self, view: &IoView) -> Result<usize> {
        let size = match self.width {
            PrefixWidth::U8 => view.read_u8(0)? as usize,
            PrefixWidth::U16 => view.read_u16(0, self.endian)? as usize,
            PrefixWidth::U32 => view.read_u32(0, self.endian)? as usize,
        };
        if size < self.width.bytes() {
            return Err(Error::Corrupted {
                reason: "frame length below the length field itself",
            });
        }
        Ok(size)
    }
}
