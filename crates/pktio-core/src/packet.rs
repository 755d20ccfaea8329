//! `Packet` — a framed message: a view plus its codec-declared length.
//!
//! The payload bytes live in the view's arena; the packet itself is a cheap
//! value. Packets peeled from a stream keep their (possibly rotated-out)
//! ingress arena alive through the view's handle.

use crate::error::Result;
use crate::vector::{IoVec, SharedIoVec};
use crate::view::IoView;
use std::sync::Arc;

#[derive(Clone)]
pub struct Packet {
    view: IoView,
    size: usize,
}

impl Packet {
    /// Wrap the first `size` bytes of `view` as a packet.
    pub fn new(view: IoView, size: usize) -> Self {
        Self { view, size }
    }

    /// Allocate a fresh zero-filled single-frame arena for an outgoing
    /// packet of `size` bytes.
    pub fn alloc(size: usize) -> Self {
        let vec: SharedIoVec = Arc::new(IoVec::new_zeroed(size));
        Self {
            view: IoView::new(vec, 0),
            size,
        }
    }

    /// The frame length in bytes, as declared by the codec (or requested at
    /// allocation time).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn view(&self) -> &IoView {
        &self.view
    }

    #[inline]
    pub fn view_mut(&mut self) -> &mut IoView {
        &mut self.view
    }

    /// The metadata tag of the backing arena; for ingress packets this is
    /// the id of the channel that read them.
    #[inline]
    pub fn metadata(&self) -> u64 {
        self.view.metadata()
    }

    /// Embed another packet's bytes at `offset`. Overlap within one arena is
    /// legal; bytes move as with `memmove`.
    pub fn write_packet(&mut self, offset: usize, src: &Packet) -> Result<()> {
        let len = src.size;
        self.view.write_view(offset, &src.view, len)
    }

    /// Decompose into the arena handle, the view offset, and the size.
    /// Used by the channel to build an egress descriptor.
    pub fn into_parts(self) -> (SharedIoVec, usize, usize) {
        let size = self.size;
        let (vec, offset) = self.view.into_parts();
        (vec, offset, size)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.size)
            .field("metadata", &self.metadata())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::Endian;

    #[test]
    fn alloc_and_fields() {
        let mut p = Packet::alloc(4);
        assert_eq!(p.size(), 4);
        p.view_mut().write_u8(0, 4).unwrap();
        p.view_mut().write_u8(1, 9).unwrap();
        p.view_mut().write_u16(2, 0x0102, Endian::Big).unwrap();
        assert_eq!(p.view().read_u8(1).unwrap(), 9);
        assert_eq!(p.view().read_u16(2, Endian::Big).unwrap(), 0x0102);
    }

    #[test]
    fn into_parts_keeps_arena_alive() {
        let p = Packet::alloc(2);
        let (vec, offset, size) = p.into_parts();
        assert_eq!(offset, 0);
        assert_eq!(size, 2);
        assert_eq!(vec.size(), 2);
    }

    #[test]
    fn nested_write() {
        let mut inner = Packet::alloc(3);
        inner.view_mut().write_bytes(0, &[7, 8, 9]).unwrap();
        let mut outer = Packet::alloc(8);
        outer.write_packet(4, &inner).unwrap();
        assert_eq!(outer.view().read_bytes(4, 3).unwrap(), &[7, 8, 9]);
    }
}
