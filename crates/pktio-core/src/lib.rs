//! # pktio-core — arenas, views, packets, and framing codecs
//!
//! The data-plane types every other pktio crate builds on:
//!
//! - [`IoVec`] — a reference-counted byte arena. Many packet views can share
//!   one arena, so decoding a stream never copies payload bytes.
//! - [`IoView`] — a two-word `(arena, offset)` cursor with bounds-checked,
//!   endian-aware typed access.
//! - [`Packet`] — a view plus the frame length the codec declared for it.
//! - [`Codec`] — the framing contract: given the unconsumed prefix of a
//!   stream, say how long the next frame is. [`LengthCodec`] is the default
//!   length-prefixed implementation.
//!
//! Nothing in this crate does I/O. The channel crate owns sockets and
//! drives these types from its reactor thread.

pub mod codec;
pub mod error;
pub mod packet;
pub mod vector;
pub mod view;

pub use codec::{Codec, LengthCodec, PrefixWidth};
pub use error::{Error, Result};
pub use packet::Packet;
pub use vector::{make_shared_io_vec, IoVec, SharedIoVec};
pub use view::{Endian, IoView};
