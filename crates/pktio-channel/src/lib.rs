//! # pktio-channel — framed TCP channels on an event-driven reactor
//!
//! A [`Channel`] frames length-prefixed packets over one TCP stream:
//!
//! - **Ingress**: the reactor reads socket bytes straight into a shared
//!   arena; the codec peels whole packets out of it as zero-copy views and
//!   hands them to the registered read handler.
//! - **Egress**: `write()` may be called from any thread. Requests go into
//!   a per-CPU lock-free ring and an eventfd wakes the reactor, which
//!   coalesces small buffers and issues vectored writes.
//!
//! [`Listener`] and [`Client`] host channels: each owns a reactor (a mio
//! poll) and runs its event loop on the calling thread. All channel
//! callbacks run serially on that thread; handlers may call `write()` and
//! `close()` but nothing else re-entrantly.
//!
//! ```no_run
//! use pktio_channel::{Listener, LengthCodec};
//!
//! let mut listener = Listener::new(LengthCodec::u8()).unwrap();
//! listener.on_accept(|chan| {
//!     chan.on_read(|chan, packet| {
//!         // Echo the frame back; the arena handle rides along unchanged.
//!         chan.write(packet);
//!     });
//! });
//! listener.listen("127.0.0.1", 9000).unwrap();
//! ```

pub mod channel;
pub mod client;
pub mod listener;
pub mod reactor;
pub mod signal;
mod wake;

pub use channel::{Channel, COPY_THRESH, IOV_MAX, MAX_READ_SIZE, OUT_BUF_SIZE, VECTOR_SIZE};
pub use client::Client;
pub use listener::{Listener, BACKLOG};
pub use reactor::StopHandle;

// The data-plane types callers need alongside a channel.
pub use pktio_core::{Codec, Endian, Error, IoView, LengthCodec, Packet, PrefixWidth, Result};
