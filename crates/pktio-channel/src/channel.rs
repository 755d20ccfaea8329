//! The packet channel: framing, egress coalescing, and lifecycle.
//!
//! A channel is split along the thread boundary:
//!
//! - [`Channel`] is the cheap-clone public handle. It owns everything that
//!   other threads may touch: the per-CPU egress ring, the `closed` and
//!   wake-debounce flags, the eventfd wake handles, and the registered
//!   handlers. `write()` and `close()` are callable from any thread.
//! - [`ChannelIo`] is reactor-thread-only: the socket, the current ingress
//!   arena with its `written`/`consumed` cursors, and the egress staging
//!   area. The reactor owns it and drives it from poll events.
//!
//! # Ingress
//!
//! Socket bytes land directly in the current arena at `written`. The codec
//! is then asked to peel whole packets from the `consumed..written` window,
//! at most `MAX_READ_SIZE` bytes per pass so one busy connection cannot
//! starve the rest of the loop. Each peeled packet is a view into the
//! arena, never a payload copy. When the arena is nearly exhausted
//! (`consumed >= 3/4 * VECTOR_SIZE` and no free space left) a fresh arena
//! is allocated and the unconsumed tail moves to its front; packets peeled
//! earlier keep the old arena alive through their views.
//!
//! # Egress
//!
//! `write()` publishes an [`EgressSlot`] into the producer CPU's ring and
//! wakes the reactor (debounced by `write_wake_pending`). The drain pass
//! pulls slots into a staging area of at most `IOV_MAX` entries, merges a
//! run of small trailing buffers into one arena when the run exceeds
//! `COPY_THRESH`, and hands the lot to a non-blocking vectored write.
//! Fully-written descriptors are dropped from staging; a partially-written
//! head descriptor is adjusted in place and retried next pass.
//!
//! A closed channel does not flush: slots still queued at close time are
//! discarded by the next drain pass. Callers that need a flush must drain
//! before calling `close()`.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, warn};

use pktio_core::{Codec, Error, IoVec, IoView, Packet, Result, SharedIoVec};
use pktio_ring::PerCpuRing;

use crate::wake::WakeFd;

/// Ingress arena allocation size. Header plus payload stay within a
/// 128 KiB allocator block.
pub const VECTOR_SIZE: usize = 128 * 1024 - 8;

/// Upper bound on bytes handed to the codec per reactor callback.
pub const MAX_READ_SIZE: usize = 64 * 1024;

/// Egress buffers at or below this size are candidates for tail merging.
pub const COPY_THRESH: usize = 128;

/// Default per-CPU egress queue capacity (slots, rounded to a power of two).
pub const OUT_BUF_SIZE: usize = 1 << 22;

/// Upper bound on scatter entries in one vectored write.
pub const IOV_MAX: usize = libc::UIO_MAXIOV as usize;

/// Rotate the ingress arena once this much of it has been consumed and no
/// free space remains.
const EXPAND_THRESHOLD: usize = 3 * VECTOR_SIZE / 4;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type ReadHandler = Box<dyn FnMut(&Channel, Packet) + Send>;
type EventHandler = Box<dyn FnMut(&Channel) + Send>;

#[derive(Default)]
pub(crate) struct Handlers {
    pub(crate) on_read: Option<ReadHandler>,
    pub(crate) on_error: Option<EventHandler>,
    pub(crate) on_close: Option<EventHandler>,
}

/// One queued write request: a byte range plus the arena handle that keeps
/// it alive until the bytes have left the socket.
pub(crate) struct EgressSlot {
    pub(crate) vec: SharedIoVec,
    pub(crate) off: usize,
    pub(crate) len: usize,
}

impl EgressSlot {
    /// The unwritten byte range of this slot.
    ///
    /// Safety of the underlying access: the producer finished writing these
    /// bytes before publishing the slot into the ring, and nothing mutates
    /// them afterwards.
    fn bytes(&self) -> &[u8] {
        unsafe { self.vec.slice(self.off, self.len) }
    }
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) out: PerCpuRing<EgressSlot>,
    pub(crate) closed: AtomicBool,
    pub(crate) write_wake_pending: AtomicBool,
    pub(crate) write_wake: WakeFd,
    pub(crate) close_wake: WakeFd,
    pub(crate) handlers: Mutex<Handlers>,
}

/// Shared handle to a packet channel. Clones are cheap; the channel lives
/// until every handle (user handles, the reactor's registration, in-flight
/// callbacks) is gone.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<Shared>,
}

impl Channel {
    pub(crate) fn new(out_buf_size: usize) -> io::Result<Self> {
        let shared = Shared {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            out: PerCpuRing::new(out_buf_size),
            closed: AtomicBool::new(false),
            write_wake_pending: AtomicBool::new(false),
            write_wake: WakeFd::new()?,
            close_wake: WakeFd::new()?,
            handlers: Mutex::new(Handlers::default()),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Opaque identifier, stable for the channel's lifetime.
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Queue a packet for asynchronous send. Ownership of the packet's
    /// arena moves into the egress queue.
    ///
    /// Returns `false` when the channel is closed or the egress queue on
    /// the calling CPU is full; the caller decides whether to retry, drop,
    /// or apply backpressure.
    pub fn write(&self, packet: Packet) -> bool {
        if self.is_closed() {
            return false;
        }

        let (vec, off, len) = packet.into_parts();
        let slot = EgressSlot { vec, off, len };
        if self.shared.out.try_write(slot).is_err() {
            warn!(
                channel = self.shared.id,
                queued = self.shared.out.guess_size(),
                "egress queue full, dropping write"
            );
            return false;
        }

        // Debounce the reactor wake: the contract is at least one drain per
        // successful write, and the reactor clears the flag at the start of
        // each drain pass. swap() is an RMW, so it cannot read a stale
        // `true` across the reactor's clear.
        if !self.shared.write_wake_pending.swap(true, Ordering::AcqRel) {
            self.shared.write_wake.wake();
        }
        true
    }

    /// Begin shutdown. Idempotent and callable from any thread; pending
    /// egress is discarded, not flushed. The read handler stops being
    /// invoked immediately; on-close fires once, on the reactor thread.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_wake.wake();
    }

    /// Register the packet handler. Runs on the reactor thread.
    pub fn on_read(&self, handler: impl FnMut(&Channel, Packet) + Send + 'static) {
        self.shared.handlers.lock().on_read = Some(Box::new(handler));
    }

    /// Register the fatal-error handler. Runs on the reactor thread, once,
    /// before the close handler.
    pub fn on_error(&self, handler: impl FnMut(&Channel) + Send + 'static) {
        self.shared.handlers.lock().on_error = Some(Box::new(handler));
    }

    /// Register the close handler. Runs on the reactor thread, exactly once
    /// per channel no matter how often `close()` is called.
    pub fn on_close(&self, handler: impl FnMut(&Channel) + Send + 'static) {
        self.shared.handlers.lock().on_close = Some(Box::new(handler));
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Take a handler out of the registry, run it, and put it back (unless the
/// callback registered a replacement). Taking it out keeps the mutex
/// unlocked while user code runs.
fn invoke_read_handler(chan: &Channel, packet: Packet) {
    let taken = chan.shared.handlers.lock().on_read.take();
    if let Some(mut handler) = taken {
        handler(chan, packet);
        let mut handlers = chan.shared.handlers.lock();
        if handlers.on_read.is_none() {
            handlers.on_read = Some(handler);
        }
    }
}

fn invoke_error_handler(chan: &Channel) {
    let taken = chan.shared.handlers.lock().on_error.take();
    if let Some(mut handler) = taken {
        handler(chan);
        let mut handlers = chan.shared.handlers.lock();
        if handlers.on_error.is_none() {
            handlers.on_error = Some(handler);
        }
    }
}

fn invoke_close_handler(chan: &Channel) {
    let taken = chan.shared.handlers.lock().on_close.take();
    if let Some(mut handler) = taken {
        handler(chan);
        let mut handlers = chan.shared.handlers.lock();
        if handlers.on_close.is_none() {
            handlers.on_close = Some(handler);
        }
    }
}

/// Reactor-side state of one channel. Everything here is touched only by
/// the reactor thread that owns the poll the channel is registered with.
pub(crate) struct ChannelIo<C: Codec> {
    pub(crate) stream: TcpStream,
    pub(crate) connecting: bool,
    chan: Channel,
    codec: C,

    /// Current ingress arena; `None` until the first read.
    vec: Option<SharedIoVec>,
    /// Bytes received into the current arena.
    written: usize,
    /// Bytes of the current arena already handed to the codec.
    consumed: usize,

    /// Slots pulled from the ring but not yet fully written.
    staging: VecDeque<EgressSlot>,
    /// Round-robin cursor over the per-CPU queues.
    cursor: usize,
    close_fired: bool,
}

impl<C: Codec> ChannelIo<C> {
    pub(crate) fn new(stream: TcpStream, chan: Channel, codec: C, connecting: bool) -> Self {
        Self {
            stream,
            connecting,
            chan,
            codec,
            vec: None,
            written: 0,
            consumed: 0,
            staging: VecDeque::new(),
            cursor: 0,
            close_fired: false,
        }
    }

    #[inline]
    pub(crate) fn chan(&self) -> &Channel {
        &self.chan
    }

    // ── Ingress ──────────────────────────────────────────────────────

    /// Drain the socket. Called on a read-ready event; reads until
    /// `WouldBlock` because readiness is edge-triggered.
    pub(crate) fn on_readable(&mut self) -> Result<()> {
        loop {
            let (ptr, cap) = self.allocate_read_buf();
            if cap == 0 {
                // Arena full but not yet eligible for rotation. Give the
                // codec a chance to consume, which may unlock rotation.
                self.read_packets(0)?;
                let (_, cap) = self.allocate_read_buf();
                if cap == 0 {
                    // Still no room: the pending frame can never be
                    // completed within this arena, so it is unfulfillable.
                    // Fatal, like any other absurd frame size.
                    return Err(Error::Corrupted {
                        reason: "frame cannot fit the ingress arena",
                    });
                }
                continue;
            }

            // Safety: [written, written + cap) of the current arena belongs
            // to the reactor thread; no view reaches past `consumed`.
            let buf = unsafe { std::slice::from_raw_parts_mut(ptr, cap) };
            match self.stream.read(buf) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )));
                }
                Ok(n) => self.read_packets(n)?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Account `size` freshly received bytes and peel packets until the
    /// codec makes no more progress. Runs an egress pass afterwards so
    /// writes amortize against reads.
    pub(crate) fn read_packets(&mut self, size: usize) -> Result<()> {
        if self.chan.shared.handlers.lock().on_read.is_none() || self.chan.is_closed() {
            // Nobody to deliver to: the bytes of this callback are dropped.
            return Ok(());
        }

        let Some(vec) = self.vec.clone() else {
            return Ok(());
        };
        self.written += size;
        debug_assert!(self.written <= vec.size());

        loop {
            debug_assert!(self.consumed <= self.written);
            let available = (self.written - self.consumed).min(MAX_READ_SIZE);
            let view = IoView::new(vec.clone(), self.consumed);
            let chan = &self.chan;
            let mut consumed_now = 0;
            let result = self.codec.read_batch(
                &view,
                available,
                &mut |packet| invoke_read_handler(chan, packet),
                &mut consumed_now,
            );
            self.consumed += consumed_now;
            result?;
            if consumed_now == 0 {
                break;
            }
        }

        self.write_packets(IOV_MAX);
        Ok(())
    }

    /// Pick the region of the current arena for the next socket read,
    /// rotating to a fresh arena first when the old one is spent.
    fn allocate_read_buf(&mut self) -> (*mut u8, usize) {
        if self.vec.is_none() || self.should_rotate() {
            self.rotate_vector();
        }
        // Rotation above guarantees the arena exists.
        let vec = match &self.vec {
            Some(vec) => vec,
            None => unreachable!("rotate_vector always installs an arena"),
        };
        debug_assert!(self.written <= vec.size());
        let len = (vec.size() - self.written).min(VECTOR_SIZE);
        let ptr = unsafe { vec.as_ptr().add(self.written) };
        (ptr, len)
    }

    fn should_rotate(&self) -> bool {
        if self.consumed < EXPAND_THRESHOLD {
            return false;
        }
        match &self.vec {
            Some(vec) => self.written == vec.size(),
            None => false,
        }
    }

    /// Install a fresh arena and carry the unconsumed tail over to its
    /// front. Packets peeled earlier keep the old arena alive.
    fn rotate_vector(&mut self) {
        let new_vec: SharedIoVec = Arc::new(IoVec::new_zeroed(self.next_vector_size()));
        new_vec.set_metadata(self.chan.id());

        match self.vec.take() {
            None => {
                self.written = 0;
                self.consumed = 0;
            }
            Some(old) => {
                debug_assert!(self.consumed <= self.written);
                let tail = self.written - self.consumed;
                debug_assert!(tail <= new_vec.size());
                IoVec::memmove(&new_vec, 0, &old, self.consumed, tail);
                self.written = tail;
                self.consumed = 0;
            }
        }
        self.vec = Some(new_vec);
    }

    fn next_vector_size(&self) -> usize {
        let tail = self.written - self.consumed;
        if tail > VECTOR_SIZE {
            VECTOR_SIZE + tail
        } else {
            VECTOR_SIZE
        }
    }

    // ── Egress ───────────────────────────────────────────────────────

    /// Handle a write wake: clear the debounce flag first so a producer
    /// enqueueing from now on raises a fresh wake, then drain.
    pub(crate) fn handle_write_wake(&mut self) {
        self.chan.shared.write_wake.drain();
        self.chan
            .shared
            .write_wake_pending
            .store(false, Ordering::Release);
        self.write_packets(0);
    }

    /// Drain passes until ring + staging drop to `threshold` or the socket
    /// stops accepting bytes. `0` drains completely; `IOV_MAX` bounds the
    /// work when called at the tail of a read pass.
    pub(crate) fn write_packets(&mut self, threshold: usize) {
        if self.chan.is_closed() {
            // Deliberate contract: close does not flush.
            self.discard_egress();
            return;
        }
        loop {
            let size = self.chan.shared.out.guess_size() + self.staging.len();
            if size <= threshold {
                return;
            }
            if self.write_a_batch() == 0 {
                return;
            }
        }
    }

    /// One refill + merge + vectored write. Returns the number of staging
    /// descriptors fully written (0 means no progress: socket not writable,
    /// nothing staged, or a write error that was logged).
    fn write_a_batch(&mut self) -> usize {
        while self.staging.len() < IOV_MAX {
            match self.chan.shared.out.try_read(&mut self.cursor) {
                Some(slot) => self.staging.push_back(slot),
                None => break,
            }
        }
        if self.staging.is_empty() {
            return 0;
        }

        merge_small_tail(&mut self.staging);

        let written = {
            let iovs: Vec<IoSlice<'_>> = self.staging.iter().map(|s| IoSlice::new(s.bytes())).collect();
            self.stream.write_vectored(&iovs)
        };

        match written {
            Ok(0) => 0,
            Ok(n) => self.advance_staging(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!(channel = self.chan.id(), error = %e, "vectored write failed");
                0
            }
        }
    }

    /// Drop fully-written descriptors off the front of staging and shrink
    /// the first partial one in place. Returns the number dropped.
    fn advance_staging(&mut self, mut written: usize) -> usize {
        let mut dropped = 0;
        while written > 0 {
            let Some(front) = self.staging.front_mut() else {
                break;
            };
            if written < front.len {
                front.off += written;
                front.len -= written;
                break;
            }
            written -= front.len;
            self.staging.pop_front();
            dropped += 1;
        }
        dropped
    }

    fn discard_egress(&mut self) {
        self.staging.clear();
        while self.chan.shared.out.try_read(&mut self.cursor).is_some() {}
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Fatal-error path: user on-error, then the close sequence. The single
    /// funnel for read errors, EOF, and corruption.
    pub(crate) fn fail(&mut self, err: &Error) {
        debug!(channel = self.chan.id(), error = %err, "channel failed");
        invoke_error_handler(&self.chan);
        self.finish_close();
    }

    /// Complete the close on the reactor thread: mark closed, fire on-close
    /// exactly once, and discard pending egress.
    pub(crate) fn finish_close(&mut self) {
        if self.close_fired {
            return;
        }
        self.close_fired = true;
        self.chan.shared.closed.store(true, Ordering::Release);
        debug!(channel = self.chan.id(), "channel closed");
        invoke_close_handler(&self.chan);
        self.discard_egress();
    }
}

/// Merge the run of small buffers at the tail of the staging area into one
/// freshly allocated arena, when the run's total exceeds `COPY_THRESH`.
/// Bounds scatter-entry count and syscall amplification for small-message
/// traffic; order is preserved.
pub(crate) fn merge_small_tail(staging: &mut VecDeque<EgressSlot>) {
    let mut tail_len = 0usize;
    let mut count = 0usize;
    for slot in staging.iter().rev() {
        if slot.len > COPY_THRESH {
            break;
        }
        tail_len += slot.len;
        count += 1;
    }
    if tail_len <= COPY_THRESH {
        return;
    }

    let merged = pktio_core::make_shared_io_vec(tail_len);
    let start = staging.len() - count;
    let mut off = 0;
    for slot in staging.iter().skip(start) {
        IoVec::memmove(&merged, off, &slot.vec, slot.off, slot.len);
        off += slot.len;
    }
    staging.truncate(start);
    staging.push_back(EgressSlot {
        vec: merged,
        off: 0,
        len: tail_len,
    });
}
