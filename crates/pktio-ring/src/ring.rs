//! Lock-free bounded ring buffer with four monotone indices.
//!
//! The circular buffer is partitioned by four monotonically increasing
//! indices. On the circular order, masked, the invariant is
//!
//! ```text
//! upper_free <= lower_full <= upper_full <= lower_free
//! ```
//!
//! - Writable area:            (lower_free, upper_free)
//! - Being written right now:  (upper_full, lower_free]
//! - Readable area:            (lower_full, upper_full]
//! - Being read right now:     (upper_free, lower_full]
//!
//! Writers reserve a slot by CAS-advancing `lower_free`, construct the
//! element in place, then publish by CAS-advancing `upper_full`; the
//! publish CAS only succeeds once every earlier reservation has published,
//! so readers never observe a half-built element. Readers mirror the ladder
//! on `lower_full` / `upper_free`.
//!
//! The single-entrance variant (default) refuses to reserve while another
//! writer is mid-flight, so at most one writer and one reader make progress
//! concurrently; the multi-entrance variant lets several writers (or
//! readers) climb the ladder at once. Either way `try_write`/`try_read` may
//! fail spuriously under contention and callers must be prepared to retry
//! or drop.
//!
//! # Thread safety
//!
//! Reservations use acquire loads and acquire/release CAS; publications are
//! release. Slots are exclusively owned between a successful reservation
//! CAS and the matching publication CAS.

use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct RingBuffer<T> {
    lower_free: AtomicU64,
    upper_free: AtomicU64,
    lower_full: AtomicU64,
    upper_full: AtomicU64,
    /// Power of two. The ring holds at most `capacity - 1` elements.
    capacity: usize,
    multi_entrance: bool,
    slots: NonNull<MaybeUninit<T>>,
}

// Safety: elements move through the ring by value; slot access is fenced by
// the reservation/publication protocol above.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// A single-entrance ring. `capacity` must be at least 2 and is rounded
    /// up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        Self::with_entrance(capacity, false)
    }

    /// A multi-entrance ring: several writers or several readers may
    /// progress concurrently.
    pub fn new_multi_entrance(capacity: usize) -> Self {
        Self::with_entrance(capacity, true)
    }

    fn with_entrance(capacity: usize, multi_entrance: bool) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2");
        let capacity = capacity.next_power_of_two();
        let mut slots = Vec::<MaybeUninit<T>>::with_capacity(capacity);
        // Safety: MaybeUninit needs no initialization.
        unsafe { slots.set_len(capacity) };
        let slots = Box::into_raw(slots.into_boxed_slice()) as *mut MaybeUninit<T>;
        Self {
            lower_free: AtomicU64::new(0),
            upper_free: AtomicU64::new(0),
            lower_full: AtomicU64::new(0),
            upper_full: AtomicU64::new(0),
            capacity,
            multi_entrance,
            // Safety: Box::into_raw never returns null.
            slots: unsafe { NonNull::new_unchecked(slots) },
        }
    }

    #[inline]
    fn masked(&self, index: u64) -> u64 {
        index & (self.capacity as u64 - 1)
    }

    #[inline]
    fn slot(&self, index: u64) -> *mut MaybeUninit<T> {
        // Safety: masked() keeps the offset inside the allocation.
        unsafe { self.slots.as_ptr().add(self.masked(index) as usize) }
    }

    /// Move `record` into the ring. On failure (full, or a spurious loss to
    /// a concurrent writer) the record is handed back.
    pub fn try_write(&self, record: T) -> Result<(), T> {
        let mut current = self.lower_free.load(Ordering::Acquire);
        loop {
            // Another writer holds an unpublished reservation.
            if !self.multi_entrance
                && self.masked(self.upper_full.load(Ordering::Acquire)) != self.masked(current)
            {
                return Err(record);
            }

            let next = current.wrapping_add(1);

            // Full: the slot we want is still part of the free boundary.
            if self.masked(self.upper_free.load(Ordering::Acquire)) == self.masked(next) {
                return Err(record);
            }

            match self.lower_free.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // The slot at `next` is ours until we publish.
                    unsafe { (*self.slot(next)).write(record) };

                    // Publish in reservation order: wait for every earlier
                    // writer to bump upper_full to our expected value.
                    while self
                        .upper_full
                        .compare_exchange_weak(current, next, Ordering::Release, Ordering::Relaxed)
                        .is_err()
                    {
                        std::hint::spin_loop();
                    }
                    return Ok(());
                }
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Take one record out of the ring. `None` when empty, or on a spurious
    /// loss to a concurrent reader.
    pub fn try_read(&self) -> Option<T> {
        let mut current = self.lower_full.load(Ordering::Acquire);
        loop {
            // Another reader holds an unpublished read reservation.
            if !self.multi_entrance
                && self.masked(self.upper_free.load(Ordering::Acquire)) != self.masked(current)
            {
                return None;
            }

            // Empty.
            if self.masked(self.upper_full.load(Ordering::Acquire)) == self.masked(current) {
                return None;
            }

            let next = current.wrapping_add(1);

            match self.lower_full.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Safety: the slot was published by a writer and is ours
                    // until we publish the read below.
                    let record = unsafe { (*self.slot(next)).assume_init_read() };

                    while self
                        .upper_free
                        .compare_exchange_weak(current, next, Ordering::Release, Ordering::Relaxed)
                        .is_err()
                    {
                        std::hint::spin_loop();
                    }
                    return Some(record);
                }
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Best-effort element count from relaxed reads. May transiently be off
    /// by in-flight reservations.
    pub fn guess_size(&self) -> usize {
        self.capacity - self.guess_free_space()
    }

    /// Best-effort free-slot count; `capacity` when idle and empty.
    pub fn guess_free_space(&self) -> usize {
        let reserved = self
            .lower_free
            .load(Ordering::Relaxed)
            .wrapping_sub(self.upper_free.load(Ordering::Relaxed));
        self.capacity.saturating_sub(reserved as usize)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        // Only one thread can be here; drain so remaining elements drop.
        while self.try_read().is_some() {}
        // Safety: reconstructs the boxed slice allocated in with_entrance.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.slots.as_ptr(),
                self.capacity,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rounds_capacity_to_power_of_two() {
        let ring = RingBuffer::<u32>::new(23);
        assert_eq!(ring.capacity(), 32);
        assert_eq!(ring.guess_free_space(), 32);
        assert_eq!(ring.guess_size(), 0);
    }

    #[test]
    fn single_threaded_fill_and_drain() {
        let capacity = 128;
        let ring = RingBuffer::new(capacity);

        // Holds capacity - 1 elements.
        for i in 0..capacity - 1 {
            assert!(ring.try_write(i).is_ok(), "write {} failed", i);
        }
        assert!(ring.try_write(usize::MAX).is_err());

        for i in 0..capacity - 1 {
            assert_eq!(ring.try_read(), Some(i));
        }
        assert_eq!(ring.try_read(), None);

        // Wrap around the mask many times.
        for round in 0..capacity * 10 {
            assert!(ring.try_write(round).is_ok());
            assert_eq!(ring.try_read(), Some(round));
        }
        assert_eq!(ring.guess_size(), 0);
        assert_eq!(ring.guess_free_space(), capacity);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let ring = RingBuffer::new(8);
        for i in 0..7u32 {
            ring.try_write(i).unwrap();
        }
        for i in 0..7u32 {
            assert_eq!(ring.try_read(), Some(i));
        }
    }

    fn hammer(capacity: usize, threads: usize, per_thread: usize, multi: bool) {
        let ring = Arc::new(if multi {
            RingBuffer::new_multi_entrance(capacity)
        } else {
            RingBuffer::new(capacity)
        });

        let mut writers = Vec::new();
        for t in 0..threads {
            let ring = Arc::clone(&ring);
            writers.push(thread::spawn(move || {
                for i in 0..per_thread {
                    let mut value = (t * 1_000_000 + i) as u64;
                    loop {
                        match ring.try_write(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let mut readers = Vec::new();
        for _ in 0..threads {
            let ring = Arc::clone(&ring);
            readers.push(thread::spawn(move || {
                let mut got = Vec::with_capacity(per_thread);
                for _ in 0..per_thread {
                    loop {
                        if let Some(v) = ring.try_read() {
                            got.push(v);
                            break;
                        }
                        thread::yield_now();
                    }
                }
                got
            }));
        }

        for w in writers {
            w.join().unwrap();
        }
        let mut seen = HashSet::new();
        for r in readers {
            for v in r.join().unwrap() {
                assert!(seen.insert(v), "duplicate element {}", v);
            }
        }
        assert_eq!(seen.len(), threads * per_thread);
        assert_eq!(ring.guess_size(), 0);
        assert_eq!(ring.guess_free_space(), ring.capacity());
    }

    #[test]
    fn concurrent_single_entrance() {
        hammer(8, 4, 500, false);
    }

    #[test]
    fn concurrent_multi_entrance() {
        hammer(8, 4, 500, true);
        hammer(64, 8, 1000, true);
    }

    #[test]
    fn drop_drains_remaining_elements() {
        struct Tracked(Arc<std::sync::atomic::AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let drops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let ring = RingBuffer::new(8);
            for _ in 0..5 {
                assert!(ring.try_write(Tracked(drops.clone())).is_ok());
            }
            let taken = ring.try_read();
            assert!(taken.is_some());
            drop(taken);
            // 4 still inside.
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 5);
    }
}
