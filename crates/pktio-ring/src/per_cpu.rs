//! One ring per logical CPU.
//!
//! Producers running on different CPUs never touch the same queue, so the
//! common enqueue path is contention-free. Each queue is cache-padded
//! (128-byte alignment) so the four indices of neighbouring queues never
//! share a line. Queues are multi-entrance: several threads scheduled on
//! one CPU may produce concurrently.
//!
//! The single consumer drains the queues round-robin, starting from the
//! queue that last yielded an element, so an active producer keeps being
//! served without starving quiet CPUs for long.

use crate::cpu::{cached_cpu_id, cpu_count, CpuId};
use crate::ring::RingBuffer;
use crossbeam_utils::CachePadded;

pub struct PerCpuRing<T> {
    rings: Box<[CachePadded<RingBuffer<T>>]>,
}

impl<T> PerCpuRing<T> {
    /// One multi-entrance ring of `capacity_per_cpu` slots per logical CPU.
    pub fn new(capacity_per_cpu: usize) -> Self {
        let rings = (0..cpu_count())
            .map(|_| CachePadded::new(RingBuffer::new_multi_entrance(capacity_per_cpu)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { rings }
    }

    /// Number of queues (= logical CPUs at construction time).
    #[inline]
    pub fn cpu_count(&self) -> usize {
        self.rings.len()
    }

    /// Per-queue slot capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.rings[0].capacity()
    }

    /// Enqueue on the caller's CPU queue. Hands the record back when that
    /// queue is full or the write spuriously fails.
    pub fn try_write(&self, record: T) -> Result<(), T> {
        let cpu = cached_cpu_id().min(self.rings.len() - 1);
        self.rings[cpu].try_write(record)
    }

    /// Dequeue one record, scanning queues round-robin from `*cursor`.
    /// Updates `*cursor` to the queue that produced the record.
    pub fn try_read(&self, cursor: &mut usize) -> Option<T> {
        let n = self.rings.len();
        for i in 0..n {
            let idx = (*cursor + i) % n;
            if let Some(record) = self.rings[idx].try_read() {
                *cursor = idx;
                return Some(record);
            }
        }
        None
    }

    /// Best-effort total element count across all queues.
    pub fn guess_size(&self) -> usize {
        self.rings.iter().map(|r| r.guess_size()).sum()
    }

    /// Best-effort element count of one CPU's queue.
    pub fn guess_size_on(&self, cpu: CpuId) -> usize {
        self.rings[cpu].guess_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{cached_cpu_id, pin_to_cpu};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn allocates_one_ring_per_cpu() {
        let ring = PerCpuRing::<u32>::new(8);
        assert_eq!(ring.cpu_count(), cpu_count());
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.guess_size(), 0);
    }

    #[test]
    fn one_message_per_pinned_cpu() {
        // Capacity comfortably above cpu_count so the totals work out even
        // when a restricted affinity mask lands every thread on one queue.
        let ring = Arc::new(PerCpuRing::<usize>::new(2 * cpu_count() + 2));

        for cpu in 0..ring.cpu_count() {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                // Best effort; the cached id routes the write either way.
                let _ = pin_to_cpu(cpu);
                while ring.try_write(cpu).is_err() {
                    thread::yield_now();
                }
            })
            .join()
            .unwrap();
        }

        assert_eq!(ring.guess_size(), ring.cpu_count());

        let mut cursor = 0;
        let mut drained = Vec::new();
        while let Some(v) = ring.try_read(&mut cursor) {
            drained.push(v);
        }
        assert_eq!(drained.len(), ring.cpu_count());
        assert_eq!(ring.guess_size(), 0);
    }

    #[test]
    fn per_cpu_slot_sizes_when_pinning_works() {
        let ring = Arc::new(PerCpuRing::<usize>::new(8));
        let mut pinned_all = true;

        for cpu in 0..ring.cpu_count() {
            let ring = Arc::clone(&ring);
            let ok = thread::spawn(move || {
                if pin_to_cpu(cpu).is_err() {
                    return false;
                }
                assert_eq!(cached_cpu_id(), cpu);
                while ring.try_write(cpu).is_err() {
                    thread::yield_now();
                }
                true
            })
            .join()
            .unwrap();
            pinned_all &= ok;
        }

        if pinned_all {
            for cpu in 0..ring.cpu_count() {
                assert_eq!(ring.guess_size_on(cpu), 1, "cpu {} queue", cpu);
            }
        }
    }

    #[test]
    fn producer_fifo_within_one_queue() {
        // A non-migrating producer must be drained in enqueue order.
        let ring = Arc::new(PerCpuRing::<u32>::new(64));
        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let _ = pin_to_cpu(0);
                for i in 0..40 {
                    let mut v = i;
                    loop {
                        match ring.try_write(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        };
        writer.join().unwrap();

        let mut cursor = 0;
        let mut got = Vec::new();
        while let Some(v) = ring.try_read(&mut cursor) {
            got.push(v);
        }
        assert_eq!(got, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn round_robin_does_not_starve() {
        let ring = PerCpuRing::<u32>::new(8);
        if ring.cpu_count() < 2 {
            return;
        }
        // Fill two queues directly through pinned helper threads is flaky in
        // constrained environments, so exercise the cursor logic with the
        // caller's own queue plus a neighbour index.
        let mine = cached_cpu_id();
        for i in 0..3 {
            ring.rings[mine].try_write(i).unwrap();
        }
        let other = (mine + 1) % ring.cpu_count();
        for i in 10..13 {
            ring.rings[other].try_write(i).unwrap();
        }

        let mut cursor = other;
        let mut got = Vec::new();
        while let Some(v) = ring.try_read(&mut cursor) {
            got.push(v);
        }
        // Starting cursor drains `other` first, then wraps to `mine`.
        assert_eq!(got, vec![10, 11, 12, 0, 1, 2]);
    }
}
