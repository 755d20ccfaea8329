//! # pktio-ring — lock-free per-CPU queues
//!
//! The egress side of a pktio channel: producers on arbitrary threads push
//! write requests, the reactor thread drains them. Contention is avoided by
//! sharding (one bounded lock-free queue per logical CPU, selected by a
//! cached per-thread CPU id) rather than by a single clever MPMC structure.
//!
//! - [`RingBuffer`] — the bounded queue. Four monotone indices split the
//!   circular buffer into free / being-written / full / being-read regions;
//!   writers and readers walk a CAS ladder to reserve and publish.
//! - [`PerCpuRing`] — one cache-padded ring per CPU plus the routing and
//!   round-robin draining logic.
//! - [`cpu`] — `sched_getcpu` caching and affinity helpers.

pub mod cpu;
pub mod per_cpu;
pub mod ring;

pub use cpu::{cached_cpu_id, cpu_count, current_cpu, pin_to_cpu, CpuId};
pub use per_cpu::PerCpuRing;
pub use ring::RingBuffer;
