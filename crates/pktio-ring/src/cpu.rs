//! CPU identity helpers.
//!
//! Producers pick their per-CPU queue by the CPU they are running on. A
//! syscall per enqueue would defeat the point, so the id is fetched once per
//! thread and cached; it is refreshed only when the thread's affinity is
//! changed through [`pin_to_cpu`]. The cache is a hint: correctness never
//! depends on the thread actually being on the indicated CPU, only fairness
//! does.

use std::cell::Cell;
use std::sync::OnceLock;

pub type CpuId = usize;

const UNCACHED: usize = usize::MAX;

thread_local! {
    static CACHED_CPU: Cell<usize> = const { Cell::new(UNCACHED) };
}

/// Number of logical CPUs, fetched once.
pub fn cpu_count() -> usize {
    static COUNT: OnceLock<usize> = OnceLock::new();
    *COUNT.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

/// The CPU this thread is running on right now, straight from the OS.
pub fn current_cpu() -> CpuId {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

/// The cached CPU id of this thread, seeded from the OS on first use and
/// clamped into `[0, cpu_count())`.
pub fn cached_cpu_id() -> CpuId {
    CACHED_CPU.with(|cell| {
        let cached = cell.get();
        if cached != UNCACHED {
            return cached;
        }
        let id = current_cpu().min(cpu_count() - 1);
        cell.set(id);
        id
    })
}

/// Drop this thread's cached id so the next [`cached_cpu_id`] asks the OS.
pub fn refresh_cached_cpu_id() {
    CACHED_CPU.with(|cell| cell.set(UNCACHED));
}

/// Pin the calling thread to `cpu` and refresh the cache.
pub fn pin_to_cpu(cpu: CpuId) -> std::io::Result<()> {
    if cpu >= cpu_count() {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }

    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
    }
    let rc = unsafe {
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::from_raw_os_error(rc));
    }

    refresh_cached_cpu_id();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_positive() {
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn cached_id_in_range_and_stable() {
        let id = cached_cpu_id();
        assert!(id < cpu_count());
        // Without a refresh the cache must not move, even if the scheduler
        // migrates us.
        for _ in 0..100 {
            assert_eq!(cached_cpu_id(), id);
        }
    }

    #[test]
    fn pin_updates_cache() {
        let target = cpu_count() - 1;
        if pin_to_cpu(target).is_err() {
            // Restricted affinity mask (cgroups); nothing to verify.
            return;
        }
        assert_eq!(cached_cpu_id(), target);
    }

    #[test]
    fn pin_rejects_out_of_range() {
        assert!(pin_to_cpu(cpu_count()).is_err());
    }
}
