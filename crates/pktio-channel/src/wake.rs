//! `WakeFd` — eventfd wake handle for cross-thread reactor signalling.
//!
//! Producers write to the eventfd from any thread; the reactor registers
//! the fd with its poll and drains it when it fires. Multiple wakes before
//! the reactor gets around to draining coalesce into a single readiness
//! event (eventfd counter semantics), which is exactly the contract the
//! channel needs: *at least* one drain per wake, not exactly one.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Signal the reactor. Never blocks; `EAGAIN` means the counter is
    /// saturated, which implies a wake is already pending.
    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        let _ = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    /// Clear the counter so the next wake raises a fresh readiness event.
    pub(crate) fn drain(&self) {
        let mut val: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}
