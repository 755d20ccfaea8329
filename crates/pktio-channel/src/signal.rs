//! Process-wide signal discipline.
//!
//! A write on a channel whose peer already disappeared raises `SIGPIPE`,
//! and the default disposition kills the process. The kernel reports the
//! same condition as `EPIPE` from the write, which the drain pass already
//! handles, so the signal carries no information worth dying for. Both
//! drivers ignore it once, process-wide, before touching a socket.

use std::sync::Once;

pub fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent() {
        ignore_sigpipe();
        ignore_sigpipe();
    }
}
