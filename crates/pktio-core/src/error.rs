//! pktio error taxonomy.
//!
//! Four kinds cover the whole library:
//!
//! - [`Error::NotEnoughData`] — a bounds-checked read ran past the arena, or
//!   a codec needs more bytes before it can size the next frame. The read
//!   loop recovers from this locally.
//! - [`Error::Corrupted`] — the codec rejected a frame's declared size.
//!   Fatal for the channel that saw it.
//! - [`Error::NotEnoughSpace`] — a view mutation would not fit in its
//!   fixed-size arena.
//! - [`Error::Io`] — an OS-level failure on read/write/accept/connect.
//!
//! A full egress queue is *not* an error: `Channel::write` returns `false`
//! and the caller decides whether to retry, drop, or backpressure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A read of `need` bytes at `offset` exceeds the `have` bytes available.
    #[error("not enough data: need {need} bytes at offset {offset}, have {have}")]
    NotEnoughData {
        offset: usize,
        need: usize,
        have: usize,
    },

    /// The codec declared a frame size that cannot be valid.
    #[error("corrupted frame: {reason}")]
    Corrupted { reason: &'static str },

    /// A write or gap of `need` bytes does not fit in the `have` bytes left.
    #[error("not enough space: need {need} bytes, have {have}")]
    NotEnoughSpace { need: usize, have: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the recoverable more-bytes-please condition.
    pub fn is_not_enough_data(&self) -> bool {
        matches!(self, Error::NotEnoughData { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_offsets() {
        let err = Error::NotEnoughData {
            offset: 12,
            need: 4,
            have: 2,
        };
        let s = err.to_string();
        assert!(s.contains("12"), "missing offset in: {}", s);
        assert!(s.contains("4"), "missing need in: {}", s);
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }
}
