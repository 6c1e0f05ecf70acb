use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RbError {
    /// The ring has no room for the chunk and overwrite mode is off.
    #[error("not enough space in ring buffer")]
    NoSpace,

    /// The chunk can never fit, regardless of how much is reclaimed.
    #[error("chunk of {len} bytes exceeds ring capacity of {max} bytes")]
    TooBig { len: usize, max: usize },

    /// A blocking read ran out its timeout with no committed chunk.
    #[error("timed out waiting for a chunk")]
    Timeout,

    /// The shared header failed validation or an index invariant broke.
    #[error("ring buffer is corrupt: {0}")]
    Corrupt(&'static str),

    /// An OS call (open, mmap, semaphore) failed.
    #[error("ring buffer os operation failed")]
    Io(#[from] io::Error),
}
