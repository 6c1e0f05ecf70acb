use std::io;

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// The handle or fd does not name a live registration.
    #[error("no such job, timer, fd or signal registration")]
    NotFound,

    /// The registration conflicts with an existing one.
    #[error("invalid registration: {0}")]
    Invalid(&'static str),

    /// A blocking loop operation was cancelled from outside.
    #[error("interrupted")]
    Interrupted,

    /// An OS call (poll, pipe, sigaction) failed.
    #[error("loop os operation failed")]
    Io(#[from] io::Error),
}

impl From<nix::errno::Errno> for LoopError {
    fn from(e: nix::errno::Errno) -> Self {
        LoopError::Io(io::Error::from_raw_os_error(e as i32))
    }
}
