//! The transport error taxonomy and its wire form.
//!
//! Response headers carry `error` as a negative errno-style code so peers
//! built against different versions still agree on the failure class.

use quickbeam_rb::RbError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// A ring write found insufficient room (server side, overwrite off).
    #[error("no space left in channel")]
    NoSpace,

    /// The message exceeds the negotiated maximum.
    #[error("message of {len} bytes exceeds the negotiated maximum of {max}")]
    TooBig { len: usize, max: usize },

    /// Transient: flow control raised, or the peer has not drained yet.
    #[error("channel busy, retry")]
    Again,

    /// The peer closed or crashed.
    #[error("peer disconnected")]
    Disconnected,

    /// The connection is not in the established state.
    #[error("not connected")]
    NotConnected,

    /// A blocking operation exceeded its timeout; state is unchanged.
    #[error("timed out")]
    Timeout,

    /// The wait was cancelled from outside.
    #[error("interrupted")]
    Interrupted,

    /// The server's authenticate handler rejected the credentials.
    #[error("authentication refused")]
    AuthFailed,

    /// Malformed frame, bad length, or misaligned header. The connection is
    /// torn down.
    #[error("protocol violation: {0}")]
    Invalid(&'static str),

    /// An OS call failed.
    #[error("transport os operation failed")]
    Io(#[from] io::Error),
}

impl IpcError {
    /// Negative errno-style code for the response header's `error` field.
    pub fn to_wire(&self) -> i32 {
        match self {
            IpcError::NoSpace => -libc::ENOBUFS,
            IpcError::TooBig { .. } => -libc::EMSGSIZE,
            IpcError::Again => -libc::EAGAIN,
            IpcError::Disconnected => -libc::ECONNRESET,
            IpcError::NotConnected => -libc::ENOTCONN,
            IpcError::Timeout => -libc::ETIMEDOUT,
            IpcError::Interrupted => -libc::EINTR,
            IpcError::AuthFailed => -libc::EACCES,
            IpcError::Invalid(_) => -libc::EINVAL,
            IpcError::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// The inverse of [`IpcError::to_wire`]; `0` and positive codes are
    /// success and yield `None`.
    pub fn from_wire(code: i32) -> Option<Self> {
        if code >= 0 {
            return None;
        }
        Some(match -code {
            libc::ENOBUFS => IpcError::NoSpace,
            libc::EMSGSIZE => IpcError::TooBig { len: 0, max: 0 },
            libc::EAGAIN => IpcError::Again,
            libc::ECONNRESET => IpcError::Disconnected,
            libc::ENOTCONN => IpcError::NotConnected,
            libc::ETIMEDOUT => IpcError::Timeout,
            libc::EINTR => IpcError::Interrupted,
            libc::EACCES => IpcError::AuthFailed,
            libc::EINVAL => IpcError::Invalid("peer reported a protocol violation"),
            errno => IpcError::Io(io::Error::from_raw_os_error(errno)),
        })
    }
}

impl From<RbError> for IpcError {
    fn from(e: RbError) -> Self {
        match e {
            RbError::NoSpace => IpcError::NoSpace,
            RbError::TooBig { len, max } => IpcError::TooBig { len, max },
            RbError::Timeout => IpcError::Timeout,
            RbError::Corrupt(msg) => IpcError::Invalid(msg),
            RbError::Io(err) => IpcError::Io(err),
        }
    }
}

impl From<quickbeam_loop::LoopError> for IpcError {
    fn from(e: quickbeam_loop::LoopError) -> Self {
        match e {
            quickbeam_loop::LoopError::Io(err) => IpcError::Io(err),
            quickbeam_loop::LoopError::Interrupted => IpcError::Interrupted,
            quickbeam_loop::LoopError::NotFound => IpcError::Invalid("loop registration missing"),
            quickbeam_loop::LoopError::Invalid(msg) => IpcError::Invalid(msg),
        }
    }
}

impl From<nix::errno::Errno> for IpcError {
    fn from(e: nix::errno::Errno) -> Self {
        match e {
            nix::errno::Errno::EAGAIN => IpcError::Again,
            nix::errno::Errno::EPIPE | nix::errno::Errno::ECONNRESET => IpcError::Disconnected,
            errno => IpcError::Io(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}
