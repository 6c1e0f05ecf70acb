//! Rendezvous socket plumbing.
//!
//! A service listens on one Unix stream socket used only for connect,
//! authenticate, disconnect and event-channel renegotiation; payload never
//! travels here. On Linux the socket lives in the abstract namespace
//! (`\0qb-<service>`) unless the runtime directory carries the sentinel
//! file, in which case (and on every other Unix) it binds
//! `<runtime-dir>/qb-<service>`.
//!
//! Channel fds are handed to the client with SCM_RIGHTS; peer identity is
//! taken from SO_PEERCRED, never from the payload.

use crate::error::IpcError;
use quickbeam_config::RuntimeDir;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, getsockopt, recvmsg, sendmsg,
    sockopt::PeerCredentials,
};

/// Identity of the peer process, captured at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

pub(crate) fn peer_credentials(stream: &UnixStream) -> Result<Credentials, IpcError> {
    let creds = getsockopt(stream, PeerCredentials)?;
    Ok(Credentials {
        uid: creds.uid(),
        gid: creds.gid(),
        pid: creds.pid(),
    })
}

#[cfg(target_os = "linux")]
fn abstract_name(service: &str) -> String {
    format!("qb-{service}")
}

pub(crate) fn bind_rendezvous(
    dir: &RuntimeDir,
    service: &str,
) -> Result<UnixListener, IpcError> {
    #[cfg(target_os = "linux")]
    if !dir.force_fs_sockets() {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(abstract_name(service))?;
        return Ok(UnixListener::bind_addr(&addr)?);
    }
    let path = dir.socket_path(service);
    // A previous instance may have died without unlinking.
    let _ = std::fs::remove_file(&path);
    Ok(UnixListener::bind(&path)?)
}

pub(crate) fn connect_rendezvous(
    dir: &RuntimeDir,
    service: &str,
) -> Result<UnixStream, IpcError> {
    #[cfg(target_os = "linux")]
    if !dir.force_fs_sockets() {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(abstract_name(service))?;
        return Ok(UnixStream::connect_addr(&addr)?);
    }
    Ok(UnixStream::connect(dir.socket_path(service))?)
}

/// Removes the filesystem artifact of the rendezvous socket, if any.
pub(crate) fn unlink_rendezvous(dir: &RuntimeDir, service: &str) {
    #[cfg(target_os = "linux")]
    if !dir.force_fs_sockets() {
        return; // abstract names vanish with the listener
    }
    let _ = std::fs::remove_file(dir.socket_path(service));
}

fn map_read_err(err: io::Error) -> IpcError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => IpcError::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => IpcError::Disconnected,
        _ => IpcError::Io(err),
    }
}

/// Reads exactly `buf.len()` control bytes, honoring the stream's read
/// timeout. EOF maps to [`IpcError::Disconnected`].
pub(crate) fn read_control(mut stream: &UnixStream, buf: &mut [u8]) -> Result<(), IpcError> {
    stream.read_exact(buf).map_err(map_read_err)
}

pub(crate) fn write_control(mut stream: &UnixStream, bytes: &[u8]) -> Result<(), IpcError> {
    stream.write_all(bytes).map_err(|err| match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => IpcError::Disconnected,
        _ => IpcError::Io(err),
    })
}

pub(crate) fn set_control_timeout(
    stream: &UnixStream,
    timeout: Option<Duration>,
) -> Result<(), IpcError> {
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    Ok(())
}

/// Sends `bytes` with `fds` attached as a single SCM_RIGHTS message.
pub(crate) fn send_with_fds(
    stream: &UnixStream,
    bytes: &[u8],
    fds: &[RawFd],
) -> Result<(), IpcError> {
    let iov = [IoSlice::new(bytes)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    let sent = sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        if fds.is_empty() { &[] } else { &cmsgs },
        MsgFlags::empty(),
        None,
    )?;
    if sent < bytes.len() {
        // The head (with the fds) went out; push the rest normally.
        write_control(stream, &bytes[sent..])?;
    }
    Ok(())
}

/// Receives exactly `buf.len()` bytes, collecting any fds attached to the
/// first segment.
pub(crate) fn recv_with_fds(
    stream: &UnixStream,
    buf: &mut [u8],
    max_fds: usize,
) -> Result<Vec<OwnedFd>, IpcError> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 8]);
    let mut fds = Vec::new();
    let received = {
        let mut iov = [IoSliceMut::new(buf)];
        let msg = match recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        ) {
            Ok(msg) => msg,
            Err(nix::errno::Errno::EAGAIN) => return Err(IpcError::Timeout),
            Err(e) => return Err(e.into()),
        };
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                for fd in raw {
                    if fds.len() < max_fds {
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    } else {
                        unsafe { libc::close(fd) };
                    }
                }
            }
        }
        msg.bytes
    };
    if received == 0 {
        return Err(IpcError::Disconnected);
    }
    if received < buf.len() {
        read_control(stream, &mut buf[received..])?;
    }
    Ok(fds)
}
