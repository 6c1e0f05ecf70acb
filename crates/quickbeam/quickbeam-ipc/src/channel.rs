//! One-way message channels, the unit a connection is built from.
//!
//! Each connection owns three: request (client→server), response
//! (server→client) and event (server→client, overwrite mode). A channel is
//! either a shared-memory ring paired with an eventfd notifier, or one end
//! of a SOCK_SEQPACKET pair. Both preserve message boundaries and expose
//! an fd a poll loop can watch.

use crate::error::IpcError;
use crate::proto;
use nix::sys::socket::{AddressFamily, MsgFlags, SockFlag, SockType, socketpair};
use quickbeam_config::RuntimeDir;
use quickbeam_rb::{EventFd, Notifier, RbFlags, RingBuffer};
use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub(crate) enum OneWay {
    Shm(RingBuffer),
    Socket(SeqPacket),
}

impl OneWay {
    /// Queues one whole message.
    pub fn send(&self, data: &[u8]) -> Result<usize, IpcError> {
        match self {
            OneWay::Shm(rb) => Ok(rb.chunk_write(data)?),
            OneWay::Socket(sp) => sp.send(data),
        }
    }

    /// Queues one message gathered from `parts`.
    pub fn sendv(&self, parts: &[&[u8]]) -> Result<usize, IpcError> {
        match self {
            OneWay::Shm(rb) => {
                let total: usize = parts.iter().map(|p| p.len()).sum();
                let buf = rb.chunk_alloc(total)?;
                let mut at = 0;
                for part in parts {
                    buf[at..at + part.len()].copy_from_slice(part);
                    at += part.len();
                }
                rb.chunk_commit(total)?;
                Ok(total)
            }
            OneWay::Socket(sp) => sp.sendv(parts),
        }
    }

    /// Pulls the next whole message into `buf` without blocking.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>, IpcError> {
        match self {
            OneWay::Shm(rb) => {
                let Some(chunk) = rb.chunk_peek(0)? else {
                    return Ok(None);
                };
                let len = chunk.len();
                if len > buf.len() {
                    return Err(IpcError::TooBig {
                        len,
                        max: buf.len(),
                    });
                }
                buf[..len].copy_from_slice(chunk);
                rb.chunk_reclaim()?;
                Ok(Some(len))
            }
            OneWay::Socket(sp) => sp.try_recv(buf),
        }
    }

    /// Swallows pending notifier wakeups so the next poll blocks again.
    pub fn consume_wakeups(&self) {
        if let OneWay::Shm(rb) = self {
            while matches!(rb.notifier().timed_wait(0), Ok(true)) {}
        }
    }

    /// The fd to hand to a poll loop for readability.
    pub fn fd_for_poll(&self) -> Option<RawFd> {
        match self {
            OneWay::Shm(rb) => rb.notifier().fd_for_poll(),
            OneWay::Socket(sp) => Some(sp.as_raw_fd()),
        }
    }

    pub fn as_ring(&self) -> Option<&RingBuffer> {
        match self {
            OneWay::Shm(rb) => Some(rb),
            OneWay::Socket(_) => None,
        }
    }
}

/// One end of a SOCK_SEQPACKET pair: reliable, boundary-preserving,
/// non-blocking.
pub(crate) struct SeqPacket {
    fd: OwnedFd,
}

impl SeqPacket {
    pub fn pair() -> Result<(SeqPacket, SeqPacket), IpcError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((SeqPacket { fd: a }, SeqPacket { fd: b }))
    }

    /// Wraps the fd received over the rendezvous socket. The open file
    /// description keeps its non-blocking flag across the transfer.
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn send(&self, data: &[u8]) -> Result<usize, IpcError> {
        match nix::sys::socket::send(self.fd.as_raw_fd(), data, MsgFlags::MSG_NOSIGNAL) {
            Ok(n) => Ok(n),
            Err(e) => Err(e.into()),
        }
    }

    fn sendv(&self, parts: &[&[u8]]) -> Result<usize, IpcError> {
        let iovs: Vec<IoSlice<'_>> = parts.iter().map(|p| IoSlice::new(p)).collect();
        let sent = nix::sys::socket::sendmsg::<()>(
            self.fd.as_raw_fd(),
            &iovs,
            &[],
            MsgFlags::MSG_NOSIGNAL,
            None,
        )?;
        Ok(sent)
    }

    fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>, IpcError> {
        match nix::sys::socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
            Ok(0) => Err(IpcError::Disconnected),
            Ok(n) => Ok(Some(n)),
            Err(nix::errno::Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Server side: creates the named ring for one channel and the eventfd pair
/// that wakes its consumer. The second eventfd travels to the client.
pub(crate) fn create_shm_channel(
    dir: &RuntimeDir,
    service: &str,
    conn_id: u64,
    role: &str,
    size: usize,
    overwrite: bool,
    user_bytes: usize,
) -> Result<(RingBuffer, EventFd), IpcError> {
    let name = proto::ring_name(service, conn_id, role);
    let mut flags = RbFlags::CREATE | RbFlags::NO_SEMAPHORE;
    if overwrite {
        flags |= RbFlags::OVERWRITE;
    }
    let mut rb = RingBuffer::open(dir.path(), &name, size, flags, user_bytes)?;
    let efd = EventFd::new()?;
    let peer = efd.try_clone()?;
    rb.set_notifier(Notifier::Event(efd));
    Ok((rb, peer))
}

/// Client side: opens the ring the server created and pairs it with the
/// eventfd that arrived over the rendezvous socket.
pub(crate) fn attach_shm_channel(
    dir: &RuntimeDir,
    service: &str,
    conn_id: u64,
    role: &str,
    efd: OwnedFd,
) -> Result<RingBuffer, IpcError> {
    let name = proto::ring_name(service, conn_id, role);
    let mut rb = RingBuffer::open(dir.path(), &name, 0, RbFlags::empty(), 0)?;
    rb.set_notifier(Notifier::Event(EventFd::from_owned(efd)));
    Ok(rb)
}

/// Shared flow-control word kept in the request ring's user-data area.
/// Written by the server, read by the client before every send.
pub(crate) const FC_AREA_BYTES: usize = 8;

pub(crate) fn fc_word(rb: &RingBuffer) -> Option<&std::sync::atomic::AtomicI32> {
    let (ptr, len) = rb.shared_user_data()?;
    if len < FC_AREA_BYTES {
        return None;
    }
    Some(unsafe { &*(ptr as *const std::sync::atomic::AtomicI32) })
}
