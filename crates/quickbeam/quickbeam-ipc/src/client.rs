//! Client side of a connection.
//!
//! A [`Connection`] is created by [`Connection::connect`], which runs the
//! rendezvous handshake (authenticate, channel negotiation, fd reception)
//! and then speaks only through the per-connection channels. The rendezvous
//! socket stays open for control traffic: an EOF there is how the client
//! learns the server is gone, even while blocked in `recv`.
//!
//! # Threading
//!
//! One thread may send while another receives; any other concurrent use
//! needs external locking. `refresh_event_channel` takes `&mut self` and is
//! therefore exclusive by construction.

use crate::channel::{self, OneWay, SeqPacket};
use crate::error::IpcError;
use crate::proto::{
    ConnectAccept, ConnectRequest, EventHeader, IpcType, MSG_AUTHENTICATE, MSG_DISCONNECT,
    MSG_NEW_EVENT_SOCK, NewEventReply, RequestHeader, ResponseHeader, event_role,
};
use crate::sock;
use quickbeam_config::RuntimeDir;
use quickbeam_rb::Wait;
use std::any::Any;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const STATE_ESTABLISHED: u8 = 0;
const STATE_PEER_GONE: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// What the channel/control poll reported.
enum Readiness {
    Data,
    Control,
    Timeout,
}

pub struct Connection {
    sock: UnixStream,
    request: OneWay,
    response: OneWay,
    event: OneWay,
    service: String,
    conn_id: u64,
    max_msg_size: usize,
    transport: IpcType,
    dir: RuntimeDir,
    state: AtomicU8,
    fc_enable_max: AtomicI32,
    next_event_seq: AtomicU32,
    dropped_events: AtomicU64,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Connection {
    /// Connects to the service `name`, requesting message buffers of at
    /// least `max_msg_size` bytes. The server may enforce a larger size;
    /// query the accepted value with [`Connection::buffer_size`].
    pub fn connect(
        dir: &RuntimeDir,
        name: &str,
        max_msg_size: usize,
    ) -> Result<Connection, IpcError> {
        let stream = sock::connect_rendezvous(dir, name)?;
        sock::set_control_timeout(&stream, Some(HANDSHAKE_TIMEOUT))?;

        let hdr = RequestHeader {
            id: MSG_AUTHENTICATE,
            size: (RequestHeader::SIZE + ConnectRequest::SIZE) as i32,
        };
        let mut msg = Vec::with_capacity(hdr.size as usize);
        msg.extend_from_slice(&hdr.encode());
        msg.extend_from_slice(
            &ConnectRequest {
                max_msg_size: max_msg_size as u32,
            }
            .encode(),
        );
        sock::write_control(&stream, &msg)?;

        let mut head = [0u8; ResponseHeader::SIZE];
        let fds = sock::recv_with_fds(&stream, &mut head, 3)?;
        let resp = ResponseHeader::decode(&head)
            .ok_or(IpcError::Invalid("short authenticate response"))?;
        if let Some(err) = IpcError::from_wire(resp.error) {
            return Err(err);
        }
        if resp.id != MSG_AUTHENTICATE
            || resp.size as usize != ResponseHeader::SIZE + ConnectAccept::SIZE
        {
            return Err(IpcError::Invalid("malformed authenticate response"));
        }
        let mut accept_buf = [0u8; ConnectAccept::SIZE];
        sock::read_control(&stream, &mut accept_buf)?;
        let accept = ConnectAccept::decode(&accept_buf)
            .ok_or(IpcError::Invalid("malformed channel description"))?;
        let mut fds = fds.into_iter();
        let (request_fd, response_fd, event_fd) =
            match (fds.next(), fds.next(), fds.next(), fds.next()) {
                (Some(request), Some(response), Some(event), None) => (request, response, event),
                _ => return Err(IpcError::Invalid("expected exactly three channel fds")),
            };

        let (request, response, event) = match accept.transport {
            IpcType::Shm => (
                OneWay::Shm(channel::attach_shm_channel(
                    dir,
                    name,
                    accept.conn_id,
                    "request",
                    request_fd,
                )?),
                OneWay::Shm(channel::attach_shm_channel(
                    dir,
                    name,
                    accept.conn_id,
                    "response",
                    response_fd,
                )?),
                OneWay::Shm(channel::attach_shm_channel(
                    dir,
                    name,
                    accept.conn_id,
                    "event",
                    event_fd,
                )?),
            ),
            IpcType::Socket => (
                OneWay::Socket(SeqPacket::from_owned(request_fd)),
                OneWay::Socket(SeqPacket::from_owned(response_fd)),
                OneWay::Socket(SeqPacket::from_owned(event_fd)),
            ),
        };

        debug!(
            service = name,
            conn_id = accept.conn_id,
            max_msg_size = accept.max_msg_size,
            transport = ?accept.transport,
            "connected"
        );
        Ok(Connection {
            sock: stream,
            request,
            response,
            event,
            service: name.to_string(),
            conn_id: accept.conn_id,
            max_msg_size: accept.max_msg_size as usize,
            transport: accept.transport,
            dir: dir.clone(),
            state: AtomicU8::new(STATE_ESTABLISHED),
            fc_enable_max: AtomicI32::new(1),
            next_event_seq: AtomicU32::new(0),
            dropped_events: AtomicU64::new(0),
            context: Mutex::new(None),
        })
    }

    fn ensure_established(&self) -> Result<(), IpcError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_ESTABLISHED => Ok(()),
            STATE_PEER_GONE => Err(IpcError::Disconnected),
            _ => Err(IpcError::NotConnected),
        }
    }

    fn mark_peer_gone(&self) {
        let _ = self.state.compare_exchange(
            STATE_ESTABLISHED,
            STATE_PEER_GONE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn check_flow_control(&self) -> Result<(), IpcError> {
        if let Some(fc) = self.request.as_ring().and_then(channel::fc_word) {
            let level = fc.load(Ordering::SeqCst);
            if level > 0 && level <= self.fc_enable_max.load(Ordering::SeqCst) {
                return Err(IpcError::Again);
            }
        }
        Ok(())
    }

    fn validate_request(&self, first: &[u8], total: usize) -> Result<(), IpcError> {
        if total > self.max_msg_size {
            return Err(IpcError::TooBig {
                len: total,
                max: self.max_msg_size,
            });
        }
        let hdr = RequestHeader::decode(first)
            .ok_or(IpcError::Invalid("request shorter than its header"))?;
        if hdr.size as usize != total {
            return Err(IpcError::Invalid("header size disagrees with message"));
        }
        Ok(())
    }

    /// Sends one request. Fails fast with [`IpcError::Again`] while flow
    /// control is raised or the request channel is full.
    pub fn send(&self, msg: &[u8]) -> Result<usize, IpcError> {
        self.ensure_established()?;
        self.validate_request(msg, msg.len())?;
        self.check_flow_control()?;
        match self.request.send(msg) {
            Err(IpcError::NoSpace) => Err(IpcError::Again),
            other => other,
        }
    }

    /// Sends one request gathered from `parts`; `parts[0]` must start with
    /// the request header.
    pub fn sendv(&self, parts: &[&[u8]]) -> Result<usize, IpcError> {
        self.ensure_established()?;
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let first = parts.first().copied().unwrap_or(&[]);
        self.validate_request(first, total)?;
        self.check_flow_control()?;
        match self.request.sendv(parts) {
            Err(IpcError::NoSpace) => Err(IpcError::Again),
            other => other,
        }
    }

    /// Polls the channel fd together with the rendezvous socket so a server
    /// that dies mid-wait turns into [`IpcError::Disconnected`] instead of a
    /// timeout.
    fn poll_readable(&self, chan: &OneWay, budget_ms: i32) -> Result<Readiness, IpcError> {
        let chan_fd = chan
            .fd_for_poll()
            .ok_or(IpcError::Invalid("channel has no pollable fd"))?;
        let mut pfds = [
            libc::pollfd {
                fd: chan_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.sock.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), 2, budget_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Readiness::Timeout);
            }
            return Err(IpcError::Io(err));
        }
        if rc == 0 {
            return Ok(Readiness::Timeout);
        }
        if pfds[1].revents != 0 {
            return Ok(Readiness::Control);
        }
        Ok(Readiness::Data)
    }

    /// Handles one pending control frame: DISCONNECT or EOF both finish the
    /// connection.
    fn handle_control(&self) -> Result<(), IpcError> {
        sock::set_control_timeout(&self.sock, Some(Duration::from_millis(100)))?;
        let mut head = [0u8; RequestHeader::SIZE];
        match sock::read_control(&self.sock, &mut head) {
            Err(IpcError::Disconnected) => {
                self.mark_peer_gone();
                return Err(IpcError::Disconnected);
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        let hdr = RequestHeader::decode(&head)
            .ok_or(IpcError::Invalid("short control frame"))?;
        match hdr.id {
            MSG_DISCONNECT => {
                self.mark_peer_gone();
                Err(IpcError::Disconnected)
            }
            other => {
                warn!(service = self.service, id = other, "unexpected control frame");
                Ok(())
            }
        }
    }

    fn wait_message(&self, chan: &OneWay, buf: &mut [u8], ms: i32) -> Result<usize, IpcError> {
        self.ensure_established()?;
        let wait = Wait::from_ms(ms);
        loop {
            if let Some(n) = chan.try_recv(buf)? {
                return Ok(n);
            }
            let Some(budget) = wait.remaining_ms() else {
                return Err(IpcError::Timeout);
            };
            match self.poll_readable(chan, budget)? {
                Readiness::Data => chan.consume_wakeups(),
                Readiness::Control => self.handle_control()?,
                Readiness::Timeout => continue,
            }
        }
    }

    /// Receives the response to an earlier send. `buf` must hold at least
    /// [`Connection::buffer_size`] bytes to never truncate.
    pub fn recv(&self, buf: &mut [u8], ms: i32) -> Result<usize, IpcError> {
        let n = self.wait_message(&self.response, buf, ms)?;
        if ResponseHeader::decode(&buf[..n]).is_none() {
            return Err(IpcError::Invalid("response shorter than its header"));
        }
        Ok(n)
    }

    /// `sendv` + `recv` in one call, atomic against disconnect: if the
    /// server goes away while this blocks, the result is
    /// [`IpcError::Disconnected`], and so is every later send.
    pub fn sendv_recv(
        &self,
        parts: &[&[u8]],
        buf: &mut [u8],
        ms: i32,
    ) -> Result<usize, IpcError> {
        self.sendv(parts)?;
        self.recv(buf, ms)
    }

    /// Receives the next asynchronous event, header included. Gaps in the
    /// server's sequence numbers accumulate in
    /// [`Connection::dropped_events`].
    pub fn event_recv(&self, buf: &mut [u8], ms: i32) -> Result<usize, IpcError> {
        let n = self.wait_message(&self.event, buf, ms)?;
        let hdr = EventHeader::decode(&buf[..n])
            .ok_or(IpcError::Invalid("event shorter than its header"))?;
        let expected = self.next_event_seq.load(Ordering::SeqCst);
        let gap = hdr.seq.wrapping_sub(expected);
        if gap > 0 {
            self.dropped_events.fetch_add(gap as u64, Ordering::SeqCst);
        }
        self.next_event_seq
            .store(hdr.seq.wrapping_add(1), Ordering::SeqCst);
        Ok(n)
    }

    /// Events dropped so far under event-channel overflow.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::SeqCst)
    }

    /// Asks the server for a fresh event channel and swaps it in.
    pub fn refresh_event_channel(&mut self) -> Result<(), IpcError> {
        self.ensure_established()?;
        let hdr = RequestHeader {
            id: MSG_NEW_EVENT_SOCK,
            size: RequestHeader::SIZE as i32,
        };
        sock::set_control_timeout(&self.sock, Some(HANDSHAKE_TIMEOUT))?;
        sock::write_control(&self.sock, &hdr.encode())?;

        let mut head = [0u8; ResponseHeader::SIZE];
        let mut fds = sock::recv_with_fds(&self.sock, &mut head, 1)?;
        let resp = ResponseHeader::decode(&head)
            .ok_or(IpcError::Invalid("short event channel response"))?;
        if resp.id == MSG_DISCONNECT {
            self.mark_peer_gone();
            return Err(IpcError::Disconnected);
        }
        if let Some(err) = IpcError::from_wire(resp.error) {
            return Err(err);
        }
        if resp.id != MSG_NEW_EVENT_SOCK
            || resp.size as usize != ResponseHeader::SIZE + NewEventReply::SIZE
        {
            return Err(IpcError::Invalid("malformed event channel response"));
        }
        let mut payload = [0u8; NewEventReply::SIZE];
        sock::read_control(&self.sock, &mut payload)?;
        let reply = NewEventReply::decode(&payload)
            .ok_or(IpcError::Invalid("malformed event channel reply"))?;
        let fd = fds.pop().ok_or(IpcError::Invalid("missing event channel fd"))?;

        self.event = match self.transport {
            IpcType::Shm => OneWay::Shm(channel::attach_shm_channel(
                &self.dir,
                &self.service,
                self.conn_id,
                &event_role(reply.generation),
                fd,
            )?),
            IpcType::Socket => OneWay::Socket(SeqPacket::from_owned(fd)),
        };
        self.next_event_seq.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// The fd to hand to an external event loop; readable when an event is
    /// waiting.
    pub fn fd_get(&self) -> Option<RawFd> {
        self.event.fd_for_poll()
    }

    /// Highest flow-control level this client honors (1 or 2).
    pub fn fc_enable_max_set(&self, max: i32) -> Result<(), IpcError> {
        if !(1..=2).contains(&max) {
            return Err(IpcError::Invalid("flow control max must be 1 or 2"));
        }
        self.fc_enable_max.store(max, Ordering::SeqCst);
        Ok(())
    }

    /// The message size the server actually enforces.
    pub fn buffer_size(&self) -> usize {
        self.max_msg_size
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_ESTABLISHED
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn context_set(&self, context: Arc<dyn Any + Send + Sync>) {
        *self.context.lock().unwrap_or_else(|e| e.into_inner()) = Some(context);
    }

    pub fn context_get(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Tears the connection down. Safe to call any number of times.
    pub fn disconnect(&self) -> Result<(), IpcError> {
        let prev = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if prev == STATE_ESTABLISHED {
            let hdr = RequestHeader {
                id: MSG_DISCONNECT,
                size: RequestHeader::SIZE as i32,
            };
            let _ = sock::write_control(&self.sock, &hdr.encode());
            let _ = self.sock.shutdown(Shutdown::Both);
            debug!(service = self.service, conn_id = self.conn_id, "disconnected");
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
