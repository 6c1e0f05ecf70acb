//! Server side: a named service, its listener, and the per-connection
//! dispatch driven by the main loop.
//!
//! Connections live in an arena keyed by a monotonic 64-bit id. Loop
//! callbacks capture the service handle plus an id and resolve through the
//! arena, so nothing owns anything cyclically and a connection that
//! disappears mid-dispatch is just an arena miss.
//!
//! The message handler receives a [`ConnectionRef`] and a borrow of the
//! request payload; the borrow ends with the call, so a handler that wants
//! the data later must copy it. A handler answers with
//! [`ConnectionRef::response_send`] exactly once per request, either inside
//! the call or later from a job or timer via [`Service::response_send`].

use crate::channel::{self, FC_AREA_BYTES, OneWay, SeqPacket};
use crate::error::IpcError;
use crate::proto::{
    ConnectAccept, ConnectRequest, EventHeader, IpcType, MSG_AUTHENTICATE, MSG_DISCONNECT,
    MSG_NEW_EVENT_SOCK, NewEventReply, RequestHeader, ResponseHeader, event_role,
};
use crate::sock::{self, Credentials};
use quickbeam_config::RuntimeDir;
use quickbeam_loop::{Disposition, Loop, PollEvents, Priority};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_TIMEOUT: Duration = Duration::from_millis(250);

/// Callbacks a service implementation provides.
pub trait ServiceHandlers {
    /// Gate for a connecting peer; `false` refuses the connection before
    /// any channel is created.
    fn authenticate(&mut self, creds: &Credentials) -> bool {
        let _ = creds;
        true
    }

    /// Runs once per accepted connection, after the channels exist.
    fn connection_created(&mut self, conn: &mut ConnectionRef<'_>) {
        let _ = conn;
    }

    /// One inbound request. `data` starts with the request header and is
    /// valid only for the duration of the call.
    fn message(&mut self, conn: &mut ConnectionRef<'_>, data: &[u8]);

    /// Runs once per connection, after its channels are gone.
    fn connection_destroyed(&mut self, conn_id: u64) {
        let _ = conn_id;
    }
}

pub(crate) struct ServerConn {
    id: u64,
    sock: UnixStream,
    request: OneWay,
    response: OneWay,
    event: OneWay,
    creds: Credentials,
    accepted_size: usize,
    event_seq: u32,
    event_gen: u32,
    fc_state: i32,
    fc_auto: bool,
    doomed: bool,
    recv_buf: Vec<u8>,
    user_data: Option<Box<dyn Any>>,
}

/// A connection as seen by handlers and deferred-response code.
pub struct ConnectionRef<'a> {
    conn: &'a mut ServerConn,
}

impl ConnectionRef<'_> {
    pub fn id(&self) -> u64 {
        self.conn.id
    }

    pub fn credentials(&self) -> Credentials {
        self.conn.creds
    }

    /// The message size this connection negotiated.
    pub fn buffer_size(&self) -> usize {
        self.conn.accepted_size
    }

    /// Sends the response to the request being (or last) dispatched. At
    /// most one response per request reaches the client; `msg` must start
    /// with a response header whose `size` matches `msg.len()`.
    pub fn response_send(&mut self, msg: &[u8]) -> Result<usize, IpcError> {
        self.response_sendv(&[msg])
    }

    pub fn response_sendv(&mut self, parts: &[&[u8]]) -> Result<usize, IpcError> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let first = parts.first().copied().unwrap_or(&[]);
        let hdr = ResponseHeader::decode(first)
            .ok_or(IpcError::Invalid("response shorter than its header"))?;
        if hdr.size as usize != total {
            return Err(IpcError::Invalid("header size disagrees with message"));
        }
        if total > self.conn.accepted_size {
            return Err(IpcError::TooBig {
                len: total,
                max: self.conn.accepted_size,
            });
        }
        match self.conn.response.sendv(parts) {
            Ok(n) => {
                self.maybe_lower_fc();
                Ok(n)
            }
            Err(IpcError::NoSpace) => {
                // The client is not draining; push back before the ring
                // wedges entirely.
                self.set_fc(1);
                self.conn.fc_auto = true;
                Err(IpcError::Again)
            }
            Err(e) => Err(e),
        }
    }

    /// Publishes an asynchronous event. On the overwrite event ring the
    /// oldest events give way; the client sees the loss as a sequence gap.
    pub fn event_send(&mut self, id: i32, payload: &[u8]) -> Result<usize, IpcError> {
        if id < 0 {
            return Err(IpcError::Invalid("event ids must be non-negative"));
        }
        let total = EventHeader::SIZE + payload.len();
        if total > self.conn.accepted_size {
            return Err(IpcError::TooBig {
                len: total,
                max: self.conn.accepted_size,
            });
        }
        let hdr = EventHeader {
            id,
            size: total as i32,
            seq: self.conn.event_seq,
        };
        let sent = self.conn.event.sendv(&[&hdr.encode(), payload])?;
        self.conn.event_seq = self.conn.event_seq.wrapping_add(1);
        Ok(sent)
    }

    /// Raises (1) or clears (0) backpressure towards the client.
    pub fn flow_control_set(&mut self, level: i32) {
        self.set_fc(level);
    }

    fn set_fc(&mut self, level: i32) {
        if let Some(fc) = self.conn.request.as_ring().and_then(channel::fc_word) {
            fc.store(level, Ordering::SeqCst);
        }
        self.conn.fc_state = level;
        self.conn.fc_auto = false;
    }

    /// Automatically raised backpressure clears once the response channel
    /// drains below the low-water mark; explicit settings stay put.
    fn maybe_lower_fc(&mut self) {
        if self.conn.fc_state == 0 || !self.conn.fc_auto {
            return;
        }
        if let Some(rb) = self.conn.response.as_ring()
            && rb.space_free() * 2 > rb.data_size()
        {
            self.set_fc(0);
        }
    }

    /// Schedules this connection for teardown once the current dispatch
    /// returns.
    pub fn disconnect(&mut self) {
        self.conn.doomed = true;
    }

    pub fn user_data_set(&mut self, data: Box<dyn Any>) {
        self.conn.user_data = Some(data);
    }

    pub fn user_data(&mut self) -> Option<&mut (dyn Any + 'static)> {
        self.conn.user_data.as_deref_mut()
    }
}

struct Inner {
    dir: RuntimeDir,
    name: String,
    transport: IpcType,
    max_msg_size: usize,
    priority: Priority,
    handlers: Box<dyn ServiceHandlers>,
    listener: Option<UnixListener>,
    conns: HashMap<u64, ServerConn>,
    next_conn_id: u64,
}

/// A named endpoint accepting connections. Cheap to clone; all clones share
/// the same state and must stay on the loop thread.
#[derive(Clone)]
pub struct Service {
    inner: Rc<RefCell<Inner>>,
}

impl Service {
    pub fn new(
        dir: RuntimeDir,
        name: &str,
        transport: IpcType,
        max_msg_size: usize,
        handlers: impl ServiceHandlers + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                dir,
                name: name.to_string(),
                transport,
                max_msg_size,
                priority: Priority::Med,
                handlers: Box::new(handlers),
                listener: None,
                conns: HashMap::new(),
                next_conn_id: 1,
            })),
        }
    }

    /// Priority at which per-connection request channels dispatch.
    pub fn set_priority(&self, p: Priority) {
        self.inner.borrow_mut().priority = p;
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.borrow().conns.len()
    }

    /// Binds the rendezvous socket and registers it on the loop. The
    /// service serves connections whenever the loop runs.
    pub fn run(&self, lp: &mut Loop) -> Result<(), IpcError> {
        let fd = {
            let inner = &mut *self.inner.borrow_mut();
            let listener = sock::bind_rendezvous(&inner.dir, &inner.name)?;
            listener.set_nonblocking(true)?;
            let fd = listener.as_raw_fd();
            inner.listener = Some(listener);
            debug!(service = inner.name, transport = ?inner.transport, "service listening");
            fd
        };
        let svc = Rc::clone(&self.inner);
        lp.poll_add(Priority::Med, fd, PollEvents::IN, move |lp, _, _| {
            Self::accept_ready(&svc, lp);
            Disposition::Keep
        })?;
        Ok(())
    }

    /// Tears down every connection, then the listener.
    pub fn destroy(&self, lp: &mut Loop) {
        let inner = &mut *self.inner.borrow_mut();
        let ids: Vec<u64> = inner.conns.keys().copied().collect();
        for id in ids {
            Self::teardown_locked(inner, lp, id);
        }
        if let Some(listener) = inner.listener.take() {
            let _ = lp.poll_del(listener.as_raw_fd());
        }
        sock::unlink_rendezvous(&inner.dir, &inner.name);
        debug!(service = inner.name, "service destroyed");
    }

    /// Sends an event from outside a handler (jobs, timers). Do not call
    /// from inside a handler; use the [`ConnectionRef`] there.
    pub fn event_send(&self, conn_id: u64, id: i32, payload: &[u8]) -> Result<usize, IpcError> {
        let inner = &mut *self.inner.borrow_mut();
        let conn = inner.conns.get_mut(&conn_id).ok_or(IpcError::NotConnected)?;
        ConnectionRef { conn }.event_send(id, payload)
    }

    /// Sends a deferred response from outside a handler.
    pub fn response_send(&self, conn_id: u64, msg: &[u8]) -> Result<usize, IpcError> {
        let inner = &mut *self.inner.borrow_mut();
        let conn = inner.conns.get_mut(&conn_id).ok_or(IpcError::NotConnected)?;
        ConnectionRef { conn }.response_send(msg)
    }

    pub fn flow_control_set(&self, conn_id: u64, level: i32) -> Result<(), IpcError> {
        let inner = &mut *self.inner.borrow_mut();
        let conn = inner.conns.get_mut(&conn_id).ok_or(IpcError::NotConnected)?;
        ConnectionRef { conn }.flow_control_set(level);
        Ok(())
    }

    /// Closes one connection from outside a handler.
    pub fn disconnect(&self, lp: &mut Loop, conn_id: u64) -> Result<(), IpcError> {
        let inner = &mut *self.inner.borrow_mut();
        if !inner.conns.contains_key(&conn_id) {
            return Err(IpcError::NotConnected);
        }
        Self::teardown_locked(inner, lp, conn_id);
        Ok(())
    }

    fn accept_ready(svc: &Rc<RefCell<Inner>>, lp: &mut Loop) {
        loop {
            let accepted = {
                let inner = svc.borrow();
                let Some(listener) = inner.listener.as_ref() else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, _)) => {
                    if let Err(err) = Self::handshake(svc, lp, stream) {
                        warn!(%err, "connection handshake failed");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!(%e, "accept failed");
                    return;
                }
            }
        }
    }

    fn handshake(
        svc: &Rc<RefCell<Inner>>,
        lp: &mut Loop,
        stream: UnixStream,
    ) -> Result<(), IpcError> {
        sock::set_control_timeout(&stream, Some(HANDSHAKE_TIMEOUT))?;
        let mut head = [0u8; RequestHeader::SIZE];
        sock::read_control(&stream, &mut head)?;
        let hdr = RequestHeader::decode(&head)
            .ok_or(IpcError::Invalid("short authenticate request"))?;
        if hdr.id != MSG_AUTHENTICATE
            || hdr.size as usize != RequestHeader::SIZE + ConnectRequest::SIZE
        {
            return Err(IpcError::Invalid("handshake must start with authenticate"));
        }
        let mut req_buf = [0u8; ConnectRequest::SIZE];
        sock::read_control(&stream, &mut req_buf)?;
        let req = ConnectRequest::decode(&req_buf)
            .ok_or(IpcError::Invalid("malformed authenticate request"))?;

        // Identity comes from the socket, never the payload.
        let creds = sock::peer_credentials(&stream)?;

        let inner = &mut *svc.borrow_mut();
        if !inner.handlers.authenticate(&creds) {
            warn!(
                service = inner.name,
                uid = creds.uid,
                gid = creds.gid,
                pid = creds.pid,
                "authentication refused"
            );
            let resp = ResponseHeader {
                id: MSG_AUTHENTICATE,
                size: ResponseHeader::SIZE as i32,
                error: IpcError::AuthFailed.to_wire(),
            };
            let _ = sock::write_control(&stream, &resp.encode());
            return Err(IpcError::AuthFailed);
        }

        let conn_id = inner.next_conn_id;
        inner.next_conn_id += 1;
        let accepted_size = inner.max_msg_size.max(req.max_msg_size as usize);
        // Ring sizing: a max-size message must fit with its chunk header,
        // and small messages deserve some queue depth.
        let channel_bytes = accepted_size * 2;

        // Build the three channels and remember the client-side fds long
        // enough to ship them.
        let (request, response, event, client_fds) = match inner.transport {
            IpcType::Shm => {
                let (req_rb, req_peer) = channel::create_shm_channel(
                    &inner.dir,
                    &inner.name,
                    conn_id,
                    "request",
                    channel_bytes,
                    false,
                    FC_AREA_BYTES,
                )?;
                let (resp_rb, resp_peer) = channel::create_shm_channel(
                    &inner.dir,
                    &inner.name,
                    conn_id,
                    "response",
                    channel_bytes,
                    false,
                    0,
                )?;
                let (evt_rb, evt_peer) = channel::create_shm_channel(
                    &inner.dir,
                    &inner.name,
                    conn_id,
                    "event",
                    channel_bytes,
                    true,
                    0,
                )?;
                let fds = vec![
                    req_peer.as_fd().as_raw_fd(),
                    resp_peer.as_fd().as_raw_fd(),
                    evt_peer.as_fd().as_raw_fd(),
                ];
                (
                    OneWay::Shm(req_rb),
                    OneWay::Shm(resp_rb),
                    OneWay::Shm(evt_rb),
                    (ClientFds::Shm([req_peer, resp_peer, evt_peer]), fds),
                )
            }
            IpcType::Socket => {
                let (req_srv, req_cli) = SeqPacket::pair()?;
                let (resp_srv, resp_cli) = SeqPacket::pair()?;
                let (evt_srv, evt_cli) = SeqPacket::pair()?;
                let fds = vec![
                    req_cli.as_raw_fd(),
                    resp_cli.as_raw_fd(),
                    evt_cli.as_raw_fd(),
                ];
                (
                    OneWay::Socket(req_srv),
                    OneWay::Socket(resp_srv),
                    OneWay::Socket(evt_srv),
                    (ClientFds::Socket([req_cli, resp_cli, evt_cli]), fds),
                )
            }
        };
        let (_keep_alive, raw_fds) = client_fds;

        let resp = ResponseHeader {
            id: MSG_AUTHENTICATE,
            size: (ResponseHeader::SIZE + ConnectAccept::SIZE) as i32,
            error: 0,
        };
        let accept = ConnectAccept {
            conn_id,
            max_msg_size: accepted_size as u32,
            transport: inner.transport,
        };
        let mut reply = Vec::with_capacity(resp.size as usize);
        reply.extend_from_slice(&resp.encode());
        reply.extend_from_slice(&accept.encode());
        sock::send_with_fds(&stream, &reply, &raw_fds)?;
        // The client-side fds are in flight now; our copies can close.
        drop(_keep_alive);

        sock::set_control_timeout(&stream, Some(CONTROL_TIMEOUT))?;
        let request_fd = request
            .fd_for_poll()
            .ok_or(IpcError::Invalid("request channel has no pollable fd"))?;
        let sock_fd = stream.as_raw_fd();

        debug!(
            service = inner.name,
            conn_id,
            uid = creds.uid,
            pid = creds.pid,
            accepted_size,
            "connection established"
        );
        let conn = inner.conns.entry(conn_id).or_insert(ServerConn {
            id: conn_id,
            sock: stream,
            request,
            response,
            event,
            creds,
            accepted_size,
            event_seq: 0,
            event_gen: 0,
            fc_state: 0,
            fc_auto: false,
            doomed: false,
            recv_buf: vec![0u8; accepted_size],
            user_data: None,
        });
        inner
            .handlers
            .connection_created(&mut ConnectionRef { conn });
        if inner.conns.get(&conn_id).is_some_and(|c| c.doomed) {
            Self::teardown_locked(inner, lp, conn_id);
            return Ok(());
        }

        let svc_req = Rc::clone(svc);
        lp.poll_add(
            inner.priority,
            request_fd,
            PollEvents::IN,
            move |lp, _, _| Self::request_ready(&svc_req, lp, conn_id),
        )?;
        let svc_ctl = Rc::clone(svc);
        lp.poll_add(Priority::Med, sock_fd, PollEvents::IN, move |lp, _, _| {
            Self::control_ready(&svc_ctl, lp, conn_id)
        })?;
        Ok(())
    }

    fn request_ready(svc: &Rc<RefCell<Inner>>, lp: &mut Loop, conn_id: u64) -> Disposition {
        let inner = &mut *svc.borrow_mut();
        let Some(conn) = inner.conns.get_mut(&conn_id) else {
            return Disposition::Remove;
        };
        conn.request.consume_wakeups();
        loop {
            let mut buf = std::mem::take(&mut conn.recv_buf);
            let got = conn.request.try_recv(&mut buf);
            match got {
                Ok(Some(n)) => {
                    let valid = RequestHeader::decode(&buf[..n])
                        .filter(|h| h.size as usize == n && h.id >= 0)
                        .is_some();
                    if valid {
                        inner
                            .handlers
                            .message(&mut ConnectionRef { conn: &mut *conn }, &buf[..n]);
                    } else {
                        error!(conn_id, len = n, "malformed request frame, disconnecting");
                        conn.doomed = true;
                    }
                    conn.recv_buf = buf;
                    if conn.doomed {
                        break;
                    }
                }
                Ok(None) => {
                    conn.recv_buf = buf;
                    return Disposition::Keep;
                }
                Err(err) => {
                    conn.recv_buf = buf;
                    error!(conn_id, %err, "request channel failed, disconnecting");
                    conn.doomed = true;
                    break;
                }
            }
        }
        Self::teardown_locked(inner, lp, conn_id);
        Disposition::Keep
    }

    fn control_ready(svc: &Rc<RefCell<Inner>>, lp: &mut Loop, conn_id: u64) -> Disposition {
        let inner = &mut *svc.borrow_mut();
        let transport = inner.transport;
        let Some(conn) = inner.conns.get_mut(&conn_id) else {
            return Disposition::Remove;
        };

        let mut head = [0u8; RequestHeader::SIZE];
        let hdr = match sock::read_control(&conn.sock, &mut head) {
            Ok(()) => RequestHeader::decode(&head),
            Err(_) => None, // EOF, reset or garbage: the peer is gone
        };
        match hdr.map(|h| h.id) {
            Some(MSG_NEW_EVENT_SOCK) => {
                if let Err(err) =
                    Self::replace_event_channel(&inner.dir, &inner.name, transport, conn)
                {
                    warn!(conn_id, %err, "event channel renegotiation failed");
                    conn.doomed = true;
                }
            }
            Some(MSG_DISCONNECT) | None => {
                conn.doomed = true;
            }
            Some(other) => {
                warn!(conn_id, id = other, "unexpected control frame");
            }
        }
        if inner.conns.get(&conn_id).is_some_and(|c| c.doomed) {
            Self::teardown_locked(inner, lp, conn_id);
        }
        Disposition::Keep
    }

    fn replace_event_channel(
        dir: &RuntimeDir,
        name: &str,
        transport: IpcType,
        conn: &mut ServerConn,
    ) -> Result<(), IpcError> {
        conn.event_gen += 1;
        let role = event_role(conn.event_gen);
        let resp = ResponseHeader {
            id: MSG_NEW_EVENT_SOCK,
            size: (ResponseHeader::SIZE + NewEventReply::SIZE) as i32,
            error: 0,
        };
        let reply_tail = NewEventReply {
            generation: conn.event_gen,
        };
        let mut reply = Vec::with_capacity(resp.size as usize);
        reply.extend_from_slice(&resp.encode());
        reply.extend_from_slice(&reply_tail.encode());

        match transport {
            IpcType::Shm => {
                let (rb, peer) = channel::create_shm_channel(
                    dir,
                    name,
                    conn.id,
                    &role,
                    conn.accepted_size * 2,
                    true,
                    0,
                )?;
                sock::send_with_fds(&conn.sock, &reply, &[peer.as_fd().as_raw_fd()])?;
                conn.event = OneWay::Shm(rb);
            }
            IpcType::Socket => {
                let (srv, cli) = SeqPacket::pair()?;
                sock::send_with_fds(&conn.sock, &reply, &[cli.as_raw_fd()])?;
                conn.event = OneWay::Socket(srv);
            }
        }
        conn.event_seq = 0;
        debug!(conn_id = conn.id, generation = conn.event_gen, "event channel replaced");
        Ok(())
    }

    fn teardown_locked(inner: &mut Inner, lp: &mut Loop, conn_id: u64) {
        let Some(conn) = inner.conns.remove(&conn_id) else {
            return;
        };
        if let Some(fd) = conn.request.fd_for_poll() {
            let _ = lp.poll_del(fd);
        }
        let _ = lp.poll_del(conn.sock.as_raw_fd());
        let _ = conn.sock.shutdown(Shutdown::Both);
        drop(conn);
        inner.handlers.connection_destroyed(conn_id);
        debug!(service = inner.name, conn_id, "connection destroyed");
    }
}

/// Keeps the client-side channel fds alive until the SCM_RIGHTS send.
enum ClientFds {
    Shm([quickbeam_rb::EventFd; 3]),
    Socket([SeqPacket; 3]),
}
