//! End-to-end client/server tests.
//!
//! Each test runs the service on a background thread driving its own loop
//! while the test thread acts as the client. Handlers communicate with the
//! test through plain atomics and condvars, since they cross the thread
//! boundary when the service moves onto the loop thread.

use quickbeam_config::RuntimeDir;
use quickbeam_ipc::{
    Connection, ConnectionRef, EventHeader, IpcError, IpcType, RequestHeader, ResponseHeader,
    Service, ServiceHandlers,
};
use quickbeam_loop::{Loop, LoopStop};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static NAME_SEQ: AtomicUsize = AtomicUsize::new(0);

fn service_name(tag: &str) -> String {
    format!(
        "{tag}-{}-{}",
        std::process::id(),
        NAME_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn runtime_dir() -> RuntimeDir {
    RuntimeDir::at("/tmp")
}

struct TestServer {
    stop: LoopStop,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Starts `handlers` as service `name` on its own loop thread. The
    /// returned server is ready to accept.
    fn start(
        name: &str,
        transport: IpcType,
        max_msg_size: usize,
        handlers: impl ServiceHandlers + Send + 'static,
    ) -> TestServer {
        let name = name.to_string();
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            let mut lp = Loop::new().expect("loop");
            let service = Service::new(runtime_dir(), &name, transport, max_msg_size, handlers);
            service.run(&mut lp).expect("service run");
            tx.send(lp.stopper()).expect("report stopper");
            lp.run().expect("loop run");
            service.destroy(&mut lp);
        });
        let stop = rx.recv().expect("loop stopper");
        TestServer {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn connect(name: &str, max_msg_size: usize) -> Connection {
    let dir = runtime_dir();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match Connection::connect(&dir, name, max_msg_size) {
            Ok(c) => return c,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5))
            }
            Err(e) => panic!("connect failed: {e}"),
        }
    }
}

/// Builds a request whose payload is padded so `size` lands on an 8-byte
/// boundary, the way the original protocol framed short strings.
fn request(id: i32, payload: &[u8]) -> Vec<u8> {
    let padded = payload.len().div_ceil(8) * 8;
    let mut msg = vec![0u8; RequestHeader::SIZE + padded];
    let hdr = RequestHeader {
        id,
        size: msg.len() as i32,
    };
    msg[..RequestHeader::SIZE].copy_from_slice(&hdr.encode());
    msg[RequestHeader::SIZE..RequestHeader::SIZE + payload.len()].copy_from_slice(payload);
    msg
}

/// Echoes every request payload back with the same id.
struct Echo;

impl ServiceHandlers for Echo {
    fn message(&mut self, conn: &mut ConnectionRef<'_>, data: &[u8]) {
        let req = RequestHeader::decode(data).expect("validated by transport");
        let payload = &data[RequestHeader::SIZE..];
        let resp = ResponseHeader {
            id: req.id,
            size: (ResponseHeader::SIZE + payload.len()) as i32,
            error: 0,
        };
        conn.response_sendv(&[&resp.encode(), payload])
            .expect("echo response");
    }
}

fn echo_round_trip(transport: IpcType) {
    let name = service_name("echo");
    let _server = TestServer::start(&name, transport, 8192, Echo);
    let conn = connect(&name, 8192);

    let msg = request(1, b"hello");
    assert_eq!(msg.len(), 16);
    let mut buf = [0u8; 8192];
    let n = conn.sendv_recv(&[&msg], &mut buf, 5_000).unwrap();
    assert_eq!(n, 24);
    let resp = ResponseHeader::decode(&buf[..n]).unwrap();
    assert_eq!(resp.id, 1);
    assert_eq!(resp.size, 24);
    assert_eq!(resp.error, 0);
    assert_eq!(&buf[ResponseHeader::SIZE..n], b"hello\0\0\0");

    conn.disconnect().unwrap();
}

#[test]
fn echo_over_shared_memory() {
    echo_round_trip(IpcType::Shm);
}

#[test]
fn echo_over_sockets() {
    echo_round_trip(IpcType::Socket);
}

#[test]
fn many_requests_in_order() {
    let name = service_name("order");
    let _server = TestServer::start(&name, IpcType::Shm, 8192, Echo);
    let conn = connect(&name, 8192);
    let mut buf = [0u8; 8192];
    for i in 0..500i32 {
        let msg = request(i, &i.to_le_bytes());
        let n = conn.sendv_recv(&[&msg], &mut buf, 5_000).unwrap();
        let resp = ResponseHeader::decode(&buf[..n]).unwrap();
        assert_eq!(resp.id, i);
        assert_eq!(&buf[ResponseHeader::SIZE..ResponseHeader::SIZE + 4], i.to_le_bytes());
    }
}

/// Parks the loop thread inside the first message until released, then
/// answers everything with a bare ack header.
struct Stall {
    gate: Arc<(Mutex<bool>, Condvar)>,
    received: Arc<AtomicUsize>,
    parked_once: bool,
}

impl ServiceHandlers for Stall {
    fn message(&mut self, conn: &mut ConnectionRef<'_>, data: &[u8]) {
        if !self.parked_once {
            self.parked_once = true;
            let (lock, cond) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
        }
        self.received.fetch_add(1, Ordering::SeqCst);
        let req = RequestHeader::decode(data).unwrap();
        let resp = ResponseHeader {
            id: req.id,
            size: ResponseHeader::SIZE as i32,
            error: 0,
        };
        conn.response_send(&resp.encode()).unwrap();
    }
}

#[test]
fn backpressure_fails_fast_and_loses_nothing() {
    let name = service_name("fc");
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let received = Arc::new(AtomicUsize::new(0));
    let _server = TestServer::start(
        &name,
        IpcType::Shm,
        8192,
        Stall {
            gate: Arc::clone(&gate),
            received: Arc::clone(&received),
            parked_once: false,
        },
    );
    let conn = connect(&name, 8192);

    // First message parks the server; everything after piles into the
    // request ring until the ring refuses.
    let msg = request(0, &[0x55; 480]);
    let mut sent = 1usize;
    conn.send(&msg).unwrap();
    let saw_again = loop {
        match conn.send(&msg) {
            Ok(_) => {
                sent += 1;
                assert!(sent < 1_000, "ring never filled");
            }
            Err(IpcError::Again) => break true,
            Err(e) => panic!("unexpected send error: {e}"),
        }
    };
    assert!(saw_again);

    // Resume the server; the jammed ring drains.
    {
        let (lock, cond) = &*gate;
        *lock.lock().unwrap() = true;
        cond.notify_all();
    }

    // A send that failed with Again eventually goes through.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match conn.send(&msg) {
            Ok(_) => {
                sent += 1;
                break;
            }
            Err(IpcError::Again) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(2))
            }
            Err(e) => panic!("send never recovered: {e}"),
        }
    }

    // Every accepted message is answered; nothing got lost.
    let mut buf = [0u8; 8192];
    for _ in 0..sent {
        conn.recv(&mut buf, 5_000).unwrap();
    }
    assert_eq!(received.load(Ordering::SeqCst), sent);
}

/// Raises flow control at the level named by the request payload.
struct FcControl;

impl ServiceHandlers for FcControl {
    fn message(&mut self, conn: &mut ConnectionRef<'_>, data: &[u8]) {
        let req = RequestHeader::decode(data).unwrap();
        conn.flow_control_set(req.id);
        let resp = ResponseHeader {
            id: req.id,
            size: ResponseHeader::SIZE as i32,
            error: 0,
        };
        conn.response_send(&resp.encode()).unwrap();
    }
}

#[test]
fn flow_control_honors_enable_max() {
    let name = service_name("fcmax");
    let _server = TestServer::start(&name, IpcType::Shm, 8192, FcControl);
    let conn = connect(&name, 8192);
    let mut buf = [0u8; 256];

    // Level 2 is above the default enable max of 1: sends keep working.
    conn.sendv_recv(&[&request(2, b"")], &mut buf, 5_000).unwrap();
    conn.send(&request(2, b"")).unwrap();
    conn.recv(&mut buf, 5_000).unwrap();

    // Opting into level 2 makes the same state fail fast.
    conn.fc_enable_max_set(2).unwrap();
    assert!(matches!(conn.send(&request(2, b"")), Err(IpcError::Again)));

    // Dropping back below the raised level unblocks, and level 0 clears.
    conn.fc_enable_max_set(1).unwrap();
    conn.sendv_recv(&[&request(0, b"")], &mut buf, 5_000).unwrap();
    conn.fc_enable_max_set(2).unwrap();
    conn.sendv_recv(&[&request(0, b"")], &mut buf, 5_000).unwrap();
}

/// Publishes a burst of events, then acks.
struct EventBurst {
    count: u32,
}

impl ServiceHandlers for EventBurst {
    fn message(&mut self, conn: &mut ConnectionRef<'_>, data: &[u8]) {
        let req = RequestHeader::decode(data).unwrap();
        let mut payload = [0u8; 64];
        for i in 0..self.count {
            payload[..4].copy_from_slice(&i.to_le_bytes());
            conn.event_send(1, &payload).expect("event send");
        }
        let resp = ResponseHeader {
            id: req.id,
            size: ResponseHeader::SIZE as i32,
            error: 0,
        };
        conn.response_send(&resp.encode()).unwrap();
    }
}

#[test]
fn event_overflow_drops_oldest_and_reports_the_gap() {
    const BURST: u32 = 10_000;
    let name = service_name("events");
    let _server = TestServer::start(&name, IpcType::Shm, 2048, EventBurst { count: BURST });
    let conn = connect(&name, 2048);
    let mut buf = [0u8; 2048];

    // The burst is fully published before the ack arrives.
    conn.sendv_recv(&[&request(5, b"")], &mut buf, 10_000).unwrap();

    let mut received = 0u64;
    let mut first_seq = None;
    let mut last_seq = 0;
    loop {
        match conn.event_recv(&mut buf, 0) {
            Ok(n) => {
                let hdr = EventHeader::decode(&buf[..n]).unwrap();
                assert_eq!(hdr.id, 1);
                assert_eq!(n, hdr.size as usize);
                first_seq.get_or_insert(hdr.seq);
                last_seq = hdr.seq;
                received += 1;
            }
            Err(IpcError::Timeout) => break,
            Err(e) => panic!("event recv failed: {e}"),
        }
    }

    // A strict suffix survived: one gap at the front, nothing in the middle.
    assert!(received > 0, "no events received");
    assert!(conn.dropped_events() > 0, "burst should overflow the ring");
    assert_eq!(received + conn.dropped_events(), BURST as u64);
    assert_eq!(first_seq.unwrap() as u64, conn.dropped_events());
    assert_eq!(last_seq, BURST - 1);
}

#[test]
fn event_channel_refresh_restarts_sequences() {
    let name = service_name("refresh");
    let _server = TestServer::start(&name, IpcType::Shm, 4096, EventBurst { count: 3 });
    let mut conn = connect(&name, 4096);
    let mut buf = [0u8; 4096];

    conn.sendv_recv(&[&request(1, b"")], &mut buf, 5_000).unwrap();
    for _ in 0..3 {
        conn.event_recv(&mut buf, 2_000).unwrap();
    }

    conn.refresh_event_channel().unwrap();
    conn.sendv_recv(&[&request(1, b"")], &mut buf, 5_000).unwrap();
    let n = conn.event_recv(&mut buf, 2_000).unwrap();
    let hdr = EventHeader::decode(&buf[..n]).unwrap();
    assert_eq!(hdr.seq, 0, "fresh channel restarts the sequence");
    assert_eq!(conn.dropped_events(), 0);
}

/// Refuses everyone and records whether any later hook ran.
struct DenyAll {
    created: Arc<AtomicBool>,
    messaged: Arc<AtomicBool>,
}

impl ServiceHandlers for DenyAll {
    fn authenticate(&mut self, _creds: &quickbeam_ipc::Credentials) -> bool {
        false
    }

    fn connection_created(&mut self, _conn: &mut ConnectionRef<'_>) {
        self.created.store(true, Ordering::SeqCst);
    }

    fn message(&mut self, _conn: &mut ConnectionRef<'_>, _data: &[u8]) {
        self.messaged.store(true, Ordering::SeqCst);
    }
}

#[test]
fn denied_authentication_creates_nothing() {
    let name = service_name("deny");
    let created = Arc::new(AtomicBool::new(false));
    let messaged = Arc::new(AtomicBool::new(false));
    let _server = TestServer::start(
        &name,
        IpcType::Shm,
        4096,
        DenyAll {
            created: Arc::clone(&created),
            messaged: Arc::clone(&messaged),
        },
    );

    let dir = runtime_dir();
    let deadline = Instant::now() + Duration::from_secs(5);
    let err = loop {
        match Connection::connect(&dir, &name, 4096) {
            Ok(_) => panic!("connect should be refused"),
            // The listener may not be up yet; only AuthFailed is the verdict.
            Err(IpcError::AuthFailed) => break IpcError::AuthFailed,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5))
            }
            Err(e) => panic!("unexpected connect error: {e}"),
        }
    };
    assert!(matches!(err, IpcError::AuthFailed));
    assert!(!created.load(Ordering::SeqCst), "created hook must not run");
    assert!(!messaged.load(Ordering::SeqCst));
    // No per-connection ring files may exist.
    let leftovers: Vec<_> = std::fs::read_dir("/tmp")
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|f| f.starts_with(&format!("qb-{name}-")) && f.ends_with(".rb"))
        .collect();
    assert!(leftovers.is_empty(), "ring files leaked: {leftovers:?}");
}

/// Records the peer's credentials for inspection.
struct RecordCreds {
    uid: Arc<AtomicU64>,
    pid: Arc<AtomicU64>,
}

impl ServiceHandlers for RecordCreds {
    fn authenticate(&mut self, creds: &quickbeam_ipc::Credentials) -> bool {
        self.uid.store(creds.uid as u64, Ordering::SeqCst);
        self.pid.store(creds.pid as u64, Ordering::SeqCst);
        true
    }

    fn message(&mut self, conn: &mut ConnectionRef<'_>, _data: &[u8]) {
        let resp = ResponseHeader {
            id: 0,
            size: ResponseHeader::SIZE as i32,
            error: 0,
        };
        conn.response_send(&resp.encode()).unwrap();
    }
}

#[test]
fn credentials_come_from_the_socket() {
    let name = service_name("creds");
    let uid = Arc::new(AtomicU64::new(u64::MAX));
    let pid = Arc::new(AtomicU64::new(u64::MAX));
    let _server = TestServer::start(
        &name,
        IpcType::Shm,
        4096,
        RecordCreds {
            uid: Arc::clone(&uid),
            pid: Arc::clone(&pid),
        },
    );
    let conn = connect(&name, 4096);
    let mut buf = [0u8; 256];
    conn.sendv_recv(&[&request(0, b"")], &mut buf, 5_000).unwrap();

    assert_eq!(uid.load(Ordering::SeqCst), unsafe { libc::getuid() } as u64);
    assert_eq!(pid.load(Ordering::SeqCst), std::process::id() as u64);
}

/// Counts teardown invocations.
struct CountDestroy {
    destroyed: Arc<AtomicUsize>,
}

impl ServiceHandlers for CountDestroy {
    fn message(&mut self, conn: &mut ConnectionRef<'_>, data: &[u8]) {
        let req = RequestHeader::decode(data).unwrap();
        if req.id == 7 {
            // Kill the connection without responding.
            conn.disconnect();
            return;
        }
        let resp = ResponseHeader {
            id: req.id,
            size: ResponseHeader::SIZE as i32,
            error: 0,
        };
        conn.response_send(&resp.encode()).unwrap();
    }

    fn connection_destroyed(&mut self, _conn_id: u64) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn disconnect_is_idempotent() {
    let name = service_name("dc");
    let destroyed = Arc::new(AtomicUsize::new(0));
    let _server = TestServer::start(
        &name,
        IpcType::Shm,
        4096,
        CountDestroy {
            destroyed: Arc::clone(&destroyed),
        },
    );
    let conn = connect(&name, 4096);
    assert!(conn.is_connected());
    conn.disconnect().unwrap();
    conn.disconnect().unwrap();
    assert!(!conn.is_connected());
    assert!(matches!(
        conn.send(&request(0, b"")),
        Err(IpcError::NotConnected)
    ));

    // The server notices exactly once.
    let deadline = Instant::now() + Duration::from_secs(5);
    while destroyed.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn server_side_close_interrupts_blocked_recv() {
    let name = service_name("kill");
    let destroyed = Arc::new(AtomicUsize::new(0));
    let _server = TestServer::start(
        &name,
        IpcType::Shm,
        4096,
        CountDestroy {
            destroyed: Arc::clone(&destroyed),
        },
    );
    let conn = connect(&name, 4096);

    // id 7 makes the server drop us without a response.
    let err = conn
        .sendv_recv(&[&request(7, b"")], &mut [0u8; 256], 10_000)
        .unwrap_err();
    assert!(matches!(err, IpcError::Disconnected), "got {err}");
    // And the very next send fails the same way.
    assert!(matches!(
        conn.send(&request(0, b"")),
        Err(IpcError::Disconnected)
    ));
}

#[test]
fn server_enforces_its_larger_buffer_size() {
    let name = service_name("bufsize");
    let _server = TestServer::start(&name, IpcType::Shm, 16384, Echo);
    let conn = connect(&name, 1024);
    assert_eq!(conn.buffer_size(), 16384);

    // A message the client's request would have refused fits the accepted
    // size.
    let msg = request(1, &vec![0x42u8; 4000]);
    let mut buf = [0u8; 16384];
    let n = conn.sendv_recv(&[&msg], &mut buf, 5_000).unwrap();
    assert_eq!(n, ResponseHeader::SIZE + 4000);

    // Anything beyond the accepted size still fails.
    let huge = request(1, &vec![0u8; 20000]);
    assert!(matches!(conn.send(&huge), Err(IpcError::TooBig { .. })));
}
