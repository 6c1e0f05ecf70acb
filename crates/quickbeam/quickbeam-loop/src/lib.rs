//! `quickbeam-loop`: a poll-driven cooperative main loop.
//!
//! One loop multiplexes four event sources across three priority bands:
//!
//! - **jobs**: one-shot closures, FIFO within their priority
//! - **timers**: one-shot, keyed by monotonic deadline
//! - **fds**: `poll(2)` readiness with a per-fd priority
//! - **signals**: a single real handler forwards the signal number over a
//!   self-pipe; user callbacks run on the loop thread
//!
//! Each iteration drains a bounded batch of jobs per priority (high, then
//! medium, then low, so lower bands are never starved outright), polls with
//! a timeout derived from the nearest timer deadline (zero while jobs are
//! pending), dispatches ready fds in priority order, fires expired timers in
//! deadline order, and finally delivers pending signals.
//!
//! Everything is cooperative and single-threaded: a callback that blocks
//! blocks the loop. The only cross-thread entry points are [`LoopStop`] and
//! the OS signal handler, both of which communicate through the self-pipe.

mod error;
mod signals;
mod timers;

pub use error::LoopError;
pub use timers::TimerHandle;

use nix::fcntl::OFlag;
use nix::sys::resource::{Resource, getrlimit};
use nix::unistd::pipe2;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Priorities for jobs, timers, fds and signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Med = 1,
    High = 2,
}

/// Jobs dispatched per priority band in one iteration, low band first.
const QUANTUM: [usize; 3] = [4, 8, 16];

/// Fds still available below which the low-fds callback fires.
const LOW_FDS_THRESHOLD: u64 = 32;

/// Self-pipe byte that only wakes `poll`, carrying no signal.
const WAKE_BYTE: u8 = 0xFF;

bitflags::bitflags! {
    /// `poll(2)` interest and readiness bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: i16 {
        const IN   = libc::POLLIN;
        const PRI  = libc::POLLPRI;
        const OUT  = libc::POLLOUT;
        const ERR  = libc::POLLERR;
        const HUP  = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

/// What to do with an fd registration after its callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandle(u64);

type JobFn = Box<dyn FnOnce(&mut Loop)>;
type PollFn = Box<dyn FnMut(&mut Loop, RawFd, PollEvents) -> Disposition>;
type SignalFn = Box<dyn FnMut(&mut Loop, i32)>;

struct JobEntry {
    handle: u64,
    f: JobFn,
}

struct PollEntry {
    priority: Priority,
    events: PollEvents,
    seq: u64,
    cb: PollFn,
}

struct SignalEntry {
    sig: i32,
    priority: Priority,
    cb: Option<SignalFn>,
}

/// Cloneable handle that stops a running loop from a callback or another
/// thread, waking the poll in the process.
#[derive(Clone)]
pub struct LoopStop {
    flag: Arc<AtomicBool>,
    wake: Arc<OwnedFd>,
}

impl LoopStop {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let byte = WAKE_BYTE;
        unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
    }
}

pub struct Loop {
    next_handle: u64,
    jobs: [VecDeque<JobEntry>; 3],
    timers: timers::TimerWheel<JobFn>,
    polls: HashMap<RawFd, PollEntry>,
    signal_entries: HashMap<u64, SignalEntry>,
    pending_signals: VecDeque<i32>,
    pipe_rd: OwnedFd,
    pipe_wr: Arc<OwnedFd>,
    stop: Arc<AtomicBool>,
    tick: Option<Duration>,
    low_fds_cb: Option<Box<dyn FnMut(bool, u64)>>,
    low_fds_state: bool,
    /// Fd whose callback is on the stack right now, and whether that
    /// callback asked for its own removal via `poll_del`.
    current_fd: Option<RawFd>,
    current_fd_removed: bool,
}

impl Loop {
    pub fn new() -> Result<Self, LoopError> {
        let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            next_handle: 1,
            jobs: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            timers: timers::TimerWheel::new(),
            polls: HashMap::new(),
            signal_entries: HashMap::new(),
            pending_signals: VecDeque::new(),
            pipe_rd: rd,
            pipe_wr: Arc::new(wr),
            stop: Arc::new(AtomicBool::new(false)),
            tick: None,
            low_fds_cb: None,
            low_fds_state: false,
            current_fd: None,
            current_fd_removed: false,
        })
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    /// Enqueues a one-shot job.
    pub fn job_add(&mut self, p: Priority, f: impl FnOnce(&mut Loop) + 'static) -> JobHandle {
        let handle = self.handle();
        self.jobs[p as usize].push_back(JobEntry {
            handle,
            f: Box::new(f),
        });
        JobHandle(handle)
    }

    /// Removes a job that has not run yet.
    pub fn job_del(&mut self, h: JobHandle) -> Result<(), LoopError> {
        for queue in &mut self.jobs {
            if let Some(at) = queue.iter().position(|j| j.handle == h.0) {
                queue.remove(at);
                return Ok(());
            }
        }
        Err(LoopError::NotFound)
    }

    /// Schedules a one-shot timer `after` from now.
    pub fn timer_add(
        &mut self,
        p: Priority,
        after: Duration,
        f: impl FnOnce(&mut Loop) + 'static,
    ) -> TimerHandle {
        let handle = self.handle();
        self.timers.add(handle, p, after, Box::new(f));
        TimerHandle(handle)
    }

    /// Cancels a timer. Idempotent: returns `false` when the timer already
    /// fired or never existed.
    pub fn timer_del(&mut self, h: TimerHandle) -> bool {
        self.timers.del(h)
    }

    pub fn timer_is_running(&self, h: TimerHandle) -> bool {
        self.timers.is_running(h)
    }

    /// Time until `h` fires; zero once it is expired or cancelled.
    pub fn timer_expire_time(&self, h: TimerHandle) -> Duration {
        self.timers.remaining(h)
    }

    /// Watches `fd` for `events`. Fails on a duplicate registration.
    pub fn poll_add(
        &mut self,
        p: Priority,
        fd: RawFd,
        events: PollEvents,
        f: impl FnMut(&mut Loop, RawFd, PollEvents) -> Disposition + 'static,
    ) -> Result<(), LoopError> {
        if fd < 0 {
            return Err(LoopError::Invalid("negative fd"));
        }
        if self.polls.contains_key(&fd) {
            return Err(LoopError::Invalid("fd already registered"));
        }
        let seq = self.handle();
        self.polls.insert(
            fd,
            PollEntry {
                priority: p,
                events,
                seq,
                cb: Box::new(f),
            },
        );
        Ok(())
    }

    /// Updates the interest mask and priority of a registered fd.
    pub fn poll_mod(&mut self, p: Priority, fd: RawFd, events: PollEvents) -> Result<(), LoopError> {
        let entry = self.polls.get_mut(&fd).ok_or(LoopError::NotFound)?;
        entry.priority = p;
        entry.events = events;
        Ok(())
    }

    pub fn poll_del(&mut self, fd: RawFd) -> Result<(), LoopError> {
        if self.current_fd == Some(fd) {
            // The fd's own callback is running; its entry is temporarily off
            // the map. Honor the removal when the callback returns.
            self.current_fd_removed = true;
            return Ok(());
        }
        self.polls.remove(&fd).map(|_| ()).ok_or(LoopError::NotFound)
    }

    /// Registers a callback for `sig`. Multiple callbacks per signal are
    /// allowed; the OS handler is installed on the first.
    pub fn signal_add(
        &mut self,
        p: Priority,
        sig: i32,
        f: impl FnMut(&mut Loop, i32) + 'static,
    ) -> Result<SignalHandle, LoopError> {
        if !self.signal_entries.values().any(|e| e.sig == sig) {
            signals::install(sig, self.pipe_wr.as_raw_fd())?;
        }
        let handle = self.handle();
        self.signal_entries.insert(
            handle,
            SignalEntry {
                sig,
                priority: p,
                cb: Some(Box::new(f)),
            },
        );
        Ok(SignalHandle(handle))
    }

    /// Changes the priority of a signal registration.
    pub fn signal_mod(&mut self, h: SignalHandle, p: Priority) -> Result<(), LoopError> {
        let entry = self.signal_entries.get_mut(&h.0).ok_or(LoopError::NotFound)?;
        entry.priority = p;
        Ok(())
    }

    pub fn signal_del(&mut self, h: SignalHandle) -> Result<(), LoopError> {
        let entry = self.signal_entries.remove(&h.0).ok_or(LoopError::NotFound)?;
        if !self.signal_entries.values().any(|e| e.sig == entry.sig) {
            signals::uninstall(entry.sig)?;
        }
        Ok(())
    }

    /// Installs the callback invoked when available fds run low. It receives
    /// `(not_enough, fds_available)` on every state transition.
    pub fn low_fds_event_set(&mut self, f: impl FnMut(bool, u64) + 'static) {
        self.low_fds_cb = Some(Box::new(f));
    }

    /// Clamps the maximum poll timeout so an iteration completes at least
    /// once per `tick` even with no timers armed.
    pub fn set_tick(&mut self, tick: Option<Duration>) {
        self.tick = tick;
    }

    pub fn stopper(&self) -> LoopStop {
        LoopStop {
            flag: Arc::clone(&self.stop),
            wake: Arc::clone(&self.pipe_wr),
        }
    }

    pub fn stop(&mut self) {
        self.stopper().stop();
    }

    /// Runs until [`Loop::stop`] (or a [`LoopStop`]) is called.
    pub fn run(&mut self) -> Result<(), LoopError> {
        self.stop.store(false, Ordering::SeqCst);
        debug!("loop running");
        while !self.stop.load(Ordering::SeqCst) {
            self.run_once()?;
        }
        debug!("loop stopped");
        Ok(())
    }

    fn run_once(&mut self) -> Result<(), LoopError> {
        self.dispatch_jobs();
        self.check_low_fds();
        self.poll_and_dispatch()?;
        self.fire_timers();
        self.dispatch_signals();
        Ok(())
    }

    fn dispatch_jobs(&mut self) {
        for p in [Priority::High, Priority::Med, Priority::Low] {
            for _ in 0..QUANTUM[p as usize] {
                let Some(entry) = self.jobs[p as usize].pop_front() else {
                    break;
                };
                (entry.f)(self);
            }
        }
    }

    fn poll_timeout(&mut self) -> i32 {
        if self.jobs.iter().any(|q| !q.is_empty()) || !self.pending_signals.is_empty() {
            return 0;
        }
        let now = Instant::now();
        let mut next = self
            .timers
            .next_deadline()
            .map(|d| d.saturating_duration_since(now));
        if let Some(tick) = self.tick {
            next = Some(next.map_or(tick, |d| d.min(tick)));
        }
        match next {
            None => -1,
            // Round up so sub-millisecond remainders do not spin.
            Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
        }
    }

    fn poll_and_dispatch(&mut self) -> Result<(), LoopError> {
        let timeout = self.poll_timeout();

        let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(self.polls.len() + 1);
        pfds.push(libc::pollfd {
            fd: self.pipe_rd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for (fd, entry) in &self.polls {
            pfds.push(libc::pollfd {
                fd: *fd,
                events: entry.events.bits(),
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                // Re-arm silently; the self-pipe carries anything that matters.
                trace!("poll interrupted, re-arming");
                return Ok(());
            }
            return Err(err.into());
        }
        if rc == 0 {
            return Ok(());
        }

        if pfds[0].revents != 0 {
            self.drain_pipe();
        }

        let mut ready: Vec<(RawFd, i16)> = pfds[1..]
            .iter()
            .filter(|p| p.revents != 0)
            .map(|p| (p.fd, p.revents))
            .collect();
        ready.sort_by_key(|(fd, _)| {
            let entry = &self.polls[fd];
            (Reverse(entry.priority), entry.seq)
        });

        for (fd, revents) in ready {
            // Earlier callbacks may have removed this fd. Taking the whole
            // entry off the map lets the callback re-register the fd.
            let Some(mut entry) = self.polls.remove(&fd) else {
                continue;
            };
            self.current_fd = Some(fd);
            self.current_fd_removed = false;
            let disposition = (entry.cb)(self, fd, PollEvents::from_bits_truncate(revents));
            self.current_fd = None;
            let keep = disposition == Disposition::Keep
                && !self.current_fd_removed
                && !self.polls.contains_key(&fd);
            if keep {
                self.polls.insert(fd, entry);
            }
        }
        Ok(())
    }

    fn drain_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(
                    self.pipe_rd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc <= 0 {
                return;
            }
            for &byte in &buf[..rc as usize] {
                if byte != WAKE_BYTE {
                    self.pending_signals.push_back(byte as i32);
                }
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some((_, cb)) = self.timers.pop_expired(now) {
            cb(self);
        }
    }

    fn dispatch_signals(&mut self) {
        while let Some(sig) = self.pending_signals.pop_front() {
            let mut targets: Vec<(u64, Priority)> = self
                .signal_entries
                .iter()
                .filter(|(_, e)| e.sig == sig)
                .map(|(h, e)| (*h, e.priority))
                .collect();
            targets.sort_by_key(|(h, p)| (Reverse(*p), *h));
            for (h, _) in targets {
                let Some(mut cb) = self
                    .signal_entries
                    .get_mut(&h)
                    .and_then(|e| e.cb.take())
                else {
                    continue;
                };
                cb(self, sig);
                if let Some(entry) = self.signal_entries.get_mut(&h) {
                    entry.cb = Some(cb);
                }
            }
        }
    }

    fn check_low_fds(&mut self) {
        let Some(cb) = self.low_fds_cb.as_mut() else {
            return;
        };
        let soft = match getrlimit(Resource::RLIMIT_NOFILE) {
            Ok((soft, _)) => soft,
            Err(_) => return,
        };
        // Rough estimate: registered fds plus the loop's own plumbing.
        let in_use = self.polls.len() as u64 + 8;
        let available = soft.saturating_sub(in_use);
        let not_enough = available < LOW_FDS_THRESHOLD;
        if not_enough != self.low_fds_state {
            self.low_fds_state = not_enough;
            cb(not_enough, available);
        }
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        let sigs: Vec<i32> = self.signal_entries.values().map(|e| e.sig).collect();
        for sig in sigs {
            let _ = signals::uninstall(sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> JobFn) {
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        let make = move |tag: &'static str| -> JobFn {
            let l = Rc::clone(&l);
            Box::new(move |_: &mut Loop| l.borrow_mut().push(tag))
        };
        (log, make)
    }

    #[test]
    fn jobs_run_in_priority_then_fifo_order() {
        let mut lp = Loop::new().unwrap();
        let (log, make) = recording();
        lp.job_add(Priority::Low, make("low-1"));
        lp.job_add(Priority::High, make("high-1"));
        lp.job_add(Priority::Med, make("med-1"));
        lp.job_add(Priority::High, make("high-2"));
        lp.job_add(Priority::Low, make("low-2"));
        lp.job_add(Priority::Low, |lp: &mut Loop| lp.stop());
        lp.run().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["high-1", "high-2", "med-1", "low-1", "low-2"]
        );
    }

    #[test]
    fn job_del_prevents_dispatch() {
        let mut lp = Loop::new().unwrap();
        let (log, make) = recording();
        let doomed = lp.job_add(Priority::Med, make("doomed"));
        lp.job_add(Priority::Med, make("kept"));
        lp.job_del(doomed).unwrap();
        assert!(matches!(lp.job_del(doomed), Err(LoopError::NotFound)));
        lp.job_add(Priority::Low, |lp: &mut Loop| lp.stop());
        lp.run().unwrap();
        assert_eq!(*log.borrow(), vec!["kept"]);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut lp = Loop::new().unwrap();
        let (log, make) = recording();
        lp.timer_add(Priority::Low, Duration::from_millis(40), make("later"));
        lp.timer_add(Priority::Low, Duration::from_millis(10), make("sooner"));
        lp.timer_add(Priority::Low, Duration::from_millis(60), |lp: &mut Loop| {
            lp.stop()
        });
        lp.run().unwrap();
        assert_eq!(*log.borrow(), vec!["sooner", "later"]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut lp = Loop::new().unwrap();
        let (log, make) = recording();
        let doomed = lp.timer_add(Priority::Med, Duration::from_millis(100), make("doomed"));
        assert!(lp.timer_is_running(doomed));
        assert!(lp.timer_expire_time(doomed) > Duration::ZERO);
        assert!(lp.timer_del(doomed));
        assert!(!lp.timer_is_running(doomed));
        assert_eq!(lp.timer_expire_time(doomed), Duration::ZERO);
        // Deleting again stays quiet.
        assert!(!lp.timer_del(doomed));
        lp.timer_add(Priority::Med, Duration::from_millis(200), |lp: &mut Loop| {
            lp.stop()
        });
        lp.run().unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn poll_dispatches_readable_fd() {
        let mut lp = Loop::new().unwrap();
        let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&got);
        lp.poll_add(Priority::High, rd.as_raw_fd(), PollEvents::IN, move |lp, fd, _| {
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 16) };
            sink.borrow_mut().extend_from_slice(&buf[..n as usize]);
            lp.stop();
            Disposition::Remove
        })
        .unwrap();
        lp.job_add(Priority::Low, move |_| {
            unsafe { libc::write(wr.as_raw_fd(), b"ping".as_ptr() as *const libc::c_void, 4) };
        });
        lp.run().unwrap();
        assert_eq!(*got.borrow(), b"ping");
        // Disposition::Remove deregistered the fd.
        assert!(matches!(
            lp.poll_mod(Priority::Low, rd.as_raw_fd(), PollEvents::IN),
            Err(LoopError::NotFound)
        ));
    }

    #[test]
    fn duplicate_poll_add_is_rejected() {
        let mut lp = Loop::new().unwrap();
        let (rd, _wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        lp.poll_add(Priority::Med, rd.as_raw_fd(), PollEvents::IN, |_, _, _| {
            Disposition::Keep
        })
        .unwrap();
        assert!(matches!(
            lp.poll_add(Priority::Med, rd.as_raw_fd(), PollEvents::IN, |_, _, _| {
                Disposition::Keep
            }),
            Err(LoopError::Invalid(_))
        ));
        lp.poll_del(rd.as_raw_fd()).unwrap();
    }

    #[test]
    fn signal_callback_runs_on_loop_thread() {
        let mut lp = Loop::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&fired);
        lp.signal_add(Priority::High, libc::SIGUSR2, move |lp, sig| {
            assert_eq!(sig, libc::SIGUSR2);
            *flag.borrow_mut() = true;
            lp.stop();
        })
        .unwrap();
        lp.job_add(Priority::Low, |_| {
            unsafe { libc::kill(libc::getpid(), libc::SIGUSR2) };
        });
        lp.run().unwrap();
        assert!(*fired.borrow());
    }

    #[test]
    fn stop_from_another_thread_wakes_poll() {
        let mut lp = Loop::new().unwrap();
        let stopper = lp.stopper();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            stopper.stop();
        });
        let start = Instant::now();
        lp.run().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        t.join().unwrap();
    }
}
