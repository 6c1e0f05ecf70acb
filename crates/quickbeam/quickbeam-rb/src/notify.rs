//! Wakeup primitives paired with a ring buffer.
//!
//! Four back-ends share one capability set (`post`, `timed_wait`,
//! `fd_for_poll`):
//!
//! - [`Notifier::Sem`]: a named POSIX semaphore, usable across processes but
//!   not pollable.
//! - [`Notifier::Event`]: an eventfd opened with `EFD_SEMAPHORE`, usable
//!   across processes once the fd has been passed over a Unix socket, and
//!   pollable. The IPC transport attaches these.
//! - [`Notifier::Thread`]: a counting semaphore for two threads of one
//!   process.
//! - [`Notifier::None`]: no primitive; waits spin until the deadline.
//!
//! `timed_wait` only returns `true` after a matching `post` (or pending
//! count); it returns `false` on timeout and never spuriously.

use crate::error::RbError;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Millisecond timeout convention shared by every blocking call: `0` is
/// non-blocking, negative blocks indefinitely.
#[derive(Debug, Clone, Copy)]
pub enum Wait {
    NonBlocking,
    Deadline(Instant),
    Forever,
}

impl Wait {
    pub fn from_ms(ms: i32) -> Self {
        match ms {
            0 => Wait::NonBlocking,
            ms if ms < 0 => Wait::Forever,
            ms => Wait::Deadline(Instant::now() + Duration::from_millis(ms as u64)),
        }
    }

    /// Remaining budget in ms for the next OS wait, or `None` when expired.
    pub fn remaining_ms(&self) -> Option<i32> {
        match self {
            Wait::NonBlocking => None,
            Wait::Forever => Some(-1),
            Wait::Deadline(d) => {
                let now = Instant::now();
                if now >= *d {
                    None
                } else {
                    Some((*d - now).as_millis().min(i32::MAX as u128) as i32)
                }
            }
        }
    }
}

pub enum Notifier {
    Sem(NamedSem),
    Event(EventFd),
    Thread(ThreadSem),
    None,
}

impl Notifier {
    pub fn post(&self) -> Result<(), RbError> {
        match self {
            Notifier::Sem(s) => s.post(),
            Notifier::Event(e) => e.post(),
            Notifier::Thread(t) => {
                t.post();
                Ok(())
            }
            Notifier::None => Ok(()),
        }
    }

    /// Waits up to `ms` for a post. Returns `false` on timeout.
    pub fn timed_wait(&self, ms: i32) -> Result<bool, RbError> {
        match self {
            Notifier::Sem(s) => s.timed_wait(ms),
            Notifier::Event(e) => e.timed_wait(ms),
            Notifier::Thread(t) => Ok(t.timed_wait(ms)),
            Notifier::None => {
                // No primitive to sleep on; burn a short, bounded slice so
                // the caller re-checks the ring.
                if ms == 0 {
                    return Ok(false);
                }
                for _ in 0..64 {
                    std::hint::spin_loop();
                }
                std::thread::yield_now();
                Ok(false)
            }
        }
    }

    /// The fd an external poll loop can watch, when the back-end has one.
    pub fn fd_for_poll(&self) -> Option<RawFd> {
        match self {
            Notifier::Event(e) => Some(e.fd.as_raw_fd()),
            _ => None,
        }
    }
}

/// Named POSIX semaphore (`/qb-<ring-name>`).
pub struct NamedSem {
    sem: *mut libc::sem_t,
    name: CString,
}

// sem_t operations are thread-safe by definition.
unsafe impl Send for NamedSem {}
unsafe impl Sync for NamedSem {}

impl NamedSem {
    fn sem_name(ring_name: &str) -> CString {
        // sem_open requires a leading slash and no others.
        let sanitized: String = ring_name
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        CString::new(format!("/qb-{sanitized}")).unwrap_or_default()
    }

    pub fn create(ring_name: &str, mode: u32) -> Result<Self, RbError> {
        let name = Self::sem_name(ring_name);
        let sem = unsafe { libc::sem_open(name.as_ptr(), libc::O_CREAT, mode, 0) };
        if sem == libc::SEM_FAILED {
            return Err(RbError::Io(io::Error::last_os_error()));
        }
        Ok(Self { sem, name })
    }

    pub fn open(ring_name: &str) -> Result<Self, RbError> {
        let name = Self::sem_name(ring_name);
        let sem = unsafe { libc::sem_open(name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(RbError::Io(io::Error::last_os_error()));
        }
        Ok(Self { sem, name })
    }

    fn post(&self) -> Result<(), RbError> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(RbError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn timed_wait(&self, ms: i32) -> Result<bool, RbError> {
        if ms == 0 {
            let rc = unsafe { libc::sem_trywait(self.sem) };
            return match rc {
                0 => Ok(true),
                _ => match io::Error::last_os_error().raw_os_error() {
                    Some(libc::EAGAIN) => Ok(false),
                    _ => Err(RbError::Io(io::Error::last_os_error())),
                },
            };
        }
        if ms < 0 {
            loop {
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(RbError::Io(err));
                }
            }
        }
        // sem_timedwait takes an absolute CLOCK_REALTIME deadline.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        ts.tv_sec += (ms / 1000) as libc::time_t;
        ts.tv_nsec += ((ms % 1000) as libc::c_long) * 1_000_000;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &ts) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(RbError::Io(err)),
            }
        }
    }

    /// Removes the name from the system. Call only when the owning ring's
    /// refcount has reached zero.
    pub fn unlink(&self) {
        unsafe { libc::sem_unlink(self.name.as_ptr()) };
    }

    /// Filesystem path of the semaphore on platforms that expose one.
    #[cfg(target_os = "linux")]
    pub fn fs_path(&self) -> Option<std::path::PathBuf> {
        let name = self.name.to_str().ok()?;
        Some(std::path::PathBuf::from(format!(
            "/dev/shm/sem.{}",
            &name[1..]
        )))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn fs_path(&self) -> Option<std::path::PathBuf> {
        None
    }
}

impl Drop for NamedSem {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

/// Counting eventfd. `EFD_SEMAPHORE` makes each `read` consume exactly one
/// post, which matches the semaphore back-ends.
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> Result<Self, RbError> {
        let raw = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if raw < 0 {
            return Err(RbError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Wraps an fd received over a Unix socket.
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    pub fn try_clone(&self) -> Result<Self, RbError> {
        Ok(Self {
            fd: self.fd.try_clone().map_err(RbError::Io)?,
        })
    }

    fn post(&self) -> Result<(), RbError> {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if rc != 8 {
            return Err(RbError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn timed_wait(&self, ms: i32) -> Result<bool, RbError> {
        let wait = Wait::from_ms(ms);
        loop {
            // Try to consume one post first; the fd is non-blocking.
            let mut val: u64 = 0;
            let rc = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut val as *mut u64 as *mut libc::c_void,
                    8,
                )
            };
            if rc == 8 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => {}
                Some(libc::EINTR) => continue,
                _ => return Err(RbError::Io(err)),
            }
            let Some(budget) = wait.remaining_ms() else {
                return Ok(false);
            };
            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, budget) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(RbError::Io(err));
            }
            if rc == 0 {
                return Ok(false);
            }
            // Readable; loop back to consume.
        }
    }
}

/// In-process counting semaphore.
pub struct ThreadSem {
    count: Mutex<u32>,
    cond: Condvar,
}

impl ThreadSem {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        self.cond.notify_one();
    }

    fn timed_wait(&self, ms: i32) -> bool {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        if ms == 0 {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            return false;
        }
        if ms < 0 {
            while *count == 0 {
                count = self.cond.wait(count).unwrap_or_else(|e| e.into_inner());
            }
            *count -= 1;
            return true;
        }
        let (mut count, timeout) = self
            .cond
            .wait_timeout_while(count, Duration::from_millis(ms as u64), |c| *c == 0)
            .unwrap_or_else(|e| e.into_inner());
        if timeout.timed_out() && *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

impl Default for ThreadSem {
    fn default() -> Self {
        Self::new()
    }
}
