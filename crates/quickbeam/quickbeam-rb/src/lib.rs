//! `quickbeam-rb`: chunked SPSC ring buffers over shared memory.
//!
//! The ring transports length-delimited byte chunks between exactly one
//! producer and one consumer, which may live in different processes. It is
//! the payload path of the quickbeam IPC transport and is also usable on its
//! own (the blackbox snapshot machinery is nothing but a ring dumped to a
//! file).
//!
//! # Core pieces
//!
//! - [`RingBuffer`]: open/create by name, `chunk_write`/`chunk_read`, the
//!   zero-copy `chunk_alloc`/`chunk_commit` pair, `chunk_peek`/`chunk_reclaim`
//! - [`RbFlags`]: creation and sharing flags (overwrite mode, process/thread
//!   sharing, no-semaphore)
//! - [`Notifier`]: the wakeup primitive paired with a ring (named semaphore,
//!   eventfd, in-process semaphore, or none)
//!
//! # Example
//!
//! ```ignore
//! use quickbeam_rb::{RingBuffer, RbFlags};
//!
//! let rb = RingBuffer::open("/dev/shm", "audit", 1 << 16,
//!     RbFlags::CREATE | RbFlags::SHARED_PROCESS, 0)?;
//! rb.chunk_write(b"hello")?;
//!
//! // elsewhere, possibly another process:
//! let rb = RingBuffer::open("/dev/shm", "audit", 0, RbFlags::empty(), 0)?;
//! let mut buf = [0u8; 64];
//! let n = rb.chunk_read(&mut buf, 1000)?;
//! ```

mod error;
mod layout;
mod notify;
mod ring;
mod snapshot;

pub use error::RbError;
pub use layout::{RB_MAGIC, RB_VERSION, RbFlags};
pub use notify::{EventFd, NamedSem, Notifier, ThreadSem, Wait};
pub use ring::RingBuffer;
