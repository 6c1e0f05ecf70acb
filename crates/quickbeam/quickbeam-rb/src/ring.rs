//! Chunked single-producer/single-consumer ring buffer in shared memory.
//!
//! Chunks are written and read whole, never in parts. Two modes exist:
//! normal rings refuse a write that does not fit, overwrite rings reclaim
//! the oldest chunks to make room. One process (or thread) must be the only
//! writer and one the only reader; this is a usage contract, not a lock.
//!
//! The producer publishes with release ordering on `write_pt` after storing
//! the commit word; the consumer acquires `write_pt` before touching any
//! frame. `read_pt` is advanced with compare-and-swap because in overwrite
//! mode the producer reclaims concurrently with the consumer. A crashed
//! producer leaves at worst an uncommitted frame, which readers skip; a
//! crashed reader can never corrupt the producer.

use crate::error::RbError;
use crate::layout::{
    self, CHUNK_COMMIT, CHUNK_LEN_MASK, MAX_NAME, MAX_WORD_COUNT, RbFlags, RingHeader, WORD_BYTES,
};
use crate::notify::{NamedSem, Notifier, ThreadSem, Wait};
use quickbeam_mmap::{DoubleMap, page_align, page_size};
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, warn};

/// Words of a whole frame, derived from its length word.
#[inline]
fn frame_words(len_word: u32) -> u32 {
    let payload = (len_word & CHUNK_LEN_MASK) as usize - WORD_BYTES;
    layout::chunk_words(payload)
}

pub struct RingBuffer {
    map: DoubleMap,
    name: String,
    /// Backing file; `None` for private snapshot reconstructions.
    path: Option<PathBuf>,
    flags: RbFlags,
    notifier: Notifier,
}

// All shared state is reached through atomics; the SPSC discipline is the
// caller's contract (one producer, one consumer, in any two threads or
// processes).
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Opens or creates (with [`RbFlags::CREATE`]) the ring buffer `name`
    /// backed by `<dir>/qb-<name>.rb`.
    ///
    /// `bytes` is the requested data-area size; it is rounded up to the page
    /// size with a floor of two pages. `user_data_bytes` reserves a shared
    /// scratch area between the header and the data area, available through
    /// [`RingBuffer::shared_user_data`].
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        bytes: usize,
        flags: RbFlags,
        user_data_bytes: usize,
    ) -> Result<Self, RbError> {
        if name.is_empty() || name.len() > MAX_NAME || name.contains('/') {
            return Err(RbError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring buffer name must be a short, slash-free identifier",
            )));
        }
        let path = dir.as_ref().join(format!("qb-{name}.rb"));
        if flags.contains(RbFlags::CREATE) {
            Self::create(path, name, bytes, flags, user_data_bytes)
        } else {
            Self::attach(path, name)
        }
    }

    fn create(
        path: PathBuf,
        name: &str,
        bytes: usize,
        flags: RbFlags,
        user_data_bytes: usize,
    ) -> Result<Self, RbError> {
        let data_len = page_align(bytes.max(2 * page_size()));
        let word_count = (data_len / WORD_BYTES) as u64;
        if word_count > MAX_WORD_COUNT as u64 {
            return Err(RbError::TooBig {
                len: bytes,
                max: MAX_WORD_COUNT as usize * WORD_BYTES,
            });
        }
        let head_len = layout::head_segment_len(user_data_bytes);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.set_len((head_len + data_len) as u64)?;
        let map = DoubleMap::map(file, head_len, data_len)?;

        // Fresh pages are zero; only the header needs initialising.
        unsafe {
            (*(map.head_ptr() as *mut RingHeader)).init(
                flags,
                word_count as u32,
                user_data_bytes as u32,
                name,
            );
        }

        let notifier = if flags.contains(RbFlags::NO_SEMAPHORE) {
            Notifier::None
        } else if flags.contains(RbFlags::SHARED_PROCESS) {
            Notifier::Sem(NamedSem::create(name, 0o600)?)
        } else if flags.contains(RbFlags::SHARED_THREAD) {
            Notifier::Thread(ThreadSem::new())
        } else {
            Notifier::None
        };

        debug!(name, data_len, head_len, ?flags, "created ring buffer");
        Ok(Self {
            map,
            name: name.to_string(),
            path: Some(path),
            flags,
            notifier,
        })
    }

    fn attach(path: PathBuf, name: &str) -> Result<Self, RbError> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        // The segment sizes live in the header, so read it from the file
        // before mapping.
        let mut hdr_bytes = [0u8; size_of::<RingHeader>()];
        file.read_exact_at(&mut hdr_bytes, 0)?;
        let hdr: RingHeader = unsafe { ptr::read_unaligned(hdr_bytes.as_ptr() as *const _) };
        hdr.validate().map_err(RbError::Corrupt)?;

        let head_len = layout::head_segment_len(hdr.user_data_bytes as usize);
        let data_len = hdr.word_count as usize * WORD_BYTES;
        let map = DoubleMap::map(file, head_len, data_len)?;

        let flags = hdr.rb_flags();
        let header = unsafe { &*(map.head_ptr() as *const RingHeader) };
        // Join the reference count unless teardown already started.
        header
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                if c <= 0 { None } else { Some(c + 1) }
            })
            .map_err(|_| RbError::Corrupt("ring buffer is being torn down"))?;

        let notifier = if flags.contains(RbFlags::NO_SEMAPHORE) {
            Notifier::None
        } else if flags.contains(RbFlags::SHARED_PROCESS) {
            Notifier::Sem(NamedSem::open(name)?)
        } else {
            // A SHARED_THREAD ring reopened from a second handle has no way
            // to share the original condvar; waits fall back to spinning.
            Notifier::None
        };

        debug!(name, refs = header.ref_count.load(Ordering::SeqCst), "attached ring buffer");
        Ok(Self {
            map,
            name: name.to_string(),
            path: Some(path),
            flags,
            notifier,
        })
    }

    pub(crate) fn from_parts(
        map: DoubleMap,
        name: String,
        flags: RbFlags,
        notifier: Notifier,
    ) -> Self {
        Self {
            map,
            name,
            path: None,
            flags,
            notifier,
        }
    }

    #[inline]
    pub(crate) fn header(&self) -> &RingHeader {
        unsafe { &*(self.map.head_ptr() as *const RingHeader) }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        self.map.data_ptr()
    }

    /// The length word of the frame starting at physical word `pos`.
    #[inline]
    fn len_word(&self, pos: u32) -> &AtomicU32 {
        unsafe { &*(self.data_ptr().add(pos as usize * WORD_BYTES) as *const AtomicU32) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> RbFlags {
        self.flags
    }

    /// Data-area size in bytes.
    pub fn data_size(&self) -> usize {
        self.header().word_count as usize * WORD_BYTES
    }

    /// Largest payload a single chunk can carry.
    pub fn max_chunk_size(&self) -> usize {
        self.data_size() - WORD_BYTES
    }

    pub fn refcount(&self) -> i32 {
        self.header().ref_count.load(Ordering::SeqCst)
    }

    /// The shared user-data area requested at creation, or `None` when the
    /// ring was created without one.
    pub fn shared_user_data(&self) -> Option<(*mut u8, usize)> {
        let len = self.header().user_data_bytes as usize;
        if len == 0 {
            return None;
        }
        let ptr = unsafe { self.map.head_ptr().add(size_of::<RingHeader>()) };
        Some((ptr, len))
    }

    /// Replaces the wakeup primitive on this handle. The transport uses this
    /// to pair NO_SEMAPHORE rings with an eventfd passed over a socket.
    pub fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = notifier;
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Reserves `need` words, reclaiming in overwrite mode. Returns the
    /// producer index to write at.
    fn reserve(&self, need: u32) -> Result<u32, RbError> {
        let h = self.header();
        let n = h.word_count;
        loop {
            let rd = h.read_pt.load(Ordering::Acquire);
            let wr = h.write_pt.load(Ordering::Relaxed);
            let used = layout::used_words(wr, rd, n);
            if used > n {
                error!(name = self.name, wr, rd, "write index overran read index");
                return Err(RbError::Corrupt("write index overran read index"));
            }
            if n - used >= need {
                return Ok(wr);
            }
            if !self.flags.contains(RbFlags::OVERWRITE) {
                return Err(RbError::NoSpace);
            }
            self.reclaim_frame_at(rd)?;
        }
    }

    /// Advances `read_pt` past the frame at `rd`. Loses gracefully to a
    /// concurrent reclaim of the same frame.
    fn reclaim_frame_at(&self, rd: u32) -> Result<(), RbError> {
        let h = self.header();
        let n = h.word_count;
        let pos = layout::position(rd, n);
        let word = self.len_word(pos).load(Ordering::SeqCst);
        if (word & CHUNK_LEN_MASK) < WORD_BYTES as u32 {
            error!(name = self.name, rd, word, "frame length word is invalid");
            return Err(RbError::Corrupt("frame length word is invalid"));
        }
        let words = frame_words(word);
        // Clear the marker while the region is still owned by this side,
        // then publish the advance.
        self.len_word(pos).store(0, Ordering::SeqCst);
        let _ = h.read_pt.compare_exchange(
            rd,
            layout::advance(rd, words, n),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(())
    }

    /// Reserves an uncommitted chunk of `len` bytes for a zero-copy write.
    ///
    /// The returned slice is valid until [`RingBuffer::chunk_commit`] runs;
    /// allocate-commit pairs must not be interleaved.
    pub fn chunk_alloc(&self, len: usize) -> Result<&mut [u8], RbError> {
        let max = self.max_chunk_size();
        if len > max {
            return Err(RbError::TooBig { len, max });
        }
        let need = layout::chunk_words(len);
        let wr = self.reserve(need)?;
        let h = self.header();
        let pos = layout::position(wr, h.word_count);
        // Stage the length without the commit bit so snapshots taken now
        // skip this frame.
        self.len_word(pos)
            .store((len + WORD_BYTES) as u32, Ordering::SeqCst);
        let payload =
            unsafe { self.data_ptr().add((pos + 1) as usize * WORD_BYTES) };
        Ok(unsafe { slice::from_raw_parts_mut(payload, len) })
    }

    /// Publishes the chunk reserved by the last [`RingBuffer::chunk_alloc`].
    /// `len` may be smaller than the reservation but never larger.
    pub fn chunk_commit(&self, len: usize) -> Result<(), RbError> {
        let max = self.max_chunk_size();
        if len > max {
            return Err(RbError::TooBig { len, max });
        }
        let h = self.header();
        let n = h.word_count;
        let need = layout::chunk_words(len);
        let wr = h.write_pt.load(Ordering::Relaxed);
        let pos = layout::position(wr, n);

        // Commit word first, index second: a reader that observes the new
        // write_pt must observe a committed frame.
        self.len_word(pos)
            .store(CHUNK_COMMIT | (len + WORD_BYTES) as u32, Ordering::SeqCst);
        let rd = h.read_pt.load(Ordering::Acquire);
        let used_after = layout::used_words(layout::advance(wr, need, n), rd, n);
        h.high_water.fetch_max(used_after, Ordering::Relaxed);
        h.write_pt
            .store(layout::advance(wr, need, n), Ordering::Release);
        self.notifier.post()
    }

    /// Writes one chunk. Returns `len` on success.
    pub fn chunk_write(&self, data: &[u8]) -> Result<usize, RbError> {
        let buf = self.chunk_alloc(data.len())?;
        buf.copy_from_slice(data);
        self.chunk_commit(data.len())?;
        Ok(data.len())
    }

    fn try_peek(&self) -> Result<Option<&[u8]>, RbError> {
        let h = self.header();
        let n = h.word_count;
        loop {
            let wr = h.write_pt.load(Ordering::Acquire);
            let rd = h.read_pt.load(Ordering::Acquire);
            let used = layout::used_words(wr, rd, n);
            if used == 0 {
                return Ok(None);
            }
            if used > n {
                error!(name = self.name, wr, rd, "read index overrun");
                return Err(RbError::Corrupt("read index overrun"));
            }
            let pos = layout::position(rd, n);
            let word = self.len_word(pos).load(Ordering::SeqCst);
            let len_bytes = (word & CHUNK_LEN_MASK) as usize;
            if word & CHUNK_COMMIT == 0 {
                if len_bytes >= WORD_BYTES && frame_words(word) <= used {
                    // Torn write from a dead producer (or a reclaimed frame
                    // in a restored snapshot): step over it.
                    warn!(name = self.name, rd, len_bytes, "skipping uncommitted chunk");
                    let _ = h.read_pt.compare_exchange(
                        rd,
                        layout::advance(rd, frame_words(word), n),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    continue;
                }
                return Ok(None);
            }
            if len_bytes < WORD_BYTES || frame_words(word) > used {
                error!(name = self.name, rd, len_bytes, used, "chunk length exceeds used space");
                return Err(RbError::Corrupt("chunk length exceeds used space"));
            }
            let payload = unsafe {
                slice::from_raw_parts(
                    self.data_ptr().add((pos + 1) as usize * WORD_BYTES),
                    len_bytes - WORD_BYTES,
                )
            };
            return Ok(Some(payload));
        }
    }

    /// Borrows the next committed chunk without consuming it, waiting up to
    /// `ms` milliseconds (`0` returns immediately, negative waits forever).
    ///
    /// Repeated peeks return the same chunk until [`RingBuffer::chunk_reclaim`]
    /// advances past it.
    pub fn chunk_peek(&self, ms: i32) -> Result<Option<&[u8]>, RbError> {
        let wait = Wait::from_ms(ms);
        loop {
            if let Some(chunk) = self.try_peek()? {
                return Ok(Some(chunk));
            }
            let Some(budget) = wait.remaining_ms() else {
                return Ok(None);
            };
            self.notifier.timed_wait(budget)?;
        }
    }

    /// Consumes the oldest committed chunk. A no-op on an empty ring.
    pub fn chunk_reclaim(&self) -> Result<(), RbError> {
        let h = self.header();
        let n = h.word_count;
        loop {
            let wr = h.write_pt.load(Ordering::Acquire);
            let rd = h.read_pt.load(Ordering::Acquire);
            if layout::used_words(wr, rd, n) == 0 {
                return Ok(());
            }
            let pos = layout::position(rd, n);
            let word = self.len_word(pos).load(Ordering::SeqCst);
            if (word & CHUNK_LEN_MASK) < WORD_BYTES as u32 {
                return Err(RbError::Corrupt("frame length word is invalid"));
            }
            let words = frame_words(word);
            self.len_word(pos).store(0, Ordering::SeqCst);
            if h
                .read_pt
                .compare_exchange(
                    rd,
                    layout::advance(rd, words, n),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Ok(());
            }
            // Lost to an overwriting producer; re-evaluate.
        }
    }

    /// `chunk_peek` + copy + `chunk_reclaim`. Fails with
    /// [`RbError::Timeout`] when no chunk arrives in time.
    pub fn chunk_read(&self, buf: &mut [u8], ms: i32) -> Result<usize, RbError> {
        let Some(chunk) = self.chunk_peek(ms)? else {
            return Err(RbError::Timeout);
        };
        let len = chunk.len();
        if len > buf.len() {
            return Err(RbError::TooBig {
                len,
                max: buf.len(),
            });
        }
        buf[..len].copy_from_slice(chunk);
        self.chunk_reclaim()?;
        Ok(len)
    }

    /// Bytes currently occupied by frames (chunk headers included).
    pub fn space_used(&self) -> usize {
        let h = self.header();
        let wr = h.write_pt.load(Ordering::Acquire);
        let rd = h.read_pt.load(Ordering::Acquire);
        layout::used_words(wr, rd, h.word_count) as usize * WORD_BYTES
    }

    /// Bytes available for new frames.
    pub fn space_free(&self) -> usize {
        self.data_size() - self.space_used()
    }

    /// Number of whole chunks waiting to be read.
    pub fn chunks_used(&self) -> usize {
        let h = self.header();
        let n = h.word_count;
        let wr = h.write_pt.load(Ordering::Acquire);
        let mut rd = h.read_pt.load(Ordering::Acquire);
        let mut count = 0;
        while layout::used_words(wr, rd, n) > 0 {
            let word = self.len_word(layout::position(rd, n)).load(Ordering::SeqCst);
            if (word & CHUNK_LEN_MASK) < WORD_BYTES as u32 {
                break;
            }
            count += 1;
            rd = layout::advance(rd, frame_words(word), n);
        }
        count
    }

    fn artifact_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(p) = &self.path {
            paths.push(p.clone());
        }
        if let Notifier::Sem(sem) = &self.notifier
            && let Some(p) = sem.fs_path()
        {
            paths.push(p);
        }
        paths
    }

    /// Changes ownership of every backing artifact (data file and, where the
    /// platform exposes one, the semaphore file).
    pub fn chown(&self, uid: libc::uid_t, gid: libc::gid_t) -> Result<(), RbError> {
        for path in self.artifact_paths() {
            let c = CString::new(path.as_os_str().as_bytes())
                .map_err(|_| RbError::Corrupt("artifact path contains NUL"))?;
            if unsafe { libc::chown(c.as_ptr(), uid, gid) } != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(RbError::Io(err));
                }
            }
        }
        Ok(())
    }

    /// Changes the mode of every backing artifact.
    pub fn chmod(&self, mode: u32) -> Result<(), RbError> {
        for path in self.artifact_paths() {
            match fs::set_permissions(&path, fs::Permissions::from_mode(mode)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(RbError::Io(err)),
            }
        }
        Ok(())
    }

    pub(crate) fn head_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map.head_ptr(), self.map.head_len()) }
    }

    pub(crate) fn data_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map.data_ptr(), self.map.data_len()) }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let Some(path) = self.path.clone() else {
            return; // private reconstruction, nothing shared to tear down
        };
        let h = self.header();
        let remaining = h
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c - 1))
            .map(|prev| prev - 1)
            .unwrap_or(0);
        if remaining > 0 {
            return;
        }
        debug!(name = self.name, "last reference dropped, destroying ring buffer");
        if let Notifier::Sem(sem) = &self.notifier {
            sem.unlink();
        }
        if let Err(err) = fs::remove_file(&path) {
            warn!(name = self.name, %err, "failed to unlink ring buffer file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as TestCounter;

    static SEQ: TestCounter = TestCounter::new(0);

    fn open_ring(tag: &str, bytes: usize, flags: RbFlags, user: usize) -> RingBuffer {
        let name = format!(
            "{tag}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        );
        RingBuffer::open("/tmp", &name, bytes, flags | RbFlags::CREATE, user).unwrap()
    }

    #[test]
    fn chunks_round_trip_in_order() {
        let rb = open_ring("roundtrip", 8192, RbFlags::empty(), 0);
        let messages: Vec<Vec<u8>> = (0u8..50)
            .map(|i| (0..=i).map(|b| b.wrapping_mul(7)).collect())
            .collect();
        for m in &messages {
            assert_eq!(rb.chunk_write(m).unwrap(), m.len());
        }
        assert_eq!(rb.chunks_used(), messages.len());
        let mut buf = [0u8; 256];
        for m in &messages {
            let len = rb.chunk_read(&mut buf, 0).unwrap();
            assert_eq!(&buf[..len], m.as_slice());
        }
        assert!(matches!(rb.chunk_read(&mut buf, 0), Err(RbError::Timeout)));
    }

    #[test]
    fn space_accounting_is_conserved() {
        let rb = open_ring("space", 8192, RbFlags::empty(), 0);
        let total = rb.data_size();
        assert_eq!(rb.space_used() + rb.space_free(), total);
        for i in 0..40 {
            rb.chunk_write(&vec![0xAAu8; 13 + i]).unwrap();
            assert_eq!(rb.space_used() + rb.space_free(), total);
        }
        let mut buf = [0u8; 128];
        for _ in 0..20 {
            rb.chunk_read(&mut buf, 0).unwrap();
            assert_eq!(rb.space_used() + rb.space_free(), total);
        }
    }

    #[test]
    fn writes_wrap_across_the_physical_end() {
        let rb = open_ring("wrap", 8192, RbFlags::empty(), 0);
        let chunk = vec![0x42u8; rb.data_size() / 3];
        let mut buf = vec![0u8; chunk.len()];
        // Cycle enough times that frames must straddle the wrap point.
        for round in 0..12 {
            let payload: Vec<u8> = chunk.iter().map(|b| b.wrapping_add(round)).collect();
            rb.chunk_write(&payload).unwrap();
            let len = rb.chunk_read(&mut buf, 0).unwrap();
            assert_eq!(&buf[..len], payload.as_slice());
        }
    }

    #[test]
    fn full_ring_refuses_writes_without_overwrite() {
        let rb = open_ring("nospace", 8192, RbFlags::empty(), 0);
        let chunk = vec![1u8; 1000];
        let mut wrote = 0;
        loop {
            match rb.chunk_write(&chunk) {
                Ok(_) => wrote += 1,
                Err(RbError::NoSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(wrote >= 7);
        // Draining one chunk makes room again.
        let mut buf = [0u8; 1024];
        rb.chunk_read(&mut buf, 0).unwrap();
        rb.chunk_write(&chunk).unwrap();
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let rb = open_ring("toobig", 8192, RbFlags::empty(), 0);
        let too_big = vec![0u8; rb.max_chunk_size() + 1];
        assert!(matches!(
            rb.chunk_write(&too_big),
            Err(RbError::TooBig { .. })
        ));
        // Exactly max fits.
        let max = vec![0u8; rb.max_chunk_size()];
        rb.chunk_write(&max).unwrap();
    }

    #[test]
    fn overwrite_keeps_the_newest_suffix() {
        let rb = open_ring("overwrite", 8192, RbFlags::OVERWRITE, 0);
        let count = 200u32;
        for i in 0..count {
            let mut payload = vec![0u8; 120];
            payload[..4].copy_from_slice(&i.to_le_bytes());
            rb.chunk_write(&payload).unwrap();
        }
        // The reader sees a contiguous suffix ending at the last write.
        let mut buf = [0u8; 128];
        let mut seen = Vec::new();
        while let Ok(len) = rb.chunk_read(&mut buf, 0) {
            assert_eq!(len, 120);
            seen.push(u32::from_le_bytes(buf[..4].try_into().unwrap()));
        }
        assert!(!seen.is_empty());
        assert!(seen.len() < count as usize);
        assert_eq!(*seen.last().unwrap(), count - 1);
        for pair in seen.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let rb = open_ring("peek", 8192, RbFlags::empty(), 0);
        rb.chunk_write(b"first").unwrap();
        rb.chunk_write(b"second").unwrap();
        assert_eq!(rb.chunk_peek(0).unwrap().unwrap(), b"first");
        assert_eq!(rb.chunk_peek(0).unwrap().unwrap(), b"first");
        rb.chunk_reclaim().unwrap();
        assert_eq!(rb.chunk_peek(0).unwrap().unwrap(), b"second");
        rb.chunk_reclaim().unwrap();
        assert!(rb.chunk_peek(0).unwrap().is_none());
        // Reclaim on empty is a no-op.
        rb.chunk_reclaim().unwrap();
    }

    #[test]
    fn alloc_commit_publishes_once() {
        let rb = open_ring("alloc", 8192, RbFlags::empty(), 0);
        let buf = rb.chunk_alloc(32).unwrap();
        buf.fill(0x7E);
        // Not visible until committed.
        assert!(rb.chunk_peek(0).unwrap().is_none());
        rb.chunk_commit(32).unwrap();
        assert_eq!(rb.chunk_peek(0).unwrap().unwrap(), &[0x7E; 32]);
    }

    #[test]
    fn zero_length_chunks_are_legal() {
        let rb = open_ring("zero", 8192, RbFlags::empty(), 0);
        rb.chunk_write(&[]).unwrap();
        rb.chunk_write(b"after").unwrap();
        assert_eq!(rb.chunk_peek(0).unwrap().unwrap(), b"");
        rb.chunk_reclaim().unwrap();
        assert_eq!(rb.chunk_peek(0).unwrap().unwrap(), b"after");
    }

    #[test]
    fn blocking_read_times_out() {
        let rb = open_ring("timeout", 8192, RbFlags::SHARED_THREAD, 0);
        let mut buf = [0u8; 16];
        let start = std::time::Instant::now();
        assert!(matches!(
            rb.chunk_read(&mut buf, 40),
            Err(RbError::Timeout)
        ));
        assert!(start.elapsed() >= std::time::Duration::from_millis(35));
    }

    #[test]
    fn user_data_area_is_shared_between_handles() {
        let name = format!("userdata-{}-{}", std::process::id(), SEQ.fetch_add(1, Ordering::Relaxed));
        let creator = RingBuffer::open(
            "/tmp",
            &name,
            4096,
            RbFlags::CREATE | RbFlags::NO_SEMAPHORE,
            64,
        )
        .unwrap();
        let opener =
            RingBuffer::open("/tmp", &name, 0, RbFlags::NO_SEMAPHORE, 0).unwrap();
        let (p1, l1) = creator.shared_user_data().unwrap();
        let (p2, l2) = opener.shared_user_data().unwrap();
        assert_eq!(l1, 64);
        assert_eq!(l2, 64);
        unsafe {
            *p1 = 0x99;
            assert_eq!(*p2, 0x99);
        }
    }

    #[test]
    fn refcount_unlinks_after_last_close() {
        let name = format!("refs-{}-{}", std::process::id(), SEQ.fetch_add(1, Ordering::Relaxed));
        let path = format!("/tmp/qb-{name}.rb");
        let a = RingBuffer::open(
            "/tmp",
            &name,
            4096,
            RbFlags::CREATE | RbFlags::NO_SEMAPHORE,
            0,
        )
        .unwrap();
        let b = RingBuffer::open("/tmp", &name, 0, RbFlags::NO_SEMAPHORE, 0).unwrap();
        assert_eq!(a.refcount(), 2);
        drop(a);
        assert!(fs::metadata(&path).is_ok(), "file must survive first close");
        drop(b);
        assert!(fs::metadata(&path).is_err(), "last close must unlink");
    }
}
