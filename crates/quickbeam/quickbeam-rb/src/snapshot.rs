//! Ring buffer persist/restore, the mechanism behind the blackbox tool.
//!
//! `write_to_file` dumps the head segment and data area verbatim; the dump
//! can be taken while a producer is live, in which case at most one frame is
//! torn and readers of the restored ring skip it. `create_from_file` rebuilds
//! a private ring from such a dump: the backing file is created unlinked, so
//! a restored ring leaves nothing behind and never touches semaphores.

use crate::error::RbError;
use crate::layout::{self, RbFlags, RingHeader, WORD_BYTES};
use crate::notify::Notifier;
use crate::ring::RingBuffer;
use quickbeam_mmap::{DoubleMap, MmapFile};
use std::fs::OpenOptions;
use std::io::Write;
use std::mem::size_of;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

static RESTORE_SEQ: AtomicU32 = AtomicU32::new(0);

impl RingBuffer {
    /// Dumps the ring (header, user data, data area) to `w`.
    ///
    /// Returns the number of bytes written.
    pub fn write_to_file<W: Write>(&self, w: &mut W) -> Result<usize, RbError> {
        let head = self.head_bytes();
        let data = self.data_bytes();
        w.write_all(head)?;
        w.write_all(data)?;
        Ok(head.len() + data.len())
    }

    /// Rebuilds a ring buffer from a dump produced by
    /// [`RingBuffer::write_to_file`].
    ///
    /// The result is private to this process: it has no named semaphore, no
    /// visible backing file, and `extra_flags` (typically empty or
    /// [`RbFlags::OVERWRITE`]) governs its write behaviour should the caller
    /// choose to append.
    pub fn create_from_file(
        snapshot: impl AsRef<Path>,
        extra_flags: RbFlags,
    ) -> Result<RingBuffer, RbError> {
        let src = MmapFile::open_ro(&snapshot)?;
        if src.len() < size_of::<RingHeader>() {
            return Err(RbError::Corrupt("snapshot shorter than a ring header"));
        }
        let hdr: RingHeader =
            unsafe { ptr::read_unaligned(src.as_ptr() as *const RingHeader) };
        hdr.validate().map_err(RbError::Corrupt)?;

        let head_len = layout::head_segment_len(hdr.user_data_bytes as usize);
        let data_len = hdr.word_count as usize * WORD_BYTES;
        if src.len() < head_len + data_len {
            return Err(RbError::Corrupt("snapshot truncated"));
        }

        // Unlinked scratch file: alive for exactly as long as the mapping.
        let scratch = format!(
            "/tmp/qb-restore-{}-{}",
            std::process::id(),
            RESTORE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&scratch)?;
        let _ = std::fs::remove_file(&scratch);
        file.set_len((head_len + data_len) as u64)?;

        let map = DoubleMap::map(file, head_len, data_len)?;
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), map.head_ptr(), head_len + data_len);
        }

        // Rewrite the shared bookkeeping for a single private owner.
        let flags = (hdr.rb_flags() | extra_flags | RbFlags::NO_SEMAPHORE)
            - (RbFlags::SHARED_PROCESS | RbFlags::SHARED_THREAD);
        let header = unsafe { &mut *(map.head_ptr() as *mut RingHeader) };
        header.flags = flags.bits();
        header.ref_count.store(1, Ordering::SeqCst);

        let name = hdr.name().to_string();
        debug!(name, data_len, "restored ring buffer from snapshot");
        Ok(RingBuffer::from_parts(map, name, flags, Notifier::None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as TestCounter;

    static SEQ: TestCounter = TestCounter::new(0);

    fn unique(tag: &str) -> String {
        format!(
            "{tag}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn snapshot_round_trips_chunks() {
        let name = unique("snap");
        let rb = RingBuffer::open(
            "/tmp",
            &name,
            4096,
            RbFlags::CREATE | RbFlags::NO_SEMAPHORE,
            0,
        )
        .unwrap();
        rb.chunk_write(b"first entry").unwrap();
        rb.chunk_write(b"second entry").unwrap();

        let dump = format!("/tmp/{}.dump", unique("snapfile"));
        let mut out = std::fs::File::create(&dump).unwrap();
        let written = rb.write_to_file(&mut out).unwrap();
        assert!(written > 0);
        drop(out);

        let restored = RingBuffer::create_from_file(&dump, RbFlags::empty()).unwrap();
        assert_eq!(restored.name(), name);
        assert_eq!(restored.chunks_used(), 2);
        let mut buf = [0u8; 64];
        assert_eq!(restored.chunk_read(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf[..11], b"first entry");
        assert_eq!(restored.chunk_read(&mut buf, 0).unwrap(), 12);
        assert_eq!(&buf[..12], b"second entry");

        let _ = std::fs::remove_file(&dump);
    }

    #[test]
    fn snapshot_with_torn_write_skips_the_torn_frame() {
        let name = unique("torn");
        let rb = RingBuffer::open(
            "/tmp",
            &name,
            4096,
            RbFlags::CREATE | RbFlags::NO_SEMAPHORE,
            0,
        )
        .unwrap();
        rb.chunk_write(b"committed").unwrap();
        // A crashed producer: allocated and filled but never committed.
        let staged = rb.chunk_alloc(16).unwrap();
        staged.fill(0xDD);

        let dump = format!("/tmp/{}.dump", unique("tornfile"));
        let mut out = std::fs::File::create(&dump).unwrap();
        rb.write_to_file(&mut out).unwrap();
        drop(out);

        let restored = RingBuffer::create_from_file(&dump, RbFlags::empty()).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(restored.chunk_read(&mut buf, 0).unwrap(), 9);
        assert_eq!(&buf[..9], b"committed");
        // The torn frame must not surface as data.
        assert!(restored.chunk_peek(0).unwrap().is_none());

        let _ = std::fs::remove_file(&dump);
    }

    #[test]
    fn garbage_snapshot_is_rejected() {
        let dump = format!("/tmp/{}.dump", unique("garbage"));
        std::fs::write(&dump, vec![0x33u8; 8192]).unwrap();
        assert!(matches!(
            RingBuffer::create_from_file(&dump, RbFlags::empty()),
            Err(RbError::Corrupt(_))
        ));
        let _ = std::fs::remove_file(&dump);
    }
}
