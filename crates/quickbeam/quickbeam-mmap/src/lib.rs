//! Memory-mapped file primitives for quickbeam.
//!
//! Two mappings are provided:
//!
//! - [`MmapFile`]: a plain read-only map of an existing file, used when a
//!   consumer only needs to inspect file contents in place (snapshot files).
//! - [`DoubleMap`]: the wrap-around mapping that backs live ring buffers. The
//!   file's data segment is mapped twice, back to back, in one reserved
//!   virtual region, so a byte range that straddles the physical end of the
//!   data segment is still contiguous in virtual memory.
//!
//! # Double-map layout
//!
//! ```text
//! file:    [ head | data ]
//!
//! memory:  [ head | data | data ]
//!            ^      ^      ^
//!            |      |      second view of the same file pages
//!            |      first view
//!            mapped once
//! ```

use memmap2::Mmap;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    ptr,
};

/// Host page size in bytes.
pub fn page_size() -> usize {
    // sysconf cannot fail for _SC_PAGESIZE on any supported platform
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Rounds `len` up to a whole number of pages.
pub fn page_align(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

pub struct MmapFile {
    /// File handle kept alive to maintain the memory map validity
    _file: File,
    /// Memory-mapped region providing read-only access to file contents
    mmap: Mmap,
}

impl MmapFile {
    /// Open an existing file and map it read-only.
    pub fn open_ro<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { _file: file, mmap })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

/// A shared, writable mapping of `file` laid out as `[head][data][data]`.
///
/// `head_len` and `data_len` must both be page multiples and the file must be
/// at least `head_len + data_len` bytes long. The two data views alias the
/// same physical pages; a write through one view is visible through the other.
pub struct DoubleMap {
    /// File handle kept alive to maintain the memory map validity
    _file: File,
    base: *mut u8,
    head_len: usize,
    data_len: usize,
}

// The mapping itself is plain shared memory; all synchronization between
// concurrent users is the caller's responsibility (atomics in the head
// segment).
unsafe impl Send for DoubleMap {}
unsafe impl Sync for DoubleMap {}

impl DoubleMap {
    /// Map `file` with the data segment doubled.
    ///
    /// Reserves `head_len + 2 * data_len` of address space, then maps the
    /// file over it with `MAP_FIXED`: bytes `[0, head_len + data_len)` once,
    /// and bytes `[head_len, head_len + data_len)` a second time directly
    /// after the first data view.
    pub fn map(file: File, head_len: usize, data_len: usize) -> io::Result<Self> {
        let page = page_size();
        if head_len % page != 0 || data_len % page != 0 || data_len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "double-map segments must be non-empty page multiples",
            ));
        }
        let total = head_len + 2 * data_len;

        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();

        // Reserve the whole region first so both file views land adjacently.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = base as *mut u8;

        let first = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                head_len + data_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if first == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return Err(err);
        }

        let second = unsafe {
            libc::mmap(
                base.add(head_len + data_len) as *mut libc::c_void,
                data_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                head_len as libc::off_t,
            )
        };
        if second == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return Err(err);
        }

        Ok(Self {
            _file: file,
            base,
            head_len,
            data_len,
        })
    }

    /// Start of the head segment.
    #[inline]
    pub fn head_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Start of the (doubled) data segment. A read or write of up to
    /// `data_len` bytes starting anywhere in `[0, data_len)` is contiguous.
    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(self.head_len) }
    }

    #[inline]
    pub fn head_len(&self) -> usize {
        self.head_len
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.data_len
    }
}

impl Drop for DoubleMap {
    fn drop(&mut self) {
        let total = self.head_len + 2 * self.data_len;
        // The file handle is dropped after the views are gone.
        unsafe { libc::munmap(self.base as *mut libc::c_void, total) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/tmp/quickbeam_mmap_{tag}_{ts}")
    }

    fn sized_file(path: &str, len: usize) -> File {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .unwrap();
        file.set_len(len as u64).unwrap();
        file
    }

    #[test]
    fn double_map_aliases_data_views() {
        let page = page_size();
        let path = temp_path("alias");
        let file = sized_file(&path, 2 * page);

        let dm = DoubleMap::map(file, page, page).unwrap();
        unsafe {
            let data = dm.data_ptr();
            *data = 0x5A;
            // Same physical page through the second view.
            assert_eq!(*data.add(dm.data_len()), 0x5A);
            *data.add(dm.data_len() + 1) = 0xC3;
            assert_eq!(*data.add(1), 0xC3);
        }

        drop(dm);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn double_map_write_straddles_wrap() {
        let page = page_size();
        let path = temp_path("wrap");
        let file = sized_file(&path, 2 * page);

        let dm = DoubleMap::map(file, page, page).unwrap();
        let msg = b"wraps across the end";
        unsafe {
            // Start the write a few bytes before the physical end of data.
            let start = dm.data_len() - 4;
            ptr::copy_nonoverlapping(msg.as_ptr(), dm.data_ptr().add(start), msg.len());
            // The tail is readable from the front of the first view.
            let tail = std::slice::from_raw_parts(dm.data_ptr(), msg.len() - 4);
            assert_eq!(tail, &msg[4..]);
        }

        drop(dm);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn double_map_rejects_unaligned_segments() {
        let path = temp_path("unaligned");
        let file = sized_file(&path, 4096);
        assert!(DoubleMap::map(file, 100, 4096).is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn mmap_file_reads_contents() {
        let path = temp_path("ro");
        fs::write(&path, b"snapshot contents").unwrap();
        let mm = MmapFile::open_ro(&path).unwrap();
        assert_eq!(mm.as_slice(), b"snapshot contents");
        drop(mm);
        let _ = fs::remove_file(&path);
    }
}
