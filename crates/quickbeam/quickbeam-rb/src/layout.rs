//! Shared memory layout of a chunk ring buffer.
//!
//! The backing file is `[ head | data ]`; the live mapping doubles the data
//! segment (see `quickbeam_mmap::DoubleMap`) so chunks stay contiguous across
//! the wrap point.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RingHeader │ user data │ padding to page boundary            │  head
//! ├──────────────────────────────────────────────────────────────┤
//! │ data area: word_count 32-bit words of framed chunks          │  data
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Index arithmetic
//!
//! `write_pt` and `read_pt` are word indices that advance monotonically
//! modulo `2 * word_count`. Keeping one extra modulus bit distinguishes a
//! completely full ring from an empty one: `used == 0` is empty and
//! `used == word_count` is full, where `used = (write - read) mod 2N`.
//! The physical word offset of an index is simply `index mod word_count`.
//!
//! # Chunk frame
//!
//! Each chunk is one length word followed by the payload, padded to word
//! alignment. The length word's low 31 bits count bytes *including the word
//! itself*; the high bit is the commit marker. A clear commit bit means the
//! chunk is either still being written or was reclaimed, and readers must
//! not deliver it.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicU32};

/// "QBR1" in ASCII.
pub const RB_MAGIC: u32 = 0x5142_5231;

/// Bumped on incompatible layout changes; snapshots embed it too.
pub const RB_VERSION: u32 = 1;

/// High bit of the chunk length word: set exactly when the chunk is visible
/// to the reader.
pub const CHUNK_COMMIT: u32 = 0x8000_0000;

/// Low 31 bits of the chunk length word.
pub const CHUNK_LEN_MASK: u32 = !CHUNK_COMMIT;

/// Words occupied by the chunk length word.
pub const CHUNK_HEADER_WORDS: u32 = 1;

/// Bytes per data-area word.
pub const WORD_BYTES: usize = 4;

/// Upper bound on `word_count`, keeping `3 * word_count` comfortably inside
/// `u32` for the index arithmetic (1 GiB of data area).
pub const MAX_WORD_COUNT: u32 = 1 << 28;

/// Longest ring name stored in the header.
pub const MAX_NAME: usize = 88;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RbFlags: u32 {
        /// Create the segment rather than opening an existing one.
        const CREATE         = 0x01;
        /// Writes reclaim the oldest chunks when out of space.
        const OVERWRITE      = 0x02;
        /// Producer and consumer are threads of one process.
        const SHARED_THREAD  = 0x04;
        /// Producer and consumer are separate processes (named semaphore).
        const SHARED_PROCESS = 0x08;
        /// No wakeup primitive; blocking reads spin.
        const NO_SEMAPHORE   = 0x10;
    }
}

/// Header at offset 0 of every ring buffer segment.
///
/// `#[repr(C)]` keeps the field order stable for snapshots and for peers
/// built from the same source. The name is carried so that whichever opener
/// drops the last reference can unlink the named semaphore.
#[repr(C)]
pub struct RingHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    /// Data-area size in words (N).
    pub word_count: u32,
    /// Producer index, monotonic modulo 2N.
    pub write_pt: AtomicU32,
    /// Consumer index, monotonic modulo 2N.
    pub read_pt: AtomicU32,
    /// Largest used-word count the producer has observed.
    pub high_water: AtomicU32,
    /// Shared reference count, CAS-managed.
    pub ref_count: AtomicI32,
    pub user_data_bytes: u32,
    pub name_len: u32,
    pub name: [u8; MAX_NAME],
}

impl RingHeader {
    pub fn init(&mut self, flags: RbFlags, word_count: u32, user_data_bytes: u32, name: &str) {
        self.magic = RB_MAGIC;
        self.version = RB_VERSION;
        self.flags = flags.bits();
        self.word_count = word_count;
        self.write_pt = AtomicU32::new(0);
        self.read_pt = AtomicU32::new(0);
        self.high_water = AtomicU32::new(0);
        self.ref_count = AtomicI32::new(1);
        self.user_data_bytes = user_data_bytes;
        let n = name.len().min(MAX_NAME);
        self.name_len = n as u32;
        self.name = [0; MAX_NAME];
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
    }

    /// Validates an existing header before trusting any of its indices.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != RB_MAGIC {
            return Err("bad magic");
        }
        if self.version != RB_VERSION {
            return Err("version mismatch");
        }
        if self.word_count == 0 || self.word_count > MAX_WORD_COUNT {
            return Err("implausible word count");
        }
        if self.name_len as usize > MAX_NAME {
            return Err("name overruns header");
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    pub fn rb_flags(&self) -> RbFlags {
        RbFlags::from_bits_truncate(self.flags)
    }
}

/// Bytes of the head segment (header + user data), page aligned.
pub fn head_segment_len(user_data_bytes: usize) -> usize {
    quickbeam_mmap::page_align(size_of::<RingHeader>() + user_data_bytes)
}

/// Words used in the ring, in `[0, word_count]`.
#[inline]
pub fn used_words(write_pt: u32, read_pt: u32, word_count: u32) -> u32 {
    let m = 2 * word_count;
    (write_pt + m - read_pt) % m
}

/// Advances an index by `words`, staying in `[0, 2 * word_count)`.
#[inline]
pub fn advance(idx: u32, words: u32, word_count: u32) -> u32 {
    (idx + words) % (2 * word_count)
}

/// Physical word offset of an index.
#[inline]
pub fn position(idx: u32, word_count: u32) -> u32 {
    idx % word_count
}

/// Whole words needed for a payload of `len` bytes plus the chunk header.
#[inline]
pub fn chunk_words(len: usize) -> u32 {
    CHUNK_HEADER_WORDS + (len.div_ceil(WORD_BYTES)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_before_first_page() {
        assert!(size_of::<RingHeader>() <= 4096);
        // Atomics must not change the C layout.
        assert_eq!(size_of::<RingHeader>() % 4, 0);
    }

    #[test]
    fn used_words_spans_the_extra_modulus_bit() {
        let n = 8;
        assert_eq!(used_words(0, 0, n), 0);
        assert_eq!(used_words(8, 0, n), 8); // full
        assert_eq!(used_words(2, 14, n), 4); // write wrapped past 2N
        assert_eq!(advance(14, 4, n), 2);
    }

    #[test]
    fn chunk_words_rounds_up() {
        assert_eq!(chunk_words(0), 1);
        assert_eq!(chunk_words(1), 2);
        assert_eq!(chunk_words(4), 2);
        assert_eq!(chunk_words(5), 3);
    }

    #[test]
    fn validate_rejects_foreign_headers() {
        let mut h: RingHeader = unsafe { std::mem::zeroed() };
        assert!(h.validate().is_err());
        h.init(RbFlags::CREATE, 1024, 0, "t");
        assert!(h.validate().is_ok());
        assert_eq!(h.name(), "t");
    }
}
