//! Shared helpers for the quickbeam benchmarks.

use std::sync::atomic::{AtomicU32, Ordering};

static SEQ: AtomicU32 = AtomicU32::new(0);

/// Unique ring name for one benchmark run.
pub fn bench_ring_name(tag: &str) -> String {
    format!(
        "bench-{tag}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// A deterministic payload of `len` bytes.
pub fn make_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
