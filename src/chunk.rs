//! In-band chunk metadata.  A chunk is a header immediately followed
//! by its payload bytes; the header lives inside the pool reservation
//! (or the large chunk's own mapping), so the list nodes ARE the
//! memory being managed.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use static_assertions::const_assert_eq;

use crate::alignment::ALIGNMENT;

/// Header preceding every payload.  `next` and `prev` point at the
/// physically adjacent chunks in the same pool; the large pool reuses
/// them as plain registry links.
#[derive(Debug)]
#[repr(C)]
pub struct ChunkHeader {
    /// Payload size in bytes, always a multiple of the alignment.
    pub(crate) size: usize,
    /// Whether the chunk currently backs a live allocation.
    pub(crate) used: bool,
    pub(crate) next: *mut ChunkHeader,
    pub(crate) prev: *mut ChunkHeader,
}

/// Distance from a chunk header to its payload.
pub const HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();

// The payload address is `header + HEADER_SIZE`; keeping the header a
// multiple of the alignment keeps every payload 16-byte aligned.
const_assert_eq!(HEADER_SIZE % ALIGNMENT, 0);

impl ChunkHeader {
    /// Header plus payload, i.e. the distance to the next chunk.
    #[inline]
    pub(crate) fn total_size(&self) -> usize {
        HEADER_SIZE + self.size
    }

    /// The address handed out to callers.
    #[inline]
    pub(crate) fn payload(&self) -> *mut u8 {
        (self as *const ChunkHeader as *mut u8).wrapping_add(HEADER_SIZE)
    }
}

/// Writes a fresh header at `at` and returns it as a chunk pointer.
///
/// # Safety
///
/// `at` must be valid for `HEADER_SIZE` bytes and aligned for
/// `ChunkHeader`.
pub(crate) unsafe fn write_header(
    at: *mut u8,
    size: usize,
    used: bool,
    prev: *mut ChunkHeader,
    next: *mut ChunkHeader,
) -> *mut ChunkHeader {
    let chunk = at as *mut ChunkHeader;

    std::ptr::write(
        chunk,
        ChunkHeader {
            size,
            used,
            next,
            prev,
        },
    );
    chunk
}

/// Returns whether `chunk` is non-null and marked in use.
#[inline]
pub(crate) fn is_live(chunk: *mut ChunkHeader) -> bool {
    !chunk.is_null() && unsafe { (*chunk).used }
}

/// Returns whether `chunk` is non-null and free.
#[inline]
pub(crate) fn is_free(chunk: *mut ChunkHeader) -> bool {
    !chunk.is_null() && !unsafe { (*chunk).used }
}

/// Iterator over a `next`-chain, yielding raw chunk pointers.
pub(crate) struct ChunkIter {
    cur: *mut ChunkHeader,
}

pub(crate) fn iter_from(head: *mut ChunkHeader) -> ChunkIter {
    ChunkIter { cur: head }
}

impl Iterator for ChunkIter {
    type Item = *mut ChunkHeader;

    fn next(&mut self) -> Option<*mut ChunkHeader> {
        if self.cur.is_null() {
            return None;
        }

        let cur = self.cur;
        self.cur = unsafe { (*cur).next };
        Some(cur)
    }
}

// Runtime invariant checking, toggled once per process from
// `FT_MALLOC_ASSERT`.  This complements the compile-time-selected
// contracts: it can be flipped on in a production binary.
static RUNTIME_CHECKS: AtomicBool = AtomicBool::new(false);
// Upper bound on payload sizes (the soft address-space limit); zero
// means unknown.
static SIZE_BOUND: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn set_runtime_checks(enabled: bool) {
    RUNTIME_CHECKS.store(enabled, Ordering::Relaxed);
}

pub(crate) fn set_size_bound(bound: usize) {
    SIZE_BOUND.store(bound, Ordering::Relaxed);
}

/// Asserts the per-chunk invariants when runtime checks are enabled.
/// A violation is an allocator bug, not a recoverable condition.
pub(crate) fn assert_chunk(chunk: *mut ChunkHeader) {
    if chunk.is_null() || !RUNTIME_CHECKS.load(Ordering::Relaxed) {
        return;
    }

    let header = unsafe { &*chunk };
    assert!(header.size > 0, "chunk {:p}: size is 0", chunk);
    assert_eq!(
        header.size % ALIGNMENT,
        0,
        "chunk {:p}: size is not aligned",
        chunk
    );
    assert_eq!(
        header.total_size() % ALIGNMENT,
        0,
        "chunk {:p}: total size is not aligned",
        chunk
    );

    let bound = SIZE_BOUND.load(Ordering::Relaxed);
    if bound > 0 {
        assert!(header.size < bound, "chunk {:p}: size is too large", chunk);
    }

    if !header.next.is_null() {
        assert_eq!(
            chunk as usize + header.total_size(),
            header.next as usize,
            "chunk {:p}: next is not physically adjacent",
            chunk
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::align_up;

    #[test]
    fn test_header_layout() {
        // 64-bit hosts: size + padded bool + two pointers.
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
        assert_eq!(align_up(HEADER_SIZE), HEADER_SIZE);
    }

    #[test]
    fn test_payload_offset() {
        let mut backing = vec![0u64; HEADER_SIZE / 2];
        let base = backing.as_mut_ptr() as *mut u8;

        let chunk = unsafe { write_header(base, 64, true, std::ptr::null_mut(), std::ptr::null_mut()) };
        let header = unsafe { &*chunk };

        assert_eq!(header.size, 64);
        assert!(header.used);
        assert_eq!(header.payload() as usize, base as usize + HEADER_SIZE);
        assert_eq!(header.total_size(), 64 + HEADER_SIZE);
    }

    #[test]
    fn test_iter_walks_chain() {
        // Lay three adjacent chunks in one buffer, as a pool would.
        let mut backing = vec![0u64; 128];
        let base = backing.as_mut_ptr() as *mut u8;

        unsafe {
            let a = write_header(base, 32, true, std::ptr::null_mut(), std::ptr::null_mut());
            let b = write_header(
                base.add((*a).total_size()),
                48,
                false,
                a,
                std::ptr::null_mut(),
            );
            (*a).next = b;
            let c = write_header(
                base.add((*a).total_size() + (*b).total_size()),
                16,
                true,
                b,
                std::ptr::null_mut(),
            );
            (*b).next = c;

            let collected: Vec<*mut ChunkHeader> = iter_from(a).collect();
            assert_eq!(collected, vec![a, b, c]);
            assert!(is_live(a));
            assert!(is_free(b));
            assert!(is_live(c));
        }
    }

    #[test]
    fn test_assert_chunk_accepts_valid_chunks() {
        let mut backing = vec![0u64; 32];
        let base = backing.as_mut_ptr() as *mut u8;
        let chunk =
            unsafe { write_header(base, 96, true, std::ptr::null_mut(), std::ptr::null_mut()) };

        set_runtime_checks(true);
        assert_chunk(chunk);
        assert_chunk(std::ptr::null_mut());
        set_runtime_checks(false);
    }
}
