//! A `Pool` owns one contiguous address-space reservation and tiles
//! its mapped prefix with an intrusive doubly-linked list of chunks.
//! Splitting, coalescing, in-place growth and the free-chunk hint all
//! live here.
//!
//! The large pool reuses the same struct with `size == 0` as a
//! registry of individually mapped chunks; its operations are in
//! `large.rs`.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ptr;

use crate::alignment::align_up;
use crate::chunk;
use crate::chunk::ChunkHeader;
use crate::chunk::HEADER_SIZE;
use crate::map;

pub struct Pool {
    /// Short display tag ("TINY" / "SMALL" / "LARGE").
    pub(crate) slug: &'static str,
    /// Total reserved bytes; 0 is the large-pool sentinel.
    pub(crate) size: usize,
    /// Inclusive bounds on the total chunk size (payload + header)
    /// this pool accepts.
    pub(crate) min_chunk_size: usize,
    pub(crate) max_chunk_size: usize,
    /// Base of the reservation; null until first use.
    pub(crate) data: *mut u8,
    /// Frontier: first byte of the reservation never handed to a
    /// chunk.  Grows as chunks are built, retreats on tail release.
    pub(crate) unmapped: *mut u8,
    /// Head and tail of the intrusive chunk list.
    pub(crate) chunks: *mut ChunkHeader,
    pub(crate) last_chunk: *mut ChunkHeader,
    /// Best-known small free chunk.  Advisory: correctness never
    /// depends on it being up to date.
    pub(crate) free_chunks: *mut ChunkHeader,
}

impl Pool {
    pub(crate) const fn unconfigured() -> Pool {
        Pool {
            slug: "",
            size: 0,
            min_chunk_size: 0,
            max_chunk_size: 0,
            data: ptr::null_mut(),
            unmapped: ptr::null_mut(),
            chunks: ptr::null_mut(),
            last_chunk: ptr::null_mut(),
            free_chunks: ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn is_large(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn iter(&self) -> chunk::ChunkIter {
        chunk::iter_from(self.chunks)
    }

    /// Maps the pool's reservation on first use.  Returns false when
    /// the OS refuses, which callers surface as out-of-memory.
    #[ensures(ret -> self.is_large() || !self.data.is_null())]
    pub(crate) fn reserve(&mut self) -> bool {
        if !self.data.is_null() || self.size == 0 {
            return true;
        }

        match map::reserve_region(self.size) {
            Ok(base) => {
                self.data = base.as_ptr() as *mut u8;
                self.unmapped = self.data;
                true
            }
            Err(_) => false,
        }
    }

    /// Bytes of the reservation beyond the frontier.
    pub(crate) fn frontier_room(&self) -> usize {
        let end = self.data as usize + self.size;
        let unmapped = self.unmapped as usize;

        if unmapped > end {
            0
        } else {
            end - unmapped
        }
    }

    /// Remembers `chunk` as the reuse hint if it is smaller than the
    /// current one.
    fn note_freed_chunk(&mut self, chunk: *mut ChunkHeader) {
        if self.free_chunks.is_null()
            || unsafe { (*chunk).size < (*self.free_chunks).size }
        {
            self.free_chunks = chunk;
        }
    }

    /// Drops the hint and recomputes it from the head of the list.
    fn refresh_free_hint(&mut self) {
        self.free_chunks = ptr::null_mut();
        self.free_chunks = self.find_next_unused(ptr::null_mut(), 0);
    }

    /// Returns the first free chunk of at least `min_size` payload
    /// bytes, walking `next` from `from` (null means: try the hint,
    /// then the head).
    pub(crate) fn find_next_unused(
        &self,
        from: *mut ChunkHeader,
        min_size: usize,
    ) -> *mut ChunkHeader {
        let mut cur = from;

        if cur.is_null() {
            // The hint is advisory; trust it only while it is still
            // free and big enough.
            if chunk::is_free(self.free_chunks)
                && unsafe { (*self.free_chunks).size } >= min_size
            {
                return self.free_chunks;
            }
            cur = self.chunks;
        }

        unsafe {
            while !cur.is_null() && ((*cur).used || (*cur).size < min_size) {
                cur = (*cur).next;
            }
        }
        chunk::assert_chunk(cur);
        cur
    }

    /// Lays a fresh chunk at the frontier and links it as the new
    /// tail.  Returns null when the frontier is exhausted.
    #[requires(align_up(requested) + HEADER_SIZE <= self.max_chunk_size,
               "Frontier chunks stay within the pool's size class")]
    #[ensures(ret.is_null() || chunk::is_live(ret))]
    pub(crate) fn build_chunk(&mut self, requested: usize) -> *mut ChunkHeader {
        let data_size = align_up(requested);
        let chunk_size = data_size + HEADER_SIZE;

        if self.frontier_room() < chunk_size {
            return ptr::null_mut();
        }

        unsafe {
            let built =
                chunk::write_header(self.unmapped, data_size, true, self.last_chunk, ptr::null_mut());

            if self.chunks.is_null() {
                self.chunks = built;
            } else {
                (*self.last_chunk).next = built;
            }
            self.last_chunk = built;

            let end = self.data.add(self.size);
            let mut new_unmapped = self.unmapped.add(chunk_size);
            if new_unmapped > end {
                new_unmapped = end;
            }
            self.unmapped = new_unmapped;

            chunk::assert_chunk(built);
            built
        }
    }

    /// Whether `chunk` can be split into a used left half of
    /// `split_size` payload bytes and a right remainder that still
    /// meets the pool's minimum chunk size.
    pub(crate) fn can_split(&self, chunk: *mut ChunkHeader, split_size: usize) -> bool {
        if self.size == 0 {
            return false;
        }

        let total = unsafe { (*chunk).total_size() };
        let left_total = split_size + HEADER_SIZE;
        if total < left_total {
            return false;
        }

        total - left_total >= self.min_chunk_size
    }

    /// Splits `chunk`, keeping the left half used at `requested`
    /// (aligned up) payload bytes.  The right remainder is linked in
    /// free and coalesced with its own right neighbour; it is
    /// returned.
    #[requires(self.can_split(chunk, align_up(requested)),
               "Callers check can_split first")]
    pub(crate) fn split_chunk(
        &mut self,
        chunk: *mut ChunkHeader,
        requested: usize,
    ) -> *mut ChunkHeader {
        let size = align_up(requested);

        unsafe {
            let total = (*chunk).total_size();
            let left_total = size + HEADER_SIZE;
            let right_total = total - left_total;

            let right = chunk::write_header(
                (chunk as *mut u8).add(left_total),
                right_total - HEADER_SIZE,
                false,
                chunk,
                (*chunk).next,
            );

            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = right;
            }
            (*chunk).size = size;
            (*chunk).used = true;
            (*chunk).next = right;

            if self.last_chunk == chunk {
                self.last_chunk = right;
            }

            self.refresh_free_hint();
            let right = self.merge_around(right);

            chunk::assert_chunk(chunk);
            chunk::assert_chunk(right);
            right
        }
    }

    /// Folds `b` into its left physical neighbour `a`.
    #[requires(!a.is_null() && !b.is_null(), "Merging takes two real chunks")]
    fn merge_two(&mut self, a: *mut ChunkHeader, b: *mut ChunkHeader) {
        unsafe {
            debug_assert_eq!((*a).next, b);
            debug_assert_eq!((*b).prev, a);

            (*a).size += (*b).total_size();
            (*a).next = (*b).next;
            if !(*b).next.is_null() {
                (*(*b).next).prev = a;
            }

            if self.last_chunk == b {
                self.last_chunk = a;
            }
            if self.free_chunks == b {
                self.free_chunks = a;
            }
            chunk::assert_chunk(a);
        }
    }

    /// Absorbs every free neighbour of `chunk`, rightward then
    /// leftward, and returns the resulting (possibly shifted) chunk.
    pub(crate) fn merge_around(&mut self, chunk: *mut ChunkHeader) -> *mut ChunkHeader {
        let mut chunk = chunk;

        unsafe {
            let mut next = (*chunk).next;
            while chunk::is_free(next) {
                self.merge_two(chunk, next);
                next = (*chunk).next;
            }

            let mut prev = (*chunk).prev;
            while chunk::is_free(prev) {
                self.merge_two(prev, chunk);
                chunk = prev;
                prev = (*chunk).prev;
            }
        }
        chunk
    }

    /// Attempts to satisfy `new_req` in place: already big enough, a
    /// tail extension into the frontier, or a merge with a free right
    /// neighbour (split back if room remains).  Returns null when the
    /// chunk cannot grow here.
    pub(crate) fn grow_chunk(
        &mut self,
        chunk: *mut ChunkHeader,
        new_req: usize,
    ) -> *mut ChunkHeader {
        let new_size = align_up(new_req);
        let new_chunk_size = new_size + HEADER_SIZE;

        unsafe {
            if new_size <= (*chunk).size {
                return chunk;
            }
            if new_chunk_size > self.max_chunk_size {
                return ptr::null_mut();
            }

            if (*chunk).next.is_null() {
                if self.frontier_room() < new_chunk_size {
                    return ptr::null_mut();
                }
                (*chunk).size = new_size;
                self.unmapped = (chunk as *mut u8).add(new_chunk_size);
                chunk::assert_chunk(chunk);
                return chunk;
            }

            let next = (*chunk).next;
            if !(*next).used
                && (*next).total_size() + (*chunk).total_size() >= new_chunk_size
            {
                self.merge_two(chunk, next);
                if self.can_split(chunk, new_size) {
                    self.split_chunk(chunk, new_req);
                } else {
                    // The merge may have folded the free hint into a
                    // live chunk.
                    self.refresh_free_hint();
                }
                chunk::assert_chunk(chunk);
                return chunk;
            }

            ptr::null_mut()
        }
    }

    /// Serves `requested` bytes from this pool: reuse a free chunk
    /// (splitting any surplus) or build at the frontier.  Null means
    /// the pool is exhausted.
    #[requires(requested > 0)]
    #[requires(align_up(requested) + HEADER_SIZE <= self.max_chunk_size,
               "The dispatcher routes requests to a pool that fits them")]
    #[ensures(ret.is_null() || chunk::is_live(ret))]
    pub(crate) fn allocate(&mut self, requested: usize) -> *mut ChunkHeader {
        let size = align_up(requested);

        let found = self.find_next_unused(ptr::null_mut(), size);
        if found.is_null() {
            return self.build_chunk(requested);
        }

        if self.can_split(found, size) {
            self.split_chunk(found, requested);
            self.free_chunks = ptr::null_mut();
            self.free_chunks = self.find_next_unused(unsafe { (*found).next }, 0);
        } else {
            unsafe {
                (*found).used = true;
            }
            self.refresh_free_hint();
        }

        chunk::assert_chunk(found);
        found
    }

    /// Releases a live chunk: coalesce around it, then either retract
    /// the frontier (tail) or remember it as the reuse hint.
    #[requires(chunk::is_live(chunk), "Only live chunks are released")]
    pub(crate) fn release(&mut self, chunk: *mut ChunkHeader) {
        unsafe {
            (*chunk).used = false;
        }
        let chunk = self.merge_around(chunk);

        unsafe {
            if (*chunk).next.is_null() {
                // Tail release: the chunk rejoins the frontier instead
                // of lingering as a trailing free chunk.
                if self.chunks == chunk {
                    self.chunks = ptr::null_mut();
                }
                self.last_chunk = (*chunk).prev;
                if !(*chunk).prev.is_null() {
                    (*(*chunk).prev).next = ptr::null_mut();
                }
                self.unmapped = chunk as *mut u8;
                self.refresh_free_hint();
            } else {
                self.note_freed_chunk(chunk);
            }
        }
    }

    /// Maps a payload pointer back to its chunk, or null.  Non-large
    /// pools reject out-of-range pointers in O(1) and then walk from
    /// whichever end of the list is closer.
    pub(crate) fn find_by_payload(&self, ptr: *mut u8) -> *mut ChunkHeader {
        if ptr.is_null() {
            return std::ptr::null_mut();
        }

        if !self.is_large() {
            let addr = ptr as usize;
            if addr < self.data as usize || addr >= self.unmapped as usize {
                return std::ptr::null_mut();
            }

            let closer_to_end = addr - self.data as usize > self.unmapped as usize - addr;
            if closer_to_end {
                let mut cur = self.last_chunk;
                unsafe {
                    while !cur.is_null() && (*cur).payload() != ptr {
                        cur = (*cur).prev;
                    }
                }
                return cur;
            }
        }

        let mut cur = self.chunks;
        unsafe {
            while !cur.is_null() {
                if (*cur).payload() == ptr {
                    return cur;
                }
                cur = (*cur).next;
            }
        }
        std::ptr::null_mut()
    }
}

#[cfg(test)]
impl Pool {
    /// Verifies the tiling invariants: the list exactly covers
    /// `[data, unmapped)`, `last_chunk` terminates it, and no two
    /// adjacent chunks are both free.
    pub(crate) fn check_tiling(&self) {
        if self.chunks.is_null() {
            assert_eq!(self.unmapped, self.data);
            assert!(self.last_chunk.is_null());
            return;
        }

        assert_eq!(self.chunks as *mut u8, self.data);

        let mut cursor = self.data;
        let mut prev: *mut ChunkHeader = std::ptr::null_mut();
        let mut prev_free = false;
        for cur in self.iter() {
            let header = unsafe { &*cur };
            assert_eq!(cur as *mut u8, cursor, "gap or overlap in the tiling");
            assert_eq!(header.prev, prev);
            assert!(header.size > 0);
            assert_eq!(header.size % crate::alignment::ALIGNMENT, 0);
            assert!(
                !(prev_free && !header.used),
                "two adjacent free chunks survived coalescing"
            );

            prev_free = !header.used;
            prev = cur;
            cursor = cursor.wrapping_add(header.total_size());
        }

        assert_eq!(prev, self.last_chunk);
        assert_eq!(cursor, self.unmapped);
    }
}
