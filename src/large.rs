//! The large pool is not a reservation: every chunk owns its own
//! anonymous mapping, and the pool struct only keeps the registry
//! list.  Chunks are returned to the OS on release, and grow by
//! mapping a fresh region and copying.
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

use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;

use crate::alignment::align_up;
use crate::alignment::align_up_to;
use crate::alignment::copy_words;
use crate::chunk;
use crate::chunk::ChunkHeader;
use crate::chunk::HEADER_SIZE;
use crate::map;
use crate::pool::Pool;

/// Mapping length for a large request: the aligned payload plus the
/// header, rounded up to whole pages.  If the rounding somehow left no
/// room for the header, a page is added so the header fits.
fn large_chunk_size(requested: usize, page_size: usize) -> usize {
    let chunk_size = align_up_to(align_up(requested) + HEADER_SIZE, page_size);

    if chunk_size == align_up(requested) {
        chunk_size + page_size
    } else {
        chunk_size
    }
}

impl Pool {
    /// Maps a dedicated region for `requested` bytes and links it as
    /// the registry tail.  Refuses requests beyond the soft
    /// address-space limit.
    #[requires(self.is_large())]
    #[ensures(ret.is_null() || chunk::is_live(ret))]
    pub(crate) fn build_large_chunk(
        &mut self,
        requested: usize,
        page_size: usize,
        soft_limit: usize,
    ) -> *mut ChunkHeader {
        let chunk_size = large_chunk_size(requested, page_size);

        if chunk_size > soft_limit {
            return ptr::null_mut();
        }

        let base = match map::reserve_region(chunk_size) {
            Ok(base) => base.as_ptr() as *mut u8,
            Err(_) => return ptr::null_mut(),
        };

        unsafe {
            let built = chunk::write_header(
                base,
                chunk_size - HEADER_SIZE,
                true,
                self.last_chunk,
                ptr::null_mut(),
            );

            if self.chunks.is_null() {
                self.chunks = built;
            } else {
                (*self.last_chunk).next = built;
            }
            self.last_chunk = built;

            chunk::assert_chunk(built);
            built
        }
    }

    /// Unlinks `chunk` from the registry and unmaps its region.
    /// Returns false when the OS refuses the unmap.
    #[requires(self.is_large())]
    #[requires(chunk::is_live(chunk), "Only live chunks are released")]
    pub(crate) fn release_large_chunk(&mut self, chunk: *mut ChunkHeader) -> bool {
        unsafe {
            if !(*chunk).prev.is_null() {
                (*(*chunk).prev).next = (*chunk).next;
            }
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = (*chunk).prev;
            }
            if self.chunks == chunk {
                self.chunks = (*chunk).next;
            }
            if self.last_chunk == chunk {
                self.last_chunk = (*chunk).prev;
            }

            let total = (*chunk).total_size();
            map::release_region(NonNull::new_unchecked(chunk as *mut c_void), total).is_ok()
        }
    }

    /// Grows a large chunk by mapping a fresh region, copying the old
    /// payload, splicing the new chunk into the registry in place of
    /// the old one, and unmapping the old region.
    #[requires(self.is_large())]
    #[ensures(ret.is_null() || chunk::is_live(ret))]
    pub(crate) fn grow_large_chunk(
        &mut self,
        chunk: *mut ChunkHeader,
        new_req: usize,
        page_size: usize,
        soft_limit: usize,
    ) -> *mut ChunkHeader {
        let chunk_size = large_chunk_size(new_req, page_size);

        if chunk_size > soft_limit {
            return ptr::null_mut();
        }

        let base = match map::reserve_region(chunk_size) {
            Ok(base) => base.as_ptr() as *mut u8,
            Err(_) => return ptr::null_mut(),
        };

        unsafe {
            let fresh = chunk::write_header(
                base,
                chunk_size - HEADER_SIZE,
                true,
                (*chunk).prev,
                (*chunk).next,
            );

            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = fresh;
            }
            if !(*chunk).prev.is_null() {
                (*(*chunk).prev).next = fresh;
            }
            if self.chunks == chunk {
                self.chunks = fresh;
            }
            if self.free_chunks == chunk {
                self.free_chunks = fresh;
            }
            if self.last_chunk == chunk {
                self.last_chunk = fresh;
            }

            copy_words((*fresh).payload(), (*chunk).payload(), (*chunk).size);

            let old_total = (*chunk).total_size();
            let _ = map::release_region(NonNull::new_unchecked(chunk as *mut c_void), old_total);

            chunk::assert_chunk(fresh);
            fresh
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large_pool() -> Pool {
        let mut pool = Pool::unconfigured();
        pool.slug = "LARGE";
        pool
    }

    #[test]
    fn test_large_chunk_size_rounds_to_pages() {
        let page = map::page_size();

        assert_eq!(large_chunk_size(1, page), page);
        assert_eq!(large_chunk_size(page - HEADER_SIZE, page), page);
        assert_eq!(large_chunk_size(page, page), 2 * page);
        assert_eq!(large_chunk_size(10 << 20, page), (10 << 20) + page);
    }

    #[test]
    fn test_build_and_release() {
        let page = map::page_size();
        let mut pool = large_pool();

        let a = pool.build_large_chunk(10 << 20, page, usize::MAX);
        let b = pool.build_large_chunk(100, page, usize::MAX);
        assert!(!a.is_null() && !b.is_null());

        unsafe {
            assert_eq!((*a).size, (10 << 20) + page - HEADER_SIZE);
            assert_eq!((*a).payload() as usize % crate::alignment::ALIGNMENT, 0);
            assert_eq!((*a).next, b);
            assert_eq!((*b).prev, a);
        }
        assert_eq!(pool.chunks, a);
        assert_eq!(pool.last_chunk, b);

        // Release out of order: the registry relinks around the hole.
        assert!(pool.release_large_chunk(a));
        assert_eq!(pool.chunks, b);
        unsafe {
            assert!((*b).prev.is_null());
        }

        assert!(pool.release_large_chunk(b));
        assert!(pool.chunks.is_null());
        assert!(pool.last_chunk.is_null());
    }

    #[test]
    fn test_build_refuses_over_soft_limit() {
        let page = map::page_size();
        let mut pool = large_pool();

        assert!(pool.build_large_chunk(2 * page, page, page).is_null());
        assert!(pool.chunks.is_null());
    }

    #[test]
    fn test_grow_preserves_payload() {
        let page = map::page_size();
        let mut pool = large_pool();

        let a = pool.build_large_chunk(100, page, usize::MAX);
        assert!(!a.is_null());

        let payload = unsafe { (*a).payload() };
        for i in 0..100usize {
            unsafe {
                *payload.add(i) = (i * 7) as u8;
            }
        }

        let grown = pool.grow_large_chunk(a, 3 * page, page, usize::MAX);
        assert!(!grown.is_null());
        assert_ne!(grown, a);
        assert_eq!(pool.chunks, grown);
        assert_eq!(pool.last_chunk, grown);

        let new_payload = unsafe { (*grown).payload() };
        for i in 0..100usize {
            assert_eq!(unsafe { *new_payload.add(i) }, (i * 7) as u8);
        }

        assert!(pool.release_large_chunk(grown));
        assert!(pool.chunks.is_null());
    }
}
