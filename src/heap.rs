//! The process-global heap: two reservation-backed pools (tiny and
//! small), the large-chunk registry, the cached OS parameters, and the
//! dispatcher behind the public entry points.  Every public call takes
//! the one global mutex for its whole critical section.
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
use std::sync::Mutex;

use crate::alignment::align_down;
use crate::alignment::align_up;
use crate::alignment::copy_words;
use crate::alignment::zero_words;
use crate::chunk;
use crate::chunk::ChunkHeader;
use crate::chunk::HEADER_SIZE;
use crate::map;
use crate::pool::Pool;
use crate::show;

/// Reservation sizes, in pages.
const TINY_POOL_PAGES: usize = 128;
const SMALL_POOL_PAGES: usize = 1024;

/// Per-chunk ceilings, as a fraction of the reservation.
const TINY_POOL_CHUNK_DIVISOR: usize = 300;
const SMALL_POOL_CHUNK_DIVISOR: usize = 50;

/// Requests past this cannot have a chunk size computed without
/// overflow; they fail before touching any pool.
pub(crate) const MAX_REQUEST: usize = isize::MAX as usize;

/// Number of reservation-backed pools.
pub(crate) const HEAP_POOLS: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PoolId {
    Tiny,
    Small,
    Large,
}

impl PoolId {
    fn from_index(index: usize) -> PoolId {
        match index {
            0 => PoolId::Tiny,
            1 => PoolId::Small,
            _ => PoolId::Large,
        }
    }
}

pub struct Heap {
    /// Tiny and small, in routing order.
    pub(crate) pools: [Pool; HEAP_POOLS],
    /// Registry of individually mapped chunks.
    pub(crate) large: Pool,
    /// Zero until `build_pools` ran; doubles as the init latch.
    pub(crate) page_size: usize,
    pub(crate) limit_soft: usize,
    pub(crate) limit_hard: usize,
    pub(crate) log_chunk_alloc: bool,
}

// The heap owns every byte its raw pointers reach, and the global
// mutex serialises all access to them.
unsafe impl Send for Heap {}

lazy_static::lazy_static! {
    static ref HEAP: Mutex<Heap> = Mutex::new(Heap::zeroed());
}

/// Runs `f` with the global heap locked.
pub(crate) fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    let mut guard = match HEAP.lock() {
        Ok(guard) => guard,
        // pthread mutexes do not poison; match that.
        Err(poisoned) => poisoned.into_inner(),
    };

    f(&mut guard)
}

impl Heap {
    pub(crate) const fn zeroed() -> Heap {
        Heap {
            pools: [Pool::unconfigured(), Pool::unconfigured()],
            large: Pool::unconfigured(),
            page_size: 0,
            limit_soft: 0,
            limit_hard: 0,
            log_chunk_alloc: false,
        }
    }

    pub(crate) fn pool_mut(&mut self, id: PoolId) -> &mut Pool {
        match id {
            PoolId::Tiny => &mut self.pools[0],
            PoolId::Small => &mut self.pools[1],
            PoolId::Large => &mut self.large,
        }
    }

    /// Derives the size classes from the page size and caches the OS
    /// parameters.  Idempotent; a failed rlimit query leaves the heap
    /// in its zero state, and every later allocation fails.
    pub(crate) fn build_pools(&mut self) {
        if self.page_size != 0 {
            return;
        }

        chunk::set_runtime_checks(map::env_flag(b"FT_MALLOC_ASSERT\0"));
        self.log_chunk_alloc = map::env_flag(b"FT_MALLOC_LOG_CHUNK_ALLOC\0");
        self.page_size = map::page_size();

        let (soft, hard) = match map::address_space_limit() {
            Ok(limits) => limits,
            Err(_) => return,
        };
        self.limit_soft = soft;
        self.limit_hard = hard;
        chunk::set_size_bound(soft);

        {
            let tiny = &mut self.pools[0];
            tiny.slug = "TINY";
            tiny.size = TINY_POOL_PAGES * self.page_size;
            tiny.max_chunk_size = align_down(tiny.size / TINY_POOL_CHUNK_DIVISOR);
            tiny.min_chunk_size = align_up(1) + HEADER_SIZE;
        }

        let tiny_max = self.pools[0].max_chunk_size;
        {
            let small = &mut self.pools[1];
            small.slug = "SMALL";
            small.size = SMALL_POOL_PAGES * self.page_size;
            small.max_chunk_size = align_down(small.size / SMALL_POOL_CHUNK_DIVISOR);
            small.min_chunk_size = align_up(tiny_max + 1);
        }

        // The large pool has no slot in the array; set its fields
        // directly.
        self.large.slug = "LARGE";
        self.large.min_chunk_size = align_up(self.pools[1].max_chunk_size + 1);
    }

    /// Dispatches a request to the first pool whose size class admits
    /// it, falling back to the large path.
    #[ensures(ret.is_null() || chunk::is_live(ret))]
    pub(crate) fn alloc(&mut self, requested: usize) -> *mut ChunkHeader {
        self.build_pools();
        if requested == 0 || requested > MAX_REQUEST {
            return ptr::null_mut();
        }

        let chunk_size = align_up(requested) + HEADER_SIZE;
        for pool in self.pools.iter_mut() {
            if chunk_size <= pool.max_chunk_size {
                if !pool.reserve() {
                    return ptr::null_mut();
                }

                let chunk = pool.allocate(requested);
                if !chunk.is_null() {
                    return chunk;
                }
                // Pool exhausted; fall through to the next class.
            }
        }

        let (page_size, soft_limit) = (self.page_size, self.limit_soft);
        self.large.build_large_chunk(requested, page_size, soft_limit)
    }

    /// Locates the chunk owning `ptr` across all pools.
    pub(crate) fn find_chunk(&self, ptr: *mut u8) -> Option<(PoolId, *mut ChunkHeader)> {
        for (index, pool) in self.pools.iter().enumerate() {
            let chunk = pool.find_by_payload(ptr);
            if !chunk.is_null() {
                return Some((PoolId::from_index(index), chunk));
            }
        }

        let chunk = self.large.find_by_payload(ptr);
        if !chunk.is_null() {
            return Some((PoolId::Large, chunk));
        }
        None
    }

    /// Releases the allocation owning `ptr`.  Unknown pointers are
    /// reported as false, not touched.
    pub(crate) fn dealloc(&mut self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return false;
        }

        match self.find_chunk(ptr) {
            Some((PoolId::Large, chunk)) => self.large.release_large_chunk(chunk),
            Some((id, chunk)) => {
                self.pool_mut(id).release(chunk);
                true
            }
            None => false,
        }
    }

    /// Resize policy: keep the chunk if it already fits (splitting off
    /// any splittable surplus), else grow in place, else move.
    pub(crate) fn resize_chunk(
        &mut self,
        id: PoolId,
        chunk: *mut ChunkHeader,
        new_req: usize,
    ) -> *mut ChunkHeader {
        if new_req > MAX_REQUEST {
            return ptr::null_mut();
        }

        unsafe {
            if (*chunk).size >= new_req {
                let new_size = align_up(new_req);
                let pool = self.pool_mut(id);
                if pool.can_split(chunk, new_size) {
                    pool.split_chunk(chunk, new_req);
                }
                return chunk;
            }

            let grown = match id {
                PoolId::Large => {
                    let (page_size, soft_limit) = (self.page_size, self.limit_soft);
                    self.large
                        .grow_large_chunk(chunk, new_req, page_size, soft_limit)
                }
                _ => self.pool_mut(id).grow_chunk(chunk, new_req),
            };
            if !grown.is_null() {
                return grown;
            }

            // Move: fresh chunk, word-copy the old payload, release
            // the old chunk into its own pool.
            let fresh = self.alloc(new_req);
            if fresh.is_null() {
                return ptr::null_mut();
            }
            copy_words((*fresh).payload(), (*chunk).payload(), (*chunk).size);

            match id {
                PoolId::Large => {
                    self.large.release_large_chunk(chunk);
                }
                _ => self.pool_mut(id).release(chunk),
            }
            fresh
        }
    }
}

fn payload_or_null(chunk: *mut ChunkHeader) -> *mut u8 {
    if chunk.is_null() {
        ptr::null_mut()
    } else {
        unsafe { (*chunk).payload() }
    }
}

/// Core of `malloc`: lock, dispatch, return the payload pointer.
pub(crate) fn allocate(size: usize) -> *mut u8 {
    with_heap(|heap| {
        let chunk = heap.alloc(size);

        chunk::assert_chunk(chunk);
        if heap.log_chunk_alloc && !chunk.is_null() {
            show::log_chunk(chunk);
        }
        payload_or_null(chunk)
    })
}

/// Core of `free`: unknown or null pointers are silently ignored.
pub(crate) fn release(ptr: *mut u8) {
    with_heap(|heap| {
        heap.build_pools();
        heap.dealloc(ptr);
    });
}

/// Core of `realloc`.  `resize(null, n)` allocates; `resize(p, 0)`
/// releases and returns null; resizing an unknown pointer returns
/// null.
pub(crate) fn resize(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(size);
    }
    if size == 0 {
        release(ptr);
        return ptr::null_mut();
    }

    with_heap(|heap| {
        heap.build_pools();

        let (id, chunk) = match heap.find_chunk(ptr) {
            Some(found) => found,
            None => return ptr::null_mut(),
        };

        let resized = heap.resize_chunk(id, chunk, size);
        chunk::assert_chunk(resized);
        if heap.log_chunk_alloc && !resized.is_null() {
            show::log_chunk(resized);
        }
        payload_or_null(resized)
    })
}

/// Core of `calloc`: guards the multiplication, allocates, and zeroes
/// the aligned payload length.
pub(crate) fn zero_allocate(nmemb: usize, size: usize) -> *mut u8 {
    if nmemb == 0 || size == 0 {
        return ptr::null_mut();
    }
    if nmemb > i32::MAX as usize / size {
        return ptr::null_mut();
    }

    let total = nmemb * size;
    let ptr = allocate(total);
    if ptr.is_null() {
        return ptr;
    }

    unsafe {
        zero_words(ptr, align_up(total));
    }
    ptr
}

/// Core of `reallocarray`: the `calloc` overflow guard, then resize.
pub(crate) fn checked_resize_array(ptr: *mut u8, nmemb: usize, size: usize) -> *mut u8 {
    if nmemb == 0 || size == 0 {
        return std::ptr::null_mut();
    }
    if nmemb > i32::MAX as usize / size {
        return std::ptr::null_mut();
    }

    resize(ptr, nmemb * size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::heap_lock;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn tiny_range() -> (usize, usize) {
        with_heap(|heap| {
            heap.build_pools();
            (
                heap.pools[0].data as usize,
                heap.pools[0].data as usize + heap.pools[0].size,
            )
        })
    }

    fn assert_tiny_pool_empty() {
        with_heap(|heap| {
            let tiny = &heap.pools[0];
            assert!(tiny.chunks.is_null());
            assert_eq!(tiny.unmapped, tiny.data);
            heap.pools[0].check_tiling();
            heap.pools[1].check_tiling();
        });
    }

    #[test]
    fn test_size_classes() {
        let _guard = heap_lock();

        with_heap(|heap| {
            heap.build_pools();
            let page = heap.page_size;
            let tiny = &heap.pools[0];
            let small = &heap.pools[1];

            assert_eq!(tiny.size, 128 * page);
            assert_eq!(tiny.max_chunk_size, align_down(tiny.size / 300));
            assert_eq!(tiny.min_chunk_size, 16 + HEADER_SIZE);

            assert_eq!(small.size, 1024 * page);
            assert_eq!(small.max_chunk_size, align_down(small.size / 50));
            assert_eq!(small.min_chunk_size, align_up(tiny.max_chunk_size + 1));

            assert_eq!(heap.large.size, 0);
            assert_eq!(
                heap.large.min_chunk_size,
                align_up(small.max_chunk_size + 1)
            );
            assert!(heap.limit_soft > 0);
        });
    }

    // Allocate, free, and reallocate through the public entries; the
    // tiny pool must come back to a clean trailing state.
    #[test]
    fn test_scenario_tiny_alloc_free() {
        let _guard = heap_lock();

        let p = allocate(96);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        release(p);

        let q = allocate(16);
        assert!(!q.is_null());
        assert_eq!(q as usize % 16, 0);
        // The hole p left behind is reused.
        assert_eq!(q, p);
        release(q);

        let r = allocate(5235);
        assert!(!r.is_null());
        assert_eq!(r as usize % 16, 0);
        release(r);

        assert!(allocate(0).is_null());

        assert_tiny_pool_empty();
        with_heap(|heap| {
            let small = &heap.pools[1];
            assert!(small.chunks.is_null());
            assert_eq!(small.unmapped, small.data);
        });
    }

    #[test]
    fn test_scenario_split_and_coalesce() {
        let _guard = heap_lock();

        let a = allocate(64);
        let b = allocate(64);
        assert!(!a.is_null() && !b.is_null());

        release(a);
        let c = allocate(32);
        assert_eq!(c, a);

        release(c);
        release(b);
        assert_tiny_pool_empty();
    }

    #[test]
    fn test_scenario_zero_allocate() {
        let _guard = heap_lock();

        // Dirty a chunk first so reuse would show stale bytes.
        let dirty = allocate(128);
        assert!(!dirty.is_null());
        unsafe {
            std::ptr::write_bytes(dirty, 0xa5, 128);
        }
        release(dirty);

        let p = zero_allocate(4, 32);
        assert!(!p.is_null());
        assert_eq!(p, dirty);
        for i in 0..128 {
            assert_eq!(unsafe { *p.add(i) }, 0);
        }
        release(p);

        assert!(zero_allocate(usize::MAX, 2).is_null());
        assert!(zero_allocate(0, 32).is_null());
        assert!(zero_allocate(32, 0).is_null());
        assert_tiny_pool_empty();
    }

    #[test]
    fn test_scenario_resize_grows_tail_in_place() {
        let _guard = heap_lock();

        let p = allocate(64);
        assert!(!p.is_null());
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), p, 5);
        }

        let q = resize(p, 128);
        assert!(!q.is_null());
        // The chunk is the tail with frontier room: it grows in place.
        assert_eq!(q, p);
        assert_eq!(unsafe { std::slice::from_raw_parts(q, 5) }, b"hello");

        release(q);
        assert_tiny_pool_empty();
    }

    #[test]
    fn test_scenario_large_path() {
        let _guard = heap_lock();

        let p = allocate(10 * 1024 * 1024);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);

        with_heap(|heap| {
            let (id, chunk) = heap.find_chunk(p).expect("large chunk is registered");
            assert_eq!(id, PoolId::Large);
            unsafe {
                assert!((*chunk).size >= 10 * 1024 * 1024);
            }
        });

        release(p);
        with_heap(|heap| {
            assert!(heap.large.chunks.is_null());
            assert!(heap.large.last_chunk.is_null());
        });
    }

    #[test]
    fn test_scenario_resize_null_and_zero() {
        let _guard = heap_lock();

        // resize(null, n) is allocate(n).
        let p = resize(std::ptr::null_mut(), 48);
        assert!(!p.is_null());

        // resize(p, 0) releases and returns null.
        assert!(resize(p, 0).is_null());
        assert_tiny_pool_empty();
    }

    #[test]
    fn test_resize_shrink_splits_surplus() {
        let _guard = heap_lock();

        let p = allocate(256);
        let fence = allocate(64);
        assert!(!p.is_null() && !fence.is_null());

        let q = resize(p, 64);
        assert_eq!(q, p);
        with_heap(|heap| {
            let (_, chunk) = heap.find_chunk(q).expect("chunk survives the shrink");
            unsafe {
                assert_eq!((*chunk).size, 64);
            }
            heap.pools[0].check_tiling();
        });

        release(fence);
        release(q);
        assert_tiny_pool_empty();
    }

    #[test]
    fn test_resize_move_preserves_contents_across_classes() {
        let _guard = heap_lock();

        let mut size = 32usize;
        let mut ptr = allocate(size);
        assert!(!ptr.is_null());
        for i in 0..size {
            unsafe {
                *ptr.add(i) = (i % 251) as u8;
            }
        }

        // Doubling walks the allocation from tiny through small into
        // the large pool.
        while size < 200_000 {
            let new_size = size * 2;
            let moved = resize(ptr, new_size);
            assert!(!moved.is_null());

            for i in 0..size {
                assert_eq!(unsafe { *moved.add(i) }, (i % 251) as u8, "byte {}", i);
            }
            for i in size..new_size {
                unsafe {
                    *moved.add(i) = (i % 251) as u8;
                }
            }
            ptr = moved;
            size = new_size;
        }

        release(ptr);
        assert_tiny_pool_empty();
        with_heap(|heap| assert!(heap.large.chunks.is_null()));
    }

    #[test]
    fn test_class_routing() {
        let _guard = heap_lock();

        let (tiny_max, small_max) = with_heap(|heap| {
            heap.build_pools();
            (
                heap.pools[0].max_chunk_size,
                heap.pools[1].max_chunk_size,
            )
        });

        // Largest request that still fits the tiny class.
        let tiny_fit = tiny_max - HEADER_SIZE;
        let p = allocate(tiny_fit);
        assert!(!p.is_null());
        // The reservation exists now; the payload must sit inside it.
        let (tiny_base, tiny_end) = tiny_range();
        assert!((p as usize) >= tiny_base && (p as usize) < tiny_end);

        // One alignment step past it lands in the small pool.
        let q = allocate(tiny_fit + 16);
        assert!(!q.is_null());
        assert!((q as usize) < tiny_base || (q as usize) >= tiny_end);
        with_heap(|heap| {
            assert_eq!(heap.find_chunk(q).unwrap().0, PoolId::Small);
        });

        // Past the small class, requests get their own mapping.
        let r = allocate(small_max);
        with_heap(|heap| {
            assert_eq!(heap.find_chunk(r).unwrap().0, PoolId::Large);
        });

        release(r);
        release(q);
        release(p);
        assert_tiny_pool_empty();
    }

    #[test]
    fn test_unknown_pointers_are_ignored() {
        let _guard = heap_lock();

        let mut local = 0u64;
        let foreign = &mut local as *mut u64 as *mut u8;

        release(foreign);
        assert!(resize(foreign, 64).is_null());
        release(std::ptr::null_mut());
    }

    proptest! {
        // Random allocate/release interleavings with fill-byte round
        // trips; every slot is verified before it is freed, and the
        // pools must tile cleanly afterwards.
        #[test]
        fn random_order(ops in vec((0..24usize, 1..6000usize), 1..60)) {
            let _guard = heap_lock();

            let mut slots: Vec<Option<(*mut u8, usize, u8)>> = Vec::new();
            slots.resize(24, None);

            for (round, (index, size)) in ops.iter().cloned().enumerate() {
                if let Some((ptr, len, fill)) = slots[index].take() {
                    for i in 0..len {
                        prop_assert_eq!(unsafe { *ptr.add(i) }, fill);
                    }
                    release(ptr);
                } else {
                    let ptr = allocate(size);
                    prop_assert!(!ptr.is_null());
                    prop_assert_eq!(ptr as usize % 16, 0);

                    // Live allocations never alias.
                    for other in slots.iter().flatten() {
                        prop_assert_ne!(other.0, ptr);
                    }

                    let fill = (round % 251) as u8;
                    unsafe { std::ptr::write_bytes(ptr, fill, size); }
                    slots[index] = Some((ptr, size, fill));
                }
            }

            for slot in slots.iter_mut() {
                if let Some((ptr, len, fill)) = slot.take() {
                    for i in 0..len {
                        prop_assert_eq!(unsafe { *ptr.add(i) }, fill);
                    }
                    release(ptr);
                }
            }

            with_heap(|heap| {
                heap.pools[0].check_tiling();
                heap.pools[1].check_tiling();
                assert!(heap.pools[0].chunks.is_null());
                assert!(heap.pools[1].chunks.is_null());
            });
        }

        // Resizes interleaved with writes keep the payload prefix.
        #[test]
        fn random_resize_round_trip(sizes in vec(1..4000usize, 2..12)) {
            let _guard = heap_lock();

            let mut ptr = std::ptr::null_mut();
            let mut written = 0usize;

            for size in sizes.iter().cloned() {
                let moved = resize(ptr, size);
                prop_assert!(!moved.is_null());
                ptr = moved;

                let keep = written.min(size);
                for i in 0..keep {
                    prop_assert_eq!(unsafe { *ptr.add(i) }, (i % 127) as u8);
                }
                for i in 0..size {
                    unsafe { *ptr.add(i) = (i % 127) as u8; }
                }
                written = size;
            }

            release(ptr);
            with_heap(|heap| {
                heap.pools[0].check_tiling();
                heap.pools[1].check_tiling();
            });
        }
    }
}
