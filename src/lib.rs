//! A segregated-pool replacement for the C allocator.
//!
//! The heap keeps two contiguous reservations (tiny and small) tiled
//! by intrusive chunk lists, and a registry of individually mapped
//! large chunks.  Every public entry takes one process-global mutex
//! for its whole critical section; payload pointers are always
//! 16-byte aligned.
//!
//! Build with `--features libc_override` to export the conventional C
//! names (`malloc`, `free`, `calloc`, `realloc`, `reallocarray`, plus
//! the `show_alloc_mem` family) so the staticlib or cdylib can be
//! preloaded over the host allocator.
mod alignment;
mod chunk;
mod diag;
mod heap;
mod large;
mod map;
mod pool;
mod show;

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::diag::FdWriter;
use crate::diag::STDOUT_FD;

/// Attempts to allocate `size` bytes.  Zero-size requests and
/// exhausted pools yield `None`.
pub fn allocate(size: usize) -> Option<NonNull<c_void>> {
    NonNull::new(heap::allocate(size) as *mut c_void)
}

/// Releases an allocation returned by this crate.  Null and unknown
/// pointers are silently ignored.
pub fn release(ptr: *mut c_void) {
    heap::release(ptr as *mut u8);
}

/// Allocates `nmemb * size` zero-filled bytes, guarding the
/// multiplication against overflow.
pub fn zero_allocate(nmemb: usize, size: usize) -> Option<NonNull<c_void>> {
    NonNull::new(heap::zero_allocate(nmemb, size) as *mut c_void)
}

/// Resizes an allocation, preserving its payload prefix.
/// `resize(null, n)` allocates; `resize(p, 0)` releases and returns
/// `None`; resizing a pointer this crate does not own returns `None`.
pub fn resize(ptr: *mut c_void, size: usize) -> Option<NonNull<c_void>> {
    NonNull::new(heap::resize(ptr as *mut u8, size) as *mut c_void)
}

/// `resize` with the `zero_allocate` overflow guard on
/// `nmemb * size`.
pub fn checked_resize_array(
    ptr: *mut c_void,
    nmemb: usize,
    size: usize,
) -> Option<NonNull<c_void>> {
    NonNull::new(heap::checked_resize_array(ptr as *mut u8, nmemb, size) as *mut c_void)
}

/// Prints one line per live allocation, grouped by pool, with the
/// total of live bytes.
pub fn show_alloc_mem() {
    heap::with_heap(|heap| {
        heap.build_pools();

        let mut writer = FdWriter::new(STDOUT_FD);
        let _ = show::render_summary(heap, &mut writer);
    });
}

/// Prints the full heap walk: pool parameters, every chunk header,
/// hexdumps of used payloads, and utilisation percentages.
pub fn show_alloc_mem_ex() {
    heap::with_heap(|heap| {
        heap.build_pools();

        let mut writer = FdWriter::new(STDOUT_FD);
        let _ = show::render_extended(heap, &mut writer);
    });
}

/// Draws one width-scaled bar per pool on the controlling terminal.
/// Does nothing when there is no terminal to query.
pub fn draw_heap() {
    heap::with_heap(|heap| {
        heap.build_pools();

        let width = match map::terminal_width() {
            Some(width) => width,
            None => return,
        };

        let mut writer = FdWriter::new(STDOUT_FD);
        let _ = show::render_bars(heap, width, &mut writer);
    });
}

/// The conventional C allocator names, for preloading over the host
/// allocator.  Feature-gated so test binaries do not interpose their
/// own allocator.
#[cfg(feature = "libc_override")]
mod c_api {
    use std::ffi::c_void;

    use crate::heap;

    #[no_mangle]
    pub extern "C" fn malloc(size: usize) -> *mut c_void {
        heap::allocate(size) as *mut c_void
    }

    /// # Safety
    ///
    /// `ptr` must be null, or a pointer previously returned by this
    /// allocator and not yet freed; other pointers are ignored, but
    /// only as long as they do not alias a live payload.
    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        heap::release(ptr as *mut u8);
    }

    #[no_mangle]
    pub extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        heap::zero_allocate(nmemb, size) as *mut c_void
    }

    /// # Safety
    ///
    /// See `free`.
    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        heap::resize(ptr as *mut u8, size) as *mut c_void
    }

    /// # Safety
    ///
    /// See `free`.
    #[no_mangle]
    pub unsafe extern "C" fn reallocarray(
        ptr: *mut c_void,
        nmemb: usize,
        size: usize,
    ) -> *mut c_void {
        heap::checked_resize_array(ptr as *mut u8, nmemb, size) as *mut c_void
    }

    #[no_mangle]
    pub extern "C" fn show_alloc_mem() {
        crate::show_alloc_mem();
    }

    #[no_mangle]
    pub extern "C" fn show_alloc_mem_ex() {
        crate::show_alloc_mem_ex();
    }

    #[no_mangle]
    pub extern "C" fn show_alloc_mem_dump() {
        crate::show_alloc_mem_ex();
    }

    #[no_mangle]
    pub extern "C" fn draw_heap() {
        crate::draw_heap();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;
    use std::sync::MutexGuard;

    lazy_static::lazy_static! {
        static ref HEAP_TEST_LOCK: Mutex<()> = Mutex::new(());
    }

    /// Serialises every test that touches the process-global heap.
    /// Each such test frees everything it allocates, so the next one
    /// starts from a clean tiling.
    pub(crate) fn heap_lock() -> MutexGuard<'static, ()> {
        match HEAP_TEST_LOCK.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
