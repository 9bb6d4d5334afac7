//! Thin wrappers around the operating-system primitives the allocator
//! consumes: anonymous private mappings, the page size, the
//! address-space rlimit, the terminal width, and environment flags.
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
use std::ptr::NonNull;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Attempts to map an anonymous private read-write region of `size`
/// bytes.
///
/// The `size` argument must be a multiple of the page size.
#[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % page_size() == 0,
          "Mappings are page aligned")]
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(base).expect("mmap never returns NULL on success"))
    }
}

/// Releases a region of `size` bytes starting at `base`.
///
/// The range must exactly match a single `reserve_region` call, and
/// `size` must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Returns the soft and hard address-space limits, in bytes.
/// `RLIM_INFINITY` saturates to `usize::MAX`.
#[ensures(ret.is_ok() -> ret.unwrap().0 <= ret.unwrap().1,
          "The soft limit never exceeds the hard limit")]
pub fn address_space_limit() -> Result<(usize, usize), i32> {
    let mut limits = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    let ret = unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limits) };
    if ret != 0 {
        return Err(errno());
    }

    Ok((limits.rlim_cur as usize, limits.rlim_max as usize))
}

/// Returns the controlling terminal's column count, or `None` when
/// there is no terminal to query.
pub fn terminal_width() -> Option<usize> {
    let mut window: libc::winsize = unsafe { std::mem::zeroed() };

    let ret = unsafe { libc::ioctl(0, libc::TIOCGWINSZ, &mut window as *mut libc::winsize) };
    if ret == -1 || window.ws_col == 0 {
        return None;
    }

    Some(window.ws_col as usize)
}

/// Returns whether the environment variable `name` (a NUL-terminated
/// byte string) is set.  Goes through `getenv` directly because this
/// runs under the heap lock, where the allocator must not allocate.
pub fn env_flag(name: &'static [u8]) -> bool {
    assert_eq!(
        name.last(),
        Some(&0u8),
        "env_flag takes a NUL-terminated name"
    );

    !unsafe { libc::getenv(name.as_ptr() as *const libc::c_char) }.is_null()
}

#[test]
fn test_page_size() {
    let size = page_size();

    assert!(size > 0);
    assert_eq!(size & (size - 1), 0, "page size must be a power of 2");
}

#[test]
fn test_address_space_limit() {
    let (soft, hard) = address_space_limit().expect("getrlimit should succeed");

    assert!(soft > 0);
    assert!(soft <= hard);
}

#[test]
fn test_env_flag() {
    assert!(env_flag(b"PATH\0"));
    assert!(!env_flag(b"FTMALLOC_TEST_UNSET_VARIABLE\0"));
}

// Reserve a small region, exercise it, and return it to the OS.
#[test]
fn smoke_test_reserve() {
    let size = 4 * page_size();
    let base = reserve_region(size).expect("reserve should succeed");

    // Anonymous mappings come back zero-filled and writable.
    let bytes = base.as_ptr() as *mut u8;
    unsafe {
        assert_eq!(*bytes, 0);
        assert_eq!(*bytes.add(size - 1), 0);
        *bytes = 42;
        *bytes.add(size - 1) = 42;
    }

    release_region(base, size).expect("release should succeed");
}
