use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
    /// Zero-byte request. The pool engine never hands out empty units.
    InvalidSize(usize),
    /// The oversize fallback provider refused the request.
    FallbackFailed { size: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "pool initialization failed: {msg}"),
            VmError::InvalidSize(size) => write!(f, "invalid allocation size {size}"),
            VmError::FallbackFailed { size } => {
                write!(f, "fallback allocator could not provide {size} bytes")
            }
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::InitializationFailed(_)
            | VmError::InvalidSize(_)
            | VmError::FallbackFailed { .. } => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
///
/// The only place the crate talks to the operating system. Implementations
/// must allow individual pages inside a larger reservation to be committed
/// and decommitted independently.
pub trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    ///
    /// # Safety
    /// `size` must be a non-zero multiple of [`page_size`](VmOps::page_size).
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    ///
    /// # Safety
    /// `ptr..ptr + size` must lie inside a live reservation and be page aligned.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    ///
    /// # Safety
    /// Same as [`commit`](VmOps::commit); nothing may access the range afterwards
    /// until it is committed again.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    ///
    /// # Safety
    /// `ptr` and `size` must describe exactly one earlier reservation.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size, the unit of commit/decommit.
    fn page_size() -> usize;
}

pub struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE lets the kernel reclaim the physical pages lazily;
            // PROT_NONE turns any stray access into a fault. A later commit
            // may observe stale bytes or zeroes, and the pool layer relies on
            // neither: it relinks every unit of a freshly committed page.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // Positive and 64-bit only, so the cast is lossless.
                raw.cast_unsigned() as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom / Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls; loom runs inside a
// single OS process with its own scheduler. Every "reservation" is a plain
// heap allocation. `commit` / `decommit` are no-ops: the memory is always
// accessible once reserved. `release` frees the heap block.
//
// Enough to check the locking of the provider and the cache pools (loom) and
// the raw pointer walks of the free lists (Miri). Real page behaviour is
// covered by the platform implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
