//! Companion crate to [`malloc_trace`].  This crate compiles into a dynamic
//! library that can be loaded via `LD_PRELOAD` to interpose the allocator
//! entry points of an unmodified program and record every allocation and
//! free, with its call stack, in the `malloc_trace` format.
//!
//! ```bash
//! MALLOC_TRACE_OUTPUT=/tmp/trace. LD_PRELOAD=libmalloc_trace.so ./my_program
//! ```

use libc::{c_int, c_void};
use malloc_trace::TraceAllocator;

/// Interposed `malloc`.  Forwards to the real allocator and records the
/// allocation with its call stack before returning the real result.
///
/// # Safety
///
/// Carries the C `malloc` contract; the returned pointer is whatever the
/// real allocator produced.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
    TraceAllocator::malloc(size)
}

/// Interposed `free`.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned through this
/// module's allocation entry points.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    TraceAllocator::free(ptr)
}

/// Interposed `realloc`, recorded as a free of the old address followed by
/// an allocation at the new one.
///
/// # Safety
///
/// Carries the C `realloc` contract.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
    TraceAllocator::realloc(ptr, size)
}

/// Interposed `calloc`.  Also serves `dlsym`'s own early allocations while
/// the real allocator is still being resolved.
///
/// # Safety
///
/// Carries the C `calloc` contract.
#[no_mangle]
pub unsafe extern "C" fn calloc(num: libc::size_t, size: libc::size_t) -> *mut c_void {
    TraceAllocator::calloc(num, size)
}

/// Interposed `posix_memalign`.
///
/// # Safety
///
/// Carries the POSIX `posix_memalign` contract; `memptr` must be a valid
/// out-parameter location.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: libc::size_t,
    size: libc::size_t,
) -> c_int {
    TraceAllocator::posix_memalign(memptr, alignment, size)
}

/// Interposed `valloc`.
///
/// # Safety
///
/// Carries the C `valloc` contract.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: libc::size_t) -> *mut c_void {
    TraceAllocator::valloc(size)
}

/// Interposed `aligned_alloc`.
///
/// # Safety
///
/// Carries the C `aligned_alloc` contract.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: libc::size_t, size: libc::size_t) -> *mut c_void {
    TraceAllocator::aligned_alloc(alignment, size)
}
