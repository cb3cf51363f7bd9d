//! `malloc_trace` records every dynamic memory allocation and deallocation a
//! process performs, together with the call stack that performed it, into one
//! compact trace file per thread.  The traces are meant for offline analysis:
//! leak detection, allocation hot-spot hunting, or anything else that needs
//! the full allocation history rather than an aggregate.
//!
//! The tracer runs inside the allocator it is shadowing.  Every intercepted
//! call forwards to the real allocator first and returns its result
//! unchanged, so the traced program's allocation behavior is never altered;
//! recording happens on the side, guarded against re-entering itself.
//!
//! ## Tracing an unmodified program via `LD_PRELOAD`
//!
//! The companion `lib_malloc_trace` crate builds a dynamic library that
//! interposes `malloc`, `free`, `realloc`, `calloc`, `posix_memalign`,
//! `valloc` and `aligned_alloc` in front of any binary:
//!
//! ```bash
//! MALLOC_TRACE_OUTPUT=/tmp/trace. LD_PRELOAD=libmalloc_trace.so ./my_program
//! ```
//!
//! ## Tracing a Rust program
//!
//! A Rust program can opt in directly, without `LD_PRELOAD`:
//!
//! ```no_run
//! use malloc_trace::TraceAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: TraceAllocator = TraceAllocator;
//!
//! fn main() {}
//! ```
//!
//! ## Output
//!
//! The `MALLOC_TRACE_OUTPUT` environment variable supplies a base path; each
//! thread appends to its own file named `<base><pid>.<thread id>`.  Records
//! are line oriented:
//!
//! ```text
//! +<size>:<address> <frame>...<frame>
//! -<address>
//! ```
//!
//! where an allocation's frames run innermost first.  A frame seen for the
//! first time on a thread is written as `<id>=<ip>@<symbol>+0x<offset>;` and
//! assigns the instruction pointer a compact id; every later occurrence on
//! that thread is just `<id>;`.  A `realloc` appears as a free of the old
//! address followed by an allocation at the new one.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::{Cell, RefCell, UnsafeCell},
    collections::HashMap,
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    mem, process,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::Context;
use libc::{c_char, c_int, c_void, dlsym, size_t, RTLD_NEXT};
use once_cell::sync::Lazy;

/// Environment variable naming the base path for per-thread trace files.
pub const OUTPUT_ENV: &str = "MALLOC_TRACE_OUTPUT";

// Deepest captured call stack.
const MAX_BACKTRACE: usize = 128;

// The two innermost captured frames are the interception entry point and the
// recording logic; they are the tracer's own and never emitted.
const TRACER_FRAMES: usize = 2;

const FRAME_CACHE_CAPACITY: usize = 1024;

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int;
type VallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type AlignedAllocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;

/// The allocator functions the process would have called had no interposition
/// occurred, each stored as a raw address.  Written by [`bootstrap`], read
/// without synchronization afterwards; two threads racing through an unset
/// slot both resolve and store the same address, which is harmless.
struct RealAllocator {
    malloc: AtomicUsize,
    free: AtomicUsize,
    realloc: AtomicUsize,
    calloc: AtomicUsize,
    posix_memalign: AtomicUsize,
    valloc: AtomicUsize,
    aligned_alloc: AtomicUsize,
}

impl RealAllocator {
    const fn unresolved() -> Self {
        RealAllocator {
            malloc: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
            realloc: AtomicUsize::new(0),
            calloc: AtomicUsize::new(0),
            posix_memalign: AtomicUsize::new(0),
            valloc: AtomicUsize::new(0),
            aligned_alloc: AtomicUsize::new(0),
        }
    }
}

static REAL: RealAllocator = RealAllocator::unresolved();

// Loads a slot from the real-function table as a typed function pointer,
// running the bootstrap first if this call is the first to observe the slot
// unset.
macro_rules! real {
    ($slot:ident, $ty:ty) => {{
        let mut raw = REAL.$slot.load(Ordering::Relaxed);
        if raw == 0 {
            bootstrap();
            raw = REAL.$slot.load(Ordering::Relaxed);
        }
        mem::transmute::<usize, $ty>(raw)
    }};
}

/// Capacity of the bootstrap stand-in allocator.
///
/// `dlsym` performs a handful of internal allocations of a few dozen bytes
/// per lookup while the real `calloc` is still unknown; those are served from
/// this pool and never reclaimed.  The bound is deliberately generous, and
/// deliberately fixed: blowing through it means the platform's symbol
/// resolution allocates far more than this design assumes, and no retry can
/// fix that.
const BOOTSTRAP_POOL_SIZE: usize = 4096;

/// Backing storage aligned so every chunk offset (a multiple of
/// [`BootstrapPool::ALIGN`]) lands on an aligned address.
#[repr(align(16))]
struct BootstrapBuf([u8; BOOTSTRAP_POOL_SIZE]);

/// Fixed bump allocator backing [`bootstrap_calloc`].
struct BootstrapPool {
    buf: UnsafeCell<BootstrapBuf>,
    used: AtomicUsize,
}

// The atomic offset hands every chunk to exactly one caller.
unsafe impl Sync for BootstrapPool {}

impl BootstrapPool {
    const ALIGN: usize = 16;

    const fn new() -> Self {
        BootstrapPool {
            buf: UnsafeCell::new(BootstrapBuf([0u8; BOOTSTRAP_POOL_SIZE])),
            used: AtomicUsize::new(0),
        }
    }

    /// Hands out a zeroed, 16-byte-aligned chunk, or `None` once the pool is
    /// exhausted.  Chunks are never handed out twice and never reclaimed.
    fn alloc(&self, bytes: usize) -> Option<*mut u8> {
        let rounded = bytes.checked_add(Self::ALIGN - 1)? & !(Self::ALIGN - 1);
        let start = self.used.fetch_add(rounded, Ordering::Relaxed);
        if start.checked_add(rounded)? > BOOTSTRAP_POOL_SIZE {
            return None;
        }
        Some(unsafe { (self.buf.get() as *mut u8).add(start) })
    }

    /// Whether `ptr` points into the pool.  Such pointers were never issued
    /// by the real allocator and must not be handed back to it.
    fn contains(&self, ptr: *const c_void) -> bool {
        let base = self.buf.get() as usize;
        (base..base + BOOTSTRAP_POOL_SIZE).contains(&(ptr as usize))
    }
}

static BOOTSTRAP_POOL: BootstrapPool = BootstrapPool::new();

/// Stand-in `calloc` installed for the duration of the bootstrap lookups.
unsafe extern "C" fn bootstrap_calloc(num: size_t, size: size_t) -> *mut c_void {
    let bytes = (num as usize).saturating_mul(size as usize);
    match BOOTSTRAP_POOL.alloc(bytes) {
        Some(chunk) => chunk as *mut c_void,
        None => {
            // No heap to format with here; the message streams to stderr.
            eprintln!(
                "malloc_trace: bootstrap pool exhausted: {} bytes requested, {} total",
                bytes, BOOTSTRAP_POOL_SIZE
            );
            process::exit(1);
        }
    }
}

/// Resolves the next definition of `name` in the process's load order,
/// bypassing this module's own interposed definitions.  `name` carries its
/// trailing NUL.  A missing symbol is fatal: without the real binding every
/// further call would be unsafe.
unsafe fn resolve_real(name: &'static str) -> usize {
    let sym = dlsym(RTLD_NEXT, name.as_ptr() as *const c_char);
    if sym.is_null() {
        eprintln!(
            "malloc_trace: could not find the real {}",
            &name[..name.len() - 1]
        );
        process::exit(1);
    }
    sym as usize
}

/// One-time resolution of the real allocator entry points.
///
/// `dlsym` itself calls `calloc` for internal bookkeeping before the real
/// `calloc` is known, so the bump stand-in is installed into the `calloc`
/// slot first and replaced by the real resolution immediately after.  A
/// lookup that re-enters the tracer means resolution recursively triggered
/// resolution, which cannot make progress.
unsafe fn bootstrap() {
    let reentered = IN_TRACER
        .try_with(|guard| guard.replace(true))
        .unwrap_or(true);
    if reentered {
        fatal("recursion detected while resolving the real allocator");
    }

    REAL.calloc
        .store(bootstrap_calloc as CallocFn as usize, Ordering::Relaxed);
    REAL.calloc.store(resolve_real("calloc\0"), Ordering::Relaxed);
    REAL.malloc.store(resolve_real("malloc\0"), Ordering::Relaxed);
    REAL.free.store(resolve_real("free\0"), Ordering::Relaxed);
    REAL.realloc
        .store(resolve_real("realloc\0"), Ordering::Relaxed);
    REAL.posix_memalign
        .store(resolve_real("posix_memalign\0"), Ordering::Relaxed);
    REAL.valloc.store(resolve_real("valloc\0"), Ordering::Relaxed);
    REAL.aligned_alloc
        .store(resolve_real("aligned_alloc\0"), Ordering::Relaxed);

    let _ = IN_TRACER.try_with(|guard| guard.set(false));
}

/// Prints a diagnostic to stderr and terminates the process with a non-zero
/// status.  Every caller sits on a path where continuing would run with an
/// unknown allocator binding or silently drop trace records.
fn fatal(msg: impl fmt::Display) -> ! {
    eprintln!("malloc_trace: {}", msg);
    process::exit(1);
}

// Compact frame identifiers and thread identifiers are process-wide,
// monotonic and never reused; uniqueness is the only ordering requirement.
static NEXT_FRAME_ID: AtomicUsize = AtomicUsize::new(0);
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

/// Base path for per-thread trace files, read once from [`OUTPUT_ENV`].
static OUTPUT_BASE: Lazy<String> = Lazy::new(|| std::env::var(OUTPUT_ENV).unwrap_or_default());

/// What a thread knows about one instruction pointer.  Code does not move,
/// so a classification holds for the process's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrameEntry {
    id: usize,
    /// Allocation-operator frame: unwound through, never emitted.
    skip: bool,
    /// Program-entry frame: the walk ends here.
    stop: bool,
}

/// Per-thread map from instruction pointer to its assigned entry.  Owned by
/// exactly one thread; other threads re-resolve the same ips independently
/// rather than share or lock.
struct FrameCache {
    entries: HashMap<usize, FrameEntry>,
}

impl FrameCache {
    fn new() -> Self {
        FrameCache {
            entries: HashMap::with_capacity(FRAME_CACHE_CAPACITY),
        }
    }

    fn get(&self, ip: usize) -> Option<FrameEntry> {
        self.entries.get(&ip).copied()
    }

    fn insert(&mut self, ip: usize, entry: FrameEntry) {
        self.entries.insert(ip, entry);
    }
}

/// The mangled C++ allocation operators, `operator new` (`_Znwm`) and
/// `operator new[]` (`_Znam`).
fn is_alloc_operator(name: &str) -> bool {
    matches!(name, "_Znwm" | "_Znam")
}

/// The program entry point, or the static-initialization trampoline emitted
/// ahead of it.
fn is_entry_point(name: &str) -> bool {
    name == "main" || name == "_GLOBAL__sub_I_main"
}

/// Per-thread trace state: a unique thread id, the append-only output stream
/// and the frame cache.  Constructed lazily on the thread's first traced
/// call, torn down when the thread exits.
struct ThreadSession {
    thread_id: usize,
    out: BufWriter<File>,
    frames: FrameCache,
}

impl ThreadSession {
    /// Opens the session for the calling thread.  Construction allocates
    /// (path building, the stream's buffer), so the guard stays engaged for
    /// its duration.  A thread that cannot record must not silently proceed:
    /// an unrecorded trace corrupts every analysis built on the dataset.
    fn open() -> ThreadSession {
        let was_in_tracer = IN_TRACER
            .try_with(|guard| guard.replace(true))
            .unwrap_or(true);
        let thread_id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let out = Self::open_stream(thread_id).unwrap_or_else(|err| fatal(err));
        if !was_in_tracer {
            let _ = IN_TRACER.try_with(|guard| guard.set(false));
        }
        ThreadSession {
            thread_id,
            out,
            frames: FrameCache::new(),
        }
    }

    fn open_stream(thread_id: usize) -> anyhow::Result<BufWriter<File>> {
        let path = format!("{}{}.{}", &*OUTPUT_BASE, process::id(), thread_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open trace output file {}", path))?;
        Ok(BufWriter::new(file))
    }
}

impl Drop for ThreadSession {
    fn drop(&mut self) {
        // Teardown flushes through the allocator; the guard suppresses
        // tracing of it and is deliberately left engaged.
        let _ = IN_TRACER.try_with(|guard| guard.set(true));
        let _ = self.out.flush();
    }
}

thread_local! {
    // Engaged while the tracer's own bookkeeping runs.  Kept separate from
    // SESSION so it remains valid while the session itself is constructed
    // and, later, torn down.
    static IN_TRACER: Cell<bool> = Cell::new(false);

    static SESSION: RefCell<ThreadSession> = RefCell::new(ThreadSession::open());

    // Reusable scratch for captured instruction pointers.
    static CALL_STACK: RefCell<Vec<usize>> = RefCell::new(Vec::with_capacity(MAX_BACKTRACE));
}

/// Runs `f` against the calling thread's session unless the tracer is
/// already on this thread's stack.  Bookkeeping performed by `f` therefore
/// never records nested events, and calls arriving after the thread's TLS
/// has been torn down fall through silently.
fn with_session<F: FnOnce(&mut ThreadSession)>(f: F) {
    let engaged = IN_TRACER.try_with(|guard| {
        if guard.get() {
            false
        } else {
            guard.set(true);
            true
        }
    });
    if !matches!(engaged, Ok(true)) {
        return;
    }
    let _ = SESSION.try_with(|session| f(&mut *session.borrow_mut()));
    let _ = IN_TRACER.try_with(|guard| guard.set(false));
}

fn write_alloc_header(out: &mut impl Write, size: usize, ptr: *mut c_void) -> io::Result<()> {
    write!(out, "+{}:{:#x} ", size, ptr as usize)
}

fn write_free(out: &mut impl Write, ptr: *mut c_void) -> io::Result<()> {
    writeln!(out, "-{:#x}", ptr as usize)
}

/// Resolves an instruction pointer to its mangled symbol name and byte
/// offset from the symbol's start.  Code outside any known symbol yields an
/// empty name at offset zero.
fn resolve_frame(ip: usize) -> (String, usize) {
    let mut name = String::new();
    let mut offset = 0;
    backtrace::resolve(ip as *mut c_void, |symbol| {
        if let Some(sym_name) = symbol.name() {
            if let Some(raw) = sym_name.as_str() {
                name = raw.to_owned();
            }
        }
        if let Some(addr) = symbol.addr() {
            offset = ip.saturating_sub(addr as usize);
        }
    });
    (name, offset)
}

/// Walks captured instruction pointers innermost first and appends the
/// reference chain to `out`.
///
/// A cache miss resolves and classifies the frame, assigns it the next
/// global id and emits a definition, `id=ip@name+0xoff;`.  A cache hit
/// emits just `id;`.  Allocation-operator frames are walked through but
/// never emitted.  The walk ends at the first program-entry frame; running
/// out of frames before finding one is a complete (if short) trace, not an
/// error.
fn emit_chain<W, R>(cache: &mut FrameCache, out: &mut W, ips: &[usize], mut resolve: R)
where
    W: Write,
    R: FnMut(usize) -> (String, usize),
{
    for &ip in ips {
        let entry = match cache.get(ip) {
            Some(entry) => {
                if !entry.skip {
                    let _ = write!(out, "{};", entry.id);
                }
                entry
            }
            None => {
                let (name, offset) = resolve(ip);
                let skip = is_alloc_operator(&name);
                let stop = !skip && is_entry_point(&name);
                let entry = FrameEntry {
                    id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
                    skip,
                    stop,
                };
                cache.insert(ip, entry);
                if !entry.skip {
                    let _ = write!(out, "{}={:x}@{}+0x{:x};", entry.id, ip, name, offset);
                }
                entry
            }
        };
        if entry.stop {
            break;
        }
    }
}

/// Captures the calling thread's stack and appends its reference chain to
/// the session's stream.  The innermost [`TRACER_FRAMES`] frames are the
/// tracer's own and are dropped before the walk.
fn capture_stack(session: &mut ThreadSession) {
    let _ = CALL_STACK.try_with(|scratch| {
        let mut stack = scratch.borrow_mut();
        stack.clear();
        let mut skipped = 0;
        backtrace::trace(|frame| {
            if skipped < TRACER_FRAMES {
                skipped += 1;
                return true;
            }
            stack.push(frame.ip() as usize);
            stack.len() < MAX_BACKTRACE
        });
        emit_chain(&mut session.frames, &mut session.out, &stack, resolve_frame);
    });
}

fn record_alloc(session: &mut ThreadSession, ptr: *mut c_void, size: usize) {
    let _ = write_alloc_header(&mut session.out, size, ptr);
    capture_stack(session);
    let _ = session.out.write_all(b"\n");
}

fn record_free(session: &mut ThreadSession, ptr: *mut c_void) {
    let _ = write_free(&mut session.out, ptr);
}

/// The tracer's public face.
///
/// Loaded via `LD_PRELOAD` (through the `lib_malloc_trace` cdylib) the
/// associated functions interpose the process's allocator entry points; as a
/// `#[global_allocator]` the same recording machinery traces a Rust program
/// directly on top of [`System`].
pub struct TraceAllocator;

impl TraceAllocator {
    /// Interposed `malloc`.  Forwards to the real allocator and records the
    /// outcome, whatever it was.
    pub unsafe fn malloc(size: size_t) -> *mut c_void {
        let real_malloc = real!(malloc, MallocFn);
        let ret = real_malloc(size);
        with_session(|session| record_alloc(session, ret, size as usize));
        ret
    }

    /// Interposed `free`.  Pointers owned by the bootstrap pool were never
    /// issued by the real allocator and are dropped here.
    pub unsafe fn free(ptr: *mut c_void) {
        if BOOTSTRAP_POOL.contains(ptr) {
            return;
        }
        let real_free = real!(free, FreeFn);
        real_free(ptr);
        with_session(|session| record_free(session, ptr));
    }

    /// Interposed `realloc`, recorded as its canonical decomposition: a free
    /// of the old address followed by an allocation at the new one, even
    /// when the two coincide.
    pub unsafe fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
        let real_realloc = real!(realloc, ReallocFn);
        let ret = real_realloc(ptr, size);
        with_session(|session| {
            record_free(session, ptr);
            record_alloc(session, ret, size as usize);
        });
        ret
    }

    /// Interposed `calloc`.
    pub unsafe fn calloc(num: size_t, size: size_t) -> *mut c_void {
        let real_calloc = real!(calloc, CallocFn);
        let ret = real_calloc(num, size);
        let bytes = (num as usize).saturating_mul(size as usize);
        with_session(|session| record_alloc(session, ret, bytes));
        ret
    }

    /// Interposed `posix_memalign`.  The event is recorded only on success;
    /// on failure the out-parameter is unspecified and must not be read.
    pub unsafe fn posix_memalign(
        memptr: *mut *mut c_void,
        alignment: size_t,
        size: size_t,
    ) -> c_int {
        if memptr.is_null() {
            return libc::EINVAL;
        }
        let real_posix_memalign = real!(posix_memalign, PosixMemalignFn);
        let ret = real_posix_memalign(memptr, alignment, size);
        if ret == 0 {
            let ptr = *memptr;
            with_session(|session| record_alloc(session, ptr, size as usize));
        }
        ret
    }

    /// Interposed `valloc`.
    pub unsafe fn valloc(size: size_t) -> *mut c_void {
        let real_valloc = real!(valloc, VallocFn);
        let ret = real_valloc(size);
        with_session(|session| record_alloc(session, ret, size as usize));
        ret
    }

    /// Interposed `aligned_alloc`.
    pub unsafe fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
        let real_aligned_alloc = real!(aligned_alloc, AlignedAllocFn);
        let ret = real_aligned_alloc(alignment, size);
        with_session(|session| record_alloc(session, ret, size as usize));
        ret
    }
}

/// Rust-native mode: the same recording machinery layered over [`System`],
/// for programs that opt in with `#[global_allocator]` instead of
/// `LD_PRELOAD`.
unsafe impl GlobalAlloc for TraceAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ret = System.alloc(layout);
        with_session(|session| record_alloc(session, ret as *mut c_void, layout.size()));
        ret
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ret = System.alloc_zeroed(layout);
        with_session(|session| record_alloc(session, ret as *mut c_void, layout.size()));
        ret
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        with_session(|session| record_free(session, ptr as *mut c_void));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let ret = System.realloc(ptr, layout, new_size);
        with_session(|session| {
            record_free(session, ptr as *mut c_void);
            record_alloc(session, ret as *mut c_void, new_size);
        });
        ret
    }
}
