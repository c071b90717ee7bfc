//! Memory-allocation profiler.
//!
//! The profiler wraps the VM's allocator. Every allocator call is
//! delegated to the original allocator first and then encoded as one
//! event, annotated with the source responsible for it:
//!
//! ```text
//! stream        := symtab memprof
//! memprof       := prologue event* epilogue
//! prologue      := 'l' 'j' 'm' version 0x00 0x00 0x00
//! event         := event-alloc | event-free | event-realloc | event-symtab
//! event-alloc   := header source? naddr:<ULEB128> nsize:<ULEB128>
//! event-free    := header source? oaddr:<ULEB128> osize:<ULEB128>
//! event-realloc := header source? oaddr osize naddr nsize
//! event-symtab  := header sym-lfunc-payload | header sym-trace-payload
//! epilogue      := header with the F bit set
//! ```
//!
//! Event header, hi to lo: `[F U U T S S E E]` — two event bits, two
//! source bits, one wider-tag bit for trace sources, the final marker.
//! Internal sources carry no payload; Lua sources carry `id line`;
//! native sources carry `addr`; trace sources carry `trace-no`.
//!
//! Exactly one VM can be profiled at a time; the profiler is a process
//! singleton just like the allocator slot it occupies. All public
//! operations must run on the profiled VM's thread.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::c_void;

use error::{Error, Result};
use symtab;
use vm::{self, Allocator, ProtoInfo, Source, TraceInfo, Vm};
use wbuf::{Sink, StreamFlags, Wbuf};

pub const MEMPROF_VERSION: u8 = 1;

const MEMPROF_PROLOGUE: [u8; 7] = [b'l', b'j', b'm', MEMPROF_VERSION, 0, 0, 0];

/// Event kinds (low two header bits). `SYMTAB` injects an incremental
/// symtab entry into the event stream.
pub const AEVENT_SYMTAB: u8 = 0;
pub const AEVENT_ALLOC: u8 = 1;
pub const AEVENT_FREE: u8 = 2;
pub const AEVENT_REALLOC: u8 = 3;

/// Source tags, shifted past the event bits. The trace tag deliberately
/// takes the wider value: it needs the bit above the two-bit source
/// field.
pub const ASOURCE_INT: u8 = 1 << 2;
pub const ASOURCE_LFUNC: u8 = 2 << 2;
pub const ASOURCE_CFUNC: u8 = 3 << 2;
pub const ASOURCE_TRACE: u8 = 4 << 2;

/// Epilogue header: the F bit; everything else is ignored.
pub const EPILOGUE: u8 = 0x80;

const IDLE: usize = 0;
const PROFILE: usize = 1;
const HALT: usize = 2;

/// Options for one profiling run. The buffer and the sink are owned by
/// the profiler from a successful `start` until `Sink::on_stop` hands
/// the buffer back.
pub struct MemprofOptions {
    pub sink: Box<dyn Sink>,
    pub buf: Box<[u8]>,
}

struct Memprof {
    vm: *mut (dyn Vm + 'static),
    /// Data pointer of the profiled VM, for identity checks.
    vm_tag: usize,
    out: Wbuf,
    orig: Allocator,
    saved_errno: i32,
}

struct Cell(UnsafeCell<Option<Memprof>>);

// NOTE(unsafe) the profiler is single-threaded by contract: every public
// operation and the allocator hook run on the profiled VM's thread. The
// atomic state word is what hands the payload from one operation to the
// next.
unsafe impl Sync for Cell {}

static STATE: AtomicUsize = AtomicUsize::new(IDLE);
static PROFILER: Cell = Cell(UnsafeCell::new(None));

fn identity(vm: &dyn Vm) -> usize {
    vm as *const dyn Vm as *const () as usize
}

/// Starts profiling `vm`.
///
/// On success the profiler owns the options and will invoke
/// `sink.on_stop` exactly once at the matching [`stop`] (or at the halt
/// teardown). On a failed start the sink's `on_stop` has already been
/// invoked so the caller's resources are released either way.
///
/// The caller must keep `vm` alive and on this thread until [`stop`]
/// returns.
pub fn start(vm: &mut dyn Vm, opt: MemprofOptions) -> Result<()> {
    let MemprofOptions { mut sink, buf } = opt;

    if buf.is_empty() {
        let _ = sink.on_stop(Some(buf));
        return Err(Error::Misuse);
    }
    if STATE
        .compare_exchange(IDLE, PROFILE, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Already running: still release the caller's resources.
        let _ = sink.on_stop(Some(buf));
        return Err(Error::Running);
    }

    let mut out = Wbuf::new(sink, buf);
    symtab::dump(&mut out, vm, false);
    out.add_raw(&MEMPROF_PROLOGUE);

    if out.test_flag(StreamFlags::ERR_IO | StreamFlags::STOP) {
        // The errno must survive the on_stop call below.
        let errno = out.errno();
        let (mut sink, buf) = out.terminate();
        let _ = sink.on_stop(buf);
        STATE.store(IDLE, Ordering::Release);
        return Err(Error::Io { errno });
    }

    let orig = vm.allocator();
    // NOTE(unsafe) the raw VM pointer lives exactly as long as the run;
    // the caller guarantees the VM outlives it (see above).
    let vm_ptr: *mut (dyn Vm + 'static) = unsafe { mem::transmute(vm as *mut dyn Vm) };
    unsafe {
        *PROFILER.0.get() = Some(Memprof {
            vm: vm_ptr,
            vm_tag: identity(vm),
            out,
            orig,
            saved_errno: 0,
        });
    }
    // The singleton is in place; only now may the hook become reachable.
    vm.set_allocator(Allocator {
        func: memprof_allocf,
        state: orig.state,
    });

    debug!("memprof started");
    Ok(())
}

/// Stops profiling: restores the allocator, emits the epilogue, flushes,
/// and releases the stream through `on_stop`.
///
/// After a mid-run halt (the sink cancelled the stream) this reports the
/// preserved errno as `Io`. Stopping an idle profiler reports `Running`;
/// stopping with a VM other than the profiled one reports `Misuse` and
/// leaves the run untouched.
pub fn stop(vm: &mut dyn Vm) -> Result<()> {
    match STATE.load(Ordering::Acquire) {
        HALT => {
            let mp = match unsafe { (*PROFILER.0.get()).take() } {
                Some(mp) => mp,
                None => {
                    STATE.store(IDLE, Ordering::Release);
                    return Err(Error::Running);
                }
            };
            STATE.store(IDLE, Ordering::Release);
            // The allocator was restored when the stream halted; only
            // the release callback is still owed.
            let errno = mp.saved_errno;
            let (mut sink, buf) = mp.out.terminate();
            let _ = sink.on_stop(buf);
            Err(Error::Io { errno })
        }
        PROFILE => {
            let mp = match unsafe { (*PROFILER.0.get()).take() } {
                Some(mp) => mp,
                None => return Err(Error::Running),
            };
            if mp.vm_tag != identity(vm) {
                unsafe {
                    *PROFILER.0.get() = Some(mp);
                }
                return Err(Error::Misuse);
            }
            vm.set_allocator(mp.orig);
            STATE.store(IDLE, Ordering::Release);
            finish_stream(mp.out)
        }
        _ => Err(Error::Running),
    }
}

/// VM hook: a prototype was born while profiling. Emits an incremental
/// symtab entry so the id is resolvable before its first event.
pub fn add_proto(pt: &ProtoInfo) {
    if STATE.load(Ordering::Acquire) != PROFILE {
        return;
    }
    // NOTE(unsafe) called on the VM thread, PROFILE guarantees Some.
    if let Some(mp) = unsafe { (*PROFILER.0.get()).as_mut() } {
        mp.out.add_byte(AEVENT_SYMTAB | ASOURCE_LFUNC);
        symtab::write_proto(&mut mp.out, pt);
    }
}

/// VM hook: a trace was compiled while profiling.
pub fn add_trace(tr: &TraceInfo) {
    if STATE.load(Ordering::Acquire) != PROFILE {
        return;
    }
    if let Some(mp) = unsafe { (*PROFILER.0.get()).as_mut() } {
        mp.out.add_byte(AEVENT_SYMTAB | ASOURCE_TRACE);
        symtab::write_trace(&mut mp.out, tr);
    }
}

/// Epilogue, flush, release. Shared by `stop` paths that still own a
/// live stream.
fn finish_stream(mut out: Wbuf) -> Result<()> {
    if out.test_flag(StreamFlags::STOP) {
        // The sink cancelled the stream between events (an incremental
        // symtab write can trip this without an allocator call).
        let errno = out.errno();
        let (mut sink, buf) = out.terminate();
        let _ = sink.on_stop(buf);
        return Err(Error::Io { errno });
    }

    out.add_byte(EPILOGUE);
    out.flush();

    let errno = out.errno();
    let flagged = out.test_flag(StreamFlags::ERR_IO | StreamFlags::STOP);
    let (mut sink, buf) = out.terminate();
    let cb = sink.on_stop(buf);

    if flagged {
        return Err(Error::Io { errno });
    }
    if let Err(e) = cb {
        return Err(Error::Io {
            errno: e.raw_os_error().unwrap_or(0),
        });
    }
    debug!("memprof stopped");
    Ok(())
}

/// The installed allocator. Delegates first, then encodes the event; it
/// never fails the host allocation, even when the event cannot be
/// written.
unsafe extern "C" fn memprof_allocf(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let mp = match (*PROFILER.0.get()).as_mut() {
        Some(mp) => mp,
        // Unreachable while the hook is installed; stay harmless anyway.
        None => return ptr,
    };

    let nptr = (mp.orig.func)(ud, ptr, osize, nsize);

    if STATE.load(Ordering::Acquire) != PROFILE {
        return nptr;
    }

    let src = vm::classify_source(&*mp.vm);
    if nsize == 0 {
        write_event(&mut mp.out, AEVENT_FREE, src);
        mp.out.add_u64(ptr as usize as u64);
        mp.out.add_u64(osize as u64);
    } else if ptr.is_null() {
        write_event(&mut mp.out, AEVENT_ALLOC, src);
        mp.out.add_u64(nptr as usize as u64);
        mp.out.add_u64(nsize as u64);
    } else {
        write_event(&mut mp.out, AEVENT_REALLOC, src);
        mp.out.add_u64(ptr as usize as u64);
        mp.out.add_u64(osize as u64);
        mp.out.add_u64(nptr as usize as u64);
        mp.out.add_u64(nsize as u64);
    }

    if mp.out.test_flag(StreamFlags::STOP) {
        // Deinstrument: the original allocator must be back in the slot
        // before any code path that could allocate again.
        (*mp.vm).set_allocator(mp.orig);
        mp.saved_errno = mp.out.errno();
        STATE.store(HALT, Ordering::Release);
        debug!("memprof halted mid-run, errno {}", mp.saved_errno);
    }

    nptr
}

pub(crate) fn write_event(out: &mut Wbuf, aevent: u8, src: Source) {
    match src {
        Source::Internal => out.add_byte(aevent | ASOURCE_INT),
        Source::Lua { proto, line } => {
            out.add_byte(aevent | ASOURCE_LFUNC);
            out.add_u64(proto);
            out.add_u64(line);
        }
        Source::Native { addr } => {
            out.add_byte(aevent | ASOURCE_CFUNC);
            out.add_u64(addr);
        }
        Source::Trace { trace_no } => {
            out.add_byte(aevent | ASOURCE_TRACE);
            out.add_u64(trace_no);
        }
    }
}
