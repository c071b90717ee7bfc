//! VM-facing hooks consumed by the profilers.
//!
//! The profilers never see the VM's internals. An embedder implements
//! [`Vm`] over its interpreter state and the profilers drive everything
//! through it: the allocator slot, the current execution state, frame
//! navigation for source attribution, the GC root walk for the symbol
//! preamble, and the metrics snapshot.

use libc::c_void;

/// Allocator function held in the VM's allocator slot. Mirrors the
/// classic `(ud, ptr, osize, nsize)` contract: `nsize == 0` frees,
/// `ptr == NULL` allocates, anything else reallocates.
pub type AllocFn =
    unsafe extern "C" fn(ud: *mut c_void, ptr: *mut c_void, osize: usize, nsize: usize)
        -> *mut c_void;

/// The VM's allocator slot: function plus opaque state.
#[derive(Clone, Copy, Debug)]
pub struct Allocator {
    pub func: AllocFn,
    pub state: *mut c_void,
}

enum_from_primitive! {
/// What the VM is currently executing.
///
/// The first four states describe the function kind on top of the stack;
/// the middle block covers the VM's own machinery (garbage collector,
/// trace exit handling, the JIT pipeline phases); `Trace` is machine code
/// produced by the JIT. A VM whose state word encodes trace numbers
/// above the last tag must collapse them all to `Trace` before reporting
/// here.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq, Serialize)]
#[strum(serialize_all = "UPPERCASE")]
pub enum VmState {
    Interp = 0,
    Lfunc = 1,
    Ffunc = 2,
    Cfunc = 3,
    Gc = 4,
    Exit = 5,
    Record = 6,
    Opt = 7,
    Asm = 8,
    Trace = 9,
}
}

/// Opaque handle for one activation on the VM stack. The numbering is
/// the VM adapter's business; the profilers only pass handles back in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Frame(pub usize);

/// Opaque handle for a VM function object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FuncRef(pub usize);

/// Kind of a VM function, for attribution purposes. Fast functions are
/// natively implemented built-ins and are classified separately from
/// arbitrary native functions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FunctionKind {
    Lua,
    Fast,
    Native,
}

/// Fingerprinted identity of the code responsible for an event or a
/// sample. This is what event records and sample frames carry on the
/// wire; the symbol preamble makes the payloads resolvable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Source {
    /// The VM was not executing user code (interpreter dispatch, GC,
    /// JIT compiler phases, or a position-less activation).
    Internal,
    /// A Lua function: prototype handle plus the active source line
    /// (0 when the prototype carries no debug info).
    Lua { proto: u64, line: u64 },
    /// A native function's entry point.
    Native { addr: u64 },
    /// A JIT trace, by trace number.
    Trace { trace_no: u64 },
}

/// A live symbol reported by the VM's GC root walk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GcRoot {
    Proto(ProtoInfo),
    Trace(TraceInfo),
}

/// A function prototype: stable handle, defining chunk, first line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtoInfo {
    pub id: u64,
    pub chunk: String,
    pub first_line: u64,
}

/// A JIT trace: trace number, starting prototype, line of the starting
/// bytecode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TraceInfo {
    pub trace_no: u64,
    pub proto: u64,
    pub line: u64,
}

/// Counters the VM keeps as a plain struct read; see `Vm::metrics`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Metrics {
    /// Interned-string lookups that found an existing string.
    pub strhash_hit: u64,
    /// Interned-string lookups that had to allocate.
    pub strhash_miss: u64,

    pub gc_strnum: u64,
    pub gc_tabnum: u64,
    pub gc_udatanum: u64,
    pub gc_cdatanum: u64,

    /// Bytes currently allocated.
    pub gc_total: u64,
    /// Bytes freed over the VM lifetime.
    pub gc_freed: u64,
    /// Bytes allocated over the VM lifetime.
    pub gc_allocated: u64,

    pub gc_steps_pause: u64,
    pub gc_steps_propagate: u64,
    pub gc_steps_atomic: u64,
    pub gc_steps_sweepstring: u64,
    pub gc_steps_sweep: u64,
    pub gc_steps_finalize: u64,

    /// Guard assertions that fell back from a trace to the interpreter.
    pub jit_snap_restore: u64,
    pub jit_trace_abort: u64,
    pub jit_mcode_size: u64,
    pub jit_trace_num: u32,
}

/// The abstract hook surface a profiled VM provides.
///
/// All methods are called on the VM's own thread: from public start/stop
/// operations, from the allocator hook, or from the sampler tick.
pub trait Vm {
    /// Current allocator slot.
    fn allocator(&self) -> Allocator;

    /// Install an allocator. The slot is treated as exclusively held by
    /// the memory profiler between its start and stop.
    fn set_allocator(&mut self, alloc: Allocator);

    /// Current execution state.
    fn vm_state(&self) -> VmState;

    /// Number of the trace being executed. Meaningful only while
    /// `vm_state()` reports `Trace`.
    fn current_trace(&self) -> Option<u64>;

    /// Topmost activation, if any user code is on the stack.
    fn top_frame(&self) -> Option<Frame>;

    /// The activation below `frame`.
    fn prev_frame(&self, frame: Frame) -> Option<Frame>;

    /// Function executing in `frame`.
    fn frame_function(&self, frame: Frame) -> Option<FuncRef>;

    fn function_kind(&self, func: FuncRef) -> FunctionKind;

    /// Prototype handle of a Lua function.
    fn prototype_of(&self, func: FuncRef) -> Option<u64>;

    /// Native entry point of a fast or C function.
    fn native_entry(&self, func: FuncRef) -> u64;

    /// Source line `frame` is currently executing. Negative means "no
    /// position" (e.g. the JIT is recording the function and there is no
    /// active bytecode); 0 means the prototype has no debug info.
    fn frame_line(&self, frame: Frame) -> i64;

    /// Walk the live prototypes and traces for the symbol preamble. The
    /// order is irrelevant; the decoder joins by handle.
    fn gc_roots(&self, visit: &mut dyn FnMut(GcRoot));

    /// Plain snapshot of the VM's own counters.
    fn metrics(&self) -> Metrics;
}

/// Resolve the source responsible for whatever the VM is doing right
/// now, using the attribution rules shared by both profilers:
///
/// * a Lua frame reports its prototype and active line, falling back to
///   `Internal` when the line is the "no position" sentinel;
/// * a fast function is attributed to its Lua caller when it has one
///   (far more useful for call-site aggregation), otherwise to its own
///   native entry;
/// * a C function reports its native entry;
/// * a trace reports its trace number;
/// * every other state is `Internal`.
pub fn classify_source(vm: &dyn Vm) -> Source {
    match vm.vm_state() {
        VmState::Lfunc | VmState::Ffunc | VmState::Cfunc => frame_source(vm),
        VmState::Trace => match vm.current_trace() {
            Some(trace_no) => Source::Trace { trace_no },
            None => Source::Internal,
        },
        _ => Source::Internal,
    }
}

/// Source of one specific activation, for stack walkers. Unlike the
/// top-frame rules there is no fast-function redirection: a walker
/// already reports the caller as its own frame.
pub(crate) fn frame_source_at(vm: &dyn Vm, frame: Frame) -> Source {
    let func = match vm.frame_function(frame) {
        Some(f) => f,
        None => return Source::Internal,
    };
    match vm.function_kind(func) {
        FunctionKind::Lua => lua_source(vm, frame, func),
        FunctionKind::Fast | FunctionKind::Native => Source::Native {
            addr: vm.native_entry(func),
        },
    }
}

fn frame_source(vm: &dyn Vm) -> Source {
    let frame = match vm.top_frame() {
        Some(f) => f,
        None => return Source::Internal,
    };
    let func = match vm.frame_function(frame) {
        Some(f) => f,
        None => return Source::Internal,
    };
    match vm.function_kind(func) {
        FunctionKind::Lua => lua_source(vm, frame, func),
        FunctionKind::Native => Source::Native {
            addr: vm.native_entry(func),
        },
        FunctionKind::Fast => fast_source(vm, frame, func),
    }
}

/// A fast function called by a Lua function is reported as that Lua
/// function; a fast function with no Lua caller is reported as a native
/// entry.
fn fast_source(vm: &dyn Vm, frame: Frame, func: FuncRef) -> Source {
    if let Some(pframe) = vm.prev_frame(frame) {
        if let Some(pfunc) = vm.frame_function(pframe) {
            if vm.function_kind(pfunc) == FunctionKind::Lua {
                return lua_source(vm, pframe, pfunc);
            }
        }
    }
    Source::Native {
        addr: vm.native_entry(func),
    }
}

fn lua_source(vm: &dyn Vm, frame: Frame, func: FuncRef) -> Source {
    let proto = match vm.prototype_of(func) {
        Some(p) => p,
        None => return Source::Internal,
    };
    let line = vm.frame_line(frame);
    if line < 0 {
        // The JIT is recording this function and there is no active
        // bytecode position. Not a bug in the stream; decoders must not
        // treat it as one.
        Source::Internal
    } else {
        Source::Lua {
            proto,
            line: line as u64,
        }
    }
}
