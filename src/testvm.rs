//! Scriptable VM and sink doubles for the scenario tests.
//!
//! `TestVm` implements the full hook surface over a libc-malloc
//! allocator, so the profilers run against real allocator traffic while
//! the execution state, the frame stack and the GC roots are set by the
//! test. Everything the profilers touch mid-run is interior-mutable:
//! they hold a raw pointer to the VM while the test keeps driving it
//! through `&self` methods.
//!
//! Both profilers are process singletons, so every test touching one
//! grabs [`serialize_profiler_tests`] first; the harness otherwise runs
//! tests concurrently.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};

use libc::{self, c_void};

use vm::{
    AllocFn, Allocator, Frame, FuncRef, FunctionKind, GcRoot, Metrics, ProtoInfo, TraceInfo, Vm,
    VmState,
};
use wbuf::Sink;

static PROFILER_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that touch the profiler singletons.
pub fn serialize_profiler_tests() -> MutexGuard<'static, ()> {
    PROFILER_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A function on the scripted frame stack.
#[derive(Clone, Copy, Debug)]
pub enum TestFunc {
    Lua { proto: u64, line: i64 },
    Fast { entry: u64 },
    Native { entry: u64 },
}

unsafe extern "C" fn libc_allocf(
    _ud: *mut c_void,
    ptr: *mut c_void,
    _osize: usize,
    nsize: usize,
) -> *mut c_void {
    if nsize == 0 {
        libc::free(ptr);
        ::std::ptr::null_mut()
    } else if ptr.is_null() {
        libc::malloc(nsize)
    } else {
        libc::realloc(ptr, nsize)
    }
}

pub struct TestVm {
    alloc: Cell<Allocator>,
    state: Cell<VmState>,
    trace: Cell<Option<u64>>,
    /// Bottom to top.
    frames: RefCell<Vec<TestFunc>>,
    protos: RefCell<Vec<ProtoInfo>>,
    traces: RefCell<Vec<TraceInfo>>,
    metrics: RefCell<Metrics>,
}

impl TestVm {
    pub fn new() -> TestVm {
        TestVm {
            alloc: Cell::new(Allocator {
                func: libc_allocf as AllocFn,
                state: ::std::ptr::null_mut(),
            }),
            state: Cell::new(VmState::Interp),
            trace: Cell::new(None),
            frames: RefCell::new(Vec::new()),
            protos: RefCell::new(Vec::new()),
            traces: RefCell::new(Vec::new()),
            metrics: RefCell::new(Metrics::default()),
        }
    }

    pub fn set_state(&self, st: VmState) {
        self.state.set(st);
    }

    pub fn set_trace(&self, trace: Option<u64>) {
        self.trace.set(trace);
    }

    pub fn push_frame(&self, func: TestFunc) {
        self.frames.borrow_mut().push(func);
    }

    pub fn add_proto(&self, id: u64, chunk: &str, first_line: u64) {
        self.protos.borrow_mut().push(ProtoInfo {
            id,
            chunk: chunk.to_owned(),
            first_line,
        });
    }

    pub fn add_trace(&self, trace_no: u64, proto: u64, line: u64) {
        self.traces.borrow_mut().push(TraceInfo {
            trace_no,
            proto,
            line,
        });
    }

    /// Route one allocation through whatever sits in the allocator
    /// slot, the way the VM's own runtime would, and keep the metrics
    /// snapshot in step. Every allocation counts as one table object.
    pub fn alloc(&self, ptr: *mut c_void, osize: usize, nsize: usize) -> *mut c_void {
        let a = self.alloc.get();
        let nptr = unsafe { (a.func)(a.state, ptr, osize, nsize) };
        let mut m = self.metrics.borrow_mut();
        if nsize == 0 {
            m.gc_freed += osize as u64;
            m.gc_total = m.gc_total.saturating_sub(osize as u64);
            m.gc_tabnum = m.gc_tabnum.saturating_sub(1);
        } else if ptr.is_null() {
            m.gc_allocated += nsize as u64;
            m.gc_total += nsize as u64;
            m.gc_tabnum += 1;
        } else {
            m.gc_freed += osize as u64;
            m.gc_allocated += nsize as u64;
            m.gc_total = m.gc_total.saturating_sub(osize as u64) + nsize as u64;
        }
        nptr
    }
}

impl Vm for TestVm {
    fn allocator(&self) -> Allocator {
        self.alloc.get()
    }

    fn set_allocator(&mut self, alloc: Allocator) {
        self.alloc.set(alloc);
    }

    fn vm_state(&self) -> VmState {
        self.state.get()
    }

    fn current_trace(&self) -> Option<u64> {
        self.trace.get()
    }

    fn top_frame(&self) -> Option<Frame> {
        let n = self.frames.borrow().len();
        if n == 0 {
            None
        } else {
            Some(Frame(n - 1))
        }
    }

    fn prev_frame(&self, frame: Frame) -> Option<Frame> {
        if frame.0 == 0 {
            None
        } else {
            Some(Frame(frame.0 - 1))
        }
    }

    fn frame_function(&self, frame: Frame) -> Option<FuncRef> {
        if frame.0 < self.frames.borrow().len() {
            Some(FuncRef(frame.0))
        } else {
            None
        }
    }

    fn function_kind(&self, func: FuncRef) -> FunctionKind {
        match self.frames.borrow()[func.0] {
            TestFunc::Lua { .. } => FunctionKind::Lua,
            TestFunc::Fast { .. } => FunctionKind::Fast,
            TestFunc::Native { .. } => FunctionKind::Native,
        }
    }

    fn prototype_of(&self, func: FuncRef) -> Option<u64> {
        match self.frames.borrow()[func.0] {
            TestFunc::Lua { proto, .. } => Some(proto),
            _ => None,
        }
    }

    fn native_entry(&self, func: FuncRef) -> u64 {
        match self.frames.borrow()[func.0] {
            TestFunc::Fast { entry } | TestFunc::Native { entry } => entry,
            TestFunc::Lua { .. } => 0,
        }
    }

    fn frame_line(&self, frame: Frame) -> i64 {
        match self.frames.borrow()[frame.0] {
            TestFunc::Lua { line, .. } => line,
            _ => -1,
        }
    }

    fn gc_roots(&self, visit: &mut dyn FnMut(GcRoot)) {
        for pt in self.protos.borrow().iter() {
            visit(GcRoot::Proto(pt.clone()));
        }
        for tr in self.traces.borrow().iter() {
            visit(GcRoot::Trace(*tr));
        }
    }

    fn metrics(&self) -> Metrics {
        *self.metrics.borrow()
    }
}

/// Byte store shared between a test and the sink it moved into the
/// profiler.
#[derive(Clone, Default)]
pub struct SharedBytes(Rc<RefCell<Vec<u8>>>);

impl SharedBytes {
    pub fn push(&self, bytes: &[u8]) {
        self.0.borrow_mut().extend_from_slice(bytes);
    }

    pub fn take(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

/// Accepts everything.
pub struct CaptureSink {
    data: SharedBytes,
}

impl CaptureSink {
    pub fn new(data: SharedBytes) -> CaptureSink {
        CaptureSink { data }
    }
}

impl Sink for CaptureSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.data.push(chunk);
        Ok(chunk.len())
    }

    fn on_stop(&mut self, _buf: Option<Box<[u8]>>) -> io::Result<()> {
        Ok(())
    }
}

/// Accepts `limit` bytes in total, then short-writes with `errno` set,
/// the way a full pipe would.
pub struct ChokeSink {
    data: SharedBytes,
    limit: usize,
    written: usize,
    errno: i32,
}

impl ChokeSink {
    pub fn new(data: SharedBytes, limit: usize, errno: i32) -> ChokeSink {
        ChokeSink {
            data,
            limit,
            written: 0,
            errno,
        }
    }
}

impl Sink for ChokeSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        let room = self.limit - self.written.min(self.limit);
        let n = chunk.len().min(room);
        self.data.push(&chunk[..n]);
        self.written += n;
        if n < chunk.len() {
            // The profiler captures errno right after a short write.
            unsafe {
                *libc::__errno_location() = self.errno;
            }
        }
        Ok(n)
    }

    fn on_stop(&mut self, _buf: Option<Box<[u8]>>) -> io::Result<()> {
        Ok(())
    }
}

/// Accepts `limit` bytes in total, then cancels the stream with an
/// outright error.
pub struct CancelSink {
    data: SharedBytes,
    limit: usize,
    written: usize,
    errno: i32,
}

impl CancelSink {
    pub fn new(data: SharedBytes, limit: usize, errno: i32) -> CancelSink {
        CancelSink {
            data,
            limit,
            written: 0,
            errno,
        }
    }
}

impl Sink for CancelSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        if self.written + chunk.len() > self.limit {
            return Err(io::Error::from_raw_os_error(self.errno));
        }
        self.data.push(chunk);
        self.written += chunk.len();
        Ok(chunk.len())
    }

    fn on_stop(&mut self, _buf: Option<Box<[u8]>>) -> io::Result<()> {
        Ok(())
    }
}

/// Accepts everything until its trigger flips, then cancels.
pub struct TriggerSink {
    data: SharedBytes,
    armed: Rc<Cell<bool>>,
    errno: i32,
}

impl TriggerSink {
    pub fn new(data: SharedBytes, errno: i32) -> TriggerSink {
        TriggerSink {
            data,
            armed: Rc::new(Cell::new(false)),
            errno,
        }
    }

    pub fn trigger(&self) -> Rc<Cell<bool>> {
        self.armed.clone()
    }
}

impl Sink for TriggerSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        if self.armed.get() {
            return Err(io::Error::from_raw_os_error(self.errno));
        }
        self.data.push(chunk);
        Ok(chunk.len())
    }

    fn on_stop(&mut self, _buf: Option<Box<[u8]>>) -> io::Result<()> {
        Ok(())
    }
}

/// Records its `on_stop` invocations: pushes one byte holding the
/// returned buffer's length (tests use buffers well under 256 bytes).
pub struct NotifySink {
    released: SharedBytes,
}

impl NotifySink {
    pub fn new(released: SharedBytes) -> NotifySink {
        NotifySink { released }
    }
}

impl Sink for NotifySink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        Ok(chunk.len())
    }

    fn on_stop(&mut self, buf: Option<Box<[u8]>>) -> io::Result<()> {
        let len = buf.map(|b| b.len()).unwrap_or(0);
        self.released.push(&[len as u8]);
        Ok(())
    }
}
