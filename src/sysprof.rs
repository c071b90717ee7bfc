//! Sampling system profiler.
//!
//! The host delivers a periodic tick (signal handler, timer thread
//! parked on the VM's behalf, an event-loop timer — whatever the
//! embedding provides); [`tick`] is invoked synchronously on the
//! profiled thread and must finish before the next tick lands. Late
//! ticks are dropped by the host, never queued.
//!
//! Three output modes:
//!
//! * `Default` — counter aggregation only, no stream;
//! * `Leaf` — one record per tick: the VM state plus the top frame's
//!   source;
//! * `Callgraph` — one record per tick: the VM state plus every frame
//!   the configured backtracer reports, top to bottom.
//!
//! ```text
//! stream   := symtab sysprof
//! sysprof  := prologue sample* epilogue
//! prologue := 'l' 'j' 'p' version 0x00 0x00 0x00
//! sample   := vmstate:<BYTE> frames
//! frames   := frame            (LEAF)
//!           | frame* end-mark  (CALLGRAPH)
//! frame    := source-tag:<BYTE> payload     (tags as in the memprof
//!                                            event header, unshifted)
//! end-mark := 0xff
//! epilogue := vmstate byte with the F (0x80) bit set
//! ```

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use enum_primitive::FromPrimitive;
use strum::IntoEnumIterator;

use error::{Error, Result};
use memprof::write_event;
use symtab;
use vm::{self, Source, Vm, VmState};
use wbuf::{Sink, StreamFlags, Wbuf};

pub const SYSPROF_VERSION: u8 = 1;

const SYSPROF_PROLOGUE: [u8; 7] = [b'l', b'j', b'p', SYSPROF_VERSION, 0, 0, 0];

/// Terminates the frame list of a callgraph sample.
pub const SAMPLE_END: u8 = 0xff;

/// Epilogue header: the F bit.
pub const EPILOGUE: u8 = 0x80;

/// The default sampling interval, in milliseconds.
pub const DEFAULT_INTERVAL_MS: u32 = 11;

const IDLE: usize = 0;
const PROFILE: usize = 1;
const HALT: usize = 2;

enum_from_primitive! {
/// Output mode. Adapters taking a raw mode byte from the embedding
/// language go through [`SysprofOptions::from_raw`], which rejects an
/// unknown byte as misuse.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Default = 0,
    Leaf = 1,
    Callgraph = 2,
}
}

/// Stack walker for `Callgraph` mode: report every frame's source, top
/// to bottom. Invoked under whatever context the host tick provides —
/// its safety there is the host's invariant to keep.
pub type Backtracer = fn(&dyn Vm, &mut dyn FnMut(Source));

/// Process-wide sampler configuration, set once before any start.
#[derive(Clone, Copy, Default)]
pub struct Config {
    pub backtracer: Option<Backtracer>,
}

/// Stream destination for the non-`Default` modes; same ownership
/// contract as the memory profiler's options.
pub struct StreamOptions {
    pub sink: Box<dyn Sink>,
    pub buf: Box<[u8]>,
}

/// Per-start options.
pub struct SysprofOptions {
    pub mode: Mode,
    /// Advisory sampling interval in milliseconds, at least 1. The host
    /// owns the timer; the achieved rate shows up in the `samples`
    /// counter.
    pub interval: u32,
    /// Required for `Leaf` and `Callgraph`; ignored (and released) for
    /// `Default`.
    pub stream: Option<StreamOptions>,
}

impl SysprofOptions {
    /// Options as they arrive from an embedding-language adapter, with
    /// the mode still a raw byte. An unknown byte is misuse, and the
    /// stream resources are released through `on_stop` exactly as a
    /// failed [`start`] releases them.
    pub fn from_raw(
        mode: u8,
        interval: u32,
        stream: Option<StreamOptions>,
    ) -> Result<SysprofOptions> {
        match Mode::from_u8(mode) {
            Some(mode) => Ok(SysprofOptions {
                mode,
                interval,
                stream,
            }),
            None => {
                if let Some(s) = stream {
                    release(s);
                }
                Err(Error::Misuse)
            }
        }
    }
}

impl Default for SysprofOptions {
    fn default() -> SysprofOptions {
        SysprofOptions {
            mode: Mode::Default,
            interval: DEFAULT_INTERVAL_MS,
            stream: None,
        }
    }
}

/// Aggregated sample counters. The per-state counters partition the
/// sample space: `samples` always equals their sum.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Counters {
    pub samples: u64,
    pub vmst_interp: u64,
    pub vmst_lfunc: u64,
    pub vmst_ffunc: u64,
    pub vmst_cfunc: u64,
    pub vmst_gc: u64,
    pub vmst_exit: u64,
    pub vmst_record: u64,
    pub vmst_opt: u64,
    pub vmst_asm: u64,
    pub vmst_trace: u64,
}

impl Counters {
    pub fn of(&self, st: VmState) -> u64 {
        match st {
            VmState::Interp => self.vmst_interp,
            VmState::Lfunc => self.vmst_lfunc,
            VmState::Ffunc => self.vmst_ffunc,
            VmState::Cfunc => self.vmst_cfunc,
            VmState::Gc => self.vmst_gc,
            VmState::Exit => self.vmst_exit,
            VmState::Record => self.vmst_record,
            VmState::Opt => self.vmst_opt,
            VmState::Asm => self.vmst_asm,
            VmState::Trace => self.vmst_trace,
        }
    }

    /// Sum over every per-state counter; equals `samples` after any run.
    pub fn vmstate_total(&self) -> u64 {
        VmState::iter().map(|st| self.of(st)).sum()
    }

    fn record(&mut self, st: VmState) {
        self.samples += 1;
        let slot = match st {
            VmState::Interp => &mut self.vmst_interp,
            VmState::Lfunc => &mut self.vmst_lfunc,
            VmState::Ffunc => &mut self.vmst_ffunc,
            VmState::Cfunc => &mut self.vmst_cfunc,
            VmState::Gc => &mut self.vmst_gc,
            VmState::Exit => &mut self.vmst_exit,
            VmState::Record => &mut self.vmst_record,
            VmState::Opt => &mut self.vmst_opt,
            VmState::Asm => &mut self.vmst_asm,
            VmState::Trace => &mut self.vmst_trace,
        };
        *slot += 1;
    }
}

struct Sysprof {
    vm: *mut (dyn Vm + 'static),
    vm_tag: usize,
    mode: Mode,
    #[allow(dead_code)]
    interval: u32,
    backtracer: Option<Backtracer>,
    out: Option<Wbuf>,
    saved_errno: i32,
}

struct ProfCell(UnsafeCell<Option<Sysprof>>);
struct ConfigCell(UnsafeCell<Config>);
struct CountersCell(UnsafeCell<Counters>);

// NOTE(unsafe) same single-thread contract as the memory profiler: the
// state word sequences every access.
unsafe impl Sync for ProfCell {}
unsafe impl Sync for ConfigCell {}
unsafe impl Sync for CountersCell {}

static STATE: AtomicUsize = AtomicUsize::new(IDLE);
static PROFILER: ProfCell = ProfCell(UnsafeCell::new(None));
static CONFIG: ConfigCell = ConfigCell(UnsafeCell::new(Config { backtracer: None }));
static COUNTERS: CountersCell = CountersCell(UnsafeCell::new(Counters {
    samples: 0,
    vmst_interp: 0,
    vmst_lfunc: 0,
    vmst_ffunc: 0,
    vmst_cfunc: 0,
    vmst_gc: 0,
    vmst_exit: 0,
    vmst_record: 0,
    vmst_opt: 0,
    vmst_asm: 0,
    vmst_trace: 0,
}));

/// Installs the process-wide sampler configuration. Rejected while a
/// run is live.
pub fn configure(conf: Config) -> Result<()> {
    if STATE.load(Ordering::Acquire) == PROFILE {
        return Err(Error::Running);
    }
    unsafe {
        *CONFIG.0.get() = conf;
    }
    Ok(())
}

fn release(stream: StreamOptions) {
    let StreamOptions { mut sink, buf } = stream;
    let _ = sink.on_stop(Some(buf));
}

/// Starts sampling `vm`. Validation failures release the caller's
/// stream resources through `on_stop` before reporting `Misuse` or
/// `Running`, mirroring the memory profiler's contract.
pub fn start(vm: &mut dyn Vm, opt: SysprofOptions) -> Result<()> {
    let SysprofOptions {
        mode,
        interval,
        stream,
    } = opt;

    if interval < 1 {
        if let Some(s) = stream {
            release(s);
        }
        return Err(Error::Misuse);
    }

    let stream = match mode {
        Mode::Default => {
            // Counter-only mode has no use for a stream; hand the
            // resources straight back.
            if let Some(s) = stream {
                release(s);
            }
            None
        }
        Mode::Leaf | Mode::Callgraph => match stream {
            Some(s) => {
                if s.buf.is_empty() {
                    release(s);
                    return Err(Error::Misuse);
                }
                Some(s)
            }
            None => return Err(Error::Misuse),
        },
    };

    if STATE
        .compare_exchange(IDLE, PROFILE, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        if let Some(s) = stream {
            release(s);
        }
        return Err(Error::Running);
    }

    unsafe {
        *COUNTERS.0.get() = Counters::default();
    }

    let out = match stream {
        Some(StreamOptions { sink, buf }) => {
            let mut out = Wbuf::new(sink, buf);
            symtab::dump(&mut out, vm, true);
            out.add_raw(&SYSPROF_PROLOGUE);
            if out.test_flag(StreamFlags::ERR_IO | StreamFlags::STOP) {
                let errno = out.errno();
                let (mut sink, buf) = out.terminate();
                let _ = sink.on_stop(buf);
                STATE.store(IDLE, Ordering::Release);
                return Err(Error::Io { errno });
            }
            Some(out)
        }
        None => None,
    };

    let backtracer = unsafe { (*CONFIG.0.get()).backtracer };
    // NOTE(unsafe) identical lifetime contract to the memory profiler.
    let vm_ptr: *mut (dyn Vm + 'static) = unsafe { mem::transmute(vm as *mut dyn Vm) };
    unsafe {
        *PROFILER.0.get() = Some(Sysprof {
            vm: vm_ptr,
            vm_tag: vm as *const dyn Vm as *const () as usize,
            mode,
            interval,
            backtracer,
            out,
            saved_errno: 0,
        });
    }

    debug!("sysprof started, mode {:?}, interval {}ms", mode, interval);
    Ok(())
}

/// Stops sampling and releases the stream, reporting the preserved
/// errno if the sink halted the run in between.
pub fn stop(vm: &mut dyn Vm) -> Result<()> {
    match STATE.load(Ordering::Acquire) {
        HALT => {
            let sp = match unsafe { (*PROFILER.0.get()).take() } {
                Some(sp) => sp,
                None => {
                    STATE.store(IDLE, Ordering::Release);
                    return Err(Error::Running);
                }
            };
            STATE.store(IDLE, Ordering::Release);
            let errno = sp.saved_errno;
            if let Some(out) = sp.out {
                let (mut sink, buf) = out.terminate();
                let _ = sink.on_stop(buf);
            }
            Err(Error::Io { errno })
        }
        PROFILE => {
            let sp = match unsafe { (*PROFILER.0.get()).take() } {
                Some(sp) => sp,
                None => return Err(Error::Running),
            };
            if sp.vm_tag != vm as *const dyn Vm as *const () as usize {
                unsafe {
                    *PROFILER.0.get() = Some(sp);
                }
                return Err(Error::Misuse);
            }
            STATE.store(IDLE, Ordering::Release);
            match sp.out {
                Some(out) => finish_stream(out),
                None => {
                    debug!("sysprof stopped");
                    Ok(())
                }
            }
        }
        _ => Err(Error::Running),
    }
}

/// Aggregated counters. Readable at any time — before, during or after
/// a run — from the profiled thread.
pub fn report() -> Counters {
    unsafe { *COUNTERS.0.get() }
}

/// One host tick: classify the VM, bump the counters and, in the stream
/// modes, emit the sample record. No-op unless a run is live.
pub fn tick() {
    if STATE.load(Ordering::Acquire) != PROFILE {
        return;
    }
    let sp = match unsafe { (*PROFILER.0.get()).as_mut() } {
        Some(sp) => sp,
        None => return,
    };
    // NOTE(unsafe) tick runs on the profiled thread by contract.
    let vm = unsafe { &*sp.vm };
    let st = vm.vm_state();
    unsafe {
        (*COUNTERS.0.get()).record(st);
    }

    let out = match sp.out {
        Some(ref mut out) => out,
        None => return,
    };
    out.add_byte(st as u8);
    match sp.mode {
        Mode::Leaf => write_frame(out, vm::classify_source(vm)),
        Mode::Callgraph => {
            match sp.backtracer {
                Some(bt) => bt(vm, &mut |src| write_frame(out, src)),
                // No backtracer configured: degrade to leaf output.
                None => write_frame(out, vm::classify_source(vm)),
            }
            out.add_byte(SAMPLE_END);
        }
        Mode::Default => {}
    }

    if out.test_flag(StreamFlags::STOP) {
        sp.saved_errno = out.errno();
        STATE.store(HALT, Ordering::Release);
        debug!("sysprof halted mid-run, errno {}", sp.saved_errno);
    }
}

/// A ready-made backtracer walking the VM's own frame chain, for hosts
/// without a native unwinder.
pub fn frame_backtracer(vm: &dyn Vm, emit: &mut dyn FnMut(Source)) {
    let mut frame = vm.top_frame();
    while let Some(f) = frame {
        emit(vm::frame_source_at(vm, f));
        frame = vm.prev_frame(f);
    }
}

fn write_frame(out: &mut Wbuf, src: Source) {
    // A frame is a memprof source record with a zero event field.
    write_event(out, 0, src);
}

fn finish_stream(mut out: Wbuf) -> Result<()> {
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
    debug!("sysprof stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use record;
    use testvm::{
        serialize_profiler_tests, CaptureSink, NotifySink, SharedBytes, TestFunc, TestVm,
        TriggerSink,
    };

    fn stream(bytes: &SharedBytes, cap: usize) -> Option<StreamOptions> {
        Some(StreamOptions {
            sink: Box::new(CaptureSink::new(bytes.clone())),
            buf: vec![0u8; cap].into_boxed_slice(),
        })
    }

    /// The adapter path: a raw mode byte straight into `start`.
    fn start_raw(vm: &mut TestVm, mode: u8, stream: Option<StreamOptions>) -> Result<()> {
        start(vm, SysprofOptions::from_raw(mode, DEFAULT_INTERVAL_MS, stream)?)
    }

    /// The validation walk of the public API, in one sitting.
    #[test]
    fn start_validation_sequence() {
        let _guard = serialize_profiler_tests();
        let mut vm = TestVm::new();

        configure(Config::default()).unwrap();

        // Unknown mode, fed straight through the start path.
        assert_eq!(start_raw(&mut vm, 0x40, None).unwrap_err(), Error::Misuse);

        // The same misuse with stream resources attached still releases
        // them through on_stop.
        let released = SharedBytes::default();
        let bad = Some(StreamOptions {
            sink: Box::new(NotifySink::new(released.clone())),
            buf: vec![0u8; 64].into_boxed_slice(),
        });
        assert_eq!(start_raw(&mut vm, 0x40, bad).unwrap_err(), Error::Misuse);
        assert_eq!(released.take(), vec![64]);

        // A known raw mode passes through to a live run.
        start_raw(&mut vm, Mode::Default as u8, None).unwrap();
        stop(&mut vm).unwrap();

        // Stream-less callgraph.
        let opt = SysprofOptions {
            mode: Mode::Callgraph,
            interval: DEFAULT_INTERVAL_MS,
            stream: None,
        };
        assert_eq!(start(&mut vm, opt).unwrap_err(), Error::Misuse);

        // Bad interval.
        let opt = SysprofOptions {
            mode: Mode::Default,
            interval: 0,
            stream: None,
        };
        assert_eq!(start(&mut vm, opt).unwrap_err(), Error::Misuse);

        // And a well-formed default-mode run.
        let opt = SysprofOptions {
            mode: Mode::Default,
            interval: 11,
            stream: None,
        };
        start(&mut vm, opt).unwrap();
        assert_eq!(
            start(&mut vm, SysprofOptions::default()).unwrap_err(),
            Error::Running
        );
        stop(&mut vm).unwrap();
        assert_eq!(stop(&mut vm).unwrap_err(), Error::Running);
    }

    #[test]
    fn counters_partition_the_sample_space() {
        let _guard = serialize_profiler_tests();
        let mut vm = TestVm::new();

        start(&mut vm, SysprofOptions::default()).unwrap();

        // A payload hopping through every state the sampler can see.
        let states = [
            VmState::Interp,
            VmState::Lfunc,
            VmState::Lfunc,
            VmState::Ffunc,
            VmState::Cfunc,
            VmState::Gc,
            VmState::Exit,
            VmState::Record,
            VmState::Opt,
            VmState::Asm,
            VmState::Trace,
        ];
        for i in 0..200 {
            vm.set_state(states[i % states.len()]);
            if states[i % states.len()] == VmState::Trace {
                vm.set_trace(Some(1));
            }
            tick();
        }
        stop(&mut vm).unwrap();

        let cnt = report();
        assert!(cnt.samples > 1);
        assert_eq!(cnt.samples, 200);
        assert_eq!(cnt.samples, cnt.vmstate_total());
        // Still retrievable after the run ended.
        assert_eq!(report(), cnt);
    }

    #[test]
    fn leaf_mode_streams_one_source_per_tick() {
        let _guard = serialize_profiler_tests();
        let mut vm = TestVm::new();
        vm.add_proto(0x900, "@leaf.lua", 1);
        vm.push_frame(TestFunc::Lua {
            proto: 0x900,
            line: 5,
        });
        vm.set_state(VmState::Lfunc);

        let bytes = SharedBytes::default();
        let opt = SysprofOptions {
            mode: Mode::Leaf,
            interval: DEFAULT_INTERVAL_MS,
            stream: stream(&bytes, 512 * 1024),
        };
        start(&mut vm, opt).unwrap();
        tick();
        vm.set_state(VmState::Gc);
        tick();
        stop(&mut vm).unwrap();

        let parsed = record::parse_sysprof(&bytes.take(), false).unwrap();
        // The preamble resolves the sampled prototype.
        assert!(parsed.symtab.iter().any(|e| match *e {
            record::SymtabEntry::Lfunc { id, .. } => id == 0x900,
            _ => false,
        }));
        assert_eq!(parsed.samples.len(), 2);
        assert_eq!(parsed.samples[0].vmstate, VmState::Lfunc);
        assert_eq!(
            parsed.samples[0].frames,
            vec![Source::Lua {
                proto: 0x900,
                line: 5,
            }]
        );
        assert_eq!(parsed.samples[1].vmstate, VmState::Gc);
        assert_eq!(parsed.samples[1].frames, vec![Source::Internal]);
    }

    #[test]
    fn callgraph_mode_walks_the_whole_stack() {
        let _guard = serialize_profiler_tests();
        let mut vm = TestVm::new();
        vm.push_frame(TestFunc::Lua {
            proto: 0xa00,
            line: 3,
        });
        vm.push_frame(TestFunc::Lua {
            proto: 0xb00,
            line: 8,
        });
        vm.push_frame(TestFunc::Native { entry: 0xcafe });
        vm.set_state(VmState::Cfunc);

        configure(Config {
            backtracer: Some(frame_backtracer),
        })
        .unwrap();

        let bytes = SharedBytes::default();
        let opt = SysprofOptions {
            mode: Mode::Callgraph,
            interval: DEFAULT_INTERVAL_MS,
            stream: stream(&bytes, 512 * 1024),
        };
        start(&mut vm, opt).unwrap();
        tick();
        stop(&mut vm).unwrap();
        configure(Config::default()).unwrap();

        let parsed = record::parse_sysprof(&bytes.take(), true).unwrap();
        assert_eq!(parsed.samples.len(), 1);
        assert_eq!(parsed.samples[0].vmstate, VmState::Cfunc);
        // Top to bottom.
        assert_eq!(
            parsed.samples[0].frames,
            vec![
                Source::Native { addr: 0xcafe },
                Source::Lua {
                    proto: 0xb00,
                    line: 8,
                },
                Source::Lua {
                    proto: 0xa00,
                    line: 3,
                },
            ]
        );
    }

    #[test]
    fn callgraph_without_backtracer_degrades_to_leaf() {
        let _guard = serialize_profiler_tests();
        let mut vm = TestVm::new();
        vm.push_frame(TestFunc::Native { entry: 0xd00d });
        vm.set_state(VmState::Cfunc);

        configure(Config::default()).unwrap();

        let bytes = SharedBytes::default();
        let opt = SysprofOptions {
            mode: Mode::Callgraph,
            interval: DEFAULT_INTERVAL_MS,
            stream: stream(&bytes, 512 * 1024),
        };
        start(&mut vm, opt).unwrap();
        tick();
        stop(&mut vm).unwrap();

        let parsed = record::parse_sysprof(&bytes.take(), true).unwrap();
        assert_eq!(
            parsed.samples[0].frames,
            vec![Source::Native { addr: 0xd00d }]
        );
    }

    #[test]
    fn cancelled_sink_halts_sampling() {
        let _guard = serialize_profiler_tests();
        let mut vm = TestVm::new();
        vm.set_state(VmState::Interp);

        let bytes = SharedBytes::default();
        let sink = TriggerSink::new(bytes.clone(), ::libc::EBADF);
        let trigger = sink.trigger();
        let opt = SysprofOptions {
            mode: Mode::Leaf,
            interval: DEFAULT_INTERVAL_MS,
            stream: Some(StreamOptions {
                sink: Box::new(sink),
                buf: vec![0u8; 32].into_boxed_slice(),
            }),
        };
        // The sink accepts the whole preamble, then starts refusing.
        start(&mut vm, opt).unwrap();
        trigger.set(true);

        let mut halted = false;
        for _ in 0..1000 {
            tick();
            if STATE.load(Ordering::Acquire) == HALT {
                halted = true;
                break;
            }
        }
        assert!(halted);
        let before = report().samples;

        // Ticks after the halt change nothing.
        tick();
        assert_eq!(report().samples, before);

        let err = stop(&mut vm).unwrap_err();
        assert_eq!(
            err,
            Error::Io {
                errno: ::libc::EBADF,
            }
        );
    }

    #[test]
    fn configure_is_rejected_while_running() {
        let _guard = serialize_profiler_tests();
        let mut vm = TestVm::new();

        start(&mut vm, SysprofOptions::default()).unwrap();
        assert_eq!(configure(Config::default()).unwrap_err(), Error::Running);
        stop(&mut vm).unwrap();
        configure(Config::default()).unwrap();
    }
}
