//! In-process profilers for a dynamic-language virtual machine.
//!
//! Two profilers share one streaming codec:
//!
//! * [`memprof`] intercepts the VM's allocator and emits one
//!   source-annotated record per allocation, reallocation and free.
//! * [`sysprof`] is driven by a host timer tick and either aggregates
//!   per-VM-state counters or emits one sample record per tick.
//!
//! Both streams open with a symbol-table preamble ([`symtab`]) so that the
//! opaque identifiers inside the records (function prototype handles, JIT
//! trace numbers, native entry addresses) can be resolved offline. The VM
//! itself is only reached through the [`vm::Vm`] trait; an embedder
//! implements it once and hands the profilers a `&mut dyn Vm`.
//!
//! Neither profiler spawns threads. The allocator hook and the sampler
//! tick run synchronously on the VM's thread, and a slow [`wbuf::Sink`]
//! throttles the profiled program instead of losing events.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate enum_primitive;
#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate strum_macros;

extern crate bytes;
extern crate failure;
extern crate libc;
extern crate nix;
extern crate serde;
extern crate strum;

#[cfg(test)]
extern crate env_logger;
#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
#[cfg(test)]
extern crate rand;

pub mod error;
pub mod wbuf;
pub mod vm;
pub mod symtab;
#[cfg(target_os = "linux")]
pub mod elf;
pub mod memprof;
pub mod sysprof;
pub mod record;

#[cfg(test)]
mod testvm;

pub use error::{Error, Result};
pub use memprof::MemprofOptions;
pub use sysprof::{Backtracer, Config, Counters, Mode, StreamOptions, SysprofOptions};
pub use vm::{
    Allocator, Frame, FuncRef, FunctionKind, GcRoot, Metrics, ProtoInfo, Source, TraceInfo, Vm,
    VmState,
};
pub use wbuf::{FileSink, Sink};

/// Default stream buffer size. 8 MiB, tuned so that a profiled workload
/// does not bother the platform with too frequent flushes.
pub const STREAM_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Allocates a stream buffer of the default size.
pub fn stream_buffer() -> Box<[u8]> {
    vec![0u8; STREAM_BUFFER_SIZE].into_boxed_slice()
}
