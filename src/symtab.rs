//! Symbol-table stream emitter.
//!
//! The symtab is a finite prefix stream that later event records join
//! against by identity (prototype handle, trace number, native address):
//!
//! ```text
//! symtab   := prologue sym* final
//! prologue := 'l' 'j' 's' version 0x00 0x00 0x00
//! sym      := sym-lfunc | sym-trace | sym-cfunc
//! sym-lfunc := header(LFUNC) id:<ULEB128> chunk:string line:<ULEB128>
//! sym-trace := header(TRACE) trace-no:<ULEB128> id:<ULEB128> line:<ULEB128>
//! sym-cfunc := header(CFUNC) addr:<ULEB128> name:string
//! final     := header with the F bit set
//! ```
//!
//! Header byte, hi to lo: `[F U U U U U T T]` — two type bits, five
//! unused, one final-marker bit.
//!
//! Objects born after profiling started do not get lost: the memory
//! profiler re-uses the entry payload writers here for its inline
//! incremental symtab events.

use vm::{GcRoot, ProtoInfo, TraceInfo, Vm};
use wbuf::Wbuf;

pub const SYMTAB_VERSION: u8 = 1;

const SYMTAB_PROLOGUE: [u8; 7] = [b'l', b'j', b's', SYMTAB_VERSION, 0, 0, 0];

/// Symbol type tags (low header bits).
pub const SYMTAB_LFUNC: u8 = 0;
pub const SYMTAB_TRACE: u8 = 2;
pub const SYMTAB_CFUNC: u8 = 3;
/// Final-symbol marker; all other bits are ignored by decoders.
pub const SYMTAB_FINAL: u8 = 0x80;

/// Emit the full preamble: prologue, one entry per live prototype and
/// trace, optionally every resolvable native symbol, and the final
/// marker.
pub fn dump(out: &mut Wbuf, vm: &dyn Vm, native: bool) {
    out.add_raw(&SYMTAB_PROLOGUE);

    vm.gc_roots(&mut |root| match root {
        GcRoot::Proto(pt) => {
            out.add_byte(SYMTAB_LFUNC);
            write_proto(out, &pt);
        }
        GcRoot::Trace(tr) => {
            out.add_byte(SYMTAB_TRACE);
            write_trace(out, &tr);
        }
    });

    if native {
        dump_native(out);
    }

    out.add_byte(SYMTAB_FINAL);
}

/// `LFUNC` payload: id, defining chunk, first line.
pub(crate) fn write_proto(out: &mut Wbuf, pt: &ProtoInfo) {
    out.add_u64(pt.id);
    out.add_string(&pt.chunk);
    out.add_u64(pt.first_line);
}

/// `TRACE` payload: trace number, starting prototype, starting line.
pub(crate) fn write_trace(out: &mut Wbuf, tr: &TraceInfo) {
    out.add_u64(tr.trace_no);
    out.add_u64(tr.proto);
    out.add_u64(tr.line);
}

/// `CFUNC` payload: resolved address, symbol name.
pub(crate) fn write_cfunc(out: &mut Wbuf, addr: u64, name: &str) {
    out.add_u64(addr);
    out.add_string(name);
}

#[cfg(target_os = "linux")]
fn dump_native(out: &mut Wbuf) {
    ::elf::dump_symbols(out);
}

/// Native symbols are resolved from the loaded ELF objects; on other
/// platforms the preamble simply carries none.
#[cfg(not(target_os = "linux"))]
fn dump_native(_out: &mut Wbuf) {}
