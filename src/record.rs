//! Decoding support for the emitted streams.
//!
//! The profilers only ever write; everything that needs to read the
//! bytes back — the crate's own tests first of all, but also any
//! embedder post-processing a capture in process — goes through here.
//! The decoders are strict: unknown headers and truncated payloads are
//! reported, not skipped.

use std::io::Cursor;

use bytes::Buf;
use enum_primitive::FromPrimitive;

use memprof::{
    AEVENT_ALLOC, AEVENT_FREE, AEVENT_REALLOC, AEVENT_SYMTAB, ASOURCE_CFUNC, ASOURCE_INT,
    ASOURCE_LFUNC, ASOURCE_TRACE, EPILOGUE, MEMPROF_VERSION,
};
use symtab::{SYMTAB_CFUNC, SYMTAB_FINAL, SYMTAB_LFUNC, SYMTAB_TRACE, SYMTAB_VERSION};
use sysprof::{SAMPLE_END, SYSPROF_VERSION};
use vm::{Source, VmState};

#[derive(Debug, Fail)]
pub enum ParseError {
    #[fail(display = "stream ended inside a record")]
    Truncated,
    #[fail(display = "bad prologue for stream kind {:?}", kind)]
    BadPrologue { kind: u8 },
    #[fail(display = "unknown header byte 0x{:02x}", byte)]
    BadHeader { byte: u8 },
    #[fail(display = "string payload is not UTF-8")]
    BadString,
    #[fail(display = "ULEB128 run does not terminate")]
    BadVarint,
}

/// A decoded symtab entry, from the preamble or the incremental path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SymtabEntry {
    Lfunc {
        id: u64,
        chunk: String,
        first_line: u64,
    },
    Trace {
        trace_no: u64,
        proto: u64,
        line: u64,
    },
    Cfunc {
        addr: u64,
        name: String,
    },
}

/// A decoded memprof event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemprofEvent {
    Alloc {
        source: Source,
        naddr: u64,
        nsize: u64,
    },
    Free {
        source: Source,
        oaddr: u64,
        osize: u64,
    },
    Realloc {
        source: Source,
        oaddr: u64,
        osize: u64,
        naddr: u64,
        nsize: u64,
    },
    /// An incremental symtab entry injected into the event stream.
    Symtab(SymtabEntry),
}

/// A decoded memprof capture: preamble plus the event log.
#[derive(Debug)]
pub struct MemprofStream {
    pub symtab: Vec<SymtabEntry>,
    pub events: Vec<MemprofEvent>,
}

/// A decoded sysprof sample. Leaf samples carry exactly one frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sample {
    pub vmstate: VmState,
    pub frames: Vec<Source>,
}

/// A decoded sysprof capture.
#[derive(Debug)]
pub struct SysprofStream {
    pub symtab: Vec<SymtabEntry>,
    pub samples: Vec<Sample>,
}

/// ULEB128 over `u64`: 7-bit groups, continuation bit 0x80.
pub fn read_u64<B: Buf>(buf: &mut B) -> Result<u64, ParseError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(ParseError::Truncated);
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(ParseError::BadVarint);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(ParseError::BadVarint);
        }
    }
}

fn read_string<B: Buf>(buf: &mut B) -> Result<String, ParseError> {
    let len = read_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(ParseError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ParseError::BadString)
}

fn expect_prologue<B: Buf>(buf: &mut B, kind: u8, version: u8) -> Result<(), ParseError> {
    if buf.remaining() < 7 {
        return Err(ParseError::Truncated);
    }
    let mut head = [0u8; 7];
    buf.copy_to_slice(&mut head);
    if head != [b'l', b'j', kind, version, 0, 0, 0] {
        return Err(ParseError::BadPrologue { kind });
    }
    Ok(())
}

fn read_symtab_payload<B: Buf>(buf: &mut B, tag: u8) -> Result<SymtabEntry, ParseError> {
    match tag {
        SYMTAB_LFUNC => Ok(SymtabEntry::Lfunc {
            id: read_u64(buf)?,
            chunk: read_string(buf)?,
            first_line: read_u64(buf)?,
        }),
        SYMTAB_TRACE => Ok(SymtabEntry::Trace {
            trace_no: read_u64(buf)?,
            proto: read_u64(buf)?,
            line: read_u64(buf)?,
        }),
        SYMTAB_CFUNC => Ok(SymtabEntry::Cfunc {
            addr: read_u64(buf)?,
            name: read_string(buf)?,
        }),
        byte => Err(ParseError::BadHeader { byte }),
    }
}

/// The symtab preamble: everything between its prologue and the final
/// marker. The cursor is left on the byte after the marker.
pub fn parse_symtab(cur: &mut Cursor<Vec<u8>>) -> Result<Vec<SymtabEntry>, ParseError> {
    expect_prologue(cur, b's', SYMTAB_VERSION)?;
    let mut entries = Vec::new();
    loop {
        if !cur.has_remaining() {
            return Err(ParseError::Truncated);
        }
        let header = cur.get_u8();
        if header & SYMTAB_FINAL != 0 {
            return Ok(entries);
        }
        entries.push(read_symtab_payload(cur, header)?);
    }
}

fn read_source_payload<B: Buf>(buf: &mut B, tag: u8) -> Result<Source, ParseError> {
    match tag {
        ASOURCE_INT => Ok(Source::Internal),
        ASOURCE_LFUNC => Ok(Source::Lua {
            proto: read_u64(buf)?,
            line: read_u64(buf)?,
        }),
        ASOURCE_CFUNC => Ok(Source::Native {
            addr: read_u64(buf)?,
        }),
        ASOURCE_TRACE => Ok(Source::Trace {
            trace_no: read_u64(buf)?,
        }),
        byte => Err(ParseError::BadHeader { byte }),
    }
}

/// A whole memprof capture: symtab, prologue, events, epilogue.
pub fn parse_memprof(bytes: &[u8]) -> Result<MemprofStream, ParseError> {
    let mut cur = Cursor::new(bytes.to_vec());
    let symtab = parse_symtab(&mut cur)?;
    expect_prologue(&mut cur, b'm', MEMPROF_VERSION)?;

    let mut events = Vec::new();
    loop {
        if !cur.has_remaining() {
            return Err(ParseError::Truncated);
        }
        let header = cur.get_u8();
        if header & EPILOGUE != 0 {
            return Ok(MemprofStream { symtab, events });
        }
        let aevent = header & 0x3;
        let tag = header & !0x3;
        events.push(match aevent {
            AEVENT_SYMTAB => {
                // Incremental entries reuse the symtab payloads under
                // the event-source tags.
                match tag {
                    ASOURCE_LFUNC => MemprofEvent::Symtab(read_symtab_payload(
                        &mut cur,
                        SYMTAB_LFUNC,
                    )?),
                    ASOURCE_TRACE => MemprofEvent::Symtab(read_symtab_payload(
                        &mut cur,
                        SYMTAB_TRACE,
                    )?),
                    _ => return Err(ParseError::BadHeader { byte: header }),
                }
            }
            AEVENT_ALLOC => {
                let source = read_source_payload(&mut cur, tag)?;
                MemprofEvent::Alloc {
                    source,
                    naddr: read_u64(&mut cur)?,
                    nsize: read_u64(&mut cur)?,
                }
            }
            AEVENT_FREE => {
                let source = read_source_payload(&mut cur, tag)?;
                MemprofEvent::Free {
                    source,
                    oaddr: read_u64(&mut cur)?,
                    osize: read_u64(&mut cur)?,
                }
            }
            AEVENT_REALLOC => {
                let source = read_source_payload(&mut cur, tag)?;
                MemprofEvent::Realloc {
                    source,
                    oaddr: read_u64(&mut cur)?,
                    osize: read_u64(&mut cur)?,
                    naddr: read_u64(&mut cur)?,
                    nsize: read_u64(&mut cur)?,
                }
            }
            _ => unreachable!("two-bit event field"),
        });
    }
}

/// A whole sysprof capture. `callgraph` selects the frame-list sample
/// shape (`Leaf` captures carry exactly one frame, no end marker).
pub fn parse_sysprof(bytes: &[u8], callgraph: bool) -> Result<SysprofStream, ParseError> {
    let mut cur = Cursor::new(bytes.to_vec());
    let symtab = parse_symtab(&mut cur)?;
    expect_prologue(&mut cur, b'p', SYSPROF_VERSION)?;

    let mut samples = Vec::new();
    loop {
        if !cur.has_remaining() {
            return Err(ParseError::Truncated);
        }
        let header = cur.get_u8();
        if header & EPILOGUE != 0 {
            return Ok(SysprofStream { symtab, samples });
        }
        let vmstate = VmState::from_u8(header).ok_or(ParseError::BadHeader { byte: header })?;
        let mut frames = Vec::new();
        if callgraph {
            loop {
                if !cur.has_remaining() {
                    return Err(ParseError::Truncated);
                }
                let tag = cur.get_u8();
                if tag == SAMPLE_END {
                    break;
                }
                frames.push(read_source_payload(&mut cur, tag)?);
            }
        } else {
            if !cur.has_remaining() {
                return Err(ParseError::Truncated);
            }
            let tag = cur.get_u8();
            frames.push(read_source_payload(&mut cur, tag)?);
        }
        samples.push(Sample { vmstate, frames });
    }
}
