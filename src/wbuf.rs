//! Byte-oriented accumulator for profile streams.
//!
//! Every emitter in this crate funnels through a [`Wbuf`]: bytes are
//! packed into one large caller-owned buffer and handed to a [`Sink`] in
//! big chunks, so the allocator hot path pays a couple of byte stores per
//! event rather than a syscall.
//!
//! Wire primitives:
//!
//! * `<ULEB128>` — unsigned integer in 7-bit groups, continuation bit
//!   `0x80`, least significant group first.
//! * `string` — `<ULEB128>` length followed by the raw bytes, no
//!   terminating zero.
//!
//! The buffer carries two sticky flags. Once either is set, every further
//! add or flush is a no-op and the captured errno is kept for the public
//! stop operation to report.

use std::fs::File;
use std::io;
use std::io::Write;
use std::mem;
use std::path::Path;

use libc;
use nix::errno::errno;

bitflags! {
    /// Sticky stream-state flags.
    pub struct StreamFlags: u8 {
        /// The sink cancelled the stream; the profiler should
        /// deinstrument itself at the next opportunity.
        const STOP = 0b01;
        /// The sink failed to accept a full chunk.
        const ERR_IO = 0b10;
    }
}

/// Destination of an encoded profile stream.
///
/// A sink reports backpressure through its return value:
///
/// * `Ok(n)` with `n == chunk.len()` — the chunk was accepted.
/// * `Ok(n)` with `n < chunk.len()` (zero included) — a short write. The
///   stream is over: `ERR_IO` goes sticky and errno is captured, but the
///   profiler stays installed and merely drops everything further.
/// * `Err(_)` — the sink cancels the stream outright. `STOP` goes sticky
///   in addition to `ERR_IO` and the memory profiler deinstruments
///   itself from within the allocator hook.
///
/// The sampling profiler invokes the sink from whatever context the host
/// delivers its timer tick in; a sink installed for sampling must be safe
/// in that context.
pub trait Sink {
    /// Consume `chunk`, returning how many bytes were actually taken.
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize>;

    /// Invoked exactly once when the profiler releases the stream. The
    /// caller's buffer is handed back (`None` if the sink previously
    /// cancelled the stream). A returned error surfaces as an I/O error
    /// from the public stop operation.
    fn on_stop(&mut self, buf: Option<Box<[u8]>>) -> io::Result<()>;
}

/// The write buffer: caller-owned storage, a sink, and the sticky state.
pub struct Wbuf {
    sink: Box<dyn Sink>,
    buf: Option<Box<[u8]>>,
    pos: usize,
    flags: StreamFlags,
    saved_errno: i32,
}

impl Wbuf {
    pub fn new(sink: Box<dyn Sink>, buf: Box<[u8]>) -> Wbuf {
        Wbuf {
            sink,
            buf: Some(buf),
            pos: 0,
            flags: StreamFlags::empty(),
            saved_errno: 0,
        }
    }

    /// True once any sticky flag is set.
    pub fn test_flag(&self, mask: StreamFlags) -> bool {
        self.flags.intersects(mask)
    }

    /// errno captured when the stream went bad, 0 otherwise.
    pub fn errno(&self) -> i32 {
        self.saved_errno
    }

    pub fn add_byte(&mut self, b: u8) {
        self.add_raw(&[b]);
    }

    /// ULEB128 encoding of `v`.
    pub fn add_u64(&mut self, mut v: u64) {
        let mut enc = [0u8; 10];
        let mut n = 0;
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            enc[n] = byte;
            n += 1;
            if v == 0 {
                break;
            }
        }
        self.add_raw(&enc[..n]);
    }

    /// ULEB128 length followed by the raw bytes.
    pub fn add_string(&mut self, s: &str) {
        self.add_u64(s.len() as u64);
        self.add_raw(s.as_bytes());
    }

    pub fn add_raw(&mut self, bytes: &[u8]) {
        if !self.flags.is_empty() {
            return;
        }
        let cap = match self.buf {
            Some(ref b) => b.len(),
            None => return,
        };
        if bytes.len() >= cap {
            // Oversized payload: drain what we have, then hand the
            // payload straight to the sink.
            self.flush();
            if self.flags.is_empty() && !self.sink_write(bytes) {
                self.buf = None;
            }
            return;
        }
        if self.pos + bytes.len() > cap {
            self.flush();
            if !self.flags.is_empty() {
                return;
            }
        }
        if let Some(ref mut buf) = self.buf {
            buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
            self.pos += bytes.len();
        }
    }

    /// Drain the accumulated region through the sink in one call.
    pub fn flush(&mut self) {
        if !self.flags.is_empty() || self.pos == 0 {
            return;
        }
        let buf = match self.buf.take() {
            Some(b) => b,
            None => return,
        };
        let pos = mem::replace(&mut self.pos, 0);
        let keep = self.sink_write(&buf[..pos]);
        if keep {
            self.buf = Some(buf);
        }
    }

    /// Hand the stream pieces back so `on_stop` can run. The buffer is
    /// `None` when the sink cancelled the stream earlier.
    pub fn terminate(self) -> (Box<dyn Sink>, Option<Box<[u8]>>) {
        (self.sink, self.buf)
    }

    /// Returns false when the sink cancelled the stream and the buffer
    /// must be surrendered.
    fn sink_write(&mut self, chunk: &[u8]) -> bool {
        match self.sink.write(chunk) {
            Ok(n) if n >= chunk.len() => true,
            Ok(_) => {
                self.flags.insert(StreamFlags::ERR_IO);
                self.saved_errno = errno();
                debug!("profile sink accepted a short chunk, stream over");
                true
            }
            Err(e) => {
                self.flags.insert(StreamFlags::ERR_IO | StreamFlags::STOP);
                self.saved_errno = e.raw_os_error().unwrap_or(libc::EIO);
                debug!("profile sink cancelled the stream: {}", e);
                false
            }
        }
    }
}

/// Stock sink writing the stream to a file.
///
/// Short kernel writes are retried and `EINTR` is swallowed, so the only
/// way this sink ends a stream is a real I/O error.
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<FileSink> {
        Ok(FileSink {
            file: File::create(path)?,
        })
    }

    pub fn from_file(file: File) -> FileSink {
        FileSink { file }
    }
}

impl Sink for FileSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < chunk.len() {
            match self.file.write(&chunk[total..]) {
                Ok(0) => return Ok(total),
                Ok(n) => total += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn on_stop(&mut self, _buf: Option<Box<[u8]>>) -> io::Result<()> {
        self.file.flush()
    }
}
