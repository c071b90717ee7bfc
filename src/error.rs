use std::io;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Errors surfaced by the public profiler operations.
///
/// The wire-level status table maps onto these one to one: success is
/// `Ok(())`, misuse is `Misuse`, the start/stop sequencing error is
/// `Running`, resolver memory exhaustion is `Mem` and a refused or failed
/// stream is `Io`.
#[derive(Clone, Copy, Debug, Eq, Fail, PartialEq)]
pub enum Error {
    /// Invalid options, or an operation aimed at the wrong VM.
    #[fail(display = "profiler misuse: invalid options or wrong VM")]
    Misuse,

    /// `start` while profiling, or `stop` while idle. One code covers
    /// both directions of the sequencing violation.
    #[fail(display = "profiler is running (or was never started)")]
    Running,

    /// The sink refused bytes or reported an error. `errno` is whatever
    /// the sink left behind at the moment the stream went bad, captured
    /// before any cleanup callback could clobber it.
    #[fail(display = "profile stream failed (errno {})", errno)]
    Io { errno: i32 },

    /// A native-symbol table reported an implausible size and the
    /// resolver refused to allocate for it.
    #[fail(display = "out of memory while resolving native symbols")]
    Mem,
}

impl Error {
    /// The saved errno of an I/O failure, if this is one.
    pub fn errno(&self) -> Option<i32> {
        match *self {
            Error::Io { errno } => Some(errno),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io {
            errno: e.raw_os_error().unwrap_or(0),
        }
    }
}
