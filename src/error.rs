use std::io;

use nix::errno::Errno;

use crate::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The tracee exited or was killed between ptrace-stops. Expected during
    /// teardown; handlers convert this into a DEAD transition and let the
    /// wait status finish the accounting.
    #[error("Tracee {pid} died mid-operation")]
    TraceeDied { pid: Pid },

    /// The event stream for `pid` is inconsistent: an event arrived out of
    /// order or at a strange time. The pid is dropped from the registry in
    /// whatever state it was in; other tracees are unaffected.
    #[error("Bad trace for pid {pid}: {message}")]
    BadTrace { pid: Pid, message: String },

    #[error("System call failed")]
    System(#[from] nix::Error),

    #[error("Input/output error")]
    InputOutput(#[from] io::Error),

    /// Invariant violation outside the ptrace stream, e.g. the executable
    /// could not be found at `start()`, or a leader died before its initial
    /// exec.
    #[error("{0}")]
    Runtime(String),
}

impl Error {
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }

    pub fn bad_trace(&self) -> bool {
        matches!(self, Error::BadTrace { .. })
    }
}

/// Raise [`Error::BadTrace`] for `pid` with a formatted message.
macro_rules! bad_trace {
    ($pid: expr, $($arg: tt)*) => {
        return Err($crate::error::Error::BadTrace {
            pid: $pid,
            message: format!($($arg)*),
        })
    }
}

pub(crate) trait ResultExt<T> {
    /// Map `ESRCH` into [`Error::TraceeDied`], attributing it to `pid`.
    ///
    /// Any ptrace request can race with the death of its target. The raw
    /// errno does not say which tracee vanished, so the caller must.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|errno| match errno {
            Errno::ESRCH => Error::TraceeDied { pid },
            other => Error::System(other),
        })
    }
}
