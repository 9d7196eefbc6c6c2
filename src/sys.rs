//! Thin adapter over the kernel's trace, wait, and signal primitives.
//!
//! Everything here is a free function taking a pid; nothing in this module
//! touches tracer state or holds the tracer lock. Failures are classified at
//! this boundary: `ESRCH` becomes [`Error::TraceeDied`], `EINTR` is retried
//! in place, and everything else propagates as a system error.

use std::fs;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};

use crate::error::{Result, ResultExt};
use crate::Pid;

#[cfg(target_arch = "aarch64")]
use crate::aarch64;

#[cfg(target_arch = "x86_64")]
pub use crate::x86::Registers;

#[cfg(target_arch = "aarch64")]
pub use crate::aarch64::Registers;

/// Attach options requested on every tracee.
///
/// Syscall-stops must be distinguishable from signal-stops (`TRACESYSGOOD`),
/// and fork, vfork, clone, and exec must report as ptrace-event-stops so new
/// children auto-attach and exec transitions are unambiguous.
pub const TRACE_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXEC);

/// Set [`TRACE_OPTIONS`] on a newly-stopped tracee.
///
/// Children created by fork/vfork/clone inherit the options when they
/// auto-attach, so this only needs to run once per leader.
pub fn init_options(pid: Pid) -> Result<()> {
    ptrace::setoptions(pid, TRACE_OPTIONS).died_if_esrch(pid)
}

/// Resume a stopped tracee until its next syscall-stop, injecting `signal`
/// if one is pending.
pub fn resume(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::syscall(pid, signal).died_if_esrch(pid)
}

/// Resume a stopped tracee without syscall-stops.
pub fn cont(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::cont(pid, signal).died_if_esrch(pid)
}

/// Execute one instruction of a stopped tracee.
pub fn single_step(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::step(pid, signal).died_if_esrch(pid)
}

#[cfg(target_arch = "x86_64")]
pub fn registers(pid: Pid) -> Result<Registers> {
    ptrace::getregs(pid).died_if_esrch(pid)
}

#[cfg(target_arch = "aarch64")]
pub fn registers(pid: Pid) -> Result<Registers> {
    let mut data = std::mem::MaybeUninit::<Registers>::uninit();
    let mut rv = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: std::mem::size_of::<Registers>(),
    };

    let res = unsafe {
        libc::ptrace(
            aarch64::PTRACE_GETREGSET,
            pid.as_raw(),
            aarch64::NT_PRSTATUS,
            &mut rv as *mut _ as *mut libc::c_void,
        )
    };

    Errno::result(res).died_if_esrch(pid)?;

    Ok(unsafe { data.assume_init() })
}

#[cfg(target_arch = "x86_64")]
pub fn set_registers(pid: Pid, regs: Registers) -> Result<()> {
    ptrace::setregs(pid, regs).died_if_esrch(pid)
}

#[cfg(target_arch = "aarch64")]
pub fn set_registers(pid: Pid, regs: Registers) -> Result<()> {
    let mut rv = libc::iovec {
        iov_base: &regs as *const _ as *const libc::c_void as *mut libc::c_void,
        iov_len: std::mem::size_of::<Registers>(),
    };

    let res = unsafe {
        libc::ptrace(
            aarch64::PTRACE_SETREGSET,
            pid.as_raw(),
            aarch64::NT_PRSTATUS,
            &mut rv as *mut _ as *mut libc::c_void,
        )
    };

    Errno::result(res).died_if_esrch(pid)?;

    Ok(())
}

/// Read the extra data attached to a ptrace-event-stop: the new child's pid
/// for fork/vfork/clone events, the execing thread's former tid for exec.
pub fn event_msg(pid: Pid) -> Result<u64> {
    let msg = ptrace::getevent(pid).died_if_esrch(pid)?;
    Ok(msg as u64)
}

// Check if a wait stop with signal delivery is a group-stop.
//
// From the manual:
//
//     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
//     group-stop.
//
// Only the four stopping signals can cause one, so the request is skipped
// for anything else.
pub fn is_group_stop(pid: Pid, signal: Signal) -> Result<bool> {
    use Signal::*;

    match signal {
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => match ptrace::getsiginfo(pid) {
            Err(Errno::EINVAL) => Ok(true),
            Err(errno) => Err(errno).died_if_esrch(pid),
            Ok(_) => Ok(false),
        },
        _ => Ok(false),
    }
}

fn mem_file(pid: Pid, writable: bool) -> Result<fs::File> {
    let path = format!("/proc/{}/mem", pid.as_raw());

    let res = fs::OpenOptions::new()
        .read(true)
        .write(writable)
        .open(path);

    match res {
        Ok(file) => Ok(file),
        // The proc entry vanishes with the process.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(crate::Error::TraceeDied { pid })
        }
        Err(err) => Err(err.into()),
    }
}

/// Read `data.len()` bytes of tracee memory at `addr`. Returns the number of
/// bytes actually read, which may be short at a mapping boundary.
pub fn read_memory(pid: Pid, addr: u64, data: &mut [u8]) -> Result<usize> {
    use std::os::unix::fs::FileExt;

    let mem = mem_file(pid, false)?;
    let len = mem.read_at(data, addr)?;
    Ok(len)
}

/// Write `data` into tracee memory at `addr`.
pub fn write_memory(pid: Pid, addr: u64, data: &[u8]) -> Result<usize> {
    use std::os::unix::fs::FileExt;

    let mem = mem_file(pid, true)?;
    let len = mem.write_at(data, addr)?;
    Ok(len)
}

/// Longest NUL-terminated string we will pull out of a tracee. Arguments
/// longer than this are truncated, not errors.
const MAX_STRING: usize = 4096;

/// Read a NUL-terminated string from tracee memory.
pub fn read_string(pid: Pid, addr: u64) -> Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    let mut offset = 0u64;

    while buf.len() < MAX_STRING {
        let len = read_memory(pid, addr + offset, &mut chunk)?;
        if len == 0 {
            break;
        }

        if let Some(nul) = chunk[..len].iter().position(|&b| b == 0) {
            buf.extend_from_slice(&chunk[..nul]);
            break;
        }

        buf.extend_from_slice(&chunk[..len]);
        offset += len as u64;
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read a NULL-terminated array of string pointers (e.g. an `argv`) from
/// tracee memory.
pub fn read_string_array(pid: Pid, addr: u64) -> Result<Vec<String>> {
    let mut strings = Vec::new();
    let mut slot = addr;

    loop {
        let mut ptr_buf = [0u8; 8];
        let len = read_memory(pid, slot, &mut ptr_buf)?;
        if len < 8 {
            break;
        }

        let ptr = u64::from_ne_bytes(ptr_buf);
        if ptr == 0 {
            break;
        }

        strings.push(read_string(pid, ptr)?);
        slot += 8;
    }

    Ok(strings)
}

/// Best-effort identity of a live process, from proc: the program image
/// path and command line. Used when an exec is observed without its
/// entry-stop having been seen. Empty on any failure.
pub fn exec_identity(pid: Pid) -> (String, Vec<String>) {
    let raw = pid.as_raw();

    let file = fs::read_link(format!("/proc/{raw}/exe"))
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default();

    let argv = fs::read(format!("/proc/{raw}/cmdline"))
        .map(|bytes| {
            bytes
                .split(|&b| b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect()
        })
        .unwrap_or_default();

    (file, argv)
}

/// Best-effort SIGKILL. `ESRCH` means the target already died, which is the
/// outcome the caller wanted.
pub fn kill(pid: Pid) {
    let _ = signal::kill(pid, Signal::SIGKILL);
}

/// Detach from a stopped tracee, optionally delivering a signal on the way
/// out.
pub fn detach(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::detach(pid, signal).died_if_esrch(pid)
}

/// Block until any tracee changes state. Returns `None` when the kernel
/// reports no children left to wait on.
pub fn wait_any() -> Result<Option<(Pid, WaitStatus)>> {
    loop {
        match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
            // Unreachable without WNOHANG; treat as a spurious wakeup.
            Ok(WaitStatus::StillAlive) => continue,
            Ok(status) => {
                let pid = status.pid().expect("wait status without a pid");
                return Ok(Some((pid, status)));
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(None),
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Block until `pid` changes state.
pub fn wait_pid(pid: Pid) -> Result<WaitStatus> {
    loop {
        match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(status) => return Ok(status),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno).died_if_esrch(pid),
        }
    }
}
