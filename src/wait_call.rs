//! Blocking-call machinery.
//!
//! Some syscalls cannot simply be stepped over: their completion depends on
//! events elsewhere in the fleet. The canonical case is the wait family: a
//! traced parent calls `wait4()` for a child that is itself a tracee, and the
//! child's exit notification goes to *us*, not to the parent, so the parent
//! could sit in the kernel forever while the rest of the fleet is stopped.
//!
//! A [`BlockingCall`] virtualises such a syscall. At the entry-stop the
//! dispatcher builds the call and runs `prepare`, which forces `WNOHANG`
//! into the options register so the kernel call returns immediately. At the
//! exit-stop `finalise` decides the real outcome: pass a genuine kernel
//! completion through, synthesise one from the registry's view of the
//! caller's children, or leave the tracee parked at the exit-stop until a
//! child event cascades back in.

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::process::ExitKind;
use crate::tracer::TraceContext;
use crate::{arch, sys, Signal};

/// A syscall whose completion straddles other tracee events.
///
/// Both operations return `Ok(false)` if the tracee died under them, leaving
/// the reap to the caller. Any other failure is a trace error.
pub(crate) trait BlockingCall: Send + std::fmt::Debug {
    /// The syscall this call virtualises.
    fn syscall(&self) -> i64;

    /// Rewrite or snapshot the entry-state of the call. Runs at the
    /// syscall-entry-stop, before the tracee advances to its exit-stop.
    fn prepare(&mut self, ctx: &mut TraceContext<'_>) -> Result<bool>;

    /// Decide the call's outcome. Runs at the syscall-exit-stop, and again
    /// whenever a relevant child event cascades in while the call is still
    /// in progress.
    fn finalise(&mut self, ctx: &mut TraceContext<'_>) -> Result<bool>;

    /// True once `finalise` has produced the call's result.
    fn done(&self) -> bool;
}

/// Registry view of one child of a waiting caller, in pid order.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChildSnapshot {
    pub pid: i32,
    pub dead: Option<ExitKind>,
    pub job_stop: Option<Signal>,
    pub resumed: bool,
}

/// Which child an individual wait call may observe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WaitTarget {
    /// `wait4(-1, ..)` / `P_ALL`.
    Any,

    /// A specific child pid.
    Child(i32),

    /// A specific process group.
    //
    // The registry does not track process groups; group targets match like
    // `Any`. A group-filtered wait can still only ever observe a real child
    // of the caller.
    Group(i32),

    /// The caller's own process group (`wait4(0, ..)`).
    CallerGroup,
}

impl WaitTarget {
    fn admits(&self, pid: i32) -> bool {
        match self {
            WaitTarget::Child(wanted) => *wanted == pid,
            WaitTarget::Any | WaitTarget::Group(_) | WaitTarget::CallerGroup => true,
        }
    }
}

/// The classes of child event a wait call asked to observe.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReportMask {
    pub exited: bool,
    pub stopped: bool,
    pub continued: bool,
    pub nohang: bool,
    pub nowait: bool,
}

/// What a completed wait call reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReportKind {
    Ended(ExitKind),
    Stopped(Signal),
    Continued,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Report {
    pub pid: i32,
    pub kind: ReportKind,
}

/// Pick the child a wait call observes: first matching candidate in pid
/// order, deaths before job stops before continues within one child.
pub(crate) fn select_candidate(
    target: WaitTarget,
    mask: &ReportMask,
    children: &[ChildSnapshot],
) -> Option<Report> {
    for child in children {
        if !target.admits(child.pid) {
            continue;
        }

        if mask.exited {
            if let Some(exit) = child.dead {
                return Some(Report {
                    pid: child.pid,
                    kind: ReportKind::Ended(exit),
                });
            }
        }

        if mask.stopped {
            if let Some(signal) = child.job_stop {
                return Some(Report {
                    pid: child.pid,
                    kind: ReportKind::Stopped(signal),
                });
            }
        }

        if mask.continued && child.resumed {
            return Some(Report {
                pid: child.pid,
                kind: ReportKind::Continued,
            });
        }
    }

    None
}

/// Encode a report as a `wait4()`-style status word.
///
/// The bit layout of the low word is:
///
///   15                         8   7                     0
///    +-------------------------+---+---------------------+
///    |   exit code / signal    | c |       sig_no        |
///    +-------------------------+---+---------------------+
///
/// `sig_no == 0x7f` flags a job-control stop, `0xffff` a continue.
pub(crate) fn encode_status(kind: &ReportKind) -> i32 {
    match kind {
        ReportKind::Ended(ExitKind::Exited { code }) => (code & 0xff) << 8,
        ReportKind::Ended(ExitKind::Killed {
            signal,
            core_dumped,
        }) => (*signal as i32 & 0x7f) | ((*core_dumped as i32) << 7),
        ReportKind::Stopped(signal) => 0x7f | ((*signal as i32) << 8),
        ReportKind::Continued => 0xffff,
    }
}

/// Size of the userspace `siginfo_t`.
const SIGINFO_BYTES: usize = 128;

// Field offsets in the 64-bit Linux `siginfo_t`: the three header ints, four
// bytes of alignment padding, then the `CLD` union member starting at 16.
const SI_SIGNO: usize = 0;
const SI_CODE: usize = 8;
const SI_PID: usize = 16;
const SI_UID: usize = 20;
const SI_STATUS: usize = 24;

fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Encode a report as the `siginfo_t` a `waitid()` caller receives.
pub(crate) fn encode_child_siginfo(kind: &ReportKind, child: i32) -> [u8; SIGINFO_BYTES] {
    let (code, status) = match kind {
        ReportKind::Ended(ExitKind::Exited { code }) => (libc::CLD_EXITED, *code),
        ReportKind::Ended(ExitKind::Killed {
            signal,
            core_dumped,
        }) => {
            let code = if *core_dumped {
                libc::CLD_DUMPED
            } else {
                libc::CLD_KILLED
            };
            (code, *signal as i32)
        }
        ReportKind::Stopped(signal) => (libc::CLD_STOPPED, *signal as i32),
        ReportKind::Continued => (libc::CLD_CONTINUED, Signal::SIGCONT as i32),
    };

    let mut buf = [0u8; SIGINFO_BYTES];
    put_i32(&mut buf, SI_SIGNO, libc::SIGCHLD);
    put_i32(&mut buf, SI_CODE, code);
    put_i32(&mut buf, SI_PID, child);
    // Traced children run under the tracer's credentials.
    put_i32(&mut buf, SI_UID, unsafe { libc::getuid() } as i32);
    put_i32(&mut buf, SI_STATUS, status);

    buf
}

#[derive(Clone, Copy, Debug)]
enum Flavor {
    Wait4 { status_addr: u64 },
    Waitid { infop_addr: u64 },
}

/// Virtualised `wait4(2)` / `waitid(2)`.
#[derive(Debug)]
pub(crate) struct WaitCall {
    flavor: Flavor,
    target: WaitTarget,

    /// The caller's original options word; `prepare` replaces it in the
    /// registers, the completion paths restore it.
    options: u64,

    done: bool,
}

impl WaitCall {
    /// Snapshot a `wait4(pid, status, options, rusage)` entry.
    pub(crate) fn wait4(args: [u64; 6]) -> Self {
        let which = args[0] as i32;
        let target = match which {
            -1 => WaitTarget::Any,
            0 => WaitTarget::CallerGroup,
            pid if pid > 0 => WaitTarget::Child(pid),
            pgid => WaitTarget::Group(-pgid),
        };

        Self {
            flavor: Flavor::Wait4 {
                status_addr: args[1],
            },
            target,
            options: args[2],
            done: false,
        }
    }

    /// Snapshot a `waitid(idtype, id, infop, options, rusage)` entry.
    pub(crate) fn waitid(args: [u64; 6]) -> Self {
        let target = match args[0] as i32 {
            t if t == libc::P_PID as i32 => WaitTarget::Child(args[1] as i32),
            t if t == libc::P_PGID as i32 => WaitTarget::Group(args[1] as i32),
            // P_ALL, and anything the kernel would reject anyway
            _ => WaitTarget::Any,
        };

        Self {
            flavor: Flavor::Waitid {
                infop_addr: args[2],
            },
            target,
            options: args[3],
            done: false,
        }
    }

    fn options_index(&self) -> usize {
        match self.flavor {
            Flavor::Wait4 { .. } => 2,
            Flavor::Waitid { .. } => 3,
        }
    }

    fn mask(&self) -> ReportMask {
        let opts = self.options as i32;
        match self.flavor {
            // wait4 always reports exits.
            Flavor::Wait4 { .. } => ReportMask {
                exited: true,
                stopped: opts & libc::WUNTRACED != 0,
                continued: opts & libc::WCONTINUED != 0,
                nohang: opts & libc::WNOHANG != 0,
                nowait: false,
            },
            Flavor::Waitid { .. } => ReportMask {
                exited: opts & libc::WEXITED != 0,
                stopped: opts & libc::WSTOPPED != 0,
                continued: opts & libc::WCONTINUED != 0,
                nohang: opts & libc::WNOHANG != 0,
                nowait: opts & libc::WNOWAIT != 0,
            },
        }
    }

    /// The pid the kernel-level call completed for, if it completed.
    fn kernel_completion(&self, ctx: &TraceContext<'_>, ret: i64) -> Result<Option<i32>> {
        match self.flavor {
            Flavor::Wait4 { .. } => Ok((ret > 0).then_some(ret as i32)),
            Flavor::Waitid { infop_addr } => {
                if ret != 0 || infop_addr == 0 {
                    return Ok(None);
                }

                // waitid returns 0 both on a reap and on WNOHANG-nothing;
                // si_pid disambiguates.
                let mut buf = [0u8; 4];
                sys::read_memory(ctx.caller(), infop_addr + SI_PID as u64, &mut buf)?;
                let si_pid = i32::from_ne_bytes(buf);

                Ok((si_pid != 0).then_some(si_pid))
            }
        }
    }

    /// Keep the kernel's own result, restoring the caller's options word.
    fn complete_passthrough(&mut self, ctx: &mut TraceContext<'_>, mut regs: sys::Registers) -> Result<bool> {
        arch::set_arg(&mut regs, self.options_index(), self.options);

        match sys::set_registers(ctx.caller(), regs) {
            Ok(()) => {
                self.done = true;
                Ok(true)
            }
            Err(Error::TraceeDied { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Complete with "no child was ready", discarding whatever the forced
    /// kernel call left in the result register.
    fn complete_nothing(&mut self, ctx: &mut TraceContext<'_>, mut regs: sys::Registers) -> Result<bool> {
        if let Flavor::Waitid { infop_addr } = self.flavor {
            if infop_addr != 0 {
                match sys::write_memory(ctx.caller(), infop_addr, &[0u8; SIGINFO_BYTES]) {
                    Ok(_) => {}
                    Err(Error::TraceeDied { .. }) => return Ok(false),
                    Err(err) => return Err(err),
                }
            }
        }

        arch::set_return_value(&mut regs, 0);
        self.complete_passthrough(ctx, regs)
    }

    fn complete_errno(
        &mut self,
        ctx: &mut TraceContext<'_>,
        mut regs: sys::Registers,
        errno: i32,
    ) -> Result<bool> {
        arch::set_return_value(&mut regs, -errno as i64);
        self.complete_passthrough(ctx, regs)
    }

    /// Write a virtual completion into the caller's registers and memory,
    /// then update the registry's accounting for the observed child.
    fn complete_report(
        &mut self,
        ctx: &mut TraceContext<'_>,
        mut regs: sys::Registers,
        report: Report,
    ) -> Result<bool> {
        let caller = ctx.caller();

        debug!(
            pid = caller.as_raw(),
            child = report.pid,
            kind = ?report.kind,
            "virtual wait completion"
        );

        match self.flavor {
            Flavor::Wait4 { status_addr } => {
                if status_addr != 0 {
                    let word = encode_status(&report.kind);
                    match sys::write_memory(caller, status_addr, &word.to_ne_bytes()) {
                        Ok(_) => {}
                        Err(Error::TraceeDied { .. }) => return Ok(false),
                        Err(err) => return Err(err),
                    }
                }
                arch::set_return_value(&mut regs, report.pid as i64);
            }
            Flavor::Waitid { infop_addr } => {
                if infop_addr != 0 {
                    let info = encode_child_siginfo(&report.kind, report.pid);
                    match sys::write_memory(caller, infop_addr, &info) {
                        Ok(_) => {}
                        Err(Error::TraceeDied { .. }) => return Ok(false),
                        Err(err) => return Err(err),
                    }
                }
                arch::set_return_value(&mut regs, 0);
            }
        }

        let alive = self.complete_passthrough(ctx, regs)?;
        if !alive {
            return Ok(false);
        }

        // Update the model only once the result is durably written. Under
        // WNOWAIT the child stays observable, so nothing is consumed.
        if !self.mask().nowait {
            match report.kind {
                ReportKind::Ended(_) => ctx.report_dead(report.pid),
                ReportKind::Stopped(_) => ctx.consume_job_stop(report.pid),
                ReportKind::Continued => ctx.consume_resumed(report.pid),
            }
        }

        Ok(true)
    }
}

impl BlockingCall for WaitCall {
    fn syscall(&self) -> i64 {
        match self.flavor {
            Flavor::Wait4 { .. } => libc::SYS_wait4,
            Flavor::Waitid { .. } => libc::SYS_waitid,
        }
    }

    fn prepare(&mut self, ctx: &mut TraceContext<'_>) -> Result<bool> {
        let caller = ctx.caller();

        let mut regs = match sys::registers(caller) {
            Ok(regs) => regs,
            Err(Error::TraceeDied { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };

        // Force WNOHANG under the hood so the tracee reaches its exit-stop
        // immediately instead of blocking the whole fleet inside the kernel.
        // The caller's original options still govern the virtual result.
        arch::set_arg(
            &mut regs,
            self.options_index(),
            self.options | libc::WNOHANG as u64,
        );

        trace!(pid = caller.as_raw(), target = ?self.target, "prepared wait call");

        match sys::set_registers(caller, regs) {
            Ok(()) => Ok(true),
            Err(Error::TraceeDied { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn finalise(&mut self, ctx: &mut TraceContext<'_>) -> Result<bool> {
        let caller = ctx.caller();

        let regs = match sys::registers(caller) {
            Ok(regs) => regs,
            Err(Error::TraceeDied { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };

        let ret = arch::return_value(&regs);

        let completion = match self.kernel_completion(ctx, ret) {
            Ok(completion) => completion,
            Err(Error::TraceeDied { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };

        let mut suppressed = false;
        if let Some(child) = completion {
            if ctx.take_virtual_observation(child) {
                // The kernel handed back a zombie whose death we already
                // reported through an earlier virtual completion. Swallow
                // the duplicate and keep looking.
                debug!(
                    pid = caller.as_raw(),
                    child, "suppressing doubly-observed child"
                );
                suppressed = true;
            } else {
                ctx.child_reaped_by_kernel(child);
                return self.complete_passthrough(ctx, regs);
            }
        }

        // No kernel-level completion; consult the registry for a virtual
        // one.
        let children = ctx.children_of_caller();
        if let Some(report) = select_candidate(self.target, &self.mask(), &children) {
            return self.complete_report(ctx, regs, report);
        }

        let target_possible = match self.target {
            WaitTarget::Child(wanted) => children.iter().any(|c| c.pid == wanted),
            _ => !children.is_empty(),
        };

        if self.mask().nohang {
            // "Nothing yet" is a valid answer for this caller.
            return if suppressed {
                self.complete_nothing(ctx, regs)
            } else {
                self.complete_passthrough(ctx, regs)
            };
        }

        if !target_possible {
            return self.complete_errno(ctx, regs, libc::ECHILD);
        }

        // Stay parked at the exit-stop; a child event will cascade back in.
        trace!(pid = caller.as_raw(), "wait call parked");
        Ok(true)
    }

    fn done(&self) -> bool {
        self.done
    }
}
