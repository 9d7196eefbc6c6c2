//! The tracer core: tracee registry, event dispatcher, orphan reconciler,
//! and the thread-safe facade.
//!
//! The kernel reports one mixed stream of wait statuses for the whole fleet:
//! syscall-entry and -exit stops, signal-delivery and group stops, fork,
//! clone, and exec event-stops, and exit notifications. The context needed
//! to interpret a status is spread across earlier stops, so every tracee
//! carries its own small state machine here, and the dispatcher threads each
//! notification through it.
//!
//! From the manual:
//!
//!     Syscall-enter-stop and syscall-exit-stop are indistinguishable from
//!     each other by the tracer.  The tracer needs to keep track of the
//!     sequence of ptrace-stops in order to not misinterpret syscall-enter-
//!     stop as syscall-exit-stop or vice versa.
//!
//! That bookkeeping is the `syscall` field of [`Tracee`]; the other fields
//! exist for the same reason in other corners of the protocol.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::process::{ExitKind, Process};
use crate::wait_call::{BlockingCall, ChildSnapshot, WaitCall};
use crate::{arch, cmd, sys, Pid, Signal};

/// How long a recycled-pid entry may wait for its stale orphan notification
/// before compaction discards it. Far beyond any reaper-to-tracer delay.
const RECYCLED_TTL: Duration = Duration::from_secs(30);

/// How long `step` parks when every remaining tracee is a zombie and only
/// the reaper can move things forward.
const ORPHAN_PARK: Duration = Duration::from_millis(50);

/// The syscalls the dispatcher instruments. Everything else is stepped over
/// transparently.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Syscall {
    Fork,
    Vfork,
    Clone,
    Clone3,
    Execve,
    Execveat,
    Wait4,
    Waitid,
    Exit,
    ExitGroup,
}

impl Syscall {
    pub(crate) fn from_number(nr: i64) -> Option<Self> {
        use Syscall::*;

        match nr {
            #[cfg(target_arch = "x86_64")]
            n if n == libc::SYS_fork => Some(Fork),
            #[cfg(target_arch = "x86_64")]
            n if n == libc::SYS_vfork => Some(Vfork),
            n if n == libc::SYS_clone => Some(Clone),
            n if n == libc::SYS_clone3 => Some(Clone3),
            n if n == libc::SYS_execve => Some(Execve),
            n if n == libc::SYS_execveat => Some(Execveat),
            n if n == libc::SYS_wait4 => Some(Wait4),
            n if n == libc::SYS_waitid => Some(Waitid),
            n if n == libc::SYS_exit => Some(Exit),
            n if n == libc::SYS_exit_group => Some(ExitGroup),
            _ => None,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Syscall::Fork => "fork",
            Syscall::Vfork => "vfork",
            Syscall::Clone => "clone",
            Syscall::Clone3 => "clone3",
            Syscall::Execve => "execve",
            Syscall::Execveat => "execveat",
            Syscall::Wait4 => "wait4",
            Syscall::Waitid => "waitid",
            Syscall::Exit => "exit",
            Syscall::ExitGroup => "exit_group",
        }
    }

    fn is_fork(self) -> bool {
        matches!(
            self,
            Syscall::Fork | Syscall::Vfork | Syscall::Clone | Syscall::Clone3
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Running,
    Stopped,
    Dead,
}

/// Book-keeping record for one live or zombie pid in the fleet.
#[derive(Debug)]
pub(crate) struct Tracee {
    pid: Pid,
    state: State,

    /// Syscall currently between its entry-stop and exit-stop, `None` when
    /// not in one.
    syscall: Option<i64>,

    /// Signal to inject on the next resume.
    pending_signal: Option<Signal>,

    /// The tree node for this process; shared with the tree's edges.
    process: Arc<Process>,

    /// In-flight virtualised syscall, if any. Set only while the tracee is
    /// logically stopped at the call's entry.
    blocking_call: Option<Box<dyn BlockingCall>>,

    /// False until the attach-artifact SIGSTOP of an auto-attached child
    /// has been consumed.
    attached: bool,

    /// The tracee that forked this one, while that tracee is alive. Used to
    /// match wait-family candidates; cleared when the parent dies and the
    /// kernel reparents this process away from the fleet.
    parent: Option<Pid>,

    /// File and argv captured at an execve entry-stop, consumed at the exec
    /// event-stop.
    pending_exec: Option<(String, Vec<String>)>,

    /// Job-control stop a `WUNTRACED`-style wait may observe.
    job_stop: Option<Signal>,

    /// SIGCONT marker a `WCONTINUED` wait may observe.
    resumed: bool,

    /// How the tracee ended, once it has. Virtual wait completions report
    /// this to the parent.
    exit: Option<ExitKind>,

    /// Children whose deaths this tracee has observed through a virtual
    /// wait completion. If the kernel later hands back the real zombie, the
    /// duplicate is suppressed.
    reported: BTreeSet<i32>,
}

impl Tracee {
    fn new(pid: Pid, process: Arc<Process>, parent: Option<Pid>) -> Self {
        Self {
            pid,
            // The kernel stops a new tracee before its first resume.
            state: State::Stopped,
            syscall: None,
            pending_signal: None,
            process,
            blocking_call: None,
            attached: false,
            parent,
            pending_exec: None,
            job_stop: None,
            resumed: false,
            exit: None,
            reported: BTreeSet::new(),
        }
    }
}

/// A top-level traced process, launched directly by [`Tracer::start`].
#[derive(Clone, Copy, Debug)]
struct Leader {
    /// Has the initial exec succeeded yet? Until it does, failures are the
    /// launcher's, not the target program's.
    execed: bool,
}

#[derive(Debug)]
struct Recycled {
    pid: i32,
    seen: Instant,
}

/// Registry state guarded by the facade lock.
#[derive(Debug, Default)]
pub(crate) struct Inner {
    /// Every live or not-yet-reaped pid in the fleet, keyed by raw pid.
    tracees: BTreeMap<i32, Tracee>,

    /// Top-level tracees.
    leaders: BTreeMap<i32, Leader>,

    /// Wait statuses of pids whose first notification arrived before their
    /// parent's fork event. Re-delivered when the fork event lands.
    pending_children: HashMap<i32, WaitStatus>,

    /// Pids the kernel has re-issued while a stale orphan notification for
    /// the previous incarnation may still be in flight.
    recycled: Vec<Recycled>,
}

impl Inner {
    fn add_tracee(&mut self, pid: Pid, process: Arc<Process>, parent: Option<Pid>) -> Result<()> {
        let raw = pid.as_raw();

        if self.tracees.contains_key(&raw) {
            bad_trace!(pid, "tracee already present");
        }

        info!(pid = raw, "new tracee");
        self.tracees.insert(raw, Tracee::new(pid, process, parent));

        Ok(())
    }

    fn remove_tracee(&mut self, pid: Pid) -> Option<Tracee> {
        let removed = self.tracees.remove(&pid.as_raw());

        if removed.is_some() {
            info!(pid = pid.as_raw(), "removing tracee");
        }

        removed
    }

    fn any_running(&self) -> bool {
        self.tracees.values().any(|t| t.state == State::Running)
    }

    fn all_dead(&self) -> bool {
        self.tracees.values().all(|t| t.state == State::Dead)
    }

    /// True while some tracee still owes us a stop: either it is running,
    /// or it was just created and its attach-stop has not arrived yet.
    fn fleet_in_motion(&self) -> bool {
        self.any_running()
            || self
                .tracees
                .values()
                .any(|t| t.state == State::Stopped && !t.attached)
    }
}

/// Narrow capability handed to blocking calls.
///
/// Blocking calls need to consult and update the registry mid-flight, but
/// they must not re-enter the facade (the lock is already held). This is
/// the slice of the tracer they get instead.
pub(crate) struct TraceContext<'a> {
    inner: &'a mut Inner,
    caller: Pid,
}

impl TraceContext<'_> {
    pub(crate) fn caller(&self) -> Pid {
        self.caller
    }

    /// Registry snapshots of the caller's children, in ascending pid order.
    pub(crate) fn children_of_caller(&self) -> Vec<ChildSnapshot> {
        self.inner
            .tracees
            .values()
            .filter(|t| t.parent == Some(self.caller))
            .map(|t| ChildSnapshot {
                pid: t.pid.as_raw(),
                dead: if t.state == State::Dead { t.exit } else { None },
                job_stop: t.job_stop,
                resumed: t.resumed,
            })
            .collect()
    }

    /// A virtual completion observed `child`'s death: drop the zombie
    /// record and remember the observation so a later kernel-level reap of
    /// the real zombie is not reported twice.
    pub(crate) fn report_dead(&mut self, child: i32) {
        self.inner.remove_tracee(Pid::from_raw(child));

        if let Some(caller) = self.inner.tracees.get_mut(&self.caller.as_raw()) {
            caller.reported.insert(child);
        }
    }

    /// The kernel-level call genuinely completed for `child`; sync the
    /// registry with whatever the kernel consumed.
    pub(crate) fn child_reaped_by_kernel(&mut self, child: i32) {
        match self.inner.tracees.get_mut(&child) {
            Some(tracee) if tracee.state == State::Dead => {
                self.inner.remove_tracee(Pid::from_raw(child));
            }
            Some(tracee) => {
                // A stop or continue observation.
                tracee.job_stop = None;
                tracee.resumed = false;
            }
            None => {
                // An untraced child of the caller; not ours to track.
            }
        }
    }

    /// Check-and-clear the duplicate-observation mark for `child`.
    pub(crate) fn take_virtual_observation(&mut self, child: i32) -> bool {
        self.inner
            .tracees
            .get_mut(&self.caller.as_raw())
            .map_or(false, |t| t.reported.remove(&child))
    }

    pub(crate) fn consume_job_stop(&mut self, child: i32) {
        if let Some(tracee) = self.inner.tracees.get_mut(&child) {
            tracee.job_stop = None;
        }
    }

    pub(crate) fn consume_resumed(&mut self, child: i32) {
        if let Some(tracee) = self.inner.tracees.get_mut(&child) {
            tracee.resumed = false;
        }
    }
}

/// Orphan queue, shared with the reaper and signal threads.
#[derive(Debug, Default)]
struct Shared {
    orphans: VecDeque<i32>,
}

/// Supervisor for a fleet of traced process trees.
///
/// All public operations are thread-safe. `start` and `step` belong to the
/// main thread; [`notify_orphan`](Tracer::notify_orphan) and
/// [`nuke`](Tracer::nuke) may be called from reaper or signal threads and
/// never block for longer than a registry snapshot.
#[derive(Debug, Default)]
pub struct Tracer {
    /// Registry, leaders, and recycled-pid log. Held across dispatch, never
    /// across the blocking wait.
    inner: Mutex<Inner>,

    /// Orphan queue. May be locked while `inner` is held, never the
    /// reverse.
    shared: Mutex<Shared>,

    /// Wakes a `step` that is parked waiting for orphan notifications.
    wake: Condvar,

    killed: AtomicBool,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("tracer state lock poisoned")
    }

    /// Launch a new leader process and return its tree node.
    ///
    /// The child marks itself traceable and raises `SIGSTOP` before its
    /// exec; by the time this returns, it is registered, stopped, and has
    /// the attach options set. Its initial exec has *not* happened yet.
    pub fn start(&self, path: &str, argv: Vec<String>) -> Result<Arc<Process>> {
        let command = cmd::Command::new(path, argv)?;

        let mut inner = self.lock();

        let pid = command.fork_exec()?;
        info!(pid = pid.as_raw(), %path, "launched leader");

        match sys::wait_pid(pid)? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                return Err(Error::Runtime(format!(
                    "process {pid} died during launch: {status:?}"
                )));
            }
            status => {
                return Err(Error::Runtime(format!(
                    "unexpected launch stop for {pid}: {status:?}"
                )));
            }
        }

        sys::init_options(pid).map_err(|err| match err {
            Error::TraceeDied { .. } => {
                Error::Runtime(format!("process {pid} died during attach"))
            }
            other => other,
        })?;

        let process = Process::new_root(pid);

        inner.add_tracee(pid, Arc::clone(&process), None)?;
        if let Some(tracee) = inner.tracees.get_mut(&pid.as_raw()) {
            // Its launch-time SIGSTOP was consumed above.
            tracee.attached = true;
        }

        inner.leaders.insert(pid.as_raw(), Leader { execed: false });

        Ok(process)
    }

    /// Advance the fleet until every live tracee is stopped, or all are
    /// dead. Returns `true` iff any tracee remains.
    ///
    /// Blocks inside the kernel wait; interruptible by
    /// [`nuke`](Tracer::nuke) from another thread.
    pub fn step(&self) -> Result<bool> {
        loop {
            let mut inner = self.lock();

            self.collect_orphans(&mut inner)?;

            if self.killed.load(Ordering::Acquire) {
                return self.drain_after_nuke(&mut inner);
            }

            if inner.tracees.is_empty() {
                return Ok(false);
            }

            if !inner.all_dead() {
                return self.advance(inner);
            }

            // Every remaining tracee is a zombie; only the reaper (or a
            // nuke) can move things forward. Park instead of spinning.
            drop(inner);

            let shared = self.shared.lock().expect("orphan queue lock poisoned");
            if shared.orphans.is_empty() && !self.killed.load(Ordering::Acquire) {
                let _ = self
                    .wake
                    .wait_timeout(shared, ORPHAN_PARK)
                    .expect("orphan queue lock poisoned");
            }
        }
    }

    /// Tell the tracer an orphan was reaped by the external reaper.
    ///
    /// Safe to call from any thread; never blocks on the facade lock.
    pub fn notify_orphan(&self, pid: Pid) {
        {
            let mut shared = self.shared.lock().expect("orphan queue lock poisoned");
            shared.orphans.push_back(pid.as_raw());
        }

        self.wake.notify_all();
    }

    /// Force-kill every tracee, best-effort, and arrange for the next
    /// [`step`](Tracer::step) to drain the corpses and return `false`.
    ///
    /// Safe to call from any thread.
    pub fn nuke(&self) {
        info!("nuking the fleet");

        self.killed.store(true, Ordering::SeqCst);

        // Registry snapshot only; draining happens on the next step().
        let pids: Vec<Pid> = {
            let inner = self.lock();
            inner
                .tracees
                .values()
                .filter(|t| t.state != State::Dead)
                .map(|t| t.pid)
                .collect()
        };

        for pid in pids {
            sys::kill(pid);
        }

        self.wake.notify_all();
    }

    /// Write a snapshot of the tracees and leaders to `out`.
    pub fn write_list(&self, out: &mut dyn Write) -> io::Result<()> {
        let inner = self.lock();

        for (raw, tracee) in &inner.tracees {
            let role = match inner.leaders.get(raw) {
                Some(Leader { execed: true }) => " [leader]",
                Some(Leader { execed: false }) => " [leader, pre-exec]",
                None => "",
            };

            let state = match tracee.state {
                State::Running => "running",
                State::Stopped => "stopped",
                State::Dead => "dead",
            };

            let syscall = match tracee.syscall {
                Some(nr) => match Syscall::from_number(nr) {
                    Some(syscall) => format!(" in {}", syscall.name()),
                    None => format!(" in syscall {nr}"),
                },
                None => String::new(),
            };

            let argv = tracee.process.command_line();
            let name = if argv.is_empty() {
                "<pre-exec>".to_owned()
            } else {
                argv.join(" ")
            };

            writeln!(out, "{raw:>8}  {state}{syscall}  {name}{role}")?;
        }

        Ok(())
    }

    /// Print the tracee list to stderr.
    pub fn print_list(&self) -> Result<()> {
        Ok(self.write_list(&mut io::stderr())?)
    }

    /// Number of pids currently in the registry.
    pub fn tracee_count(&self) -> usize {
        self.lock().tracees.len()
    }

    // Resume every quiescent tracee, then consume notifications until the
    // fleet is stopped again (or gone).
    fn advance<'a>(&'a self, mut inner: MutexGuard<'a, Inner>) -> Result<bool> {
        let stopped: Vec<i32> = inner
            .tracees
            .iter()
            .filter(|(_, t)| {
                // Parked blocking calls stay where they are: their syscall
                // has not logically completed.
                t.state == State::Stopped && t.attached && t.blocking_call.is_none()
            })
            .map(|(raw, _)| *raw)
            .collect();

        for raw in stopped {
            let tracee = inner.tracees.get_mut(&raw).expect("resume set is stale");
            Self::resume_tracee(tracee)?;
        }

        while inner.fleet_in_motion() {
            // The wait must not hold the facade lock, or notify_orphan and
            // nuke could not run while we block.
            drop(inner);
            let notification = sys::wait_any();
            inner = self.lock();

            // Dispatch before honouring a nuke: the status just consumed
            // may be a death the accounting must not lose.
            match notification? {
                Some((pid, status)) => self.dispatch(&mut inner, pid, status)?,
                None => break,
            }

            if self.killed.load(Ordering::Acquire) {
                return self.drain_after_nuke(&mut inner);
            }
        }

        Ok(!inner.tracees.is_empty())
    }

    fn resume_tracee(tracee: &mut Tracee) -> Result<()> {
        let signal = tracee.pending_signal.take();
        // Resuming releases a job-control stop.
        tracee.job_stop = None;

        match sys::resume(tracee.pid, signal) {
            Ok(()) => {
                tracee.state = State::Running;
                Ok(())
            }
            Err(Error::TraceeDied { .. }) => {
                // The wait status is on its way; keep the fleet moving so
                // it gets consumed.
                tracee.state = State::Running;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn resume_one(&self, inner: &mut Inner, pid: Pid) -> Result<()> {
        match inner.tracees.get_mut(&pid.as_raw()) {
            Some(tracee) => Self::resume_tracee(tracee),
            None => Ok(()),
        }
    }

    /// Classify one wait notification and route it.
    fn dispatch(&self, inner: &mut Inner, pid: Pid, status: WaitStatus) -> Result<()> {
        let raw = pid.as_raw();

        trace!(pid = raw, ?status, "wait notification");

        let state = match inner.tracees.get(&raw) {
            Some(tracee) => tracee.state,
            None => {
                // First sign of a child whose parent has not reported its
                // fork event yet. The kernel guarantees the event will
                // arrive; stash the notification and re-deliver it then.
                debug!(pid = raw, ?status, "stashing notification for unknown pid");
                inner.pending_children.insert(raw, status);
                return Ok(());
            }
        };

        if state == State::Dead {
            inner.remove_tracee(pid);
            bad_trace!(pid, "event {status:?} for a dead tracee");
        }

        match status {
            WaitStatus::Exited(_, code) => {
                self.handle_ended(inner, pid, ExitKind::Exited { code })
            }
            WaitStatus::Signaled(_, signal, core_dumped) => self.handle_ended(
                inner,
                pid,
                ExitKind::Killed {
                    signal,
                    core_dumped,
                },
            ),
            WaitStatus::PtraceEvent(_, _, event)
                if event == libc::PTRACE_EVENT_FORK
                    || event == libc::PTRACE_EVENT_VFORK
                    || event == libc::PTRACE_EVENT_CLONE =>
            {
                self.handle_fork(inner, pid)
            }
            WaitStatus::PtraceEvent(_, _, event) if event == libc::PTRACE_EVENT_EXEC => {
                self.handle_exec(inner, pid)
            }
            WaitStatus::PtraceEvent(_, _, event) => {
                inner.remove_tracee(pid);
                bad_trace!(pid, "unrequested ptrace event {event}");
            }
            WaitStatus::PtraceSyscall(_) => match inner.tracees[&raw].syscall {
                None => self.handle_syscall_entry(inner, pid),
                Some(nr) => self.handle_syscall_exit(inner, pid, nr),
            },
            WaitStatus::Stopped(_, signal) => self.handle_signal_stop(inner, pid, signal),
            status => {
                inner.remove_tracee(pid);
                bad_trace!(pid, "unreachable wait status {status:?}");
            }
        }
    }

    fn handle_signal_stop(&self, inner: &mut Inner, pid: Pid, signal: Signal) -> Result<()> {
        let raw = pid.as_raw();

        {
            let tracee = inner
                .tracees
                .get_mut(&raw)
                .expect("dispatched for unknown pid");
            tracee.state = State::Stopped;

            if !tracee.attached {
                tracee.attached = true;

                if signal == Signal::SIGSTOP {
                    // Attach artifact of an auto-attached child, not a real
                    // delivery. Swallow it.
                    debug!(pid = raw, "attach-stop");
                    return Ok(());
                }

                // Out-of-order first stop; treat it as a normal delivery.
            }
        }

        let group = match sys::is_group_stop(pid, signal) {
            Ok(group) => group,
            Err(Error::TraceeDied { .. }) => {
                inner.tracees.get_mut(&raw).expect("tracee vanished").state = State::Running;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let waiting_parent = {
            let tracee = inner.tracees.get_mut(&raw).expect("tracee vanished");

            if group {
                debug!(pid = raw, ?signal, "group-stop");
                tracee.job_stop = Some(signal);
                tracee.resumed = false;
                // A stopped child is observable by a WUNTRACED wait
                // upstream.
                tracee.parent
            } else {
                debug!(pid = raw, ?signal, "signal-delivery-stop");
                tracee.pending_signal = Some(signal);
                tracee.process.on_signal(signal);

                if signal == Signal::SIGCONT {
                    tracee.job_stop = None;
                    tracee.resumed = true;
                    // A continued child is observable by a WCONTINUED wait
                    // upstream, same as a stop.
                    tracee.parent
                } else {
                    None
                }
            }
        };

        if let Some(parent) = waiting_parent {
            self.cascade_wait(inner, parent)?;
        }

        Ok(())
    }

    fn handle_syscall_entry(&self, inner: &mut Inner, pid: Pid) -> Result<()> {
        let raw = pid.as_raw();

        let regs = match sys::registers(pid) {
            Ok(regs) => regs,
            Err(Error::TraceeDied { .. }) => {
                inner.tracees.get_mut(&raw).expect("tracee vanished").state = State::Running;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let nr = arch::syscall_number(&regs);
        let args = arch::args(&regs);

        {
            let tracee = inner.tracees.get_mut(&raw).expect("tracee vanished");
            tracee.state = State::Stopped;
            tracee.syscall = Some(nr);
        }

        trace!(pid = raw, syscall = nr, "syscall-entry-stop");

        match Syscall::from_number(nr) {
            Some(Syscall::Execve) => self.stash_exec(inner, pid, args[0], args[1]),
            Some(Syscall::Execveat) => self.stash_exec(inner, pid, args[1], args[2]),
            Some(Syscall::Wait4) => {
                self.initiate_wait(inner, pid, Box::new(WaitCall::wait4(args)))
            }
            Some(Syscall::Waitid) => {
                self.initiate_wait(inner, pid, Box::new(WaitCall::waitid(args)))
            }
            // Fork-family entries run on to their event-stop, exit-family
            // entries run on into the exit notification, and uninstrumented
            // syscalls are none of our business.
            _ => self.resume_one(inner, pid),
        }
    }

    /// Snapshot the file and argv of an exec at its entry-stop, while the
    /// old image's memory is still the one the pointers refer to.
    fn stash_exec(
        &self,
        inner: &mut Inner,
        pid: Pid,
        path_addr: u64,
        argv_addr: u64,
    ) -> Result<()> {
        let snapshot = sys::read_string(pid, path_addr)
            .and_then(|file| sys::read_string_array(pid, argv_addr).map(|argv| (file, argv)));

        match snapshot {
            Ok(snapshot) => {
                inner
                    .tracees
                    .get_mut(&pid.as_raw())
                    .expect("tracee vanished")
                    .pending_exec = Some(snapshot);
                self.resume_one(inner, pid)
            }
            Err(Error::TraceeDied { .. }) => {
                inner
                    .tracees
                    .get_mut(&pid.as_raw())
                    .expect("tracee vanished")
                    .state = State::Running;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn initiate_wait(
        &self,
        inner: &mut Inner,
        pid: Pid,
        mut call: Box<dyn BlockingCall>,
    ) -> Result<()> {
        debug!(
            pid = pid.as_raw(),
            syscall = call.syscall(),
            "initiating blocking call"
        );

        let alive = {
            let mut ctx = TraceContext { inner, caller: pid };
            call.prepare(&mut ctx)?
        };

        if !alive {
            inner
                .tracees
                .get_mut(&pid.as_raw())
                .expect("tracee vanished")
                .state = State::Running;
            return Ok(());
        }

        inner
            .tracees
            .get_mut(&pid.as_raw())
            .expect("tracee vanished")
            .blocking_call = Some(call);

        // On to the exit-stop, which arrives immediately thanks to the
        // forced WNOHANG.
        self.resume_one(inner, pid)
    }

    fn handle_syscall_exit(&self, inner: &mut Inner, pid: Pid, nr: i64) -> Result<()> {
        let raw = pid.as_raw();

        trace!(pid = raw, syscall = nr, "syscall-exit-stop");

        let has_call = {
            let tracee = inner.tracees.get_mut(&raw).expect("tracee vanished");
            tracee.state = State::Stopped;
            tracee.blocking_call.is_some()
        };

        if has_call {
            return self.finalise_wait(inner, pid);
        }

        match Syscall::from_number(nr) {
            Some(syscall) if syscall.is_fork() => self.handle_fork_return(inner, pid),
            Some(Syscall::Execve) | Some(Syscall::Execveat) => {
                self.handle_exec_return(inner, pid)
            }
            Some(Syscall::Exit) | Some(Syscall::ExitGroup) => {
                // exit syscalls do not return
                inner.remove_tracee(pid);
                bad_trace!(pid, "return from an exit syscall");
            }
            Some(Syscall::Wait4) | Some(Syscall::Waitid) => {
                inner.remove_tracee(pid);
                bad_trace!(pid, "wait exit-stop without a blocking call");
            }
            _ => {
                // Uninstrumented syscall completed; move along.
                inner.tracees.get_mut(&raw).expect("tracee vanished").syscall = None;
                self.resume_one(inner, pid)
            }
        }
    }

    fn handle_fork_return(&self, inner: &mut Inner, pid: Pid) -> Result<()> {
        let raw = pid.as_raw();

        let regs = match sys::registers(pid) {
            Ok(regs) => regs,
            Err(Error::TraceeDied { .. }) => {
                inner.tracees.get_mut(&raw).expect("tracee vanished").state = State::Running;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let ret = arch::return_value(&regs);

        inner.tracees.get_mut(&raw).expect("tracee vanished").syscall = None;

        if ret < 0 {
            return self.handle_failed_fork(inner, pid, ret);
        }

        // The event-stop was authoritative for creating the child record;
        // nothing further for the parent here. Quiescence point.
        Ok(())
    }

    fn handle_failed_fork(&self, inner: &mut Inner, pid: Pid, err: i64) -> Result<()> {
        // The event-stop never fires for a failed fork, so no child record
        // exists to discard.
        debug!(pid = pid.as_raw(), errno = -err, "fork failed");
        self.resume_one(inner, pid)
    }

    fn handle_exec_return(&self, inner: &mut Inner, pid: Pid) -> Result<()> {
        let raw = pid.as_raw();

        let regs = match sys::registers(pid) {
            Ok(regs) => regs,
            Err(Error::TraceeDied { .. }) => {
                inner.tracees.get_mut(&raw).expect("tracee vanished").state = State::Running;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let ret = arch::return_value(&regs);

        let failed = {
            let tracee = inner.tracees.get_mut(&raw).expect("tracee vanished");
            tracee.syscall = None;

            if ret == 0 {
                // Landed in the new image; report the entry point.
                let file = tracee.process.file();
                tracee
                    .process
                    .on_new_location(arch::instruction_pointer(&regs), file, None);
                false
            } else {
                // The exec failed and the old image continues.
                tracee.pending_exec = None;
                true
            }
        };

        if failed {
            self.resume_one(inner, pid)
        } else {
            // Quiescence point.
            Ok(())
        }
    }

    /// Fork/vfork/clone event-stop: authoritative creation of the child
    /// record.
    fn handle_fork(&self, inner: &mut Inner, pid: Pid) -> Result<()> {
        let raw = pid.as_raw();

        let child_raw = match sys::event_msg(pid) {
            Ok(msg) => msg as i32,
            Err(Error::TraceeDied { .. }) => {
                // The parent died at the event-stop; its child, if it ever
                // runs, is lost to us.
                warn!(pid = raw, "parent died at fork event");
                inner.tracees.get_mut(&raw).expect("tracee vanished").state = State::Running;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let child = Pid::from_raw(child_raw);

        debug!(pid = raw, child = child_raw, "fork event");

        // The kernel cannot re-issue a pid that still has a live holder. A
        // DEAD record here means the old zombie was reaped externally and
        // its orphan notification is still in flight somewhere.
        if let Some(previous) = inner.tracees.get(&child_raw) {
            if previous.state == State::Dead {
                info!(pid = child_raw, "pid recycled under a stale zombie record");
                inner.remove_tracee(child);
                inner.recycled.push(Recycled {
                    pid: child_raw,
                    seen: Instant::now(),
                });
            } else {
                inner.remove_tracee(child);
                bad_trace!(child, "fork produced a pid that is still live");
            }
        }

        let child_process = {
            let parent = inner.tracees.get(&raw).expect("tracee vanished");
            Arc::clone(&parent.process).on_fork(child)
        };

        inner.add_tracee(child, child_process, Some(pid))?;

        // The child may have stopped, or even died, before this event
        // arrived.
        if let Some(status) = inner.pending_children.remove(&child_raw) {
            debug!(pid = child_raw, "re-delivering stashed notification");
            self.dispatch(inner, child, status)?;
        }

        // The parent still has its syscall-exit-stop to deliver.
        self.resume_one(inner, pid)
    }

    /// Exec event-stop: the tracee is now in the new image.
    fn handle_exec(&self, inner: &mut Inner, pid: Pid) -> Result<()> {
        let raw = pid.as_raw();

        let old_raw = match sys::event_msg(pid) {
            Ok(msg) => msg as i32,
            Err(Error::TraceeDied { .. }) => {
                inner.tracees.get_mut(&raw).expect("tracee vanished").state = State::Running;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // An exec from a non-leader thread assumes the thread-group
        // leader's tid; the execing thread's old record is invalid now.
        let mut moved_stash = None;
        if old_raw != raw {
            if let Some(mut old) = inner.remove_tracee(Pid::from_raw(old_raw)) {
                info!(old = old_raw, new = raw, "exec moved tids");
                moved_stash = old.pending_exec.take();
            }
        }

        {
            let tracee = inner.tracees.get_mut(&raw).expect("tracee vanished");
            tracee.state = State::Stopped;
            // The execve exit-stop still follows, on this pid.
            tracee.syscall = Some(libc::SYS_execve);

            let (file, argv) = match moved_stash.or_else(|| tracee.pending_exec.take()) {
                Some(snapshot) => snapshot,
                // Exec without an observed entry (it predates our syscall
                // tracing); the new image is live, so proc has the answer.
                None => sys::exec_identity(pid),
            };

            tracee.process.on_exec(file, argv);
        }

        if let Some(leader) = inner.leaders.get_mut(&raw) {
            if !leader.execed {
                debug!(pid = raw, "leader completed its initial exec");
                leader.execed = true;
            }
        }

        // On to the execve exit-stop.
        self.resume_one(inner, pid)
    }

    /// Exit or killed-by-signal notification.
    fn handle_ended(&self, inner: &mut Inner, pid: Pid, exit: ExitKind) -> Result<()> {
        let raw = pid.as_raw();

        info!(pid = raw, ?exit, "tracee ended");

        let leader = inner.leaders.remove(&raw);

        let (parent, process) = {
            let tracee = inner
                .tracees
                .get_mut(&raw)
                .expect("dispatched for unknown pid");
            tracee.state = State::Dead;
            tracee.syscall = None;
            tracee.pending_signal = None;
            tracee.blocking_call = None;
            tracee.job_stop = None;
            tracee.attached = true;
            tracee.exit = Some(exit);
            (tracee.parent, Arc::clone(&tracee.process))
        };

        // The tree hears about the death immediately; the registry entry
        // lingers until a wait or the reaper observes it.
        match exit {
            ExitKind::Exited { code } => process.on_exit(code),
            ExitKind::Killed {
                signal,
                core_dumped,
            } => process.on_killed(signal, core_dumped),
        }

        // The kernel reparents this tracee's children away from the fleet;
        // no tracee can wait on them any more.
        for other in inner.tracees.values_mut() {
            if other.parent == Some(pid) {
                other.parent = None;
            }
        }

        if leader.is_some() {
            // Leaders are our own children: the notification we just
            // consumed reaped the zombie, and no wait or orphan
            // notification will ever account for it.
            inner.remove_tracee(pid);
        }

        if let Some(parent) = parent {
            self.cascade_wait(inner, parent)?;
        }

        if let Some(Leader { execed: false }) = leader {
            // The launch never reached its program; surface it to whoever
            // is driving the fleet.
            return Err(Error::Runtime(format!(
                "process {pid} died before its initial exec"
            )));
        }

        Ok(())
    }

    /// Re-finalise the blocking call of a tracee parked at its exit-stop,
    /// after a child event that may complete it.
    fn cascade_wait(&self, inner: &mut Inner, pid: Pid) -> Result<()> {
        let parked = inner.tracees.get(&pid.as_raw()).map_or(false, |t| {
            t.state == State::Stopped && t.blocking_call.is_some()
        });

        if parked {
            self.finalise_wait(inner, pid)
        } else {
            Ok(())
        }
    }

    fn finalise_wait(&self, inner: &mut Inner, pid: Pid) -> Result<()> {
        let raw = pid.as_raw();

        let mut call = match inner
            .tracees
            .get_mut(&raw)
            .and_then(|t| t.blocking_call.take())
        {
            Some(call) => call,
            None => return Ok(()),
        };

        let alive = {
            let mut ctx = TraceContext { inner, caller: pid };
            call.finalise(&mut ctx)?
        };

        let tracee = match inner.tracees.get_mut(&raw) {
            Some(tracee) => tracee,
            None => return Ok(()),
        };

        if !alive {
            // Died mid-finalise; the reap arrives through the wait stream.
            tracee.state = State::Running;
            return Ok(());
        }

        if call.done() {
            trace!(pid = raw, "blocking call complete");
            tracee.syscall = None;
            tracee.state = State::Stopped;
        } else {
            // Still parked at the exit-stop, logically stopped at the
            // entry, until a child event cascades back in.
            tracee.blocking_call = Some(call);
            tracee.state = State::Stopped;
        }

        Ok(())
    }

    /// Drain the orphan queue. Runs at the top of every step.
    fn collect_orphans(&self, inner: &mut Inner) -> Result<()> {
        let drained: Vec<i32> = {
            let mut shared = self.shared.lock().expect("orphan queue lock poisoned");
            shared.orphans.drain(..).collect()
        };

        for raw in drained {
            let pid = Pid::from_raw(raw);

            if let Some(found) = inner.recycled.iter().position(|r| r.pid == raw) {
                // The reaper is reporting the pid's previous incarnation.
                debug!(pid = raw, "dropping orphan notification for recycled pid");
                inner.recycled.remove(found);
                continue;
            }

            match inner.tracees.get(&raw).map(|t| (t.state, t.parent)) {
                Some((State::Dead, parent)) => {
                    debug!(pid = raw, "orphan reaped");
                    inner.remove_tracee(pid);

                    if let Some(parent) = parent {
                        self.cascade_wait(inner, parent)?;
                    }
                }
                Some(_) => {
                    // The reaper cannot reap a live tracee; something
                    // outside the fleet is interfering.
                    inner.remove_tracee(pid);
                    bad_trace!(pid, "reaper reaped a live tracee");
                }
                None => {
                    // Already cleaned up through another observation of the
                    // same death, or a pid we never saw alive.
                    debug!(pid = raw, "orphan notification for unknown pid");
                }
            }
        }

        inner.recycled.retain(|r| r.seen.elapsed() < RECYCLED_TTL);

        Ok(())
    }

    /// Post-nuke cleanup: reap everything, complete the accounting, and
    /// leave the registry empty.
    fn drain_after_nuke(&self, inner: &mut Inner) -> Result<bool> {
        debug!("draining the fleet after nuke");

        let pids: Vec<i32> = inner.tracees.keys().copied().collect();

        for raw in pids {
            let pid = Pid::from_raw(raw);

            let (dead, process) = {
                let tracee = inner.tracees.get(&raw).expect("drain set is stale");
                (tracee.state == State::Dead, Arc::clone(&tracee.process))
            };

            if !dead {
                sys::kill(pid);
                // If the tracee is sitting in a ptrace-stop, let the kill
                // land before blocking on its status.
                let _ = sys::cont(pid, None);

                // Consume stops until the kill lands.
                loop {
                    match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
                        Ok(WaitStatus::Exited(_, code)) => {
                            process.on_exit(code);
                            break;
                        }
                        Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
                            process.on_killed(signal, core_dumped);
                            break;
                        }
                        Ok(_) => {
                            // Still stopping on the way down; shove it
                            // forward.
                            let _ = sys::cont(pid, None);
                        }
                        Err(Errno::EINTR) => continue,
                        Err(_) => break, // already gone
                    }
                }
            }

            inner.remove_tracee(pid);
        }

        inner.leaders.clear();
        inner.pending_children.clear();
        inner.recycled.clear();

        {
            let mut shared = self.shared.lock().expect("orphan queue lock poisoned");
            shared.orphans.clear();
        }

        Ok(false)
    }
}

impl Drop for Tracer {
    /// The fleet is owned by the tracer for its entire lifetime.
    fn drop(&mut self) {
        if !self.killed.load(Ordering::Acquire) && self.tracee_count() > 0 {
            self.nuke();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Registry-level tests use synthetic pids well outside normal pid
    // ranges; none of these paths issue ptrace or kill requests against
    // live processes.

    fn fake_tracee(tracer: &Tracer, raw: i32, parent: Option<i32>) -> Arc<Process> {
        let pid = Pid::from_raw(raw);
        let process = Process::new_root(pid);

        let mut inner = tracer.lock();
        inner
            .add_tracee(pid, Arc::clone(&process), parent.map(Pid::from_raw))
            .unwrap();
        inner.tracees.get_mut(&raw).unwrap().attached = true;

        process
    }

    fn kill_off(tracer: &Tracer, raw: i32, code: i32) {
        let pid = Pid::from_raw(raw);
        let mut inner = tracer.lock();
        tracer
            .dispatch(&mut inner, pid, WaitStatus::Exited(pid, code))
            .unwrap();
    }

    #[test]
    fn death_dispatch_updates_record_and_tree() {
        let tracer = Tracer::new();
        let process = fake_tracee(&tracer, 900_001, None);

        kill_off(&tracer, 900_001, 7);

        assert_eq!(process.exit(), Some(ExitKind::Exited { code: 7 }));

        // A non-leader zombie lingers until a wait or the reaper observes
        // it.
        let inner = tracer.lock();
        assert_eq!(inner.tracees[&900_001].state, State::Dead);
        assert!(inner.tracees[&900_001].syscall.is_none());
    }

    #[test]
    fn event_on_dead_tracee_is_a_bad_trace() {
        let tracer = Tracer::new();
        fake_tracee(&tracer, 900_002, None);
        kill_off(&tracer, 900_002, 0);

        let pid = Pid::from_raw(900_002);
        let err = {
            let mut inner = tracer.lock();
            tracer
                .dispatch(&mut inner, pid, WaitStatus::PtraceSyscall(pid))
                .unwrap_err()
        };

        assert!(err.bad_trace());

        // The offending pid is dropped; nobody else is affected.
        assert_eq!(tracer.tracee_count(), 0);
    }

    #[test]
    fn bad_trace_leaves_other_tracees_alone() {
        let tracer = Tracer::new();
        fake_tracee(&tracer, 900_003, None);
        let bystander = fake_tracee(&tracer, 900_004, None);
        kill_off(&tracer, 900_003, 0);

        let pid = Pid::from_raw(900_003);
        let err = {
            let mut inner = tracer.lock();
            tracer
                .dispatch(&mut inner, pid, WaitStatus::PtraceSyscall(pid))
                .unwrap_err()
        };
        assert!(err.bad_trace());

        assert_eq!(tracer.tracee_count(), 1);
        assert!(bystander.exit().is_none());

        // Leave no live fakes behind for the drop-time nuke to shoot at.
        let mut inner = tracer.lock();
        inner.remove_tracee(Pid::from_raw(900_004));
    }

    #[test]
    fn dead_orphan_is_reconciled() {
        let tracer = Tracer::new();
        fake_tracee(&tracer, 900_005, None);
        kill_off(&tracer, 900_005, 0);

        tracer.notify_orphan(Pid::from_raw(900_005));

        assert_eq!(tracer.step().unwrap(), false);
        assert_eq!(tracer.tracee_count(), 0);
    }

    #[test]
    fn duplicate_orphan_notification_is_a_no_op() {
        let tracer = Tracer::new();
        fake_tracee(&tracer, 900_006, None);
        kill_off(&tracer, 900_006, 0);

        tracer.notify_orphan(Pid::from_raw(900_006));
        tracer.notify_orphan(Pid::from_raw(900_006));

        assert_eq!(tracer.step().unwrap(), false);
        assert_eq!(tracer.step().unwrap(), false);
    }

    #[test]
    fn orphan_notification_for_live_tracee_is_a_bad_trace() {
        let tracer = Tracer::new();
        fake_tracee(&tracer, 900_007, None);

        tracer.notify_orphan(Pid::from_raw(900_007));

        let err = tracer.step().unwrap_err();
        assert!(err.bad_trace());
        assert_eq!(tracer.tracee_count(), 0);
    }

    #[test]
    fn recycled_pid_filters_stale_orphan_notification() {
        let tracer = Tracer::new();

        {
            let mut inner = tracer.lock();
            inner.recycled.push(Recycled {
                pid: 900_008,
                seen: Instant::now(),
            });
        }

        tracer.notify_orphan(Pid::from_raw(900_008));

        // No BadTrace, and the consumed entry is gone.
        assert_eq!(tracer.step().unwrap(), false);
        assert!(tracer.lock().recycled.is_empty());
    }

    #[test]
    fn orphan_for_unknown_pid_is_dropped() {
        let tracer = Tracer::new();
        tracer.notify_orphan(Pid::from_raw(900_009));

        assert_eq!(tracer.step().unwrap(), false);
    }

    #[test]
    fn nuke_converges_on_empty_fleet() {
        let tracer = Tracer::new();
        tracer.nuke();

        assert_eq!(tracer.step().unwrap(), false);
        assert_eq!(tracer.step().unwrap(), false);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let tracer = Tracer::new();
        let pid = Pid::from_raw(900_010);
        let process = Process::new_root(pid);

        let mut inner = tracer.lock();
        inner.add_tracee(pid, Arc::clone(&process), None).unwrap();

        let err = inner.add_tracee(pid, process, None).unwrap_err();
        assert!(err.bad_trace());

        // Re-adding after a full remove is allowed.
        inner.remove_tracee(pid);
        let process = Process::new_root(pid);
        assert!(inner.add_tracee(pid, process, None).is_ok());

        inner.remove_tracee(pid);
    }

    #[test]
    fn fork_race_stash_is_re_delivered() {
        let tracer = Tracer::new();
        let parent = fake_tracee(&tracer, 900_011, None);

        // The child's first notification beats the parent's fork event.
        let child = Pid::from_raw(900_012);
        {
            let mut inner = tracer.lock();
            tracer
                .dispatch(&mut inner, child, WaitStatus::Exited(child, 3))
                .unwrap();
            assert!(inner.pending_children.contains_key(&900_012));
        }

        // Once the fork event creates the record, the stash is re-delivered
        // (modelled here by hand; the event path runs the same functions).
        {
            let mut inner = tracer.lock();
            let child_process = Arc::clone(&parent).on_fork(child);
            inner
                .add_tracee(child, child_process, Some(Pid::from_raw(900_011)))
                .unwrap();
            inner.tracees.get_mut(&900_012).unwrap().attached = true;

            let stashed = inner.pending_children.remove(&900_012).unwrap();
            tracer.dispatch(&mut inner, child, stashed).unwrap();

            assert_eq!(inner.tracees[&900_012].state, State::Dead);
        }

        assert_eq!(parent.children().len(), 1);
        assert_eq!(
            parent.children()[0].exit(),
            Some(ExitKind::Exited { code: 3 })
        );

        let mut inner = tracer.lock();
        inner.remove_tracee(Pid::from_raw(900_011));
        inner.remove_tracee(Pid::from_raw(900_012));
    }

    #[test]
    fn parent_death_orphans_children() {
        let tracer = Tracer::new();
        fake_tracee(&tracer, 900_013, None);
        fake_tracee(&tracer, 900_014, Some(900_013));

        kill_off(&tracer, 900_013, 0);

        {
            let inner = tracer.lock();
            assert_eq!(inner.tracees[&900_014].parent, None);
        }

        let mut inner = tracer.lock();
        inner.remove_tracee(Pid::from_raw(900_013));
        inner.remove_tracee(Pid::from_raw(900_014));
    }
}
