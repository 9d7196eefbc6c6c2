//! The process-tree model fed by the tracer.
//!
//! One [`Process`] node exists per traced process, shared between the
//! tracer's tracee record and the tree's parent/child edges. Nodes outlive
//! their processes: a node for an exited process keeps its recorded history
//! so downstream tools can render the full tree after the fleet drains.
//!
//! Child nodes hold [`Weak`] references back to their parent, so dropping
//! the root drops the whole tree.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::{Pid, Signal};

/// How a process left the fleet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitKind {
    Exited { code: i32 },
    Killed { signal: Signal, core_dumped: bool },
}

/// A lifecycle event observed on one process, in causal order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// A fork/clone event fired on this process.
    Forked { child: Pid },

    /// A successful exec replaced this process's image.
    Exec { file: String, argv: Vec<String> },

    /// Post-exec entry point or loaded-image report.
    NewLocation {
        addr: u64,
        file: Option<String>,
        symbol: Option<String>,
    },

    /// A non-fatal signal was delivered.
    Signaled { signal: Signal },

    /// The process ended.
    Ended { exit: ExitKind },
}

#[derive(Debug, Default)]
struct Ledger {
    /// Current command line; empty until the first exec is observed.
    argv: Vec<String>,

    /// Current program image.
    file: Option<String>,

    children: Vec<Arc<Process>>,
    events: Vec<Event>,
    end: Option<ExitKind>,
}

/// A node in the traced process tree.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    parent: Weak<Process>,
    ledger: Mutex<Ledger>,
}

impl Process {
    pub(crate) fn new_root(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            parent: Weak::new(),
            ledger: Mutex::new(Ledger::default()),
        })
    }

    /// Record a fork/clone event and return the new child node.
    pub(crate) fn on_fork(self: Arc<Self>, child_pid: Pid) -> Arc<Process> {
        let child = Arc::new(Process {
            pid: child_pid,
            parent: Arc::downgrade(&self),
            ledger: Mutex::new(Ledger {
                // A forked child starts as a copy of its parent's image.
                argv: self.command_line(),
                file: self.file(),
                ..Ledger::default()
            }),
        });

        debug!(
            pid = self.pid.as_raw(),
            child = child_pid.as_raw(),
            "process forked"
        );

        let mut ledger = self.ledger.lock().unwrap();
        ledger.events.push(Event::Forked { child: child_pid });
        ledger.children.push(Arc::clone(&child));

        child
    }

    /// Record a successful exec.
    pub(crate) fn on_exec(&self, file: String, argv: Vec<String>) {
        debug!(pid = self.pid.as_raw(), %file, "process execed");

        let mut ledger = self.ledger.lock().unwrap();
        ledger.argv = argv.clone();
        ledger.file = Some(file.clone());
        ledger.events.push(Event::Exec { file, argv });
    }

    /// Record the post-exec entry point.
    pub(crate) fn on_new_location(&self, addr: u64, file: Option<String>, symbol: Option<String>) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.events.push(Event::NewLocation { addr, file, symbol });
    }

    /// Record a non-fatal signal delivery.
    pub(crate) fn on_signal(&self, signal: Signal) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.events.push(Event::Signaled { signal });
    }

    /// Record a normal exit.
    pub(crate) fn on_exit(&self, code: i32) {
        self.ended(ExitKind::Exited { code });
    }

    /// Record death by signal.
    pub(crate) fn on_killed(&self, signal: Signal, core_dumped: bool) {
        self.ended(ExitKind::Killed {
            signal,
            core_dumped,
        });
    }

    fn ended(&self, exit: ExitKind) {
        debug!(pid = self.pid.as_raw(), ?exit, "process ended");

        let mut ledger = self.ledger.lock().unwrap();
        ledger.end = Some(exit);
        ledger.events.push(Event::Ended { exit });
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.upgrade()
    }

    /// The command line as of the most recent exec. Empty for a leader whose
    /// initial exec has not fired yet.
    pub fn command_line(&self) -> Vec<String> {
        self.ledger.lock().unwrap().argv.clone()
    }

    /// Path of the current program image, if an exec has been observed.
    pub fn file(&self) -> Option<String> {
        self.ledger.lock().unwrap().file.clone()
    }

    pub fn children(&self) -> Vec<Arc<Process>> {
        self.ledger.lock().unwrap().children.clone()
    }

    /// The recorded lifecycle events, in the order they were observed.
    pub fn events(&self) -> Vec<Event> {
        self.ledger.lock().unwrap().events.clone()
    }

    /// How the process ended, if it has.
    pub fn exit(&self) -> Option<ExitKind> {
        self.ledger.lock().unwrap().end
    }

    /// Total number of nodes in the subtree rooted here, including self.
    pub fn tree_size(&self) -> usize {
        1 + self
            .children()
            .iter()
            .map(|child| child.tree_size())
            .sum::<usize>()
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let argv = self.command_line();
        let name = if argv.is_empty() {
            "<pre-exec>".to_owned()
        } else {
            argv.join(" ")
        };

        let status = match self.exit() {
            Some(ExitKind::Exited { code }) => format!("exited {code}"),
            Some(ExitKind::Killed {
                signal,
                core_dumped,
            }) => {
                if core_dumped {
                    format!("killed by {signal} (core dumped)")
                } else {
                    format!("killed by {signal}")
                }
            }
            None => "alive".to_owned(),
        };

        writeln!(
            f,
            "{:indent$}{} [{}] {}",
            "",
            self.pid,
            status,
            name,
            indent = depth * 2
        )?;

        for child in self.children() {
            child.write_tree(f, depth + 1)?;
        }

        Ok(())
    }
}

impl fmt::Display for Process {
    /// Render the subtree rooted at this node, one process per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_tree(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_links_both_directions() {
        let root = Process::new_root(Pid::from_raw(100));
        root.on_exec("/bin/sh".into(), vec!["sh".into()]);

        let child = Arc::clone(&root).on_fork(Pid::from_raw(101));

        assert_eq!(child.parent().unwrap().pid(), root.pid());
        assert_eq!(root.children().len(), 1);

        // The child starts as a copy of the parent's image.
        assert_eq!(child.command_line(), vec!["sh".to_owned()]);

        assert_eq!(root.tree_size(), 2);
    }

    #[test]
    fn exec_replaces_command_line() {
        let root = Process::new_root(Pid::from_raw(100));
        root.on_exec("/bin/sh".into(), vec!["sh".into()]);
        root.on_exec("/bin/true".into(), vec!["true".into()]);

        assert_eq!(root.command_line(), vec!["true".to_owned()]);
        assert_eq!(root.file().as_deref(), Some("/bin/true"));
        assert_eq!(
            root.events()
                .iter()
                .filter(|ev| matches!(ev, Event::Exec { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn end_is_recorded_once() {
        let root = Process::new_root(Pid::from_raw(100));
        root.on_exit(3);

        assert_eq!(root.exit(), Some(ExitKind::Exited { code: 3 }));
    }
}
