#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, Once};

use treetrace::{Event, ExitKind, Process, Tracer};

static INIT: Once = Once::new();

/// Install a fmt subscriber once per test binary, so failing runs can be
/// narrated with `--nocapture` and `RUST_LOG`.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

static FLEET: Mutex<()> = Mutex::new(());

/// Serialise the tests in this binary. The tracer collects notifications
/// with `waitpid(-1)`, so two live fleets in one test process would steal
/// each other's statuses; every test that spawns children holds this for
/// its whole run.
pub fn lock_fleet() -> MutexGuard<'static, ()> {
    FLEET.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Some scenarios need a scripting runtime for a parent that waits with
/// specific flags. Call with the fleet lock held.
pub fn have_python3() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map_or(false, |out| out.status.success())
}

/// Step the fleet until it drains, returning the number of steps taken.
pub fn drive(tracer: &Tracer) -> anyhow::Result<u32> {
    let mut steps = 0;

    while tracer.step()? {
        steps += 1;
        eprintln!("step {steps}: {} tracee(s) remain", tracer.tracee_count());
    }

    Ok(steps)
}

/// The argv of every exec observed on `process`, in order.
pub fn execs(process: &Process) -> Vec<Vec<String>> {
    process
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Exec { argv, .. } => Some(argv),
            _ => None,
        })
        .collect()
}

/// Number of fork events observed on `process`.
pub fn forks(process: &Process) -> usize {
    process
        .events()
        .iter()
        .filter(|event| matches!(event, Event::Forked { .. }))
        .count()
}

/// Every recorded end in the subtree rooted at `process`.
pub fn subtree_exits(process: &Process) -> Vec<ExitKind> {
    let mut exits = Vec::new();
    collect_exits(process, &mut exits);
    exits
}

fn collect_exits(process: &Process, exits: &mut Vec<ExitKind>) {
    exits.extend(process.exit());

    for child in process.children() {
        collect_exits(&child, exits);
    }
}
