use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use nix::sys::signal;
use ntest::timeout;
use pretty_assertions::assert_eq;

use treetrace::{Event, ExitKind, Signal, Tracer};

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn delivered_signals_are_recorded_and_reinjected() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    // The handler ignores SIGUSR1, so the tracee only survives if the
    // tracer re-injects the suppressed-then-recorded signal faithfully.
    let root = tracer.start(
        "bash",
        vec![
            "bash".into(),
            "-c".into(),
            "trap '' USR1; kill -USR1 $$; exit 0".into(),
        ],
    )?;

    drive(&tracer)?;

    eprintln!("{root}");

    assert!(root
        .events()
        .iter()
        .any(|event| matches!(event, Event::Signaled { signal: Signal::SIGUSR1 })));

    assert_eq!(root.exit(), Some(ExitKind::Exited { code: 0 }));
    assert_eq!(tracer.tracee_count(), 0);

    Ok(())
}

#[test]
#[timeout(10000)]
fn fatal_signal_ends_the_tracee() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    let root = tracer.start(
        "bash",
        vec!["bash".into(), "-c".into(), "kill -TERM $$".into()],
    )?;

    drive(&tracer)?;

    assert_eq!(
        root.exit(),
        Some(ExitKind::Killed {
            signal: Signal::SIGTERM,
            core_dumped: false,
        })
    );

    assert_eq!(tracer.tracee_count(), 0);

    Ok(())
}

#[test]
#[timeout(15000)]
fn continued_child_wakes_a_wcontinued_wait() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    if !have_python3() {
        eprintln!("python3 not available; skipping");
        return Ok(());
    }

    // The parent waits for a continue and nothing else, then kills the
    // child and reports through its own exit code. It can only reach
    // exit 42 if the WCONTINUED wait completed before the child died.
    const PARENT: &str = r#"
import os, signal, sys, time

pid = os.fork()
if pid == 0:
    time.sleep(30)
    os._exit(0)

res = os.waitid(os.P_PID, pid, os.WCONTINUED)
if res is None or res.si_pid != pid:
    sys.exit(1)

os.kill(pid, signal.SIGKILL)
os.waitpid(pid, 0)
sys.exit(42)
"#;

    let tracer = Arc::new(Tracer::new());
    let root = tracer.start(
        "python3",
        vec!["python3".into(), "-c".into(), PARENT.into()],
    )?;

    // Stop and continue the child from outside the fleet while the parent
    // is parked in its wait.
    let signaller = {
        let root = Arc::clone(&root);
        thread::spawn(move || {
            let child = loop {
                if let Some(child) = root.children().first().map(|c| c.pid()) {
                    break child;
                }
                thread::sleep(Duration::from_millis(20));
            };

            eprintln!("stopping and continuing child {child}");

            thread::sleep(Duration::from_millis(300));
            let _ = signal::kill(child, Signal::SIGSTOP);
            thread::sleep(Duration::from_millis(300));
            let _ = signal::kill(child, Signal::SIGCONT);
        })
    };

    drive(&tracer)?;
    signaller.join().expect("signaller thread panicked");

    eprintln!("{root}");

    assert_eq!(root.exit(), Some(ExitKind::Exited { code: 42 }));

    // The child's lifecycle was fully observed along the way.
    assert!(root
        .children()
        .iter()
        .any(|child| matches!(
            child.exit(),
            Some(ExitKind::Killed {
                signal: Signal::SIGKILL,
                ..
            })
        )));

    assert_eq!(tracer.tracee_count(), 0);

    Ok(())
}
