use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;

use treetrace::{ExitKind, Tracer};

mod support;
use support::*;

#[test]
#[timeout(5000)]
fn single_leader_immediate_exit() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    let root = tracer.start("/bin/true", vec!["true".into()])?;

    eprintln!("leader pid = {}", root.pid());

    drive(&tracer)?;

    // Exactly one exec (the launch), then a clean exit.
    assert_eq!(execs(&root).len(), 1);
    assert_eq!(root.exit(), Some(ExitKind::Exited { code: 0 }));
    assert_eq!(forks(&root), 0);

    // The fleet is drained, and stays drained.
    assert_eq!(tracer.tracee_count(), 0);
    assert!(!tracer.step()?);

    eprintln!("{root}");

    Ok(())
}

#[test]
#[timeout(5000)]
fn exit_codes_are_observed() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    let root = tracer.start("bash", vec!["bash".into(), "-c".into(), "exit 41".into()])?;

    drive(&tracer)?;

    assert_eq!(root.exit(), Some(ExitKind::Exited { code: 41 }));
    assert_eq!(tracer.tracee_count(), 0);

    Ok(())
}

#[test]
#[timeout(5000)]
fn missing_program_fails_start() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    let err = tracer
        .start("definitely-not-a-real-program-xyz", vec!["x".into()])
        .unwrap_err();

    assert!(matches!(err, treetrace::Error::Runtime(_)));
    assert_eq!(tracer.tracee_count(), 0);

    Ok(())
}

#[test]
#[timeout(5000)]
fn list_snapshot_shows_leader() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    tracer.start("/bin/true", vec!["true".into()])?;

    let mut out = Vec::new();
    tracer.write_list(&mut out)?;
    let listing = String::from_utf8(out)?;

    eprintln!("listing:\n{listing}");

    // Registered, stopped, and still pre-exec at this point.
    assert!(listing.contains("stopped"));
    assert!(listing.contains("leader, pre-exec"));

    drive(&tracer)?;

    let mut out = Vec::new();
    tracer.write_list(&mut out)?;
    assert!(out.is_empty());

    Ok(())
}
