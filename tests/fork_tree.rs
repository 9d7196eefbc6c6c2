use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;

use treetrace::{ExitKind, Tracer};

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn forked_child_joins_the_tree() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    let root = tracer.start(
        "bash",
        vec!["bash".into(), "-c".into(), "/bin/true & wait".into()],
    )?;

    drive(&tracer)?;

    eprintln!("{root}");

    // One fork event per child node, and everything exited cleanly.
    assert_eq!(forks(&root), root.children().len());
    assert!(!root.children().is_empty());

    for exit in subtree_exits(&root) {
        assert_eq!(exit, ExitKind::Exited { code: 0 });
    }

    // The forked child execed /bin/true.
    let child_execs: Vec<_> = root
        .children()
        .iter()
        .flat_map(|child| execs(child))
        .collect();
    assert!(child_execs.iter().any(|argv| {
        argv.first().map_or(false, |arg0| arg0.contains("true"))
    }));

    assert_eq!(tracer.tracee_count(), 0);

    Ok(())
}

#[test]
#[timeout(10000)]
fn fork_without_exec_is_still_a_node() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    // The subshell exits without ever execing.
    let root = tracer.start(
        "bash",
        vec!["bash".into(), "-c".into(), "(exit 5) & wait".into()],
    )?;

    drive(&tracer)?;

    eprintln!("{root}");

    assert!(!root.children().is_empty());
    assert!(root
        .children()
        .iter()
        .any(|child| child.exit() == Some(ExitKind::Exited { code: 5 })));

    assert_eq!(tracer.tracee_count(), 0);

    Ok(())
}

#[test]
#[timeout(10000)]
fn grandchildren_are_followed() -> Result<()> {
    let _fleet = lock_fleet();
    init_logging();

    let tracer = Tracer::new();
    let root = tracer.start(
        "bash",
        vec![
            "bash".into(),
            "-c".into(),
            "bash -c '/bin/true & wait' & wait".into(),
        ],
    )?;

    drive(&tracer)?;

    eprintln!("{root}");

    // Leader, middle shell, and at least the grandchild.
    assert!(root.tree_size() >= 3);

    for exit in subtree_exits(&root) {
        assert_eq!(exit, ExitKind::Exited { code: 0 });
    }

    assert_eq!(tracer.tracee_count(), 0);

    Ok(())
}
