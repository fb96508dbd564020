use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use treetrace::{Exit, Restart};

mod support;

#[test]
#[timeout(10000)]
fn test_follow_forks() -> Result<()> {
    let _lock = support::setup();

    let argv = support::sh("/bin/true & /bin/true & wait; /bin/true");
    let report = support::supervise_with(argv, |_| {})?;

    assert_eq!(report.root_exit, Some(Exit::Code(0)));

    // The shell and its background children. The last command may be exec'd in place.
    assert!(report.attached >= 3, "attached = {}", report.attached);
    assert!(report.peak >= 2, "peak = {}", report.peak);
    assert_eq!(report.exited, report.attached);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_follow_forks_without_syscall_stops() -> Result<()> {
    let _lock = support::setup();

    let argv = support::sh("/bin/true & wait; exit 5");
    let report = support::supervise_with(argv, |supervisor| {
        supervisor.set_restart(Restart::Continue);
    })?;

    assert_eq!(report.root_exit, Some(Exit::Code(5)));
    assert!(report.attached >= 2, "attached = {}", report.attached);
    assert_eq!(report.exited, report.attached);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_orphans_are_followed() -> Result<()> {
    let _lock = support::setup();

    // The grandchild outlives its parent, and the run lasts until it exits too.
    let argv = support::sh("sh -c 'sleep 0.2; exit 9' & exit 0");
    let report = support::supervise_with(argv, |_| {})?;

    assert_eq!(report.root_exit, Some(Exit::Code(0)));
    assert!(report.attached >= 3, "attached = {}", report.attached);
    assert_eq!(report.exited, report.attached);

    Ok(())
}
