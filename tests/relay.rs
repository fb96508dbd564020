use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::sys::signal::{kill, raise};
use ntest::timeout;
use pretty_assertions::assert_eq;
use treetrace::{Command, Exit, Interceptor, Pid, Ptracer, Restart, Signal, SignalSource, Supervisor};

mod support;

#[test]
#[timeout(10000)]
fn test_relay_to_root() -> Result<()> {
    let _lock = support::setup();

    let cmd = Command::new(vec!["sleep", "30"])?;
    let mut supervisor = Supervisor::new()?;
    supervisor.launch(&cmd)?;

    // Noted by the interceptor, and relayed before the first wait.
    raise(Signal::SIGTERM)?;

    let report = supervisor.run()?;

    assert_eq!(report.root_exit, Some(Exit::Signal(Signal::SIGTERM)));
    assert_eq!(report.attached, 1);
    assert_eq!(report.exited, 1);

    Ok(())
}

#[test]
#[timeout(20000)]
fn test_relay_interrupts_wait() -> Result<()> {
    let _lock = support::setup();

    let cmd = Command::new(support::sh("sleep 30 & sleep 30; wait"))?;
    let mut supervisor = Supervisor::new()?;
    supervisor.launch(&cmd)?;

    // Every tracee sleeps, so the only way out of the wait is the signal. Aim it at the
    // supervising thread, while it sleeps.
    let supervising = unsafe { libc::pthread_self() };

    let signaler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        unsafe { libc::pthread_kill(supervising, libc::SIGTERM) };
    });

    let report = supervisor.run()?;
    signaler.join().unwrap();

    assert_eq!(report.root_exit, Some(Exit::Signal(Signal::SIGTERM)));
    assert!(report.attached >= 3, "attached = {}", report.attached);
    assert_eq!(report.exited, report.attached);
    assert!(report.relays + report.lazy_exits >= 1);

    Ok(())
}

#[test]
#[timeout(20000)]
fn test_relay_runs_trap() -> Result<()> {
    let _lock = support::setup();

    let script = "trap 'exit 7' USR1; while :; do sleep 0.1; done";
    let cmd = Command::new(support::sh(script))?;
    let mut supervisor = Supervisor::new()?;
    supervisor.launch(&cmd)?;

    // Sent to the whole process, so any thread not holding it back may take it. The
    // supervising thread still gets to relay it.
    let signaler = thread::spawn(|| {
        thread::sleep(Duration::from_millis(500));
        let _ = kill(Pid::this(), Signal::SIGUSR1);
    });

    let report = supervisor.run()?;
    signaler.join().unwrap();

    assert_eq!(report.root_exit, Some(Exit::Code(7)));
    assert_eq!(report.exited, report.attached);

    Ok(())
}

/// Raises `signal` right after drain number `after`, before the supervisor waits again.
struct RaiseAfterDrain {
    inner: Interceptor,
    signal: Signal,
    after: usize,
    drains: usize,
}

impl SignalSource for RaiseAfterDrain {
    fn take_pending(&mut self) -> Vec<Signal> {
        let pending = self.inner.take_pending();
        self.drains += 1;

        if self.drains == self.after {
            raise(self.signal).unwrap();
        }

        pending
    }

    fn suspend(&mut self) -> nix::Result<()> {
        self.inner.suspend()
    }
}

#[test]
#[timeout(10000)]
fn test_signal_between_drain_and_wait_is_relayed() -> Result<()> {
    let _lock = support::setup();

    let signals = RaiseAfterDrain {
        inner: Interceptor::install_default()?,
        signal: Signal::SIGTERM,
        after: 2,
        drains: 0,
    };

    let cmd = Command::new(vec!["sleep", "3"])?;
    let mut supervisor = Supervisor::with_parts(Ptracer::new(), signals);
    supervisor.set_restart(Restart::Continue);
    supervisor.launch(&cmd)?;

    let start = Instant::now();
    let report = supervisor.run()?;
    let took = start.elapsed();

    // Relayed as soon as it arrived, not after the tree ran to its end.
    assert_eq!(report.root_exit, Some(Exit::Signal(Signal::SIGTERM)));
    assert_eq!(report.exited, report.attached);
    assert!(took < Duration::from_secs(2), "took {took:?}");

    Ok(())
}
