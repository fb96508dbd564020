use std::sync::{Mutex, MutexGuard};

use lazy_static::lazy_static;
use tracing_subscriber::EnvFilter;
use treetrace::{Command, Report, Supervisor};

lazy_static! {
    // Signal dispositions are process-wide, so supervisors in one test binary take turns.
    static ref LOCK: Mutex<()> = Mutex::new(());
}

/// Serialize supervisors, and log to the test output as `RUST_LOG` asks.
pub fn setup() -> MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    // A failed test poisons the lock, but leaves nothing behind we depend on.
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Argument vector for running `script` with `/bin/sh`.
#[allow(unused)]
pub fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), script.into()]
}

/// Run `argv` to the end under a default supervisor, configured by `config`.
#[allow(unused)]
pub fn supervise_with(argv: Vec<String>, config: impl FnOnce(&mut Supervisor)) -> anyhow::Result<Report> {
    let cmd = Command::new(argv)?;

    let mut supervisor = Supervisor::new()?;
    config(&mut supervisor);
    supervisor.launch(&cmd)?;

    Ok(supervisor.run()?)
}
