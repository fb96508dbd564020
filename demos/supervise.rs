use std::process;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;
use treetrace::{Command, Restart, Supervisor};

#[derive(StructOpt, Debug)]
struct Opt {
    /// Log every completed syscall of every tracee.
    #[structopt(short, long)]
    syscalls: bool,

    /// Resume tracees with `PTRACE_CONT`, skipping syscall-stops.
    #[structopt(short, long, conflicts_with = "syscalls")]
    cont: bool,

    /// Kill the tree if this process dies.
    #[structopt(short, long)]
    exit_kill: bool,

    #[structopt(min_values = 1)]
    argv: Vec<String>,
}

fn run(opt: Opt) -> anyhow::Result<()> {
    let cmd = Command::new(opt.argv)?;

    let mut supervisor = Supervisor::new()?;
    supervisor.set_log_syscalls(opt.syscalls);
    supervisor.set_exit_kill(opt.exit_kill);

    if opt.cont {
        supervisor.set_restart(Restart::Continue);
    }

    supervisor.launch(&cmd)?;
    let report = supervisor.run()?;

    println!("{report:#?}");

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();

    if let Err(err) = run(opt) {
        eprintln!("error: {err:?}");
        process::exit(1);
    }
}
