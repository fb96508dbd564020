#[macro_use]
pub mod error;

pub mod cmd;
pub mod ptracer;
pub mod registry;
pub mod signals;
pub mod supervisor;
pub mod syscall;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "x86_64")]
mod x86;

pub use cmd::Command;
pub use error::{Error, Result};
pub use ptracer::{Options, Pid, Ptracer, Restart, Signal, Tracer, REQUIRED_OPTIONS};
pub use registry::{Registry, State, TracedProcess};
pub use signals::{Interceptor, NoSignals, SignalSource, RELAYED_SIGNALS};
pub use supervisor::{supervise, Exit, Flow, Report, Supervisor};
pub use syscall::SyscallFrame;
