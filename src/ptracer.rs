//! Host tracing primitives: the ptrace requests, signals, and waits the supervisor is built on.

use std::marker::PhantomData;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};

use crate::cmd::Command;
use crate::error::Result;
use crate::syscall::SyscallFrame;

#[cfg(target_arch = "aarch64")]
use crate::aarch64;

#[cfg(target_arch = "x86_64")]
use crate::x86;

pub use nix::unistd::Pid;
pub use nix::sys::ptrace::Options;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Restart requests, which resume stopped tracees.
///
/// The restart mode determines the possible subsequent stops of the restarted tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    /// Run to the next syscall-stop, `PTRACE_SYSCALL`.
    Syscall,

    /// Run to the next signal or ptrace event, `PTRACE_CONT`.
    Continue,
}

impl Default for Restart {
    fn default() -> Self {
        Restart::Syscall
    }
}

/// Options required to follow the whole tree and classify its stops:
/// - [`PTRACE_O_TRACEFORK`](Options::PTRACE_O_TRACEFORK)
/// - [`PTRACE_O_TRACEVFORK`](Options::PTRACE_O_TRACEVFORK)
/// - [`PTRACE_O_TRACECLONE`](Options::PTRACE_O_TRACECLONE)
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC)
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD)
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACESYSGOOD);

/// The tracing calls a [`Supervisor`](crate::Supervisor) makes against the host.
///
/// Requests return the raw `errno` on failure, so the caller can tell an expected race
/// (`ESRCH`, `EINTR`, `ECHILD`) from a broken invariant.
pub trait Tracer {
    /// Fork `cmd` as a child that requests tracing and stops itself before `exec()`.
    fn spawn(&mut self, cmd: &Command) -> Result<Pid>;

    /// Collect a pending state change of any tracee of the calling thread, without blocking.
    ///
    /// Returns [`WaitStatus::StillAlive`] if no tracee has anything to report.
    fn try_wait_any(&mut self) -> nix::Result<WaitStatus>;

    /// Block until `pid` changes state.
    fn wait_for(&mut self, pid: Pid) -> nix::Result<WaitStatus>;

    /// Collect a pending state change of `pid`, without blocking.
    fn try_reap(&mut self, pid: Pid) -> nix::Result<WaitStatus>;

    /// `PTRACE_GETEVENTMSG` for a tracee in a ptrace-event-stop.
    fn event_message(&mut self, pid: Pid) -> nix::Result<libc::c_long>;

    fn resume(&mut self, pid: Pid, mode: Restart, signal: Option<Signal>) -> nix::Result<()>;

    fn set_options(&mut self, pid: Pid, options: Options) -> nix::Result<()>;

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> nix::Result<()>;

    fn attach(&mut self, pid: Pid) -> nix::Result<()>;

    /// Send a signal outside of the tracing relationship.
    fn kill(&mut self, pid: Pid, signal: Option<Signal>) -> nix::Result<()>;

    /// Check if a signal stop of `pid` is a group-stop.
    ///
    /// Assumes attach-stop has already been ruled out.
    fn is_group_stop(&mut self, pid: Pid, signal: Signal) -> nix::Result<bool>;

    /// Syscall number, arguments and return register of a tracee in syscall-stop.
    fn syscall_frame(&mut self, pid: Pid) -> nix::Result<SyscallFrame>;
}

/// [`Tracer`] backed by `ptrace(2)`.
///
/// Tracees belong to the thread that attached them, so a `Ptracer` is neither `Send` nor
/// `Sync`, and it only ever waits on children of its own thread.
#[derive(Clone, Debug, Default)]
pub struct Ptracer {
    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Ptracer {
    pub fn new() -> Self {
        Self::default()
    }

    fn wait_flags() -> WaitPidFlag {
        WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD
    }
}

impl Tracer for Ptracer {
    fn spawn(&mut self, cmd: &Command) -> Result<Pid> {
        cmd.fork_exec()
    }

    fn try_wait_any(&mut self) -> nix::Result<WaitStatus> {
        wait::waitpid(Pid::from_raw(-1), Some(Self::wait_flags() | WaitPidFlag::WNOHANG))
    }

    fn wait_for(&mut self, pid: Pid) -> nix::Result<WaitStatus> {
        wait::waitpid(pid, Some(Self::wait_flags()))
    }

    fn try_reap(&mut self, pid: Pid) -> nix::Result<WaitStatus> {
        wait::waitpid(pid, Some(Self::wait_flags() | WaitPidFlag::WNOHANG))
    }

    fn event_message(&mut self, pid: Pid) -> nix::Result<libc::c_long> {
        ptrace::getevent(pid)
    }

    fn resume(&mut self, pid: Pid, mode: Restart, signal: Option<Signal>) -> nix::Result<()> {
        match mode {
            Restart::Syscall =>
                ptrace::syscall(pid, signal),
            Restart::Continue =>
                ptrace::cont(pid, signal),
        }
    }

    fn set_options(&mut self, pid: Pid, options: Options) -> nix::Result<()> {
        ptrace::setoptions(pid, options)
    }

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
        ptrace::detach(pid, signal)
    }

    fn attach(&mut self, pid: Pid) -> nix::Result<()> {
        ptrace::attach(pid)
    }

    fn kill(&mut self, pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
        signal::kill(pid, signal)
    }

    fn is_group_stop(&mut self, pid: Pid, sig: Signal) -> nix::Result<bool> {
        use Signal::*;

        match sig {
            SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
                // Possible group-stop. Check `siginfo` to disambiguate.
                //
                // From the manual:
                //
                //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
                //     group-stop.  (Other failure codes are possible, such as ESRCH
                //     ("no such process") if a SIGKILL killed the tracee.)
                //
                match ptrace::getsiginfo(pid) {
                    Err(Errno::EINVAL) =>
                        Ok(true),
                    Err(err) =>
                        Err(err),
                    Ok(_) =>
                        Ok(false)
                }
            },
            _ => {
                // Only these four signals are stopping signals.
                Ok(false)
            },
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn syscall_frame(&mut self, pid: Pid) -> nix::Result<SyscallFrame> {
        x86::syscall_frame(pid)
    }

    #[cfg(target_arch = "aarch64")]
    fn syscall_frame(&mut self, pid: Pid) -> nix::Result<SyscallFrame> {
        aarch64::syscall_frame(pid)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn syscall_frame(&mut self, _pid: Pid) -> nix::Result<SyscallFrame> {
        Err(Errno::ENOSYS)
    }
}
