//! Supervise a traced process tree: launch its root, follow every descendant, relay
//! signals sent to us, and finish when the last tracee exits.

use std::collections::BTreeSet;
use std::io;

use nix::{errno::Errno, sys::wait::WaitStatus};
use tracing::{debug, info, trace, warn};

use crate::cmd::Command;
use crate::error::{Error, Result, ResultExt};
use crate::ptracer::{Options, Pid, Ptracer, Restart, Signal, Tracer, REQUIRED_OPTIONS};
use crate::registry::{Registry, State};
use crate::signals::{Interceptor, SignalSource};
use crate::syscall::SyscallFrame;

/// How a tracee ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exit {
    Code(i32),
    Signal(Signal),
}

impl Exit {
    fn of(status: WaitStatus) -> Option<(Pid, Exit)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, Exit::Code(code))),
            WaitStatus::Signaled(pid, signal, _) => Some((pid, Exit::Signal(signal))),
            _ => None,
        }
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Report {
    pub root: Option<Pid>,

    /// Set if the root's termination status was collected by us.
    pub root_exit: Option<Exit>,

    /// Tracees registered, the root included.
    pub attached: usize,

    /// Tracees removed, whether by an exit status or lazily.
    pub exited: usize,

    /// Tracees found gone by the signal relay, rather than by an exit status.
    pub lazy_exits: usize,

    /// Completed detach-redeliver-reattach cycles.
    pub relays: usize,

    /// Largest number of tracees registered at once.
    pub peak: usize,
}

/// Whether the supervisor has tracees left to follow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    Continue,
    Done,
}

// What to do with a tracee stopped for a signal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Disposition {
    // Leave it stopped.
    Hold,

    // Restart it, delivering the signal, if any.
    Resume(Option<Signal>),
}

// Outcome of waiting for one tracee to stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stopped {
    // Stopped, with a signal to deliver on restart, if any.
    At(Option<Signal>),

    // Exited, or otherwise no longer ours to wait on.
    Gone,
}

/// Supervisor of one traced process tree.
///
/// Owns the [`Registry`] and the [`Tracer`]. The event loop and the signal relay both run
/// on the calling thread, one after the other, so the registry is never shared.
#[derive(Debug)]
pub struct Supervisor<T = Ptracer, S = Interceptor> {
    tracer: T,
    signals: S,
    registry: Registry,

    /// New tracees whose attach-stop was seen before their parent's ptrace-event-stop.
    /// Held stopped until the parent reports them.
    unclaimed: BTreeSet<i32>,

    options: Options,
    restart: Restart,
    log_syscalls: bool,
    report: Report,
}

impl Supervisor<Ptracer, Interceptor> {
    /// A `ptrace(2)` supervisor relaying [`RELAYED_SIGNALS`](crate::RELAYED_SIGNALS).
    pub fn new() -> Result<Self> {
        let signals = Interceptor::install_default()?;
        Ok(Self::with_parts(Ptracer::new(), signals))
    }
}

impl<T: Tracer, S: SignalSource> Supervisor<T, S> {
    pub fn with_parts(tracer: T, signals: S) -> Self {
        Self {
            tracer,
            signals,
            registry: Registry::new(),
            unclaimed: BTreeSet::new(),
            options: REQUIRED_OPTIONS,
            restart: Restart::default(),
            log_syscalls: false,
            report: Report::default(),
        }
    }

    /// Return the ptrace options applied to the root and to re-attached tracees.
    ///
    /// Auto-attached descendants inherit them from their parent.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options applied to the root and to re-attached tracees.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, even if unset in the passed value.
    pub fn set_options(&mut self, options: Options) {
        self.options = options | REQUIRED_OPTIONS;
    }

    /// Kill every tracee if the supervisor itself dies (`PTRACE_O_EXITKILL`).
    pub fn set_exit_kill(&mut self, exit_kill: bool) {
        self.options.set(Options::PTRACE_O_EXITKILL, exit_kill);
    }

    pub fn restart(&self) -> Restart {
        self.restart
    }

    /// Set how tracees are resumed after each stop.
    pub fn set_restart(&mut self, restart: Restart) {
        self.restart = restart;
    }

    pub fn log_syscalls(&self) -> bool {
        self.log_syscalls
    }

    /// Log each completed syscall of every tracee. Needs [`Restart::Syscall`].
    pub fn set_log_syscalls(&mut self, log_syscalls: bool) {
        self.log_syscalls = log_syscalls;
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    /// Spawn `cmd` as the root tracee and set it running.
    ///
    /// If the root exits before it can be set up, that is its normal exit, and the following
    /// [`run()`](Self::run) collects it.
    pub fn launch(&mut self, cmd: &Command) -> Result<Pid> {
        let pid = self.tracer.spawn(cmd)?;
        info!(pid = pid.as_raw(), program = ?cmd.program(), "spawned root tracee");

        self.report.root = Some(pid);
        self.adopt(pid, State::Running);

        // A signal that reached the child before its self-raised `SIGSTOP`. Held back
        // until the new image runs, so the child can get there.
        let mut early = None;

        // Sync with the child's self-raised `SIGSTOP`.
        loop {
            match self.tracer.wait_for(pid) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => break,
                Ok(WaitStatus::Stopped(_, signal)) => {
                    debug!(pid = pid.as_raw(), %signal, "signal before initial stop of root tracee");
                    early = early.or(Some(signal));

                    // Options are unset, so only `PTRACE_CONT` gives a predictable next stop.
                    match self.tracer.resume(pid, Restart::Continue, None) {
                        Ok(()) | Err(Errno::ESRCH) => continue,
                        Err(source) => {
                            return Err(Error::Restart { pid, mode: Restart::Continue, source });
                        },
                    }
                },
                Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                    self.on_exit(status);
                    return Ok(pid);
                },
                Ok(status) => {
                    internal_error!(format!("unexpected initial stop of root tracee: {status:?}"))
                },
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(Error::Wait { source }),
            }
        }

        match self.tracer.set_options(pid, self.options) {
            Ok(()) => {},
            Err(Errno::ESRCH) => {
                // Killed in its initial stop. Its exit is reported by the next wait.
                debug!(pid = pid.as_raw(), "root tracee died before setting options");
                return Ok(pid);
            },
            Err(source) => return Err(Error::Options { pid, source }),
        }

        self.resume(pid, early)?;

        Ok(pid)
    }

    /// Follow the tree until no tracee is left.
    ///
    /// Signals noted by the [`SignalSource`] are relayed between waits. When no tracee has
    /// anything to report, the supervisor sleeps in [`SignalSource::suspend`] until a tracee
    /// changes state or a signal arrives, so a signal is never left waiting on the tree.
    ///
    /// Expected races with exiting tracees are handled here; any other failed request is
    /// returned as an error, after which the registry can no longer be trusted.
    pub fn run(&mut self) -> Result<Report> {
        while !self.registry.is_empty() {
            if self.relay_pending()? == Flow::Done {
                break;
            }

            let status = match self.tracer.try_wait_any() {
                Ok(WaitStatus::StillAlive) => {
                    self.signals.suspend().map_err(Error::OS)?;
                    continue;
                },
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(Error::Wait { source }),
            };

            trace!(?status, "wait status");

            if self.handle(status)? == Flow::Done {
                break;
            }
        }

        self.release_unclaimed();

        info!(report = ?self.report, "all tracees exited");

        Ok(self.report.clone())
    }

    /// Deliver `signal` to every registered tracee, children first.
    ///
    /// Each tracee is stopped, detached, sent `SIGCONT`, `signal` and `SIGSTOP`, then
    /// re-attached and resumed. A tracee found gone on the way is removed. Returns
    /// [`Flow::Done`], abandoning the remaining tracees, if that empties the registry.
    pub fn relay(&mut self, signal: Signal) -> Result<Flow> {
        let order = self.registry.relay_order();
        info!(%signal, tracees = order.len(), "relaying signal");

        for pid in order {
            if !self.registry.contains(pid) {
                continue;
            }

            if self.relay_to(pid, signal)? == Flow::Done {
                return Ok(Flow::Done);
            }
        }

        Ok(Flow::Continue)
    }

    fn relay_pending(&mut self) -> Result<Flow> {
        for signal in self.signals.take_pending() {
            if self.relay(signal)? == Flow::Done {
                return Ok(Flow::Done);
            }
        }

        Ok(Flow::Continue)
    }

    fn relay_to(&mut self, pid: Pid, signal: Signal) -> Result<Flow> {
        info!(pid = pid.as_raw(), %signal, "delivering signal");

        // Stop the tracee, so we can detach.
        if let Err(err) = self.tracer.kill(pid, Some(Signal::SIGSTOP)).died_if_esrch(pid) {
            if err.tracee_died() {
                return Ok(self.lazy_exit(pid));
            }
            return Err(err);
        }

        let pending = match self.await_stop(pid)? {
            Stopped::At(pending) => pending,
            Stopped::Gone => return Ok(self.lazy_exit(pid)),
        };

        match self.tracer.detach(pid, pending) {
            Ok(()) => info!(pid = pid.as_raw(), "detached"),
            Err(Errno::ESRCH) => return Ok(self.lazy_exit(pid)),
            Err(source) => return Err(Error::Detach { pid, source }),
        }

        // Untraced, so `signal` gets its ordinary disposition.
        for &sig in &[Signal::SIGCONT, signal, Signal::SIGSTOP] {
            if let Err(errno) = self.tracer.kill(pid, Some(sig)) {
                debug!(pid = pid.as_raw(), signal = %sig, %errno, "unable to signal detached tracee");
            }
        }

        match self.tracer.attach(pid) {
            Ok(()) => info!(pid = pid.as_raw(), "reattached"),
            Err(Errno::ESRCH) => return Ok(self.lazy_exit(pid)),
            Err(Errno::EPERM) => {
                // A zombie, or a process we may no longer trace. Collect the status of
                // the former, if it is our child.
                if let Ok(status) = self.tracer.try_reap(pid) {
                    self.note_root_exit(status);
                }
                warn!(pid = pid.as_raw(), "tracee can no longer be traced");
                return Ok(self.lazy_exit(pid));
            },
            Err(source) => return Err(Error::Attach { pid, source }),
        }

        let pending = match self.await_attach_stop(pid)? {
            Stopped::At(pending) => pending,
            Stopped::Gone => return Ok(self.lazy_exit(pid)),
        };

        // With a signal reported first, the attach `SIGSTOP` is still to come.
        let state = if pending.is_some() { State::Attaching } else { State::Running };
        if let Some(tracee) = self.registry.get_mut(pid) {
            tracee.state = state;
            tracee.call = None;
        }

        match self.tracer.set_options(pid, self.options) {
            Ok(()) => {},
            Err(Errno::ESRCH) => {
                // Killed since its stop. We are attached, so its exit will be reported.
                debug!(pid = pid.as_raw(), "reattached tracee died before setting options");
                return Ok(Flow::Continue);
            },
            Err(source) => return Err(Error::Options { pid, source }),
        }

        self.resume(pid, pending)?;
        self.report.relays += 1;

        Ok(Flow::Continue)
    }

    // Wait for an attached tracee to reach any ptrace-stop.
    fn await_stop(&mut self, pid: Pid) -> Result<Stopped> {
        loop {
            let status = match self.tracer.wait_for(pid) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(Stopped::Gone),
                Err(source) => return Err(Error::Wait { source }),
            };

            trace!(?status, "wait status while stopping tracee");

            let stopped = match status {
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    self.on_exit(status);
                    Stopped::Gone
                },
                WaitStatus::Stopped(_, Signal::SIGSTOP) => Stopped::At(None),
                WaitStatus::Stopped(_, signal) => {
                    // Stopped for a signal that beat ours. Let the detach deliver it.
                    if self.is_group_stop(pid, signal) {
                        Stopped::At(None)
                    } else {
                        Stopped::At(Some(signal))
                    }
                },
                WaitStatus::PtraceSyscall(_) => {
                    self.on_syscall(pid);
                    Stopped::At(None)
                },
                WaitStatus::PtraceEvent(_, _, event) => {
                    self.on_event(pid, event)?;
                    Stopped::At(None)
                },
                WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                    internal_error!("unreachable `wait()` status")
                },
            };

            return Ok(stopped);
        }
    }

    // Wait for the attach-stop of a freshly attached tracee.
    fn await_attach_stop(&mut self, pid: Pid) -> Result<Stopped> {
        loop {
            let status = match self.tracer.wait_for(pid) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(Stopped::Gone),
                Err(source) => return Err(Error::Wait { source }),
            };

            trace!(?status, "wait status while attaching");

            let stopped = match status {
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    self.on_exit(status);
                    Stopped::Gone
                },
                WaitStatus::Stopped(_, Signal::SIGSTOP) => Stopped::At(None),
                WaitStatus::Stopped(_, signal) => Stopped::At(Some(signal)),
                status => {
                    internal_error!(format!("unexpected stop while attaching: {status:?}"))
                },
            };

            return Ok(stopped);
        }
    }

    // Dispatch one status from the tree-wide wait.
    fn handle(&mut self, status: WaitStatus) -> Result<Flow> {
        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Ok(self.on_exit(status));
            },
            WaitStatus::PtraceEvent(pid, _, event) => {
                self.on_event(pid, event)?;
                self.resume(pid, None)?;
            },
            WaitStatus::PtraceSyscall(pid) => {
                self.on_syscall(pid);
                self.resume(pid, None)?;
            },
            WaitStatus::Stopped(pid, signal) => {
                if let Disposition::Resume(pending) = self.on_signal_stop(pid, signal) {
                    self.resume(pid, pending)?;
                }
            },
            // `StillAlive` is taken care of by the caller, and we never ask for `WCONTINUED`.
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                internal_error!("unreachable `wait()` status")
            },
        }

        Ok(Flow::Continue)
    }

    fn on_exit(&mut self, status: WaitStatus) -> Flow {
        let (pid, exit) = match Exit::of(status) {
            Some(exited) => exited,
            None => return Flow::Continue,
        };

        self.note_root_exit(status);

        if self.registry.remove(pid).is_some() {
            info!(pid = pid.as_raw(), ?exit, "tracee exited");
            self.report.exited += 1;
        } else if self.unclaimed.remove(&pid.as_raw()) {
            debug!(pid = pid.as_raw(), ?exit, "unclaimed tracee exited");
        } else {
            // Already found gone by the relay.
            debug!(pid = pid.as_raw(), ?exit, "exit of untracked pid");
        }

        self.flow()
    }

    fn on_event(&mut self, pid: Pid, event: i32) -> Result<()> {
        match event {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                let new = match self.event_pid(pid)? {
                    Some(new) => new,
                    None => return Ok(()),
                };

                info!(parent = pid.as_raw(), pid = new.as_raw(), event, "attached to offspring");

                self.adopt_offspring(new)?;
            },
            libc::PTRACE_EVENT_EXEC => {
                // The current `pid` is now equal to the tgid of `old`.
                let old = match self.event_pid(pid)? {
                    Some(old) => old,
                    None => return Ok(()),
                };

                let mut call = None;

                if old != pid {
                    // We exec'd off the leader thread. The former tid will never be reported
                    // again, not even as an exit.
                    if let Some(former) = self.registry.remove(old) {
                        info!(pid = pid.as_raw(), old = old.as_raw(), "exec off leader, former tid gone");
                        self.report.exited += 1;
                        call = former.call;
                    }
                }

                if let Some(tracee) = self.registry.get_mut(pid) {
                    // We know we are in a syscall. Label the next syscall-stop as an exit-stop.
                    tracee.state = State::Syscalling;
                    if call.is_some() {
                        tracee.call = call;
                    }
                }
            },
            _ => {
                debug!(pid = pid.as_raw(), event, "ignoring ptrace event");
            },
        }

        Ok(())
    }

    // Read the pid carried by a ptrace-event-stop. `None` if the reporting tracee is gone.
    fn event_pid(&mut self, pid: Pid) -> Result<Option<Pid>> {
        match self.tracer.event_message(pid) {
            Ok(msg) => Ok(Some(Pid::from_raw(msg as i32))),
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), "tracee died in ptrace-event-stop");
                Ok(None)
            },
            Err(source) => Err(Error::EventMessage { pid, source }),
        }
    }

    // Register an auto-attached child, then get it past its attach-stop.
    fn adopt_offspring(&mut self, new: Pid) -> Result<()> {
        if self.registry.contains(new) {
            debug!(pid = new.as_raw(), "offspring already registered");
            return Ok(());
        }

        let held = self.unclaimed.remove(&new.as_raw());
        self.adopt(new, State::Attaching);

        if held {
            // Its attach-stop has been consumed already.
            self.registry.set_state(new, State::Running);
            return self.resume(new, None);
        }

        // Resuming succeeds iff the child already sits in its (unreported) attach-stop.
        match self.tracer.resume(new, self.restart, None) {
            Ok(()) => self.registry.set_state(new, State::Running),
            Err(Errno::ESRCH) => debug!(pid = new.as_raw(), "offspring not stopped yet, awaiting attach-stop"),
            Err(source) => return Err(Error::Restart { pid: new, mode: self.restart, source }),
        }

        Ok(())
    }

    fn adopt(&mut self, pid: Pid, state: State) {
        if self.registry.insert(pid, state) {
            self.report.attached += 1;
            self.report.peak = self.report.peak.max(self.registry.len());
        }
    }

    fn on_syscall(&mut self, pid: Pid) {
        let frame = if self.log_syscalls {
            Some(self.tracer.syscall_frame(pid))
        } else {
            None
        };

        let tracee = match self.registry.get_mut(pid) {
            Some(tracee) => tracee,
            None => {
                debug!(pid = pid.as_raw(), "syscall-stop for unregistered pid");
                return;
            },
        };

        match tracee.state {
            State::Syscalling => {
                tracee.state = State::Running;

                if let Some(frame) = frame {
                    log_syscall(pid, tracee.call.take(), frame);
                }
            },
            State::Running | State::Attaching => {
                tracee.state = State::Syscalling;
                tracee.call = match frame {
                    Some(Ok(frame)) => Some(frame.returning(None)),
                    Some(Err(errno)) => {
                        debug!(pid = pid.as_raw(), %errno, "unable to read syscall frame");
                        None
                    },
                    None => None,
                };
            },
        }
    }

    fn on_signal_stop(&mut self, pid: Pid, signal: Signal) -> Disposition {
        let state = self.registry.get(pid).map(|t| t.state);

        match state {
            None if signal == Signal::SIGSTOP => {
                // We may see an attach-stop out-of-order, before the ptrace-event-stop that
                // names the new tracee. Hold it until then.
                info!(pid = pid.as_raw(), "holding new tracee until its parent reports it");
                self.unclaimed.insert(pid.as_raw());
                Disposition::Hold
            },
            None => {
                debug!(pid = pid.as_raw(), %signal, "signal-stop for unregistered pid");
                Disposition::Resume(Some(signal))
            },
            Some(State::Attaching) if signal == Signal::SIGSTOP => {
                debug!(pid = pid.as_raw(), "attach-stop");
                self.registry.set_state(pid, State::Running);
                Disposition::Resume(None)
            },
            Some(_) => {
                if self.is_group_stop(pid, signal) {
                    debug!(pid = pid.as_raw(), %signal, "group-stop");
                    Disposition::Resume(None)
                } else {
                    debug!(pid = pid.as_raw(), %signal, "signal-delivery-stop");
                    Disposition::Resume(Some(signal))
                }
            },
        }
    }

    fn is_group_stop(&mut self, pid: Pid, signal: Signal) -> bool {
        match self.tracer.is_group_stop(pid, signal) {
            Ok(group) => group,
            Err(errno) => {
                // Most likely `ESRCH`, killed while stopped. Nothing to deliver.
                debug!(pid = pid.as_raw(), %errno, "unable to classify signal-stop");
                true
            },
        }
    }

    // Resume a stopped tracee. A tracee killed since it stopped is not an error: its exit
    // will be reported by a later wait.
    fn resume(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        match self.tracer.resume(pid, self.restart, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), "tracee died before restart");
                Ok(())
            },
            Err(source) => Err(Error::Restart { pid, mode: self.restart, source }),
        }
    }

    // Remove a tracee found gone by a failed request, rather than by an exit status. A
    // no-op for a tracee whose exit status was already seen.
    fn lazy_exit(&mut self, pid: Pid) -> Flow {
        if self.registry.remove(pid).is_some() {
            info!(pid = pid.as_raw(), "tracee exited");
            self.report.exited += 1;
            self.report.lazy_exits += 1;
        }

        self.flow()
    }

    fn note_root_exit(&mut self, status: WaitStatus) {
        if let Some((pid, exit)) = Exit::of(status) {
            if Some(pid) == self.report.root {
                self.report.root_exit = Some(exit);
            }
        }
    }

    fn flow(&self) -> Flow {
        if self.registry.is_empty() {
            Flow::Done
        } else {
            Flow::Continue
        }
    }

    // Let go of held tracees nobody claimed, so they do not stay stopped forever.
    fn release_unclaimed(&mut self) {
        for raw in std::mem::take(&mut self.unclaimed) {
            let pid = Pid::from_raw(raw);
            warn!(pid = raw, "releasing unclaimed tracee");

            if let Err(errno) = self.tracer.detach(pid, None) {
                debug!(pid = raw, %errno, "unable to release unclaimed tracee");
            }
        }
    }
}

fn log_syscall(pid: Pid, call: Option<SyscallFrame>, exit: nix::Result<SyscallFrame>) {
    match (call, exit) {
        (Some(call), Ok(exit)) => info!(pid = pid.as_raw(), "{}", call.returning(exit.ret)),
        (Some(call), Err(_)) => info!(pid = pid.as_raw(), "{}", call),
        (None, _) => debug!(pid = pid.as_raw(), "syscall-exit-stop without a recorded entry"),
    }
}

/// Spawn `argv` under a default [`Supervisor`] and follow it to the end.
pub fn supervise(argv: Vec<impl Into<Vec<u8>>>) -> Result<Report> {
    let cmd = Command::new(argv).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let mut supervisor = Supervisor::new()?;
    supervisor.launch(&cmd)?;
    supervisor.run()
}
