//! Interception of signals sent to the supervisor, for relay to its tracees.
//!
//! Intercepted signals, and `SIGCHLD`, stay blocked on the supervising thread. They only get
//! through while it drains them, or while it sleeps in [`SignalSource::suspend`], which
//! unblocks them atomically. A signal that arrives at any other moment waits in the kernel,
//! so it can't slip in between a drain and the sleep that follows it.
//!
//! Handlers only note which signals arrived. One that runs on another thread passes the
//! signal on to the supervising thread instead.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use nix::{
    errno::Errno,
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow},
    unistd::{getpid, gettid},
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ptracer::Signal;

/// Signals relayed to the tree by default: every standard signal that can be caught, except
/// `SIGCHLD`, `SIGWINCH`, `SIGPWR` and `SIGSTKFLT`.
pub const RELAYED_SIGNALS: &[Signal] = &[
    Signal::SIGABRT,
    Signal::SIGALRM,
    Signal::SIGBUS,
    Signal::SIGCONT,
    Signal::SIGFPE,
    Signal::SIGHUP,
    Signal::SIGILL,
    Signal::SIGINT,
    Signal::SIGPIPE,
    Signal::SIGQUIT,
    Signal::SIGSEGV,
    Signal::SIGTERM,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGIO,
    Signal::SIGPROF,
    Signal::SIGSYS,
    Signal::SIGTRAP,
    Signal::SIGURG,
    Signal::SIGVTALRM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
];

// Bit `n` is set when signal `n` has arrived and not been taken.
static PENDING: AtomicU64 = AtomicU64::new(0);

// Bit `n` is set while signal `n` is intercepted.
static INTERCEPTED: AtomicU64 = AtomicU64::new(0);

// Thread id of the supervising thread, or 0.
static SUPERVISING: AtomicI32 = AtomicI32::new(0);

extern "C" fn note_signal(signo: libc::c_int) {
    let supervising = SUPERVISING.load(Ordering::SeqCst);

    if supervising != 0 && gettid().as_raw() != supervising {
        // SAFETY: `tgkill` is a plain syscall, and async-signal-safe.
        unsafe { libc::syscall(libc::SYS_tgkill, getpid().as_raw(), supervising, signo) };
        return;
    }

    if signo != libc::SIGCHLD && (1..64).contains(&signo) {
        PENDING.fetch_or(1u64 << signo, Ordering::SeqCst);
    }
}

// Take every noted signal, in ascending signal number.
fn drain() -> Vec<Signal> {
    let bits = PENDING.swap(0, Ordering::SeqCst);
    signals_of(bits).collect()
}

fn signals_of(bits: u64) -> impl Iterator<Item = Signal> {
    (1..64i32)
        .filter(move |&n| bits & (1u64 << n) != 0)
        .filter_map(|n| Signal::try_from(n).ok())
}

/// Signals held blocked on the supervising thread, which a new tracee must not inherit.
///
/// Allocation-free, so it can be built before a `fork()`.
pub(crate) fn held() -> SigSet {
    let bits = INTERCEPTED.load(Ordering::SeqCst);
    let mut set = SigSet::empty();

    for signal in signals_of(bits) {
        set.add(signal);
    }
    if SUPERVISING.load(Ordering::SeqCst) != 0 {
        set.add(Signal::SIGCHLD);
    }

    set
}

/// Source of external signals the event loop should relay.
pub trait SignalSource {
    /// Take every signal noted since the last call, in ascending signal number.
    ///
    /// Repeated arrivals of one signal between calls are reported once, as the kernel does
    /// for standard signals.
    fn take_pending(&mut self) -> Vec<Signal>;

    /// Sleep until a signal arrives, including the `SIGCHLD` of a tracee state change.
    ///
    /// Must return at once if a signal arrived since the last [`take_pending()`](Self::take_pending).
    fn suspend(&mut self) -> nix::Result<()>;
}

/// Relay nothing, and never sleep. For tracers that are never idle, such as scripted ones.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSignals;

impl SignalSource for NoSignals {
    fn take_pending(&mut self) -> Vec<Signal> {
        vec![]
    }

    fn suspend(&mut self) -> nix::Result<()> {
        Ok(())
    }
}

/// Hand out one scripted batch per call.
impl SignalSource for VecDeque<Vec<Signal>> {
    fn take_pending(&mut self) -> Vec<Signal> {
        self.pop_front().unwrap_or_default()
    }

    fn suspend(&mut self) -> nix::Result<()> {
        Ok(())
    }
}

/// Noting handlers for a set of signals, installed for the lifetime of the value.
///
/// Must be installed on the thread that runs the supervisor, and dropped there. Dropping the
/// interceptor restores the dispositions and the thread signal mask it replaced.
///
/// While installed, `SIGCHLD` gets a handler too, and handled signals interrupt blocking
/// calls on other threads with `EINTR`.
pub struct Interceptor {
    previous: Vec<(Signal, SigAction)>,

    // `SIGCHLD` disposition replaced by ours.
    child: Option<SigAction>,

    // Thread mask replaced by ours.
    mask: Option<SigSet>,

    _not_send: PhantomData<*const ()>,
}

impl Interceptor {
    /// Install noting handlers for [`RELAYED_SIGNALS`].
    pub fn install_default() -> Result<Self> {
        Self::install(RELAYED_SIGNALS)
    }

    /// Install noting handlers for `signals`.
    ///
    /// Fails for `SIGKILL` and `SIGSTOP`, which cannot be caught, and for `SIGCHLD`, which
    /// wakes the supervisor. On failure, any handler already installed by this call is
    /// removed again.
    pub fn install(signals: &[Signal]) -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(note_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );

        let mut interceptor = Self {
            previous: Vec::with_capacity(signals.len()),
            child: None,
            mask: None,
            _not_send: PhantomData,
        };

        for &signal in signals {
            if interceptor.intercepts(signal) {
                continue;
            }

            if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP | Signal::SIGCHLD) {
                return Err(Error::Sigaction { signal, source: Errno::EINVAL });
            }

            // SAFETY: the handler only touches atomics and makes async-signal-safe syscalls.
            let previous = unsafe { sigaction(signal, &action) }
                .map_err(|source| Error::Sigaction { signal, source })?;

            interceptor.previous.push((signal, previous));
        }

        // SAFETY: as above.
        let previous = unsafe { sigaction(Signal::SIGCHLD, &action) }
            .map_err(|source| Error::Sigaction { signal: Signal::SIGCHLD, source })?;
        interceptor.child = Some(previous);

        let mask = interceptor.blocked().thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
        interceptor.mask = Some(mask);

        let bits = interceptor.signals().fold(0u64, |bits, s| bits | 1u64 << s as i32);
        INTERCEPTED.store(bits, Ordering::SeqCst);
        SUPERVISING.store(gettid().as_raw(), Ordering::SeqCst);

        info!(signals = interceptor.previous.len(), "intercepting signals for relay");

        Ok(interceptor)
    }

    pub fn intercepts(&self, signal: Signal) -> bool {
        self.previous.iter().any(|(s, _)| *s == signal)
    }

    pub fn signals(&self) -> impl Iterator<Item = Signal> + '_ {
        self.previous.iter().map(|(s, _)| *s)
    }

    // Signals kept blocked on the supervising thread.
    fn blocked(&self) -> SigSet {
        let mut set = SigSet::empty();

        for signal in self.signals() {
            set.add(signal);
        }
        set.add(Signal::SIGCHLD);

        set
    }

    // The thread mask to sleep with: the replaced one, minus everything we intercept.
    fn sleep_mask(&self) -> SigSet {
        let mut mask = self.mask.unwrap_or_else(SigSet::empty);

        for signal in self.signals() {
            mask.remove(signal);
        }
        mask.remove(Signal::SIGCHLD);

        mask
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.signals()).finish()
    }
}

impl SignalSource for Interceptor {
    fn take_pending(&mut self) -> Vec<Signal> {
        // Let through what waits for this thread, so the handler notes it.
        let blocked = self.blocked();

        if let Err(errno) = blocked.thread_unblock().and_then(|()| blocked.thread_block()) {
            debug!(%errno, "unable to take held signals");
        }

        drain()
    }

    fn suspend(&mut self) -> nix::Result<()> {
        let mask = self.sleep_mask();

        // SAFETY: `mask` is a valid, initialized signal set.
        let res = unsafe { libc::sigsuspend(mask.as_ref()) };

        match Errno::result(res) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(errno) => Err(errno),
        }
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        if let Some(mask) = self.mask.take() {
            if let Err(errno) = mask.thread_set_mask() {
                debug!(%errno, "unable to restore signal mask");
            }

            INTERCEPTED.store(0, Ordering::SeqCst);
            SUPERVISING.store(0, Ordering::SeqCst);
        }

        if let Some(previous) = self.child.take() {
            // SAFETY: restores a disposition that was in place before we installed ours.
            if let Err(errno) = unsafe { sigaction(Signal::SIGCHLD, &previous) } {
                debug!(%errno, "unable to restore `SIGCHLD` disposition");
            }
        }

        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: as above.
            if let Err(errno) = unsafe { sigaction(signal, &previous) } {
                debug!(%signal, %errno, "unable to restore signal disposition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use lazy_static::lazy_static;
    use nix::sys::signal::raise;
    use pretty_assertions::assert_eq;

    use super::*;

    lazy_static! {
        // Handlers and the pending mask are process-wide.
        static ref LOCK: Mutex<()> = Mutex::new(());
    }

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn test_catalog_is_catchable() {
        assert_eq!(RELAYED_SIGNALS.len(), 25);
        assert!(!RELAYED_SIGNALS.contains(&Signal::SIGKILL));
        assert!(!RELAYED_SIGNALS.contains(&Signal::SIGSTOP));
        assert!(!RELAYED_SIGNALS.contains(&Signal::SIGCHLD));
    }

    #[test]
    fn test_uncatchable_rejected() {
        let _lock = lock();

        let err = Interceptor::install(&[Signal::SIGUSR2, Signal::SIGKILL]).unwrap_err();
        assert!(matches!(err, Error::Sigaction { signal: Signal::SIGKILL, .. }));

        let err = Interceptor::install(&[Signal::SIGCHLD]).unwrap_err();
        assert!(matches!(err, Error::Sigaction { signal: Signal::SIGCHLD, .. }));
    }

    #[test]
    fn test_raised_signals_are_noted() {
        let _lock = lock();
        drain();

        let mut interceptor = Interceptor::install(&[Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGUSR1]).unwrap();
        assert_eq!(interceptor.signals().count(), 2);
        assert!(interceptor.intercepts(Signal::SIGUSR2));

        raise(Signal::SIGUSR2).unwrap();
        raise(Signal::SIGUSR1).unwrap();
        raise(Signal::SIGUSR1).unwrap();

        // Held blocked until taken.
        assert_eq!(drain(), vec![]);

        assert_eq!(interceptor.take_pending(), vec![Signal::SIGUSR1, Signal::SIGUSR2]);
        assert_eq!(interceptor.take_pending(), vec![]);
    }

    #[test]
    fn test_signal_after_drain_ends_suspend() {
        let _lock = lock();
        drain();

        let mut interceptor = Interceptor::install(&[Signal::SIGUSR1]).unwrap();
        assert_eq!(interceptor.take_pending(), vec![]);

        // Arrives after the drain, before the sleep: the sleep must not miss it.
        raise(Signal::SIGUSR1).unwrap();
        interceptor.suspend().unwrap();

        assert_eq!(interceptor.take_pending(), vec![Signal::SIGUSR1]);
    }

    #[test]
    fn test_held_set() {
        let _lock = lock();

        let interceptor = Interceptor::install(&[Signal::SIGUSR1, Signal::SIGTERM]).unwrap();

        let set = held();
        assert!(set.contains(Signal::SIGUSR1));
        assert!(set.contains(Signal::SIGTERM));
        assert!(set.contains(Signal::SIGCHLD));
        assert!(!set.contains(Signal::SIGINT));

        let mask = SigSet::thread_get_mask().unwrap();
        assert!(mask.contains(Signal::SIGUSR1));
        assert!(mask.contains(Signal::SIGCHLD));

        drop(interceptor);
        assert!(!held().contains(Signal::SIGUSR1));
        assert!(!held().contains(Signal::SIGCHLD));
    }

    #[test]
    fn test_drop_restores_disposition() {
        let _lock = lock();

        let interceptor = Interceptor::install(&[Signal::SIGURG]).unwrap();
        drop(interceptor);

        // Unblocked again, with the default action of ignoring it, so this is not noted.
        drain();
        raise(Signal::SIGURG).unwrap();
        assert_eq!(drain(), vec![]);
        assert!(!SigSet::thread_get_mask().unwrap().contains(Signal::SIGURG));
    }

    #[test]
    fn test_scripted_batches() {
        let mut script: VecDeque<Vec<Signal>> = VecDeque::new();
        script.push_back(vec![]);
        script.push_back(vec![Signal::SIGINT]);

        assert_eq!(script.take_pending(), vec![]);
        assert_eq!(script.take_pending(), vec![Signal::SIGINT]);
        assert_eq!(script.take_pending(), vec![]);
    }
}
