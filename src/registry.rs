//! The set of processes currently under trace.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::ptracer::Pid;
use crate::syscall::SyscallFrame;

/// Where a traced process is in its ptrace lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    // Auto-attached, its attach-stop `SIGSTOP` not yet seen.
    Attaching,

    // Attached, no expectations for next stop.
    Running,

    // Between syscall-enter-stop and syscall-exit-stop.
    Syscalling,
}

/// One process (or thread) under trace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TracedProcess {
    pub pid: Pid,
    pub state: State,

    /// Frame captured at syscall-enter-stop, when syscalls are being logged.
    pub call: Option<SyscallFrame>,
}

impl TracedProcess {
    pub fn new(pid: Pid, state: State) -> Self {
        Self { pid, state, call: None }
    }
}

/// Known tracees, ordered by pid.
///
/// Each entry stands for one held ptrace attachment, so the number of entries is the
/// number of processes that have been attached and not yet seen to exit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Registry {
    tracees: BTreeMap<i32, TracedProcess>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pid`. Returns `false`, leaving the existing entry untouched, if `pid` is
    /// already known.
    pub fn insert(&mut self, pid: Pid, state: State) -> bool {
        if self.tracees.contains_key(&pid.as_raw()) {
            debug!(pid = pid.as_raw(), "ignoring duplicate tracee");
            return false;
        }

        info!(pid = pid.as_raw(), ?state, "adding tracee");
        self.tracees.insert(pid.as_raw(), TracedProcess::new(pid, state));

        true
    }

    /// Forget `pid`. Removing an unknown pid is a no-op.
    pub fn remove(&mut self, pid: Pid) -> Option<TracedProcess> {
        let removed = self.tracees.remove(&pid.as_raw());

        if removed.is_some() {
            info!(pid = pid.as_raw(), remaining = self.tracees.len(), "removing tracee");
        }

        removed
    }

    pub fn get(&self, pid: Pid) -> Option<&TracedProcess> {
        self.tracees.get(&pid.as_raw())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut TracedProcess> {
        self.tracees.get_mut(&pid.as_raw())
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.tracees.contains_key(&pid.as_raw())
    }

    pub fn set_state(&mut self, pid: Pid, state: State) {
        if let Some(tracee) = self.get_mut(pid) {
            debug!(pid = pid.as_raw(), ?state, "setting tracee state");
            tracee.state = state;
        }
    }

    pub fn min(&self) -> Option<Pid> {
        self.tracees.keys().next().copied().map(Pid::from_raw)
    }

    pub fn max(&self) -> Option<Pid> {
        self.tracees.keys().next_back().copied().map(Pid::from_raw)
    }

    pub fn len(&self) -> usize {
        self.tracees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracees.is_empty()
    }

    /// Registered pids, ascending.
    pub fn pids(&self) -> impl DoubleEndedIterator<Item = Pid> + '_ {
        self.tracees.keys().copied().map(Pid::from_raw)
    }

    /// Order in which a relayed signal visits the tree: descending pid.
    ///
    /// Children are usually numbered after their parents, so they are signaled first.
    /// The order is a snapshot; the registry may change while it is walked.
    pub fn relay_order(&self) -> Vec<Pid> {
        self.pids().rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! pid {
        ($raw: expr) => {
            Pid::from_raw($raw)
        };
    }

    fn registry(pids: &[i32]) -> Registry {
        let mut registry = Registry::new();

        for &raw in pids {
            assert!(registry.insert(pid!(raw), State::Running));
        }

        registry
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut registry = registry(&[100]);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(pid!(100)));
        assert_eq!(registry.get(pid!(100)).map(|t| t.state), Some(State::Running));

        assert!(registry.insert(pid!(101), State::Attaching));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(pid!(101)).map(|t| t.state), Some(State::Attaching));

        let removed = registry.remove(pid!(100));
        assert_eq!(removed.map(|t| t.pid), Some(pid!(100)));
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(pid!(100)));
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut registry = registry(&[7, 3, 9]);
        registry.set_state(pid!(3), State::Syscalling);

        assert!(!registry.insert(pid!(3), State::Attaching));
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get(pid!(3)).map(|t| t.state), Some(State::Syscalling));
        assert_eq!(registry.pids().collect::<Vec<_>>(), vec![pid!(3), pid!(7), pid!(9)]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = registry(&[5, 6]);

        assert!(registry.remove(pid!(5)).is_some());
        assert!(registry.remove(pid!(5)).is_none());
        assert!(registry.remove(pid!(42)).is_none());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.min(), Some(pid!(6)));
    }

    #[test]
    fn test_min_max() {
        let registry = registry(&[50, 20, 80, 10, 30]);

        assert_eq!(registry.min(), Some(pid!(10)));
        assert_eq!(registry.max(), Some(pid!(80)));

        let empty = Registry::new();
        assert_eq!(empty.min(), None);
        assert_eq!(empty.max(), None);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_remove_interior_keeps_order() {
        let mut registry = registry(&[50, 20, 80, 10, 30, 70, 90]);

        registry.remove(pid!(50));
        registry.remove(pid!(20));

        assert_eq!(
            registry.pids().collect::<Vec<_>>(),
            vec![pid!(10), pid!(30), pid!(70), pid!(80), pid!(90)],
        );
    }

    #[test]
    fn test_relay_order_is_descending() {
        let registry = registry(&[1000, 1003, 1001, 1002]);

        assert_eq!(
            registry.relay_order(),
            vec![pid!(1003), pid!(1002), pid!(1001), pid!(1000)],
        );
    }
}
