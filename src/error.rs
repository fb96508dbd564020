use std::io;

use nix::errno::Errno;

use crate::ptracer::{Pid, Restart, Signal};


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not spawn tracee `{program}`")]
    Spawn {
        program: String,
        source: nix::Error,
    },

    #[error("Could not wait on tracees")]
    Wait { source: nix::Error },

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not detach from tracee = {pid}")]
    Detach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not restart tracee = {pid} with mode = {mode:?}")]
    Restart { pid: Pid, mode: Restart, source: nix::Error },

    #[error("Could not set trace options on tracee = {pid}")]
    Options {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not read event message of tracee = {pid}")]
    EventMessage {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not install handler for {signal}")]
    Sigaction {
        signal: Signal,
        source: nix::Error,
    },

    #[error("Tracee died while stopped, pid = {pid}")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the error means the tracee no longer exists.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

pub(crate) trait ResultExt<T> {
    /// Map an `ESRCH` from a request on a stopped tracee to [`Error::TraceeDied`].
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::OS(source)
            }
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err(crate::error::Error::Internal($msg.into()))
    };
}
