use std::env;
use std::ffi::{CString, NulError, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::{
    sys::{signal::{raise, sigprocmask, SigmaskHow, Signal}, ptrace},
    unistd::{fork, ForkResult, Pid},
};

use crate::error::Error;
use crate::signals;


/// Exit code of a child that could not be turned into the requested program.
pub const EXEC_FAILED: i32 = 127;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Command to spawn as the root of a traced process tree.
#[derive(Clone, Debug)]
pub struct Command {
    /// Argument vector to pass to `execv()`.
    argv: Vec<CString>,

    /// Executable to `execv()`, resolved against `PATH` if `argv[0]` has no `/`.
    program: CString,
}

impl Command {
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self, NulError> {
        if argv.is_empty() {
            panic!("Command exe required");
        }

        // Ensure we own NUL-terminated strings to for the foreign exec call.
        //
        // We're heap-allocating, so always do this before forking.
        let argv: Result<Vec<_>, _> = argv
            .into_iter()
            .map(CString::new)
            .collect();
        let argv = argv?;

        let program = resolve(&argv[0]);

        Ok(Self { argv, program })
    }

    /// The argument vector, including the program name.
    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// The executable path that will be passed to `execv()`.
    pub fn program(&self) -> &CString {
        &self.program
    }

    /// Fork and exec a child process determined by `self.argv`.
    ///
    /// The child sets itself as a tracee of the parent, then raises `SIGSTOP` so the parent
    /// can set trace options before the new image runs. It does not inherit the signals the
    /// parent holds blocked for relay. If any of this fails, the child exits with
    /// [`EXEC_FAILED`], which the parent observes as an ordinary exit.
    pub fn fork_exec(&self) -> Result<Pid, Error> {
        // Heap-allocates, must occur pre-fork.
        let argv = self.argv_ptrs();
        let unblock = signals::held();

        // SAFETY: the child only makes async-signal-safe calls before `execv()` or `_exit()`.
        let forked = unsafe { fork() };

        match forked {
            Ok(ForkResult::Child) => {
                // No `?` or `panic!` from here on: both may allocate, which is not
                // async-signal-safe in a forked child.
                if ptrace::traceme().is_err()
                    || sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None).is_err()
                    || raise(Signal::SIGSTOP).is_err()
                {
                    unsafe { libc::_exit(EXEC_FAILED) }
                }

                // Use unsafe `libc::execv`, because the `nix` wrapper heap- allocates a
                // `Vec` internally, which is not async-signal-safe.
                unsafe {
                    libc::execv(self.program.as_ptr(), argv.as_ptr());
                    libc::_exit(EXEC_FAILED)
                }
            },
            Ok(ForkResult::Parent { child }) => {
                Ok(child)
            },
            Err(source) => {
                let program = self.program.to_string_lossy().into_owned();
                Err(Error::Spawn { program, source })
            },
        }
    }

    // Construct NUL-terminated arguments for `execv`. We heap-allocate to return a `Vec`,
    // and so must do this before calling `fork()`.
    fn argv_ptrs(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<_> = self.argv
            .iter()
            .map(|s| s.as_ptr())
            .collect();
        argv.push(std::ptr::null());
        argv
    }
}

// Find `name` in `PATH` the way `execvp()` would, falling back to `name` itself so that
// a missing program fails at `execv()` in the child.
fn resolve(name: &CString) -> CString {
    let bytes = name.as_bytes();

    if bytes.is_empty() || bytes.contains(&b'/') {
        return name.clone();
    }

    let path = env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into());

    for dir in env::split_paths(&path) {
        let candidate = dir.join(OsStr::from_bytes(bytes));

        if is_executable(&candidate) {
            if let Ok(found) = CString::new(candidate.as_os_str().as_bytes()) {
                return found;
            }
        }
    }

    name.clone()
}

fn is_executable(path: &Path) -> bool {
    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_searches_path() {
        let cmd = Command::new(vec!["sh", "-c", "true"]).unwrap();
        let program = cmd.program().to_str().unwrap();

        assert!(program.starts_with('/'), "unresolved: {program}");
        assert!(program.ends_with("/sh"));
        assert_eq!(cmd.argv().len(), 3);
    }

    #[test]
    fn test_resolve_keeps_paths() {
        let cmd = Command::new(vec!["./not/here"]).unwrap();
        assert_eq!(cmd.program().to_str().unwrap(), "./not/here");
    }

    #[test]
    fn test_resolve_missing_program() {
        let cmd = Command::new(vec!["treetrace-no-such-program"]).unwrap();
        assert_eq!(cmd.program().to_str().unwrap(), "treetrace-no-such-program");
    }

    #[test]
    fn test_interior_nul() {
        assert!(Command::new(vec!["tr\0ue"]).is_err());
    }

    #[test]
    #[should_panic]
    fn test_empty_argv() {
        let argv: Vec<String> = vec![];
        let _ = Command::new(argv);
    }
}
