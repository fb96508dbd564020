//! Raw syscall frames, as read from a tracee in syscall-stop.

use std::fmt;

/// Syscall number, its six argument registers, and (once known) its result.
///
/// No decoding is done: every value is shown as a signed machine word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyscallFrame {
    pub nr: i64,
    pub args: [i64; 6],
    pub ret: Option<i64>,
}

impl SyscallFrame {
    pub fn new(nr: i64, args: [i64; 6]) -> Self {
        Self { nr, args, ret: None }
    }

    /// The same call, completed with `ret`.
    pub fn returning(self, ret: impl Into<Option<i64>>) -> Self {
        Self { ret: ret.into(), ..self }
    }
}

impl fmt::Display for SyscallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.nr)?;

        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }

        match self.ret {
            Some(ret) => write!(f, ") = {ret}"),
            None => f.write_str(") = ?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_completed() {
        let frame = SyscallFrame::new(0, [3, 140737488346112, 832, 0, 0, -1]).returning(832);
        assert_eq!(frame.to_string(), "0(3, 140737488346112, 832, 0, 0, -1) = 832");
    }

    #[test]
    fn test_display_unknown_result() {
        let frame = SyscallFrame::new(231, [0; 6]);
        assert_eq!(frame.to_string(), "231(0, 0, 0, 0, 0, 0) = ?");
    }
}
