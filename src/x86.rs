use nix::sys::ptrace;

use crate::ptracer::Pid;
use crate::syscall::SyscallFrame;

/// Read the syscall frame of a tracee in syscall-stop.
///
/// The kernel keeps the syscall number in `orig_rax`; `rax` only holds the result at
/// syscall-exit-stop. Arguments follow the syscall calling convention, with `r10` in
/// place of `rcx`.
pub(crate) fn syscall_frame(pid: Pid) -> nix::Result<SyscallFrame> {
    let regs = ptrace::getregs(pid)?;

    let args = [
        regs.rdi as i64,
        regs.rsi as i64,
        regs.rdx as i64,
        regs.r10 as i64,
        regs.r8 as i64,
        regs.r9 as i64,
    ];
    let frame = SyscallFrame::new(regs.orig_rax as i64, args);

    Ok(frame.returning(regs.rax as i64))
}
