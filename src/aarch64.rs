use nix::errno::Errno;

use crate::ptracer::Pid;
use crate::syscall::SyscallFrame;

/// Linux constant defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: i32 = 0x1;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64
}

fn registers(pid: Pid) -> nix::Result<user_pt_regs> {
    let mut data = std::mem::MaybeUninit::<user_pt_regs>::uninit();
    let mut rv = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: std::mem::size_of::<user_pt_regs>(),
    };

    let res = unsafe {
        libc::ptrace(libc::PTRACE_GETREGSET, pid.as_raw(), NT_PRSTATUS, &mut rv as *mut _ as *mut libc::c_void)
    };

    Errno::result(res)?;

    Ok(unsafe { data.assume_init() })
}

/// Read the syscall frame of a tracee in syscall-stop.
///
/// The syscall number is in `x8`. `x0` holds the first argument at syscall-enter-stop and
/// the result at syscall-exit-stop.
pub(crate) fn syscall_frame(pid: Pid) -> nix::Result<SyscallFrame> {
    let regs = registers(pid)?;

    let mut args = [0i64; 6];
    for (arg, reg) in args.iter_mut().zip(regs.regs.iter()) {
        *arg = *reg as i64;
    }
    let frame = SyscallFrame::new(regs.regs[8] as i64, args);

    Ok(frame.returning(regs.regs[0] as i64))
}
