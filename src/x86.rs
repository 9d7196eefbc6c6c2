//! x86-64 syscall ABI.
//!
//! At a syscall-stop the syscall number is in `orig_rax` (the kernel has
//! already clobbered `rax` with `-ENOSYS` on entry, and with the result on
//! exit), and the six argument slots are `rdi`, `rsi`, `rdx`, `r10`, `r8`,
//! `r9`.

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

pub(crate) fn syscall_number(regs: &Registers) -> i64 {
    regs.orig_rax as i64
}

pub(crate) fn args(regs: &Registers) -> [u64; 6] {
    [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9]
}

pub(crate) fn set_arg(regs: &mut Registers, index: usize, value: u64) {
    match index {
        0 => regs.rdi = value,
        1 => regs.rsi = value,
        2 => regs.rdx = value,
        3 => regs.r10 = value,
        4 => regs.r8 = value,
        5 => regs.r9 = value,
        _ => unreachable!("syscall argument index out of range"),
    }
}

pub(crate) fn return_value(regs: &Registers) -> i64 {
    regs.rax as i64
}

pub(crate) fn set_return_value(regs: &mut Registers, value: i64) {
    regs.rax = value as u64;
}

pub(crate) fn instruction_pointer(regs: &Registers) -> u64 {
    regs.rip
}
