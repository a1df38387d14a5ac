//! x86-64 register transfer through `PTRACE_GETREGS` / `PTRACE_SETREGS`.

use std::mem;

use libc::{pid_t, user_regs_struct};

use super::ptrace::ptrace_call;
use crate::error::MantleResult;
use crate::types::{Architecture, Registers};

/// Raw kernel register block of a stopped thread.
pub(crate) fn get_raw(tid: pid_t) -> MantleResult<user_regs_struct>
{
    #[allow(unsafe_code)]
    // SAFETY: user_regs_struct is plain integers; all-zero is valid.
    let mut raw: user_regs_struct = unsafe { mem::zeroed() };
    ptrace_call!(libc::PTRACE_GETREGS, tid, 0, &mut raw as *mut user_regs_struct)?;
    Ok(raw)
}

/// Replace the kernel register block of a stopped thread.
pub(crate) fn set_raw(tid: pid_t, raw: &user_regs_struct) -> MantleResult<()>
{
    ptrace_call!(libc::PTRACE_SETREGS, tid, 0, raw as *const user_regs_struct)?;
    Ok(())
}

/// Engine view of a kernel register block.
///
/// `general` follows [`crate::types::X86_64Register::index`]: RAX, RBX,
/// RCX, RDX, RSI, RDI, R8..R15.
pub(crate) fn from_raw(raw: &user_regs_struct) -> Registers
{
    let mut registers = Registers::for_arch(Architecture::X86_64);
    registers.pc = raw.rip;
    registers.sp = raw.rsp;
    registers.fp = raw.rbp;
    registers.status = raw.eflags;
    registers.general = vec![
        raw.rax, raw.rbx, raw.rcx, raw.rdx, raw.rsi, raw.rdi, raw.r8, raw.r9, raw.r10, raw.r11, raw.r12, raw.r13,
        raw.r14, raw.r15,
    ];
    registers
}

/// Copy `registers` into `raw`, leaving segment and syscall state alone.
pub(crate) fn apply(raw: &mut user_regs_struct, registers: &Registers)
{
    raw.rip = registers.pc;
    raw.rsp = registers.sp;
    raw.rbp = registers.fp;
    raw.eflags = registers.status;
    let slots = [
        &mut raw.rax,
        &mut raw.rbx,
        &mut raw.rcx,
        &mut raw.rdx,
        &mut raw.rsi,
        &mut raw.rdi,
        &mut raw.r8,
        &mut raw.r9,
        &mut raw.r10,
        &mut raw.r11,
        &mut raw.r12,
        &mut raw.r13,
        &mut raw.r14,
        &mut raw.r15,
    ];
    for (slot, value) in slots.into_iter().zip(registers.general.iter()) {
        *slot = *value;
    }
}

/// Registers of a stopped thread.
pub(crate) fn read(tid: pid_t) -> MantleResult<Registers>
{
    Ok(from_raw(&get_raw(tid)?))
}

/// Write `registers` to a stopped thread.
pub(crate) fn write(tid: pid_t, registers: &Registers) -> MantleResult<()>
{
    let mut raw = get_raw(tid)?;
    apply(&mut raw, registers);
    set_raw(tid, &raw)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::{RegisterId, X86_64Register};

    #[test]
    fn raw_block_round_trips_through_engine_registers()
    {
        #[allow(unsafe_code)]
        let mut raw: user_regs_struct = unsafe { mem::zeroed() };
        raw.rip = 0x40_1000;
        raw.rdi = 7;
        raw.r15 = 15;
        raw.cs = 0x33;

        let mut registers = from_raw(&raw);
        assert_eq!(registers.argument(0), Some(7));
        assert_eq!(registers.get(RegisterId::X86_64(X86_64Register::R15)), Some(15));

        registers.pc = 0x40_2000;
        registers.set_argument(1, 9);
        apply(&mut raw, &registers);
        assert_eq!(raw.rip, 0x40_2000);
        assert_eq!(raw.rsi, 9);
        assert_eq!(raw.cs, 0x33);
    }
}
