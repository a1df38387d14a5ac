//! Architecture-specific stack and call conventions.
//!
//! Only what stepping and backtraces need: where a function returns to, how
//! to recognise that a single step entered a call, and one step of a
//! frame-pointer unwind.

use crate::error::{MantleError, MantleResult};
use crate::memory::MemoryAccessor;
use crate::types::{Architecture, Registers, TargetAddress};

// Longest x86-64 instruction.
const X86_MAX_INSTRUCTION: u64 = 15;
const ARM64_INSTRUCTION: u64 = 4;

/// Caller state recovered from a frame record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerFrame
{
    /// Return address into the caller
    pub return_address: u64,
    /// Caller's frame pointer
    pub fp: u64,
    /// Caller's stack pointer after the return
    pub sp: u64,
}

/// Return address of a function whose first instruction has not run yet.
///
/// ## Errors
///
/// Memory errors, or [`MantleError::Unsupported`] for unknown architectures.
pub fn return_address_at_entry<M: MemoryAccessor + ?Sized>(memory: &M, registers: &Registers) -> MantleResult<TargetAddress>
{
    let info = memory.memory_info();
    match registers.architecture() {
        Architecture::X86_64 => memory.read_address(&info.address(registers.sp)),
        Architecture::Arm64 => registers
            .link_register()
            .map(|lr| info.address(lr))
            .ok_or_else(|| MantleError::invariant("arm64 register set without x30")),
        Architecture::Unknown(name) => Err(MantleError::Unsupported(format!("return address on {name}"))),
    }
}

/// If the instruction executed between `before` and `after` was a call,
/// the address it will return to.
///
/// ## Errors
///
/// Memory errors while reading the pushed return address.
pub fn entered_call<M: MemoryAccessor + ?Sized>(memory: &M, before: &Registers, after: &Registers) -> MantleResult<Option<u64>>
{
    match after.architecture() {
        Architecture::X86_64 => {
            if after.sp != before.sp.wrapping_sub(8) {
                return Ok(None);
            }
            let info = memory.memory_info();
            let pushed = memory.read_address(&info.address(after.sp))?.value();
            let fallthrough = pushed > before.pc && pushed <= before.pc + X86_MAX_INSTRUCTION;
            Ok((fallthrough && after.pc != pushed).then_some(pushed))
        }
        Architecture::Arm64 => {
            let expected = before.pc + ARM64_INSTRUCTION;
            let linked = after.link_register() == Some(expected) && before.link_register() != Some(expected);
            Ok((linked && after.pc != expected).then_some(expected))
        }
        Architecture::Unknown(_) => Ok(None),
    }
}

/// Follow the frame record at `fp`: `[fp]` holds the caller's frame pointer
/// and `[fp + P]` the return address. `None` at the end of the chain.
///
/// ## Errors
///
/// Memory errors while reading the record.
pub fn unwind_frame_pointer<M: MemoryAccessor + ?Sized>(memory: &M, fp: u64) -> MantleResult<Option<CallerFrame>>
{
    if fp == 0 {
        return Ok(None);
    }
    let info = memory.memory_info();
    let width = u64::from(info.address_size);
    let record = info.address(fp);
    let caller_fp = memory.read_address(&record)?.value();
    let return_address = memory.read_address(&(&record + width as i64))?.value();
    if return_address == 0 {
        return Ok(None);
    }
    Ok(Some(CallerFrame {
        return_address,
        fp: caller_fp,
        sp: fp + 2 * width,
    }))
}
