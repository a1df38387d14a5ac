//! CPU register types and access.

use super::Architecture;

/// Identifier for a specific CPU register
///
/// `Pc`, `Sp`, `Fp` and `Status` exist on every architecture; the
/// architecture-specific variants address the general-purpose file.
///
/// ## Example
///
/// ```rust
/// use mantle_core::types::{Arm64Register, RegisterId, X86_64Register};
///
/// let pc = RegisterId::Pc;
/// let x0 = RegisterId::Arm64(Arm64Register::X(0));
/// let rdi = RegisterId::X86_64(X86_64Register::Rdi);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterId
{
    /// Program counter (RIP on x86-64)
    Pc,
    /// Stack pointer (RSP on x86-64)
    Sp,
    /// Frame pointer (X29 on ARM64, RBP on x86-64)
    Fp,
    /// Status/flags register (CPSR / RFLAGS)
    Status,
    /// ARM64 general-purpose register
    Arm64(Arm64Register),
    /// x86-64 general-purpose register
    X86_64(X86_64Register),
}

/// ARM64 general-purpose register identifier (X0-X30, X30 is the link register)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arm64Register
{
    /// General-purpose register X0-X30
    X(u8),
}

/// x86-64 general-purpose register identifier
///
/// RSP, RBP and RIP are accessed via `RegisterId::Sp`, `RegisterId::Fp` and
/// `RegisterId::Pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86_64Register
{
    /// RAX - return value register
    Rax,
    /// RBX
    Rbx,
    /// RCX - fourth integer argument
    Rcx,
    /// RDX - third integer argument
    Rdx,
    /// RSI - second integer argument
    Rsi,
    /// RDI - first integer argument
    Rdi,
    /// R8 - fifth integer argument
    R8,
    /// R9 - sixth integer argument
    R9,
    /// R10
    R10,
    /// R11
    R11,
    /// R12
    R12,
    /// R13
    R13,
    /// R14
    R14,
    /// R15
    R15,
}

impl X86_64Register
{
    /// Index of this register in `Registers::general`.
    ///
    /// - RAX = 0, RBX = 1, RCX = 2, RDX = 3
    /// - RSI = 4, RDI = 5
    /// - R8 = 6 .. R15 = 13
    #[must_use]
    pub const fn index(self) -> usize
    {
        match self {
            X86_64Register::Rax => 0,
            X86_64Register::Rbx => 1,
            X86_64Register::Rcx => 2,
            X86_64Register::Rdx => 3,
            X86_64Register::Rsi => 4,
            X86_64Register::Rdi => 5,
            X86_64Register::R8 => 6,
            X86_64Register::R9 => 7,
            X86_64Register::R10 => 8,
            X86_64Register::R11 => 9,
            X86_64Register::R12 => 10,
            X86_64Register::R13 => 11,
            X86_64Register::R14 => 12,
            X86_64Register::R15 => 13,
        }
    }

    /// System V integer argument registers, in order.
    pub const ARGUMENTS: [X86_64Register; 6] = [
        X86_64Register::Rdi,
        X86_64Register::Rsi,
        X86_64Register::Rdx,
        X86_64Register::Rcx,
        X86_64Register::R8,
        X86_64Register::R9,
    ];
}

/// Register state of one thread.
///
/// ## Example
///
/// ```rust
/// use mantle_core::types::{Architecture, Registers};
///
/// let mut regs = Registers::for_arch(Architecture::X86_64);
/// regs.set_argument(0, 7);
/// assert_eq!(regs.argument(0), Some(7));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers
{
    /// Program counter
    pub pc: u64,
    /// Stack pointer
    pub sp: u64,
    /// Frame pointer
    pub fp: u64,
    /// General-purpose registers (31 on ARM64, 14 on x86-64)
    pub general: Vec<u64>,
    /// Status/flags register
    pub status: u64,
    architecture: Architecture,
}

impl Registers
{
    /// Create an empty register set with no architecture.
    #[must_use]
    pub fn new() -> Self
    {
        Self {
            pc: 0,
            sp: 0,
            fp: 0,
            general: Vec::new(),
            status: 0,
            architecture: Architecture::Unknown("unknown"),
        }
    }

    /// Zeroed register set sized for `architecture`.
    #[must_use]
    pub fn for_arch(architecture: Architecture) -> Self
    {
        let count = match architecture {
            Architecture::Arm64 => 31,
            Architecture::X86_64 => 14,
            Architecture::Unknown(_) => 0,
        };
        Self {
            general: vec![0; count],
            ..Self::new().with_arch(architecture)
        }
    }

    /// Set the CPU architecture for this register set
    #[must_use]
    pub fn with_arch(mut self, architecture: Architecture) -> Self
    {
        self.architecture = architecture;
        self
    }

    /// CPU architecture of this register set
    #[must_use]
    pub const fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Value of a register, `None` if it does not exist for this
    /// architecture.
    #[must_use]
    pub fn get(&self, id: RegisterId) -> Option<u64>
    {
        match id {
            RegisterId::Pc => Some(self.pc),
            RegisterId::Sp => Some(self.sp),
            RegisterId::Fp => Some(self.fp),
            RegisterId::Status => Some(self.status),
            RegisterId::Arm64(Arm64Register::X(idx)) => {
                if self.architecture != Architecture::Arm64 {
                    return None;
                }
                self.general.get(idx as usize).copied()
            }
            RegisterId::X86_64(reg) => {
                if self.architecture != Architecture::X86_64 {
                    return None;
                }
                self.general.get(reg.index()).copied()
            }
        }
    }

    /// Set a register, `None` if it does not exist for this architecture.
    pub fn set(&mut self, id: RegisterId, value: u64) -> Option<()>
    {
        match id {
            RegisterId::Pc => self.pc = value,
            RegisterId::Sp => self.sp = value,
            RegisterId::Fp => self.fp = value,
            RegisterId::Status => self.status = value,
            RegisterId::Arm64(Arm64Register::X(idx)) => {
                if self.architecture != Architecture::Arm64 {
                    return None;
                }
                *self.general.get_mut(idx as usize)? = value;
            }
            RegisterId::X86_64(reg) => {
                if self.architecture != Architecture::X86_64 {
                    return None;
                }
                *self.general.get_mut(reg.index())? = value;
            }
        }
        Some(())
    }

    fn argument_register(&self, index: usize) -> Option<RegisterId>
    {
        match self.architecture {
            Architecture::X86_64 => X86_64Register::ARGUMENTS.get(index).map(|r| RegisterId::X86_64(*r)),
            Architecture::Arm64 if index < 8 => Some(RegisterId::Arm64(Arm64Register::X(index as u8))),
            _ => None,
        }
    }

    /// Integer argument `index` of the calling convention, read at function
    /// entry.
    #[must_use]
    pub fn argument(&self, index: usize) -> Option<u64>
    {
        self.get(self.argument_register(index)?)
    }

    /// Set integer argument `index`.
    pub fn set_argument(&mut self, index: usize, value: u64) -> Option<()>
    {
        let id = self.argument_register(index)?;
        self.set(id, value)
    }

    /// Integer return value register (RAX / X0).
    #[must_use]
    pub fn return_value(&self) -> Option<u64>
    {
        match self.architecture {
            Architecture::X86_64 => self.get(RegisterId::X86_64(X86_64Register::Rax)),
            Architecture::Arm64 => self.get(RegisterId::Arm64(Arm64Register::X(0))),
            Architecture::Unknown(_) => None,
        }
    }

    /// Link register (X30) on architectures that have one.
    #[must_use]
    pub fn link_register(&self) -> Option<u64>
    {
        self.get(RegisterId::Arm64(Arm64Register::X(30)))
    }
}

impl Default for Registers
{
    fn default() -> Self
    {
        Self::new()
    }
}
