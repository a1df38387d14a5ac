//! # Types
//!
//! Value types shared by every layer of the engine.

pub mod address;
pub mod process;
pub mod registers;
pub mod stack;
pub mod symbols;

pub use address::{AddressDomain, TargetAddress};
pub use process::{Architecture, MemoryRegion, ProcessId, StopReason, ThreadId};
pub use registers::{Arm64Register, RegisterId, Registers, X86_64Register};
pub use stack::{FrameStatus, StackFrame};
pub use symbols::{LoadCallbackId, MethodHandle, ModuleHandle, SourceAddress};
