//! # mantle-core
//!
//! Live-process introspection engine for a managed runtime.
//!
//! This crate provides:
//! - Domain-tagged target addresses and typed memory reads
//! - An incremental store of the runtime's symbol tables (modules, methods,
//!   line tables) updated while the target runs
//! - Breakpoints that bind when their module or method is loaded
//! - Per-thread execution control: stepping, finish, continue, runtime calls
//! - A snapshot backend for offline inspection of saved images
//!
//! ## Platform Support
//!
//! - **Linux x86-64**: `ptrace` (see [`platform::linux`])
//! - **Anywhere**: snapshots through [`memory::ProcessSnapshot`]
//!
//! ## Why unsafe code is needed
//!
//! The Linux backend calls `ptrace(2)`, `waitpid(2)` and `kill(2)` directly.
//! Each call is wrapped in a safe function next to it; nothing outside
//! [`platform`] uses `unsafe`.

#![allow(unsafe_code)] // Required for ptrace and waitpid

pub mod arch;
pub mod breakpoints;
pub mod error;
pub mod events;
pub mod memory;
pub mod notifications;
pub mod platform;
pub mod session;
pub mod symbols;
pub mod target;
pub mod thread;
pub mod types;

pub use breakpoints::{BreakpointDefinition, BreakpointId, BreakpointInfo, BreakpointLocation, BreakpointManager};
// Re-export commonly used types
pub use error::{MantleError, MantleResult};
pub use events::{DebuggerEvent, EventBus};
pub use memory::{MemoryAccessor, MemoryBlob, ProcessSnapshot, TargetMemoryInfo};
pub use notifications::{Notification, NotificationDispatcher};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use platform::linux::LinuxProcess;
pub use session::{RuntimeHooks, Session, SessionConfig};
pub use symbols::SymbolStore;
pub use target::{ProcessControl, ResumeMode, TargetEvent, TargetHandle};
pub use thread::{SharedServant, StepMode, StopEvent, ThreadServant, ThreadState};
pub use types::{AddressDomain, ProcessId, Registers, StopReason, TargetAddress, ThreadId};
