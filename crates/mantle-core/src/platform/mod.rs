//! # Platform Backends
//!
//! Live-process implementations of [`crate::target::ProcessControl`].
//!
//! - **Linux x86-64**: `ptrace` with `PTRACE_SEIZE`, software breakpoints
//!   through `INT3`, memory through `/proc/<pid>/mem`
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//!
//! Snapshots need no platform support and live in
//! [`crate::memory::snapshot`].

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;
