//! # Linux Debugging Implementation
//!
//! Linux x86-64 backend built on `ptrace(2)`.
//!
//! - **Attach**: `PTRACE_SEIZE` every thread listed in `/proc/<pid>/task`,
//!   with `PTRACE_O_TRACECLONE` so threads started later are traced too,
//!   then `PTRACE_INTERRUPT` to stop them
//! - **Memory**: `/proc/<pid>/mem`, which reads and writes whole ranges in
//!   one call and can patch read-only code pages
//! - **Registers**: `PTRACE_GETREGS` / `PTRACE_SETREGS`
//! - **Breakpoints**: `INT3` traps, stepped over transparently on resume
//!
//! Every ptrace request is issued from one dedicated tracer thread (see
//! [`tracer`]); [`LinuxProcess`] only forwards jobs to it.
//!
//! ## Permissions
//!
//! With Yama enabled (`/proc/sys/kernel/yama/ptrace_scope` = 1), attaching
//! to a process that is not a descendant needs `CAP_SYS_PTRACE`. Failures
//! surface as [`MantleError::PermissionDenied`].
//!
//! ## References
//!
//! - [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - [proc_pid_mem(5) man page](https://man7.org/linux/man-pages/man5/proc_pid_mem.5.html)

mod breakpoints;
mod memory;
mod ptrace;
mod registers;
mod tracer;

use std::time::Duration;

use tracing::info;

use self::tracer::Tracer;
use crate::error::{MantleError, MantleResult};
use crate::memory::{MemoryAccessor, TargetMemoryInfo};
use crate::target::{BackendBreakpointId, ProcessControl, ResumeMode, TargetEvent};
use crate::types::{Architecture, MemoryRegion, ProcessId, Registers, TargetAddress, ThreadId};

/// A live process traced with ptrace.
#[derive(Debug)]
pub struct LinuxProcess
{
    pid: ProcessId,
    tracer: Tracer,
    info: TargetMemoryInfo,
}

impl LinuxProcess
{
    /// Attach to `pid` and stop all of its threads.
    ///
    /// ## Errors
    ///
    /// - [`MantleError::ProcessNotFound`]: no such process
    /// - [`MantleError::PermissionDenied`]: ptrace is not allowed
    /// - [`MantleError::AttachFailed`]: anything else during attach
    pub fn attach(pid: ProcessId) -> MantleResult<Self>
    {
        let raw = libc::pid_t::try_from(u32::from(pid))
            .map_err(|_| MantleError::InvalidArgument(format!("pid {pid} out of range")))?;
        let tracer = Tracer::spawn(raw)?;
        info!(%pid, "ptrace backend ready");
        Ok(Self {
            pid,
            tracer,
            info: TargetMemoryInfo::for_architecture(Architecture::X86_64),
        })
    }
}

impl MemoryAccessor for LinuxProcess
{
    fn memory_info(&self) -> TargetMemoryInfo
    {
        self.info.clone()
    }

    fn read_buffer(&self, address: &TargetAddress, size: usize) -> MantleResult<Vec<u8>>
    {
        let address = address.value();
        self.tracer.run(move |state| state.read(address, size))
    }

    fn write_buffer(&mut self, address: &TargetAddress, data: &[u8]) -> MantleResult<()>
    {
        self.check_address(address, data.len())?;
        let address = address.value();
        let data = data.to_vec();
        self.tracer.run(move |state| state.write(address, &data))
    }

    fn can_write(&self) -> bool
    {
        true
    }

    fn read_registers(&self, thread: ThreadId) -> MantleResult<Registers>
    {
        self.tracer.run(move |state| state.read_registers(thread))
    }

    fn write_registers(&mut self, thread: ThreadId, registers: &Registers) -> MantleResult<()>
    {
        let registers = registers.clone();
        self.tracer.run(move |state| state.write_registers(thread, &registers))
    }

    fn memory_maps(&self) -> MantleResult<Vec<MemoryRegion>>
    {
        self.tracer.run(|state| state.memory_maps())
    }
}

impl ProcessControl for LinuxProcess
{
    fn process_id(&self) -> Option<ProcessId>
    {
        Some(self.pid)
    }

    fn architecture(&self) -> Architecture
    {
        Architecture::X86_64
    }

    fn threads(&self) -> MantleResult<Vec<ThreadId>>
    {
        self.tracer.run(|state| Ok(state.threads()))
    }

    fn resume(&mut self, thread: ThreadId, mode: ResumeMode) -> MantleResult<()>
    {
        self.tracer.run(move |state| state.resume(thread, mode))
    }

    fn poll_event(&mut self, timeout: Duration) -> MantleResult<Option<TargetEvent>>
    {
        self.tracer.run(move |state| state.poll_event(timeout))
    }

    fn interrupt(&mut self) -> MantleResult<()>
    {
        self.tracer.run(|state| state.interrupt())
    }

    fn insert_breakpoint(&mut self, address: &TargetAddress) -> MantleResult<BackendBreakpointId>
    {
        self.check_address(address, 1)?;
        let address = address.value();
        self.tracer.run(move |state| state.insert_breakpoint(address))
    }

    fn remove_breakpoint(&mut self, id: BackendBreakpointId) -> MantleResult<()>
    {
        self.tracer.run(move |state| state.remove_breakpoint(id))
    }

    fn call_function(&mut self, thread: ThreadId, function: &TargetAddress, args: &[u64]) -> MantleResult<u64>
    {
        self.check_address(function, 1)?;
        let function = function.value();
        let args = args.to_vec();
        self.tracer.run(move |state| state.call_function(thread, function, &args))
    }

    fn detach(&mut self) -> MantleResult<()>
    {
        let detached = self.tracer.run(|state| state.detach());
        self.tracer.shutdown();
        detached
    }

    fn kill(&mut self) -> MantleResult<()>
    {
        let killed = self.tracer.run(|state| state.kill());
        self.tracer.shutdown();
        killed
    }
}
