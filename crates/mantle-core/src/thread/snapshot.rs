//! Servant for threads of a process snapshot.

use std::sync::{Arc, Mutex};

use crate::error::{MantleError, MantleResult};
use crate::memory::{MemoryAccessor, MemoryBlob};
use crate::symbols::SymbolStore;
use crate::target::TargetHandle;
use crate::thread::{compute_frame, unwind, StepMode, StopEvent, ThreadServant, ThreadState};
use crate::types::{Registers, StackFrame, TargetAddress, ThreadId};

/// A thread frozen in a snapshot.
///
/// Inspection works exactly as for a live thread. Every operation that
/// would run code or change state fails with [`MantleError::ReadOnly`].
#[derive(Debug)]
pub struct SnapshotThread
{
    thread: ThreadId,
    target: TargetHandle,
    symbols: Arc<Mutex<SymbolStore>>,
    max_backtrace_depth: usize,
    frame: Option<StackFrame>,
}

impl SnapshotThread
{
    /// Servant for `thread` of the snapshot behind `target`.
    #[must_use]
    pub fn new(thread: ThreadId, target: TargetHandle, symbols: Arc<Mutex<SymbolStore>>, max_backtrace_depth: usize) -> Self
    {
        Self {
            thread,
            target,
            symbols,
            max_backtrace_depth,
            frame: None,
        }
    }

    fn read_only<T>(address: u64) -> MantleResult<T>
    {
        Err(MantleError::ReadOnly { address })
    }
}

impl ThreadServant for SnapshotThread
{
    fn id(&self) -> ThreadId
    {
        self.thread
    }

    fn state(&self) -> ThreadState
    {
        ThreadState::Stopped
    }

    fn step_mode(&self) -> StepMode
    {
        StepMode::Run
    }

    fn current_frame(&mut self) -> MantleResult<StackFrame>
    {
        if let Some(frame) = &self.frame {
            return Ok(frame.clone());
        }
        let frame = compute_frame(&self.target, &self.symbols, self.thread)?;
        self.frame = Some(frame.clone());
        Ok(frame)
    }

    fn backtrace(&mut self, max_depth: usize) -> MantleResult<Vec<StackFrame>>
    {
        let first = self.current_frame()?;
        unwind(&self.target, &self.symbols, first, max_depth.min(self.max_backtrace_depth).max(1))
    }

    fn registers(&self) -> MantleResult<Registers>
    {
        self.target.read_registers(self.thread)
    }

    fn set_registers(&mut self, _registers: &Registers) -> MantleResult<()>
    {
        Self::read_only(0)
    }

    fn read_memory(&self, address: &TargetAddress, size: usize) -> MantleResult<MemoryBlob>
    {
        self.target.read_memory(address, size)
    }

    fn write_memory(&mut self, address: &TargetAddress, _data: &[u8]) -> MantleResult<()>
    {
        Self::read_only(address.value())
    }

    fn step_instruction(&mut self, _over_calls: bool) -> MantleResult<StopEvent>
    {
        Self::read_only(0)
    }

    fn step_line(&mut self, _over_calls: bool) -> MantleResult<StopEvent>
    {
        Self::read_only(0)
    }

    fn finish(&mut self) -> MantleResult<StopEvent>
    {
        Self::read_only(0)
    }

    fn continue_execution(&mut self) -> MantleResult<StopEvent>
    {
        Self::read_only(0)
    }

    fn background(&mut self, _until: Option<TargetAddress>) -> MantleResult<StopEvent>
    {
        Self::read_only(0)
    }

    fn call_method(&mut self, function: &TargetAddress, _args: &[u64]) -> MantleResult<u64>
    {
        Self::read_only(function.value())
    }

    fn stop(&self) -> MantleResult<()>
    {
        Ok(())
    }
}
