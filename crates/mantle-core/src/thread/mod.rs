//! # Thread Control
//!
//! One [`ThreadServant`] per target thread. A servant owns the thread's
//! execution state, its step mode and its cached current frame, and turns
//! client commands into backend resumes.
//!
//! ```text
//!   NoTarget --attach--> Stopped <--stop event-- Running
//!                           |                      ^
//!                           +------resume----------+
//!                           |
//!                           +--exit--> Exited
//! ```
//!
//! Two implementations exist: [`engine::SteppingEngine`] for targets that can
//! run, and [`snapshot::SnapshotThread`] for read-only snapshots, where every
//! control command fails with [`MantleError::ReadOnly`].

pub mod engine;
pub mod snapshot;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::arch;
use crate::breakpoints::BreakpointId;
use crate::error::{MantleError, MantleResult};
use crate::memory::{MemoryAccessor, MemoryBlob};
use crate::symbols::SymbolStore;
use crate::target::TargetHandle;
use crate::types::{FrameStatus, Registers, StackFrame, StopReason, TargetAddress, ThreadId};

/// Execution state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState
{
    /// Not attached to anything.
    NoTarget,
    /// Executing; registers and frames are unavailable.
    Running,
    /// Stopped; registers and frames may be inspected.
    Stopped,
    /// Gone. Terminal.
    Exited,
}

impl fmt::Display for ThreadState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            ThreadState::NoTarget => write!(f, "not attached"),
            ThreadState::Running => write!(f, "running"),
            ThreadState::Stopped => write!(f, "stopped"),
            ThreadState::Exited => write!(f, "exited"),
        }
    }
}

/// What the last control command asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepMode
{
    /// Run freely until the next reported stop.
    Run,
    /// One machine instruction.
    StepInstruction
    {
        /// Run called functions to completion
        over_calls: bool,
    },
    /// Until the address leaves the current source line.
    StepLine
    {
        /// Run called functions to completion
        over_calls: bool,
    },
    /// Until `until` (or any reported stop).
    Background
    {
        /// Target address
        until: Option<TargetAddress>,
    },
    /// Until the current method returns.
    Finish,
}

/// A stop reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopEvent
{
    /// Thread that stopped.
    pub thread: ThreadId,
    /// Why.
    pub reason: StopReason,
    /// Client breakpoints responsible, if any.
    pub breakpoints: Vec<BreakpointId>,
    /// Current frame, unless it could not be computed.
    pub frame: Option<StackFrame>,
}

/// Per-thread control contract.
pub trait ThreadServant: Send
{
    /// Thread id.
    fn id(&self) -> ThreadId;

    /// Execution state.
    fn state(&self) -> ThreadState;

    /// Mode of the last control command.
    fn step_mode(&self) -> StepMode;

    /// Innermost frame, cached until the thread runs again.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidState`] unless stopped; memory errors if the
    /// frame cannot be computed.
    fn current_frame(&mut self) -> MantleResult<StackFrame>;

    /// Frames from innermost outwards, at most `max_depth`.
    ///
    /// ## Errors
    ///
    /// As for [`Self::current_frame`]. Unwinding stops quietly at the first
    /// unreadable frame record.
    fn backtrace(&mut self, max_depth: usize) -> MantleResult<Vec<StackFrame>>;

    /// Register state.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidState`] unless stopped.
    fn registers(&self) -> MantleResult<Registers>;

    /// Replace the register state.
    ///
    /// ## Errors
    ///
    /// [`MantleError::ReadOnly`] on snapshots.
    fn set_registers(&mut self, registers: &Registers) -> MantleResult<()>;

    /// Read target memory on behalf of this thread.
    ///
    /// ## Errors
    ///
    /// Memory errors.
    fn read_memory(&self, address: &TargetAddress, size: usize) -> MantleResult<MemoryBlob>;

    /// Write target memory on behalf of this thread.
    ///
    /// ## Errors
    ///
    /// Memory errors; [`MantleError::ReadOnly`] on snapshots.
    fn write_memory(&mut self, address: &TargetAddress, data: &[u8]) -> MantleResult<()>;

    /// Execute one instruction.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidState`] unless stopped; backend errors.
    fn step_instruction(&mut self, over_calls: bool) -> MantleResult<StopEvent>;

    /// Execute until the current source line is left.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidState`] unless stopped; backend errors.
    fn step_line(&mut self, over_calls: bool) -> MantleResult<StopEvent>;

    /// Run until the current method returns to its caller.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidState`] unless stopped; backend errors.
    fn finish(&mut self) -> MantleResult<StopEvent>;

    /// Run until the next reported stop.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidState`] unless stopped; backend errors.
    fn continue_execution(&mut self) -> MantleResult<StopEvent>;

    /// Run until `until` is reached or another stop is reported.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidState`] unless stopped; backend errors.
    fn background(&mut self, until: Option<TargetAddress>) -> MantleResult<StopEvent>;

    /// Call `function(args...)` in the target on this thread.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidState`] unless stopped; backend errors.
    fn call_method(&mut self, function: &TargetAddress, args: &[u64]) -> MantleResult<u64>;

    /// Ask the running thread to stop. The running command then returns
    /// with [`StopReason::Interrupted`].
    ///
    /// ## Errors
    ///
    /// Backend errors.
    fn stop(&self) -> MantleResult<()>;
}

/// A servant behind its own lock.
pub type SharedServant = Arc<Mutex<Box<dyn ThreadServant>>>;

/// Servants of a session by thread id.
#[derive(Clone, Default)]
pub struct ThreadRegistry
{
    servants: Arc<Mutex<BTreeMap<ThreadId, SharedServant>>>,
}

impl fmt::Debug for ThreadRegistry
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let ids = self.ids().unwrap_or_default();
        f.debug_struct("ThreadRegistry").field("threads", &ids).finish()
    }
}

impl ThreadRegistry
{
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Servant of `thread`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::InvalidArgument`] for unknown threads.
    pub fn get(&self, thread: ThreadId) -> MantleResult<SharedServant>
    {
        self.servants
            .lock()?
            .get(&thread)
            .cloned()
            .ok_or_else(|| MantleError::InvalidArgument(format!("unknown thread {thread}")))
    }

    /// Register `thread` unless it is already known; `make` builds its
    /// servant. Returns `true` if it was added.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the lock is poisoned.
    pub fn insert_with(&self, thread: ThreadId, make: impl FnOnce() -> Box<dyn ThreadServant>) -> MantleResult<bool>
    {
        let mut servants = self.servants.lock()?;
        if servants.contains_key(&thread) {
            return Ok(false);
        }
        servants.insert(thread, Arc::new(Mutex::new(make())));
        Ok(true)
    }

    /// Forget `thread`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the lock is poisoned.
    pub fn remove(&self, thread: ThreadId) -> MantleResult<bool>
    {
        Ok(self.servants.lock()?.remove(&thread).is_some())
    }

    /// Known thread ids.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the lock is poisoned.
    pub fn ids(&self) -> MantleResult<Vec<ThreadId>>
    {
        Ok(self.servants.lock()?.keys().copied().collect())
    }

    /// Forget every thread.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the lock is poisoned.
    pub fn clear(&self) -> MantleResult<()>
    {
        self.servants.lock()?.clear();
        Ok(())
    }
}

/// Describe the code at `pc` as a frame of `thread`.
///
/// Method and line come from the symbol store; a method-less address still
/// yields a frame. `lookup_pc` is the address used for symbol lookup, which
/// for caller frames is inside the call instruction rather than after it.
fn describe_frame(
    symbols: &Mutex<SymbolStore>,
    thread: ThreadId,
    index: usize,
    pc: TargetAddress,
    lookup_pc: &TargetAddress,
    sp: u64,
    fp: u64,
    status: FrameStatus,
) -> MantleResult<StackFrame>
{
    let store = symbols.lock()?;
    let (method, method_name, source) = match store.lookup_method(lookup_pc) {
        Some(found) => {
            let source = found.line_table().lookup_by_address(lookup_pc)?;
            (Some(found.handle()), Some(found.name().to_owned()), source)
        }
        None => (None, None, None),
    };
    Ok(StackFrame {
        thread,
        index,
        pc,
        sp,
        fp,
        method,
        method_name,
        source,
        status,
    })
}

/// Innermost frame of a stopped thread.
pub(crate) fn compute_frame(target: &TargetHandle, symbols: &Mutex<SymbolStore>, thread: ThreadId) -> MantleResult<StackFrame>
{
    let registers = target.read_registers(thread)?;
    let pc = target.memory_info().address(registers.pc);
    describe_frame(symbols, thread, 0, pc.clone(), &pc, registers.sp, registers.fp, FrameStatus::Registers)
}

/// Frame-pointer backtrace starting at `first`.
pub(crate) fn unwind(
    target: &TargetHandle,
    symbols: &Mutex<SymbolStore>,
    first: StackFrame,
    max_depth: usize,
) -> MantleResult<Vec<StackFrame>>
{
    let info = target.memory_info();
    let thread = first.thread;
    let mut fp = first.fp;
    let mut frames = vec![first];
    while frames.len() < max_depth {
        let caller = match arch::unwind_frame_pointer(target, fp) {
            Ok(Some(caller)) => caller,
            Ok(None) => break,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::debug!(%thread, fp = format_args!("0x{fp:x}"), error = %err, "unwind stopped");
                break;
            }
        };
        let pc = info.address(caller.return_address);
        let lookup = &pc - 1;
        frames.push(describe_frame(
            symbols,
            thread,
            frames.len(),
            pc,
            &lookup,
            caller.sp,
            caller.fp,
            FrameStatus::FramePointer,
        )?);
        // The stack grows down; a caller frame below this one is garbage.
        if caller.fp <= fp {
            break;
        }
        fp = caller.fp;
    }
    Ok(frames)
}
