//! # Stepping Engine
//!
//! [`ThreadServant`] for targets that can run.
//!
//! Every control command resumes the thread one or more times and blocks
//! until the backend reports a stop for it. Each stop is handled the same
//! way: the cached frame is dropped, runtime notifications are applied,
//! the symbol store is brought up to date, and the new frame is computed.
//! Only then does the active step mode decide whether the stop is reported
//! or the thread silently resumed:
//!
//! - runtime notification stops always resume silently;
//! - breakpoint hits outside the breakpoint's thread group, or still within
//!   its ignore count, resume silently;
//! - `StepLine` keeps single-stepping while the program counter stays inside
//!   the source line it started on;
//! - an interrupt ends any command.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::arch;
use crate::breakpoints::{BreakpointId, BreakpointManager, HitDisposition};
use crate::error::{MantleError, MantleResult};
use crate::events::{DebuggerEvent, EventBus};
use crate::memory::{MemoryAccessor, MemoryBlob};
use crate::notifications::{DispatchOutcome, NotificationDispatcher};
use crate::session::SessionConfig;
use crate::symbols::SymbolStore;
use crate::target::{ResumeMode, TargetEvent, TargetHandle};
use crate::thread::{compute_frame, unwind, StepMode, StopEvent, ThreadRegistry, ThreadServant, ThreadState};
use crate::types::{Registers, StackFrame, StopReason, TargetAddress, ThreadId};

/// Shared collaborators of every engine in a session.
#[derive(Debug, Clone)]
pub struct EngineContext
{
    /// The target
    pub target: TargetHandle,
    /// Symbol store
    pub symbols: Arc<Mutex<SymbolStore>>,
    /// Client breakpoints
    pub breakpoints: Arc<BreakpointManager>,
    /// Runtime notification handling
    pub dispatcher: Arc<NotificationDispatcher>,
    /// Event fan-out
    pub events: EventBus,
    /// Servants of all threads
    pub registry: ThreadRegistry,
    /// Limits and timing
    pub config: SessionConfig,
}

#[derive(Debug, Clone)]
enum FrameCache
{
    Invalid,
    Valid(StackFrame),
    Failed(String),
}

// How a single stop is treated by the active command.
#[derive(Debug)]
enum Classified
{
    Step,
    Silent,
    Temporary,
    Report
    {
        reason: StopReason,
        breakpoints: Vec<BreakpointId>,
    },
    Exited(StopReason),
}

/// Controls one thread of a live target.
#[derive(Debug)]
pub struct SteppingEngine
{
    thread: ThreadId,
    ctx: EngineContext,
    state: ThreadState,
    mode: StepMode,
    frame: FrameCache,
}

impl SteppingEngine
{
    /// Engine for `thread`, currently in `state`.
    #[must_use]
    pub fn new(thread: ThreadId, ctx: EngineContext, state: ThreadState) -> Self
    {
        Self {
            thread,
            ctx,
            state,
            mode: StepMode::Run,
            frame: FrameCache::Invalid,
        }
    }

    fn require_stopped(&self) -> MantleResult<()>
    {
        if self.state == ThreadState::Stopped {
            Ok(())
        } else {
            Err(MantleError::InvalidState {
                expected: "stopped",
                actual: self.state.to_string(),
            })
        }
    }

    fn begin(&mut self, mode: StepMode) -> MantleResult<()>
    {
        self.require_stopped()?;
        debug!(thread = %self.thread, ?mode, "control command");
        self.mode = mode;
        self.ctx.events.publish(DebuggerEvent::TargetResumed { thread: self.thread });
        Ok(())
    }

    fn read_registers(&self) -> MantleResult<Registers>
    {
        self.ctx.target.read_registers(self.thread)
    }

    fn resume_once(&mut self, mode: ResumeMode, temporary: Option<&TargetAddress>) -> MantleResult<Classified>
    {
        self.state = ThreadState::Running;
        self.frame = FrameCache::Invalid;
        let event = match self
            .ctx
            .target
            .resume_and_wait(self.thread, mode, self.ctx.config.poll_interval)
        {
            Ok(event) => event,
            Err(err) => {
                self.state = ThreadState::Stopped;
                return Err(err);
            }
        };
        self.classify(event, temporary)
    }

    fn classify(&mut self, event: TargetEvent, temporary: Option<&TargetAddress>) -> MantleResult<Classified>
    {
        trace!(thread = %self.thread, reason = ?event.reason, "stop");
        if event.process_exited || event.reason.is_terminal() {
            self.state = ThreadState::Exited;
            if event.process_exited {
                self.ctx.events.publish(DebuggerEvent::TargetExited { reason: event.reason });
            } else {
                self.ctx.target.forget_thread(self.thread)?;
                self.ctx.events.publish(DebuggerEvent::ThreadExited { thread: self.thread });
            }
            return Ok(Classified::Exited(event.reason));
        }

        self.state = ThreadState::Stopped;
        let classified = match event.reason {
            StopReason::Breakpoint(raw) => {
                let address = self.ctx.target.memory_info().address(raw);
                if self.ctx.dispatcher.is_notification(&address) {
                    self.handle_notification()?;
                    Classified::Silent
                } else if temporary == Some(&address) {
                    // A client breakpoint at the same address still counts the hit.
                    match self.ctx.breakpoints.hits_at(&address, self.thread)? {
                        HitDisposition::Report(breakpoints) => Classified::Report {
                            reason: event.reason,
                            breakpoints,
                        },
                        HitDisposition::Ignored | HitDisposition::NotOurs => Classified::Temporary,
                    }
                } else {
                    match self.ctx.breakpoints.hits_at(&address, self.thread)? {
                        HitDisposition::Report(breakpoints) => Classified::Report {
                            reason: event.reason,
                            breakpoints,
                        },
                        HitDisposition::Ignored => Classified::Silent,
                        HitDisposition::NotOurs => Classified::Report {
                            reason: event.reason,
                            breakpoints: Vec::new(),
                        },
                    }
                }
            }
            StopReason::Step => Classified::Step,
            reason => Classified::Report {
                reason,
                breakpoints: Vec::new(),
            },
        };
        self.after_stop()?;
        Ok(classified)
    }

    fn handle_notification(&mut self) -> MantleResult<()>
    {
        match self.ctx.dispatcher.dispatch_from_registers(self.thread) {
            Ok(DispatchOutcome::Handled) => {}
            Ok(DispatchOutcome::ThreadCreated(thread)) => {
                let ctx = self.ctx.clone();
                self.ctx.registry.insert_with(thread, || {
                    Box::new(SteppingEngine::new(thread, ctx, ThreadState::Stopped))
                })?;
            }
            Ok(DispatchOutcome::ThreadExited(thread)) => {
                if thread != self.thread {
                    self.ctx.registry.remove(thread)?;
                    self.ctx.target.forget_thread(thread)?;
                }
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => warn!(thread = %self.thread, error = %err, "runtime notification failed"),
        }
        Ok(())
    }

    fn after_stop(&mut self) -> MantleResult<()>
    {
        self.ctx.dispatcher.refresh()?;
        self.frame = match compute_frame(&self.ctx.target, &self.ctx.symbols, self.thread) {
            Ok(frame) => FrameCache::Valid(frame),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                debug!(thread = %self.thread, error = %err, "current frame unavailable");
                FrameCache::Failed(err.to_string())
            }
        };
        Ok(())
    }

    fn frame_or_compute(&mut self) -> MantleResult<StackFrame>
    {
        if let FrameCache::Valid(frame) = &self.frame {
            return Ok(frame.clone());
        }
        match compute_frame(&self.ctx.target, &self.ctx.symbols, self.thread) {
            Ok(frame) => {
                self.frame = FrameCache::Valid(frame.clone());
                Ok(frame)
            }
            Err(err) => {
                self.frame = FrameCache::Failed(err.to_string());
                Err(err)
            }
        }
    }

    fn current_pc(&self) -> MantleResult<u64>
    {
        match &self.frame {
            FrameCache::Valid(frame) => Ok(frame.pc.value()),
            FrameCache::Invalid | FrameCache::Failed(_) => Ok(self.read_registers()?.pc),
        }
    }

    fn report(&mut self, reason: StopReason, breakpoints: Vec<BreakpointId>) -> StopEvent
    {
        let frame = match &self.frame {
            FrameCache::Valid(frame) => Some(frame.clone()),
            FrameCache::Invalid | FrameCache::Failed(_) => None,
        };
        self.ctx.events.publish(DebuggerEvent::TargetStopped {
            reason,
            thread: Some(self.thread),
            breakpoints: breakpoints.clone(),
        });
        StopEvent {
            thread: self.thread,
            reason,
            breakpoints,
            frame,
        }
    }

    fn conclude(&mut self, classified: Classified) -> StopEvent
    {
        match classified {
            Classified::Step | Classified::Silent | Classified::Temporary => self.report(StopReason::Step, Vec::new()),
            Classified::Report { reason, breakpoints } => self.report(reason, breakpoints),
            Classified::Exited(reason) => StopEvent {
                thread: self.thread,
                reason,
                breakpoints: Vec::new(),
                frame: None,
            },
        }
    }

    fn run_to(&mut self, address: Option<&TargetAddress>, sp_at_least: Option<u64>) -> MantleResult<Classified>
    {
        let temporary = match address {
            Some(address) => Some(self.ctx.target.insert_breakpoint(address)?),
            None => None,
        };
        let result = self.run_loop(address, sp_at_least);
        if let Some(id) = temporary {
            if self.state != ThreadState::Exited {
                if let Err(err) = self.ctx.target.remove_breakpoint(id) {
                    warn!(thread = %self.thread, %id, error = %err, "could not remove temporary breakpoint");
                }
            }
        }
        result
    }

    fn run_loop(&mut self, address: Option<&TargetAddress>, sp_at_least: Option<u64>) -> MantleResult<Classified>
    {
        loop {
            match self.resume_once(ResumeMode::Continue, address)? {
                Classified::Step | Classified::Silent => {}
                Classified::Temporary => {
                    if let Some(minimum) = sp_at_least {
                        // A deeper activation returned through the same address.
                        if self.read_registers()?.sp < minimum {
                            continue;
                        }
                    }
                    return Ok(Classified::Temporary);
                }
                other => return Ok(other),
            }
        }
    }

    fn step_over_call(&mut self, before: &Registers, classified: Classified) -> MantleResult<Classified>
    {
        if !matches!(classified, Classified::Step | Classified::Silent) {
            return Ok(classified);
        }
        let after = self.read_registers()?;
        match arch::entered_call(&self.ctx.target, before, &after)? {
            Some(return_address) => {
                trace!(thread = %self.thread, return_address = format_args!("0x{return_address:x}"), "stepping over call");
                let address = self.ctx.target.memory_info().address(return_address);
                self.run_to(Some(&address), Some(before.sp))
            }
            None => Ok(classified),
        }
    }

    fn single_step(&mut self, over_calls: bool) -> MantleResult<Classified>
    {
        let before = self.read_registers()?;
        let classified = self.resume_once(ResumeMode::SingleStep, None)?;
        if over_calls {
            self.step_over_call(&before, classified)
        } else {
            Ok(classified)
        }
    }

    fn return_address(&mut self, registers: &Registers) -> MantleResult<TargetAddress>
    {
        let info = self.ctx.target.memory_info();
        let pc = info.address(registers.pc);
        let at_entry = {
            let store = self.ctx.symbols.lock()?;
            store.lookup_method(&pc).is_some_and(|method| method.start() == &pc)
        };
        if at_entry {
            return arch::return_address_at_entry(&self.ctx.target, registers);
        }
        let caller = arch::unwind_frame_pointer(&self.ctx.target, registers.fp)?
            .ok_or_else(|| MantleError::LocationInvalid(format!("no caller frame above {pc}")))?;
        Ok(info.address(caller.return_address))
    }
}

impl ThreadServant for SteppingEngine
{
    fn id(&self) -> ThreadId
    {
        self.thread
    }

    fn state(&self) -> ThreadState
    {
        self.state
    }

    fn step_mode(&self) -> StepMode
    {
        self.mode.clone()
    }

    fn current_frame(&mut self) -> MantleResult<StackFrame>
    {
        self.require_stopped()?;
        self.frame_or_compute()
    }

    fn backtrace(&mut self, max_depth: usize) -> MantleResult<Vec<StackFrame>>
    {
        let first = self.current_frame()?;
        let depth = max_depth.min(self.ctx.config.max_backtrace_depth).max(1);
        unwind(&self.ctx.target, &self.ctx.symbols, first, depth)
    }

    fn registers(&self) -> MantleResult<Registers>
    {
        self.require_stopped()?;
        self.read_registers()
    }

    fn set_registers(&mut self, registers: &Registers) -> MantleResult<()>
    {
        self.require_stopped()?;
        self.frame = FrameCache::Invalid;
        self.ctx
            .target
            .with(|backend| backend.write_registers(self.thread, registers))
    }

    fn read_memory(&self, address: &TargetAddress, size: usize) -> MantleResult<MemoryBlob>
    {
        self.ctx.target.read_memory(address, size)
    }

    fn write_memory(&mut self, address: &TargetAddress, data: &[u8]) -> MantleResult<()>
    {
        self.ctx.target.with(|backend| backend.write_buffer(address, data))
    }

    fn step_instruction(&mut self, over_calls: bool) -> MantleResult<StopEvent>
    {
        self.begin(StepMode::StepInstruction { over_calls })?;
        let classified = self.single_step(over_calls)?;
        Ok(self.conclude(classified))
    }

    fn step_line(&mut self, over_calls: bool) -> MantleResult<StopEvent>
    {
        self.begin(StepMode::StepLine { over_calls })?;
        let start = match self.frame_or_compute() {
            Ok(frame) if frame.source.is_some() => frame,
            _ => {
                debug!(thread = %self.thread, "no line information; stepping one instruction");
                let classified = self.single_step(over_calls)?;
                return Ok(self.conclude(classified));
            }
        };

        for _ in 0..self.ctx.config.max_step_iterations {
            let classified = self.single_step(over_calls)?;
            if matches!(classified, Classified::Report { .. } | Classified::Exited(_)) {
                return Ok(self.conclude(classified));
            }
            if !start.same_line(self.current_pc()?) {
                return Ok(self.conclude(Classified::Step));
            }
        }
        warn!(
            thread = %self.thread,
            limit = self.ctx.config.max_step_iterations,
            "line step did not leave the line; stopping"
        );
        Ok(self.conclude(Classified::Step))
    }

    fn finish(&mut self) -> MantleResult<StopEvent>
    {
        self.begin(StepMode::Finish)?;
        let registers = self.read_registers()?;
        let return_address = self.return_address(&registers)?;
        let classified = self.run_to(Some(&return_address), Some(registers.sp.saturating_add(1)))?;
        Ok(self.conclude(classified))
    }

    fn continue_execution(&mut self) -> MantleResult<StopEvent>
    {
        self.begin(StepMode::Run)?;
        let classified = self.run_to(None, None)?;
        Ok(self.conclude(classified))
    }

    fn background(&mut self, until: Option<TargetAddress>) -> MantleResult<StopEvent>
    {
        self.begin(StepMode::Background { until: until.clone() })?;
        let classified = self.run_to(until.as_ref(), None)?;
        Ok(self.conclude(classified))
    }

    fn call_method(&mut self, function: &TargetAddress, args: &[u64]) -> MantleResult<u64>
    {
        self.require_stopped()?;
        debug!(thread = %self.thread, %function, argc = args.len(), "calling into target");
        self.frame = FrameCache::Invalid;
        let thread = self.thread;
        self.ctx
            .target
            .with(|backend| backend.call_function(thread, function, args))
    }

    fn stop(&self) -> MantleResult<()>
    {
        self.ctx.target.interrupt()
    }
}
