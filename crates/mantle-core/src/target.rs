//! # Process Control
//!
//! [`ProcessControl`] is what a backend must provide on top of
//! [`MemoryAccessor`]: thread enumeration, execution control, software
//! breakpoints and event delivery. Backends are single-owner objects; the
//! engine shares one through a [`TargetHandle`], the only path to the target.
//!
//! ## Locking
//!
//! [`TargetHandle`] serializes every backend call behind one process-scoped
//! mutex. Waiting for a stop never holds that mutex for longer than one poll
//! interval, so memory reads from other callers and interrupt requests get
//! through while a thread is running. Events for a thread other than the one
//! being waited for are parked in per-thread mailboxes and handed out when
//! that thread is next resumed or waited on.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{MantleError, MantleResult};
use crate::memory::{MemoryAccessor, TargetMemoryInfo};
use crate::types::{Architecture, MemoryRegion, ProcessId, Registers, StopReason, TargetAddress, ThreadId};

/// How a stopped thread should be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode
{
    /// Run until the next event.
    Continue,
    /// Execute exactly one machine instruction.
    SingleStep,
}

/// Backend identifier of an inserted software breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendBreakpointId(u64);

impl BackendBreakpointId
{
    /// Create from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Raw value.
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for BackendBreakpointId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.0)
    }
}

/// A stop (or exit) observed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetEvent
{
    /// Thread the event belongs to.
    pub thread: ThreadId,
    /// What happened.
    pub reason: StopReason,
    /// `true` when the whole process is gone, not just this thread.
    pub process_exited: bool,
}

impl TargetEvent
{
    /// Event for a single thread.
    #[must_use]
    pub const fn new(thread: ThreadId, reason: StopReason) -> Self
    {
        Self {
            thread,
            reason,
            process_exited: false,
        }
    }

    /// Exit of the whole process, reported against `thread`.
    #[must_use]
    pub const fn process_exit(thread: ThreadId, reason: StopReason) -> Self
    {
        Self {
            thread,
            reason,
            process_exited: true,
        }
    }
}

/// Execution control for one target process.
pub trait ProcessControl: MemoryAccessor + Send
{
    /// OS process id, if the target is a live process.
    fn process_id(&self) -> Option<ProcessId>;

    /// CPU architecture of the target.
    fn architecture(&self) -> Architecture;

    /// `false` for targets that can never run (snapshots).
    fn supports_execution(&self) -> bool
    {
        true
    }

    /// Threads currently known to the backend.
    ///
    /// ## Errors
    ///
    /// Fails if the thread list cannot be read.
    fn threads(&self) -> MantleResult<Vec<ThreadId>>;

    /// Resume one stopped thread.
    ///
    /// ## Errors
    ///
    /// [`MantleError::ReadOnly`] on snapshots; backend errors otherwise.
    fn resume(&mut self, thread: ThreadId, mode: ResumeMode) -> MantleResult<()>;

    /// Wait up to `timeout` for the next event of any thread.
    ///
    /// ## Errors
    ///
    /// Backend errors.
    fn poll_event(&mut self, timeout: Duration) -> MantleResult<Option<TargetEvent>>;

    /// Ask every running thread to stop; each reports
    /// [`StopReason::Interrupted`].
    ///
    /// ## Errors
    ///
    /// Backend errors.
    fn interrupt(&mut self) -> MantleResult<()>;

    /// Insert a software breakpoint at `address`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::ReadOnly`] on snapshots; memory errors otherwise.
    fn insert_breakpoint(&mut self, address: &TargetAddress) -> MantleResult<BackendBreakpointId>;

    /// Remove a breakpoint inserted by [`Self::insert_breakpoint`].
    ///
    /// ## Errors
    ///
    /// Fails if the id is unknown or the original bytes cannot be restored.
    fn remove_breakpoint(&mut self, id: BackendBreakpointId) -> MantleResult<()>;

    /// Run `function(args...)` on `thread` and return its integer result.
    /// Registers are restored afterward.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Unsupported`] unless the backend overrides this.
    fn call_function(&mut self, thread: ThreadId, function: &TargetAddress, args: &[u64]) -> MantleResult<u64>
    {
        let _ = (thread, args);
        Err(MantleError::Unsupported(format!("calling {function} is not supported by this backend")))
    }

    /// Release the target, leaving it running.
    ///
    /// ## Errors
    ///
    /// Backend errors.
    fn detach(&mut self) -> MantleResult<()>;

    /// Terminate the target.
    ///
    /// ## Errors
    ///
    /// Backend errors.
    fn kill(&mut self) -> MantleResult<()>;
}

struct Shared
{
    backend: Mutex<Box<dyn ProcessControl>>,
    mailboxes: Mutex<HashMap<ThreadId, VecDeque<TargetEvent>>>,
    exit: Mutex<Option<StopReason>>,
    info: TargetMemoryInfo,
    architecture: Architecture,
    writable: bool,
    executable: bool,
    interrupt_requested: AtomicBool,
}

/// Cloneable, lock-protected handle to a backend.
#[derive(Clone)]
pub struct TargetHandle
{
    shared: Arc<Shared>,
}

impl fmt::Debug for TargetHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("TargetHandle")
            .field("architecture", &self.shared.architecture)
            .field("info", &self.shared.info)
            .field("writable", &self.shared.writable)
            .finish_non_exhaustive()
    }
}

impl TargetHandle
{
    /// Take ownership of `backend`.
    #[must_use]
    pub fn new(backend: Box<dyn ProcessControl>) -> Self
    {
        let info = backend.memory_info();
        let architecture = backend.architecture();
        let writable = backend.can_write();
        let executable = backend.supports_execution();
        Self {
            shared: Arc::new(Shared {
                backend: Mutex::new(backend),
                mailboxes: Mutex::new(HashMap::new()),
                exit: Mutex::new(None),
                info,
                architecture,
                writable,
                executable,
                interrupt_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Run `f` with exclusive access to the backend.
    ///
    /// ## Errors
    ///
    /// Whatever `f` returns; [`MantleError::Internal`] if the lock is
    /// poisoned.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn ProcessControl) -> MantleResult<R>) -> MantleResult<R>
    {
        let mut guard = self.shared.backend.lock()?;
        f(guard.as_mut())
    }

    /// Architecture of the target.
    #[must_use]
    pub fn architecture(&self) -> Architecture
    {
        self.shared.architecture
    }

    /// `false` for snapshots.
    #[must_use]
    pub fn supports_execution(&self) -> bool
    {
        self.shared.executable
    }

    /// Exit status once the process is gone.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the lock is poisoned.
    pub fn exit_status(&self) -> MantleResult<Option<StopReason>>
    {
        Ok(*self.shared.exit.lock()?)
    }

    /// Take the oldest parked event for `thread`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the lock is poisoned.
    pub fn take_pending(&self, thread: ThreadId) -> MantleResult<Option<TargetEvent>>
    {
        let mut mailboxes = self.shared.mailboxes.lock()?;
        Ok(mailboxes.get_mut(&thread).and_then(VecDeque::pop_front))
    }

    /// Threads that have parked events.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the lock is poisoned.
    pub fn threads_with_pending_events(&self) -> MantleResult<Vec<ThreadId>>
    {
        let mailboxes = self.shared.mailboxes.lock()?;
        let mut threads: Vec<ThreadId> = mailboxes.iter().filter(|(_, q)| !q.is_empty()).map(|(t, _)| *t).collect();
        threads.sort();
        Ok(threads)
    }

    /// Drop the events parked for `thread` once it is gone.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the lock is poisoned.
    pub fn forget_thread(&self, thread: ThreadId) -> MantleResult<()>
    {
        if let Some(dropped) = self.shared.mailboxes.lock()?.remove(&thread) {
            if !dropped.is_empty() {
                debug!(%thread, count = dropped.len(), "dropping parked events of departed thread");
            }
        }
        Ok(())
    }

    fn park(&self, event: TargetEvent) -> MantleResult<()>
    {
        trace!(thread = %event.thread, reason = ?event.reason, "parking event for another thread");
        self.shared.mailboxes.lock()?.entry(event.thread).or_default().push_back(event);
        Ok(())
    }

    fn record_exit(&self, reason: StopReason) -> MantleResult<()>
    {
        *self.shared.exit.lock()? = Some(reason);
        self.shared.mailboxes.lock()?.clear();
        Ok(())
    }

    /// Resume `thread` and block until its next event.
    ///
    /// If an event for `thread` was parked while another thread was being
    /// waited on, the thread never actually ran again and that event is
    /// returned without resuming.
    ///
    /// ## Errors
    ///
    /// Backend errors from resuming or polling.
    pub fn resume_and_wait(&self, thread: ThreadId, mode: ResumeMode, poll_interval: Duration) -> MantleResult<TargetEvent>
    {
        if let Some(reason) = self.exit_status()? {
            return Ok(TargetEvent::process_exit(thread, reason));
        }
        if let Some(event) = self.take_pending(thread)? {
            debug!(%thread, reason = ?event.reason, "delivering parked event instead of resuming");
            return Ok(event);
        }
        self.with(|backend| backend.resume(thread, mode))?;
        self.wait_for_thread(thread, poll_interval)
    }

    /// Block until `thread` reports an event.
    ///
    /// The process lock is released between polls.
    ///
    /// ## Errors
    ///
    /// Backend errors from polling.
    pub fn wait_for_thread(&self, thread: ThreadId, poll_interval: Duration) -> MantleResult<TargetEvent>
    {
        loop {
            if let Some(reason) = self.exit_status()? {
                return Ok(TargetEvent::process_exit(thread, reason));
            }
            if let Some(event) = self.take_pending(thread)? {
                return Ok(event);
            }
            let polled = self.with(|backend| backend.poll_event(poll_interval))?;
            let Some(event) = polled else {
                continue;
            };
            if event.reason == StopReason::Interrupted {
                self.shared.interrupt_requested.store(false, Ordering::SeqCst);
            }
            if event.process_exited {
                self.record_exit(event.reason)?;
                return Ok(TargetEvent::process_exit(thread, event.reason));
            }
            if event.thread == thread {
                return Ok(event);
            }
            self.park(event)?;
        }
    }

    /// Ask the target to stop. Threads blocked in
    /// [`Self::resume_and_wait`] return with [`StopReason::Interrupted`].
    ///
    /// ## Errors
    ///
    /// Backend errors.
    pub fn interrupt(&self) -> MantleResult<()>
    {
        self.shared.interrupt_requested.store(true, Ordering::SeqCst);
        self.with(|backend| backend.interrupt())
    }

    /// `true` between an interrupt request and the first interrupted stop.
    #[must_use]
    pub fn interrupt_requested(&self) -> bool
    {
        self.shared.interrupt_requested.load(Ordering::SeqCst)
    }

    /// Insert a breakpoint.
    ///
    /// ## Errors
    ///
    /// See [`ProcessControl::insert_breakpoint`].
    pub fn insert_breakpoint(&self, address: &TargetAddress) -> MantleResult<BackendBreakpointId>
    {
        self.with(|backend| backend.insert_breakpoint(address))
    }

    /// Remove a breakpoint.
    ///
    /// ## Errors
    ///
    /// See [`ProcessControl::remove_breakpoint`].
    pub fn remove_breakpoint(&self, id: BackendBreakpointId) -> MantleResult<()>
    {
        self.with(|backend| backend.remove_breakpoint(id))
    }

    /// Threads known to the backend.
    ///
    /// ## Errors
    ///
    /// See [`ProcessControl::threads`].
    pub fn threads(&self) -> MantleResult<Vec<ThreadId>>
    {
        self.with(|backend| backend.threads())
    }
}

impl MemoryAccessor for TargetHandle
{
    fn memory_info(&self) -> TargetMemoryInfo
    {
        self.shared.info.clone()
    }

    fn read_buffer(&self, address: &TargetAddress, size: usize) -> MantleResult<Vec<u8>>
    {
        self.with(|backend| backend.read_buffer(address, size))
    }

    fn write_buffer(&mut self, address: &TargetAddress, data: &[u8]) -> MantleResult<()>
    {
        self.with(|backend| backend.write_buffer(address, data))
    }

    fn can_write(&self) -> bool
    {
        self.shared.writable
    }

    fn read_registers(&self, thread: ThreadId) -> MantleResult<Registers>
    {
        self.with(|backend| backend.read_registers(thread))
    }

    fn write_registers(&mut self, thread: ThreadId, registers: &Registers) -> MantleResult<()>
    {
        self.with(|backend| backend.write_registers(thread, registers))
    }

    fn memory_maps(&self) -> MantleResult<Vec<MemoryRegion>>
    {
        self.with(|backend| backend.memory_maps())
    }
}
