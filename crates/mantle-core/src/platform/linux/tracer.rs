//! # Tracer Thread
//!
//! The kernel accepts ptrace requests for a tracee only from the thread that
//! seized it. [`Tracer`] owns one OS thread that seizes every thread of the
//! process and then runs each job sent to it, in order, against the
//! [`TracerState`].
//!
//! ## Stop decoding
//!
//! - `PTRACE_EVENT_CLONE`: a new thread; it is adopted and both threads run on
//! - `PTRACE_EVENT_STOP`: the initial stop of an adopted thread (resumed
//!   quietly), or the answer to `PTRACE_INTERRUPT` (reported as
//!   [`StopReason::Interrupted`])
//! - `SIGTRAP` after `PTRACE_SINGLESTEP`: [`StopReason::Step`]
//! - `SIGTRAP` right after one of our traps: the program counter is rewound
//!   onto the trap and [`StopReason::Breakpoint`] reported
//! - anything else: [`StopReason::Signal`], delivered on the next resume

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use libc::pid_t;
use tracing::{debug, info, trace, warn};

use super::breakpoints::TrapTable;
use super::memory::{self, ProcMemory};
use super::ptrace::{self, ptrace_call, WaitStatus};
use super::registers;
use crate::error::{MantleError, MantleResult};
use crate::target::{BackendBreakpointId, ResumeMode, TargetEvent};
use crate::types::{MemoryRegion, Registers, StopReason, ThreadId};

const POLL_SLICE: Duration = Duration::from_millis(1);
// System V red zone below the stack pointer.
const RED_ZONE: u64 = 128;
const MAX_CALL_ARGUMENTS: usize = 6;

type Job = Box<dyn FnOnce(&mut TracerState) + Send>;

#[derive(Debug, Clone, Copy, Default)]
struct TracedThread
{
    running: bool,
    stepping: bool,
    awaiting_initial_stop: bool,
    interrupt_requested: bool,
    // A PTRACE_INTERRUPT from attach is still queued behind a signal stop.
    stale_interrupt: bool,
    pending_signal: i32,
}

impl TracedThread
{
    fn adopted() -> Self
    {
        Self {
            running: true,
            awaiting_initial_stop: true,
            ..Self::default()
        }
    }
}

/// Handle to the tracer thread.
#[derive(Debug)]
pub(crate) struct Tracer
{
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Tracer
{
    /// Start the tracer thread and seize `pid` from it. Returns once every
    /// thread of the process is stopped.
    pub(crate) fn spawn(pid: pid_t) -> MantleResult<Self>
    {
        let (jobs, queue) = mpsc::channel::<Job>();
        let (ready, attached) = mpsc::channel::<MantleResult<()>>();
        let worker = thread::Builder::new()
            .name(format!("mantle-tracer-{pid}"))
            .spawn(move || {
                let mut state = match TracerState::seize(pid) {
                    Ok(state) => {
                        let _ = ready.send(Ok(()));
                        state
                    }
                    Err(err) => {
                        let _ = ready.send(Err(err));
                        return;
                    }
                };
                while let Ok(job) = queue.recv() {
                    job(&mut state);
                }
                state.release();
            })?;
        match attached.recv() {
            Ok(Ok(())) => Ok(Self {
                jobs: Some(jobs),
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => Err(MantleError::invariant("tracer thread exited during attach")),
        }
    }

    /// Run `job` on the tracer thread and wait for its result.
    pub(crate) fn run<R, F>(&self, job: F) -> MantleResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut TracerState) -> MantleResult<R> + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(MantleError::NotAttached)?;
        let (reply, answer) = mpsc::channel();
        jobs.send(Box::new(move |state: &mut TracerState| {
            let _ = reply.send(job(state));
        }))
        .map_err(|_| MantleError::NotAttached)?;
        answer
            .recv()
            .map_err(|_| MantleError::invariant("tracer thread stopped answering"))?
    }

    /// Stop the tracer thread, detaching first if still attached.
    pub(crate) fn shutdown(&mut self)
    {
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("tracer thread panicked");
            }
        }
    }
}

impl Drop for Tracer
{
    fn drop(&mut self)
    {
        self.shutdown();
    }
}

/// Everything the tracer thread knows about the tracee.
#[derive(Debug)]
pub(crate) struct TracerState
{
    pid: pid_t,
    memory: ProcMemory,
    traps: TrapTable,
    threads: BTreeMap<pid_t, TracedThread>,
    events: VecDeque<TargetEvent>,
    attached: bool,
    exited: Option<StopReason>,
}

impl TracerState
{
    fn seize(pid: pid_t) -> MantleResult<Self>
    {
        let mut threads = BTreeMap::new();
        // Threads may be spawned while we attach; list again until stable.
        loop {
            let mut found = false;
            for tid in memory::list_threads(pid)? {
                if threads.contains_key(&tid) {
                    continue;
                }
                found = true;
                match ptrace_call!(libc::PTRACE_SEIZE, tid, 0, libc::PTRACE_O_TRACECLONE) {
                    Ok(_) => {}
                    Err(MantleError::ProcessNotFound(_)) if tid != pid => continue,
                    Err(MantleError::PermissionDenied(reason)) => return Err(MantleError::PermissionDenied(reason)),
                    Err(err) => return Err(MantleError::AttachFailed(format!("seize {tid}: {err}"))),
                }
                ptrace_call!(libc::PTRACE_INTERRUPT, tid, 0, 0)?;
                threads.insert(
                    tid,
                    TracedThread {
                        running: true,
                        interrupt_requested: true,
                        ..TracedThread::default()
                    },
                );
            }
            if !found {
                break;
            }
        }

        let mut state = Self {
            pid,
            memory: ProcMemory::open(pid)?,
            traps: TrapTable::new(),
            threads,
            events: VecDeque::new(),
            attached: true,
            exited: None,
        };
        let tids: Vec<pid_t> = state.threads.keys().copied().collect();
        for tid in tids {
            state.await_attach_stop(tid)?;
        }
        info!(pid, threads = state.threads.len(), "attached");
        Ok(state)
    }

    fn await_attach_stop(&mut self, tid: pid_t) -> MantleResult<()>
    {
        let status = ptrace::wait_thread(tid)?;
        let Some(thread) = self.threads.get_mut(&tid) else {
            return Ok(());
        };
        match status {
            WaitStatus::Stopped {
                event: libc::PTRACE_EVENT_STOP,
                ..
            } => {}
            WaitStatus::Stopped { signal, .. } => {
                thread.pending_signal = signal;
                thread.stale_interrupt = true;
            }
            WaitStatus::Exited(_) | WaitStatus::Signaled(_) => {
                self.threads.remove(&tid);
                return Ok(());
            }
        }
        thread.running = false;
        thread.interrupt_requested = false;
        Ok(())
    }

    fn stopped_thread(&mut self, tid: pid_t) -> MantleResult<&mut TracedThread>
    {
        let thread = self
            .threads
            .get_mut(&tid)
            .ok_or_else(|| MantleError::InvalidArgument(format!("thread {tid} is not traced")))?;
        if thread.running {
            return Err(MantleError::InvalidState {
                expected: "stopped",
                actual: "running".to_string(),
            });
        }
        Ok(thread)
    }

    fn tid(thread: ThreadId) -> MantleResult<pid_t>
    {
        pid_t::try_from(thread.raw()).map_err(|_| MantleError::InvalidArgument(format!("thread id {thread} out of range")))
    }

    /// Traced thread ids.
    pub(crate) fn threads(&self) -> Vec<ThreadId>
    {
        self.threads.keys().map(|tid| ThreadId::from(tid.unsigned_abs() as u64)).collect()
    }

    /// Read memory, showing original bytes where traps are patched in.
    pub(crate) fn read(&self, address: u64, size: usize) -> MantleResult<Vec<u8>>
    {
        let mut buffer = self.memory.read(address, size)?;
        self.traps.mask(address, &mut buffer);
        Ok(buffer)
    }

    /// Write memory, keeping traps in place.
    pub(crate) fn write(&mut self, address: u64, data: &[u8]) -> MantleResult<()>
    {
        let patched = self.traps.merge_write(address, data);
        self.memory.write(address, &patched)
    }

    /// Mappings of the process.
    pub(crate) fn memory_maps(&self) -> MantleResult<Vec<MemoryRegion>>
    {
        memory::memory_maps(self.pid)
    }

    pub(crate) fn read_registers(&mut self, thread: ThreadId) -> MantleResult<Registers>
    {
        let tid = Self::tid(thread)?;
        self.stopped_thread(tid)?;
        registers::read(tid)
    }

    pub(crate) fn write_registers(&mut self, thread: ThreadId, values: &Registers) -> MantleResult<()>
    {
        let tid = Self::tid(thread)?;
        self.stopped_thread(tid)?;
        registers::write(tid, values)
    }

    pub(crate) fn insert_breakpoint(&mut self, address: u64) -> MantleResult<BackendBreakpointId>
    {
        let id = self.traps.insert(&self.memory, address)?;
        trace!(%id, address = format_args!("0x{address:x}"), "trap inserted");
        Ok(id)
    }

    pub(crate) fn remove_breakpoint(&mut self, id: BackendBreakpointId) -> MantleResult<()>
    {
        let address = self.traps.remove(&self.memory, id)?;
        trace!(%id, address = format_args!("0x{address:x}"), "trap removed");
        Ok(())
    }

    // PTRACE_CONT or PTRACE_SINGLESTEP, delivering any signal the thread
    // stopped with.
    fn restart(&mut self, tid: pid_t, stepping: bool) -> MantleResult<()>
    {
        let thread = self.stopped_thread(tid)?;
        let signal = std::mem::take(&mut thread.pending_signal);
        if stepping {
            ptrace_call!(libc::PTRACE_SINGLESTEP, tid, 0, signal)?;
        } else {
            ptrace_call!(libc::PTRACE_CONT, tid, 0, signal)?;
        }
        let thread = self.stopped_thread(tid)?;
        thread.running = true;
        thread.stepping = stepping;
        Ok(())
    }

    /// Resume `thread`. A thread sitting on one of our traps first steps
    /// over it with the original instruction.
    pub(crate) fn resume(&mut self, thread: ThreadId, mode: ResumeMode) -> MantleResult<()>
    {
        let tid = Self::tid(thread)?;
        // Threads adopted after a clone run until they first stop.
        if self.threads.get(&tid).is_some_and(|t| t.running) {
            return Ok(());
        }
        self.stopped_thread(tid)?;
        let pc = registers::get_raw(tid)?.rip;
        if self.traps.contains(pc) {
            self.traps.lift(&self.memory, pc)?;
            let stepped = self.restart(tid, true).and_then(|()| self.wait_for(tid));
            self.traps.restore(&self.memory, pc)?;
            let event = stepped?;
            if event.reason != StopReason::Step || mode == ResumeMode::SingleStep {
                self.events.push_back(event);
                return Ok(());
            }
        }
        self.restart(tid, mode == ResumeMode::SingleStep)
    }

    /// Block until `tid` reports an event; other threads' events stay queued
    /// in the kernel.
    fn wait_for(&mut self, tid: pid_t) -> MantleResult<TargetEvent>
    {
        if let Some(position) = self.events.iter().position(|e| e.thread.raw() == tid.unsigned_abs() as u64) {
            if let Some(event) = self.events.remove(position) {
                return Ok(event);
            }
        }
        loop {
            let status = ptrace::wait_thread(tid)?;
            if let Some(event) = self.translate(tid, status)? {
                return Ok(event);
            }
        }
    }

    /// Next event of any thread, waiting at most `timeout`.
    pub(crate) fn poll_event(&mut self, timeout: Duration) -> MantleResult<Option<TargetEvent>>
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if self.exited.is_some() || self.threads.is_empty() {
                return Ok(None);
            }
            if let Some((tid, status)) = ptrace::wait_any()? {
                if let Some(event) = self.translate(tid, status)? {
                    return Ok(Some(event));
                }
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    // Turn a wait status into an event, or `None` if the stop was handled
    // here and the thread resumed.
    fn translate(&mut self, tid: pid_t, status: WaitStatus) -> MantleResult<Option<TargetEvent>>
    {
        let thread_id = ThreadId::from(tid.unsigned_abs() as u64);
        if status.is_gone() {
            let reason = match status {
                WaitStatus::Exited(code) => StopReason::Exited(code),
                WaitStatus::Signaled(signal) => StopReason::Killed(signal),
                WaitStatus::Stopped { .. } => return Err(MantleError::invariant("stopped status reported as gone")),
            };
            self.threads.remove(&tid);
            if tid == self.pid || self.threads.is_empty() {
                info!(pid = self.pid, ?reason, "process exited");
                self.exited = Some(reason);
                self.attached = false;
                self.threads.clear();
                self.traps = TrapTable::new();
                return Ok(Some(TargetEvent::process_exit(thread_id, reason)));
            }
            debug!(tid, ?reason, "thread exited");
            return Ok(Some(TargetEvent::new(thread_id, reason)));
        }
        let WaitStatus::Stopped { signal, event } = status else {
            return Ok(None);
        };

        let thread = self.threads.entry(tid).or_insert_with(TracedThread::adopted);
        thread.running = false;
        let stepping = std::mem::take(&mut thread.stepping);

        match event {
            libc::PTRACE_EVENT_CLONE => {
                let mut child: libc::c_ulong = 0;
                ptrace_call!(libc::PTRACE_GETEVENTMSG, tid, 0, &mut child as *mut libc::c_ulong)?;
                let child = child as pid_t;
                debug!(parent = tid, child, "thread created");
                self.threads.entry(child).or_insert_with(TracedThread::adopted);
                self.restart(tid, stepping)?;
                Ok(None)
            }
            libc::PTRACE_EVENT_STOP => {
                if thread.interrupt_requested {
                    thread.interrupt_requested = false;
                    thread.awaiting_initial_stop = false;
                    return Ok(Some(TargetEvent::new(thread_id, StopReason::Interrupted)));
                }
                if thread.awaiting_initial_stop || thread.stale_interrupt {
                    thread.awaiting_initial_stop = false;
                    thread.stale_interrupt = false;
                    self.restart(tid, stepping)?;
                    return Ok(None);
                }
                // Group stop
                Ok(Some(TargetEvent::new(thread_id, StopReason::Signal(signal))))
            }
            0 if signal == libc::SIGTRAP => {
                if stepping {
                    return Ok(Some(TargetEvent::new(thread_id, StopReason::Step)));
                }
                let mut raw = registers::get_raw(tid)?;
                let trap = raw.rip.wrapping_sub(1);
                if self.traps.contains(trap) {
                    raw.rip = trap;
                    registers::set_raw(tid, &raw)?;
                    return Ok(Some(TargetEvent::new(thread_id, StopReason::Breakpoint(trap))));
                }
                Ok(Some(TargetEvent::new(thread_id, StopReason::Signal(signal))))
            }
            0 => {
                thread.pending_signal = signal;
                Ok(Some(TargetEvent::new(thread_id, StopReason::Signal(signal))))
            }
            other => {
                warn!(tid, event = other, "unexpected ptrace event");
                self.restart(tid, stepping)?;
                Ok(None)
            }
        }
    }

    /// Ask every running thread to stop.
    pub(crate) fn interrupt(&mut self) -> MantleResult<()>
    {
        for (tid, thread) in &mut self.threads {
            if thread.running && !thread.interrupt_requested {
                match ptrace_call!(libc::PTRACE_INTERRUPT, *tid, 0, 0) {
                    Ok(_) => thread.interrupt_requested = true,
                    Err(MantleError::ProcessNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Call `function(args...)` on `thread` and return `rax`.
    ///
    /// The return address is the thread's current program counter with a
    /// trap on it; registers are restored whatever happens. Traps hit
    /// during the call are skipped.
    pub(crate) fn call_function(&mut self, thread: ThreadId, function: u64, args: &[u64]) -> MantleResult<u64>
    {
        if args.len() > MAX_CALL_ARGUMENTS {
            return Err(MantleError::InvalidArgument(format!(
                "{} arguments, at most {MAX_CALL_ARGUMENTS} are passed in registers",
                args.len()
            )));
        }
        let tid = Self::tid(thread)?;
        self.stopped_thread(tid)?;
        let saved = registers::get_raw(tid)?;
        let return_address = saved.rip;

        let sp = (saved.rsp.wrapping_sub(RED_ZONE) & !0xf).wrapping_sub(8);
        self.memory.write(sp, &return_address.to_le_bytes())?;
        let mut raw = saved;
        raw.rsp = sp;
        raw.rip = function;
        raw.rax = 0;
        // No syscall restart on the way out of a syscall stop.
        raw.orig_rax = u64::MAX;
        let slots = [&mut raw.rdi, &mut raw.rsi, &mut raw.rdx, &mut raw.rcx, &mut raw.r8, &mut raw.r9];
        for (slot, value) in slots.into_iter().zip(args) {
            *slot = *value;
        }

        let trap = self.traps.insert(&self.memory, return_address)?;
        let result = registers::set_raw(tid, &raw).and_then(|()| self.run_until_return(tid, return_address, sp + 8));
        let restored = registers::set_raw(tid, &saved);
        let removed = self.traps.remove(&self.memory, trap);
        let value = result?;
        restored?;
        removed?;
        Ok(value)
    }

    fn run_until_return(&mut self, tid: pid_t, return_address: u64, caller_sp: u64) -> MantleResult<u64>
    {
        loop {
            self.resume(ThreadId::from(tid.unsigned_abs() as u64), ResumeMode::Continue)?;
            let event = self.wait_for(tid)?;
            match event.reason {
                StopReason::Breakpoint(address) if address == return_address => {
                    let raw = registers::get_raw(tid)?;
                    if raw.rsp >= caller_sp {
                        return Ok(raw.rax);
                    }
                }
                StopReason::Breakpoint(_) => {}
                reason => {
                    if event.process_exited || reason.is_terminal() {
                        self.events.push_back(event);
                    }
                    return Err(MantleError::InvalidState {
                        expected: "return from called function",
                        actual: format!("{reason:?}"),
                    });
                }
            }
        }
    }

    /// Restore all code and let every thread go.
    pub(crate) fn detach(&mut self) -> MantleResult<()>
    {
        if !self.attached {
            return Ok(());
        }
        loop {
            self.interrupt()?;
            let Some(tid) = self.threads.iter().find(|(_, t)| t.running).map(|(tid, _)| *tid) else {
                break;
            };
            let status = ptrace::wait_thread(tid)?;
            let _ = self.translate(tid, status)?;
            if !self.attached {
                return Ok(());
            }
        }
        let restored = self.traps.clear(&self.memory);
        for (tid, thread) in std::mem::take(&mut self.threads) {
            match ptrace_call!(libc::PTRACE_DETACH, tid, 0, thread.pending_signal) {
                Ok(_) | Err(MantleError::ProcessNotFound(_)) => {}
                Err(err) => warn!(tid, error = %err, "detach failed"),
            }
        }
        self.events.clear();
        self.attached = false;
        info!(pid = self.pid, "detached");
        restored
    }

    /// SIGKILL the process and reap it.
    pub(crate) fn kill(&mut self) -> MantleResult<()>
    {
        if self.exited.is_some() {
            return Ok(());
        }
        #[allow(unsafe_code)]
        // SAFETY: plain syscall on an integer pid.
        let result = unsafe { libc::kill(self.pid, libc::SIGKILL) };
        if result == -1 {
            return Err(ptrace::os_error("kill", self.pid, std::io::Error::last_os_error()));
        }
        while self.exited.is_none() {
            match ptrace::wait_any() {
                Ok(Some((tid, status))) => {
                    let _ = self.translate(tid, status);
                }
                Ok(None) => thread::sleep(POLL_SLICE),
                Err(MantleError::NotAttached) => break,
                Err(err) => return Err(err),
            }
        }
        self.attached = false;
        self.threads.clear();
        self.events.clear();
        Ok(())
    }

    // Last act of the tracer thread.
    fn release(&mut self)
    {
        if self.attached {
            if let Err(err) = self.detach() {
                warn!(pid = self.pid, error = %err, "detach on shutdown failed");
            }
        }
    }
}
