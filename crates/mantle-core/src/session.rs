//! # Session
//!
//! Entry point of the engine. A [`Session`] owns one target and everything
//! derived from it: the symbol store, the breakpoint manager, the runtime
//! notification dispatcher and one servant per thread.
//!
//! ## Lock order
//!
//! Code that needs more than one lock takes them in this order:
//!
//! 1. a thread servant
//! 2. a breakpoint handle
//! 3. the symbol store
//! 4. the target
//!
//! The event bus, the thread registry and the notification hook are leaf
//! locks and are never held while another lock is taken.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::breakpoints::{BindingState, BreakpointDefinition, BreakpointId, BreakpointInfo, BreakpointManager};
use crate::error::MantleResult;
use crate::events::{DebuggerEvent, DebuggerEventReceiver, EventBus};
use crate::memory::{MemoryAccessor, ProcessSnapshot};
use crate::notifications::{Notification, NotificationDispatcher};
use crate::symbols::{StoreLimits, SymbolStore, UpdateSummary};
use crate::target::{ProcessControl, TargetHandle};
use crate::thread::engine::{EngineContext, SteppingEngine};
use crate::thread::snapshot::SnapshotThread;
use crate::thread::{SharedServant, ThreadRegistry, ThreadServant, ThreadState};
use crate::types::{ProcessId, ThreadId};

/// Limits and timing of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig
{
    /// How long one backend poll may block.
    pub poll_interval: Duration,
    /// Single steps a line step may take before giving up.
    pub max_step_iterations: u32,
    /// Deepest backtrace produced.
    pub max_backtrace_depth: usize,
    /// Symbol store bounds.
    pub store: StoreLimits,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            poll_interval: Duration::from_millis(10),
            max_step_iterations: 100_000,
            max_backtrace_depth: 256,
            store: StoreLimits::default(),
        }
    }
}

/// Runtime entry points the client located in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeHooks
{
    /// Function the runtime calls for every notification.
    pub notification_address: u64,
    /// Symbol-table header, when the runtime already published it.
    pub symbol_table: Option<u64>,
}

/// One debugging session.
#[derive(Debug)]
pub struct Session
{
    ctx: EngineContext,
}

impl Session
{
    /// Start a session on `backend`. Every thread the backend reports is
    /// given a servant in the `Stopped` state.
    ///
    /// ## Errors
    ///
    /// Errors listing the backend's threads.
    pub fn new(backend: Box<dyn ProcessControl>, config: SessionConfig) -> MantleResult<Self>
    {
        let target = TargetHandle::new(backend);
        let symbols = Arc::new(Mutex::new(SymbolStore::new(config.store)));
        let breakpoints = Arc::new(BreakpointManager::new(target.clone(), Arc::clone(&symbols)));
        let events = EventBus::new();
        let dispatcher = Arc::new(NotificationDispatcher::new(
            target.clone(),
            Arc::clone(&symbols),
            Arc::clone(&breakpoints),
            events.clone(),
        ));
        let session = Self {
            ctx: EngineContext {
                target,
                symbols,
                breakpoints,
                dispatcher,
                events,
                registry: ThreadRegistry::new(),
                config,
            },
        };
        let threads = session.sync_threads()?;
        info!(
            architecture = %session.ctx.target.architecture(),
            threads,
            live = session.ctx.target.supports_execution(),
            "session opened"
        );
        Ok(session)
    }

    /// Attach to a running process.
    ///
    /// ## Errors
    ///
    /// [`crate::error::MantleError::ProcessNotFound`],
    /// [`crate::error::MantleError::PermissionDenied`] or
    /// [`crate::error::MantleError::AttachFailed`].
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn attach(pid: ProcessId, config: SessionConfig) -> MantleResult<Self>
    {
        let process = crate::platform::linux::LinuxProcess::attach(pid)?;
        Self::new(Box::new(process), config)
    }

    /// Attach to a running process.
    ///
    /// ## Errors
    ///
    /// Always [`crate::error::MantleError::Unsupported`] on this platform.
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    pub fn attach(pid: ProcessId, _config: SessionConfig) -> MantleResult<Self>
    {
        Err(crate::error::MantleError::Unsupported(format!(
            "attaching to {pid} on {}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )))
    }

    /// Inspect a snapshot.
    ///
    /// ## Errors
    ///
    /// As for [`Self::new`].
    pub fn open_snapshot(snapshot: ProcessSnapshot, config: SessionConfig) -> MantleResult<Self>
    {
        Self::new(Box::new(snapshot), config)
    }

    /// Hook into the runtime: stop on its notification function and, if
    /// given, read the symbol table it already published.
    ///
    /// ## Errors
    ///
    /// Breakpoint insertion errors; symbol-table decode errors.
    pub fn initialize_runtime(&self, hooks: &RuntimeHooks) -> MantleResult<()>
    {
        let info = self.ctx.target.memory_info();
        self.ctx.dispatcher.install(info.address(hooks.notification_address))?;
        if let Some(header) = hooks.symbol_table {
            self.ctx.dispatcher.dispatch(Notification::SymbolTableReady {
                header: info.address(header),
            })?;
        }
        Ok(())
    }

    /// Receiver for every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> DebuggerEventReceiver
    {
        self.ctx.events.subscribe()
    }

    /// Read new symbol records from the target now.
    ///
    /// ## Errors
    ///
    /// Only fatal errors.
    pub fn refresh(&self) -> MantleResult<UpdateSummary>
    {
        let summary = self.ctx.dispatcher.refresh()?;
        if !summary.is_empty() {
            debug!(?summary, "explicit refresh");
        }
        Ok(summary)
    }

    /// The target.
    #[must_use]
    pub fn target(&self) -> &TargetHandle
    {
        &self.ctx.target
    }

    /// The symbol store.
    #[must_use]
    pub fn symbols(&self) -> &Arc<Mutex<SymbolStore>>
    {
        &self.ctx.symbols
    }

    /// The breakpoint manager.
    #[must_use]
    pub fn breakpoints(&self) -> &Arc<BreakpointManager>
    {
        &self.ctx.breakpoints
    }

    /// The notification dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher>
    {
        &self.ctx.dispatcher
    }

    /// Session limits.
    #[must_use]
    pub fn config(&self) -> &SessionConfig
    {
        &self.ctx.config
    }

    fn make_servant(&self, thread: ThreadId) -> Box<dyn ThreadServant>
    {
        if self.ctx.target.supports_execution() {
            Box::new(SteppingEngine::new(thread, self.ctx.clone(), ThreadState::Stopped))
        } else {
            Box::new(SnapshotThread::new(
                thread,
                self.ctx.target.clone(),
                Arc::clone(&self.ctx.symbols),
                self.ctx.config.max_backtrace_depth,
            ))
        }
    }

    // Give every thread the backend knows a servant; returns how many exist.
    fn sync_threads(&self) -> MantleResult<usize>
    {
        if self.ctx.target.exit_status()?.is_some() {
            return Ok(self.ctx.registry.ids()?.len());
        }
        for thread in self.ctx.target.threads()? {
            self.ctx.registry.insert_with(thread, || self.make_servant(thread))?;
        }
        Ok(self.ctx.registry.ids()?.len())
    }

    /// Known threads.
    ///
    /// ## Errors
    ///
    /// Errors listing the backend's threads.
    pub fn threads(&self) -> MantleResult<Vec<ThreadId>>
    {
        self.sync_threads()?;
        self.ctx.registry.ids()
    }

    /// Servant of `thread`. Lock it to control the thread.
    ///
    /// ## Errors
    ///
    /// [`crate::error::MantleError::InvalidArgument`] for unknown threads.
    pub fn thread(&self, thread: ThreadId) -> MantleResult<SharedServant>
    {
        if let Ok(servant) = self.ctx.registry.get(thread) {
            return Ok(servant);
        }
        self.sync_threads()?;
        self.ctx.registry.get(thread)
    }

    /// Create a breakpoint, binding it now if its code is loaded.
    ///
    /// ## Errors
    ///
    /// See [`BreakpointManager::create`].
    pub fn create_breakpoint(&self, definition: BreakpointDefinition) -> MantleResult<BreakpointId>
    {
        let id = self.ctx.breakpoints.create(definition)?;
        let info = self.ctx.breakpoints.get(id)?;
        if info.state != BindingState::Unbound {
            self.ctx.events.publish(DebuggerEvent::BreakpointBound {
                id,
                address: info.address,
            });
        }
        Ok(id)
    }

    /// Enable a breakpoint.
    ///
    /// ## Errors
    ///
    /// See [`BreakpointManager::enable`].
    pub fn enable_breakpoint(&self, id: BreakpointId) -> MantleResult<()>
    {
        self.ctx.breakpoints.enable(id)
    }

    /// Disable a breakpoint.
    ///
    /// ## Errors
    ///
    /// See [`BreakpointManager::disable`].
    pub fn disable_breakpoint(&self, id: BreakpointId) -> MantleResult<()>
    {
        self.ctx.breakpoints.disable(id)
    }

    /// Delete a breakpoint.
    ///
    /// ## Errors
    ///
    /// See [`BreakpointManager::remove`].
    pub fn remove_breakpoint(&self, id: BreakpointId) -> MantleResult<BreakpointInfo>
    {
        self.ctx.breakpoints.remove(id)
    }

    /// All breakpoints.
    ///
    /// ## Errors
    ///
    /// [`crate::error::MantleError::Internal`] if a lock is poisoned.
    pub fn list_breakpoints(&self) -> MantleResult<Vec<BreakpointInfo>>
    {
        self.ctx.breakpoints.list()
    }

    /// Stop the target. A thread blocked in a control command returns with
    /// [`crate::types::StopReason::Interrupted`].
    ///
    /// ## Errors
    ///
    /// Backend errors.
    pub fn interrupt(&self) -> MantleResult<()>
    {
        info!("interrupt requested");
        self.ctx.target.interrupt()
    }

    // Take every trap out of the target before letting it go.
    fn release_traps(&self) -> MantleResult<()>
    {
        for breakpoint in self.ctx.breakpoints.list()? {
            if let Err(err) = self.ctx.breakpoints.remove(breakpoint.id) {
                warn!(id = %breakpoint.id, error = %err, "could not remove breakpoint");
            }
        }
        self.ctx.dispatcher.uninstall()
    }

    /// Remove all traps and let the process run on untraced.
    ///
    /// ## Errors
    ///
    /// Backend errors.
    pub fn detach(self) -> MantleResult<()>
    {
        if self.ctx.target.exit_status()?.is_none() && self.ctx.target.can_write() {
            self.release_traps()?;
        }
        self.ctx.target.with(|backend| backend.detach())?;
        info!("detached");
        Ok(())
    }

    /// Terminate the process.
    ///
    /// ## Errors
    ///
    /// Backend errors; [`crate::error::MantleError::ReadOnly`] on snapshots.
    pub fn kill(self) -> MantleResult<()>
    {
        self.ctx.target.with(|backend| backend.kill())?;
        info!("target killed");
        Ok(())
    }
}

impl Drop for Session
{
    fn drop(&mut self)
    {
        // Servants hold clones of the context; break the cycle.
        if let Err(err) = self.ctx.registry.clear() {
            warn!(error = %err, "could not release thread servants");
        }
    }
}
