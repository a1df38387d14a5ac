//! # Runtime Notifications
//!
//! The runtime reports lifecycle changes by calling a well-known function
//! with `(kind, data, arg)`. The engine keeps a breakpoint on that function;
//! when a thread stops there the arguments are decoded into a
//! [`Notification`] and applied to the symbol store and the breakpoint
//! manager before the thread is resumed.
//!
//! Every notification is applied as one transition: when a module unload
//! returns, the module is gone from the store and every breakpoint bound into
//! it is already unbound.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::breakpoints::BreakpointManager;
use crate::error::{MantleError, MantleResult};
use crate::events::{DebuggerEvent, EventBus};
use crate::memory::MemoryAccessor;
use crate::symbols::{SymbolStore, UpdateSummary};
use crate::target::{BackendBreakpointId, TargetHandle};
use crate::types::{LoadCallbackId, ModuleHandle, TargetAddress, ThreadId};

/// Decoded runtime notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification
{
    /// The symbol-table header is ready at `header`.
    SymbolTableReady
    {
        /// Header address
        header: TargetAddress,
    },
    /// A module was loaded.
    ModuleLoad
    {
        /// Module descriptor
        descriptor: TargetAddress,
    },
    /// A module is being unloaded.
    ModuleUnload
    {
        /// Runtime module index
        index: i32,
    },
    /// A domain was created with a new data table.
    DomainCreate
    {
        /// Data-table descriptor
        table: TargetAddress,
    },
    /// A domain and its data table are going away.
    DomainUnload
    {
        /// Runtime domain id
        domain: i32,
        /// Data-table descriptor
        table: TargetAddress,
    },
    /// A method was compiled.
    NewCodeReady
    {
        /// Method descriptor
        descriptor: TargetAddress,
        /// Callback the compilation answers
        callback: Option<LoadCallbackId>,
    },
    /// The runtime is about to run the entry method.
    RuntimeInitialized
    {
        /// Entry-method descriptor
        entry: TargetAddress,
    },
    /// A managed thread started.
    ThreadCreated
    {
        /// New thread
        thread: ThreadId,
    },
    /// A managed thread finished.
    ThreadExited
    {
        /// Exiting thread
        thread: ThreadId,
    },
}

impl Notification
{
    /// Decode the raw arguments of a notification call.
    ///
    /// ## Errors
    ///
    /// [`MantleError::DebugInfoMalformed`] for unknown kinds or impossible
    /// arguments.
    pub fn decode(kind: u64, data: TargetAddress, arg: u64) -> MantleResult<Self>
    {
        let index = |what: &str| {
            i32::try_from(arg).map_err(|_| MantleError::DebugInfoMalformed(format!("{what} {arg} out of range")))
        };
        Ok(match kind {
            1 => Notification::SymbolTableReady { header: data },
            2 => Notification::ModuleLoad { descriptor: data },
            3 => Notification::ModuleUnload {
                index: index("module index")?,
            },
            4 => Notification::DomainCreate { table: data },
            5 => Notification::DomainUnload {
                domain: index("domain id")?,
                table: data,
            },
            6 => Notification::NewCodeReady {
                descriptor: data,
                callback: match u32::try_from(arg) {
                    Ok(0) => None,
                    Ok(raw) => Some(LoadCallbackId::from_raw(raw)),
                    Err(_) => {
                        return Err(MantleError::DebugInfoMalformed(format!("callback id {arg} out of range")));
                    }
                },
            },
            7 => Notification::RuntimeInitialized { entry: data },
            8 => Notification::ThreadCreated {
                thread: ThreadId::from(arg),
            },
            9 => Notification::ThreadExited {
                thread: ThreadId::from(arg),
            },
            other => {
                return Err(MantleError::DebugInfoMalformed(format!("unknown notification kind {other}")));
            }
        })
    }
}

/// What the session has to do after a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome
{
    /// Nothing beyond resuming.
    Handled,
    /// Start tracking a thread.
    ThreadCreated(ThreadId),
    /// Stop tracking a thread.
    ThreadExited(ThreadId),
}

#[derive(Debug, Clone)]
struct NotificationHook
{
    address: TargetAddress,
    backend: Option<BackendBreakpointId>,
}

/// Applies notifications to the store and the breakpoints.
#[derive(Debug)]
pub struct NotificationDispatcher
{
    target: TargetHandle,
    symbols: Arc<Mutex<SymbolStore>>,
    breakpoints: Arc<BreakpointManager>,
    events: EventBus,
    hook: Mutex<Option<NotificationHook>>,
}

impl NotificationDispatcher
{
    /// Dispatcher with no notification function installed yet.
    #[must_use]
    pub fn new(target: TargetHandle, symbols: Arc<Mutex<SymbolStore>>, breakpoints: Arc<BreakpointManager>, events: EventBus) -> Self
    {
        Self {
            target,
            symbols,
            breakpoints,
            events,
            hook: Mutex::new(None),
        }
    }

    /// Stop the target whenever the runtime calls `address`.
    ///
    /// On read-only targets the address is only remembered.
    ///
    /// ## Errors
    ///
    /// Breakpoint insertion errors.
    pub fn install(&self, address: TargetAddress) -> MantleResult<()>
    {
        let mut hook = self.hook.lock()?;
        if let Some(previous) = hook.take() {
            if let Some(backend) = previous.backend {
                self.target.remove_breakpoint(backend)?;
            }
        }
        let backend = if self.target.can_write() {
            Some(self.target.insert_breakpoint(&address)?)
        } else {
            None
        };
        info!(%address, "runtime notification hook installed");
        *hook = Some(NotificationHook { address, backend });
        Ok(())
    }

    /// Remove the notification breakpoint.
    ///
    /// ## Errors
    ///
    /// Breakpoint removal errors.
    pub fn uninstall(&self) -> MantleResult<()>
    {
        if let Some(NotificationHook {
            backend: Some(backend), ..
        }) = self.hook.lock()?.take()
        {
            self.target.remove_breakpoint(backend)?;
        }
        Ok(())
    }

    /// `true` if a stop at `pc` is a runtime notification.
    #[must_use]
    pub fn is_notification(&self, pc: &TargetAddress) -> bool
    {
        self.hook
            .lock()
            .ok()
            .and_then(|hook| hook.as_ref().map(|h| &h.address == pc))
            .unwrap_or(false)
    }

    /// Decode the notification `thread` is stopped in and apply it.
    ///
    /// ## Errors
    ///
    /// Register read or decode errors, and errors from [`Self::dispatch`].
    pub fn dispatch_from_registers(&self, thread: ThreadId) -> MantleResult<DispatchOutcome>
    {
        let registers = self.target.read_registers(thread)?;
        let argument = |n: usize| {
            registers
                .argument(n)
                .ok_or_else(|| MantleError::Unsupported(format!("argument registers of {}", registers.architecture())))
        };
        let kind = argument(0)?;
        let data = self.target.memory_info().address(argument(1)?);
        let arg = argument(2)?;
        let notification = Notification::decode(kind, data, arg)?;
        self.dispatch(notification)
    }

    /// Apply one notification.
    ///
    /// ## Errors
    ///
    /// Errors of the store operation the notification maps to. Breakpoint
    /// failures other than fatal ones are logged, not returned.
    pub fn dispatch(&self, notification: Notification) -> MantleResult<DispatchOutcome>
    {
        debug!(?notification, "runtime notification");
        match notification {
            Notification::SymbolTableReady { header } => {
                let modules = self.symbols.lock()?.initialize(&self.target, &header)?;
                for module in modules {
                    self.module_loaded(module)?;
                }
                self.refresh()?;
            }
            Notification::ModuleLoad { descriptor } => {
                let module = self.symbols.lock()?.load_module(&self.target, &descriptor)?;
                self.module_loaded(module)?;
                self.bind_fired()?;
            }
            Notification::ModuleUnload { index } => {
                let module = self.symbols.lock()?.unload_module(index)?;
                for id in self.breakpoints.module_unloaded(module)? {
                    self.events.publish(DebuggerEvent::BreakpointUnbound { id });
                }
                self.events.publish(DebuggerEvent::ModuleUnloaded { module });
            }
            Notification::DomainCreate { table } => {
                self.symbols.lock()?.add_data_table(&self.target, &table)?;
                self.refresh()?;
            }
            Notification::DomainUnload { domain, table } => {
                if !self.symbols.lock()?.destroy_data_table(domain, &table) {
                    warn!(domain, %table, "unload of untracked domain");
                }
            }
            Notification::NewCodeReady { descriptor, callback } => {
                let method = self.symbols.lock()?.method_compiled(&self.target, &descriptor, callback)?;
                debug!(%method, "new code ready");
                self.bind_fired()?;
            }
            Notification::RuntimeInitialized { entry } => {
                self.symbols.lock()?.reached_main(&self.target, &entry)?;
                self.refresh()?;
            }
            Notification::ThreadCreated { thread } => {
                self.events.publish(DebuggerEvent::ThreadCreated { thread });
                return Ok(DispatchOutcome::ThreadCreated(thread));
            }
            Notification::ThreadExited { thread } => {
                self.events.publish(DebuggerEvent::ThreadExited { thread });
                return Ok(DispatchOutcome::ThreadExited(thread));
            }
        }
        Ok(DispatchOutcome::Handled)
    }

    fn module_loaded(&self, module: ModuleHandle) -> MantleResult<()>
    {
        let name = self.symbols.lock()?.module(module)?.name().to_owned();
        self.events.publish(DebuggerEvent::ModuleLoaded { module, name });
        let bound = self.breakpoints.module_loaded(module)?;
        self.publish_bound(bound)
    }

    fn publish_bound(&self, ids: Vec<crate::breakpoints::BreakpointId>) -> MantleResult<()>
    {
        for id in ids {
            let address = self.breakpoints.get(id)?.address;
            self.events.publish(DebuggerEvent::BreakpointBound { id, address });
        }
        Ok(())
    }

    fn bind_fired(&self) -> MantleResult<()>
    {
        let fired = self.symbols.lock()?.take_fired();
        for loaded in fired {
            let bound = self.breakpoints.method_loaded(loaded)?;
            self.publish_bound(bound)?;
        }
        Ok(())
    }

    /// Read everything new from the data tables and bind breakpoints whose
    /// methods were compiled meanwhile.
    ///
    /// ## Errors
    ///
    /// Only fatal errors; table failures are reported in the summary.
    pub fn refresh(&self) -> MantleResult<UpdateSummary>
    {
        let summary = self.symbols.lock()?.update(&self.target);
        self.bind_fired()?;
        Ok(summary)
    }
}
