//! # Breakpoints
//!
//! Client breakpoints outlive the code they point into. A definition names a
//! method (optionally a line) or a raw address; the handle binds it to a
//! concrete address once the owning module is loaded and its code compiled,
//! inserts it into the target while enabled, and drops the binding when the
//! module goes away so a reload resolves it again from scratch.
//!
//! ```text
//!            module loaded / method compiled
//!  Unbound ---------------------------------> Bound-Disabled <--disable--
//!     ^                                           |        enable       |
//!     |              module unloaded              v                     |
//!     +----------------------------------- Bound-Enabled ---------------+
//! ```
//!
//! ## Locking
//!
//! Each handle has its own mutex. Transitions take, in this order, the
//! handle's lock, then the symbol store's lock, then the target lock. The
//! manager's map lock is only held long enough to clone handle pointers out.

pub mod builder;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::error::{MantleError, MantleResult};
use crate::memory::MemoryAccessor;
use crate::symbols::{MethodLoaded, SymbolStore};
use crate::target::{BackendBreakpointId, TargetHandle};
use crate::types::{LoadCallbackId, ModuleHandle, TargetAddress, ThreadId};

/// Unique identifier for a client breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(u64);

impl BreakpointId
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Get the raw numeric representation (useful for logging / errors).
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for BreakpointId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Where a breakpoint should stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation
{
    /// A managed method, at its first line after the prologue or at `line`.
    Method
    {
        /// Module name, with or without extension
        module: String,
        /// Method name
        method: String,
        /// Source line inside the method
        line: Option<u32>,
    },
    /// A raw address, optionally tied to the lifetime of a module.
    Address
    {
        /// Module whose load/unload binds/unbinds the breakpoint
        module: Option<String>,
        /// Absolute address
        address: u64,
    },
}

impl BreakpointLocation
{
    /// Module this location depends on, if any.
    #[must_use]
    pub fn module_name(&self) -> Option<&str>
    {
        match self {
            BreakpointLocation::Method { module, .. } => Some(module),
            BreakpointLocation::Address { module, .. } => module.as_deref(),
        }
    }
}

impl fmt::Display for BreakpointLocation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            BreakpointLocation::Method { module, method, line: Some(line) } => write!(f, "{module}!{method}:{line}"),
            BreakpointLocation::Method { module, method, line: None } => write!(f, "{module}!{method}"),
            BreakpointLocation::Address { module: Some(module), address } => write!(f, "{module}@0x{address:x}"),
            BreakpointLocation::Address { module: None, address } => write!(f, "0x{address:x}"),
        }
    }
}

/// Threads a breakpoint applies to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ThreadGroup
{
    /// Every thread.
    #[default]
    Global,
    /// Only the listed threads.
    Threads(BTreeSet<ThreadId>),
}

impl ThreadGroup
{
    /// `true` if hits by `thread` count.
    #[must_use]
    pub fn contains(&self, thread: ThreadId) -> bool
    {
        match self {
            ThreadGroup::Global => true,
            ThreadGroup::Threads(threads) => threads.contains(&thread),
        }
    }
}

/// A client's breakpoint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointDefinition
{
    /// Where to stop
    pub location: BreakpointLocation,
    /// Which threads stop
    pub group: ThreadGroup,
    /// Hits ignored before the first reported one
    pub ignore_count: u64,
    /// Initial enabled flag
    pub enabled: bool,
}

impl BreakpointDefinition
{
    /// Enabled, global definition for `location`.
    #[must_use]
    pub fn new(location: BreakpointLocation) -> Self
    {
        Self {
            location,
            group: ThreadGroup::Global,
            ignore_count: 0,
            enabled: true,
        }
    }
}

/// Binding state of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState
{
    /// No address resolved yet.
    Unbound,
    /// Address known, not inserted.
    BoundDisabled,
    /// Inserted into the target.
    BoundEnabled,
}

/// Public information about a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo
{
    /// Unique identifier for this breakpoint.
    pub id: BreakpointId,
    /// Where it should stop.
    pub location: BreakpointLocation,
    /// Which threads it applies to.
    pub group: ThreadGroup,
    /// Current binding state.
    pub state: BindingState,
    /// Whether the definition is enabled.
    pub enabled: bool,
    /// Module it is bound into.
    pub module: Option<ModuleHandle>,
    /// Resolved address.
    pub address: Option<TargetAddress>,
    /// Load callback the breakpoint is waiting for.
    pub pending_callback: Option<LoadCallbackId>,
    /// Number of times this breakpoint has been hit.
    pub hit_count: u64,
    /// Timestamp when the breakpoint was first requested.
    pub requested_at: SystemTime,
    /// Timestamp of the most recent binding.
    pub bound_at: Option<SystemTime>,
}

#[derive(Debug)]
struct HandleState
{
    enabled: bool,
    module: Option<ModuleHandle>,
    bound_address: Option<TargetAddress>,
    backend: Option<BackendBreakpointId>,
    load_callback: Option<LoadCallbackId>,
    hit_count: u64,
    bound_at: Option<SystemTime>,
}

impl HandleState
{
    fn binding(&self) -> BindingState
    {
        match (&self.bound_address, self.enabled) {
            (None, _) => BindingState::Unbound,
            (Some(_), false) => BindingState::BoundDisabled,
            (Some(_), true) => BindingState::BoundEnabled,
        }
    }
}

enum Resolution
{
    Bound
    {
        module: Option<ModuleHandle>,
        address: TargetAddress,
    },
    Waiting(LoadCallbackId),
    NotYet,
}

/// A breakpoint definition plus its current binding.
#[derive(Debug)]
pub struct BreakpointHandle
{
    id: BreakpointId,
    location: BreakpointLocation,
    group: ThreadGroup,
    ignore_count: u64,
    requested_at: SystemTime,
    state: Mutex<HandleState>,
}

impl BreakpointHandle
{
    fn new(id: BreakpointId, definition: BreakpointDefinition) -> Self
    {
        Self {
            id,
            location: definition.location,
            group: definition.group,
            ignore_count: definition.ignore_count,
            requested_at: SystemTime::now(),
            state: Mutex::new(HandleState {
                enabled: definition.enabled,
                module: None,
                bound_address: None,
                backend: None,
                load_callback: None,
                hit_count: 0,
                bound_at: None,
            }),
        }
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> BreakpointId
    {
        self.id
    }

    /// Location requested by the client.
    #[must_use]
    pub const fn location(&self) -> &BreakpointLocation
    {
        &self.location
    }

    fn lock(&self) -> MantleResult<MutexGuard<'_, HandleState>>
    {
        Ok(self.state.lock()?)
    }

    /// Snapshot of the public state.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the handle lock is poisoned.
    pub fn info(&self) -> MantleResult<BreakpointInfo>
    {
        let state = self.lock()?;
        Ok(BreakpointInfo {
            id: self.id,
            location: self.location.clone(),
            group: self.group.clone(),
            state: state.binding(),
            enabled: state.enabled,
            module: state.module,
            address: state.bound_address.clone(),
            pending_callback: state.load_callback,
            hit_count: state.hit_count,
            requested_at: self.requested_at,
            bound_at: state.bound_at,
        })
    }

    /// Verify that the backend breakpoint exists exactly when the handle is
    /// bound and enabled, and that module-dependent bindings have a module.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] on violation.
    pub fn check_invariant(&self) -> MantleResult<()>
    {
        let state = self.lock()?;
        Self::verify(self.id, &self.location, &state)
    }

    fn verify(id: BreakpointId, location: &BreakpointLocation, state: &HandleState) -> MantleResult<()>
    {
        let should_be_inserted = state.bound_address.is_some() && state.enabled;
        if state.backend.is_some() != should_be_inserted {
            return Err(MantleError::invariant(format!(
                "breakpoint {id} is {:?} but backend breakpoint is {:?}",
                state.binding(),
                state.backend
            )));
        }
        if state.bound_address.is_some() && location.module_name().is_some() && state.module.is_none() {
            return Err(MantleError::invariant(format!("breakpoint {id} is bound without a module")));
        }
        Ok(())
    }

    fn resolve(&self, state: &mut HandleState, symbols: &Mutex<SymbolStore>, target: &TargetHandle) -> MantleResult<Resolution>
    {
        let mut store = symbols.lock()?;
        match &self.location {
            BreakpointLocation::Address { module: None, address } => Ok(Resolution::Bound {
                module: None,
                address: target.memory_info().address(*address),
            }),
            BreakpointLocation::Address {
                module: Some(name),
                address,
            } => Ok(match store.find_module(name) {
                Some(module) => Resolution::Bound {
                    module: Some(module),
                    address: target.memory_info().address(*address),
                },
                None => Resolution::NotYet,
            }),
            BreakpointLocation::Method { module, method, line } => {
                let Some(module) = store.find_module(module) else {
                    return Ok(Resolution::NotYet);
                };
                let Some(handle) = store.find_method(module, method)? else {
                    debug!(id = %self.id, %method, "method not declared by module");
                    return Ok(Resolution::NotYet);
                };
                if store.method(handle).is_err() {
                    if let Some(callback) = state.load_callback {
                        if store.pending_load_handler(callback) == Some(handle) {
                            return Ok(Resolution::Waiting(callback));
                        }
                    }
                    return Ok(Resolution::Waiting(store.register_load_handler(handle)?));
                }
                let compiled = store.method(handle)?;
                let address = match line {
                    Some(line) => compiled.line_table().lookup_by_line(*line).ok_or_else(|| {
                        MantleError::InvalidArgument(format!("line {line} is not part of {}", compiled.name()))
                    })?,
                    None => compiled.body_start().clone(),
                };
                Ok(Resolution::Bound {
                    module: Some(module),
                    address,
                })
            }
        }
    }

    /// Try to bind an unbound handle; inserts it if enabled.
    ///
    /// Returns `true` if the handle is bound afterwards.
    ///
    /// ## Errors
    ///
    /// Symbol lookup or insertion errors; the handle stays unbound.
    pub fn bind(&self, symbols: &Mutex<SymbolStore>, target: &TargetHandle) -> MantleResult<bool>
    {
        let mut state = self.lock()?;
        if state.bound_address.is_some() {
            return Ok(true);
        }
        match self.resolve(&mut state, symbols, target)? {
            Resolution::NotYet => Ok(false),
            Resolution::Waiting(callback) => {
                state.load_callback = Some(callback);
                debug!(id = %self.id, callback = callback.raw(), "waiting for method to be compiled");
                Ok(false)
            }
            Resolution::Bound { module, address } => {
                if state.enabled {
                    state.backend = Some(target.insert_breakpoint(&address)?);
                }
                info!(id = %self.id, location = %self.location, %address, enabled = state.enabled, "breakpoint bound");
                state.load_callback = None;
                state.module = module;
                state.bound_address = Some(address);
                state.bound_at = Some(SystemTime::now());
                Self::verify(self.id, &self.location, &state)?;
                Ok(true)
            }
        }
    }

    /// Drop the binding, removing the backend breakpoint if inserted.
    ///
    /// Returns `true` if the handle was bound.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if the handle lock is poisoned. A backend
    /// removal failure is logged; the code it patched may already be gone.
    pub fn unbind(&self, target: &TargetHandle) -> MantleResult<bool>
    {
        let mut state = self.lock()?;
        self.unbind_locked(&mut state, target)
    }

    fn unbind_locked(&self, state: &mut HandleState, target: &TargetHandle) -> MantleResult<bool>
    {
        if let Some(backend) = state.backend.take() {
            if let Err(err) = target.remove_breakpoint(backend) {
                warn!(id = %self.id, %backend, error = %err, "could not remove backend breakpoint");
            }
        }
        let was_bound = state.bound_address.take().is_some();
        state.module = None;
        state.load_callback = None;
        if was_bound {
            info!(id = %self.id, location = %self.location, "breakpoint unbound");
        }
        Self::verify(self.id, &self.location, state)?;
        Ok(was_bound)
    }

    /// Enable the definition, inserting it at the retained address.
    ///
    /// ## Errors
    ///
    /// Insertion errors; the definition stays disabled.
    pub fn enable(&self, target: &TargetHandle) -> MantleResult<()>
    {
        let mut state = self.lock()?;
        if state.enabled {
            return Ok(());
        }
        if let Some(address) = &state.bound_address {
            let backend = target.insert_breakpoint(address)?;
            state.backend = Some(backend);
        }
        state.enabled = true;
        Self::verify(self.id, &self.location, &state)
    }

    /// Disable the definition, keeping its address.
    ///
    /// ## Errors
    ///
    /// Removal errors; the definition stays enabled.
    pub fn disable(&self, target: &TargetHandle) -> MantleResult<()>
    {
        let mut state = self.lock()?;
        if !state.enabled {
            return Ok(());
        }
        if let Some(backend) = state.backend {
            target.remove_breakpoint(backend)?;
            state.backend = None;
        }
        state.enabled = false;
        Self::verify(self.id, &self.location, &state)
    }

    /// `true` if the handle is inserted at `address`.
    fn inserted_at(&self, address: &TargetAddress) -> MantleResult<bool>
    {
        let state = self.lock()?;
        Ok(state.backend.is_some() && state.bound_address.as_ref() == Some(address))
    }

    /// Count a hit by `thread`. Returns `true` if it should be reported.
    fn record_hit(&self, thread: ThreadId) -> MantleResult<bool>
    {
        if !self.group.contains(thread) {
            return Ok(false);
        }
        let mut state = self.lock()?;
        state.hit_count = state.hit_count.saturating_add(1);
        Ok(state.hit_count > self.ignore_count)
    }

    fn module(&self) -> MantleResult<Option<ModuleHandle>>
    {
        Ok(self.lock()?.module)
    }

    fn waits_for(&self, callback: LoadCallbackId) -> MantleResult<bool>
    {
        Ok(self.lock()?.load_callback == Some(callback))
    }
}

/// How a stop at a breakpoint address should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitDisposition
{
    /// No client breakpoint is inserted there.
    NotOurs,
    /// Breakpoints exist there but none reports this hit (thread group or
    /// ignore count); resume silently.
    Ignored,
    /// Report a stop for these breakpoints.
    Report(Vec<BreakpointId>),
}

/// Owner of all client breakpoints of a session.
#[derive(Debug)]
pub struct BreakpointManager
{
    target: TargetHandle,
    symbols: Arc<Mutex<SymbolStore>>,
    handles: RwLock<BTreeMap<BreakpointId, Arc<BreakpointHandle>>>,
    next_id: AtomicU64,
}

impl BreakpointManager
{
    /// Manager for breakpoints in `target`.
    #[must_use]
    pub fn new(target: TargetHandle, symbols: Arc<Mutex<SymbolStore>>) -> Self
    {
        Self {
            target,
            symbols,
            handles: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn snapshot(&self) -> MantleResult<Vec<Arc<BreakpointHandle>>>
    {
        Ok(self.handles.read()?.values().cloned().collect())
    }

    fn handle(&self, id: BreakpointId) -> MantleResult<Arc<BreakpointHandle>>
    {
        self.handles
            .read()?
            .get(&id)
            .cloned()
            .ok_or(MantleError::BreakpointIdNotFound(id.raw()))
    }

    /// Register a breakpoint and bind it right away if its code is loaded.
    ///
    /// ## Errors
    ///
    /// [`MantleError::ReadOnly`] when the target cannot take breakpoints.
    /// Resolution failures are logged and leave the breakpoint unbound.
    pub fn create(&self, definition: BreakpointDefinition) -> MantleResult<BreakpointId>
    {
        if !self.target.can_write() {
            return Err(MantleError::ReadOnly { address: 0 });
        }
        let id = BreakpointId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(BreakpointHandle::new(id, definition));
        self.handles.write()?.insert(id, Arc::clone(&handle));
        debug!(%id, location = %handle.location(), "breakpoint created");
        if let Err(err) = handle.bind(&self.symbols, &self.target) {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(%id, error = %err, "breakpoint left unbound");
        }
        Ok(id)
    }

    /// Public state of one breakpoint.
    ///
    /// ## Errors
    ///
    /// [`MantleError::BreakpointIdNotFound`] for unknown ids.
    pub fn get(&self, id: BreakpointId) -> MantleResult<BreakpointInfo>
    {
        self.handle(id)?.info()
    }

    /// Enable a breakpoint.
    ///
    /// ## Errors
    ///
    /// Unknown id or insertion failure.
    pub fn enable(&self, id: BreakpointId) -> MantleResult<()>
    {
        self.handle(id)?.enable(&self.target)
    }

    /// Disable a breakpoint.
    ///
    /// ## Errors
    ///
    /// Unknown id or removal failure.
    pub fn disable(&self, id: BreakpointId) -> MantleResult<()>
    {
        self.handle(id)?.disable(&self.target)
    }

    /// Delete a breakpoint, removing it from the target and cancelling any
    /// pending load callback.
    ///
    /// ## Errors
    ///
    /// [`MantleError::BreakpointIdNotFound`] for unknown ids.
    pub fn remove(&self, id: BreakpointId) -> MantleResult<BreakpointInfo>
    {
        let handle = self
            .handles
            .write()?
            .remove(&id)
            .ok_or(MantleError::BreakpointIdNotFound(id.raw()))?;
        let info = handle.info()?;
        if let Some(callback) = info.pending_callback {
            self.symbols.lock()?.remove_load_handler(callback);
        }
        handle.unbind(&self.target)?;
        debug!(%id, "breakpoint removed");
        Ok(info)
    }

    /// All breakpoints in id order.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if a lock is poisoned.
    pub fn list(&self) -> MantleResult<Vec<BreakpointInfo>>
    {
        self.snapshot()?.iter().map(|h| h.info()).collect()
    }

    fn bind_all(&self, handles: Vec<Arc<BreakpointHandle>>) -> MantleResult<Vec<BreakpointId>>
    {
        let mut bound = Vec::new();
        for handle in handles {
            match handle.bind(&self.symbols, &self.target) {
                Ok(true) => bound.push(handle.id()),
                Ok(false) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(id = %handle.id(), error = %err, "breakpoint could not be bound"),
            }
        }
        Ok(bound)
    }

    /// A module was loaded: bind every breakpoint that can now be resolved.
    /// Returns the breakpoints that became bound.
    ///
    /// ## Errors
    ///
    /// Only fatal errors; per-breakpoint failures are logged.
    pub fn module_loaded(&self, module: ModuleHandle) -> MantleResult<Vec<BreakpointId>>
    {
        let name = self.symbols.lock()?.module(module)?.name().to_owned();
        let candidates = self
            .snapshot()?
            .into_iter()
            .filter(|h| h.location().module_name().is_some())
            .collect();
        let bound = self.bind_all(candidates)?;
        debug!(%module, %name, bound = bound.len(), "breakpoints resolved after module load");
        Ok(bound)
    }

    /// A module was unloaded: unbind every breakpoint bound into it,
    /// regardless of its enabled flag. Returns the breakpoints unbound.
    ///
    /// ## Errors
    ///
    /// Only fatal errors.
    pub fn module_unloaded(&self, module: ModuleHandle) -> MantleResult<Vec<BreakpointId>>
    {
        let mut unbound = Vec::new();
        for handle in self.snapshot()? {
            if handle.module()? == Some(module) && handle.unbind(&self.target)? {
                unbound.push(handle.id());
            }
        }
        Ok(unbound)
    }

    /// A load callback fired: bind the breakpoints waiting for it.
    ///
    /// ## Errors
    ///
    /// Only fatal errors.
    pub fn method_loaded(&self, loaded: MethodLoaded) -> MantleResult<Vec<BreakpointId>>
    {
        let mut waiting = Vec::new();
        for handle in self.snapshot()? {
            if handle.waits_for(loaded.callback)? {
                waiting.push(handle);
            }
        }
        self.bind_all(waiting)
    }

    /// Decide whether a breakpoint stop of `thread` at `pc` is reported.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if a lock is poisoned.
    pub fn hits_at(&self, pc: &TargetAddress, thread: ThreadId) -> MantleResult<HitDisposition>
    {
        let mut found = false;
        let mut report = Vec::new();
        for handle in self.snapshot()? {
            if !handle.inserted_at(pc)? {
                continue;
            }
            found = true;
            if handle.record_hit(thread)? {
                report.push(handle.id());
            }
        }
        Ok(match (found, report.is_empty()) {
            (false, _) => HitDisposition::NotOurs,
            (true, true) => HitDisposition::Ignored,
            (true, false) => HitDisposition::Report(report),
        })
    }

    /// Check the binding invariant of every breakpoint.
    ///
    /// ## Errors
    ///
    /// The first violation found.
    pub fn check_invariants(&self) -> MantleResult<()>
    {
        self.snapshot()?.iter().try_for_each(|h| h.check_invariant())
    }
}
