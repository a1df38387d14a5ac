//! # Symbol Store
//!
//! The engine's view of what the runtime has loaded: modules, their compiled
//! methods and initialised types, the data tables that announce new code, and
//! callbacks waiting for specific methods to be compiled.
//!
//! The store is rebuilt entirely from target memory. It is mutated from two
//! places, the notification dispatcher and explicit client refreshes, and is
//! kept behind its own mutex by the session.
//!
//! ## Incremental updates
//!
//! [`SymbolStore::update`] visits each tracked data table, re-reads only its
//! current chunk header and parses only the bytes appended since the previous
//! pass. A failing table is logged and skipped for this pass; the others are
//! still updated.

use std::collections::{BTreeMap, HashMap};
use std::mem;

use tracing::{debug, info, trace, warn};

use crate::error::{MantleError, MantleResult};
use crate::memory::MemoryAccessor;
use crate::symbols::abi::{
    read_pointer_list, DataRecord, DataTableDescriptor, EntryMethod, MethodDescriptor, ModuleDescriptor,
    SymbolTableHeader, TypeRecord,
};
use crate::symbols::module::{Method, MethodChange, SymbolFile, TypeEntry};
use crate::symbols::table::DataTableCursor;
use crate::types::{LoadCallbackId, MethodHandle, ModuleHandle, TargetAddress};

/// Bounds applied by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits
{
    /// Chunks one table may advance through in a single update.
    pub max_chunks_per_update: usize,
    /// Records kept for modules that have not been loaded yet.
    pub max_deferred_records: usize,
    /// Longest name read from the target.
    pub max_string_length: usize,
    /// Most method entries in a module descriptor and most line rows in a
    /// method descriptor.
    pub max_table_entries: usize,
}

impl Default for StoreLimits
{
    fn default() -> Self
    {
        Self {
            max_chunks_per_update: 64,
            max_deferred_records: 4096,
            max_string_length: crate::memory::DEFAULT_MAX_STRING_LENGTH,
            max_table_entries: 65_536,
        }
    }
}

/// A load callback fired because its method was compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodLoaded
{
    /// Callback that fired
    pub callback: LoadCallbackId,
    /// The compiled method
    pub method: MethodHandle,
}

/// Result of one [`SymbolStore::update`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary
{
    /// Records parsed
    pub records: usize,
    /// Bytes read from data areas
    pub bytes: usize,
    /// Methods added or recompiled
    pub new_methods: usize,
    /// Types added
    pub new_types: usize,
    /// Records deferred because their module is unknown
    pub deferred: usize,
    /// Tables whose pass was aborted
    pub failed_tables: usize,
}

impl UpdateSummary
{
    /// `true` if nothing new was read.
    #[must_use]
    pub const fn is_empty(&self) -> bool
    {
        self.records == 0 && self.bytes == 0
    }
}

/// Counters over the life of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatistics
{
    /// Calls to [`SymbolStore::update`]
    pub update_passes: u64,
    /// Record ranges read from the target
    pub range_reads: u64,
    /// Bytes of records parsed
    pub bytes_parsed: u64,
    /// Records parsed
    pub records_parsed: u64,
    /// Table passes aborted by an error
    pub failed_table_passes: u64,
    /// Deferred records dropped for lack of space
    pub deferred_dropped: u64,
}

/// Index of everything the runtime has reported.
#[derive(Debug)]
pub struct SymbolStore
{
    limits: StoreLimits,
    header: Option<SymbolTableHeader>,
    modules: BTreeMap<i32, SymbolFile>,
    generation: u64,
    tables: BTreeMap<i32, DataTableCursor>,
    deferred: HashMap<i32, Vec<DataRecord>>,
    deferred_count: usize,
    handlers: BTreeMap<LoadCallbackId, MethodHandle>,
    next_callback: u32,
    fired: Vec<MethodLoaded>,
    main: Option<MethodHandle>,
    stats: StoreStatistics,
}

impl SymbolStore
{
    /// Empty store.
    #[must_use]
    pub fn new(limits: StoreLimits) -> Self
    {
        Self {
            limits,
            header: None,
            modules: BTreeMap::new(),
            generation: 0,
            tables: BTreeMap::new(),
            deferred: HashMap::new(),
            deferred_count: 0,
            handlers: BTreeMap::new(),
            next_callback: 1,
            fired: Vec::new(),
            main: None,
            stats: StoreStatistics::default(),
        }
    }

    /// Limits in effect.
    #[must_use]
    pub const fn limits(&self) -> StoreLimits
    {
        self.limits
    }

    /// Read the symbol-table header at `address` and load every module and
    /// data table it lists. Returns the modules loaded.
    ///
    /// ## Errors
    ///
    /// [`MantleError::DebugInfoMalformed`] for a bad header. A module or
    /// table that fails to load is logged and skipped.
    pub fn initialize<M: MemoryAccessor + ?Sized>(&mut self, memory: &M, address: &TargetAddress) -> MantleResult<Vec<ModuleHandle>>
    {
        let header = SymbolTableHeader::read(memory, address)?;
        info!(version = header.version, %address, "symbol table found");

        let mut loaded = Vec::new();
        let mut descriptors = read_pointer_list(memory, &header.modules)?;
        if !header.corlib.is_null() && !descriptors.contains(&header.corlib) {
            descriptors.insert(0, header.corlib.clone());
        }
        for descriptor in descriptors {
            match self.load_module(memory, &descriptor) {
                Ok(handle) => loaded.push(handle),
                Err(err) => warn!(%descriptor, error = %err, "skipping module from symbol table"),
            }
        }

        // The type table goes first so it keeps its domain against any list
        // entry naming the same one.
        let mut tables = Vec::new();
        if !header.type_table.is_null() {
            tables.push(header.type_table.clone());
        }
        tables.extend(read_pointer_list(memory, &header.data_tables)?);
        for table in tables {
            if let Err(err) = self.add_data_table(memory, &table) {
                warn!(%table, error = %err, "skipping data table from symbol table");
            }
        }

        self.header = Some(header);
        Ok(loaded)
    }

    /// Header read by [`Self::initialize`].
    #[must_use]
    pub const fn header(&self) -> Option<&SymbolTableHeader>
    {
        self.header.as_ref()
    }

    /// Create the index for the module described at `descriptor` and replay
    /// any records that arrived before it.
    ///
    /// ## Errors
    ///
    /// Memory or malformed-descriptor errors.
    pub fn load_module<M: MemoryAccessor + ?Sized>(&mut self, memory: &M, descriptor: &TargetAddress) -> MantleResult<ModuleHandle>
    {
        let decoded = ModuleDescriptor::read(
            memory,
            descriptor,
            self.limits.max_string_length,
            self.limits.max_table_entries,
        )?;
        let index = decoded.index;
        if let Some(previous) = self.modules.get(&index) {
            warn!(index, old = %previous.name(), new = %decoded.name, "module index reused without unload");
            self.unload_module(index)?;
        }

        self.generation += 1;
        let handle = ModuleHandle::new(index, self.generation);
        info!(%handle, name = %decoded.name, methods = decoded.source_methods.len(), "module loaded");
        self.modules.insert(index, SymbolFile::new(handle, descriptor.clone(), decoded));

        if let Some(records) = self.deferred.remove(&index) {
            self.deferred_count -= records.len();
            debug!(%handle, count = records.len(), "replaying deferred records");
            let mut summary = UpdateSummary::default();
            for record in records {
                self.apply_record(memory, record, &mut summary);
            }
        }
        Ok(handle)
    }

    /// Drop module `index` and everything keyed by it.
    ///
    /// ## Errors
    ///
    /// [`MantleError::LocationInvalid`] if the module is not loaded.
    pub fn unload_module(&mut self, index: i32) -> MantleResult<ModuleHandle>
    {
        let module = self
            .modules
            .remove(&index)
            .ok_or_else(|| MantleError::LocationInvalid(format!("module {index} is not loaded")))?;
        let handle = module.handle();
        self.handlers.retain(|_, method| method.module != handle);
        self.fired.retain(|loaded| loaded.method.module != handle);
        if self.main.is_some_and(|main| main.module == handle) {
            self.main = None;
        }
        if let Some(records) = self.deferred.remove(&index) {
            self.deferred_count -= records.len();
        }
        info!(%handle, name = %module.name(), "module unloaded");
        Ok(handle)
    }

    /// Start tailing the data table described at `table`. Returns its domain.
    /// A domain that already has a table keeps it until
    /// [`Self::destroy_data_table`].
    ///
    /// ## Errors
    ///
    /// Memory or malformed-descriptor errors.
    pub fn add_data_table<M: MemoryAccessor + ?Sized>(&mut self, memory: &M, table: &TargetAddress) -> MantleResult<i32>
    {
        let descriptor = DataTableDescriptor::read(memory, table)?;
        let domain = descriptor.domain;
        if let Some(existing) = self.tables.get(&domain) {
            if existing.table_address() != table {
                warn!(domain, kept = %existing.table_address(), ignored = %table, "domain already has a data table");
            }
            return Ok(domain);
        }
        debug!(domain, %table, first_chunk = %descriptor.first_chunk, "tracking data table");
        self.tables
            .insert(domain, DataTableCursor::new(domain, table.clone(), descriptor.first_chunk));
        Ok(domain)
    }

    /// Stop tailing the table of `domain`. Returns `false` if it was not
    /// tracked.
    pub fn destroy_data_table(&mut self, domain: i32, table: &TargetAddress) -> bool
    {
        match self.tables.remove(&domain) {
            Some(cursor) => {
                if cursor.table_address() != table {
                    warn!(domain, tracked = %cursor.table_address(), reported = %table, "domain unload names another table");
                }
                debug!(domain, "data table dropped");
                true
            }
            None => false,
        }
    }

    /// Cursor of the table of `domain`.
    #[must_use]
    pub fn data_table(&self, domain: i32) -> Option<&DataTableCursor>
    {
        self.tables.get(&domain)
    }

    /// Parse everything appended to any data table since the last pass.
    ///
    /// Never fails: a table whose header or records cannot be read is logged,
    /// counted in [`UpdateSummary::failed_tables`] and retried next time.
    pub fn update<M: MemoryAccessor + ?Sized>(&mut self, memory: &M) -> UpdateSummary
    {
        let mut summary = UpdateSummary::default();
        self.stats.update_passes += 1;

        let mut tables = mem::take(&mut self.tables);
        for cursor in tables.values_mut() {
            if let Err(err) = self.update_table(memory, cursor, &mut summary) {
                warn!(domain = cursor.domain(), chunk = %cursor.current_chunk(), error = %err, "data table update aborted");
                summary.failed_tables += 1;
                self.stats.failed_table_passes += 1;
            }
        }
        // Tables added while records were applied are kept alongside.
        tables.append(&mut self.tables);
        self.tables = tables;

        if !summary.is_empty() {
            debug!(
                records = summary.records,
                bytes = summary.bytes,
                methods = summary.new_methods,
                types = summary.new_types,
                "symbol tables updated"
            );
        }
        summary
    }

    fn update_table<M: MemoryAccessor + ?Sized>(
        &mut self,
        memory: &M,
        cursor: &mut DataTableCursor,
        summary: &mut UpdateSummary,
    ) -> MantleResult<()>
    {
        for _ in 0..self.limits.max_chunks_per_update {
            let header = cursor.read_header(memory)?;
            if header.consumed > cursor.last_consumed_offset() {
                let batch = cursor.read_records(memory, &header)?;
                self.stats.range_reads += 1;
                self.stats.bytes_parsed += batch.bytes_read as u64;
                self.stats.records_parsed += batch.records.len() as u64;
                summary.bytes += batch.bytes_read;
                summary.records += batch.records.len();
                for record in batch.records {
                    self.apply_record(memory, record, summary);
                }
                cursor.advance_to(batch.end_offset)?;
                if let Some(message) = batch.malformed {
                    return Err(MantleError::DebugInfoMalformed(message));
                }
            }

            let exhausted = header.consumed == header.allocated && cursor.last_consumed_offset() == header.consumed;
            if exhausted && !header.next.is_null() {
                cursor.follow(header.next);
                continue;
            }
            return Ok(());
        }
        warn!(domain = cursor.domain(), "chunk limit reached; remaining chunks are read next update");
        Ok(())
    }

    fn defer(&mut self, index: i32, record: DataRecord, summary: &mut UpdateSummary)
    {
        if self.deferred_count >= self.limits.max_deferred_records {
            warn!(module = index, "dropping record for unknown module: deferred queue full");
            self.stats.deferred_dropped += 1;
            return;
        }
        trace!(module = index, "deferring record for unknown module");
        self.deferred.entry(index).or_default().push(record);
        self.deferred_count += 1;
        summary.deferred += 1;
    }

    fn apply_record<M: MemoryAccessor + ?Sized>(&mut self, memory: &M, record: DataRecord, summary: &mut UpdateSummary)
    {
        match record {
            DataRecord::Method(method) => {
                if !self.modules.contains_key(&method.module_index) {
                    let index = method.module_index;
                    self.defer(index, DataRecord::Method(method), summary);
                    return;
                }
                let result = MethodDescriptor::read(memory, &method.descriptor, self.limits.max_table_entries)
                    .and_then(|descriptor| self.add_method(memory, method.module_index, descriptor, None));
                match result {
                    Ok(Some(change)) if change.is_new_code() => summary.new_methods += 1,
                    Ok(_) => {}
                    Err(err) => warn!(descriptor = %method.descriptor, error = %err, "skipping method record"),
                }
            }
            DataRecord::Type(ty) => {
                if !self.modules.contains_key(&ty.module_index) {
                    let index = ty.module_index;
                    self.defer(index, DataRecord::Type(ty), summary);
                    return;
                }
                match self.add_type(memory, ty) {
                    Ok(true) => summary.new_types += 1,
                    Ok(false) => {}
                    Err(err) => warn!(error = %err, "skipping type record"),
                }
            }
            DataRecord::Unknown { kind, size } => {
                warn!(kind, size, "skipping record of unknown kind");
            }
        }
    }

    fn add_type<M: MemoryAccessor + ?Sized>(&mut self, memory: &M, record: TypeRecord) -> MantleResult<bool>
    {
        let name = if record.name.is_null() {
            format!("<type 0x{:08x}>", record.token)
        } else {
            memory.read_string(&record.name, self.limits.max_string_length)?
        };
        let module = self
            .modules
            .get_mut(&record.module_index)
            .ok_or_else(|| MantleError::LocationInvalid(format!("module {} is not loaded", record.module_index)))?;
        Ok(module.add_type(TypeEntry {
            token: record.token,
            class: record.class,
            name,
        }))
    }

    fn add_method<M: MemoryAccessor + ?Sized>(
        &mut self,
        memory: &M,
        module_index: i32,
        descriptor: MethodDescriptor,
        callback: Option<LoadCallbackId>,
    ) -> MantleResult<Option<MethodChange>>
    {
        let Some(module) = self.modules.get(&module_index) else {
            return Err(MantleError::LocationInvalid(format!("module {module_index} is not loaded")));
        };
        let token = descriptor.token;
        let name = if descriptor.name.is_null() {
            module
                .method_name(token)
                .map_or_else(|| format!("<method 0x{token:08x}>"), str::to_owned)
        } else {
            memory.read_string(&descriptor.name, self.limits.max_string_length)?
        };

        let handle = module.handle();
        let method = Method::from_descriptor(handle, descriptor, name);
        let method_handle = method.handle();
        let change = match self.modules.get_mut(&module_index) {
            Some(module) => module.add_method(method)?,
            None => return Ok(None),
        };
        if change.is_new_code() || callback.is_some() {
            self.fire_handlers(method_handle, callback);
        }
        Ok(Some(change))
    }

    fn fire_handlers(&mut self, method: MethodHandle, callback: Option<LoadCallbackId>)
    {
        let matching: Vec<LoadCallbackId> = self
            .handlers
            .iter()
            .filter(|(id, target)| **target == method || Some(**id) == callback)
            .map(|(id, _)| *id)
            .collect();
        for id in matching {
            self.handlers.remove(&id);
            debug!(callback = id.raw(), %method, "load callback fired");
            self.fired.push(MethodLoaded { callback: id, method });
        }
    }

    /// Handle a new-code-ready notification: the method described at
    /// `descriptor` was compiled, possibly in answer to `callback`.
    ///
    /// ## Errors
    ///
    /// Memory errors, or [`MantleError::LocationInvalid`] if the method's
    /// module is not loaded.
    pub fn method_compiled<M: MemoryAccessor + ?Sized>(
        &mut self,
        memory: &M,
        descriptor: &TargetAddress,
        callback: Option<LoadCallbackId>,
    ) -> MantleResult<MethodHandle>
    {
        let decoded = MethodDescriptor::read(memory, descriptor, self.limits.max_table_entries)?;
        let module_index = decoded.module_index;
        let token = decoded.token;
        self.add_method(memory, module_index, decoded, callback)?;
        let module = self.modules.get(&module_index).map(SymbolFile::handle).ok_or_else(|| {
            MantleError::invariant(format!("module {module_index} vanished while adding a method"))
        })?;
        Ok(MethodHandle { module, token })
    }

    /// Record the program's entry method from a runtime-initialized
    /// notification.
    ///
    /// ## Errors
    ///
    /// Memory errors, or [`MantleError::LocationInvalid`] if no loaded module
    /// has the entry method's image.
    pub fn reached_main<M: MemoryAccessor + ?Sized>(&mut self, memory: &M, entry: &TargetAddress) -> MantleResult<MethodHandle>
    {
        let decoded = EntryMethod::read(memory, entry)?;
        let module = self
            .modules
            .values()
            .find(|m| m.image() == &decoded.image)
            .ok_or_else(|| MantleError::LocationInvalid(format!("no module with image {}", decoded.image)))?;
        let main = MethodHandle {
            module: module.handle(),
            token: decoded.token,
        };
        info!(%main, "entry method reached");
        self.main = Some(main);
        Ok(main)
    }

    /// Entry method, once known.
    #[must_use]
    pub const fn main_method(&self) -> Option<MethodHandle>
    {
        self.main
    }

    /// Loaded module by handle.
    ///
    /// ## Errors
    ///
    /// [`MantleError::LocationInvalid`] if the module was unloaded.
    pub fn module(&self, handle: ModuleHandle) -> MantleResult<&SymbolFile>
    {
        self.modules
            .get(&handle.index())
            .filter(|m| m.handle() == handle)
            .ok_or_else(|| MantleError::LocationInvalid(format!("{handle} is no longer loaded")))
    }

    /// Compiled method by handle.
    ///
    /// ## Errors
    ///
    /// [`MantleError::LocationInvalid`] if its module was unloaded or the
    /// method is not compiled.
    pub fn method(&self, handle: MethodHandle) -> MantleResult<&Method>
    {
        self.module(handle.module)?
            .method_by_token(handle.token)
            .ok_or_else(|| MantleError::LocationInvalid(format!("method {handle} is not compiled")))
    }

    /// Loaded modules in index order.
    pub fn modules(&self) -> impl Iterator<Item = &SymbolFile>
    {
        self.modules.values()
    }

    /// Module whose name matches `name`.
    #[must_use]
    pub fn find_module(&self, name: &str) -> Option<ModuleHandle>
    {
        self.modules.values().find(|m| m.matches_name(name)).map(SymbolFile::handle)
    }

    /// Method of `module` called `name`, compiled or not.
    ///
    /// ## Errors
    ///
    /// [`MantleError::LocationInvalid`] if the module was unloaded.
    pub fn find_method(&self, module: ModuleHandle, name: &str) -> MantleResult<Option<MethodHandle>>
    {
        Ok(self
            .module(module)?
            .token_for_name(name)
            .map(|token| MethodHandle { module, token }))
    }

    /// Compiled method containing `address`.
    #[must_use]
    pub fn lookup_method(&self, address: &TargetAddress) -> Option<&Method>
    {
        self.modules.values().find_map(|m| m.method_at(address))
    }

    /// Ask to be told when `method` is compiled.
    ///
    /// ## Errors
    ///
    /// [`MantleError::LocationInvalid`] if its module was unloaded.
    pub fn register_load_handler(&mut self, method: MethodHandle) -> MantleResult<LoadCallbackId>
    {
        self.module(method.module)?;
        let id = LoadCallbackId::from_raw(self.next_callback);
        self.next_callback = self.next_callback.wrapping_add(1).max(1);
        self.handlers.insert(id, method);
        debug!(callback = id.raw(), %method, "load callback registered");
        Ok(id)
    }

    /// Cancel a load callback. Returns `false` if it was not pending.
    pub fn remove_load_handler(&mut self, id: LoadCallbackId) -> bool
    {
        self.handlers.remove(&id).is_some()
    }

    /// Method a pending callback waits for.
    #[must_use]
    pub fn pending_load_handler(&self, id: LoadCallbackId) -> Option<MethodHandle>
    {
        self.handlers.get(&id).copied()
    }

    /// Callbacks fired since the last call.
    pub fn take_fired(&mut self) -> Vec<MethodLoaded>
    {
        mem::take(&mut self.fired)
    }

    /// Records waiting for a module to load.
    #[must_use]
    pub const fn deferred_records(&self) -> usize
    {
        self.deferred_count
    }

    /// Lifetime counters.
    #[must_use]
    pub const fn statistics(&self) -> StoreStatistics
    {
        self.stats
    }
}
