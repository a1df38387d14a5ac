//! Per-module symbol index.

use std::collections::{BTreeMap, HashMap};

use tracing::{trace, warn};

use crate::error::MantleResult;
use crate::symbols::abi::{MethodDescriptor, ModuleDescriptor, SourceMethod};
use crate::symbols::line_table::LineTable;
use crate::types::{MethodHandle, ModuleHandle, TargetAddress};

/// A compiled method.
#[derive(Debug, Clone)]
pub struct Method
{
    handle: MethodHandle,
    name: String,
    flags: u32,
    line_table: LineTable,
}

impl Method
{
    /// Build from a decoded descriptor.
    #[must_use]
    pub fn from_descriptor(module: ModuleHandle, descriptor: MethodDescriptor, name: String) -> Self
    {
        let line_table = LineTable::from_blob(descriptor.start, descriptor.end, descriptor.body_start, descriptor.rows);
        Self {
            handle: MethodHandle {
                module,
                token: descriptor.token,
            },
            name,
            flags: descriptor.flags,
            line_table,
        }
    }

    /// Handle of this method.
    #[must_use]
    pub const fn handle(&self) -> MethodHandle
    {
        self.handle
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Runtime flags from the descriptor.
    #[must_use]
    pub const fn flags(&self) -> u32
    {
        self.flags
    }

    /// First byte of native code.
    #[must_use]
    pub const fn start(&self) -> &TargetAddress
    {
        self.line_table.start()
    }

    /// One past the last byte of native code.
    #[must_use]
    pub const fn end(&self) -> &TargetAddress
    {
        self.line_table.end()
    }

    /// First byte after the prologue, or the start when there is none.
    #[must_use]
    pub fn body_start(&self) -> &TargetAddress
    {
        self.line_table.body_start().unwrap_or_else(|| self.line_table.start())
    }

    /// Line table.
    #[must_use]
    pub const fn line_table(&self) -> &LineTable
    {
        &self.line_table
    }

    /// `true` if `address` lies in this method's code.
    #[must_use]
    pub fn contains(&self, address: &TargetAddress) -> bool
    {
        address.is_within(self.start(), self.end()).unwrap_or(false)
    }
}

/// A type that finished initialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeEntry
{
    /// Metadata token
    pub token: u32,
    /// Runtime class handle
    pub class: TargetAddress,
    /// Type name
    pub name: String,
}

/// What adding a method record did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodChange
{
    /// First time this token was seen.
    Added,
    /// Same start, larger end: the code was emitted in another pass.
    Extended,
    /// Identical to what is already known.
    Unchanged,
    /// Different start: the method was recompiled.
    Replaced,
}

impl MethodChange
{
    /// `true` if the method's code is new or moved.
    #[must_use]
    pub const fn is_new_code(self) -> bool
    {
        matches!(self, MethodChange::Added | MethodChange::Replaced)
    }
}

/// Symbol index of one loaded module.
///
/// Methods live in an arena indexed by token and by start address. The whole
/// index is dropped with the `SymbolFile` when the module unloads.
#[derive(Debug, Clone)]
pub struct SymbolFile
{
    handle: ModuleHandle,
    name: String,
    image: TargetAddress,
    descriptor: TargetAddress,
    dynamic: bool,
    methods: Vec<Method>,
    by_token: HashMap<u32, usize>,
    // Keyed by (start, token): two tokens may share a start address.
    by_start: BTreeMap<(i64, u32), usize>,
    types: HashMap<TargetAddress, TypeEntry>,
    source_methods: Vec<SourceMethod>,
}

impl SymbolFile
{
    /// Empty index for a freshly loaded module.
    #[must_use]
    pub fn new(handle: ModuleHandle, address: TargetAddress, descriptor: ModuleDescriptor) -> Self
    {
        Self {
            handle,
            name: descriptor.name,
            image: descriptor.image,
            descriptor: address,
            dynamic: descriptor.dynamic,
            methods: Vec::new(),
            by_token: HashMap::new(),
            by_start: BTreeMap::new(),
            types: HashMap::new(),
            source_methods: descriptor.source_methods,
        }
    }

    /// Generation-tagged handle.
    #[must_use]
    pub const fn handle(&self) -> ModuleHandle
    {
        self.handle
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Runtime image handle.
    #[must_use]
    pub const fn image(&self) -> &TargetAddress
    {
        &self.image
    }

    /// Address of the module descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &TargetAddress
    {
        &self.descriptor
    }

    /// Code generated at run time.
    #[must_use]
    pub const fn is_dynamic(&self) -> bool
    {
        self.dynamic
    }

    /// `true` if `name` names this module, with or without directory and
    /// extension.
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool
    {
        if self.name == name {
            return true;
        }
        let base = self.name.rsplit(['/', '\\']).next().unwrap_or(&self.name);
        let stem = base.rsplit_once('.').map_or(base, |(stem, _)| stem);
        base == name || stem == name
    }

    /// Record a compiled method.
    ///
    /// ## Errors
    ///
    /// [`crate::error::MantleError::DomainMismatch`] if the new range is in
    /// another domain than the known one.
    pub fn add_method(&mut self, method: Method) -> MantleResult<MethodChange>
    {
        let token = method.handle.token;
        let Some(&slot) = self.by_token.get(&token) else {
            let slot = self.methods.len();
            self.by_token.insert(token, slot);
            self.index_start(&method, slot);
            trace!(module = %self.handle, token = format_args!("0x{token:08x}"), start = %method.start(), "method added");
            self.methods.push(method);
            return Ok(MethodChange::Added);
        };

        let existing = &mut self.methods[slot];
        if existing.start() == method.start() {
            let grew = existing.line_table.extend_end(method.end().clone())?;
            return Ok(if grew { MethodChange::Extended } else { MethodChange::Unchanged });
        }

        self.by_start.remove(&(existing.start().offset(), token));
        self.index_start(&method, slot);
        trace!(module = %self.handle, token = format_args!("0x{token:08x}"), start = %method.start(), "method recompiled");
        self.methods[slot] = method;
        Ok(MethodChange::Replaced)
    }

    fn index_start(&mut self, method: &Method, slot: usize)
    {
        let start = method.start().offset();
        let token = method.handle.token;
        if let Some(((_, other), _)) = self.by_start.range((start, 0)..=(start, u32::MAX)).next() {
            warn!(
                module = %self.handle,
                token = format_args!("0x{token:08x}"),
                other = format_args!("0x{other:08x}"),
                start = %method.start(),
                "two methods start at the same address"
            );
        }
        self.by_start.insert((start, token), slot);
    }

    /// Record an initialised type.
    pub fn add_type(&mut self, entry: TypeEntry) -> bool
    {
        self.types.insert(entry.class.clone(), entry).is_none()
    }

    /// Compiled method by token.
    #[must_use]
    pub fn method_by_token(&self, token: u32) -> Option<&Method>
    {
        self.by_token.get(&token).map(|&slot| &self.methods[slot])
    }

    /// Compiled method containing `address`.
    #[must_use]
    pub fn method_at(&self, address: &TargetAddress) -> Option<&Method>
    {
        let offset = address.offset();
        let (&(start, _), _) = self.by_start.range(..=(offset, u32::MAX)).next_back()?;
        // Among methods sharing that start, the one added last wins.
        self.by_start
            .range((start, 0)..=(start, u32::MAX))
            .map(|(_, &slot)| slot)
            .filter(|&slot| self.methods[slot].contains(address))
            .max()
            .map(|slot| &self.methods[slot])
    }

    /// Token of the method called `name`, compiled or not.
    #[must_use]
    pub fn token_for_name(&self, name: &str) -> Option<u32>
    {
        self.methods
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.handle.token)
            .or_else(|| self.source_methods.iter().find(|m| m.name == name).map(|m| m.token))
    }

    /// Source-method entry by token.
    #[must_use]
    pub fn source_method(&self, token: u32) -> Option<&SourceMethod>
    {
        self.source_methods.iter().find(|m| m.token == token)
    }

    /// Name of method `token` from the compiled index or the source list.
    #[must_use]
    pub fn method_name(&self, token: u32) -> Option<&str>
    {
        self.method_by_token(token)
            .map(Method::name)
            .or_else(|| self.source_method(token).map(|m| m.name.as_str()))
    }

    /// Compiled methods.
    pub fn methods(&self) -> impl Iterator<Item = &Method>
    {
        self.methods.iter()
    }

    /// Type by class handle.
    #[must_use]
    pub fn type_by_class(&self, class: &TargetAddress) -> Option<&TypeEntry>
    {
        self.types.get(class)
    }

    /// Initialised types.
    pub fn types(&self) -> impl Iterator<Item = &TypeEntry>
    {
        self.types.values()
    }

    /// Number of compiled methods.
    #[must_use]
    pub fn method_count(&self) -> usize
    {
        self.methods.len()
    }

    /// Number of initialised types.
    #[must_use]
    pub fn type_count(&self) -> usize
    {
        self.types.len()
    }
}
