//! # Breakpoint Builder
//!
//! Fluent construction of [`BreakpointDefinition`]s.

use std::collections::BTreeSet;

use crate::breakpoints::{BreakpointDefinition, BreakpointId, BreakpointLocation, BreakpointManager, ThreadGroup};
use crate::error::MantleResult;
use crate::types::ThreadId;

/// Builder for configuring breakpoints before creation.
///
/// ## Example
///
/// ```rust
/// use mantle_core::breakpoints::builder::BreakpointBuilder;
/// use mantle_core::breakpoints::{BreakpointLocation, ThreadGroup};
/// use mantle_core::types::ThreadId;
///
/// let definition = BreakpointBuilder::method("app.dll", "Program.Main")
///     .at_line(12)
///     .with_hit_count(3)
///     .for_thread(ThreadId::from(7))
///     .build();
/// assert_eq!(definition.ignore_count, 2);
/// assert!(matches!(definition.location, BreakpointLocation::Method { line: Some(12), .. }));
/// assert!(matches!(definition.group, ThreadGroup::Threads(_)));
/// ```
#[derive(Debug, Clone)]
pub struct BreakpointBuilder
{
    location: BreakpointLocation,
    hit_count: Option<u64>,
    threads: BTreeSet<ThreadId>,
    enabled: bool,
}

impl BreakpointBuilder
{
    /// Break in method `method` of module `module`.
    pub fn method(module: impl Into<String>, method: impl Into<String>) -> Self
    {
        Self::at(BreakpointLocation::Method {
            module: module.into(),
            method: method.into(),
            line: None,
        })
    }

    /// Break at an absolute address.
    #[must_use]
    pub fn address(address: u64) -> Self
    {
        Self::at(BreakpointLocation::Address { module: None, address })
    }

    fn at(location: BreakpointLocation) -> Self
    {
        Self {
            location,
            hit_count: None,
            threads: BTreeSet::new(),
            enabled: true,
        }
    }

    /// Break at `line` instead of the method's first line. Ignored for
    /// address breakpoints.
    #[must_use]
    pub fn at_line(mut self, line: u32) -> Self
    {
        if let BreakpointLocation::Method { line: slot, .. } = &mut self.location {
            *slot = Some(line);
        }
        self
    }

    /// Tie an address breakpoint to the lifetime of `module`.
    #[must_use]
    pub fn in_module(mut self, name: impl Into<String>) -> Self
    {
        if let BreakpointLocation::Address { module, .. } = &mut self.location {
            *module = Some(name.into());
        }
        self
    }

    /// Set the hit count threshold.
    ///
    /// The breakpoint only reports from its `count`-th hit on.
    #[must_use]
    pub fn with_hit_count(mut self, count: u64) -> Self
    {
        self.hit_count = Some(count);
        self
    }

    /// Make the breakpoint thread-specific. May be called repeatedly to
    /// build a thread group.
    #[must_use]
    pub fn for_thread(mut self, thread_id: ThreadId) -> Self
    {
        self.threads.insert(thread_id);
        self
    }

    /// Create the breakpoint disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self
    {
        self.enabled = false;
        self
    }

    /// The configured location.
    #[must_use]
    pub fn location(&self) -> &BreakpointLocation
    {
        &self.location
    }

    /// Get the configured hit count threshold, if any.
    #[must_use]
    pub fn hit_count(&self) -> Option<u64>
    {
        self.hit_count
    }

    /// Finish the definition.
    #[must_use]
    pub fn build(self) -> BreakpointDefinition
    {
        BreakpointDefinition {
            location: self.location,
            group: if self.threads.is_empty() {
                ThreadGroup::Global
            } else {
                ThreadGroup::Threads(self.threads)
            },
            ignore_count: self.hit_count.map_or(0, |count| count.saturating_sub(1)),
            enabled: self.enabled,
        }
    }

    /// Build and register the breakpoint with `manager`.
    ///
    /// ## Errors
    ///
    /// See [`BreakpointManager::create`].
    pub fn install(self, manager: &BreakpointManager) -> MantleResult<BreakpointId>
    {
        manager.create(self.build())
    }
}
