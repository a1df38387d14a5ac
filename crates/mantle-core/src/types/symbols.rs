//! Handles into the symbol store and source positions.
//!
//! Handles are plain values. Every lookup through the store re-validates them,
//! so a handle that outlives its module produces
//! [`MantleError::LocationInvalid`](crate::error::MantleError::LocationInvalid)
//! instead of a dangling answer.

use std::fmt;

/// Generation-tagged reference to a loaded module.
///
/// `index` is the runtime's module index, which the runtime may reuse after
/// an unload; `generation` distinguishes the two loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleHandle
{
    index: i32,
    generation: u64,
}

impl ModuleHandle
{
    /// Build a handle.
    #[must_use]
    pub const fn new(index: i32, generation: u64) -> Self
    {
        Self { index, generation }
    }

    /// Runtime module index.
    #[must_use]
    pub const fn index(self) -> i32
    {
        self.index
    }

    /// Load generation.
    #[must_use]
    pub const fn generation(self) -> u64
    {
        self.generation
    }
}

impl fmt::Display for ModuleHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "module {}@{}", self.index, self.generation)
    }
}

/// Reference to a method of a loaded module, by metadata token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodHandle
{
    /// Owning module
    pub module: ModuleHandle,
    /// Metadata token
    pub token: u32,
}

impl fmt::Display for MethodHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:0x{:08x}", self.module, self.token)
    }
}

/// Identifier of a registered method-load callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadCallbackId(u32);

impl LoadCallbackId
{
    /// Create from the raw value carried by notifications.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self
    {
        Self(value)
    }

    /// Raw value.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }
}

/// Position of an address within a source line.
///
/// `offset` is how far the address lies past the first instruction of the
/// line; `range` is the length in bytes of the line's whole code region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceAddress
{
    /// Source line
    pub line: u32,
    /// Bytes past the start of the line's region
    pub offset: u64,
    /// Length of the line's region
    pub range: u64,
}

impl SourceAddress
{
    /// First address of the line region containing `address`.
    #[must_use]
    pub const fn line_start(&self, address: u64) -> u64
    {
        address.wrapping_sub(self.offset)
    }

    /// One past the last address of the line region containing `address`.
    #[must_use]
    pub const fn line_end(&self, address: u64) -> u64
    {
        self.line_start(address).wrapping_add(self.range)
    }
}

impl fmt::Display for SourceAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.offset == 0 {
            write!(f, "line {}", self.line)
        } else {
            write!(f, "line {}+0x{:x}", self.line, self.offset)
        }
    }
}
