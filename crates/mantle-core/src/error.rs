//! # Error Types
//!
//! Error handling for the introspection engine.
//!
//! Failures fall into two groups. Recoverable ones (memory access, stale
//! locations, malformed debug records, misuse) are reported per operation and
//! leave the session usable. [`MantleError::Internal`] is the fatal category: an
//! engine invariant did not hold, the current operation was aborted, and the
//! session should be ended or restarted.

use std::sync::PoisonError;

use thiserror::Error;

/// Main error type for engine operations
///
/// ## Error Categories
///
/// 1. **Target memory**: MemoryAccess, ReadOnly
/// 2. **Stale objects**: LocationInvalid
/// 3. **Runtime debug data**: DebugInfoMalformed, Decode
/// 4. **Usage**: DomainMismatch, InvalidState, InvalidArgument, Unsupported
/// 5. **Process control**: ProcessNotFound, PermissionDenied, AttachFailed, NotAttached
/// 6. **Breakpoints**: BreakpointIdNotFound
/// 7. **Fatal**: Internal
/// 8. **I/O**: Io
#[derive(Error, Debug)]
pub enum MantleError
{
    /// Target memory could not be read or written.
    ///
    /// The address may be unmapped, the target may be running, or the backend
    /// may simply have failed the transfer. Callers mark whatever object was
    /// being decoded (a frame, a record) as invalid and carry on.
    #[error("Cannot access {size} bytes at 0x{address:x}: {reason}")]
    MemoryAccess
    {
        /// First address of the failed access
        address: u64,
        /// Number of bytes requested
        size: usize,
        /// Backend explanation
        reason: String,
    },

    /// A write or execution-control request reached a read-only target, such
    /// as a process snapshot.
    #[error("Target is read-only: cannot modify memory at 0x{address:x}")]
    ReadOnly
    {
        /// Address of the rejected write (0 for execution control)
        address: u64,
    },

    /// The object's backing location no longer exists: its frame was popped
    /// or its module unloaded. Re-resolve instead of retrying.
    #[error("Location is no longer valid: {0}")]
    LocationInvalid(String),

    /// Runtime debug data decoded into impossible values (magic, version or
    /// size mismatch).
    #[error("Malformed debug information: {0}")]
    DebugInfoMalformed(String),

    /// Bytes could not be decoded (out of bounds or unsupported width).
    #[error("Decode error: {0}")]
    Decode(String),

    /// Two addresses from different address domains were compared or
    /// combined.
    #[error("Address domain mismatch: {left} vs {right}")]
    DomainMismatch
    {
        /// Domain of the left operand
        left: String,
        /// Domain of the right operand
        right: String,
    },

    /// The operation is not valid in the current thread or session state,
    /// for example stepping a thread that is not stopped.
    #[error("Invalid state: expected {expected}, thread is {actual}")]
    InvalidState
    {
        /// State required by the operation
        expected: &'static str,
        /// State actually observed
        actual: String,
    },

    /// Invalid argument passed to an engine function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend cannot perform this operation at all.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The process with the given PID doesn't exist or has exited
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Insufficient permissions to debug the target process
    ///
    /// On Linux this usually means `ptrace_scope` forbids attaching, or the
    /// target belongs to another user.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Failed to attach to a process
    #[error("Failed to attach to process: {0}")]
    AttachFailed(String),

    /// Operation requires an attached target
    #[error("Not attached to a process")]
    NotAttached,

    /// No breakpoint exists for the given identifier.
    #[error("No breakpoint with id {0}")]
    BreakpointIdNotFound(u64),

    /// An engine invariant was violated. Fatal for the current operation.
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error (core files, /proc access)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MantleError
{
    /// Shorthand for a [`MantleError::MemoryAccess`].
    pub fn memory(address: u64, size: usize, reason: impl Into<String>) -> Self
    {
        Self::MemoryAccess {
            address,
            size,
            reason: reason.into(),
        }
    }

    /// Build the fatal error for a violated invariant, logging it at `error`.
    pub fn invariant(message: impl Into<String>) -> Self
    {
        let message = message.into();
        tracing::error!(%message, "engine invariant violated");
        Self::Internal(message)
    }

    /// `true` only for the fatal category.
    #[must_use]
    pub const fn is_fatal(&self) -> bool
    {
        matches!(self, Self::Internal(_))
    }

    /// `true` for errors that describe a condition of the target rather than
    /// a bug in the caller or the engine; retrying later may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool
    {
        matches!(
            self,
            Self::MemoryAccess { .. } | Self::LocationInvalid(_) | Self::DebugInfoMalformed(_) | Self::Decode(_)
        )
    }

    /// `true` for errors caused by a read-only backend.
    #[must_use]
    pub const fn is_read_only(&self) -> bool
    {
        matches!(self, Self::ReadOnly { .. })
    }
}

impl<T> From<PoisonError<T>> for MantleError
{
    fn from(_: PoisonError<T>) -> Self
    {
        Self::invariant("lock poisoned by a panicking holder")
    }
}

/// Convenience type alias for `Result<T, MantleError>`
///
/// ```rust
/// use mantle_core::error::MantleResult;
/// fn foo() -> MantleResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type MantleResult<T> = std::result::Result<T, MantleError>;
