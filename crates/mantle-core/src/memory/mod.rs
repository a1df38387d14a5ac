//! # Target Memory
//!
//! Everything that moves bytes out of a target and turns them into values:
//! tagged [`MemoryBlob`]s, the [`BinaryCursor`] that decodes them, the
//! [`MemoryAccessor`] contract, and the read-only [`ProcessSnapshot`] backend.

pub mod accessor;
pub mod blob;
pub mod cursor;
pub mod snapshot;

pub use accessor::{MemoryAccessor, DEFAULT_MAX_STRING_LENGTH};
pub use blob::{MemoryBlob, TargetMemoryInfo};
pub use cursor::BinaryCursor;
pub use snapshot::ProcessSnapshot;
