//! # Symbols
//!
//! Incrementally reconstructed debug information of the managed runtime.
//!
//! - [`abi`]: layouts of the structures the runtime publishes
//! - [`table`]: cursors that tail append-only data tables
//! - [`module`]: per-module method and type index
//! - [`line_table`]: per-method address/line mapping
//! - [`store`]: the index of everything loaded

pub mod abi;
pub mod line_table;
pub mod module;
pub mod store;
pub mod table;

pub use line_table::{LineEntry, LineTable};
pub use module::{Method, MethodChange, SymbolFile, TypeEntry};
pub use store::{MethodLoaded, StoreLimits, StoreStatistics, SymbolStore, UpdateSummary};
pub use table::{DataTableCursor, RecordBatch};
