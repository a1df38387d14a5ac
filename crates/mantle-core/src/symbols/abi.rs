//! # Runtime Debug ABI
//!
//! Fixed layouts the runtime publishes in its own memory for debuggers: the
//! symbol-table header, module and method descriptors, data-table
//! descriptors, chunk headers and the records appended to chunks.
//!
//! Every structure is target-endian and sized by the target's pointer width
//! `P`. Decoders here do no caching and no interpretation beyond rejecting
//! impossible values; the store decides what the values mean.

use crate::error::{MantleError, MantleResult};
use crate::memory::{MemoryAccessor, MemoryBlob, TargetMemoryInfo};
use crate::types::TargetAddress;

/// Magic value at the start of the symbol-table header.
pub const SYMBOL_TABLE_MAGIC: u64 = 0x7aff_65af_4253_d427;

/// Oldest supported symbol-table version.
pub const MIN_SYMBOL_TABLE_VERSION: u32 = 1;

/// Newest supported symbol-table version.
pub const MAX_SYMBOL_TABLE_VERSION: u32 = 2;

/// Size of `{size, kind}` in front of every data-table record.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Record kind: a type finished initialisation.
pub const RECORD_KIND_TYPE: u32 = 1;

/// Record kind: a method was compiled.
pub const RECORD_KIND_METHOD: u32 = 2;

// Linked lists in the header are walked at most this far.
const MAX_LIST_LENGTH: usize = 65_536;

fn pointer_size(info: &TargetMemoryInfo) -> usize
{
    usize::from(info.address_size)
}

/// Size of a chunk header: four ints and the `next` pointer.
#[must_use]
pub fn chunk_header_size(info: &TargetMemoryInfo) -> usize
{
    16 + pointer_size(info)
}

fn malformed(what: &str, address: &TargetAddress, detail: impl std::fmt::Display) -> MantleError
{
    MantleError::DebugInfoMalformed(format!("{what} at {address}: {detail}"))
}

/// Header of the runtime's symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTableHeader
{
    /// Format version
    pub version: u32,
    /// Size of the header structure as written by the runtime
    pub total_size: u32,
    /// Descriptor of the core library module
    pub corlib: TargetAddress,
    /// Head of the `{next, table}` list of data-table descriptors
    pub data_tables: TargetAddress,
    /// Descriptor of the type table
    pub type_table: TargetAddress,
    /// Head of the `{next, descriptor}` list of module descriptors
    pub modules: TargetAddress,
}

impl SymbolTableHeader
{
    /// Bytes occupied by the header for `info`.
    #[must_use]
    pub fn size(info: &TargetMemoryInfo) -> usize
    {
        16 + 4 * pointer_size(info)
    }

    /// Decode the header at `address`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::DebugInfoMalformed`] for a wrong magic, an unsupported
    /// version or a size smaller than the structure; memory errors otherwise.
    pub fn read<M: MemoryAccessor + ?Sized>(memory: &M, address: &TargetAddress) -> MantleResult<Self>
    {
        let info = memory.memory_info();
        let size = Self::size(&info);
        let blob = memory.read_memory(address, size)?;
        let mut cursor = blob.cursor();
        let magic = cursor.read_u64()?;
        if magic != SYMBOL_TABLE_MAGIC {
            return Err(malformed("symbol table", address, format_args!("bad magic 0x{magic:016x}")));
        }
        let version = cursor.read_u32()?;
        if !(MIN_SYMBOL_TABLE_VERSION..=MAX_SYMBOL_TABLE_VERSION).contains(&version) {
            return Err(malformed("symbol table", address, format_args!("unsupported version {version}")));
        }
        let total_size = cursor.read_u32()?;
        if (total_size as usize) < size {
            return Err(malformed("symbol table", address, format_args!("size {total_size} < {size}")));
        }
        Ok(Self {
            version,
            total_size,
            corlib: cursor.read_address()?,
            data_tables: cursor.read_address()?,
            type_table: cursor.read_address()?,
            modules: cursor.read_address()?,
        })
    }
}

/// Walk a `{next, payload}` singly linked list and collect the payloads.
///
/// ## Errors
///
/// Memory errors, or [`MantleError::DebugInfoMalformed`] if the list does not
/// terminate.
pub fn read_pointer_list<M: MemoryAccessor + ?Sized>(memory: &M, head: &TargetAddress) -> MantleResult<Vec<TargetAddress>>
{
    let mut out = Vec::new();
    let mut node = head.clone();
    while !node.is_null() {
        if out.len() == MAX_LIST_LENGTH {
            return Err(malformed("pointer list", head, "does not terminate"));
        }
        let next = memory.read_address(&node)?;
        let payload = memory.read_address(&(&node + memory.memory_info().address_size as i64))?;
        if !payload.is_null() {
            out.push(payload);
        }
        node = next;
    }
    Ok(out)
}

/// One entry of a module's source-method list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMethod
{
    /// Metadata token
    pub token: u32,
    /// Compiled lazily by the runtime
    pub dynamic: bool,
    /// Method name
    pub name: String,
}

/// Module descriptor passed with module-load notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor
{
    /// Runtime module index
    pub index: i32,
    /// Module code is generated at run time
    pub dynamic: bool,
    /// Stable per-runtime image handle
    pub image: TargetAddress,
    /// Module name
    pub name: String,
    /// Methods the module declares
    pub source_methods: Vec<SourceMethod>,
}

impl ModuleDescriptor
{
    /// Decode the descriptor at `address`, reading strings up to
    /// `max_string_length` bytes and at most `max_methods` method entries.
    ///
    /// ## Errors
    ///
    /// Memory errors, or [`MantleError::DebugInfoMalformed`] for a negative
    /// index or a method count outside `0..=max_methods`.
    pub fn read<M: MemoryAccessor + ?Sized>(
        memory: &M,
        address: &TargetAddress,
        max_string_length: usize,
        max_methods: usize,
    ) -> MantleResult<Self>
    {
        let info = memory.memory_info();
        let p = pointer_size(&info);
        let blob = memory.read_memory(address, 8 + 4 * p)?;
        let mut cursor = blob.cursor();
        let index = cursor.read_i32()?;
        let flags = cursor.read_u32()?;
        let image = cursor.read_address()?;
        let name_ptr = cursor.read_address()?;
        let methods = cursor.read_address()?;
        let method_count = cursor.read_i32()?;
        if index < 0 {
            return Err(malformed("module descriptor", address, format_args!("negative index {index}")));
        }
        let method_count = usize::try_from(method_count)
            .map_err(|_| malformed("module descriptor", address, format_args!("negative method count {method_count}")))?;
        if method_count > max_methods {
            return Err(malformed(
                "module descriptor",
                address,
                format_args!("method count {method_count} exceeds {max_methods}"),
            ));
        }

        let name = if name_ptr.is_null() {
            String::new()
        } else {
            memory.read_string(&name_ptr, max_string_length)?
        };

        let mut source_methods = Vec::new();
        if method_count > 0 && !methods.is_null() {
            let table_size = (8 + p)
                .checked_mul(method_count)
                .ok_or_else(|| malformed("module descriptor", address, "method table size overflows"))?;
            let table = memory.read_memory(&methods, table_size)?;
            source_methods.reserve(method_count);
            let mut cursor = table.cursor();
            for _ in 0..method_count {
                let token = cursor.read_u32()?;
                let flags = cursor.read_u32()?;
                let name_ptr = cursor.read_address()?;
                let name = if name_ptr.is_null() {
                    String::new()
                } else {
                    memory.read_string(&name_ptr, max_string_length)?
                };
                source_methods.push(SourceMethod {
                    token,
                    dynamic: flags & 1 != 0,
                    name,
                });
            }
        }

        Ok(Self {
            index,
            dynamic: flags & 1 != 0,
            image,
            name,
            source_methods,
        })
    }
}

/// Data-table descriptor passed with domain-create notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTableDescriptor
{
    /// Runtime domain the table belongs to
    pub domain: i32,
    /// First chunk of the table
    pub first_chunk: TargetAddress,
}

impl DataTableDescriptor
{
    /// Decode the descriptor at `address`.
    ///
    /// ## Errors
    ///
    /// Memory errors, or [`MantleError::DebugInfoMalformed`] if the table has
    /// no chunk.
    pub fn read<M: MemoryAccessor + ?Sized>(memory: &M, address: &TargetAddress) -> MantleResult<Self>
    {
        let info = memory.memory_info();
        let blob = memory.read_memory(address, 8 + pointer_size(&info))?;
        let mut cursor = blob.cursor();
        let domain = cursor.read_i32()?;
        cursor.skip(4)?;
        let first_chunk = cursor.read_address()?;
        if first_chunk.is_null() {
            return Err(malformed("data table", address, "no first chunk"));
        }
        Ok(Self { domain, first_chunk })
    }
}

/// Header of one data-table chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader
{
    /// Size of the chunk including the header
    pub total_size: u32,
    /// Size of the data area
    pub allocated: u32,
    /// Bytes of the data area filled with complete records
    pub consumed: u32,
    /// Next chunk, null for the last one
    pub next: TargetAddress,
}

impl ChunkHeader
{
    /// Decode the header of the chunk at `address`.
    ///
    /// ## Errors
    ///
    /// Memory errors, or [`MantleError::DebugInfoMalformed`] if `consumed`
    /// exceeds `allocated` or the data area does not fit in the chunk.
    pub fn read<M: MemoryAccessor + ?Sized>(memory: &M, address: &TargetAddress) -> MantleResult<Self>
    {
        let info = memory.memory_info();
        let header_size = chunk_header_size(&info);
        let blob = memory.read_memory(address, header_size)?;
        let mut cursor = blob.cursor();
        let total_size = cursor.read_u32()?;
        let allocated = cursor.read_u32()?;
        let consumed = cursor.read_u32()?;
        cursor.skip(4)?;
        let next = cursor.read_address()?;
        if consumed > allocated {
            return Err(malformed("chunk", address, format_args!("consumed {consumed} > allocated {allocated}")));
        }
        if total_size != 0 && (allocated as usize).saturating_add(header_size) > total_size as usize {
            return Err(malformed("chunk", address, format_args!("allocated {allocated} does not fit in {total_size}")));
        }
        Ok(Self {
            total_size,
            allocated,
            consumed,
            next,
        })
    }
}

/// Body of a type-initialised record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRecord
{
    /// Owning module index
    pub module_index: i32,
    /// Metadata token
    pub token: u32,
    /// Runtime class handle
    pub class: TargetAddress,
    /// Pointer to the type name
    pub name: TargetAddress,
}

/// Body of a method-compiled record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord
{
    /// Owning module index
    pub module_index: i32,
    /// Method descriptor
    pub descriptor: TargetAddress,
}

/// A decoded data-table record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRecord
{
    /// Kind 1
    Type(TypeRecord),
    /// Kind 2
    Method(MethodRecord),
    /// Any other kind; skipped
    Unknown
    {
        /// Raw kind value
        kind: u32,
        /// Size including the header
        size: u32,
    },
}

impl DataRecord
{
    /// Module the record refers to, if any.
    #[must_use]
    pub const fn module_index(&self) -> Option<i32>
    {
        match self {
            DataRecord::Type(record) => Some(record.module_index),
            DataRecord::Method(record) => Some(record.module_index),
            DataRecord::Unknown { .. } => None,
        }
    }

    /// Decode the body of a record of `kind` from `body`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if the body is shorter than its kind requires.
    pub fn decode(kind: u32, size: u32, body: &MemoryBlob) -> MantleResult<Self>
    {
        let mut cursor = body.cursor();
        match kind {
            RECORD_KIND_TYPE => Ok(DataRecord::Type(TypeRecord {
                module_index: cursor.read_i32()?,
                token: cursor.read_u32()?,
                class: cursor.read_address()?,
                name: cursor.read_address()?,
            })),
            RECORD_KIND_METHOD => Ok(DataRecord::Method(MethodRecord {
                module_index: cursor.read_i32()?,
                descriptor: cursor.read_address()?,
            })),
            _ => Ok(DataRecord::Unknown { kind, size }),
        }
    }
}

/// Compiled-method descriptor.
///
/// The line rows are kept as raw bytes and decoded by the line table on first
/// use.
#[derive(Debug, Clone)]
pub struct MethodDescriptor
{
    /// Owning module index
    pub module_index: i32,
    /// Metadata token
    pub token: u32,
    /// Runtime flags
    pub flags: u32,
    /// First byte of native code
    pub start: TargetAddress,
    /// One past the last byte of native code
    pub end: TargetAddress,
    /// Start of the code after the prologue, if distinguishable
    pub body_start: Option<TargetAddress>,
    /// End of the body
    pub body_end: Option<TargetAddress>,
    /// Pointer to the method name
    pub name: TargetAddress,
    /// Number of `{line, native_offset}` rows
    pub line_count: usize,
    /// Raw rows, 8 bytes each
    pub rows: MemoryBlob,
}

impl MethodDescriptor
{
    /// Fixed part of the descriptor before the rows.
    #[must_use]
    pub fn header_size(info: &TargetMemoryInfo) -> usize
    {
        16 + 5 * pointer_size(info) + 8
    }

    /// Decode the descriptor at `address`, accepting at most `max_rows`
    /// line-table rows.
    ///
    /// ## Errors
    ///
    /// Memory errors, or [`MantleError::DebugInfoMalformed`] when the
    /// declared size, range or row count is impossible.
    pub fn read<M: MemoryAccessor + ?Sized>(memory: &M, address: &TargetAddress, max_rows: usize) -> MantleResult<Self>
    {
        let info = memory.memory_info();
        let header_size = Self::header_size(&info);
        let blob = memory.read_memory(address, header_size)?;
        let mut cursor = blob.cursor();
        let size = cursor.read_u32()? as usize;
        let module_index = cursor.read_i32()?;
        let token = cursor.read_u32()?;
        let flags = cursor.read_u32()?;
        let start = cursor.read_address()?;
        let end = cursor.read_address()?;
        let body_start = cursor.read_address()?;
        let body_end = cursor.read_address()?;
        let name = cursor.read_address()?;
        let line_count = cursor.read_i32()?;
        let line_count = usize::try_from(line_count)
            .map_err(|_| malformed("method descriptor", address, format_args!("negative line count {line_count}")))?;

        if start.is_null() || end.value() <= start.value() {
            return Err(malformed("method descriptor", address, format_args!("empty code range {start}..{end}")));
        }
        if line_count > max_rows {
            return Err(malformed(
                "method descriptor",
                address,
                format_args!("line count {line_count} exceeds {max_rows}"),
            ));
        }
        let rows_size = line_count
            .checked_mul(8)
            .ok_or_else(|| malformed("method descriptor", address, "line count overflows"))?;
        let largest = max_rows.saturating_mul(8).saturating_add(header_size);
        if size > largest {
            return Err(malformed("method descriptor", address, format_args!("size {size} exceeds {largest}")));
        }
        if size < header_size + rows_size {
            return Err(malformed(
                "method descriptor",
                address,
                format_args!("size {size} too small for {line_count} rows"),
            ));
        }
        let rows = if rows_size == 0 {
            MemoryBlob::new(Vec::new(), info)
        } else {
            memory.read_memory(&(address + header_size as i64), rows_size)?
        };

        Ok(Self {
            module_index,
            token,
            flags,
            start,
            end,
            body_start: (!body_start.is_null()).then_some(body_start),
            body_end: (!body_end.is_null()).then_some(body_end),
            name,
            line_count,
            rows,
        })
    }
}

/// Entry method passed with runtime-initialized notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMethod
{
    /// Metadata token of the entry method
    pub token: u32,
    /// Image handle of the module that declares it
    pub image: TargetAddress,
}

impl EntryMethod
{
    /// Decode the entry-method descriptor at `address` and follow its class
    /// pointer to the owning image.
    ///
    /// ## Errors
    ///
    /// Memory errors, or [`MantleError::DebugInfoMalformed`] for a null class.
    pub fn read<M: MemoryAccessor + ?Sized>(memory: &M, address: &TargetAddress) -> MantleResult<Self>
    {
        let info = memory.memory_info();
        let blob = memory.read_memory(address, 8 + pointer_size(&info))?;
        let mut cursor = blob.cursor();
        cursor.skip(4)?;
        let token = cursor.read_u32()?;
        let class = cursor.read_address()?;
        if class.is_null() {
            return Err(malformed("entry method", address, "null class"));
        }
        let image = memory.read_address(&class)?;
        Ok(Self { token, image })
    }
}
