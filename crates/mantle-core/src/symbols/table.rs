//! # Data-Table Cursors
//!
//! The runtime appends debug records to per-domain data tables: linked lists
//! of chunks whose headers say how much of the data area holds complete
//! records. A [`DataTableCursor`] remembers how far it has parsed so each
//! update reads only the bytes appended since the last one.
//!
//! ```text
//! chunk:  [ total | allocated | consumed | reserved | next ][ rec rec rec .... free ]
//!                                                           ^        ^
//!                                                           0        last_consumed
//! ```
//!
//! The offset only moves forward within a chunk and returns to zero when the
//! cursor follows `next` into a fresh chunk.

use tracing::trace;

use crate::error::{MantleError, MantleResult};
use crate::memory::MemoryAccessor;
use crate::symbols::abi::{chunk_header_size, ChunkHeader, DataRecord, RECORD_HEADER_SIZE};
use crate::types::TargetAddress;

/// Records parsed from one newly appended byte range.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch
{
    /// Records in table order.
    pub records: Vec<DataRecord>,
    /// Chunk offset up to which bytes were parsed.
    pub end_offset: u32,
    /// Bytes read from the target for this batch.
    pub bytes_read: usize,
    /// Set when parsing stopped at a malformed record; the bytes from
    /// `end_offset` on are left for the next update.
    pub malformed: Option<String>,
}

/// Read position in one data table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTableCursor
{
    domain: i32,
    table: TargetAddress,
    chunk: TargetAddress,
    last_consumed: u32,
    chunks_followed: u64,
}

impl DataTableCursor
{
    /// Cursor at the start of `first_chunk`.
    #[must_use]
    pub fn new(domain: i32, table: TargetAddress, first_chunk: TargetAddress) -> Self
    {
        Self {
            domain,
            table,
            chunk: first_chunk,
            last_consumed: 0,
            chunks_followed: 0,
        }
    }

    /// Runtime domain of the table.
    #[must_use]
    pub const fn domain(&self) -> i32
    {
        self.domain
    }

    /// Address of the table descriptor.
    #[must_use]
    pub const fn table_address(&self) -> &TargetAddress
    {
        &self.table
    }

    /// Chunk currently being tailed.
    #[must_use]
    pub const fn current_chunk(&self) -> &TargetAddress
    {
        &self.chunk
    }

    /// Data-area offset up to which records have been parsed.
    #[must_use]
    pub const fn last_consumed_offset(&self) -> u32
    {
        self.last_consumed
    }

    /// Number of times the cursor crossed into a new chunk.
    #[must_use]
    pub const fn chunks_followed(&self) -> u64
    {
        self.chunks_followed
    }

    /// Re-read the header of the current chunk.
    ///
    /// ## Errors
    ///
    /// Memory errors, or [`MantleError::DebugInfoMalformed`] for an
    /// impossible header, including one whose `consumed` went backwards.
    pub fn read_header<M: MemoryAccessor + ?Sized>(&self, memory: &M) -> MantleResult<ChunkHeader>
    {
        let header = ChunkHeader::read(memory, &self.chunk)?;
        if header.consumed < self.last_consumed {
            return Err(MantleError::DebugInfoMalformed(format!(
                "chunk at {} shrank from {} to {} consumed bytes",
                self.chunk, self.last_consumed, header.consumed
            )));
        }
        Ok(header)
    }

    /// Read and parse `[last_consumed, header.consumed)`.
    ///
    /// Parsing stops at a zero-sized record (end of data) or at the first
    /// malformed record; everything before it is returned.
    ///
    /// ## Errors
    ///
    /// Memory errors while reading the range. Nothing is returned in that
    /// case and the cursor is unchanged.
    pub fn read_records<M: MemoryAccessor + ?Sized>(&self, memory: &M, header: &ChunkHeader) -> MantleResult<RecordBatch>
    {
        let start = self.last_consumed;
        let mut batch = RecordBatch {
            end_offset: start,
            ..RecordBatch::default()
        };
        if header.consumed <= start {
            return Ok(batch);
        }

        let info = memory.memory_info();
        let length = (header.consumed - start) as usize;
        let data = &self.chunk + (chunk_header_size(&info) + start as usize) as i64;
        let blob = memory.read_memory(&data, length)?;
        batch.bytes_read = length;

        let mut position = 0usize;
        while position < length {
            let mut cursor = blob.cursor();
            cursor.set_position(position)?;
            if cursor.remaining() < RECORD_HEADER_SIZE {
                batch.malformed = Some(format!("truncated record header at offset {}", start as usize + position));
                break;
            }
            let size = cursor.read_u32()?;
            let kind = cursor.read_u32()?;
            if size == 0 {
                position = length;
                break;
            }
            let size_bytes = size as usize;
            if size_bytes < RECORD_HEADER_SIZE || size_bytes > length - position {
                batch.malformed = Some(format!(
                    "record of size {size} at offset {} overruns consumed {}",
                    start as usize + position,
                    header.consumed
                ));
                break;
            }
            let body = blob.slice(position + RECORD_HEADER_SIZE, size_bytes - RECORD_HEADER_SIZE)?;
            match DataRecord::decode(kind, size, &body) {
                Ok(record) => {
                    trace!(domain = self.domain, kind, size, "record");
                    batch.records.push(record);
                }
                Err(err) => {
                    batch.malformed = Some(format!(
                        "record kind {kind} at offset {}: {err}",
                        start as usize + position
                    ));
                    break;
                }
            }
            position += size_bytes;
        }

        batch.end_offset = start + position as u32;
        Ok(batch)
    }

    /// Mark bytes up to `offset` as parsed.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Internal`] if `offset` would move the cursor backwards.
    pub fn advance_to(&mut self, offset: u32) -> MantleResult<()>
    {
        if offset < self.last_consumed {
            return Err(MantleError::invariant(format!(
                "data table cursor for domain {} moving back from {} to {offset}",
                self.domain, self.last_consumed
            )));
        }
        self.last_consumed = offset;
        Ok(())
    }

    /// Continue in the chunk at `next` from offset zero.
    pub fn follow(&mut self, next: TargetAddress)
    {
        trace!(domain = self.domain, from = %self.chunk, to = %next, "following chunk link");
        self.chunk = next;
        self.last_consumed = 0;
        self.chunks_followed += 1;
    }
}
