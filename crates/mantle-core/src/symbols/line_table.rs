//! # Line Tables
//!
//! Address to source-line mapping for one compiled method.
//!
//! Rows arrive as raw `{line, native_offset}` pairs. They are decoded and
//! sorted the first time the table is queried and cached until the method's
//! code range is widened with [`LineTable::extend_end`].

use std::fmt::Write as _;

use once_cell::unsync::OnceCell;
use smallvec::SmallVec;

use crate::error::MantleResult;
use crate::memory::MemoryBlob;
use crate::types::{SourceAddress, TargetAddress};

/// One row: the first instruction generated for a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry
{
    /// Source line
    pub line: u32,
    /// Offset of the instruction from the method start
    pub offset: u64,
}

#[derive(Debug, Clone)]
enum RowSource
{
    Blob(MemoryBlob),
    Entries(Vec<LineEntry>),
}

#[derive(Debug, Clone)]
struct Rows
{
    entries: SmallVec<[LineEntry; 8]>,
    start_row: u32,
    end_row: u32,
}

/// Lazily decoded line table of a method.
#[derive(Debug, Clone)]
pub struct LineTable
{
    start: TargetAddress,
    end: TargetAddress,
    body_start: Option<TargetAddress>,
    source: RowSource,
    rows: OnceCell<Rows>,
}

impl LineTable
{
    /// Table over raw rows as published by the runtime.
    #[must_use]
    pub fn from_blob(start: TargetAddress, end: TargetAddress, body_start: Option<TargetAddress>, rows: MemoryBlob) -> Self
    {
        Self {
            start,
            end,
            body_start,
            source: RowSource::Blob(rows),
            rows: OnceCell::new(),
        }
    }

    /// Table over already decoded rows.
    #[must_use]
    pub fn from_entries(
        start: TargetAddress,
        end: TargetAddress,
        body_start: Option<TargetAddress>,
        entries: Vec<LineEntry>,
    ) -> Self
    {
        Self {
            start,
            end,
            body_start,
            source: RowSource::Entries(entries),
            rows: OnceCell::new(),
        }
    }

    /// First byte of the method.
    #[must_use]
    pub const fn start(&self) -> &TargetAddress
    {
        &self.start
    }

    /// One past the last byte of the method.
    #[must_use]
    pub const fn end(&self) -> &TargetAddress
    {
        &self.end
    }

    /// First byte after the prologue.
    #[must_use]
    pub const fn body_start(&self) -> Option<&TargetAddress>
    {
        self.body_start.as_ref()
    }

    /// Widen the method's code range. The cached rows are dropped so the
    /// last row's range is recomputed against the new end.
    ///
    /// Returns `false` if `end` does not lie past the current end.
    ///
    /// ## Errors
    ///
    /// [`crate::error::MantleError::DomainMismatch`] if `end` is in another
    /// domain.
    pub fn extend_end(&mut self, end: TargetAddress) -> MantleResult<bool>
    {
        if end.checked_sub(&self.end)? <= 0 {
            return Ok(false);
        }
        self.end = end;
        self.rows.take();
        Ok(true)
    }

    fn rows(&self) -> &Rows
    {
        self.rows.get_or_init(|| {
            let mut entries: SmallVec<[LineEntry; 8]> = match &self.source {
                RowSource::Entries(entries) => entries.iter().copied().collect(),
                RowSource::Blob(blob) => decode_rows(blob),
            };
            let method_size = self.end.value().saturating_sub(self.start.value());
            entries.retain(|e| e.offset < method_size);
            entries.sort_by_key(|e| e.offset);
            let start_row = entries.iter().map(|e| e.line).min().unwrap_or(0);
            let end_row = entries.iter().map(|e| e.line).max().unwrap_or(0);
            Rows {
                entries,
                start_row,
                end_row,
            }
        })
    }

    /// Decoded rows in address order.
    #[must_use]
    pub fn entries(&self) -> &[LineEntry]
    {
        &self.rows().entries
    }

    /// Lowest line of the method.
    #[must_use]
    pub fn start_row(&self) -> u32
    {
        self.rows().start_row
    }

    /// Highest line of the method.
    #[must_use]
    pub fn end_row(&self) -> u32
    {
        self.rows().end_row
    }

    /// Address of the first row, in address order, whose line is at least
    /// `line`. `None` for lines outside the method.
    #[must_use]
    pub fn lookup_by_line(&self, line: u32) -> Option<TargetAddress>
    {
        let rows = self.rows();
        if rows.entries.is_empty() || line < rows.start_row || line > rows.end_row {
            return None;
        }
        rows.entries
            .iter()
            .find(|e| e.line >= line)
            .map(|e| &self.start + e.offset as i64)
    }

    /// Line containing `address`.
    ///
    /// Addresses in the prologue map to the first row with a range covering
    /// the whole prologue. A body address before the first row also takes
    /// the first row's line, measured from the method start with a range
    /// running to the method end. Addresses outside the method have no line.
    ///
    /// ## Errors
    ///
    /// [`crate::error::MantleError::DomainMismatch`] if `address` is in
    /// another domain.
    pub fn lookup_by_address(&self, address: &TargetAddress) -> MantleResult<Option<SourceAddress>>
    {
        if !address.is_within(&self.start, &self.end)? {
            return Ok(None);
        }
        let rows = self.rows();
        let Some(first) = rows.entries.first() else {
            return Ok(None);
        };
        let offset = address.checked_sub(&self.start)? as u64;

        if let Some(body_start) = &self.body_start {
            if address.checked_compare(body_start)?.is_lt() {
                return Ok(Some(SourceAddress {
                    line: first.line,
                    offset,
                    range: body_start.checked_sub(&self.start)? as u64,
                }));
            }
        }

        let method_size = self.end.checked_sub(&self.start)? as u64;
        let Some(index) = rows.entries.iter().rposition(|e| e.offset <= offset) else {
            return Ok(Some(SourceAddress {
                line: first.line,
                offset,
                range: method_size - offset,
            }));
        };
        let entry = rows.entries[index];
        let next = rows.entries[index + 1..]
            .iter()
            .find(|e| e.offset > entry.offset)
            .map_or(method_size, |e| e.offset);
        Ok(Some(SourceAddress {
            line: entry.line,
            offset: offset - entry.offset,
            range: next - entry.offset,
        }))
    }

    /// Human-readable listing of the rows.
    #[must_use]
    pub fn dump(&self) -> String
    {
        let mut out = String::new();
        let _ = writeln!(out, "{}..{} lines {}-{}", self.start, self.end, self.start_row(), self.end_row());
        if let Some(body) = &self.body_start {
            let _ = writeln!(out, "  body at {body}");
        }
        for entry in self.entries() {
            let _ = writeln!(out, "  {:>6}  {}", entry.line, &self.start + entry.offset as i64);
        }
        out
    }
}

fn decode_rows(blob: &MemoryBlob) -> SmallVec<[LineEntry; 8]>
{
    let mut cursor = blob.cursor();
    let mut entries = SmallVec::new();
    while cursor.remaining() >= 8 {
        let (Ok(line), Ok(offset)) = (cursor.read_u32(), cursor.read_u32()) else {
            break;
        };
        entries.push(LineEntry {
            line,
            offset: u64::from(offset),
        });
    }
    entries
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::AddressDomain;

    fn table() -> LineTable
    {
        let start = TargetAddress::global(0x100);
        LineTable::from_entries(
            start,
            TargetAddress::global(0x120),
            None,
            vec![LineEntry { line: 12, offset: 0x10 }, LineEntry { line: 10, offset: 0 }],
        )
    }

    #[test]
    fn rows_are_sorted_by_address()
    {
        let table = table();
        assert_eq!(table.entries()[0].line, 10);
        assert_eq!(table.start_row(), 10);
        assert_eq!(table.end_row(), 12);
    }

    #[test]
    fn extend_end_recomputes_last_range()
    {
        let mut table = table();
        let before = table.lookup_by_address(&TargetAddress::global(0x115)).unwrap().unwrap();
        assert_eq!(before.range, 0x10);
        assert!(table.extend_end(TargetAddress::global(0x130)).unwrap());
        let after = table.lookup_by_address(&TargetAddress::global(0x125)).unwrap().unwrap();
        assert_eq!(after.line, 12);
        assert_eq!(after.range, 0x20);
        assert!(!table.extend_end(TargetAddress::global(0x110)).unwrap());
    }

    #[test]
    fn foreign_domain_is_rejected()
    {
        let table = table();
        let other = TargetAddress::new(AddressDomain::fresh("frame"), 0x105);
        assert!(table.lookup_by_address(&other).is_err());
    }
}
