//! Sequential and random-access decoding of target bytes.

use crate::error::{MantleError, MantleResult};
use crate::memory::blob::MemoryBlob;
use crate::types::TargetAddress;

/// Decoder over a [`MemoryBlob`].
///
/// `read_*` methods decode at the current position and advance it; `peek_*`
/// methods decode at the current position without moving, and `peek_*_at`
/// decode at an explicit offset. Multi-byte values honour the blob's
/// endianness, and native integers and pointers use the blob's tagged widths.
///
/// ## Example
///
/// ```rust
/// use mantle_core::memory::{MemoryBlob, TargetMemoryInfo};
///
/// let blob = MemoryBlob::new(vec![0x10, 0, 0, 0, 0, 0, 0, 0, b'h', b'i', 0], TargetMemoryInfo::little_endian(4));
/// let mut cursor = blob.cursor();
/// assert_eq!(cursor.read_u32()?, 0x10);
/// assert!(cursor.read_address()?.is_null());
/// assert_eq!(cursor.read_cstring()?, "hi");
/// assert!(cursor.is_eof());
/// # Ok::<(), mantle_core::error::MantleError>(())
/// ```
#[derive(Debug, Clone)]
pub struct BinaryCursor<'a>
{
    blob: &'a MemoryBlob,
    position: usize,
}

impl<'a> BinaryCursor<'a>
{
    /// Cursor at offset 0.
    #[must_use]
    pub const fn new(blob: &'a MemoryBlob) -> Self
    {
        Self { blob, position: 0 }
    }

    /// Current offset.
    #[must_use]
    pub const fn position(&self) -> usize
    {
        self.position
    }

    /// Move to `position`; the end of the blob is a valid position.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if `position` is past the end.
    pub fn set_position(&mut self, position: usize) -> MantleResult<()>
    {
        if position > self.blob.len() {
            return Err(self.out_of_bounds(position, 0));
        }
        self.position = position;
        Ok(())
    }

    /// Advance by `count` bytes.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if that leaves the blob.
    pub fn skip(&mut self, count: usize) -> MantleResult<()>
    {
        let target = self
            .position
            .checked_add(count)
            .ok_or_else(|| self.out_of_bounds(self.position, count))?;
        self.set_position(target)
    }

    /// Bytes left after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize
    {
        self.blob.len() - self.position
    }

    /// `true` once every byte has been consumed.
    #[must_use]
    pub fn is_eof(&self) -> bool
    {
        self.remaining() == 0
    }

    fn out_of_bounds(&self, offset: usize, len: usize) -> MantleError
    {
        MantleError::Decode(format!(
            "read of {len} bytes at offset {offset} past end of {} byte blob",
            self.blob.len()
        ))
    }

    fn slice_at(&self, offset: usize, len: usize) -> MantleResult<&'a [u8]>
    {
        let blob: &'a MemoryBlob = self.blob;
        offset
            .checked_add(len)
            .and_then(|end| blob.as_bytes().get(offset..end))
            .ok_or_else(|| self.out_of_bounds(offset, len))
    }

    fn array_at<const N: usize>(&self, offset: usize) -> MantleResult<[u8; N]>
    {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice_at(offset, N)?);
        if self.blob.info().big_endian {
            out.reverse();
        }
        Ok(out)
    }

    fn checked_width(width: u8, what: &str) -> MantleResult<usize>
    {
        match width {
            4 | 8 => Ok(width as usize),
            other => Err(MantleError::Decode(format!("unsupported {what} width {other}"))),
        }
    }

    /// Byte at `offset`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] when out of bounds.
    pub fn peek_u8_at(&self, offset: usize) -> MantleResult<u8>
    {
        Ok(self.slice_at(offset, 1)?[0])
    }

    /// Unsigned 32-bit integer at `offset`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] when out of bounds.
    pub fn peek_u32_at(&self, offset: usize) -> MantleResult<u32>
    {
        self.array_at::<4>(offset).map(u32::from_le_bytes)
    }

    /// Signed 32-bit integer at `offset`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] when out of bounds.
    pub fn peek_i32_at(&self, offset: usize) -> MantleResult<i32>
    {
        self.array_at::<4>(offset).map(i32::from_le_bytes)
    }

    /// Unsigned 64-bit integer at `offset`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] when out of bounds.
    pub fn peek_u64_at(&self, offset: usize) -> MantleResult<u64>
    {
        self.array_at::<8>(offset).map(u64::from_le_bytes)
    }

    /// Signed 64-bit integer at `offset`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] when out of bounds.
    pub fn peek_i64_at(&self, offset: usize) -> MantleResult<i64>
    {
        self.array_at::<8>(offset).map(i64::from_le_bytes)
    }

    /// Native-width signed integer at `offset`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] when out of bounds or when the blob's integer
    /// width is neither 4 nor 8.
    pub fn peek_native_integer_at(&self, offset: usize) -> MantleResult<i64>
    {
        match Self::checked_width(self.blob.info().integer_size, "integer")? {
            4 => self.peek_i32_at(offset).map(i64::from),
            _ => self.peek_i64_at(offset),
        }
    }

    fn peek_pointer_value_at(&self, offset: usize) -> MantleResult<u64>
    {
        match Self::checked_width(self.blob.info().address_size, "pointer")? {
            4 => self.peek_u32_at(offset).map(u64::from),
            _ => self.peek_u64_at(offset),
        }
    }

    /// Pointer at `offset`; zero decodes to [`TargetAddress::NULL`].
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] when out of bounds or when the blob's pointer
    /// width is neither 4 nor 8.
    pub fn peek_address_at(&self, offset: usize) -> MantleResult<TargetAddress>
    {
        let value = self.peek_pointer_value_at(offset)?;
        Ok(self.blob.info().address(value))
    }

    /// Unsigned 32-bit integer at the current position, without advancing.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] when out of bounds.
    pub fn peek_u32(&self) -> MantleResult<u32>
    {
        self.peek_u32_at(self.position)
    }

    /// Pointer at the current position, without advancing.
    ///
    /// ## Errors
    ///
    /// See [`Self::peek_address_at`].
    pub fn peek_address(&self) -> MantleResult<TargetAddress>
    {
        self.peek_address_at(self.position)
    }

    fn advance<T>(&mut self, size: usize, value: MantleResult<T>) -> MantleResult<T>
    {
        let value = value?;
        self.position += size;
        Ok(value)
    }

    /// Read one byte.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] at end of blob.
    pub fn read_u8(&mut self) -> MantleResult<u8>
    {
        let value = self.peek_u8_at(self.position);
        self.advance(1, value)
    }

    /// Read an unsigned 32-bit integer.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] at end of blob.
    pub fn read_u32(&mut self) -> MantleResult<u32>
    {
        let value = self.peek_u32_at(self.position);
        self.advance(4, value)
    }

    /// Read a signed 32-bit integer.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] at end of blob.
    pub fn read_i32(&mut self) -> MantleResult<i32>
    {
        let value = self.peek_i32_at(self.position);
        self.advance(4, value)
    }

    /// Read an unsigned 64-bit integer.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] at end of blob.
    pub fn read_u64(&mut self) -> MantleResult<u64>
    {
        let value = self.peek_u64_at(self.position);
        self.advance(8, value)
    }

    /// Read a signed 64-bit integer.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] at end of blob.
    pub fn read_i64(&mut self) -> MantleResult<i64>
    {
        let value = self.peek_i64_at(self.position);
        self.advance(8, value)
    }

    /// Read a native-width signed integer.
    ///
    /// ## Errors
    ///
    /// See [`Self::peek_native_integer_at`].
    pub fn read_native_integer(&mut self) -> MantleResult<i64>
    {
        let value = self.peek_native_integer_at(self.position);
        let width = self.blob.info().integer_size as usize;
        self.advance(width, value)
    }

    /// Read a pointer.
    ///
    /// ## Errors
    ///
    /// See [`Self::peek_address_at`].
    pub fn read_address(&mut self) -> MantleResult<TargetAddress>
    {
        let value = self.peek_address_at(self.position);
        let width = self.blob.info().address_size as usize;
        self.advance(width, value)
    }

    /// Read `count` raw bytes.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if fewer than `count` bytes remain.
    pub fn read_bytes(&mut self, count: usize) -> MantleResult<&'a [u8]>
    {
        let bytes = self.slice_at(self.position, count);
        self.advance(count, bytes)
    }

    /// Read a NUL-terminated string, consuming the terminator.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if no terminator is found before the end.
    pub fn read_cstring(&mut self) -> MantleResult<String>
    {
        let rest = self.slice_at(self.position, self.remaining())?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| MantleError::Decode(format!("unterminated string at offset {}", self.position)))?;
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.position += len + 1;
        Ok(text)
    }

    /// Read a string preceded by its length as an unsigned 32-bit integer.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if the declared length leaves the blob. The
    /// position is unchanged on error.
    pub fn read_length_prefixed_string(&mut self) -> MantleResult<String>
    {
        let len = self.peek_u32()? as usize;
        let bytes = self.slice_at(self.position + 4, len)?;
        self.position += 4 + len;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read an unsigned LEB128 value.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if the encoding is truncated or exceeds 64
    /// bits.
    pub fn read_leb128(&mut self) -> MantleResult<u64>
    {
        let start = self.position;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.peek_u8_at(self.position).inspect_err(|_| self.position = start)?;
            self.position += 1;
            if shift >= 64 {
                self.position = start;
                return Err(MantleError::Decode(format!("LEB128 overflow at offset {start}")));
            }
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Read a signed LEB128 value.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if the encoding is truncated or exceeds 64
    /// bits.
    pub fn read_sleb128(&mut self) -> MantleResult<i64>
    {
        let start = self.position;
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.peek_u8_at(self.position).inspect_err(|_| self.position = start)?;
            self.position += 1;
            if shift >= 64 {
                self.position = start;
                return Err(MantleError::Decode(format!("SLEB128 overflow at offset {start}")));
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }
}
