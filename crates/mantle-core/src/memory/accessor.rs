//! # Memory Accessor
//!
//! The capability set every higher layer uses to look at a target.
//!
//! Implementations differ wildly (a ptrace'd process, a core file, a
//! scripted fake) but callers only see this trait. Every method is fallible
//! and nothing may assume that two reads of the same live address return the
//! same bytes.

use crate::error::{MantleError, MantleResult};
use crate::memory::blob::{MemoryBlob, TargetMemoryInfo};
use crate::types::{MemoryRegion, Registers, TargetAddress, ThreadId};

/// Upper bound used by [`MemoryAccessor::read_string`] when a caller does not
/// pass one.
pub const DEFAULT_MAX_STRING_LENGTH: usize = 4096;

// Strings are fetched in pieces of this size until a NUL shows up.
const STRING_CHUNK: usize = 64;

/// Read/write access to a target's memory and registers.
///
/// Required methods move raw bytes; the provided methods decode them with the
/// target's [`TargetMemoryInfo`].
pub trait MemoryAccessor
{
    /// Layout of the target's memory.
    fn memory_info(&self) -> TargetMemoryInfo;

    /// Read `size` bytes at `address`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::MemoryAccess`] if any byte is unreadable.
    fn read_buffer(&self, address: &TargetAddress, size: usize) -> MantleResult<Vec<u8>>;

    /// Write `data` at `address`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::ReadOnly`] on read-only targets, otherwise
    /// [`MantleError::MemoryAccess`].
    fn write_buffer(&mut self, address: &TargetAddress, data: &[u8]) -> MantleResult<()>;

    /// `false` for targets that reject every write.
    fn can_write(&self) -> bool;

    /// Register state of `thread`.
    ///
    /// ## Errors
    ///
    /// Fails if the thread is unknown or not stopped.
    fn read_registers(&self, thread: ThreadId) -> MantleResult<Registers>;

    /// Replace the register state of `thread`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::ReadOnly`] on read-only targets.
    fn write_registers(&mut self, thread: ThreadId, registers: &Registers) -> MantleResult<()>;

    /// Mapped regions of the target's address space.
    ///
    /// ## Errors
    ///
    /// Fails if the map cannot be obtained.
    fn memory_maps(&self) -> MantleResult<Vec<MemoryRegion>>;

    /// Reject null addresses and addresses from another domain.
    ///
    /// ## Errors
    ///
    /// [`MantleError::MemoryAccess`] for null, [`MantleError::DomainMismatch`]
    /// for foreign addresses.
    fn check_address(&self, address: &TargetAddress, size: usize) -> MantleResult<()>
    {
        if address.is_null() {
            return Err(MantleError::memory(0, size, "null pointer"));
        }
        let info = self.memory_info();
        if address.domain() != &info.domain {
            return Err(MantleError::DomainMismatch {
                left: address.domain().to_string(),
                right: info.domain.to_string(),
            });
        }
        Ok(())
    }

    /// Read `size` bytes as a tagged [`MemoryBlob`].
    ///
    /// ## Errors
    ///
    /// See [`Self::read_buffer`].
    fn read_memory(&self, address: &TargetAddress, size: usize) -> MantleResult<MemoryBlob>
    {
        self.check_address(address, size)?;
        let bytes = self.read_buffer(address, size)?;
        if bytes.len() != size {
            return Err(MantleError::memory(
                address.value(),
                size,
                format!("short read of {} bytes", bytes.len()),
            ));
        }
        Ok(MemoryBlob::new(bytes, self.memory_info()).with_base(address.clone()))
    }

    /// Read one byte.
    ///
    /// ## Errors
    ///
    /// See [`Self::read_buffer`].
    fn read_byte(&self, address: &TargetAddress) -> MantleResult<u8>
    {
        self.read_memory(address, 1)?.cursor().read_u8()
    }

    /// Read a 32-bit integer.
    ///
    /// ## Errors
    ///
    /// See [`Self::read_buffer`].
    fn read_integer(&self, address: &TargetAddress) -> MantleResult<i32>
    {
        self.read_memory(address, 4)?.cursor().read_i32()
    }

    /// Read a 64-bit integer.
    ///
    /// ## Errors
    ///
    /// See [`Self::read_buffer`].
    fn read_long_integer(&self, address: &TargetAddress) -> MantleResult<i64>
    {
        self.read_memory(address, 8)?.cursor().read_i64()
    }

    /// Read a pointer; zero yields [`TargetAddress::NULL`].
    ///
    /// ## Errors
    ///
    /// See [`Self::read_buffer`].
    fn read_address(&self, address: &TargetAddress) -> MantleResult<TargetAddress>
    {
        let width = self.memory_info().address_size as usize;
        self.read_memory(address, width)?.cursor().read_address()
    }

    /// Read a NUL-terminated string of at most `max_length` bytes.
    ///
    /// Memory is fetched in small pieces so a string that ends just before an
    /// unmapped page can still be read. A failure after the first piece ends
    /// the string at what was read so far.
    ///
    /// ## Errors
    ///
    /// [`MantleError::MemoryAccess`] if the first byte is unreadable,
    /// [`MantleError::Decode`] if no terminator appears within `max_length`.
    fn read_string(&self, address: &TargetAddress, max_length: usize) -> MantleResult<String>
    {
        self.check_address(address, 1)?;
        let mut collected = Vec::new();
        while collected.len() < max_length {
            let want = STRING_CHUNK.min(max_length - collected.len());
            let piece_address = address + collected.len() as i64;
            let piece = match self.read_buffer(&piece_address, want) {
                Ok(piece) => piece,
                Err(e) if collected.is_empty() => return Err(e),
                Err(_) => break,
            };
            if let Some(nul) = piece.iter().position(|&b| b == 0) {
                collected.extend_from_slice(&piece[..nul]);
                return Ok(String::from_utf8_lossy(&collected).into_owned());
            }
            if piece.is_empty() {
                break;
            }
            collected.extend_from_slice(&piece);
        }
        if collected.len() >= max_length {
            return Err(MantleError::Decode(format!(
                "string at {address} longer than {max_length} bytes"
            )));
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Write one byte.
    ///
    /// ## Errors
    ///
    /// See [`Self::write_buffer`].
    fn write_byte(&mut self, address: &TargetAddress, value: u8) -> MantleResult<()>
    {
        self.check_address(address, 1)?;
        self.write_buffer(address, &[value])
    }

    /// Write a 32-bit integer in target byte order.
    ///
    /// ## Errors
    ///
    /// See [`Self::write_buffer`].
    fn write_integer(&mut self, address: &TargetAddress, value: i32) -> MantleResult<()>
    {
        self.check_address(address, 4)?;
        let bytes = if self.memory_info().big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        self.write_buffer(address, &bytes)
    }

    /// Write a 64-bit integer in target byte order.
    ///
    /// ## Errors
    ///
    /// See [`Self::write_buffer`].
    fn write_long_integer(&mut self, address: &TargetAddress, value: i64) -> MantleResult<()>
    {
        self.check_address(address, 8)?;
        let bytes = if self.memory_info().big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        self.write_buffer(address, &bytes)
    }

    /// Write a pointer of the target's width.
    ///
    /// ## Errors
    ///
    /// See [`Self::write_buffer`]; [`MantleError::DomainMismatch`] if `value`
    /// belongs to another domain.
    fn write_address(&mut self, address: &TargetAddress, value: &TargetAddress) -> MantleResult<()>
    {
        let info = self.memory_info();
        if !value.is_null() && value.domain() != &info.domain {
            return Err(MantleError::DomainMismatch {
                left: value.domain().to_string(),
                right: info.domain.to_string(),
            });
        }
        match info.address_size {
            4 => self.write_integer(address, value.value() as u32 as i32),
            8 => self.write_long_integer(address, value.offset()),
            other => Err(MantleError::Decode(format!("unsupported pointer width {other}"))),
        }
    }
}
