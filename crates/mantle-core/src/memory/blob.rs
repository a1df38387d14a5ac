//! Tagged byte buffers read from a target.

use std::fmt::Write as _;

use crate::error::{MantleError, MantleResult};
use crate::memory::cursor::BinaryCursor;
use crate::types::{AddressDomain, Architecture, TargetAddress};

/// Layout facts about a target's memory needed to decode raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMemoryInfo
{
    /// Pointer width in bytes (4 or 8)
    pub address_size: u8,
    /// Native integer width in bytes (4 or 8)
    pub integer_size: u8,
    /// `true` for big-endian targets
    pub big_endian: bool,
    /// Domain of every address decoded from this target's memory
    pub domain: AddressDomain,
}

impl TargetMemoryInfo
{
    /// Little-endian layout with the given pointer width in the global domain.
    #[must_use]
    pub const fn little_endian(address_size: u8) -> Self
    {
        Self {
            address_size,
            integer_size: address_size,
            big_endian: false,
            domain: AddressDomain::GLOBAL,
        }
    }

    /// Layout of a live process of `architecture`.
    #[must_use]
    pub const fn for_architecture(architecture: Architecture) -> Self
    {
        Self::little_endian(architecture.pointer_size_bytes())
    }

    /// Same layout, different domain.
    #[must_use]
    pub fn with_domain(mut self, domain: AddressDomain) -> Self
    {
        self.domain = domain;
        self
    }

    /// Same layout, big-endian.
    #[must_use]
    pub fn into_big_endian(mut self) -> Self
    {
        self.big_endian = true;
        self
    }

    /// Wrap a raw value produced by this target (a register, a decoded
    /// pointer) in its domain. Zero maps to [`TargetAddress::NULL`].
    #[must_use]
    pub fn address(&self, value: u64) -> TargetAddress
    {
        if value == 0 {
            TargetAddress::NULL
        } else {
            TargetAddress::new(self.domain.clone(), value as i64)
        }
    }
}

/// Immutable bytes tagged with the layout of the target they came from.
///
/// This is the only form in which target data crosses into the engine's
/// decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlob
{
    bytes: Vec<u8>,
    info: TargetMemoryInfo,
    base: Option<TargetAddress>,
}

impl MemoryBlob
{
    /// Wrap `bytes` read from a target described by `info`.
    #[must_use]
    pub const fn new(bytes: Vec<u8>, info: TargetMemoryInfo) -> Self
    {
        Self { bytes, info, base: None }
    }

    /// Record the address the bytes were read from.
    #[must_use]
    pub fn with_base(mut self, base: TargetAddress) -> Self
    {
        self.base = Some(base);
        self
    }

    /// Raw contents.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    /// Number of bytes.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.bytes.len()
    }

    /// `true` if the blob holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.bytes.is_empty()
    }

    /// Layout tag.
    #[must_use]
    pub const fn info(&self) -> &TargetMemoryInfo
    {
        &self.info
    }

    /// Address the blob was read from, if known.
    #[must_use]
    pub const fn base(&self) -> Option<&TargetAddress>
    {
        self.base.as_ref()
    }

    /// A cursor positioned at the first byte.
    #[must_use]
    pub fn cursor(&self) -> BinaryCursor<'_>
    {
        BinaryCursor::new(self)
    }

    /// Copy `len` bytes starting at `offset` into a new blob with the same
    /// tag.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Decode`] if the range leaves the blob.
    pub fn slice(&self, offset: usize, len: usize) -> MantleResult<MemoryBlob>
    {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                MantleError::Decode(format!(
                    "slice {offset}+{len} out of bounds for {} byte blob",
                    self.bytes.len()
                ))
            })?;
        let mut blob = MemoryBlob::new(self.bytes[offset..end].to_vec(), self.info.clone());
        blob.base = self.base.as_ref().map(|b| b + offset as i64);
        Ok(blob)
    }

    /// Classic 16-bytes-per-row hex dump, labelled with absolute addresses
    /// when the base is known.
    #[must_use]
    pub fn hex_dump(&self) -> String
    {
        let origin = self.base.as_ref().map_or(0, TargetAddress::value);
        let mut out = String::new();
        for (row, chunk) in self.bytes.chunks(16).enumerate() {
            let _ = write!(out, "{:016x}  ", origin.wrapping_add(row as u64 * 16));
            for i in 0..16 {
                match chunk.get(i) {
                    Some(b) => {
                        let _ = write!(out, "{b:02x} ");
                    }
                    None => out.push_str("   "),
                }
                if i == 7 {
                    out.push(' ');
                }
            }
            out.push(' ');
            out.extend(chunk.iter().map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' }));
            out.push('\n');
        }
        out
    }
}
