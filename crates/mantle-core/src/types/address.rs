//! Domain-tagged target addresses.
//!
//! A raw `u64` says nothing about *which* memory it points into. The same
//! numeric value can name a byte in the live process, a slot in a per-frame
//! register context, or a page in a dead snapshot. [`TargetAddress`] carries an
//! [`AddressDomain`] so that mixing those is a checked error instead of a
//! silent read of the wrong memory.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};

use crate::error::{MantleError, MantleResult};

// Dynamic domains start above the global id and never reuse it.
static NEXT_DOMAIN_ID: AtomicI32 = AtomicI32::new(1);

/// Partition of the address space.
///
/// Domains order by id. Two domains are equal only when both `id` and `name`
/// match. Domains are
/// never merged; addresses from different domains are not comparable.
///
/// ## Example
///
/// ```rust
/// use mantle_core::types::AddressDomain;
///
/// let snapshot = AddressDomain::fresh("snapshot");
/// assert!(AddressDomain::GLOBAL.is_global());
/// assert!(!snapshot.is_global());
/// assert_ne!(snapshot, AddressDomain::GLOBAL);
/// assert!(AddressDomain::GLOBAL < snapshot);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressDomain
{
    id: i32,
    name: Cow<'static, str>,
}

impl AddressDomain
{
    /// The canonical domain of a live target's virtual memory: `(0, "global")`.
    pub const GLOBAL: Self = Self {
        id: 0,
        name: Cow::Borrowed("global"),
    };

    /// Construct a domain from an explicit name and id.
    pub fn new(name: impl Into<String>, id: i32) -> Self
    {
        Self {
            id,
            name: Cow::Owned(name.into()),
        }
    }

    /// Allocate a domain with a process-unique id.
    pub fn fresh(name: impl Into<String>) -> Self
    {
        let id = NEXT_DOMAIN_ID.fetch_add(1, AtomicOrdering::Relaxed);
        Self::new(name, id)
    }

    /// Numeric id.
    #[must_use]
    pub const fn id(&self) -> i32
    {
        self.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// `true` only for the canonical `(0, "global")` domain.
    #[must_use]
    pub fn is_global(&self) -> bool
    {
        self.id == 0 && self.name == "global"
    }

    fn ensure_same(&self, other: &Self) -> MantleResult<()>
    {
        if self == other {
            Ok(())
        } else {
            Err(MantleError::DomainMismatch {
                left: self.to_string(),
                right: other.to_string(),
            })
        }
    }
}

impl fmt::Display for AddressDomain
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Domain-tagged offset into a target's memory.
///
/// Offset `0` is the null address. Arithmetic with integers keeps the domain;
/// comparing or subtracting two addresses requires both to be in the same
/// domain and fails with [`MantleError::DomainMismatch`] otherwise.
///
/// ## Example
///
/// ```rust
/// use std::cmp::Ordering;
/// use mantle_core::types::{AddressDomain, TargetAddress};
///
/// let a = TargetAddress::new(AddressDomain::GLOBAL, 0x1000);
/// let b = &a + 0x10;
/// assert_eq!(b.offset(), 0x1010);
/// assert_eq!(a.checked_compare(&b)?, Ordering::Less);
/// # Ok::<(), mantle_core::error::MantleError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress
{
    domain: AddressDomain,
    offset: i64,
}

impl TargetAddress
{
    /// The null address.
    pub const NULL: Self = Self {
        domain: AddressDomain::GLOBAL,
        offset: 0,
    };

    /// Create an address in `domain`.
    pub const fn new(domain: AddressDomain, offset: i64) -> Self
    {
        Self { domain, offset }
    }

    /// Create an address in the global domain from a raw value.
    #[must_use]
    pub const fn global(value: u64) -> Self
    {
        Self::new(AddressDomain::GLOBAL, value as i64)
    }

    /// Signed offset within the domain.
    #[must_use]
    pub const fn offset(&self) -> i64
    {
        self.offset
    }

    /// Offset reinterpreted as the raw unsigned address handed to backends.
    #[must_use]
    pub const fn value(&self) -> u64
    {
        self.offset as u64
    }

    /// Owning domain.
    #[must_use]
    pub const fn domain(&self) -> &AddressDomain
    {
        &self.domain
    }

    /// `true` when the offset is zero.
    #[must_use]
    pub const fn is_null(&self) -> bool
    {
        self.offset == 0
    }

    /// Compare two addresses of the same domain.
    ///
    /// ## Errors
    ///
    /// [`MantleError::DomainMismatch`] if the domains differ.
    pub fn checked_compare(&self, other: &Self) -> MantleResult<Ordering>
    {
        self.domain.ensure_same(&other.domain)?;
        Ok(self.offset.cmp(&other.offset))
    }

    /// Signed distance `self - other`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::DomainMismatch`] if the domains differ.
    pub fn checked_sub(&self, other: &Self) -> MantleResult<i64>
    {
        self.domain.ensure_same(&other.domain)?;
        Ok(self.offset.wrapping_sub(other.offset))
    }

    /// `true` if `start <= self < end`.
    ///
    /// ## Errors
    ///
    /// [`MantleError::DomainMismatch`] if any of the three domains differ.
    pub fn is_within(&self, start: &Self, end: &Self) -> MantleResult<bool>
    {
        Ok(self.checked_compare(start)? != Ordering::Less && self.checked_compare(end)? == Ordering::Less)
    }

    /// Same offset re-tagged with another domain. Only for translating a raw
    /// value a backend produced for that domain (e.g. a register value).
    #[must_use]
    pub fn in_domain(&self, domain: &AddressDomain) -> Self
    {
        Self::new(domain.clone(), self.offset)
    }
}

impl fmt::Display for TargetAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.is_null() {
            return write!(f, "null");
        }
        if self.domain.is_global() {
            write!(f, "0x{:016x}", self.value())
        } else {
            write!(f, "{}:0x{:016x}", self.domain, self.value())
        }
    }
}

impl Add<i64> for TargetAddress
{
    type Output = TargetAddress;

    fn add(self, rhs: i64) -> Self::Output
    {
        TargetAddress::new(self.domain, self.offset.wrapping_add(rhs))
    }
}

impl Add<i64> for &TargetAddress
{
    type Output = TargetAddress;

    fn add(self, rhs: i64) -> Self::Output
    {
        TargetAddress::new(self.domain.clone(), self.offset.wrapping_add(rhs))
    }
}

impl Sub<i64> for TargetAddress
{
    type Output = TargetAddress;

    fn sub(self, rhs: i64) -> Self::Output
    {
        TargetAddress::new(self.domain, self.offset.wrapping_sub(rhs))
    }
}

impl Sub<i64> for &TargetAddress
{
    type Output = TargetAddress;

    fn sub(self, rhs: i64) -> Self::Output
    {
        TargetAddress::new(self.domain.clone(), self.offset.wrapping_sub(rhs))
    }
}
