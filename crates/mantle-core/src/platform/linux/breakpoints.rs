//! # Software Breakpoints
//!
//! `INT3` traps patched into target code. Several owners (client
//! breakpoints, the runtime notification hook, temporary step-over traps)
//! may want a trap at the same address; each insert returns its own id and
//! the original byte is restored only when the last one is removed.
//!
//! Reads through [`TrapTable::mask`] see the original bytes, never the
//! traps, so code and data read by the engine look the way the runtime
//! wrote them.

use std::collections::{BTreeMap, HashMap};

use super::memory::ProcMemory;
use crate::error::{MantleError, MantleResult};
use crate::target::BackendBreakpointId;

/// `INT3`
pub(crate) const TRAP_INSTRUCTION: u8 = 0xcc;

#[derive(Debug, Clone, Copy)]
struct TrapSite
{
    original: u8,
    owners: usize,
}

/// Traps currently in the target.
#[derive(Debug, Default)]
pub(crate) struct TrapTable
{
    next_id: u64,
    by_id: HashMap<BackendBreakpointId, u64>,
    sites: BTreeMap<u64, TrapSite>,
}

impl TrapTable
{
    pub(crate) fn new() -> Self
    {
        Self::default()
    }

    fn allocate_id(&mut self) -> BackendBreakpointId
    {
        self.next_id = self.next_id.wrapping_add(1);
        BackendBreakpointId::from_raw(self.next_id)
    }

    /// `true` if a trap is patched in at `address`.
    pub(crate) fn contains(&self, address: u64) -> bool
    {
        self.sites.contains_key(&address)
    }

    /// Patch a trap in at `address`, or share the existing one.
    pub(crate) fn insert(&mut self, memory: &ProcMemory, address: u64) -> MantleResult<BackendBreakpointId>
    {
        match self.sites.get_mut(&address) {
            Some(site) => site.owners += 1,
            None => {
                let original = memory.read(address, 1)?[0];
                memory.write(address, &[TRAP_INSTRUCTION])?;
                self.sites.insert(address, TrapSite { original, owners: 1 });
            }
        }
        let id = self.allocate_id();
        self.by_id.insert(id, address);
        Ok(id)
    }

    /// Drop one owner of a trap, restoring the original byte after the last.
    pub(crate) fn remove(&mut self, memory: &ProcMemory, id: BackendBreakpointId) -> MantleResult<u64>
    {
        let address = self
            .by_id
            .remove(&id)
            .ok_or(MantleError::BreakpointIdNotFound(id.raw()))?;
        let site = self
            .sites
            .get_mut(&address)
            .ok_or_else(|| MantleError::invariant(format!("trap {id} has no site at 0x{address:x}")))?;
        site.owners -= 1;
        if site.owners == 0 {
            let original = site.original;
            self.sites.remove(&address);
            memory.write(address, &[original])?;
        }
        Ok(address)
    }

    /// Put the original byte back at `address` without forgetting the trap.
    pub(crate) fn lift(&self, memory: &ProcMemory, address: u64) -> MantleResult<()>
    {
        match self.sites.get(&address) {
            Some(site) => memory.write(address, &[site.original]),
            None => Ok(()),
        }
    }

    /// Re-patch a trap lifted with [`Self::lift`].
    pub(crate) fn restore(&self, memory: &ProcMemory, address: u64) -> MantleResult<()>
    {
        if self.sites.contains_key(&address) {
            memory.write(address, &[TRAP_INSTRUCTION])?;
        }
        Ok(())
    }

    /// Replace trap bytes in `buffer` (read at `address`) by the originals.
    pub(crate) fn mask(&self, address: u64, buffer: &mut [u8])
    {
        let end = address.saturating_add(buffer.len() as u64);
        for (site_address, site) in self.sites.range(address..end) {
            buffer[(site_address - address) as usize] = site.original;
        }
    }

    /// Keep traps in place across a client write to `[address, address +
    /// data.len())`: remember the new bytes as originals and return what
    /// must actually be written.
    pub(crate) fn merge_write(&mut self, address: u64, data: &[u8]) -> Vec<u8>
    {
        let mut patched = data.to_vec();
        let end = address.saturating_add(data.len() as u64);
        for (site_address, site) in self.sites.range_mut(address..end) {
            let offset = (site_address - address) as usize;
            site.original = data[offset];
            patched[offset] = TRAP_INSTRUCTION;
        }
        patched
    }

    /// Put every original byte back and forget all traps.
    pub(crate) fn clear(&mut self, memory: &ProcMemory) -> MantleResult<()>
    {
        let mut first_error = None;
        for (address, site) in std::mem::take(&mut self.sites) {
            if let Err(err) = memory.write(address, &[site.original]) {
                tracing::warn!(address = format_args!("0x{address:x}"), error = %err, "could not restore original byte");
                first_error.get_or_insert(err);
            }
        }
        self.by_id.clear();
        first_error.map_or(Ok(()), Err)
    }
}
