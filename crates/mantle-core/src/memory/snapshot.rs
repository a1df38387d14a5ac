//! # Process Snapshots
//!
//! A [`ProcessSnapshot`] is a frozen copy of a process: memory regions plus a
//! register set per thread. It implements the same accessor and control
//! contracts as a live process so the rest of the engine cannot tell the
//! difference, except that every write and every attempt to run code fails
//! with [`MantleError::ReadOnly`].
//!
//! Snapshots are either assembled in memory ([`ProcessSnapshot::with_region`],
//! [`ProcessSnapshot::with_thread`]) or loaded from the `PT_LOAD` segments of
//! an ELF core file ([`ProcessSnapshot::from_core_file`]). Register sets are
//! never decoded from core notes; callers attach them explicitly.
//!
//! All addresses of a snapshot live in their own freshly allocated domain, so
//! a pointer read from a snapshot can never be used against a live process.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use object::{Object, ObjectSegment, SegmentFlags};
use tracing::{debug, info};

use crate::error::{MantleError, MantleResult};
use crate::memory::{MemoryAccessor, TargetMemoryInfo};
use crate::target::{BackendBreakpointId, ProcessControl, ResumeMode, TargetEvent};
use crate::types::{AddressDomain, Architecture, MemoryRegion, ProcessId, Registers, TargetAddress, ThreadId};

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

#[derive(Debug, Clone)]
struct SnapshotRegion
{
    start: u64,
    bytes: Vec<u8>,
    permissions: String,
}

impl SnapshotRegion
{
    fn end(&self) -> u64
    {
        self.start.saturating_add(self.bytes.len() as u64)
    }
}

/// Read-only image of a process.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot
{
    regions: Vec<SnapshotRegion>,
    threads: BTreeMap<ThreadId, Registers>,
    architecture: Architecture,
    info: TargetMemoryInfo,
}

impl ProcessSnapshot
{
    /// Empty snapshot of a little-endian `architecture` process.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self
    {
        let info = TargetMemoryInfo::for_architecture(architecture).with_domain(AddressDomain::fresh("snapshot"));
        Self {
            regions: Vec::new(),
            threads: BTreeMap::new(),
            architecture,
            info,
        }
    }

    /// Add a memory region starting at `start`.
    #[must_use]
    pub fn with_region(mut self, start: u64, bytes: Vec<u8>, permissions: impl Into<String>) -> Self
    {
        self.insert_region(SnapshotRegion {
            start,
            bytes,
            permissions: permissions.into(),
        });
        self
    }

    /// Add a thread with its saved register set.
    #[must_use]
    pub fn with_thread(mut self, thread: ThreadId, registers: Registers) -> Self
    {
        self.threads.insert(thread, registers);
        self
    }

    fn insert_region(&mut self, region: SnapshotRegion)
    {
        let at = self.regions.partition_point(|r| r.start < region.start);
        self.regions.insert(at, region);
    }

    /// Load the memory of an ELF core file.
    ///
    /// Only segments with file-backed bytes are kept; `p_memsz` beyond
    /// `p_filesz` was not dumped and stays unreadable.
    ///
    /// ## Errors
    ///
    /// [`MantleError::Io`] if the file cannot be read,
    /// [`MantleError::InvalidArgument`] if it is not a parseable object file.
    pub fn from_core_file(path: impl AsRef<Path>) -> MantleResult<Self>
    {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let file = object::File::parse(&*data)
            .map_err(|err| MantleError::InvalidArgument(format!("failed to parse {}: {err}", path.display())))?;

        let architecture = match file.architecture() {
            object::Architecture::Aarch64 => Architecture::Arm64,
            object::Architecture::X86_64 => Architecture::X86_64,
            _ => Architecture::Unknown("unknown"),
        };

        let mut info = TargetMemoryInfo::little_endian(if file.is_64() { 8 } else { 4 })
            .with_domain(AddressDomain::fresh("snapshot"));
        if !file.is_little_endian() {
            info = info.into_big_endian();
        }

        let mut snapshot = Self {
            regions: Vec::new(),
            threads: BTreeMap::new(),
            architecture,
            info,
        };

        for segment in file.segments() {
            let bytes = segment
                .data()
                .map_err(|err| MantleError::InvalidArgument(format!("bad segment in {}: {err}", path.display())))?;
            if bytes.is_empty() {
                continue;
            }
            let permissions = match segment.flags() {
                SegmentFlags::Elf { p_flags } => elf_permissions(p_flags),
                _ => String::from("r--p"),
            };
            debug!(start = format_args!("0x{:x}", segment.address()), size = bytes.len(), %permissions, "snapshot segment");
            snapshot.insert_region(SnapshotRegion {
                start: segment.address(),
                bytes: bytes.to_vec(),
                permissions,
            });
        }

        info!(path = %path.display(), regions = snapshot.regions.len(), %architecture, "loaded core file");
        Ok(snapshot)
    }

    /// Domain of every address in this snapshot.
    #[must_use]
    pub const fn domain(&self) -> &AddressDomain
    {
        &self.info.domain
    }

    /// Address in this snapshot's domain.
    #[must_use]
    pub fn address(&self, value: u64) -> TargetAddress
    {
        self.info.address(value)
    }

    fn read_only(address: u64) -> MantleError
    {
        MantleError::ReadOnly { address }
    }
}

fn elf_permissions(p_flags: u32) -> String
{
    let mut out = String::with_capacity(4);
    out.push(if p_flags & PF_R != 0 { 'r' } else { '-' });
    out.push(if p_flags & PF_W != 0 { 'w' } else { '-' });
    out.push(if p_flags & PF_X != 0 { 'x' } else { '-' });
    out.push('p');
    out
}

impl MemoryAccessor for ProcessSnapshot
{
    fn memory_info(&self) -> TargetMemoryInfo
    {
        self.info.clone()
    }

    fn read_buffer(&self, address: &TargetAddress, size: usize) -> MantleResult<Vec<u8>>
    {
        self.check_address(address, size)?;
        // Collect the covering slices first so a bogus size fails before
        // anything is allocated for it.
        let mut pieces = Vec::new();
        let mut remaining = size;
        let mut cursor = address.value();
        while remaining > 0 {
            let region = self
                .regions
                .iter()
                .find(|r| cursor >= r.start && cursor < r.end())
                .ok_or_else(|| MantleError::memory(cursor, remaining, "not present in snapshot"))?;
            let from = (cursor - region.start) as usize;
            let take = remaining.min(region.bytes.len() - from);
            pieces.push(&region.bytes[from..from + take]);
            remaining -= take;
            cursor += take as u64;
        }
        Ok(pieces.concat())
    }

    fn write_buffer(&mut self, address: &TargetAddress, _data: &[u8]) -> MantleResult<()>
    {
        Err(Self::read_only(address.value()))
    }

    fn can_write(&self) -> bool
    {
        false
    }

    fn read_registers(&self, thread: ThreadId) -> MantleResult<Registers>
    {
        self.threads
            .get(&thread)
            .cloned()
            .ok_or_else(|| MantleError::InvalidArgument(format!("thread {thread} is not in the snapshot")))
    }

    fn write_registers(&mut self, _thread: ThreadId, _registers: &Registers) -> MantleResult<()>
    {
        Err(Self::read_only(0))
    }

    fn memory_maps(&self) -> MantleResult<Vec<MemoryRegion>>
    {
        Ok(self
            .regions
            .iter()
            .map(|r| MemoryRegion::new(r.start, r.end(), r.permissions.clone(), None))
            .collect())
    }
}

impl ProcessControl for ProcessSnapshot
{
    fn process_id(&self) -> Option<ProcessId>
    {
        None
    }

    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn supports_execution(&self) -> bool
    {
        false
    }

    fn threads(&self) -> MantleResult<Vec<ThreadId>>
    {
        Ok(self.threads.keys().copied().collect())
    }

    fn resume(&mut self, _thread: ThreadId, _mode: ResumeMode) -> MantleResult<()>
    {
        Err(Self::read_only(0))
    }

    fn poll_event(&mut self, _timeout: Duration) -> MantleResult<Option<TargetEvent>>
    {
        Ok(None)
    }

    fn interrupt(&mut self) -> MantleResult<()>
    {
        Ok(())
    }

    fn insert_breakpoint(&mut self, address: &TargetAddress) -> MantleResult<BackendBreakpointId>
    {
        Err(Self::read_only(address.value()))
    }

    fn remove_breakpoint(&mut self, id: BackendBreakpointId) -> MantleResult<()>
    {
        Err(MantleError::BreakpointIdNotFound(id.raw()))
    }

    fn call_function(&mut self, _thread: ThreadId, function: &TargetAddress, _args: &[u64]) -> MantleResult<u64>
    {
        Err(Self::read_only(function.value()))
    }

    fn detach(&mut self) -> MantleResult<()>
    {
        Ok(())
    }

    fn kill(&mut self) -> MantleResult<()>
    {
        Err(Self::read_only(0))
    }
}
