//! `/proc/<pid>` access: memory, mappings and the thread list.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;

use libc::pid_t;

use crate::error::{MantleError, MantleResult};
use crate::types::MemoryRegion;

const READ_BLOCK: usize = 4096;

/// Open handle on `/proc/<pid>/mem`.
///
/// Writes go through the kernel's forced-access path, so read-only code
/// pages can be patched without changing their protection.
#[derive(Debug)]
pub(crate) struct ProcMemory
{
    file: File,
}

impl ProcMemory
{
    pub(crate) fn open(pid: pid_t) -> MantleResult<Self>
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))
            .map_err(|err| MantleError::AttachFailed(format!("cannot open memory of {pid}: {err}")))?;
        Ok(Self { file })
    }

    /// Read `size` bytes, growing the buffer one page-sized block at a time
    /// so an unmapped range fails before the full size is allocated.
    pub(crate) fn read(&self, address: u64, size: usize) -> MantleResult<Vec<u8>>
    {
        let mut buffer = Vec::with_capacity(size.min(READ_BLOCK));
        let mut block = [0u8; READ_BLOCK];
        while buffer.len() < size {
            let done = buffer.len();
            let want = (size - done).min(READ_BLOCK);
            match self.file.read_at(&mut block[..want], address + done as u64) {
                Ok(0) => return Err(MantleError::memory(address + done as u64, size - done, "unmapped")),
                Ok(n) => buffer.extend_from_slice(&block[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(MantleError::memory(address + done as u64, size - done, err.to_string())),
            }
        }
        Ok(buffer)
    }

    pub(crate) fn write(&self, address: u64, data: &[u8]) -> MantleResult<()>
    {
        let mut done = 0;
        while done < data.len() {
            match self.file.write_at(&data[done..], address + done as u64) {
                Ok(0) => return Err(MantleError::memory(address + done as u64, data.len() - done, "unmapped")),
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(MantleError::memory(address + done as u64, data.len() - done, err.to_string())),
            }
        }
        Ok(())
    }
}

/// Thread ids of `pid`, sorted.
pub(crate) fn list_threads(pid: pid_t) -> MantleResult<Vec<pid_t>>
{
    let entries = fs::read_dir(format!("/proc/{pid}/task")).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => MantleError::ProcessNotFound(pid.unsigned_abs()),
        _ => MantleError::Io(err),
    })?;
    let mut threads = Vec::new();
    for entry in entries {
        if let Some(tid) = entry?.file_name().to_str().and_then(|name| name.parse::<pid_t>().ok()) {
            threads.push(tid);
        }
    }
    threads.sort_unstable();
    Ok(threads)
}

/// Mappings of `pid` from `/proc/<pid>/maps`.
pub(crate) fn memory_maps(pid: pid_t) -> MantleResult<Vec<MemoryRegion>>
{
    let text = fs::read_to_string(format!("/proc/{pid}/maps"))?;
    text.lines().map(parse_maps_line).collect()
}

/// One line of `/proc/<pid>/maps`:
/// `start-end perms offset dev inode [name]`.
pub(crate) fn parse_maps_line(line: &str) -> MantleResult<MemoryRegion>
{
    let malformed = || MantleError::Decode(format!("malformed maps line: {line}"));
    let mut fields = line.split_whitespace();
    let range = fields.next().ok_or_else(malformed)?;
    let permissions = fields.next().ok_or_else(malformed)?;
    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;
    // offset, device, inode
    let name = fields.nth(3).map(|first| {
        let rest: Vec<&str> = std::iter::once(first).chain(fields).collect();
        rest.join(" ")
    });
    Ok(MemoryRegion::new(start, end, permissions, name))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn parses_named_and_anonymous_mappings()
    {
        let code = parse_maps_line("7f00a000-7f00c000 r-xp 00001000 08:01 1234    /usr/lib/libmonosgen-2.0.so").unwrap();
        assert_eq!(code.start, 0x7f00_a000);
        assert_eq!(code.size(), 0x2000);
        assert!(code.is_executable());
        assert_eq!(code.name.as_deref(), Some("/usr/lib/libmonosgen-2.0.so"));

        let anonymous = parse_maps_line("01000000-01021000 rw-p 00000000 00:00 0").unwrap();
        assert!(anonymous.name.is_none());
        assert!(anonymous.is_writable());

        assert!(parse_maps_line("garbage").is_err());
    }
}
