//! Process, thread, stop reason and memory region types.

use std::fmt;

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use mantle_core::types::ProcessId;
///
/// let pid = ProcessId::from(12345);
/// assert_eq!(u32::from(pid), 12345);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// On Linux this is the kernel TID. Snapshots and scripted backends use
/// whatever numbering they were built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    ///
    /// ```rust
    /// use mantle_core::types::ThreadId;
    ///
    /// let thread = ThreadId::from(12345);
    /// assert_eq!(thread.raw(), 12345);
    /// ```
    #[must_use]
    pub const fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Why a thread stopped, as reported by a backend.
///
/// ## State Transitions
///
/// - `Running` → `Step`: a single-step request completed
/// - `Running` → `Breakpoint(addr)`: the thread executed a trap at `addr`
/// - `Running` → `Interrupted`: the client asked the target to stop
/// - `Running` → `Signal(n)`: any other signal stop
/// - `Running` → `Exited(code)` / `Killed(sig)`: terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason
{
    /// A single-step request completed.
    Step,
    /// Hit a software breakpoint; the value is the breakpoint address (the
    /// backend has already rewound the program counter to it).
    Breakpoint(u64),
    /// Artificial stop requested through an interrupt.
    Interrupted,
    /// Stopped because a signal was delivered.
    Signal(i32),
    /// Thread exited with status code.
    Exited(i32),
    /// Thread was terminated by a signal.
    Killed(i32),
}

impl StopReason
{
    /// `true` for the reasons after which the thread cannot run again.
    #[must_use]
    pub const fn is_terminal(self) -> bool
    {
        matches!(self, StopReason::Exited(_) | StopReason::Killed(_))
    }
}

/// Memory region in a process
///
/// ## Example
///
/// ```
/// use mantle_core::types::MemoryRegion;
///
/// let code = MemoryRegion::new(0x1000, 0x2000, "r-x", Some("/usr/lib/libmono.so".to_string()));
/// assert_eq!(code.size(), 0x1000);
/// assert!(code.is_executable() && !code.is_writable());
/// assert!(code.contains(0x1fff) && !code.contains(0x2000));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    /// Start address of the memory region (inclusive)
    pub start: u64,
    /// End address of the memory region (exclusive)
    pub end: u64,
    /// Permission string in `/proc/<pid>/maps` style (`r`, `w`, `x`, `-`)
    pub permissions: String,
    /// Backing file or pseudo-name such as `[heap]`
    pub name: Option<String>,
}

impl MemoryRegion
{
    /// Create a new memory region
    pub fn new(start: u64, end: u64, permissions: impl Into<String>, name: Option<String>) -> Self
    {
        Self {
            start,
            end,
            permissions: permissions.into(),
            name,
        }
    }

    /// Size in bytes, 0 if `end <= start`.
    #[must_use]
    pub const fn size(&self) -> u64
    {
        self.end.saturating_sub(self.start)
    }

    /// `true` if the permissions contain `r`.
    #[must_use]
    pub fn is_readable(&self) -> bool
    {
        self.permissions.contains('r')
    }

    /// `true` if the permissions contain `w`.
    #[must_use]
    pub fn is_writable(&self) -> bool
    {
        self.permissions.contains('w')
    }

    /// `true` if the permissions contain `x`.
    #[must_use]
    pub fn is_executable(&self) -> bool
    {
        self.permissions.contains('x')
    }

    /// `true` if `start <= address < end`.
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool
    {
        address >= self.start && address < self.end
    }
}

/// CPU architecture of the debug target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM
    Arm64,
    /// 64-bit x86 (Intel/AMD)
    X86_64,
    /// Any other architecture (or unknown)
    Unknown(&'static str),
}

impl Architecture
{
    /// Architecture of the running debugger binary.
    #[must_use]
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }

        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }

        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        {
            Architecture::Unknown(std::env::consts::ARCH)
        }
    }

    /// Size of a pointer in bytes for this architecture.
    #[must_use]
    pub const fn pointer_size_bytes(self) -> u8
    {
        match self {
            Architecture::Arm64 | Architecture::X86_64 | Architecture::Unknown(_) => 8,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Unknown(name) => write!(f, "{name}"),
        }
    }
}
