//! Stack frame types.

use super::symbols::{MethodHandle, SourceAddress};
use super::{TargetAddress, ThreadId};

/// Indicates how a frame was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus
{
    /// Innermost frame, read directly from the thread's registers.
    Registers,
    /// Caller frame reconstructed by following the frame-pointer chain.
    FramePointer,
}

/// One frame of a thread's stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame
{
    /// Owning thread.
    pub thread: ThreadId,
    /// Position in the backtrace (0 = innermost).
    pub index: usize,
    /// Program counter of this frame.
    pub pc: TargetAddress,
    /// Stack pointer snapshot.
    pub sp: u64,
    /// Frame pointer snapshot.
    pub fp: u64,
    /// Managed method containing `pc`, if the runtime has reported one.
    pub method: Option<MethodHandle>,
    /// Method name, copied so the frame stays printable after an unload.
    pub method_name: Option<String>,
    /// Source line information for `pc`.
    pub source: Option<SourceAddress>,
    /// How the frame was obtained.
    pub status: FrameStatus,
}

impl StackFrame
{
    /// `true` if `address` lies in the same source line region as this
    /// frame's `pc`.
    #[must_use]
    pub fn same_line(&self, address: u64) -> bool
    {
        match self.source {
            Some(source) => {
                let pc = self.pc.value();
                address >= source.line_start(pc) && address < source.line_end(pc)
            }
            None => false,
        }
    }
}
