//! Debugger event types and helpers.
//!
//! Clients consume these events to follow asynchronous target changes
//! (stops, module loads, breakpoint bindings) without polling the session.
//! The session publishes them from control operations and from the
//! notification dispatcher.

use std::sync::{mpsc, Arc, Mutex};

use tracing::trace;

use crate::breakpoints::BreakpointId;
use crate::types::{ModuleHandle, StopReason, TargetAddress, ThreadId};

/// Event emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggerEvent
{
    /// A thread stopped and the stop is reported to the client.
    TargetStopped
    {
        /// Reason reported by the backend.
        reason: StopReason,
        /// Thread responsible for the stop (if known).
        thread: Option<ThreadId>,
        /// Client breakpoints responsible for the stop.
        breakpoints: Vec<BreakpointId>,
    },
    /// A thread resumed execution.
    TargetResumed
    {
        /// Thread that was resumed.
        thread: ThreadId,
    },
    /// The runtime loaded a module.
    ModuleLoaded
    {
        /// Handle of the new module.
        module: ModuleHandle,
        /// Module name.
        name: String,
    },
    /// The runtime unloaded a module.
    ModuleUnloaded
    {
        /// Handle the module had.
        module: ModuleHandle,
    },
    /// A breakpoint resolved to an address.
    BreakpointBound
    {
        /// Breakpoint.
        id: BreakpointId,
        /// Where it was bound.
        address: Option<TargetAddress>,
    },
    /// A breakpoint lost its address.
    BreakpointUnbound
    {
        /// Breakpoint.
        id: BreakpointId,
    },
    /// The runtime reported a new thread.
    ThreadCreated
    {
        /// New thread.
        thread: ThreadId,
    },
    /// The runtime reported a thread exit.
    ThreadExited
    {
        /// Exited thread.
        thread: ThreadId,
    },
    /// The target process is gone.
    TargetExited
    {
        /// Final status.
        reason: StopReason,
    },
}

impl DebuggerEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::TargetStopped {
                reason,
                thread,
                breakpoints,
            } => {
                let mut description = format_stop_reason(*reason);
                if let Some(thread_id) = thread {
                    description.push_str(&format!(" (thread {})", thread_id.raw()));
                }
                if !breakpoints.is_empty() {
                    let ids: Vec<String> = breakpoints.iter().map(ToString::to_string).collect();
                    description.push_str(&format!(" [breakpoint {}]", ids.join(", ")));
                }
                description
            }
            Self::TargetResumed { thread } => format!("Thread {} resumed", thread.raw()),
            Self::ModuleLoaded { module, name } => format!("Loaded {name} ({module})"),
            Self::ModuleUnloaded { module } => format!("Unloaded {module}"),
            Self::BreakpointBound { id, address: Some(address) } => format!("Breakpoint {id} bound at {address}"),
            Self::BreakpointBound { id, address: None } => format!("Breakpoint {id} bound"),
            Self::BreakpointUnbound { id } => format!("Breakpoint {id} unbound"),
            Self::ThreadCreated { thread } => format!("Thread {} started", thread.raw()),
            Self::ThreadExited { thread } => format!("Thread {} exited", thread.raw()),
            Self::TargetExited { reason } => format_stop_reason(*reason),
        }
    }
}

/// Format a [`StopReason`] into a user-facing message.
#[must_use]
pub fn format_stop_reason(reason: StopReason) -> String
{
    match reason {
        StopReason::Step => "Step completed".to_string(),
        StopReason::Interrupted => "Interrupted".to_string(),
        StopReason::Signal(sig) => format!("Stopped by signal: {sig}"),
        StopReason::Breakpoint(addr) => format!("Hit breakpoint at 0x{addr:x}"),
        StopReason::Exited(code) => format!("Process exited with code: {code}"),
        StopReason::Killed(sig) => format!("Process killed by signal: {sig}"),
    }
}

/// Sender side of the debugger event channel.
pub type DebuggerEventSender = mpsc::Sender<DebuggerEvent>;
/// Receiver side of the debugger event channel.
pub type DebuggerEventReceiver = mpsc::Receiver<DebuggerEvent>;

/// Create a new debugger event channel.
#[must_use]
pub fn event_channel() -> (DebuggerEventSender, DebuggerEventReceiver)
{
    mpsc::channel()
}

/// Fan-out of events to every subscriber. Subscribers that hung up are
/// dropped on the next publish.
#[derive(Debug, Clone, Default)]
pub struct EventBus
{
    subscribers: Arc<Mutex<Vec<DebuggerEventSender>>>,
}

impl EventBus
{
    /// Bus without subscribers.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// New receiver for every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> DebuggerEventReceiver
    {
        let (sender, receiver) = event_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(sender);
        }
        receiver
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: DebuggerEvent)
    {
        trace!(event = %event.describe(), "publishing event");
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|sender| sender.send(event.clone()).is_ok());
        }
    }
}
