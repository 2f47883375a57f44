// Tracee collaborator contract
//
// The execution engine that runs the debuggee owns threads, frames and
// bindings. The core only sees them through these traits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type ThreadNum = u32;

/// Threads whose name starts with this prefix belong to the debugger and
/// must never be traced.
pub const DEBUGGER_THREAD_PREFIX: &str = "rdebug-";

/// Whether the calling thread is one of the debugger's own threads
pub fn on_debugger_thread() -> bool {
    std::thread::current()
        .name()
        .is_some_and(|name| name.starts_with(DEBUGGER_THREAD_PREFIX))
}

// Why a context last stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Step,
    Breakpoint,
    Catchpoint,
    Return,
    None,
}

// Frame at which a `finish` should stop again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopFrame {
    /// Nothing pending; the outermost frame
    Outermost,
    /// Stop once the frame at this index (0 = innermost) returns
    Frame(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// Local variables visible in one frame, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub variables: Vec<(String, String)>,
}

impl Binding {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// One observed debuggee thread.
///
/// Methods are called from the control thread while the context is parked,
/// so implementations need interior mutability.
pub trait Context: Send + Sync + fmt::Debug {
    fn thnum(&self) -> ThreadNum;

    fn stop_reason(&self) -> StopReason;

    fn is_dead(&self) -> bool;

    /// True for threads owned by the debugger itself
    fn is_debugger_thread(&self) -> bool {
        false
    }

    fn stack_size(&self) -> usize;

    /// Frame info, 0 = innermost
    fn frame(&self, index: usize) -> Option<FrameInfo>;

    fn frame_binding(&self, index: usize) -> Option<Binding>;

    fn set_stop_frame(&self, frame: StopFrame);

    /// Stop again after `steps` statements
    fn step_into(&self, steps: u32);

    /// Stop again after `steps` statements that run in frame `frame` or an
    /// outer one
    fn step_over(&self, steps: u32, frame: usize);

    /// Stop again when frame `frame` returns
    fn step_out(&self, frame: usize) {
        self.set_stop_frame(StopFrame::Frame(frame));
    }
}

/// Process-wide queries answered by the tracee
pub trait Tracee: Send + Sync {
    /// Context of the thread that is currently executing traced code
    fn current_context(&self) -> Option<Arc<dyn Context>>;

    /// Source text of `file:line`, if known
    fn line_at(&self, file: &str, line: u32) -> Option<String>;

    /// Whether a breakpoint can be placed at `file:line`
    fn is_breakable(&self, _file: &str, _line: u32) -> bool {
        true
    }

    /// File used by `break LINE` when no file is given and nothing is suspended
    fn default_file(&self) -> Option<String> {
        None
    }
}
