// Debuggee events
//
// Callbacks the tracee makes on the debuggee thread at instrumented points.
// A callback that suspends blocks the calling thread itself.

use crate::breakpoints::Breakpoint;
use crate::context::Context;
use crate::error::DebugResult;
use std::sync::Arc;

pub trait EventHandler: Send + Sync {
    /// A breakpoint fired. The report is deferred to the location event
    /// that immediately follows on the same thread.
    fn on_breakpoint_hit(&self, context: &Arc<dyn Context>, breakpoint: &Breakpoint);

    /// An exception matched a catchpoint
    fn on_catchpoint_hit(&self, _context: &Arc<dyn Context>, _exception: &str) {}

    /// A line executed while tracing is on
    fn on_trace_step(&self, _context: &Arc<dyn Context>, _file: &str, _line: u32) {}

    /// The thread stopped at a statement. Blocks until resumed.
    fn on_location_reached(
        &self,
        context: Option<&Arc<dyn Context>>,
        file: &str,
        line: u32,
    ) -> DebugResult<()>;

    /// A frame is returning. Blocks until resumed.
    fn on_return(&self, context: &Arc<dyn Context>, file: &str, line: u32) -> DebugResult<()>;
}
