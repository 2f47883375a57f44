// Suspension core
//
// Rendezvous between the debuggee thread delivering events and the control
// thread consuming them. The debuggee thread records where it stopped,
// reports it, and blocks on a condition variable until resume() is called.
//
// Invariants:
// - at most one breakpoint hit is pending (unreported) at any time
// - at most one thread is parked; a second one trying to park is fatal
// - the suspension record is fully populated before anything is reported
// - record and pending slot are cleared on every exit from a park

use crate::breakpoints::Breakpoint;
use crate::context::{Context, StopFrame, StopReason, Tracee};
use crate::error::DebugResult;
use crate::events::EventHandler;
use crate::interface::Output;
use crate::printer::Printer;
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the parked debuggee thread stopped
#[derive(Debug, Clone)]
pub struct SuspensionRecord {
    pub context: Arc<dyn Context>,
    pub file: String,
    pub line: u32,
    /// Sequence number of this park; every park gets a new one
    pub park: u64,
}

impl SuspensionRecord {
    /// Same thread parked by the same event
    pub fn is_same_park(&self, other: &SuspensionRecord) -> bool {
        self.park == other.park && self.context.thnum() == other.context.thnum()
    }
}

#[derive(Debug, Default)]
struct State {
    record: Option<SuspensionRecord>,
    pending: Option<Breakpoint>,
    released: bool,
    parks: u64,
}

pub struct Suspension {
    state: Mutex<State>,
    resumed: Condvar,
    output: Output,
    printer: Arc<Printer>,
    tracee: Arc<dyn Tracee>,
}

impl Suspension {
    pub fn new(output: Output, printer: Arc<Printer>, tracee: Arc<dyn Tracee>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            resumed: Condvar::new(),
            output,
            printer,
            tracee,
        }
    }

    /// True while a thread is parked and has not been told to resume
    pub fn has_suspended_context(&self) -> bool {
        let state = self.state.lock();
        state.record.is_some() && !state.released
    }

    pub fn current_suspension(&self) -> Option<SuspensionRecord> {
        let state = self.state.lock();
        if state.released {
            return None;
        }
        state.record.clone()
    }

    pub fn has_pending_breakpoint(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Release the parked thread. No-op when nothing is parked, when it was
    /// already released, or when its context is dead.
    pub fn resume(&self) -> bool {
        self.release(None)
    }

    /// Release the thread only if it is still parked at `expected`. A
    /// command acting on an older snapshot must not release a later park,
    /// possibly of another thread.
    pub fn resume_suspension(&self, expected: &SuspensionRecord) -> bool {
        self.release(Some(expected))
    }

    fn release(&self, expected: Option<&SuspensionRecord>) -> bool {
        let mut state = self.state.lock();
        let Some(record) = &state.record else {
            debug!("Resume requested with no thread suspended");
            return false;
        };

        if let Some(expected) = expected {
            if !record.is_same_park(expected) {
                warn!(
                    "Not resuming thread {}: command was for park {} of thread {}",
                    record.context.thnum(),
                    expected.park,
                    expected.context.thnum()
                );
                return false;
            }
        }

        let thnum = record.context.thnum();
        if state.released {
            return false;
        }
        if record.context.is_dead() {
            warn!("Thread {} is dead and cannot be resumed", thnum);
            return false;
        }

        state.released = true;
        self.resumed.notify_all();
        info!("Resuming thread {}", thnum);
        true
    }

    /// Announce a finished thread and park it for inspection. Its context
    /// is dead, so it stays parked until the process exits.
    pub fn post_mortem(&self, context: &Arc<dyn Context>, file: &str, line: u32) -> DebugResult<()> {
        info!("Thread {} finished, entering post-mortem", context.thnum());
        self.line_event(context, file, line, || {
            self.print("general.post_mortem", json!({ "thnum": context.thnum() }))
        })
    }

    fn print(&self, path: &str, args: Value) -> DebugResult<()> {
        let text = self.printer.render(path, &args)?;
        self.output.print(text);
        Ok(())
    }

    fn print_file_line(&self, context: Option<&Arc<dyn Context>>, file: &str, line: u32) -> DebugResult<()> {
        let source = self.tracee.line_at(file, line).unwrap_or_default();
        self.print(
            "stop.suspend",
            json!({
                "file": file,
                "line": line,
                "source": source.trim_end(),
                "thnum": context.map(|c| c.thnum()),
                "frames": context.map(|c| c.stack_size()),
            }),
        )
    }

    fn print_breakpoint(&self, breakpoint: &Breakpoint, thread_id: u32, file: &str, line: u32) -> DebugResult<()> {
        self.print(
            "breakpoints.stop_at_breakpoint",
            json!({
                "id": breakpoint.id,
                "file": file,
                "line": line,
                "thread_id": thread_id,
            }),
        )
    }

    /// Record the stop, run `report`, announce any pending breakpoint and
    /// block until resumed
    fn line_event(
        &self,
        context: &Arc<dyn Context>,
        file: &str,
        line: u32,
        report: impl FnOnce() -> DebugResult<()>,
    ) -> DebugResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(parked) = &state.record {
                let parked = parked.context.thnum();
                drop(state);
                panic!(
                    "thread {} tried to suspend while thread {} is already suspended",
                    context.thnum(),
                    parked
                );
            }

            state.parks += 1;
            state.record = Some(SuspensionRecord {
                context: Arc::clone(context),
                file: file.to_string(),
                line,
                park: state.parks,
            });
            state.released = false;
        }

        let _cleanup = ClearOnExit { suspension: self };

        // Reported only now that file and line are recorded, so the control
        // thread never sees a report without a suspended context behind it
        report()?;
        let pending = self.state.lock().pending.take();
        if let Some(breakpoint) = pending {
            let thread_id = self
                .tracee
                .current_context()
                .map_or_else(|| context.thnum(), |current| current.thnum());
            self.print_breakpoint(&breakpoint, thread_id, file, line)?;
        }

        if context.is_debugger_thread() {
            panic!(
                "debugger threads are not supposed to be traced (thread {})",
                context.thnum()
            );
        }

        debug!("Thread {} suspended at {}:{}", context.thnum(), file, line);

        let mut state = self.state.lock();
        while !state.released {
            self.resumed.wait(&mut state);
        }

        debug!("Thread {} resumed", context.thnum());
        Ok(())
    }
}

struct ClearOnExit<'a> {
    suspension: &'a Suspension,
}

impl Drop for ClearOnExit<'_> {
    fn drop(&mut self) {
        let mut state = self.suspension.state.lock();
        state.record = None;
        state.pending = None;
        state.released = false;
    }
}

impl EventHandler for Suspension {
    fn on_breakpoint_hit(&self, context: &Arc<dyn Context>, breakpoint: &Breakpoint) {
        let mut state = self.state.lock();
        if let Some(pending) = &state.pending {
            let pending = pending.id;
            drop(state);
            panic!(
                "pending breakpoint supposed to be empty, is #{} (thread {} hit #{})",
                pending,
                context.thnum(),
                breakpoint.id
            );
        }

        debug!("Thread {} hit breakpoint {}", context.thnum(), breakpoint.id);
        state.pending = Some(breakpoint.clone());
    }

    fn on_catchpoint_hit(&self, context: &Arc<dyn Context>, exception: &str) {
        debug!("Thread {} raised {}", context.thnum(), exception);
    }

    fn on_trace_step(&self, context: &Arc<dyn Context>, file: &str, line: u32) {
        info!("Tracing thread {}: {}:{}", context.thnum(), file, line);
    }

    fn on_location_reached(&self, context: Option<&Arc<dyn Context>>, file: &str, line: u32) -> DebugResult<()> {
        let Some(context) = context else {
            // Nothing to park without a thread
            if let Some(breakpoint) = self.state.lock().pending.take() {
                warn!("Dropping breakpoint {} reported without a context", breakpoint.id);
            }
            return self.print_file_line(None, file, line);
        };

        self.line_event(context, file, line, || {
            if context.stop_reason() == StopReason::Step {
                self.print_file_line(Some(context), file, line)?;
            }
            Ok(())
        })
    }

    fn on_return(&self, context: &Arc<dyn Context>, file: &str, line: u32) -> DebugResult<()> {
        context.set_stop_frame(StopFrame::Outermost);
        self.line_event(context, file, line, || self.print_file_line(Some(context), file, line))
    }
}
