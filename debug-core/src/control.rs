// Control loop
//
// Reads command lines from an Interface, splits them into sub-commands and
// dispatches each one: control commands always run, everything else needs a
// suspended thread. A context command that asks to proceed resumes the
// parked debuggee thread once it has run.

use crate::breakpoints::BreakpointRegistry;
use crate::commands::{split_commands, CommandRegistry};
use crate::context::Tracee;
use crate::error::{CommandError, DebugError, DebugResult};
use crate::handlers::{self, CommandState, SuspendedFrame};
use crate::interface::Interface;
use crate::printer::Printer;
use crate::suspension::Suspension;
use serde_json::json;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::VecDeque;
use std::error::Error as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};

pub const DEFAULT_SEPARATOR: &str = ";";

/// State shared by every control loop of one debugging session
#[derive(Clone)]
pub struct DebugSession {
    pub suspension: Arc<Suspension>,
    pub breakpoints: BreakpointRegistry,
    pub printer: Arc<Printer>,
    pub tracee: Arc<dyn Tracee>,
}

/// Why a control loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Input ended or the session was shut down
    Closed,
    /// The operator asked to quit
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct ControlLoop {
    interface: Interface,
    session: DebugSession,
    separator: String,
    startup: VecDeque<String>,
    ready: Option<oneshot::Sender<()>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ControlLoop {
    pub fn new(interface: Interface, session: DebugSession) -> Self {
        Self {
            interface,
            session,
            separator: DEFAULT_SEPARATOR.to_string(),
            startup: VecDeque::new(),
            ready: None,
            shutdown: None,
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Lines executed before any operator input (init files, scripts)
    pub fn with_startup_commands(mut self, commands: impl IntoIterator<Item = String>) -> Self {
        self.startup.extend(commands);
        self
    }

    /// Signalled once the startup commands have run
    pub fn with_ready(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// End the loop once the watched flag turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run until input ends, the operator quits or a fatal error occurs.
    /// The interface is closed on every path.
    pub async fn run(mut self) -> DebugResult<LoopExit> {
        info!("Control loop started on {}", self.interface.kind());

        let result = match self.process_commands().await {
            Err(e) if e.is_disconnect() => {
                debug!("Interface disconnected: {}", e);
                Ok(LoopExit::Closed)
            }
            Err(e) => {
                error!("Control loop failed: {}", e);
                self.report_internal(&e);
                Err(e)
            }
            ok => ok,
        };

        self.interface.close().await;
        result
    }

    async fn process_commands(&mut self) -> DebugResult<LoopExit> {
        while let Some(line) = self.startup.pop_front() {
            if self.process_line(&line)? == Flow::Quit {
                return Ok(LoopExit::Quit);
            }
        }

        if let Some(ready) = self.ready.take() {
            ready.send(()).ok();
        }

        loop {
            let line = match self.shutdown.as_mut() {
                Some(shutdown) => tokio::select! {
                    line = self.interface.read_command() => line?,
                    _ = shutdown.wait_for(|done| *done) => {
                        info!("Session shut down");
                        return Ok(LoopExit::Closed);
                    }
                },
                None => self.interface.read_command().await?,
            };

            let Some(line) = line else {
                debug!("End of input");
                return Ok(LoopExit::Closed);
            };

            if self.process_line(&line)? == Flow::Quit {
                return Ok(LoopExit::Quit);
            }
        }
    }

    fn process_line(&mut self, line: &str) -> DebugResult<Flow> {
        let inputs: Vec<String> = split_commands(line, &self.separator)
            .map(str::to_string)
            .collect();

        for input in inputs {
            match self.dispatch(&input) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => return Ok(Flow::Quit),
                Err(CommandError::Abort(message)) => {
                    debug!("'{}' aborted: {}", input, message);
                    self.interface.print(message);
                }
                Err(CommandError::Fatal(e)) => return Err(e),
            }
        }
        Ok(Flow::Continue)
    }

    fn dispatch(&self, input: &str) -> Result<Flow, CommandError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute(input))) {
            Ok(result) => result,
            Err(payload) => Err(CommandError::Fatal(internal_error(input, payload))),
        }
    }

    fn execute(&self, input: &str) -> Result<Flow, CommandError> {
        let registry = CommandRegistry::global();
        let session = &self.session;
        let mut state = CommandState::new(
            self.interface.output(),
            &session.printer,
            &session.breakpoints,
            &*session.tracee,
            registry,
        );

        if let Some(command) = registry.match_control(input) {
            handlers::execute(&command, &mut state)?;
            return Ok(flow(&state));
        }

        let Some(record) = session.suspension.current_suspension() else {
            return Err(state.abort("errors.no_suspended_thread", json!({ "input": input })));
        };

        let Some(command) = registry.match_context(input) else {
            return Err(state.abort("errors.unknown_command", json!({ "input": input })));
        };

        if command.descriptor.requires_live_context && record.context.is_dead() {
            return Err(state.abort("errors.unavailable", json!({})));
        }

        let binding = record.context.frame_binding(0);
        let mut state = state.with_frame(Some(SuspendedFrame {
            context: record.context.clone(),
            file: record.file.clone(),
            line: record.line,
            binding,
        }));

        let result = handlers::execute(&command, &mut state);
        if state.proceed() {
            session.suspension.resume_suspension(&record);
        }
        result?;

        Ok(flow(&state))
    }

    fn report_internal(&self, e: &DebugError) {
        let message = self
            .session
            .printer
            .render("errors.internal", &json!({ "message": e.to_string() }))
            .unwrap_or_else(|_| e.to_string());

        let mut report = vec![message];
        match e {
            DebugError::Internal { backtrace, .. } => {
                report.extend(backtrace.lines().map(|line| format!("\t{}", line)));
            }
            _ => {
                let mut source = e.source();
                while let Some(cause) = source {
                    report.push(format!("\t{}", cause));
                    source = cause.source();
                }
            }
        }

        self.interface.print(report.join("\n"));
    }
}

fn flow(state: &CommandState<'_>) -> Flow {
    if state.quit() {
        Flow::Quit
    } else {
        Flow::Continue
    }
}

fn internal_error(input: &str, payload: Box<dyn Any + Send>) -> DebugError {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());

    let backtrace = Backtrace::capture();
    let backtrace = match backtrace.status() {
        BacktraceStatus::Captured => backtrace.to_string(),
        _ => String::new(),
    };

    DebugError::Internal {
        message: format!("'{}' panicked: {}", input, reason),
        backtrace,
    }
}
