// Interactive debugger control core
//
// The part of a debugger that sits between a traced program and an operator:
// - Suspension of the debuggee thread at breakpoints and steps
// - Command matching and dispatch from a control loop
// - Message templates
// - Console and remote (TCP) interfaces
// - A small script language to debug

pub mod breakpoints;
pub mod commands;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod events;
pub mod handlers;
pub mod interface;
pub mod printer;
pub mod remote;
pub mod script;
pub mod suspension;

pub use breakpoints::{Breakpoint, BreakpointRegistry};
pub use config::Config;
pub use context::{Context, StopReason, Tracee};
pub use control::{ControlLoop, DebugSession, LoopExit};
pub use error::{CommandError, DebugError, DebugResult};
pub use events::EventHandler;
pub use interface::{output_channel, Interface, Output};
pub use printer::Printer;
pub use suspension::Suspension;
