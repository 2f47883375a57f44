// Error types shared by the debugger core
//
// DebugError covers transport, template and configuration failures.
// CommandError is what a command handler returns: Abort stops only the
// current sub-command, Fatal ends the control loop.

use crate::printer::PrinterError;
use std::io;
use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Template error: {0}")]
    Template(#[from] PrinterError),

    #[error("Invalid handshake: {0:?}")]
    InvalidHandshake(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("{message}")]
    Internal { message: String, backtrace: String },
}

impl DebugError {
    /// True when the error only means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            DebugError::ConnectionClosed => true,
            DebugError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type CommandResult = Result<(), CommandError>;

#[derive(Debug, Error)]
pub enum CommandError {
    /// Abandon the current sub-command; the message has already been rendered.
    #[error("{0}")]
    Abort(String),

    #[error(transparent)]
    Fatal(#[from] DebugError),
}

impl From<PrinterError> for CommandError {
    fn from(e: PrinterError) -> Self {
        CommandError::Fatal(DebugError::Template(e))
    }
}
