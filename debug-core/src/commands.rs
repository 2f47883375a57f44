// Command registry
//
// The closed set of commands the debugger understands. Each variant carries
// its matcher and two capability flags as data:
//   allowed_in_control    - may run with no suspended thread
//   requires_live_context - refused when the suspended context is dead
// Control commands are tried first; everything else needs a suspended
// thread.

use regex::{Captures, Regex};
use std::sync::LazyLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Break,
    Delete,
    Enable,
    Disable,
    InfoBreakpoints,
    Help,
    Quit,
    Continue,
    Step,
    Next,
    Finish,
    Where,
    VarLocal,
    List,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    pub kind: CommandKind,
    pub name: &'static str,
    pub pattern: &'static str,
    pub requires_live_context: bool,
    pub allowed_in_control: bool,
    pub description: &'static str,
}

pub static DESCRIPTORS: &[CommandDescriptor] = &[
    CommandDescriptor {
        kind: CommandKind::Break,
        name: "break",
        pattern: r"^\s*b(?:reak)?(?:\s+(\S+))?\s*$",
        requires_live_context: false,
        allowed_in_control: true,
        description: "break [FILE:]LINE - set a breakpoint",
    },
    CommandDescriptor {
        kind: CommandKind::Delete,
        name: "delete",
        pattern: r"^\s*del(?:ete)?(?:\s+(.*?))?\s*$",
        requires_live_context: false,
        allowed_in_control: true,
        description: "delete [N...] - delete breakpoints (all if none given)",
    },
    CommandDescriptor {
        kind: CommandKind::Enable,
        name: "enable",
        pattern: r"^\s*en(?:able)?(?:\s+(.*?))?\s*$",
        requires_live_context: false,
        allowed_in_control: true,
        description: "enable N... - enable breakpoints",
    },
    CommandDescriptor {
        kind: CommandKind::Disable,
        name: "disable",
        pattern: r"^\s*dis(?:able)?(?:\s+(.*?))?\s*$",
        requires_live_context: false,
        allowed_in_control: true,
        description: "disable N... - disable breakpoints",
    },
    CommandDescriptor {
        kind: CommandKind::InfoBreakpoints,
        name: "info break",
        pattern: r"^\s*i(?:nfo)?\s+b(?:reak(?:points)?)?\s*$",
        requires_live_context: false,
        allowed_in_control: true,
        description: "info break - list breakpoints",
    },
    CommandDescriptor {
        kind: CommandKind::Help,
        name: "help",
        pattern: r"^\s*h(?:elp)?\s*$",
        requires_live_context: false,
        allowed_in_control: true,
        description: "help - list commands",
    },
    CommandDescriptor {
        kind: CommandKind::Quit,
        name: "quit",
        pattern: r"^\s*(?:q(?:uit)?|exit)\s*$",
        requires_live_context: false,
        allowed_in_control: true,
        description: "quit - end the debugging session",
    },
    CommandDescriptor {
        kind: CommandKind::Continue,
        name: "continue",
        pattern: r"^\s*c(?:ont(?:inue)?)?\s*$",
        requires_live_context: true,
        allowed_in_control: false,
        description: "continue - resume the suspended thread",
    },
    CommandDescriptor {
        kind: CommandKind::Step,
        name: "step",
        pattern: r"^\s*s(?:tep)?(?:\s+(\S+))?\s*$",
        requires_live_context: true,
        allowed_in_control: false,
        description: "step [N] - step into, N statements",
    },
    CommandDescriptor {
        kind: CommandKind::Next,
        name: "next",
        pattern: r"^\s*n(?:ext)?(?:\s+(\S+))?\s*$",
        requires_live_context: true,
        allowed_in_control: false,
        description: "next [N] - step over, N statements",
    },
    CommandDescriptor {
        kind: CommandKind::Finish,
        name: "finish",
        pattern: r"^\s*fin(?:ish)?(?:\s+(\S+))?\s*$",
        requires_live_context: true,
        allowed_in_control: false,
        description: "finish [FRAME] - run until the frame returns",
    },
    CommandDescriptor {
        kind: CommandKind::Where,
        name: "where",
        pattern: r"^\s*(?:w(?:here)?|bt|backtrace)\s*$",
        requires_live_context: false,
        allowed_in_control: false,
        description: "where - print the call stack",
    },
    CommandDescriptor {
        kind: CommandKind::VarLocal,
        name: "var local",
        pattern: r"^\s*(?:v(?:ar)?\s+l(?:ocal)?|i(?:nfo)?\s+l(?:ocals)?)\s*$",
        requires_live_context: false,
        allowed_in_control: false,
        description: "var local - print local variables of the current frame",
    },
    CommandDescriptor {
        kind: CommandKind::List,
        name: "list",
        pattern: r"^\s*l(?:ist)?(?:\s+(\S+))?\s*$",
        requires_live_context: false,
        allowed_in_control: false,
        description: "list [LINE] - print source around the current line",
    },
];

/// A command line matched against a descriptor
#[derive(Debug, Clone)]
pub struct MatchedCommand {
    pub descriptor: &'static CommandDescriptor,
    pub input: String,
    pub arg: Option<String>,
}

impl MatchedCommand {
    pub fn kind(&self) -> CommandKind {
        self.descriptor.kind
    }

    pub fn arg(&self) -> Option<&str> {
        self.arg.as_deref()
    }

    fn from_captures(descriptor: &'static CommandDescriptor, input: &str, caps: Captures<'_>) -> Self {
        Self {
            descriptor,
            input: input.to_string(),
            arg: caps.get(1).map(|m| m.as_str().to_string()).filter(|a| !a.is_empty()),
        }
    }
}

#[derive(Debug)]
pub struct CommandRegistry {
    commands: Vec<(&'static CommandDescriptor, Regex)>,
}

static REGISTRY: LazyLock<CommandRegistry> = LazyLock::new(CommandRegistry::new);

impl CommandRegistry {
    fn new() -> Self {
        let commands = DESCRIPTORS
            .iter()
            .map(|d| {
                let regex = Regex::new(d.pattern).expect("command patterns are valid");
                (d, regex)
            })
            .collect();

        Self { commands }
    }

    /// The registry, compiled on first use
    pub fn global() -> &'static CommandRegistry {
        &REGISTRY
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &'static CommandDescriptor> + '_ {
        self.commands.iter().map(|(d, _)| *d)
    }

    pub fn control_commands(&self) -> impl Iterator<Item = &'static CommandDescriptor> + '_ {
        self.descriptors().filter(|d| d.allowed_in_control)
    }

    /// Match against the commands that run without a suspended thread
    pub fn match_control(&self, input: &str) -> Option<MatchedCommand> {
        self.find(input, |d| d.allowed_in_control)
    }

    /// Match against every command; used once a thread is suspended
    pub fn match_context(&self, input: &str) -> Option<MatchedCommand> {
        self.find(input, |_| true)
    }

    fn find(&self, input: &str, pool: impl Fn(&CommandDescriptor) -> bool) -> Option<MatchedCommand> {
        let matched = self
            .commands
            .iter()
            .filter(|(d, _)| pool(d))
            .find_map(|(d, regex)| {
                regex
                    .captures(input)
                    .map(|caps| MatchedCommand::from_captures(*d, input, caps))
            });

        if let Some(m) = &matched {
            debug!("'{}' matched {:?}", input, m.kind());
        }
        matched
    }
}

/// Split an input line into sub-commands on `separator`
pub fn split_commands<'a>(input: &'a str, separator: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    input
        .split(separator)
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
}
