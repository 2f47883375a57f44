// Command handlers
//
// One handler per command variant. Handlers read and mutate the session
// state; the control loop decides what happens with `proceed` and `quit`
// afterwards.

use crate::breakpoints::{BreakpointId, BreakpointRegistry};
use crate::commands::{CommandKind, CommandRegistry, MatchedCommand};
use crate::context::{Binding, Context, Tracee};
use crate::error::{CommandError, CommandResult};
use crate::interface::Output;
use crate::printer::Printer;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Lines shown on each side of the current one by `list`
const LIST_WINDOW: u32 = 5;

/// The thread a context command operates on
#[derive(Debug, Clone)]
pub struct SuspendedFrame {
    pub context: Arc<dyn Context>,
    pub file: String,
    pub line: u32,
    pub binding: Option<Binding>,
}

/// Per-command session state
pub struct CommandState<'a> {
    pub output: &'a Output,
    pub printer: &'a Printer,
    pub breakpoints: &'a BreakpointRegistry,
    pub tracee: &'a dyn Tracee,
    pub registry: &'a CommandRegistry,
    pub frame: Option<SuspendedFrame>,
    proceed: bool,
    quit: bool,
}

impl<'a> CommandState<'a> {
    pub fn new(
        output: &'a Output,
        printer: &'a Printer,
        breakpoints: &'a BreakpointRegistry,
        tracee: &'a dyn Tracee,
        registry: &'a CommandRegistry,
    ) -> Self {
        Self {
            output,
            printer,
            breakpoints,
            tracee,
            registry,
            frame: None,
            proceed: false,
            quit: false,
        }
    }

    pub fn with_frame(mut self, frame: Option<SuspendedFrame>) -> Self {
        self.frame = frame;
        self
    }

    /// Set by commands that let the suspended thread run again
    pub fn proceed(&self) -> bool {
        self.proceed
    }

    pub fn quit(&self) -> bool {
        self.quit
    }

    pub fn print(&self, path: &str, args: Value) -> CommandResult {
        let text = self.printer.render(path, &args)?;
        self.output.print(text);
        Ok(())
    }

    /// Build the error that aborts the current command with a message
    pub fn abort(&self, path: &str, args: Value) -> CommandError {
        match self.printer.render(path, &args) {
            Ok(text) => CommandError::Abort(text),
            Err(e) => e.into(),
        }
    }

    fn frame(&self) -> Result<&SuspendedFrame, CommandError> {
        self.frame
            .as_ref()
            .ok_or_else(|| self.abort("errors.unavailable", json!({})))
    }
}

pub fn execute(command: &MatchedCommand, state: &mut CommandState<'_>) -> CommandResult {
    debug!("Executing {:?} ({})", command.kind(), command.input);

    let arg = command.arg();
    match command.kind() {
        CommandKind::Break => handle_break(arg, state),
        CommandKind::Delete => handle_delete(arg, state),
        CommandKind::Enable => handle_enable(arg, true, state),
        CommandKind::Disable => handle_enable(arg, false, state),
        CommandKind::InfoBreakpoints => handle_info_breakpoints(state),
        CommandKind::Help => handle_help(state),
        CommandKind::Quit => {
            state.quit = true;
            Ok(())
        }
        CommandKind::Continue => {
            state.frame()?;
            state.proceed = true;
            Ok(())
        }
        CommandKind::Step => handle_step(arg, state),
        CommandKind::Next => handle_next(arg, state),
        CommandKind::Finish => handle_finish(arg, state),
        CommandKind::Where => handle_where(state),
        CommandKind::VarLocal => handle_var_local(state),
        CommandKind::List => handle_list(arg, state),
    }
}

fn handle_break(arg: Option<&str>, state: &mut CommandState<'_>) -> CommandResult {
    let current = state.frame.as_ref().map(|f| (f.file.clone(), f.line));
    let default_file = current
        .as_ref()
        .map(|(file, _)| file.clone())
        .or_else(|| state.tracee.default_file());

    let (file, line_arg) = match arg {
        None => match current {
            Some((file, line)) => (file, line.to_string()),
            None => return Err(state.abort("breakpoints.errors.no_position", json!({}))),
        },
        Some(arg) => match arg.rsplit_once(':') {
            Some((file, line)) => (file.to_string(), line.to_string()),
            None => match default_file {
                Some(file) => (file, arg.to_string()),
                None => return Err(state.abort("breakpoints.errors.no_position", json!({}))),
            },
        },
    };

    let line: u32 = line_arg
        .parse()
        .ok()
        .filter(|line| *line > 0)
        .ok_or_else(|| state.abort("breakpoints.errors.invalid_line", json!({ "arg": line_arg })))?;

    if !state.tracee.is_breakable(&file, line) {
        return Err(state.abort(
            "breakpoints.errors.not_breakable",
            json!({ "file": file, "line": line }),
        ));
    }

    let breakpoint = state.breakpoints.add(file, line);
    state.print(
        "breakpoints.set_breakpoint_to_line",
        json!({ "id": breakpoint.id, "file": breakpoint.file, "line": breakpoint.line }),
    )
}

fn parse_ids(arg: &str, state: &CommandState<'_>) -> Result<Vec<BreakpointId>, CommandError> {
    arg.split_whitespace()
        // `enable breakpoints 1 2` reads like `enable 1 2`
        .filter(|word| !matches!(*word, "b" | "br" | "break" | "breakpoint" | "breakpoints"))
        .map(|word| {
            word.parse::<BreakpointId>()
                .map_err(|_| state.abort("breakpoints.errors.invalid_number", json!({ "arg": word })))
        })
        .collect()
}

fn handle_delete(arg: Option<&str>, state: &mut CommandState<'_>) -> CommandResult {
    let Some(arg) = arg else {
        state.breakpoints.clear();
        return state.print("breakpoints.delete_all", json!({}));
    };

    for id in parse_ids(arg, state)? {
        if state.breakpoints.remove(id).is_none() {
            return Err(state.abort("breakpoints.errors.no_breakpoint", json!({ "id": id })));
        }
        state.print("breakpoints.delete", json!({ "id": id }))?;
    }
    Ok(())
}

fn handle_enable(arg: Option<&str>, enabled: bool, state: &mut CommandState<'_>) -> CommandResult {
    let ids = match arg {
        Some(arg) => parse_ids(arg, state)?,
        None => Vec::new(),
    };
    if ids.is_empty() {
        return Err(state.abort("breakpoints.errors.missing_id", json!({})));
    }

    let path = if enabled {
        "breakpoints.enabled"
    } else {
        "breakpoints.disabled"
    };

    for id in ids {
        if state.breakpoints.set_enabled(id, enabled).is_none() {
            return Err(state.abort("breakpoints.errors.no_breakpoint", json!({ "id": id })));
        }
        state.print(path, json!({ "id": id }))?;
    }
    Ok(())
}

fn handle_info_breakpoints(state: &mut CommandState<'_>) -> CommandResult {
    let breakpoints = state.breakpoints.list();
    if breakpoints.is_empty() {
        return state.print("breakpoints.no_breakpoints", json!({}));
    }

    state.print("breakpoints.list_header", json!({}))?;
    for b in breakpoints {
        state.print(
            "breakpoints.list_item",
            json!({
                "id": b.id,
                "enabled": if b.enabled { "y" } else { "n" },
                "file": b.file,
                "line": b.line,
                "hits": b.hit_count,
            }),
        )?;
    }
    Ok(())
}

fn handle_help(state: &mut CommandState<'_>) -> CommandResult {
    state.print("help.header", json!({}))?;
    for d in state.registry.descriptors() {
        state.print(
            "help.command",
            json!({ "name": d.name, "description": d.description }),
        )?;
    }
    Ok(())
}

fn parse_count(arg: Option<&str>, default: u32, state: &CommandState<'_>) -> Result<u32, CommandError> {
    match arg {
        None => Ok(default),
        Some(arg) => arg
            .parse()
            .map_err(|_| state.abort("errors.invalid_count", json!({ "arg": arg }))),
    }
}

fn handle_step(arg: Option<&str>, state: &mut CommandState<'_>) -> CommandResult {
    let steps = parse_count(arg, 1, state)?.max(1);
    state.frame()?.context.step_into(steps);
    state.proceed = true;
    Ok(())
}

fn handle_next(arg: Option<&str>, state: &mut CommandState<'_>) -> CommandResult {
    let steps = parse_count(arg, 1, state)?.max(1);
    state.frame()?.context.step_over(steps, 0);
    state.proceed = true;
    Ok(())
}

fn handle_finish(arg: Option<&str>, state: &mut CommandState<'_>) -> CommandResult {
    let frame = parse_count(arg, 0, state)? as usize;
    let context = &state.frame()?.context;

    let frames = context.stack_size();
    if frame >= frames {
        return Err(state.abort(
            "frame.errors.no_frame",
            json!({ "pos": frame, "frames": frames }),
        ));
    }

    context.step_out(frame);
    state.proceed = true;
    Ok(())
}

fn handle_where(state: &mut CommandState<'_>) -> CommandResult {
    let context = Arc::clone(&state.frame()?.context);

    for pos in 0..context.stack_size() {
        let Some(frame) = context.frame(pos) else {
            break;
        };
        state.print(
            "frame.line",
            json!({
                "mark": if pos == 0 { "-->" } else { "   " },
                "pos": pos,
                "name": frame.name,
                "file": frame.file,
                "line": frame.line,
            }),
        )?;
    }
    Ok(())
}

fn handle_var_local(state: &mut CommandState<'_>) -> CommandResult {
    let binding = state.frame()?.binding.clone().unwrap_or_default();
    if binding.is_empty() {
        return state.print("variable.no_locals", json!({}));
    }

    for (name, value) in &binding.variables {
        state.print("variable.variable", json!({ "name": name, "value": value }))?;
    }
    Ok(())
}

fn handle_list(arg: Option<&str>, state: &mut CommandState<'_>) -> CommandResult {
    let (file, current) = {
        let frame = state.frame()?;
        (frame.file.clone(), frame.line)
    };

    let center = parse_count(arg, current, state)?;
    let first = center.saturating_sub(LIST_WINDOW).max(1);
    let last = center.saturating_add(LIST_WINDOW);

    let lines: Vec<_> = (first..=last)
        .filter_map(|number| state.tracee.line_at(&file, number).map(|source| (number, source)))
        .collect();

    if lines.is_empty() {
        return Err(state.abort("list.errors.no_source", json!({ "file": file })));
    }

    for (number, source) in lines {
        state.print(
            "list.line",
            json!({
                "mark": if number == current { "=>" } else { "  " },
                "number": number,
                "source": source.trim_end(),
            }),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StopReason;
    use crate::interface::{output_channel, OutputQueue};
    use crate::suspension::tests::{MockContext, MockTracee};

    struct Fixture {
        output: Output,
        queue: OutputQueue,
        printer: Printer,
        breakpoints: BreakpointRegistry,
        tracee: MockTracee,
    }

    impl Fixture {
        fn new() -> Self {
            let (output, queue) = output_channel();
            Self {
                output,
                queue,
                printer: Printer::default(),
                breakpoints: BreakpointRegistry::new(),
                tracee: MockTracee::default(),
            }
        }

        fn state(&self) -> CommandState<'_> {
            CommandState::new(
                &self.output,
                &self.printer,
                &self.breakpoints,
                &self.tracee,
                CommandRegistry::global(),
            )
        }

        fn run(&self, input: &str, frame: Option<SuspendedFrame>) -> (CommandResult, bool, bool) {
            let command = CommandRegistry::global().match_context(input).unwrap();
            let mut state = self.state().with_frame(frame);
            let result = execute(&command, &mut state);
            (result, state.proceed(), state.quit())
        }

        fn messages(&mut self) -> Vec<String> {
            let mut messages = Vec::new();
            while let Some(m) = self.queue.try_recv() {
                messages.push(m.trim_end().to_string());
            }
            messages
        }
    }

    fn frame(context: Arc<MockContext>) -> SuspendedFrame {
        let binding = context.frame_binding(0);
        SuspendedFrame {
            context,
            file: "a.rb".to_string(),
            line: 4,
            binding,
        }
    }

    #[test]
    fn test_break_uses_default_file() {
        let mut fx = Fixture::new();
        let (result, proceed, _) = fx.run("b 12", None);

        assert!(result.is_ok());
        assert!(!proceed);
        assert_eq!(fx.messages(), vec!["Breakpoint 1 at a.rb:12"]);

        let bp = fx.breakpoints.get(1).unwrap();
        assert_eq!((bp.file.as_str(), bp.line), ("a.rb", 12));
    }

    #[test]
    fn test_break_with_file_and_without_args() {
        let mut fx = Fixture::new();
        fx.run("break other.rb:3", None).0.unwrap();

        let suspended = frame(MockContext::new(1, StopReason::Step));
        fx.run("break", Some(suspended)).0.unwrap();

        assert_eq!(
            fx.messages(),
            vec!["Breakpoint 1 at other.rb:3", "Breakpoint 2 at a.rb:4"]
        );
    }

    #[test]
    fn test_break_errors_abort() {
        let fx = Fixture::new();

        match fx.run("b x", None).0 {
            Err(CommandError::Abort(msg)) => assert_eq!(msg, "Invalid line number: x"),
            other => panic!("unexpected: {:?}", other),
        }
        match fx.run("b 99", None).0 {
            Err(CommandError::Abort(msg)) => {
                assert_eq!(msg, "Line 99 is not a valid breakpoint line in a.rb")
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(fx.breakpoints.is_empty());
    }

    #[test]
    fn test_delete_enable_disable() {
        let mut fx = Fixture::new();
        fx.breakpoints.add("a.rb", 1);
        fx.breakpoints.add("a.rb", 2);

        fx.run("disable 1", None).0.unwrap();
        assert!(!fx.breakpoints.get(1).unwrap().enabled);
        fx.run("enable breakpoints 1", None).0.unwrap();
        assert!(fx.breakpoints.get(1).unwrap().enabled);

        fx.run("delete 2", None).0.unwrap();
        assert!(fx.breakpoints.get(2).is_none());

        assert!(matches!(fx.run("delete 7", None).0, Err(CommandError::Abort(_))));
        assert!(matches!(fx.run("delete one", None).0, Err(CommandError::Abort(_))));
        assert!(matches!(fx.run("enable", None).0, Err(CommandError::Abort(_))));

        fx.run("delete", None).0.unwrap();
        assert!(fx.breakpoints.is_empty());

        assert_eq!(
            fx.messages(),
            vec![
                "Breakpoint 1 disabled",
                "Breakpoint 1 enabled",
                "Deleted breakpoint 2",
                "Deleted all breakpoints",
            ]
        );
    }

    #[test]
    fn test_info_breakpoints() {
        let mut fx = Fixture::new();
        fx.run("info break", None).0.unwrap();
        assert_eq!(fx.messages(), vec!["No breakpoints."]);

        fx.breakpoints.add("a.rb", 3);
        fx.breakpoints.set_enabled(1, false);
        fx.run("info break", None).0.unwrap();
        assert_eq!(
            fx.messages(),
            vec!["Num Enb What", "1   n   at a.rb:3 (hit 0 times)"]
        );
    }

    #[test]
    fn test_quit_and_help() {
        let mut fx = Fixture::new();
        let (result, proceed, quit) = fx.run("quit", None);
        assert!(result.is_ok() && quit && !proceed);

        fx.run("help", None).0.unwrap();
        let messages = fx.messages();
        assert_eq!(messages[0], "Available commands:");
        assert!(messages.iter().any(|m| m.starts_with("  continue - ")));
    }

    #[test]
    fn test_movement_commands_set_proceed() {
        let fx = Fixture::new();
        let context = MockContext::new(1, StopReason::Step);

        let (result, proceed, _) = fx.run("cont", Some(frame(context.clone())));
        assert!(result.is_ok() && proceed);

        let (_, proceed, _) = fx.run("step 3", Some(frame(context.clone())));
        assert!(proceed);
        let (_, proceed, _) = fx.run("next", Some(frame(context.clone())));
        assert!(proceed);
        assert_eq!(*context.steps.lock(), vec![("into", 3), ("over", 1)]);

        let (_, proceed, _) = fx.run("finish 1", Some(frame(context.clone())));
        assert!(proceed);
        assert_eq!(
            *context.stop_frame.lock(),
            Some(crate::context::StopFrame::Frame(1))
        );

        let (result, proceed, _) = fx.run("finish 5", Some(frame(context.clone())));
        assert!(matches!(result, Err(CommandError::Abort(_))));
        assert!(!proceed);

        let (result, proceed, _) = fx.run("step many", Some(frame(context)));
        assert!(matches!(result, Err(CommandError::Abort(msg)) if msg == "Invalid count: many"));
        assert!(!proceed);
    }

    #[test]
    fn test_where_var_local_list() {
        let mut fx = Fixture::new();
        let context = MockContext::new(1, StopReason::Step);

        fx.run("where", Some(frame(context.clone()))).0.unwrap();
        fx.run("var local", Some(frame(context.clone()))).0.unwrap();
        fx.run("list 2", Some(frame(context))).0.unwrap();

        let messages = fx.messages();
        assert_eq!(messages[0], "--> #0 inner at a.rb:4");
        assert_eq!(messages[1], "    #1 main at a.rb:5");
        assert_eq!(messages[2], "x = 42");
        // list 2 shows lines 1..=7 with the current line marked
        assert_eq!(messages[3], "   1: line 1");
        assert_eq!(messages[6], "=> 4: line 4");
        assert_eq!(messages.len(), 3 + 7);
    }

    #[test]
    fn test_var_local_without_binding() {
        let mut fx = Fixture::new();
        let mut suspended = frame(MockContext::new(1, StopReason::Step));
        suspended.binding = None;

        fx.run("var local", Some(suspended)).0.unwrap();
        assert_eq!(fx.messages(), vec!["No local variables"]);
    }
}
