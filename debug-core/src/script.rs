// Script tracee
//
// A small line-oriented language executed on the calling thread. It stands
// in for a real execution engine: every statement line is an instrumented
// point where breakpoints, stepping and tracing are checked and the event
// handler is called.
//
//   # comment        not a statement
//   name:            label, not a statement
//   echo TEXT        write TEXT to the program output
//   set NAME = VAL   bind a local in the current frame
//   call LABEL       push a frame and jump past LABEL
//   return           pop a frame; at top level ends the program
//   raise MESSAGE    kill the thread
//   exit             end the program
//
// Any other non-blank line is a statement that does nothing.

use crate::breakpoints::BreakpointRegistry;
use crate::context::{on_debugger_thread, Binding, Context, FrameInfo, StopFrame, StopReason, ThreadNum, Tracee};
use crate::error::{DebugError, DebugResult};
use crate::events::EventHandler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Thread number of the script's only thread
pub const MAIN_THREAD: ThreadNum = 1;

const TOP_FRAME: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    Echo(String),
    Set(String, String),
    Call(String),
    Return,
    Raise(String),
    Exit,
    Other,
}

fn label_name(line: &str) -> Option<&str> {
    let name = line.strip_suffix(':')?;
    (!name.is_empty() && !name.contains(char::is_whitespace)).then_some(name)
}

fn parse_statement(line: &str) -> Option<Statement> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || label_name(line).is_some() {
        return None;
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let statement = match word {
        "echo" => Statement::Echo(rest.to_string()),
        "set" => match rest.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Statement::Set(name.trim().to_string(), value.trim().to_string())
            }
            _ => Statement::Other,
        },
        "call" if !rest.is_empty() => Statement::Call(rest.to_string()),
        "return" => Statement::Return,
        "raise" if rest.is_empty() => Statement::Raise("unhandled exception".to_string()),
        "raise" => Statement::Raise(rest.to_string()),
        "exit" => Statement::Exit,
        _ => Statement::Other,
    };
    Some(statement)
}

#[derive(Debug, Clone)]
pub struct Script {
    name: String,
    lines: Vec<String>,
    labels: HashMap<String, usize>,
}

impl Script {
    pub fn parse(name: impl Into<String>, text: &str) -> Self {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let labels = lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| label_name(line.trim()).map(|name| (name.to_string(), index)))
            .collect();

        Self {
            name: name.into(),
            lines,
            labels,
        }
    }

    pub fn from_file(path: &Path) -> DebugResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| DebugError::Script(format!("{}: {}", path.display(), e)))?;
        Ok(Self::parse(path.display().to_string(), &text))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `file` names this script, either exactly or by path suffix
    pub fn matches(&self, file: &str) -> bool {
        self.name == file || Path::new(&self.name).ends_with(file)
    }

    /// Source of line `number` (1-based)
    pub fn line(&self, number: u32) -> Option<&str> {
        let index = (number as usize).checked_sub(1)?;
        self.lines.get(index).map(String::as_str)
    }

    pub fn is_statement(&self, number: u32) -> bool {
        self.line(number).and_then(parse_statement).is_some()
    }
}

#[derive(Debug)]
struct ScriptFrame {
    name: String,
    line: u32,
    locals: Vec<(String, String)>,
    /// Line index execution continues at once this frame returns
    return_to: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stepping {
    Run,
    Into(u32),
    /// Count only statements at `depth` frames or fewer
    Over { remaining: u32, depth: usize },
}

#[derive(Debug)]
struct ContextState {
    frames: Vec<ScriptFrame>,
    stop_reason: StopReason,
    dead: bool,
    stepping: Stepping,
    /// Stop when a frame at this depth or shallower returns
    stop_depth: Option<usize>,
}

/// The script's thread as seen by the debugger
#[derive(Debug)]
pub struct ScriptContext {
    thnum: ThreadNum,
    file: String,
    debugger_thread: bool,
    state: Mutex<ContextState>,
}

impl ScriptContext {
    fn new(thnum: ThreadNum, file: &str) -> Self {
        Self {
            thnum,
            file: file.to_string(),
            debugger_thread: on_debugger_thread(),
            state: Mutex::new(ContextState {
                frames: vec![ScriptFrame {
                    name: TOP_FRAME.to_string(),
                    line: 0,
                    locals: Vec::new(),
                    return_to: 0,
                }],
                stop_reason: StopReason::None,
                dead: false,
                stepping: Stepping::Run,
                stop_depth: None,
            }),
        }
    }

    fn set_line(&self, line: u32) {
        if let Some(frame) = self.state.lock().frames.last_mut() {
            frame.line = line;
        }
    }

    /// Count one statement against the stepping state; true when it
    /// should stop there
    fn take_step(&self) -> bool {
        let mut state = self.state.lock();
        let depth = state.frames.len();

        match &mut state.stepping {
            Stepping::Run => false,
            Stepping::Into(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            Stepping::Over { remaining, depth: target } => {
                if depth > *target {
                    return false;
                }
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
        }
    }

    fn stop(&self, reason: StopReason) {
        let mut state = self.state.lock();
        state.stop_reason = reason;
        state.stepping = Stepping::Run;
    }

    fn return_watched(&self) -> bool {
        let state = self.state.lock();
        state.stop_depth.is_some_and(|depth| state.frames.len() <= depth)
    }

    fn set_local(&self, name: String, value: String) {
        let mut state = self.state.lock();
        let Some(frame) = state.frames.last_mut() else {
            return;
        };

        match frame.locals.iter_mut().find(|(n, _)| *n == name) {
            Some(local) => local.1 = value,
            None => frame.locals.push((name, value)),
        }
    }

    fn push_frame(&self, name: &str, line: u32, return_to: usize) {
        self.state.lock().frames.push(ScriptFrame {
            name: name.to_string(),
            line,
            locals: Vec::new(),
            return_to,
        });
    }

    /// Pop the innermost frame unless it is the top level. Returns where
    /// execution continues.
    fn pop_frame(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.frames.len() <= 1 {
            return None;
        }
        state.frames.pop().map(|frame| frame.return_to)
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.dead = true;
        state.stop_reason = StopReason::None;
        state.stepping = Stepping::Run;
    }
}

impl Context for ScriptContext {
    fn thnum(&self) -> ThreadNum {
        self.thnum
    }

    fn stop_reason(&self) -> StopReason {
        self.state.lock().stop_reason
    }

    fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    fn is_debugger_thread(&self) -> bool {
        self.debugger_thread
    }

    fn stack_size(&self) -> usize {
        self.state.lock().frames.len()
    }

    fn frame(&self, index: usize) -> Option<FrameInfo> {
        let state = self.state.lock();
        let frame = state.frames.iter().rev().nth(index)?;
        Some(FrameInfo {
            name: frame.name.clone(),
            file: self.file.clone(),
            line: frame.line,
        })
    }

    fn frame_binding(&self, index: usize) -> Option<Binding> {
        let state = self.state.lock();
        let frame = state.frames.iter().rev().nth(index)?;
        Some(Binding {
            variables: frame.locals.clone(),
        })
    }

    fn set_stop_frame(&self, frame: StopFrame) {
        let mut state = self.state.lock();
        state.stop_depth = match frame {
            StopFrame::Outermost => None,
            StopFrame::Frame(index) => Some(state.frames.len().saturating_sub(index)),
        };
    }

    fn step_into(&self, steps: u32) {
        self.state.lock().stepping = Stepping::Into(steps.max(1));
    }

    fn step_over(&self, steps: u32, frame: usize) {
        let mut state = self.state.lock();
        let depth = state.frames.len().saturating_sub(frame);
        state.stepping = Stepping::Over {
            remaining: steps.max(1),
            depth,
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop at the first statement
    pub stop: bool,
    /// Report every statement through `on_trace_step`
    pub tracing: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop: true,
            tracing: false,
        }
    }
}

/// How a script run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    /// Last statement executed, 0 if none
    pub line: u32,
    /// Message of the `raise` that killed the thread
    pub raised: Option<String>,
}

pub struct ScriptTracee {
    script: Script,
    current: Mutex<Option<Arc<ScriptContext>>>,
}

impl ScriptTracee {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            current: Mutex::new(None),
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Context of the current or last run
    pub fn context(&self) -> Option<Arc<ScriptContext>> {
        self.current.lock().clone()
    }

    /// Execute the script on the calling thread, reporting events to
    /// `handler`. Program output goes to `out`.
    pub fn run(
        &self,
        handler: &dyn EventHandler,
        breakpoints: &BreakpointRegistry,
        options: RunOptions,
        out: &mut dyn Write,
    ) -> DebugResult<Finished> {
        let file = self.script.name();
        let context = Arc::new(ScriptContext::new(MAIN_THREAD, file));
        *self.current.lock() = Some(Arc::clone(&context));
        let traced: Arc<dyn Context> = context.clone();

        info!("Running {}", file);

        let mut pc = 0;
        let mut last_line = 0;
        let mut first = true;

        let raised = loop {
            if pc >= self.script.lines.len() {
                // Falling off the end returns from the current frame
                match context.pop_frame() {
                    Some(return_to) => {
                        pc = return_to;
                        continue;
                    }
                    None => break None,
                }
            }

            let Some(statement) = parse_statement(&self.script.lines[pc]) else {
                pc += 1;
                continue;
            };

            let line = pc as u32 + 1;
            last_line = line;
            context.set_line(line);

            if options.tracing {
                handler.on_trace_step(&traced, file, line);
            }

            if let Some(breakpoint) = breakpoints.hit(file, line) {
                context.stop(StopReason::Breakpoint);
                handler.on_breakpoint_hit(&traced, &breakpoint);
                handler.on_location_reached(Some(&traced), file, line)?;
            } else if context.take_step() || (first && options.stop) {
                context.stop(StopReason::Step);
                handler.on_location_reached(Some(&traced), file, line)?;
            }
            first = false;

            match statement {
                Statement::Echo(text) => writeln!(out, "{}", text)?,
                Statement::Set(name, value) => context.set_local(name, value),
                Statement::Call(label) => {
                    let Some(&target) = self.script.labels.get(&label) else {
                        return Err(DebugError::Script(format!(
                            "{}:{}: unknown label '{}'",
                            file, line, label
                        )));
                    };
                    debug!("Calling {} from line {}", label, line);
                    context.push_frame(&label, line, pc + 1);
                    pc = target + 1;
                    continue;
                }
                Statement::Return => {
                    if context.return_watched() {
                        context.stop(StopReason::Return);
                        handler.on_return(&traced, file, line)?;
                    }
                    match context.pop_frame() {
                        Some(return_to) => {
                            pc = return_to;
                            continue;
                        }
                        None => break None,
                    }
                }
                Statement::Raise(message) => {
                    handler.on_catchpoint_hit(&traced, &message);
                    warn!("{}:{}: {}", file, line, message);
                    break Some(message);
                }
                Statement::Exit => break None,
                Statement::Other => {}
            }
            pc += 1;
        };

        context.finish();
        out.flush()?;
        info!("{} finished at line {}", file, last_line);

        Ok(Finished {
            line: last_line,
            raised,
        })
    }
}

impl Tracee for ScriptTracee {
    fn current_context(&self) -> Option<Arc<dyn Context>> {
        self.context().map(|context| context as Arc<dyn Context>)
    }

    fn line_at(&self, file: &str, line: u32) -> Option<String> {
        if !self.script.matches(file) {
            return None;
        }
        self.script.line(line).map(str::to_string)
    }

    fn is_breakable(&self, file: &str, line: u32) -> bool {
        self.script.matches(file) && self.script.is_statement(line)
    }

    fn default_file(&self) -> Option<String> {
        Some(self.script.name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::Breakpoint;
    use std::collections::VecDeque;

    const DEMO: &str = "\
# demo
set x = 1
call greet
echo done
exit

greet:
set name = bob
echo hello
return
";

    type Action = Box<dyn Fn(&dyn Context) + Send>;

    /// Records events and runs one queued action per stop
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        actions: Mutex<VecDeque<Action>>,
    }

    impl Recorder {
        fn with_actions(actions: Vec<Action>) -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                actions: Mutex::new(actions.into()),
            }
        }

        fn record(&self, event: String) {
            self.events.lock().push(event);
        }

        fn act(&self, context: &dyn Context) {
            let action = self.actions.lock().pop_front();
            if let Some(action) = action {
                action(context);
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl EventHandler for Recorder {
        fn on_breakpoint_hit(&self, _context: &Arc<dyn Context>, breakpoint: &Breakpoint) {
            self.record(format!("breakpoint {}", breakpoint.id));
        }

        fn on_catchpoint_hit(&self, _context: &Arc<dyn Context>, exception: &str) {
            self.record(format!("raise {}", exception));
        }

        fn on_trace_step(&self, _context: &Arc<dyn Context>, _file: &str, line: u32) {
            self.record(format!("trace {}", line));
        }

        fn on_location_reached(&self, context: Option<&Arc<dyn Context>>, _file: &str, line: u32) -> DebugResult<()> {
            let context = context.unwrap();
            self.record(format!("{:?} {}", context.stop_reason(), line).to_lowercase());
            self.act(&**context);
            Ok(())
        }

        fn on_return(&self, context: &Arc<dyn Context>, _file: &str, line: u32) -> DebugResult<()> {
            context.set_stop_frame(StopFrame::Outermost);
            self.record(format!("return {}", line));
            self.act(&**context);
            Ok(())
        }
    }

    fn run(tracee: &ScriptTracee, recorder: &Recorder, breakpoints: &BreakpointRegistry, options: RunOptions) -> (Finished, String) {
        let mut out = Vec::new();
        let finished = tracee.run(recorder, breakpoints, options, &mut out).unwrap();
        (finished, String::from_utf8(out).unwrap())
    }

    fn demo() -> ScriptTracee {
        ScriptTracee::new(Script::parse("demo.rds", DEMO))
    }

    #[test]
    fn test_parse_statements() {
        let script = Script::parse("demo.rds", DEMO);

        let statements: Vec<u32> = (1..=11).filter(|n| script.is_statement(*n)).collect();
        assert_eq!(statements, vec![2, 3, 4, 5, 8, 9, 10]);
        assert_eq!(script.labels.get("greet"), Some(&6));

        assert_eq!(parse_statement("set a = b = c"), Some(Statement::Set("a".into(), "b = c".into())));
        assert_eq!(parse_statement("set = 1"), Some(Statement::Other));
        assert_eq!(parse_statement("raise"), Some(Statement::Raise("unhandled exception".into())));
        assert_eq!(parse_statement("sleep 1"), Some(Statement::Other));
        assert_eq!(parse_statement("  # note"), None);
    }

    #[test]
    fn test_run_stops_at_first_statement() {
        let tracee = demo();
        let recorder = Recorder::default();
        let (finished, out) = run(&tracee, &recorder, &BreakpointRegistry::new(), RunOptions::default());

        assert_eq!(recorder.events(), vec!["step 2"]);
        assert_eq!(out, "hello\ndone\n");
        assert_eq!(finished, Finished { line: 5, raised: None });
        assert!(tracee.context().unwrap().is_dead());
    }

    #[test]
    fn test_breakpoint_inside_call() {
        let tracee = demo();
        let breakpoints = BreakpointRegistry::new();
        breakpoints.add("demo.rds", 9);

        let check: Action = Box::new(|context: &dyn Context| {
            assert_eq!(context.stack_size(), 2);
            assert_eq!(context.frame(0).unwrap().name, "greet");
            assert_eq!(context.frame(1).unwrap().line, 3);
            assert_eq!(context.frame_binding(0).unwrap().get("name"), Some("bob"));
            assert_eq!(context.frame_binding(1).unwrap().get("x"), Some("1"));
        });
        let recorder = Recorder::with_actions(vec![check]);

        let options = RunOptions { stop: false, tracing: false };
        run(&tracee, &recorder, &breakpoints, options);

        assert_eq!(recorder.events(), vec!["breakpoint 1", "breakpoint 9"]);
        assert!(recorder.actions.lock().is_empty());
        assert_eq!(breakpoints.get(1).unwrap().hit_count, 1);
    }

    #[test]
    fn test_stepping() {
        let tracee = demo();
        let recorder = Recorder::with_actions(vec![
            Box::new(|c: &dyn Context| c.step_over(1, 0)) as Action,
            Box::new(|c: &dyn Context| c.step_into(1)),
            Box::new(|c: &dyn Context| c.step_out(0)),
            Box::new(|c: &dyn Context| c.step_over(1, 0)),
        ]);

        run(&tracee, &recorder, &BreakpointRegistry::new(), RunOptions::default());

        assert_eq!(
            recorder.events(),
            vec!["step 2", "step 3", "step 8", "return 10", "step 4"]
        );
    }

    #[test]
    fn test_next_skips_calls() {
        let tracee = demo();
        let recorder = Recorder::with_actions(vec![Box::new(|c: &dyn Context| c.step_over(2, 0)) as Action]);

        run(&tracee, &recorder, &BreakpointRegistry::new(), RunOptions::default());
        assert_eq!(recorder.events(), vec!["step 2", "step 4"]);
    }

    #[test]
    fn test_tracing_reports_every_statement() {
        let tracee = ScriptTracee::new(Script::parse("t.rds", "a\n\nb\n"));
        let recorder = Recorder::default();
        let options = RunOptions { stop: false, tracing: true };

        let (finished, _) = run(&tracee, &recorder, &BreakpointRegistry::new(), options);
        assert_eq!(recorder.events(), vec!["trace 1", "trace 3"]);
        assert_eq!(finished.line, 3);
    }

    #[test]
    fn test_raise_kills_the_thread() {
        let tracee = ScriptTracee::new(Script::parse("r.rds", "set a = 1\nraise boom\necho never\n"));
        let recorder = Recorder::default();
        let options = RunOptions { stop: false, tracing: false };

        let (finished, out) = run(&tracee, &recorder, &BreakpointRegistry::new(), options);
        assert_eq!(recorder.events(), vec!["raise boom"]);
        assert_eq!(finished.raised.as_deref(), Some("boom"));
        assert_eq!(out, "");
        assert!(tracee.context().unwrap().is_dead());
    }

    #[test]
    fn test_unknown_label() {
        let tracee = ScriptTracee::new(Script::parse("u.rds", "call nowhere\n"));
        let mut out = Vec::new();
        let err = tracee
            .run(&Recorder::default(), &BreakpointRegistry::new(), RunOptions::default(), &mut out)
            .unwrap_err();
        assert!(matches!(err, DebugError::Script(msg) if msg.contains("nowhere")));
    }

    #[test]
    fn test_tracee_queries() {
        let tracee = ScriptTracee::new(Script::parse("/tmp/scripts/demo.rds", DEMO));

        assert_eq!(tracee.line_at("demo.rds", 9).as_deref(), Some("echo hello"));
        assert_eq!(tracee.line_at("other.rds", 9), None);
        assert_eq!(tracee.line_at("demo.rds", 50), None);
        assert!(tracee.is_breakable("demo.rds", 2));
        assert!(!tracee.is_breakable("demo.rds", 7));
        assert_eq!(tracee.default_file().as_deref(), Some("/tmp/scripts/demo.rds"));
        assert!(tracee.current_context().is_none());
    }
}
