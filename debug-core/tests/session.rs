// End-to-end debugging sessions: a script running on its own thread, a
// control loop on the runtime and an operator talking over a stream.

use debug_core::control::{ControlLoop, DebugSession, LoopExit};
use debug_core::interface::{output_channel, Interface, InterfaceKind};
use debug_core::remote::{RemoteClient, RemoteServer, DEFAULT_HOST};
use debug_core::script::{Finished, RunOptions, Script, ScriptTracee};
use debug_core::{BreakpointRegistry, Context, DebugResult, Printer, Suspension};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::io::{
    duplex, split, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
    WriteHalf,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const APP: &str = "\
# app
set greeting = hello
call work
echo finished
exit

work:
set count = 1
echo working
set count = 2
# almost
echo done working
return
";

const WAIT: Duration = Duration::from_secs(5);

struct Operator {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Operator {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }

    async fn expect(&mut self, expected: &str) {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected))
            .unwrap();
        assert_eq!(line.as_deref(), Some(expected));
    }

    /// End input and return whatever is still written back
    async fn hang_up(mut self) -> Vec<String> {
        self.writer.shutdown().await.unwrap();

        let mut rest = Vec::new();
        while let Some(line) = timeout(WAIT, self.lines.next_line()).await.unwrap().unwrap() {
            rest.push(line);
        }
        rest
    }
}

struct Harness {
    session: DebugSession,
    tracee: Arc<ScriptTracee>,
    control: JoinHandle<DebugResult<LoopExit>>,
    operator: Operator,
}

fn start() -> Harness {
    let (output, queue) = output_channel();
    let tracee = Arc::new(ScriptTracee::new(Script::parse("app.rds", APP)));
    let printer = Arc::new(Printer::default());
    let suspension = Arc::new(Suspension::new(output.clone(), printer.clone(), tracee.clone()));

    let session = DebugSession {
        suspension,
        breakpoints: BreakpointRegistry::new(),
        printer,
        tracee: tracee.clone(),
    };

    let (client, server) = duplex(8192);
    let (reader, writer) = split(server);
    let interface = Interface::new(InterfaceKind::Local, reader, writer, (output, queue));
    let control = tokio::spawn(ControlLoop::new(interface, session.clone()).run());

    let (client_reader, client_writer) = split(client);
    Harness {
        session,
        tracee,
        control,
        operator: Operator {
            lines: BufReader::new(client_reader).lines(),
            writer: client_writer,
        },
    }
}

impl Harness {
    /// Run the script on a plain thread with the suspension core as handler
    fn launch(&self, options: RunOptions) -> thread::JoinHandle<DebugResult<Finished>> {
        let tracee = self.tracee.clone();
        let session = self.session.clone();

        thread::Builder::new()
            .name("debuggee".to_string())
            .spawn(move || {
                let mut out = Vec::new();
                tracee.run(&*session.suspension, &session.breakpoints, options, &mut out)
            })
            .unwrap()
    }

    async fn wait_for_suspension(&self) {
        let suspension = self.session.suspension.clone();
        timeout(WAIT, async move {
            while !suspension.has_suspended_context() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("debuggee never suspended");
    }
}

async fn join(handle: thread::JoinHandle<DebugResult<Finished>>) -> Finished {
    tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_break_and_continue() {
    let mut harness = start();

    harness.operator.send("b 12").await;
    harness.operator.expect("Breakpoint 1 at app.rds:12").await;

    let debuggee = harness.launch(RunOptions { stop: false, tracing: false });
    harness.operator.expect("Stopped at breakpoint 1 in thread 1 (app.rds:12)").await;

    harness.operator.send("where; var local").await;
    harness.operator.expect("--> #0 work at app.rds:12").await;
    harness.operator.expect("    #1 main at app.rds:3").await;
    harness.operator.expect("count = 2").await;

    harness.operator.send("cont").await;
    let finished = join(debuggee).await;
    assert_eq!(finished, Finished { line: 5, raised: None });
    assert_eq!(harness.session.breakpoints.get(1).unwrap().hit_count, 1);

    harness.operator.send("cont").await;
    harness
        .operator
        .expect("There is no thread suspended at the time and therefore no context to execute 'cont'")
        .await;

    assert!(harness.operator.hang_up().await.is_empty());
    assert_eq!(harness.control.await.unwrap().unwrap(), LoopExit::Closed);
}

#[tokio::test]
async fn test_unknown_command_without_context() {
    let mut harness = start();

    harness.operator.send("bogus").await;
    harness
        .operator
        .expect("There is no thread suspended at the time and therefore no context to execute 'bogus'")
        .await;

    assert!(harness.operator.hang_up().await.is_empty());
    assert_eq!(harness.control.await.unwrap().unwrap(), LoopExit::Closed);
}

#[tokio::test]
async fn test_end_of_input_closes_interface() {
    let harness = start();

    // Closing the interface ends the stream the operator reads from
    assert!(harness.operator.hang_up().await.is_empty());
    assert_eq!(harness.control.await.unwrap().unwrap(), LoopExit::Closed);
}

#[tokio::test]
async fn test_stepping_session() {
    let mut harness = start();
    let debuggee = harness.launch(RunOptions::default());
    harness.operator.expect("app.rds:2: set greeting = hello").await;

    harness.operator.send("next").await;
    harness.operator.expect("app.rds:3: call work").await;

    harness.operator.send("step").await;
    harness.operator.expect("app.rds:8: set count = 1").await;

    harness.operator.send("list").await;
    for expected in [
        "   3: call work",
        "   4: echo finished",
        "   5: exit",
        "   6: ",
        "   7: work:",
        "=> 8: set count = 1",
        "   9: echo working",
        "   10: set count = 2",
        "   11: # almost",
        "   12: echo done working",
        "   13: return",
    ] {
        harness.operator.expect(expected).await;
    }

    harness.operator.send("finish").await;
    harness.operator.expect("app.rds:13: return").await;

    harness.operator.send("cont").await;
    join(debuggee).await;

    harness.operator.hang_up().await;
    harness.control.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_post_mortem_context_is_unavailable() {
    let mut harness = start();

    let tracee = harness.tracee.clone();
    let session = harness.session.clone();
    // Parks for good once the script is done; never joined
    thread::spawn(move || -> DebugResult<()> {
        let mut out = Vec::new();
        let options = RunOptions { stop: false, tracing: false };
        let finished = tracee.run(&*session.suspension, &session.breakpoints, options, &mut out)?;

        let context: Arc<dyn Context> = tracee.context().unwrap();
        session.suspension.post_mortem(&context, tracee.script().name(), finished.line)
    });

    harness.operator.expect("Thread 1 has finished, context is dead (post-mortem)").await;
    harness.wait_for_suspension().await;

    harness.operator.send("cont").await;
    harness.operator.expect("Command is unavailable").await;

    harness.operator.send("where").await;
    harness.operator.expect("--> #0 main at app.rds:5").await;

    assert!(harness.session.suspension.has_suspended_context());
    harness.operator.send("quit").await;
    assert_eq!(harness.control.await.unwrap().unwrap(), LoopExit::Quit);
}

#[tokio::test]
async fn test_remote_session() {
    let tracee = Arc::new(ScriptTracee::new(Script::parse("app.rds", APP)));
    let printer = Arc::new(Printer::default());
    let (output, queue) = output_channel();
    let session = DebugSession {
        suspension: Arc::new(Suspension::new(output.clone(), printer.clone(), tracee.clone())),
        breakpoints: BreakpointRegistry::new(),
        printer,
        tracee,
    };

    let server = RemoteServer::bind(DEFAULT_HOST, 0).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let breakpoints = session.breakpoints.clone();
    let control = tokio::spawn(async move {
        let interface = server.accept((output, queue)).await.unwrap();
        ControlLoop::new(interface, session).with_separator("&&").run().await
    });

    let client = RemoteClient::connect(DEFAULT_HOST, port, 3, Duration::from_millis(20))
        .await
        .unwrap();

    let (mut operator_in, input) = duplex(1024);
    let (output, mut operator_out) = duplex(1024);
    operator_in.write_all(b"b 3 && b app.rds:9\ninfo break\n").await.unwrap();
    drop(operator_in);

    client.relay(input, output).await.unwrap();
    assert_eq!(control.await.unwrap().unwrap(), LoopExit::Closed);

    let mut received = String::new();
    operator_out.read_to_string(&mut received).await.unwrap();
    assert_eq!(
        received,
        "Breakpoint 1 at app.rds:3\n\
         Breakpoint 2 at app.rds:9\n\
         Num Enb What\n\
         1   y   at app.rds:3 (hit 0 times)\n\
         2   y   at app.rds:9 (hit 0 times)\n"
    );
    assert_eq!(breakpoints.len(), 2);
}
