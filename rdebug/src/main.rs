// rdebug - interactive debugger for rdebug scripts
//
// Runs a script on its own thread under the debugger core and drives it
// from the local console or from a remote client.

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use debug_core::context::{Context, DEBUGGER_THREAD_PREFIX};
use debug_core::control::{ControlLoop, DebugSession, LoopExit};
use debug_core::interface::{output_channel, Interface, Output};
use debug_core::printer::Printer;
use debug_core::remote::{RemoteClient, RemoteServer};
use debug_core::script::{Finished, RunOptions, Script, ScriptTracee};
use debug_core::{BreakpointRegistry, Config, DebugResult, Suspension};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

mod options;

use options::Cli;

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// How long shutdown waits for a pending console read
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version_verbose {
        println!("rdebug {}", env!("CARGO_PKG_VERSION"));
    }

    // Tracing to stderr only - stdout is the operator console
    let level = if cli.logs_verbose() { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("rdebug={}", level).parse()?)
                .add_directive(format!("debug_core={}", level).parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config()?;
    debug!("Configuration: {:?}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name(format!("{}control", DEBUGGER_THREAD_PREFIX))
        .build()
        .context("Failed to start the runtime")?;

    let result = runtime.block_on(async move {
        if config.client {
            run_client(&config).await
        } else {
            let Some(program) = cli.program.clone() else {
                bail!("No script given to debug");
            };
            run_debugger(config, program).await
        }
    });

    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run_client(config: &Config) -> Result<()> {
    let client = RemoteClient::connect(&config.host, config.port, config.connect_retries, RETRY_DELAY)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))?;

    let printer = Printer::default();
    println!("{}", printer.render("client.connected", &json!({}))?);

    client.relay(tokio::io::stdin(), tokio::io::stdout()).await?;
    info!("Remote debugger closed the connection");
    Ok(())
}

async fn run_debugger(config: Config, program: PathBuf) -> Result<()> {
    let script = Script::from_file(&program)?;
    let tracee = Arc::new(ScriptTracee::new(script));
    let printer = Arc::new(Printer::default());
    let (output, queue) = output_channel();

    let session = DebugSession {
        suspension: Arc::new(Suspension::new(output.clone(), printer.clone(), tracee.clone())),
        breakpoints: BreakpointRegistry::new(),
        printer: printer.clone(),
        tracee: tracee.clone(),
    };

    let cwd = std::env::current_dir()?;
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let startup = config.startup_commands(&cwd, home.as_deref())?;

    output.print(printer.render(
        "general.greeting",
        &json!({ "program": "rdebug", "version": env!("CARGO_PKG_VERSION") }),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);
    let launcher = Launcher {
        tracee,
        session: session.clone(),
        output: output.clone(),
        options: RunOptions {
            stop: config.stop,
            tracing: config.tracing,
        },
        post_mortem: !config.quit,
    };

    let mut finished = None;
    let interface = if config.remote() {
        let server = RemoteServer::bind(&config.host, config.port).await?;
        if config.control {
            let control = RemoteServer::bind(&config.host, config.control_port()).await?;
            tokio::spawn(serve_control(control, session.clone(), config.separator.clone(), shutdown.clone()));
        }

        // Without --wait the program starts right away and stops for
        // whoever connects
        if !config.wait {
            finished = Some(launcher.launch()?);
        }
        server.accept((output, queue)).await?
    } else {
        Interface::console((output, queue))
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let control = ControlLoop::new(interface, session)
        .with_separator(config.separator.clone())
        .with_startup_commands(startup)
        .with_ready(ready_tx)
        .with_shutdown(shutdown_rx);
    let control = tokio::spawn(control.run());

    let finished = match finished {
        Some(finished) => finished,
        None => {
            // Startup commands (breakpoints) go in before the first statement
            if ready_rx.await.is_err() {
                return report_exit(control.await?);
            }
            launcher.launch()?
        }
    };

    let quit = config.quit;
    tokio::spawn(async move {
        if let Ok(result) = finished.await {
            match result {
                Ok(finished) => debug!("Program finished at line {}", finished.line),
                Err(e) => error!("Program failed: {}", e),
            }
            if quit {
                shutdown.send(true).ok();
            }
        }
    });

    report_exit(control.await?)
}

fn report_exit(exit: DebugResult<LoopExit>) -> Result<()> {
    match exit {
        Ok(LoopExit::Quit) => info!("Quit requested"),
        Ok(LoopExit::Closed) => info!("Debugger interface closed"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Everything needed to start the program on its own thread
struct Launcher {
    tracee: Arc<ScriptTracee>,
    session: DebugSession,
    output: Output,
    options: RunOptions,
    post_mortem: bool,
}

impl Launcher {
    fn launch(&self) -> Result<oneshot::Receiver<DebugResult<Finished>>> {
        let (done_tx, done_rx) = oneshot::channel();
        let tracee = self.tracee.clone();
        let session = self.session.clone();
        let output = self.output.clone();
        let options = self.options;
        let post_mortem = self.post_mortem;

        thread::Builder::new()
            .name("debuggee".to_string())
            .spawn(move || {
                let result = run_program(&tracee, &session, &output, options, post_mortem);
                done_tx.send(result).ok();
            })
            .context("Failed to start the program thread")?;

        Ok(done_rx)
    }
}

fn run_program(
    tracee: &ScriptTracee,
    session: &DebugSession,
    output: &Output,
    options: RunOptions,
    post_mortem: bool,
) -> DebugResult<Finished> {
    let mut stdout = std::io::stdout();
    let finished = tracee.run(&*session.suspension, &session.breakpoints, options, &mut stdout)?;

    if let Some(message) = &finished.raised {
        warn!("Program raised: {}", message);
    }
    output.print(session.printer.render("general.finished", &json!({}))?);

    if post_mortem {
        if let Some(context) = tracee.context() {
            let context: Arc<dyn Context> = context;
            session
                .suspension
                .post_mortem(&context, tracee.script().name(), finished.line)?;
        }
    }
    Ok(finished)
}

/// Accept control sessions until the listener fails. Each one runs its own
/// control loop against the shared session; `quit` in any of them ends the
/// debugger.
async fn serve_control(
    server: RemoteServer,
    session: DebugSession,
    separator: String,
    shutdown: Arc<watch::Sender<bool>>,
) {
    loop {
        let interface = match server.accept(output_channel()).await {
            Ok(interface) => interface,
            Err(e) => {
                error!("Control server stopped: {}", e);
                return;
            }
        };

        let control = ControlLoop::new(interface, session.clone()).with_separator(separator.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match control.run().await {
                Ok(LoopExit::Quit) => {
                    info!("Quit requested from a control session");
                    shutdown.send(true).ok();
                }
                Ok(LoopExit::Closed) => debug!("Control session closed"),
                Err(e) => error!("Control session failed: {}", e),
            }
        });
    }
}
