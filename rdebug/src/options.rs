// Command-line options
//
// Flags override the configuration file, which overrides the defaults.

use anyhow::{Context as _, Result};
use clap::{ArgAction, Parser};
use debug_core::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "rdebug",
    version,
    disable_help_flag = true,
    about = "Interactive debugger for rdebug scripts",
    after_help = "Examples:
    `rdebug app.rds`
          Debug app.rds on this terminal
    `rdebug --server --wait app.rds`
          Wait for a remote client before running app.rds
    `rdebug --client`
          Connect to a debugger started with --server"
)]
pub struct Cli {
    /// Connect to a remote debugger
    #[arg(short, long)]
    pub client: bool,

    /// Port used for control sessions [default: port + 1]
    #[arg(long, value_name = "PORT")]
    pub cport: Option<u16>,

    /// Host name used for remote debugging
    #[arg(short = 'h', long)]
    pub host: Option<String>,

    /// Do not start a control server
    #[arg(long)]
    pub no_control: bool,

    /// Stay in the debugger when the program finishes (post-mortem)
    #[arg(long)]
    pub no_quit: bool,

    /// Do not stop when the program starts
    #[arg(long)]
    pub no_stop: bool,

    /// Do not run debugger initialization files (.rdebugrc)
    #[arg(long = "nx")]
    pub nx: bool,

    /// Port used for remote debugging [default: 8989]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Debugger commands to run before reading input
    #[arg(long, value_name = "FILE")]
    pub script: Option<PathBuf>,

    /// Listen for a remote client
    #[arg(short, long)]
    pub server: bool,

    /// Wait for a remote client before running the program (implies --server)
    #[arg(short, long)]
    pub wait: bool,

    /// Report every executed line
    #[arg(short = 'x', long = "trace")]
    pub tracing: bool,

    /// Sub-command separator on one input line
    #[arg(long, value_name = "SEP")]
    pub separator: Option<String>,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(long)]
    pub verbose: bool,

    /// Print the version number, then turn on verbose logging
    #[arg(short = 'v')]
    pub version_verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,

    /// Script to debug
    pub program: Option<PathBuf>,

    /// Arguments after `--`; accepted for compatibility and ignored
    #[arg(last = true)]
    pub program_args: Vec<String>,
}

impl Cli {
    pub fn logs_verbose(&self) -> bool {
        self.verbose || self.version_verbose
    }

    /// Resolve the configuration: file (if any), then flags
    pub fn config(&self) -> Result<Config> {
        let base = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => Config::default(),
        };

        let config = self.apply(base);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, mut config: Config) -> Config {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.cport.is_some() {
            config.cport = self.cport;
        }
        if let Some(script) = &self.script {
            config.script = Some(script.clone());
        }
        if let Some(separator) = &self.separator {
            config.separator = separator.clone();
        }

        config.client |= self.client;
        config.server |= self.server;
        config.wait |= self.wait;
        config.tracing |= self.tracing;
        config.nx |= self.nx;

        if self.no_control {
            config.control = false;
        }
        if self.no_quit {
            config.quit = false;
        }
        if self.no_stop {
            config.stop = false;
        }
        config
    }
}
