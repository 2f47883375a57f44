// Session configuration
//
// Settings for one debugger run. Defaults match the command line's; a TOML
// file may override them before flags are applied.

use crate::control::DEFAULT_SEPARATOR;
use crate::error::{DebugError, DebugResult};
use crate::remote::{DEFAULT_HOST, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Debugger commands run at startup unless `nx` is set
pub const INIT_FILE: &str = ".rdebugrc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Port for control sessions; `port + 1` when unset
    pub cport: Option<u16>,
    pub server: bool,
    /// Block until a client connects before running the program
    pub wait: bool,
    pub client: bool,
    pub control: bool,
    /// Exit once the program finishes instead of staying post-mortem
    pub quit: bool,
    /// Stop at the first statement
    pub stop: bool,
    pub tracing: bool,
    /// Debugger command file run before operator input
    pub script: Option<PathBuf>,
    pub nx: bool,
    pub separator: String,
    pub connect_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cport: None,
            server: false,
            wait: false,
            client: false,
            control: true,
            quit: true,
            stop: true,
            tracing: false,
            script: None,
            nx: false,
            separator: DEFAULT_SEPARATOR.to_string(),
            connect_retries: 10,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> DebugResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| DebugError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> DebugResult<Self> {
        let config: Config = toml::from_str(text).map_err(|e| DebugError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DebugResult<()> {
        if self.separator.is_empty() {
            return Err(DebugError::Config("separator must not be empty".to_string()));
        }
        if self.server && self.client {
            return Err(DebugError::Config("server and client modes are exclusive".to_string()));
        }
        if self.remote() && self.control_port() == self.port {
            return Err(DebugError::Config(format!(
                "control port {} collides with the command port",
                self.port
            )));
        }
        Ok(())
    }

    /// Server mode, explicitly or because `wait` needs a client
    pub fn remote(&self) -> bool {
        self.server || self.wait
    }

    pub fn control_port(&self) -> u16 {
        self.cport.unwrap_or_else(|| self.port.wrapping_add(1))
    }

    /// Startup commands: init files (unless `nx`) then the command script.
    /// Blank lines and `#` comments are skipped.
    pub fn startup_commands(&self, cwd: &Path, home: Option<&Path>) -> DebugResult<Vec<String>> {
        let mut files = Vec::new();

        if !self.nx {
            let local = cwd.join(INIT_FILE);
            if local.is_file() {
                files.push(local);
            }
            if let Some(home) = home {
                let global = home.join(INIT_FILE);
                if global.is_file() && !files.contains(&global) {
                    files.push(global);
                }
            }
        }

        if let Some(script) = &self.script {
            if !script.is_file() {
                return Err(DebugError::Config(format!(
                    "command script {} not found",
                    script.display()
                )));
            }
            files.push(script.clone());
        }

        let mut commands = Vec::new();
        for file in files {
            info!("Reading debugger commands from {}", file.display());
            let text = fs::read_to_string(&file)?;
            commands.extend(command_lines(&text));
        }

        debug!("{} startup commands", commands.len());
        Ok(commands)
    }
}

fn command_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}
