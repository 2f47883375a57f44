// Template renderer
//
// Maps a dotted message key plus named arguments to display text. Content
// lives in layered TOML tables; the first layer that resolves the full key
// wins. Layers are parsed on first use and cached.

use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::{LazyLock, OnceLock};
use thiserror::Error;
use tracing::debug;

pub const SEPARATOR: char = '.';

const BASE_LAYER: &str = include_str!("../texts/base.toml");

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([^}]*)\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("Can't find part path '{0}'")]
    MissedPath(String),

    #[error("Missed argument {name} for '{template}'")]
    MissedArgument { name: String, template: String },

    #[error("Invalid layer '{name}': {reason}")]
    InvalidLayer { name: String, reason: String },
}

#[derive(Debug, Clone)]
enum LayerSource {
    Embedded(&'static str),
    Text(String),
    File(PathBuf),
}

/// A named table of message templates
#[derive(Debug, Clone)]
pub struct Layer {
    name: String,
    source: LayerSource,
}

impl Layer {
    /// The built-in message table
    pub fn base() -> Self {
        Self {
            name: "base".to_string(),
            source: LayerSource::Embedded(BASE_LAYER),
        }
    }

    pub fn inline(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: LayerSource::Text(text.into()),
        }
    }

    pub fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: LayerSource::File(path.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<toml::Table, PrinterError> {
        let invalid = |reason: String| PrinterError::InvalidLayer {
            name: self.name.clone(),
            reason,
        };

        let text = match &self.source {
            LayerSource::Embedded(text) => (*text).to_string(),
            LayerSource::Text(text) => text.clone(),
            LayerSource::File(path) => {
                fs::read_to_string(path).map_err(|e| invalid(format!("{}: {}", path.display(), e)))?
            }
        };

        debug!("Loading message layer '{}'", self.name);
        text.parse::<toml::Table>().map_err(|e| invalid(e.to_string()))
    }
}

#[derive(Debug)]
pub struct Printer {
    layers: Vec<Layer>,
    contents: OnceLock<Vec<toml::Table>>,
}

impl Default for Printer {
    fn default() -> Self {
        Self::new(vec![Layer::base()])
    }
}

impl Printer {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            layers,
            contents: OnceLock::new(),
        }
    }

    /// Append a layer; it is consulted after the ones already registered.
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self.contents = OnceLock::new();
        self
    }

    /// Render the template at `path`, substituting `{name}` from `args`.
    pub fn render(&self, path: &str, args: &Value) -> Result<String, PrinterError> {
        let template = self.locate(path)?;
        translate(template, args)
    }

    fn locate(&self, path: &str) -> Result<&str, PrinterError> {
        for table in self.contents()? {
            let mut parts = path.split(SEPARATOR);
            let Some(first) = parts.next() else {
                continue;
            };

            let mut current = table.get(first);
            for part in parts {
                current = current.and_then(|v| v.as_table()).and_then(|t| t.get(part));
            }

            if let Some(template) = current.and_then(|v| v.as_str()) {
                return Ok(template);
            }
        }

        Err(PrinterError::MissedPath(path.to_string()))
    }

    fn contents(&self) -> Result<&[toml::Table], PrinterError> {
        if let Some(contents) = self.contents.get() {
            return Ok(contents);
        }

        let loaded = self
            .layers
            .iter()
            .map(Layer::load)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self.contents.get_or_init(|| loaded))
    }
}

fn translate(template: &str, args: &Value) -> Result<String, PrinterError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for m in PLACEHOLDER.find_iter(template) {
        let name = &template[m.start() + 1..m.end() - 1];
        let substitution = args.get(name).and_then(substitution).ok_or_else(|| {
            PrinterError::MissedArgument {
                name: name.to_string(),
                template: template.to_string(),
            }
        })?;

        out.push_str(&template[last..m.start()]);
        out.push_str(&substitution);
        last = m.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

// Unset arguments (null or false) count as missing
fn substitution(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
