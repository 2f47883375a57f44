// Breakpoint registry
//
// Process-wide, append-only sequence of breakpoints. Ids start at 1 and are
// never reused, even after a breakpoint is deleted. Command handlers mutate
// it from the control thread; the tracee reads it from the debuggee thread.

use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub type BreakpointId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub file: String,
    pub line: u32,
    pub enabled: bool,
    pub hit_count: u32,
}

impl Breakpoint {
    /// Whether this breakpoint refers to `file`. A breakpoint set on a bare
    /// file name matches any path ending in that name.
    pub fn matches_file(&self, file: &str) -> bool {
        self.file == file || Path::new(file).ends_with(&self.file)
    }
}

#[derive(Debug, Default)]
struct Inner {
    breakpoints: Vec<Breakpoint>,
    last_id: BreakpointId,
}

#[derive(Debug, Clone, Default)]
pub struct BreakpointRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an enabled breakpoint and return it
    pub fn add(&self, file: impl Into<String>, line: u32) -> Breakpoint {
        let mut inner = self.inner.write();
        inner.last_id += 1;

        let breakpoint = Breakpoint {
            id: inner.last_id,
            file: file.into(),
            line,
            enabled: true,
            hit_count: 0,
        };
        debug!("Added breakpoint {} at {}:{}", breakpoint.id, breakpoint.file, line);

        inner.breakpoints.push(breakpoint.clone());
        breakpoint
    }

    pub fn remove(&self, id: BreakpointId) -> Option<Breakpoint> {
        let mut inner = self.inner.write();
        let index = inner.breakpoints.iter().position(|b| b.id == id)?;
        Some(inner.breakpoints.remove(index))
    }

    /// Remove every breakpoint; ids keep counting from where they were.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let count = inner.breakpoints.len();
        inner.breakpoints.clear();
        count
    }

    pub fn set_enabled(&self, id: BreakpointId, enabled: bool) -> Option<Breakpoint> {
        let mut inner = self.inner.write();
        let breakpoint = inner.breakpoints.iter_mut().find(|b| b.id == id)?;
        breakpoint.enabled = enabled;
        Some(breakpoint.clone())
    }

    pub fn get(&self, id: BreakpointId) -> Option<Breakpoint> {
        self.inner.read().breakpoints.iter().find(|b| b.id == id).cloned()
    }

    /// Snapshot in creation order
    pub fn list(&self) -> Vec<Breakpoint> {
        self.inner.read().breakpoints.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the enabled breakpoint at `file:line` and count the hit.
    /// Called by the tracee before executing a statement.
    pub fn hit(&self, file: &str, line: u32) -> Option<Breakpoint> {
        let mut inner = self.inner.write();
        let breakpoint = inner
            .breakpoints
            .iter_mut()
            .find(|b| b.enabled && b.line == line && b.matches_file(file))?;
        breakpoint.hit_count += 1;
        Some(breakpoint.clone())
    }
}
