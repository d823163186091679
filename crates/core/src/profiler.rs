//! Per-request hierarchical latency profiler.
//!
//! A profiler is a tree of named stages; each stage records the microseconds
//! between `open_stage` and `close_stage`. Stages nest. The serialized form
//! is one JSON document attached to the response when the caller requested
//! debug mode. A disabled profiler turns every operation into a no-op and
//! serializes as `{}`.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{Map, Value as JsonValue};
use tracing::{error, warn};

use crate::error::{Error, Result};

/// Shared profiler handle.
pub type ProfilerRef = Arc<Profiler>;

struct Stage {
    // Path of keys from the root to this stage's node
    path: Vec<String>,
    started: Instant,
}

struct Inner {
    root: Map<String, JsonValue>,
    stack: Vec<Stage>,
}

/// Hierarchical latency tree keyed by stage names.
pub struct Profiler {
    enabled: bool,
    inner: Mutex<Inner>,
}

impl Profiler {
    /// Create a profiler; a disabled one costs nothing.
    pub fn new(enabled: bool) -> Self {
        Profiler {
            enabled,
            inner: Mutex::new(Inner {
                root: Map::new(),
                stack: Vec::new(),
            }),
        }
    }

    /// Whether operations record anything.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Open the root stage. Idempotent: only the first call counts.
    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.stack.is_empty() {
            inner.stack.push(Stage {
                path: Vec::new(),
                started: Instant::now(),
            });
        }
    }

    /// Close the root stage. Unclosed child stages are abandoned with a
    /// warning; the root latency is stamped either way.
    pub fn stop(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.stack.len() == 1 {
            let elapsed = inner.stack.pop().unwrap().started.elapsed().as_micros() as u64;
            inner.root.insert("latency".into(), elapsed.into());
        } else if let Some(root) = inner.stack.first() {
            warn!(
                stages = inner.stack.len(),
                "profiler stopped with unclosed stages"
            );
            let elapsed = root.started.elapsed().as_micros() as u64;
            inner.root.insert("latency".into(), elapsed.into());
            inner.stack.clear();
        }
    }

    /// Open a nested stage and start its timer.
    pub fn open_stage(&self, name: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.stack.is_empty() {
            error!("profiler did not start yet");
            return Err(Error::RuntimeError("profiler did not start yet".into()));
        }
        if name.is_empty() {
            error!("can't open stage with empty name");
            return Err(Error::RuntimeError("empty stage name".into()));
        }
        let mut path = inner.stack.last().unwrap().path.clone();
        path.push(name.to_string());
        // Materialize the node so sibling order matches open order
        Self::node_mut(&mut inner.root, &path);
        inner.stack.push(Stage {
            path,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Close the innermost stage, stamping its latency.
    pub fn close_stage(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.stack.len() <= 1 {
            error!("no available stage can be closed");
            return Err(Error::RuntimeError("no open stage".into()));
        }
        let stage = inner.stack.pop().unwrap();
        let elapsed = stage.started.elapsed().as_micros() as u64;
        Self::node_mut(&mut inner.root, &stage.path).insert("latency".into(), elapsed.into());
        Ok(())
    }

    /// Attach a key/value pair to the current stage.
    pub fn add<V: Into<JsonValue>>(&self, key: &str, value: V) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.stack.is_empty() {
            return Err(Error::RuntimeError("profiler did not start yet".into()));
        }
        let path = inner.stack.last().unwrap().path.clone();
        Self::node_mut(&mut inner.root, &path).insert(key.to_string(), value.into());
        Ok(())
    }

    /// Serialize the tree; `{}` when disabled.
    pub fn as_json_string(&self) -> String {
        if !self.enabled {
            return "{}".to_string();
        }
        let inner = self.inner.lock();
        serde_json::to_string(&JsonValue::Object(inner.root.clone()))
            .unwrap_or_else(|_| "{}".to_string())
    }

    fn node_mut<'a>(
        root: &'a mut Map<String, JsonValue>,
        path: &[String],
    ) -> &'a mut Map<String, JsonValue> {
        let mut node = root;
        for key in path {
            node = node
                .entry(key.clone())
                .or_insert_with(|| JsonValue::Object(Map::new()))
                .as_object_mut()
                .expect("stage nodes are always objects");
        }
        node
    }
}

/// Guard adding a single latency entry to the current stage on drop.
pub struct ScopedLatency {
    name: &'static str,
    profiler: ProfilerRef,
    started: Instant,
}

impl ScopedLatency {
    /// Start timing `name`.
    pub fn new(name: &'static str, profiler: ProfilerRef) -> Self {
        ScopedLatency {
            name,
            profiler,
            started: Instant::now(),
        }
    }
}

impl Drop for ScopedLatency {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_micros() as u64;
        let _ = self.profiler.add(self.name, elapsed);
    }
}
