//! Configuration fixtures
//!
//! Builds configuration documents for the common daemon setups and turns
//! them into ready-to-init contexts bound to a [`MockTeam`].

use serde_json::{json, Map, Value};
use std::io::{self, Write};
use tempfile::NamedTempFile;
use teamd::kernel::mock::MockTeam;
use teamd::{ConfigSource, ContextOptions, TeamdContext, TeamdResult};

/// Configuration document builder.
#[derive(Debug, Clone)]
pub struct ConfigFixture {
    doc: Map<String, Value>,
}

impl ConfigFixture {
    /// Team `device` driven by the `dummy` runner, no ports.
    pub fn new(device: &str) -> Self {
        let mut doc = Map::new();
        doc.insert("device".to_string(), json!(device));
        doc.insert("runner".to_string(), json!({"name": "dummy"}));
        Self { doc }
    }

    pub fn runner(mut self, name: &str) -> Self {
        self.doc.insert("runner".to_string(), json!({"name": name}));
        self
    }

    /// Ports as an array of names.
    pub fn ports<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<Value> = names.into_iter().map(|n| Value::String(n.into())).collect();
        self.doc.insert("ports".to_string(), Value::Array(names));
        self
    }

    /// Ports as an object keyed by name.
    pub fn port_object<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ports: Map<String, Value> = names.into_iter().map(|n| (n.into(), json!({}))).collect();
        self.doc.insert("ports".to_string(), Value::Object(ports));
        self
    }

    pub fn hwaddr(mut self, hwaddr: &str) -> Self {
        self.doc.insert("hwaddr".to_string(), json!(hwaddr));
        self
    }

    /// Ethtool link watch with the given delays in milliseconds.
    pub fn link_watch(mut self, delay_up: u64, delay_down: u64) -> Self {
        self.doc.insert(
            "link_watch".to_string(),
            json!({"name": "ethtool", "delay_up": delay_up, "delay_down": delay_down}),
        );
        self
    }

    /// Sets an arbitrary top-level key.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.doc.insert(key.to_string(), value);
        self
    }

    /// Drops a top-level key.
    pub fn without(mut self, key: &str) -> Self {
        self.doc.remove(key);
        self
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.doc.clone()).to_string()
    }

    pub fn source(&self) -> ConfigSource {
        ConfigSource::text(self.to_json())
    }

    /// Writes the document to a temporary file.
    pub fn write_temp(&self) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(self.to_json().as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    /// Uninitialized context reading this document through `team`.
    pub fn context(&self, team: &MockTeam) -> TeamdContext {
        self.context_with(team, false)
    }

    pub fn context_with(&self, team: &MockTeam, force_recreate: bool) -> TeamdContext {
        TeamdContext::new(
            ContextOptions {
                config: self.source(),
                force_recreate,
            },
            Box::new(team.clone()),
        )
    }
}

/// Applies every queued kernel notification without going through the
/// run loop, so tests never block in `poll(2)`. Returns how many were
/// applied.
pub fn pump_kernel_events(ctx: &mut TeamdContext) -> TeamdResult<usize> {
    let changes = ctx.handle_mut()?.process_events()?;
    let count = changes.len();
    for change in changes {
        ctx.apply_team_change(change)?;
    }
    Ok(count)
}
