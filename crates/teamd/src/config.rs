//! JSON configuration document.
//!
//! The document is held as a [`serde_json::Value`] and queried by JSON
//! pointer (`/device`, `/runner/name`). A missing optional key yields
//! `Ok(None)`; a present key of the wrong type is a configuration error.
//!
//! ```json
//! {
//!     "device": "team0",
//!     "runner": {"name": "activebackup"},
//!     "hwaddr": "02:00:00:00:00:01",
//!     "link_watch": {"name": "ethtool", "delay_up": 100},
//!     "ports": {"eth0": {}, "eth1": {}}
//! }
//! ```

use crate::error::{TeamdError, TeamdResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use teamd_types::HwAddr;
use tracing::{debug, warn};

/// Where the configuration document comes from.
///
/// Inline text takes precedence over a file when both are set.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    /// Path to a configuration file.
    pub file: Option<PathBuf>,
    /// Inline configuration text.
    pub text: Option<String>,
}

impl ConfigSource {
    /// Source backed by a file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
            text: None,
        }
    }

    /// Source backed by inline text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            file: None,
            text: Some(text.into()),
        }
    }
}

/// Link watch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkWatchConfig {
    /// Watcher kind. Only `ethtool` is supported.
    #[serde(default = "default_link_watch_name")]
    pub name: String,

    /// Milliseconds a link must stay up before it is reported up.
    #[serde(default)]
    pub delay_up: u64,

    /// Milliseconds a link must stay down before it is reported down.
    #[serde(default)]
    pub delay_down: u64,
}

fn default_link_watch_name() -> String {
    "ethtool".to_string()
}

impl Default for LinkWatchConfig {
    fn default() -> Self {
        Self {
            name: default_link_watch_name(),
            delay_up: 0,
            delay_down: 0,
        }
    }
}

impl LinkWatchConfig {
    pub fn delay_up(&self) -> Duration {
        Duration::from_millis(self.delay_up)
    }

    pub fn delay_down(&self) -> Duration {
        Duration::from_millis(self.delay_down)
    }
}

/// Parsed configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    doc: Value,
}

impl Config {
    /// Loads the document from the given source.
    pub fn load(source: &ConfigSource) -> TeamdResult<Self> {
        let text = match (&source.text, &source.file) {
            (Some(text), Some(file)) => {
                warn!(
                    file = %file.display(),
                    "Command line configuration is present, ignoring given config file"
                );
                text.clone()
            }
            (Some(text), None) => text.clone(),
            (None, Some(file)) => {
                debug!(file = %file.display(), "Reading config file");
                fs::read_to_string(file).map_err(|e| {
                    TeamdError::config(
                        file.display().to_string(),
                        format!("failed to read file: {}", e),
                    )
                })?
            }
            (None, None) => {
                return Err(TeamdError::config(
                    "",
                    "either configuration file or command line configuration string must be present",
                ))
            }
        };
        text.parse()
    }

    /// Wraps an already parsed document.
    pub fn from_value(doc: Value) -> TeamdResult<Self> {
        if !doc.is_object() {
            return Err(TeamdError::config("", "document root must be an object"));
        }
        Ok(Self { doc })
    }

    /// Looks up a value by JSON pointer.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.doc.pointer(path)
    }

    pub fn string_get(&self, path: &str) -> TeamdResult<Option<&str>> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(TeamdError::config(path, "expected a string")),
        }
    }

    pub fn int_get(&self, path: &str) -> TeamdResult<Option<i64>> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| TeamdError::config(path, "expected an integer")),
        }
    }

    pub fn bool_get(&self, path: &str) -> TeamdResult<Option<bool>> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(TeamdError::config(path, "expected a boolean")),
        }
    }

    /// Team device name (`/device`), required.
    pub fn device_name(&self) -> TeamdResult<&str> {
        match self.string_get("/device")? {
            Some(name) if !name.is_empty() => Ok(name),
            Some(_) => Err(TeamdError::config("/device", "device name is empty")),
            None => Err(TeamdError::MissingConfig("/device".to_string())),
        }
    }

    /// Runner name, required. Accepts `"runner": "name"` and
    /// `"runner": {"name": "name"}`.
    pub fn runner_name(&self) -> TeamdResult<&str> {
        match self.get("/runner") {
            Some(Value::String(name)) => Ok(name.as_str()),
            Some(Value::Object(_)) => self
                .string_get("/runner/name")?
                .ok_or_else(|| TeamdError::MissingConfig("/runner/name".to_string())),
            Some(Value::Null) | None => Err(TeamdError::MissingConfig("/runner".to_string())),
            Some(_) => Err(TeamdError::config("/runner", "expected a string or an object")),
        }
    }

    /// Hardware address override (`/hwaddr`), optional.
    pub fn hwaddr(&self) -> TeamdResult<Option<HwAddr>> {
        match self.string_get("/hwaddr")? {
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|e| TeamdError::config("/hwaddr", format!("{}", e))),
            None => Ok(None),
        }
    }

    /// Member port names in document order. `/ports` may be an array of
    /// names or an object keyed by name; a missing key means no ports.
    pub fn port_names(&self) -> TeamdResult<Vec<String>> {
        match self.get("/ports") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Object(map)) => Ok(map.keys().cloned().collect()),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        TeamdError::config(format!("/ports/{}", i), "expected a port name")
                    })
                })
                .collect(),
            Some(_) => Err(TeamdError::config("/ports", "expected an array or an object")),
        }
    }

    /// Link watch settings (`/link_watch`), defaults when absent.
    pub fn link_watch(&self) -> TeamdResult<LinkWatchConfig> {
        let cfg: LinkWatchConfig = match self.get("/link_watch") {
            None | Some(Value::Null) => return Ok(LinkWatchConfig::default()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| TeamdError::config("/link_watch", e.to_string()))?,
        };
        if cfg.name != "ethtool" {
            return Err(TeamdError::config(
                "/link_watch/name",
                format!("unsupported link watch \"{}\"", cfg.name),
            ));
        }
        Ok(cfg)
    }

    /// Pretty-printed document.
    pub fn dump(&self) -> TeamdResult<String> {
        Ok(serde_json::to_string_pretty(&self.doc)?)
    }
}

impl FromStr for Config {
    type Err = TeamdError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let doc: Value = serde_json::from_str(text)
            .map_err(|e| TeamdError::config("", format!("failed to parse configuration: {}", e)))?;
        Self::from_value(doc)
    }
}
