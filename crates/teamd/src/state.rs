//! State registry.
//!
//! Subsystems register named [`StateOps`] contributions. A dump calls
//! every contribution's whole-state function in registration order, then
//! the per-port functions for each live port, and merges the results:
//!
//! ```json
//! {
//!     "team_device": {"ifname": "team0", ...},
//!     "runner": {"active_port": "eth0"},
//!     "ports": {
//!         "eth0": {"team_device": {...}, "link_watches": {...}}
//!     }
//! }
//! ```

use crate::context::TeamdContext;
use crate::error::{TeamdError, TeamdResult};
use crate::ports::TeamdPort;
use serde_json::{Map, Value};
use std::rc::Rc;
use tracing::debug;

/// A state contribution. Both functions are optional; returning `None`
/// leaves the contribution out of that part of the dump.
pub trait StateOps {
    fn dump(&self, _ctx: &TeamdContext) -> TeamdResult<Option<Value>> {
        Ok(None)
    }

    fn per_port_dump(&self, _ctx: &TeamdContext, _port: &TeamdPort) -> TeamdResult<Option<Value>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct StateRegistry {
    entries: Vec<(String, Rc<dyn StateOps>)>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, ops: Rc<dyn StateOps>) -> TeamdResult<()> {
        if self.contains(name) {
            return Err(TeamdError::StateExists(name.to_string()));
        }
        debug!(name, "Registering state contribution");
        self.entries.push((name.to_string(), ops));
        Ok(())
    }

    /// Removes a contribution. Unknown names are ignored.
    pub fn unregister(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Contribution names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    fn snapshot(&self) -> Vec<(String, Rc<dyn StateOps>)> {
        self.entries
            .iter()
            .map(|(n, ops)| (n.clone(), Rc::clone(ops)))
            .collect()
    }
}

impl TeamdContext {
    /// Merged dump of every state contribution.
    pub fn state_dump(&self) -> TeamdResult<Value> {
        let entries = self.state().snapshot();
        let mut root = Map::new();

        for (name, ops) in &entries {
            if let Some(value) = ops.dump(self)? {
                root.insert(name.clone(), value);
            }
        }

        let mut ports = Map::new();
        for port in self.ports().iter() {
            let mut port_state = Map::new();
            for (name, ops) in &entries {
                if let Some(value) = ops.per_port_dump(self, port)? {
                    port_state.insert(name.clone(), value);
                }
            }
            ports.insert(port.ifname.clone(), Value::Object(port_state));
        }
        root.insert("ports".to_string(), Value::Object(ports));

        Ok(Value::Object(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;
    use crate::kernel::mock::MockTeam;
    use serde_json::json;

    struct Fixed(Value);

    impl StateOps for Fixed {
        fn dump(&self, _ctx: &TeamdContext) -> TeamdResult<Option<Value>> {
            Ok(Some(self.0.clone()))
        }
    }

    struct GlobalOnly;

    impl StateOps for GlobalOnly {}

    #[test]
    fn test_register_unique_names() {
        let mut reg = StateRegistry::new();
        reg.register("a", Rc::new(GlobalOnly)).unwrap();
        assert!(matches!(
            reg.register("a", Rc::new(GlobalOnly)),
            Err(TeamdError::StateExists(_))
        ));
        reg.register("b", Rc::new(GlobalOnly)).unwrap();
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["a", "b"]);

        reg.unregister("a");
        reg.unregister("a");
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_dump_merges_by_name() {
        let mut ctx = TeamdContext::new(ContextOptions::default(), Box::new(MockTeam::new()));
        ctx.state_mut()
            .register("custom", Rc::new(Fixed(json!({"answer": 42}))))
            .unwrap();
        ctx.state_mut().register("silent", Rc::new(GlobalOnly)).unwrap();

        let dump = ctx.state_dump().unwrap();
        assert_eq!(dump["custom"], json!({"answer": 42}));
        assert!(dump.get("silent").is_none());
        assert_eq!(dump["ports"], json!({}));
    }
}
