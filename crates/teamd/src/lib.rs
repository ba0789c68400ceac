//! Team network device control daemon.
//!
//! Drives one kernel team device from a JSON configuration: creates the
//! device, attaches ports, runs the configured runner and reports state.
//! Everything runs on a single thread around [`run_loop::run`].
//!
//! Startup goes through [`TeamdContext::init`], which acquires resources
//! stage by stage and unwinds the completed stages on failure.

pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod events;
pub mod kernel;
pub mod lifecycle;
pub mod link_watch;
pub mod ports;
pub mod run_loop;
pub mod runner;
pub mod state;
pub mod state_basics;

pub use config::{Config, ConfigSource, LinkWatchConfig};
pub use context::{ContextOptions, OwnerId, TeamdContext};
pub use daemon::{PidFile, StatusPipe};
pub use error::{TeamdError, TeamdResult};
pub use events::{EventBus, EventKind, EventKinds, EventWatch, WatchId};
pub use kernel::{OptionValue, TeamChange, TeamHandle, TeamHandleFactory, TeamOption, TeamPortInfo};
pub use lifecycle::Stage;
pub use link_watch::link_watch_port_up;
pub use ports::{PortRegistry, TeamdPort};
pub use run_loop::{LoopHandler, LoopSource, RunLoop};
pub use runner::{find_runner, runner_names, Runner, RunnerDescriptor, RUNNERS};
pub use state::{StateOps, StateRegistry};
pub use teamd_types::{Duplex, HwAddr};
