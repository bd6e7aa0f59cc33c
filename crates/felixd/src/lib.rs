//! Felix dataplane agent.
//!
//! Replays a JSON-lines stream of calculation-graph facts into the
//! [`EventSequencer`](felix_calc::EventSequencer), hands the sequenced messages
//! to a dataplane task through the decoupler, and keeps a BPF IP set map
//! converged on the IP set messages.
//!
//! - [`config`]: TOML agent configuration
//! - [`feed`]: Fact stream parsing and replay
//! - [`dataplane`]: Message routing and reconciler passes
//! - [`metrics_server`]: Prometheus `/metrics` endpoint

pub mod agent;
pub mod config;
pub mod dataplane;
mod error;
pub mod feed;
pub mod metrics_server;

pub use agent::{Agent, AgentReport};
pub use config::AgentConfig;
pub use dataplane::{Dataplane, DataplaneStats};
pub use error::{AgentError, Result};
pub use feed::{CalcEvent, FeedStats};
