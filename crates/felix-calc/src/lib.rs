//! Felix calculation graph output stage.
//!
//! The calculation graph turns datastore resources into facts about what the
//! local dataplane needs: active policies, IP sets and their members,
//! endpoints, routes, tunnels and so on. This crate sequences those facts
//! into the message stream the dataplane consumes.
//!
//! - [`EventSequencer`]: Per-kind buffering, coalescing and ordered flush
//! - [`Message`]: The dataplane message vocabulary
//! - [`Sink`]: Where flushed messages go
//! - [`Config`]: Two-layer merge of raw Felix configuration
//! - [`decoupler::channel`]: Hand-off from the sequencer to an async task
//!
//! # Example
//!
//! ```
//! use felix_calc::{EventSequencer, Message};
//! use felix_common::IpSetType;
//!
//! let mut seq = EventSequencer::new(Vec::<Message>::new());
//! seq.on_ip_set_added("s:web", IpSetType::Net).unwrap();
//! seq.on_ip_set_member_added("s:web", "10.0.0.1/32".parse().unwrap()).unwrap();
//! seq.flush().unwrap();
//!
//! assert_eq!(seq.sink().len(), 1);
//! assert_eq!(seq.sink()[0].kind(), "IpSetUpdate");
//! ```

pub mod config;
pub mod convert;
pub mod decoupler;
mod error;
pub mod messages;
pub mod model;
mod sequencer;
mod sink;

pub use config::{Config, ConfigError, ConfigInterface, RawConfig, Source};
pub use decoupler::{ChannelSink, Decoupler};
pub use error::{Result, SequencerError};
pub use messages::Message;
pub use sequencer::EventSequencer;
pub use sink::{FnSink, Sink};
