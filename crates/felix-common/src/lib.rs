//! Common reconciliation abstractions for the Felix dataplane agent.
//!
//! This crate provides the core types shared by the event sequencer and the
//! dataplane reconcilers:
//!
//! - [`ChangeBuffer`]: Per-kind buffer of pending updates/deletes against a
//!   "previously sent" record
//! - [`MultiDict`]: Key to set-of-values map used for IP set member deltas
//! - [`Reconciler`]: Apply-updates / apply-deletions phase contract
//! - [`InvariantViolation`]: Error kind for caller protocol bugs
//!
//! # Architecture
//!
//! Both engines built on these types solve the same problem: converge some
//! downstream state onto a separately tracked desired state.
//!
//! 1. The calculation graph reports facts through `on_*` calls
//! 2. Facts are coalesced per key in a [`ChangeBuffer`]
//! 3. A flush (or apply pass) emits only the final value for each key
//! 4. The buffer records what was emitted so later removals can be matched
//!
//! # Example
//!
//! ```
//! use felix_common::ChangeBuffer;
//!
//! let mut buf: ChangeBuffer<String, u32> = ChangeBuffer::new("example");
//! buf.on_active("a".to_string(), 1);
//! buf.on_active("a".to_string(), 2);
//!
//! let mut sent = Vec::new();
//! buf.flush_updates(|k, v| sent.push((k.clone(), v)));
//! assert_eq!(sent, vec![("a".to_string(), 2)]);
//! ```

mod change_buffer;
mod error;
mod multidict;
pub mod net;
mod reconciler;

pub use change_buffer::{ChangeBuffer, KeyState};
pub use error::{InvariantViolation, Poison};
pub use multidict::MultiDict;
pub use net::{Cidr, IpSetMember, IpSetType, Protocol};
pub use reconciler::{ApplyStats, Reconciler};
