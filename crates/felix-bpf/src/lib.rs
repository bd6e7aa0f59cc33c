//! BPF IP set dataplane for the Felix agent.
//!
//! [`BpfIpSets`] keeps the desired membership of every IP set and converges an
//! LPM map of encoded entries onto it, tolerating partial failure:
//!
//! - [`BackingMap`]: Byte-level iterate/update/delete over the map
//! - [`IpSetEntry`]: Fixed-width v4/v6 entry encoding
//! - [`IdAllocator`]: Numeric IDs for string set IDs
//! - [`IpSetsMetrics`]: Injected gauge and operation counter
//!
//! # Example
//!
//! ```
//! use felix_bpf::{BpfIpSets, DefaultIdAllocator, InMemoryMap, IpFamily};
//! use felix_common::{IpSetType, Reconciler};
//!
//! let mut sets = BpfIpSets::new(IpFamily::V4, DefaultIdAllocator::new(), InMemoryMap::new());
//! sets.add_or_replace_ip_set("sel-1", IpSetType::Net, ["10.0.0.1/32"]).unwrap();
//! sets.apply_updates();
//!
//! assert_eq!(sets.map().len(), 1);
//! ```

#[cfg(feature = "aya")]
pub mod aya_map;
pub mod entry;
mod error;
pub mod idalloc;
mod ipsets;
pub mod map;
pub mod metrics;

pub use entry::{IpFamily, IpSetEntry};
pub use error::{IpSetsError, MapError, Result};
pub use idalloc::{DefaultIdAllocator, IdAllocator};
pub use ipsets::{BpfIpSets, EntryFromBytes, IpSetNameFilter, MemberToEntry};
pub use map::{BackingMap, InMemoryMap, IterAction};
pub use metrics::{IpSetsMetrics, NoopMetrics, PrometheusIpSetsMetrics};
