//! BPF IP set reconciler.
//!
//! Tracks the desired membership of every IP set and converges a
//! [`BackingMap`] of encoded entries onto it. Each set carries three entry
//! sets:
//!
//! - `desired`: what the set should contain
//! - `pending_adds`: desired entries not yet written
//! - `pending_removes`: written entries no longer desired
//!
//! # Resync
//!
//! A resync assumes the map holds nothing of ours (`pending_adds = desired`),
//! then scans the map: entries already present are dropped from
//! `pending_adds`, unwanted ones go to `pending_removes` and entries of
//! unknown sets are deleted outright. The ordinary apply pass then does the
//! rest, so steady-state deltas and recovery share one code path.
//!
//! # ID Lifecycle
//!
//! A removed set keeps its numeric ID until every entry carrying that ID is
//! gone from the map. Only a clean, deleted set has its ID released.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use felix_common::{ApplyStats, InvariantViolation, IpSetType, Poison, Reconciler};
use tracing::{debug, error, info, warn};

use crate::entry::{self, IpFamily, IpSetEntry, DUMMY_VALUE};
use crate::error::{IpSetsError, Result};
use crate::idalloc::{DefaultIdAllocator, IdAllocator, NO_ID};
use crate::map::{BackingMap, IterAction};
use crate::metrics::{IpSetsMetrics, NoopMetrics};

const KIND: &str = "bpf-ip-set";

/// Decodes a raw map key.
pub type EntryFromBytes = fn(&[u8]) -> Option<IpSetEntry>;

/// Encodes a member string for a set; `None` skips the member.
pub type MemberToEntry = fn(IpFamily, u64, &str) -> Option<IpSetEntry>;

/// Decides whether a set is needed on this host.
pub type IpSetNameFilter = Box<dyn Fn(&str) -> bool + Send>;

#[derive(Debug)]
struct BpfIpSet {
    original_id: String,
    id: u64,
    set_type: IpSetType,
    desired: BTreeSet<IpSetEntry>,
    pending_adds: BTreeSet<IpSetEntry>,
    pending_removes: BTreeSet<IpSetEntry>,
    deleted: bool,
}

impl BpfIpSet {
    fn new(original_id: &str, id: u64) -> Self {
        Self {
            original_id: original_id.to_string(),
            id,
            set_type: IpSetType::Net,
            desired: BTreeSet::new(),
            pending_adds: BTreeSet::new(),
            pending_removes: BTreeSet::new(),
            deleted: false,
        }
    }

    fn replace_members(&mut self, entries: impl IntoIterator<Item = IpSetEntry>) {
        self.remove_all();
        for entry in entries {
            self.add_member(entry);
        }
    }

    fn remove_all(&mut self) {
        for entry in std::mem::take(&mut self.desired) {
            if !self.pending_adds.remove(&entry) {
                self.pending_removes.insert(entry);
            }
        }
    }

    fn add_member(&mut self, entry: IpSetEntry) {
        if !self.desired.insert(entry) {
            return;
        }
        if !self.pending_removes.remove(&entry) {
            self.pending_adds.insert(entry);
        }
    }

    fn remove_member(&mut self, entry: &IpSetEntry) {
        if !self.desired.remove(entry) {
            return;
        }
        if !self.pending_adds.remove(entry) {
            self.pending_removes.insert(*entry);
        }
    }

    fn is_dirty(&self) -> bool {
        !self.pending_adds.is_empty() || !self.pending_removes.is_empty() || self.deleted
    }
}

/// IP set reconciler for one address family.
pub struct BpfIpSets<M, A = DefaultIdAllocator> {
    family: IpFamily,
    ip_sets: BTreeMap<u64, BpfIpSet>,
    allocator: A,
    map: M,
    entry_from_bytes: EntryFromBytes,
    member_to_entry: MemberToEntry,
    dirty: BTreeSet<u64>,
    resync_scheduled: bool,
    metrics: Box<dyn IpSetsMetrics + Send>,
    filter: Option<IpSetNameFilter>,
    poison: Poison,
}

impl<M, A> fmt::Debug for BpfIpSets<M, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpfIpSets")
            .field("family", &self.family)
            .field("ip_sets", &self.ip_sets.len())
            .field("dirty", &self.dirty)
            .field("resync_scheduled", &self.resync_scheduled)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl<M: BackingMap, A: IdAllocator> BpfIpSets<M, A> {
    /// Creates a reconciler with a resync scheduled.
    pub fn new(family: IpFamily, allocator: A, map: M) -> Self {
        Self {
            family,
            ip_sets: BTreeMap::new(),
            allocator,
            map,
            entry_from_bytes: IpSetEntry::from_bytes,
            member_to_entry: entry::proto_member_to_entry,
            dirty: BTreeSet::new(),
            resync_scheduled: true,
            metrics: Box::new(NoopMetrics),
            filter: None,
            poison: Poison::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: impl IpSetsMetrics + Send + 'static) -> Self {
        self.metrics = Box::new(metrics);
        self
    }

    /// Replaces the entry codec used on every path.
    pub fn with_codec(mut self, entry_from_bytes: EntryFromBytes, member_to_entry: MemberToEntry) -> Self {
        self.entry_from_bytes = entry_from_bytes;
        self.member_to_entry = member_to_entry;
        self
    }

    pub fn ip_family(&self) -> IpFamily {
        self.family
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut M {
        &mut self.map
    }

    /// Number of tracked sets, including deleted ones still draining.
    pub fn num_ip_sets(&self) -> usize {
        self.ip_sets.len()
    }

    pub fn is_resync_scheduled(&self) -> bool {
        self.resync_scheduled
    }

    /// Returns true once a failure has poisoned the reconciler.
    pub fn is_poisoned(&self) -> bool {
        self.poison.is_poisoned()
    }

    /// Numeric ID of a set, or 0 if it has none.
    pub fn id_string_to_u64(&self, set_id: &str) -> u64 {
        self.allocator.get_no_alloc(set_id)
    }

    pub fn get_type_of(&self, set_id: &str) -> Option<IpSetType> {
        self.existing_id(set_id)
            .and_then(|id| self.ip_sets.get(&id))
            .map(|s| s.set_type)
    }

    /// Installs a filter without touching existing sets. Call
    /// [`apply_ip_set_name_filter`](Self::apply_ip_set_name_filter) afterwards.
    pub fn set_ip_set_name_filter(&mut self, filter: impl Fn(&str) -> bool + Send + 'static) {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_ip_set_name_filter(&mut self) {
        self.filter = None;
    }

    /// Queues removal of every tracked set the filter no longer needs.
    pub fn apply_ip_set_name_filter(&mut self) {
        let Some(filter) = &self.filter else {
            return;
        };
        for ip_set in self.ip_sets.values_mut() {
            if filter(&ip_set.original_id) {
                continue;
            }
            debug!(set_id = %ip_set.original_id, "IP set no longer needed");
            ip_set.remove_all();
            ip_set.deleted = true;
            self.dirty.insert(ip_set.id);
        }
    }

    fn is_ip_set_needed(&self, set_id: &str) -> bool {
        self.filter.as_ref().map_or(true, |f| f(set_id))
    }

    fn existing_id(&self, set_id: &str) -> Option<u64> {
        let id = self.allocator.get_no_alloc(set_id);
        if id == NO_ID || !self.ip_sets.contains_key(&id) {
            return None;
        }
        Some(id)
    }

    fn get_or_create(&mut self, set_id: &str) -> &mut BpfIpSet {
        let id = self.allocator.get_or_alloc(set_id);
        let ip_set = self
            .ip_sets
            .entry(id)
            .or_insert_with(|| BpfIpSet::new(set_id, id));
        // May have been queued for deletion and recreated since.
        ip_set.deleted = false;
        ip_set
    }

    fn check_poisoned(&self) -> Result<()> {
        match self.poison.cause() {
            Some(cause) => Err(IpSetsError::Poisoned {
                cause: cause.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn fail(&mut self, violation: InvariantViolation) -> IpSetsError {
        error!(family = %self.family, error = %violation, "IP set reconciler poisoned");
        self.poison.poison(&violation);
        IpSetsError::Invariant(violation)
    }

    /// Replaces the desired membership of a set. A set the name filter does
    /// not need is queued for removal instead.
    pub fn add_or_replace_ip_set<I, S>(&mut self, set_id: &str, set_type: IpSetType, members: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.check_poisoned()?;
        if !self.is_ip_set_needed(set_id) {
            if let Some(id) = self.existing_id(set_id) {
                if let Some(ip_set) = self.ip_sets.get_mut(&id) {
                    ip_set.remove_all();
                    ip_set.deleted = true;
                }
                self.dirty.insert(id);
            }
            debug!(set_id, "Ignoring IP set that is not needed");
            return Ok(());
        }

        let family = self.family;
        let to_entry = self.member_to_entry;
        let ip_set = self.get_or_create(set_id);
        ip_set.set_type = set_type;
        let id = ip_set.id;
        let entries: Vec<IpSetEntry> = members
            .into_iter()
            .filter_map(|m| to_entry(family, id, m.as_ref()))
            .collect();
        info!(set_id, uint64_id = id, members = entries.len(), "IP set added");
        ip_set.replace_members(entries);
        self.dirty.insert(id);
        Ok(())
    }

    /// Queues removal of a set and all its entries.
    pub fn remove_ip_set(&mut self, set_id: &str) -> Result<()> {
        self.check_poisoned()?;
        let Some(id) = self.existing_id(set_id) else {
            if self.is_ip_set_needed(set_id) {
                return Err(self.fail(InvariantViolation::unknown_key(KIND, set_id)));
            }
            return Ok(());
        };
        if self.ip_sets.get(&id).is_some_and(|s| s.deleted) {
            return Err(self.fail(InvariantViolation::already_deleted(KIND, set_id)));
        }
        if let Some(ip_set) = self.ip_sets.get_mut(&id) {
            ip_set.remove_all();
            ip_set.deleted = true;
        }
        debug!(set_id, uint64_id = id, "IP set removed");
        self.dirty.insert(id);
        Ok(())
    }

    /// Adds members to a set. Members of the other family are ignored.
    pub fn add_members<I, S>(&mut self, set_id: &str, members: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.apply_member_delta(set_id, members, true)
    }

    /// Removes members from a set. Members of the other family are ignored.
    pub fn remove_members<I, S>(&mut self, set_id: &str, members: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.apply_member_delta(set_id, members, false)
    }

    fn apply_member_delta<I, S>(&mut self, set_id: &str, members: I, adding: bool) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.check_poisoned()?;
        let Some(id) = self.existing_id(set_id) else {
            if self.is_ip_set_needed(set_id) {
                return Err(self.fail(InvariantViolation::unknown_set(KIND, set_id)));
            }
            return Ok(());
        };
        if self.ip_sets.get(&id).is_some_and(|s| s.deleted) {
            return Err(self.fail(InvariantViolation::already_deleted(KIND, set_id)));
        }

        let family = self.family;
        let to_entry = self.member_to_entry;
        let Some(ip_set) = self.ip_sets.get_mut(&id) else {
            return Ok(());
        };
        let mut count = 0usize;
        for member in members {
            let Some(entry) = to_entry(family, id, member.as_ref()) else {
                continue;
            };
            if adding {
                ip_set.add_member(entry);
            } else {
                ip_set.remove_member(&entry);
            }
            count += 1;
        }
        if adding {
            info!(set_id, uint64_id = id, added = count, "IP delta update (adding)");
        } else {
            info!(set_id, uint64_id = id, removed = count, "IP delta update (removing)");
        }
        self.dirty.insert(id);
        Ok(())
    }

    /// Rebuilds pending work from the map contents and deletes orphans.
    /// Returns the number of orphans deleted and whether the scan of the map
    /// completed. After a failed scan nothing is known about which entries
    /// are resident.
    fn resync(&mut self) -> (usize, bool) {
        debug!(family = %self.family, "Doing full resync of BPF IP sets map");
        self.metrics.record_operation("resync-bpf-ipsets");
        self.resync_scheduled = false;
        self.dirty.clear();

        for ip_set in self.ip_sets.values_mut() {
            ip_set.pending_adds = ip_set.desired.clone();
            ip_set.pending_removes.clear();
        }

        let decode = self.entry_from_bytes;
        let ip_sets = &mut self.ip_sets;
        let mut orphans: Vec<Vec<u8>> = Vec::new();
        let result = self.map.iter(&mut |key, _value| {
            let Some(entry) = decode(key) else {
                warn!(len = key.len(), "Undecodable entry in IP sets map");
                orphans.push(key.to_vec());
                return IterAction::Continue;
            };
            debug!(set_id = entry.set_id(), entry = %entry, "Found entry in dataplane");
            match ip_sets.get_mut(&entry.set_id()) {
                None => orphans.push(key.to_vec()),
                Some(ip_set) => {
                    if ip_set.desired.contains(&entry) {
                        ip_set.pending_adds.remove(&entry);
                    } else {
                        ip_set.pending_removes.insert(entry);
                    }
                }
            }
            IterAction::Continue
        });
        let scanned = match result {
            Ok(()) => true,
            Err(e) => {
                error!(family = %self.family, error = %e, "Failed to iterate over BPF map; IP sets may be out of sync");
                self.resync_scheduled = true;
                false
            }
        };

        let mut num_dels = 0;
        for key in orphans {
            match self.map.delete(&key) {
                Ok(()) => num_dels += 1,
                Err(e) => {
                    error!(key = ?key, error = %e, "Failed to remove unexpected IP set entry");
                    self.resync_scheduled = true;
                }
            }
        }

        for ip_set in self.ip_sets.values() {
            if ip_set.is_dirty() {
                self.dirty.insert(ip_set.id);
            }
        }
        (num_dels, scanned)
    }

    fn release(&mut self, id: u64) {
        let Some(ip_set) = self.ip_sets.remove(&id) else {
            return;
        };
        debug!(set_id = %ip_set.original_id, uint64_id = id, "Releasing IP set ID");
        if let Err(e) = self.allocator.release_uint_id(id) {
            self.fail(InvariantViolation::ReleaseFailed {
                kind: KIND,
                id,
                reason: e.to_string(),
            });
        }
    }
}

impl<M: BackingMap, A: IdAllocator> Reconciler for BpfIpSets<M, A> {
    fn name(&self) -> &str {
        "bpf-ip-sets"
    }

    fn queue_resync(&mut self) {
        debug!("Asked to resync with the dataplane on next update.");
        self.resync_scheduled = true;
    }

    fn apply_updates(&mut self) -> ApplyStats {
        if let Err(e) = self.check_poisoned() {
            error!(error = %e, "Skipping IP set updates");
            return ApplyStats::default();
        }
        let start = Instant::now();
        let mut stats = ApplyStats::default();

        // Deleted sets may still have entries resident until a scan says otherwise.
        let mut can_release = true;
        if self.resync_scheduled {
            stats.resynced = true;
            let (num_dels, scanned) = self.resync();
            stats.num_dels += num_dels;
            can_release = scanned;
        }

        for id in self.dirty.clone() {
            let Some(ip_set) = self.ip_sets.get_mut(&id) else {
                warn!(uint64_id = id, "Couldn't find IP set that was marked as dirty.");
                self.resync_scheduled = true;
                self.dirty.remove(&id);
                continue;
            };

            let map = &mut self.map;
            let mut leave_dirty = false;
            ip_set.pending_removes.retain(|entry| {
                debug!(set_id = id, entry = %entry, "Removing entry from IP set");
                match map.delete(entry.as_bytes()) {
                    Ok(()) => {
                        stats.num_dels += 1;
                        false
                    }
                    Err(e) => {
                        error!(set_id = id, entry = %entry, error = %e, "Failed to remove IP set entry");
                        leave_dirty = true;
                        true
                    }
                }
            });
            ip_set.pending_adds.retain(|entry| {
                debug!(set_id = id, entry = %entry, "Adding entry to IP set");
                match map.update(entry.as_bytes(), &DUMMY_VALUE) {
                    Ok(()) => {
                        stats.num_adds += 1;
                        false
                    }
                    Err(e) => {
                        error!(set_id = id, entry = %entry, error = %e, "Failed to add IP set entry");
                        leave_dirty = true;
                        true
                    }
                }
            });

            if leave_dirty {
                debug!(set_id = id, "IP set still dirty, queueing resync");
                self.resync_scheduled = true;
                continue;
            }

            let deleted = ip_set.deleted;
            if deleted && !can_release {
                debug!(set_id = id, "Map scan failed, keeping deleted IP set until next resync");
                continue;
            }
            self.dirty.remove(&id);
            if deleted {
                // Clean and deleted: no entry carries this ID any more.
                self.release(id);
            }
            debug!(set_id = id, "IP set is now clean");
        }

        if !stats.is_noop() {
            info!(
                family = %self.family,
                time_taken = ?start.elapsed(),
                num_adds = stats.num_adds,
                num_dels = stats.num_dels,
                "Completed updates to BPF IP sets."
            );
        }

        self.metrics.set_num_ip_sets(self.ip_sets.len());
        stats.dirty_remaining = self.dirty.len();
        stats
    }

    fn has_pending_work(&self) -> bool {
        self.resync_scheduled || !self.dirty.is_empty()
    }

    fn dump_pending(&self) -> Vec<String> {
        let mut out = Vec::new();
        for id in &self.dirty {
            let Some(ip_set) = self.ip_sets.get(id) else {
                continue;
            };
            out.extend(
                ip_set
                    .pending_removes
                    .iter()
                    .map(|e| format!("{}: DEL {}", ip_set.original_id, e)),
            );
            out.extend(
                ip_set
                    .pending_adds
                    .iter()
                    .map(|e| format!("{}: ADD {}", ip_set.original_id, e)),
            );
            if ip_set.deleted {
                out.push(format!("{}: DELETED", ip_set.original_id));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::InMemoryMap;
    use pretty_assertions::assert_eq;

    fn ip_sets() -> BpfIpSets<InMemoryMap> {
        BpfIpSets::new(IpFamily::V4, DefaultIdAllocator::new(), InMemoryMap::new())
    }

    #[test]
    fn test_member_bookkeeping() {
        let mut set = BpfIpSet::new("s:a", 1);
        let a = entry::proto_member_to_entry(IpFamily::V4, 1, "10.0.0.1").unwrap();
        let b = entry::proto_member_to_entry(IpFamily::V4, 1, "10.0.0.2").unwrap();

        set.add_member(a);
        set.add_member(a);
        assert_eq!(set.pending_adds.len(), 1);

        // Pending add cancelled by removal.
        set.remove_member(&a);
        assert!(!set.is_dirty());

        // Simulate a written entry, then remove and re-add it.
        set.desired.insert(b);
        set.remove_member(&b);
        assert!(set.pending_removes.contains(&b));
        set.add_member(b);
        assert!(!set.is_dirty());
    }

    #[test]
    fn test_new_reconciler_resyncs() {
        let mut sets = ip_sets();
        assert!(sets.is_resync_scheduled());
        assert!(sets.has_pending_work());

        let stats = sets.apply_updates();
        assert!(stats.resynced);
        assert!(stats.is_noop());
        assert!(!sets.has_pending_work());
    }

    #[test]
    fn test_get_type_of_and_ids() {
        let mut sets = ip_sets();
        sets.add_or_replace_ip_set("s:np", IpSetType::IpAndPort, ["10.0.0.1,tcp:80"])
            .unwrap();
        assert_eq!(sets.get_type_of("s:np"), Some(IpSetType::IpAndPort));
        assert_eq!(sets.get_type_of("s:other"), None);
        assert_ne!(sets.id_string_to_u64("s:np"), NO_ID);
        assert_eq!(sets.id_string_to_u64("s:other"), NO_ID);
        assert_eq!(sets.ip_family(), IpFamily::V4);
    }

    #[test]
    fn test_dump_pending() {
        let mut sets = ip_sets();
        sets.add_or_replace_ip_set("s:a", IpSetType::Ip, ["10.0.0.1"]).unwrap();
        let id = sets.id_string_to_u64("s:a");
        assert_eq!(
            sets.dump_pending(),
            vec![format!("s:a: ADD {:#x}:10.0.0.1/32", id)]
        );
    }

    #[test]
    fn test_removal_of_unknown_set() {
        let mut sets = ip_sets();
        assert!(matches!(
            sets.remove_ip_set("s:ghost"),
            Err(IpSetsError::Invariant(InvariantViolation::UnknownKey { .. }))
        ));
        assert!(sets.is_poisoned());
        assert!(matches!(
            sets.add_members("s:a", ["10.0.0.1"]),
            Err(IpSetsError::Poisoned { .. })
        ));
    }

    #[test]
    fn test_unneeded_unknown_set_is_ignored() {
        let mut sets = ip_sets();
        sets.set_ip_set_name_filter(|name| name.starts_with("s:keep"));
        sets.remove_ip_set("s:drop").unwrap();
        sets.add_members("s:drop", ["10.0.0.1"]).unwrap();
        sets.add_or_replace_ip_set("s:drop", IpSetType::Ip, ["10.0.0.1"])
            .unwrap();
        assert_eq!(sets.num_ip_sets(), 0);
        assert!(!sets.is_poisoned());
    }
}
