//! Base Reconciler trait shared by dataplane managers.

/// Outcome of one apply pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Entries written during the pass.
    pub num_adds: usize,
    /// Entries deleted during the pass (including orphans).
    pub num_dels: usize,
    /// True if the pass started with a full resync.
    pub resynced: bool,
    /// Sets left dirty at the end of the pass.
    pub dirty_remaining: usize,
}

impl ApplyStats {
    /// Returns true if the pass wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.num_adds == 0 && self.num_dels == 0
    }
}

/// Base trait for dataplane reconcilers.
///
/// Each reconciler owns one slice of dataplane state and drives it toward a
/// desired state recorded through its own ingestion API. The dataplane loop
/// calls these methods in phases.
///
/// # Lifecycle
///
/// 1. Construction: a resync is normally scheduled
/// 2. Ingestion: desired-state calls specific to the reconciler
/// 3. `apply_updates()`: converge, logging and swallowing I/O failures
/// 4. `apply_deletions()`: deferred deletions, if the reconciler has any
///
/// # Thread Safety
///
/// Reconcilers are not internally synchronized; exactly one caller drives
/// ingestion and apply phases.
pub trait Reconciler {
    /// Returns the name of this reconciler (for logging and debugging).
    fn name(&self) -> &str;

    /// Schedules a full resync on the next `apply_updates()`.
    fn queue_resync(&mut self);

    /// Pushes pending changes to the dataplane.
    ///
    /// Failures are not returned; they leave work pending and schedule a
    /// resync so the next call repeats only what did not succeed.
    fn apply_updates(&mut self) -> ApplyStats;

    /// Applies deferred deletions.
    ///
    /// Returns true if deletions remain that should be retried later.
    fn apply_deletions(&mut self) -> bool {
        false
    }

    /// Returns true if the reconciler has outstanding dataplane work.
    fn has_pending_work(&self) -> bool {
        false
    }

    /// Dumps pending work for debugging.
    fn dump_pending(&self) -> Vec<String> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingReconciler {
        resyncs: usize,
        applied: usize,
        resync_scheduled: bool,
    }

    impl Reconciler for CountingReconciler {
        fn name(&self) -> &str {
            "counting"
        }

        fn queue_resync(&mut self) {
            self.resync_scheduled = true;
        }

        fn apply_updates(&mut self) -> ApplyStats {
            self.applied += 1;
            let resynced = std::mem::take(&mut self.resync_scheduled);
            if resynced {
                self.resyncs += 1;
            }
            ApplyStats {
                resynced,
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_reconciler_defaults() {
        let mut r = CountingReconciler {
            resyncs: 0,
            applied: 0,
            resync_scheduled: false,
        };

        assert_eq!(r.name(), "counting");
        assert!(!r.apply_deletions());
        assert!(!r.has_pending_work());
        assert!(r.dump_pending().is_empty());

        r.queue_resync();
        assert!(r.apply_updates().resynced);
        assert!(!r.apply_updates().resynced);
        assert_eq!(r.applied, 2);
        assert_eq!(r.resyncs, 1);
    }

    #[test]
    fn test_apply_stats_noop() {
        assert!(ApplyStats::default().is_noop());
        let stats = ApplyStats {
            num_adds: 1,
            ..Default::default()
        };
        assert!(!stats.is_noop());
    }
}
