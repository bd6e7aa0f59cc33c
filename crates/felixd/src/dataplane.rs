//! Dataplane task: drains sequenced messages into the IP set reconciler.
//!
//! IP set messages drive [`BpfIpSets`]; every other message is written out as
//! one JSON line. After each burst of messages the reconciler gets one
//! `apply_updates` pass.

use std::io::Write;
use std::time::Duration;

use felix_bpf::{BackingMap, BpfIpSets, IdAllocator};
use felix_calc::{Decoupler, Message};
use felix_common::{ApplyStats, Reconciler};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Delay before retrying a pass that left work behind.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Running totals for the dataplane task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataplaneStats {
    pub messages: usize,
    pub ip_set_messages: usize,
    pub passes: usize,
    pub resyncs: usize,
    pub num_adds: usize,
    pub num_dels: usize,
}

pub struct Dataplane<M, A, W> {
    ip_sets: BpfIpSets<M, A>,
    out: W,
    stats: DataplaneStats,
}

impl<M: BackingMap, A: IdAllocator, W: Write> Dataplane<M, A, W> {
    pub fn new(ip_sets: BpfIpSets<M, A>, out: W) -> Self {
        Self {
            ip_sets,
            out,
            stats: DataplaneStats::default(),
        }
    }

    pub fn ip_sets(&self) -> &BpfIpSets<M, A> {
        &self.ip_sets
    }

    pub fn ip_sets_mut(&mut self) -> &mut BpfIpSets<M, A> {
        &mut self.ip_sets
    }

    pub fn out(&self) -> &W {
        &self.out
    }

    pub fn stats(&self) -> DataplaneStats {
        self.stats
    }

    /// Routes one message. IP set errors are fatal for the reconciler.
    pub fn handle(&mut self, msg: Message) -> Result<()> {
        self.stats.messages += 1;
        match msg {
            Message::IpSetUpdate(update) => {
                self.stats.ip_set_messages += 1;
                self.ip_sets
                    .add_or_replace_ip_set(&update.id, update.set_type, update.members)?;
            }
            Message::IpSetDeltaUpdate(delta) => {
                self.stats.ip_set_messages += 1;
                self.ip_sets.add_members(&delta.id, delta.added_members)?;
                self.ip_sets.remove_members(&delta.id, delta.removed_members)?;
            }
            Message::IpSetRemove(remove) => {
                self.stats.ip_set_messages += 1;
                self.ip_sets.remove_ip_set(&remove.id)?;
            }
            other => {
                debug!(kind = other.kind(), "Passing message through");
                let line = other.to_json().map_err(std::io::Error::from)?;
                writeln!(self.out, "{line}")?;
            }
        }
        Ok(())
    }

    /// Runs one reconciler pass.
    pub fn apply(&mut self) -> ApplyStats {
        let pass = self.ip_sets.apply_updates();
        self.stats.passes += 1;
        self.stats.num_adds += pass.num_adds;
        self.stats.num_dels += pass.num_dels;
        if pass.resynced {
            self.stats.resyncs += 1;
        }
        pass
    }

    /// Consumes messages until cancelled or the producer goes away.
    ///
    /// With `resync_interval` set, a full resync is queued each time it
    /// elapses. A pass that leaves dirty sets behind is retried shortly after.
    pub async fn run(
        &mut self,
        mut decoupler: Decoupler,
        resync_interval: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<DataplaneStats> {
        let period = resync_interval.unwrap_or(Duration::from_secs(3600));
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Startup pass: picks up the scheduled resync against the existing map.
        self.apply();
        let mut retry = self.ip_sets.has_pending_work();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Dataplane task cancelled");
                    break;
                }
                _ = resync.tick(), if resync_interval.is_some() => {
                    self.ip_sets.queue_resync();
                }
                _ = tokio::time::sleep(RETRY_INTERVAL), if retry => {
                    warn!(
                        pending = ?self.ip_sets.dump_pending(),
                        "Retrying IP set updates"
                    );
                }
                msg = decoupler.recv() => {
                    let Some(msg) = msg else {
                        info!("Sequencer closed, dataplane exiting");
                        break;
                    };
                    self.handle(msg)?;
                    while let Some(msg) = decoupler.try_recv() {
                        self.handle(msg)?;
                    }
                }
            }
            self.apply();
            retry = self.ip_sets.has_pending_work();
        }

        self.out.flush()?;
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_bpf::{DefaultIdAllocator, InMemoryMap, IpFamily};
    use felix_calc::messages::{IpSetDeltaUpdate, IpSetRemove, IpSetUpdate};
    use felix_calc::Sink;
    use felix_common::IpSetType;
    use pretty_assertions::assert_eq;

    fn dataplane() -> Dataplane<InMemoryMap, DefaultIdAllocator, Vec<u8>> {
        let ip_sets = BpfIpSets::new(IpFamily::V4, DefaultIdAllocator::new(), InMemoryMap::new());
        Dataplane::new(ip_sets, Vec::new())
    }

    fn update(id: &str, members: &[&str]) -> Message {
        Message::IpSetUpdate(IpSetUpdate {
            id: id.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            set_type: IpSetType::Net,
        })
    }

    #[test]
    fn test_ip_set_lifecycle() {
        let mut dp = dataplane();
        dp.handle(update("s:web", &["10.0.0.0/24", "10.0.1.1"])).unwrap();
        let pass = dp.apply();
        assert_eq!(pass.num_adds, 2);
        assert_eq!(dp.ip_sets().map().len(), 2);

        dp.handle(Message::IpSetDeltaUpdate(IpSetDeltaUpdate {
            id: "s:web".to_string(),
            added_members: vec!["10.0.2.0/24".to_string()],
            removed_members: vec!["10.0.1.1".to_string()],
        }))
        .unwrap();
        let pass = dp.apply();
        assert_eq!((pass.num_adds, pass.num_dels), (1, 1));
        assert_eq!(dp.ip_sets().map().len(), 2);

        dp.handle(Message::IpSetRemove(IpSetRemove {
            id: "s:web".to_string(),
        }))
        .unwrap();
        dp.apply();
        assert!(dp.ip_sets().map().is_empty());
        assert_eq!(dp.stats().ip_set_messages, 3);
        assert!(dp.out().is_empty());
    }

    #[test]
    fn test_other_messages_written_as_json() {
        let mut dp = dataplane();
        dp.handle(Message::DatastoreNotReady).unwrap();

        let out = String::from_utf8(dp.out().clone()).unwrap();
        assert_eq!(out, "{\"type\":\"DatastoreNotReady\"}\n");
        assert_eq!(dp.stats().messages, 1);
        assert_eq!(dp.stats().ip_set_messages, 0);
    }

    #[test]
    fn test_ip_set_error_is_fatal() {
        let mut dp = dataplane();
        dp.handle(update("s:web", &[])).unwrap();
        dp.handle(Message::IpSetRemove(IpSetRemove {
            id: "s:web".to_string(),
        }))
        .unwrap();

        let err = dp.handle(Message::IpSetRemove(IpSetRemove {
            id: "s:web".to_string(),
        }));
        assert!(err.is_err());
        assert!(dp.ip_sets().is_poisoned());
    }

    #[tokio::test]
    async fn test_run_until_sequencer_closes() {
        let (mut tx, decoupler) = felix_calc::decoupler::channel();
        tx.send(update("s:web", &["10.0.0.1"]));
        tx.send(Message::DatastoreNotReady);
        drop(tx);

        let mut dp = dataplane();
        let stats = dp
            .run(decoupler, None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.messages, 2);
        assert_eq!(stats.num_adds, 1);
        assert_eq!(stats.resyncs, 1);
        assert_eq!(dp.ip_sets().map().len(), 1);
    }
}
