//! Agent wiring: fact stream -> sequencer -> decoupler -> dataplane task.

use std::io::Write;
use std::sync::Arc;

#[cfg(feature = "aya")]
use felix_bpf::aya_map::{AyaIpSetsMapV4, AyaIpSetsMapV6};
use felix_bpf::{
    BackingMap, BpfIpSets, DefaultIdAllocator, InMemoryMap, IpFamily, PrometheusIpSetsMetrics,
};
use felix_calc::{decoupler, EventSequencer};
use prometheus::Registry;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AgentConfig;
use crate::dataplane::{Dataplane, DataplaneStats};
use crate::error::{AgentError, Result};
use crate::feed::{self, FeedStats};
use crate::metrics_server;

/// What a finished run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentReport {
    pub feed: FeedStats,
    pub dataplane: DataplaneStats,
    pub num_ip_sets: usize,
    pub map_entries: usize,
}

pub struct Agent<W> {
    config: AgentConfig,
    registry: Arc<Registry>,
    out: W,
}

impl<W: Write + Send + 'static> Agent<W> {
    /// Validates `config`. Pass-through messages are written to `out`.
    pub fn new(config: AgentConfig, out: W) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(Registry::new()),
            out,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Replays the configured input and waits for the dataplane to drain.
    pub async fn run(self, cancel: CancellationToken) -> Result<AgentReport> {
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = match self.config.input.path.as_str() {
            "-" => Box::new(BufReader::new(tokio::io::stdin())),
            path => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        };
        self.run_with_reader(reader, cancel).await
    }

    /// Replays `reader` into the IP sets map selected by the configuration:
    /// the pinned kernel map when `map_pin_path` is set, otherwise an
    /// in-memory one.
    pub async fn run_with_reader<R>(self, reader: R, cancel: CancellationToken) -> Result<AgentReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let family = self.config.ip_family()?;
        match self.config.ipsets.map_pin_path.clone() {
            None => self.run_with_map(reader, family, InMemoryMap::new(), cancel).await,
            #[cfg(feature = "aya")]
            Some(path) => {
                info!(path = %path.display(), "Using pinned IP sets map");
                match family {
                    IpFamily::V4 => {
                        let map = AyaIpSetsMapV4::from_pin(&path)?;
                        self.run_with_map(reader, family, map, cancel).await
                    }
                    IpFamily::V6 => {
                        let map = AyaIpSetsMapV6::from_pin(&path)?;
                        self.run_with_map(reader, family, map, cancel).await
                    }
                }
            }
            #[cfg(not(feature = "aya"))]
            Some(path) => Err(AgentError::Configuration(format!(
                "cannot open {}: felixd built without the aya feature",
                path.display()
            ))),
        }
    }

    async fn run_with_map<R, M>(
        self,
        reader: R,
        family: IpFamily,
        map: M,
        cancel: CancellationToken,
    ) -> Result<AgentReport>
    where
        R: AsyncBufRead + Unpin,
        M: BackingMap + Send + 'static,
    {
        let metrics = PrometheusIpSetsMetrics::with_registry(self.registry.clone())?;
        let ip_sets =
            BpfIpSets::new(family, DefaultIdAllocator::new(), map).with_metrics(metrics);
        info!(%family, input = %self.config.input.path, "Starting agent");

        let server_cancel = cancel.child_token();
        let server = self.config.metrics.enabled.then(|| {
            let registry = self.registry.clone();
            let port = self.config.metrics.listen_port;
            let token = server_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = metrics_server::start_metrics_server(registry, port, token).await {
                    error!(error = %e, port, "Metrics server failed");
                }
            })
        });

        let (sink, decoupler) = decoupler::channel();
        let resync_interval = self.config.resync_interval();
        let dataplane_cancel = cancel.clone();
        let out = self.out;
        let dataplane = tokio::spawn(async move {
            let mut dp = Dataplane::new(ip_sets, out);
            let stats = dp.run(decoupler, resync_interval, dataplane_cancel).await?;
            let num_ip_sets = dp.ip_sets().num_ip_sets();
            let map_entries = dp.ip_sets_mut().map_mut().count_entries()?;
            Ok::<_, AgentError>((stats, num_ip_sets, map_entries))
        });

        let mut seq = EventSequencer::new(sink);
        let fed = feed::replay(reader, &mut seq, self.config.flush_interval(), cancel.clone()).await;
        // Dropping the sequencer closes the channel; the dataplane drains and exits.
        drop(seq);
        if fed.is_err() {
            cancel.cancel();
        }

        let joined = dataplane.await;
        server_cancel.cancel();
        if let Some(server) = server {
            server.await?;
        }

        let feed = fed?;
        let (dataplane, num_ip_sets, map_entries) = joined??;
        info!(
            events = feed.events,
            flushes = feed.flushes,
            num_ip_sets,
            map_entries,
            "Agent finished"
        );
        Ok(AgentReport {
            feed,
            dataplane,
            num_ip_sets,
            map_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = AgentConfig::default();
        config.ipsets.ip_version = 7;
        assert!(matches!(
            Agent::new(config, Vec::<u8>::new()),
            Err(AgentError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unopenable_pin_path() {
        let mut config = AgentConfig::default();
        config.ipsets.map_pin_path = Some("/nonexistent/cali_v4_ip_sets".into());
        // Without the aya feature the configuration itself is rejected.
        let err = match Agent::new(config, std::io::sink()) {
            Ok(agent) => agent
                .run_with_reader(&b""[..], CancellationToken::new())
                .await
                .unwrap_err(),
            Err(err) => err,
        };
        if cfg!(feature = "aya") {
            assert!(matches!(err, AgentError::Map(_)), "got {err:?}");
        } else {
            assert!(matches!(err, AgentError::Configuration(_)), "got {err:?}");
        }
    }

    #[tokio::test]
    async fn test_run_with_empty_input() {
        let agent = Agent::new(AgentConfig::default(), std::io::sink()).unwrap();
        let report = agent
            .run_with_reader(&b""[..], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.feed, FeedStats::default());
        assert_eq!(report.num_ip_sets, 0);
        assert_eq!(report.map_entries, 0);
    }
}
