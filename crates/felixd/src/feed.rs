//! JSON-lines replay of calculation-graph facts.
//!
//! Each non-blank line is one [`CalcEvent`], tagged by `"type"`:
//!
//! ```text
//! {"type":"ip_set_added","id":"s:web","set_type":"net"}
//! {"type":"ip_set_member_added","id":"s:web","member":"10.0.0.0/24"}
//! {"type":"flush"}
//! ```
//!
//! Lines starting with `#` are ignored. The sequencer is flushed on every
//! `flush` marker, whenever the flush interval elapses with work pending,
//! and once more at end of input.

use std::net::IpAddr;
use std::time::Duration;

use felix_calc::config::RawConfig;
use felix_calc::messages as msg;
use felix_calc::model::{
    BgpConfiguration, Encapsulation, Endpoint, EndpointBgpPeer, EndpointKey, HostInfo, IpPool,
    NamespaceId, ParsedRules, PolicyKey, ProfileKey, ServiceAccountId, ServiceId, TierInfo,
    Wireguard,
};
use felix_calc::{ConfigInterface, EventSequencer, Sink};
use felix_common::{Cidr, IpSetMember, IpSetType};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

/// One fact from the calculation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalcEvent {
    DatastoreNotReady,
    ConfigUpdate {
        #[serde(default)]
        global: RawConfig,
        #[serde(default)]
        host: RawConfig,
    },

    IpSetAdded {
        id: String,
        set_type: IpSetType,
    },
    IpSetRemoved {
        id: String,
    },
    IpSetMemberAdded {
        id: String,
        member: String,
    },
    IpSetMemberRemoved {
        id: String,
        member: String,
    },

    PolicyActive {
        key: PolicyKey,
        #[serde(default)]
        rules: ParsedRules,
    },
    PolicyInactive {
        key: PolicyKey,
    },
    ProfileActive {
        key: ProfileKey,
        #[serde(default)]
        rules: ParsedRules,
    },
    ProfileInactive {
        key: ProfileKey,
    },
    /// `endpoint: null` removes the endpoint.
    EndpointUpdate {
        key: EndpointKey,
        endpoint: Option<Endpoint>,
        peer_data: Option<EndpointBgpPeer>,
        #[serde(default)]
        tiers: Vec<TierInfo>,
    },

    Encapsulation {
        encap: Encapsulation,
    },
    HostIpUpdate {
        hostname: String,
        ip: Option<IpAddr>,
    },
    HostIpRemove {
        hostname: String,
    },
    HostIpv6Update {
        hostname: String,
        ip: Option<IpAddr>,
    },
    HostIpv6Remove {
        hostname: String,
    },
    HostMetadataUpdate {
        hostname: String,
        #[serde(default)]
        info: HostInfo,
    },
    HostMetadataRemove {
        hostname: String,
    },
    IpPoolUpdate {
        cidr: Cidr,
        pool: IpPool,
    },
    IpPoolRemove {
        cidr: Cidr,
    },
    WireguardUpdate {
        nodename: String,
        #[serde(default)]
        wireguard: Wireguard,
    },
    WireguardRemove {
        nodename: String,
    },
    /// `config: null` resets the global BGP configuration.
    GlobalBgpConfigUpdate {
        config: Option<BgpConfiguration>,
    },

    ServiceAccountUpdate(msg::ServiceAccountUpdate),
    ServiceAccountRemove {
        id: ServiceAccountId,
    },
    NamespaceUpdate(msg::NamespaceUpdate),
    NamespaceRemove {
        id: NamespaceId,
    },
    VtepUpdate(msg::VxlanTunnelEndpointUpdate),
    VtepRemove {
        node: String,
    },
    RouteUpdate(msg::RouteUpdate),
    RouteRemove {
        dst: String,
    },
    ServiceUpdate(msg::ServiceUpdate),
    ServiceRemove {
        id: ServiceId,
    },

    /// Flush the sequencer now.
    Flush,
}

impl CalcEvent {
    /// Parses one input line. Blank lines and `#` comments yield `None`.
    pub fn parse_line(line_no: usize, line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        serde_json::from_str(line)
            .map(Some)
            .map_err(|source| AgentError::Input {
                line: line_no,
                source,
            })
    }

    /// Feeds this fact to the sequencer.
    pub fn apply<S: Sink, C: ConfigInterface>(
        self,
        line_no: usize,
        seq: &mut EventSequencer<S, C>,
    ) -> Result<()> {
        match self {
            CalcEvent::DatastoreNotReady => seq.on_datastore_not_ready()?,
            CalcEvent::ConfigUpdate { global, host } => seq.on_config_update(global, host)?,
            CalcEvent::IpSetAdded { id, set_type } => seq.on_ip_set_added(&id, set_type)?,
            CalcEvent::IpSetRemoved { id } => seq.on_ip_set_removed(&id)?,
            CalcEvent::IpSetMemberAdded { id, member } => {
                seq.on_ip_set_member_added(&id, parse_member(line_no, &member)?)?
            }
            CalcEvent::IpSetMemberRemoved { id, member } => {
                seq.on_ip_set_member_removed(&id, parse_member(line_no, &member)?)?
            }
            CalcEvent::PolicyActive { key, rules } => seq.on_policy_active(key, rules)?,
            CalcEvent::PolicyInactive { key } => seq.on_policy_inactive(&key)?,
            CalcEvent::ProfileActive { key, rules } => seq.on_profile_active(key, rules)?,
            CalcEvent::ProfileInactive { key } => seq.on_profile_inactive(&key)?,
            CalcEvent::EndpointUpdate {
                key,
                endpoint,
                peer_data,
                tiers,
            } => seq.on_endpoint_tier_update(key, endpoint, peer_data, tiers)?,
            CalcEvent::Encapsulation { encap } => seq.on_encap_update(encap)?,
            CalcEvent::HostIpUpdate { hostname, ip } => seq.on_host_ip_update(&hostname, ip)?,
            CalcEvent::HostIpRemove { hostname } => seq.on_host_ip_remove(&hostname)?,
            CalcEvent::HostIpv6Update { hostname, ip } => seq.on_host_ipv6_update(&hostname, ip)?,
            CalcEvent::HostIpv6Remove { hostname } => seq.on_host_ipv6_remove(&hostname)?,
            CalcEvent::HostMetadataUpdate { hostname, info } => {
                seq.on_host_metadata_update(&hostname, info)?
            }
            CalcEvent::HostMetadataRemove { hostname } => seq.on_host_metadata_remove(&hostname)?,
            CalcEvent::IpPoolUpdate { cidr, pool } => seq.on_ip_pool_update(cidr, pool)?,
            CalcEvent::IpPoolRemove { cidr } => seq.on_ip_pool_remove(&cidr)?,
            CalcEvent::WireguardUpdate {
                nodename,
                wireguard,
            } => seq.on_wireguard_update(&nodename, wireguard)?,
            CalcEvent::WireguardRemove { nodename } => seq.on_wireguard_remove(&nodename)?,
            CalcEvent::GlobalBgpConfigUpdate { config } => {
                seq.on_global_bgp_config_update(config.as_ref())?
            }
            CalcEvent::ServiceAccountUpdate(update) => seq.on_service_account_update(update)?,
            CalcEvent::ServiceAccountRemove { id } => seq.on_service_account_remove(&id)?,
            CalcEvent::NamespaceUpdate(update) => seq.on_namespace_update(update)?,
            CalcEvent::NamespaceRemove { id } => seq.on_namespace_remove(&id)?,
            CalcEvent::VtepUpdate(update) => seq.on_vtep_update(update)?,
            CalcEvent::VtepRemove { node } => seq.on_vtep_remove(&node)?,
            CalcEvent::RouteUpdate(update) => seq.on_route_update(update)?,
            CalcEvent::RouteRemove { dst } => seq.on_route_remove(&dst)?,
            CalcEvent::ServiceUpdate(update) => seq.on_service_update(update)?,
            CalcEvent::ServiceRemove { id } => seq.on_service_remove(&id)?,
            CalcEvent::Flush => seq.flush()?,
        }
        Ok(())
    }
}

fn parse_member(line_no: usize, member: &str) -> Result<IpSetMember> {
    member.parse().map_err(|e| AgentError::Value {
        line: line_no,
        reason: format!("member {member:?}: {e}"),
    })
}

/// Replay totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub lines: usize,
    pub events: usize,
    pub flushes: usize,
}

/// Reads facts from `reader` into `seq` until end of input or cancellation.
///
/// Any parse or sequencer error stops the replay; a poisoned sequencer is
/// not usable afterwards.
pub async fn replay<R, S, C>(
    reader: R,
    seq: &mut EventSequencer<S, C>,
    flush_interval: Duration,
    cancel: CancellationToken,
) -> Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
    S: Sink,
    C: ConfigInterface,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(lines = stats.lines, "Replay cancelled");
                break;
            }
            _ = ticker.tick() => {
                if seq.has_pending() {
                    debug!("Flush interval elapsed with pending work");
                    seq.flush()?;
                    stats.flushes += 1;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!(lines = stats.lines, events = stats.events, "End of input");
                    break;
                };
                stats.lines += 1;
                let Some(event) = CalcEvent::parse_line(stats.lines, &line)? else {
                    continue;
                };
                stats.events += 1;
                if event == CalcEvent::Flush {
                    stats.flushes += 1;
                }
                event.apply(stats.lines, seq)?;
            }
        }
    }

    if seq.has_pending() {
        seq.flush()?;
        stats.flushes += 1;
    }
    Ok(stats)
}
