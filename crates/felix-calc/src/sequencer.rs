//! Event sequencer: per-kind buffering and dependency-ordered flush.
//!
//! The calculation graph reports facts through `on_*` calls in whatever order
//! it discovers them. [`EventSequencer`] buffers them per entity kind,
//! coalesces repeated or contradictory facts for the same key, and on
//! [`EventSequencer::flush`] emits the surviving changes to its [`Sink`] in an
//! order that never lets a downstream consumer see a reference before its
//! target (or a target removed before its references).
//!
//! # Flush Order
//!
//! 1. Datastore-not-ready flag, then merged config
//! 2. IP set adds, IP set deltas, policy updates, profile updates, endpoint updates
//! 3. Endpoint removes, profile removes, policy removes, IP set removes
//! 4. Service accounts and namespaces (removes first)
//! 5. Route removes, VTEP removes, VTEP adds, route adds
//! 6. Wireguard, host IPs, host IPv6s, host metadata, IP pools (removes first), encapsulation
//! 7. Global BGP config
//! 8. Services (removes first)
//!
//! # Failure
//!
//! Protocol violations by the caller poison the sequencer: the failing call
//! returns the violation and every later call returns
//! [`SequencerError::Poisoned`]. A sequencer in that state must be rebuilt.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use felix_common::{ChangeBuffer, Cidr, InvariantViolation, IpSetMember, IpSetType, MultiDict, Poison};
use tracing::{debug, error, info};

use crate::config::{Config, ConfigInterface, RawConfig, Source};
use crate::convert;
use crate::error::{Result, SequencerError};
use crate::messages::{self as msg, Message};
use crate::model::{
    BgpConfiguration, Encapsulation, Endpoint, EndpointBgpPeer, EndpointKey, HostEndpoint,
    HostInfo, IpPool, NamespaceId, ParsedRules, PolicyKey, ProfileKey, RouteId,
    ServiceAccountId, ServiceId, TierInfo, Wireguard, WorkloadEndpoint,
};
use crate::sink::Sink;

const IP_SETS: &str = "ip-set";
const ENDPOINTS: &str = "endpoint";

/// Endpoint update waiting for flush. Carries its own ID so the flush never
/// has to pair a key with a value of the other endpoint kind.
#[derive(Debug, Clone)]
enum PendingEndpoint {
    Workload {
        id: msg::WorkloadEndpointId,
        endpoint: WorkloadEndpoint,
        peer_data: Option<EndpointBgpPeer>,
        tiers: Vec<TierInfo>,
    },
    Host {
        id: msg::HostEndpointId,
        endpoint: HostEndpoint,
        tiers: Vec<TierInfo>,
    },
}

/// Buffers and coalesces calculation graph output, then flushes it in
/// dependency order.
///
/// Not internally synchronized: one caller drives both the `on_*` calls and
/// [`flush`](Self::flush).
pub struct EventSequencer<S, C = Config> {
    sink: S,
    config: C,
    poison: Poison,

    pending_not_ready: bool,
    pending_config: Option<(RawConfig, RawConfig)>,

    ip_sets: ChangeBuffer<String, IpSetType>,
    added_members: MultiDict<String, IpSetMember>,
    removed_members: MultiDict<String, IpSetMember>,
    policies: ChangeBuffer<PolicyKey, ParsedRules>,
    profiles: ChangeBuffer<ProfileKey, ParsedRules>,
    endpoints: ChangeBuffer<EndpointKey, PendingEndpoint>,

    service_accounts: ChangeBuffer<ServiceAccountId, msg::ServiceAccountUpdate>,
    namespaces: ChangeBuffer<NamespaceId, msg::NamespaceUpdate>,
    routes: ChangeBuffer<RouteId, msg::RouteUpdate>,
    vteps: ChangeBuffer<String, msg::VxlanTunnelEndpointUpdate>,

    // Wireguard keeps per-family sent state, so it does not fit ChangeBuffer.
    pending_wireguard_updates: BTreeMap<String, Wireguard>,
    pending_wireguard_deletes: BTreeSet<String>,
    sent_wireguard: BTreeSet<String>,
    sent_wireguard_v6: BTreeSet<String>,

    host_ips: ChangeBuffer<String, Option<IpAddr>>,
    host_ipv6s: ChangeBuffer<String, Option<IpAddr>>,
    host_metadata: ChangeBuffer<String, HostInfo>,
    ip_pools: ChangeBuffer<Cidr, IpPool>,
    pending_encap: Option<Encapsulation>,
    pending_global_bgp: Option<msg::GlobalBgpConfigUpdate>,
    services: ChangeBuffer<ServiceId, msg::ServiceUpdate>,
}

impl<S: Sink> EventSequencer<S, Config> {
    /// Creates a sequencer with the default config merge.
    pub fn new(sink: S) -> Self {
        Self::with_config(sink, Config::new())
    }
}

impl<S: Sink, C: ConfigInterface> EventSequencer<S, C> {
    /// Creates a sequencer with a custom config merge.
    pub fn with_config(sink: S, config: C) -> Self {
        Self {
            sink,
            config,
            poison: Poison::new(),
            pending_not_ready: false,
            pending_config: None,
            ip_sets: ChangeBuffer::new(IP_SETS),
            added_members: MultiDict::new(),
            removed_members: MultiDict::new(),
            policies: ChangeBuffer::new("policy"),
            profiles: ChangeBuffer::new("profile"),
            endpoints: ChangeBuffer::new(ENDPOINTS),
            service_accounts: ChangeBuffer::new("service-account"),
            namespaces: ChangeBuffer::new("namespace"),
            routes: ChangeBuffer::new("route"),
            vteps: ChangeBuffer::new("vtep"),
            pending_wireguard_updates: BTreeMap::new(),
            pending_wireguard_deletes: BTreeSet::new(),
            sent_wireguard: BTreeSet::new(),
            sent_wireguard_v6: BTreeSet::new(),
            host_ips: ChangeBuffer::new("host-ip"),
            host_ipv6s: ChangeBuffer::new("host-ipv6"),
            host_metadata: ChangeBuffer::new("host-metadata"),
            ip_pools: ChangeBuffer::new("ip-pool"),
            pending_encap: None,
            pending_global_bgp: None,
            services: ChangeBuffer::new("service"),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    /// Returns true once a failure has poisoned the sequencer.
    pub fn is_poisoned(&self) -> bool {
        self.poison.is_poisoned()
    }

    fn check_poisoned(&self) -> Result<()> {
        match self.poison.cause() {
            Some(cause) => Err(SequencerError::Poisoned {
                cause: cause.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: impl Into<SequencerError>) -> SequencerError {
        let err = err.into();
        error!(error = %err, "Sequencer poisoned; bookkeeping can no longer be trusted");
        self.poison.poison(&err);
        err
    }

    // ---- IP sets ----

    /// A new IP set became active. Its membership starts out empty.
    pub fn on_ip_set_added(&mut self, set_id: &str, set_type: IpSetType) -> Result<()> {
        self.check_poisoned()?;
        debug!(set_id, %set_type, "IP set now active");
        let id = set_id.to_string();
        self.ip_sets
            .on_added(id.clone(), set_type)
            .map_err(|e| self.fail(e))?;
        self.added_members.discard_key(&id);
        self.removed_members.discard_key(&id);
        Ok(())
    }

    pub fn on_ip_set_removed(&mut self, set_id: &str) -> Result<()> {
        self.check_poisoned()?;
        debug!(set_id, "IP set no longer active");
        let id = set_id.to_string();
        self.ip_sets.on_inactive(&id).map_err(|e| self.fail(e))?;
        self.added_members.discard_key(&id);
        self.removed_members.discard_key(&id);
        Ok(())
    }

    pub fn on_ip_set_member_added(&mut self, set_id: &str, member: IpSetMember) -> Result<()> {
        self.check_poisoned()?;
        debug!(set_id, %member, "IP set member added");
        let id = set_id.to_string();
        if !self.ip_sets.is_known(&id) {
            return Err(self.fail(InvariantViolation::unknown_set(IP_SETS, &id)));
        }
        if !self.removed_members.discard(&id, &member) {
            self.added_members.put(id, member);
        }
        Ok(())
    }

    pub fn on_ip_set_member_removed(&mut self, set_id: &str, member: IpSetMember) -> Result<()> {
        self.check_poisoned()?;
        debug!(set_id, %member, "IP set member removed");
        let id = set_id.to_string();
        if !self.ip_sets.is_known(&id) {
            return Err(self.fail(InvariantViolation::unknown_set(IP_SETS, &id)));
        }
        if !self.added_members.discard(&id, &member) {
            self.removed_members.put(id, member);
        }
        Ok(())
    }

    // ---- Readiness and config ----

    pub fn on_datastore_not_ready(&mut self) -> Result<()> {
        self.check_poisoned()?;
        self.pending_not_ready = true;
        Ok(())
    }

    /// Records the latest global and per-host config. Only the last pair
    /// before a flush is merged.
    pub fn on_config_update(&mut self, global: RawConfig, host: RawConfig) -> Result<()> {
        self.check_poisoned()?;
        self.pending_config = Some((global, host));
        Ok(())
    }

    // ---- Policies, profiles, endpoints ----

    pub fn on_policy_active(&mut self, key: PolicyKey, rules: ParsedRules) -> Result<()> {
        self.check_poisoned()?;
        debug!(policy = %key, "Policy active");
        self.policies.on_active(key, rules);
        Ok(())
    }

    pub fn on_policy_inactive(&mut self, key: &PolicyKey) -> Result<()> {
        self.check_poisoned()?;
        debug!(policy = %key, "Policy inactive");
        self.policies.on_inactive(key).map_err(|e| self.fail(e))
    }

    pub fn on_profile_active(&mut self, key: ProfileKey, rules: ParsedRules) -> Result<()> {
        self.check_poisoned()?;
        debug!(profile = %key.name, "Profile active");
        self.profiles.on_active(key, rules);
        Ok(())
    }

    pub fn on_profile_inactive(&mut self, key: &ProfileKey) -> Result<()> {
        self.check_poisoned()?;
        debug!(profile = %key.name, "Profile inactive");
        self.profiles.on_inactive(key).map_err(|e| self.fail(e))
    }

    /// Endpoint update with the tiers that apply to it. `None` removes it.
    pub fn on_endpoint_tier_update(
        &mut self,
        key: EndpointKey,
        endpoint: Option<Endpoint>,
        peer_data: Option<EndpointBgpPeer>,
        tiers: Vec<TierInfo>,
    ) -> Result<()> {
        self.check_poisoned()?;
        let Some(endpoint) = endpoint else {
            debug!(endpoint = ?key, "Endpoint removed");
            return self.endpoints.on_inactive(&key).map_err(|e| self.fail(e));
        };
        debug!(endpoint = ?key, tiers = tiers.len(), "Endpoint updated");
        let pending = match (&key, endpoint) {
            (
                EndpointKey::Workload {
                    orchestrator_id,
                    workload_id,
                    endpoint_id,
                },
                Endpoint::Workload(endpoint),
            ) => PendingEndpoint::Workload {
                id: msg::WorkloadEndpointId {
                    orchestrator_id: orchestrator_id.clone(),
                    workload_id: workload_id.clone(),
                    endpoint_id: endpoint_id.clone(),
                },
                endpoint,
                peer_data,
                tiers,
            },
            (EndpointKey::Host { endpoint_id }, Endpoint::Host(endpoint)) => PendingEndpoint::Host {
                id: msg::HostEndpointId {
                    endpoint_id: endpoint_id.clone(),
                },
                endpoint,
                tiers,
            },
            _ => return Err(self.fail(InvariantViolation::mismatched_value(ENDPOINTS, &key))),
        };
        self.endpoints.on_active(key, pending);
        Ok(())
    }

    // ---- Cluster-wide facts ----

    pub fn on_encap_update(&mut self, encap: Encapsulation) -> Result<()> {
        self.check_poisoned()?;
        debug!(
            ipip_enabled = encap.ipip_enabled,
            vxlan_enabled = encap.vxlan_enabled,
            vxlan_enabled_v6 = encap.vxlan_enabled_v6,
            "Encapsulation update"
        );
        self.pending_encap = Some(encap);
        Ok(())
    }

    pub fn on_host_ip_update(&mut self, hostname: &str, ip: Option<IpAddr>) -> Result<()> {
        self.check_poisoned()?;
        debug!(hostname, ip = ?ip, "Host IP update");
        self.host_ips.on_active(hostname.to_string(), ip);
        Ok(())
    }

    pub fn on_host_ip_remove(&mut self, hostname: &str) -> Result<()> {
        self.check_poisoned()?;
        debug!(hostname, "Host IP removed");
        self.host_ips
            .on_inactive(&hostname.to_string())
            .map_err(|e| self.fail(e))
    }

    pub fn on_host_ipv6_update(&mut self, hostname: &str, ip: Option<IpAddr>) -> Result<()> {
        self.check_poisoned()?;
        debug!(hostname, ip = ?ip, "Host IPv6 update");
        self.host_ipv6s.on_active(hostname.to_string(), ip);
        Ok(())
    }

    pub fn on_host_ipv6_remove(&mut self, hostname: &str) -> Result<()> {
        self.check_poisoned()?;
        debug!(hostname, "Host IPv6 removed");
        self.host_ipv6s
            .on_inactive(&hostname.to_string())
            .map_err(|e| self.fail(e))
    }

    pub fn on_host_metadata_update(&mut self, hostname: &str, info: HostInfo) -> Result<()> {
        self.check_poisoned()?;
        debug!(hostname, info = ?info, "Host update");
        self.host_metadata.on_active(hostname.to_string(), info);
        Ok(())
    }

    pub fn on_host_metadata_remove(&mut self, hostname: &str) -> Result<()> {
        self.check_poisoned()?;
        debug!(hostname, "Host removed");
        self.host_metadata
            .on_inactive(&hostname.to_string())
            .map_err(|e| self.fail(e))
    }

    pub fn on_ip_pool_update(&mut self, cidr: Cidr, pool: IpPool) -> Result<()> {
        self.check_poisoned()?;
        debug!(%cidr, pool = ?pool, "IP pool update");
        self.ip_pools.on_active(cidr, pool);
        Ok(())
    }

    pub fn on_ip_pool_remove(&mut self, cidr: &Cidr) -> Result<()> {
        self.check_poisoned()?;
        debug!(%cidr, "IP pool removed");
        self.ip_pools.on_inactive(cidr).map_err(|e| self.fail(e))
    }

    pub fn on_wireguard_update(&mut self, nodename: &str, wg: Wireguard) -> Result<()> {
        self.check_poisoned()?;
        debug!(nodename, "Wireguard updated");
        self.pending_wireguard_deletes.remove(nodename);
        self.pending_wireguard_updates.insert(nodename.to_string(), wg);
        Ok(())
    }

    /// Removes a node's wireguard state. Removal of a node with nothing sent
    /// is a no-op at flush time.
    pub fn on_wireguard_remove(&mut self, nodename: &str) -> Result<()> {
        self.check_poisoned()?;
        debug!(nodename, "Wireguard removed");
        self.pending_wireguard_updates.remove(nodename);
        self.pending_wireguard_deletes.insert(nodename.to_string());
        Ok(())
    }

    /// Replaces the global BGP config. `None` resets it.
    pub fn on_global_bgp_config_update(&mut self, cfg: Option<&BgpConfiguration>) -> Result<()> {
        self.check_poisoned()?;
        debug!(cfg = ?cfg, "Global BGP configuration updated");
        self.pending_global_bgp = Some(convert::bgp_config_to_update(cfg));
        Ok(())
    }

    // ---- Service accounts, namespaces ----

    pub fn on_service_account_update(&mut self, update: msg::ServiceAccountUpdate) -> Result<()> {
        self.check_poisoned()?;
        debug!(key = ?update.id, labels = ?update.labels, "ServiceAccount update");
        self.service_accounts.on_active(update.id.clone(), update);
        Ok(())
    }

    pub fn on_service_account_remove(&mut self, id: &ServiceAccountId) -> Result<()> {
        self.check_poisoned()?;
        debug!(key = ?id, "ServiceAccount removed");
        self.service_accounts
            .on_inactive(id)
            .map_err(|e| self.fail(e))
    }

    pub fn on_namespace_update(&mut self, update: msg::NamespaceUpdate) -> Result<()> {
        self.check_poisoned()?;
        debug!(key = ?update.id, labels = ?update.labels, "Namespace update");
        self.namespaces.on_active(update.id.clone(), update);
        Ok(())
    }

    pub fn on_namespace_remove(&mut self, id: &NamespaceId) -> Result<()> {
        self.check_poisoned()?;
        debug!(key = ?id, "Namespace removed");
        self.namespaces.on_inactive(id).map_err(|e| self.fail(e))
    }

    // ---- Tunnels and routes ----

    pub fn on_vtep_update(&mut self, update: msg::VxlanTunnelEndpointUpdate) -> Result<()> {
        self.check_poisoned()?;
        debug!(node = %update.node, "VTEP update");
        self.vteps.on_active(update.node.clone(), update);
        Ok(())
    }

    pub fn on_vtep_remove(&mut self, node: &str) -> Result<()> {
        self.check_poisoned()?;
        debug!(node, "VTEP removed");
        self.vteps
            .on_inactive(&node.to_string())
            .map_err(|e| self.fail(e))
    }

    pub fn on_route_update(&mut self, update: msg::RouteUpdate) -> Result<()> {
        self.check_poisoned()?;
        debug!(dst = %update.dst, "Route update");
        let id = RouteId {
            dst: update.dst.clone(),
        };
        self.routes.on_active(id, update);
        Ok(())
    }

    pub fn on_route_remove(&mut self, dst: &str) -> Result<()> {
        self.check_poisoned()?;
        debug!(dst, "Route removed");
        let id = RouteId {
            dst: dst.to_string(),
        };
        self.routes.on_inactive(&id).map_err(|e| self.fail(e))
    }

    // ---- Services ----

    pub fn on_service_update(&mut self, update: msg::ServiceUpdate) -> Result<()> {
        self.check_poisoned()?;
        debug!(name = %update.name, namespace = %update.namespace, "Service update");
        let id = ServiceId {
            name: update.name.clone(),
            namespace: update.namespace.clone(),
        };
        self.services.on_active(id, update);
        Ok(())
    }

    pub fn on_service_remove(&mut self, id: &ServiceId) -> Result<()> {
        self.check_poisoned()?;
        debug!(name = %id.name, namespace = %id.namespace, "Service delete");
        self.services.on_inactive(id).map_err(|e| self.fail(e))
    }

    // ---- Flush ----

    /// Returns true if a flush would emit anything.
    pub fn has_pending(&self) -> bool {
        self.pending_not_ready
            || self.pending_config.is_some()
            || self.ip_sets.has_pending()
            || !self.added_members.is_empty()
            || !self.removed_members.is_empty()
            || self.policies.has_pending()
            || self.profiles.has_pending()
            || self.endpoints.has_pending()
            || self.service_accounts.has_pending()
            || self.namespaces.has_pending()
            || self.routes.has_pending()
            || self.vteps.has_pending()
            || !self.pending_wireguard_updates.is_empty()
            || !self.pending_wireguard_deletes.is_empty()
            || self.host_ips.has_pending()
            || self.host_ipv6s.has_pending()
            || self.host_metadata.has_pending()
            || self.ip_pools.has_pending()
            || self.pending_encap.is_some()
            || self.pending_global_bgp.is_some()
            || self.services.has_pending()
    }

    /// Dumps pending entries for debugging.
    pub fn dump_pending(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.extend(self.ip_sets.dump());
        out.extend(self.policies.dump());
        out.extend(self.profiles.dump());
        out.extend(self.endpoints.dump());
        out.extend(self.service_accounts.dump());
        out.extend(self.namespaces.dump());
        out.extend(self.routes.dump());
        out.extend(self.vteps.dump());
        out.extend(self.host_ips.dump());
        out.extend(self.host_ipv6s.dump());
        out.extend(self.host_metadata.dump());
        out.extend(self.ip_pools.dump());
        out.extend(self.services.dump());
        out
    }

    /// Emits every pending change to the sink in dependency order.
    pub fn flush(&mut self) -> Result<()> {
        self.check_poisoned()?;

        // Rare changes first; they may restart the dataplane.
        self.flush_ready_flag();
        self.flush_config_update()?;

        // Additions in dependency order.
        self.flush_added_ip_sets();
        self.flush_ip_set_deltas();
        self.flush_policy_updates();
        self.flush_profile_updates();
        self.flush_endpoint_updates();

        // Removals in reverse dependency order.
        self.flush_endpoint_deletes();
        self.flush_profile_deletes();
        self.flush_policy_deletes();
        self.flush_removed_ip_sets();

        self.flush_service_accounts();
        self.flush_namespaces();

        // A route is never live without its VTEP.
        self.flush_route_removes();
        self.flush_vtep_removes();
        self.flush_vtep_adds();
        self.flush_route_adds();

        self.flush_wireguard_deletes();
        self.flush_wireguard_updates();
        self.flush_host_ips();
        self.flush_host_ipv6s();
        self.flush_host_metadata();
        self.flush_ip_pools();
        self.flush_encap_update();

        if let Some(update) = self.pending_global_bgp.take() {
            self.sink.send(Message::GlobalBgpConfigUpdate(update));
        }

        self.flush_services();
        Ok(())
    }

    fn flush_ready_flag(&mut self) {
        if std::mem::take(&mut self.pending_not_ready) {
            self.sink.send(Message::DatastoreNotReady);
        }
    }

    fn flush_config_update(&mut self) -> Result<()> {
        let Some((global, host)) = self.pending_config.take() else {
            return Ok(());
        };
        info!(
            global = global.len(),
            host = host.len(),
            "Possible config update"
        );
        let global_changed = self
            .config
            .update_from(&global, Source::DatastoreGlobal)
            .map_err(|e| self.fail(e))?;
        let host_changed = self
            .config
            .update_from(&host, Source::DatastorePerHost)
            .map_err(|e| self.fail(e))?;
        if global_changed || host_changed {
            info!(merged = ?self.config.raw_values(), "Config changed. Sending ConfigUpdate message");
            self.sink
                .send(Message::ConfigUpdate(self.config.to_config_update()));
        }
        Ok(())
    }

    fn flush_added_ip_sets(&mut self) {
        let sink = &mut self.sink;
        let added = &mut self.added_members;
        let removed = &mut self.removed_members;
        self.ip_sets.flush_updates(|set_id, set_type| {
            debug!(set_id = %set_id, "Flushing added IP set");
            // A full update carries the whole membership; no delta follows.
            let members = added
                .take(set_id)
                .iter()
                .map(IpSetMember::to_proto_format)
                .collect();
            removed.discard_key(set_id);
            sink.send(Message::IpSetUpdate(msg::IpSetUpdate {
                id: set_id.clone(),
                members,
                set_type,
            }));
        });
    }

    fn flush_ip_set_deltas(&mut self) {
        let set_ids: BTreeSet<String> = self
            .removed_members
            .keys()
            .chain(self.added_members.keys())
            .cloned()
            .collect();
        for set_id in set_ids {
            debug!(set_id = %set_id, "Flushing IP set deltas");
            let added_members = self
                .added_members
                .take(&set_id)
                .iter()
                .map(IpSetMember::to_proto_format)
                .collect();
            let removed_members = self
                .removed_members
                .take(&set_id)
                .iter()
                .map(IpSetMember::to_proto_format)
                .collect();
            self.sink.send(Message::IpSetDeltaUpdate(msg::IpSetDeltaUpdate {
                id: set_id,
                added_members,
                removed_members,
            }));
        }
        debug!("Done flushing IP address deltas");
    }

    fn flush_removed_ip_sets(&mut self) {
        let sink = &mut self.sink;
        let added = &mut self.added_members;
        let removed = &mut self.removed_members;
        self.ip_sets.flush_deletes(|set_id| {
            debug!(set_id = %set_id, "Flushing IP set remove");
            sink.send(Message::IpSetRemove(msg::IpSetRemove { id: set_id.clone() }));
            added.discard_key(set_id);
            removed.discard_key(set_id);
        });
        debug!("Done flushing IP set removes");
    }

    fn flush_policy_updates(&mut self) {
        let sink = &mut self.sink;
        self.policies.flush_updates(|key, rules| {
            sink.send(Message::ActivePolicyUpdate(
                convert::parsed_rules_to_active_policy_update(key, &rules),
            ));
        });
    }

    fn flush_policy_deletes(&mut self) {
        let sink = &mut self.sink;
        self.policies.flush_deletes(|key| {
            sink.send(Message::ActivePolicyRemove(msg::ActivePolicyRemove {
                id: convert::policy_id(key),
            }));
        });
    }

    fn flush_profile_updates(&mut self) {
        let sink = &mut self.sink;
        self.profiles.flush_updates(|key, rules| {
            sink.send(Message::ActiveProfileUpdate(
                convert::parsed_rules_to_active_profile_update(key, &rules),
            ));
        });
    }

    fn flush_profile_deletes(&mut self) {
        let sink = &mut self.sink;
        self.profiles.flush_deletes(|key| {
            sink.send(Message::ActiveProfileRemove(msg::ActiveProfileRemove {
                id: msg::ProfileId {
                    name: key.name.clone(),
                },
            }));
        });
    }

    fn flush_endpoint_updates(&mut self) {
        let sink = &mut self.sink;
        self.endpoints.flush_updates(|_, pending| match pending {
            PendingEndpoint::Workload {
                id,
                endpoint,
                peer_data,
                tiers,
            } => {
                let tiers = convert::tier_info_to_proto(&tiers);
                sink.send(Message::WorkloadEndpointUpdate(msg::WorkloadEndpointUpdate {
                    id,
                    endpoint: convert::workload_endpoint_to_proto(
                        &endpoint,
                        peer_data.as_ref(),
                        tiers.normal,
                    ),
                }));
            }
            PendingEndpoint::Host {
                id,
                endpoint,
                tiers,
            } => {
                let tiers = convert::tier_info_to_proto(&tiers);
                sink.send(Message::HostEndpointUpdate(msg::HostEndpointUpdate {
                    id,
                    endpoint: convert::host_endpoint_to_proto(&endpoint, tiers),
                }));
            }
        });
    }

    fn flush_endpoint_deletes(&mut self) {
        let sink = &mut self.sink;
        self.endpoints.flush_deletes(|key| match key {
            EndpointKey::Workload {
                orchestrator_id,
                workload_id,
                endpoint_id,
            } => sink.send(Message::WorkloadEndpointRemove(msg::WorkloadEndpointRemove {
                id: msg::WorkloadEndpointId {
                    orchestrator_id: orchestrator_id.clone(),
                    workload_id: workload_id.clone(),
                    endpoint_id: endpoint_id.clone(),
                },
            })),
            EndpointKey::Host { endpoint_id } => {
                sink.send(Message::HostEndpointRemove(msg::HostEndpointRemove {
                    id: msg::HostEndpointId {
                        endpoint_id: endpoint_id.clone(),
                    },
                }))
            }
        });
    }

    fn flush_service_accounts(&mut self) {
        let sink = &mut self.sink;
        self.service_accounts.flush_deletes(|id| {
            sink.send(Message::ServiceAccountRemove(msg::ServiceAccountRemove {
                id: id.clone(),
            }));
        });
        self.service_accounts
            .flush_updates(|_, update| sink.send(Message::ServiceAccountUpdate(update)));
        debug!("Done flushing Service Accounts");
    }

    fn flush_namespaces(&mut self) {
        let sink = &mut self.sink;
        self.namespaces.flush_deletes(|id| {
            sink.send(Message::NamespaceRemove(msg::NamespaceRemove { id: id.clone() }));
        });
        self.namespaces
            .flush_updates(|_, update| sink.send(Message::NamespaceUpdate(update)));
        debug!("Done flushing Namespaces");
    }

    fn flush_route_removes(&mut self) {
        let sink = &mut self.sink;
        self.routes.flush_deletes(|id| {
            sink.send(Message::RouteRemove(msg::RouteRemove { dst: id.dst.clone() }));
        });
        debug!("Done flushing route deletes");
    }

    fn flush_vtep_removes(&mut self) {
        let sink = &mut self.sink;
        self.vteps.flush_deletes(|node| {
            sink.send(Message::VxlanTunnelEndpointRemove(
                msg::VxlanTunnelEndpointRemove { node: node.clone() },
            ));
        });
        debug!("Done flushing VTEP removes");
    }

    fn flush_vtep_adds(&mut self) {
        let sink = &mut self.sink;
        self.vteps
            .flush_updates(|_, update| sink.send(Message::VxlanTunnelEndpointUpdate(update)));
        debug!("Done flushing VTEP adds");
    }

    fn flush_route_adds(&mut self) {
        let sink = &mut self.sink;
        self.routes
            .flush_updates(|_, update| sink.send(Message::RouteUpdate(update)));
        debug!("Done flushing route adds");
    }

    fn flush_wireguard_deletes(&mut self) {
        for nodename in std::mem::take(&mut self.pending_wireguard_deletes) {
            debug!(nodename = %nodename, "Processing pending wireguard delete");
            if self.sent_wireguard.remove(&nodename) {
                self.sink
                    .send(Message::WireguardEndpointRemove(msg::HostnameRemove {
                        hostname: nodename.clone(),
                    }));
            }
            if self.sent_wireguard_v6.remove(&nodename) {
                self.sink
                    .send(Message::WireguardEndpointV6Remove(msg::HostnameRemove {
                        hostname: nodename,
                    }));
            }
        }
        debug!("Done flushing wireguard removes");
    }

    fn flush_wireguard_updates(&mut self) {
        for (nodename, wg) in std::mem::take(&mut self.pending_wireguard_updates) {
            debug!(nodename = %nodename, wg = ?wg, "Processing pending wireguard update");

            if !wg.public_key.is_empty() {
                self.sink
                    .send(Message::WireguardEndpointUpdate(msg::WireguardEndpointUpdate {
                        hostname: nodename.clone(),
                        public_key: wg.public_key,
                        interface_ipv4_addr: wg
                            .interface_ipv4_addr
                            .map(|a| a.to_string())
                            .unwrap_or_default(),
                    }));
                self.sent_wireguard.insert(nodename.clone());
            } else if self.sent_wireguard.remove(&nodename) {
                self.sink
                    .send(Message::WireguardEndpointRemove(msg::HostnameRemove {
                        hostname: nodename.clone(),
                    }));
            }

            if !wg.public_key_v6.is_empty() {
                self.sink.send(Message::WireguardEndpointV6Update(
                    msg::WireguardEndpointV6Update {
                        hostname: nodename.clone(),
                        public_key_v6: wg.public_key_v6,
                        interface_ipv6_addr: wg
                            .interface_ipv6_addr
                            .map(|a| a.to_string())
                            .unwrap_or_default(),
                    },
                ));
                self.sent_wireguard_v6.insert(nodename);
            } else if self.sent_wireguard_v6.remove(&nodename) {
                self.sink
                    .send(Message::WireguardEndpointV6Remove(msg::HostnameRemove {
                        hostname: nodename,
                    }));
            }
        }
        debug!("Done flushing wireguard updates");
    }

    fn flush_host_ips(&mut self) {
        let sink = &mut self.sink;
        self.host_ips.flush_deletes(|hostname| {
            sink.send(Message::HostMetadataRemove(msg::HostnameRemove {
                hostname: hostname.clone(),
            }));
        });
        self.host_ips.flush_updates(|hostname, ip| {
            sink.send(Message::HostMetadataUpdate(msg::HostMetadataUpdate {
                hostname: hostname.clone(),
                ipv4_addr: ip.map(|a| a.to_string()).unwrap_or_default(),
            }));
        });
    }

    fn flush_host_ipv6s(&mut self) {
        let sink = &mut self.sink;
        self.host_ipv6s.flush_deletes(|hostname| {
            sink.send(Message::HostMetadataV6Remove(msg::HostnameRemove {
                hostname: hostname.clone(),
            }));
        });
        self.host_ipv6s.flush_updates(|hostname, ip| {
            sink.send(Message::HostMetadataV6Update(msg::HostMetadataV6Update {
                hostname: hostname.clone(),
                ipv6_addr: ip.map(|a| a.to_string()).unwrap_or_default(),
            }));
        });
    }

    fn flush_host_metadata(&mut self) {
        let sink = &mut self.sink;
        self.host_metadata.flush_deletes(|hostname| {
            sink.send(Message::HostMetadataV4V6Remove(msg::HostnameRemove {
                hostname: hostname.clone(),
            }));
        });
        self.host_metadata.flush_updates(|hostname, info| {
            sink.send(Message::HostMetadataV4V6Update(msg::HostMetadataV4V6Update {
                hostname: hostname.clone(),
                ipv4_addr: info.ip4_addr.map(|n| n.to_string()).unwrap_or_default(),
                ipv6_addr: info.ip6_addr.map(|n| n.to_string()).unwrap_or_default(),
                asnumber: info.asnumber,
                labels: info.labels,
            }));
        });
    }

    fn flush_ip_pools(&mut self) {
        let sink = &mut self.sink;
        self.ip_pools.flush_deletes(|cidr| {
            sink.send(Message::IpamPoolRemove(msg::IpamPoolRemove {
                id: convert::cidr_to_ip_pool_id(cidr),
            }));
        });
        self.ip_pools.flush_updates(|cidr, pool| {
            sink.send(Message::IpamPoolUpdate(msg::IpamPoolUpdate {
                id: convert::cidr_to_ip_pool_id(cidr),
                pool: msg::IpamPool {
                    cidr: pool.cidr.to_string(),
                    masquerade: pool.masquerade,
                    ipip_mode: pool.ipip_mode,
                    vxlan_mode: pool.vxlan_mode,
                },
            }));
        });
    }

    fn flush_encap_update(&mut self) {
        if let Some(encap) = self.pending_encap.take() {
            self.sink.send(Message::Encapsulation(msg::Encapsulation {
                ipip_enabled: encap.ipip_enabled,
                vxlan_enabled: encap.vxlan_enabled,
                vxlan_enabled_v6: encap.vxlan_enabled_v6,
            }));
        }
    }

    fn flush_services(&mut self) {
        let sink = &mut self.sink;
        self.services.flush_deletes(|id| {
            sink.send(Message::ServiceRemove(msg::ServiceRemove {
                name: id.name.clone(),
                namespace: id.namespace.clone(),
            }));
        });
        self.services
            .flush_updates(|_, update| sink.send(Message::ServiceUpdate(update)));
        debug!("Done flushing Services");
    }
}
