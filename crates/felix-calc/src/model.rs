//! Entity keys and values reported by the calculation graph.
//!
//! These are the inputs to [`EventSequencer`](crate::EventSequencer). They are
//! converted into [`messages`](crate::messages) payloads at flush time.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use felix_common::net::opt_as_str;
use felix_common::Cidr;
use serde::{Deserialize, Serialize};

/// An address with prefix length, host bits preserved (e.g. `10.0.0.5/24`).
pub use ipnetwork::IpNetwork as IpNet;

/// Policy key: tier plus policy name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    pub tier: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(tier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.name)
    }
}

/// Profile key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProfileKey {
    pub name: String,
}

impl ProfileKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Endpoint key. Workload and host endpoints share one buffer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointKey {
    Workload {
        orchestrator_id: String,
        workload_id: String,
        endpoint_id: String,
    },
    Host {
        endpoint_id: String,
    },
}

impl EndpointKey {
    pub fn workload(
        orchestrator_id: impl Into<String>,
        workload_id: impl Into<String>,
        endpoint_id: impl Into<String>,
    ) -> Self {
        EndpointKey::Workload {
            orchestrator_id: orchestrator_id.into(),
            workload_id: workload_id.into(),
            endpoint_id: endpoint_id.into(),
        }
    }

    pub fn host(endpoint_id: impl Into<String>) -> Self {
        EndpointKey::Host {
            endpoint_id: endpoint_id.into(),
        }
    }
}

/// Service account identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceAccountId {
    pub name: String,
    pub namespace: String,
}

/// Namespace identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamespaceId {
    pub name: String,
}

/// Route identifier: the destination CIDR as reported.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteId {
    pub dst: String,
}

/// Kubernetes service identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub name: String,
    pub namespace: String,
}

/// Policy action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Action {
    #[default]
    Allow,
    Deny,
    Log,
    Pass,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "Allow",
            Action::Deny => "Deny",
            Action::Log => "Log",
            Action::Pass => "Pass",
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

/// One rule after selector evaluation. IP sets are referenced by ID.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsedRule {
    pub action: String,
    pub ip_version: Option<u8>,
    pub protocol: Option<String>,
    pub src_nets: Vec<Cidr>,
    pub dst_nets: Vec<Cidr>,
    pub src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
    pub src_ip_set_ids: Vec<String>,
    pub dst_ip_set_ids: Vec<String>,
    pub not_src_ip_set_ids: Vec<String>,
    pub not_dst_ip_set_ids: Vec<String>,
    pub dst_ip_port_set_ids: Vec<String>,
}

/// Rules for a policy or profile.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsedRules {
    pub namespace: String,
    pub inbound_rules: Vec<ParsedRule>,
    pub outbound_rules: Vec<ParsedRule>,
    pub untracked: bool,
    pub pre_dnat: bool,
    pub original_selector: String,
}

/// Direction a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Ingress,
    Egress,
}

/// Policy properties that decide which tier list it lands in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyMetadata {
    pub do_not_track: bool,
    pub pre_dnat: bool,
    pub apply_on_forward: bool,
    pub types: Vec<PolicyType>,
}

/// A policy key together with its metadata, in tier order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolKv {
    pub key: PolicyKey,
    #[serde(default)]
    pub value: PolicyMetadata,
}

impl PolKv {
    fn governs(&self, wanted: PolicyType) -> bool {
        // No explicit types means the policy applies both ways.
        self.value.types.is_empty() || self.value.types.contains(&wanted)
    }

    pub fn governs_ingress(&self) -> bool {
        self.governs(PolicyType::Ingress)
    }

    pub fn governs_egress(&self) -> bool {
        self.governs(PolicyType::Egress)
    }
}

/// Policies that apply to an endpoint, grouped by tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierInfo {
    pub name: String,
    #[serde(default)]
    pub default_action: Action,
    #[serde(default)]
    pub ordered_policies: Vec<PolKv>,
}

/// NAT mapping on a workload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNat {
    pub ext_ip: IpAddr,
    pub int_ip: IpAddr,
}

/// Bandwidth and connection limits on a workload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QosControls {
    pub ingress_bandwidth: i64,
    pub egress_bandwidth: i64,
    pub ingress_burst: i64,
    pub egress_burst: i64,
    pub ingress_packet_rate: i64,
    pub egress_packet_rate: i64,
    pub ingress_max_connections: i64,
    pub egress_max_connections: i64,
}

/// A workload (pod/VM) endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadEndpoint {
    pub state: String,
    pub name: String,
    pub mac: Option<String>,
    pub profile_ids: Vec<String>,
    pub ipv4_nets: Vec<Cidr>,
    pub ipv6_nets: Vec<Cidr>,
    pub ipv4_nat: Vec<IpNat>,
    pub ipv6_nat: Vec<IpNat>,
    pub allow_spoofed_source_prefixes: Vec<Cidr>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub qos_controls: Option<QosControls>,
}

/// A host interface endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEndpoint {
    pub name: String,
    pub expected_ipv4_addrs: Vec<IpAddr>,
    pub expected_ipv6_addrs: Vec<IpAddr>,
    pub profile_ids: Vec<String>,
}

/// Endpoint value. Must match the variant of its [`EndpointKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    Workload(WorkloadEndpoint),
    Host(HostEndpoint),
}

/// Local BGP peer data attached to a workload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointBgpPeer {
    pub v3_peer_name: String,
}

/// IPAM pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    pub cidr: Cidr,
    #[serde(default)]
    pub masquerade: bool,
    #[serde(default)]
    pub ipip_mode: String,
    #[serde(default)]
    pub vxlan_mode: String,
}

/// Wireguard state of one node. An empty key means that family is off.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Wireguard {
    pub public_key: String,
    pub interface_ipv4_addr: Option<IpAddr>,
    pub public_key_v6: String,
    pub interface_ipv6_addr: Option<IpAddr>,
}

/// Host addresses, AS number and labels of one node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    #[serde(with = "opt_as_str")]
    pub ip4_addr: Option<IpNet>,
    #[serde(with = "opt_as_str")]
    pub ip6_addr: Option<IpNet>,
    pub asnumber: String,
    pub labels: BTreeMap<String, String>,
}

/// Cluster encapsulation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Encapsulation {
    pub ipip_enabled: bool,
    pub vxlan_enabled: bool,
    pub vxlan_enabled_v6: bool,
}

/// One service CIDR block of the global BGP configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCidrBlock {
    pub cidr: String,
}

/// Global BGP configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BgpConfiguration {
    pub service_cluster_ips: Vec<ServiceCidrBlock>,
    pub service_external_ips: Vec<ServiceCidrBlock>,
    pub service_load_balancer_ips: Vec<ServiceCidrBlock>,
    pub local_workload_peering_ip_v4: String,
    pub local_workload_peering_ip_v6: String,
}
