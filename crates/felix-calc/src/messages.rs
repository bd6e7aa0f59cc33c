//! Messages emitted by the sequencer towards the dataplane driver.
//!
//! [`Message`] is a closed set; the [`Sink`](crate::Sink) receives exactly one
//! variant per call. Payload maps are ordered so that the serialized form is
//! deterministic.

use std::collections::BTreeMap;

use felix_common::IpSetType;
use serde::{Deserialize, Serialize};

use crate::model::{NamespaceId, ServiceAccountId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSetUpdate {
    pub id: String,
    pub members: Vec<String>,
    pub set_type: IpSetType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSetDeltaUpdate {
    pub id: String,
    pub added_members: Vec<String>,
    pub removed_members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSetRemove {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyId {
    pub tier: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

/// A rule as sent downstream, with a stable rule ID.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub action: String,
    pub ip_version: Option<u8>,
    pub protocol: Option<String>,
    pub src_net: Vec<String>,
    pub dst_net: Vec<String>,
    pub src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
    pub src_ip_set_ids: Vec<String>,
    pub dst_ip_set_ids: Vec<String>,
    pub not_src_ip_set_ids: Vec<String>,
    pub not_dst_ip_set_ids: Vec<String>,
    pub dst_ip_port_set_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub namespace: String,
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
    pub untracked: bool,
    pub pre_dnat: bool,
    pub original_selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePolicyUpdate {
    pub id: PolicyId,
    pub policy: Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePolicyRemove {
    pub id: PolicyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileId {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProfileUpdate {
    pub id: ProfileId,
    pub profile: Profile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProfileRemove {
    pub id: ProfileId,
}

/// Per-tier policy lists attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierInfo {
    pub name: String,
    pub default_action: String,
    pub ingress_policies: Vec<String>,
    pub egress_policies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatInfo {
    pub ext_ip: String,
    pub int_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBgpPeer {
    pub bgp_peer_name: String,
}

/// Which BPF redirect paths to skip for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SkipRedir {
    pub ingress: bool,
    pub egress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadEndpoint {
    pub state: String,
    pub name: String,
    pub mac: String,
    pub profile_ids: Vec<String>,
    pub ipv4_nets: Vec<String>,
    pub ipv6_nets: Vec<String>,
    pub tiers: Vec<TierInfo>,
    pub ipv4_nat: Vec<NatInfo>,
    pub ipv6_nat: Vec<NatInfo>,
    pub allow_spoofed_source_prefixes: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub qos_controls: Option<QosControls>,
    pub local_bgp_peer: Option<LocalBgpPeer>,
    pub skip_redir: Option<SkipRedir>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpointId {
    pub orchestrator_id: String,
    pub workload_id: String,
    pub endpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpointUpdate {
    pub id: WorkloadEndpointId,
    pub endpoint: WorkloadEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpointRemove {
    pub id: WorkloadEndpointId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub name: String,
    pub expected_ipv4_addrs: Vec<String>,
    pub expected_ipv6_addrs: Vec<String>,
    pub profile_ids: Vec<String>,
    pub tiers: Vec<TierInfo>,
    pub untracked_tiers: Vec<TierInfo>,
    pub pre_dnat_tiers: Vec<TierInfo>,
    pub forward_tiers: Vec<TierInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpointId {
    pub endpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpointUpdate {
    pub id: HostEndpointId,
    pub endpoint: HostEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpointRemove {
    pub id: HostEndpointId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadataUpdate {
    pub hostname: String,
    pub ipv4_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadataV6Update {
    pub hostname: String,
    pub ipv6_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadataV4V6Update {
    pub hostname: String,
    pub ipv4_addr: String,
    pub ipv6_addr: String,
    pub asnumber: String,
    pub labels: BTreeMap<String, String>,
}

/// Removal keyed only by hostname (host IP, IPv6, metadata and wireguard).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameRemove {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPool {
    pub cidr: String,
    pub masquerade: bool,
    pub ipip_mode: String,
    pub vxlan_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPoolUpdate {
    pub id: String,
    pub pool: IpamPool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPoolRemove {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encapsulation {
    pub ipip_enabled: bool,
    pub vxlan_enabled: bool,
    pub vxlan_enabled_v6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardEndpointUpdate {
    pub hostname: String,
    pub public_key: String,
    pub interface_ipv4_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardEndpointV6Update {
    pub hostname: String,
    pub public_key_v6: String,
    pub interface_ipv6_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GlobalBgpConfigUpdate {
    pub service_cluster_cidrs: Vec<String>,
    pub service_external_cidrs: Vec<String>,
    pub service_loadbalancer_cidrs: Vec<String>,
    pub local_workload_peering_ip_v4: String,
    pub local_workload_peering_ip_v6: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VxlanTunnelEndpointUpdate {
    pub node: String,
    pub mac: String,
    pub ipv4_addr: String,
    pub parent_device_ip: String,
    pub mac_v6: String,
    pub ipv6_addr: String,
    pub parent_device_ipv6: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanTunnelEndpointRemove {
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteUpdate {
    pub dst: String,
    pub route_type: String,
    pub ip_pool_type: String,
    pub dst_node_name: String,
    pub dst_node_ip: String,
    pub nat_outgoing: bool,
    pub local_workload: bool,
    pub tunnel_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRemove {
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountUpdate {
    pub id: ServiceAccountId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountRemove {
    pub id: ServiceAccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceUpdate {
    pub id: NamespaceId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRemove {
    pub id: NamespaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePort {
    pub protocol: String,
    pub port: u16,
    pub node_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceUpdate {
    pub name: String,
    pub namespace: String,
    pub service_type: String,
    pub cluster_ips: Vec<String>,
    pub external_ips: Vec<String>,
    pub load_balancer_ip: String,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRemove {
    pub name: String,
    pub namespace: String,
}

/// One message for the dataplane driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    DatastoreNotReady,
    ConfigUpdate(ConfigUpdate),

    IpSetUpdate(IpSetUpdate),
    IpSetDeltaUpdate(IpSetDeltaUpdate),
    IpSetRemove(IpSetRemove),

    ActivePolicyUpdate(ActivePolicyUpdate),
    ActivePolicyRemove(ActivePolicyRemove),
    ActiveProfileUpdate(ActiveProfileUpdate),
    ActiveProfileRemove(ActiveProfileRemove),

    WorkloadEndpointUpdate(WorkloadEndpointUpdate),
    WorkloadEndpointRemove(WorkloadEndpointRemove),
    HostEndpointUpdate(HostEndpointUpdate),
    HostEndpointRemove(HostEndpointRemove),

    HostMetadataUpdate(HostMetadataUpdate),
    HostMetadataRemove(HostnameRemove),
    HostMetadataV6Update(HostMetadataV6Update),
    HostMetadataV6Remove(HostnameRemove),
    HostMetadataV4V6Update(HostMetadataV4V6Update),
    HostMetadataV4V6Remove(HostnameRemove),

    IpamPoolUpdate(IpamPoolUpdate),
    IpamPoolRemove(IpamPoolRemove),
    Encapsulation(Encapsulation),

    WireguardEndpointUpdate(WireguardEndpointUpdate),
    WireguardEndpointRemove(HostnameRemove),
    WireguardEndpointV6Update(WireguardEndpointV6Update),
    WireguardEndpointV6Remove(HostnameRemove),

    GlobalBgpConfigUpdate(GlobalBgpConfigUpdate),

    VxlanTunnelEndpointUpdate(VxlanTunnelEndpointUpdate),
    VxlanTunnelEndpointRemove(VxlanTunnelEndpointRemove),
    RouteUpdate(RouteUpdate),
    RouteRemove(RouteRemove),

    ServiceAccountUpdate(ServiceAccountUpdate),
    ServiceAccountRemove(ServiceAccountRemove),
    NamespaceUpdate(NamespaceUpdate),
    NamespaceRemove(NamespaceRemove),
    ServiceUpdate(ServiceUpdate),
    ServiceRemove(ServiceRemove),
}

impl Message {
    /// Returns the variant name, used in logs and for per-kind filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::DatastoreNotReady => "DatastoreNotReady",
            Message::ConfigUpdate(_) => "ConfigUpdate",
            Message::IpSetUpdate(_) => "IpSetUpdate",
            Message::IpSetDeltaUpdate(_) => "IpSetDeltaUpdate",
            Message::IpSetRemove(_) => "IpSetRemove",
            Message::ActivePolicyUpdate(_) => "ActivePolicyUpdate",
            Message::ActivePolicyRemove(_) => "ActivePolicyRemove",
            Message::ActiveProfileUpdate(_) => "ActiveProfileUpdate",
            Message::ActiveProfileRemove(_) => "ActiveProfileRemove",
            Message::WorkloadEndpointUpdate(_) => "WorkloadEndpointUpdate",
            Message::WorkloadEndpointRemove(_) => "WorkloadEndpointRemove",
            Message::HostEndpointUpdate(_) => "HostEndpointUpdate",
            Message::HostEndpointRemove(_) => "HostEndpointRemove",
            Message::HostMetadataUpdate(_) => "HostMetadataUpdate",
            Message::HostMetadataRemove(_) => "HostMetadataRemove",
            Message::HostMetadataV6Update(_) => "HostMetadataV6Update",
            Message::HostMetadataV6Remove(_) => "HostMetadataV6Remove",
            Message::HostMetadataV4V6Update(_) => "HostMetadataV4V6Update",
            Message::HostMetadataV4V6Remove(_) => "HostMetadataV4V6Remove",
            Message::IpamPoolUpdate(_) => "IpamPoolUpdate",
            Message::IpamPoolRemove(_) => "IpamPoolRemove",
            Message::Encapsulation(_) => "Encapsulation",
            Message::WireguardEndpointUpdate(_) => "WireguardEndpointUpdate",
            Message::WireguardEndpointRemove(_) => "WireguardEndpointRemove",
            Message::WireguardEndpointV6Update(_) => "WireguardEndpointV6Update",
            Message::WireguardEndpointV6Remove(_) => "WireguardEndpointV6Remove",
            Message::GlobalBgpConfigUpdate(_) => "GlobalBgpConfigUpdate",
            Message::VxlanTunnelEndpointUpdate(_) => "VxlanTunnelEndpointUpdate",
            Message::VxlanTunnelEndpointRemove(_) => "VxlanTunnelEndpointRemove",
            Message::RouteUpdate(_) => "RouteUpdate",
            Message::RouteRemove(_) => "RouteRemove",
            Message::ServiceAccountUpdate(_) => "ServiceAccountUpdate",
            Message::ServiceAccountRemove(_) => "ServiceAccountRemove",
            Message::NamespaceUpdate(_) => "NamespaceUpdate",
            Message::NamespaceRemove(_) => "NamespaceRemove",
            Message::ServiceUpdate(_) => "ServiceUpdate",
            Message::ServiceRemove(_) => "ServiceRemove",
        }
    }

    /// Serializes the message as one line of JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_is_tagged() {
        let msg = Message::IpSetRemove(IpSetRemove {
            id: "s:abc".to_string(),
        });
        assert_eq!(msg.kind(), "IpSetRemove");
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"IpSetRemove","id":"s:abc"}"#);

        let msg = Message::DatastoreNotReady;
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"DatastoreNotReady"}"#);
    }

    #[test]
    fn test_message_parse() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"RouteRemove","dst":"10.0.0.0/26"}"#).unwrap();
        assert_eq!(
            msg,
            Message::RouteRemove(RouteRemove {
                dst: "10.0.0.0/26".to_string()
            })
        );
    }
}
