//! Conversion from calculation-graph values to message payloads.

use std::collections::BTreeMap;

use felix_common::Cidr;

use crate::messages as msg;
use crate::model::{
    Action, BgpConfiguration, EndpointBgpPeer, HostEndpoint, IpNat, ParsedRule, ParsedRules,
    PolKv, PolicyKey, ProfileKey, ServiceCidrBlock, TierInfo, WorkloadEndpoint,
};

/// Label that marks a KubeVirt VM launcher pod.
const VM_WORKLOAD_LABEL: &str = "kubevirt.io";
const VM_WORKLOAD_LABEL_VALUE: &str = "virt-launcher";

/// Converts rules, assigning each a rule ID of `<prefix>-<index>`.
pub fn parsed_rules_to_proto_rules(rules: &[ParsedRule], prefix: &str) -> Vec<msg::Rule> {
    rules
        .iter()
        .enumerate()
        .map(|(idx, rule)| msg::Rule {
            rule_id: format!("{}-{}", prefix, idx),
            action: rule.action.clone(),
            ip_version: rule.ip_version,
            protocol: rule.protocol.clone(),
            src_net: nets_to_strings(&rule.src_nets),
            dst_net: nets_to_strings(&rule.dst_nets),
            src_ports: ports_to_proto(&rule.src_ports),
            dst_ports: ports_to_proto(&rule.dst_ports),
            src_ip_set_ids: rule.src_ip_set_ids.clone(),
            dst_ip_set_ids: rule.dst_ip_set_ids.clone(),
            not_src_ip_set_ids: rule.not_src_ip_set_ids.clone(),
            not_dst_ip_set_ids: rule.not_dst_ip_set_ids.clone(),
            dst_ip_port_set_ids: rule.dst_ip_port_set_ids.clone(),
        })
        .collect()
}

fn ports_to_proto(ports: &[crate::model::PortRange]) -> Vec<msg::PortRange> {
    ports
        .iter()
        .map(|p| msg::PortRange {
            first: p.first,
            last: p.last,
        })
        .collect()
}

pub fn parsed_rules_to_active_policy_update(
    key: &PolicyKey,
    rules: &ParsedRules,
) -> msg::ActivePolicyUpdate {
    msg::ActivePolicyUpdate {
        id: policy_id(key),
        policy: msg::Policy {
            namespace: rules.namespace.clone(),
            inbound_rules: parsed_rules_to_proto_rules(
                &rules.inbound_rules,
                &format!("pol-in-default/{}", key.name),
            ),
            outbound_rules: parsed_rules_to_proto_rules(
                &rules.outbound_rules,
                &format!("pol-out-default/{}", key.name),
            ),
            untracked: rules.untracked,
            pre_dnat: rules.pre_dnat,
            original_selector: rules.original_selector.clone(),
        },
    }
}

pub fn parsed_rules_to_active_profile_update(
    key: &ProfileKey,
    rules: &ParsedRules,
) -> msg::ActiveProfileUpdate {
    msg::ActiveProfileUpdate {
        id: msg::ProfileId {
            name: key.name.clone(),
        },
        profile: msg::Profile {
            inbound_rules: parsed_rules_to_proto_rules(
                &rules.inbound_rules,
                &format!("prof-in-{}", key.name),
            ),
            outbound_rules: parsed_rules_to_proto_rules(
                &rules.outbound_rules,
                &format!("prof-out-{}", key.name),
            ),
        },
    }
}

pub fn policy_id(key: &PolicyKey) -> msg::PolicyId {
    msg::PolicyId {
        tier: key.tier.clone(),
        name: key.name.clone(),
    }
}

/// Tier lists for one endpoint, split by where the policies are enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointTiers {
    pub normal: Vec<msg::TierInfo>,
    pub untracked: Vec<msg::TierInfo>,
    pub pre_dnat: Vec<msg::TierInfo>,
    pub forward: Vec<msg::TierInfo>,
}

fn add_policy_to_tier_info(pol: &PolKv, tier_info: &mut msg::TierInfo, egress_allowed: bool) {
    if pol.governs_ingress() {
        tier_info.ingress_policies.push(pol.key.name.clone());
    }
    if egress_allowed && pol.governs_egress() {
        tier_info.egress_policies.push(pol.key.name.clone());
    }
}

fn empty_tier(name: &str, action: Action) -> msg::TierInfo {
    msg::TierInfo {
        name: name.to_string(),
        default_action: action.as_str().to_string(),
        ..Default::default()
    }
}

fn push_if_nonempty(out: &mut Vec<msg::TierInfo>, tier: msg::TierInfo) {
    if !tier.ingress_policies.is_empty() || !tier.egress_policies.is_empty() {
        out.push(tier);
    }
}

/// Splits tier info into normal, untracked, pre-DNAT and forward lists.
///
/// Untracked and pre-DNAT tiers always use `Pass` as their default action so
/// that normal-tier policy still gets evaluated. Pre-DNAT policy is
/// ingress-only. Tiers that end up with no policies are dropped.
pub fn tier_info_to_proto(filtered_tiers: &[TierInfo]) -> EndpointTiers {
    let mut tiers = EndpointTiers::default();
    for ti in filtered_tiers {
        let mut untracked = empty_tier(&ti.name, Action::Pass);
        let mut pre_dnat = empty_tier(&ti.name, Action::Pass);
        let mut forward = empty_tier(&ti.name, ti.default_action);
        let mut normal = empty_tier(&ti.name, ti.default_action);

        for pol in &ti.ordered_policies {
            if pol.value.do_not_track {
                add_policy_to_tier_info(pol, &mut untracked, true);
            } else if pol.value.pre_dnat {
                add_policy_to_tier_info(pol, &mut pre_dnat, false);
            } else {
                if pol.value.apply_on_forward {
                    add_policy_to_tier_info(pol, &mut forward, true);
                }
                add_policy_to_tier_info(pol, &mut normal, true);
            }
        }

        push_if_nonempty(&mut tiers.untracked, untracked);
        push_if_nonempty(&mut tiers.pre_dnat, pre_dnat);
        push_if_nonempty(&mut tiers.forward, forward);
        push_if_nonempty(&mut tiers.normal, normal);
    }
    tiers
}

/// Returns true for KubeVirt VM workloads.
pub fn is_vm_workload(labels: &BTreeMap<String, String>) -> bool {
    labels
        .get(VM_WORKLOAD_LABEL)
        .is_some_and(|v| v == VM_WORKLOAD_LABEL_VALUE)
}

pub fn workload_endpoint_to_proto(
    ep: &WorkloadEndpoint,
    peer_data: Option<&EndpointBgpPeer>,
    tiers: Vec<msg::TierInfo>,
) -> msg::WorkloadEndpoint {
    let qos_controls = ep.qos_controls.as_ref().map(|q| msg::QosControls {
        ingress_bandwidth: q.ingress_bandwidth,
        egress_bandwidth: q.egress_bandwidth,
        ingress_burst: q.ingress_burst,
        egress_burst: q.egress_burst,
        ingress_packet_rate: q.ingress_packet_rate,
        egress_packet_rate: q.egress_packet_rate,
        ingress_max_connections: q.ingress_max_connections,
        egress_max_connections: q.egress_max_connections,
    });

    // Ingress redirect is skipped for VMs and for ingress bandwidth limits;
    // egress redirect for egress bandwidth limits.
    let ingress_bw = ep.qos_controls.as_ref().is_some_and(|q| q.ingress_bandwidth > 0);
    let egress_bw = ep.qos_controls.as_ref().is_some_and(|q| q.egress_bandwidth > 0);
    let mut skip_redir = None;
    if is_vm_workload(&ep.labels) || ingress_bw {
        skip_redir = Some(msg::SkipRedir {
            ingress: true,
            egress: false,
        });
    }
    if egress_bw {
        skip_redir.get_or_insert_with(msg::SkipRedir::default).egress = true;
    }

    msg::WorkloadEndpoint {
        state: ep.state.clone(),
        name: ep.name.clone(),
        mac: ep.mac.clone().unwrap_or_default(),
        profile_ids: ep.profile_ids.clone(),
        ipv4_nets: nets_to_strings(&ep.ipv4_nets),
        ipv6_nets: nets_to_strings(&ep.ipv6_nets),
        tiers,
        ipv4_nat: nats_to_proto(&ep.ipv4_nat),
        ipv6_nat: nats_to_proto(&ep.ipv6_nat),
        allow_spoofed_source_prefixes: nets_to_strings(&ep.allow_spoofed_source_prefixes),
        annotations: ep.annotations.clone(),
        qos_controls,
        local_bgp_peer: peer_data.map(|p| msg::LocalBgpPeer {
            bgp_peer_name: p.v3_peer_name.clone(),
        }),
        skip_redir,
    }
}

pub fn host_endpoint_to_proto(ep: &HostEndpoint, tiers: EndpointTiers) -> msg::HostEndpoint {
    msg::HostEndpoint {
        name: ep.name.clone(),
        expected_ipv4_addrs: ep.expected_ipv4_addrs.iter().map(|a| a.to_string()).collect(),
        expected_ipv6_addrs: ep.expected_ipv6_addrs.iter().map(|a| a.to_string()).collect(),
        profile_ids: ep.profile_ids.clone(),
        tiers: tiers.normal,
        untracked_tiers: tiers.untracked,
        pre_dnat_tiers: tiers.pre_dnat,
        forward_tiers: tiers.forward,
    }
}

/// IP pool IDs are the CIDR with `/` replaced by `-`.
pub fn cidr_to_ip_pool_id(cidr: &Cidr) -> String {
    cidr.to_string().replacen('/', "-", 1)
}

fn non_empty_cidrs(blocks: &[ServiceCidrBlock]) -> Vec<String> {
    blocks
        .iter()
        .filter(|b| !b.cidr.is_empty())
        .map(|b| b.cidr.clone())
        .collect()
}

/// Builds the BGP config message. `None` yields an empty (reset) update.
pub fn bgp_config_to_update(cfg: Option<&BgpConfiguration>) -> msg::GlobalBgpConfigUpdate {
    let Some(cfg) = cfg else {
        return msg::GlobalBgpConfigUpdate::default();
    };
    msg::GlobalBgpConfigUpdate {
        service_cluster_cidrs: non_empty_cidrs(&cfg.service_cluster_ips),
        service_external_cidrs: non_empty_cidrs(&cfg.service_external_ips),
        service_loadbalancer_cidrs: non_empty_cidrs(&cfg.service_load_balancer_ips),
        local_workload_peering_ip_v4: cfg.local_workload_peering_ip_v4.clone(),
        local_workload_peering_ip_v6: cfg.local_workload_peering_ip_v6.clone(),
    }
}

fn nets_to_strings(nets: &[Cidr]) -> Vec<String> {
    nets.iter().map(|n| n.to_string()).collect()
}

fn nats_to_proto(nats: &[IpNat]) -> Vec<msg::NatInfo> {
    nats.iter()
        .map(|nat| msg::NatInfo {
            ext_ip: nat.ext_ip.to_string(),
            int_ip: nat.int_ip.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PolicyMetadata, PolicyType, QosControls};
    use pretty_assertions::assert_eq;

    fn pol(name: &str, value: PolicyMetadata) -> PolKv {
        PolKv {
            key: PolicyKey::new("default", name),
            value,
        }
    }

    #[test]
    fn test_policy_rule_ids() {
        let rules = ParsedRules {
            inbound_rules: vec![ParsedRule::default(), ParsedRule::default()],
            outbound_rules: vec![ParsedRule::default()],
            ..Default::default()
        };
        let update = parsed_rules_to_active_policy_update(&PolicyKey::new("default", "p1"), &rules);

        let ids: Vec<_> = update.policy.inbound_rules.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["pol-in-default/p1-0", "pol-in-default/p1-1"]);
        assert_eq!(update.policy.outbound_rules[0].rule_id, "pol-out-default/p1-0");

        let update = parsed_rules_to_active_profile_update(&ProfileKey::new("kns.default"), &rules);
        assert_eq!(update.profile.inbound_rules[1].rule_id, "prof-in-kns.default-1");
        assert_eq!(update.profile.outbound_rules[0].rule_id, "prof-out-kns.default-0");
    }

    #[test]
    fn test_tier_split() {
        let tiers = vec![TierInfo {
            name: "default".to_string(),
            default_action: Action::Deny,
            ordered_policies: vec![
                pol(
                    "untracked",
                    PolicyMetadata {
                        do_not_track: true,
                        ..Default::default()
                    },
                ),
                pol(
                    "prednat",
                    PolicyMetadata {
                        pre_dnat: true,
                        ..Default::default()
                    },
                ),
                pol(
                    "fwd",
                    PolicyMetadata {
                        apply_on_forward: true,
                        types: vec![PolicyType::Egress],
                        ..Default::default()
                    },
                ),
                pol("normal", PolicyMetadata::default()),
            ],
        }];

        let split = tier_info_to_proto(&tiers);

        assert_eq!(split.untracked.len(), 1);
        assert_eq!(split.untracked[0].default_action, "Pass");
        assert_eq!(split.untracked[0].ingress_policies, vec!["untracked"]);
        assert_eq!(split.untracked[0].egress_policies, vec!["untracked"]);

        assert_eq!(split.pre_dnat[0].default_action, "Pass");
        assert_eq!(split.pre_dnat[0].ingress_policies, vec!["prednat"]);
        assert!(split.pre_dnat[0].egress_policies.is_empty());

        assert_eq!(split.forward[0].default_action, "Deny");
        assert!(split.forward[0].ingress_policies.is_empty());
        assert_eq!(split.forward[0].egress_policies, vec!["fwd"]);

        assert_eq!(split.normal[0].ingress_policies, vec!["normal"]);
        assert_eq!(split.normal[0].egress_policies, vec!["fwd", "normal"]);
    }

    #[test]
    fn test_empty_tiers_dropped() {
        let tiers = vec![TierInfo {
            name: "empty".to_string(),
            default_action: Action::Deny,
            ordered_policies: vec![],
        }];
        assert_eq!(tier_info_to_proto(&tiers), EndpointTiers::default());
    }

    #[test]
    fn test_skip_redir() {
        let mut ep = WorkloadEndpoint::default();
        assert_eq!(workload_endpoint_to_proto(&ep, None, vec![]).skip_redir, None);

        ep.labels
            .insert("kubevirt.io".to_string(), "virt-launcher".to_string());
        assert_eq!(
            workload_endpoint_to_proto(&ep, None, vec![]).skip_redir,
            Some(msg::SkipRedir {
                ingress: true,
                egress: false
            })
        );

        ep.labels.clear();
        ep.qos_controls = Some(QosControls {
            egress_bandwidth: 1000,
            ..Default::default()
        });
        assert_eq!(
            workload_endpoint_to_proto(&ep, None, vec![]).skip_redir,
            Some(msg::SkipRedir {
                ingress: false,
                egress: true
            })
        );
    }

    #[test]
    fn test_ip_pool_id() {
        let cidr: Cidr = "10.65.0.0/16".parse().unwrap();
        assert_eq!(cidr_to_ip_pool_id(&cidr), "10.65.0.0-16");
    }

    #[test]
    fn test_bgp_config_skips_empty_cidrs() {
        let cfg = BgpConfiguration {
            service_cluster_ips: vec![
                ServiceCidrBlock {
                    cidr: "10.96.0.0/12".to_string(),
                },
                ServiceCidrBlock { cidr: String::new() },
            ],
            local_workload_peering_ip_v4: "169.254.0.179".to_string(),
            ..Default::default()
        };
        let update = bgp_config_to_update(Some(&cfg));
        assert_eq!(update.service_cluster_cidrs, vec!["10.96.0.0/12"]);
        assert!(update.service_external_cidrs.is_empty());
        assert_eq!(update.local_workload_peering_ip_v4, "169.254.0.179");

        assert_eq!(bgp_config_to_update(None), msg::GlobalBgpConfigUpdate::default());
    }
}
