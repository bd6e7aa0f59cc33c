//! End-to-end ordering tests for the event sequencer.

use felix_calc::messages::{self as msg, Message};
use felix_calc::model::{
    Encapsulation, Endpoint, EndpointKey, HostInfo, IpPool, NamespaceId, ParsedRule, ParsedRules,
    PolicyKey, ProfileKey, ServiceAccountId, ServiceId, TierInfo, WorkloadEndpoint,
};
use felix_calc::{decoupler, EventSequencer, RawConfig};
use felix_common::{IpSetMember, IpSetType};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn kinds(msgs: &[Message]) -> Vec<&'static str> {
    msgs.iter().map(Message::kind).collect()
}

fn drain(seq: &mut EventSequencer<Vec<Message>>) -> Vec<Message> {
    seq.flush().unwrap();
    std::mem::take(seq.sink_mut())
}

fn member(s: &str) -> IpSetMember {
    s.parse().unwrap()
}

fn policy_using(set_id: &str) -> ParsedRules {
    ParsedRules {
        namespace: "default".to_string(),
        inbound_rules: vec![ParsedRule {
            action: "allow".to_string(),
            src_ip_set_ids: vec![set_id.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn pod(key: &str) -> (EndpointKey, Endpoint) {
    (
        EndpointKey::workload("k8s", format!("default/{key}"), "eth0"),
        Endpoint::Workload(WorkloadEndpoint {
            name: format!("cali{key}"),
            profile_ids: vec!["kns.default".to_string()],
            ipv4_nets: vec!["10.65.0.2/32".parse().unwrap()],
            ..Default::default()
        }),
    )
}

fn tiers() -> Vec<TierInfo> {
    vec![TierInfo {
        name: "default".to_string(),
        default_action: Default::default(),
        ordered_policies: vec![],
    }]
}

fn route(dst: &str, node: &str) -> msg::RouteUpdate {
    msg::RouteUpdate {
        dst: dst.to_string(),
        dst_node_name: node.to_string(),
        ..Default::default()
    }
}

fn vtep(node: &str) -> msg::VxlanTunnelEndpointUpdate {
    msg::VxlanTunnelEndpointUpdate {
        node: node.to_string(),
        mac: "66:00:00:00:00:01".to_string(),
        ipv4_addr: "10.65.1.0".to_string(),
        parent_device_ip: "192.168.0.2".to_string(),
        ..Default::default()
    }
}

#[test]
fn test_additions_flush_in_dependency_order() {
    let mut seq = EventSequencer::new(Vec::new());

    // Reported in reverse dependency order on purpose.
    seq.on_service_update(msg::ServiceUpdate {
        name: "web".to_string(),
        namespace: "default".to_string(),
        ..Default::default()
    })
    .unwrap();
    seq.on_global_bgp_config_update(None).unwrap();
    seq.on_encap_update(Encapsulation {
        vxlan_enabled: true,
        ..Default::default()
    })
    .unwrap();
    seq.on_ip_pool_update(
        "10.65.0.0/16".parse().unwrap(),
        IpPool {
            cidr: "10.65.0.0/16".parse().unwrap(),
            masquerade: true,
            ipip_mode: String::new(),
            vxlan_mode: "Always".to_string(),
        },
    )
    .unwrap();
    seq.on_host_metadata_update("node-1", HostInfo::default()).unwrap();
    seq.on_host_ip_update("node-1", Some("192.168.0.1".parse().unwrap()))
        .unwrap();
    seq.on_route_update(route("10.65.1.0/26", "node-2")).unwrap();
    seq.on_vtep_update(vtep("node-2")).unwrap();
    seq.on_namespace_update(msg::NamespaceUpdate {
        id: NamespaceId {
            name: "default".to_string(),
        },
        labels: Default::default(),
    })
    .unwrap();
    seq.on_service_account_update(msg::ServiceAccountUpdate {
        id: ServiceAccountId {
            name: "sa".to_string(),
            namespace: "default".to_string(),
        },
        labels: Default::default(),
    })
    .unwrap();
    let (key, ep) = pod("pod-1");
    seq.on_endpoint_tier_update(key, Some(ep), None, tiers()).unwrap();
    seq.on_profile_active(ProfileKey::new("kns.default"), ParsedRules::default())
        .unwrap();
    seq.on_policy_active(PolicyKey::new("default", "allow-web"), policy_using("s:web"))
        .unwrap();
    seq.on_ip_set_added("s:web", IpSetType::Net).unwrap();
    seq.on_ip_set_member_added("s:web", member("10.65.0.2/32")).unwrap();
    seq.on_config_update(RawConfig::new(), [("BPFEnabled".to_string(), "true".to_string())].into())
        .unwrap();
    seq.on_datastore_not_ready().unwrap();

    assert_eq!(
        kinds(&drain(&mut seq)),
        vec![
            "DatastoreNotReady",
            "ConfigUpdate",
            "IpSetUpdate",
            "ActivePolicyUpdate",
            "ActiveProfileUpdate",
            "WorkloadEndpointUpdate",
            "ServiceAccountUpdate",
            "NamespaceUpdate",
            "VxlanTunnelEndpointUpdate",
            "RouteUpdate",
            "HostMetadataUpdate",
            "HostMetadataV4V6Update",
            "IpamPoolUpdate",
            "Encapsulation",
            "GlobalBgpConfigUpdate",
            "ServiceUpdate",
        ]
    );
}

#[test]
fn test_policy_removed_before_its_ip_set() {
    let mut seq = EventSequencer::new(Vec::new());
    let policy = PolicyKey::new("default", "allow-web");
    seq.on_ip_set_added("s:web", IpSetType::Net).unwrap();
    seq.on_policy_active(policy.clone(), policy_using("s:web")).unwrap();
    drain(&mut seq);

    seq.on_ip_set_removed("s:web").unwrap();
    seq.on_policy_inactive(&policy).unwrap();

    assert_eq!(
        drain(&mut seq),
        vec![
            Message::ActivePolicyRemove(msg::ActivePolicyRemove {
                id: msg::PolicyId {
                    tier: "default".to_string(),
                    name: "allow-web".to_string(),
                },
            }),
            Message::IpSetRemove(msg::IpSetRemove {
                id: "s:web".to_string(),
            }),
        ]
    );
}

#[test]
fn test_removals_flush_in_reverse_dependency_order() {
    let mut seq = EventSequencer::new(Vec::new());
    let policy = PolicyKey::new("default", "allow-web");
    let profile = ProfileKey::new("kns.default");
    let (ep_key, ep) = pod("pod-1");
    let sa = ServiceAccountId {
        name: "sa".to_string(),
        namespace: "default".to_string(),
    };
    let svc = ServiceId {
        name: "web".to_string(),
        namespace: "default".to_string(),
    };

    seq.on_ip_set_added("s:web", IpSetType::Net).unwrap();
    seq.on_policy_active(policy.clone(), policy_using("s:web")).unwrap();
    seq.on_profile_active(profile.clone(), ParsedRules::default()).unwrap();
    seq.on_endpoint_tier_update(ep_key.clone(), Some(ep), None, tiers())
        .unwrap();
    seq.on_service_account_update(msg::ServiceAccountUpdate {
        id: sa.clone(),
        labels: Default::default(),
    })
    .unwrap();
    seq.on_route_update(route("10.65.1.0/26", "node-2")).unwrap();
    seq.on_vtep_update(vtep("node-2")).unwrap();
    seq.on_host_ipv6_update("node-2", Some("fd00::2".parse().unwrap()))
        .unwrap();
    seq.on_service_update(msg::ServiceUpdate {
        name: svc.name.clone(),
        namespace: svc.namespace.clone(),
        ..Default::default()
    })
    .unwrap();
    drain(&mut seq);

    seq.on_service_remove(&svc).unwrap();
    seq.on_host_ipv6_remove("node-2").unwrap();
    seq.on_vtep_remove("node-2").unwrap();
    seq.on_route_remove("10.65.1.0/26").unwrap();
    seq.on_service_account_remove(&sa).unwrap();
    seq.on_ip_set_removed("s:web").unwrap();
    seq.on_policy_inactive(&policy).unwrap();
    seq.on_profile_inactive(&profile).unwrap();
    seq.on_endpoint_tier_update(ep_key, None, None, vec![]).unwrap();

    assert_eq!(
        kinds(&drain(&mut seq)),
        vec![
            "WorkloadEndpointRemove",
            "ActiveProfileRemove",
            "ActivePolicyRemove",
            "IpSetRemove",
            "ServiceAccountRemove",
            "RouteRemove",
            "VxlanTunnelEndpointRemove",
            "HostMetadataV6Remove",
            "ServiceRemove",
        ]
    );
}

fn pool(cidr: &str) -> IpPool {
    IpPool {
        cidr: cidr.parse().unwrap(),
        masquerade: true,
        ipip_mode: String::new(),
        vxlan_mode: "Always".to_string(),
    }
}

#[test]
fn test_removals_precede_additions_within_kind() {
    let mut seq = EventSequencer::new(Vec::new());
    let sa = |name: &str| ServiceAccountId {
        name: name.to_string(),
        namespace: "default".to_string(),
    };
    let ns = |name: &str| NamespaceId {
        name: name.to_string(),
    };
    let svc = |name: &str| msg::ServiceUpdate {
        name: name.to_string(),
        namespace: "default".to_string(),
        ..Default::default()
    };

    seq.on_service_account_update(msg::ServiceAccountUpdate {
        id: sa("sa-a"),
        labels: Default::default(),
    })
    .unwrap();
    seq.on_namespace_update(msg::NamespaceUpdate {
        id: ns("ns-a"),
        labels: Default::default(),
    })
    .unwrap();
    seq.on_host_ip_update("node-a", Some("192.168.0.1".parse().unwrap()))
        .unwrap();
    seq.on_host_metadata_update("node-a", HostInfo::default()).unwrap();
    seq.on_ip_pool_update("10.65.0.0/16".parse().unwrap(), pool("10.65.0.0/16"))
        .unwrap();
    seq.on_service_update(svc("svc-a")).unwrap();
    drain(&mut seq);

    // New keys are reported before the old ones go away.
    seq.on_service_update(svc("svc-b")).unwrap();
    seq.on_ip_pool_update("10.66.0.0/16".parse().unwrap(), pool("10.66.0.0/16"))
        .unwrap();
    seq.on_host_metadata_update("node-b", HostInfo::default()).unwrap();
    seq.on_host_ip_update("node-b", Some("192.168.0.2".parse().unwrap()))
        .unwrap();
    seq.on_namespace_update(msg::NamespaceUpdate {
        id: ns("ns-b"),
        labels: Default::default(),
    })
    .unwrap();
    seq.on_service_account_update(msg::ServiceAccountUpdate {
        id: sa("sa-b"),
        labels: Default::default(),
    })
    .unwrap();
    seq.on_service_remove(&ServiceId {
        name: "svc-a".to_string(),
        namespace: "default".to_string(),
    })
    .unwrap();
    seq.on_ip_pool_remove(&"10.65.0.0/16".parse().unwrap()).unwrap();
    seq.on_host_metadata_remove("node-a").unwrap();
    seq.on_host_ip_remove("node-a").unwrap();
    seq.on_namespace_remove(&ns("ns-a")).unwrap();
    seq.on_service_account_remove(&sa("sa-a")).unwrap();

    let msgs = drain(&mut seq);
    assert_eq!(
        kinds(&msgs),
        vec![
            "ServiceAccountRemove",
            "ServiceAccountUpdate",
            "NamespaceRemove",
            "NamespaceUpdate",
            "HostMetadataRemove",
            "HostMetadataUpdate",
            "HostMetadataV4V6Remove",
            "HostMetadataV4V6Update",
            "IpamPoolRemove",
            "IpamPoolUpdate",
            "ServiceRemove",
            "ServiceUpdate",
        ]
    );
    assert_eq!(
        msgs[0],
        Message::ServiceAccountRemove(msg::ServiceAccountRemove { id: sa("sa-a") })
    );
    assert_eq!(
        msgs[8],
        Message::IpamPoolRemove(msg::IpamPoolRemove {
            id: "10.65.0.0-16".to_string(),
        })
    );
}

#[test]
fn test_route_moves_to_new_vtep() {
    let mut seq = EventSequencer::new(Vec::new());
    seq.on_vtep_update(vtep("node-2")).unwrap();
    seq.on_route_update(route("10.65.1.0/26", "node-2")).unwrap();
    drain(&mut seq);

    // Block reassigned to node-3: the old route and VTEP go before the new ones
    // appear.
    seq.on_route_remove("10.65.1.0/26").unwrap();
    seq.on_vtep_remove("node-2").unwrap();
    seq.on_vtep_update(vtep("node-3")).unwrap();
    seq.on_route_update(route("10.65.2.0/26", "node-3")).unwrap();

    assert_eq!(
        kinds(&drain(&mut seq)),
        vec![
            "RouteRemove",
            "VxlanTunnelEndpointRemove",
            "VxlanTunnelEndpointUpdate",
            "RouteUpdate",
        ]
    );
}

#[test]
fn test_resent_update_after_remove() {
    let mut seq = EventSequencer::new(Vec::new());
    let sa = ServiceAccountId {
        name: "sa".to_string(),
        namespace: "default".to_string(),
    };
    let update = msg::ServiceAccountUpdate {
        id: sa.clone(),
        labels: [("team".to_string(), "a".to_string())].into(),
    };
    seq.on_service_account_update(update.clone()).unwrap();
    drain(&mut seq);

    // Removal then re-add within one interval collapses to the update.
    seq.on_service_account_remove(&sa).unwrap();
    seq.on_service_account_update(update.clone()).unwrap();
    assert_eq!(
        drain(&mut seq),
        vec![Message::ServiceAccountUpdate(update)]
    );
}

#[tokio::test]
async fn test_flush_through_decoupler_preserves_order() {
    let (sink, decoupler) = decoupler::channel();
    let mut seq = EventSequencer::new(sink);

    let consumer = tokio::spawn(async move {
        let mut out: Vec<Message> = Vec::new();
        decoupler.send_to(&mut out, CancellationToken::new()).await;
        out
    });

    seq.on_ip_set_added("s:a", IpSetType::Ip).unwrap();
    seq.on_policy_active(PolicyKey::new("default", "p"), policy_using("s:a"))
        .unwrap();
    seq.flush().unwrap();
    seq.on_policy_inactive(&PolicyKey::new("default", "p")).unwrap();
    seq.on_ip_set_removed("s:a").unwrap();
    seq.flush().unwrap();
    drop(seq);

    let out = consumer.await.unwrap();
    assert_eq!(
        kinds(&out),
        vec![
            "IpSetUpdate",
            "ActivePolicyUpdate",
            "ActivePolicyRemove",
            "IpSetRemove",
        ]
    );
}
