//! End-to-end scenarios for the FIB manager.
//!
//! Every test builds a three-switch fabric on the in-memory collaborators
//! and drives it either through the engine or through the daemon.

use overlay_fibmgr::flow::{fib_flow_ref, Action, Bucket, GroupKind, FIB_TABLE};
use overlay_fibmgr::southbound::memory::{
    MemoryFlowProgrammer, MemoryIdManager, MemoryRoutingStore, StaticEgressResolver,
};
use overlay_fibmgr::southbound::RoutingStore;
use overlay_fibmgr::vpn::{
    ExtraRoute, InterVpnLink, InterVpnLinkState, LinkEndpoint, PrefixBinding, RouteOrigin,
    SwitchState, VpnInstance, VrfEntry,
};
use overlay_fibmgr::{
    FibConfig, FibDaemon, FibError, FibManager, Southbound, TunnelDestination, TunnelKind,
};
use overlay_types::{IpPrefix, SwitchId};
use pretty_assertions::assert_eq;
use std::net::IpAddr;
use std::sync::Arc;

fn s(id: u64) -> SwitchId {
    SwitchId::new(id)
}

fn ip(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

fn prefix(p: &str) -> IpPrefix {
    p.parse().unwrap()
}

fn endpoint(id: u64) -> IpAddr {
    ip(&format!("192.0.2.{}", id))
}

fn test_config() -> FibConfig {
    FibConfig {
        job_retry_backoff_ms: 1,
        bgp_batch_interval_ms: 10,
        label_pool: "labels".to_string(),
        group_pool: "groups".to_string(),
        ..FibConfig::default()
    }
}

/// `vpnA` (id 100, rd `A1`) on switches 1 to 3 with a full VXLAN mesh.
struct Fabric {
    store: Arc<MemoryRoutingStore>,
    flows: Arc<MemoryFlowProgrammer>,
    ids: Arc<MemoryIdManager>,
    egress: Arc<StaticEgressResolver>,
}

impl Fabric {
    fn new() -> Self {
        let fabric = Self {
            store: Arc::new(MemoryRoutingStore::new()),
            flows: Arc::new(MemoryFlowProgrammer::new()),
            ids: Arc::new(
                MemoryIdManager::new()
                    .with_pool("labels", 8000..=8999)
                    .with_pool("groups", 150_000..=150_999),
            ),
            egress: Arc::new(StaticEgressResolver::new()),
        };
        fabric.store.put_vpn_instance(
            VpnInstance::new(100, "vpnA", "A1")
                .with_switch(s(1), SwitchState::Active)
                .with_switch(s(2), SwitchState::Active)
                .with_switch(s(3), SwitchState::Active),
        );
        for src in 1..=3 {
            for dst in (1..=3).filter(|dst| *dst != src) {
                let name = format!("tun{}-{}", src, dst);
                fabric.egress.add_tunnel(
                    s(src),
                    TunnelDestination::Switch(s(dst)),
                    name.clone(),
                    TunnelKind::Vxlan,
                );
                fabric.egress.add_tunnel(
                    s(src),
                    TunnelDestination::Ip(endpoint(dst)),
                    name,
                    TunnelKind::Vxlan,
                );
            }
        }
        fabric
    }

    fn southbound(&self) -> Southbound {
        Southbound {
            store: self.store.clone(),
            flows: self.flows.clone(),
            ids: self.ids.clone(),
            egress: self.egress.clone(),
        }
    }

    fn manager(&self) -> FibManager {
        FibManager::new(test_config(), self.southbound())
    }

    fn daemon(&self, config: FibConfig) -> FibDaemon {
        FibDaemon::new(config, self.southbound()).unwrap()
    }

    fn bind(&self, host: &str, switch: u64, interface: &str) {
        self.store.put_prefix_binding(PrefixBinding::new(
            100,
            prefix(&format!("{}/32", host)),
            s(switch),
            interface,
        ));
    }

    /// A VM route learned on `switch` with `label`, stored in `A1`.
    async fn vm_route(&self, host: &str, switch: u64, label: u32) -> VrfEntry {
        self.bind(host, switch, &format!("tap{}", switch));
        let entry = VrfEntry::new(prefix(&format!("{}/32", host)), RouteOrigin::Local)
            .with_route_path(endpoint(switch), Some(label));
        self.store.put_vrf_entry("A1", entry.clone()).await.unwrap();
        entry
    }

    fn fib_rule_exists(&self, switch: u64, entry: &VrfEntry) -> bool {
        self.flows
            .flow(s(switch), FIB_TABLE, &fib_flow_ref(s(switch), 100, &entry.prefix))
            .is_some()
    }
}

fn tunnel_bucket(tunnel_id: u64, interface: &str) -> Bucket {
    Bucket::new(vec![
        Action::SetTunnelId(tunnel_id),
        Action::Output(interface.to_string()),
    ])
}

#[tokio::test]
async fn test_local_only_route_reuses_single_group() {
    let fabric = Fabric::new();
    let manager = fabric.manager();
    let entry = fabric.vm_route("10.0.0.5", 1, 5001).await;

    manager.on_route_added("A1", &entry).await.unwrap();
    let group = manager.groups().single_group_id(100, ip("10.0.0.5")).unwrap();
    assert_eq!(manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(1));
    let flows = fabric.flows.flows();

    manager.on_route_added("A1", &entry).await.unwrap();
    assert_eq!(manager.groups().single_group_id(100, ip("10.0.0.5")), Some(group));
    assert_eq!(manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(2));
    assert_eq!(fabric.flows.flows(), flows);
    assert_eq!(fabric.flows.group_count(), 1);
}

#[tokio::test]
async fn test_extra_route_load_balances_from_third_switch() {
    let fabric = Fabric::new();
    let manager = fabric.manager();
    fabric.bind("10.0.0.5", 1, "tap1");
    fabric.bind("10.0.0.6", 2, "tap2");
    let anycast = prefix("10.0.0.100/32");
    fabric.store.put_extra_route(ExtraRoute::new(
        "vpnA",
        "A1",
        anycast,
        vec![ip("10.0.0.5"), ip("10.0.0.6")],
    ));
    let entry =
        VrfEntry::new(anycast, RouteOrigin::Static).with_route_path(endpoint(1), Some(5100));

    manager.on_route_added("A1", &entry).await.unwrap();

    let group_id = manager.groups().load_balance_group(s(3), 100, &anycast).unwrap();
    let group = fabric.flows.group(s(3), group_id).unwrap();
    assert_eq!(group.kind, GroupKind::LoadBalance);
    assert_eq!(
        group.buckets,
        vec![tunnel_bucket(5100, "tun3-1"), tunnel_bucket(5100, "tun3-2")]
    );

    let rule = fabric
        .flows
        .flow(s(3), FIB_TABLE, &fib_flow_ref(s(3), 100, &anycast))
        .unwrap();
    assert_eq!(rule.target_group(), Some(group_id));
}

#[tokio::test]
async fn test_down_tunnel_has_no_bucket_until_it_comes_back() {
    let fabric = Fabric::new();
    let manager = fabric.manager();
    fabric.bind("10.0.0.5", 1, "tap1");
    fabric.bind("10.0.0.6", 2, "tap2");
    let anycast = prefix("10.0.0.100/32");
    fabric.store.put_extra_route(ExtraRoute::new(
        "vpnA",
        "A1",
        anycast,
        vec![ip("10.0.0.5"), ip("10.0.0.6")],
    ));
    let entry =
        VrfEntry::new(anycast, RouteOrigin::Static).with_route_path(endpoint(1), Some(5100));
    fabric.store.put_vrf_entry("A1", entry.clone()).await.unwrap();

    fabric.egress.set_tunnel_up("tun3-2", false);
    manager.on_route_added("A1", &entry).await.unwrap();
    let group_id = manager.groups().load_balance_group(s(3), 100, &anycast).unwrap();
    assert_eq!(
        fabric.flows.group(s(3), group_id).unwrap().buckets,
        vec![tunnel_bucket(5100, "tun3-1")]
    );

    fabric.egress.set_tunnel_up("tun3-2", true);
    manager
        .on_tunnel_endpoint_up(s(3), TunnelDestination::Switch(s(2)))
        .await
        .unwrap();
    assert_eq!(fabric.flows.group(s(3), group_id).unwrap().buckets.len(), 2);

    fabric.egress.set_tunnel_up("tun3-1", false);
    manager
        .on_tunnel_endpoint_down(s(3), TunnelDestination::Switch(s(1)))
        .await
        .unwrap();
    assert_eq!(
        fabric.flows.group(s(3), group_id).unwrap().buckets,
        vec![tunnel_bucket(5100, "tun3-2")]
    );
}

#[tokio::test]
async fn test_static_route_into_linked_vpn() {
    let fabric = Fabric::new();
    let manager = fabric.manager();
    fabric
        .store
        .put_vpn_instance(VpnInstance::new(200, "vpnB", "B1").with_switch(s(4), SwitchState::Active));
    fabric.store.put_inter_vpn_link(InterVpnLink {
        name: "a-b".into(),
        first: LinkEndpoint {
            vpn_name: "vpnA".into(),
            ip: ip("169.254.0.1"),
            switches: vec![s(1)],
            lport_tag: 1001,
        },
        second: LinkEndpoint {
            vpn_name: "vpnB".into(),
            ip: ip("169.254.0.2"),
            switches: vec![s(4)],
            lport_tag: 1002,
        },
        state: InterVpnLinkState::Active,
        leak_bgp_routes: true,
    });
    let entry = VrfEntry::new(prefix("192.168.1.0/24"), RouteOrigin::Static)
        .with_route_path(ip("169.254.0.2"), Some(9100));

    manager.on_route_added("A1", &entry).await.unwrap();
    assert_eq!(fabric.flows.flows_on(s(4)).len(), 2);
    assert!(fabric.flows.flows_on(s(1)).is_empty());

    manager.on_route_removed("A1", &entry).await.unwrap();
    assert_eq!(fabric.flows.flow_count(), 0);
}

#[tokio::test]
async fn test_switch_leave_is_idempotent() {
    let fabric = Fabric::new();
    let manager = fabric.manager();
    let on_s1 = fabric.vm_route("10.0.0.5", 1, 5001).await;
    let on_s2 = fabric.vm_route("10.0.0.6", 2, 5002).await;
    manager.on_route_added("A1", &on_s1).await.unwrap();
    manager.on_route_added("A1", &on_s2).await.unwrap();
    assert!(!fabric.flows.flows_on(s(2)).is_empty());

    manager.on_switch_leave(s(2), 100, "A1").await.unwrap();
    let after_first = fabric.flows.flows();
    assert!(fabric.flows.flows_on(s(2)).is_empty());
    assert!(fabric.flows.groups().iter().all(|group| group.switch != s(2)));
    assert!(fabric.fib_rule_exists(1, &on_s1));
    assert!(fabric.fib_rule_exists(3, &on_s2));

    manager.on_switch_leave(s(2), 100, "A1").await.unwrap();
    assert_eq!(fabric.flows.flows(), after_first);
}

#[tokio::test]
async fn test_label_info_lives_as_long_as_the_route() {
    let fabric = Fabric::new();
    let manager = fabric.manager();
    let entry = fabric.vm_route("10.0.0.5", 1, 5001).await;

    manager.on_route_added("A1", &entry).await.unwrap();
    let info = manager.labels().route_info(5001).await.unwrap().unwrap();
    assert_eq!(info.referencing_vpns.len(), 1);
    assert_eq!(info.parent_vpn_rd, "A1");

    manager.on_route_removed("A1", &entry).await.unwrap();
    assert!(manager.labels().route_info(5001).await.unwrap().is_none());
    assert_eq!(fabric.flows.flow_count(), 0);
    assert_eq!(fabric.ids.allocated("groups"), 0);
}

#[tokio::test]
async fn test_unreachable_switch_waits_for_tunnel() {
    let fabric = Fabric::new();
    let manager = fabric.manager();
    fabric
        .egress
        .remove_tunnel(s(3), &TunnelDestination::Ip(endpoint(1)));
    let entry = fabric.vm_route("10.0.0.5", 1, 5001).await;

    manager.on_route_added("A1", &entry).await.unwrap();
    assert!(!fabric.fib_rule_exists(3, &entry));
    assert!(manager.is_pending(s(3), "A1", &entry.prefix));

    fabric.egress.add_tunnel(
        s(3),
        TunnelDestination::Ip(endpoint(1)),
        "tun3-1",
        TunnelKind::Vxlan,
    );
    let redriven = manager
        .on_tunnel_endpoint_up(s(3), TunnelDestination::Ip(endpoint(1)))
        .await
        .unwrap();
    assert_eq!(redriven, 1);
    assert!(fabric.fib_rule_exists(3, &entry));
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn test_bgp_route_with_too_many_paths_is_rejected() {
    let fabric = Fabric::new();
    let daemon = fabric.daemon(test_config());
    let entry = VrfEntry::new(prefix("203.0.113.0/24"), RouteOrigin::Bgp)
        .with_route_path(endpoint(1), Some(7001))
        .with_route_path(endpoint(2), Some(7002))
        .with_route_path(endpoint(3), Some(7003));

    let err = daemon.manager().on_route_added("A1", &entry).await.unwrap_err();
    assert!(matches!(err, FibError::EcmpConstraint { paths: 3, max: 2, .. }));

    daemon.on_route_added("A1", entry);
    daemon.wait_idle().await;
    assert_eq!(daemon.jobs().failed(), 1);
    assert_eq!(fabric.flows.flow_count(), 0);
}

#[tokio::test]
async fn test_failed_commit_is_retried() {
    let fabric = Fabric::new();
    let daemon = fabric.daemon(test_config());
    let entry = fabric.vm_route("10.0.0.5", 1, 5001).await;

    fabric.flows.fail_next_commits(2);
    daemon.on_route_added("A1", entry.clone());
    daemon.wait_idle().await;

    assert_eq!(daemon.jobs().failed(), 0);
    assert!(fabric.fib_rule_exists(1, &entry));
    assert!(fabric.fib_rule_exists(2, &entry));
    assert_eq!(
        daemon
            .manager()
            .groups()
            .single_ref_count(100, ip("10.0.0.5")),
        Some(1)
    );
}

#[tokio::test]
async fn test_job_rerun_after_store_failure_counts_groups_once() {
    let fabric = Fabric::new();
    let daemon = fabric.daemon(test_config());
    let entry = fabric.vm_route("10.0.0.5", 1, 5001).await;

    fabric.store.fail_next_writes(1);
    daemon.on_route_added("A1", entry.clone());
    daemon.wait_idle().await;

    assert_eq!(daemon.jobs().failed(), 0);
    let groups = daemon.manager().groups();
    let group = groups.single_group_id(100, ip("10.0.0.5")).unwrap();
    assert_eq!(groups.single_ref_count(100, ip("10.0.0.5")), Some(1));
    assert!(fabric.flows.group(s(1), group).is_some());

    daemon.on_route_removed("A1", entry);
    daemon.wait_idle().await;
    assert_eq!(fabric.flows.group_count(), 0);
    assert_eq!(fabric.flows.flow_count(), 0);
    assert_eq!(fabric.ids.allocated("groups"), 0);
}

#[tokio::test]
async fn test_daemon_batches_bgp_routes_until_shutdown() {
    let fabric = Fabric::new();
    let daemon = fabric.daemon(test_config());
    let routes: Vec<VrfEntry> = (0..5)
        .map(|i| {
            VrfEntry::new(prefix(&format!("203.0.{}.0/24", i)), RouteOrigin::Bgp)
                .with_route_path(endpoint(1), Some(7000 + i))
        })
        .collect();
    for route in &routes {
        daemon.on_route_added("A1", route.clone());
    }
    daemon.on_route_removed("A1", routes[4].clone());

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    tokio::join!(daemon.run(async move {
        let _ = stopped.await;
    }), async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = stop.send(());
    });

    for route in &routes[..4] {
        assert!(fabric.fib_rule_exists(2, route));
        assert!(fabric.fib_rule_exists(3, route));
    }
    assert!(!fabric.fib_rule_exists(2, &routes[4]));
    assert_eq!(daemon.jobs().pending(), 0);
    assert_eq!(daemon.jobs().completed(), 5);
}
