//! Shared fixture for the engine's unit tests.

use overlay_types::SwitchId;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::FibConfig;
use crate::route::FibManager;
use crate::southbound::memory::{
    MemoryFlowProgrammer, MemoryIdManager, MemoryRoutingStore, StaticEgressResolver,
};
use crate::southbound::{Southbound, TunnelDestination, TunnelKind};
use crate::vpn::{SwitchState, VpnInstance};

pub fn s(id: u64) -> SwitchId {
    SwitchId::new(id)
}

pub fn ip(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

/// Tunnel endpoint address of switch `id`.
pub fn tunnel_ip(id: u64) -> IpAddr {
    ip(&format!("192.0.2.{}", id))
}

pub fn config() -> FibConfig {
    FibConfig {
        job_retry_backoff_ms: 1,
        label_pool: "labels".to_string(),
        group_pool: "groups".to_string(),
        ..FibConfig::default()
    }
}

/// `vpnA` (id 100, rd `A1`) active on switches 1 to 3, with a full VXLAN
/// tunnel mesh named `tun<src>-<dst>`.
pub struct Harness {
    pub store: Arc<MemoryRoutingStore>,
    pub flows: Arc<MemoryFlowProgrammer>,
    pub ids: Arc<MemoryIdManager>,
    pub egress: Arc<StaticEgressResolver>,
    pub manager: FibManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: FibConfig) -> Self {
        let store = Arc::new(MemoryRoutingStore::new());
        let flows = Arc::new(MemoryFlowProgrammer::new());
        let ids = Arc::new(
            MemoryIdManager::new()
                .with_pool("labels", 8000..=8999)
                .with_pool("groups", 150_000..=150_999),
        );
        let egress = Arc::new(StaticEgressResolver::new());

        store.put_vpn_instance(
            VpnInstance::new(100, "vpnA", "A1")
                .with_switch(s(1), SwitchState::Active)
                .with_switch(s(2), SwitchState::Active)
                .with_switch(s(3), SwitchState::Active),
        );
        for src in 1..=3 {
            for dst in (1..=3).filter(|dst| *dst != src) {
                let name = format!("tun{}-{}", src, dst);
                egress.add_tunnel(
                    s(src),
                    TunnelDestination::Switch(s(dst)),
                    name.clone(),
                    TunnelKind::Vxlan,
                );
                egress.add_tunnel(
                    s(src),
                    TunnelDestination::Ip(tunnel_ip(dst)),
                    name,
                    TunnelKind::Vxlan,
                );
            }
        }

        let southbound = Southbound {
            store: store.clone(),
            flows: flows.clone(),
            ids: ids.clone(),
            egress: egress.clone(),
        };
        let manager = FibManager::new(config, southbound);
        Self {
            store,
            flows,
            ids,
            egress,
            manager,
        }
    }

    /// The same collaborators, for building a second engine over them.
    pub fn southbound(&self) -> Southbound {
        Southbound {
            store: self.store.clone(),
            flows: self.flows.clone(),
            ids: self.ids.clone(),
            egress: self.egress.clone(),
        }
    }
}
