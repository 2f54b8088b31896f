//! Collaborators the engine talks to.
//!
//! The routing store, the flow programming backend, the ID allocation
//! service and the egress/tunnel resolution service are all external. The
//! engine only sees these traits; [`memory`] provides in-process versions
//! used by the standalone daemon and the tests.

pub mod memory;

use async_trait::async_trait;
use overlay_types::{IpPrefix, SwitchId};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::flow::{Action, FlowBatch};
use crate::vpn::{ExtraRoute, InterVpnLink, LabelRouteInfo, PrefixBinding, VpnInstance, VrfEntry};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SouthboundError {
    #[error("{0}")]
    Store(String),
    #[error("{0}")]
    Backend(String),
    #[error("pool {pool}: {message}")]
    IdPool { pool: String, message: String },
    #[error("{0}")]
    Egress(String),
}

pub type SouthboundResult<T> = Result<T, SouthboundError>;

/// Transactional routing data store. Reads return `None` for absent keys.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    async fn vpn_instance_by_rd(&self, rd: &str) -> SouthboundResult<Option<VpnInstance>>;
    async fn vpn_instance_by_name(&self, name: &str) -> SouthboundResult<Option<VpnInstance>>;
    async fn vpn_instances(&self) -> SouthboundResult<Vec<VpnInstance>>;

    async fn vrf_entries(&self, rd: &str) -> SouthboundResult<Vec<VrfEntry>>;
    async fn vrf_entry(&self, rd: &str, prefix: &IpPrefix) -> SouthboundResult<Option<VrfEntry>>;
    async fn put_vrf_entry(&self, rd: &str, entry: VrfEntry) -> SouthboundResult<()>;
    async fn delete_vrf_entry(&self, rd: &str, prefix: &IpPrefix) -> SouthboundResult<()>;

    async fn prefix_binding(
        &self,
        vpn_id: u32,
        prefix: &IpPrefix,
    ) -> SouthboundResult<Option<PrefixBinding>>;

    /// Extra routes of `vpn_name` for `prefix`, across every rd they are
    /// advertised under.
    async fn extra_routes(
        &self,
        vpn_name: &str,
        prefix: &IpPrefix,
    ) -> SouthboundResult<Vec<ExtraRoute>>;

    async fn label_route_info(&self, label: u32) -> SouthboundResult<Option<LabelRouteInfo>>;
    async fn put_label_route_info(&self, info: LabelRouteInfo) -> SouthboundResult<()>;
    async fn delete_label_route_info(&self, label: u32) -> SouthboundResult<()>;

    async fn inter_vpn_links(&self) -> SouthboundResult<Vec<InterVpnLink>>;
}

/// Flow-table and group-table programming backend.
#[async_trait]
pub trait FlowProgrammer: Send + Sync {
    /// Applies every operation of the batch or none of them.
    async fn commit(&self, batch: FlowBatch) -> SouthboundResult<()>;
}

/// Numeric ID pools. Allocating an already allocated key returns its id.
#[async_trait]
pub trait IdManager: Send + Sync {
    async fn allocate_id(&self, pool: &str, key: &str) -> SouthboundResult<u32>;
    async fn release_id(&self, pool: &str, key: &str) -> SouthboundResult<()>;
}

/// Far end of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelDestination {
    /// Another switch of the fabric.
    Switch(SwitchId),
    /// A tunnel endpoint address, possibly outside the fabric.
    Ip(IpAddr),
}

impl fmt::Display for TunnelDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelDestination::Switch(switch) => write!(f, "switch {}", switch),
            TunnelDestination::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    Vxlan,
    MplsOverGre,
}

/// Egress action and tunnel interface resolution.
#[async_trait]
pub trait EgressResolver: Send + Sync {
    async fn tunnel_interface_name(
        &self,
        source: SwitchId,
        destination: &TunnelDestination,
    ) -> SouthboundResult<Option<String>>;

    async fn tunnel_kind(&self, interface: &str) -> SouthboundResult<Option<TunnelKind>>;

    async fn is_tunnel_up(&self, interface: &str) -> SouthboundResult<bool>;

    /// Actions that send a packet out of `interface`.
    async fn egress_actions_for(&self, interface: &str) -> SouthboundResult<Vec<Action>>;

    /// Provider port of `switch` on a flat or VLAN physical network.
    async fn provider_interface_name(
        &self,
        switch: SwitchId,
        physical_network: &str,
    ) -> SouthboundResult<Option<String>>;
}

/// The set of collaborators the engine is built from.
#[derive(Clone)]
pub struct Southbound {
    pub store: Arc<dyn RoutingStore>,
    pub flows: Arc<dyn FlowProgrammer>,
    pub ids: Arc<dyn IdManager>,
    pub egress: Arc<dyn EgressResolver>,
}
