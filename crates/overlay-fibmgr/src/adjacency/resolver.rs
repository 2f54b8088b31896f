use log::{debug, warn};
use overlay_types::{IpPrefix, MacAddress, SwitchId};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::southbound::{EgressResolver, RoutingStore, TunnelDestination};
use crate::vpn::{PrefixBinding, VpnInstance, VrfEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdjacencyKind {
    Tunnel,
    /// Provider port of a flat or VLAN segment.
    L2,
}

/// A resolved egress towards a next hop.
///
/// Two results are equal when they leave through the same interface.
#[derive(Debug, Clone)]
pub struct AdjacencyResult {
    pub interface_name: String,
    pub kind: AdjacencyKind,
    pub next_hop: Option<IpAddr>,
    pub prefix: IpPrefix,
    /// Destination MAC of the attached endpoint, for L2 adjacencies.
    pub mac: Option<MacAddress>,
}

impl PartialEq for AdjacencyResult {
    fn eq(&self, other: &Self) -> bool {
        self.interface_name == other.interface_name
    }
}

impl Eq for AdjacencyResult {}

impl Hash for AdjacencyResult {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.interface_name.hash(state);
    }
}

pub struct AdjacencyResolver {
    store: Arc<dyn RoutingStore>,
    egress: Arc<dyn EgressResolver>,
}

impl AdjacencyResolver {
    pub fn new(store: Arc<dyn RoutingStore>, egress: Arc<dyn EgressResolver>) -> Self {
        Self { store, egress }
    }

    /// Resolves `entry` to adjacencies on `switch`, in discovery order and
    /// without two results on the same interface.
    ///
    /// An empty result is not an error: a non-BGP route with neither an
    /// extra route nor a prefix binding has no footprint to reach.
    pub async fn resolve(
        &self,
        switch: SwitchId,
        vpn: &VpnInstance,
        entry: &VrfEntry,
    ) -> Result<Vec<AdjacencyResult>> {
        let candidates = self.candidates(vpn, entry).await?;
        if candidates.is_empty() {
            debug!(
                "AdjacencyResolver: {} in {} has no local footprint",
                entry.prefix, vpn.name
            );
            return Ok(Vec::new());
        }

        let next_hops: Vec<Option<IpAddr>> = if entry.route_paths.is_empty() {
            vec![None]
        } else {
            entry.next_hops().into_iter().map(Some).collect()
        };

        let mut results: Vec<AdjacencyResult> = Vec::new();
        for (prefix, binding) in &candidates {
            for next_hop in &next_hops {
                let Some(adjacency) = self
                    .resolve_one(switch, *prefix, binding.as_ref(), *next_hop)
                    .await?
                else {
                    continue;
                };
                if !results.contains(&adjacency) {
                    results.push(adjacency);
                }
            }
        }

        if results.is_empty() {
            warn!(
                "AdjacencyResolver: no adjacency for {} in {} on switch {}",
                entry.prefix, vpn.name, switch
            );
        }
        Ok(results)
    }

    async fn candidates(
        &self,
        vpn: &VpnInstance,
        entry: &VrfEntry,
    ) -> Result<Vec<(IpPrefix, Option<PrefixBinding>)>> {
        if entry.is_bgp() {
            return Ok(vec![(entry.prefix, None)]);
        }

        let extra_routes = self.store.extra_routes(&vpn.name, &entry.prefix).await?;
        if !extra_routes.is_empty() {
            let mut candidates = Vec::new();
            for next_hop in extra_routes.iter().flat_map(|route| route.next_hops.iter()) {
                let prefix = IpPrefix::host(*next_hop);
                if candidates.iter().any(|(p, _)| *p == prefix) {
                    continue;
                }
                let binding = self.store.prefix_binding(vpn.vpn_id, &prefix).await?;
                candidates.push((prefix, binding));
            }
            return Ok(candidates);
        }

        Ok(self
            .store
            .prefix_binding(vpn.vpn_id, &entry.prefix)
            .await?
            .map(|binding| vec![(entry.prefix, Some(binding))])
            .unwrap_or_default())
    }

    async fn resolve_one(
        &self,
        switch: SwitchId,
        prefix: IpPrefix,
        binding: Option<&PrefixBinding>,
        next_hop: Option<IpAddr>,
    ) -> Result<Option<AdjacencyResult>> {
        if let Some(binding) = binding.filter(|b| b.segment_type.is_l2()) {
            let Some(physnet) = binding.physical_network.as_deref() else {
                warn!(
                    "AdjacencyResolver: {} is on a {:?} segment without a physical network",
                    prefix, binding.segment_type
                );
                return Ok(None);
            };
            return Ok(self
                .egress
                .provider_interface_name(switch, physnet)
                .await?
                .map(|interface_name| AdjacencyResult {
                    interface_name,
                    kind: AdjacencyKind::L2,
                    next_hop,
                    prefix,
                    mac: binding.mac,
                }));
        }

        let destination = match (next_hop, binding) {
            (Some(ip), _) => TunnelDestination::Ip(ip),
            (None, Some(binding)) => TunnelDestination::Switch(binding.switch),
            (None, None) => return Ok(None),
        };
        Ok(self
            .egress
            .tunnel_interface_name(switch, &destination)
            .await?
            .map(|interface_name| AdjacencyResult {
                interface_name,
                kind: AdjacencyKind::Tunnel,
                next_hop,
                prefix,
                mac: None,
            }))
    }
}
