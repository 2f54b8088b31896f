use overlay_types::{IpPrefix, MacAddress, SwitchId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Who originated a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOrigin {
    Connected,
    Static,
    Local,
    Bgp,
    /// Imported from another VPN hosted in the same fabric.
    SelfImported,
    /// Leaked across an inter-VPN link.
    InterVpn,
}

impl fmt::Display for RouteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteOrigin::Connected => "connected",
            RouteOrigin::Static => "static",
            RouteOrigin::Local => "local",
            RouteOrigin::Bgp => "bgp",
            RouteOrigin::SelfImported => "self-imported",
            RouteOrigin::InterVpn => "inter-vpn",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncapType {
    MplsGre,
    Vxlan,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutePath {
    pub next_hop: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<u32>,
}

impl RoutePath {
    pub fn new(next_hop: IpAddr, label: Option<u32>) -> Self {
        Self { next_hop, label }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubnetRoute {
    pub elan_tag: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouterInterface {
    pub ip: IpAddr,
    pub mac: MacAddress,
}

/// One route of a VRF table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfEntry {
    pub prefix: IpPrefix,
    pub origin: RouteOrigin,
    #[serde(default)]
    pub route_paths: Vec<RoutePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encap_type: Option<EncapType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3vni: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_mac: Option<MacAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_vpn_rd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_route: Option<SubnetRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_interface: Option<RouterInterface>,
}

impl VrfEntry {
    pub fn new(prefix: IpPrefix, origin: RouteOrigin) -> Self {
        Self {
            prefix,
            origin,
            route_paths: Vec::new(),
            encap_type: None,
            l3vni: None,
            gateway_mac: None,
            parent_vpn_rd: None,
            subnet_route: None,
            router_interface: None,
        }
    }

    pub fn with_route_path(mut self, next_hop: IpAddr, label: Option<u32>) -> Self {
        self.route_paths.push(RoutePath::new(next_hop, label));
        self
    }

    pub fn with_encap(mut self, encap: EncapType, l3vni: Option<u32>) -> Self {
        self.encap_type = Some(encap);
        self.l3vni = l3vni;
        self
    }

    pub fn with_gateway_mac(mut self, mac: MacAddress) -> Self {
        self.gateway_mac = Some(mac);
        self
    }

    pub fn with_subnet_route(mut self, elan_tag: u32) -> Self {
        self.subnet_route = Some(SubnetRoute { elan_tag });
        self
    }

    pub fn with_router_interface(mut self, ip: IpAddr, mac: MacAddress) -> Self {
        self.router_interface = Some(RouterInterface { ip, mac });
        self
    }

    pub fn with_parent_rd(mut self, rd: impl Into<String>) -> Self {
        self.parent_vpn_rd = Some(rd.into());
        self
    }

    pub fn is_bgp(&self) -> bool {
        self.origin == RouteOrigin::Bgp
    }

    pub fn is_self_imported(&self) -> bool {
        self.origin == RouteOrigin::SelfImported
    }

    pub fn next_hops(&self) -> Vec<IpAddr> {
        self.route_paths.iter().map(|path| path.next_hop).collect()
    }

    /// Distinct labels carried by the route paths, in path order.
    pub fn labels(&self) -> Vec<u32> {
        let mut labels = Vec::new();
        for label in self.route_paths.iter().filter_map(|path| path.label) {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        labels
    }

    pub fn first_label(&self) -> Option<u32> {
        self.route_paths.iter().find_map(|path| path.label)
    }

    /// Label of the path towards `next_hop`, falling back to the first one.
    pub fn label_for(&self, next_hop: Option<IpAddr>) -> Option<u32> {
        next_hop
            .and_then(|nh| {
                self.route_paths
                    .iter()
                    .find(|path| path.next_hop == nh)
                    .and_then(|path| path.label)
            })
            .or_else(|| self.first_label())
    }

    /// VXLAN routes carrying an L3VNI use it as tunnel id instead of the label.
    pub fn is_vni_enforced(&self) -> bool {
        self.encap_type == Some(EncapType::Vxlan) && self.l3vni.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VpnToSwitch {
    pub switch: SwitchId,
    pub state: SwitchState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnInstance {
    pub vpn_id: u32,
    pub name: String,
    pub rd: String,
    #[serde(default)]
    pub switches: Vec<VpnToSwitch>,
}

impl VpnInstance {
    pub fn new(vpn_id: u32, name: impl Into<String>, rd: impl Into<String>) -> Self {
        Self {
            vpn_id,
            name: name.into(),
            rd: rd.into(),
            switches: Vec::new(),
        }
    }

    pub fn with_switch(mut self, switch: SwitchId, state: SwitchState) -> Self {
        self.switches.retain(|binding| binding.switch != switch);
        self.switches.push(VpnToSwitch { switch, state });
        self
    }

    /// Switches that receive remote-route installs.
    pub fn active_switches(&self) -> Vec<SwitchId> {
        self.switches
            .iter()
            .filter(|binding| binding.state == SwitchState::Active)
            .map(|binding| binding.switch)
            .collect()
    }

    pub fn all_switches(&self) -> Vec<SwitchId> {
        self.switches.iter().map(|binding| binding.switch).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixCue {
    Normal,
    /// Floating IP owned by the NAT service.
    Nat,
    /// Owned by a physical network function.
    PhysNetFunc,
}

/// Network type of the segment a prefix lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Vxlan,
    Gre,
    Flat,
    Vlan,
}

impl SegmentType {
    /// Flat and VLAN segments are reached through a provider port instead
    /// of a tunnel.
    pub fn is_l2(&self) -> bool {
        matches!(self, SegmentType::Flat | SegmentType::Vlan)
    }
}

/// Where a prefix of a VPN is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixBinding {
    pub vpn_id: u32,
    pub prefix: IpPrefix,
    pub switch: SwitchId,
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    pub cue: PrefixCue,
    pub segment_type: SegmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddress>,
}

impl PrefixBinding {
    pub fn new(vpn_id: u32, prefix: IpPrefix, switch: SwitchId, interface: impl Into<String>) -> Self {
        Self {
            vpn_id,
            prefix,
            switch,
            interface: interface.into(),
            subnet_id: None,
            cue: PrefixCue::Normal,
            segment_type: SegmentType::Vxlan,
            physical_network: None,
            mac: None,
        }
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_cue(mut self, cue: PrefixCue) -> Self {
        self.cue = cue;
        self
    }

    pub fn with_segment(mut self, segment_type: SegmentType, physical_network: Option<String>) -> Self {
        self.segment_type = segment_type;
        self.physical_network = physical_network;
        self
    }

    pub fn with_subnet(mut self, subnet_id: impl Into<String>) -> Self {
        self.subnet_id = Some(subnet_id.into());
        self
    }

    /// Nat and PhysNetFunc prefixes are programmed by other services.
    pub fn is_owned_elsewhere(&self) -> bool {
        self.cue != PrefixCue::Normal
    }
}

/// Next hops through which a VPN reaches an anycast/ECMP prefix, as
/// advertised under one route distinguisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraRoute {
    pub vpn_name: String,
    pub rd: String,
    pub prefix: IpPrefix,
    pub next_hops: Vec<IpAddr>,
}

impl ExtraRoute {
    pub fn new(
        vpn_name: impl Into<String>,
        rd: impl Into<String>,
        prefix: IpPrefix,
        next_hops: Vec<IpAddr>,
    ) -> Self {
        Self {
            vpn_name: vpn_name.into(),
            rd: rd.into(),
            prefix,
            next_hops,
        }
    }
}

/// Local installation record of a label-bearing route.
///
/// Exists exactly as long as `referencing_vpns` is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRouteInfo {
    pub label: u32,
    pub prefix: IpPrefix,
    pub next_hops: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<SwitchId>,
    pub parent_vpn_id: u32,
    pub parent_vpn_rd: String,
    pub referencing_vpns: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterVpnLinkState {
    Active,
    Error,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEndpoint {
    pub vpn_name: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub switches: Vec<SwitchId>,
    /// Dispatch tag identifying this endpoint as a logical port.
    pub lport_tag: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterVpnLink {
    pub name: String,
    pub first: LinkEndpoint,
    pub second: LinkEndpoint,
    pub state: InterVpnLinkState,
    #[serde(default)]
    pub leak_bgp_routes: bool,
}

impl InterVpnLink {
    pub fn is_active(&self) -> bool {
        self.state == InterVpnLinkState::Active
    }

    /// The endpoint that belongs to `vpn_name`.
    pub fn endpoint_of(&self, vpn_name: &str) -> Option<&LinkEndpoint> {
        [&self.first, &self.second]
            .into_iter()
            .find(|endpoint| endpoint.vpn_name == vpn_name)
    }

    /// The endpoint opposite to the one of `vpn_name`.
    pub fn sibling_of(&self, vpn_name: &str) -> Option<&LinkEndpoint> {
        if self.first.vpn_name == vpn_name {
            Some(&self.second)
        } else if self.second.vpn_name == vpn_name {
            Some(&self.first)
        } else {
            None
        }
    }
}
