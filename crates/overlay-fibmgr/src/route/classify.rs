use crate::vpn::{InterVpnLink, SubnetRoute, VpnInstance, VrfEntry};

/// How a route is programmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteHandler {
    /// Aggregate route redirected to flood-domain processing.
    Subnet(SubnetRoute),
    /// Router interface address; answered by the ping responder, which is
    /// not programmed here.
    RouterInterface,
    /// Route towards the opposite endpoint of an inter-VPN link.
    InterVpn(InterVpnLink),
    /// Local, remote and ECMP installs.
    Generic,
}

/// Picks the handler for `entry` of `vpn`.
///
/// Augmentations take precedence over next-hop based dispatch. A route is
/// an inter-VPN route when its sole next hop is the address of the link
/// endpoint opposite to `vpn`; the state of the link is checked by the
/// handler.
pub fn classify(vpn: &VpnInstance, entry: &VrfEntry, links: &[InterVpnLink]) -> RouteHandler {
    if let Some(subnet) = entry.subnet_route {
        return RouteHandler::Subnet(subnet);
    }
    if entry.router_interface.is_some() {
        return RouteHandler::RouterInterface;
    }

    let next_hops = entry.next_hops();
    if let [next_hop] = next_hops.as_slice() {
        let link = links.iter().find(|link| {
            link.endpoint_of(&vpn.name).is_some()
                && link
                    .sibling_of(&vpn.name)
                    .is_some_and(|sibling| sibling.ip == *next_hop)
        });
        if let Some(link) = link {
            return RouteHandler::InterVpn(link.clone());
        }
    }

    RouteHandler::Generic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::{InterVpnLinkState, LinkEndpoint, RouteOrigin};
    use overlay_types::SwitchId;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn link() -> InterVpnLink {
        InterVpnLink {
            name: "a-b".into(),
            first: LinkEndpoint {
                vpn_name: "vpnA".into(),
                ip: ip("169.254.0.1"),
                switches: vec![SwitchId::new(1)],
                lport_tag: 7,
            },
            second: LinkEndpoint {
                vpn_name: "vpnB".into(),
                ip: ip("169.254.0.2"),
                switches: vec![SwitchId::new(2)],
                lport_tag: 8,
            },
            state: InterVpnLinkState::Active,
            leak_bgp_routes: false,
        }
    }

    #[test]
    fn test_augmentations_first() {
        let vpn = VpnInstance::new(100, "vpnA", "A1");
        let prefix = "10.0.0.0/24".parse().unwrap();
        let subnet = VrfEntry::new(prefix, RouteOrigin::Connected)
            .with_subnet_route(9)
            .with_route_path(ip("169.254.0.2"), Some(5000));
        assert!(matches!(
            classify(&vpn, &subnet, &[link()]),
            RouteHandler::Subnet(SubnetRoute { elan_tag: 9 })
        ));

        let ri = VrfEntry::new(prefix, RouteOrigin::Local)
            .with_router_interface(ip("10.0.0.1"), "fa:16:3e:00:00:01".parse().unwrap());
        assert_eq!(classify(&vpn, &ri, &[]), RouteHandler::RouterInterface);
    }

    #[test]
    fn test_inter_vpn_needs_opposite_endpoint() {
        let vpn = VpnInstance::new(100, "vpnA", "A1");
        let prefix = "192.168.1.0/24".parse().unwrap();

        let to_b = VrfEntry::new(prefix, RouteOrigin::Static).with_route_path(ip("169.254.0.2"), None);
        assert!(matches!(classify(&vpn, &to_b, &[link()]), RouteHandler::InterVpn(_)));

        // Own endpoint address is not a leak.
        let to_a = VrfEntry::new(prefix, RouteOrigin::Static).with_route_path(ip("169.254.0.1"), None);
        assert_eq!(classify(&vpn, &to_a, &[link()]), RouteHandler::Generic);

        let other = VpnInstance::new(300, "vpnC", "C1");
        assert_eq!(classify(&other, &to_b, &[link()]), RouteHandler::Generic);

        let multipath = to_b.clone().with_route_path(ip("192.0.2.1"), None);
        assert_eq!(classify(&vpn, &multipath, &[link()]), RouteHandler::Generic);
    }
}
