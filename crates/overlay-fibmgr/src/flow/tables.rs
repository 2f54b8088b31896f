//! Table layout, metadata encoding and flow reference naming.

use overlay_types::{IpPrefix, SwitchId};
use std::net::IpAddr;

use super::types::TableId;

/// Service dispatch table, selected by the logical-port tag in metadata.
pub const DISPATCHER_TABLE: TableId = 17;
pub const LFIB_TABLE: TableId = 20;
pub const FIB_TABLE: TableId = 21;
/// Flood-domain processing for subnet routes.
pub const SUBNET_ROUTE_TABLE: TableId = 22;
/// Termination of traffic arriving over internal tunnels.
pub const INTERNAL_TUNNEL_TABLE: TableId = 36;

pub const COOKIE_VM_FIB: u64 = 0x800_0003;
pub const COOKIE_LFIB: u64 = 0x800_0002;
pub const COOKIE_SUBNET_ROUTE: u64 = 0x800_0004;
pub const COOKIE_TUNNEL: u64 = 0x900_0000;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;
pub const ETH_TYPE_MPLS: u16 = 0x8847;

pub const VPN_ID_MASK: u64 = 0x0000_0000_00ff_fffe;
pub const ELAN_TAG_MASK: u64 = 0x0000_ffff_ff00_0000;
pub const LPORT_TAG_MASK: u64 = 0x0fff_ff00_0000_0000;

pub fn vpn_metadata(vpn_id: u32) -> u64 {
    (u64::from(vpn_id) << 1) & VPN_ID_MASK
}

pub fn elan_metadata(elan_tag: u32) -> u64 {
    (u64::from(elan_tag) << 24) & ELAN_TAG_MASK
}

pub fn lport_tag_metadata(lport_tag: u32) -> u64 {
    (u64::from(lport_tag) << 40) & LPORT_TAG_MASK
}

/// Metadata written by subnet routes: flood domain plus VPN.
pub fn subnet_metadata(elan_tag: u32, vpn_id: u32) -> (u64, u64) {
    (
        elan_metadata(elan_tag) | vpn_metadata(vpn_id),
        ELAN_TAG_MASK | VPN_ID_MASK,
    )
}

pub fn fib_flow_ref(switch: SwitchId, vpn_id: u32, prefix: &IpPrefix) -> String {
    format!("fib.{}.{}.{}.{}", FIB_TABLE, switch, vpn_id, prefix)
}

pub fn lfib_flow_ref(switch: SwitchId, label: u32) -> String {
    format!("lfib.{}.{}.{}", LFIB_TABLE, switch, label)
}

pub fn tunnel_flow_ref(switch: SwitchId, tunnel_key: u64) -> String {
    format!("tst.{}.{}.{}", INTERNAL_TUNNEL_TABLE, switch, tunnel_key)
}

pub fn broadcast_drop_flow_ref(switch: SwitchId, vpn_id: u32, address: &IpAddr) -> String {
    format!("bcast.{}.{}.{}.{}", FIB_TABLE, switch, vpn_id, address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_metadata_encoding() {
        assert_eq!(vpn_metadata(5), 0xa);
        assert_eq!(elan_metadata(3), 0x300_0000);
        assert_eq!(lport_tag_metadata(1), 0x100_0000_0000);
        assert_eq!(subnet_metadata(3, 5), (0x300_000a, ELAN_TAG_MASK | VPN_ID_MASK));
    }

    #[test]
    fn test_vpn_metadata_is_masked() {
        assert_eq!(vpn_metadata(u32::MAX) & !VPN_ID_MASK, 0);
    }

    #[test]
    fn test_flow_refs_are_deterministic() {
        let prefix: IpPrefix = "10.0.0.5/32".parse().unwrap();
        let s1 = SwitchId::new(1);
        assert_eq!(fib_flow_ref(s1, 100, &prefix), "fib.21.1.100.10.0.0.5/32");
        assert_eq!(fib_flow_ref(s1, 100, &prefix), fib_flow_ref(s1, 100, &prefix));
        assert_eq!(lfib_flow_ref(s1, 5000), "lfib.20.1.5000");
        assert_eq!(tunnel_flow_ref(s1, 5000), "tst.36.1.5000");
    }
}
