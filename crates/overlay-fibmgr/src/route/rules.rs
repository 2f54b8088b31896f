//! Builders for the rule shapes the engine installs.

use overlay_types::{IpPrefix, SwitchId};

use crate::flow::{
    fib_flow_ref, lfib_flow_ref, tunnel_flow_ref, vpn_metadata, Action, FlowEntity, Instruction,
    MatchField, COOKIE_LFIB, COOKIE_TUNNEL, COOKIE_VM_FIB, ETH_TYPE_IPV4, ETH_TYPE_IPV6,
    ETH_TYPE_MPLS, FIB_TABLE, INTERNAL_TUNNEL_TABLE, LFIB_TABLE, VPN_ID_MASK,
};

pub fn ether_type_of(prefix: &IpPrefix) -> u16 {
    if prefix.is_ipv4() {
        ETH_TYPE_IPV4
    } else {
        ETH_TYPE_IPV6
    }
}

/// Matches `(vpn, destination prefix)` in the FIB table.
pub fn fib_rule(
    switch: SwitchId,
    vpn_id: u32,
    prefix: &IpPrefix,
    priority: u16,
    cookie: u64,
    instructions: Vec<Instruction>,
) -> FlowEntity {
    FlowEntity {
        switch,
        table: FIB_TABLE,
        flow_ref: fib_flow_ref(switch, vpn_id, prefix),
        priority,
        cookie,
        matches: vec![
            MatchField::EthType(ether_type_of(prefix)),
            MatchField::Metadata {
                value: vpn_metadata(vpn_id),
                mask: VPN_ID_MASK,
            },
            MatchField::Destination(*prefix),
        ],
        instructions,
    }
}

/// FIB rule forwarding to a group.
pub fn fib_group_rule(
    switch: SwitchId,
    vpn_id: u32,
    prefix: &IpPrefix,
    priority: u16,
    group_id: u64,
) -> FlowEntity {
    fib_rule(
        switch,
        vpn_id,
        prefix,
        priority,
        COOKIE_VM_FIB,
        vec![Instruction::ApplyActions(vec![Action::Group(group_id)])],
    )
}

/// Matches an MPLS label in the LFIB table. The label is popped first; the
/// payload ethertype follows `prefix`.
pub fn lfib_rule(
    switch: SwitchId,
    label: u32,
    prefix: &IpPrefix,
    priority: u16,
    mut actions: Vec<Action>,
    tail: Vec<Instruction>,
) -> FlowEntity {
    actions.insert(
        0,
        Action::PopMpls {
            ethertype: ether_type_of(prefix),
        },
    );
    let mut instructions = vec![Instruction::ApplyActions(actions)];
    instructions.extend(tail);
    FlowEntity {
        switch,
        table: LFIB_TABLE,
        flow_ref: lfib_flow_ref(switch, label),
        priority,
        cookie: COOKIE_LFIB,
        matches: vec![
            MatchField::EthType(ETH_TYPE_MPLS),
            MatchField::MplsLabel(label),
        ],
        instructions,
    }
}

/// Matches the tunnel id of decapsulated traffic.
pub fn tunnel_termination_rule(
    switch: SwitchId,
    tunnel_id: u64,
    priority: u16,
    instructions: Vec<Instruction>,
) -> FlowEntity {
    FlowEntity {
        switch,
        table: INTERNAL_TUNNEL_TABLE,
        flow_ref: tunnel_flow_ref(switch, tunnel_id),
        priority,
        cookie: COOKIE_TUNNEL,
        matches: vec![MatchField::TunnelId(tunnel_id)],
        instructions,
    }
}
