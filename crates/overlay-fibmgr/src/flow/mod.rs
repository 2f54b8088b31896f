//! Forwarding rule model handed to the flow programming backend.
//!
//! Rules are plain data. Every rule carries a deterministic flow reference
//! derived from what it matches, so installing the same rule twice is an
//! overwrite and removing a rule never needs the original entity.

mod tables;
mod types;

pub use tables::{
    broadcast_drop_flow_ref, elan_metadata, fib_flow_ref, lfib_flow_ref, lport_tag_metadata,
    subnet_metadata, tunnel_flow_ref, vpn_metadata, COOKIE_LFIB, COOKIE_SUBNET_ROUTE,
    COOKIE_TUNNEL, COOKIE_VM_FIB, DISPATCHER_TABLE, ELAN_TAG_MASK, ETH_TYPE_IPV4, ETH_TYPE_IPV6,
    ETH_TYPE_MPLS, FIB_TABLE, INTERNAL_TUNNEL_TABLE, LFIB_TABLE, LPORT_TAG_MASK,
    SUBNET_ROUTE_TABLE, VPN_ID_MASK,
};
pub use types::{
    Action, Bucket, FlowBatch, FlowEntity, FlowKey, FlowOp, GroupEntity, GroupKind, Instruction,
    MatchField, TableId,
};
