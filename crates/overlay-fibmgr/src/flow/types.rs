use overlay_types::{IpPrefix, MacAddress, SwitchId};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use crate::nhg::GroupChanges;

pub type TableId = u8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum MatchField {
    EthType(u16),
    Metadata { value: u64, mask: u64 },
    Destination(IpPrefix),
    MplsLabel(u32),
    TunnelId(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    SetDestinationMac(MacAddress),
    SetSourceMac(MacAddress),
    PushMpls,
    PopMpls { ethertype: u16 },
    SetMplsLabel(u32),
    SetTunnelId(u64),
    SetTunnelDestination(IpAddr),
    PushVlan(u16),
    Output(String),
    Group(u64),
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Instruction {
    ApplyActions(Vec<Action>),
    WriteMetadata { value: u64, mask: u64 },
    GotoTable(TableId),
}

/// Identity of an installed rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowKey {
    pub switch: SwitchId,
    pub table: TableId,
    pub flow_ref: String,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.flow_ref, self.switch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEntity {
    pub switch: SwitchId,
    pub table: TableId,
    pub flow_ref: String,
    pub priority: u16,
    pub cookie: u64,
    pub matches: Vec<MatchField>,
    pub instructions: Vec<Instruction>,
}

impl FlowEntity {
    pub fn key(&self) -> FlowKey {
        FlowKey {
            switch: self.switch,
            table: self.table,
            flow_ref: self.flow_ref.clone(),
        }
    }

    /// Group the rule forwards to, if any.
    pub fn target_group(&self) -> Option<u64> {
        self.instructions.iter().find_map(|instruction| match instruction {
            Instruction::ApplyActions(actions) => actions.iter().find_map(|action| match action {
                Action::Group(id) => Some(*id),
                _ => None,
            }),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GroupKind {
    /// One bucket, shared by every rule that reaches the same next hop.
    Single,
    /// Weighted buckets, one per reachable next hop.
    LoadBalance,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Bucket {
    pub weight: u16,
    pub actions: Vec<Action>,
}

impl Bucket {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { weight: 1, actions }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupEntity {
    pub switch: SwitchId,
    pub group_id: u64,
    pub kind: GroupKind,
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FlowOp {
    InstallFlow(FlowEntity),
    RemoveFlow(FlowKey),
    InstallGroup(GroupEntity),
    RemoveGroup { switch: SwitchId, group_id: u64 },
}

/// Every rule and group write of one job, committed as one transaction.
///
/// Operations are applied in the order they were added. The group table
/// bookkeeping of the job rides along and never reaches the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowBatch {
    ops: Vec<FlowOp>,
    #[serde(skip)]
    groups: GroupChanges,
}

impl FlowBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_flow(&mut self, flow: FlowEntity) {
        self.ops.push(FlowOp::InstallFlow(flow));
    }

    pub fn remove_flow(&mut self, switch: SwitchId, table: TableId, flow_ref: impl Into<String>) {
        self.ops.push(FlowOp::RemoveFlow(FlowKey {
            switch,
            table,
            flow_ref: flow_ref.into(),
        }));
    }

    pub fn install_group(&mut self, group: GroupEntity) {
        self.ops.push(FlowOp::InstallGroup(group));
    }

    pub fn remove_group(&mut self, switch: SwitchId, group_id: u64) {
        self.ops.push(FlowOp::RemoveGroup { switch, group_id });
    }

    pub fn extend(&mut self, other: FlowBatch) {
        self.ops.extend(other.ops);
        self.groups.merge(other.groups);
    }

    pub fn group_changes(&self) -> &GroupChanges {
        &self.groups
    }

    pub(crate) fn group_changes_mut(&mut self) -> &mut GroupChanges {
        &mut self.groups
    }

    pub(crate) fn take_group_changes(&mut self) -> GroupChanges {
        std::mem::take(&mut self.groups)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[FlowOp] {
        &self.ops
    }

    /// Only the backend operations; staged group changes are dropped.
    pub fn into_ops(self) -> Vec<FlowOp> {
        self.ops
    }
}
