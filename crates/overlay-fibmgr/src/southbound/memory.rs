//! In-process collaborators.
//!
//! Backed by plain maps behind a mutex. The standalone daemon runs on them,
//! and the tests use their inspection helpers to look at what the engine
//! programmed.

use async_trait::async_trait;
use overlay_types::{IpPrefix, SwitchId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

use super::{
    EgressResolver, FlowProgrammer, IdManager, RoutingStore, SouthboundError, SouthboundResult,
    TunnelDestination, TunnelKind,
};
use crate::flow::{Action, FlowBatch, FlowEntity, FlowKey, FlowOp, GroupEntity, TableId};
use crate::vpn::{ExtraRoute, InterVpnLink, LabelRouteInfo, PrefixBinding, VpnInstance, VrfEntry};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct StoreState {
    vpns: BTreeMap<String, VpnInstance>,
    vrf_tables: BTreeMap<String, BTreeMap<IpPrefix, VrfEntry>>,
    bindings: HashMap<(u32, IpPrefix), PrefixBinding>,
    extra_routes: BTreeMap<(String, String, IpPrefix), ExtraRoute>,
    labels: BTreeMap<u32, LabelRouteInfo>,
    links: BTreeMap<String, InterVpnLink>,
    write_failures_armed: usize,
}

impl StoreState {
    fn check_write(&mut self) -> SouthboundResult<()> {
        if self.write_failures_armed > 0 {
            self.write_failures_armed -= 1;
            return Err(SouthboundError::Store("write rejected".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRoutingStore {
    state: Mutex<StoreState>,
}

impl MemoryRoutingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a VPN instance, keyed by its rd.
    pub fn put_vpn_instance(&self, vpn: VpnInstance) {
        locked(&self.state).vpns.insert(vpn.rd.clone(), vpn);
    }

    pub fn put_prefix_binding(&self, binding: PrefixBinding) {
        locked(&self.state)
            .bindings
            .insert((binding.vpn_id, binding.prefix), binding);
    }

    pub fn remove_prefix_binding(&self, vpn_id: u32, prefix: &IpPrefix) {
        locked(&self.state).bindings.remove(&(vpn_id, *prefix));
    }

    pub fn put_extra_route(&self, route: ExtraRoute) {
        let key = (route.vpn_name.clone(), route.rd.clone(), route.prefix);
        locked(&self.state).extra_routes.insert(key, route);
    }

    pub fn remove_extra_route(&self, vpn_name: &str, rd: &str, prefix: &IpPrefix) {
        let key = (vpn_name.to_string(), rd.to_string(), *prefix);
        locked(&self.state).extra_routes.remove(&key);
    }

    pub fn put_inter_vpn_link(&self, link: InterVpnLink) {
        locked(&self.state).links.insert(link.name.clone(), link);
    }

    /// Makes the next `count` label record writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        locked(&self.state).write_failures_armed = count;
    }

    pub fn label_infos(&self) -> Vec<LabelRouteInfo> {
        locked(&self.state).labels.values().cloned().collect()
    }
}

#[async_trait]
impl RoutingStore for MemoryRoutingStore {
    async fn vpn_instance_by_rd(&self, rd: &str) -> SouthboundResult<Option<VpnInstance>> {
        Ok(locked(&self.state).vpns.get(rd).cloned())
    }

    async fn vpn_instance_by_name(&self, name: &str) -> SouthboundResult<Option<VpnInstance>> {
        Ok(locked(&self.state)
            .vpns
            .values()
            .find(|vpn| vpn.name == name)
            .cloned())
    }

    async fn vpn_instances(&self) -> SouthboundResult<Vec<VpnInstance>> {
        Ok(locked(&self.state).vpns.values().cloned().collect())
    }

    async fn vrf_entries(&self, rd: &str) -> SouthboundResult<Vec<VrfEntry>> {
        Ok(locked(&self.state)
            .vrf_tables
            .get(rd)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn vrf_entry(&self, rd: &str, prefix: &IpPrefix) -> SouthboundResult<Option<VrfEntry>> {
        Ok(locked(&self.state)
            .vrf_tables
            .get(rd)
            .and_then(|table| table.get(prefix))
            .cloned())
    }

    async fn put_vrf_entry(&self, rd: &str, entry: VrfEntry) -> SouthboundResult<()> {
        locked(&self.state)
            .vrf_tables
            .entry(rd.to_string())
            .or_default()
            .insert(entry.prefix, entry);
        Ok(())
    }

    async fn delete_vrf_entry(&self, rd: &str, prefix: &IpPrefix) -> SouthboundResult<()> {
        let mut state = locked(&self.state);
        if let Some(table) = state.vrf_tables.get_mut(rd) {
            table.remove(prefix);
            if table.is_empty() {
                state.vrf_tables.remove(rd);
            }
        }
        Ok(())
    }

    async fn prefix_binding(
        &self,
        vpn_id: u32,
        prefix: &IpPrefix,
    ) -> SouthboundResult<Option<PrefixBinding>> {
        Ok(locked(&self.state).bindings.get(&(vpn_id, *prefix)).cloned())
    }

    async fn extra_routes(
        &self,
        vpn_name: &str,
        prefix: &IpPrefix,
    ) -> SouthboundResult<Vec<ExtraRoute>> {
        Ok(locked(&self.state)
            .extra_routes
            .values()
            .filter(|route| route.vpn_name == vpn_name && route.prefix == *prefix)
            .cloned()
            .collect())
    }

    async fn label_route_info(&self, label: u32) -> SouthboundResult<Option<LabelRouteInfo>> {
        Ok(locked(&self.state).labels.get(&label).cloned())
    }

    async fn put_label_route_info(&self, info: LabelRouteInfo) -> SouthboundResult<()> {
        let mut state = locked(&self.state);
        state.check_write()?;
        state.labels.insert(info.label, info);
        Ok(())
    }

    async fn delete_label_route_info(&self, label: u32) -> SouthboundResult<()> {
        let mut state = locked(&self.state);
        state.check_write()?;
        state.labels.remove(&label);
        Ok(())
    }

    async fn inter_vpn_links(&self) -> SouthboundResult<Vec<InterVpnLink>> {
        Ok(locked(&self.state).links.values().cloned().collect())
    }
}

#[derive(Debug, Default)]
struct ProgrammedState {
    flows: BTreeMap<FlowKey, FlowEntity>,
    groups: BTreeMap<(SwitchId, u64), GroupEntity>,
    commits: usize,
    failures_armed: usize,
}

/// Flow backend that records the resulting rule and group tables.
#[derive(Debug, Default)]
pub struct MemoryFlowProgrammer {
    state: Mutex<ProgrammedState>,
}

impl MemoryFlowProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail without applying anything.
    pub fn fail_next_commits(&self, count: usize) {
        locked(&self.state).failures_armed = count;
    }

    pub fn commit_count(&self) -> usize {
        locked(&self.state).commits
    }

    pub fn flows(&self) -> Vec<FlowEntity> {
        locked(&self.state).flows.values().cloned().collect()
    }

    pub fn flows_on(&self, switch: SwitchId) -> Vec<FlowEntity> {
        locked(&self.state)
            .flows
            .values()
            .filter(|flow| flow.switch == switch)
            .cloned()
            .collect()
    }

    pub fn flow(&self, switch: SwitchId, table: TableId, flow_ref: &str) -> Option<FlowEntity> {
        let key = FlowKey {
            switch,
            table,
            flow_ref: flow_ref.to_string(),
        };
        locked(&self.state).flows.get(&key).cloned()
    }

    pub fn groups(&self) -> Vec<GroupEntity> {
        locked(&self.state).groups.values().cloned().collect()
    }

    pub fn group(&self, switch: SwitchId, group_id: u64) -> Option<GroupEntity> {
        locked(&self.state).groups.get(&(switch, group_id)).cloned()
    }

    pub fn flow_count(&self) -> usize {
        locked(&self.state).flows.len()
    }

    pub fn group_count(&self) -> usize {
        locked(&self.state).groups.len()
    }
}

#[async_trait]
impl FlowProgrammer for MemoryFlowProgrammer {
    async fn commit(&self, batch: FlowBatch) -> SouthboundResult<()> {
        let mut state = locked(&self.state);
        if state.failures_armed > 0 {
            state.failures_armed -= 1;
            return Err(SouthboundError::Backend(format!(
                "commit of {} operations rejected",
                batch.len()
            )));
        }

        for op in batch.into_ops() {
            match op {
                FlowOp::InstallFlow(flow) => {
                    state.flows.insert(flow.key(), flow);
                }
                FlowOp::RemoveFlow(key) => {
                    state.flows.remove(&key);
                }
                FlowOp::InstallGroup(group) => {
                    state.groups.insert((group.switch, group.group_id), group);
                }
                FlowOp::RemoveGroup { switch, group_id } => {
                    state.groups.remove(&(switch, group_id));
                }
            }
        }
        state.commits += 1;
        Ok(())
    }
}

#[derive(Debug)]
struct IdPool {
    range: RangeInclusive<u32>,
    next: u32,
    by_key: HashMap<String, u32>,
    free: Vec<u32>,
}

impl IdPool {
    fn new(range: RangeInclusive<u32>) -> Self {
        Self {
            next: *range.start(),
            range,
            by_key: HashMap::new(),
            free: Vec::new(),
        }
    }
}

/// ID pools with idempotent per-key allocation.
#[derive(Debug, Default)]
pub struct MemoryIdManager {
    pools: Mutex<HashMap<String, IdPool>>,
}

impl MemoryIdManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(self, name: impl Into<String>, range: RangeInclusive<u32>) -> Self {
        locked(&self.pools).insert(name.into(), IdPool::new(range));
        self
    }

    pub fn allocated(&self, pool: &str) -> usize {
        locked(&self.pools).get(pool).map_or(0, |p| p.by_key.len())
    }

    pub fn id_of(&self, pool: &str, key: &str) -> Option<u32> {
        locked(&self.pools)
            .get(pool)
            .and_then(|p| p.by_key.get(key).copied())
    }
}

#[async_trait]
impl IdManager for MemoryIdManager {
    async fn allocate_id(&self, pool: &str, key: &str) -> SouthboundResult<u32> {
        let mut pools = locked(&self.pools);
        let state = pools.get_mut(pool).ok_or_else(|| SouthboundError::IdPool {
            pool: pool.to_string(),
            message: "unknown pool".to_string(),
        })?;

        if let Some(id) = state.by_key.get(key) {
            return Ok(*id);
        }
        let id = match state.free.pop() {
            Some(id) => id,
            None if state.next <= *state.range.end() => {
                let id = state.next;
                state.next += 1;
                id
            }
            None => {
                return Err(SouthboundError::IdPool {
                    pool: pool.to_string(),
                    message: "exhausted".to_string(),
                })
            }
        };
        state.by_key.insert(key.to_string(), id);
        Ok(id)
    }

    async fn release_id(&self, pool: &str, key: &str) -> SouthboundResult<()> {
        let mut pools = locked(&self.pools);
        if let Some(state) = pools.get_mut(pool) {
            if let Some(id) = state.by_key.remove(key) {
                state.free.push(id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EgressState {
    tunnels: HashMap<(SwitchId, TunnelDestination), String>,
    kinds: HashMap<String, TunnelKind>,
    down: HashSet<String>,
    egress: HashMap<String, Vec<Action>>,
    providers: HashMap<(SwitchId, String), String>,
    egress_lookups: usize,
}

/// Egress resolver answering from a configured tunnel mesh.
///
/// Interfaces without configured egress actions resolve to a plain
/// `Output` towards the interface.
#[derive(Debug, Default)]
pub struct StaticEgressResolver {
    state: Mutex<EgressState>,
}

impl StaticEgressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tunnel(
        &self,
        source: SwitchId,
        destination: TunnelDestination,
        interface: impl Into<String>,
        kind: TunnelKind,
    ) {
        let interface = interface.into();
        let mut state = locked(&self.state);
        state.kinds.insert(interface.clone(), kind);
        state.tunnels.insert((source, destination), interface);
    }

    pub fn remove_tunnel(&self, source: SwitchId, destination: &TunnelDestination) {
        locked(&self.state).tunnels.remove(&(source, *destination));
    }

    pub fn set_tunnel_up(&self, interface: &str, up: bool) {
        let mut state = locked(&self.state);
        if up {
            state.down.remove(interface);
        } else {
            state.down.insert(interface.to_string());
        }
    }

    pub fn set_egress_actions(&self, interface: impl Into<String>, actions: Vec<Action>) {
        locked(&self.state).egress.insert(interface.into(), actions);
    }

    pub fn add_provider_interface(
        &self,
        switch: SwitchId,
        physical_network: impl Into<String>,
        interface: impl Into<String>,
    ) {
        locked(&self.state)
            .providers
            .insert((switch, physical_network.into()), interface.into());
    }

    /// Number of egress action lookups answered so far.
    pub fn egress_lookups(&self) -> usize {
        locked(&self.state).egress_lookups
    }
}

#[async_trait]
impl EgressResolver for StaticEgressResolver {
    async fn tunnel_interface_name(
        &self,
        source: SwitchId,
        destination: &TunnelDestination,
    ) -> SouthboundResult<Option<String>> {
        Ok(locked(&self.state)
            .tunnels
            .get(&(source, *destination))
            .cloned())
    }

    async fn tunnel_kind(&self, interface: &str) -> SouthboundResult<Option<TunnelKind>> {
        Ok(locked(&self.state).kinds.get(interface).copied())
    }

    async fn is_tunnel_up(&self, interface: &str) -> SouthboundResult<bool> {
        Ok(!locked(&self.state).down.contains(interface))
    }

    async fn egress_actions_for(&self, interface: &str) -> SouthboundResult<Vec<Action>> {
        let mut state = locked(&self.state);
        state.egress_lookups += 1;
        Ok(state
            .egress
            .get(interface)
            .cloned()
            .unwrap_or_else(|| vec![Action::Output(interface.to_string())]))
    }

    async fn provider_interface_name(
        &self,
        switch: SwitchId,
        physical_network: &str,
    ) -> SouthboundResult<Option<String>> {
        Ok(locked(&self.state)
            .providers
            .get(&(switch, physical_network.to_string()))
            .cloned())
    }
}
