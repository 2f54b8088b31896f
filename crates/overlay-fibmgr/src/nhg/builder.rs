use log::{debug, warn};
use overlay_orch_common::{KeyedLock, RefCountTable, Released};
use overlay_types::{IpPrefix, SwitchId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::encap::{default_tunnel_kind, mac_rewrite, tunnel_encap, EgressCache};
use crate::error::Result;
use super::changes::{GroupChanges, LoadBalanceKey};
use crate::flow::{Bucket, FlowBatch, GroupEntity, GroupKind};
use crate::southbound::{EgressResolver, IdManager, RoutingStore, TunnelDestination};
use crate::vpn::{ExtraRoute, PrefixBinding, VpnInstance, VrfEntry};

/// Single groups are shared per VPN and destination address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SingleGroupKey {
    pub vpn_id: u32,
    pub next_hop: IpAddr,
}

impl fmt::Display for SingleGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.vpn_id, self.next_hop)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleGroup {
    pub group_id: u64,
    pub switch: SwitchId,
    pub bucket: Bucket,
}

impl SingleGroup {
    fn entity(&self) -> GroupEntity {
        GroupEntity {
            switch: self.switch,
            group_id: self.group_id,
            kind: GroupKind::Single,
            buckets: vec![self.bucket.clone()],
        }
    }
}

/// Builds and reuses forwarding groups.
///
/// The group table is owned here: single groups live in a
/// [`RefCountTable`] whose count is the number of installed routes pointing
/// at the group, load-balance groups are tracked per switch.
///
/// Building only stages table changes in the batch, on top of the committed
/// tables. [`apply`](Self::apply) folds them in after the commit. IDs of
/// removed groups are freed there too, so a group whose removal never
/// reached the switch keeps its ID.
pub struct NextHopGroupBuilder {
    store: Arc<dyn RoutingStore>,
    ids: Arc<dyn IdManager>,
    egress: Arc<dyn EgressResolver>,
    pool: String,
    singles: Mutex<RefCountTable<SingleGroupKey, SingleGroup>>,
    load_balance: Mutex<HashMap<LoadBalanceKey, u64>>,
    locks: KeyedLock<SingleGroupKey>,
}

impl NextHopGroupBuilder {
    pub fn new(
        store: Arc<dyn RoutingStore>,
        ids: Arc<dyn IdManager>,
        egress: Arc<dyn EgressResolver>,
        pool: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ids,
            egress,
            pool: pool.into(),
            singles: Mutex::new(RefCountTable::new()),
            load_balance: Mutex::new(HashMap::new()),
            locks: KeyedLock::new(),
        }
    }

    fn singles(&self) -> MutexGuard<'_, RefCountTable<SingleGroupKey, SingleGroup>> {
        self.singles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_balance(&self) -> MutexGuard<'_, HashMap<LoadBalanceKey, u64>> {
        self.load_balance.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The group as the batch sees it, with its reference count, if it
    /// still has references.
    fn current_single(&self, key: &SingleGroupKey, batch: &FlowBatch) -> Option<(SingleGroup, i64)> {
        let singles = self.singles();
        let committed = singles.ref_count(key).unwrap_or(0);
        match batch.group_changes().single(key) {
            Some(staged) => {
                let refs = staged.effective(committed);
                (refs > 0).then(|| (staged.group.clone(), refs))
            }
            None => singles
                .get(key)
                .map(|group| (group.clone(), i64::from(committed))),
        }
    }

    /// Returns the single group towards the bound endpoint, creating it with
    /// one reference or adding a reference to the existing one.
    pub async fn get_or_create_single(
        &self,
        vpn_id: u32,
        binding: &PrefixBinding,
        batch: &mut FlowBatch,
    ) -> Result<u64> {
        self.acquire_single(vpn_id, binding, batch, true).await
    }

    /// Like [`get_or_create_single`](Self::get_or_create_single) but leaves
    /// the count of an existing group alone and re-emits it. Used by replays.
    pub async fn ensure_single(
        &self,
        vpn_id: u32,
        binding: &PrefixBinding,
        batch: &mut FlowBatch,
    ) -> Result<u64> {
        self.acquire_single(vpn_id, binding, batch, false).await
    }

    async fn acquire_single(
        &self,
        vpn_id: u32,
        binding: &PrefixBinding,
        batch: &mut FlowBatch,
        add_reference: bool,
    ) -> Result<u64> {
        let key = SingleGroupKey {
            vpn_id,
            next_hop: binding.prefix.address(),
        };
        let _guard = self.locks.lock(key.clone()).await;

        if let Some((group, refs)) = self.current_single(&key, batch) {
            if add_reference {
                batch
                    .group_changes_mut()
                    .stage_single(key.clone(), group.clone())
                    .refs += 1;
                debug!("NextHopGroupBuilder: group {} for {} now has {} refs", group.group_id, key, refs + 1);
            } else {
                batch.install_group(group.entity());
            }
            return Ok(group.group_id);
        }

        let id = self.ids.allocate_id(&self.pool, &key.to_string()).await?;
        let mut actions = mac_rewrite(binding.mac);
        actions.extend(self.egress.egress_actions_for(&binding.interface).await?);
        let group = SingleGroup {
            group_id: u64::from(id),
            switch: binding.switch,
            bucket: Bucket::new(actions),
        };
        batch.install_group(group.entity());
        batch.group_changes_mut().stage_single(key, group).refs += 1;
        Ok(u64::from(id))
    }

    /// Drops one reference. At zero the group is uninstalled; returns
    /// whether that happened.
    pub async fn release_single(
        &self,
        vpn_id: u32,
        next_hop: IpAddr,
        batch: &mut FlowBatch,
    ) -> Result<bool> {
        let key = SingleGroupKey { vpn_id, next_hop };
        let _guard = self.locks.lock(key.clone()).await;

        let Some((group, refs)) = self.current_single(&key, batch) else {
            debug!("NextHopGroupBuilder: no group for {}", key);
            return Ok(false);
        };
        batch
            .group_changes_mut()
            .stage_single(key.clone(), group.clone())
            .refs -= 1;
        if refs > 1 {
            debug!("NextHopGroupBuilder: group for {} keeps {} refs", key, refs - 1);
            return Ok(false);
        }
        batch.remove_group(group.switch, group.group_id);
        Ok(true)
    }

    /// Folds the staged changes of a committed batch into the tables and
    /// frees the IDs of the groups that are gone.
    pub async fn apply(&self, changes: GroupChanges) {
        let mut created = Vec::new();
        let mut removed = Vec::new();
        {
            let mut singles = self.singles();
            for (key, staged) in changes.singles {
                if staged.purged {
                    singles.remove(&key);
                }
                let committed = singles.ref_count(&key).unwrap_or(0);
                let refs = staged.effective(committed);
                if refs <= 0 {
                    if let Some(group) = singles.remove(&key) {
                        removed.push((key, group));
                    } else {
                        removed.push((key, staged.group));
                    }
                    continue;
                }
                let refs = u32::try_from(refs).unwrap_or(u32::MAX);
                if committed == 0 {
                    if singles.insert(key.clone(), staged.group.clone(), refs).is_ok() {
                        created.push((key, staged.group));
                    }
                    continue;
                }
                if let Some(group) = singles.get_mut(&key) {
                    *group = staged.group;
                }
                let mut count = committed;
                while count < refs {
                    count = singles.increment_ref(&key).unwrap_or(refs);
                }
                while count > refs {
                    count = match singles.decrement_ref(&key) {
                        Ok(Released::Retained(left)) => left,
                        _ => refs,
                    };
                }
            }
        }

        for (key, group) in &created {
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceCreate,
                "NextHopGroupBuilder",
                "create_single_group"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(group.group_id.to_string())
            .with_object_type("next_hop_group")
            .with_details(serde_json::json!({
                "key": key.to_string(),
                "switch": group.switch.value(),
            })));
        }
        for (key, group) in &removed {
            self.free_id(&key.to_string()).await;
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceDelete,
                "NextHopGroupBuilder",
                "remove_single_group"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(group.group_id.to_string())
            .with_object_type("next_hop_group")
            .with_details(serde_json::json!({
                "key": key.to_string(),
                "switch": group.switch.value(),
            })));
        }

        self.apply_load_balance(changes.load_balance).await;
    }

    async fn apply_load_balance(&self, staged: HashMap<LoadBalanceKey, Option<u64>>) {
        let mut created = Vec::new();
        let mut removed = Vec::new();
        let mut unused = Vec::new();
        {
            let mut groups = self.load_balance();
            for (key, id) in staged {
                match id {
                    Some(id) => {
                        if groups.insert(key, id).is_none() {
                            created.push((key, id));
                        }
                    }
                    None => {
                        if let Some(id) = groups.remove(&key) {
                            removed.push((key, id));
                        }
                        let (_, vpn_id, prefix) = key;
                        if !unused.contains(&(vpn_id, prefix)) {
                            unused.push((vpn_id, prefix));
                        }
                    }
                }
            }
            unused.retain(|(vpn_id, prefix)| {
                !groups.keys().any(|(_, v, p)| v == vpn_id && p == prefix)
            });
        }

        for ((switch, vpn_id, prefix), id) in created {
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceCreate,
                "NextHopGroupBuilder",
                "create_load_balance_group"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id.to_string())
            .with_object_type("next_hop_group")
            .with_details(serde_json::json!({
                "vpn_id": vpn_id,
                "prefix": prefix.to_string(),
                "switch": switch.value(),
            })));
        }
        for ((switch, vpn_id, prefix), id) in removed {
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceDelete,
                "NextHopGroupBuilder",
                "remove_load_balance_group"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id.to_string())
            .with_object_type("next_hop_group")
            .with_details(serde_json::json!({
                "vpn_id": vpn_id,
                "prefix": prefix.to_string(),
                "switch": switch.value(),
            })));
        }
        for (vpn_id, prefix) in unused {
            self.free_id(&load_balance_pool_key(vpn_id, &prefix)).await;
        }
    }

    /// The rules are already gone from the switch, so a failed release only
    /// strands the ID.
    async fn free_id(&self, key: &str) {
        if let Err(err) = self.ids.release_id(&self.pool, key).await {
            warn!("NextHopGroupBuilder: could not free group ID of {}: {}", key, err);
        }
    }

    pub fn single_group_id(&self, vpn_id: u32, next_hop: IpAddr) -> Option<u64> {
        self.singles()
            .get(&SingleGroupKey { vpn_id, next_hop })
            .map(|group| group.group_id)
    }

    pub fn single_ref_count(&self, vpn_id: u32, next_hop: IpAddr) -> Option<u32> {
        self.singles().ref_count(&SingleGroupKey { vpn_id, next_hop })
    }

    pub fn single_group_count(&self) -> usize {
        self.singles().len()
    }

    /// Builds the load-balance group of an ECMP extra route as seen from
    /// `switch` and installs it, overwriting any previous version.
    ///
    /// Next hops attached to `switch` get a local rewrite bucket; every
    /// other next hop gets a tunnel bucket, unless its tunnel is down or
    /// missing, in which case it gets none.
    pub async fn build_load_balance(
        &self,
        vpn: &VpnInstance,
        switch: SwitchId,
        entry: &VrfEntry,
        extra_routes: &[ExtraRoute],
        batch: &mut FlowBatch,
    ) -> Result<u64> {
        let mut egress = EgressCache::new(self.egress.as_ref());
        let mut seen = HashSet::new();
        let mut buckets = Vec::new();

        for route in extra_routes {
            let label = self.label_for(route, entry).await?;
            for next_hop in &route.next_hops {
                if !seen.insert(*next_hop) {
                    continue;
                }
                let host = IpPrefix::host(*next_hop);
                let Some(binding) = self.store.prefix_binding(vpn.vpn_id, &host).await? else {
                    debug!("NextHopGroupBuilder: next hop {} of {} is not bound", next_hop, entry.prefix);
                    continue;
                };

                if binding.switch == switch {
                    let mut actions = mac_rewrite(binding.mac);
                    actions.extend(egress.actions_for(&binding.interface).await?);
                    buckets.push(Bucket::new(actions));
                    continue;
                }

                let destination = TunnelDestination::Switch(binding.switch);
                let Some(tunnel) = self.egress.tunnel_interface_name(switch, &destination).await? else {
                    warn!(
                        "NextHopGroupBuilder: no tunnel from {} to {} for {}",
                        switch, binding.switch, next_hop
                    );
                    continue;
                };
                if !self.egress.is_tunnel_up(&tunnel).await? {
                    debug!("NextHopGroupBuilder: tunnel {} is down, no bucket for {}", tunnel, next_hop);
                    continue;
                }
                let kind = self
                    .egress
                    .tunnel_kind(&tunnel)
                    .await?
                    .unwrap_or_else(|| default_tunnel_kind(entry));
                let Some(mut actions) = tunnel_encap(kind, entry, label) else {
                    warn!(
                        "NextHopGroupBuilder: {} has no label or VNI for {:?}",
                        entry.prefix, kind
                    );
                    continue;
                };
                actions.extend(egress.actions_for(&tunnel).await?);
                buckets.push(Bucket::new(actions));
            }
        }

        self.install_load_balance(vpn.vpn_id, switch, &entry.prefix, buckets, batch)
            .await
    }

    /// Label a remote next hop is reached with: the one advertised in the
    /// extra route's own rd, else the entry's.
    async fn label_for(&self, route: &ExtraRoute, entry: &VrfEntry) -> Result<Option<u32>> {
        let advertised = self
            .store
            .vrf_entry(&route.rd, &route.prefix)
            .await?
            .and_then(|e| e.first_label());
        Ok(advertised.or_else(|| entry.first_label()))
    }

    fn current_load_balance(&self, key: &LoadBalanceKey, batch: &FlowBatch) -> Option<u64> {
        match batch.group_changes().load_balance(key) {
            Some(staged) => staged,
            None => self.load_balance().get(key).copied(),
        }
    }

    /// Installs (or overwrites) a load-balance group on `switch`.
    pub async fn install_load_balance(
        &self,
        vpn_id: u32,
        switch: SwitchId,
        prefix: &IpPrefix,
        buckets: Vec<Bucket>,
        batch: &mut FlowBatch,
    ) -> Result<u64> {
        let id = u64::from(
            self.ids
                .allocate_id(&self.pool, &load_balance_pool_key(vpn_id, prefix))
                .await?,
        );
        debug!(
            "NextHopGroupBuilder: load-balance group {} for {} on {} with {} buckets",
            id,
            prefix,
            switch,
            buckets.len()
        );
        batch.install_group(GroupEntity {
            switch,
            group_id: id,
            kind: GroupKind::LoadBalance,
            buckets,
        });
        batch
            .group_changes_mut()
            .stage_load_balance((switch, vpn_id, *prefix), Some(id));
        Ok(id)
    }

    /// Uninstalls the load-balance group of `prefix` on `switch`. The ID is
    /// freed once no switch uses it anymore.
    pub async fn remove_load_balance(
        &self,
        switch: SwitchId,
        vpn_id: u32,
        prefix: &IpPrefix,
        batch: &mut FlowBatch,
    ) -> Result<bool> {
        let key = (switch, vpn_id, *prefix);
        let Some(id) = self.current_load_balance(&key, batch) else {
            return Ok(false);
        };
        batch.remove_group(switch, id);
        batch.group_changes_mut().stage_load_balance(key, None);
        Ok(true)
    }

    pub fn load_balance_group(&self, switch: SwitchId, vpn_id: u32, prefix: &IpPrefix) -> Option<u64> {
        self.load_balance().get(&(switch, vpn_id, *prefix)).copied()
    }

    /// Prefixes of `vpn_id` that have a load-balance group on `switch`.
    pub fn load_balanced_prefixes(&self, switch: SwitchId, vpn_id: u32) -> Vec<IpPrefix> {
        let mut prefixes: Vec<IpPrefix> = self
            .load_balance()
            .keys()
            .filter(|(s, v, _)| *s == switch && *v == vpn_id)
            .map(|(_, _, p)| *p)
            .collect();
        prefixes.sort();
        prefixes
    }

    /// Forgets every group of `vpn_id` owned by `switch`, whatever its
    /// reference count, and uninstalls it.
    pub async fn purge_switch(&self, switch: SwitchId, vpn_id: u32, batch: &mut FlowBatch) -> Result<usize> {
        let owned = |key: &SingleGroupKey, group: &SingleGroup| {
            key.vpn_id == vpn_id && group.switch == switch
        };
        let mut keys: Vec<SingleGroupKey> = self
            .singles()
            .iter()
            .filter(|(key, group, _)| owned(*key, *group))
            .map(|(key, _, _)| key.clone())
            .collect();
        keys.extend(
            batch
                .group_changes()
                .singles
                .iter()
                .filter(|(key, staged)| owned(*key, &staged.group))
                .map(|(key, _)| key.clone()),
        );
        keys.sort_by_key(|key| key.to_string());
        keys.dedup();

        let mut purged = 0;
        for key in keys {
            let Some((group, _)) = self.current_single(&key, batch) else {
                continue;
            };
            batch.remove_group(group.switch, group.group_id);
            let staged = batch.group_changes_mut().stage_single(key, group);
            staged.purged = true;
            staged.refs = 0;
            purged += 1;
        }

        let mut prefixes = self.load_balanced_prefixes(switch, vpn_id);
        prefixes.extend(
            batch
                .group_changes()
                .load_balance
                .iter()
                .filter(|((s, v, _), id)| *s == switch && *v == vpn_id && id.is_some())
                .map(|((_, _, p), _)| *p),
        );
        prefixes.sort();
        prefixes.dedup();
        for prefix in prefixes {
            if self.remove_load_balance(switch, vpn_id, &prefix, batch).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn load_balance_pool_key(vpn_id: u32, prefix: &IpPrefix) -> String {
    format!("{}.{}.lb", vpn_id, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Action, FlowOp};
    use crate::southbound::memory::{MemoryIdManager, MemoryRoutingStore, StaticEgressResolver};
    use crate::southbound::TunnelKind;
    use crate::vpn::{EncapType, RouteOrigin, SwitchState};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<MemoryRoutingStore>,
        ids: Arc<MemoryIdManager>,
        egress: Arc<StaticEgressResolver>,
        groups: NextHopGroupBuilder,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryRoutingStore::new());
        let ids = Arc::new(MemoryIdManager::new().with_pool("groups", 150_000..=150_100));
        let egress = Arc::new(StaticEgressResolver::new());
        let groups = NextHopGroupBuilder::new(store.clone(), ids.clone(), egress.clone(), "groups");
        Fixture { store, ids, egress, groups }
    }

    fn s(id: u64) -> SwitchId {
        SwitchId::new(id)
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    fn binding(addr: &str, switch: u64, interface: &str) -> PrefixBinding {
        PrefixBinding::new(100, IpPrefix::host(ip(addr)), s(switch), interface)
    }

    /// Stands in for a successful commit of `batch`.
    async fn committed(f: &Fixture, batch: &mut FlowBatch) {
        f.groups.apply(batch.take_group_changes()).await;
    }

    #[tokio::test]
    async fn test_single_group_is_shared_and_counted() {
        let f = fixture();
        let vm = binding("10.0.0.5", 1, "tap1").with_mac("fa:16:3e:00:00:05".parse().unwrap());
        let mut batch = FlowBatch::new();

        let first = f.groups.get_or_create_single(100, &vm, &mut batch).await.unwrap();
        let second = f.groups.get_or_create_single(100, &vm, &mut batch).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.groups.single_ref_count(100, ip("10.0.0.5")), None);
        committed(&f, &mut batch).await;
        assert_eq!(f.groups.single_ref_count(100, ip("10.0.0.5")), Some(2));
        assert_eq!(batch.len(), 1);

        match &batch.ops()[0] {
            FlowOp::InstallGroup(group) => {
                assert_eq!(group.kind, GroupKind::Single);
                assert_eq!(group.switch, s(1));
                assert_eq!(
                    group.buckets[0].actions,
                    vec![
                        Action::SetDestinationMac("fa:16:3e:00:00:05".parse().unwrap()),
                        Action::Output("tap1".into())
                    ]
                );
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_tears_down_at_zero() {
        let f = fixture();
        let vm = binding("10.0.0.5", 1, "tap1");
        let mut batch = FlowBatch::new();
        f.groups.get_or_create_single(100, &vm, &mut batch).await.unwrap();
        f.groups.get_or_create_single(100, &vm, &mut batch).await.unwrap();
        committed(&f, &mut batch).await;

        let mut batch = FlowBatch::new();
        assert!(!f.groups.release_single(100, ip("10.0.0.5"), &mut batch).await.unwrap());
        assert!(f.groups.release_single(100, ip("10.0.0.5"), &mut batch).await.unwrap());
        assert!(matches!(batch.ops().last(), Some(FlowOp::RemoveGroup { .. })));
        // Still installed until the removal commits.
        assert_eq!(f.ids.allocated("groups"), 1);
        assert_eq!(f.groups.single_ref_count(100, ip("10.0.0.5")), Some(2));

        committed(&f, &mut batch).await;
        assert_eq!(f.ids.allocated("groups"), 0);
        assert!(f.groups.single_group_id(100, ip("10.0.0.5")).is_none());

        // Nothing left to release.
        let mut batch = FlowBatch::new();
        assert!(!f.groups.release_single(100, ip("10.0.0.5"), &mut batch).await.unwrap());
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_batch_leaves_tables_alone() {
        let f = fixture();
        let vm = binding("10.0.0.5", 1, "tap1");
        let mut batch = FlowBatch::new();
        let id = f.groups.get_or_create_single(100, &vm, &mut batch).await.unwrap();
        committed(&f, &mut batch).await;

        // A release that never commits.
        let mut dropped = FlowBatch::new();
        assert!(f.groups.release_single(100, ip("10.0.0.5"), &mut dropped).await.unwrap());
        drop(dropped);
        assert_eq!(f.groups.single_ref_count(100, ip("10.0.0.5")), Some(1));

        // A second endpoint does not get the ID of the still installed group.
        let mut batch = FlowBatch::new();
        let other = f
            .groups
            .get_or_create_single(100, &binding("10.0.0.6", 1, "tap2"), &mut batch)
            .await
            .unwrap();
        assert_ne!(other, id);

        // An add that never commits has to install the group again next time.
        let mut dropped = FlowBatch::new();
        let vm7 = binding("10.0.0.7", 1, "tap3");
        f.groups.get_or_create_single(100, &vm7, &mut dropped).await.unwrap();
        drop(dropped);
        let mut retry = FlowBatch::new();
        f.groups.get_or_create_single(100, &vm7, &mut retry).await.unwrap();
        assert!(matches!(retry.ops()[0], FlowOp::InstallGroup(_)));
        committed(&f, &mut retry).await;
        assert_eq!(f.groups.single_ref_count(100, ip("10.0.0.7")), Some(1));
    }

    #[tokio::test]
    async fn test_release_then_acquire_in_one_batch_keeps_group() {
        let f = fixture();
        let vm = binding("10.0.0.5", 1, "tap1");
        let mut batch = FlowBatch::new();
        let id = f.groups.get_or_create_single(100, &vm, &mut batch).await.unwrap();
        committed(&f, &mut batch).await;

        let mut batch = FlowBatch::new();
        f.groups.release_single(100, ip("10.0.0.5"), &mut batch).await.unwrap();
        let again = f.groups.get_or_create_single(100, &vm, &mut batch).await.unwrap();
        assert_eq!(again, id);
        assert!(matches!(batch.ops()[0], FlowOp::RemoveGroup { .. }));
        assert!(matches!(batch.ops()[1], FlowOp::InstallGroup(_)));

        committed(&f, &mut batch).await;
        assert_eq!(f.groups.single_ref_count(100, ip("10.0.0.5")), Some(1));
        assert_eq!(f.ids.allocated("groups"), 1);
    }

    #[tokio::test]
    async fn test_ensure_does_not_add_reference() {
        let f = fixture();
        let vm = binding("10.0.0.5", 1, "tap1");
        let mut batch = FlowBatch::new();
        f.groups.ensure_single(100, &vm, &mut batch).await.unwrap();
        f.groups.ensure_single(100, &vm, &mut batch).await.unwrap();
        committed(&f, &mut batch).await;
        assert_eq!(f.groups.single_ref_count(100, ip("10.0.0.5")), Some(1));
        assert_eq!(batch.len(), 2);
    }

    async fn ecmp_setup(f: &Fixture) -> (VpnInstance, VrfEntry, Vec<ExtraRoute>) {
        let vpn = VpnInstance::new(100, "vpnA", "A1")
            .with_switch(s(1), SwitchState::Active)
            .with_switch(s(2), SwitchState::Active)
            .with_switch(s(3), SwitchState::Active);
        f.store.put_prefix_binding(binding("10.0.0.5", 1, "tap1"));
        f.store.put_prefix_binding(binding("10.0.0.6", 2, "tap2"));
        f.egress.add_tunnel(s(3), TunnelDestination::Switch(s(1)), "tun3-1", TunnelKind::Vxlan);
        f.egress.add_tunnel(s(3), TunnelDestination::Switch(s(2)), "tun3-2", TunnelKind::Vxlan);

        let prefix: IpPrefix = "10.0.0.100/32".parse().unwrap();
        let entry = VrfEntry::new(prefix, RouteOrigin::Static)
            .with_encap(EncapType::Vxlan, None)
            .with_route_path(ip("192.0.2.1"), Some(5001))
            .with_route_path(ip("192.0.2.2"), Some(5001));
        let routes = vec![ExtraRoute::new("vpnA", "A1", prefix, vec![ip("10.0.0.5"), ip("10.0.0.6")])];
        (vpn, entry, routes)
    }

    #[tokio::test]
    async fn test_load_balance_buckets_from_remote_switch() {
        let f = fixture();
        let (vpn, entry, routes) = ecmp_setup(&f).await;
        let mut batch = FlowBatch::new();

        let id = f.groups.build_load_balance(&vpn, s(3), &entry, &routes, &mut batch).await.unwrap();
        assert_eq!(f.groups.load_balance_group(s(3), 100, &entry.prefix), None);
        committed(&f, &mut batch).await;
        assert_eq!(f.groups.load_balance_group(s(3), 100, &entry.prefix), Some(id));

        let FlowOp::InstallGroup(group) = &batch.ops()[0] else {
            panic!("expected a group install");
        };
        assert_eq!(group.kind, GroupKind::LoadBalance);
        assert_eq!(
            group.buckets,
            vec![
                Bucket::new(vec![Action::SetTunnelId(5001), Action::Output("tun3-1".into())]),
                Bucket::new(vec![Action::SetTunnelId(5001), Action::Output("tun3-2".into())]),
            ]
        );
    }

    #[tokio::test]
    async fn test_load_balance_skips_down_tunnel() {
        let f = fixture();
        let (vpn, entry, routes) = ecmp_setup(&f).await;
        f.egress.set_tunnel_up("tun3-2", false);
        let mut batch = FlowBatch::new();

        f.groups.build_load_balance(&vpn, s(3), &entry, &routes, &mut batch).await.unwrap();
        let FlowOp::InstallGroup(group) = &batch.ops()[0] else {
            panic!("expected a group install");
        };
        assert_eq!(group.buckets.len(), 1);
    }

    #[tokio::test]
    async fn test_load_balance_local_bucket_on_owning_switch() {
        let f = fixture();
        let (vpn, entry, routes) = ecmp_setup(&f).await;
        f.egress.add_tunnel(s(1), TunnelDestination::Switch(s(2)), "tun1-2", TunnelKind::Vxlan);
        let mut batch = FlowBatch::new();

        f.groups.build_load_balance(&vpn, s(1), &entry, &routes, &mut batch).await.unwrap();
        let FlowOp::InstallGroup(group) = &batch.ops()[0] else {
            panic!("expected a group install");
        };
        assert_eq!(group.buckets[0], Bucket::new(vec![Action::Output("tap1".into())]));
        assert_eq!(group.buckets.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_load_balance_frees_id_after_last_switch() {
        let f = fixture();
        let (vpn, entry, routes) = ecmp_setup(&f).await;
        f.egress.add_tunnel(s(1), TunnelDestination::Switch(s(2)), "tun1-2", TunnelKind::Vxlan);
        let mut batch = FlowBatch::new();
        f.groups.build_load_balance(&vpn, s(3), &entry, &routes, &mut batch).await.unwrap();
        f.groups.build_load_balance(&vpn, s(1), &entry, &routes, &mut batch).await.unwrap();
        committed(&f, &mut batch).await;
        assert_eq!(f.ids.allocated("groups"), 1);

        let mut batch = FlowBatch::new();
        assert!(f.groups.remove_load_balance(s(3), 100, &entry.prefix, &mut batch).await.unwrap());
        assert!(!f.groups.remove_load_balance(s(3), 100, &entry.prefix, &mut batch).await.unwrap());
        committed(&f, &mut batch).await;
        assert_eq!(f.ids.allocated("groups"), 1);

        let mut batch = FlowBatch::new();
        assert!(f.groups.remove_load_balance(s(1), 100, &entry.prefix, &mut batch).await.unwrap());
        assert_eq!(f.ids.allocated("groups"), 1);
        committed(&f, &mut batch).await;
        assert_eq!(f.ids.allocated("groups"), 0);
        assert!(f.groups.load_balanced_prefixes(s(1), 100).is_empty());
    }

    #[tokio::test]
    async fn test_purge_switch_drops_everything_owned() {
        let f = fixture();
        let mut batch = FlowBatch::new();
        let on_s2 = binding("10.0.0.6", 2, "tap2");
        f.groups.get_or_create_single(100, &on_s2, &mut batch).await.unwrap();
        f.groups.get_or_create_single(100, &on_s2, &mut batch).await.unwrap();
        f.groups.get_or_create_single(100, &binding("10.0.0.5", 1, "tap1"), &mut batch).await.unwrap();
        committed(&f, &mut batch).await;

        let mut batch = FlowBatch::new();
        assert_eq!(f.groups.purge_switch(s(2), 100, &mut batch).await.unwrap(), 1);
        assert_eq!(f.groups.purge_switch(s(2), 100, &mut batch).await.unwrap(), 0);
        committed(&f, &mut batch).await;
        assert_eq!(f.groups.single_group_count(), 1);
        assert_eq!(f.ids.allocated("groups"), 1);

        let mut batch = FlowBatch::new();
        assert_eq!(f.groups.purge_switch(s(2), 100, &mut batch).await.unwrap(), 0);
    }
}
