//! Group table changes made while a job builds its batch.
//!
//! A job only stages reference changes, creations and removals next to its
//! flow operations. The builder folds them into its tables once the batch
//! is committed; a job that fails drops them with the batch.

use overlay_types::{IpPrefix, SwitchId};
use std::collections::HashMap;

use super::builder::{SingleGroup, SingleGroupKey};

pub(crate) type LoadBalanceKey = (SwitchId, u32, IpPrefix);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagedSingle {
    /// Latest version of the group seen or built by the job.
    pub group: SingleGroup,
    /// Net change to the reference count.
    pub refs: i64,
    /// The committed count is dropped before `refs` applies.
    pub purged: bool,
}

impl StagedSingle {
    /// Count the group has once this change applies over `committed`.
    pub fn effective(&self, committed: u32) -> i64 {
        let base = if self.purged { 0 } else { i64::from(committed) };
        base + self.refs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupChanges {
    pub(crate) singles: HashMap<SingleGroupKey, StagedSingle>,
    /// `Some(id)` installs or overwrites, `None` removes.
    pub(crate) load_balance: HashMap<LoadBalanceKey, Option<u64>>,
}

impl GroupChanges {
    pub fn is_empty(&self) -> bool {
        self.singles.is_empty() && self.load_balance.is_empty()
    }

    pub(crate) fn single(&self, key: &SingleGroupKey) -> Option<&StagedSingle> {
        self.singles.get(key)
    }

    pub(crate) fn stage_single(&mut self, key: SingleGroupKey, group: SingleGroup) -> &mut StagedSingle {
        let staged = self.singles.entry(key).or_insert_with(|| StagedSingle {
            group: group.clone(),
            refs: 0,
            purged: false,
        });
        staged.group = group;
        staged
    }

    pub(crate) fn load_balance(&self, key: &LoadBalanceKey) -> Option<Option<u64>> {
        self.load_balance.get(key).copied()
    }

    pub(crate) fn stage_load_balance(&mut self, key: LoadBalanceKey, id: Option<u64>) {
        self.load_balance.insert(key, id);
    }

    /// Appends the changes of a batch built after this one.
    pub fn merge(&mut self, other: GroupChanges) {
        for (key, later) in other.singles {
            match self.singles.get_mut(&key) {
                Some(earlier) if !later.purged => {
                    earlier.refs += later.refs;
                    earlier.group = later.group;
                }
                _ => {
                    self.singles.insert(key, later);
                }
            }
        }
        self.load_balance.extend(other.load_balance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Bucket;
    use pretty_assertions::assert_eq;

    fn key() -> SingleGroupKey {
        SingleGroupKey {
            vpn_id: 100,
            next_hop: "10.0.0.5".parse().unwrap(),
        }
    }

    fn group(id: u64) -> SingleGroup {
        SingleGroup {
            group_id: id,
            switch: SwitchId::new(1),
            bucket: Bucket::new(Vec::new()),
        }
    }

    #[test]
    fn test_effective_count() {
        let mut changes = GroupChanges::default();
        changes.stage_single(key(), group(7)).refs -= 1;
        assert_eq!(changes.single(&key()).unwrap().effective(2), 1);

        let staged = changes.stage_single(key(), group(7));
        staged.purged = true;
        staged.refs = 0;
        assert_eq!(changes.single(&key()).unwrap().effective(2), 0);
    }

    #[test]
    fn test_merge_adds_references_and_keeps_latest_group() {
        let mut first = GroupChanges::default();
        first.stage_single(key(), group(7)).refs += 1;
        let mut second = GroupChanges::default();
        second.stage_single(key(), group(8)).refs += 1;
        let prefix: IpPrefix = "10.0.0.100/32".parse().unwrap();
        second.stage_load_balance((SwitchId::new(3), 100, prefix), Some(9));

        first.merge(second);
        let staged = first.single(&key()).unwrap();
        assert_eq!(staged.refs, 2);
        assert_eq!(staged.group.group_id, 8);
        assert_eq!(first.load_balance(&(SwitchId::new(3), 100, prefix)), Some(Some(9)));
    }

    #[test]
    fn test_merge_of_a_purge_replaces_earlier_changes() {
        let mut first = GroupChanges::default();
        first.stage_single(key(), group(7)).refs += 1;
        let mut second = GroupChanges::default();
        second.stage_single(key(), group(7)).purged = true;

        first.merge(second);
        let staged = first.single(&key()).unwrap();
        assert!(staged.purged);
        assert_eq!(staged.refs, 0);
    }
}
