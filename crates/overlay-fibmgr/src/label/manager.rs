use log::{debug, warn};
use overlay_orch_common::KeyedLock;
use overlay_types::{IpPrefix, SwitchId};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::Result;
use crate::southbound::{IdManager, RoutingStore};
use crate::vpn::LabelRouteInfo;

/// A VPN asking to reference the route installed behind a label.
#[derive(Debug, Clone)]
pub struct LabelClaim {
    pub label: u32,
    pub prefix: IpPrefix,
    pub next_hops: Vec<IpAddr>,
    /// Switch carrying the local install, when known.
    pub switch: Option<SwitchId>,
    pub vpn_id: u32,
    pub vpn_name: String,
    pub rd: String,
    pub self_import: bool,
}

/// Maintains [`LabelRouteInfo`] records in the routing store.
///
/// Every read-modify-write of a record runs under a lock scoped to the
/// label value, independent of which job touches it.
pub struct LabelManager {
    store: Arc<dyn RoutingStore>,
    ids: Arc<dyn IdManager>,
    pool: String,
    locks: KeyedLock<u32>,
}

impl LabelManager {
    pub fn new(store: Arc<dyn RoutingStore>, ids: Arc<dyn IdManager>, pool: impl Into<String>) -> Self {
        Self {
            store,
            ids,
            pool: pool.into(),
            locks: KeyedLock::new(),
        }
    }

    /// ID pool key under which a route's label is allocated.
    pub fn label_key(rd: &str, prefix: &IpPrefix) -> String {
        format!("{}.{}", rd, prefix)
    }

    /// Registers `claim.vpn_name` as a referencer of the label.
    ///
    /// The first claim creates the record. A later claim for the same route
    /// adds a self-importing VPN to the referencing set. A record that
    /// describes a different route is not trusted and is replaced.
    ///
    /// Returns whether a local install path exists for the label.
    pub async fn allocate_or_update_reference(&self, claim: &LabelClaim) -> Result<bool> {
        let _guard = self.locks.lock(claim.label).await;

        match self.store.label_route_info(claim.label).await? {
            Some(mut info)
                if info.prefix == claim.prefix
                    && info.next_hops.first() == claim.next_hops.first() =>
            {
                if claim.self_import && !info.referencing_vpns.contains(&claim.vpn_name) {
                    info.referencing_vpns.insert(claim.vpn_name.clone());
                    let refs = info.referencing_vpns.len();
                    let local = info.switch.is_some();
                    self.store.put_label_route_info(info).await?;
                    audit_log!(AuditRecord::new(
                        AuditCategory::ResourceModify,
                        "LabelManager",
                        "add_label_reference"
                    )
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(claim.label.to_string())
                    .with_object_type("label")
                    .with_details(serde_json::json!({
                        "vpn": claim.vpn_name,
                        "prefix": claim.prefix.to_string(),
                        "references": refs,
                    })));
                    return Ok(local);
                }
                Ok(info.switch.is_some())
            }
            Some(stale) => {
                warn!(
                    "LabelManager: label {} maps to {} via {:?}, expected {} via {:?}; re-registering",
                    claim.label, stale.prefix, stale.next_hops, claim.prefix, claim.next_hops
                );
                self.register(claim).await
            }
            None => self.register(claim).await,
        }
    }

    async fn register(&self, claim: &LabelClaim) -> Result<bool> {
        let info = LabelRouteInfo {
            label: claim.label,
            prefix: claim.prefix,
            next_hops: claim.next_hops.clone(),
            switch: claim.switch,
            parent_vpn_id: claim.vpn_id,
            parent_vpn_rd: claim.rd.clone(),
            referencing_vpns: BTreeSet::from([claim.vpn_name.clone()]),
        };
        self.store.put_label_route_info(info).await?;

        audit_log!(AuditRecord::new(
            AuditCategory::ResourceCreate,
            "LabelManager",
            "register_label"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(claim.label.to_string())
        .with_object_type("label")
        .with_details(serde_json::json!({
            "vpn": claim.vpn_name,
            "rd": claim.rd,
            "prefix": claim.prefix.to_string(),
            "switch": claim.switch.map(|s| s.value()),
        })));
        Ok(claim.switch.is_some())
    }

    /// Drops `vpn_name` from the label's referencing set.
    ///
    /// On the last reference the record is deleted and handed back, read
    /// under the same lock as the delete; the caller owns releasing the
    /// label from its ID pool.
    pub async fn release(&self, label: u32, vpn_name: &str) -> Result<Option<LabelRouteInfo>> {
        let _guard = self.locks.lock(label).await;

        let Some(mut info) = self.store.label_route_info(label).await? else {
            debug!("LabelManager: label {} has no route info", label);
            return Ok(None);
        };
        if !info.referencing_vpns.remove(vpn_name) {
            debug!("LabelManager: {} does not reference label {}", vpn_name, label);
            return Ok(None);
        }

        if info.referencing_vpns.is_empty() {
            self.store.delete_label_route_info(label).await?;
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceDelete,
                "LabelManager",
                "release_label"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(label.to_string())
            .with_object_type("label")
            .with_details(serde_json::json!({
                "vpn": vpn_name,
                "prefix": info.prefix.to_string(),
            })));
            return Ok(Some(info));
        }

        self.store.put_label_route_info(info).await?;
        Ok(None)
    }

    /// Releases the label and, on the last reference, frees the pool ID of
    /// the route the deleted record described.
    pub async fn release_and_free(&self, label: u32, vpn_name: &str) -> Result<bool> {
        let Some(info) = self.release(label, vpn_name).await? else {
            return Ok(false);
        };
        let key = Self::label_key(&info.parent_vpn_rd, &info.prefix);
        self.ids.release_id(&self.pool, &key).await?;
        Ok(true)
    }

    /// Allocates a label for `(rd, prefix)` from the label pool.
    pub async fn allocate(&self, rd: &str, prefix: &IpPrefix) -> Result<u32> {
        let key = Self::label_key(rd, prefix);
        Ok(self.ids.allocate_id(&self.pool, &key).await?)
    }

    pub async fn free(&self, rd: &str, prefix: &IpPrefix) -> Result<()> {
        let key = Self::label_key(rd, prefix);
        Ok(self.ids.release_id(&self.pool, &key).await?)
    }

    pub async fn route_info(&self, label: u32) -> Result<Option<LabelRouteInfo>> {
        Ok(self.store.label_route_info(label).await?)
    }
}
