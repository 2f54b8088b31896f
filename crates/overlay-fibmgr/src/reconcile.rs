//! Bulk re-driving of the install paths when the fabric changes.
//!
//! Switch join and leave replay one VPN table scoped to the switch. Tunnel
//! events re-drive the remote installs that were waiting on the tunnel and
//! rebuild the load-balance groups of the source switch, so that a down
//! tunnel never keeps a bucket. Every operation commits one batch.

use itertools::Itertools;
use log::{debug, info, warn};
use overlay_orch_common::Dependency;
use overlay_types::SwitchId;
use std::net::IpAddr;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::{FibError, Result};
use crate::flow::FlowBatch;
use crate::route::{classify, FibManager, InstallMode, PendingRoute, RouteHandler};
use crate::southbound::TunnelDestination;
use crate::vpn::{VpnInstance, VrfEntry};

impl FibManager {
    async fn reconciled_vpn(&self, vpn_id: u32, rd: &str) -> Result<Option<VpnInstance>> {
        let vpn = self.store.vpn_instance_by_rd(rd).await?;
        if let Some(vpn) = &vpn {
            if vpn.vpn_id != vpn_id {
                warn!(
                    "FibManager: rd {} belongs to VPN {} ({}), not {}",
                    rd, vpn.name, vpn.vpn_id, vpn_id
                );
            }
        }
        Ok(vpn)
    }

    /// Replays every route of the VPN onto a switch that joined it.
    ///
    /// Group references are not taken again, so a join for a switch that
    /// never left is harmless. Routes that cannot be programmed yet are
    /// logged and skipped; the others still go in. Returns the number of
    /// routes replayed.
    pub async fn on_switch_join(&self, switch: SwitchId, vpn_id: u32, rd: &str) -> Result<usize> {
        let Some(vpn) = self.reconciled_vpn(vpn_id, rd).await? else {
            return Err(FibError::VpnNotFound(rd.to_string()));
        };
        let entries = self.store.vrf_entries(rd).await?;
        info!(
            "FibManager: switch {} joined {}, replaying {} routes",
            switch,
            vpn.name,
            entries.len()
        );

        let mut batch = FlowBatch::new();
        let mut replayed = 0;
        for entry in &entries {
            match self
                .add_route(&vpn, rd, entry, Some(switch), InstallMode::Replay, &mut batch)
                .await
            {
                Ok(()) => replayed += 1,
                Err(err) if err.is_soft() => {
                    warn!("FibManager: {} not replayed on switch {}: {}", entry.prefix, switch, err)
                }
                Err(err) => return Err(err),
            }
        }
        self.commit(batch).await?;

        audit_log!(AuditRecord::new(AuditCategory::Reconciliation, "FibManager", "switch_join")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(switch.to_string())
            .with_object_type("switch")
            .with_details(serde_json::json!({
                "vpn": vpn.name,
                "rd": rd,
                "routes": replayed,
            })));
        Ok(replayed)
    }

    /// Removes everything the VPN programmed on a switch that left it.
    ///
    /// Labels are kept: the routes still exist. Group records of the switch
    /// are purged so that a later join starts from a clean count. Leaving
    /// twice is a no-op the second time.
    pub async fn on_switch_leave(&self, switch: SwitchId, vpn_id: u32, rd: &str) -> Result<usize> {
        let Some(vpn) = self.reconciled_vpn(vpn_id, rd).await? else {
            info!("FibManager: no VPN for rd {}, nothing to clean on switch {}", rd, switch);
            return Ok(0);
        };
        let entries = self.store.vrf_entries(rd).await?;

        let mut batch = FlowBatch::new();
        for entry in &entries {
            self.remove_route(&vpn, rd, entry, Some(switch), &mut batch)
                .await?;
        }
        let purged = self.groups.purge_switch(switch, vpn.vpn_id, &mut batch).await?;
        let unparked = self.drop_pending(|key| key.switch == switch && key.rd == rd);
        self.commit(batch).await?;

        audit_log!(AuditRecord::new(AuditCategory::Reconciliation, "FibManager", "switch_leave")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(switch.to_string())
            .with_object_type("switch")
            .with_details(serde_json::json!({
                "vpn": vpn.name,
                "rd": rd,
                "routes": entries.len(),
                "groups_purged": purged,
                "pending_dropped": unparked,
            })));
        Ok(entries.len())
    }

    /// A tunnel from `source` came up. Returns the number of parked routes
    /// re-driven.
    pub async fn on_tunnel_endpoint_up(
        &self,
        source: SwitchId,
        destination: TunnelDestination,
    ) -> Result<usize> {
        let mut ready = self.satisfy(&Dependency::TunnelFrom(source));
        if let TunnelDestination::Ip(remote) = destination {
            ready.extend(self.satisfy(&Dependency::ExternalTunnel {
                switch: source,
                remote,
            }));
        }
        debug!(
            "FibManager: tunnel {} -> {} up, {} parked routes ready",
            source,
            destination,
            ready.len()
        );

        let mut batch = FlowBatch::new();
        for route in &ready {
            let Some(vpn) = self.store.vpn_instance_by_rd(&route.rd).await? else {
                continue;
            };
            self.install_remote_or_park(
                &vpn,
                &route.rd,
                &route.entry,
                route.switch,
                route.dependency.clone(),
                &mut batch,
            )
            .await?;
        }
        self.rebalance_switch(source, &mut batch).await?;
        self.commit(batch).await?;
        Ok(ready.len())
    }

    /// A tunnel from `source` went down or away. Remote routes on `source`
    /// that relied on it are re-resolved; the ones left without egress are
    /// withdrawn and parked. Returns the number of routes withdrawn.
    pub async fn on_tunnel_endpoint_down(
        &self,
        source: SwitchId,
        destination: TunnelDestination,
    ) -> Result<usize> {
        let mut batch = FlowBatch::new();
        self.rebalance_switch(source, &mut batch).await?;

        let dependency = match destination {
            TunnelDestination::Ip(remote) => Dependency::ExternalTunnel {
                switch: source,
                remote,
            },
            TunnelDestination::Switch(_) => Dependency::TunnelFrom(source),
        };

        let mut withdrawn = 0;
        for vpn in self.vpns_on(source).await? {
            let links = self.store.inter_vpn_links().await?;
            for entry in self.store.vrf_entries(&vpn.rd).await? {
                if classify(&vpn, &entry, &links) != RouteHandler::Generic
                    || self
                        .groups
                        .load_balance_group(source, vpn.vpn_id, &entry.prefix)
                        .is_some()
                {
                    continue;
                }
                let footprint = self.plan_local(&vpn, &entry).await?.switches();
                if footprint.contains(&source) {
                    continue;
                }
                let affected = match destination {
                    TunnelDestination::Ip(remote) => entry.next_hops().contains(&remote),
                    TunnelDestination::Switch(far) => footprint.contains(&far),
                };
                if !affected {
                    continue;
                }

                let mut attempt = FlowBatch::new();
                match self
                    .install_remote(&vpn, &vpn.rd, &entry, source, &mut attempt)
                    .await
                {
                    Ok(()) => batch.extend(attempt),
                    Err(err) if err.is_soft() => {
                        warn!("FibManager: {}; withdrawn until {}", err, dependency);
                        self.remove_remote(&vpn, &entry, source, &mut batch).await?;
                        self.park(PendingRoute {
                            switch: source,
                            rd: vpn.rd.clone(),
                            entry: entry.clone(),
                            dependency: dependency.clone(),
                        });
                        withdrawn += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.commit(batch).await?;
        Ok(withdrawn)
    }

    async fn vpns_on(&self, switch: SwitchId) -> Result<Vec<VpnInstance>> {
        Ok(self
            .store
            .vpn_instances()
            .await?
            .into_iter()
            .filter(|vpn| vpn.all_switches().contains(&switch))
            .collect())
    }

    /// Rebuilds every load-balance group held on `switch` against the
    /// current tunnel states.
    async fn rebalance_switch(&self, switch: SwitchId, batch: &mut FlowBatch) -> Result<()> {
        for vpn in self.vpns_on(switch).await? {
            for prefix in self.groups.load_balanced_prefixes(switch, vpn.vpn_id) {
                let Some(entry) = self.store.vrf_entry(&vpn.rd, &prefix).await? else {
                    continue;
                };
                self.rebuild_load_balance(&vpn, &entry, switch, batch).await?;
            }
        }
        Ok(())
    }

    async fn rebuild_load_balance(
        &self,
        vpn: &VpnInstance,
        entry: &VrfEntry,
        switch: SwitchId,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        if !entry.is_bgp() {
            let routes = self.store.extra_routes(&vpn.name, &entry.prefix).await?;
            self.groups
                .build_load_balance(vpn, switch, entry, &routes, batch)
                .await?;
            return Ok(());
        }

        let mut attempt = FlowBatch::new();
        match self
            .install_remote(vpn, &vpn.rd, entry, switch, &mut attempt)
            .await
        {
            Ok(()) => {
                batch.extend(attempt);
                Ok(())
            }
            Err(err) if err.is_soft() => {
                warn!("FibManager: {}; load balancing withdrawn", err);
                self.remove_remote(vpn, entry, switch, batch).await?;
                self.park(PendingRoute {
                    switch,
                    rd: vpn.rd.clone(),
                    entry: entry.clone(),
                    dependency: Dependency::TunnelFrom(switch),
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Installs remote rules on `switch` for every route of the VPN whose
    /// next hops include the external gateway `remote_ip`.
    pub async fn populate_external_routes(
        &self,
        switch: SwitchId,
        vpn_id: u32,
        rd: &str,
        local_ip: IpAddr,
        remote_ip: IpAddr,
    ) -> Result<usize> {
        let Some(vpn) = self.reconciled_vpn(vpn_id, rd).await? else {
            return Err(FibError::VpnNotFound(rd.to_string()));
        };
        let entries: Vec<VrfEntry> = self
            .store
            .vrf_entries(rd)
            .await?
            .into_iter()
            .filter(|entry| entry.next_hops().contains(&remote_ip))
            .collect();
        debug!(
            "FibManager: populating {} routes of {} on switch {} ({} -> {})",
            entries.len(),
            vpn.name,
            switch,
            local_ip,
            remote_ip
        );

        let mut batch = FlowBatch::new();
        let mut installed = 0;
        for entry in &entries {
            let dependency = Dependency::ExternalTunnel {
                switch,
                remote: remote_ip,
            };
            if self
                .install_remote_or_park(&vpn, rd, entry, switch, dependency, &mut batch)
                .await?
            {
                installed += 1;
            }
        }
        self.commit(batch).await?;
        Ok(installed)
    }

    /// Inverse of [`populate_external_routes`](Self::populate_external_routes).
    pub async fn cleanup_external_routes(
        &self,
        switch: SwitchId,
        vpn_id: u32,
        rd: &str,
        local_ip: IpAddr,
        remote_ip: IpAddr,
    ) -> Result<usize> {
        let Some(vpn) = self.reconciled_vpn(vpn_id, rd).await? else {
            return Ok(0);
        };
        let entries = self.store.vrf_entries(rd).await?;

        let mut batch = FlowBatch::new();
        let mut removed = Vec::new();
        for entry in entries
            .iter()
            .filter(|entry| entry.next_hops().contains(&remote_ip))
        {
            if self.plan_local(&vpn, entry).await?.switches().contains(&switch) {
                continue;
            }
            self.remove_remote(&vpn, entry, switch, &mut batch).await?;
            removed.push(entry.prefix);
        }
        self.drop_pending(|key| key.switch == switch && key.rd == rd && removed.contains(&key.prefix));
        debug!(
            "FibManager: cleaned {} on switch {} ({} -> {})",
            removed.iter().join(", "),
            switch,
            local_ip,
            remote_ip
        );
        self.commit(batch).await?;
        Ok(removed.len())
    }
}
