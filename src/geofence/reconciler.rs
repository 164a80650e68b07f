//! Keeps OS region monitoring equal to the desired region set.
//!
//! Each pass walks a gating chain and fails closed: the first gate that
//! doesn't hold stops monitoring entirely. When every gate holds, the
//! desired set's signature is compared with the last applied one and
//! monitoring is only restarted (stop, then start) when they differ or the
//! OS isn't monitoring at all.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{desired_regions, region_signature};
use crate::config::LocationConfig;
use crate::ledger::LedgerStore;
use crate::model::DomainSnapshot;
use crate::permission::PermissionSync;
use crate::platform::{Capability, GeofenceMonitor};

/// Which gate closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    OffersDisabled,
    NotificationsDisabled,
    NotificationsNotAuthorized,
    LocationNotAuthorized,
    GeofencingUnavailable,
    NoEligibleEntities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum RegionSyncOutcome {
    Stopped { reason: StopReason },
    Unchanged { count: usize },
    Applied { count: usize },
    /// The OS rejected the new set; the applied signature was cleared.
    Failed,
}

/// One pass of region reconciliation.
pub struct RegionReconciler<'a> {
    config: &'a LocationConfig,
    store: &'a LedgerStore,
    monitor: &'a dyn GeofenceMonitor,
    permissions: &'a PermissionSync<'a>,
}

impl<'a> RegionReconciler<'a> {
    pub fn new(
        config: &'a LocationConfig,
        store: &'a LedgerStore,
        monitor: &'a dyn GeofenceMonitor,
        permissions: &'a PermissionSync<'a>,
    ) -> Self {
        Self {
            config,
            store,
            monitor,
            permissions,
        }
    }

    /// First closed gate, if any. Permission gates re-sync with the OS.
    fn gate(&self, snapshot: &DomainSnapshot, now: DateTime<Utc>) -> Option<StopReason> {
        let prefs = &snapshot.preferences;
        if !prefs.location_offers_enabled {
            return Some(StopReason::OffersDisabled);
        }
        if !prefs.notifications_enabled {
            return Some(StopReason::NotificationsDisabled);
        }
        if !self.permissions.sync(Capability::Notifications, now).is_authorized() {
            return Some(StopReason::NotificationsNotAuthorized);
        }
        if !self.permissions.sync(Capability::Location, now).is_authorized() {
            return Some(StopReason::LocationNotAuthorized);
        }
        if !self.monitor.is_available() {
            return Some(StopReason::GeofencingUnavailable);
        }
        None
    }

    pub fn sync(&self, snapshot: &DomainSnapshot, now: DateTime<Utc>) -> RegionSyncOutcome {
        if let Some(reason) = self.gate(snapshot, now) {
            return self.stop(reason);
        }
        let regions = desired_regions(snapshot, self.config);
        if regions.is_empty() {
            return self.stop(StopReason::NoEligibleEntities);
        }

        let signature = region_signature(&regions);
        let applied = match self.store.load() {
            Ok(l) => l.geofence,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read applied regions");
                Default::default()
            }
        };
        let monitoring = self.monitor.is_monitoring().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "monitoring state query failed");
            false
        });
        if monitoring && applied.signature.as_deref() == Some(signature.as_str()) {
            return RegionSyncOutcome::Unchanged {
                count: regions.len(),
            };
        }

        if let Err(e) = self.monitor.stop() {
            tracing::warn!(error = %e, "stop before restart failed");
        }
        match self.monitor.start(&regions) {
            Ok(()) => {
                let count = regions.len();
                let written = self.store.transact(|l| {
                    l.geofence.signature = Some(signature);
                    l.geofence.region_count = count;
                    l.geofence.applied_at = Some(now);
                });
                if let Err(e) = written {
                    tracing::warn!(error = %e, "failed to record applied regions");
                }
                tracing::info!(count, "geofence monitoring restarted");
                RegionSyncOutcome::Applied { count }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to start geofence monitoring");
                self.clear_signature();
                RegionSyncOutcome::Failed
            }
        }
    }

    /// Stop monitoring and forget the applied set.
    pub fn stop(&self, reason: StopReason) -> RegionSyncOutcome {
        let applied = self.store.load().map(|l| l.geofence.signature.is_some()).unwrap_or(true);
        let monitoring = self.monitor.is_monitoring().unwrap_or(true);
        if applied || monitoring {
            if let Err(e) = self.monitor.stop() {
                tracing::warn!(error = %e, "failed to stop geofence monitoring");
            }
            self.clear_signature();
            tracing::info!(?reason, "geofence monitoring stopped");
        }
        RegionSyncOutcome::Stopped { reason }
    }

    fn clear_signature(&self) {
        if let Err(e) = self.store.transact(|l| l.geofence.clear()) {
            tracing::warn!(error = %e, "failed to clear applied regions");
        }
    }
}
