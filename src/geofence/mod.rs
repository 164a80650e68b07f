//! Geofence regions derived from activity location triggers.
//!
//! Regions are never persisted: every pass rebuilds the full desired set
//! from the snapshot and compares its content signature against the last
//! applied one. See [`reconciler`] for the OS side and [`events`] for the
//! enter/exit callback path.

pub mod events;
pub mod reconciler;

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::config::LocationConfig;
use crate::model::{ActivitySnapshot, DomainSnapshot};

pub use events::{GeofenceEvent, GeofenceEventHandler, OfferOutcome, RawGeofenceEvent, SuppressReason};
pub use reconciler::{RegionReconciler, RegionSyncOutcome, StopReason};

/// A circular region handed to the OS monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceRegion {
    /// The activity id.
    pub identifier: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub notify_on_enter: bool,
    pub notify_on_exit: bool,
}

/// Build the region for one activity, or `None` if it isn't eligible.
pub fn eligible_region(activity: &ActivitySnapshot, config: &LocationConfig) -> Option<GeofenceRegion> {
    if activity.status.is_closed() {
        return None;
    }
    let trigger = activity.location_trigger.as_ref()?;
    let (lat, lon) = (trigger.latitude, trigger.longitude);
    if !lat.is_finite() || !lon.is_finite() || !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    let radius = match trigger.radius_m {
        Some(r) if r.is_finite() && r > 0.0 => r,
        Some(_) => return None,
        None => config.default_radius_m,
    };
    let direction = trigger.direction();
    Some(GeofenceRegion {
        identifier: activity.id.clone(),
        latitude: lat,
        longitude: lon,
        radius_m: radius.clamp(config.min_radius_m, config.max_radius_m),
        notify_on_enter: direction.notify_on_enter(),
        notify_on_exit: direction.notify_on_exit(),
    })
}

/// Regions for every eligible activity, in snapshot order, capped at `max_regions`.
///
/// A repeated activity id keeps its first occurrence.
pub fn desired_regions(snapshot: &DomainSnapshot, config: &LocationConfig) -> Vec<GeofenceRegion> {
    let mut seen = HashSet::new();
    snapshot
        .activities
        .iter()
        .filter_map(|a| eligible_region(a, config))
        .filter(|r| seen.insert(r.identifier.clone()))
        .take(config.max_regions)
        .collect()
}

fn round5(x: f64) -> f64 {
    // Adding 0.0 turns -0.0 into 0.0 so both format alike.
    (x * 1e5).round() / 1e5 + 0.0
}

/// Content signature of a region set: order-independent, coordinates
/// compared at 5 decimal places (about a metre).
pub fn region_signature(regions: &[GeofenceRegion]) -> String {
    let mut sorted: Vec<&GeofenceRegion> = regions.iter().collect();
    sorted.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    let mut sig = String::new();
    for r in sorted {
        let _ = write!(
            sig,
            "{}@{:.5},{:.5}r{:.1}{}{};",
            r.identifier,
            round5(r.latitude),
            round5(r.longitude),
            r.radius_m,
            if r.notify_on_enter { "E" } else { "-" },
            if r.notify_on_exit { "X" } else { "-" },
        );
    }
    sig
}
