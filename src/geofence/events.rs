//! Enter/exit callbacks from the OS region monitor.
//!
//! The callback may arrive in a cold process with nothing in memory, so
//! everything is rehydrated from the durable snapshot (the in-memory cache
//! is only a fallback) and permissions are re-queried before gating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::config::LocationConfig;
use crate::ledger::LedgerStore;
use crate::model::{ActivitySnapshot, DomainSnapshot, GeofenceEventType};
use crate::permission::PermissionSync;
use crate::platform::{
    Capability, NotificationCenter, NotificationId, NotificationKind, NotificationRequest,
    NotificationTrigger,
};

/// A normalized region transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceEvent {
    pub event_type: GeofenceEventType,
    pub region_identifier: String,
}

impl GeofenceEvent {
    pub fn new(event_type: GeofenceEventType, region_identifier: impl Into<String>) -> Self {
        Self {
            event_type,
            region_identifier: region_identifier.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawEventType {
    Code(i64),
    Label(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawRegion {
    pub identifier: Option<String>,
}

/// The callback payload as the platform delivers it: numeric or string
/// event type, identifier either nested under `region` or top-level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawGeofenceEvent {
    pub event_type: Option<RawEventType>,
    pub region: Option<RawRegion>,
    pub region_identifier: Option<String>,
}

impl RawGeofenceEvent {
    /// `None` for unknown event types or a missing identifier.
    pub fn normalize(&self) -> Option<GeofenceEvent> {
        let event_type = match self.event_type.as_ref()? {
            RawEventType::Code(c) => GeofenceEventType::from_code(*c)?,
            RawEventType::Label(l) => GeofenceEventType::from_label(l)?,
        };
        let identifier = self
            .region
            .as_ref()
            .and_then(|r| r.identifier.clone())
            .or_else(|| self.region_identifier.clone())
            .filter(|id| !id.trim().is_empty())?;
        Some(GeofenceEvent::new(event_type, identifier))
    }
}

/// Why an event produced no offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SuppressReason {
    NoSnapshot,
    NotificationsDisabled,
    NotificationsNotAuthorized,
    OffersDisabled,
    LocationNotAuthorized,
    UnknownEntity,
    EntityClosed,
    NoTrigger,
    DirectionMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum OfferOutcome {
    Presented { notification_id: NotificationId },
    Suppressed { reason: SuppressReason },
    /// The same entity and direction fired within the spacing window.
    Debounced { last_fired_at: DateTime<Utc> },
    /// The notification couldn't be shown; nothing was recorded.
    Failed,
}

pub struct GeofenceEventHandler<'a> {
    config: &'a LocationConfig,
    store: &'a LedgerStore,
    center: &'a dyn NotificationCenter,
    permissions: &'a PermissionSync<'a>,
    sink: &'a dyn AnalyticsSink,
    fallback: Option<&'a DomainSnapshot>,
}

impl<'a> GeofenceEventHandler<'a> {
    pub fn new(
        config: &'a LocationConfig,
        store: &'a LedgerStore,
        center: &'a dyn NotificationCenter,
        permissions: &'a PermissionSync<'a>,
        sink: &'a dyn AnalyticsSink,
    ) -> Self {
        Self {
            config,
            store,
            center,
            permissions,
            sink,
            fallback: None,
        }
    }

    /// Snapshot to use when the durable one can't be read.
    pub fn with_fallback(mut self, snapshot: Option<&'a DomainSnapshot>) -> Self {
        self.fallback = snapshot;
        self
    }

    fn snapshot(&self) -> Option<DomainSnapshot> {
        match self.store.snapshot() {
            Ok(Some(s)) => Some(s),
            Ok(None) => self.fallback.cloned(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read snapshot, using cached copy");
                self.fallback.cloned()
            }
        }
    }

    fn gate<'s>(
        &self,
        snapshot: &'s DomainSnapshot,
        event: &GeofenceEvent,
        now: DateTime<Utc>,
    ) -> Result<&'s ActivitySnapshot, SuppressReason> {
        // Both syncs run unconditionally so the persisted statuses stay fresh.
        let notifications = self.permissions.sync(Capability::Notifications, now);
        let location = self.permissions.sync(Capability::Location, now);

        let prefs = &snapshot.preferences;
        if !prefs.notifications_enabled {
            return Err(SuppressReason::NotificationsDisabled);
        }
        if !notifications.is_authorized() {
            return Err(SuppressReason::NotificationsNotAuthorized);
        }
        if !prefs.location_offers_enabled {
            return Err(SuppressReason::OffersDisabled);
        }
        if !location.is_authorized() {
            return Err(SuppressReason::LocationNotAuthorized);
        }
        let activity = snapshot
            .activity(&event.region_identifier)
            .ok_or(SuppressReason::UnknownEntity)?;
        if activity.status.is_closed() {
            return Err(SuppressReason::EntityClosed);
        }
        let trigger = activity.location_trigger.as_ref().ok_or(SuppressReason::NoTrigger)?;
        if !event.event_type.matches(trigger.direction()) {
            return Err(SuppressReason::DirectionMismatch);
        }
        Ok(activity)
    }

    pub fn handle(&self, event: &GeofenceEvent, now: DateTime<Utc>) -> OfferOutcome {
        let Some(snapshot) = self.snapshot() else {
            return suppressed(event, SuppressReason::NoSnapshot);
        };
        let activity = match self.gate(&snapshot, event, now) {
            Ok(a) => a,
            Err(reason) => return suppressed(event, reason),
        };

        let spacing = self.config.min_offer_spacing();
        let offers = match self.store.load() {
            Ok(l) => l.location_offers,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read offer ledger");
                Default::default()
            }
        };
        if !offers.can_fire(&activity.id, event.event_type, now, spacing) {
            if let Some(last_fired_at) = offers.last_fired_at(&activity.id, event.event_type) {
                tracing::debug!(entity = %activity.id, event = %event.event_type, "location offer debounced");
                return OfferOutcome::Debounced { last_fired_at };
            }
        }

        let request = offer_request(activity, event.event_type);
        let notification_id = match self.center.schedule(&request) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(entity = %activity.id, error = %e, "failed to present location offer");
                return OfferOutcome::Failed;
            }
        };

        let recorded = self
            .store
            .transact(|l| l.location_offers.record(&activity.id, event.event_type, now));
        if let Err(e) = recorded {
            tracing::warn!(entity = %activity.id, error = %e, "failed to record location offer");
        }
        self.sink.emit(&AnalyticsEvent::LocationOfferPresented {
            entity_id: activity.id.clone(),
            event: event.event_type,
            notification_id: notification_id.clone(),
            presented_at: now,
        });
        tracing::info!(entity = %activity.id, event = %event.event_type, "location offer presented");
        OfferOutcome::Presented { notification_id }
    }
}

fn suppressed(event: &GeofenceEvent, reason: SuppressReason) -> OfferOutcome {
    tracing::debug!(region = %event.region_identifier, ?reason, "geofence event suppressed");
    OfferOutcome::Suppressed { reason }
}

fn offer_request(activity: &ActivitySnapshot, event: GeofenceEventType) -> NotificationRequest {
    let title = activity.display_title();
    let (title, body) = match event {
        GeofenceEventType::Enter => (
            format!("You're near {title}"),
            "Good moment to get it done?".to_string(),
        ),
        GeofenceEventType::Exit => (
            format!("Leaving {title}"),
            "Want to mark it done before you go?".to_string(),
        ),
    };
    NotificationRequest {
        kind: NotificationKind::LocationOffer { event },
        title,
        body,
        entity_id: Some(activity.id.clone()),
        trigger: NotificationTrigger::Immediate,
    }
}
