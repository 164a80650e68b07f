//! Outbound analytics events.
//!
//! The engine emits typed [`AnalyticsEvent`]s to an [`AnalyticsSink`]; the
//! host decides where they go. Sinks ship for structured logs and
//! in-memory collection (testing).
//!
//! Events are emitted only after the ledger write recording them committed,
//! so a crash between the two re-emits on the next pass rather than losing
//! the occurrence.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{GeofenceEventType, NudgeType};
use crate::platform::NotificationId;
use crate::time::DateKey;

// ── Event types ─────────────────────────────────────────────────────────

/// What woke the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconcileSource {
    BackgroundTask,
    AppLaunch,
    Foreground,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum AnalyticsEvent {
    /// A notification is believed to have fired. Emitted once per occurrence.
    NotificationFiredEstimated {
        nudge_type: NudgeType,
        #[serde(skip_serializing_if = "Option::is_none")]
        notification_id: Option<NotificationId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scheduled_for: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        date_key: Option<DateKey>,
        detected_at: DateTime<Utc>,
        source: ReconcileSource,
    },
    /// An arrive/leave offer was shown.
    LocationOfferPresented {
        entity_id: String,
        event: GeofenceEventType,
        notification_id: NotificationId,
        presented_at: DateTime<Utc>,
    },
}

// ── AnalyticsSink trait ─────────────────────────────────────────────────

/// A destination for analytics events.
pub trait AnalyticsSink: Send + Sync {
    fn emit(&self, event: &AnalyticsEvent);

    fn emit_batch(&self, events: &[AnalyticsEvent]) {
        for e in events {
            self.emit(e);
        }
    }
}

// ── TracingSink ─────────────────────────────────────────────────────────

/// Logs each event at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AnalyticsSink for TracingSink {
    fn emit(&self, event: &AnalyticsEvent) {
        match event {
            AnalyticsEvent::NotificationFiredEstimated {
                nudge_type,
                notification_id,
                entity_id,
                date_key,
                source,
                ..
            } => {
                tracing::info!(
                    nudge_type = %nudge_type,
                    notification_id = notification_id.as_deref().unwrap_or("-"),
                    entity_id = entity_id.as_deref().unwrap_or("-"),
                    date_key = %date_key.map(|d| d.to_string()).unwrap_or_default(),
                    source = ?source,
                    "notification fired (estimated)"
                );
            }
            AnalyticsEvent::LocationOfferPresented {
                entity_id,
                event,
                notification_id,
                ..
            } => {
                tracing::info!(
                    entity_id = %entity_id,
                    event = %event,
                    notification_id = %notification_id,
                    "location offer presented"
                );
            }
        }
    }
}

// ── VecSink ─────────────────────────────────────────────────────────────

/// Collects events in memory for testing.
#[derive(Debug, Default)]
pub struct VecSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events of one nudge type.
    pub fn fired(&self, nudge_type: NudgeType) -> Vec<AnalyticsEvent> {
        self.events()
            .into_iter()
            .filter(|e| {
                matches!(e, AnalyticsEvent::NotificationFiredEstimated { nudge_type: t, .. } if *t == nudge_type)
            })
            .collect()
    }
}

impl AnalyticsSink for VecSink {
    fn emit(&self, event: &AnalyticsEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_instant;

    fn fired(t: NudgeType) -> AnalyticsEvent {
        AnalyticsEvent::NotificationFiredEstimated {
            nudge_type: t,
            notification_id: Some("local-1".into()),
            entity_id: None,
            scheduled_for: None,
            date_key: Some(DateKey::parse("2026-01-01").unwrap()),
            detected_at: parse_instant("2026-01-01T10:00:00Z").unwrap(),
            source: ReconcileSource::BackgroundTask,
        }
    }

    #[test]
    fn vec_sink_collects() {
        let sink = VecSink::new();
        sink.emit_batch(&[fired(NudgeType::DailyShowUp), fired(NudgeType::DailyFocus)]);
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.fired(NudgeType::DailyFocus).len(), 1);
    }

    #[test]
    fn json_shape() {
        let json = serde_json::to_value(fired(NudgeType::DailyShowUp)).unwrap();
        assert_eq!(json["type"], "NotificationFiredEstimated");
        assert_eq!(json["nudgeType"], "dailyShowUp");
        assert_eq!(json["dateKey"], "2026-01-01");
        assert_eq!(json["source"], "backgroundTask");
        assert!(json.get("entityId").is_none());
    }

    #[test]
    fn tracing_sink_does_not_panic() {
        TracingSink.emit(&fired(NudgeType::GoalNudge));
    }
}
