//! Persistence and recovery tests for the nudge engine.
//!
//! These tests verify that ledgers and the domain snapshot survive an engine
//! restart, so a cold background process makes the same decisions a warm
//! one would.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use nudge_engine::analytics::VecSink;
use nudge_engine::config::NudgeConfig;
use nudge_engine::engine::{NudgeEngine, Platform};
use nudge_engine::geofence::{GeofenceEvent, OfferOutcome};
use nudge_engine::ledger::keys;
use nudge_engine::model::{ActivitySnapshot, DomainSnapshot, GeofenceEventType, LocationTrigger, NudgeType, Preferences};
use nudge_engine::platform::{
    InMemoryGeofenceMonitor, InMemoryNotificationCenter, InMemoryPermissions, NotificationKind,
};
use nudge_engine::scheduler::ScheduleOutcome;
use nudge_engine::store::DurableStore;
use nudge_engine::time::{ManualClock, parse_instant};

fn utc(s: &str) -> DateTime<Utc> {
    parse_instant(s).unwrap()
}

/// OS-side state outlives the process; the engine does not.
struct Device {
    center: Arc<InMemoryNotificationCenter>,
    monitor: Arc<InMemoryGeofenceMonitor>,
    perms: Arc<InMemoryPermissions>,
    sink: Arc<VecSink>,
}

impl Device {
    fn new() -> Self {
        Self {
            center: Arc::new(InMemoryNotificationCenter::new()),
            monitor: Arc::new(InMemoryGeofenceMonitor::new()),
            perms: Arc::new(InMemoryPermissions::granted()),
            sink: Arc::new(VecSink::new()),
        }
    }

    fn boot(&self, dir: &Path, now: &str) -> NudgeEngine {
        let config = NudgeConfig {
            data_dir: Some(dir.to_path_buf()),
            ..NudgeConfig::memory_only(0)
        };
        let platform = Platform::new(self.center.clone(), self.monitor.clone(), self.perms.clone())
            .with_analytics(self.sink.clone());
        NudgeEngine::open(config, platform, Arc::new(ManualClock::new(utc(now)))).unwrap()
    }
}

fn gym_snapshot() -> DomainSnapshot {
    let mut gym = ActivitySnapshot::new("gym");
    gym.location_trigger = Some(LocationTrigger {
        latitude: 48.1351,
        longitude: 11.582,
        radius_m: None,
        trigger: Some("arrive".into()),
    });
    gym.reminder_at = Some(utc("2026-01-01T09:30:00Z"));
    DomainSnapshot {
        activities: vec![gym],
        preferences: Preferences {
            location_offers_enabled: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn ledgers_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let device = Device::new();

    // First process: schedule everything.
    let before = {
        let engine = device.boot(dir.path(), "2026-01-01T07:00:00Z");
        assert!(engine.store().is_durable());
        let report = engine.on_preferences_changed(gym_snapshot());
        assert!(report.system.iter().all(|(_, o)| o.is_scheduled()));
        assert_eq!(report.reminders.scheduled, 1);
        engine.store().load().unwrap()
    };

    // Second process: same ledgers, nothing rescheduled.
    let engine = device.boot(dir.path(), "2026-01-01T07:05:00Z");
    assert_eq!(engine.store().load().unwrap(), before);
    assert_eq!(engine.current_snapshot().unwrap().activities.len(), 1);
    let report = engine.on_preferences_changed(gym_snapshot());
    assert!(report.system.iter().all(|(_, o)| *o == ScheduleOutcome::Unchanged));
    assert_eq!(report.reminders.unchanged, 1);
    assert_eq!(device.center.pending().len(), 4);
}

#[test]
fn cold_wake_infers_each_firing_once() {
    let dir = tempfile::TempDir::new().unwrap();
    let device = Device::new();
    {
        let engine = device.boot(dir.path(), "2026-01-01T07:00:00Z");
        engine.on_preferences_changed(gym_snapshot());
    }

    device.center.deliver_due(utc("2026-01-01T10:00:00Z"));
    {
        let engine = device.boot(dir.path(), "2026-01-01T10:00:00Z");
        let report = engine.on_background_wake();
        assert!(!report.aborted);
        // Reminder at 09:30 plus the 08:00 show-up estimate.
        assert_eq!(report.fired, 2);
    }
    {
        let engine = device.boot(dir.path(), "2026-01-01T10:30:00Z");
        assert_eq!(engine.on_background_wake().fired, 0);
    }
    assert_eq!(device.sink.fired(NudgeType::ActivityReminder).len(), 1);
    assert_eq!(device.sink.fired(NudgeType::DailyShowUp).len(), 1);
}

#[test]
fn cold_geofence_callback_reads_persisted_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let device = Device::new();
    {
        let engine = device.boot(dir.path(), "2026-01-01T07:00:00Z");
        engine.publish_snapshot(gym_snapshot()).unwrap();
    }

    let arrive = GeofenceEvent::new(GeofenceEventType::Enter, "gym");
    {
        let engine = device.boot(dir.path(), "2026-01-01T12:00:00Z");
        assert!(matches!(engine.on_geofence_event(&arrive), OfferOutcome::Presented { .. }));
    }
    // A restart inside the window is still debounced.
    let engine = device.boot(dir.path(), "2026-01-01T12:10:00Z");
    assert!(matches!(engine.on_geofence_event(&arrive), OfferOutcome::Debounced { .. }));
    assert_eq!(device.center.presented().len(), 1);
}

#[test]
fn corrupt_ledger_reads_as_empty() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let store = DurableStore::open(dir.path()).unwrap();
        store.put(keys::SYSTEM.as_bytes(), b"{not json").unwrap();
        store.put(keys::DAILY_FOCUS.as_bytes(), b"\x00\x01").unwrap();
    }

    let device = Device::new();
    let engine = device.boot(dir.path(), "2026-01-01T07:00:00Z");
    let ledgers = engine.store().load().unwrap();
    assert!(ledgers.system.sent_count_by_date.is_empty());
    assert!(!ledgers.daily_focus.is_armed());

    engine.publish_snapshot(DomainSnapshot::default()).unwrap();
    assert!(engine.schedule_daily_focus(None).unwrap().is_scheduled());
    // The next write replaces the corrupt document.
    assert!(engine.store().load().unwrap().daily_focus.is_armed());
}

#[test]
fn reset_clears_ledgers_but_keeps_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let device = Device::new();
    let engine = device.boot(dir.path(), "2026-01-01T07:00:00Z");
    engine.on_preferences_changed(gym_snapshot());
    assert!(engine.reset(false).unwrap() > 0);
    assert_eq!(engine.store().load().unwrap(), Default::default());
    assert!(engine.current_snapshot().is_some());

    engine.reset(true).unwrap();
    assert!(engine.current_snapshot().is_none());
}

#[test]
fn non_finite_trigger_does_not_reset_preferences_on_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let device = Device::new();

    let mut snapshot = gym_snapshot();
    snapshot.activities[0].location_trigger.as_mut().unwrap().latitude = f64::NAN;
    let mut park = ActivitySnapshot::new("park");
    park.location_trigger = Some(LocationTrigger {
        latitude: 48.17,
        longitude: 11.6,
        radius_m: None,
        trigger: None,
    });
    snapshot.activities.push(park);
    for t in [NudgeType::DailyShowUp, NudgeType::DailyFocus, NudgeType::GoalNudge] {
        snapshot.preferences = snapshot.preferences.with_type_enabled(t, false);
    }
    {
        let engine = device.boot(dir.path(), "2026-01-01T07:00:00Z");
        engine.publish_snapshot(snapshot).unwrap();
    }

    let engine = device.boot(dir.path(), "2026-01-01T10:00:00Z");
    let cold = engine.current_snapshot().unwrap();
    assert_eq!(cold.activities.len(), 2);
    assert!(cold.activities[0].location_trigger.is_none());
    assert!(cold.activities[1].location_trigger.is_some());
    assert!(!cold.preferences.is_enabled(NudgeType::DailyFocus));

    assert!(!engine.on_background_wake().aborted);
    let system_pending = device
        .center
        .pending()
        .into_iter()
        .filter(|(_, r)| matches!(r.kind, NotificationKind::Nudge { nudge_type } if nudge_type.is_system()))
        .count();
    assert_eq!(system_pending, 0);
}

#[test]
fn undecodable_snapshot_aborts_cold_wake() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let store = DurableStore::open(dir.path()).unwrap();
        store.put(keys::SNAPSHOT.as_bytes(), br#"{"activities":42}"#).unwrap();
    }

    let device = Device::new();
    let engine = device.boot(dir.path(), "2026-01-01T07:00:00Z");
    assert!(engine.current_snapshot().is_none());
    assert!(engine.on_background_wake().aborted);
    assert!(device.center.pending().is_empty());
}
