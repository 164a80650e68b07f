//! End-to-end scheduling tests: policy limits, suppression, and delivery
//! reconciliation driven through the engine entry points.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use nudge_engine::analytics::{AnalyticsEvent, VecSink};
use nudge_engine::config::NudgeConfig;
use nudge_engine::engine::{NudgeEngine, Platform};
use nudge_engine::model::{ActivitySnapshot, DomainSnapshot, NudgeType, Preferences};
use nudge_engine::platform::{
    InMemoryGeofenceMonitor, InMemoryNotificationCenter, InMemoryPermissions, NotificationTrigger,
};
use nudge_engine::policy::SkipReason;
use nudge_engine::scheduler::ScheduleOutcome;
use nudge_engine::time::{Clock, ManualClock, TimeOfDay, parse_instant};

struct Harness {
    engine: NudgeEngine,
    center: Arc<InMemoryNotificationCenter>,
    sink: Arc<VecSink>,
    clock: Arc<ManualClock>,
}

fn utc(s: &str) -> DateTime<Utc> {
    parse_instant(s).unwrap()
}

fn tod(h: u32, m: u32) -> TimeOfDay {
    TimeOfDay::from_hm(h, m).unwrap()
}

fn harness(start: &str) -> Harness {
    let center = Arc::new(InMemoryNotificationCenter::new());
    let sink = Arc::new(VecSink::new());
    let clock = Arc::new(ManualClock::new(utc(start)));
    let platform = Platform::new(
        center.clone(),
        Arc::new(InMemoryGeofenceMonitor::new()),
        Arc::new(InMemoryPermissions::granted()),
    )
    .with_analytics(sink.clone());
    let engine = NudgeEngine::open(NudgeConfig::memory_only(0), platform, clock.clone()).unwrap();
    Harness {
        engine,
        center,
        sink,
        clock,
    }
}

fn only(types: &[NudgeType], prefs: Preferences) -> Preferences {
    NudgeType::SYSTEM
        .iter()
        .fold(prefs, |p, t| p.with_type_enabled(*t, types.contains(t)))
}

#[test]
fn cap_pushes_show_up_to_next_day() {
    let h = harness("2026-01-01T07:00:00Z");
    let prefs = Preferences::default().with_time_of_day(NudgeType::DailyShowUp, tod(9, 0));
    h.engine
        .publish_snapshot(DomainSnapshot {
            preferences: prefs,
            ..Default::default()
        })
        .unwrap();
    let jan1 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    h.engine
        .store()
        .transact(|l| l.system.sent_count_by_date.insert(jan1.into(), 2))
        .unwrap();

    let outcome = h.engine.schedule_daily_show_up().unwrap();
    let ScheduleOutcome::Scheduled { id, at } = outcome else {
        panic!("expected a schedule, got {outcome:?}");
    };
    assert_eq!(at, utc("2026-01-02T09:00:00Z"));

    let pending = h.center.pending();
    let (_, request) = pending.iter().find(|(pid, _)| *pid == id).unwrap();
    assert_eq!(
        request.trigger,
        NotificationTrigger::Daily {
            time: tod(9, 0),
            first: utc("2026-01-02T09:00:00Z")
        }
    );
}

#[test]
fn spacing_pushes_focus_to_tomorrow() {
    let h = harness("2026-01-01T07:00:00Z");
    let prefs = Preferences::default()
        .with_time_of_day(NudgeType::DailyShowUp, tod(12, 0))
        .with_time_of_day(NudgeType::DailyFocus, tod(14, 0));
    h.engine
        .publish_snapshot(DomainSnapshot {
            preferences: prefs,
            ..Default::default()
        })
        .unwrap();

    let show_up = h.engine.schedule_daily_show_up().unwrap();
    assert_eq!(
        show_up,
        ScheduleOutcome::Scheduled {
            id: "local-1".into(),
            at: utc("2026-01-01T12:00:00Z")
        }
    );
    let focus = h.engine.schedule_daily_focus(None).unwrap();
    let ScheduleOutcome::Scheduled { at, .. } = focus else {
        panic!("expected a schedule, got {focus:?}");
    };
    assert_eq!(at, utc("2026-01-02T14:00:00Z"));
}

#[test]
fn goal_nudge_suppressed_after_show_up() {
    let h = harness("2026-01-01T07:00:00Z");
    h.engine
        .publish_snapshot(DomainSnapshot {
            last_show_up_date: NaiveDate::from_ymd_opt(2026, 1, 1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(
        h.engine.schedule_goal_nudge().unwrap(),
        ScheduleOutcome::Skipped {
            reason: SkipReason::AlreadyShowedUp
        }
    );
    assert_eq!(h.center.schedule_calls(), 0);
}

#[test]
fn cap_and_spacing_hold_over_a_simulated_week() {
    let h = harness("2026-01-01T06:30:00Z");
    h.engine.on_preferences_changed(DomainSnapshot::default());

    for _ in 0..(7 * 24) {
        h.clock.advance(Duration::hours(1));
        h.center.deliver_due(h.clock.now());
        h.engine.on_background_wake();

        let ledgers = h.engine.store().load().unwrap();
        assert!(
            ledgers.system.sent_count_by_date.values().all(|c| *c <= 2),
            "daily cap exceeded: {:?}",
            ledgers.system.sent_count_by_date
        );
        let sends: Vec<(NudgeType, DateTime<Utc>)> = ledgers
            .system
            .last_sent_at_by_type
            .iter()
            .map(|(t, at)| (*t, *at))
            .collect();
        for (i, (a, at_a)) in sends.iter().enumerate() {
            for (b, at_b) in &sends[i + 1..] {
                assert!(
                    (*at_a - *at_b).abs() >= Duration::hours(6),
                    "{a} and {b} are closer than 6h: {at_a} / {at_b}"
                );
            }
        }
    }
    assert!(!h.sink.is_empty());
}

#[test]
fn reconciliation_is_idempotent() {
    let h = harness("2026-01-01T07:00:00Z");
    let mut activity = ActivitySnapshot::new("a1");
    activity.reminder_at = Some(utc("2026-01-01T09:30:00Z"));
    let report = h.engine.on_preferences_changed(DomainSnapshot {
        activities: vec![activity],
        ..Default::default()
    });
    assert_eq!(report.reminders.scheduled, 1);

    h.clock.set(utc("2026-01-01T15:00:00Z"));
    h.center.deliver_due(utc("2026-01-01T15:00:00Z"));

    let first = h.engine.on_background_wake();
    assert_eq!(first.fired, 3, "reminder, focus and show-up estimates");
    let focus = first
        .rearmed
        .iter()
        .find(|(t, _)| *t == NudgeType::DailyFocus)
        .map(|(_, o)| o.clone());
    assert!(matches!(focus, Some(ScheduleOutcome::Scheduled { .. })));

    let ledgers = h.engine.store().load().unwrap();
    let events = h.sink.len();
    let second = h.engine.on_background_wake();
    assert_eq!(second.fired, 0);
    assert!(second.rearmed.is_empty());
    assert_eq!(h.sink.len(), events);
    assert_eq!(h.engine.store().load().unwrap(), ledgers);

    let reminder_events = h.sink.fired(NudgeType::ActivityReminder);
    assert_eq!(reminder_events.len(), 1);
    let AnalyticsEvent::NotificationFiredEstimated { entity_id, scheduled_for, .. } = &reminder_events[0] else {
        panic!("unexpected event {:?}", reminder_events[0]);
    };
    assert_eq!(entity_id.as_deref(), Some("a1"));
    assert_eq!(*scheduled_for, Some(utc("2026-01-01T09:30:00Z")));
}

#[test]
fn completed_focus_moves_pending_nudge_to_tomorrow() {
    let h = harness("2026-01-01T07:00:00Z");
    let prefs = only(&[NudgeType::DailyFocus], Preferences::default());
    h.engine.on_preferences_changed(DomainSnapshot {
        preferences: prefs.clone(),
        ..Default::default()
    });
    let armed = h.engine.store().load().unwrap().daily_focus.scheduled_for;
    assert_eq!(armed, Some(utc("2026-01-01T14:00:00Z")));

    h.clock.set(utc("2026-01-01T10:00:00Z"));
    h.engine
        .publish_snapshot(DomainSnapshot {
            preferences: prefs,
            last_focus_completed_date: NaiveDate::from_ymd_opt(2026, 1, 1),
            ..Default::default()
        })
        .unwrap();
    let report = h.engine.on_background_wake();
    assert_eq!(report.fired, 0);
    assert_eq!(report.rearmed.len(), 1);
    let ledgers = h.engine.store().load().unwrap();
    assert_eq!(ledgers.daily_focus.scheduled_for, Some(utc("2026-01-02T14:00:00Z")));
    // The released slot no longer counts against today.
    assert_eq!(ledgers.system.sent_on(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()), 0);
    assert_eq!(h.center.pending().len(), 1);
}

#[test]
fn disabling_a_type_cancels_its_schedule() {
    let h = harness("2026-01-01T07:00:00Z");
    let report = h.engine.on_preferences_changed(DomainSnapshot::default());
    assert!(report.system.iter().all(|(_, o)| o.is_scheduled()));
    assert_eq!(h.center.pending().len(), 3);

    let prefs = Preferences::default().with_type_enabled(NudgeType::GoalNudge, false);
    let report = h.engine.on_preferences_changed(DomainSnapshot {
        preferences: prefs,
        ..Default::default()
    });
    let goal = report
        .system
        .iter()
        .find(|(t, _)| *t == NudgeType::GoalNudge)
        .map(|(_, o)| o.clone());
    assert_eq!(goal, Some(ScheduleOutcome::Cancelled));
    assert!(
        report
            .system
            .iter()
            .filter(|(t, _)| *t != NudgeType::GoalNudge)
            .all(|(_, o)| *o == ScheduleOutcome::Unchanged)
    );
    assert_eq!(h.center.pending().len(), 2);
}

#[test]
fn activity_reminders_follow_the_snapshot() {
    let h = harness("2026-01-01T07:00:00Z");
    let prefs = only(&[], Preferences::default());
    let mut activity = ActivitySnapshot::new("a1");
    activity.reminder_at = Some(utc("2026-01-01T18:45:30Z"));
    h.engine.on_entities_changed(DomainSnapshot {
        activities: vec![activity.clone()],
        preferences: prefs.clone(),
        ..Default::default()
    });
    let entry = h
        .engine
        .store()
        .load()
        .unwrap()
        .activity_reminders
        .get("a1")
        .cloned()
        .unwrap();
    // Rounded down to the minute.
    assert_eq!(entry.scheduled_for, Some(utc("2026-01-01T18:45:00Z")));

    // Unchanged target: no new OS call.
    h.engine.on_entities_changed(DomainSnapshot {
        activities: vec![activity.clone()],
        preferences: prefs.clone(),
        ..Default::default()
    });
    assert_eq!(h.center.schedule_calls(), 1);

    // Activity removed from the snapshot: reminder cancelled.
    let report = h.engine.on_entities_changed(DomainSnapshot {
        preferences: prefs,
        ..Default::default()
    });
    assert_eq!(report.reminders.cancelled, 1);
    assert!(h.center.pending().is_empty());
    let entry = h
        .engine
        .store()
        .load()
        .unwrap()
        .activity_reminders
        .get("a1")
        .cloned()
        .unwrap();
    assert!(entry.cancelled_at.is_some());
}

#[test]
fn reminders_bypass_the_daily_cap() {
    let h = harness("2026-01-01T07:00:00Z");
    h.engine.publish_snapshot(DomainSnapshot::default()).unwrap();
    let jan1 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    h.engine
        .store()
        .transact(|l| l.system.sent_count_by_date.insert(jan1.into(), 2))
        .unwrap();
    let outcome = h
        .engine
        .set_activity_reminder("a1", utc("2026-01-01T10:00:00Z"))
        .unwrap();
    assert!(outcome.is_scheduled());
    assert_eq!(h.engine.store().load().unwrap().system.sent_on(jan1), 2);
}

#[test]
fn reminder_moved_into_the_past_no_longer_fires() {
    let h = harness("2026-01-01T07:00:00Z");
    let mut activity = ActivitySnapshot::new("a1");
    activity.reminder_at = Some(utc("2026-01-01T15:00:00Z"));
    let snapshot = |a: &ActivitySnapshot| DomainSnapshot {
        activities: vec![a.clone()],
        ..Default::default()
    };
    assert_eq!(h.engine.on_entities_changed(snapshot(&activity)).reminders.scheduled, 1);

    activity.reminder_at = Some(utc("2026-01-01T06:00:00Z"));
    let report = h.engine.on_entities_changed(snapshot(&activity));
    assert_eq!(report.reminders.cancelled, 1);
    assert!(h.center.pending().iter().all(|(_, r)| r.entity_id.as_deref() != Some("a1")));

    // Same through the direct entry point.
    h.engine.set_activity_reminder("a2", utc("2026-01-01T16:00:00Z")).unwrap();
    let outcome = h.engine.set_activity_reminder("a2", utc("2026-01-01T05:00:00Z")).unwrap();
    assert_eq!(outcome, ScheduleOutcome::Cancelled);
    assert!(h.center.pending().iter().all(|(_, r)| r.entity_id.as_deref() != Some("a2")));

    h.clock.advance(Duration::hours(10));
    h.center.deliver_due(h.clock.now());
    h.engine.on_background_wake();
    assert!(h.sink.fired(NudgeType::ActivityReminder).is_empty());
}

#[test]
fn repeating_show_up_counts_against_the_cap_every_day() {
    let h = harness("2026-01-01T06:30:00Z");
    h.engine.on_preferences_changed(DomainSnapshot::default());

    for _ in 0..(4 * 24) {
        h.clock.advance(Duration::hours(1));
        h.center.deliver_due(h.clock.now());
        h.engine.on_background_wake();
    }

    let mut fired_by_date: BTreeMap<String, Vec<NudgeType>> = BTreeMap::new();
    for event in h.sink.events() {
        if let AnalyticsEvent::NotificationFiredEstimated {
            nudge_type,
            date_key: Some(key),
            ..
        } = event
        {
            if nudge_type.is_system() {
                fired_by_date.entry(key.to_string()).or_default().push(nudge_type);
            }
        }
    }
    for (date, fired) in &fired_by_date {
        assert!(fired.len() <= 2, "{date} fired {fired:?}");
    }

    let ledgers = h.engine.store().load().unwrap();
    for day in ["2026-01-02", "2026-01-03", "2026-01-04"] {
        let fired = &fired_by_date[day];
        assert!(fired.contains(&NudgeType::DailyShowUp), "{day} fired {fired:?}");
        let date = NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap();
        assert_eq!(ledgers.system.sent_on(date) as usize, fired.len(), "{day}");
    }
}
