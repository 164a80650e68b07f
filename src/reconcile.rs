//! Infers which notifications fired and re-arms what needs re-arming.
//!
//! The OS reports no delivery receipts for local notifications. What it
//! does expose is the set of still-pending ids, and a one-shot leaves that
//! set once it fires. So a ledger entry whose fire time is safely past and
//! whose id is gone is taken as fired. The repeating show-up nudge never
//! leaves the set; it is estimated from the wall clock instead, at most once
//! per local date.
//!
//! A pass only reads the persisted ledgers, the persisted snapshot, and the
//! OS. Running it twice with nothing changed in between emits nothing and
//! writes nothing the second time.

use std::collections::HashSet;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::Serialize;

use crate::analytics::{AnalyticsEvent, AnalyticsSink, ReconcileSource};
use crate::config::NudgeConfig;
use crate::ledger::{LedgerStore, Ledgers};
use crate::model::{DomainSnapshot, NudgeType};
use crate::platform::{NotificationCenter, NotificationId};
use crate::scheduler::{NotificationScheduler, ScheduleOutcome};
use crate::time::{date_key, local_date, local_instant};

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Estimated firings emitted.
    pub fired: usize,
    /// Re-arm attempts and their outcomes.
    pub rearmed: Vec<(NudgeType, ScheduleOutcome)>,
    pub pruned: usize,
    /// The pending set or the ledger couldn't be read; nothing was inferred.
    pub aborted: bool,
}

/// Delivery reconciliation over a ledger store and the OS notification center.
pub struct DeliveryReconciler<'a> {
    config: &'a NudgeConfig,
    zone: FixedOffset,
    store: &'a LedgerStore,
    center: &'a dyn NotificationCenter,
    sink: &'a dyn AnalyticsSink,
}

impl<'a> DeliveryReconciler<'a> {
    pub fn new(
        config: &'a NudgeConfig,
        zone: FixedOffset,
        store: &'a LedgerStore,
        center: &'a dyn NotificationCenter,
        sink: &'a dyn AnalyticsSink,
    ) -> Self {
        Self {
            config,
            zone,
            store,
            center,
            sink,
        }
    }

    pub fn run(&self, snapshot: &DomainSnapshot, now: DateTime<Utc>, source: ReconcileSource) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let pending = match self.center.scheduled_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "pending notification query failed, skipping reconciliation");
                report.aborted = true;
                return report;
            }
        };

        let inferred = self
            .store
            .transact(|l| self.infer(l, &pending, now, source));
        let (events, pruned) = match inferred {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ledger write failed, skipping reconciliation");
                report.aborted = true;
                return report;
            }
        };
        self.sink.emit_batch(&events);
        report.fired = events.len();
        report.pruned = pruned;

        report.rearmed = self.rearm(snapshot, &pending, now);
        tracing::debug!(
            source = ?source,
            fired = report.fired,
            rearmed = report.rearmed.len(),
            pruned = report.pruned,
            "reconciliation pass done"
        );
        report
    }

    /// Stamp inferred firings into the ledgers and return the events to emit.
    fn infer(
        &self,
        l: &mut Ledgers,
        pending: &HashSet<NotificationId>,
        now: DateTime<Utc>,
        source: ReconcileSource,
    ) -> (Vec<AnalyticsEvent>, usize) {
        let zone = self.zone;
        let settled_before = now - self.config.reconcile.fire_grace();
        let today = local_date(now, zone);
        let mut events = Vec::new();

        // Activity reminders: one-shot, per entity.
        for entry in l.activity_reminders.entries.values_mut() {
            let Some(at) = entry.scheduled_for else {
                continue;
            };
            if !entry.is_open() || at > settled_before || pending.contains(&entry.notification_id) {
                continue;
            }
            entry.fired_at = Some(at);
            events.push(AnalyticsEvent::NotificationFiredEstimated {
                nudge_type: NudgeType::ActivityReminder,
                notification_id: Some(entry.notification_id.clone()),
                entity_id: Some(entry.activity_id.clone()),
                scheduled_for: Some(at),
                date_key: Some(date_key(at, zone)),
                detected_at: now,
                source,
            });
        }

        // Focus and goal nudges: one-shot, re-armed daily.
        for t in [NudgeType::DailyFocus, NudgeType::GoalNudge] {
            let Some(r) = l.repeating_mut(t) else {
                continue;
            };
            let (Some(id), Some(at)) = (r.notification_id.clone(), r.scheduled_for) else {
                continue;
            };
            if at > settled_before || pending.contains(&id) {
                continue;
            }
            let key = date_key(at, zone);
            r.last_fired_date_key = Some(key);
            r.disarm();
            let streak = l.system.record_inferred_fired(t);
            self.note_streak(t, streak);
            events.push(AnalyticsEvent::NotificationFiredEstimated {
                nudge_type: t,
                notification_id: Some(id),
                entity_id: None,
                scheduled_for: Some(at),
                date_key: Some(key),
                detected_at: now,
                source,
            });
        }

        // Show-up: repeating, so estimated from the wall clock.
        if let Some(event) = self.estimate_show_up(l, pending, now, today, source) {
            let streak = l.system.record_inferred_fired(NudgeType::DailyShowUp);
            self.note_streak(NudgeType::DailyShowUp, streak);
            events.push(event);
        }

        let pruned = l
            .activity_reminders
            .prune(now, self.config.reconcile.prune_after());
        l.system
            .prune_history(today, self.config.policy.history_retention_days);
        (events, pruned)
    }

    fn estimate_show_up(
        &self,
        l: &mut Ledgers,
        pending: &HashSet<NotificationId>,
        now: DateTime<Utc>,
        today: NaiveDate,
        source: ReconcileSource,
    ) -> Option<AnalyticsEvent> {
        let r = &mut l.daily_show_up;
        let id = r.notification_id.clone()?;
        let time = r.schedule_time_local?;
        if !pending.contains(&id) {
            return None;
        }
        let occurrence = local_instant(today, time, self.zone);
        let key = date_key(occurrence, self.zone);
        let passed = now - occurrence >= self.config.reconcile.fire_grace();
        let armed_before = r.armed_at.is_some_and(|armed| armed <= occurrence);
        let started = r.scheduled_for.is_none_or(|first| occurrence >= first);
        if !passed || !armed_before || !started || r.last_fired_date_key == Some(key) {
            return None;
        }
        r.last_fired_date_key = Some(key);
        // The first occurrence was counted when the schedule was armed.
        if l.system.last_sent_at(NudgeType::DailyShowUp).is_none_or(|last| last < occurrence) {
            l.system.record_sent(NudgeType::DailyShowUp, occurrence, self.zone);
        }
        Some(AnalyticsEvent::NotificationFiredEstimated {
            nudge_type: NudgeType::DailyShowUp,
            notification_id: Some(id),
            entity_id: None,
            scheduled_for: Some(occurrence),
            date_key: Some(key),
            detected_at: now,
            source,
        })
    }

    fn note_streak(&self, t: NudgeType, streak: u32) {
        if streak >= self.config.policy.ignored_streak_threshold {
            tracing::info!(nudge_type = %t, streak, "nudge fired repeatedly without being opened");
        }
    }

    /// Re-arm system nudges whose OS schedule is gone.
    fn rearm(
        &self,
        snapshot: &DomainSnapshot,
        pending: &HashSet<NotificationId>,
        now: DateTime<Utc>,
    ) -> Vec<(NudgeType, ScheduleOutcome)> {
        let ledgers = match self.store.load() {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read ledgers for re-arming");
                return Vec::new();
            }
        };
        let scheduler = NotificationScheduler::new(self.config, self.zone, self.store, self.center);
        let prefs = &snapshot.preferences;
        let today = local_date(now, self.zone);
        let tomorrow = today + Duration::days(1);
        let mut out = Vec::new();

        let live = |t: NudgeType| {
            ledgers
                .repeating(t)
                .and_then(|r| r.notification_id.as_ref())
                .is_some_and(|id| pending.contains(id))
        };
        let pending_date = |t: NudgeType| {
            ledgers
                .repeating(t)
                .and_then(|r| r.scheduled_for)
                .map(|at| local_date(at, self.zone))
        };

        if prefs.is_enabled(NudgeType::DailyShowUp) && !live(NudgeType::DailyShowUp) {
            out.push((NudgeType::DailyShowUp, scheduler.schedule_daily_show_up(snapshot, now)));
        }

        // Nag until done: once focus is completed today, only tomorrow counts.
        if prefs.is_enabled(NudgeType::DailyFocus) {
            let is_live = live(NudgeType::DailyFocus);
            if snapshot.focus_completed_on(today) {
                let still_today = pending_date(NudgeType::DailyFocus).is_some_and(|d| d <= today);
                if !is_live || still_today {
                    out.push((
                        NudgeType::DailyFocus,
                        scheduler.schedule_daily_focus(snapshot, now, Some(tomorrow)),
                    ));
                }
            } else if !is_live {
                out.push((NudgeType::DailyFocus, scheduler.schedule_daily_focus(snapshot, now, None)));
            }
        }

        if prefs.is_enabled(NudgeType::GoalNudge) {
            let is_live = live(NudgeType::GoalNudge);
            let suppressed_today =
                snapshot.showed_up_on(today) && pending_date(NudgeType::GoalNudge).is_some_and(|d| d <= today);
            if !is_live || suppressed_today {
                out.push((NudgeType::GoalNudge, scheduler.schedule_goal_nudge(snapshot, now)));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::VecSink;
    use crate::model::ActivitySnapshot;
    use crate::platform::InMemoryNotificationCenter;
    use crate::time::parse_instant;

    fn utc(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    struct Fixture {
        config: NudgeConfig,
        store: LedgerStore,
        center: InMemoryNotificationCenter,
        sink: VecSink,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: NudgeConfig::memory_only(0),
                store: LedgerStore::memory_only(),
                center: InMemoryNotificationCenter::new(),
                sink: VecSink::new(),
            }
        }

        fn scheduler(&self) -> NotificationScheduler<'_> {
            NotificationScheduler::new(&self.config, self.config.zone(), &self.store, &self.center)
        }

        fn run(&self, snapshot: &DomainSnapshot, now: DateTime<Utc>) -> ReconcileReport {
            DeliveryReconciler::new(&self.config, self.config.zone(), &self.store, &self.center, &self.sink)
                .run(snapshot, now, ReconcileSource::BackgroundTask)
        }
    }

    #[test]
    fn reminder_fired_once_after_grace() {
        let fx = Fixture::new();
        let mut activity = ActivitySnapshot::new("a1");
        activity.reminder_at = Some(utc("2026-01-01T09:00:00Z"));
        let snapshot = DomainSnapshot {
            activities: vec![activity],
            ..Default::default()
        };
        fx.scheduler()
            .sync_activity_reminders(&snapshot, utc("2026-01-01T07:00:00Z"));
        fx.center.deliver_due(utc("2026-01-01T09:00:00Z"));

        // Inside the grace window nothing is inferred.
        fx.run(&snapshot, utc("2026-01-01T09:00:30Z"));
        assert!(fx.sink.fired(NudgeType::ActivityReminder).is_empty());

        fx.run(&snapshot, utc("2026-01-01T09:01:00Z"));
        assert_eq!(fx.sink.fired(NudgeType::ActivityReminder).len(), 1);
        let entry = fx.store.load().unwrap().activity_reminders.get("a1").cloned().unwrap();
        assert_eq!(entry.fired_at, Some(utc("2026-01-01T09:00:00Z")));

        fx.run(&snapshot, utc("2026-01-01T09:02:00Z"));
        assert_eq!(fx.sink.fired(NudgeType::ActivityReminder).len(), 1);
    }

    #[test]
    fn still_pending_reminder_is_not_fired() {
        let fx = Fixture::new();
        let mut activity = ActivitySnapshot::new("a1");
        activity.reminder_at = Some(utc("2026-01-01T09:00:00Z"));
        let snapshot = DomainSnapshot {
            activities: vec![activity],
            ..Default::default()
        };
        fx.scheduler()
            .sync_activity_reminders(&snapshot, utc("2026-01-01T07:00:00Z"));
        // The OS hasn't delivered it yet (delayed or coalesced).
        fx.run(&snapshot, utc("2026-01-01T09:05:00Z"));
        assert!(fx.sink.fired(NudgeType::ActivityReminder).is_empty());
    }

    #[test]
    fn show_up_estimated_once_per_day() {
        let fx = Fixture::new();
        let snapshot = DomainSnapshot::default();
        fx.scheduler()
            .schedule_daily_show_up(&snapshot, utc("2026-01-01T07:00:00Z"));

        fx.run(&snapshot, utc("2026-01-01T07:30:00Z"));
        assert!(fx.sink.fired(NudgeType::DailyShowUp).is_empty());

        fx.run(&snapshot, utc("2026-01-01T08:05:00Z"));
        fx.run(&snapshot, utc("2026-01-01T12:00:00Z"));
        assert_eq!(fx.sink.fired(NudgeType::DailyShowUp).len(), 1);

        fx.run(&snapshot, utc("2026-01-02T09:00:00Z"));
        assert_eq!(fx.sink.fired(NudgeType::DailyShowUp).len(), 2);
    }

    #[test]
    fn show_up_armed_after_todays_slot_is_not_estimated_today() {
        let fx = Fixture::new();
        let snapshot = DomainSnapshot::default();
        fx.scheduler()
            .schedule_daily_show_up(&snapshot, utc("2026-01-01T10:00:00Z"));
        fx.run(&snapshot, utc("2026-01-01T11:00:00Z"));
        assert!(fx.sink.fired(NudgeType::DailyShowUp).is_empty());
    }

    #[test]
    fn focus_rearms_for_tomorrow_once_completed() {
        let fx = Fixture::new();
        let mut snapshot = DomainSnapshot::default();
        let morning = utc("2026-01-01T07:00:00Z");
        fx.scheduler().schedule_daily_focus(&snapshot, morning, None);
        assert_eq!(
            fx.store.load().unwrap().daily_focus.scheduled_for,
            Some(utc("2026-01-01T14:00:00Z"))
        );

        snapshot.last_focus_completed_date = Some(morning.date_naive());
        fx.run(&snapshot, utc("2026-01-01T10:00:00Z"));
        let focus = fx.store.load().unwrap().daily_focus;
        assert_eq!(focus.scheduled_for, Some(utc("2026-01-02T14:00:00Z")));
        assert_eq!(fx.center.pending().iter().filter(|(_, r)| r.entity_id.is_none()).count(), 3);
    }

    #[test]
    fn focus_fired_is_estimated_and_rearmed() {
        let fx = Fixture::new();
        let snapshot = DomainSnapshot::default();
        fx.scheduler()
            .schedule_daily_focus(&snapshot, utc("2026-01-01T07:00:00Z"), None);
        fx.center.deliver_due(utc("2026-01-01T14:00:00Z"));

        let report = fx.run(&snapshot, utc("2026-01-01T15:00:00Z"));
        assert_eq!(fx.sink.fired(NudgeType::DailyFocus).len(), 1);
        assert!(report.rearmed.iter().any(|(t, o)| *t == NudgeType::DailyFocus && o.is_scheduled()));

        let ledgers = fx.store.load().unwrap();
        assert_eq!(ledgers.daily_focus.scheduled_for, Some(utc("2026-01-02T14:00:00Z")));
        assert_eq!(ledgers.system.ignored_streak(NudgeType::DailyFocus), 1);
        assert_eq!(
            ledgers.daily_focus.last_fired_date_key.map(|k| k.to_string()).as_deref(),
            Some("2026-01-01")
        );
    }

    #[test]
    fn second_run_is_a_no_op() {
        let fx = Fixture::new();
        let snapshot = DomainSnapshot::default();
        let now = utc("2026-01-01T01:00:00Z");
        fx.scheduler().sync_preferences(&snapshot, now);
        fx.center.deliver_due(utc("2026-01-01T23:00:00Z"));

        let later = utc("2026-01-01T23:00:00Z");
        fx.run(&snapshot, later);
        let events = fx.sink.len();
        let ledgers = fx.store.load().unwrap();
        let calls = fx.center.schedule_calls();

        let second = fx.run(&snapshot, later);
        assert_eq!(second.fired, 0);
        assert_eq!(fx.sink.len(), events);
        assert_eq!(fx.store.load().unwrap(), ledgers);
        assert_eq!(fx.center.schedule_calls(), calls);
    }

    #[test]
    fn query_failure_aborts_without_writes() {
        let fx = Fixture::new();
        fx.center.fail_queries(true);
        let report = fx.run(&DomainSnapshot::default(), utc("2026-01-01T10:00:00Z"));
        assert!(report.aborted);
        assert_eq!(fx.store.load().unwrap(), Ledgers::default());
        assert_eq!(fx.center.schedule_calls(), 0);
    }
}
