//! Applies the policy against the OS notification center.
//!
//! Every operation follows the same order: cancel the stale OS schedule,
//! decide, schedule, and only then record the result in the ledger. A
//! ledger write never runs ahead of an OS call that failed. OS failures are
//! logged and reported as [`ScheduleOutcome::Failed`]; the next
//! reconciliation pass retries.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::Serialize;

use crate::config::NudgeConfig;
use crate::ledger::{ActivityReminderEntry, LedgerStore, Ledgers};
use crate::model::{ActivitySnapshot, DomainSnapshot, NudgeType, Preferences};
use crate::platform::{
    NotificationCenter, NotificationId, NotificationKind, NotificationRequest, NotificationTrigger,
};
use crate::policy::{FireDecision, FireRequest, NudgePolicy, SkipReason};
use crate::time::{local_date, round_down_to_minute};

/// Result of one scheduling operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ScheduleOutcome {
    Scheduled { id: NotificationId, at: DateTime<Utc> },
    /// The existing schedule already matches.
    Unchanged,
    Cancelled,
    Skipped { reason: SkipReason },
    /// An OS call or the ledger write failed; state was left as it was.
    Failed,
}

impl ScheduleOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

/// Counts from [`NotificationScheduler::sync_activity_reminders`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSyncReport {
    pub scheduled: usize,
    pub cancelled: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pruned: usize,
}

impl ReminderSyncReport {
    fn count(&mut self, outcome: &ScheduleOutcome) {
        match outcome {
            ScheduleOutcome::Scheduled { .. } => self.scheduled += 1,
            ScheduleOutcome::Unchanged => self.unchanged += 1,
            ScheduleOutcome::Cancelled => self.cancelled += 1,
            ScheduleOutcome::Skipped { .. } => self.skipped += 1,
            ScheduleOutcome::Failed => self.failed += 1,
        }
    }
}

/// The OS has not fired this entry yet.
fn still_pending(entry: &ActivityReminderEntry, now: DateTime<Utc>) -> bool {
    entry.scheduled_for.is_some_and(|at| at > now)
}

fn nudge_copy(nudge_type: NudgeType) -> (&'static str, &'static str) {
    match nudge_type {
        NudgeType::DailyShowUp => ("Show up for your arcs", "A few minutes today keeps your plan moving."),
        NudgeType::DailyFocus => ("Time to focus", "Start a focus session on what matters most today."),
        NudgeType::GoalNudge => ("Check in on your goals", "One small step is enough to keep a goal alive."),
        NudgeType::ActivityReminder => ("Reminder", "You planned something for now."),
    }
}

/// Scheduler operations over a ledger store and a notification center.
pub struct NotificationScheduler<'a> {
    store: &'a LedgerStore,
    center: &'a dyn NotificationCenter,
    policy: NudgePolicy,
    zone: FixedOffset,
    history_retention_days: i64,
    prune_after: Duration,
}

impl<'a> NotificationScheduler<'a> {
    pub fn new(
        config: &NudgeConfig,
        zone: FixedOffset,
        store: &'a LedgerStore,
        center: &'a dyn NotificationCenter,
    ) -> Self {
        Self {
            store,
            center,
            policy: NudgePolicy::new(config.policy.clone()),
            zone,
            history_retention_days: config.policy.history_retention_days,
            prune_after: config.reconcile.prune_after(),
        }
    }

    fn load(&self) -> Option<Ledgers> {
        match self.store.load() {
            Ok(l) => Some(l),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read ledgers");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // System nudges
    // -----------------------------------------------------------------------

    /// Arm the repeating daily show-up nudge.
    pub fn schedule_daily_show_up(&self, snapshot: &DomainSnapshot, now: DateTime<Utc>) -> ScheduleOutcome {
        self.reschedule(NudgeType::DailyShowUp, snapshot, now, None)
    }

    /// Arm the one-shot focus nudge, no earlier than `earliest`.
    pub fn schedule_daily_focus(
        &self,
        snapshot: &DomainSnapshot,
        now: DateTime<Utc>,
        earliest: Option<NaiveDate>,
    ) -> ScheduleOutcome {
        self.reschedule(NudgeType::DailyFocus, snapshot, now, earliest)
    }

    /// Arm the one-shot goal nudge unless the user already showed up today.
    pub fn schedule_goal_nudge(&self, snapshot: &DomainSnapshot, now: DateTime<Utc>) -> ScheduleOutcome {
        self.reschedule(NudgeType::GoalNudge, snapshot, now, None)
    }

    /// Cancel a system type's schedule and give back its pending slot.
    pub fn cancel_system(&self, nudge_type: NudgeType, now: DateTime<Utc>) -> ScheduleOutcome {
        let Some(ledgers) = self.load() else {
            return ScheduleOutcome::Failed;
        };
        let Some(id) = ledgers
            .repeating(nudge_type)
            .and_then(|r| r.notification_id.clone())
        else {
            return ScheduleOutcome::Unchanged;
        };
        if let Err(e) = self.center.cancel(&id) {
            tracing::warn!(nudge_type = %nudge_type, id = %id, error = %e, "cancel failed");
            return ScheduleOutcome::Failed;
        }
        let zone = self.zone;
        let written = self.store.transact(|l| {
            let pending = l
                .repeating(nudge_type)
                .filter(|r| r.notification_id.as_deref() == Some(id.as_str()))
                .and_then(|r| r.scheduled_for)
                .filter(|at| *at > now);
            if let Some(at) = pending {
                l.system.release(nudge_type, at, zone);
            }
            if let Some(r) = l.repeating_mut(nudge_type) {
                r.disarm();
            }
        });
        match written {
            Ok(()) => ScheduleOutcome::Cancelled,
            Err(e) => {
                tracing::warn!(nudge_type = %nudge_type, error = %e, "ledger write after cancel failed");
                ScheduleOutcome::Failed
            }
        }
    }

    fn reschedule(
        &self,
        nudge_type: NudgeType,
        snapshot: &DomainSnapshot,
        now: DateTime<Utc>,
        earliest: Option<NaiveDate>,
    ) -> ScheduleOutcome {
        if self.cancel_system(nudge_type, now) == ScheduleOutcome::Failed {
            return ScheduleOutcome::Failed;
        }
        let Some(ledgers) = self.load() else {
            return ScheduleOutcome::Failed;
        };

        let prefs = &snapshot.preferences;
        let today = local_date(now, self.zone);
        let request = FireRequest::new(nudge_type, now, self.zone, prefs)
            .earliest(earliest)
            .showed_up_today(snapshot.showed_up_on(today))
            .repeating(ledgers.show_up_slot());
        let plan = match self.policy.decide(&request, &ledgers.system) {
            FireDecision::Fire(plan) => plan,
            FireDecision::Skip { reason } => {
                tracing::debug!(nudge_type = %nudge_type, ?reason, "not scheduling");
                return ScheduleOutcome::Skipped { reason };
            }
        };

        let time = prefs.time_of_day(nudge_type);
        let trigger = match nudge_type {
            NudgeType::DailyShowUp => NotificationTrigger::Daily { time, first: plan.at },
            _ => NotificationTrigger::At { at: plan.at },
        };
        let (title, body) = nudge_copy(nudge_type);
        let request = NotificationRequest {
            kind: NotificationKind::Nudge { nudge_type },
            title: title.into(),
            body: body.into(),
            entity_id: None,
            trigger,
        };
        let id = match self.center.schedule(&request) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(nudge_type = %nudge_type, error = %e, "schedule failed");
                return ScheduleOutcome::Failed;
            }
        };

        let (zone, retention) = (self.zone, self.history_retention_days);
        let written = self.store.transact(|l| {
            l.system.record_sent(nudge_type, plan.at, zone);
            l.system.prune_history(today, retention);
            if let Some(r) = l.repeating_mut(nudge_type) {
                r.arm(id.clone(), time, plan.at, now);
            }
        });
        if let Err(e) = written {
            tracing::warn!(nudge_type = %nudge_type, error = %e, "ledger write failed, withdrawing schedule");
            if let Err(e) = self.center.cancel(&id) {
                tracing::warn!(id = %id, error = %e, "withdraw failed");
            }
            return ScheduleOutcome::Failed;
        }
        tracing::info!(
            nudge_type = %nudge_type,
            id = %id,
            at = %plan.at,
            deferred_days = plan.deferred_days,
            "nudge scheduled"
        );
        ScheduleOutcome::Scheduled { id, at: plan.at }
    }

    /// Bring every system type in line with the preferences.
    ///
    /// A type is only touched when it was toggled, its time of day moved,
    /// or nothing is scheduled for it.
    pub fn sync_preferences(
        &self,
        snapshot: &DomainSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<(NudgeType, ScheduleOutcome)> {
        let Some(ledgers) = self.load() else {
            return NudgeType::SYSTEM.iter().map(|t| (*t, ScheduleOutcome::Failed)).collect();
        };
        let prefs = &snapshot.preferences;
        NudgeType::SYSTEM
            .iter()
            .map(|&t| {
                let armed = ledgers.repeating(t).filter(|r| r.is_armed());
                let outcome = match armed {
                    _ if !prefs.is_enabled(t) => self.cancel_system(t, now),
                    Some(r) if r.schedule_time_local == Some(prefs.time_of_day(t)) => ScheduleOutcome::Unchanged,
                    _ => self.reschedule(t, snapshot, now, None),
                };
                (t, outcome)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Activity reminders
    // -----------------------------------------------------------------------

    /// Schedule (or move) the reminder of one activity.
    pub fn schedule_activity_reminder(
        &self,
        activity: &ActivitySnapshot,
        at: DateTime<Utc>,
        prefs: &Preferences,
        now: DateTime<Utc>,
    ) -> ScheduleOutcome {
        let Some(ledgers) = self.load() else {
            return ScheduleOutcome::Failed;
        };
        let request = FireRequest::new(NudgeType::ActivityReminder, now, self.zone, prefs).explicit_at(at);
        let target = match self.policy.decide(&request, &ledgers.system) {
            FireDecision::Fire(plan) => plan.at,
            // A past target may be firing right now; the reconciler owns it.
            // A still-pending entry for some other instant is withdrawn.
            FireDecision::Skip {
                reason: SkipReason::TargetInPast,
            } => {
                let target = round_down_to_minute(at);
                let moved = ledgers
                    .activity_reminders
                    .open_entry(&activity.id)
                    .is_some_and(|e| still_pending(e, now) && e.scheduled_for != Some(target));
                if moved {
                    return self.clear_activity_reminder(&activity.id, now);
                }
                return ScheduleOutcome::Skipped {
                    reason: SkipReason::TargetInPast,
                };
            }
            FireDecision::Skip { reason } => {
                if self.clear_activity_reminder(&activity.id, now) == ScheduleOutcome::Failed {
                    return ScheduleOutcome::Failed;
                }
                return ScheduleOutcome::Skipped { reason };
            }
        };

        if let Some(existing) = ledgers.activity_reminders.open_entry(&activity.id) {
            if existing.scheduled_for == Some(target) {
                return ScheduleOutcome::Unchanged;
            }
            if self.clear_activity_reminder(&activity.id, now) == ScheduleOutcome::Failed {
                return ScheduleOutcome::Failed;
            }
        }

        let request = NotificationRequest {
            kind: NotificationKind::Nudge {
                nudge_type: NudgeType::ActivityReminder,
            },
            title: nudge_copy(NudgeType::ActivityReminder).0.into(),
            body: activity.display_title().to_string(),
            entity_id: Some(activity.id.clone()),
            trigger: NotificationTrigger::At { at: target },
        };
        let id = match self.center.schedule(&request) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(activity_id = %activity.id, error = %e, "reminder schedule failed");
                return ScheduleOutcome::Failed;
            }
        };
        let written = self.store.transact(|l| {
            l.activity_reminders.insert(ActivityReminderEntry {
                activity_id: activity.id.clone(),
                notification_id: id.clone(),
                scheduled_for: Some(target),
                fired_at: None,
                cancelled_at: None,
            });
        });
        if let Err(e) = written {
            tracing::warn!(activity_id = %activity.id, error = %e, "ledger write failed, withdrawing reminder");
            if let Err(e) = self.center.cancel(&id) {
                tracing::warn!(id = %id, error = %e, "withdraw failed");
            }
            return ScheduleOutcome::Failed;
        }
        tracing::debug!(activity_id = %activity.id, id = %id, at = %target, "reminder scheduled");
        ScheduleOutcome::Scheduled { id, at: target }
    }

    /// Cancel an activity's pending reminder and mark its entry cancelled.
    pub fn clear_activity_reminder(&self, activity_id: &str, now: DateTime<Utc>) -> ScheduleOutcome {
        let Some(ledgers) = self.load() else {
            return ScheduleOutcome::Failed;
        };
        let Some(entry) = ledgers.activity_reminders.open_entry(activity_id) else {
            return ScheduleOutcome::Unchanged;
        };
        if let Err(e) = self.center.cancel(&entry.notification_id) {
            tracing::warn!(activity_id, error = %e, "reminder cancel failed");
            return ScheduleOutcome::Failed;
        }
        match self
            .store
            .transact(|l| l.activity_reminders.mark_cancelled(activity_id, now))
        {
            Ok(_) => ScheduleOutcome::Cancelled,
            Err(e) => {
                tracing::warn!(activity_id, error = %e, "ledger write after reminder cancel failed");
                ScheduleOutcome::Failed
            }
        }
    }

    /// Make the reminder ledger match the snapshot.
    ///
    /// Entries of closed, vanished, or reminder-less activities are
    /// cancelled and future reminders are (re)scheduled. A reminder moved
    /// into the past withdraws its pending entry; anything already due is
    /// left to the reconciler.
    pub fn sync_activity_reminders(&self, snapshot: &DomainSnapshot, now: DateTime<Utc>) -> ReminderSyncReport {
        let mut report = ReminderSyncReport::default();
        let Some(ledgers) = self.load() else {
            report.failed += 1;
            return report;
        };

        for (id, _) in ledgers.activity_reminders.entries.iter().filter(|(_, e)| e.is_open()) {
            let wanted = snapshot
                .activity(id)
                .is_some_and(|a| !a.status.is_closed() && a.reminder_at.is_some());
            if !wanted {
                report.count(&self.clear_activity_reminder(id, now));
            }
        }

        for activity in snapshot.activities.iter().filter(|a| !a.status.is_closed()) {
            let Some(at) = activity.reminder_at else {
                continue;
            };
            let pending = ledgers
                .activity_reminders
                .open_entry(&activity.id)
                .is_some_and(|e| still_pending(e, now));
            if round_down_to_minute(at) <= now && !pending {
                continue;
            }
            report.count(&self.schedule_activity_reminder(activity, at, &snapshot.preferences, now));
        }

        let retention = self.prune_after;
        match self.store.transact(|l| l.activity_reminders.prune(now, retention)) {
            Ok(n) => report.pruned = n,
            Err(e) => tracing::warn!(error = %e, "reminder prune failed"),
        }
        report
    }
}
