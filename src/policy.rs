//! When should a nudge fire?
//!
//! [`NudgePolicy::decide`] is a pure function of the request, the system
//! ledger, and the configured limits. It never talks to the OS or the store.
//!
//! System nudges start at the user's wall-clock slot (today if still ahead,
//! otherwise tomorrow) and are pushed a whole day at a time while either
//! global rule is violated:
//!
//! - **cap**: at most `daily_cap` system nudges per local date;
//! - **spacing**: no two different types within `min_spacing` of each other.
//!
//! The time of day itself never moves. Activity reminders are user-chosen
//! instants and bypass both rules.
//!
//! A repeating schedule is counted once when it is armed. Its later daily
//! occurrences are projected from its [`RepeatingSlot`] onto the cap until
//! the reconciler records them. Spacing only looks at recorded sends.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::Serialize;

use crate::config::PolicyConfig;
use crate::ledger::SystemNudgeLedger;
use crate::model::{NudgeType, Preferences};
use crate::time::{TimeOfDay, local_date, local_instant, round_down_to_minute};

/// An armed repeating schedule: fires daily at `time`, starting at `first`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatingSlot {
    pub nudge_type: NudgeType,
    pub time: TimeOfDay,
    pub first: DateTime<Utc>,
}

impl RepeatingSlot {
    /// The occurrence on `date`, if the schedule has started by then.
    fn occurrence_on(&self, date: NaiveDate, zone: FixedOffset) -> Option<DateTime<Utc>> {
        let at = local_instant(date, self.time, zone);
        (at >= self.first).then_some(at)
    }

    /// The occurrence on `date` when the ledger doesn't hold it yet.
    ///
    /// Occurrences are recorded in order, so anything on or before the
    /// date of the last recorded send is already counted.
    fn unrecorded_on(&self, date: NaiveDate, zone: FixedOffset, ledger: &SystemNudgeLedger) -> Option<DateTime<Utc>> {
        let recorded_through = ledger.last_sent_at(self.nudge_type).map(|at| local_date(at, zone));
        self.occurrence_on(date, zone)
            .filter(|_| recorded_through.is_none_or(|last| last < date))
    }
}

/// Inputs for one decision.
#[derive(Debug, Clone)]
pub struct FireRequest<'a> {
    pub nudge_type: NudgeType,
    pub now: DateTime<Utc>,
    pub zone: FixedOffset,
    pub preferences: &'a Preferences,
    /// Never fire before this local date.
    pub earliest: Option<NaiveDate>,
    /// Target instant for activity reminders.
    pub explicit_at: Option<DateTime<Utc>>,
    /// The user already showed up today (suppresses goal nudges).
    pub showed_up_today: bool,
    /// Repeating schedule of another type whose daily firings occupy slots.
    pub repeating: Option<RepeatingSlot>,
}

impl<'a> FireRequest<'a> {
    pub fn new(
        nudge_type: NudgeType,
        now: DateTime<Utc>,
        zone: FixedOffset,
        preferences: &'a Preferences,
    ) -> Self {
        Self {
            nudge_type,
            now,
            zone,
            preferences,
            earliest: None,
            explicit_at: None,
            showed_up_today: false,
            repeating: None,
        }
    }

    pub fn earliest(mut self, date: Option<NaiveDate>) -> Self {
        self.earliest = date;
        self
    }

    pub fn explicit_at(mut self, at: DateTime<Utc>) -> Self {
        self.explicit_at = Some(at);
        self
    }

    pub fn showed_up_today(mut self, showed_up: bool) -> Self {
        self.showed_up_today = showed_up;
        self
    }

    pub fn repeating(mut self, slot: Option<RepeatingSlot>) -> Self {
        self.repeating = slot;
        self
    }
}

/// Why nothing should be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    NotificationsDisabled,
    TypeDisabled,
    /// Goal nudge on a day the user already showed up.
    AlreadyShowedUp,
    /// Activity reminder without a target instant.
    NoTarget,
    TargetInPast,
    /// Every day within the push horizon violated a rule.
    NoSlotWithinHorizon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirePlan {
    pub at: DateTime<Utc>,
    /// Whole days the candidate was pushed by the cap or spacing rule.
    pub deferred_days: u32,
    /// Consecutive unopened firings of this type, a soft signal only.
    pub ignored_streak: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "decision")]
pub enum FireDecision {
    Fire(FirePlan),
    Skip { reason: SkipReason },
}

impl FireDecision {
    pub fn fire_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Fire(plan) => Some(plan.at),
            Self::Skip { .. } => None,
        }
    }

    fn skip(reason: SkipReason) -> Self {
        Self::Skip { reason }
    }
}

/// Cross-type rate limiter for system nudges.
#[derive(Debug, Clone, Default)]
pub struct NudgePolicy {
    config: PolicyConfig,
}

impl NudgePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn decide(&self, request: &FireRequest<'_>, ledger: &SystemNudgeLedger) -> FireDecision {
        let t = request.nudge_type;
        if !request.preferences.notifications_enabled {
            return FireDecision::skip(SkipReason::NotificationsDisabled);
        }
        if !request.preferences.is_enabled(t) {
            return FireDecision::skip(SkipReason::TypeDisabled);
        }

        if !t.is_system() {
            let Some(target) = request.explicit_at else {
                return FireDecision::skip(SkipReason::NoTarget);
            };
            let at = round_down_to_minute(target);
            if at <= request.now {
                return FireDecision::skip(SkipReason::TargetInPast);
            }
            return FireDecision::Fire(FirePlan {
                at,
                deferred_days: 0,
                ignored_streak: 0,
            });
        }

        if t == NudgeType::GoalNudge && request.showed_up_today {
            return FireDecision::skip(SkipReason::AlreadyShowedUp);
        }

        let time = request.preferences.time_of_day(t);
        let today = local_date(request.now, request.zone);
        let mut start = request.earliest.map_or(today, |d| d.max(today));
        if local_instant(start, time, request.zone) <= request.now {
            start += Duration::days(1);
        }

        let ignored_streak = ledger.ignored_streak(t);
        if ignored_streak >= self.config.ignored_streak_threshold {
            tracing::debug!(nudge_type = %t, ignored_streak, "nudge type is consistently ignored");
        }

        let repeating = request.repeating.filter(|slot| slot.nudge_type != t);
        for deferred_days in 0..=self.config.max_push_days {
            let date = start + Duration::days(i64::from(deferred_days));
            let candidate = local_instant(date, time, request.zone);
            let projected = repeating.and_then(|slot| slot.unrecorded_on(date, request.zone, ledger));
            if ledger.sent_on(date) + u32::from(projected.is_some()) >= self.config.daily_cap {
                continue;
            }
            if self.conflicts_with_other_types(t, candidate, ledger) {
                continue;
            }
            return FireDecision::Fire(FirePlan {
                at: candidate,
                deferred_days,
                ignored_streak,
            });
        }
        tracing::debug!(nudge_type = %t, horizon = self.config.max_push_days, "no slot within horizon");
        FireDecision::skip(SkipReason::NoSlotWithinHorizon)
    }

    /// Spacing rule: too close to the last send of any other system type.
    fn conflicts_with_other_types(
        &self,
        t: NudgeType,
        candidate: DateTime<Utc>,
        ledger: &SystemNudgeLedger,
    ) -> bool {
        let spacing = self.config.min_spacing();
        NudgeType::SYSTEM
            .iter()
            .filter(|other| **other != t)
            .filter_map(|other| ledger.last_sent_at(*other))
            .any(|last| (candidate - last).abs() < spacing)
    }
}
