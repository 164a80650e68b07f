//! Read-only domain inputs: nudge types, preferences, activity snapshots.
//!
//! The host's domain store owns Arcs/Goals/Activities. The engine only sees
//! the narrow [`DomainSnapshot`] the host publishes, which is persisted so a
//! cold background process can rehydrate it without any warm in-memory state.
//! Every field is optional-with-default on the wire: documents written by
//! older or newer hosts must always decode.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::time::TimeOfDay;

// ---------------------------------------------------------------------------
// NudgeType
// ---------------------------------------------------------------------------

/// Kinds of system-scheduled local notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NudgeType {
    /// Repeating daily "show up for your arcs" reminder.
    DailyShowUp,
    /// Daily focus-session prompt, re-armed until a session is completed.
    DailyFocus,
    /// Goal check-in, suppressed on days the user already showed up.
    GoalNudge,
    /// Per-activity reminder at a user-chosen instant.
    ActivityReminder,
}

impl NudgeType {
    pub const ALL: [NudgeType; 4] = [
        Self::DailyShowUp,
        Self::DailyFocus,
        Self::GoalNudge,
        Self::ActivityReminder,
    ];

    /// Types the engine initiates on its own and rate-limits globally.
    pub const SYSTEM: [NudgeType; 3] = [Self::DailyShowUp, Self::DailyFocus, Self::GoalNudge];

    pub fn is_system(&self) -> bool {
        !matches!(self, Self::ActivityReminder)
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            Self::DailyShowUp => "dailyShowUp",
            Self::DailyFocus => "dailyFocus",
            Self::GoalNudge => "goalNudge",
            Self::ActivityReminder => "activityReminder",
        }
    }

    /// Parse camelCase or kebab-case labels (case-insensitive).
    pub fn from_label(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "dailyshowup" | "showup" => Some(Self::DailyShowUp),
            "dailyfocus" | "focus" => Some(Self::DailyFocus),
            "goalnudge" | "goal" => Some(Self::GoalNudge),
            "activityreminder" | "reminder" => Some(Self::ActivityReminder),
            _ => None,
        }
    }

    /// Wall-clock slot used when the user never picked one.
    pub fn default_time_of_day(&self) -> TimeOfDay {
        let (h, m) = match self {
            Self::DailyShowUp => (8, 0),
            Self::DailyFocus => (14, 0),
            Self::GoalNudge => (20, 0),
            Self::ActivityReminder => (9, 0),
        };
        TimeOfDay::from_hm(h, m).unwrap_or(TimeOfDay::MIDNIGHT)
    }
}

impl fmt::Display for NudgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

// ---------------------------------------------------------------------------
// Activities
// ---------------------------------------------------------------------------

/// Lifecycle status of an activity as reported by the domain store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ActivityStatus {
    #[default]
    Planned,
    InProgress,
    Done,
    Cancelled,
    /// Any status this engine doesn't know about; treated as open.
    #[serde(other)]
    Other,
}

impl ActivityStatus {
    /// Done or cancelled activities never get reminders or geofences.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// Which geofence transition an activity cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerDirection {
    Arrive,
    Leave,
    /// No explicit trigger, or one this engine doesn't recognize.
    Either,
}

impl TriggerDirection {
    /// Missing and unknown labels map to `Either` to stay permissive with legacy data.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(|l| l.trim().to_lowercase()) {
            Some(l) if l == "arrive" || l == "enter" => Self::Arrive,
            Some(l) if l == "leave" || l == "exit" => Self::Leave,
            _ => Self::Either,
        }
    }

    pub fn notify_on_enter(&self) -> bool {
        !matches!(self, Self::Leave)
    }

    pub fn notify_on_exit(&self) -> bool {
        !matches!(self, Self::Arrive)
    }
}

/// Geofence transition reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GeofenceEventType {
    Enter,
    Exit,
}

impl GeofenceEventType {
    /// Numeric codes used by the platform region-monitoring callback.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Enter),
            2 => Some(Self::Exit),
            _ => None,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "enter" | "arrive" | "entered" => Some(Self::Enter),
            "exit" | "leave" | "exited" => Some(Self::Exit),
            _ => None,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
        }
    }

    /// Whether an activity with this trigger direction wants the event.
    pub fn matches(&self, direction: TriggerDirection) -> bool {
        match self {
            Self::Enter => direction.notify_on_enter(),
            Self::Exit => direction.notify_on_exit(),
        }
    }
}

impl fmt::Display for GeofenceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Location trigger configured on an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationTrigger {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_m: Option<f64>,
    /// `"arrive"`, `"leave"`, or absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl LocationTrigger {
    pub fn direction(&self) -> TriggerDirection {
        TriggerDirection::from_label(self.trigger.as_deref())
    }

    /// Whether every number survives a JSON round trip (NaN and infinities don't).
    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite() && self.radius_m.is_none_or(f64::is_finite)
    }
}

/// A trigger that doesn't decode leaves only its activity without one.
fn lenient_trigger<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<LocationTrigger>, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match serde_json::from_value(value) {
        Ok(trigger) => Some(trigger),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed location trigger");
            None
        }
    }))
}

/// The fields of an activity the engine consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    pub id: String,
    #[serde(default)]
    pub status: ActivityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_trigger", skip_serializing_if = "Option::is_none")]
    pub location_trigger: Option<LocationTrigger>,
}

impl ActivitySnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ActivityStatus::Planned,
            title: None,
            scheduled_date: None,
            reminder_at: None,
            location_trigger: None,
        }
    }

    /// Label used in notification copy.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("your activity")
    }
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

/// User notification preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub notifications_enabled: bool,
    /// Types absent from the map are enabled.
    pub per_type_enabled: BTreeMap<NudgeType, bool>,
    /// Types absent from the map use [`NudgeType::default_time_of_day`].
    pub per_type_time_of_day: BTreeMap<NudgeType, TimeOfDay>,
    pub location_offers_enabled: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            per_type_enabled: BTreeMap::new(),
            per_type_time_of_day: BTreeMap::new(),
            location_offers_enabled: false,
        }
    }
}

impl Preferences {
    /// Whether `nudge_type` may be scheduled at all (master switch included).
    pub fn is_enabled(&self, nudge_type: NudgeType) -> bool {
        self.notifications_enabled
            && self
                .per_type_enabled
                .get(&nudge_type)
                .copied()
                .unwrap_or(true)
    }

    pub fn time_of_day(&self, nudge_type: NudgeType) -> TimeOfDay {
        self.per_type_time_of_day
            .get(&nudge_type)
            .copied()
            .unwrap_or_else(|| nudge_type.default_time_of_day())
    }

    pub fn with_time_of_day(mut self, nudge_type: NudgeType, time: TimeOfDay) -> Self {
        self.per_type_time_of_day.insert(nudge_type, time);
        self
    }

    pub fn with_type_enabled(mut self, nudge_type: NudgeType, enabled: bool) -> Self {
        self.per_type_enabled.insert(nudge_type, enabled);
        self
    }
}

// ---------------------------------------------------------------------------
// DomainSnapshot
// ---------------------------------------------------------------------------

/// Everything the engine needs from the domain store, persisted as one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainSnapshot {
    pub activities: Vec<ActivitySnapshot>,
    pub preferences: Preferences,
    /// Local date the user last "showed up" (opened their plan).
    pub last_show_up_date: Option<NaiveDate>,
    /// Local date the user last completed a focus session.
    pub last_focus_completed_date: Option<NaiveDate>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl DomainSnapshot {
    pub fn activity(&self, id: &str) -> Option<&ActivitySnapshot> {
        self.activities.iter().find(|a| a.id == id)
    }

    pub fn showed_up_on(&self, date: NaiveDate) -> bool {
        self.last_show_up_date == Some(date)
    }

    pub fn focus_completed_on(&self, date: NaiveDate) -> bool {
        self.last_focus_completed_date == Some(date)
    }

    /// Remove triggers with non-finite numbers; returns how many were dropped.
    ///
    /// Such a trigger can never be monitored, and JSON would turn its NaN
    /// into `null` on the way to disk.
    pub fn drop_unusable_triggers(&mut self) -> usize {
        let mut dropped = 0;
        for activity in &mut self.activities {
            if activity.location_trigger.as_ref().is_some_and(|t| !t.is_finite()) {
                tracing::warn!(activity = %activity.id, "dropping location trigger with non-finite coordinates");
                activity.location_trigger = None;
                dropped += 1;
            }
        }
        dropped
    }
}
