//! Persisted scheduling and delivery bookkeeping.
//!
//! Every ledger is one JSON document under a namespaced key (`ledger:*`,
//! `state:*`). All fields default, so documents from older or newer builds
//! decode; a document that fails to decode is treated as empty and logged.
//! Losing rate-limit history is preferable to refusing to schedule.
//!
//! [`LedgerStore::transact`] is the only mutation path for the `ledger:*`
//! documents: it loads them all inside one store transaction, hands them to
//! a closure, and writes back only those whose bytes changed.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{DomainSnapshot, GeofenceEventType, NudgeType};
use crate::platform::{Capability, NotificationId, PermissionStatus};
use crate::policy::RepeatingSlot;
use crate::store::{DocumentSet, DocumentStore, StoreResult};
use crate::time::{DateKey, TimeOfDay, date_key};

/// Document keys.
pub mod keys {
    pub const SYSTEM: &str = "ledger:system";
    pub const DAILY_SHOW_UP: &str = "ledger:daily_show_up";
    pub const DAILY_FOCUS: &str = "ledger:daily_focus";
    pub const GOAL_NUDGE: &str = "ledger:goal_nudge";
    pub const ACTIVITY_REMINDERS: &str = "ledger:activity_reminders";
    pub const LOCATION_OFFERS: &str = "ledger:location_offers";
    pub const GEOFENCE: &str = "ledger:geofence";

    pub const PERMISSIONS: &str = "state:permissions";
    pub const SNAPSHOT: &str = "state:snapshot";

    pub const LEDGERS: [&str; 7] = [
        SYSTEM,
        DAILY_SHOW_UP,
        DAILY_FOCUS,
        GOAL_NUDGE,
        ACTIVITY_REMINDERS,
        LOCATION_OFFERS,
        GEOFENCE,
    ];
}

// ---------------------------------------------------------------------------
// SystemNudgeLedger
// ---------------------------------------------------------------------------

/// Global rate-limit state shared by all system nudge types.
///
/// "Sent" means confirmed scheduled: counts and times refer to the fire
/// instant the OS accepted, keyed by its local date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemNudgeLedger {
    pub sent_count_by_date: BTreeMap<DateKey, u32>,
    pub last_sent_at_by_type: BTreeMap<NudgeType, DateTime<Utc>>,
    pub last_opened_at_by_type: BTreeMap<NudgeType, DateTime<Utc>>,
    pub consecutive_no_open_by_type: BTreeMap<NudgeType, u32>,
    /// Local hour of day (0-23) → opens.
    pub open_hour_counts_by_type: BTreeMap<NudgeType, BTreeMap<u32, u32>>,
}

impl SystemNudgeLedger {
    pub fn sent_on(&self, date: NaiveDate) -> u32 {
        self.sent_count_by_date
            .get(&DateKey::new(date))
            .copied()
            .unwrap_or(0)
    }

    pub fn last_sent_at(&self, nudge_type: NudgeType) -> Option<DateTime<Utc>> {
        self.last_sent_at_by_type.get(&nudge_type).copied()
    }

    pub fn ignored_streak(&self, nudge_type: NudgeType) -> u32 {
        self.consecutive_no_open_by_type
            .get(&nudge_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn record_sent(&mut self, nudge_type: NudgeType, at: DateTime<Utc>, zone: FixedOffset) {
        *self.sent_count_by_date.entry(date_key(at, zone)).or_insert(0) += 1;
        self.last_sent_at_by_type.insert(nudge_type, at);
    }

    /// Give back the slot of a schedule that was cancelled before it fired.
    pub fn release(&mut self, nudge_type: NudgeType, at: DateTime<Utc>, zone: FixedOffset) {
        let key = date_key(at, zone);
        if let Some(count) = self.sent_count_by_date.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.sent_count_by_date.remove(&key);
            }
        }
        if self.last_sent_at(nudge_type) == Some(at) {
            self.last_sent_at_by_type.remove(&nudge_type);
        }
    }

    pub fn record_opened(&mut self, nudge_type: NudgeType, at: DateTime<Utc>, zone: FixedOffset) {
        self.last_opened_at_by_type.insert(nudge_type, at);
        self.consecutive_no_open_by_type.remove(&nudge_type);
        let hour = at.with_timezone(&zone).hour();
        *self
            .open_hour_counts_by_type
            .entry(nudge_type)
            .or_default()
            .entry(hour)
            .or_insert(0) += 1;
    }

    /// Count a firing nobody opened (yet). Returns the new streak.
    pub fn record_inferred_fired(&mut self, nudge_type: NudgeType) -> u32 {
        let streak = self.consecutive_no_open_by_type.entry(nudge_type).or_insert(0);
        *streak += 1;
        *streak
    }

    /// Drop date counts older than `retention_days` before `today`.
    pub fn prune_history(&mut self, today: NaiveDate, retention_days: i64) {
        let cutoff = DateKey::new(today - Duration::days(retention_days));
        self.sent_count_by_date.retain(|k, _| *k >= cutoff);
    }
}

// ---------------------------------------------------------------------------
// Repeating nudges
// ---------------------------------------------------------------------------

/// State of one system nudge type's single OS schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepeatingNudgeLedger {
    pub notification_id: Option<NotificationId>,
    pub schedule_time_local: Option<TimeOfDay>,
    /// Last local date this nudge was estimated to have fired.
    pub last_fired_date_key: Option<DateKey>,
    /// Fire instant of the current (or first, for repeating) occurrence.
    #[serde(rename = "scheduledForIso")]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// When the OS accepted the current schedule.
    #[serde(rename = "armedAtIso")]
    pub armed_at: Option<DateTime<Utc>>,
}

impl RepeatingNudgeLedger {
    pub fn is_armed(&self) -> bool {
        self.notification_id.is_some()
    }

    pub fn arm(&mut self, id: NotificationId, time: TimeOfDay, at: DateTime<Utc>, now: DateTime<Utc>) {
        self.notification_id = Some(id);
        self.schedule_time_local = Some(time);
        self.scheduled_for = Some(at);
        self.armed_at = Some(now);
    }

    /// Forget the OS schedule; the fired-date marker survives.
    pub fn disarm(&mut self) {
        self.notification_id = None;
        self.scheduled_for = None;
        self.armed_at = None;
    }
}

// ---------------------------------------------------------------------------
// Activity reminders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityReminderEntry {
    pub activity_id: String,
    pub notification_id: NotificationId,
    #[serde(rename = "scheduledForIso")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(rename = "firedAtIso", skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<DateTime<Utc>>,
    #[serde(rename = "cancelledAtIso", skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ActivityReminderEntry {
    /// Neither fired nor cancelled.
    pub fn is_open(&self) -> bool {
        self.fired_at.is_none() && self.cancelled_at.is_none()
    }

    fn settled_at(&self) -> Option<DateTime<Utc>> {
        self.fired_at.or(self.cancelled_at)
    }
}

/// Activity id → reminder entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityReminderLedger {
    pub entries: BTreeMap<String, ActivityReminderEntry>,
}

impl ActivityReminderLedger {
    pub fn get(&self, activity_id: &str) -> Option<&ActivityReminderEntry> {
        self.entries.get(activity_id)
    }

    pub fn open_entry(&self, activity_id: &str) -> Option<&ActivityReminderEntry> {
        self.get(activity_id).filter(|e| e.is_open())
    }

    pub fn insert(&mut self, entry: ActivityReminderEntry) {
        self.entries.insert(entry.activity_id.clone(), entry);
    }

    pub fn mark_cancelled(&mut self, activity_id: &str, at: DateTime<Utc>) -> bool {
        match self.entries.get_mut(activity_id) {
            Some(e) if e.is_open() => {
                e.cancelled_at = Some(at);
                true
            }
            _ => false,
        }
    }

    /// Remove settled entries whose marker is at least `retention` old.
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.settled_at().is_none_or(|t| now - t < retention));
        before - self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Location offers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationOfferEntry {
    #[serde(rename = "lastFiredAtIso")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// `"{entityId}:{event}"` → last offer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationOfferLedger {
    pub offers: BTreeMap<String, LocationOfferEntry>,
}

impl LocationOfferLedger {
    pub fn key(entity_id: &str, event: GeofenceEventType) -> String {
        format!("{entity_id}:{}", event.as_label())
    }

    pub fn last_fired_at(&self, entity_id: &str, event: GeofenceEventType) -> Option<DateTime<Utc>> {
        self.offers
            .get(&Self::key(entity_id, event))
            .and_then(|e| e.last_fired_at)
    }

    /// True when no offer for the key fired within `spacing` of `now`.
    pub fn can_fire(&self, entity_id: &str, event: GeofenceEventType, now: DateTime<Utc>, spacing: Duration) -> bool {
        self.last_fired_at(entity_id, event)
            .is_none_or(|last| now - last >= spacing)
    }

    pub fn record(&mut self, entity_id: &str, event: GeofenceEventType, at: DateTime<Utc>) {
        self.offers.insert(
            Self::key(entity_id, event),
            LocationOfferEntry {
                last_fired_at: Some(at),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Applied geofence set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppliedRegionLedger {
    pub signature: Option<String>,
    pub region_count: usize,
    #[serde(rename = "appliedAtIso")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl AppliedRegionLedger {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionLedger {
    pub notifications: PermissionStatus,
    pub location: PermissionStatus,
    #[serde(rename = "syncedAtIso")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl PermissionLedger {
    pub fn status(&self, capability: Capability) -> PermissionStatus {
        match capability {
            Capability::Notifications => self.notifications,
            Capability::Location => self.location,
        }
    }

    pub fn set(&mut self, capability: Capability, status: PermissionStatus) {
        match capability {
            Capability::Notifications => self.notifications = status,
            Capability::Location => self.location = status,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledgers + LedgerStore
// ---------------------------------------------------------------------------

/// Every `ledger:*` document, loaded together.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledgers {
    pub system: SystemNudgeLedger,
    pub daily_show_up: RepeatingNudgeLedger,
    pub daily_focus: RepeatingNudgeLedger,
    pub goal_nudge: RepeatingNudgeLedger,
    pub activity_reminders: ActivityReminderLedger,
    pub location_offers: LocationOfferLedger,
    pub geofence: AppliedRegionLedger,
}

impl Ledgers {
    /// The single-schedule ledger of a system type.
    pub fn repeating(&self, nudge_type: NudgeType) -> Option<&RepeatingNudgeLedger> {
        match nudge_type {
            NudgeType::DailyShowUp => Some(&self.daily_show_up),
            NudgeType::DailyFocus => Some(&self.daily_focus),
            NudgeType::GoalNudge => Some(&self.goal_nudge),
            NudgeType::ActivityReminder => None,
        }
    }

    /// The armed daily show-up schedule, whose repeats count against the cap.
    pub fn show_up_slot(&self) -> Option<RepeatingSlot> {
        let r = &self.daily_show_up;
        match (r.is_armed(), r.schedule_time_local, r.scheduled_for) {
            (true, Some(time), Some(first)) => Some(RepeatingSlot {
                nudge_type: NudgeType::DailyShowUp,
                time,
                first,
            }),
            _ => None,
        }
    }

    pub fn repeating_mut(&mut self, nudge_type: NudgeType) -> Option<&mut RepeatingNudgeLedger> {
        match nudge_type {
            NudgeType::DailyShowUp => Some(&mut self.daily_show_up),
            NudgeType::DailyFocus => Some(&mut self.daily_focus),
            NudgeType::GoalNudge => Some(&mut self.goal_nudge),
            NudgeType::ActivityReminder => None,
        }
    }

    fn decode(docs: &DocumentSet) -> Self {
        fn doc<T: DeserializeOwned + Default>(docs: &DocumentSet, key: &str) -> T {
            decode_or_default(key, docs.get(key).and_then(|v| v.as_deref()))
        }
        Self {
            system: doc(docs, keys::SYSTEM),
            daily_show_up: doc(docs, keys::DAILY_SHOW_UP),
            daily_focus: doc(docs, keys::DAILY_FOCUS),
            goal_nudge: doc(docs, keys::GOAL_NUDGE),
            activity_reminders: doc(docs, keys::ACTIVITY_REMINDERS),
            location_offers: doc(docs, keys::LOCATION_OFFERS),
            geofence: doc(docs, keys::GEOFENCE),
        }
    }

    fn encode_into(&self, docs: &mut DocumentSet) -> StoreResult<()> {
        fn put<T: Serialize + Default + PartialEq>(docs: &mut DocumentSet, key: &str, value: &T) -> StoreResult<()> {
            let absent = docs.get(key).is_none_or(|v| v.is_none());
            // Untouched empty ledgers stay absent.
            if absent && *value == T::default() {
                return Ok(());
            }
            let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
                message: format!("{key}: {e}"),
            })?;
            docs.insert(key.to_string(), Some(bytes));
            Ok(())
        }
        put(docs, keys::SYSTEM, &self.system)?;
        put(docs, keys::DAILY_SHOW_UP, &self.daily_show_up)?;
        put(docs, keys::DAILY_FOCUS, &self.daily_focus)?;
        put(docs, keys::GOAL_NUDGE, &self.goal_nudge)?;
        put(docs, keys::ACTIVITY_REMINDERS, &self.activity_reminders)?;
        put(docs, keys::LOCATION_OFFERS, &self.location_offers)?;
        put(docs, keys::GEOFENCE, &self.geofence)?;
        Ok(())
    }
}

fn decode_or_default<T: DeserializeOwned + Default>(key: &str, bytes: Option<&[u8]>) -> T {
    match bytes {
        None => T::default(),
        Some(raw) => serde_json::from_slice(raw).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "unreadable ledger document, treating as empty");
            T::default()
        }),
    }
}

/// Typed access to the ledger documents.
#[derive(Debug)]
pub struct LedgerStore {
    docs: DocumentStore,
}

impl LedgerStore {
    /// Ledgers that live only as long as the process.
    pub fn memory_only() -> Self {
        Self {
            docs: DocumentStore::memory_only(),
        }
    }

    /// Ledgers persisted in redb under `data_dir`.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        Ok(Self {
            docs: DocumentStore::with_persistence(data_dir)?,
        })
    }

    pub fn is_durable(&self) -> bool {
        self.docs.is_durable()
    }

    /// Read-only view of every ledger.
    pub fn load(&self) -> StoreResult<Ledgers> {
        let mut docs = DocumentSet::new();
        for key in keys::LEDGERS {
            docs.insert(key.to_string(), self.docs.get(key)?);
        }
        Ok(Ledgers::decode(&docs))
    }

    /// Run `f` against the ledgers inside one store transaction.
    ///
    /// Only documents whose serialized form changed are written. If
    /// encoding fails nothing is written and the error is returned.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Ledgers) -> R) -> StoreResult<R> {
        self.docs
            .update_many(&keys::LEDGERS, |docs| {
                let mut ledgers = Ledgers::decode(docs);
                let result = f(&mut ledgers);
                let mut out = docs.clone();
                ledgers.encode_into(&mut out)?;
                *docs = out;
                Ok(result)
            })?
    }

    pub fn permissions(&self) -> StoreResult<PermissionLedger> {
        let raw = self.docs.get(keys::PERMISSIONS)?;
        Ok(decode_or_default(keys::PERMISSIONS, raw.as_deref()))
    }

    pub fn save_permissions(&self, ledger: &PermissionLedger) -> StoreResult<()> {
        self.put_json(keys::PERMISSIONS, ledger)
    }

    /// Keys of every document written so far.
    pub fn document_keys(&self) -> StoreResult<Vec<String>> {
        self.docs.keys()
    }

    /// The last published domain snapshot, if any.
    ///
    /// An undecodable snapshot reads as absent. Its defaults would turn every
    /// nudge type back on.
    pub fn snapshot(&self) -> StoreResult<Option<DomainSnapshot>> {
        let Some(raw) = self.docs.get(keys::SNAPSHOT)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable snapshot document, ignoring it");
                Ok(None)
            }
        }
    }

    pub fn save_snapshot(&self, snapshot: &DomainSnapshot) -> StoreResult<()> {
        self.put_json(keys::SNAPSHOT, snapshot)
    }

    /// Delete every ledger; with `include_state` also permissions and the snapshot.
    pub fn reset(&self, include_state: bool) -> StoreResult<usize> {
        let mut removed = 0;
        for key in keys::LEDGERS {
            removed += usize::from(self.docs.remove(key)?);
        }
        if include_state {
            removed += usize::from(self.docs.remove(keys::PERMISSIONS)?);
            removed += usize::from(self.docs.remove(keys::SNAPSHOT)?);
        }
        Ok(removed)
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
            message: format!("{key}: {e}"),
        })?;
        self.docs.put(key, &bytes)
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.docs.put(key, bytes)
    }
}
