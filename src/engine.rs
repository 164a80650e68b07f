//! Engine facade: the entry points the host calls.
//!
//! [`NudgeEngine`] owns the ledger store, the platform handles, the clock
//! and the configuration. Every entry point reads its facts from durable
//! storage (the in-memory snapshot is only a fallback), so the same calls
//! work in a warm foreground process and in a cold background wake.
//! Entry points are serialized by one operation lock; the debounced region
//! sync takes the same lock when it runs.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;

use crate::analytics::{AnalyticsSink, ReconcileSource, TracingSink};
use crate::config::NudgeConfig;
use crate::debounce::Debouncer;
use crate::error::{EngineError, NudgeResult};
use crate::geofence::{
    GeofenceEvent, GeofenceEventHandler, OfferOutcome, RawGeofenceEvent, RegionReconciler,
    RegionSyncOutcome, StopReason,
};
use crate::ledger::{LedgerStore, Ledgers, PermissionLedger};
use crate::model::{ActivitySnapshot, DomainSnapshot, NudgeType};
use crate::permission::{EnsureOutcome, PermissionSync};
use crate::platform::{
    Capability, GeofenceMonitor, NotificationCenter, PermissionProvider, PermissionStatus,
};
use crate::policy::{FireDecision, FireRequest, NudgePolicy};
use crate::reconcile::{DeliveryReconciler, ReconcileReport};
use crate::scheduler::{NotificationScheduler, ReminderSyncReport, ScheduleOutcome};
use crate::time::{Clock, local_date};

/// Host primitives the engine drives.
#[derive(Clone)]
pub struct Platform {
    pub notifications: Arc<dyn NotificationCenter>,
    pub geofence: Arc<dyn GeofenceMonitor>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub analytics: Arc<dyn AnalyticsSink>,
}

impl Platform {
    /// Platform handles with analytics going to the tracing log.
    pub fn new(
        notifications: Arc<dyn NotificationCenter>,
        geofence: Arc<dyn GeofenceMonitor>,
        permissions: Arc<dyn PermissionProvider>,
    ) -> Self {
        Self {
            notifications,
            geofence,
            permissions,
            analytics: Arc::new(TracingSink),
        }
    }

    pub fn with_analytics(mut self, sink: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = sink;
        self
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// What a preference or entity change did synchronously.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReport {
    pub system: Vec<(NudgeType, ScheduleOutcome)>,
    pub reminders: ReminderSyncReport,
    /// Set when monitoring was stopped without waiting for the debounce.
    pub regions: Option<RegionSyncOutcome>,
    /// Whether a region sync is waiting on the debounce timer.
    pub region_sync_deferred: bool,
}

/// What an app launch or foreground pass did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeReport {
    pub delivery: ReconcileReport,
    pub regions: RegionSyncOutcome,
}

/// Read-only summary for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub durable: bool,
    pub zone: String,
    pub today: NaiveDate,
    pub snapshot_captured_at: Option<DateTime<Utc>>,
    pub activities: usize,
    pub ledgers: Ledgers,
    pub permissions: PermissionLedger,
    /// Stored documents by key.
    pub documents: Vec<String>,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "nudge engine")?;
        writeln!(f, "  storage:     {}", if self.durable { "durable" } else { "memory-only" })?;
        writeln!(f, "  zone:        {} (today {})", self.zone, self.today)?;
        match self.snapshot_captured_at {
            Some(at) => writeln!(f, "  snapshot:    {} activities, captured {at}", self.activities)?,
            None => writeln!(f, "  snapshot:    {} activities", self.activities)?,
        }
        writeln!(
            f,
            "  sent today:  {}",
            self.ledgers.system.sent_on(self.today)
        )?;
        for t in NudgeType::SYSTEM {
            let state = match self.ledgers.repeating(t) {
                Some(r) if r.is_armed() => match r.scheduled_for {
                    Some(at) => format!("armed for {at}"),
                    None => "armed".to_string(),
                },
                _ => "idle".to_string(),
            };
            writeln!(f, "  {:<13} {state}", format!("{t}:"))?;
        }
        let open = self
            .ledgers
            .activity_reminders
            .entries
            .values()
            .filter(|e| e.is_open())
            .count();
        writeln!(f, "  reminders:   {open} open")?;
        writeln!(f, "  regions:     {}", self.ledgers.geofence.region_count)?;
        writeln!(f, "  permissions: notifications {}, location {}", self.permissions.notifications, self.permissions.location)?;
        writeln!(f, "  documents:   {}", self.documents.join(", "))
    }
}

struct EngineInner {
    config: NudgeConfig,
    zone: FixedOffset,
    store: LedgerStore,
    platform: Platform,
    clock: Arc<dyn Clock>,
    cached: RwLock<Option<DomainSnapshot>>,
    op_lock: Mutex<()>,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn cached(&self) -> Option<DomainSnapshot> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Durable snapshot first; the in-memory copy only when storage fails or is empty.
    fn snapshot(&self) -> Option<DomainSnapshot> {
        match self.store.snapshot() {
            Ok(Some(s)) => Some(s),
            Ok(None) => self.cached(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read snapshot, using cached copy");
                self.cached()
            }
        }
    }

    fn require_snapshot(&self) -> NudgeResult<DomainSnapshot> {
        self.snapshot().ok_or_else(|| EngineError::NoSnapshot.into())
    }

    fn scheduler(&self) -> NotificationScheduler<'_> {
        NotificationScheduler::new(&self.config, self.zone, &self.store, self.platform.notifications.as_ref())
    }

    fn permissions(&self) -> PermissionSync<'_> {
        PermissionSync::new(&self.store, self.platform.permissions.as_ref())
    }

    fn sync_regions(&self) -> RegionSyncOutcome {
        let _guard = self.lock();
        let snapshot = self.snapshot().unwrap_or_default();
        let permissions = self.permissions();
        RegionReconciler::new(&self.config.location, &self.store, self.platform.geofence.as_ref(), &permissions)
            .sync(&snapshot, self.now())
    }

    fn reconcile(&self, source: ReconcileSource) -> ReconcileReport {
        let _guard = self.lock();
        let Some(snapshot) = self.snapshot() else {
            tracing::info!(?source, "no snapshot yet, skipping delivery reconciliation");
            return ReconcileReport {
                aborted: true,
                ..Default::default()
            };
        };
        DeliveryReconciler::new(
            &self.config,
            self.zone,
            &self.store,
            self.platform.notifications.as_ref(),
            self.platform.analytics.as_ref(),
        )
        .run(&snapshot, self.now(), source)
    }
}

/// The notification and geofence scheduling engine.
pub struct NudgeEngine {
    inner: Arc<EngineInner>,
    region_debounce: Debouncer,
}

impl NudgeEngine {
    /// Open an engine, durable when `config.data_dir` is set.
    pub fn open(config: NudgeConfig, platform: Platform, clock: Arc<dyn Clock>) -> NudgeResult<Self> {
        let store = match &config.data_dir {
            Some(dir) => LedgerStore::open(dir)?,
            None => LedgerStore::memory_only(),
        };
        Self::with_store(config, store, platform, clock)
    }

    /// Open an engine over an already opened store.
    pub fn with_store(
        config: NudgeConfig,
        store: LedgerStore,
        platform: Platform,
        clock: Arc<dyn Clock>,
    ) -> NudgeResult<Self> {
        config.validate()?;
        let zone = config.zone();
        let cached = match store.snapshot() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted snapshot");
                None
            }
        };
        let region_debounce = Debouncer::new(config.location.sync_debounce());
        tracing::info!(durable = store.is_durable(), %zone, "nudge engine opened");
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                zone,
                store,
                platform,
                clock,
                cached: RwLock::new(cached),
                op_lock: Mutex::new(()),
            }),
            region_debounce,
        })
    }

    pub fn config(&self) -> &NudgeConfig {
        &self.inner.config
    }

    pub fn zone(&self) -> FixedOffset {
        self.inner.zone
    }

    pub fn store(&self) -> &LedgerStore {
        &self.inner.store
    }

    // -----------------------------------------------------------------------
    // Domain snapshot
    // -----------------------------------------------------------------------

    /// Persist the host's snapshot and refresh the in-memory copy.
    ///
    /// The in-memory copy is updated even if the write fails.
    pub fn publish_snapshot(&self, mut snapshot: DomainSnapshot) -> NudgeResult<()> {
        if snapshot.captured_at.is_none() {
            snapshot.captured_at = Some(self.inner.now());
        }
        snapshot.drop_unusable_triggers();
        let saved = self.inner.store.save_snapshot(&snapshot);
        *self
            .inner
            .cached
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        saved.map_err(Into::into)
    }

    pub fn current_snapshot(&self) -> Option<DomainSnapshot> {
        self.inner.snapshot()
    }

    fn publish_logged(&self, snapshot: DomainSnapshot) {
        if let Err(e) = self.publish_snapshot(snapshot) {
            tracing::warn!(error = %e, "failed to persist snapshot");
        }
    }

    // -----------------------------------------------------------------------
    // Change hooks
    // -----------------------------------------------------------------------

    /// Preferences changed: resync system nudges and reminders now, regions after the debounce.
    ///
    /// Turning off location offers or notifications stops monitoring right
    /// away instead of waiting for the debounced pass.
    pub fn on_preferences_changed(&self, snapshot: DomainSnapshot) -> ChangeReport {
        self.publish_logged(snapshot.clone());
        let mut report = {
            let inner = &self.inner;
            let _guard = inner.lock();
            let now = inner.now();
            let scheduler = inner.scheduler();
            ChangeReport {
                system: scheduler.sync_preferences(&snapshot, now),
                reminders: scheduler.sync_activity_reminders(&snapshot, now),
                ..Default::default()
            }
        };

        let prefs = &snapshot.preferences;
        let stop = if !prefs.location_offers_enabled {
            Some(StopReason::OffersDisabled)
        } else if !prefs.notifications_enabled {
            Some(StopReason::NotificationsDisabled)
        } else {
            None
        };
        if let Some(reason) = stop {
            self.region_debounce.cancel();
            let inner = &self.inner;
            let _guard = inner.lock();
            let permissions = inner.permissions();
            let reconciler = RegionReconciler::new(
                &inner.config.location,
                &inner.store,
                inner.platform.geofence.as_ref(),
                &permissions,
            );
            report.regions = Some(reconciler.stop(reason));
        } else {
            report.region_sync_deferred = self.schedule_region_sync();
        }
        report
    }

    /// Activities changed: resync reminders now, regions after the debounce.
    pub fn on_entities_changed(&self, snapshot: DomainSnapshot) -> ChangeReport {
        self.publish_logged(snapshot.clone());
        let reminders = {
            let _guard = self.inner.lock();
            self.inner
                .scheduler()
                .sync_activity_reminders(&snapshot, self.inner.now())
        };
        ChangeReport {
            reminders,
            region_sync_deferred: self.schedule_region_sync(),
            ..Default::default()
        }
    }

    // -----------------------------------------------------------------------
    // OS wake-ups
    // -----------------------------------------------------------------------

    /// Background task wake-up: infer deliveries and re-arm.
    pub fn on_background_wake(&self) -> ReconcileReport {
        self.inner.reconcile(ReconcileSource::BackgroundTask)
    }

    pub fn on_app_launch(&self) -> WakeReport {
        self.wake(ReconcileSource::AppLaunch)
    }

    pub fn on_foreground(&self) -> WakeReport {
        self.wake(ReconcileSource::Foreground)
    }

    fn wake(&self, source: ReconcileSource) -> WakeReport {
        let delivery = self.inner.reconcile(source);
        self.region_debounce.cancel();
        WakeReport {
            delivery,
            regions: self.inner.sync_regions(),
        }
    }

    /// Region enter/exit callback.
    pub fn on_geofence_event(&self, event: &GeofenceEvent) -> OfferOutcome {
        let inner = &self.inner;
        let _guard = inner.lock();
        let fallback = inner.cached();
        let permissions = inner.permissions();
        GeofenceEventHandler::new(
            &inner.config.location,
            &inner.store,
            inner.platform.notifications.as_ref(),
            &permissions,
            inner.platform.analytics.as_ref(),
        )
        .with_fallback(fallback.as_ref())
        .handle(event, inner.now())
    }

    /// Raw callback payload; `None` when it can't be normalized.
    pub fn on_raw_geofence_event(&self, raw: &RawGeofenceEvent) -> Option<OfferOutcome> {
        match raw.normalize() {
            Some(event) => Some(self.on_geofence_event(&event)),
            None => {
                tracing::warn!(?raw, "ignoring unrecognized geofence event");
                None
            }
        }
    }

    /// The user opened a system nudge.
    pub fn on_notification_opened(&self, nudge_type: NudgeType) -> NudgeResult<()> {
        if !nudge_type.is_system() {
            return Ok(());
        }
        let _guard = self.inner.lock();
        let (now, zone) = (self.inner.now(), self.inner.zone);
        self.inner
            .store
            .transact(|l| l.system.record_opened(nudge_type, now, zone))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Direct scheduling
    // -----------------------------------------------------------------------

    pub fn schedule_daily_show_up(&self) -> NudgeResult<ScheduleOutcome> {
        let snapshot = self.inner.require_snapshot()?;
        let _guard = self.inner.lock();
        Ok(self
            .inner
            .scheduler()
            .schedule_daily_show_up(&snapshot, self.inner.now()))
    }

    pub fn schedule_daily_focus(&self, earliest: Option<NaiveDate>) -> NudgeResult<ScheduleOutcome> {
        let snapshot = self.inner.require_snapshot()?;
        let _guard = self.inner.lock();
        Ok(self
            .inner
            .scheduler()
            .schedule_daily_focus(&snapshot, self.inner.now(), earliest))
    }

    pub fn schedule_goal_nudge(&self) -> NudgeResult<ScheduleOutcome> {
        let snapshot = self.inner.require_snapshot()?;
        let _guard = self.inner.lock();
        Ok(self
            .inner
            .scheduler()
            .schedule_goal_nudge(&snapshot, self.inner.now()))
    }

    /// Set an activity's reminder. Unknown ids are scheduled as bare activities.
    pub fn set_activity_reminder(&self, activity_id: &str, at: DateTime<Utc>) -> NudgeResult<ScheduleOutcome> {
        let snapshot = self.inner.require_snapshot()?;
        let activity = snapshot
            .activity(activity_id)
            .cloned()
            .unwrap_or_else(|| ActivitySnapshot::new(activity_id));
        let _guard = self.inner.lock();
        Ok(self.inner.scheduler().schedule_activity_reminder(
            &activity,
            at,
            &snapshot.preferences,
            self.inner.now(),
        ))
    }

    pub fn clear_activity_reminder(&self, activity_id: &str) -> ScheduleOutcome {
        let _guard = self.inner.lock();
        self.inner
            .scheduler()
            .clear_activity_reminder(activity_id, self.inner.now())
    }

    // -----------------------------------------------------------------------
    // Regions
    // -----------------------------------------------------------------------

    /// Reconcile regions immediately, dropping any pending debounced pass.
    pub fn sync_regions_now(&self) -> RegionSyncOutcome {
        self.region_debounce.cancel();
        self.inner.sync_regions()
    }

    /// Reconcile regions after the debounce window. Returns whether the
    /// pass was deferred (false means it already ran inline).
    pub fn schedule_region_sync(&self) -> bool {
        let inner = Arc::clone(&self.inner);
        self.region_debounce.schedule(move || {
            let outcome = inner.sync_regions();
            tracing::debug!(?outcome, "debounced region sync finished");
        })
    }

    pub fn region_sync_pending(&self) -> bool {
        self.region_debounce.is_pending()
    }

    // -----------------------------------------------------------------------
    // Permissions
    // -----------------------------------------------------------------------

    pub fn ensure_permission(&self, capability: Capability, rationale: &str) -> EnsureOutcome {
        let _guard = self.inner.lock();
        self.inner
            .permissions()
            .ensure_with_rationale(capability, rationale, self.inner.now())
    }

    /// Last persisted status, without asking the OS.
    pub fn permission_status(&self, capability: Capability) -> PermissionStatus {
        self.inner.permissions().cached(capability)
    }

    pub fn open_settings(&self) -> bool {
        self.inner.permissions().open_settings()
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Preview the policy decision for a type without scheduling anything.
    pub fn decide(&self, nudge_type: NudgeType, explicit_at: Option<DateTime<Utc>>) -> NudgeResult<FireDecision> {
        let snapshot = self.inner.snapshot().unwrap_or_default();
        let ledgers = self.inner.store.load()?;
        let now = self.inner.now();
        let today = local_date(now, self.inner.zone);
        let mut request = FireRequest::new(nudge_type, now, self.inner.zone, &snapshot.preferences)
            .showed_up_today(snapshot.showed_up_on(today))
            .repeating(ledgers.show_up_slot());
        if let Some(at) = explicit_at {
            request = request.explicit_at(at);
        }
        Ok(NudgePolicy::new(self.inner.config.policy.clone()).decide(&request, &ledgers.system))
    }

    pub fn status(&self) -> NudgeResult<EngineStatus> {
        let snapshot = self.inner.snapshot();
        let zone = self.inner.zone;
        Ok(EngineStatus {
            durable: self.inner.store.is_durable(),
            zone: zone.to_string(),
            today: local_date(self.inner.now(), zone),
            snapshot_captured_at: snapshot.as_ref().and_then(|s| s.captured_at),
            activities: snapshot.as_ref().map_or(0, |s| s.activities.len()),
            ledgers: self.inner.store.load()?,
            permissions: self.inner.store.permissions()?,
            documents: self.inner.store.document_keys()?,
        })
    }

    /// Delete every ledger, and with `include_state` the snapshot and permissions too.
    pub fn reset(&self, include_state: bool) -> NudgeResult<usize> {
        let _guard = self.inner.lock();
        let removed = self.inner.store.reset(include_state)?;
        if include_state {
            *self
                .inner
                .cached
                .write()
                .unwrap_or_else(PoisonError::into_inner) = None;
        }
        Ok(removed)
    }
}

impl fmt::Debug for NudgeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NudgeEngine")
            .field("durable", &self.inner.store.is_durable())
            .field("zone", &self.inner.zone)
            .finish()
    }
}
