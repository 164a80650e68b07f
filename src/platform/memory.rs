//! In-process OS stand-ins.
//!
//! Each type records every call and can be told to fail, so tests can
//! assert on "zero schedule calls" or on a send that the OS rejected.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::{
    Capability, GeofenceMonitor, NotificationCenter, NotificationId, NotificationRequest,
    NotificationTrigger, PermissionProvider, PermissionResponse, PlatformError, PlatformResult,
};
use crate::geofence::GeofenceRegion;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rejected(operation: &str) -> PlatformError {
    PlatformError::Rejected {
        operation: operation.to_string(),
        message: "injected failure".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CenterState {
    next_id: u64,
    pending: BTreeMap<NotificationId, NotificationRequest>,
    presented: Vec<(NotificationId, NotificationRequest)>,
    schedule_calls: usize,
    cancel_calls: usize,
    fail_schedule: bool,
    fail_cancel: bool,
    fail_query: bool,
}

/// Local-notification center kept in memory.
///
/// [`deliver_due`](Self::deliver_due) plays the OS: one-shots whose time has
/// come leave the pending set and are moved to the presented list.
#[derive(Debug, Default)]
pub struct InMemoryNotificationCenter {
    state: Mutex<CenterState>,
}

impl InMemoryNotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_schedules(&self, fail: bool) {
        lock(&self.state).fail_schedule = fail;
    }

    pub fn fail_cancels(&self, fail: bool) {
        lock(&self.state).fail_cancel = fail;
    }

    pub fn fail_queries(&self, fail: bool) {
        lock(&self.state).fail_query = fail;
    }

    /// Schedule attempts, including rejected ones.
    pub fn schedule_calls(&self) -> usize {
        lock(&self.state).schedule_calls
    }

    pub fn cancel_calls(&self) -> usize {
        lock(&self.state).cancel_calls
    }

    pub fn pending(&self) -> Vec<(NotificationId, NotificationRequest)> {
        lock(&self.state)
            .pending
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.state).pending.contains_key(id)
    }

    pub fn presented(&self) -> Vec<(NotificationId, NotificationRequest)> {
        lock(&self.state).presented.clone()
    }

    /// Fire every one-shot due at `now`. Repeating schedules stay pending.
    pub fn deliver_due(&self, now: DateTime<Utc>) -> Vec<NotificationId> {
        let mut state = lock(&self.state);
        let due: Vec<NotificationId> = state
            .pending
            .iter()
            .filter(|(_, r)| matches!(r.trigger, NotificationTrigger::At { at } if at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            if let Some(request) = state.pending.remove(id) {
                state.presented.push((id.clone(), request));
            }
        }
        due
    }

    /// Drop a pending notification as if the OS discarded it.
    pub fn forget(&self, id: &str) -> bool {
        lock(&self.state).pending.remove(id).is_some()
    }
}

impl NotificationCenter for InMemoryNotificationCenter {
    fn schedule(&self, request: &NotificationRequest) -> PlatformResult<NotificationId> {
        let mut state = lock(&self.state);
        state.schedule_calls += 1;
        if state.fail_schedule {
            return Err(rejected("schedule"));
        }
        state.next_id += 1;
        let id = format!("local-{}", state.next_id);
        match request.trigger {
            NotificationTrigger::Immediate => state.presented.push((id.clone(), request.clone())),
            _ => {
                state.pending.insert(id.clone(), request.clone());
            }
        }
        Ok(id)
    }

    fn cancel(&self, id: &str) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        state.cancel_calls += 1;
        if state.fail_cancel {
            return Err(rejected("cancel"));
        }
        state.pending.remove(id);
        Ok(())
    }

    fn scheduled_ids(&self) -> PlatformResult<HashSet<NotificationId>> {
        let state = lock(&self.state);
        if state.fail_query {
            return Err(rejected("scheduled_ids"));
        }
        Ok(state.pending.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Geofencing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MonitorState {
    available: bool,
    monitoring: bool,
    regions: Vec<GeofenceRegion>,
    start_calls: usize,
    stop_calls: usize,
    fail_start: bool,
}

/// Region monitor kept in memory.
#[derive(Debug)]
pub struct InMemoryGeofenceMonitor {
    state: Mutex<MonitorState>,
}

impl Default for InMemoryGeofenceMonitor {
    fn default() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                available: true,
                monitoring: false,
                regions: Vec::new(),
                start_calls: 0,
                stop_calls: 0,
                fail_start: false,
            }),
        }
    }
}

impl InMemoryGeofenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    pub fn fail_starts(&self, fail: bool) {
        lock(&self.state).fail_start = fail;
    }

    pub fn regions(&self) -> Vec<GeofenceRegion> {
        lock(&self.state).regions.clone()
    }

    pub fn start_calls(&self) -> usize {
        lock(&self.state).start_calls
    }

    pub fn stop_calls(&self) -> usize {
        lock(&self.state).stop_calls
    }
}

impl GeofenceMonitor for InMemoryGeofenceMonitor {
    fn is_available(&self) -> bool {
        lock(&self.state).available
    }

    fn is_monitoring(&self) -> PlatformResult<bool> {
        Ok(lock(&self.state).monitoring)
    }

    fn start(&self, regions: &[GeofenceRegion]) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        state.start_calls += 1;
        if !state.available {
            return Err(PlatformError::Unavailable {
                capability: "geofencing".into(),
            });
        }
        if state.fail_start {
            return Err(rejected("start_geofencing"));
        }
        state.regions = regions.to_vec();
        state.monitoring = true;
        Ok(())
    }

    fn stop(&self) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        state.stop_calls += 1;
        state.regions.clear();
        state.monitoring = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PermissionState {
    current: HashMap<Capability, PermissionResponse>,
    after_request: HashMap<Capability, PermissionResponse>,
    request_calls: usize,
    settings_opened: usize,
}

/// Permission provider with scripted answers.
///
/// Unset capabilities answer "not determined". A request replaces the
/// current answer with the scripted post-prompt answer, if one was given.
#[derive(Debug, Default)]
pub struct InMemoryPermissions {
    state: Mutex<PermissionState>,
}

impl InMemoryPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both capabilities granted, background location included.
    pub fn granted() -> Self {
        let perms = Self::new();
        perms.set(
            Capability::Notifications,
            PermissionResponse::Notifications {
                status: super::NotificationAuthorization::Authorized,
            },
        );
        perms.set(
            Capability::Location,
            PermissionResponse::Location {
                granted: true,
                can_ask_again: true,
                restricted: false,
                background: Some(true),
            },
        );
        perms
    }

    pub fn set(&self, capability: Capability, response: PermissionResponse) {
        lock(&self.state).current.insert(capability, response);
    }

    /// What the OS will answer after the user goes through the prompt.
    pub fn on_request(&self, capability: Capability, response: PermissionResponse) {
        lock(&self.state).after_request.insert(capability, response);
    }

    pub fn request_calls(&self) -> usize {
        lock(&self.state).request_calls
    }

    pub fn settings_opened(&self) -> usize {
        lock(&self.state).settings_opened
    }

    fn undetermined(capability: Capability) -> PermissionResponse {
        match capability {
            Capability::Notifications => PermissionResponse::Notifications {
                status: super::NotificationAuthorization::NotDetermined,
            },
            Capability::Location => PermissionResponse::Location {
                granted: false,
                can_ask_again: true,
                restricted: false,
                background: None,
            },
        }
    }
}

impl PermissionProvider for InMemoryPermissions {
    fn query(&self, capability: Capability) -> PlatformResult<PermissionResponse> {
        Ok(lock(&self.state)
            .current
            .get(&capability)
            .copied()
            .unwrap_or_else(|| Self::undetermined(capability)))
    }

    fn request(
        &self,
        capability: Capability,
        _rationale: &str,
    ) -> PlatformResult<PermissionResponse> {
        let mut state = lock(&self.state);
        state.request_calls += 1;
        if let Some(next) = state.after_request.get(&capability).copied() {
            state.current.insert(capability, next);
        }
        Ok(state
            .current
            .get(&capability)
            .copied()
            .unwrap_or_else(|| Self::undetermined(capability)))
    }

    fn open_settings(&self) -> PlatformResult<()> {
        lock(&self.state).settings_opened += 1;
        Ok(())
    }
}
