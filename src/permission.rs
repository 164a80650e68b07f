//! Permission state: normalize, persist, ensure.
//!
//! OS answers are reduced to [`PermissionStatus`] at the boundary and
//! persisted in the permission ledger for display. Gating decisions always
//! call [`PermissionSync::sync`] first; the persisted value is never trusted
//! on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::LedgerStore;
use crate::platform::{
    Capability, NotificationAuthorization, PermissionProvider, PermissionResponse, PermissionStatus,
    PlatformError,
};

/// Map a raw OS answer onto the normalized status.
///
/// Geofencing needs "always" location access. A grant the OS explicitly
/// reports as foreground-only counts as not yet requested while the OS
/// still allows asking, and as denied once it doesn't.
pub fn normalize(response: &PermissionResponse) -> PermissionStatus {
    match *response {
        PermissionResponse::ModuleMissing => PermissionStatus::Unavailable,
        PermissionResponse::Notifications { status } => match status {
            NotificationAuthorization::Authorized
            | NotificationAuthorization::Provisional
            | NotificationAuthorization::Ephemeral => PermissionStatus::Authorized,
            NotificationAuthorization::Denied => PermissionStatus::Denied,
            NotificationAuthorization::NotDetermined => PermissionStatus::NotRequested,
        },
        PermissionResponse::Location {
            granted,
            can_ask_again,
            restricted,
            background,
        } => {
            if restricted {
                PermissionStatus::Restricted
            } else if granted && background != Some(false) {
                PermissionStatus::Authorized
            } else if can_ask_again {
                PermissionStatus::NotRequested
            } else {
                PermissionStatus::Denied
            }
        }
    }
}

/// Result of [`PermissionSync::ensure_with_rationale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum EnsureOutcome {
    Authorized,
    /// Re-prompting isn't allowed; send the user to the OS settings.
    NeedsSettings {
        capability: Capability,
        status: PermissionStatus,
    },
    /// The user dismissed the prompt without granting.
    Declined,
    Unavailable,
}

/// Permission queries and prompts, persisted through the ledger store.
pub struct PermissionSync<'a> {
    store: &'a LedgerStore,
    provider: &'a dyn PermissionProvider,
}

impl<'a> PermissionSync<'a> {
    pub fn new(store: &'a LedgerStore, provider: &'a dyn PermissionProvider) -> Self {
        Self { store, provider }
    }

    /// Last persisted status; for display only.
    pub fn cached(&self, capability: Capability) -> PermissionStatus {
        match self.store.permissions() {
            Ok(ledger) => ledger.status(capability),
            Err(e) => {
                tracing::warn!(%capability, error = %e, "failed to read permission ledger");
                PermissionStatus::NotRequested
            }
        }
    }

    /// Query the OS, normalize, and persist.
    ///
    /// A transient query failure gates closed and leaves the persisted
    /// value alone.
    pub fn sync(&self, capability: Capability, now: DateTime<Utc>) -> PermissionStatus {
        let status = match self.provider.query(capability) {
            Ok(response) => normalize(&response),
            Err(PlatformError::Unavailable { .. }) => PermissionStatus::Unavailable,
            Err(e) => {
                tracing::warn!(%capability, error = %e, "permission query failed");
                return PermissionStatus::Denied;
            }
        };
        self.persist(capability, status, now);
        status
    }

    fn persist(&self, capability: Capability, status: PermissionStatus, now: DateTime<Utc>) {
        let result = self.store.permissions().and_then(|mut ledger| {
            if ledger.status(capability) == status && ledger.synced_at.is_some() {
                return Ok(());
            }
            ledger.set(capability, status);
            ledger.synced_at = Some(now);
            self.store.save_permissions(&ledger)
        });
        if let Err(e) = result {
            tracing::warn!(%capability, error = %e, "failed to persist permission status");
        }
    }

    /// Make sure `capability` is granted, prompting only when the OS allows it.
    pub fn ensure_with_rationale(
        &self,
        capability: Capability,
        rationale: &str,
        now: DateTime<Utc>,
    ) -> EnsureOutcome {
        match self.sync(capability, now) {
            PermissionStatus::Authorized => EnsureOutcome::Authorized,
            PermissionStatus::Unavailable => EnsureOutcome::Unavailable,
            status @ (PermissionStatus::Denied | PermissionStatus::Restricted) => {
                EnsureOutcome::NeedsSettings { capability, status }
            }
            PermissionStatus::NotRequested => {
                if let Err(e) = self.provider.request(capability, rationale) {
                    tracing::warn!(%capability, error = %e, "permission prompt failed");
                }
                match self.sync(capability, now) {
                    PermissionStatus::Authorized => EnsureOutcome::Authorized,
                    PermissionStatus::Unavailable => EnsureOutcome::Unavailable,
                    _ => EnsureOutcome::Declined,
                }
            }
        }
    }

    /// Best-effort jump to the OS settings screen.
    pub fn open_settings(&self) -> bool {
        match self.provider.open_settings() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open settings");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::InMemoryPermissions;
    use crate::time::parse_instant;

    fn now() -> DateTime<Utc> {
        parse_instant("2026-01-01T10:00:00Z").unwrap()
    }

    fn location(granted: bool, can_ask_again: bool, background: Option<bool>) -> PermissionResponse {
        PermissionResponse::Location {
            granted,
            can_ask_again,
            restricted: false,
            background,
        }
    }

    #[test]
    fn normalization_table() {
        assert_eq!(normalize(&PermissionResponse::ModuleMissing), PermissionStatus::Unavailable);
        assert_eq!(
            normalize(&PermissionResponse::Notifications {
                status: NotificationAuthorization::Provisional
            }),
            PermissionStatus::Authorized
        );
        assert_eq!(normalize(&location(true, true, None)), PermissionStatus::Authorized);
        assert_eq!(normalize(&location(true, true, Some(false))), PermissionStatus::NotRequested);
        assert_eq!(normalize(&location(true, false, Some(false))), PermissionStatus::Denied);
        assert_eq!(normalize(&location(false, false, None)), PermissionStatus::Denied);
        assert_eq!(
            normalize(&PermissionResponse::Location {
                granted: true,
                can_ask_again: true,
                restricted: true,
                background: Some(true)
            }),
            PermissionStatus::Restricted
        );
    }

    #[test]
    fn sync_persists() {
        let store = LedgerStore::memory_only();
        let perms = InMemoryPermissions::granted();
        let sync = PermissionSync::new(&store, &perms);
        assert_eq!(sync.cached(Capability::Location), PermissionStatus::NotRequested);
        assert_eq!(sync.sync(Capability::Location, now()), PermissionStatus::Authorized);
        assert_eq!(sync.cached(Capability::Location), PermissionStatus::Authorized);
        assert_eq!(store.permissions().unwrap().synced_at, Some(now()));
    }

    #[test]
    fn ensure_prompts_once_when_not_requested() {
        let store = LedgerStore::memory_only();
        let perms = InMemoryPermissions::new();
        perms.on_request(
            Capability::Notifications,
            PermissionResponse::Notifications {
                status: NotificationAuthorization::Authorized,
            },
        );
        let sync = PermissionSync::new(&store, &perms);
        assert_eq!(
            sync.ensure_with_rationale(Capability::Notifications, "reminders", now()),
            EnsureOutcome::Authorized
        );
        assert_eq!(perms.request_calls(), 1);
        // Already granted: no second prompt.
        sync.ensure_with_rationale(Capability::Notifications, "reminders", now());
        assert_eq!(perms.request_calls(), 1);
    }

    #[test]
    fn denied_goes_to_settings_without_prompt() {
        let store = LedgerStore::memory_only();
        let perms = InMemoryPermissions::new();
        perms.set(Capability::Location, location(false, false, None));
        let sync = PermissionSync::new(&store, &perms);
        assert_eq!(
            sync.ensure_with_rationale(Capability::Location, "offers", now()),
            EnsureOutcome::NeedsSettings {
                capability: Capability::Location,
                status: PermissionStatus::Denied
            }
        );
        assert_eq!(perms.request_calls(), 0);
        assert!(sync.open_settings());
        assert_eq!(perms.settings_opened(), 1);
    }

    #[test]
    fn dismissed_prompt_is_declined() {
        let store = LedgerStore::memory_only();
        let perms = InMemoryPermissions::new();
        let sync = PermissionSync::new(&store, &perms);
        assert_eq!(
            sync.ensure_with_rationale(Capability::Location, "offers", now()),
            EnsureOutcome::Declined
        );
    }

    #[test]
    fn missing_module_is_unavailable() {
        let store = LedgerStore::memory_only();
        let perms = InMemoryPermissions::new();
        perms.set(Capability::Notifications, PermissionResponse::ModuleMissing);
        let sync = PermissionSync::new(&store, &perms);
        assert_eq!(
            sync.ensure_with_rationale(Capability::Notifications, "x", now()),
            EnsureOutcome::Unavailable
        );
    }
}
