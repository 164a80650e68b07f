//! Host OS boundary: local notifications, geofencing, permissions.
//!
//! The engine never talks to a device API directly. Each OS capability is a
//! trait here, and [`memory`] provides in-process implementations that the
//! tests, the bench, and the CLI previews run against.
//!
//! Raw permission answers differ per capability ([`PermissionResponse`]) and
//! are normalized into [`PermissionStatus`] by [`crate::permission`] before
//! any policy code sees them.

pub mod memory;

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geofence::GeofenceRegion;
use crate::model::{GeofenceEventType, NudgeType};
use crate::time::TimeOfDay;

pub use memory::{InMemoryGeofenceMonitor, InMemoryNotificationCenter, InMemoryPermissions};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by an OS primitive.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum PlatformError {
    #[error("{operation} rejected by the OS: {message}")]
    #[diagnostic(
        code(nudge::platform::rejected),
        help("Transient OS failures are retried by the next reconciliation pass.")
    )]
    Rejected { operation: String, message: String },

    #[error("{capability} is not available on this device")]
    #[diagnostic(
        code(nudge::platform::unavailable),
        help("The OS module backing this capability is missing; the engine degrades to a no-op.")
    )]
    Unavailable { capability: String },
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

// ---------------------------------------------------------------------------
// Local notifications
// ---------------------------------------------------------------------------

/// Opaque handle returned by the OS when a notification is scheduled.
pub type NotificationId = String;

/// When a scheduled notification should fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum NotificationTrigger {
    /// One-shot at an instant.
    At { at: DateTime<Utc> },
    /// Repeating every day at a wall-clock slot, beginning with `first`.
    Daily { time: TimeOfDay, first: DateTime<Utc> },
    /// Presented right away, never enters the scheduled set.
    Immediate,
}

/// What a notification is about; carried for routing when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum NotificationKind {
    Nudge { nudge_type: NudgeType },
    LocationOffer { event: GeofenceEventType },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub trigger: NotificationTrigger,
}

/// The host's local-notification primitive.
pub trait NotificationCenter: Send + Sync {
    /// Schedule (or, for [`NotificationTrigger::Immediate`], present) a notification.
    fn schedule(&self, request: &NotificationRequest) -> PlatformResult<NotificationId>;

    /// Cancel a pending notification. Cancelling an unknown id succeeds.
    fn cancel(&self, id: &str) -> PlatformResult<()>;

    /// Ids still pending. One-shots leave this set once they fire.
    fn scheduled_ids(&self) -> PlatformResult<HashSet<NotificationId>>;
}

// ---------------------------------------------------------------------------
// Geofencing
// ---------------------------------------------------------------------------

/// The host's region-monitoring primitive.
pub trait GeofenceMonitor: Send + Sync {
    /// Whether region monitoring exists on this device at all.
    fn is_available(&self) -> bool;

    fn is_monitoring(&self) -> PlatformResult<bool>;

    /// Replace the monitored set with `regions`.
    fn start(&self, regions: &[GeofenceRegion]) -> PlatformResult<()>;

    fn stop(&self) -> PlatformResult<()>;
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// A permission-gated OS capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Notifications,
    Location,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Notifications => "notifications",
            Self::Location => "location",
        })
    }
}

/// Normalized permission state; the only shape policy code consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    #[default]
    NotRequested,
    Authorized,
    Denied,
    Restricted,
    /// The OS module is missing; terminal.
    Unavailable,
}

impl PermissionStatus {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized)
    }
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotRequested => "notRequested",
            Self::Authorized => "authorized",
            Self::Denied => "denied",
            Self::Restricted => "restricted",
            Self::Unavailable => "unavailable",
        })
    }
}

/// Notification authorization as the OS reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAuthorization {
    NotDetermined,
    Denied,
    Authorized,
    /// Quiet delivery without an explicit prompt.
    Provisional,
    /// Granted for a limited app-clip session.
    Ephemeral,
}

/// Raw permission answers; each capability has its own shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResponse {
    Notifications {
        status: NotificationAuthorization,
    },
    Location {
        granted: bool,
        can_ask_again: bool,
        /// Parental controls or device management block the capability.
        restricted: bool,
        /// "Always" access; `None` when the OS doesn't say.
        background: Option<bool>,
    },
    /// The native module for the capability isn't linked.
    ModuleMissing,
}

/// The host's permission primitive.
pub trait PermissionProvider: Send + Sync {
    fn query(&self, capability: Capability) -> PlatformResult<PermissionResponse>;

    /// Show the OS prompt; `rationale` is the copy shown before it.
    fn request(&self, capability: Capability, rationale: &str)
    -> PlatformResult<PermissionResponse>;

    fn open_settings(&self) -> PlatformResult<()>;
}
