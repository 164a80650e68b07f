// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # nudge-engine
//!
//! Local notification and geofence scheduling for a personal planning app:
//! rate-limited daily nudges, per-activity reminders, and "you arrived/left"
//! location offers, with every scheduling decision backed by durable ledgers
//! so it survives process death and cold background wake-ups.
//!
//! ## Architecture
//!
//! - **Ledger store** (`store`, `ledger`): redb documents with a DashMap hot tier
//! - **Policy** (`policy`): daily cap and cross-type spacing, a pure function
//! - **Scheduler** (`scheduler`): cancel stale, schedule new, then write the ledger
//! - **Delivery reconciler** (`reconcile`): infers firings from the pending set
//! - **Geofencing** (`geofence`): signature-diffed region sync and enter/exit offers
//! - **Permissions** (`permission`): normalized, persisted, re-synced before gating
//! - **Platform** (`platform`): traits for the host OS plus in-memory doubles
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nudge_engine::config::NudgeConfig;
//! use nudge_engine::engine::{NudgeEngine, Platform};
//! use nudge_engine::model::DomainSnapshot;
//! use nudge_engine::platform::{InMemoryGeofenceMonitor, InMemoryNotificationCenter, InMemoryPermissions};
//! use nudge_engine::time::SystemClock;
//!
//! let platform = Platform::new(
//!     Arc::new(InMemoryNotificationCenter::new()),
//!     Arc::new(InMemoryGeofenceMonitor::new()),
//!     Arc::new(InMemoryPermissions::granted()),
//! );
//! let engine = NudgeEngine::open(NudgeConfig::default(), platform, Arc::new(SystemClock)).unwrap();
//! engine.on_preferences_changed(DomainSnapshot::default());
//! let report = engine.on_background_wake();
//! println!("{} firings inferred", report.fired);
//! ```

pub mod analytics;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod geofence;
pub mod ledger;
pub mod model;
pub mod paths;
pub mod permission;
pub mod platform;
pub mod policy;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod time;
