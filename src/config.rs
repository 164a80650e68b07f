//! Engine configuration, persisted as TOML.
//!
//! Lives at `$XDG_CONFIG_HOME/nudge-engine/config.toml`. Every field has a
//! serde default, so an empty or partial file is valid and a missing file
//! means "all defaults".

use std::path::{Path, PathBuf};

use chrono::{Duration, FixedOffset, Local, Offset, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration I/O.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(nudge::config::read),
        help("Ensure the config file is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(nudge::config::parse),
        help("Check the TOML syntax; see `nudge config` for the effective defaults.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(nudge::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config value: {message}")]
    #[diagnostic(
        code(nudge::config::invalid),
        help("Adjust the value in config.toml and retry.")
    )]
    Invalid { message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Rate limits applied to system nudges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Maximum system nudges per local calendar date.
    pub daily_cap: u32,
    /// Minimum gap between any two system nudges of different types.
    pub min_spacing_hours: i64,
    /// How many whole days a candidate may be pushed before giving up.
    pub max_push_days: u32,
    /// Consecutive unopened firings after which a type is reported as ignored.
    pub ignored_streak_threshold: u32,
    /// Days of `sentCountByDate` history kept.
    pub history_retention_days: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            daily_cap: 2,
            min_spacing_hours: 6,
            max_push_days: 14,
            ignored_streak_threshold: 7,
            history_retention_days: 14,
        }
    }
}

impl PolicyConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::hours(self.min_spacing_hours)
    }
}

/// Delivery reconciliation tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// A one-shot is only judged once its fire time is this far in the past.
    pub fire_grace_secs: i64,
    /// Fired or cancelled reminder entries are kept this long before pruning.
    pub prune_after_hours: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            fire_grace_secs: 60,
            prune_after_hours: 48,
        }
    }
}

impl ReconcileConfig {
    pub fn fire_grace(&self) -> Duration {
        Duration::seconds(self.fire_grace_secs)
    }

    pub fn prune_after(&self) -> Duration {
        Duration::hours(self.prune_after_hours)
    }
}

/// Geofence and location-offer tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Minimum gap between two offers for the same entity and direction.
    pub min_offer_spacing_minutes: i64,
    /// OS ceiling on concurrently monitored regions.
    pub max_regions: usize,
    pub min_radius_m: f64,
    pub max_radius_m: f64,
    /// Radius used when an activity's trigger has none.
    pub default_radius_m: f64,
    /// Trailing-edge debounce before a region sync runs.
    pub sync_debounce_ms: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            min_offer_spacing_minutes: 30,
            max_regions: 20,
            min_radius_m: 15.0,
            max_radius_m: 5000.0,
            default_radius_m: 150.0,
            sync_debounce_ms: 400,
        }
    }
}

impl LocationConfig {
    pub fn min_offer_spacing(&self) -> Duration {
        Duration::minutes(self.min_offer_spacing_minutes)
    }

    pub fn sync_debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sync_debounce_ms)
    }
}

// ---------------------------------------------------------------------------
// NudgeConfig
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NudgeConfig {
    /// Ledger directory. `None` runs memory-only (nothing survives the process).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Local zone as minutes east of UTC; the host's current offset when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utc_offset_minutes: Option<i32>,
    pub policy: PolicyConfig,
    pub reconcile: ReconcileConfig,
    pub location: LocationConfig,
}

impl NudgeConfig {
    /// Memory-only config pinned to a fixed zone; what tests and previews use.
    pub fn memory_only(utc_offset_minutes: i32) -> Self {
        Self {
            utc_offset_minutes: Some(utc_offset_minutes),
            ..Default::default()
        }
    }

    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write as TOML, creating the parent directory.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let raw = self.to_toml()?;
        std::fs::write(path, raw).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            message: format!("cannot serialize config: {e}"),
        })
    }

    /// Reject values the engine cannot honor.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.policy.daily_cap == 0 {
            return Err(ConfigError::Invalid {
                message: "policy.daily_cap must be at least 1".into(),
            });
        }
        if self.policy.min_spacing_hours < 0 || self.policy.min_spacing_hours >= 24 {
            return Err(ConfigError::Invalid {
                message: "policy.min_spacing_hours must be in 0..24".into(),
            });
        }
        let loc = &self.location;
        if !(loc.min_radius_m > 0.0 && loc.min_radius_m <= loc.max_radius_m) {
            return Err(ConfigError::Invalid {
                message: "location.min_radius_m must be positive and <= max_radius_m".into(),
            });
        }
        if let Some(minutes) = self.utc_offset_minutes {
            if FixedOffset::east_opt(minutes * 60).is_none() {
                return Err(ConfigError::Invalid {
                    message: format!("utc_offset_minutes out of range: {minutes}"),
                });
            }
        }
        Ok(())
    }

    /// The local zone every date key is computed in.
    pub fn zone(&self) -> FixedOffset {
        match self.utc_offset_minutes {
            Some(minutes) => FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix()),
            None => Local::now().offset().fix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_all_defaults() {
        let config: NudgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, NudgeConfig::default());
        assert_eq!(config.policy.daily_cap, 2);
        assert_eq!(config.policy.min_spacing(), Duration::hours(6));
        assert_eq!(config.location.max_regions, 20);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: NudgeConfig = toml::from_str(
            r#"
            utc_offset_minutes = 60
            [location]
            min_offer_spacing_minutes = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.location.min_offer_spacing(), Duration::minutes(45));
        assert_eq!(config.location.max_radius_m, 5000.0);
        assert_eq!(config.zone().local_minus_utc(), 3600);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = NudgeConfig::memory_only(-300);
        config.policy.daily_cap = 3;
        config.save(&path).unwrap();
        let loaded = NudgeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = NudgeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, NudgeConfig::default());
    }

    #[test]
    fn zero_cap_rejected() {
        let mut config = NudgeConfig::default();
        config.policy.daily_cap = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }
}
