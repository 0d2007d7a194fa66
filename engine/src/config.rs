//! Store configuration.

use serde::{Deserialize, Serialize};
use std::env;

/// Options applied when a persistent store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreOptions {
    /// Register the store with its provider so later lookups share it
    pub singleton: bool,
    /// Re-persist entities when one of their fields changes
    pub track_field_changes: bool,
    /// Load from the backend when the provider creates the store
    pub auto_load: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            singleton: true,
            track_field_changes: true,
            auto_load: true,
        }
    }
}

impl StoreOptions {
    pub fn with_singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn with_track_field_changes(mut self, track: bool) -> Self {
        self.track_field_changes = track;
        self
    }

    pub fn with_auto_load(mut self, auto_load: bool) -> Self {
        self.auto_load = auto_load;
        self
    }

    /// Load options from environment variables, falling back to defaults.
    ///
    /// Reads `STOW_SINGLETON`, `STOW_TRACK_FIELD_CHANGES` and `STOW_AUTO_LOAD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load options through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            singleton: flag(&lookup, "STOW_SINGLETON", defaults.singleton)?,
            track_field_changes: flag(
                &lookup,
                "STOW_TRACK_FIELD_CHANGES",
                defaults.track_field_changes,
            )?,
            auto_load: flag(&lookup, "STOW_AUTO_LOAD", defaults.auto_load)?,
        })
    }

    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag { name, value: raw }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {name} value: {value:?}")]
    InvalidFlag { name: &'static str, value: String },

    #[error("Invalid options JSON: {0}")]
    Json(#[from] serde_json::Error),
}
