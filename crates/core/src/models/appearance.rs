//! Per-room display configuration

use serde::{Deserialize, Serialize};

/// Room color theme. Anything a client sends that is not recognized
/// coerces to `Dark`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Dark,
    Light,
}

impl Theme {
    pub fn from_client(value: &str) -> Self {
        match value {
            "light" => Theme::Light,
            _ => Theme::Dark,
        }
    }
}

/// A room's display configuration. Materialized with defaults on first
/// access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appearance {
    pub theme: Theme,
    pub background_color: Option<String>,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            background_color: None,
        }
    }
}
