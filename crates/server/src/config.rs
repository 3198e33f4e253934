use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use coordinator::RoomRules;
use places::DEFAULT_SEARCH_RADIUS_M;
use serde::Deserialize;
use tracing::warn;

const SETTINGS_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub room_capacity: usize,
    pub max_selections: usize,
    pub max_area_km2: f64,
    pub area_debounce_ms: u64,
    pub places_api_url: Option<String>,
    pub places_search_radius_m: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let rules = RoomRules::default();
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/meetup.db".into(),
            room_capacity: rules.capacity,
            max_selections: rules.max_selections,
            max_area_km2: rules.max_area_km2,
            area_debounce_ms: rules.area_debounce.as_millis() as u64,
            places_api_url: None,
            places_search_radius_m: DEFAULT_SEARCH_RADIUS_M,
        }
    }
}

impl Settings {
    pub fn room_rules(&self) -> RoomRules {
        RoomRules {
            capacity: self.room_capacity,
            max_selections: self.max_selections,
            max_area_km2: self.max_area_km2,
            area_debounce: Duration::from_millis(self.area_debounce_ms),
        }
    }
}

/// Defaults, then `server.toml`, then environment variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<HashMap<String, String>>(raw) {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!(%err, file = SETTINGS_FILE, "ignoring unreadable settings file");
            return;
        }
    };
    for (key, value) in &file_cfg {
        apply(settings, key, value);
    }
}

/// Later names in each group win, so `APP__*` overrides the short form.
pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    const ENV_KEYS: &[(&str, &str)] = &[
        ("SERVER_BIND", "bind_addr"),
        ("APP__BIND_ADDR", "bind_addr"),
        ("DATABASE_URL", "database_url"),
        ("APP__DATABASE_URL", "database_url"),
        ("APP__ROOM_CAPACITY", "room_capacity"),
        ("APP__MAX_SELECTIONS", "max_selections"),
        ("APP__MAX_AREA_KM2", "max_area_km2"),
        ("APP__AREA_DEBOUNCE_MS", "area_debounce_ms"),
        ("PLACES_API_URL", "places_api_url"),
        ("APP__PLACES_API_URL", "places_api_url"),
        ("APP__PLACES_SEARCH_RADIUS_M", "places_search_radius_m"),
    ];
    for (env_key, key) in ENV_KEYS {
        if let Some(value) = lookup(env_key) {
            apply(settings, key, &value);
        }
    }
}

fn apply(settings: &mut Settings, key: &str, value: &str) {
    match key {
        "bind_addr" => settings.server_bind = value.to_string(),
        "database_url" => settings.database_url = value.to_string(),
        "room_capacity" => parse_into(key, value, &mut settings.room_capacity),
        "max_selections" => parse_into(key, value, &mut settings.max_selections),
        "max_area_km2" => parse_into(key, value, &mut settings.max_area_km2),
        "area_debounce_ms" => parse_into(key, value, &mut settings.area_debounce_ms),
        "places_api_url" => {
            let value = value.trim();
            settings.places_api_url = (!value.is_empty()).then(|| value.to_string());
        }
        "places_search_radius_m" => parse_into(key, value, &mut settings.places_search_radius_m),
        other => warn!(key = other, "unknown setting"),
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, target: &mut T) {
    match value.trim().parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value, "ignoring setting that does not parse"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url);
    format!("sqlite://{}", path.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    if database_url.starts_with("sqlite::memory:") {
        return Ok(());
    }
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or_default();
    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
