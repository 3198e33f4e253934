use super::*;

use std::{
    collections::HashMap,
    env, fs,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

#[test]
fn defaults_match_room_rules() {
    let settings = Settings::default();
    assert_eq!(settings.server_bind, "127.0.0.1:8080");
    assert_eq!(settings.database_url, "sqlite://./data/meetup.db");
    assert_eq!(settings.places_search_radius_m, 50);
    assert_eq!(settings.room_rules(), RoomRules::default());
}

#[test]
fn file_then_env_overrides_apply_in_order() {
    let mut settings = Settings::default();
    apply_file_overrides(
        &mut settings,
        r#"
bind_addr = "0.0.0.0:9000"
room_capacity = "4"
max_area_km2 = "2.5"
places_api_url = "http://places.local"
"#,
    );
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.room_capacity, 4);

    let env: HashMap<&str, &str> = [
        ("SERVER_BIND", "127.0.0.1:1"),
        ("APP__BIND_ADDR", "127.0.0.1:2"),
        ("APP__AREA_DEBOUNCE_MS", "250"),
        ("APP__MAX_SELECTIONS", "not-a-number"),
        ("PLACES_API_URL", ""),
    ]
    .into_iter()
    .collect();
    apply_env_overrides(&mut settings, |key| env.get(key).map(|v| v.to_string()));

    assert_eq!(settings.server_bind, "127.0.0.1:2");
    assert_eq!(settings.places_api_url, None);
    let rules = settings.room_rules();
    assert_eq!(rules.capacity, 4);
    assert_eq!(rules.max_selections, 2);
    assert_eq!(rules.max_area_km2, 2.5);
    assert_eq!(rules.area_debounce, Duration::from_millis(250));
}

#[test]
fn unreadable_settings_file_is_ignored() {
    let mut settings = Settings::default();
    apply_file_overrides(&mut settings, "this is = = not toml");
    assert_eq!(settings, Settings::default());
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("meetup_server_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    assert!(temp_root.join("nested").exists());
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}
