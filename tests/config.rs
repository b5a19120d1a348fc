use tempfile::TempDir;

fn test_runtime(database_dsn: String) -> relaygate::app::RuntimeConfig {
    relaygate::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn,
    }
}

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("relaygate.db");
    assert!(!db_path.exists());

    let runtime = test_runtime(format!("sqlite://{}", db_path.display()));
    let _state = relaygate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let runtime = test_runtime("sqlite::memory:".to_string());
    let _state = relaygate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
}

#[tokio::test]
async fn first_start_seeds_relay_settings() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("relaygate.db");
    let runtime = test_runtime(format!("sqlite://{}", db_path.display()));
    let state = relaygate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    let settings = state.settings_store.get_all().await.expect("settings");
    assert_eq!(settings.streaming_timeout_seconds, 120);
    assert!(!settings.ping_interval_enabled);
    assert_eq!(settings.pre_consumed_quota, 500);
    assert_eq!(settings.group_ratio.get("default"), Some(&1.0));

    let channels = state
        .channel_store
        .list_enabled_channels()
        .await
        .expect("channels");
    assert!(channels.is_empty());
}
