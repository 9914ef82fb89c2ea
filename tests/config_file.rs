use sensorino::config::Config;
use sensorino::gateway::Gateway;

#[test]
fn gateway_opens_store_where_configured() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("state.db");
    let path = dir.path().join("sensorino.toml");
    std::fs::write(
        &path,
        format!(
            "[storage]\ndb_path = {:?}\nconsole_lines = 5\n\n[transactions]\ntimeout_secs = 3\n",
            db.to_str().unwrap()
        ),
    )
    .unwrap();

    let config = tokio_test::block_on(Config::load(path.to_str().unwrap())).unwrap();
    assert_eq!(config.storage.console_lines, 5);
    assert_eq!(config.transactions.timeout_secs, 3);
    assert_eq!(config.server.base_listen, "127.0.0.1:8001");

    let mut gateway = Gateway::open(config).unwrap();
    gateway.load().unwrap();
    assert!(db.exists());
    assert!(gateway.state_tree().is_empty());
    gateway.update_floorplan("{\"rooms\": []}").unwrap();
    gateway.close().unwrap();

    let config = tokio_test::block_on(Config::load(path.to_str().unwrap())).unwrap();
    let mut gateway = Gateway::open(config).unwrap();
    gateway.load().unwrap();
    assert_eq!(gateway.floorplan(), Some("{\"rooms\": []}"));
}

#[test]
fn malformed_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[storage\n").unwrap();
    let err = tokio_test::block_on(Config::load(path.to_str().unwrap())).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}
