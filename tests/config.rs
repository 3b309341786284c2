#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_default() {
        let config = skyfeed::config::IngestConfig::default();

        // Listener defaults
        assert_eq!(config.listener.listen_address, "0.0.0.0");
        assert_eq!(config.listener.listen_port, 30004);
        assert_eq!(config.listener.max_connections, 1000);

        // Downstream defaults
        assert_eq!(config.downstream.host, "readsb");
        assert_eq!(config.downstream.port, 30006);
        assert_eq!(config.downstream.connect_timeout_secs, 5);
        assert_eq!(config.downstream.retry_attempts, 4);

        // Mesh defaults: netbird first (primary), both disabled out of the box
        assert_eq!(config.meshes.len(), 2);
        assert_eq!(config.meshes[0].name, "netbird");
        assert_eq!(config.meshes[1].name, "tailscale");
        assert!(!config.meshes[0].enabled);
        assert!(!config.meshes[1].enabled);
        assert_eq!(config.meshes[0].cidr, "100.64.0.0/10");

        // GeoIP defaults
        assert!(!config.geoip.enabled);

        // Database defaults
        assert_eq!(config.database.path, "aggregator.db");
        assert_eq!(config.database.busy_timeout_ms, 5000);

        // Session defaults
        assert_eq!(config.session.classify_timeout_secs, 3);
        assert_eq!(config.session.flush_interval_secs, 30);

        // Sweeper defaults
        assert_eq!(config.sweeper.sweep_interval_secs, 30);
        assert_eq!(config.sweeper.stale_threshold_secs, 120);
        assert_eq!(config.sweeper.activity_retention_days, 7);

        // Logging defaults
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file_enabled);
        assert!(config.logging.console_enabled);
    }

    #[tokio::test]
    async fn test_config_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let mut config = skyfeed::config::IngestConfig::default();

        // Modify some values
        config.listener.listen_port = 31004;
        config.downstream.host = "localhost".to_string();
        config.meshes[0].enabled = true;
        config.meshes[0].api_token = "nb-token".to_string();
        config.geoip.enabled = true;

        // Save config
        let config_manager = skyfeed::config::ConfigManager::new(config_path.clone());
        config_manager.save(&config).await.unwrap();

        // Load config
        let loaded_manager = skyfeed::config::ConfigManager::new(config_path.clone());
        let loaded = loaded_manager.load_or_default().await.unwrap();

        // Verify values
        assert_eq!(loaded.listener.listen_port, 31004);
        assert_eq!(loaded.downstream.host, "localhost");
        assert!(loaded.meshes[0].enabled);
        assert_eq!(loaded.meshes[0].api_token, "nb-token");
        assert!(loaded.geoip.enabled);
    }

    #[tokio::test]
    async fn test_config_load_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config_manager = skyfeed::config::ConfigManager::new(config_path);
        let config = config_manager.load_or_default().await.unwrap();

        // Should return defaults
        assert_eq!(config.listener.listen_port, 30004);
        assert_eq!(config.meshes.len(), 2);
    }

    #[tokio::test]
    async fn test_config_without_meshes_section() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("no_meshes.toml");

        // A config file written before any mesh was configured.
        let mut config = skyfeed::config::IngestConfig::default();
        config.meshes.clear();
        let manager = skyfeed::config::ConfigManager::new(config_path.clone());
        manager.save(&config).await.unwrap();

        let loaded = skyfeed::config::ConfigManager::new(config_path)
            .load_or_default()
            .await
            .unwrap();
        assert!(loaded.meshes.is_empty());
    }

    #[tokio::test]
    async fn test_config_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("broken.toml");
        tokio::fs::write(&config_path, "this is { not toml")
            .await
            .unwrap();

        let manager = skyfeed::config::ConfigManager::new(config_path);
        assert!(manager.load_or_default().await.is_err());
    }

    #[test]
    fn test_mesh_config_order_is_priority() {
        let config = skyfeed::config::IngestConfig::default();
        // The first listed mesh wins classification ties.
        assert_eq!(config.meshes[0].name, "netbird");
    }
}
