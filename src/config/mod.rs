pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists), falling back to
    /// built-in defaults — the gateway must be able to start with zero
    /// configuration, per spec §4.A1.
    pub fn load(path: &Path) -> Result<Self> {
        let config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid gateway configuration: {e}"))?;
        tracing::info!(routes = config.routes.len(), "loaded gateway configuration");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_missing_file_returns_defaults() {
        let cfg = GatewayConfig::load(Path::new("/nonexistent/path/gateway.toml")).unwrap();
        assert!(cfg.routes.is_empty());
        assert_eq!(cfg.listener.port, 8080);
    }

    #[test]
    fn load_json_config_parses_routes() {
        let json = r#"{
            "routes": [{
                "id": "users",
                "pattern": "/v1/users/:id",
                "upstream": {"servers": [{"host": "10.0.0.1", "port": 8080}]}
            }]
        }"#;
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let cfg = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.routes[0].id, "users");
    }

    #[test]
    fn load_rejects_unsupported_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(b"routes: []").unwrap();
        assert!(GatewayConfig::load(file.path()).is_err());
    }
}
