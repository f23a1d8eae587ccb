//! # Configuration Management
//!
//! Configuration for the Isoline control plane. Supports a YAML configuration
//! file, environment variables with the `ISOLINE_` prefix, and command-line
//! arguments (handled by `clap` in `main`).

pub mod settings;

pub use settings::{
    AccessLogConfig, AccessLogFormat, AppConfig, ClusterConfig, DnsLookupFamily,
    FallbackCertificate, HttpVersion, IngressConfig, LeaderElectionConfig, ListenPortConfig,
    RateLimitServiceConfig, RebuildConfig, TimeoutConfig, TlsDefaults, XdsServerConfig,
    XdsServerType, XdsTlsConfig,
};

use crate::errors::{IsolineError, Result};
use config::{Config, Environment, File};
use std::path::Path;

/// Load application configuration from multiple sources
///
/// Configuration is loaded in the following order (later sources override
/// earlier ones):
/// 1. Default values
/// 2. Configuration file (if specified)
/// 3. Environment variables with ISOLINE_ prefix
pub fn load_config<P: AsRef<Path>>(config_path: Option<P>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    builder = builder.add_source(Config::try_from(&AppConfig::default()).map_err(|e| {
        IsolineError::config_with_source("Failed to seed default configuration", Box::new(e))
    })?);

    if let Some(path) = config_path {
        let path = path.as_ref();
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(IsolineError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
    }

    builder = builder
        .add_source(Environment::with_prefix("ISOLINE").separator("__").try_parsing(true));

    let config = builder.build().map_err(|e| {
        IsolineError::config_with_source("Failed to build configuration", Box::new(e))
    })?;

    let app_config: AppConfig = config.try_deserialize().map_err(|e| {
        IsolineError::config_with_source("Failed to deserialize configuration", Box::new(e))
    })?;

    app_config.validate()?;

    Ok(app_config)
}

/// Load configuration from environment variables only
pub fn load_config_from_env() -> Result<AppConfig> {
    load_config::<&str>(None)
}

/// Load configuration from a YAML file
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    load_config(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn load_default_config() {
        let config = load_config_from_env().unwrap();
        assert_eq!(config.listen.http_port, 8080);
        assert_eq!(config.listen.https_port, 8443);
        assert_eq!(config.xds_server.port, 8001);
        assert!(config.ingress.root_namespaces.is_empty());
    }

    #[test]
    fn load_config_from_yaml_file() {
        let yaml_content = r#"
ingress:
  root_namespaces: ["roots", "marketing"]
  ingress_class: "isoline"
xds_server:
  address: "0.0.0.0"
  port: 9001
rebuild:
  holdoff_ms: 50
  max_holdoff_ms: 250
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = load_config_from_file(temp_file.path()).unwrap();
        assert_eq!(config.ingress.root_namespaces, vec!["roots", "marketing"]);
        assert_eq!(config.ingress.ingress_class.as_deref(), Some("isoline"));
        assert_eq!(config.xds_server.port, 9001);
        assert_eq!(config.rebuild.holdoff_ms, 50);
        // Untouched sections keep their defaults.
        assert_eq!(config.listen.http_port, 8080);
    }

    #[test]
    fn nonexistent_file_is_a_config_error() {
        let result = load_config_from_file("/nonexistent/isoline.yaml");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Configuration file not found"));
    }

    #[test]
    fn invalid_holdoff_ordering_rejected() {
        let yaml_content = r#"
rebuild:
  holdoff_ms: 600
  max_holdoff_ms: 500
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let result = load_config_from_file(temp_file.path());
        assert!(result.is_err());
    }
}
