//! # Configuration Settings
//!
//! Defines the configuration structure for the Isoline control plane.

use crate::errors::{IsolineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    /// Ingress admission rules (root namespaces, ingress class)
    #[validate(nested)]
    pub ingress: IngressConfig,

    /// Envoy listen ports materialised by the DAG builder
    #[validate(nested)]
    pub listen: ListenPortConfig,

    /// Downstream TLS defaults for all HTTPS listeners
    pub tls: TlsDefaults,

    /// Allowed downstream HTTP versions
    pub default_http_versions: Vec<HttpVersion>,

    /// Envoy connection and stream timeouts
    pub timeouts: TimeoutConfig,

    /// Access log rendering on the data plane
    pub access_log: AccessLogConfig,

    /// Global rate limit service wiring
    pub rate_limit_service: Option<RateLimitServiceConfig>,

    /// Upstream cluster behaviour
    pub cluster: ClusterConfig,

    /// Leader election surface (consumed by the external elector)
    #[validate(nested)]
    pub leader_election: LeaderElectionConfig,

    /// xDS server endpoint and protocol selection
    #[validate(nested)]
    pub xds_server: XdsServerConfig,

    /// Rebuild debounce windows for the event handler
    #[validate(nested)]
    pub rebuild: RebuildConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(IsolineError::from)?;
        self.validate_custom()
    }

    /// Custom validation logic beyond what the validator derive covers
    fn validate_custom(&self) -> Result<()> {
        if self.listen.http_port == self.listen.https_port {
            return Err(IsolineError::validation(
                "HTTP and HTTPS listen ports cannot be the same",
            ));
        }

        if self.rebuild.holdoff_ms > self.rebuild.max_holdoff_ms {
            return Err(IsolineError::validation(
                "rebuild.holdoff_ms must not exceed rebuild.max_holdoff_ms",
            ));
        }

        if let Some(fallback) = &self.ingress.fallback_certificate {
            if fallback.name.is_empty() || fallback.namespace.is_empty() {
                return Err(IsolineError::validation(
                    "fallback_certificate requires both name and namespace",
                ));
            }
        }

        if self.default_http_versions.is_empty() {
            return Err(IsolineError::validation(
                "default_http_versions must allow at least one version",
            ));
        }

        // Timeout strings must parse up front so a typo is a bootstrap
        // failure, not a silently-ignored setting.
        self.timeouts.parse_all()?;

        if let Some(tls) = &self.xds_server.tls {
            if tls.require_client_cert && tls.client_ca_path.is_none() {
                return Err(IsolineError::validation(
                    "xds_server.tls.require_client_cert needs client_ca_path",
                ));
            }
        }

        Ok(())
    }
}

/// Admission rules for ingress resources
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IngressConfig {
    /// Namespaces allowed to own root HTTPProxies; empty means all
    pub root_namespaces: Vec<String>,

    /// Ingress class identifier this controller claims; empty claims
    /// unclassed objects only
    pub ingress_class: Option<String>,

    /// Reject `permitInsecure` on every HTTPProxy route
    pub disable_permit_insecure: bool,

    /// Cluster-wide certificate served when SNI is absent
    pub fallback_certificate: Option<FallbackCertificate>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            root_namespaces: Vec::new(),
            ingress_class: None,
            disable_permit_insecure: false,
            fallback_certificate: None,
        }
    }
}

/// Reference to the cluster-wide fallback TLS secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackCertificate {
    pub name: String,
    pub namespace: String,
}

/// Envoy listen ports for the materialised HTTP and HTTPS listeners
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ListenPortConfig {
    #[validate(length(min = 1, message = "HTTP listen address cannot be empty"))]
    pub http_address: String,

    #[validate(range(min = 1, message = "HTTP port must be between 1 and 65535"))]
    pub http_port: u16,

    #[validate(length(min = 1, message = "HTTPS listen address cannot be empty"))]
    pub https_address: String,

    #[validate(range(min = 1, message = "HTTPS port must be between 1 and 65535"))]
    pub https_port: u16,
}

impl Default for ListenPortConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0".to_string(),
            http_port: 8080,
            https_address: "0.0.0.0".to_string(),
            https_port: 8443,
        }
    }
}

/// Downstream TLS defaults applied to every HTTPS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsDefaults {
    /// Minimum protocol version: "1.2" or "1.3"
    pub minimum_protocol_version: String,

    /// Cipher suite list handed to Envoy verbatim. Envoy owns validation of
    /// suite names; Isoline only rejects empty entries.
    pub cipher_suites: Vec<String>,
}

impl Default for TlsDefaults {
    fn default() -> Self {
        Self { minimum_protocol_version: "1.2".to_string(), cipher_suites: Vec::new() }
    }
}

/// Downstream HTTP protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpVersion {
    #[serde(rename = "HTTP/1.1", alias = "http/1.1")]
    Http1,
    #[serde(rename = "HTTP/2", alias = "http/2")]
    Http2,
}

/// Envoy connection and stream timeouts.
///
/// Values are duration strings ("90s", "2m", "250ms"); "infinity" disables
/// the timeout. Unset fields keep Envoy's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request: Option<String>,
    pub connection_idle: Option<String>,
    pub stream_idle: Option<String>,
    pub max_connection_duration: Option<String>,
    pub delayed_close: Option<String>,
    pub connection_shutdown_grace_period: Option<String>,
}

/// A parsed timeout setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfiguredTimeout {
    /// Keep Envoy's default
    #[default]
    UseDefault,
    /// Disable the timeout entirely
    Disabled,
    /// Explicit duration
    Value(Duration),
}

impl ConfiguredTimeout {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        let Some(raw) = value else { return Ok(Self::UseDefault) };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::UseDefault);
        }
        if raw.eq_ignore_ascii_case("infinity") || raw.eq_ignore_ascii_case("infinite") {
            return Ok(Self::Disabled);
        }
        parse_duration(raw).map(Self::Value)
    }

    /// Duration to set on the Envoy field, if any. `Disabled` maps to zero,
    /// which Envoy interprets as "no timeout".
    pub fn as_envoy_duration(&self) -> Option<Duration> {
        match self {
            Self::UseDefault => None,
            Self::Disabled => Some(Duration::ZERO),
            Self::Value(d) => Some(*d),
        }
    }
}

/// Parsed view of [`TimeoutConfig`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedTimeouts {
    pub request: ConfiguredTimeout,
    pub connection_idle: ConfiguredTimeout,
    pub stream_idle: ConfiguredTimeout,
    pub max_connection_duration: ConfiguredTimeout,
    pub delayed_close: ConfiguredTimeout,
    pub connection_shutdown_grace_period: ConfiguredTimeout,
}

impl TimeoutConfig {
    pub fn parse_all(&self) -> Result<ParsedTimeouts> {
        Ok(ParsedTimeouts {
            request: ConfiguredTimeout::parse(self.request.as_deref())?,
            connection_idle: ConfiguredTimeout::parse(self.connection_idle.as_deref())?,
            stream_idle: ConfiguredTimeout::parse(self.stream_idle.as_deref())?,
            max_connection_duration: ConfiguredTimeout::parse(
                self.max_connection_duration.as_deref(),
            )?,
            delayed_close: ConfiguredTimeout::parse(self.delayed_close.as_deref())?,
            connection_shutdown_grace_period: ConfiguredTimeout::parse(
                self.connection_shutdown_grace_period.as_deref(),
            )?,
        })
    }
}

/// Parse a duration string of the form "250ms", "90s", "5m", "1h".
fn parse_duration(raw: &str) -> Result<Duration> {
    let split = raw.find(|c: char| !c.is_ascii_digit()).ok_or_else(|| {
        IsolineError::validation(format!("duration '{}' is missing a unit suffix", raw))
    })?;
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| IsolineError::validation(format!("invalid duration '{}'", raw)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => {
            Err(IsolineError::validation(format!("unknown duration unit '{}' in '{}'", other, raw)))
        }
    }
}

/// Access log rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    pub format: AccessLogFormat,

    /// Field selection for the JSON format
    pub fields: Vec<String>,

    /// Custom format string for the envoy format
    pub format_string: Option<String>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self { format: AccessLogFormat::Envoy, fields: Vec::new(), format_string: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLogFormat {
    Envoy,
    Json,
}

/// Global rate limit service wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitServiceConfig {
    /// ExtensionService reference, "namespace/name"
    pub extension_service: String,

    /// Rate limit domain presented to the service
    pub domain: String,

    /// Allow traffic through when the service is unreachable
    #[serde(default)]
    pub fail_open: bool,
}

/// Upstream cluster behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub dns_lookup_family: DnsLookupFamily,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { dns_lookup_family: DnsLookupFamily::Auto }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsLookupFamily {
    Auto,
    V4,
    V6,
}

/// Leader election surface; the elector itself runs outside the core.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LeaderElectionConfig {
    #[validate(range(min = 1, message = "lease duration must be positive"))]
    pub lease_duration_seconds: u64,

    #[validate(range(min = 1, message = "renew deadline must be positive"))]
    pub renew_deadline_seconds: u64,

    #[validate(range(min = 1, message = "retry period must be positive"))]
    pub retry_period_seconds: u64,

    pub name: String,
    pub namespace: String,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration_seconds: 15,
            renew_deadline_seconds: 10,
            retry_period_seconds: 2,
            name: "isoline".to_string(),
            namespace: "isoline-system".to_string(),
        }
    }
}

/// xDS server endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct XdsServerConfig {
    /// Preferred protocol variant advertised in bootstrap docs; the server
    /// always answers both.
    pub server_type: XdsServerType,

    #[validate(length(min = 1, message = "xDS bind address cannot be empty"))]
    pub address: String,

    #[validate(range(min = 1, message = "xDS port must be between 1 and 65535"))]
    pub port: u16,

    pub tls: Option<XdsTlsConfig>,
}

impl Default for XdsServerConfig {
    fn default() -> Self {
        Self {
            server_type: XdsServerType::Sotw,
            address: "0.0.0.0".to_string(),
            port: 8001,
            tls: None,
        }
    }
}

impl XdsServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XdsServerType {
    Sotw,
    Delta,
}

/// TLS material for the xDS gRPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XdsTlsConfig {
    pub cert_path: String,
    pub key_path: String,

    /// CA bundle for client certificate verification; enables mTLS
    pub client_ca_path: Option<String>,

    #[serde(default)]
    pub require_client_cert: bool,
}

/// Debounce windows for DAG rebuilds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RebuildConfig {
    /// Quiet period after the last event before a rebuild starts
    #[validate(range(min = 1, message = "holdoff must be positive"))]
    pub holdoff_ms: u64,

    /// Upper bound on rebuild delay since the first pending event
    #[validate(range(min = 1, message = "max holdoff must be positive"))]
    pub max_holdoff_ms: u64,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self { holdoff_ms: 100, max_holdoff_ms: 500 }
    }
}

impl RebuildConfig {
    pub fn holdoff(&self) -> Duration {
        Duration::from_millis(self.holdoff_ms)
    }

    pub fn max_holdoff(&self) -> Duration {
        Duration::from_millis(self.max_holdoff_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ingress: IngressConfig::default(),
            listen: ListenPortConfig::default(),
            tls: TlsDefaults::default(),
            default_http_versions: vec![HttpVersion::Http1, HttpVersion::Http2],
            timeouts: TimeoutConfig::default(),
            access_log: AccessLogConfig::default(),
            rate_limit_service: None,
            cluster: ClusterConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            xds_server: XdsServerConfig::default(),
            rebuild: RebuildConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("90").is_err());
        assert!(parse_duration("s90").is_err());
        assert!(parse_duration("90q").is_err());
    }

    #[test]
    fn timeout_infinity_disables() {
        let t = ConfiguredTimeout::parse(Some("infinity")).unwrap();
        assert_eq!(t, ConfiguredTimeout::Disabled);
        assert_eq!(t.as_envoy_duration(), Some(Duration::ZERO));

        let t = ConfiguredTimeout::parse(None).unwrap();
        assert_eq!(t, ConfiguredTimeout::UseDefault);
        assert_eq!(t.as_envoy_duration(), None);
    }

    #[test]
    fn conflicting_listen_ports_rejected() {
        let mut config = AppConfig::default();
        config.listen.https_port = config.listen.http_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mtls_requires_client_ca() {
        let mut config = AppConfig::default();
        config.xds_server.tls = Some(XdsTlsConfig {
            cert_path: "/certs/tls.crt".into(),
            key_path: "/certs/tls.key".into(),
            client_ca_path: None,
            require_client_cert: true,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn fallback_certificate_needs_both_fields() {
        let mut config = AppConfig::default();
        config.ingress.fallback_certificate =
            Some(FallbackCertificate { name: "".into(), namespace: "certs".into() });
        assert!(config.validate().is_err());
    }

    #[test]
    fn http_version_serde_names() {
        let parsed: Vec<HttpVersion> = serde_yaml::from_str("[\"HTTP/1.1\", \"HTTP/2\"]").unwrap();
        assert_eq!(parsed, vec![HttpVersion::Http1, HttpVersion::Http2]);
    }
}
