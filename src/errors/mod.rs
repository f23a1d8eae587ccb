//! # Error Handling
//!
//! Error types for the Isoline control plane, defined with `thiserror`.
//!
//! Object-level problems (a malformed HTTPProxy, a missing Secret) are *not*
//! errors: they surface as status conditions on the offending object and the
//! rest of the configuration continues. The variants here cover process-level
//! failures: bad bootstrap configuration, orchestrator connectivity, and xDS
//! transport.

use std::fmt;

/// Custom result type for Isoline operations
pub type Result<T> = std::result::Result<T, IsolineError>;

/// Main error type for the Isoline control plane
#[derive(thiserror::Error, Debug)]
pub enum IsolineError {
    /// Configuration errors (fatal at bootstrap)
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Kubernetes API errors (list/watch/status writes)
    #[error("Kubernetes API error: {context}")]
    Kubernetes {
        #[source]
        source: kube::Error,
        context: String,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// xDS protocol errors
    #[error("xDS protocol error: {message}")]
    Xds { message: String, node_id: Option<String> },

    /// Network transport errors (gRPC server lifecycle)
    #[error("Transport error: {0}")]
    Transport(String),

    /// TLS material errors (unreadable or malformed PEM)
    #[error("TLS error: {context}")]
    Tls { context: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Alias used throughout the crate
pub type Error = IsolineError;

impl IsolineError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create an xDS protocol error
    pub fn xds<S: Into<String>>(message: S) -> Self {
        Self::Xds { message: message.into(), node_id: None }
    }

    /// Create an xDS protocol error with node ID
    pub fn xds_with_node<S: Into<String>, N: Into<String>>(message: S, node_id: N) -> Self {
        Self::Xds { message: message.into(), node_id: Some(node_id.into()) }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a TLS material error
    pub fn tls<S: Into<String>>(context: S) -> Self {
        Self::Tls { context: context.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Create a Kubernetes API error
    pub fn kubernetes<S: Into<String>>(source: kube::Error, context: S) -> Self {
        Self::Kubernetes { source, context: context.into() }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create a serialization error with context
    pub fn serialization<S: Into<String>>(source: serde_json::Error, context: S) -> Self {
        Self::Serialization { source, context: context.into() }
    }

    /// True for failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Kubernetes { .. } | Self::Transport(_))
    }
}

impl From<validator::ValidationErrors> for IsolineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut parts: Vec<String> = errors
            .field_errors()
            .iter()
            .map(|(field, errs)| {
                let messages: Vec<String> = errs
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect();
        parts.sort();
        Self::Validation { message: parts.join("; "), field: None }
    }
}

/// Condition reason rendered into object status; not a process error.
///
/// Kept here so the DAG builder and the status writer agree on the vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidReason {
    OrphanedChild,
    InclusionCycle,
    IncludeNotFound,
    RootIncludesRoot,
    PrefixOutsideParent,
    DuplicateVirtualHost,
    SecretNotFound,
    SecretInvalid,
    CertificateMismatch,
    DelegationNotPermitted,
    ServiceNotFound,
    ServiceUnresolved,
    RouteInvalid,
    RegexInvalid,
    ListenerUnmatched,
    RouteNotAllowed,
    ReferenceNotPermitted,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            InvalidReason::OrphanedChild => "Orphaned",
            InvalidReason::InclusionCycle => "IncludeCycle",
            InvalidReason::IncludeNotFound => "IncludeNotFound",
            InvalidReason::RootIncludesRoot => "RootIncludesRoot",
            InvalidReason::PrefixOutsideParent => "PrefixOutsideParent",
            InvalidReason::DuplicateVirtualHost => "DuplicateVirtualHost",
            InvalidReason::SecretNotFound => "SecretNotFound",
            InvalidReason::SecretInvalid => "SecretInvalid",
            InvalidReason::CertificateMismatch => "CertificateMismatch",
            InvalidReason::DelegationNotPermitted => "DelegationNotPermitted",
            InvalidReason::ServiceNotFound => "ServiceNotFound",
            InvalidReason::ServiceUnresolved => "ServiceUnresolved",
            InvalidReason::RouteInvalid => "RouteInvalid",
            InvalidReason::RegexInvalid => "RegexInvalid",
            InvalidReason::ListenerUnmatched => "ListenerUnmatched",
            InvalidReason::RouteNotAllowed => "RouteNotAllowed",
            InvalidReason::ReferenceNotPermitted => "ReferenceNotPermitted",
        };
        write!(f, "{}", reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_helpers_produce_expected_variants() {
        let err = IsolineError::config("missing xds address");
        assert!(matches!(err, IsolineError::Config { .. }));
        assert_eq!(err.to_string(), "Configuration error: missing xds address");

        let err = IsolineError::validation_field("port out of range", "xds_server.port");
        match err {
            IsolineError::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("xds_server.port"))
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(IsolineError::transport("stream reset").is_transient());
        assert!(!IsolineError::config("bad").is_transient());
        assert!(!IsolineError::tls("unreadable key").is_transient());
    }

    #[test]
    fn invalid_reasons_render_as_pascal_case() {
        assert_eq!(InvalidReason::PrefixOutsideParent.to_string(), "PrefixOutsideParent");
        assert_eq!(InvalidReason::InclusionCycle.to_string(), "IncludeCycle");
        assert_eq!(InvalidReason::OrphanedChild.to_string(), "Orphaned");
    }
}
