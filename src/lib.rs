//! # Isoline
//!
//! Isoline is a Kubernetes ingress control plane: it watches routing
//! resources (Ingress, HTTPProxy, the Gateway API kinds) and serves xDS
//! discovery configuration to a fleet of Envoy data-plane proxies.
//!
//! ## Architecture
//!
//! Data flows one way, with a status back-channel:
//!
//! ```text
//! watchers -> cache -> event handler -> DAG builder -> snapshotter -> xDS server -> proxies
//!                                   \-> status writer -> Kubernetes
//! ```
//!
//! ## Core Components
//!
//! - **Kubernetes cache**: in-memory index of routing objects with
//!   membership rules enforced at insertion
//! - **DAG builder**: a pure function from a cache snapshot to an immutable
//!   routing graph plus per-object status conditions
//! - **xDS cache / snapshotter**: versioned per-type resource stores with
//!   atomic staged publication
//! - **xDS server**: tonic-based gRPC server implementing the SotW, Delta
//!   and aggregated discovery protocols
//! - **Event handler**: serialises mutations, debounces rebuilds, and
//!   routes endpoint-only updates down the EDS fast path

pub mod config;
pub mod dag;
pub mod errors;
pub mod event;
pub mod k8s;
pub mod observability;
pub mod status;
pub mod xds;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{Error, IsolineError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_looks_like_semver() {
        let components: Vec<_> = VERSION.split('.').collect();
        assert!(components.len() >= 3, "version should follow semver: {VERSION}");
        assert!(components.iter().all(|part| !part.is_empty()));
        assert_eq!(APP_NAME, "isoline");
    }
}
