//! # Kubernetes Integration
//!
//! The orchestrator-facing half of the control plane: typed resource models
//! (built-ins from `k8s-openapi`, CRDs via `kube::CustomResource`), the
//! in-memory cache with its membership rules, and the watcher tasks that feed
//! the event channel.

pub mod apis;
pub mod cache;
pub mod object;
pub mod watch;

pub use apis::{
    ExtensionService, Gateway, GRPCRoute, HTTPProxy, HTTPRoute, ReferenceGrant,
    TLSCertificateDelegation, TLSRoute,
};
pub use cache::{CacheSnapshot, KubernetesCache};
pub use object::{KubeObject, ObjectKind, ObjectRef};
pub use watch::{spawn_watchers, ObjectEvent};
