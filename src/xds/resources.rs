//! Resource payloads and update notifications shared across the xDS layer.

use envoy_types::pb::google::protobuf::Any;

/// Canonical v3 type URLs for the served resource types.
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Serving order. CDS precedes EDS and LDS precedes RDS so a client never
/// sees a reference before its target within one snapshot push.
pub const TYPE_URLS: [&str; 5] = [
    CLUSTER_TYPE_URL,
    ENDPOINT_TYPE_URL,
    LISTENER_TYPE_URL,
    ROUTE_TYPE_URL,
    SECRET_TYPE_URL,
];

/// A named, encoded Envoy resource ready to serve.
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltResource {
    pub name: String,
    pub resource: Any,
}

/// Cached resource with the version it last changed at.
#[derive(Clone, Debug)]
pub struct CachedResource {
    pub name: String,
    pub type_url: String,
    pub version: u64,
    pub body: Any,
}

/// Changes to a single type within one staged snapshot application.
#[derive(Clone, Debug, Default)]
pub struct ResourceDelta {
    pub type_url: String,
    pub added_or_updated: Vec<CachedResource>,
    pub removed: Vec<String>,
}

/// Broadcast payload describing everything that changed in one application.
#[derive(Clone, Debug, Default)]
pub struct ResourceUpdate {
    /// Monotonic counter after this application.
    pub version: u64,
    /// Aggregate snapshot version (content hash over per-type versions).
    pub snapshot_version: String,
    pub deltas: Vec<ResourceDelta>,
}

impl ResourceUpdate {
    pub fn delta_for(&self, type_url: &str) -> Option<&ResourceDelta> {
        self.deltas.iter().find(|d| d.type_url == type_url)
    }
}
