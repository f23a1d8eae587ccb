//! # Routing DAG
//!
//! The internal, per-build routing graph. A build consumes one cache
//! snapshot and produces an immutable [`Dag`] plus a set of status
//! conditions; nothing in here performs I/O.
//!
//! Node kinds: [`Listener`] owns [`VirtualHost`]s, a virtual host owns an
//! ordered list of [`Route`]s, and routes reference [`Cluster`]s by name.
//! Endpoints are kept separable from clusters so an endpoint-only change can
//! update EDS without a rebuild.

pub mod builder;
pub mod endpoints;
pub mod policy;
pub mod processors;
pub mod status;
pub mod tls;

pub use builder::{build, BuildConfig, BuildResult};
pub use status::{ConditionStatus, StatusCondition};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::DnsLookupFamily;
use crate::k8s::ObjectRef;

use policy::{
    CircuitBreakers, HashPolicy, HeadersPolicy, HealthCheckPolicy, LoadBalancerStrategy,
    RetryPolicy, TimeoutPolicy,
};

/// Transport protocol a listener terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProtocol {
    Http,
    Https,
    TlsPassthrough,
    Tcp,
}

/// A bound (address, port, protocol) owning a set of virtual hosts.
#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub virtual_hosts: Vec<VirtualHost>,
}

/// An FQDN (wildcard permitted at the first label only) with its routes.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualHost {
    pub fqdn: String,
    pub routes: Vec<Route>,
    pub tls: Option<TlsEnvelope>,
    /// Serve this host under the cluster-wide fallback certificate too.
    pub fallback_certificate: bool,
}

/// Downstream TLS termination parameters for one virtual host.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsEnvelope {
    /// DAG secret name, "namespace/name".
    pub secret: String,
    pub min_protocol_version: TlsVersion,
    pub cipher_suites: Vec<String>,
    /// CA bundle secret for client certificate verification.
    pub client_validation: Option<String>,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    V1_2,
    V1_3,
}

impl TlsVersion {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1.2" => Some(Self::V1_2),
            "1.3" => Some(Self::V1_3),
            _ => None,
        }
    }
}

/// TLS material carried into the SDS store.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsSecret {
    /// "namespace/name" of the source Secret.
    pub name: String,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    /// CA bundle instead of a keypair.
    pub ca: Option<Vec<u8>>,
}

/// One route: a match predicate plus an action.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Stable identifier for deterministic ordering ties; derived from the
    /// owning object.
    pub name: String,
    pub match_: RouteMatch,
    pub action: RouteAction,
    pub timeouts: TimeoutPolicy,
    pub retry: Option<RetryPolicy>,
    pub request_headers: HeadersPolicy,
    pub response_headers: HeadersPolicy,
    pub websocket: bool,
    /// Serve over plain HTTP even when the owning host terminates TLS.
    pub permit_insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteMatch {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub query_parameters: Vec<QueryParameterMatch>,
    pub method: Option<String>,
}

/// Path predicate. `Prefix` is a segment prefix: `/foo/bar` matches
/// `/foo/bar`, `/foo/bar/` and `/foo/bar/x` but not `/foo/barbaz`.
#[derive(Debug, Clone, PartialEq)]
pub enum PathMatch {
    Prefix(String),
    Exact(String),
    Regex(String),
}

impl Default for PathMatch {
    fn default() -> Self {
        PathMatch::Prefix("/".to_string())
    }
}

impl PathMatch {
    pub fn value(&self) -> &str {
        match self {
            PathMatch::Prefix(p) | PathMatch::Exact(p) | PathMatch::Regex(p) => p,
        }
    }

    /// Rank used by route ordering; exact beats regex beats prefix.
    fn specificity_rank(&self) -> u8 {
        match self {
            PathMatch::Exact(_) => 0,
            PathMatch::Regex(_) => 1,
            PathMatch::Prefix(_) => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMatch {
    pub name: String,
    pub kind: HeaderMatchKind,
    pub invert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderMatchKind {
    Exact(String),
    Contains(String),
    Regex(String),
    Present,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameterMatch {
    pub name: String,
    pub value: Option<String>,
}

/// What a matched request does. The converter dispatches on the tag.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    /// Forward to a weighted cluster set, optionally mirroring.
    Forward {
        clusters: Vec<WeightedCluster>,
        mirror: Option<String>,
        hash_policies: Vec<HashPolicy>,
    },
    Redirect {
        hostname: Option<String>,
        path: Option<String>,
        scheme: Option<String>,
        port: Option<u16>,
        status_code: u16,
    },
    DirectResponse {
        status: u16,
        body: String,
    },
    /// Raw TCP proxying, used by TLS passthrough and TCP listeners.
    TcpProxy {
        clusters: Vec<WeightedCluster>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

/// Upstream protocol selection; part of the cluster name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamProtocol {
    #[default]
    Http1,
    H2,
    H2c,
    Tls,
}

impl UpstreamProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "h2" => Some(Self::H2),
            "h2c" => Some(Self::H2c),
            "tls" => Some(Self::Tls),
            _ => None,
        }
    }

    fn name_suffix(&self) -> Option<&'static str> {
        match self {
            UpstreamProtocol::Http1 => None,
            UpstreamProtocol::H2 => Some("h2"),
            UpstreamProtocol::H2c => Some("h2c"),
            UpstreamProtocol::Tls => Some("tls"),
        }
    }
}

/// A named upstream derived from a (Service, port) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub service: ObjectRef,
    pub port: u16,
    pub protocol: UpstreamProtocol,
    pub lb_strategy: LoadBalancerStrategy,
    pub health_check: Option<HealthCheckPolicy>,
    /// Originate TLS to the upstream, verifying against an optional CA.
    pub upstream_tls: Option<UpstreamTls>,
    pub circuit_breakers: CircuitBreakers,
    pub dns_lookup_family: DnsLookupFamily,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpstreamTls {
    pub sni: Option<String>,
}

/// Cluster name is a pure function of its identity; identical inputs always
/// yield byte-identical names.
pub fn cluster_name(service: &ObjectRef, port: u16, protocol: UpstreamProtocol) -> String {
    match protocol.name_suffix() {
        Some(suffix) => format!("{}/{}/{}/{}", service.namespace, service.name, port, suffix),
        None => format!("{}/{}/{}", service.namespace, service.name, port),
    }
}

/// Resolved endpoint addresses for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointSet {
    pub addresses: Vec<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

/// The finished, immutable routing graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dag {
    pub listeners: Vec<Listener>,
    pub clusters: BTreeMap<String, Cluster>,
    pub endpoints: BTreeMap<String, EndpointSet>,
    pub secrets: BTreeMap<String, TlsSecret>,
}

impl Dag {
    /// Services referenced by any cluster; the endpoint-only fast path keys
    /// off this set.
    pub fn referenced_services(&self) -> BTreeSet<ObjectRef> {
        self.clusters.values().map(|c| c.service.clone()).collect()
    }

    /// Cluster names referenced by any route of any listener.
    pub fn referenced_clusters(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        for listener in &self.listeners {
            for vhost in &listener.virtual_hosts {
                for route in &vhost.routes {
                    match &route.action {
                        RouteAction::Forward { clusters, mirror, .. } => {
                            names.extend(clusters.iter().map(|c| c.name.as_str()));
                            if let Some(mirror) = mirror {
                                names.insert(mirror.as_str());
                            }
                        }
                        RouteAction::TcpProxy { clusters } => {
                            names.extend(clusters.iter().map(|c| c.name.as_str()));
                        }
                        RouteAction::Redirect { .. } | RouteAction::DirectResponse { .. } => {}
                    }
                }
            }
        }
        names
    }
}

/// True iff `path` is covered by the segment prefix `prefix`.
pub fn segment_prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Deterministic route order within a virtual host: more specific paths
/// first, ties broken by header count (descending) then name (ascending).
pub fn route_order(a: &Route, b: &Route) -> Ordering {
    let rank = a.match_.path.specificity_rank().cmp(&b.match_.path.specificity_rank());
    if rank != Ordering::Equal {
        return rank;
    }
    // Longer paths are more specific.
    let len = b.match_.path.value().len().cmp(&a.match_.path.value().len());
    if len != Ordering::Equal {
        return len;
    }
    let path = a.match_.path.value().cmp(b.match_.path.value());
    if path != Ordering::Equal {
        return path;
    }
    let headers = b.match_.headers.len().cmp(&a.match_.headers.len());
    if headers != Ordering::Equal {
        return headers;
    }
    a.name.cmp(&b.name)
}

/// Wildcard FQDN matching: `*.example.com` covers exactly one extra label.
pub fn fqdn_matches(pattern: &str, hostname: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match hostname.strip_suffix(suffix) {
            Some(head) => {
                let head = match head.strip_suffix('.') {
                    Some(h) => h,
                    None => return false,
                };
                !head.is_empty() && !head.contains('.')
            }
            None => false,
        }
    } else {
        pattern == hostname
    }
}
