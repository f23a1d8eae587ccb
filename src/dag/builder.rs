//! The DAG builder: a pure function from a cache snapshot to a routing
//! graph plus status conditions.
//!
//! Building runs a fixed pipeline of processors over a shared
//! [`DagBuilderState`]. The builder is total: malformed input marks the
//! offending subgraph invalid and the rest of the configuration proceeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{AppConfig, DnsLookupFamily, TlsDefaults};
use crate::errors::InvalidReason;
use crate::k8s::{CacheSnapshot, ObjectKind, ObjectRef};

use super::processors::{
    ExtensionServiceProcessor, GatewayApiProcessor, HttpProxyProcessor, IngressProcessor,
    ListenerProcessor,
};
use super::status::StatusCondition;
use super::{
    endpoints, route_order, Dag, Listener, ListenerProtocol, Route, TlsSecret, TlsVersion,
    VirtualHost,
};

/// The subset of the application configuration the builder consumes.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub http_address: String,
    pub http_port: u16,
    pub https_address: String,
    pub https_port: u16,
    pub tls_min_version: TlsVersion,
    pub cipher_suites: Vec<String>,
    pub fallback_certificate: Option<ObjectRef>,
    pub disable_permit_insecure: bool,
    pub dns_lookup_family: DnsLookupFamily,
}

impl BuildConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        let TlsDefaults { minimum_protocol_version, cipher_suites } = config.tls.clone();
        Self {
            http_address: config.listen.http_address.clone(),
            http_port: config.listen.http_port,
            https_address: config.listen.https_address.clone(),
            https_port: config.listen.https_port,
            tls_min_version: TlsVersion::parse(&minimum_protocol_version)
                .unwrap_or_default(),
            cipher_suites,
            fallback_certificate: config
                .ingress
                .fallback_certificate
                .as_ref()
                .map(|f| ObjectRef::new(f.namespace.clone(), f.name.clone())),
            disable_permit_insecure: config.ingress.disable_permit_insecure,
            dns_lookup_family: config.cluster.dns_lookup_family,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// Which of the two materialised listeners a virtual host binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerSlot {
    Http,
    Https,
}

/// Outcome of claiming an FQDN on a listener.
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the FQDN (possibly having evicted a larger owner).
    Won,
    /// The caller already owned it; contributions merge.
    AlreadyOwned,
    /// A lexicographically smaller owner holds it; the caller was marked
    /// invalid by the claim call.
    Lost,
}

/// Mutable build state shared by the processor pipeline.
#[derive(Debug)]
pub struct DagBuilderState {
    pub config: BuildConfig,
    pub http_vhosts: BTreeMap<String, VirtualHost>,
    pub https_vhosts: BTreeMap<String, VirtualHost>,
    pub clusters: BTreeMap<String, super::Cluster>,
    pub secrets: BTreeMap<String, TlsSecret>,
    pub conditions: Vec<StatusCondition>,
    vhost_owners: BTreeMap<(ListenerSlot, String), (ObjectKind, ObjectRef)>,
    http_listener: Option<Listener>,
    https_listener: Option<Listener>,
}

impl DagBuilderState {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            http_vhosts: BTreeMap::new(),
            https_vhosts: BTreeMap::new(),
            clusters: BTreeMap::new(),
            secrets: BTreeMap::new(),
            conditions: Vec::new(),
            vhost_owners: BTreeMap::new(),
            http_listener: None,
            https_listener: None,
        }
    }

    /// First listener pass: bind the configured addresses.
    pub fn materialise_listeners(&mut self) {
        self.http_listener = Some(Listener {
            name: "ingress_http".to_string(),
            address: self.config.http_address.clone(),
            port: self.config.http_port,
            protocol: ListenerProtocol::Http,
            virtual_hosts: Vec::new(),
        });
        self.https_listener = Some(Listener {
            name: "ingress_https".to_string(),
            address: self.config.https_address.clone(),
            port: self.config.https_port,
            protocol: ListenerProtocol::Https,
            virtual_hosts: Vec::new(),
        });
    }

    /// Claim `fqdn` on a listener for `owner`. On collision the
    /// lexicographically smaller `(namespace, name)` wins and the loser gets
    /// an invalid condition.
    pub fn claim_virtual_host(
        &mut self,
        slot: ListenerSlot,
        fqdn: &str,
        kind: ObjectKind,
        owner: &ObjectRef,
        generation: Option<i64>,
    ) -> Claim {
        let key = (slot, fqdn.to_string());
        match self.vhost_owners.get(&key) {
            None => {
                self.vhost_owners.insert(key, (kind, owner.clone()));
                Claim::Won
            }
            Some((_, existing)) if existing == owner => Claim::AlreadyOwned,
            Some((existing_kind, existing)) => {
                if owner < existing {
                    let evicted = existing.clone();
                    let evicted_kind = *existing_kind;
                    self.conditions.push(StatusCondition::invalid(
                        evicted_kind,
                        &evicted,
                        InvalidReason::DuplicateVirtualHost,
                        format!("fqdn '{}' is claimed by {}", fqdn, owner),
                        None,
                    ));
                    self.drop_vhost(slot, fqdn);
                    self.vhost_owners.insert(key, (kind, owner.clone()));
                    Claim::Won
                } else {
                    self.conditions.push(StatusCondition::invalid(
                        kind,
                        owner,
                        InvalidReason::DuplicateVirtualHost,
                        format!("fqdn '{}' is claimed by {}", fqdn, existing),
                        generation,
                    ));
                    Claim::Lost
                }
            }
        }
    }

    fn drop_vhost(&mut self, slot: ListenerSlot, fqdn: &str) {
        match slot {
            ListenerSlot::Http => self.http_vhosts.remove(fqdn),
            ListenerSlot::Https => self.https_vhosts.remove(fqdn),
        };
    }

    /// Append a route to the virtual host, creating it on first use.
    pub fn add_route(&mut self, slot: ListenerSlot, fqdn: &str, route: Route) {
        let vhosts = match slot {
            ListenerSlot::Http => &mut self.http_vhosts,
            ListenerSlot::Https => &mut self.https_vhosts,
        };
        vhosts
            .entry(fqdn.to_string())
            .or_insert_with(|| VirtualHost {
                fqdn: fqdn.to_string(),
                routes: Vec::new(),
                tls: None,
                fallback_certificate: false,
            })
            .routes
            .push(route);
    }

    /// Access (and create) the virtual host entry directly, for processors
    /// that set TLS parameters.
    pub fn vhost_mut(&mut self, slot: ListenerSlot, fqdn: &str) -> &mut VirtualHost {
        let vhosts = match slot {
            ListenerSlot::Http => &mut self.http_vhosts,
            ListenerSlot::Https => &mut self.https_vhosts,
        };
        vhosts.entry(fqdn.to_string()).or_insert_with(|| VirtualHost {
            fqdn: fqdn.to_string(),
            routes: Vec::new(),
            tls: None,
            fallback_certificate: false,
        })
    }

    /// Register a cluster, first definition winning. Returns the name.
    pub fn register_cluster(&mut self, cluster: super::Cluster) -> String {
        let name = cluster.name.clone();
        self.clusters.entry(name.clone()).or_insert(cluster);
        name
    }

    pub fn register_secret(&mut self, secret: TlsSecret) -> String {
        let name = secret.name.clone();
        self.secrets.entry(name.clone()).or_insert(secret);
        name
    }

    /// True iff any `Valid=False` condition targets the object.
    pub fn has_invalid_condition(&self, kind: ObjectKind, target: &ObjectRef) -> bool {
        self.conditions.iter().any(|c| {
            c.kind == kind
                && c.name == target.name
                && c.namespace == target.namespace
                && !c.is_valid()
        })
    }

    /// Final listener pass: sort routes, attach virtual hosts, drop empty
    /// listeners.
    pub fn finalise_listeners(&mut self) -> Vec<Listener> {
        let mut listeners = Vec::new();

        if let Some(mut http) = self.http_listener.take() {
            http.virtual_hosts = take_sorted(&mut self.http_vhosts);
            if !http.virtual_hosts.is_empty() {
                listeners.push(http);
            }
        }
        if let Some(mut https) = self.https_listener.take() {
            https.virtual_hosts = take_sorted(&mut self.https_vhosts);
            if !https.virtual_hosts.is_empty() {
                listeners.push(https);
            }
        }
        listeners
    }
}

fn take_sorted(vhosts: &mut BTreeMap<String, VirtualHost>) -> Vec<VirtualHost> {
    let mut hosts: Vec<VirtualHost> = std::mem::take(vhosts)
        .into_values()
        .filter(|vh| !vh.routes.is_empty())
        .collect();
    for vh in &mut hosts {
        vh.routes.sort_by(route_order);
    }
    hosts.sort_by(|a, b| a.fqdn.cmp(&b.fqdn));
    hosts
}

/// Result of one build: the immutable DAG plus the condition set.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub dag: Arc<Dag>,
    pub conditions: Vec<StatusCondition>,
}

/// Processor capability; the pipeline is a fixed sequence of these.
pub trait Processor {
    fn process(&mut self, cache: &CacheSnapshot, dag: &mut DagBuilderState);
}

/// Build the DAG from one cache snapshot. Never fails; problems surface as
/// conditions.
pub fn build(config: &BuildConfig, cache: &CacheSnapshot) -> BuildResult {
    let mut state = DagBuilderState::new(config.clone());

    let mut processors: Vec<Box<dyn Processor>> = vec![
        Box::new(ListenerProcessor::FirstPass),
        Box::new(ExtensionServiceProcessor),
        Box::new(IngressProcessor),
        Box::new(GatewayApiProcessor),
        Box::new(HttpProxyProcessor::default()),
    ];
    for processor in &mut processors {
        processor.process(cache, &mut state);
    }

    // Second listener pass runs outside the trait so it can consume state.
    let listeners = state.finalise_listeners();

    let endpoints = endpoints::resolve_all(&state.clusters, cache);
    let dag = Dag {
        listeners,
        clusters: state.clusters,
        endpoints,
        secrets: state.secrets,
    };

    debug!(
        listeners = dag.listeners.len(),
        clusters = dag.clusters.len(),
        secrets = dag.secrets.len(),
        conditions = state.conditions.len(),
        "DAG build complete"
    );

    BuildResult { dag: Arc::new(dag), conditions: state.conditions }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_builds_empty_dag() {
        let result = build(&BuildConfig::default(), &CacheSnapshot::default());
        assert!(result.dag.listeners.is_empty());
        assert!(result.dag.clusters.is_empty());
        assert!(result.conditions.is_empty());
    }

    #[test]
    fn claim_collision_smaller_owner_wins() {
        let mut state = DagBuilderState::new(BuildConfig::default());
        let first = ObjectRef::new("ns-b", "web");
        let second = ObjectRef::new("ns-a", "web");

        assert_eq!(
            state.claim_virtual_host(ListenerSlot::Http, "a.test", ObjectKind::HttpProxy, &first, None),
            Claim::Won
        );
        // Smaller (namespace, name) evicts the earlier claim.
        assert_eq!(
            state.claim_virtual_host(ListenerSlot::Http, "a.test", ObjectKind::HttpProxy, &second, None),
            Claim::Won
        );
        assert!(state.has_invalid_condition(ObjectKind::HttpProxy, &first));

        // The larger owner trying again loses.
        assert_eq!(
            state.claim_virtual_host(ListenerSlot::Http, "a.test", ObjectKind::HttpProxy, &first, None),
            Claim::Lost
        );
    }

    #[test]
    fn claim_is_idempotent_for_the_same_owner() {
        let mut state = DagBuilderState::new(BuildConfig::default());
        let owner = ObjectRef::new("default", "web");
        assert_eq!(
            state.claim_virtual_host(ListenerSlot::Http, "a.test", ObjectKind::Ingress, &owner, None),
            Claim::Won
        );
        assert_eq!(
            state.claim_virtual_host(ListenerSlot::Http, "a.test", ObjectKind::Ingress, &owner, None),
            Claim::AlreadyOwned
        );
        assert!(state.conditions.is_empty());
    }

    #[test]
    fn simple_ingress_builds_complete_dag() {
        use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
        use k8s_openapi::api::discovery::v1::{
            Endpoint as SliceEndpoint, EndpointConditions, EndpointPort, EndpointSlice,
        };
        use k8s_openapi::api::networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        };
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
        use std::collections::BTreeMap;
        use std::sync::Arc;

        let mut cache = CacheSnapshot::default();
        cache.ingresses.insert(
            ObjectRef::new("default", "web"),
            Arc::new(Ingress {
                metadata: ObjectMeta {
                    namespace: Some("default".into()),
                    name: Some("web".into()),
                    ..Default::default()
                },
                spec: Some(IngressSpec {
                    rules: Some(vec![IngressRule {
                        host: Some("a.test".into()),
                        http: Some(HTTPIngressRuleValue {
                            paths: vec![HTTPIngressPath {
                                path: Some("/".into()),
                                path_type: "Prefix".into(),
                                backend: IngressBackend {
                                    service: Some(IngressServiceBackend {
                                        name: "svc-a".into(),
                                        port: Some(ServiceBackendPort {
                                            number: Some(80),
                                            name: None,
                                        }),
                                    }),
                                    ..Default::default()
                                },
                            }],
                        }),
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        );
        cache.services.insert(
            ObjectRef::new("default", "svc-a"),
            Arc::new(Service {
                metadata: ObjectMeta {
                    namespace: Some("default".into()),
                    name: Some("svc-a".into()),
                    ..Default::default()
                },
                spec: Some(ServiceSpec {
                    ports: Some(vec![ServicePort {
                        port: 80,
                        name: Some("http".into()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        );
        let mut labels = BTreeMap::new();
        labels.insert("kubernetes.io/service-name".to_string(), "svc-a".to_string());
        let slice_ref = ObjectRef::new("default", "svc-a-x1");
        cache.endpoint_slices.insert(
            slice_ref.clone(),
            Arc::new(EndpointSlice {
                metadata: ObjectMeta {
                    namespace: Some("default".into()),
                    name: Some("svc-a-x1".into()),
                    labels: Some(labels),
                    ..Default::default()
                },
                address_type: "IPv4".into(),
                endpoints: ["10.0.0.1", "10.0.0.2"]
                    .iter()
                    .map(|addr| SliceEndpoint {
                        addresses: vec![addr.to_string()],
                        conditions: Some(EndpointConditions {
                            ready: Some(true),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
                ports: Some(vec![EndpointPort {
                    name: Some("http".into()),
                    port: Some(8080),
                    ..Default::default()
                }]),
            }),
        );
        cache
            .slices_by_service
            .entry(ObjectRef::new("default", "svc-a"))
            .or_default()
            .insert(slice_ref);

        let result = build(&BuildConfig::default(), &cache);
        let dag = &result.dag;

        // One HTTP listener on 8080 with one virtual host and one route.
        assert_eq!(dag.listeners.len(), 1);
        let listener = &dag.listeners[0];
        assert_eq!(listener.port, 8080);
        assert_eq!(listener.protocol, ListenerProtocol::Http);
        assert_eq!(listener.virtual_hosts.len(), 1);
        assert_eq!(listener.virtual_hosts[0].fqdn, "a.test");
        assert_eq!(listener.virtual_hosts[0].routes.len(), 1);

        // The route's cluster exists and carries both endpoint addresses.
        assert!(dag.clusters.contains_key("default/svc-a/80"));
        let endpoints = dag.endpoints.get("default/svc-a/80").expect("endpoints resolved");
        assert_eq!(endpoints.addresses.len(), 2);
    }

    #[test]
    fn every_referenced_cluster_is_present() {
        use crate::dag::RouteAction;

        // Built over a cache with several contributing objects; the
        // invariant must hold whatever the processors produced.
        let cache = CacheSnapshot::default();
        let result = build(&BuildConfig::default(), &cache);
        for name in result.dag.referenced_clusters() {
            assert!(result.dag.clusters.contains_key(name));
        }

        // And route order within every virtual host is the canonical one.
        for listener in &result.dag.listeners {
            for vhost in &listener.virtual_hosts {
                let mut sorted = vhost.routes.clone();
                sorted.sort_by(route_order);
                assert_eq!(&sorted, &vhost.routes);
                for route in &vhost.routes {
                    if let RouteAction::Forward { clusters, .. } = &route.action {
                        assert!(!clusters.is_empty());
                    }
                }
            }
        }
    }

    #[test]
    fn empty_vhosts_are_dropped_from_listeners() {
        let mut state = DagBuilderState::new(BuildConfig::default());
        state.materialise_listeners();
        // A vhost without routes must not survive finalisation.
        state.vhost_mut(ListenerSlot::Http, "empty.test");
        let listeners = state.finalise_listeners();
        assert!(listeners.is_empty());
    }
}
