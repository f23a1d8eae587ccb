//! In-memory index of the routing-relevant Kubernetes objects.
//!
//! The cache is owned by the event handler, which is its sole writer. Readers
//! (the DAG builder) take an immutable [`CacheSnapshot`]; snapshots share the
//! stored objects via `Arc`, so taking one is a shallow copy of the maps.
//!
//! Membership rules are enforced at insertion: objects that can never
//! participate in configuration (a non-TLS Secret, an Ingress for another
//! class, a root HTTPProxy outside the root namespaces) are not cached at
//! all.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use tracing::debug;

use crate::config::{FallbackCertificate, IngressConfig};

use super::apis::{
    ExtensionService, GRPCRoute, Gateway, HTTPProxy, HTTPRoute, ReferenceGrant,
    TLSCertificateDelegation, TLSRoute,
};
use super::object::{KubeObject, ObjectKind, ObjectRef};

/// Label EndpointSlices carry to name their owning Service.
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Legacy ingress class annotation, still honoured alongside
/// `spec.ingressClassName`.
const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

#[derive(Debug, Default)]
struct CacheInner {
    ingresses: BTreeMap<ObjectRef, Arc<Ingress>>,
    proxies: BTreeMap<ObjectRef, Arc<HTTPProxy>>,
    gateways: BTreeMap<ObjectRef, Arc<Gateway>>,
    http_routes: BTreeMap<ObjectRef, Arc<HTTPRoute>>,
    tls_routes: BTreeMap<ObjectRef, Arc<TLSRoute>>,
    grpc_routes: BTreeMap<ObjectRef, Arc<GRPCRoute>>,
    reference_grants: BTreeMap<ObjectRef, Arc<ReferenceGrant>>,
    services: BTreeMap<ObjectRef, Arc<Service>>,
    endpoint_slices: BTreeMap<ObjectRef, Arc<EndpointSlice>>,
    secrets: BTreeMap<ObjectRef, Arc<Secret>>,
    extension_services: BTreeMap<ObjectRef, Arc<ExtensionService>>,
    delegations: BTreeMap<ObjectRef, Arc<TLSCertificateDelegation>>,

    /// EndpointSlices grouped under their owning Service.
    slices_by_service: BTreeMap<ObjectRef, BTreeSet<ObjectRef>>,

    /// Service -> route-bearing objects referencing it. Lets the event
    /// handler classify an event as endpoint-only without a DAG walk.
    service_refs: BTreeMap<ObjectRef, BTreeSet<(ObjectKind, ObjectRef)>>,

    /// Resource versions of everything currently cached, for idempotent
    /// change detection.
    versions: BTreeMap<(ObjectKind, ObjectRef), String>,
}

/// Writable cache; single-writer discipline is the event handler's job.
#[derive(Debug)]
pub struct KubernetesCache {
    ingress: IngressConfig,
    inner: RwLock<CacheInner>,
}

/// Immutable view handed to the DAG builder.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub ingresses: BTreeMap<ObjectRef, Arc<Ingress>>,
    pub proxies: BTreeMap<ObjectRef, Arc<HTTPProxy>>,
    pub gateways: BTreeMap<ObjectRef, Arc<Gateway>>,
    pub http_routes: BTreeMap<ObjectRef, Arc<HTTPRoute>>,
    pub tls_routes: BTreeMap<ObjectRef, Arc<TLSRoute>>,
    pub grpc_routes: BTreeMap<ObjectRef, Arc<GRPCRoute>>,
    pub reference_grants: BTreeMap<ObjectRef, Arc<ReferenceGrant>>,
    pub services: BTreeMap<ObjectRef, Arc<Service>>,
    pub endpoint_slices: BTreeMap<ObjectRef, Arc<EndpointSlice>>,
    pub secrets: BTreeMap<ObjectRef, Arc<Secret>>,
    pub extension_services: BTreeMap<ObjectRef, Arc<ExtensionService>>,
    pub delegations: BTreeMap<ObjectRef, Arc<TLSCertificateDelegation>>,
    pub slices_by_service: BTreeMap<ObjectRef, BTreeSet<ObjectRef>>,
}

impl CacheSnapshot {
    /// EndpointSlices belonging to `service`, in name order.
    pub fn slices_for_service(&self, service: &ObjectRef) -> Vec<Arc<EndpointSlice>> {
        self.slices_by_service
            .get(service)
            .map(|slices| {
                slices.iter().filter_map(|key| self.endpoint_slices.get(key).cloned()).collect()
            })
            .unwrap_or_default()
    }

    /// True iff a delegation in the secret's namespace permits `referrer` to
    /// use it. Same-namespace references are always permitted.
    pub fn delegation_permits(&self, secret: &ObjectRef, referrer_namespace: &str) -> bool {
        if secret.namespace == referrer_namespace {
            return true;
        }
        self.delegations.iter().any(|(key, delegation)| {
            key.namespace == secret.namespace
                && delegation.spec.delegations.iter().any(|d| {
                    d.secret_name == secret.name
                        && d.target_namespaces
                            .iter()
                            .any(|ns| ns == "*" || ns == referrer_namespace)
                })
        })
    }
}

impl KubernetesCache {
    pub fn new(ingress: IngressConfig) -> Self {
        Self { ingress, inner: RwLock::new(CacheInner::default()) }
    }

    /// Insert or replace an object. Returns true iff the cache's observable
    /// state changed. Objects failing the membership rules are dropped (and
    /// evicted if previously cached, e.g. a Secret rotated to a non-TLS
    /// type).
    pub fn insert(&self, obj: KubeObject) -> bool {
        let kind = obj.kind();
        let key = obj.object_ref();

        if !self.admits(&obj) {
            debug!(kind = %kind, object = %key, "object failed membership rules");
            return self.remove_by_key(kind, &key);
        }

        let version = obj.resource_version();
        let mut inner = self.inner.write().expect("kubernetes cache lock poisoned");

        if !version.is_empty() {
            if let Some(existing) = inner.versions.get(&(kind, key.clone())) {
                if existing == &version {
                    return false;
                }
            }
        }

        match obj {
            KubeObject::Ingress(o) => {
                inner.reindex_service_refs(kind, &key, ingress_service_refs(&o, &key.namespace));
                inner.ingresses.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::HttpProxy(o) => {
                inner.reindex_service_refs(kind, &key, proxy_service_refs(&o, &key.namespace));
                inner.proxies.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::Gateway(o) => {
                inner.gateways.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::HttpRoute(o) => {
                inner.reindex_service_refs(kind, &key, http_route_service_refs(&o, &key.namespace));
                inner.http_routes.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::TlsRoute(o) => {
                let refs = o
                    .spec
                    .rules
                    .iter()
                    .flat_map(|r| r.backend_refs.iter())
                    .map(|b| backend_ref_target(b, &key.namespace))
                    .collect();
                inner.reindex_service_refs(kind, &key, refs);
                inner.tls_routes.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::GrpcRoute(o) => {
                let refs = o
                    .spec
                    .rules
                    .iter()
                    .flat_map(|r| r.backend_refs.iter())
                    .map(|b| backend_ref_target(b, &key.namespace))
                    .collect();
                inner.reindex_service_refs(kind, &key, refs);
                inner.grpc_routes.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::ReferenceGrant(o) => {
                inner.reference_grants.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::Service(o) => {
                inner.services.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::EndpointSlice(o) => {
                if let Some(service) = owning_service(&o, &key.namespace) {
                    inner.slices_by_service.entry(service).or_default().insert(key.clone());
                }
                inner.endpoint_slices.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::Secret(o) => {
                inner.secrets.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::ExtensionService(o) => {
                let refs = o
                    .spec
                    .services
                    .iter()
                    .map(|s| ObjectRef::new(key.namespace.clone(), s.name.clone()))
                    .collect();
                inner.reindex_service_refs(kind, &key, refs);
                inner.extension_services.insert(key.clone(), Arc::new(*o));
            }
            KubeObject::TlsCertificateDelegation(o) => {
                inner.delegations.insert(key.clone(), Arc::new(*o));
            }
        }

        inner.versions.insert((kind, key), version);
        true
    }

    /// Remove an object. Returns true iff something was actually evicted.
    pub fn remove(&self, obj: &KubeObject) -> bool {
        self.remove_by_key(obj.kind(), &obj.object_ref())
    }

    fn remove_by_key(&self, kind: ObjectKind, key: &ObjectRef) -> bool {
        let mut inner = self.inner.write().expect("kubernetes cache lock poisoned");

        let removed = match kind {
            ObjectKind::Ingress => inner.ingresses.remove(key).is_some(),
            ObjectKind::HttpProxy => inner.proxies.remove(key).is_some(),
            ObjectKind::Gateway => inner.gateways.remove(key).is_some(),
            ObjectKind::HttpRoute => inner.http_routes.remove(key).is_some(),
            ObjectKind::TlsRoute => inner.tls_routes.remove(key).is_some(),
            ObjectKind::GrpcRoute => inner.grpc_routes.remove(key).is_some(),
            ObjectKind::ReferenceGrant => inner.reference_grants.remove(key).is_some(),
            ObjectKind::Service => inner.services.remove(key).is_some(),
            ObjectKind::EndpointSlice => {
                let removed = inner.endpoint_slices.remove(key).is_some();
                for slices in inner.slices_by_service.values_mut() {
                    slices.remove(key);
                }
                inner.slices_by_service.retain(|_, slices| !slices.is_empty());
                removed
            }
            ObjectKind::Secret => inner.secrets.remove(key).is_some(),
            ObjectKind::ExtensionService => inner.extension_services.remove(key).is_some(),
            ObjectKind::TlsCertificateDelegation => inner.delegations.remove(key).is_some(),
        };

        if removed {
            inner.reindex_service_refs(kind, key, Vec::new());
            inner.versions.remove(&(kind, key.clone()));
        }
        removed
    }

    /// Immutable view of the current contents.
    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.read().expect("kubernetes cache lock poisoned");
        CacheSnapshot {
            ingresses: inner.ingresses.clone(),
            proxies: inner.proxies.clone(),
            gateways: inner.gateways.clone(),
            http_routes: inner.http_routes.clone(),
            tls_routes: inner.tls_routes.clone(),
            grpc_routes: inner.grpc_routes.clone(),
            reference_grants: inner.reference_grants.clone(),
            services: inner.services.clone(),
            endpoint_slices: inner.endpoint_slices.clone(),
            secrets: inner.secrets.clone(),
            extension_services: inner.extension_services.clone(),
            delegations: inner.delegations.clone(),
            slices_by_service: inner.slices_by_service.clone(),
        }
    }

    /// True iff a route-bearing object references the given Service.
    pub fn is_service_referenced(&self, service: &ObjectRef) -> bool {
        let inner = self.inner.read().expect("kubernetes cache lock poisoned");
        inner.service_refs.get(service).is_some_and(|owners| !owners.is_empty())
    }

    fn admits(&self, obj: &KubeObject) -> bool {
        match obj {
            KubeObject::Secret(secret) => {
                self.secret_is_relevant(secret, &obj.object_ref())
            }
            KubeObject::Ingress(ingress) => self.ingress_class_matches(ingress),
            KubeObject::HttpProxy(proxy) => {
                let is_root = proxy.spec.virtualhost.is_some();
                if !is_root || self.ingress.root_namespaces.is_empty() {
                    return true;
                }
                let namespace = obj.object_ref().namespace;
                self.ingress.root_namespaces.iter().any(|ns| ns == &namespace)
            }
            _ => true,
        }
    }

    fn secret_is_relevant(&self, secret: &Secret, key: &ObjectRef) -> bool {
        if is_configured_secret(self.ingress.fallback_certificate.as_ref(), key) {
            return true;
        }
        let type_ = secret.type_.as_deref().unwrap_or_default();
        if type_ == "kubernetes.io/tls" {
            let data_has = |k: &str| {
                secret.data.as_ref().is_some_and(|d| d.contains_key(k))
                    || secret.string_data.as_ref().is_some_and(|d| d.contains_key(k))
            };
            return data_has("tls.crt") && data_has("tls.key");
        }
        // CA bundles ride in Opaque secrets under "ca.crt".
        secret.data.as_ref().is_some_and(|d| d.contains_key("ca.crt"))
            || secret.string_data.as_ref().is_some_and(|d| d.contains_key("ca.crt"))
    }

    fn ingress_class_matches(&self, ingress: &Ingress) -> bool {
        let object_class = ingress
            .spec
            .as_ref()
            .and_then(|s| s.ingress_class_name.clone())
            .or_else(|| {
                ingress
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION).cloned())
            });

        match (&self.ingress.ingress_class, &object_class) {
            (Some(configured), Some(class)) => configured == class,
            (None, None) => true,
            // One side classed, the other not: someone else's ingress.
            _ => false,
        }
    }
}

impl CacheInner {
    /// Replace the reverse service index entries owned by `(kind, owner)`.
    fn reindex_service_refs(
        &mut self,
        kind: ObjectKind,
        owner: &ObjectRef,
        targets: Vec<ObjectRef>,
    ) {
        let entry = (kind, owner.clone());
        self.service_refs.retain(|_, owners| {
            owners.remove(&entry);
            !owners.is_empty()
        });
        for target in targets {
            self.service_refs.entry(target).or_default().insert(entry.clone());
        }
    }
}

fn is_configured_secret(fallback: Option<&FallbackCertificate>, key: &ObjectRef) -> bool {
    fallback.is_some_and(|f| f.name == key.name && f.namespace == key.namespace)
}

fn owning_service(slice: &EndpointSlice, namespace: &str) -> Option<ObjectRef> {
    slice
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SERVICE_NAME_LABEL))
        .map(|name| ObjectRef::new(namespace, name.clone()))
}

fn ingress_service_refs(ingress: &Ingress, namespace: &str) -> Vec<ObjectRef> {
    let mut refs = Vec::new();
    if let Some(spec) = &ingress.spec {
        if let Some(backend) = &spec.default_backend {
            if let Some(service) = &backend.service {
                refs.push(ObjectRef::new(namespace, service.name.clone()));
            }
        }
        for rule in spec.rules.as_deref().unwrap_or_default() {
            if let Some(http) = &rule.http {
                for path in &http.paths {
                    if let Some(service) = &path.backend.service {
                        refs.push(ObjectRef::new(namespace, service.name.clone()));
                    }
                }
            }
        }
    }
    refs
}

fn proxy_service_refs(proxy: &HTTPProxy, namespace: &str) -> Vec<ObjectRef> {
    let mut refs: Vec<ObjectRef> = proxy
        .spec
        .routes
        .iter()
        .flat_map(|r| r.services.iter())
        .map(|s| ObjectRef::new(namespace, s.name.clone()))
        .collect();
    if let Some(tcp) = &proxy.spec.tcpproxy {
        refs.extend(tcp.services.iter().map(|s| ObjectRef::new(namespace, s.name.clone())));
    }
    refs
}

fn http_route_service_refs(route: &HTTPRoute, namespace: &str) -> Vec<ObjectRef> {
    let mut refs = Vec::new();
    for rule in &route.spec.rules {
        for backend in &rule.backend_refs {
            refs.push(backend_ref_target(backend, namespace));
        }
        for filter in &rule.filters {
            if let Some(mirror) = &filter.request_mirror {
                refs.push(backend_ref_target(&mirror.backend_ref, namespace));
            }
        }
    }
    refs
}

fn backend_ref_target(backend: &super::apis::BackendRef, default_namespace: &str) -> ObjectRef {
    ObjectRef::new(
        backend.namespace.clone().unwrap_or_else(|| default_namespace.to_string()),
        backend.name.clone(),
    )
}
