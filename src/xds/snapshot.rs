//! The snapshotter: converts a published DAG into the five Envoy resource
//! sets and stages them into the xDS cache in one atomic application, so no
//! client can observe a route before its cluster or a cluster before its
//! load assignment.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::dag::{Dag, EndpointSet};
use crate::Result;

use super::cache::XdsCache;
use super::listener::ListenerConversionConfig;
use super::resources::{
    ResourceUpdate, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
    SECRET_TYPE_URL,
};
use super::{cluster, endpoint, listener, route, secret};

pub struct Snapshotter {
    cache: Arc<XdsCache>,
    config: ListenerConversionConfig,
}

impl Snapshotter {
    pub fn new(cache: Arc<XdsCache>, config: ListenerConversionConfig) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> Arc<XdsCache> {
        self.cache.clone()
    }

    /// Convert and stage a full DAG. Returns the update when anything
    /// observable changed.
    #[instrument(skip(self, dag), name = "snapshot_publish")]
    pub fn publish(&self, dag: &Dag) -> Result<Option<ResourceUpdate>> {
        let mut staged = BTreeMap::new();
        staged.insert(CLUSTER_TYPE_URL, cluster::clusters_from_dag(dag)?);
        staged.insert(ENDPOINT_TYPE_URL, endpoint::endpoints_from_map(&dag.endpoints)?);
        staged.insert(LISTENER_TYPE_URL, listener::listeners_from_dag(dag, &self.config)?);
        staged.insert(ROUTE_TYPE_URL, route::routes_from_dag(dag)?);
        staged.insert(SECRET_TYPE_URL, secret::secrets_from_map(&dag.secrets)?);

        let update = self.cache.apply_snapshot(staged);
        match &update {
            Some(update) => info!(
                version = update.version,
                snapshot_version = %update.snapshot_version,
                types = update.deltas.len(),
                "published snapshot"
            ),
            None => debug!("snapshot unchanged"),
        }
        Ok(update)
    }

    /// Endpoint-only fast path: restage EDS without touching the other
    /// stores.
    #[instrument(skip(self, endpoints), name = "snapshot_publish_endpoints")]
    pub fn publish_endpoints(
        &self,
        endpoints: &BTreeMap<String, EndpointSet>,
    ) -> Result<Option<ResourceUpdate>> {
        let built = endpoint::endpoints_from_map(endpoints)?;
        let update = self.cache.apply_type(ENDPOINT_TYPE_URL, built);
        if let Some(update) = &update {
            info!(version = update.version, "published endpoint-only update");
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::dag::builder::{build, BuildConfig};
    use crate::dag::Endpoint;
    use crate::k8s::apis::{HTTPProxySpec, RouteSpec, ServiceRef, VirtualHostSpec};
    use crate::k8s::apis::{HTTPProxy, MatchCondition};
    use crate::k8s::{CacheSnapshot, ObjectRef};
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::HashSet;

    fn snapshotter() -> Snapshotter {
        Snapshotter::new(
            Arc::new(XdsCache::new()),
            ListenerConversionConfig::from_app(&AppConfig::default()).unwrap(),
        )
    }

    fn cache_with_proxy() -> CacheSnapshot {
        let mut cache = CacheSnapshot::default();
        cache.services.insert(
            ObjectRef::new("default", "svc-a"),
            std::sync::Arc::new(Service {
                metadata: ObjectMeta {
                    namespace: Some("default".into()),
                    name: Some("svc-a".into()),
                    ..Default::default()
                },
                spec: Some(ServiceSpec {
                    ports: Some(vec![ServicePort { port: 80, ..Default::default() }]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        );
        cache.proxies.insert(
            ObjectRef::new("default", "web"),
            std::sync::Arc::new(HTTPProxy {
                metadata: ObjectMeta {
                    namespace: Some("default".into()),
                    name: Some("web".into()),
                    generation: Some(1),
                    ..Default::default()
                },
                spec: HTTPProxySpec {
                    virtualhost: Some(VirtualHostSpec { fqdn: "a.test".into(), tls: None }),
                    routes: vec![RouteSpec {
                        conditions: vec![MatchCondition {
                            prefix: Some("/".into()),
                            ..Default::default()
                        }],
                        services: vec![ServiceRef {
                            name: "svc-a".into(),
                            port: 80,
                            ..Default::default()
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                status: None,
            }),
        );
        cache
    }

    #[test]
    fn full_publish_stages_all_types_at_one_version() {
        let snapshotter = snapshotter();
        let result = build(&BuildConfig::default(), &cache_with_proxy());
        let update = snapshotter.publish(&result.dag).unwrap().expect("update");

        let changed: Vec<&str> =
            update.deltas.iter().map(|d| d.type_url.as_str()).collect();
        assert!(changed.contains(&CLUSTER_TYPE_URL));
        assert!(changed.contains(&ENDPOINT_TYPE_URL));
        assert!(changed.contains(&LISTENER_TYPE_URL));
        assert!(changed.contains(&ROUTE_TYPE_URL));

        let cache = snapshotter.cache();
        // Every cluster referenced by a route is present, with an
        // assignment staged at the same version.
        let clusters = cache.resources(CLUSTER_TYPE_URL, &HashSet::new());
        let assignments = cache.resources(ENDPOINT_TYPE_URL, &HashSet::new());
        assert_eq!(clusters.len(), 1);
        assert_eq!(assignments.len(), 1);
        assert_eq!(clusters[0].version, assignments[0].version);
    }

    #[test]
    fn republishing_identical_dag_changes_nothing() {
        let snapshotter = snapshotter();
        let result = build(&BuildConfig::default(), &cache_with_proxy());
        snapshotter.publish(&result.dag).unwrap().expect("first update");
        assert!(snapshotter.publish(&result.dag).unwrap().is_none());
    }

    #[test]
    fn equal_cache_snapshots_build_byte_identical_resources() {
        // Two independent builds over the same cache must serialise to the
        // same bytes, so the second staged publish is a no-op.
        let cache = cache_with_proxy();
        let first = build(&BuildConfig::default(), &cache);
        let second = build(&BuildConfig::default(), &cache);
        assert_eq!(first.dag, second.dag);

        let snapshotter = snapshotter();
        snapshotter.publish(&first.dag).unwrap().expect("first publish");
        assert!(snapshotter.publish(&second.dag).unwrap().is_none());
    }

    #[test]
    fn endpoint_only_publish_advances_only_eds() {
        let snapshotter = snapshotter();
        let result = build(&BuildConfig::default(), &cache_with_proxy());
        snapshotter.publish(&result.dag).unwrap().expect("seed update");

        let cache = snapshotter.cache();
        let cds_before = cache.type_version(CLUSTER_TYPE_URL);
        let lds_before = cache.type_version(LISTENER_TYPE_URL);
        let rds_before = cache.type_version(ROUTE_TYPE_URL);

        let mut endpoints = result.dag.endpoints.clone();
        endpoints.get_mut("default/svc-a/80").unwrap().addresses = vec![
            Endpoint { address: "10.0.0.1".into(), port: 8080 },
            Endpoint { address: "10.0.0.2".into(), port: 8080 },
            Endpoint { address: "10.0.0.3".into(), port: 8080 },
        ];
        let update = snapshotter.publish_endpoints(&endpoints).unwrap().expect("eds update");

        assert_eq!(update.deltas.len(), 1);
        assert_eq!(update.deltas[0].type_url, ENDPOINT_TYPE_URL);
        assert_eq!(cache.type_version(CLUSTER_TYPE_URL), cds_before);
        assert_eq!(cache.type_version(LISTENER_TYPE_URL), lds_before);
        assert_eq!(cache.type_version(ROUTE_TYPE_URL), rds_before);
        assert!(cache.type_version(ENDPOINT_TYPE_URL) > cds_before);
    }
}
