//! The event handler: sole writer to the Kubernetes cache, sole invoker of
//! the DAG builder.
//!
//! Mutations arrive on one channel and are serialised here. Rebuilds are
//! debounced with two timers: a quiet period (`holdoff`) that each new event
//! resets, and a hard bound (`max_holdoff`) since the first pending event so
//! a busy cluster cannot stall configuration forever. Events touching only
//! endpoints of services the current DAG references skip the rebuild and
//! refresh the EDS store alone.
//!
//! State machine: Idle -> Pending (holdoff running) -> Building ->
//! Publishing -> Idle. Building is synchronous; events arriving meanwhile
//! queue for the next Pending.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dag::builder::{build, BuildConfig};
use crate::dag::{endpoints, Dag, StatusCondition};
use crate::k8s::{KubernetesCache, KubeObject, ObjectEvent};
use crate::xds::Snapshotter;

/// Consumers of each freshly built DAG (beyond the snapshotter itself).
pub trait DagObserver: Send + Sync {
    fn on_dag(&self, dag: &Arc<Dag>);
}

impl DagObserver for Snapshotter {
    fn on_dag(&self, dag: &Arc<Dag>) {
        if let Err(error) = self.publish(dag) {
            error!(%error, "failed to publish snapshot");
        }
    }
}

/// How an applied event affects the served configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventImpact {
    /// Touches routing structure; needs a DAG rebuild.
    Structural,
    /// Touches only endpoints of referenced services; EDS refresh suffices.
    EndpointOnly,
    /// Changed nothing observable.
    None,
}

pub struct EventHandler {
    cache: Arc<KubernetesCache>,
    build_config: BuildConfig,
    snapshotter: Arc<Snapshotter>,
    observers: Vec<Arc<dyn DagObserver>>,
    status_tx: mpsc::Sender<Vec<StatusCondition>>,
    holdoff: Duration,
    max_holdoff: Duration,
    last_dag: Arc<Dag>,
    last_conditions: Vec<StatusCondition>,
}

impl EventHandler {
    pub fn new(
        cache: Arc<KubernetesCache>,
        build_config: BuildConfig,
        snapshotter: Arc<Snapshotter>,
        status_tx: mpsc::Sender<Vec<StatusCondition>>,
        holdoff: Duration,
        max_holdoff: Duration,
    ) -> Self {
        Self {
            cache,
            build_config,
            snapshotter,
            observers: Vec::new(),
            status_tx,
            holdoff,
            max_holdoff,
            last_dag: Arc::new(Dag::default()),
            last_conditions: Vec::new(),
        }
    }

    pub fn register_observer(&mut self, observer: Arc<dyn DagObserver>) {
        self.observers.push(observer);
    }

    /// Run until the event channel closes or `token` fires.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ObjectEvent>, token: CancellationToken) {
        info!(
            holdoff_ms = self.holdoff.as_millis() as u64,
            max_holdoff_ms = self.max_holdoff.as_millis() as u64,
            "event handler started"
        );

        loop {
            // Idle: block until the first event of a batch.
            let first = tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let first_at = Instant::now();
            let mut impact = self.apply(first);

            // Pending: absorb further events until the holdoff expires or
            // the max holdoff forces the build.
            loop {
                let deadline =
                    (Instant::now() + self.holdoff).min(first_at + self.max_holdoff);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            impact = impact.merge(self.apply(event));
                        }
                        None => break,
                    },
                }
            }

            // Building / Publishing.
            match impact {
                EventImpact::None => {
                    debug!("event batch changed nothing observable");
                }
                EventImpact::EndpointOnly => self.publish_endpoints(),
                EventImpact::Structural => self.rebuild(),
            }
        }
        info!("event handler stopped");
    }

    fn apply(&self, event: ObjectEvent) -> EventImpact {
        let impact = self.classify(&event);
        let changed = match event {
            ObjectEvent::Upsert(obj) => self.cache.insert(obj),
            ObjectEvent::Delete(obj) => self.cache.remove(&obj),
        };
        if changed {
            impact
        } else {
            EventImpact::None
        }
    }

    /// Decide whether this event can take the endpoint-only fast path.
    /// EndpointSlice changes always qualify. A Service update qualifies
    /// only when the Service was already known, backs a cluster of the
    /// current DAG, and keeps `spec.ports` intact: cluster configuration
    /// and named-port resolution are functions of the port list, so a port
    /// remap must rebuild (and re-emit conditions), not just restage EDS.
    fn classify(&self, event: &ObjectEvent) -> EventImpact {
        let referenced = |service: &crate::k8s::ObjectRef| {
            self.last_dag.clusters.values().any(|c| &c.service == service)
        };
        match event.object() {
            // Slices of unreferenced services resolve to no cluster, so the
            // fast path publishes nothing for them.
            KubeObject::EndpointSlice(_) => EventImpact::EndpointOnly,
            KubeObject::Service(incoming) => {
                let key = event.object().object_ref();
                if matches!(event, ObjectEvent::Delete(_)) || !referenced(&key) {
                    return EventImpact::Structural;
                }
                match self.cache.snapshot().services.get(&key) {
                    Some(existing)
                        if existing.spec.as_ref().map(|s| &s.ports)
                            == incoming.spec.as_ref().map(|s| &s.ports) =>
                    {
                        EventImpact::EndpointOnly
                    }
                    // New Service or a changed port list: route validity
                    // and cluster port mapping may have moved.
                    _ => EventImpact::Structural,
                }
            }
            _ => EventImpact::Structural,
        }
    }

    /// Full rebuild: new DAG, status delta, fan-out, snapshot.
    fn rebuild(&mut self) {
        let snapshot = self.cache.snapshot();
        let result = build(&self.build_config, &snapshot);

        // Only conditions that differ from the previous build go to the
        // status writer.
        let delta: Vec<StatusCondition> = result
            .conditions
            .iter()
            .filter(|c| !self.last_conditions.contains(c))
            .cloned()
            .collect();
        if !delta.is_empty() {
            if let Err(error) = self.status_tx.try_send(delta) {
                debug!(%error, "status writer backlogged, dropping delta");
            }
        }

        self.last_conditions = result.conditions;
        self.last_dag = result.dag.clone();

        self.snapshotter.on_dag(&self.last_dag);
        for observer in &self.observers {
            observer.on_dag(&self.last_dag);
        }
    }

    /// Endpoint-only fast path: recompute assignments for the existing
    /// clusters and restage EDS alone.
    fn publish_endpoints(&self) {
        let snapshot = self.cache.snapshot();
        let endpoints = endpoints::resolve_all(&self.last_dag.clusters, &snapshot);
        if let Err(error) = self.snapshotter.publish_endpoints(&endpoints) {
            error!(%error, "failed to publish endpoint update");
        }
    }
}

impl EventImpact {
    fn merge(self, other: EventImpact) -> EventImpact {
        use EventImpact::*;
        match (self, other) {
            (Structural, _) | (_, Structural) => Structural,
            (EndpointOnly, _) | (_, EndpointOnly) => EndpointOnly,
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, IngressConfig};
    use crate::xds::resources::{
        CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
    };
    use crate::xds::{ListenerConversionConfig, XdsCache};
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
    use std::collections::HashSet;

    fn meta(namespace: &str, name: &str, version: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.into()),
            name: Some(name.into()),
            resource_version: Some(version.into()),
            ..Default::default()
        }
    }

    fn ingress() -> KubeObject {
        KubeObject::Ingress(Box::new(Ingress {
            metadata: meta("default", "web", "1"),
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
        }))
    }

    fn service_with_ports(version: &str, ports: Vec<ServicePort>) -> KubeObject {
        KubeObject::Service(Box::new(Service {
            metadata: meta("default", "svc-a", version),
            spec: Some(ServiceSpec { ports: Some(ports), ..Default::default() }),
            ..Default::default()
        }))
    }

    fn service() -> KubeObject {
        service_with_ports(
            "1",
            vec![ServicePort { port: 80, name: Some("http".into()), ..Default::default() }],
        )
    }

    fn slice(version: &str, addresses: &[&str]) -> KubeObject {
        let mut labels = BTreeMap::new();
        labels.insert("kubernetes.io/service-name".to_string(), "svc-a".to_string());
        let mut metadata = meta("default", "svc-a-x1", version);
        metadata.labels = Some(labels);
        KubeObject::EndpointSlice(Box::new(EndpointSlice {
            metadata,
            address_type: "IPv4".into(),
            endpoints: addresses
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
        }))
    }

    struct Fixture {
        tx: mpsc::Sender<ObjectEvent>,
        status_rx: mpsc::Receiver<Vec<StatusCondition>>,
        xds: Arc<XdsCache>,
        token: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start_handler() -> Fixture {
        let cache = Arc::new(KubernetesCache::new(IngressConfig::default()));
        let xds = Arc::new(XdsCache::new());
        let snapshotter = Arc::new(Snapshotter::new(
            xds.clone(),
            ListenerConversionConfig::from_app(&AppConfig::default()).unwrap(),
        ));
        let (status_tx, status_rx) = mpsc::channel(16);
        let handler = EventHandler::new(
            cache,
            BuildConfig::default(),
            snapshotter,
            status_tx,
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        let (tx, rx) = mpsc::channel(64);
        let token = CancellationToken::new();
        let handle = tokio::spawn(handler.run(rx, token.clone()));
        Fixture { tx, status_rx, xds, token, handle }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn batched_events_produce_one_snapshot() {
        let mut fixture = start_handler().await;

        fixture.tx.send(ObjectEvent::Upsert(service())).await.unwrap();
        fixture.tx.send(ObjectEvent::Upsert(slice("1", &["10.0.0.1", "10.0.0.2"]))).await.unwrap();
        fixture.tx.send(ObjectEvent::Upsert(ingress())).await.unwrap();
        settle().await;

        let clusters = fixture.xds.resources(CLUSTER_TYPE_URL, &HashSet::new());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "default/svc-a/80");
        // One batch, one version: everything staged together.
        let assignments = fixture.xds.resources(ENDPOINT_TYPE_URL, &HashSet::new());
        assert_eq!(assignments[0].version, clusters[0].version);

        // Ingress conditions are internal-only, but the channel must not
        // block the handler even if nobody reads it.
        let _ = fixture.status_rx.try_recv();

        fixture.token.cancel();
        fixture.handle.await.unwrap();
    }

    #[tokio::test]
    async fn endpoint_scale_up_advances_only_eds() {
        let mut fixture = start_handler().await;

        fixture.tx.send(ObjectEvent::Upsert(service())).await.unwrap();
        fixture.tx.send(ObjectEvent::Upsert(slice("1", &["10.0.0.1", "10.0.0.2"]))).await.unwrap();
        fixture.tx.send(ObjectEvent::Upsert(ingress())).await.unwrap();
        settle().await;

        let cds = fixture.xds.type_version(CLUSTER_TYPE_URL);
        let lds = fixture.xds.type_version(LISTENER_TYPE_URL);
        let rds = fixture.xds.type_version(ROUTE_TYPE_URL);
        let eds = fixture.xds.type_version(ENDPOINT_TYPE_URL);

        // Scale 2 -> 3 endpoints.
        fixture
            .tx
            .send(ObjectEvent::Upsert(slice("2", &["10.0.0.1", "10.0.0.2", "10.0.0.3"])))
            .await
            .unwrap();
        settle().await;

        assert_eq!(fixture.xds.type_version(CLUSTER_TYPE_URL), cds);
        assert_eq!(fixture.xds.type_version(LISTENER_TYPE_URL), lds);
        assert_eq!(fixture.xds.type_version(ROUTE_TYPE_URL), rds);
        assert!(fixture.xds.type_version(ENDPOINT_TYPE_URL) > eds);

        let _ = fixture.status_rx.try_recv();
        fixture.token.cancel();
        fixture.handle.await.unwrap();
    }

    #[test]
    fn service_port_changes_are_structural() {
        let cache = Arc::new(KubernetesCache::new(IngressConfig::default()));
        let xds = Arc::new(XdsCache::new());
        let snapshotter = Arc::new(Snapshotter::new(
            xds,
            ListenerConversionConfig::from_app(&AppConfig::default()).unwrap(),
        ));
        let (status_tx, _status_rx) = mpsc::channel(4);
        let mut handler = EventHandler::new(
            cache.clone(),
            BuildConfig::default(),
            snapshotter,
            status_tx,
            Duration::from_millis(10),
            Duration::from_millis(50),
        );

        cache.insert(service());
        cache.insert(ingress());
        handler.last_dag = build(&BuildConfig::default(), &cache.snapshot()).dag;

        // Unchanged port list on a referenced Service: EDS refresh suffices.
        let unchanged = ObjectEvent::Upsert(service_with_ports(
            "2",
            vec![ServicePort { port: 80, name: Some("http".into()), ..Default::default() }],
        ));
        assert_eq!(handler.classify(&unchanged), EventImpact::EndpointOnly);

        // A named-port remap changes what the builder and endpoint
        // resolution read; it must rebuild.
        let remapped = ObjectEvent::Upsert(service_with_ports(
            "3",
            vec![ServicePort { port: 80, name: Some("web".into()), ..Default::default() }],
        ));
        assert_eq!(handler.classify(&remapped), EventImpact::Structural);

        // So does moving the port number.
        let moved = ObjectEvent::Upsert(service_with_ports(
            "4",
            vec![ServicePort { port: 8081, name: Some("http".into()), ..Default::default() }],
        ));
        assert_eq!(handler.classify(&moved), EventImpact::Structural);

        // Deletion alters route validity.
        assert_eq!(handler.classify(&ObjectEvent::Delete(service())), EventImpact::Structural);

        // A Service no cluster references stays structural (its appearance
        // may make dropped routes valid again).
        let unreferenced = ObjectEvent::Upsert(KubeObject::Service(Box::new(Service {
            metadata: meta("default", "svc-b", "1"),
            spec: Some(ServiceSpec::default()),
            ..Default::default()
        })));
        assert_eq!(handler.classify(&unreferenced), EventImpact::Structural);
    }

    #[tokio::test]
    async fn duplicate_events_cause_no_new_version() {
        let mut fixture = start_handler().await;

        fixture.tx.send(ObjectEvent::Upsert(service())).await.unwrap();
        fixture.tx.send(ObjectEvent::Upsert(ingress())).await.unwrap();
        settle().await;
        let version = fixture.xds.version_number();

        // Same resource versions: the cache reports no change and no build
        // or publish happens.
        fixture.tx.send(ObjectEvent::Upsert(service())).await.unwrap();
        fixture.tx.send(ObjectEvent::Upsert(ingress())).await.unwrap();
        settle().await;
        assert_eq!(fixture.xds.version_number(), version);

        let _ = fixture.status_rx.try_recv();
        fixture.token.cancel();
        fixture.handle.await.unwrap();
    }
}
