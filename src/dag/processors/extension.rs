//! ExtensionService processing: auth and rate-limit gRPC sidecars become
//! reserved clusters other configuration can reference but routes never
//! select directly.

use crate::dag::builder::{DagBuilderState, Processor};
use crate::dag::policy::{CircuitBreakers, LoadBalancerStrategy};
use crate::dag::status::StatusCondition;
use crate::dag::{Cluster, UpstreamProtocol};
use crate::errors::InvalidReason;
use crate::k8s::{CacheSnapshot, ObjectKind, ObjectRef};

/// Name for the reserved cluster backing an ExtensionService.
pub fn extension_cluster_name(extension: &ObjectRef) -> String {
    format!("extension/{}/{}", extension.namespace, extension.name)
}

pub struct ExtensionServiceProcessor;

impl Processor for ExtensionServiceProcessor {
    fn process(&mut self, cache: &CacheSnapshot, dag: &mut DagBuilderState) {
        for (key, extension) in &cache.extension_services {
            let generation = extension.metadata.generation;

            let Some(target) = extension.spec.services.first() else {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::ExtensionService,
                    key,
                    InvalidReason::ServiceNotFound,
                    "spec.services must name at least one service",
                    generation,
                ));
                continue;
            };

            let service = ObjectRef::new(key.namespace.clone(), target.name.clone());
            if !cache.services.contains_key(&service) {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::ExtensionService,
                    key,
                    InvalidReason::ServiceUnresolved,
                    format!("service '{}' not found", service),
                    generation,
                ));
                continue;
            }

            let lb_strategy =
                LoadBalancerStrategy::parse(extension.spec.load_balancer_policy.as_ref());

            // Extension protocols are gRPC; the cluster always speaks h2c to
            // the sidecar.
            dag.register_cluster(Cluster {
                name: extension_cluster_name(key),
                service,
                port: target.port,
                protocol: UpstreamProtocol::H2c,
                lb_strategy,
                health_check: None,
                upstream_tls: None,
                circuit_breakers: CircuitBreakers::default(),
                dns_lookup_family: dag.config.dns_lookup_family,
            });

            dag.conditions.push(StatusCondition::valid(
                ObjectKind::ExtensionService,
                key,
                generation,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::BuildConfig;
    use crate::k8s::apis::{ExtensionService, ExtensionServiceSpec, ExtensionTarget};
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn extension(namespace: &str, name: &str, target: &str) -> ExtensionService {
        ExtensionService {
            metadata: ObjectMeta {
                namespace: Some(namespace.into()),
                name: Some(name.into()),
                generation: Some(1),
                ..Default::default()
            },
            spec: ExtensionServiceSpec {
                services: vec![ExtensionTarget { name: target.into(), port: 8081, weight: None }],
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn registers_reserved_h2c_cluster() {
        let mut cache = CacheSnapshot::default();
        let key = ObjectRef::new("auth", "oidc");
        cache.extension_services.insert(key.clone(), Arc::new(extension("auth", "oidc", "oidc-svc")));
        cache
            .services
            .insert(ObjectRef::new("auth", "oidc-svc"), Arc::new(Service::default()));

        let mut state = DagBuilderState::new(BuildConfig::default());
        ExtensionServiceProcessor.process(&cache, &mut state);

        let cluster = state.clusters.get("extension/auth/oidc").expect("cluster registered");
        assert_eq!(cluster.protocol, UpstreamProtocol::H2c);
        assert_eq!(cluster.port, 8081);
        assert!(state.conditions.iter().any(|c| c.is_valid()));
    }

    #[test]
    fn missing_backing_service_is_unresolved() {
        let mut cache = CacheSnapshot::default();
        let key = ObjectRef::new("auth", "oidc");
        cache.extension_services.insert(key.clone(), Arc::new(extension("auth", "oidc", "gone")));

        let mut state = DagBuilderState::new(BuildConfig::default());
        ExtensionServiceProcessor.process(&cache, &mut state);

        assert!(state.clusters.is_empty());
        assert!(state.has_invalid_condition(ObjectKind::ExtensionService, &key));
    }
}
