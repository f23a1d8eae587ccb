//! Endpoint resolution, kept apart from cluster construction so an
//! EndpointSlice change can refresh EDS without a DAG rebuild.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;

use crate::k8s::CacheSnapshot;

use super::{Cluster, Endpoint, EndpointSet};

/// Resolve endpoint sets for every cluster in the map.
pub fn resolve_all(
    clusters: &BTreeMap<String, Cluster>,
    cache: &CacheSnapshot,
) -> BTreeMap<String, EndpointSet> {
    clusters
        .iter()
        .map(|(name, cluster)| (name.clone(), resolve_cluster(cluster, cache)))
        .collect()
}

/// Resolve the ready addresses backing one cluster. A missing Service or an
/// unmatched port yields an empty set; the cluster still exists so Envoy can
/// report it rather than 404 on the route.
pub fn resolve_cluster(cluster: &Cluster, cache: &CacheSnapshot) -> EndpointSet {
    let Some(service) = cache.services.get(&cluster.service) else {
        return EndpointSet::default();
    };

    let Some(port_name) = service_port_name(service, cluster.port) else {
        return EndpointSet::default();
    };

    let mut addresses = Vec::new();
    for slice in cache.slices_for_service(&cluster.service) {
        // The slice port matching the service port's name carries the
        // concrete endpoint port number.
        let Some(endpoint_port) = slice
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|p| p.name.as_deref().unwrap_or_default() == port_name)
            .and_then(|p| p.port)
        else {
            continue;
        };

        for endpoint in &slice.endpoints {
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            if !ready {
                continue;
            }
            for address in &endpoint.addresses {
                addresses.push(Endpoint { address: address.clone(), port: endpoint_port as u16 });
            }
        }
    }

    addresses.sort();
    addresses.dedup();
    EndpointSet { addresses }
}

/// Name of the service port with the given number; `Some("")` for an unnamed
/// (single-port) service.
fn service_port_name(service: &Service, port: u16) -> Option<String> {
    service
        .spec
        .as_ref()?
        .ports
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|p| p.port == i32::from(port))
        .map(|p| p.name.clone().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsLookupFamily;
    use crate::dag::policy::{CircuitBreakers, LoadBalancerStrategy};
    use crate::dag::UpstreamProtocol;
    use crate::k8s::ObjectRef;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::api::discovery::v1::{
        Endpoint as SliceEndpoint, EndpointConditions, EndpointPort, EndpointSlice,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn cluster() -> Cluster {
        Cluster {
            name: "default/svc-a/80".into(),
            service: ObjectRef::new("default", "svc-a"),
            port: 80,
            protocol: UpstreamProtocol::Http1,
            lb_strategy: LoadBalancerStrategy::RoundRobin,
            health_check: None,
            upstream_tls: None,
            circuit_breakers: CircuitBreakers::default(),
            dns_lookup_family: DnsLookupFamily::Auto,
        }
    }

    fn snapshot_with_endpoints(addresses: &[&str], ready: &[bool]) -> CacheSnapshot {
        let mut cache = CacheSnapshot::default();
        let svc_ref = ObjectRef::new("default", "svc-a");

        cache.services.insert(
            svc_ref.clone(),
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

        let slice_ref = ObjectRef::new("default", "svc-a-x9k2p");
        cache.endpoint_slices.insert(
            slice_ref.clone(),
            Arc::new(EndpointSlice {
                metadata: ObjectMeta {
                    namespace: Some("default".into()),
                    name: Some("svc-a-x9k2p".into()),
                    ..Default::default()
                },
                address_type: "IPv4".into(),
                endpoints: addresses
                    .iter()
                    .zip(ready)
                    .map(|(addr, ready)| SliceEndpoint {
                        addresses: vec![addr.to_string()],
                        conditions: Some(EndpointConditions {
                            ready: Some(*ready),
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
            .entry(svc_ref)
            .or_default()
            .insert(slice_ref);
        cache
    }

    #[test]
    fn resolves_ready_addresses_sorted() {
        let cache = snapshot_with_endpoints(&["10.0.0.2", "10.0.0.1"], &[true, true]);
        let set = resolve_cluster(&cluster(), &cache);
        assert_eq!(
            set.addresses,
            vec![
                Endpoint { address: "10.0.0.1".into(), port: 8080 },
                Endpoint { address: "10.0.0.2".into(), port: 8080 },
            ]
        );
    }

    #[test]
    fn not_ready_endpoints_are_skipped() {
        let cache = snapshot_with_endpoints(&["10.0.0.1", "10.0.0.2"], &[true, false]);
        let set = resolve_cluster(&cluster(), &cache);
        assert_eq!(set.addresses.len(), 1);
        assert_eq!(set.addresses[0].address, "10.0.0.1");
    }

    #[test]
    fn missing_service_yields_empty_set() {
        let cache = CacheSnapshot::default();
        let set = resolve_cluster(&cluster(), &cache);
        assert!(set.addresses.is_empty());
    }

    #[test]
    fn unmatched_service_port_yields_empty_set() {
        let cache = snapshot_with_endpoints(&["10.0.0.1"], &[true]);
        let mut cluster = cluster();
        cluster.port = 9999;
        let set = resolve_cluster(&cluster, &cache);
        assert!(set.addresses.is_empty());
    }
}
