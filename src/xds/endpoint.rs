//! Endpoint set -> `ClusterLoadAssignment` conversion (EDS).
//!
//! Kept separate from cluster conversion so the endpoint-only fast path can
//! rebuild just this resource set.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{
    address, socket_address, Address, SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint as EnvoyEndpoint, LbEndpoint,
    LocalityLbEndpoints,
};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::dag::EndpointSet;
use crate::Result;

use super::resources::{BuiltResource, ENDPOINT_TYPE_URL};

/// Build the EDS resource set: one `ClusterLoadAssignment` per cluster, in
/// name order. Clusters with no ready endpoints still get an (empty)
/// assignment so Envoy treats them as drained rather than unknown.
pub fn endpoints_from_map(
    endpoints: &BTreeMap<String, EndpointSet>,
) -> Result<Vec<BuiltResource>> {
    endpoints
        .iter()
        .map(|(cluster_name, set)| build_load_assignment(cluster_name, set))
        .collect()
}

fn build_load_assignment(cluster_name: &str, set: &EndpointSet) -> Result<BuiltResource> {
    let lb_endpoints: Vec<LbEndpoint> = set
        .addresses
        .iter()
        .map(|endpoint| LbEndpoint {
            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(EnvoyEndpoint {
                address: Some(Address {
                    address: Some(address::Address::SocketAddress(SocketAddress {
                        address: endpoint.address.clone(),
                        port_specifier: Some(socket_address::PortSpecifier::PortValue(
                            endpoint.port.into(),
                        )),
                        ..Default::default()
                    })),
                }),
                ..Default::default()
            })),
            ..Default::default()
        })
        .collect();

    let assignment = ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: if lb_endpoints.is_empty() {
            Vec::new()
        } else {
            vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }]
        },
        ..Default::default()
    };

    Ok(BuiltResource {
        name: cluster_name.to_string(),
        resource: Any {
            type_url: ENDPOINT_TYPE_URL.to_string(),
            value: assignment.encode_to_vec(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Endpoint;

    #[test]
    fn load_assignment_round_trips() {
        let set = EndpointSet {
            addresses: vec![
                Endpoint { address: "10.0.0.1".into(), port: 8080 },
                Endpoint { address: "10.0.0.2".into(), port: 8080 },
            ],
        };
        let built = build_load_assignment("default/svc-a/80", &set).unwrap();
        let decoded = ClusterLoadAssignment::decode(&built.resource.value[..]).unwrap();
        assert_eq!(decoded.cluster_name, "default/svc-a/80");
        assert_eq!(decoded.endpoints[0].lb_endpoints.len(), 2);
    }

    #[test]
    fn empty_set_serialises_without_localities() {
        let built = build_load_assignment("default/svc-a/80", &EndpointSet::default()).unwrap();
        let decoded = ClusterLoadAssignment::decode(&built.resource.value[..]).unwrap();
        assert!(decoded.endpoints.is_empty());
    }

    #[test]
    fn output_is_byte_identical_for_equal_input() {
        let set = EndpointSet {
            addresses: vec![Endpoint { address: "10.0.0.1".into(), port: 8080 }],
        };
        let a = build_load_assignment("c", &set).unwrap();
        let b = build_load_assignment("c", &set).unwrap();
        assert_eq!(a.resource.value, b.resource.value);
    }
}
