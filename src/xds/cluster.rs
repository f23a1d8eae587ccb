//! DAG cluster -> Envoy `Cluster` conversion (CDS).
//!
//! Endpoints are deliberately absent: clusters use EDS so load assignments
//! can change without touching cluster configuration. Output is
//! deterministic; collections are emitted in name order.

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, DnsLookupFamily as EnvoyDnsLookupFamily, EdsClusterConfig,
    LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::{
    circuit_breakers, CircuitBreakers as EnvoyCircuitBreakers, Cluster as EnvoyCluster,
};
use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, health_check, AggregatedConfigSource, ConfigSource,
    HealthCheck, TransportSocket,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::{
    explicit_http_config, ExplicitHttpConfig, UpstreamProtocolOptions,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::HttpProtocolOptions;
use envoy_types::pb::google::protobuf::{Any, Duration, UInt32Value};
use prost::Message;

use crate::config::DnsLookupFamily;
use crate::dag::policy::LoadBalancerStrategy;
use crate::dag::{Cluster, UpstreamProtocol};
use crate::Result;

use super::resources::{BuiltResource, CLUSTER_TYPE_URL};

const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
const HTTP_PROTOCOL_OPTIONS: &str =
    "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

/// Build the CDS resource set from the DAG clusters, name-sorted.
pub fn clusters_from_dag(dag: &crate::dag::Dag) -> Result<Vec<BuiltResource>> {
    dag.clusters.values().map(build_cluster).collect()
}

fn build_cluster(cluster: &Cluster) -> Result<BuiltResource> {
    let mut envoy_cluster = EnvoyCluster {
        name: cluster.name.clone(),
        connect_timeout: Some(Duration { seconds: 2, nanos: 0 }),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
        eds_cluster_config: Some(EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            service_name: cluster.name.clone(),
        }),
        lb_policy: lb_policy(cluster.lb_strategy) as i32,
        dns_lookup_family: dns_lookup_family(cluster.dns_lookup_family) as i32,
        ..Default::default()
    };

    if let Some(breakers) = circuit_breakers(&cluster.circuit_breakers) {
        envoy_cluster.circuit_breakers = Some(breakers);
    }

    if let Some(policy) = &cluster.health_check {
        envoy_cluster.health_checks = vec![HealthCheck {
            timeout: Some(Duration {
                seconds: policy.timeout.as_secs() as i64,
                nanos: policy.timeout.subsec_nanos() as i32,
            }),
            interval: Some(Duration {
                seconds: policy.interval.as_secs() as i64,
                nanos: policy.interval.subsec_nanos() as i32,
            }),
            unhealthy_threshold: Some(UInt32Value { value: policy.unhealthy_threshold }),
            healthy_threshold: Some(UInt32Value { value: policy.healthy_threshold }),
            health_checker: Some(health_check::HealthChecker::HttpHealthCheck(
                health_check::HttpHealthCheck {
                    host: policy.host.clone().unwrap_or_default(),
                    path: policy.path.clone(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }];
    }

    match cluster.protocol {
        UpstreamProtocol::H2 | UpstreamProtocol::H2c => {
            envoy_cluster.typed_extension_protocol_options.insert(
                HTTP_PROTOCOL_OPTIONS.to_string(),
                http2_protocol_options(),
            );
        }
        UpstreamProtocol::Http1 | UpstreamProtocol::Tls => {}
    }

    if matches!(cluster.protocol, UpstreamProtocol::Tls | UpstreamProtocol::H2) {
        let sni = cluster
            .upstream_tls
            .as_ref()
            .and_then(|tls| tls.sni.clone())
            .unwrap_or_default();
        let tls_context = UpstreamTlsContext {
            common_tls_context: Some(CommonTlsContext::default()),
            sni,
            ..Default::default()
        };
        envoy_cluster.transport_socket = Some(TransportSocket {
            name: TLS_TRANSPORT_SOCKET.to_string(),
            config_type: Some(
                envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType::TypedConfig(
                    Any {
                        type_url:
                            "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext"
                                .to_string(),
                        value: tls_context.encode_to_vec(),
                    },
                ),
            ),
        });
    }

    Ok(BuiltResource {
        name: cluster.name.clone(),
        resource: Any {
            type_url: CLUSTER_TYPE_URL.to_string(),
            value: envoy_cluster.encode_to_vec(),
        },
    })
}

pub(super) fn ads_config_source() -> ConfigSource {
    ConfigSource {
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(
            AggregatedConfigSource::default(),
        )),
        ..Default::default()
    }
}

fn lb_policy(strategy: LoadBalancerStrategy) -> LbPolicy {
    match strategy {
        LoadBalancerStrategy::RoundRobin => LbPolicy::RoundRobin,
        LoadBalancerStrategy::WeightedLeastRequest => LbPolicy::LeastRequest,
        LoadBalancerStrategy::Random => LbPolicy::Random,
        // Request-hash strategies use the ring hash with route-level hash
        // policies selecting the input.
        LoadBalancerStrategy::RequestHash | LoadBalancerStrategy::Cookie => LbPolicy::RingHash,
    }
}

fn dns_lookup_family(family: DnsLookupFamily) -> EnvoyDnsLookupFamily {
    match family {
        DnsLookupFamily::Auto => EnvoyDnsLookupFamily::Auto,
        DnsLookupFamily::V4 => EnvoyDnsLookupFamily::V4Only,
        DnsLookupFamily::V6 => EnvoyDnsLookupFamily::V6Only,
    }
}

fn circuit_breakers(
    breakers: &crate::dag::policy::CircuitBreakers,
) -> Option<EnvoyCircuitBreakers> {
    if breakers.max_connections == 0
        && breakers.max_pending_requests == 0
        && breakers.max_requests == 0
        && breakers.max_retries == 0
    {
        return None;
    }
    let value = |v: u32| (v > 0).then_some(UInt32Value { value: v });
    Some(EnvoyCircuitBreakers {
        thresholds: vec![circuit_breakers::Thresholds {
            max_connections: value(breakers.max_connections),
            max_pending_requests: value(breakers.max_pending_requests),
            max_requests: value(breakers.max_requests),
            max_retries: value(breakers.max_retries),
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn http2_protocol_options() -> Any {
    let options = HttpProtocolOptions {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(explicit_http_config::ProtocolConfig::Http2ProtocolOptions(
                    Default::default(),
                )),
            },
        )),
        ..Default::default()
    };
    Any {
        type_url: format!("type.googleapis.com/{}", HTTP_PROTOCOL_OPTIONS),
        value: options.encode_to_vec(),
    }
}
