//! DAG listener -> Envoy `Listener` conversion (LDS).
//!
//! The HTTP listener is one HTTP connection manager over RDS. The HTTPS
//! listener is one filter chain per virtual host, matched on SNI:
//! terminated hosts get a downstream TLS context over SDS, passthrough
//! hosts get a raw TCP proxy, and fallback-certificate hosts share an extra
//! chain with no SNI match.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::accesslog::v3::{access_log, AccessLog};
use envoy_types::pb::envoy::config::core::v3::{
    address, socket_address, transport_socket, Address, DataSource, HttpProtocolOptions,
    SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::core::v3::{
    data_source, substitution_format_string, SubstitutionFormatString,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType, listener_filter::ConfigType as ListenerFilterConfigType,
    Filter, FilterChain, FilterChainMatch, Listener as EnvoyListener, ListenerFilter,
};
use envoy_types::pb::envoy::config::ratelimit::v3::RateLimitServiceConfig;
use envoy_types::pb::envoy::extensions::access_loggers::stream::v3::{
    stdout_access_log, StdoutAccessLog,
};
use envoy_types::pb::envoy::extensions::filters::http::ratelimit::v3::RateLimit;
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, http_filter, HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy, TcpProxy,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context, tls_parameters, CommonTlsContext, DownstreamTlsContext,
    SdsSecretConfig, TlsParameters,
};
use envoy_types::pb::envoy::config::core::v3::grpc_service::{EnvoyGrpc, TargetSpecifier};
use envoy_types::pb::envoy::config::core::v3::{ApiVersion, GrpcService};
use envoy_types::pb::google::protobuf::{value, Any, BoolValue, Struct, Value};
use prost::Message;

use crate::config::settings::ParsedTimeouts;
use crate::config::{AccessLogConfig, AccessLogFormat, AppConfig, HttpVersion};
use crate::dag::{Dag, Listener, ListenerProtocol, RouteAction, TlsVersion, VirtualHost};
use crate::Result;

use super::cluster::ads_config_source;
use super::resources::{BuiltResource, LISTENER_TYPE_URL};
use super::route::{envoy_duration, FALLBACK_ROUTE_CONFIG, HTTPS_ROUTE_CONFIG, HTTP_ROUTE_CONFIG};

const HCM_FILTER: &str = "envoy.filters.network.http_connection_manager";
const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const RATELIMIT_FILTER: &str = "envoy.filters.http.ratelimit";
const RATELIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ratelimit.v3.RateLimit";
const TCP_PROXY_FILTER: &str = "envoy.filters.network.tcp_proxy";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const TLS_INSPECTOR_FILTER: &str = "envoy.filters.listener.tls_inspector";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
const DOWNSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
const STDOUT_LOGGER: &str = "envoy.access_loggers.stdout";
const STDOUT_LOGGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.stream.v3.StdoutAccessLog";

/// JSON access-log fields and their Envoy operators. The configured field
/// list selects a subset; unknown names are skipped.
const JSON_FIELDS: &[(&str, &str)] = &[
    ("@timestamp", "%START_TIME%"),
    ("authority", "%REQ(:AUTHORITY)%"),
    ("bytes_received", "%BYTES_RECEIVED%"),
    ("bytes_sent", "%BYTES_SENT%"),
    ("downstream_remote_address", "%DOWNSTREAM_REMOTE_ADDRESS%"),
    ("duration", "%DURATION%"),
    ("method", "%REQ(:METHOD)%"),
    ("path", "%REQ(X-ENVOY-ORIGINAL-PATH?:PATH)%"),
    ("protocol", "%PROTOCOL%"),
    ("request_id", "%REQ(X-REQUEST-ID)%"),
    ("response_code", "%RESPONSE_CODE%"),
    ("response_flags", "%RESPONSE_FLAGS%"),
    ("upstream_cluster", "%UPSTREAM_CLUSTER%"),
    ("upstream_host", "%UPSTREAM_HOST%"),
    ("user_agent", "%REQ(USER-AGENT)%"),
    ("x_forwarded_for", "%REQ(X-FORWARDED-FOR)%"),
];

/// Conversion inputs that come from configuration rather than the DAG.
#[derive(Debug, Clone)]
pub struct ListenerConversionConfig {
    pub http_versions: Vec<HttpVersion>,
    pub timeouts: ParsedTimeouts,
    pub access_log: AccessLogConfig,
    /// (extension cluster name, domain, fail-open) for the global rate
    /// limit filter.
    pub rate_limit: Option<(String, String, bool)>,
    /// DAG secret name of the configured fallback certificate.
    pub fallback_secret: Option<String>,
}

impl ListenerConversionConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            http_versions: config.default_http_versions.clone(),
            timeouts: config.timeouts.parse_all()?,
            access_log: config.access_log.clone(),
            rate_limit: config.rate_limit_service.as_ref().map(|r| {
                let extension = crate::k8s::ObjectRef::parse(&r.extension_service, "default");
                (
                    crate::dag::processors::extension_cluster_name(&extension),
                    r.domain.clone(),
                    r.fail_open,
                )
            }),
            fallback_secret: config
                .ingress
                .fallback_certificate
                .as_ref()
                .map(|f| format!("{}/{}", f.namespace, f.name)),
        })
    }
}

/// Build the LDS resource set from the DAG listeners.
pub fn listeners_from_dag(
    dag: &Dag,
    config: &ListenerConversionConfig,
) -> Result<Vec<BuiltResource>> {
    dag.listeners
        .iter()
        .map(|listener| match listener.protocol {
            ListenerProtocol::Http => build_http_listener(listener, config),
            _ => build_https_listener(dag, listener, config),
        })
        .collect()
}

fn build_http_listener(
    listener: &Listener,
    config: &ListenerConversionConfig,
) -> Result<BuiltResource> {
    let envoy_listener = EnvoyListener {
        name: listener.name.clone(),
        address: Some(socket_address_of(listener)),
        filter_chains: vec![FilterChain {
            filters: vec![hcm_filter(&listener.name, HTTP_ROUTE_CONFIG, config)],
            ..Default::default()
        }],
        ..Default::default()
    };
    encode_listener(listener, envoy_listener)
}

fn build_https_listener(
    dag: &Dag,
    listener: &Listener,
    config: &ListenerConversionConfig,
) -> Result<BuiltResource> {
    let mut filter_chains = Vec::new();

    for vhost in &listener.virtual_hosts {
        let tcp_clusters = tcp_proxy_clusters(vhost);
        match (&vhost.tls, tcp_clusters) {
            // Terminated TLS serving HTTP.
            (Some(tls), None) => {
                filter_chains.push(FilterChain {
                    filter_chain_match: Some(FilterChainMatch {
                        server_names: vec![vhost.fqdn.clone()],
                        ..Default::default()
                    }),
                    transport_socket: Some(downstream_tls_socket(
                        &tls.secret,
                        tls.min_protocol_version,
                        &tls.cipher_suites,
                        &tls.alpn,
                        tls.client_validation.as_deref(),
                    )),
                    filters: vec![hcm_filter(&listener.name, HTTPS_ROUTE_CONFIG, config)],
                    ..Default::default()
                });
            }
            // Terminated TLS in front of a TCP proxy.
            (Some(tls), Some(clusters)) => {
                filter_chains.push(FilterChain {
                    filter_chain_match: Some(FilterChainMatch {
                        server_names: vec![vhost.fqdn.clone()],
                        ..Default::default()
                    }),
                    transport_socket: Some(downstream_tls_socket(
                        &tls.secret,
                        tls.min_protocol_version,
                        &tls.cipher_suites,
                        &tls.alpn,
                        tls.client_validation.as_deref(),
                    )),
                    filters: vec![tcp_proxy_filter(&vhost.fqdn, clusters)],
                    ..Default::default()
                });
            }
            // TLS passthrough: SNI match, no termination.
            (None, Some(clusters)) => {
                filter_chains.push(FilterChain {
                    filter_chain_match: Some(FilterChainMatch {
                        server_names: vec![vhost.fqdn.clone()],
                        transport_protocol: "tls".to_string(),
                        ..Default::default()
                    }),
                    filters: vec![tcp_proxy_filter(&vhost.fqdn, clusters)],
                    ..Default::default()
                });
            }
            (None, None) => {}
        }
    }

    // One shared chain answers clients that present no SNI, serving the
    // hosts that opted into the fallback certificate.
    if listener.virtual_hosts.iter().any(|vh| vh.fallback_certificate) {
        if let Some(fallback_secret) = config
            .fallback_secret
            .as_ref()
            .filter(|name| dag.secrets.contains_key(*name))
        {
            filter_chains.push(FilterChain {
                filter_chain_match: Some(FilterChainMatch {
                    transport_protocol: "tls".to_string(),
                    ..Default::default()
                }),
                transport_socket: Some(downstream_tls_socket(
                    fallback_secret,
                    TlsVersion::V1_2,
                    &[],
                    &["h2".to_string(), "http/1.1".to_string()],
                    None,
                )),
                filters: vec![hcm_filter(&listener.name, FALLBACK_ROUTE_CONFIG, config)],
                ..Default::default()
            });
        }
    }

    let envoy_listener = EnvoyListener {
        name: listener.name.clone(),
        address: Some(socket_address_of(listener)),
        listener_filters: vec![ListenerFilter {
            name: TLS_INSPECTOR_FILTER.to_string(),
            config_type: Some(ListenerFilterConfigType::TypedConfig(Any {
                type_url: TLS_INSPECTOR_TYPE_URL.to_string(),
                value: TlsInspector::default().encode_to_vec(),
            })),
            ..Default::default()
        }],
        filter_chains,
        ..Default::default()
    };
    encode_listener(listener, envoy_listener)
}

fn encode_listener(listener: &Listener, envoy_listener: EnvoyListener) -> Result<BuiltResource> {
    Ok(BuiltResource {
        name: listener.name.clone(),
        resource: Any {
            type_url: LISTENER_TYPE_URL.to_string(),
            value: envoy_listener.encode_to_vec(),
        },
    })
}

fn socket_address_of(listener: &Listener) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: listener.address.clone(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(listener.port.into())),
            ..Default::default()
        })),
    }
}

/// Weighted clusters of the first TCP-proxy route of the virtual host.
fn tcp_proxy_clusters(vhost: &VirtualHost) -> Option<Vec<crate::dag::WeightedCluster>> {
    vhost.routes.iter().find_map(|route| match &route.action {
        RouteAction::TcpProxy { clusters } => Some(clusters.clone()),
        _ => None,
    })
}

fn tcp_proxy_filter(fqdn: &str, clusters: Vec<crate::dag::WeightedCluster>) -> Filter {
    let cluster_specifier = if clusters.len() == 1 {
        tcp_proxy::ClusterSpecifier::Cluster(clusters[0].name.clone())
    } else {
        tcp_proxy::ClusterSpecifier::WeightedClusters(tcp_proxy::WeightedCluster {
            clusters: clusters
                .iter()
                .map(|c| tcp_proxy::weighted_cluster::ClusterWeight {
                    name: c.name.clone(),
                    weight: c.weight,
                    ..Default::default()
                })
                .collect(),
        })
    };

    let tcp_proxy = TcpProxy {
        stat_prefix: format!("tcp_{}", fqdn.replace('.', "_")),
        cluster_specifier: Some(cluster_specifier),
        ..Default::default()
    };

    Filter {
        name: TCP_PROXY_FILTER.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(Any {
            type_url: TCP_PROXY_TYPE_URL.to_string(),
            value: tcp_proxy.encode_to_vec(),
        })),
    }
}

fn hcm_filter(stat_prefix: &str, route_config: &str, config: &ListenerConversionConfig) -> Filter {
    let mut http_filters = Vec::new();

    if let Some((cluster, domain, fail_open)) = &config.rate_limit {
        let rate_limit = RateLimit {
            domain: domain.clone(),
            failure_mode_deny: !fail_open,
            rate_limit_service: Some(RateLimitServiceConfig {
                grpc_service: Some(GrpcService {
                    target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
                        cluster_name: cluster.clone(),
                        ..Default::default()
                    })),
                    ..Default::default()
                }),
                transport_api_version: ApiVersion::V3 as i32,
            }),
            ..Default::default()
        };
        http_filters.push(HttpFilter {
            name: RATELIMIT_FILTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(Any {
                type_url: RATELIMIT_TYPE_URL.to_string(),
                value: rate_limit.encode_to_vec(),
            })),
            ..Default::default()
        });
    }

    http_filters.push(HttpFilter {
        name: ROUTER_FILTER.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(Any {
            type_url: ROUTER_TYPE_URL.to_string(),
            value: Router::default().encode_to_vec(),
        })),
        ..Default::default()
    });

    let codec_type = match (
        config.http_versions.contains(&HttpVersion::Http1),
        config.http_versions.contains(&HttpVersion::Http2),
    ) {
        (true, false) => http_connection_manager::CodecType::Http1,
        (false, true) => http_connection_manager::CodecType::Http2,
        _ => http_connection_manager::CodecType::Auto,
    };

    let mut hcm = HttpConnectionManager {
        stat_prefix: stat_prefix.to_string(),
        codec_type: codec_type as i32,
        route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(ads_config_source()),
            route_config_name: route_config.to_string(),
        })),
        http_filters,
        access_log: vec![access_logger(&config.access_log)],
        ..Default::default()
    };

    let timeouts = &config.timeouts;
    if let Some(request) = envoy_duration(timeouts.request) {
        hcm.request_timeout = Some(request);
    }
    if let Some(stream_idle) = envoy_duration(timeouts.stream_idle) {
        hcm.stream_idle_timeout = Some(stream_idle);
    }
    if let Some(delayed_close) = envoy_duration(timeouts.delayed_close) {
        hcm.delayed_close_timeout = Some(delayed_close);
    }
    if let Some(drain) = envoy_duration(timeouts.connection_shutdown_grace_period) {
        hcm.drain_timeout = Some(drain);
    }
    let connection_idle = envoy_duration(timeouts.connection_idle);
    let max_connection = envoy_duration(timeouts.max_connection_duration);
    if connection_idle.is_some() || max_connection.is_some() {
        hcm.common_http_protocol_options = Some(HttpProtocolOptions {
            idle_timeout: connection_idle,
            max_connection_duration: max_connection,
            ..Default::default()
        });
    }

    Filter {
        name: HCM_FILTER.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(Any {
            type_url: HCM_TYPE_URL.to_string(),
            value: hcm.encode_to_vec(),
        })),
    }
}

fn downstream_tls_socket(
    secret: &str,
    min_version: TlsVersion,
    cipher_suites: &[String],
    alpn: &[String],
    client_ca_secret: Option<&str>,
) -> TransportSocket {
    let minimum = match min_version {
        TlsVersion::V1_2 => tls_parameters::TlsProtocol::TlSv12,
        TlsVersion::V1_3 => tls_parameters::TlsProtocol::TlSv13,
    };

    let mut common = CommonTlsContext {
        tls_params: Some(TlsParameters {
            tls_minimum_protocol_version: minimum as i32,
            tls_maximum_protocol_version: tls_parameters::TlsProtocol::TlSv13 as i32,
            // Cipher suite names pass through verbatim; Envoy owns their
            // validation.
            cipher_suites: cipher_suites.to_vec(),
            ..Default::default()
        }),
        tls_certificate_sds_secret_configs: vec![SdsSecretConfig {
            name: secret.to_string(),
            sds_config: Some(ads_config_source()),
        }],
        alpn_protocols: alpn.to_vec(),
        ..Default::default()
    };

    let mut require_client_certificate = None;
    if let Some(ca_secret) = client_ca_secret {
        common.validation_context_type = Some(
            common_tls_context::ValidationContextType::ValidationContextSdsSecretConfig(
                SdsSecretConfig {
                    name: ca_secret.to_string(),
                    sds_config: Some(ads_config_source()),
                },
            ),
        );
        require_client_certificate = Some(BoolValue { value: true });
    }

    let context = DownstreamTlsContext {
        common_tls_context: Some(common),
        require_client_certificate,
        ..Default::default()
    };

    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(Any {
            type_url: DOWNSTREAM_TLS_TYPE_URL.to_string(),
            value: context.encode_to_vec(),
        })),
    }
}

fn access_logger(config: &AccessLogConfig) -> AccessLog {
    let format = match config.format {
        AccessLogFormat::Envoy => config.format_string.as_ref().map(|format_string| {
            stdout_access_log::AccessLogFormat::LogFormat(SubstitutionFormatString {
                format: Some(substitution_format_string::Format::TextFormatSource(DataSource {
                    specifier: Some(data_source::Specifier::InlineString(format_string.clone())),
                    ..Default::default()
                })),
                ..Default::default()
            })
        }),
        AccessLogFormat::Json => {
            let selected: BTreeMap<String, String> = JSON_FIELDS
                .iter()
                .filter(|(name, _)| {
                    config.fields.is_empty() || config.fields.iter().any(|f| f == name)
                })
                .map(|(name, operator)| (name.to_string(), operator.to_string()))
                .collect();
            Some(stdout_access_log::AccessLogFormat::LogFormat(SubstitutionFormatString {
                format: Some(substitution_format_string::Format::JsonFormat(Struct {
                    fields: selected
                        .into_iter()
                        .map(|(name, operator)| {
                            (name, Value { kind: Some(value::Kind::StringValue(operator)) })
                        })
                        .collect(),
                })),
                ..Default::default()
            }))
        }
    };

    let logger = StdoutAccessLog { access_log_format: format };
    AccessLog {
        name: STDOUT_LOGGER.to_string(),
        config_type: Some(access_log::ConfigType::TypedConfig(Any {
            type_url: STDOUT_LOGGER_TYPE_URL.to_string(),
            value: logger.encode_to_vec(),
        })),
        ..Default::default()
    }
}
