//! DAG virtual hosts -> Envoy `RouteConfiguration` conversion (RDS).
//!
//! Three route tables are produced: `ingress_http` for the plain listener,
//! `ingress_https` for terminated-TLS hosts, and `ingress_fallbackcert` for
//! the hosts that opted into the fallback certificate. Route order inside a
//! virtual host is the DAG's; the builder already sorted by specificity.

use envoy_types::pb::envoy::config::core::v3::{
    header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption,
};
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, query_parameter_matcher::QueryParameterMatchSpecifier,
    redirect_action, route::Action, route_action, route_match::PathSpecifier, weighted_cluster,
    HeaderMatcher, QueryParameterMatcher, RedirectAction, RetryPolicy as EnvoyRetryPolicy,
    Route as EnvoyRoute, RouteAction as EnvoyRouteAction, RouteConfiguration, RouteMatch,
    VirtualHost as EnvoyVirtualHost, WeightedCluster,
};
use envoy_types::pb::envoy::config::route::v3::DirectResponseAction;
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher,
};
use envoy_types::pb::google::protobuf::{Any, BoolValue, Duration as PbDuration, UInt32Value};
use prost::Message;

use crate::config::settings::ConfiguredTimeout;
use crate::dag::policy::HashPolicy;
use crate::dag::{
    Dag, HeaderMatch, HeaderMatchKind, Listener, ListenerProtocol, PathMatch, Route, RouteAction,
    VirtualHost,
};
use crate::Result;

use super::resources::{BuiltResource, ROUTE_TYPE_URL};

pub const HTTP_ROUTE_CONFIG: &str = "ingress_http";
pub const HTTPS_ROUTE_CONFIG: &str = "ingress_https";
pub const FALLBACK_ROUTE_CONFIG: &str = "ingress_fallbackcert";

/// Build the RDS resource set from the DAG listeners.
pub fn routes_from_dag(dag: &Dag) -> Result<Vec<BuiltResource>> {
    let mut built = Vec::new();
    for listener in &dag.listeners {
        match listener.protocol {
            ListenerProtocol::Http => {
                built.push(route_configuration(HTTP_ROUTE_CONFIG, listener, false)?);
            }
            ListenerProtocol::Https => {
                built.push(route_configuration(HTTPS_ROUTE_CONFIG, listener, false)?);
                if listener.virtual_hosts.iter().any(|vh| vh.fallback_certificate) {
                    built.push(route_configuration(FALLBACK_ROUTE_CONFIG, listener, true)?);
                }
            }
            ListenerProtocol::TlsPassthrough | ListenerProtocol::Tcp => {}
        }
    }
    Ok(built)
}

fn route_configuration(
    name: &str,
    listener: &Listener,
    fallback_only: bool,
) -> Result<BuiltResource> {
    let virtual_hosts: Vec<EnvoyVirtualHost> = listener
        .virtual_hosts
        .iter()
        .filter(|vh| !fallback_only || vh.fallback_certificate)
        .filter_map(build_virtual_host)
        .collect();

    let config = RouteConfiguration {
        name: name.to_string(),
        virtual_hosts,
        ..Default::default()
    };

    Ok(BuiltResource {
        name: name.to_string(),
        resource: Any { type_url: ROUTE_TYPE_URL.to_string(), value: config.encode_to_vec() },
    })
}

/// Virtual hosts whose routes are all TCP proxies live in filter chains,
/// not route tables.
fn build_virtual_host(vhost: &VirtualHost) -> Option<EnvoyVirtualHost> {
    let routes: Vec<EnvoyRoute> = vhost
        .routes
        .iter()
        .filter(|r| !matches!(r.action, RouteAction::TcpProxy { .. }))
        .map(build_route)
        .collect();
    if routes.is_empty() {
        return None;
    }
    Some(EnvoyVirtualHost {
        name: vhost.fqdn.clone(),
        domains: vec![vhost.fqdn.clone()],
        routes,
        ..Default::default()
    })
}

fn build_route(route: &Route) -> EnvoyRoute {
    EnvoyRoute {
        name: route.name.clone(),
        r#match: Some(build_match(route)),
        action: Some(build_action(route)),
        request_headers_to_add: header_options(&route.request_headers.set),
        request_headers_to_remove: route.request_headers.remove.clone(),
        response_headers_to_add: header_options(&route.response_headers.set),
        response_headers_to_remove: route.response_headers.remove.clone(),
        ..Default::default()
    }
}

fn build_match(route: &Route) -> RouteMatch {
    let path_specifier = match &route.match_.path {
        PathMatch::Exact(path) => PathSpecifier::Path(path.clone()),
        PathMatch::Regex(regex) => PathSpecifier::SafeRegex(RegexMatcher {
            regex: regex.clone(),
            ..Default::default()
        }),
        PathMatch::Prefix(prefix) => {
            if prefix == "/" {
                PathSpecifier::Prefix("/".to_string())
            } else {
                // Segment-prefix semantics; Envoy requires no trailing
                // slash on the separated prefix.
                PathSpecifier::PathSeparatedPrefix(prefix.trim_end_matches('/').to_string())
            }
        }
    };

    let mut headers: Vec<HeaderMatcher> =
        route.match_.headers.iter().map(build_header_matcher).collect();
    if let Some(method) = &route.match_.method {
        headers.push(HeaderMatcher {
            name: ":method".to_string(),
            header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(exact_matcher(
                method.clone(),
            ))),
            ..Default::default()
        });
    }

    RouteMatch {
        path_specifier: Some(path_specifier),
        headers,
        query_parameters: route
            .match_
            .query_parameters
            .iter()
            .map(|q| QueryParameterMatcher {
                name: q.name.clone(),
                query_parameter_match_specifier: Some(match &q.value {
                    Some(value) => {
                        QueryParameterMatchSpecifier::StringMatch(exact_matcher(value.clone()))
                    }
                    None => QueryParameterMatchSpecifier::PresentMatch(true),
                }),
            })
            .collect(),
        ..Default::default()
    }
}

fn build_header_matcher(header: &HeaderMatch) -> HeaderMatcher {
    let specifier = match &header.kind {
        HeaderMatchKind::Exact(value) => {
            HeaderMatchSpecifier::StringMatch(exact_matcher(value.clone()))
        }
        HeaderMatchKind::Contains(value) => HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(MatchPattern::Contains(value.clone())),
            ..Default::default()
        }),
        HeaderMatchKind::Regex(value) => HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(MatchPattern::SafeRegex(RegexMatcher {
                regex: value.clone(),
                ..Default::default()
            })),
            ..Default::default()
        }),
        HeaderMatchKind::Present => HeaderMatchSpecifier::PresentMatch(true),
    };
    HeaderMatcher {
        name: header.name.clone(),
        invert_match: header.invert,
        header_match_specifier: Some(specifier),
        ..Default::default()
    }
}

fn exact_matcher(value: String) -> StringMatcher {
    StringMatcher { match_pattern: Some(MatchPattern::Exact(value)), ..Default::default() }
}

#[allow(deprecated)]
fn build_action(route: &Route) -> Action {
    match &route.action {
        RouteAction::Forward { clusters, mirror, hash_policies } => {
            let mut action = EnvoyRouteAction {
                cluster_specifier: Some(if clusters.len() == 1 {
                    route_action::ClusterSpecifier::Cluster(clusters[0].name.clone())
                } else {
                    route_action::ClusterSpecifier::WeightedClusters(WeightedCluster {
                        clusters: clusters
                            .iter()
                            .map(|c| weighted_cluster::ClusterWeight {
                                name: c.name.clone(),
                                weight: Some(UInt32Value { value: c.weight }),
                                ..Default::default()
                            })
                            .collect(),
                        ..Default::default()
                    })
                }),
                ..Default::default()
            };

            if let Some(timeout) = envoy_duration(route.timeouts.response) {
                action.timeout = Some(timeout);
            }
            if let Some(idle) = envoy_duration(route.timeouts.idle) {
                action.idle_timeout = Some(idle);
            }

            if let Some(mirror) = mirror {
                action.request_mirror_policies = vec![route_action::RequestMirrorPolicy {
                    cluster: mirror.clone(),
                    ..Default::default()
                }];
            }

            if let Some(retry) = &route.retry {
                let mut retry_on = vec!["5xx".to_string()];
                if !retry.retriable_status_codes.is_empty() {
                    retry_on.push("retriable-status-codes".to_string());
                }
                action.retry_policy = Some(EnvoyRetryPolicy {
                    retry_on: retry_on.join(","),
                    num_retries: Some(UInt32Value { value: retry.count }),
                    per_try_timeout: retry.per_try_timeout.map(|d| PbDuration {
                        seconds: d.as_secs() as i64,
                        nanos: d.subsec_nanos() as i32,
                    }),
                    retriable_status_codes: retry.retriable_status_codes.clone(),
                    ..Default::default()
                });
            }

            action.hash_policy = hash_policies.iter().map(build_hash_policy).collect();

            if route.websocket {
                action.upgrade_configs = vec![route_action::UpgradeConfig {
                    upgrade_type: "websocket".to_string(),
                    enabled: Some(BoolValue { value: true }),
                    ..Default::default()
                }];
            }

            Action::Route(action)
        }
        RouteAction::Redirect { hostname, path, scheme, port, status_code } => {
            let mut redirect = RedirectAction {
                response_code: redirect_response_code(*status_code) as i32,
                ..Default::default()
            };
            if let Some(hostname) = hostname {
                redirect.host_redirect = hostname.clone();
            }
            if let Some(port) = port {
                redirect.port_redirect = u32::from(*port);
            }
            if let Some(scheme) = scheme {
                redirect.scheme_rewrite_specifier =
                    Some(redirect_action::SchemeRewriteSpecifier::SchemeRedirect(scheme.clone()));
            }
            if let Some(path) = path {
                redirect.path_rewrite_specifier =
                    Some(redirect_action::PathRewriteSpecifier::PathRedirect(path.clone()));
            }
            Action::Redirect(redirect)
        }
        RouteAction::DirectResponse { status, body } => {
            let mut direct = DirectResponseAction {
                status: u32::from(*status),
                ..Default::default()
            };
            if !body.is_empty() {
                direct.body = Some(envoy_types::pb::envoy::config::core::v3::DataSource {
                    specifier: Some(
                        envoy_types::pb::envoy::config::core::v3::data_source::Specifier::InlineString(
                            body.clone(),
                        ),
                    ),
                    ..Default::default()
                });
            }
            Action::DirectResponse(direct)
        }
        // Filter-chain concern; kept out of route tables by the caller.
        RouteAction::TcpProxy { .. } => unreachable!("tcp proxy routes are not route-table routes"),
    }
}

fn build_hash_policy(policy: &HashPolicy) -> route_action::HashPolicy {
    route_action::HashPolicy {
        policy_specifier: Some(route_action::hash_policy::PolicySpecifier::Header(
            route_action::hash_policy::Header {
                header_name: policy.header_name.clone(),
                ..Default::default()
            },
        )),
        terminal: policy.terminal,
    }
}

fn redirect_response_code(status_code: u16) -> redirect_action::RedirectResponseCode {
    match status_code {
        301 => redirect_action::RedirectResponseCode::MovedPermanently,
        308 => redirect_action::RedirectResponseCode::PermanentRedirect,
        303 => redirect_action::RedirectResponseCode::SeeOther,
        307 => redirect_action::RedirectResponseCode::TemporaryRedirect,
        _ => redirect_action::RedirectResponseCode::Found,
    }
}

fn header_options(set: &[(String, String)]) -> Vec<HeaderValueOption> {
    set.iter()
        .map(|(key, value)| HeaderValueOption {
            header: Some(HeaderValue {
                key: key.clone(),
                value: value.clone(),
                ..Default::default()
            }),
            append_action: HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
            ..Default::default()
        })
        .collect()
}

pub(super) fn envoy_duration(timeout: ConfiguredTimeout) -> Option<PbDuration> {
    timeout.as_envoy_duration().map(|d| PbDuration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    })
}
