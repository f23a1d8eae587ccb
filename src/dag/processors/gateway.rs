//! Gateway API processing: Gateways contribute virtual hosts and
//! HTTPRoute/TLSRoute/GRPCRoute objects bind to their listeners under the
//! attachment rules (section and hostname selection, namespace policy,
//! allowed route kinds). Cross-namespace backend references require a
//! ReferenceGrant; violations drop the backend.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::dag::builder::{Claim, DagBuilderState, ListenerSlot, Processor};
use crate::dag::policy::{
    effective_weights, CircuitBreakers, HeadersPolicy, LoadBalancerStrategy, TimeoutPolicy,
};
use crate::dag::status::StatusCondition;
use crate::dag::{
    cluster_name, fqdn_matches, tls, Cluster, HeaderMatch, HeaderMatchKind, PathMatch,
    QueryParameterMatch, Route, RouteAction, RouteMatch, TlsEnvelope, UpstreamProtocol,
    WeightedCluster,
};
use crate::errors::InvalidReason;
use crate::k8s::apis::{
    BackendRef, Gateway, GatewayListener, HTTPHeaderFilter, HTTPRouteRule, ParentReference,
};
use crate::k8s::{CacheSnapshot, ObjectKind, ObjectRef};

pub struct GatewayApiProcessor;

impl Processor for GatewayApiProcessor {
    fn process(&mut self, cache: &CacheSnapshot, dag: &mut DagBuilderState) {
        for (gateway_key, gateway) in &cache.gateways {
            for listener in &gateway.spec.listeners {
                match listener.protocol.as_str() {
                    "HTTP" => self.bind_http_routes(cache, dag, gateway_key, gateway, listener, false),
                    "HTTPS" => {
                        if self.terminate_listener_tls(gateway_key, listener) {
                            self.bind_http_routes(cache, dag, gateway_key, gateway, listener, true);
                            self.bind_grpc_routes(cache, dag, gateway_key, gateway, listener, true);
                        }
                    }
                    "TLS" => self.bind_tls_routes(cache, dag, gateway_key, gateway, listener),
                    other => {
                        debug!(gateway = %gateway_key, listener = %listener.name, protocol = %other,
                            "ignoring listener with unsupported protocol");
                    }
                }
                if listener.protocol == "HTTP" {
                    self.bind_grpc_routes(cache, dag, gateway_key, gateway, listener, false);
                }
            }
        }
    }
}

impl GatewayApiProcessor {
    /// Whether this HTTPS listener terminates TLS with certificate refs.
    /// Secrets are validated per bound hostname in `listener_secret`.
    fn terminate_listener_tls(&self, gateway_key: &ObjectRef, listener: &GatewayListener) -> bool {
        let Some(tls_config) = &listener.tls else {
            debug!(gateway = %gateway_key, listener = %listener.name,
                "HTTPS listener without TLS configuration");
            return false;
        };
        if tls_config.mode.as_deref() == Some("Passthrough") {
            return false;
        }
        !tls_config.certificate_refs.is_empty()
    }

    fn listener_secret(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        gateway_key: &ObjectRef,
        listener: &GatewayListener,
        hostname: &str,
    ) -> Option<String> {
        let tls_config = listener.tls.as_ref()?;
        let cert_ref = tls_config.certificate_refs.first()?;
        let secret_ref = ObjectRef::new(
            cert_ref.namespace.clone().unwrap_or_else(|| gateway_key.namespace.clone()),
            cert_ref.name.clone(),
        );

        // Cross-namespace certificate refs lean on the same delegation
        // machinery HTTPProxy uses.
        if !cache.delegation_permits(&secret_ref, &gateway_key.namespace) {
            debug!(gateway = %gateway_key, secret = %secret_ref,
                "certificate reference not delegated to the gateway namespace");
            return None;
        }

        let secret = cache.secrets.get(&secret_ref)?;
        match tls::validate_server_secret(secret, &secret_ref, hostname) {
            Ok(dag_secret) => Some(dag.register_secret(dag_secret)),
            Err(fault) => {
                debug!(gateway = %gateway_key, secret = %secret_ref, reason = %fault.reason,
                    message = %fault.message, "certificate rejected for listener host");
                None
            }
        }
    }

    fn bind_http_routes(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        gateway_key: &ObjectRef,
        _gateway: &Arc<Gateway>,
        listener: &GatewayListener,
        secured: bool,
    ) {
        if !kind_allowed(listener, "HTTPRoute") {
            return;
        }
        for (route_key, route) in &cache.http_routes {
            let generation = route.metadata.generation;
            if !parents_select(&route.spec.parent_refs, route_key, gateway_key, listener) {
                continue;
            }
            if !namespace_allowed(listener, gateway_key, route_key) {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpRoute,
                    route_key,
                    InvalidReason::RouteNotAllowed,
                    format!(
                        "listener '{}' does not allow routes from namespace '{}'",
                        listener.name, route_key.namespace
                    ),
                    generation,
                ));
                continue;
            }

            let hostnames = intersect_hostnames(listener.hostname.as_deref(), &route.spec.hostnames);
            if hostnames.is_empty() {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpRoute,
                    route_key,
                    InvalidReason::ListenerUnmatched,
                    format!("no hostname intersects listener '{}'", listener.name),
                    generation,
                ));
                continue;
            }

            let slot = if secured { ListenerSlot::Https } else { ListenerSlot::Http };
            let mut bound = false;

            for hostname in &hostnames {
                if dag.claim_virtual_host(slot, hostname, ObjectKind::HttpRoute, route_key, generation)
                    == Claim::Lost
                {
                    continue;
                }

                if secured {
                    let Some(secret) =
                        self.listener_secret(cache, dag, gateway_key, listener, hostname)
                    else {
                        dag.conditions.push(StatusCondition::invalid(
                            ObjectKind::HttpRoute,
                            route_key,
                            InvalidReason::SecretInvalid,
                            format!("listener '{}' has no usable certificate for '{}'", listener.name, hostname),
                            generation,
                        ));
                        continue;
                    };
                    let min_version = dag.config.tls_min_version;
                    let cipher_suites = dag.config.cipher_suites.clone();
                    let vhost = dag.vhost_mut(ListenerSlot::Https, hostname);
                    if vhost.tls.is_none() {
                        vhost.tls = Some(TlsEnvelope {
                            secret,
                            min_protocol_version: min_version,
                            cipher_suites,
                            client_validation: None,
                            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
                        });
                    }
                }

                for (rule_index, rule) in route.spec.rules.iter().enumerate() {
                    for built in self.routes_for_rule(cache, dag, route_key, generation, rule, rule_index) {
                        dag.add_route(slot, hostname, built);
                        bound = true;
                    }
                }
            }

            if bound && !dag.has_invalid_condition(ObjectKind::HttpRoute, route_key) {
                dag.conditions.push(StatusCondition::valid(
                    ObjectKind::HttpRoute,
                    route_key,
                    generation,
                ));
            }
        }
    }

    /// One DAG route per match of the rule; a rule without matches gets the
    /// catch-all prefix.
    fn routes_for_rule(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        route_key: &ObjectRef,
        generation: Option<i64>,
        rule: &HTTPRouteRule,
        rule_index: usize,
    ) -> Vec<Route> {
        let mut request_headers = HeadersPolicy::default();
        let mut response_headers = HeadersPolicy::default();
        let mut redirect: Option<RouteAction> = None;
        let mut mirror: Option<String> = None;

        for filter in &rule.filters {
            match filter.type_.as_str() {
                "RequestHeaderModifier" => {
                    if let Some(modifier) = &filter.request_header_modifier {
                        apply_header_filter(&mut request_headers, modifier);
                    }
                }
                "ResponseHeaderModifier" => {
                    if let Some(modifier) = &filter.response_header_modifier {
                        apply_header_filter(&mut response_headers, modifier);
                    }
                }
                "RequestRedirect" => {
                    if let Some(r) = &filter.request_redirect {
                        redirect = Some(RouteAction::Redirect {
                            hostname: r.hostname.clone(),
                            path: None,
                            scheme: r.scheme.clone(),
                            port: r.port,
                            status_code: r.status_code.unwrap_or(302),
                        });
                    }
                }
                "RequestMirror" => {
                    if let Some(m) = &filter.request_mirror {
                        mirror = self
                            .cluster_for_backend(cache, dag, route_key, generation, &m.backend_ref, 1)
                            .map(|c| c.name);
                    }
                }
                other => {
                    debug!(route = %route_key, filter = %other, "ignoring unsupported filter");
                }
            }
        }

        let action = if let Some(redirect) = redirect {
            redirect
        } else {
            let weights = effective_weights(
                &rule.backend_refs.iter().map(|b| b.weight).collect::<Vec<_>>(),
            );
            let clusters: Vec<WeightedCluster> = rule
                .backend_refs
                .iter()
                .zip(weights)
                .filter_map(|(backend, weight)| {
                    self.cluster_for_backend(cache, dag, route_key, generation, backend, weight)
                })
                .collect();
            if clusters.is_empty() {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpRoute,
                    route_key,
                    InvalidReason::ServiceUnresolved,
                    format!("rule {} resolved no backends", rule_index),
                    generation,
                ));
                return Vec::new();
            }
            RouteAction::Forward { clusters, mirror, hash_policies: Vec::new() }
        };

        let matches: Vec<RouteMatch> = if rule.matches.is_empty() {
            vec![RouteMatch::default()]
        } else {
            rule.matches
                .iter()
                .filter_map(|m| {
                    let path = match m.path.as_ref() {
                        None => PathMatch::Prefix("/".to_string()),
                        Some(path) => {
                            let value = path.value.clone().unwrap_or_else(|| "/".to_string());
                            match path.type_.as_deref().unwrap_or("PathPrefix") {
                                "Exact" => PathMatch::Exact(value),
                                "RegularExpression" => {
                                    if Regex::new(&value).is_err() {
                                        dag.conditions.push(StatusCondition::invalid(
                                            ObjectKind::HttpRoute,
                                            route_key,
                                            InvalidReason::RegexInvalid,
                                            format!("regex '{}' does not compile", value),
                                            generation,
                                        ));
                                        return None;
                                    }
                                    PathMatch::Regex(value)
                                }
                                _ => PathMatch::Prefix(value),
                            }
                        }
                    };
                    Some(RouteMatch {
                        path,
                        headers: m
                            .headers
                            .iter()
                            .map(|h| HeaderMatch {
                                name: h.name.clone(),
                                kind: match h.type_.as_deref().unwrap_or("Exact") {
                                    "RegularExpression" => HeaderMatchKind::Regex(h.value.clone()),
                                    _ => HeaderMatchKind::Exact(h.value.clone()),
                                },
                                invert: false,
                            })
                            .collect(),
                        query_parameters: m
                            .query_params
                            .iter()
                            .map(|q| QueryParameterMatch {
                                name: q.name.clone(),
                                value: Some(q.value.clone()),
                            })
                            .collect(),
                        method: m.method.clone(),
                    })
                })
                .collect()
        };

        matches
            .into_iter()
            .enumerate()
            .map(|(match_index, match_)| Route {
                name: format!(
                    "httproute/{}/{}/{}/{}",
                    route_key.namespace, route_key.name, rule_index, match_index
                ),
                match_,
                action: action.clone(),
                timeouts: TimeoutPolicy::default(),
                retry: None,
                request_headers: request_headers.clone(),
                response_headers: response_headers.clone(),
                websocket: false,
                permit_insecure: false,
            })
            .collect()
    }

    /// Resolve one backend reference, enforcing ReferenceGrant across
    /// namespaces. `None` drops the backend, not the route.
    fn cluster_for_backend(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        route_key: &ObjectRef,
        generation: Option<i64>,
        backend: &BackendRef,
        weight: u32,
    ) -> Option<WeightedCluster> {
        let service_ref = ObjectRef::new(
            backend.namespace.clone().unwrap_or_else(|| route_key.namespace.clone()),
            backend.name.clone(),
        );

        if service_ref.namespace != route_key.namespace
            && !reference_grant_permits(cache, "HTTPRoute", &route_key.namespace, &service_ref)
        {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpRoute,
                route_key,
                InvalidReason::ReferenceNotPermitted,
                format!(
                    "no ReferenceGrant permits namespace '{}' to reference service '{}'",
                    route_key.namespace, service_ref
                ),
                generation,
            ));
            return None;
        }

        if !cache.services.contains_key(&service_ref) {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpRoute,
                route_key,
                InvalidReason::ServiceUnresolved,
                format!("service '{}' not found", service_ref),
                generation,
            ));
            return None;
        }

        let port = backend.port?;
        let name = dag.register_cluster(Cluster {
            name: cluster_name(&service_ref, port, UpstreamProtocol::Http1),
            service: service_ref,
            port,
            protocol: UpstreamProtocol::Http1,
            lb_strategy: LoadBalancerStrategy::RoundRobin,
            health_check: None,
            upstream_tls: None,
            circuit_breakers: CircuitBreakers::default(),
            dns_lookup_family: dag.config.dns_lookup_family,
        });
        Some(WeightedCluster { name, weight })
    }

    fn bind_grpc_routes(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        gateway_key: &ObjectRef,
        _gateway: &Arc<Gateway>,
        listener: &GatewayListener,
        secured: bool,
    ) {
        if !kind_allowed(listener, "GRPCRoute") {
            return;
        }
        for (route_key, route) in &cache.grpc_routes {
            let generation = route.metadata.generation;
            if !parents_select(&route.spec.parent_refs, route_key, gateway_key, listener) {
                continue;
            }
            if !namespace_allowed(listener, gateway_key, route_key) {
                continue;
            }
            let hostnames = intersect_hostnames(listener.hostname.as_deref(), &route.spec.hostnames);
            let slot = if secured { ListenerSlot::Https } else { ListenerSlot::Http };

            for hostname in &hostnames {
                if dag.claim_virtual_host(slot, hostname, ObjectKind::GrpcRoute, route_key, generation)
                    == Claim::Lost
                {
                    continue;
                }
                for (rule_index, rule) in route.spec.rules.iter().enumerate() {
                    let weights = effective_weights(
                        &rule.backend_refs.iter().map(|b| b.weight).collect::<Vec<_>>(),
                    );
                    let clusters: Vec<WeightedCluster> = rule
                        .backend_refs
                        .iter()
                        .zip(weights)
                        .filter_map(|(backend, weight)| {
                            self.grpc_cluster_for_backend(cache, dag, route_key, generation, backend, weight)
                        })
                        .collect();
                    if clusters.is_empty() {
                        continue;
                    }

                    // gRPC methods address "/Service/Method" paths.
                    let paths: Vec<PathMatch> = if rule.matches.is_empty() {
                        vec![PathMatch::Prefix("/".to_string())]
                    } else {
                        rule.matches
                            .iter()
                            .map(|m| match m.method.as_ref() {
                                Some(method) => match (&method.service, &method.method) {
                                    (Some(service), Some(name)) => {
                                        PathMatch::Exact(format!("/{}/{}", service, name))
                                    }
                                    (Some(service), None) => {
                                        PathMatch::Prefix(format!("/{}", service))
                                    }
                                    _ => PathMatch::Prefix("/".to_string()),
                                },
                                None => PathMatch::Prefix("/".to_string()),
                            })
                            .collect()
                    };

                    for (match_index, path) in paths.into_iter().enumerate() {
                        dag.add_route(
                            slot,
                            hostname,
                            Route {
                                name: format!(
                                    "grpcroute/{}/{}/{}/{}",
                                    route_key.namespace, route_key.name, rule_index, match_index
                                ),
                                match_: RouteMatch { path, ..Default::default() },
                                action: RouteAction::Forward {
                                    clusters: clusters.clone(),
                                    mirror: None,
                                    hash_policies: Vec::new(),
                                },
                                timeouts: TimeoutPolicy::default(),
                                retry: None,
                                request_headers: HeadersPolicy::default(),
                                response_headers: HeadersPolicy::default(),
                                websocket: false,
                                permit_insecure: false,
                            },
                        );
                    }
                }
            }
        }
    }

    fn grpc_cluster_for_backend(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        route_key: &ObjectRef,
        generation: Option<i64>,
        backend: &BackendRef,
        weight: u32,
    ) -> Option<WeightedCluster> {
        let service_ref = ObjectRef::new(
            backend.namespace.clone().unwrap_or_else(|| route_key.namespace.clone()),
            backend.name.clone(),
        );
        if service_ref.namespace != route_key.namespace
            && !reference_grant_permits(cache, "GRPCRoute", &route_key.namespace, &service_ref)
        {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::GrpcRoute,
                route_key,
                InvalidReason::ReferenceNotPermitted,
                format!(
                    "no ReferenceGrant permits namespace '{}' to reference service '{}'",
                    route_key.namespace, service_ref
                ),
                generation,
            ));
            return None;
        }
        if !cache.services.contains_key(&service_ref) {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::GrpcRoute,
                route_key,
                InvalidReason::ServiceUnresolved,
                format!("service '{}' not found", service_ref),
                generation,
            ));
            return None;
        }
        let port = backend.port?;
        let name = dag.register_cluster(Cluster {
            name: cluster_name(&service_ref, port, UpstreamProtocol::H2c),
            service: service_ref,
            port,
            protocol: UpstreamProtocol::H2c,
            lb_strategy: LoadBalancerStrategy::RoundRobin,
            health_check: None,
            upstream_tls: None,
            circuit_breakers: CircuitBreakers::default(),
            dns_lookup_family: dag.config.dns_lookup_family,
        });
        Some(WeightedCluster { name, weight })
    }

    /// TLS listeners carry TLSRoutes: SNI-matched passthrough to TCP
    /// backends.
    fn bind_tls_routes(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        gateway_key: &ObjectRef,
        _gateway: &Arc<Gateway>,
        listener: &GatewayListener,
    ) {
        if !kind_allowed(listener, "TLSRoute") {
            return;
        }
        if listener.tls.as_ref().and_then(|t| t.mode.as_deref()) == Some("Terminate") {
            debug!(gateway = %gateway_key, listener = %listener.name,
                "TLS listeners in Terminate mode are not routable by TLSRoute");
            return;
        }
        for (route_key, route) in &cache.tls_routes {
            let generation = route.metadata.generation;
            if !parents_select(&route.spec.parent_refs, route_key, gateway_key, listener) {
                continue;
            }
            if !namespace_allowed(listener, gateway_key, route_key) {
                continue;
            }
            let hostnames = intersect_hostnames(listener.hostname.as_deref(), &route.spec.hostnames);
            if hostnames.is_empty() {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::TlsRoute,
                    route_key,
                    InvalidReason::ListenerUnmatched,
                    format!("no hostname intersects listener '{}'", listener.name),
                    generation,
                ));
                continue;
            }

            for hostname in &hostnames {
                if dag.claim_virtual_host(
                    ListenerSlot::Https,
                    hostname,
                    ObjectKind::TlsRoute,
                    route_key,
                    generation,
                ) == Claim::Lost
                {
                    continue;
                }
                for (rule_index, rule) in route.spec.rules.iter().enumerate() {
                    let weights = effective_weights(
                        &rule.backend_refs.iter().map(|b| b.weight).collect::<Vec<_>>(),
                    );
                    let clusters: Vec<WeightedCluster> = rule
                        .backend_refs
                        .iter()
                        .zip(weights)
                        .filter_map(|(backend, weight)| {
                            let service_ref = ObjectRef::new(
                                backend
                                    .namespace
                                    .clone()
                                    .unwrap_or_else(|| route_key.namespace.clone()),
                                backend.name.clone(),
                            );
                            if service_ref.namespace != route_key.namespace
                                && !reference_grant_permits(
                                    cache,
                                    "TLSRoute",
                                    &route_key.namespace,
                                    &service_ref,
                                )
                            {
                                return None;
                            }
                            if !cache.services.contains_key(&service_ref) {
                                return None;
                            }
                            let port = backend.port?;
                            let name = dag.register_cluster(Cluster {
                                name: cluster_name(&service_ref, port, UpstreamProtocol::Http1),
                                service: service_ref,
                                port,
                                protocol: UpstreamProtocol::Http1,
                                lb_strategy: LoadBalancerStrategy::RoundRobin,
                                health_check: None,
                                upstream_tls: None,
                                circuit_breakers: CircuitBreakers::default(),
                                dns_lookup_family: dag.config.dns_lookup_family,
                            });
                            Some(WeightedCluster { name, weight })
                        })
                        .collect();
                    if clusters.is_empty() {
                        continue;
                    }
                    dag.add_route(
                        ListenerSlot::Https,
                        hostname,
                        Route {
                            name: format!(
                                "tlsroute/{}/{}/{}",
                                route_key.namespace, route_key.name, rule_index
                            ),
                            match_: RouteMatch::default(),
                            action: RouteAction::TcpProxy { clusters },
                            timeouts: TimeoutPolicy::default(),
                            retry: None,
                            request_headers: HeadersPolicy::default(),
                            response_headers: HeadersPolicy::default(),
                            websocket: false,
                            permit_insecure: false,
                        },
                    );
                }
            }
        }
    }
}

/// Fold a Gateway API header-modifier filter into the header policy. `set`
/// and `add` both land as set mutations; Envoy's append action decides the
/// rest.
fn apply_header_filter(policy: &mut HeadersPolicy, filter: &HTTPHeaderFilter) {
    for header in filter.set.iter().chain(&filter.add) {
        policy.set.push((header.name.clone(), header.value.clone()));
    }
    for name in &filter.remove {
        policy.remove.push(name.clone());
    }
    policy.set.sort();
    policy.remove.sort();
}

/// Does any parent ref of the route select this gateway listener?
fn parents_select(
    parent_refs: &[ParentReference],
    route_key: &ObjectRef,
    gateway_key: &ObjectRef,
    listener: &GatewayListener,
) -> bool {
    parent_refs.iter().any(|parent| {
        let namespace = parent.namespace.clone().unwrap_or_else(|| route_key.namespace.clone());
        if namespace != gateway_key.namespace || parent.name != gateway_key.name {
            return false;
        }
        if let Some(section) = &parent.section_name {
            if section != &listener.name {
                return false;
            }
        }
        if let Some(port) = parent.port {
            if port != listener.port {
                return false;
            }
        }
        true
    })
}

/// AllowedRoutes namespace policy. `Same` is the default; label selectors
/// require Namespace objects the cache does not index, so `Selector` admits
/// nothing.
fn namespace_allowed(
    listener: &GatewayListener,
    gateway_key: &ObjectRef,
    route_key: &ObjectRef,
) -> bool {
    let from = listener
        .allowed_routes
        .as_ref()
        .and_then(|a| a.namespaces.as_ref())
        .and_then(|n| n.from.as_deref())
        .unwrap_or("Same");
    match from {
        "All" => true,
        "Same" => route_key.namespace == gateway_key.namespace,
        _ => false,
    }
}

fn kind_allowed(listener: &GatewayListener, kind: &str) -> bool {
    match listener.allowed_routes.as_ref().map(|a| &a.kinds) {
        None => true,
        Some(kinds) if kinds.is_empty() => true,
        Some(kinds) => kinds.iter().any(|k| k.kind == kind),
    }
}

/// Intersect the listener hostname with the route's hostnames. An empty
/// route set inherits the listener hostname (or the wildcard).
fn intersect_hostnames(listener: Option<&str>, route_hostnames: &[String]) -> Vec<String> {
    match listener {
        None => {
            if route_hostnames.is_empty() {
                vec!["*".to_string()]
            } else {
                route_hostnames.to_vec()
            }
        }
        Some(listener_host) => {
            if route_hostnames.is_empty() {
                return vec![listener_host.to_string()];
            }
            route_hostnames
                .iter()
                .filter(|h| hostnames_overlap(listener_host, h))
                .map(|h| {
                    // The more specific side wins the vhost name.
                    if h.starts_with("*.") && !listener_host.starts_with("*.") {
                        listener_host.to_string()
                    } else {
                        h.to_string()
                    }
                })
                .collect()
        }
    }
}

fn hostnames_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    fqdn_matches(a, b) || fqdn_matches(b, a)
}

/// True iff a ReferenceGrant in the target's namespace allows `from_kind`
/// objects in `from_namespace` to reference the Service.
fn reference_grant_permits(
    cache: &CacheSnapshot,
    from_kind: &str,
    from_namespace: &str,
    target: &ObjectRef,
) -> bool {
    cache.reference_grants.iter().any(|(grant_key, grant)| {
        grant_key.namespace == target.namespace
            && grant.spec.from.iter().any(|f| {
                f.kind == from_kind
                    && f.namespace == from_namespace
                    && (f.group.is_empty() || f.group == "gateway.networking.k8s.io")
            })
            && grant.spec.to.iter().any(|t| {
                t.kind == "Service"
                    && t.group.is_empty()
                    && t.name.as_ref().is_none_or(|n| n == &target.name)
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::BuildConfig;
    use crate::k8s::apis::{
        GatewaySpec, HTTPPathMatch, HTTPRoute, HTTPRouteMatch, HTTPRouteSpec,
        ReferenceGrant, ReferenceGrantFrom, ReferenceGrantSpec, ReferenceGrantTo,
    };
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.into()),
            name: Some(name.into()),
            generation: Some(1),
            ..Default::default()
        }
    }

    fn gateway(namespace: &str, name: &str, listeners: Vec<GatewayListener>) -> Gateway {
        Gateway {
            metadata: meta(namespace, name),
            spec: GatewaySpec { gateway_class_name: "isoline".into(), listeners },
        }
    }

    fn http_listener(name: &str, hostname: Option<&str>, from: Option<&str>) -> GatewayListener {
        GatewayListener {
            name: name.into(),
            hostname: hostname.map(String::from),
            port: 80,
            protocol: "HTTP".into(),
            tls: None,
            allowed_routes: from.map(|from| crate::k8s::apis::AllowedRoutes {
                namespaces: Some(crate::k8s::apis::RouteNamespaces {
                    from: Some(from.into()),
                    selector: None,
                }),
                kinds: Vec::new(),
            }),
        }
    }

    fn http_route(
        namespace: &str,
        name: &str,
        gateway: &str,
        hostnames: &[&str],
        backend: BackendRef,
    ) -> HTTPRoute {
        HTTPRoute {
            metadata: meta(namespace, name),
            spec: HTTPRouteSpec {
                parent_refs: vec![ParentReference {
                    name: gateway.into(),
                    namespace: None,
                    section_name: None,
                    port: None,
                }],
                hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
                rules: vec![HTTPRouteRule {
                    matches: vec![HTTPRouteMatch {
                        path: Some(HTTPPathMatch {
                            type_: Some("PathPrefix".into()),
                            value: Some("/app".into()),
                        }),
                        ..Default::default()
                    }],
                    filters: Vec::new(),
                    backend_refs: vec![backend],
                }],
            },
        }
    }

    fn run(cache: &CacheSnapshot) -> DagBuilderState {
        let mut state = DagBuilderState::new(BuildConfig::default());
        GatewayApiProcessor.process(cache, &mut state);
        state
    }

    #[test]
    fn http_route_binds_to_matching_listener() {
        let mut cache = CacheSnapshot::default();
        cache.gateways.insert(
            ObjectRef::new("infra", "edge"),
            Arc::new(gateway("infra", "edge", vec![http_listener("web", None, Some("All"))])),
        );
        cache.http_routes.insert(
            ObjectRef::new("apps", "shop"),
            Arc::new(http_route(
                "apps",
                "shop",
                "edge",
                &["shop.test"],
                BackendRef { name: "shop-svc".into(), namespace: None, port: Some(80), weight: None },
            )),
        );
        cache
            .services
            .insert(ObjectRef::new("apps", "shop-svc"), Arc::new(Service::default()));

        let state = run(&cache);
        let vhost = state.http_vhosts.get("shop.test").expect("vhost bound");
        assert_eq!(vhost.routes.len(), 1);
        assert_eq!(vhost.routes[0].match_.path, PathMatch::Prefix("/app".into()));
        assert!(state.clusters.contains_key("apps/shop-svc/80"));
    }

    #[test]
    fn same_namespace_policy_rejects_foreign_routes() {
        let mut cache = CacheSnapshot::default();
        cache.gateways.insert(
            ObjectRef::new("infra", "edge"),
            // Default allowed namespace policy is Same.
            Arc::new(gateway("infra", "edge", vec![http_listener("web", None, None)])),
        );
        let route_key = ObjectRef::new("apps", "shop");
        cache.http_routes.insert(
            route_key.clone(),
            Arc::new(http_route(
                "apps",
                "shop",
                "edge",
                &["shop.test"],
                BackendRef { name: "shop-svc".into(), namespace: None, port: Some(80), weight: None },
            )),
        );

        let state = run(&cache);
        assert!(state.http_vhosts.is_empty());
        assert!(state.has_invalid_condition(ObjectKind::HttpRoute, &route_key));
    }

    #[test]
    fn hostname_intersection_gates_binding() {
        let mut cache = CacheSnapshot::default();
        cache.gateways.insert(
            ObjectRef::new("infra", "edge"),
            Arc::new(gateway(
                "infra",
                "edge",
                vec![http_listener("web", Some("*.example.com"), Some("All"))],
            )),
        );
        let route_key = ObjectRef::new("apps", "other");
        cache.http_routes.insert(
            route_key.clone(),
            Arc::new(http_route(
                "apps",
                "other",
                "edge",
                &["other.test"],
                BackendRef { name: "svc".into(), namespace: None, port: Some(80), weight: None },
            )),
        );

        let state = run(&cache);
        assert!(state.http_vhosts.is_empty());
        let condition = state
            .conditions
            .iter()
            .find(|c| c.name == "other")
            .expect("condition");
        assert_eq!(condition.reason, "ListenerUnmatched");
    }

    #[test]
    fn cross_namespace_backend_requires_reference_grant() {
        let mut cache = CacheSnapshot::default();
        cache.gateways.insert(
            ObjectRef::new("infra", "edge"),
            Arc::new(gateway("infra", "edge", vec![http_listener("web", None, Some("All"))])),
        );
        let backend = BackendRef {
            name: "db".into(),
            namespace: Some("data".into()),
            port: Some(5432),
            weight: None,
        };
        let route_key = ObjectRef::new("apps", "shop");
        cache.http_routes.insert(
            route_key.clone(),
            Arc::new(http_route("apps", "shop", "edge", &["shop.test"], backend)),
        );
        cache.services.insert(ObjectRef::new("data", "db"), Arc::new(Service::default()));

        // Without a grant the backend is dropped.
        let state = run(&cache);
        assert!(state.has_invalid_condition(ObjectKind::HttpRoute, &route_key));
        assert!(!state.clusters.contains_key("data/db/5432"));

        // A grant in the target namespace admits it.
        cache.reference_grants.insert(
            ObjectRef::new("data", "allow-shop"),
            Arc::new(ReferenceGrant {
                metadata: meta("data", "allow-shop"),
                spec: ReferenceGrantSpec {
                    from: vec![ReferenceGrantFrom {
                        group: "gateway.networking.k8s.io".into(),
                        kind: "HTTPRoute".into(),
                        namespace: "apps".into(),
                    }],
                    to: vec![ReferenceGrantTo { group: "".into(), kind: "Service".into(), name: None }],
                },
            }),
        );
        let state = run(&cache);
        assert!(state.clusters.contains_key("data/db/5432"));
    }

    #[test]
    fn section_name_pins_routes_to_one_listener() {
        let listener = http_listener("web", None, Some("All"));
        let parent = ParentReference {
            name: "edge".into(),
            namespace: None,
            section_name: Some("other".into()),
            port: None,
        };
        assert!(!parents_select(
            &[parent],
            &ObjectRef::new("apps", "shop"),
            &ObjectRef::new("infra", "edge"),
            &listener
        ));
    }
}
