//! HTTPProxy processing: roots are walked to their leaves through the
//! inclusion graph, validating cycle-freedom, prefix containment, and
//! delegation permissions on the way.
//!
//! Inclusions are resolved through a builder-local arena of node indices; a
//! per-walk path stack gives the three-colour cycle check.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dag::builder::{Claim, DagBuilderState, ListenerSlot, Processor};
use crate::dag::policy::{
    effective_weights, hash_policies, CircuitBreakers, HeadersPolicy, HealthCheckPolicy,
    LoadBalancerStrategy, RetryPolicy, TimeoutPolicy,
};
use crate::dag::status::StatusCondition;
use crate::dag::{
    cluster_name, segment_prefix_matches, tls, Cluster, PathMatch, Route, RouteAction, RouteMatch,
    TlsEnvelope, TlsVersion, UpstreamProtocol, UpstreamTls, WeightedCluster,
};
use crate::errors::InvalidReason;
use crate::k8s::apis::{HTTPProxy, RouteSpec, ServiceRef, TcpProxySpec, TlsSpec};
use crate::k8s::{CacheSnapshot, ObjectKind, ObjectRef};

use super::{
    headers_from_conditions, https_redirect_route, path_from_conditions, query_from_conditions,
    validate_fqdn,
};

#[derive(Default)]
pub struct HttpProxyProcessor;

/// Arena node: proxies are addressed by index during the walk.
struct Node {
    key: ObjectRef,
    proxy: Arc<HTTPProxy>,
}

struct Walk<'a> {
    cache: &'a CacheSnapshot,
    nodes: &'a [Node],
    index: &'a BTreeMap<ObjectRef, usize>,
    reached: &'a mut Vec<bool>,
    fqdn: String,
    secured: bool,
}

impl Processor for HttpProxyProcessor {
    fn process(&mut self, cache: &CacheSnapshot, dag: &mut DagBuilderState) {
        let nodes: Vec<Node> = cache
            .proxies
            .iter()
            .map(|(key, proxy)| Node { key: key.clone(), proxy: proxy.clone() })
            .collect();
        let index: BTreeMap<ObjectRef, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.key.clone(), i)).collect();
        let mut reached = vec![false; nodes.len()];

        for root in 0..nodes.len() {
            if nodes[root].proxy.spec.virtualhost.is_some() {
                self.process_root(cache, dag, &nodes, &index, &mut reached, root);
            }
        }

        // Children never reached by any root walk are orphaned; everything
        // else that avoided an invalid condition is valid.
        for (i, node) in nodes.iter().enumerate() {
            let generation = node.proxy.metadata.generation;
            if node.proxy.spec.virtualhost.is_none() && !reached[i] {
                dag.conditions.push(StatusCondition::orphaned(
                    ObjectKind::HttpProxy,
                    &node.key,
                    generation,
                ));
            } else if !dag.has_invalid_condition(ObjectKind::HttpProxy, &node.key) {
                dag.conditions.push(StatusCondition::valid(
                    ObjectKind::HttpProxy,
                    &node.key,
                    generation,
                ));
            }
        }
    }
}

impl HttpProxyProcessor {
    fn process_root(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        nodes: &[Node],
        index: &BTreeMap<ObjectRef, usize>,
        reached: &mut Vec<bool>,
        root: usize,
    ) {
        let node = &nodes[root];
        let key = node.key.clone();
        let proxy = node.proxy.clone();
        let generation = proxy.metadata.generation;
        let vh = proxy.spec.virtualhost.as_ref().expect("roots carry a virtualhost");

        if let Err(message) = validate_fqdn(&vh.fqdn) {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpProxy,
                &key,
                InvalidReason::RouteInvalid,
                message,
                generation,
            ));
            return;
        }

        let mut secured = false;
        let mut envelope: Option<TlsEnvelope> = None;
        let mut fallback = false;

        if let Some(tls_spec) = &vh.tls {
            if tls_spec.passthrough {
                self.process_passthrough(cache, dag, nodes, reached, root);
                return;
            }
            match self.terminated_tls(cache, dag, &key, generation, &vh.fqdn, tls_spec) {
                Some((env, wants_fallback)) => {
                    envelope = Some(env);
                    fallback = wants_fallback;
                    secured = true;
                }
                // Conditions already recorded; the whole virtual host is
                // withheld, including its plain-HTTP side.
                None => return,
            }
        }

        let slot = if secured { ListenerSlot::Https } else { ListenerSlot::Http };
        if dag.claim_virtual_host(slot, &vh.fqdn, ObjectKind::HttpProxy, &key, generation)
            == Claim::Lost
        {
            return;
        }

        if let Some(envelope) = envelope {
            let vhost = dag.vhost_mut(ListenerSlot::Https, &vh.fqdn);
            vhost.tls = Some(envelope);
            vhost.fallback_certificate = fallback;
        }

        let mut walk = Walk {
            cache,
            nodes,
            index,
            reached,
            fqdn: vh.fqdn.clone(),
            secured,
        };
        let mut path_stack = vec![root];
        self.walk_node(dag, &mut walk, root, "/", &mut path_stack);

        if let Some(tcp) = &proxy.spec.tcpproxy {
            self.attach_tcp_proxy(cache, dag, &key, generation, &vh.fqdn, tcp);
        }

        if secured {
            // The plain listener answers for this host with an upgrade
            // redirect; permitted-insecure routes were added ahead of it and
            // win on specificity.
            if dag.claim_virtual_host(
                ListenerSlot::Http,
                &vh.fqdn,
                ObjectKind::HttpProxy,
                &key,
                generation,
            ) != Claim::Lost
            {
                dag.add_route(
                    ListenerSlot::Http,
                    &vh.fqdn,
                    https_redirect_route(format!("httpproxy/{}/{}/redirect", key.namespace, key.name)),
                );
            }
        }
    }

    /// TLS passthrough: no termination, SNI-routed TCP proxying.
    fn process_passthrough(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        nodes: &[Node],
        reached: &mut Vec<bool>,
        root: usize,
    ) {
        let node = &nodes[root];
        let key = node.key.clone();
        let proxy = node.proxy.clone();
        let generation = proxy.metadata.generation;
        let vh = proxy.spec.virtualhost.as_ref().expect("roots carry a virtualhost");

        reached[root] = true;

        let Some(tcp) = &proxy.spec.tcpproxy else {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpProxy,
                &key,
                InvalidReason::RouteInvalid,
                "TLS passthrough requires spec.tcpproxy",
                generation,
            ));
            return;
        };

        if dag.claim_virtual_host(
            ListenerSlot::Https,
            &vh.fqdn,
            ObjectKind::HttpProxy,
            &key,
            generation,
        ) == Claim::Lost
        {
            return;
        }

        self.attach_tcp_proxy(cache, dag, &key, generation, &vh.fqdn, tcp);
    }

    fn attach_tcp_proxy(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        key: &ObjectRef,
        generation: Option<i64>,
        fqdn: &str,
        tcp: &TcpProxySpec,
    ) {
        let Some(clusters) =
            self.clusters_for_services(cache, dag, key, generation, &tcp.services, None, None)
        else {
            return;
        };
        if clusters.is_empty() {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpProxy,
                key,
                InvalidReason::RouteInvalid,
                "tcpproxy names no services",
                generation,
            ));
            return;
        }
        dag.add_route(
            ListenerSlot::Https,
            fqdn,
            Route {
                name: format!("httpproxy/{}/{}/tcpproxy", key.namespace, key.name),
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

    /// Validate terminated TLS for a root. Returns the envelope and whether
    /// the fallback certificate applies; `None` means conditions were
    /// recorded and the virtual host must be withheld.
    fn terminated_tls(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        key: &ObjectRef,
        generation: Option<i64>,
        fqdn: &str,
        tls_spec: &TlsSpec,
    ) -> Option<(TlsEnvelope, bool)> {
        if tls_spec.secret_name.is_empty() {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpProxy,
                key,
                InvalidReason::SecretNotFound,
                "spec.virtualhost.tls.secretName is empty",
                generation,
            ));
            return None;
        }

        let secret_ref = ObjectRef::parse(&tls_spec.secret_name, &key.namespace);

        if !cache.delegation_permits(&secret_ref, &key.namespace) {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpProxy,
                key,
                InvalidReason::DelegationNotPermitted,
                format!(
                    "secret '{}' is not delegated to namespace '{}'",
                    secret_ref, key.namespace
                ),
                generation,
            ));
            return None;
        }

        let Some(secret) = cache.secrets.get(&secret_ref) else {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpProxy,
                key,
                InvalidReason::SecretNotFound,
                format!("TLS secret '{}' not found", secret_ref),
                generation,
            ));
            return None;
        };

        let dag_secret = match tls::validate_server_secret(secret, &secret_ref, fqdn) {
            Ok(dag_secret) => dag_secret,
            Err(fault) => {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpProxy,
                    key,
                    fault.reason,
                    fault.message,
                    generation,
                ));
                return None;
            }
        };
        let secret_name = dag.register_secret(dag_secret);

        let min_protocol_version = match &tls_spec.minimum_protocol_version {
            Some(raw) => match TlsVersion::parse(raw) {
                Some(version) => version,
                None => {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::HttpProxy,
                        key,
                        InvalidReason::RouteInvalid,
                        format!("unknown minimum TLS protocol version '{}'", raw),
                        generation,
                    ));
                    return None;
                }
            },
            None => dag.config.tls_min_version,
        };

        let client_validation = match &tls_spec.client_validation {
            Some(validation) => {
                let ca_ref = ObjectRef::parse(&validation.ca_secret, &key.namespace);
                if !cache.delegation_permits(&ca_ref, &key.namespace) {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::HttpProxy,
                        key,
                        InvalidReason::DelegationNotPermitted,
                        format!(
                            "CA secret '{}' is not delegated to namespace '{}'",
                            ca_ref, key.namespace
                        ),
                        generation,
                    ));
                    return None;
                }
                let Some(ca_secret) = cache.secrets.get(&ca_ref) else {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::HttpProxy,
                        key,
                        InvalidReason::SecretNotFound,
                        format!("CA secret '{}' not found", ca_ref),
                        generation,
                    ));
                    return None;
                };
                match tls::validate_ca_secret(ca_secret, &ca_ref) {
                    Ok(ca) => Some(dag.register_secret(ca)),
                    Err(fault) => {
                        dag.conditions.push(StatusCondition::invalid(
                            ObjectKind::HttpProxy,
                            key,
                            fault.reason,
                            fault.message,
                            generation,
                        ));
                        return None;
                    }
                }
            }
            None => None,
        };

        let fallback = if tls_spec.enable_fallback_certificate {
            let Some(fallback_ref) = dag.config.fallback_certificate.clone() else {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpProxy,
                    key,
                    InvalidReason::SecretNotFound,
                    "fallback certificate requested but none is configured",
                    generation,
                ));
                return None;
            };
            let Some(fallback_secret) = cache.secrets.get(&fallback_ref) else {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpProxy,
                    key,
                    InvalidReason::SecretNotFound,
                    format!("configured fallback certificate '{}' not found", fallback_ref),
                    generation,
                ));
                return None;
            };
            // The fallback certificate answers when SNI is absent, so name
            // coverage is not required; only well-formedness is.
            match tls::validate_server_secret(fallback_secret, &fallback_ref, fqdn) {
                Ok(secret) => {
                    dag.register_secret(secret);
                    true
                }
                Err(fault) if fault.reason == InvalidReason::CertificateMismatch => {
                    if let (Some(cert), Some(key_pem)) = (
                        fallback_secret.data.as_ref().and_then(|d| d.get("tls.crt")),
                        fallback_secret.data.as_ref().and_then(|d| d.get("tls.key")),
                    ) {
                        dag.register_secret(crate::dag::TlsSecret {
                            name: fallback_ref.to_string(),
                            cert: cert.0.clone(),
                            key: key_pem.0.clone(),
                            ca: None,
                        });
                        true
                    } else {
                        false
                    }
                }
                Err(fault) => {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::HttpProxy,
                        key,
                        fault.reason,
                        fault.message,
                        generation,
                    ));
                    return None;
                }
            }
        } else {
            false
        };

        Some((
            TlsEnvelope {
                secret: secret_name,
                min_protocol_version,
                cipher_suites: dag.config.cipher_suites.clone(),
                client_validation,
                alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            },
            fallback,
        ))
    }

    /// Recursive inclusion walk. `path_stack` holds the indices on the
    /// current root-to-node path for cycle detection.
    fn walk_node(
        &self,
        dag: &mut DagBuilderState,
        walk: &mut Walk<'_>,
        node: usize,
        inherited_prefix: &str,
        path_stack: &mut Vec<usize>,
    ) {
        walk.reached[node] = true;
        let proxy = walk.nodes[node].proxy.clone();
        let key = walk.nodes[node].key.clone();
        let generation = proxy.metadata.generation;

        for (route_index, route_spec) in proxy.spec.routes.iter().enumerate() {
            if let Some(route) = self.build_route(
                walk.cache,
                dag,
                &key,
                generation,
                route_spec,
                route_index,
                inherited_prefix,
            ) {
                if walk.secured {
                    if route.permit_insecure {
                        dag.add_route(ListenerSlot::Http, &walk.fqdn, route.clone());
                    }
                    dag.add_route(ListenerSlot::Https, &walk.fqdn, route);
                } else {
                    dag.add_route(ListenerSlot::Http, &walk.fqdn, route);
                }
            }
        }

        for include in &proxy.spec.includes {
            let target = ObjectRef::new(
                include.namespace.clone().unwrap_or_else(|| key.namespace.clone()),
                include.name.clone(),
            );

            let Some(&child) = walk.index.get(&target) else {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpProxy,
                    &key,
                    InvalidReason::IncludeNotFound,
                    format!("included HTTPProxy '{}' not found", target),
                    generation,
                ));
                continue;
            };

            if walk.nodes[child].proxy.spec.virtualhost.is_some() {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpProxy,
                    &key,
                    InvalidReason::RootIncludesRoot,
                    format!("included HTTPProxy '{}' is itself a root", target),
                    generation,
                ));
                continue;
            }

            // Grey node on the current path: an inclusion cycle. Every node
            // on the cycle is marked invalid with a condition naming it.
            if let Some(position) = path_stack.iter().position(|&n| n == child) {
                let cycle: Vec<String> = path_stack[position..]
                    .iter()
                    .map(|&n| walk.nodes[n].key.to_string())
                    .chain(std::iter::once(target.to_string()))
                    .collect();
                let description = cycle.join(" -> ");
                for &member in &path_stack[position..] {
                    let member_key = walk.nodes[member].key.clone();
                    let member_generation = walk.nodes[member].proxy.metadata.generation;
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::HttpProxy,
                        &member_key,
                        InvalidReason::InclusionCycle,
                        format!("inclusion cycle: {}", description),
                        member_generation,
                    ));
                }
                continue;
            }

            let include_prefix = match path_from_conditions(&include.conditions) {
                Ok(PathMatch::Prefix(prefix)) => prefix,
                Ok(_) => {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::HttpProxy,
                        &key,
                        InvalidReason::RouteInvalid,
                        "include conditions support prefix matches only",
                        generation,
                    ));
                    continue;
                }
                Err(error) => {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::HttpProxy,
                        &key,
                        error.reason,
                        error.message,
                        generation,
                    ));
                    continue;
                }
            };

            if !segment_prefix_matches(inherited_prefix, &include_prefix) {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpProxy,
                    &key,
                    InvalidReason::PrefixOutsideParent,
                    format!(
                        "include prefix '{}' is outside the inherited prefix '{}'",
                        include_prefix, inherited_prefix
                    ),
                    generation,
                ));
                continue;
            }

            path_stack.push(child);
            self.walk_node(dag, walk, child, &include_prefix, path_stack);
            path_stack.pop();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_route(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        key: &ObjectRef,
        generation: Option<i64>,
        spec: &RouteSpec,
        route_index: usize,
        inherited_prefix: &str,
    ) -> Option<Route> {
        let invalid = |dag: &mut DagBuilderState, reason: InvalidReason, message: String| {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::HttpProxy,
                key,
                reason,
                message,
                generation,
            ));
        };

        let path = match path_from_conditions(&spec.conditions) {
            Ok(path) => path,
            Err(error) => {
                invalid(dag, error.reason, error.message);
                return None;
            }
        };

        // Containment applies to literal paths; a regex cannot be checked
        // statically and is scoped by the parent at match time.
        if let PathMatch::Prefix(p) | PathMatch::Exact(p) = &path {
            if !segment_prefix_matches(inherited_prefix, p) {
                invalid(
                    dag,
                    InvalidReason::PrefixOutsideParent,
                    format!("route path '{}' is outside the inclusion prefix '{}'", p, inherited_prefix),
                );
                return None;
            }
        }

        let timeouts = match TimeoutPolicy::parse(spec.timeout_policy.as_ref()) {
            Ok(timeouts) => timeouts,
            Err(message) => {
                invalid(dag, InvalidReason::RouteInvalid, message);
                return None;
            }
        };
        let retry = match RetryPolicy::parse(spec.retry_policy.as_ref()) {
            Ok(retry) => retry,
            Err(message) => {
                invalid(dag, InvalidReason::RouteInvalid, message);
                return None;
            }
        };
        let request_headers = match HeadersPolicy::parse(spec.request_headers_policy.as_ref()) {
            Ok(policy) => policy,
            Err(message) => {
                invalid(dag, InvalidReason::RouteInvalid, message);
                return None;
            }
        };
        let response_headers = match HeadersPolicy::parse(spec.response_headers_policy.as_ref()) {
            Ok(policy) => policy,
            Err(message) => {
                invalid(dag, InvalidReason::RouteInvalid, message);
                return None;
            }
        };
        let health_check = match HealthCheckPolicy::parse(spec.health_check_policy.as_ref()) {
            Ok(health_check) => health_check,
            Err(message) => {
                invalid(dag, InvalidReason::RouteInvalid, message);
                return None;
            }
        };

        let action = if let Some(redirect) = &spec.redirect {
            if !spec.services.is_empty() || spec.direct_response.is_some() {
                invalid(
                    dag,
                    InvalidReason::RouteInvalid,
                    "redirect cannot be combined with services or directResponse".to_string(),
                );
                return None;
            }
            RouteAction::Redirect {
                hostname: redirect.hostname.clone(),
                path: redirect.path.clone(),
                scheme: redirect.scheme.clone(),
                port: redirect.port,
                status_code: redirect.status_code.unwrap_or(302),
            }
        } else if let Some(direct) = &spec.direct_response {
            if !spec.services.is_empty() {
                invalid(
                    dag,
                    InvalidReason::RouteInvalid,
                    "directResponse cannot be combined with services".to_string(),
                );
                return None;
            }
            RouteAction::DirectResponse { status: direct.status_code, body: direct.body.clone() }
        } else {
            let (mirrors, forwards): (Vec<&ServiceRef>, Vec<&ServiceRef>) =
                spec.services.iter().partition(|s| s.mirror);

            if forwards.is_empty() {
                invalid(
                    dag,
                    InvalidReason::RouteInvalid,
                    "route needs services, redirect, or directResponse".to_string(),
                );
                return None;
            }
            if mirrors.len() > 1 {
                invalid(
                    dag,
                    InvalidReason::RouteInvalid,
                    "at most one mirror service is allowed".to_string(),
                );
                return None;
            }

            let lb_strategy = LoadBalancerStrategy::parse(spec.load_balancer_policy.as_ref());
            let clusters = self.clusters_for_services(
                cache,
                dag,
                key,
                generation,
                &forwards.iter().map(|s| (*s).clone()).collect::<Vec<_>>(),
                Some(lb_strategy),
                health_check.clone(),
            )?;

            let mirror = match mirrors.first() {
                Some(mirror_service) => {
                    let mirror_clusters = self.clusters_for_services(
                        cache,
                        dag,
                        key,
                        generation,
                        std::slice::from_ref(*mirror_service),
                        Some(lb_strategy),
                        None,
                    )?;
                    mirror_clusters.into_iter().next().map(|c| c.name)
                }
                None => None,
            };

            RouteAction::Forward {
                clusters,
                mirror,
                hash_policies: hash_policies(spec.load_balancer_policy.as_ref()),
            }
        };

        Some(Route {
            name: format!("httpproxy/{}/{}/{}", key.namespace, key.name, route_index),
            match_: RouteMatch {
                path,
                headers: headers_from_conditions(&spec.conditions),
                query_parameters: query_from_conditions(&spec.conditions),
                method: None,
            },
            action,
            timeouts,
            retry,
            request_headers,
            response_headers,
            websocket: spec.enable_websockets,
            permit_insecure: spec.permit_insecure && !dag.config.disable_permit_insecure,
        })
    }

    /// Resolve service references into registered clusters with effective
    /// weights. `None` means a reference failed and a condition was
    /// recorded.
    #[allow(clippy::too_many_arguments)]
    fn clusters_for_services(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        key: &ObjectRef,
        generation: Option<i64>,
        services: &[ServiceRef],
        lb_strategy: Option<LoadBalancerStrategy>,
        health_check: Option<HealthCheckPolicy>,
    ) -> Option<Vec<WeightedCluster>> {
        let weights = effective_weights(
            &services.iter().map(|s| s.weight).collect::<Vec<_>>(),
        );

        let mut clusters = Vec::with_capacity(services.len());
        for (service, weight) in services.iter().zip(weights) {
            let service_ref = ObjectRef::new(key.namespace.clone(), service.name.clone());
            if !cache.services.contains_key(&service_ref) {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::HttpProxy,
                    key,
                    InvalidReason::ServiceUnresolved,
                    format!("service '{}' not found", service_ref),
                    generation,
                ));
                return None;
            }

            let protocol = match &service.protocol {
                Some(raw) => match UpstreamProtocol::parse(raw) {
                    Some(protocol) => protocol,
                    None => {
                        dag.conditions.push(StatusCondition::invalid(
                            ObjectKind::HttpProxy,
                            key,
                            InvalidReason::RouteInvalid,
                            format!("unknown upstream protocol '{}'", raw),
                            generation,
                        ));
                        return None;
                    }
                },
                None => UpstreamProtocol::Http1,
            };

            let upstream_tls = matches!(protocol, UpstreamProtocol::Tls | UpstreamProtocol::H2)
                .then(UpstreamTls::default);

            let name = dag.register_cluster(Cluster {
                name: cluster_name(&service_ref, service.port, protocol),
                service: service_ref,
                port: service.port,
                protocol,
                lb_strategy: lb_strategy.unwrap_or_default(),
                health_check: health_check.clone(),
                upstream_tls,
                circuit_breakers: CircuitBreakers::default(),
                dns_lookup_family: dag.config.dns_lookup_family,
            });
            clusters.push(WeightedCluster { name, weight });
        }
        Some(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::BuildConfig;
    use crate::dag::tls::fixtures;
    use crate::k8s::apis::{
        CertificateDelegation, HTTPProxySpec, Include, MatchCondition, TLSCertificateDelegation,
        TLSCertificateDelegationSpec, VirtualHostSpec,
    };
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.into()),
            name: Some(name.into()),
            generation: Some(1),
            ..Default::default()
        }
    }

    fn proxy(namespace: &str, name: &str, spec: HTTPProxySpec) -> (ObjectRef, Arc<HTTPProxy>) {
        (
            ObjectRef::new(namespace, name),
            Arc::new(HTTPProxy { metadata: meta(namespace, name), spec, status: None }),
        )
    }

    fn service_route(prefix: &str, service: &str) -> RouteSpec {
        RouteSpec {
            conditions: vec![MatchCondition { prefix: Some(prefix.into()), ..Default::default() }],
            services: vec![ServiceRef { name: service.into(), port: 80, ..Default::default() }],
            ..Default::default()
        }
    }

    fn with_service(cache: &mut CacheSnapshot, namespace: &str, name: &str) {
        cache.services.insert(
            ObjectRef::new(namespace, name),
            Arc::new(Service { metadata: meta(namespace, name), ..Default::default() }),
        );
    }

    fn run(cache: &CacheSnapshot) -> DagBuilderState {
        let mut state = DagBuilderState::new(BuildConfig::default());
        HttpProxyProcessor.process(cache, &mut state);
        state
    }

    #[test]
    fn inclusion_scopes_child_routes_by_parent_prefix() {
        let mut cache = CacheSnapshot::default();
        with_service(&mut cache, "ns-b", "api-svc");

        let (root_key, root) = proxy(
            "ns-a",
            "root",
            HTTPProxySpec {
                virtualhost: Some(VirtualHostSpec { fqdn: "a.test".into(), tls: None }),
                includes: vec![Include {
                    name: "child".into(),
                    namespace: Some("ns-b".into()),
                    conditions: vec![MatchCondition {
                        prefix: Some("/api".into()),
                        ..Default::default()
                    }],
                }],
                ..Default::default()
            },
        );
        let (child_key, child) = proxy(
            "ns-b",
            "child",
            HTTPProxySpec {
                routes: vec![service_route("/api/v1", "api-svc"), service_route("/other", "api-svc")],
                ..Default::default()
            },
        );
        cache.proxies.insert(root_key.clone(), root);
        cache.proxies.insert(child_key.clone(), child);

        let state = run(&cache);

        let vhost = state.http_vhosts.get("a.test").expect("vhost");
        assert_eq!(vhost.routes.len(), 1);
        assert_eq!(vhost.routes[0].match_.path, PathMatch::Prefix("/api/v1".into()));

        let dropped = state
            .conditions
            .iter()
            .find(|c| c.name == "child" && c.reason == "PrefixOutsideParent")
            .expect("condition for the out-of-prefix route");
        assert_eq!(dropped.namespace, "ns-b");
    }

    #[test]
    fn delegation_denied_withholds_the_virtual_host() {
        let mut cache = CacheSnapshot::default();
        with_service(&mut cache, "ns-a", "svc");
        // Secret lives in ns-b with no delegation towards ns-a.
        cache.secrets.insert(
            ObjectRef::new("ns-b", "cert"),
            Arc::new(fixtures::tls_secret("ns-b", "cert", fixtures::A_TEST_CERT, fixtures::A_TEST_KEY)),
        );

        let (key, root) = proxy(
            "ns-a",
            "web",
            HTTPProxySpec {
                virtualhost: Some(VirtualHostSpec {
                    fqdn: "a.test".into(),
                    tls: Some(TlsSpec { secret_name: "ns-b/cert".into(), ..Default::default() }),
                }),
                routes: vec![service_route("/", "svc")],
                ..Default::default()
            },
        );
        cache.proxies.insert(key.clone(), root);

        let state = run(&cache);

        assert!(state.https_vhosts.is_empty());
        assert!(state.http_vhosts.is_empty());
        let condition = state
            .conditions
            .iter()
            .find(|c| c.name == "web" && !c.is_valid())
            .expect("invalid condition");
        assert_eq!(condition.reason, "DelegationNotPermitted");
    }

    #[test]
    fn delegated_secret_secures_the_virtual_host() {
        let mut cache = CacheSnapshot::default();
        with_service(&mut cache, "ns-a", "svc");
        cache.secrets.insert(
            ObjectRef::new("ns-b", "cert"),
            Arc::new(fixtures::tls_secret("ns-b", "cert", fixtures::A_TEST_CERT, fixtures::A_TEST_KEY)),
        );
        cache.delegations.insert(
            ObjectRef::new("ns-b", "grant"),
            Arc::new(TLSCertificateDelegation {
                metadata: meta("ns-b", "grant"),
                spec: TLSCertificateDelegationSpec {
                    delegations: vec![CertificateDelegation {
                        secret_name: "cert".into(),
                        target_namespaces: vec!["*".into()],
                    }],
                },
            }),
        );

        let (key, root) = proxy(
            "ns-a",
            "web",
            HTTPProxySpec {
                virtualhost: Some(VirtualHostSpec {
                    fqdn: "a.test".into(),
                    tls: Some(TlsSpec { secret_name: "ns-b/cert".into(), ..Default::default() }),
                }),
                routes: vec![service_route("/", "svc")],
                ..Default::default()
            },
        );
        cache.proxies.insert(key.clone(), root);

        let state = run(&cache);

        let vhost = state.https_vhosts.get("a.test").expect("secure vhost");
        assert_eq!(vhost.tls.as_ref().unwrap().secret, "ns-b/cert");
        assert_eq!(vhost.routes.len(), 1);
        assert!(state.secrets.contains_key("ns-b/cert"));

        // Plain HTTP answers with the upgrade redirect.
        let http = state.http_vhosts.get("a.test").expect("redirect vhost");
        assert!(matches!(
            http.routes[0].action,
            RouteAction::Redirect { status_code: 301, .. }
        ));
        assert!(state.conditions.iter().any(|c| c.name == "web" && c.is_valid()));
    }

    #[test]
    fn inclusion_cycles_invalidate_every_member() {
        let mut cache = CacheSnapshot::default();
        let (root_key, root) = proxy(
            "default",
            "root",
            HTTPProxySpec {
                virtualhost: Some(VirtualHostSpec { fqdn: "a.test".into(), tls: None }),
                includes: vec![Include { name: "left".into(), namespace: None, conditions: vec![] }],
                ..Default::default()
            },
        );
        let (left_key, left) = proxy(
            "default",
            "left",
            HTTPProxySpec {
                includes: vec![Include { name: "right".into(), namespace: None, conditions: vec![] }],
                ..Default::default()
            },
        );
        let (right_key, right) = proxy(
            "default",
            "right",
            HTTPProxySpec {
                includes: vec![Include { name: "left".into(), namespace: None, conditions: vec![] }],
                ..Default::default()
            },
        );
        cache.proxies.insert(root_key, root);
        cache.proxies.insert(left_key.clone(), left);
        cache.proxies.insert(right_key.clone(), right);

        let state = run(&cache);

        for name in ["left", "right"] {
            let condition = state
                .conditions
                .iter()
                .find(|c| c.name == name && c.reason == "IncludeCycle")
                .unwrap_or_else(|| panic!("cycle condition for {name}"));
            assert!(condition.message.contains("default/left"));
            assert!(condition.message.contains("default/right"));
        }
    }

    #[test]
    fn unincluded_children_are_orphaned() {
        let mut cache = CacheSnapshot::default();
        let (key, child) = proxy(
            "default",
            "stray",
            HTTPProxySpec { routes: vec![service_route("/", "svc")], ..Default::default() },
        );
        cache.proxies.insert(key.clone(), child);

        let state = run(&cache);
        let condition =
            state.conditions.iter().find(|c| c.name == "stray").expect("condition");
        assert_eq!(condition.reason, "Orphaned");
    }

    #[test]
    fn traffic_weights_and_even_split() {
        let mut cache = CacheSnapshot::default();
        with_service(&mut cache, "default", "svc-a");
        with_service(&mut cache, "default", "svc-b");

        let weighted = RouteSpec {
            conditions: vec![MatchCondition { prefix: Some("/w".into()), ..Default::default() }],
            services: vec![
                ServiceRef { name: "svc-a".into(), port: 80, weight: Some(90), ..Default::default() },
                ServiceRef { name: "svc-b".into(), port: 80, weight: Some(10), ..Default::default() },
            ],
            ..Default::default()
        };
        let unweighted = RouteSpec {
            conditions: vec![MatchCondition { prefix: Some("/z".into()), ..Default::default() }],
            services: vec![
                ServiceRef { name: "svc-a".into(), port: 80, ..Default::default() },
                ServiceRef { name: "svc-b".into(), port: 80, ..Default::default() },
            ],
            ..Default::default()
        };

        let (key, root) = proxy(
            "default",
            "split",
            HTTPProxySpec {
                virtualhost: Some(VirtualHostSpec { fqdn: "a.test".into(), tls: None }),
                routes: vec![weighted, unweighted],
                ..Default::default()
            },
        );
        cache.proxies.insert(key, root);

        let state = run(&cache);
        let vhost = state.http_vhosts.get("a.test").expect("vhost");

        let weights_of = |path: &str| -> Vec<u32> {
            let route = vhost
                .routes
                .iter()
                .find(|r| r.match_.path == PathMatch::Prefix(path.into()))
                .expect("route");
            match &route.action {
                RouteAction::Forward { clusters, .. } => clusters.iter().map(|c| c.weight).collect(),
                other => panic!("unexpected action: {other:?}"),
            }
        };
        assert_eq!(weights_of("/w"), vec![90, 10]);
        assert_eq!(weights_of("/z"), vec![1, 1]);
    }

    #[test]
    fn invalid_regex_drops_the_route() {
        let mut cache = CacheSnapshot::default();
        with_service(&mut cache, "default", "svc");
        let (key, root) = proxy(
            "default",
            "web",
            HTTPProxySpec {
                virtualhost: Some(VirtualHostSpec { fqdn: "a.test".into(), tls: None }),
                routes: vec![RouteSpec {
                    conditions: vec![MatchCondition {
                        regex: Some("[broken".into()),
                        ..Default::default()
                    }],
                    services: vec![ServiceRef { name: "svc".into(), port: 80, ..Default::default() }],
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        cache.proxies.insert(key.clone(), root);

        let state = run(&cache);
        assert!(state.http_vhosts.get("a.test").is_none_or(|vh| vh.routes.is_empty()));
        assert!(state.conditions.iter().any(|c| c.name == "web" && c.reason == "RegexInvalid"));
    }

    #[test]
    fn duplicate_fqdn_smaller_root_wins() {
        let mut cache = CacheSnapshot::default();
        with_service(&mut cache, "ns-a", "svc");
        with_service(&mut cache, "ns-b", "svc");

        let (a_key, a) = proxy(
            "ns-a",
            "web",
            HTTPProxySpec {
                virtualhost: Some(VirtualHostSpec { fqdn: "shared.test".into(), tls: None }),
                routes: vec![service_route("/", "svc")],
                ..Default::default()
            },
        );
        let (b_key, b) = proxy(
            "ns-b",
            "web",
            HTTPProxySpec {
                virtualhost: Some(VirtualHostSpec { fqdn: "shared.test".into(), tls: None }),
                routes: vec![service_route("/", "svc")],
                ..Default::default()
            },
        );
        cache.proxies.insert(a_key.clone(), a);
        cache.proxies.insert(b_key.clone(), b);

        let state = run(&cache);

        assert!(state.conditions.iter().any(|c| {
            c.namespace == "ns-b" && c.reason == "DuplicateVirtualHost" && !c.is_valid()
        }));
        assert!(state.conditions.iter().any(|c| c.namespace == "ns-a" && c.is_valid()));
        assert_eq!(state.http_vhosts.get("shared.test").map(|vh| vh.routes.len()), Some(1));
    }
}
