//! Ingress processing: `networking.k8s.io/v1` Ingress objects become virtual
//! hosts and routes on the materialised listeners.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{IngressBackend, IngressRule};
use tracing::debug;

use crate::dag::builder::{Claim, DagBuilderState, ListenerSlot, Processor};
use crate::dag::policy::{CircuitBreakers, HeadersPolicy, LoadBalancerStrategy, TimeoutPolicy};
use crate::dag::status::StatusCondition;
use crate::dag::{
    cluster_name, tls, Cluster, PathMatch, Route, RouteAction, RouteMatch, TlsEnvelope,
    UpstreamProtocol, WeightedCluster,
};
use crate::errors::InvalidReason;
use crate::k8s::{CacheSnapshot, ObjectKind, ObjectRef};

use super::https_redirect_route;

pub struct IngressProcessor;

impl Processor for IngressProcessor {
    fn process(&mut self, cache: &CacheSnapshot, dag: &mut DagBuilderState) {
        for (key, ingress) in &cache.ingresses {
            let Some(spec) = &ingress.spec else { continue };
            let generation = ingress.metadata.generation;

            // Hosts secured by a validated certificate, host -> DAG secret.
            let mut secured: BTreeMap<String, String> = BTreeMap::new();
            for entry in spec.tls.as_deref().unwrap_or_default() {
                let Some(secret_name) = entry.secret_name.as_deref() else { continue };
                let secret_ref = ObjectRef::new(key.namespace.clone(), secret_name);
                let Some(secret) = cache.secrets.get(&secret_ref) else {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::Ingress,
                        key,
                        InvalidReason::SecretNotFound,
                        format!("TLS secret '{}' not found", secret_ref),
                        generation,
                    ));
                    continue;
                };
                for host in entry.hosts.as_deref().unwrap_or_default() {
                    match tls::validate_server_secret(secret, &secret_ref, host) {
                        Ok(dag_secret) => {
                            let name = dag.register_secret(dag_secret);
                            secured.insert(host.clone(), name);
                        }
                        Err(fault) => {
                            dag.conditions.push(StatusCondition::invalid(
                                ObjectKind::Ingress,
                                key,
                                fault.reason,
                                fault.message,
                                generation,
                            ));
                        }
                    }
                }
            }

            for (rule_index, rule) in spec.rules.as_deref().unwrap_or_default().iter().enumerate() {
                self.process_rule(cache, dag, key, generation, rule, rule_index, &secured);
            }

            // A default backend catches everything on the wildcard host.
            if let Some(default_backend) = &spec.default_backend {
                if dag.claim_virtual_host(
                    ListenerSlot::Http,
                    "*",
                    ObjectKind::Ingress,
                    key,
                    generation,
                ) != Claim::Lost
                {
                    if let Some(route) = self.route_for_backend(
                        cache,
                        dag,
                        key,
                        generation,
                        default_backend,
                        PathMatch::Prefix("/".to_string()),
                        format!("ingress/{}/{}/default", key.namespace, key.name),
                    ) {
                        dag.add_route(ListenerSlot::Http, "*", route);
                    }
                }
            }
        }
    }
}

impl IngressProcessor {
    #[allow(clippy::too_many_arguments)]
    fn process_rule(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        key: &ObjectRef,
        generation: Option<i64>,
        rule: &IngressRule,
        rule_index: usize,
        secured: &BTreeMap<String, String>,
    ) {
        let host = rule.host.clone().unwrap_or_else(|| "*".to_string());
        let tls_secret = secured.get(&host).cloned();
        let slot = if tls_secret.is_some() { ListenerSlot::Https } else { ListenerSlot::Http };

        if dag.claim_virtual_host(slot, &host, ObjectKind::Ingress, key, generation) == Claim::Lost
        {
            return;
        }

        if let Some(secret) = &tls_secret {
            let min_version = dag.config.tls_min_version;
            let cipher_suites = dag.config.cipher_suites.clone();
            let vhost = dag.vhost_mut(ListenerSlot::Https, &host);
            if vhost.tls.is_none() {
                vhost.tls = Some(TlsEnvelope {
                    secret: secret.clone(),
                    min_protocol_version: min_version,
                    cipher_suites,
                    client_validation: None,
                    alpn: vec!["h2".to_string(), "http/1.1".to_string()],
                });
            }

            // Plain HTTP for this host answers with a 301 upgrade.
            if dag.claim_virtual_host(ListenerSlot::Http, &host, ObjectKind::Ingress, key, generation)
                != Claim::Lost
            {
                let redirect =
                    https_redirect_route(format!("ingress/{}/{}/redirect", key.namespace, key.name));
                let vhost = dag.vhost_mut(ListenerSlot::Http, &host);
                if !vhost.routes.iter().any(|r| r.name == redirect.name) {
                    vhost.routes.push(redirect);
                }
            }
        }

        let Some(http) = &rule.http else { return };
        for (path_index, path) in http.paths.iter().enumerate() {
            let path_match = match ingress_path_match(
                path.path.as_deref(),
                path.path_type.as_str(),
            ) {
                Ok(path_match) => path_match,
                Err(message) => {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::Ingress,
                        key,
                        InvalidReason::RouteInvalid,
                        message,
                        generation,
                    ));
                    continue;
                }
            };

            if let Some(route) = self.route_for_backend(
                cache,
                dag,
                key,
                generation,
                &path.backend,
                path_match,
                format!("ingress/{}/{}/{}/{}", key.namespace, key.name, rule_index, path_index),
            ) {
                dag.add_route(slot, &host, route);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn route_for_backend(
        &self,
        cache: &CacheSnapshot,
        dag: &mut DagBuilderState,
        key: &ObjectRef,
        generation: Option<i64>,
        backend: &IngressBackend,
        path: PathMatch,
        name: String,
    ) -> Option<Route> {
        let Some(service_backend) = &backend.service else {
            debug!(ingress = %key, "skipping non-service ingress backend");
            return None;
        };

        let service_ref = ObjectRef::new(key.namespace.clone(), service_backend.name.clone());
        let Some(service) = cache.services.get(&service_ref) else {
            dag.conditions.push(StatusCondition::invalid(
                ObjectKind::Ingress,
                key,
                InvalidReason::ServiceUnresolved,
                format!("service '{}' not found", service_ref),
                generation,
            ));
            return None;
        };

        let port = match &service_backend.port {
            Some(port) if port.number.is_some() => port.number.unwrap_or_default() as u16,
            Some(port) => {
                // Named port: resolve against the Service spec.
                let Some(number) = port.name.as_deref().and_then(|name| {
                    service.spec.as_ref()?.ports.as_deref()?.iter().find_map(|p| {
                        (p.name.as_deref() == Some(name)).then_some(p.port)
                    })
                }) else {
                    dag.conditions.push(StatusCondition::invalid(
                        ObjectKind::Ingress,
                        key,
                        InvalidReason::ServiceUnresolved,
                        format!(
                            "service '{}' has no port named '{}'",
                            service_ref,
                            port.name.as_deref().unwrap_or_default()
                        ),
                        generation,
                    ));
                    return None;
                };
                number as u16
            }
            None => {
                dag.conditions.push(StatusCondition::invalid(
                    ObjectKind::Ingress,
                    key,
                    InvalidReason::RouteInvalid,
                    format!("backend for service '{}' names no port", service_ref),
                    generation,
                ));
                return None;
            }
        };

        let cluster = dag.register_cluster(Cluster {
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

        Some(Route {
            name,
            match_: RouteMatch { path, ..Default::default() },
            action: RouteAction::Forward {
                clusters: vec![WeightedCluster { name: cluster, weight: 1 }],
                mirror: None,
                hash_policies: Vec::new(),
            },
            timeouts: TimeoutPolicy::default(),
            retry: None,
            request_headers: HeadersPolicy::default(),
            response_headers: HeadersPolicy::default(),
            websocket: false,
            permit_insecure: false,
        })
    }
}

/// Translate the Ingress path type into the DAG predicate. `Prefix` carries
/// segment semantics; `ImplementationSpecific` is treated as a segment
/// prefix too.
fn ingress_path_match(path: Option<&str>, path_type: &str) -> Result<PathMatch, String> {
    let path = path.unwrap_or("/");
    if !path.starts_with('/') {
        return Err(format!("path '{}' must be absolute", path));
    }
    match path_type {
        "Exact" => Ok(PathMatch::Exact(path.to_string())),
        "Prefix" | "ImplementationSpecific" => Ok(PathMatch::Prefix(path.to_string())),
        other => Err(format!("unknown pathType '{}'", other)),
    }
}
