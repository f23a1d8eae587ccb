//! Route and cluster policies: timeouts, retries, load balancing, header
//! mutation, and traffic-weight distribution.

use std::time::Duration;

use crate::config::settings::ConfiguredTimeout;
use crate::k8s::apis::{
    HeadersPolicySpec, LoadBalancerPolicySpec, RetryPolicySpec, TimeoutPolicySpec,
};

/// Per-route timeouts; `UseDefault` leaves Envoy's own defaults in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutPolicy {
    pub response: ConfiguredTimeout,
    pub idle: ConfiguredTimeout,
}

impl TimeoutPolicy {
    /// Parse the API policy; a malformed duration invalidates the route, so
    /// the error carries which field failed.
    pub fn parse(spec: Option<&TimeoutPolicySpec>) -> Result<Self, String> {
        let Some(spec) = spec else { return Ok(Self::default()) };
        let response = ConfiguredTimeout::parse(spec.response.as_deref())
            .map_err(|e| format!("timeoutPolicy.response: {}", e))?;
        let idle = ConfiguredTimeout::parse(spec.idle.as_deref())
            .map_err(|e| format!("timeoutPolicy.idle: {}", e))?;
        Ok(Self { response, idle })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub count: u32,
    pub per_try_timeout: Option<Duration>,
    pub retriable_status_codes: Vec<u32>,
}

impl RetryPolicy {
    pub fn parse(spec: Option<&RetryPolicySpec>) -> Result<Option<Self>, String> {
        let Some(spec) = spec else { return Ok(None) };
        if spec.count == 0 {
            return Ok(None);
        }
        let per_try_timeout = match ConfiguredTimeout::parse(spec.per_try_timeout.as_deref())
            .map_err(|e| format!("retryPolicy.perTryTimeout: {}", e))?
        {
            ConfiguredTimeout::Value(d) => Some(d),
            _ => None,
        };
        Ok(Some(Self {
            count: spec.count,
            per_try_timeout,
            retriable_status_codes: spec.retriable_status_codes.clone(),
        }))
    }
}

/// Upstream load-balancing strategy, applied per cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancerStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    RequestHash,
    Cookie,
}

impl LoadBalancerStrategy {
    /// Unknown strategies fall back to round robin, matching the permissive
    /// handling of optional policy blocks.
    pub fn parse(spec: Option<&LoadBalancerPolicySpec>) -> Self {
        match spec.map(|s| s.strategy.as_str()) {
            Some("WeightedLeastRequest") => Self::WeightedLeastRequest,
            Some("Random") => Self::Random,
            Some("RequestHash") => Self::RequestHash,
            Some("Cookie") => Self::Cookie,
            _ => Self::RoundRobin,
        }
    }
}

/// Route-level request hashing inputs for `RequestHash` balancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashPolicy {
    pub header_name: String,
    pub terminal: bool,
}

pub fn hash_policies(spec: Option<&LoadBalancerPolicySpec>) -> Vec<HashPolicy> {
    let Some(spec) = spec else { return Vec::new() };
    spec.request_hash_policies
        .iter()
        .filter_map(|p| {
            p.header_hash_options.as_ref().map(|h| HashPolicy {
                header_name: h.header_name.clone(),
                terminal: p.terminal,
            })
        })
        .collect()
}

/// Header set/remove mutations applied to requests or responses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeadersPolicy {
    pub set: Vec<(String, String)>,
    pub remove: Vec<String>,
}

/// Headers the data plane owns; mutating them would corrupt routing.
const FORBIDDEN_HEADERS: &[&str] = &["host", ":authority", ":path", ":method", ":scheme"];

impl HeadersPolicy {
    pub fn parse(spec: Option<&HeadersPolicySpec>) -> Result<Self, String> {
        let Some(spec) = spec else { return Ok(Self::default()) };
        let mut policy = Self::default();
        for header in &spec.set {
            if is_forbidden(&header.name) {
                return Err(format!("header '{}' may not be set", header.name));
            }
            policy.set.push((header.name.clone(), header.value.clone()));
        }
        for name in &spec.remove {
            if is_forbidden(name) {
                return Err(format!("header '{}' may not be removed", name));
            }
            policy.remove.push(name.clone());
        }
        policy.set.sort();
        policy.remove.sort();
        Ok(policy)
    }
}

fn is_forbidden(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    FORBIDDEN_HEADERS.contains(&lowered.as_str())
}

/// Active health checking for a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    pub path: String,
    pub host: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl HealthCheckPolicy {
    pub fn parse(
        spec: Option<&crate::k8s::apis::HealthCheckPolicySpec>,
    ) -> Result<Option<Self>, String> {
        let Some(spec) = spec else { return Ok(None) };
        if !spec.path.starts_with('/') {
            return Err(format!("healthCheckPolicy.path '{}' must be absolute", spec.path));
        }
        Ok(Some(Self {
            path: spec.path.clone(),
            host: spec.host.clone(),
            interval: Duration::from_secs(spec.interval_seconds.unwrap_or(5)),
            timeout: Duration::from_secs(spec.timeout_seconds.unwrap_or(2)),
            unhealthy_threshold: spec.unhealthy_threshold_count.unwrap_or(3),
            healthy_threshold: spec.healthy_threshold_count.unwrap_or(2),
        }))
    }
}

/// Circuit breaker limits; zero means "use Envoy's default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircuitBreakers {
    pub max_connections: u32,
    pub max_pending_requests: u32,
    pub max_requests: u32,
    pub max_retries: u32,
}

/// Distribute traffic weights. Omitted weights default to zero; when every
/// weight is zero, traffic splits evenly by assigning weight 1 to each
/// entry.
pub fn effective_weights(weights: &[Option<u32>]) -> Vec<u32> {
    let assigned: Vec<u32> = weights.iter().map(|w| w.unwrap_or(0)).collect();
    if assigned.iter().all(|w| *w == 0) {
        vec![1; assigned.len()]
    } else {
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::apis::HeaderValue;

    #[test]
    fn zero_weights_split_evenly() {
        assert_eq!(effective_weights(&[None, None, None]), vec![1, 1, 1]);
        assert_eq!(effective_weights(&[Some(0), Some(0)]), vec![1, 1]);
        assert_eq!(effective_weights(&[Some(90), None]), vec![90, 0]);
        assert_eq!(effective_weights(&[Some(2), Some(3)]), vec![2, 3]);
    }

    #[test]
    fn forbidden_headers_rejected() {
        let spec = HeadersPolicySpec {
            set: vec![HeaderValue { name: "Host".into(), value: "evil".into() }],
            remove: Vec::new(),
        };
        assert!(HeadersPolicy::parse(Some(&spec)).is_err());

        let spec = HeadersPolicySpec {
            set: Vec::new(),
            remove: vec![":authority".into()],
        };
        assert!(HeadersPolicy::parse(Some(&spec)).is_err());
    }

    #[test]
    fn headers_policy_is_sorted_for_determinism() {
        let spec = HeadersPolicySpec {
            set: vec![
                HeaderValue { name: "x-b".into(), value: "2".into() },
                HeaderValue { name: "x-a".into(), value: "1".into() },
            ],
            remove: vec!["x-z".into(), "x-y".into()],
        };
        let policy = HeadersPolicy::parse(Some(&spec)).unwrap();
        assert_eq!(policy.set[0].0, "x-a");
        assert_eq!(policy.remove, vec!["x-y".to_string(), "x-z".to_string()]);
    }

    #[test]
    fn retry_policy_zero_count_is_none() {
        let spec = RetryPolicySpec { count: 0, ..Default::default() };
        assert!(RetryPolicy::parse(Some(&spec)).unwrap().is_none());
    }

    #[test]
    fn timeout_policy_bad_duration_is_an_error() {
        let spec = TimeoutPolicySpec { response: Some("ninety".into()), idle: None };
        assert!(TimeoutPolicy::parse(Some(&spec)).is_err());
    }

    #[test]
    fn health_check_policy_defaults_and_validation() {
        use crate::k8s::apis::HealthCheckPolicySpec;

        let spec = HealthCheckPolicySpec { path: "/healthz".into(), ..Default::default() };
        let policy = HealthCheckPolicy::parse(Some(&spec)).unwrap().unwrap();
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.unhealthy_threshold, 3);

        let spec = HealthCheckPolicySpec { path: "healthz".into(), ..Default::default() };
        assert!(HealthCheckPolicy::parse(Some(&spec)).is_err());

        assert!(HealthCheckPolicy::parse(None).unwrap().is_none());
    }

    #[test]
    fn lb_strategy_parsing_defaults_to_round_robin() {
        assert_eq!(LoadBalancerStrategy::parse(None), LoadBalancerStrategy::RoundRobin);
        let spec = LoadBalancerPolicySpec { strategy: "Cookie".into(), ..Default::default() };
        assert_eq!(LoadBalancerStrategy::parse(Some(&spec)), LoadBalancerStrategy::Cookie);
        let spec = LoadBalancerPolicySpec { strategy: "Bogus".into(), ..Default::default() };
        assert_eq!(LoadBalancerStrategy::parse(Some(&spec)), LoadBalancerStrategy::RoundRobin);
    }
}
