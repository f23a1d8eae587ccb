//! The processor pipeline. Each processor consumes one resource family from
//! the cache snapshot and contributes to the under-construction DAG.

mod extension;
mod gateway;
mod httpproxy;
mod ingress;
mod listener;

pub use extension::{extension_cluster_name, ExtensionServiceProcessor};
pub use gateway::GatewayApiProcessor;
pub use httpproxy::HttpProxyProcessor;
pub use ingress::IngressProcessor;
pub use listener::ListenerProcessor;

use regex::Regex;

use crate::k8s::apis::MatchCondition;

use super::policy::{HeadersPolicy, TimeoutPolicy};
use super::{HeaderMatch, HeaderMatchKind, PathMatch, QueryParameterMatch, Route, RouteAction, RouteMatch};

/// The route placed on the HTTP listener for a TLS virtual host: an
/// unconditional 301 to HTTPS.
pub(crate) fn https_redirect_route(name: String) -> Route {
    Route {
        name,
        match_: RouteMatch { path: PathMatch::Prefix("/".to_string()), ..Default::default() },
        action: RouteAction::Redirect {
            hostname: None,
            path: None,
            scheme: Some("https".to_string()),
            port: None,
            status_code: 301,
        },
        timeouts: TimeoutPolicy::default(),
        retry: None,
        request_headers: HeadersPolicy::default(),
        response_headers: HeadersPolicy::default(),
        websocket: false,
        permit_insecure: false,
    }
}

/// Why a condition list could not produce a path predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PathConditionError {
    pub reason: crate::errors::InvalidReason,
    pub message: String,
}

impl PathConditionError {
    fn invalid(message: String) -> Self {
        Self { reason: crate::errors::InvalidReason::RouteInvalid, message }
    }
}

/// Extract the path predicate from a condition list. At most one of
/// prefix/exact/regex may appear across the list; none defaults to `/`.
pub(crate) fn path_from_conditions(
    conditions: &[MatchCondition],
) -> Result<PathMatch, PathConditionError> {
    let mut path: Option<PathMatch> = None;
    for condition in conditions {
        let candidate = if let Some(prefix) = &condition.prefix {
            Some(PathMatch::Prefix(prefix.clone()))
        } else if let Some(exact) = &condition.exact {
            Some(PathMatch::Exact(exact.clone()))
        } else if let Some(regex) = &condition.regex {
            Some(PathMatch::Regex(regex.clone()))
        } else {
            None
        };
        if let Some(candidate) = candidate {
            if path.is_some() {
                return Err(PathConditionError::invalid(
                    "multiple path conditions on one match".to_string(),
                ));
            }
            path = Some(candidate);
        }
    }

    let path = path.unwrap_or_default();
    match &path {
        PathMatch::Prefix(p) | PathMatch::Exact(p) => {
            if !p.starts_with('/') {
                return Err(PathConditionError::invalid(format!("path '{}' must be absolute", p)));
            }
        }
        PathMatch::Regex(r) => {
            Regex::new(r).map_err(|e| PathConditionError {
                reason: crate::errors::InvalidReason::RegexInvalid,
                message: format!("regex '{}' does not compile: {}", r, e),
            })?;
        }
    }
    Ok(path)
}

pub(crate) fn headers_from_conditions(conditions: &[MatchCondition]) -> Vec<HeaderMatch> {
    conditions
        .iter()
        .filter_map(|c| c.header.as_ref())
        .map(|h| {
            let kind = if let Some(exact) = &h.exact {
                HeaderMatchKind::Exact(exact.clone())
            } else if let Some(contains) = &h.contains {
                HeaderMatchKind::Contains(contains.clone())
            } else {
                HeaderMatchKind::Present
            };
            HeaderMatch { name: h.name.clone(), kind, invert: h.invert }
        })
        .collect()
}

pub(crate) fn query_from_conditions(conditions: &[MatchCondition]) -> Vec<QueryParameterMatch> {
    conditions
        .iter()
        .filter_map(|c| c.query_parameter.as_ref())
        .map(|q| QueryParameterMatch { name: q.name.clone(), value: q.exact.clone() })
        .collect()
}

/// A virtual host FQDN may carry a wildcard at the first label only.
pub(crate) fn validate_fqdn(fqdn: &str) -> Result<(), String> {
    if fqdn.is_empty() {
        return Err("fqdn must not be empty".to_string());
    }
    if let Some(rest) = fqdn.strip_prefix("*.") {
        if rest.contains('*') || rest.is_empty() {
            return Err(format!("fqdn '{}' wildcard is only allowed at the first label", fqdn));
        }
        return Ok(());
    }
    if fqdn.contains('*') {
        return Err(format!("fqdn '{}' wildcard is only allowed at the first label", fqdn));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(p: &str) -> MatchCondition {
        MatchCondition { prefix: Some(p.to_string()), ..Default::default() }
    }

    #[test]
    fn path_defaults_to_root_prefix() {
        assert_eq!(path_from_conditions(&[]).unwrap(), PathMatch::Prefix("/".into()));
    }

    #[test]
    fn multiple_path_conditions_rejected() {
        let conditions = vec![prefix("/a"), prefix("/b")];
        assert!(path_from_conditions(&conditions).is_err());
    }

    #[test]
    fn regex_must_compile() {
        let conditions =
            vec![MatchCondition { regex: Some("[invalid".to_string()), ..Default::default() }];
        assert!(path_from_conditions(&conditions).is_err());

        let conditions =
            vec![MatchCondition { regex: Some("/api/v[0-9]+".to_string()), ..Default::default() }];
        assert!(path_from_conditions(&conditions).is_ok());
    }

    #[test]
    fn relative_paths_rejected() {
        assert!(path_from_conditions(&[prefix("api")]).is_err());
    }

    #[test]
    fn fqdn_wildcards_first_label_only() {
        assert!(validate_fqdn("a.test").is_ok());
        assert!(validate_fqdn("*.example.com").is_ok());
        assert!(validate_fqdn("a.*.example.com").is_err());
        assert!(validate_fqdn("*.*.example.com").is_err());
        assert!(validate_fqdn("").is_err());
    }
}
