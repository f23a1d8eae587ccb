//! Object identity and the unified watch-event payload.

use std::fmt;

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use super::apis::{
    ExtensionService, GRPCRoute, Gateway, HTTPProxy, HTTPRoute, ReferenceGrant,
    TLSCertificateDelegation, TLSRoute,
};

/// `(namespace, name)` key every cached object is indexed by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse a "namespace/name" string; a bare name resolves into
    /// `default_namespace`.
    pub fn parse(value: &str, default_namespace: &str) -> Self {
        match value.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new(default_namespace, value),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resource kinds the cache indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Ingress,
    HttpProxy,
    Gateway,
    HttpRoute,
    TlsRoute,
    GrpcRoute,
    ReferenceGrant,
    Service,
    EndpointSlice,
    Secret,
    ExtensionService,
    TlsCertificateDelegation,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Ingress => "Ingress",
            ObjectKind::HttpProxy => "HTTPProxy",
            ObjectKind::Gateway => "Gateway",
            ObjectKind::HttpRoute => "HTTPRoute",
            ObjectKind::TlsRoute => "TLSRoute",
            ObjectKind::GrpcRoute => "GRPCRoute",
            ObjectKind::ReferenceGrant => "ReferenceGrant",
            ObjectKind::Service => "Service",
            ObjectKind::EndpointSlice => "EndpointSlice",
            ObjectKind::Secret => "Secret",
            ObjectKind::ExtensionService => "ExtensionService",
            ObjectKind::TlsCertificateDelegation => "TLSCertificateDelegation",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One watched object, carried through the event channel into the cache.
#[derive(Debug, Clone)]
pub enum KubeObject {
    Ingress(Box<Ingress>),
    HttpProxy(Box<HTTPProxy>),
    Gateway(Box<Gateway>),
    HttpRoute(Box<HTTPRoute>),
    TlsRoute(Box<TLSRoute>),
    GrpcRoute(Box<GRPCRoute>),
    ReferenceGrant(Box<ReferenceGrant>),
    Service(Box<Service>),
    EndpointSlice(Box<EndpointSlice>),
    Secret(Box<Secret>),
    ExtensionService(Box<ExtensionService>),
    TlsCertificateDelegation(Box<TLSCertificateDelegation>),
}

impl KubeObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            KubeObject::Ingress(_) => ObjectKind::Ingress,
            KubeObject::HttpProxy(_) => ObjectKind::HttpProxy,
            KubeObject::Gateway(_) => ObjectKind::Gateway,
            KubeObject::HttpRoute(_) => ObjectKind::HttpRoute,
            KubeObject::TlsRoute(_) => ObjectKind::TlsRoute,
            KubeObject::GrpcRoute(_) => ObjectKind::GrpcRoute,
            KubeObject::ReferenceGrant(_) => ObjectKind::ReferenceGrant,
            KubeObject::Service(_) => ObjectKind::Service,
            KubeObject::EndpointSlice(_) => ObjectKind::EndpointSlice,
            KubeObject::Secret(_) => ObjectKind::Secret,
            KubeObject::ExtensionService(_) => ObjectKind::ExtensionService,
            KubeObject::TlsCertificateDelegation(_) => ObjectKind::TlsCertificateDelegation,
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        let (namespace, name) = match self {
            KubeObject::Ingress(o) => (o.namespace(), o.name_any()),
            KubeObject::HttpProxy(o) => (o.namespace(), o.name_any()),
            KubeObject::Gateway(o) => (o.namespace(), o.name_any()),
            KubeObject::HttpRoute(o) => (o.namespace(), o.name_any()),
            KubeObject::TlsRoute(o) => (o.namespace(), o.name_any()),
            KubeObject::GrpcRoute(o) => (o.namespace(), o.name_any()),
            KubeObject::ReferenceGrant(o) => (o.namespace(), o.name_any()),
            KubeObject::Service(o) => (o.namespace(), o.name_any()),
            KubeObject::EndpointSlice(o) => (o.namespace(), o.name_any()),
            KubeObject::Secret(o) => (o.namespace(), o.name_any()),
            KubeObject::ExtensionService(o) => (o.namespace(), o.name_any()),
            KubeObject::TlsCertificateDelegation(o) => (o.namespace(), o.name_any()),
        };
        ObjectRef::new(namespace.unwrap_or_default(), name)
    }

    /// Orchestrator-assigned resource version, empty when unset.
    pub fn resource_version(&self) -> String {
        match self {
            KubeObject::Ingress(o) => o.resource_version(),
            KubeObject::HttpProxy(o) => o.resource_version(),
            KubeObject::Gateway(o) => o.resource_version(),
            KubeObject::HttpRoute(o) => o.resource_version(),
            KubeObject::TlsRoute(o) => o.resource_version(),
            KubeObject::GrpcRoute(o) => o.resource_version(),
            KubeObject::ReferenceGrant(o) => o.resource_version(),
            KubeObject::Service(o) => o.resource_version(),
            KubeObject::EndpointSlice(o) => o.resource_version(),
            KubeObject::Secret(o) => o.resource_version(),
            KubeObject::ExtensionService(o) => o.resource_version(),
            KubeObject::TlsCertificateDelegation(o) => o.resource_version(),
        }
        .unwrap_or_default()
    }

    /// `metadata.generation`, used by the status writer's staleness guard.
    pub fn generation(&self) -> Option<i64> {
        match self {
            KubeObject::Ingress(o) => o.metadata.generation,
            KubeObject::HttpProxy(o) => o.metadata.generation,
            KubeObject::Gateway(o) => o.metadata.generation,
            KubeObject::HttpRoute(o) => o.metadata.generation,
            KubeObject::TlsRoute(o) => o.metadata.generation,
            KubeObject::GrpcRoute(o) => o.metadata.generation,
            KubeObject::ReferenceGrant(o) => o.metadata.generation,
            KubeObject::Service(o) => o.metadata.generation,
            KubeObject::EndpointSlice(o) => o.metadata.generation,
            KubeObject::Secret(o) => o.metadata.generation,
            KubeObject::ExtensionService(o) => o.metadata.generation,
            KubeObject::TlsCertificateDelegation(o) => o.metadata.generation,
        }
    }
}
