//! Orchestrator watchers.
//!
//! One `kube::runtime::watcher` task per resource kind, all funnelling into a
//! single bounded event channel consumed by the event handler. Watch failures
//! are retried with the watcher's default backoff; the tasks exit on
//! cancellation.

use std::fmt::Debug;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::apis::{
    ExtensionService, GRPCRoute, Gateway, HTTPProxy, HTTPRoute, ReferenceGrant,
    TLSCertificateDelegation, TLSRoute,
};
use super::object::KubeObject;

/// A single mutation observed on the orchestrator.
#[derive(Debug, Clone)]
pub enum ObjectEvent {
    /// OnAdd and OnUpdate collapse into one upsert; the cache replaces in
    /// place.
    Upsert(KubeObject),
    Delete(KubeObject),
}

impl ObjectEvent {
    pub fn object(&self) -> &KubeObject {
        match self {
            ObjectEvent::Upsert(obj) | ObjectEvent::Delete(obj) => obj,
        }
    }
}

/// Spawn one watcher task per resource kind. The returned handles finish when
/// `token` is cancelled or the API connection is permanently lost.
pub fn spawn_watchers(
    client: Client,
    tx: mpsc::Sender<ObjectEvent>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_kind(Api::<Ingress>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::Ingress(Box::new(o))
        }),
        spawn_kind(Api::<HTTPProxy>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::HttpProxy(Box::new(o))
        }),
        spawn_kind(Api::<Gateway>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::Gateway(Box::new(o))
        }),
        spawn_kind(Api::<HTTPRoute>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::HttpRoute(Box::new(o))
        }),
        spawn_kind(Api::<TLSRoute>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::TlsRoute(Box::new(o))
        }),
        spawn_kind(Api::<GRPCRoute>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::GrpcRoute(Box::new(o))
        }),
        spawn_kind(Api::<ReferenceGrant>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::ReferenceGrant(Box::new(o))
        }),
        spawn_kind(Api::<Service>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::Service(Box::new(o))
        }),
        spawn_kind(Api::<EndpointSlice>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::EndpointSlice(Box::new(o))
        }),
        spawn_kind(Api::<Secret>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::Secret(Box::new(o))
        }),
        spawn_kind(Api::<ExtensionService>::all(client.clone()), tx.clone(), token.clone(), |o| {
            KubeObject::ExtensionService(Box::new(o))
        }),
        spawn_kind(Api::<TLSCertificateDelegation>::all(client), tx, token, |o| {
            KubeObject::TlsCertificateDelegation(Box::new(o))
        }),
    ]
}

fn spawn_kind<K, F>(
    api: Api<K>,
    tx: mpsc::Sender<ObjectEvent>,
    token: CancellationToken,
    wrap: F,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
    F: Fn(K) -> KubeObject + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        info!(kind = %kind, "starting watcher");

        let mut stream =
            watcher(api, watcher::Config::default()).default_backoff().boxed();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(kind = %kind, "watcher cancelled");
                    break;
                }
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj))) => {
                        if tx.send(ObjectEvent::Upsert(wrap(obj))).await.is_err() {
                            debug!(kind = %kind, "event channel closed, stopping watcher");
                            break;
                        }
                    }
                    Ok(Some(watcher::Event::Delete(obj))) => {
                        if tx.send(ObjectEvent::Delete(wrap(obj))).await.is_err() {
                            debug!(kind = %kind, "event channel closed, stopping watcher");
                            break;
                        }
                    }
                    Ok(Some(watcher::Event::Init | watcher::Event::InitDone)) => {}
                    Ok(None) => {
                        warn!(kind = %kind, "watch stream ended");
                        break;
                    }
                    Err(error) => {
                        // The backoff wrapper re-establishes the watch; a
                        // surfaced error here is informational.
                        warn!(kind = %kind, %error, "watch error, retrying");
                    }
                }
            }
        }
    })
}
