//! Status writer: pushes condition sets back to the orchestrator.
//!
//! Writes go through the [`StatusClient`] trait so the pipeline tests run
//! without an API server. Conflicts (optimistic concurrency) retry with
//! exponential backoff; a write is abandoned once the object's generation
//! has moved past the one the conditions were computed against.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{ConditionStatus, StatusCondition};
use crate::errors::IsolineError;
use crate::k8s::{ExtensionService, HTTPProxy, ObjectKind, ObjectRef};
use crate::Result;

/// Identity the controller attributes its writes to.
pub const CONTROLLER_NAME: &str = "isoline.dev/ingress-controller";

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Orchestrator-facing side of the writer.
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Patch the `status` subresource of the target object.
    async fn patch_status(
        &self,
        kind: ObjectKind,
        target: &ObjectRef,
        status: serde_json::Value,
    ) -> Result<()>;

    /// Current `metadata.generation` of the target, `None` if gone.
    async fn generation(&self, kind: ObjectKind, target: &ObjectRef) -> Result<Option<i64>>;
}

/// Production client backed by the Kubernetes API.
pub struct KubeStatusClient {
    client: Client,
}

impl KubeStatusClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn patch_status(
        &self,
        kind: ObjectKind,
        target: &ObjectRef,
        status: serde_json::Value,
    ) -> Result<()> {
        let params = PatchParams::apply(CONTROLLER_NAME);
        let patch = Patch::Merge(json!({ "status": status }));
        match kind {
            ObjectKind::HttpProxy => {
                let api: Api<HTTPProxy> = Api::namespaced(self.client.clone(), &target.namespace);
                api.patch_status(&target.name, &params, &patch)
                    .await
                    .map_err(|e| IsolineError::kubernetes(e, format!("patch status {}", target)))?;
            }
            ObjectKind::ExtensionService => {
                let api: Api<ExtensionService> =
                    Api::namespaced(self.client.clone(), &target.namespace);
                api.patch_status(&target.name, &params, &patch)
                    .await
                    .map_err(|e| IsolineError::kubernetes(e, format!("patch status {}", target)))?;
            }
            other => {
                debug!(kind = %other, object = %target, "kind has no writable status schema");
            }
        }
        Ok(())
    }

    async fn generation(&self, kind: ObjectKind, target: &ObjectRef) -> Result<Option<i64>> {
        let meta = match kind {
            ObjectKind::HttpProxy => {
                let api: Api<HTTPProxy> = Api::namespaced(self.client.clone(), &target.namespace);
                api.get_metadata_opt(&target.name)
                    .await
                    .map_err(|e| IsolineError::kubernetes(e, format!("get metadata {}", target)))?
                    .map(|m| m.metadata)
            }
            ObjectKind::ExtensionService => {
                let api: Api<ExtensionService> =
                    Api::namespaced(self.client.clone(), &target.namespace);
                api.get_metadata_opt(&target.name)
                    .await
                    .map_err(|e| IsolineError::kubernetes(e, format!("get metadata {}", target)))?
                    .map(|m| m.metadata)
            }
            _ => None,
        };
        Ok(meta.and_then(|m| m.generation))
    }
}

/// True for optimistic-concurrency failures worth retrying in place.
fn is_conflict(error: &IsolineError) -> bool {
    match error {
        IsolineError::Kubernetes { source: kube::Error::Api(response), .. } => {
            response.code == 409
        }
        _ => false,
    }
}

pub struct StatusWriter<C> {
    client: Arc<C>,
}

impl<C: StatusClient + 'static> StatusWriter<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Consume condition deltas until the channel closes or `token` fires.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<Vec<StatusCondition>>,
        token: CancellationToken,
    ) {
        info!("status writer started");
        loop {
            let conditions = tokio::select! {
                _ = token.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            for condition in conditions {
                self.write_condition(&condition).await;
            }
        }
        info!("status writer stopped");
    }

    async fn write_condition(&self, condition: &StatusCondition) {
        let target = condition.target();
        let status = render_status(condition);

        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.patch_status(condition.kind, &target, status.clone()).await {
                Ok(()) => {
                    debug!(
                        kind = %condition.kind,
                        object = %target,
                        reason = %condition.reason,
                        "status written"
                    );
                    return;
                }
                Err(error) if is_conflict(&error) => {
                    // The object moved underneath us. If its generation has
                    // advanced past what we observed, a rebuild is already
                    // pending and this write is stale.
                    if let (Some(observed), Ok(Some(current))) = (
                        condition.observed_generation,
                        self.client.generation(condition.kind, &target).await,
                    ) {
                        if current > observed {
                            debug!(
                                kind = %condition.kind,
                                object = %target,
                                observed,
                                current,
                                "abandoning stale status write"
                            );
                            return;
                        }
                    }
                    warn!(
                        kind = %condition.kind,
                        object = %target,
                        attempt,
                        "status write conflict, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(error) => {
                    warn!(
                        kind = %condition.kind,
                        object = %target,
                        %error,
                        "status write failed"
                    );
                    return;
                }
            }
        }
        warn!(kind = %condition.kind, object = %target, "status write gave up after retries");
    }
}

/// Render one condition into the object's status schema.
fn render_status(condition: &StatusCondition) -> serde_json::Value {
    let current_status = match condition.status {
        ConditionStatus::True => "valid",
        ConditionStatus::False => "invalid",
        ConditionStatus::Unknown => "orphaned",
    };
    json!({
        "currentStatus": current_status,
        "description": condition.message,
        "conditions": [{
            "type": condition.condition_type,
            "status": condition.status.as_str(),
            "reason": condition.reason,
            "message": condition.message,
            "observedGeneration": condition.observed_generation,
        }],
    })
}
