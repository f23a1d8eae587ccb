//! Discovery service endpoints: the aggregated service (all types over one
//! stream) plus one thin service per resource type. All of them share the
//! stream machinery in [`super::stream`]; the per-type services merely pin
//! the type URL before handing requests to the shared loop.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use futures::TryStreamExt;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;
use uuid::Uuid;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryService;
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryService;

use crate::xds::cache::XdsCache;
use crate::xds::resources::{
    CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, SECRET_TYPE_URL,
};

use super::stream::{run_delta_loop, run_sotw_loop};

type SotwStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

/// Unary fetch: one snapshot of the requested type, no stream state.
fn fetch_response(cache: &XdsCache, request: &DiscoveryRequest, type_url: &str) -> DiscoveryResponse {
    let names: HashSet<String> = request.resource_names.iter().cloned().collect();
    let resources = cache.resources(type_url, &names);
    DiscoveryResponse {
        version_info: cache.type_version(type_url).to_string(),
        resources: resources.into_iter().map(|r| r.body).collect(),
        type_url: type_url.to_string(),
        nonce: Uuid::new_v4().to_string(),
        ..Default::default()
    }
}

/// Pin a type URL onto every request of a per-type stream.
fn with_type_url<S>(
    stream: S,
    type_url: &'static str,
) -> impl Stream<Item = Result<DiscoveryRequest, Status>> + Unpin + Send + 'static
where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Unpin + Send + 'static,
{
    stream.map_ok(move |mut request| {
        if request.type_url.is_empty() {
            request.type_url = type_url.to_string();
        }
        request
    })
}

fn with_delta_type_url<S>(
    stream: S,
    type_url: &'static str,
) -> impl Stream<Item = Result<DeltaDiscoveryRequest, Status>> + Unpin + Send + 'static
where
    S: Stream<Item = Result<DeltaDiscoveryRequest, Status>> + Unpin + Send + 'static,
{
    stream.map_ok(move |mut request| {
        if request.type_url.is_empty() {
            request.type_url = type_url.to_string();
        }
        request
    })
}

/// Aggregated discovery: every type multiplexed over one stream, partitioned
/// by the type URL each message carries.
pub struct AggregatedDiscovery {
    cache: Arc<XdsCache>,
    shutdown: CancellationToken,
}

impl AggregatedDiscovery {
    pub fn new(cache: Arc<XdsCache>, shutdown: CancellationToken) -> Self {
        Self { cache, shutdown }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AggregatedDiscovery {
    type StreamAggregatedResourcesStream = SotwStream;
    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        info!("ADS stream established");
        let stream = run_sotw_loop(
            self.cache.clone(),
            request.into_inner(),
            "ads",
            self.shutdown.child_token(),
        );
        Ok(Response::new(Box::pin(stream)))
    }

    async fn delta_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        info!("delta ADS stream established");
        let stream = run_delta_loop(
            self.cache.clone(),
            request.into_inner(),
            "delta-ads",
            self.shutdown.child_token(),
        );
        Ok(Response::new(Box::pin(stream)))
    }
}

macro_rules! per_type_service {
    ($name:ident, $trait_:ident, $type_url:expr, $label:literal,
     $stream_fn:ident, $delta_fn:ident, $fetch_fn:ident,
     $stream_assoc:ident, $delta_assoc:ident) => {
        pub struct $name {
            cache: Arc<XdsCache>,
            shutdown: CancellationToken,
        }

        impl $name {
            pub fn new(cache: Arc<XdsCache>, shutdown: CancellationToken) -> Self {
                Self { cache, shutdown }
            }
        }

        #[tonic::async_trait]
        impl $trait_ for $name {
            type $stream_assoc = SotwStream;
            type $delta_assoc = DeltaStream;

            async fn $stream_fn(
                &self,
                request: Request<tonic::Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_assoc>, Status> {
                info!(concat!($label, " stream established"));
                let stream = run_sotw_loop(
                    self.cache.clone(),
                    with_type_url(request.into_inner(), $type_url),
                    $label,
                    self.shutdown.child_token(),
                );
                Ok(Response::new(Box::pin(stream)))
            }

            async fn $delta_fn(
                &self,
                request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_assoc>, Status> {
                info!(concat!("delta ", $label, " stream established"));
                let stream = run_delta_loop(
                    self.cache.clone(),
                    with_delta_type_url(request.into_inner(), $type_url),
                    $label,
                    self.shutdown.child_token(),
                );
                Ok(Response::new(Box::pin(stream)))
            }

            async fn $fetch_fn(
                &self,
                request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                Ok(Response::new(fetch_response(&self.cache, request.get_ref(), $type_url)))
            }
        }
    };
}

per_type_service!(
    ClusterDiscovery,
    ClusterDiscoveryService,
    CLUSTER_TYPE_URL,
    "cds",
    stream_clusters,
    delta_clusters,
    fetch_clusters,
    StreamClustersStream,
    DeltaClustersStream
);

per_type_service!(
    EndpointDiscovery,
    EndpointDiscoveryService,
    ENDPOINT_TYPE_URL,
    "eds",
    stream_endpoints,
    delta_endpoints,
    fetch_endpoints,
    StreamEndpointsStream,
    DeltaEndpointsStream
);

per_type_service!(
    ListenerDiscovery,
    ListenerDiscoveryService,
    LISTENER_TYPE_URL,
    "lds",
    stream_listeners,
    delta_listeners,
    fetch_listeners,
    StreamListenersStream,
    DeltaListenersStream
);

per_type_service!(
    RouteDiscovery,
    RouteDiscoveryService,
    ROUTE_TYPE_URL,
    "rds",
    stream_routes,
    delta_routes,
    fetch_routes,
    StreamRoutesStream,
    DeltaRoutesStream
);

per_type_service!(
    SecretDiscovery,
    SecretDiscoveryService,
    SECRET_TYPE_URL,
    "sds",
    stream_secrets,
    delta_secrets,
    fetch_secrets,
    StreamSecretsStream,
    DeltaSecretsStream
);
