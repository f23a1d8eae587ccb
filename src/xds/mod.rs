//! Envoy xDS (eXtended Discovery Service) implementation
//!
//! Provides the gRPC server implementing Envoy's discovery protocols:
//! - ADS (Aggregated Discovery Service), SotW and Delta variants
//! - CDS / EDS / LDS / RDS / SDS as standalone services
//!
//! plus the versioned resource cache and the DAG -> Envoy converters that
//! feed it.

pub mod cache;
pub mod cluster;
pub mod endpoint;
pub mod listener;
pub mod resources;
pub mod route;
pub mod secret;
pub mod services;
pub mod snapshot;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryServiceServer;
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryServiceServer;

use crate::config::{XdsServerConfig, XdsTlsConfig};
use crate::Result;

pub use cache::XdsCache;
pub use listener::ListenerConversionConfig;
pub use services::{
    AggregatedDiscovery, ClusterDiscovery, EndpointDiscovery, ListenerDiscovery, RouteDiscovery,
    SecretDiscovery,
};
pub use snapshot::Snapshotter;

/// HTTP/2 keepalive: ping every 60 s, drop after 20 s without a pong.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Start the xDS gRPC server and serve until `shutdown` fires. Stream tasks
/// are cancelled through child tokens before the server returns.
pub async fn start_xds_server(
    config: &XdsServerConfig,
    cache: Arc<XdsCache>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = config
        .bind_address()
        .parse()
        .map_err(|e| crate::Error::config(format!("Invalid xDS address: {}", e)))?;

    let mut builder = Server::builder()
        .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT));

    if let Some(tls_config) = build_server_tls_config(config.tls.as_ref())? {
        builder = builder.tls_config(tls_config).map_err(|e| {
            crate::Error::transport(format!("Failed to apply xDS TLS configuration: {}", e))
        })?;
        if let Some(tls) = &config.tls {
            info!(
                require_client_cert = tls.require_client_cert,
                has_client_ca = tls.client_ca_path.is_some(),
                "xDS server TLS enabled"
            );
        }
    }

    info!(address = %addr, "starting xDS server");

    let server = builder
        .add_service(AggregatedDiscoveryServiceServer::new(AggregatedDiscovery::new(
            cache.clone(),
            shutdown.clone(),
        )))
        .add_service(ClusterDiscoveryServiceServer::new(ClusterDiscovery::new(
            cache.clone(),
            shutdown.clone(),
        )))
        .add_service(EndpointDiscoveryServiceServer::new(EndpointDiscovery::new(
            cache.clone(),
            shutdown.clone(),
        )))
        .add_service(ListenerDiscoveryServiceServer::new(ListenerDiscovery::new(
            cache.clone(),
            shutdown.clone(),
        )))
        .add_service(RouteDiscoveryServiceServer::new(RouteDiscovery::new(
            cache.clone(),
            shutdown.clone(),
        )))
        .add_service(SecretDiscoveryServiceServer::new(SecretDiscovery::new(
            cache,
            shutdown.clone(),
        )))
        .serve_with_shutdown(addr, shutdown.cancelled_owned());

    server.await.map_err(|e| {
        let message = e.to_string();
        if message.contains("Address already in use") || message.contains("bind") {
            crate::Error::transport(format!(
                "xDS server failed to bind to {}: port {} is already in use",
                addr,
                addr.port()
            ))
        } else {
            crate::Error::transport(format!("xDS server failed: {}", e))
        }
    })?;

    info!("xDS server stopped");
    Ok(())
}

fn build_server_tls_config(tls: Option<&XdsTlsConfig>) -> Result<Option<ServerTlsConfig>> {
    let Some(tls) = tls else { return Ok(None) };

    let cert_bytes = std::fs::read(&tls.cert_path).map_err(|e| {
        crate::Error::config(format!(
            "Failed to read xDS TLS certificate from '{}': {}",
            tls.cert_path, e
        ))
    })?;
    let key_bytes = std::fs::read(&tls.key_path).map_err(|e| {
        crate::Error::config(format!(
            "Failed to read xDS TLS private key from '{}': {}",
            tls.key_path, e
        ))
    })?;

    let identity = Identity::from_pem(cert_bytes, key_bytes);
    let mut server_tls_config = ServerTlsConfig::new().identity(identity);

    if let Some(ca_path) = &tls.client_ca_path {
        let ca_bytes = std::fs::read(ca_path).map_err(|e| {
            crate::Error::config(format!(
                "Failed to read xDS client CA certificate from '{}': {}",
                ca_path, e
            ))
        })?;
        server_tls_config = server_tls_config.client_ca_root(Certificate::from_pem(ca_bytes));
        if !tls.require_client_cert {
            server_tls_config = server_tls_config.client_auth_optional(true);
        }
    } else if tls.require_client_cert {
        return Err(crate::Error::config(
            "Client certificate verification is enabled but no client CA path is configured",
        ));
    }

    Ok(Some(server_tls_config))
}
