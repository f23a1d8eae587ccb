use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use isoline::config::load_config;
use isoline::dag::builder::BuildConfig;
use isoline::event::EventHandler;
use isoline::k8s::{spawn_watchers, KubernetesCache};
use isoline::observability::{init_logging, LogFormat};
use isoline::status::{KubeStatusClient, StatusWriter};
use isoline::xds::{start_xds_server, ListenerConversionConfig, Snapshotter, XdsCache};
use isoline::{APP_NAME, VERSION};

#[derive(Debug, Parser)]
#[command(name = "isoline", about = "Kubernetes ingress control plane serving xDS to Envoy")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Process log output: "text" or "json"
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_format);

    // Bad configuration is fatal; the orchestrator restarts us after a fix.
    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        app_name = APP_NAME,
        version = VERSION,
        xds_address = %config.xds_server.bind_address(),
        "starting Isoline control plane"
    );

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            error!(%error, "failed to connect to the Kubernetes API");
            std::process::exit(1);
        }
    };

    let listener_config = match ListenerConversionConfig::from_app(&config) {
        Ok(listener_config) => listener_config,
        Err(error) => {
            error!(%error, "invalid listener configuration");
            std::process::exit(1);
        }
    };

    let token = CancellationToken::new();
    let kube_cache = Arc::new(KubernetesCache::new(config.ingress.clone()));
    let xds_cache = Arc::new(XdsCache::new());
    let snapshotter = Arc::new(Snapshotter::new(xds_cache.clone(), listener_config));

    let (event_tx, event_rx) = mpsc::channel(1024);
    let (status_tx, status_rx) = mpsc::channel(64);

    let watcher_handles = spawn_watchers(client.clone(), event_tx, token.clone());

    let handler = EventHandler::new(
        kube_cache,
        BuildConfig::from_app(&config),
        snapshotter,
        status_tx,
        config.rebuild.holdoff(),
        config.rebuild.max_holdoff(),
    );
    let handler_task = tokio::spawn(handler.run(event_rx, token.clone()));

    let writer = StatusWriter::new(Arc::new(KubeStatusClient::new(client)));
    let writer_task = tokio::spawn(writer.run(status_rx, token.clone()));

    // Cancellation unwinds outside-in: signal -> server shutdown -> stream
    // tokens -> watchers and workers.
    let signal_token = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    if let Err(error) = start_xds_server(&config.xds_server, xds_cache, token.clone()).await {
        error!(%error, "xDS server failed");
        token.cancel();
        std::process::exit(1);
    }

    token.cancel();
    let _ = handler_task.await;
    let _ = writer_task.await;
    for handle in watcher_handles {
        let _ = handle.await;
    }

    info!("shutdown complete");
}
