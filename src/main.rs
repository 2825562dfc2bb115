//! Gate Camserver - Parking Gate Live Camera Ingestion
//!
//! Main entry point for the Camserver application.

use gate_camserver::{
    camera_proxy::CameraProxy,
    camera_status_tracker::CameraStatusTracker,
    detection_poller::DetectionPollingEngine,
    detection_source::{BackendDetectionSource, CameraDetectionSource, DetectionSource},
    detection_store::{open_store, GateStore},
    gate_registry::GateRegistry,
    passage_client::PassageClient,
    realtime_hub::RealtimeHub,
    state::{AppConfig, AppState, DetectionSourceKind},
    stream_session::{http_transports, StreamSessionController},
    web_api,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gate_camserver=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Gate Camserver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = AppConfig::default();
    tracing::info!(
        gates_file = %config.gates_file.display(),
        backend_api_url = %config.backend_api_url,
        storage = ?config.storage,
        poll_interval_ms = config.polling.interval.as_millis() as u64,
        relay_configured = config.stream.relay_url.is_some(),
        "Configuration loaded"
    );

    let gates = Arc::new(GateRegistry::load(&config.gates_file).await?);
    tracing::info!(gates = gates.len(), "GateRegistry loaded");

    // Configured camera hosts are always reachable through the proxy
    config.proxy.allowlist.extend(gates.camera_hosts());
    let proxy = Arc::new(CameraProxy::new(config.proxy.clone()));
    tracing::info!(
        allowlist_size = config.proxy.allowlist.len(),
        "CameraProxy initialized"
    );

    let kv = open_store(&config.storage).await?;
    let store = Arc::new(GateStore::new(kv));
    tracing::info!("GateStore initialized");

    let realtime = Arc::new(RealtimeHub::new());
    let tracker = Arc::new(CameraStatusTracker::new());

    let source: Arc<dyn DetectionSource> = match config.polling.source {
        DetectionSourceKind::Camera => Arc::new(CameraDetectionSource::new(proxy.clone())),
        DetectionSourceKind::Backend => {
            Arc::new(BackendDetectionSource::new(config.backend_api_url.clone()))
        }
    };

    let detections = Arc::new(DetectionPollingEngine::new(
        source,
        store,
        realtime.clone(),
        tracker,
        &config.polling,
    ));
    tracing::info!(source = ?config.polling.source, "DetectionPollingEngine initialized");

    let recovered = detections
        .recover_interrupted(gates.all().map(|g| g.gate_id))
        .await?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "Recovered interrupted passage submissions");
    }

    let streams = Arc::new(
        StreamSessionController::new(
            http_transports(proxy.clone(), &config.stream),
            config.stream.clone(),
        )
        .with_hub(realtime.clone()),
    );
    tracing::info!("StreamSessionController initialized");

    let passages = Arc::new(PassageClient::new(config.backend_api_url.clone()));

    let state = AppState {
        config,
        gates,
        proxy,
        streams,
        detections,
        passages,
        realtime,
        started_at: Instant::now(),
    };

    // Start per-gate pollers
    if state.config.polling.enabled {
        for gate in state.gates.with_cameras() {
            if let Err(e) = state.detections.start_gate(gate.clone()).await {
                tracing::error!(gate_id = gate.gate_id, error = %e, "Failed to start poller");
            }
        }
        tracing::info!(
            pollers = state.detections.running_gates().await.len(),
            "Detection polling started"
        );
    } else {
        tracing::warn!("Detection polling disabled");
    }

    let app = web_api::create_router(state.clone()).layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.detections.stop_all().await;
    state.streams.stop_all().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
