use crate::cli::ServeArgs;
use crate::infra::{build_pipeline, AppState};
use crate::routes::with_document_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use fiscal_pipeline::config::AppConfig;
use fiscal_pipeline::error::AppError;
use fiscal_pipeline::pipeline::StatusScheduler;
use fiscal_pipeline::telemetry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let pipeline = build_pipeline(&config.fiscal)?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler_task = if args.no_scheduler {
        None
    } else {
        let scheduler = StatusScheduler::new(
            Arc::clone(&pipeline),
            config.fiscal.scheduler_settings(),
        );
        let mut stop = stop_rx;
        Some(tokio::spawn(async move {
            scheduler
                .run(async move {
                    let _ = stop.wait_for(|stopped| *stopped).await;
                })
                .await;
        }))
    };

    let app = with_document_routes(pipeline)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        worker = %config.fiscal.worker_id,
        "fiscal document worker ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;

    readiness_flag.store(false, Ordering::Release);
    let _ = stop_tx.send(true);
    if let Some(task) = scheduler_task {
        if let Err(err) = task.await {
            warn!(error = %err, "scheduler task ended abnormally");
        }
    }
    info!("fiscal document worker stopped");
    Ok(())
}
