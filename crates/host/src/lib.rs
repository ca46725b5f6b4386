//! Worker host for the saga engine.
//!
//! Serves liveness, readiness and Prometheus endpoints next to a small saga
//! inspection API, and drives the schedule poller until shutdown.
//!
//! Services embedding the engine call [`serve`] with their own
//! [`HandlerRegistry`]; the `saga-host` binary runs the same wiring with no
//! handlers, for operating on existing saga state.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use common::HealthCheck;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{EngineConfig, HandlerRegistry, JsonSerializer, SagaDispatcher};
use scheduler::{PollerConfig, SchedulePoller, ScheduleStore};
use step_store::StepStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

pub use routes::health::Readiness;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: StepStore + Clone + 'static>(
    dispatcher: Arc<SagaDispatcher<S>>,
    readiness: Readiness,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::health::metrics))
        .with_state(metrics_handle);

    let readiness_router = Router::new()
        .route("/ready", get(routes::health::ready))
        .with_state(readiness);

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/sagas/{id}", get(routes::sagas::get::<S>))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel::<S>))
        .with_state(dispatcher)
        .merge(readiness_router)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Spawns the schedule poller, feeding due entries into `dispatcher` until
/// `shutdown` fires.
///
/// Returns `None` without spawning when the dispatcher has no handlers, since
/// every due entry would then fail to route.
pub fn spawn_poller<S, Q>(
    schedules: Q,
    dispatcher: Arc<SagaDispatcher<S>>,
    config: PollerConfig,
    shutdown: broadcast::Receiver<()>,
) -> Option<JoinHandle<()>>
where
    S: StepStore + Clone + 'static,
    Q: ScheduleStore + 'static,
{
    if dispatcher.registry().is_empty() {
        tracing::warn!("no saga handlers registered, schedule poller not started");
        return None;
    }
    let poller = SchedulePoller::new(schedules, dispatcher, config);
    Some(tokio::spawn(async move { poller.run(shutdown).await }))
}

/// Wires the engine around `registry` on top of the given stores and serves
/// HTTP until `shutdown` completes, then stops the poller.
pub async fn serve<S, Q>(
    config: Config,
    registry: HandlerRegistry,
    steps: S,
    schedules: Q,
    metrics_handle: PrometheusHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()>
where
    S: StepStore + HealthCheck + Clone + 'static,
    Q: ScheduleStore + HealthCheck + Clone + 'static,
{
    if registry.is_empty() {
        tracing::warn!("no saga handlers registered, every dispatch will be rejected");
    }

    let serializer = Arc::new(JsonSerializer::new());
    let engine = EngineConfig::from_env();
    tracing::info!(application_id = %engine.application_id, "saga engine configured");
    let dispatcher = Arc::new(
        SagaDispatcher::builder(steps.clone(), registry)
            .serializer(serializer.clone())
            .config(engine)
            .build(),
    );

    let checks: Vec<Arc<dyn HealthCheck>> =
        vec![Arc::new(steps), Arc::new(schedules.clone()), serializer];
    let readiness = Readiness {
        checks,
        timeout: config.readiness_timeout,
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let poller = spawn_poller(
        schedules,
        dispatcher.clone(),
        PollerConfig::from_env(),
        shutdown_rx,
    );

    let app = create_app(dispatcher, readiness, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting saga host");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = shutdown_tx.send(());
    if let Some(poller) = poller {
        if let Err(e) = poller.await {
            tracing::error!(error = %e, "schedule poller task failed");
        }
    }
    tracing::info!("host shut down gracefully");
    served
}
