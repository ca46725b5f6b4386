//! Worker host entry point.

use common::HealthCheck;
use host::config::Config;
use saga::HandlerRegistry;
use scheduler::{InMemoryScheduleStore, PostgresScheduleStore, ScheduleStore};
use step_store::{InMemoryStepStore, PostgresStepStore, StepStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Runs the host on the chosen stores with no handlers registered.
async fn run<S, Q>(config: Config, steps: S, schedules: Q)
where
    S: StepStore + HealthCheck + Clone + 'static,
    Q: ScheduleStore + HealthCheck + Clone + 'static,
{
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    host::serve(
        config,
        HandlerRegistry::builder().build(),
        steps,
        schedules,
        metrics_handle,
        shutdown_signal(),
    )
    .await
    .expect("server error");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::PgPool::connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let steps = PostgresStepStore::new(pool.clone());
            steps
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL stores");
            run(config, steps, PostgresScheduleStore::new(pool)).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory stores");
            run(config, InMemoryStepStore::new(), InMemoryScheduleStore::new()).await;
        }
    }
}
