//! Application startup and lifecycle management.
//!
//! Builds every adapter, spawns the pipeline workers and serves the
//! health/metrics HTTP surface until shutdown. Shutdown order: stop the
//! schedulers and worker hosts, wait for in-flight jobs, then close the
//! broker and finally the database pool.

use crate::config::Config;
use crate::error::AppError;
use crate::models::Operator;
use crate::services::queue::{JobQueue, RedisJobQueue, WorkerHost};
use crate::services::{
    get_metrics, init_metrics, AmqpBroker, Database, GpGatewayClient, RedisLedger,
    RobiGatewayClient, DEFAULT_PAGE_SIZE,
};
use crate::workers::{
    run_daily_at, run_every, NotificationRetrier, OperatorWorker, RenewalDispatcher,
    ResultConsumer, BUSINESS_TZ,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use secrecy::ExposeSecret;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Hour (local, Asia/Dhaka) at which the daily dispatch runs.
const DISPATCH_HOUR: u32 = 1;
const DISPATCH_MINUTE: u32 = 0;

const CONSUMER_INTERVAL: Duration = Duration::from_secs(10);
const RETRIER_INTERVAL: Duration = Duration::from_secs(300);

/// How long workers get to finish in-flight jobs at shutdown.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(35);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub ledger: Arc<RedisLedger>,
    pub started_at: Instant,
}

/// Health check endpoint for liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "timestamp": Utc::now().to_rfc3339(),
            "service": state.config.service_name,
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness check endpoint: the stores must answer.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.db.health_check().await {
        tracing::warn!(error = %e, "Readiness check failed - database unavailable");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if let Err(e) = state.ledger.health_check().await {
        tracing::warn!(error = %e, "Readiness check failed - redis unavailable");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Application container for managing the service lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    broker: Arc<AmqpBroker>,
    gp_queue: Arc<RedisJobQueue>,
    robi_queue: Arc<RedisJobQueue>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.connection_limit,
            config.database.pool_timeout_secs,
            config.database.connect_timeout_secs,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;
        db.run_migrations().await?;
        let db = Arc::new(db);

        let redis_client = redis::Client::open(config.redis.url())?;
        let redis_manager = redis_client.get_connection_manager().await.map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            AppError::from(e)
        })?;
        let ledger = Arc::new(RedisLedger::from_manager(
            redis_manager.clone(),
            config.redis.key_prefix.clone(),
        ));
        ledger.health_check().await?;

        let broker = Arc::new(AmqpBroker::new(config.rmq.amqp_uri()));
        broker.connect().await.map_err(|e| {
            error!(error = %e, "Failed to connect to RabbitMQ");
            e
        })?;

        let key_prefix = config.redis.key_prefix.as_deref();
        let gp_queue = Arc::new(RedisJobQueue::new(
            Operator::Gp.queue_name(),
            redis_manager.clone(),
            key_prefix,
        ));
        let robi_queue = Arc::new(RedisJobQueue::new(
            Operator::Robi.queue_name(),
            redis_manager,
            key_prefix,
        ));

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        info!(port = port, "Renewal service listener bound");

        let state = AppState {
            config,
            db,
            ledger,
            started_at: Instant::now(),
        };

        Ok(Self {
            port,
            listener,
            state,
            broker,
            gp_queue,
            robi_queue,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the pipeline and HTTP surface until `shutdown` resolves.
    pub async fn run_until_stopped(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) -> Result<(), AppError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut worker_handles = Vec::new();

        let config = &self.state.config;
        let db = self.state.db.clone();
        let ledger = self.state.ledger.clone();

        // Operator worker hosts.
        let gp_gateway = Arc::new(GpGatewayClient::new(config.gp.clone())?);
        let gp_worker = Arc::new(OperatorWorker::new(
            Operator::Gp,
            gp_gateway,
            self.gp_queue.clone(),
            ledger.clone(),
        ));
        let gp_host = WorkerHost::new(self.gp_queue.clone(), config.gp.concurrency);
        let gp_shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            gp_host.run(gp_worker, gp_shutdown).await;
        }));

        let robi_gateway = Arc::new(RobiGatewayClient::new(config.robi.clone())?);
        let robi_worker = Arc::new(OperatorWorker::new(
            Operator::Robi,
            robi_gateway,
            self.robi_queue.clone(),
            ledger.clone(),
        ));
        let robi_host = WorkerHost::new(self.robi_queue.clone(), config.robi.concurrency);
        let robi_shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            robi_host.run(robi_worker, robi_shutdown).await;
        }));

        // Daily dispatcher.
        let mut queues: HashMap<&'static str, Arc<dyn JobQueue>> = HashMap::new();
        queues.insert(Operator::Gp.queue_name(), self.gp_queue.clone());
        queues.insert(Operator::Robi.queue_name(), self.robi_queue.clone());
        let dispatcher = Arc::new(RenewalDispatcher::new(
            db.clone(),
            queues,
            DEFAULT_PAGE_SIZE,
        ));
        let dispatch_shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            run_daily_at(
                "renewal_dispatch",
                DISPATCH_HOUR,
                DISPATCH_MINUTE,
                BUSINESS_TZ,
                dispatch_shutdown,
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        if let Err(e) = dispatcher.run_once().await {
                            error!(error = %e, "Renewal dispatch failed");
                        }
                    }
                },
            )
            .await;
        }));

        // Result consumer.
        let consumer = Arc::new(ResultConsumer::new(
            ledger.clone(),
            db.clone(),
            db.clone(),
            self.broker.clone(),
        ));
        let consumer_shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            run_every(
                "result_consumer",
                CONSUMER_INTERVAL,
                consumer_shutdown,
                move || {
                    let consumer = consumer.clone();
                    async move {
                        if let Err(e) = consumer.drain_once().await {
                            error!(error = %e, "Result drain failed");
                        }
                    }
                },
            )
            .await;
        }));

        // Notification fallback retrier.
        let retrier = Arc::new(NotificationRetrier::new(
            ledger.clone(),
            self.broker.clone(),
        ));
        let retrier_shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            run_every(
                "notification_retrier",
                RETRIER_INTERVAL,
                retrier_shutdown,
                move || {
                    let retrier = retrier.clone();
                    async move {
                        if let Err(e) = retrier.sweep_once().await {
                            error!(error = %e, "Fallback sweep failed");
                        }
                    }
                },
            )
            .await;
        }));

        // HTTP surface.
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone());

        let mut server_shutdown = shutdown_rx.clone();
        let server = axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            });
        let mut server_task = tokio::spawn(async move { server.await });

        info!(
            service = %self.state.config.service_name,
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready"
        );

        tokio::pin!(shutdown);
        let server_finished = tokio::select! {
            _ = &mut shutdown => {
                info!("Graceful shutdown initiated");
                false
            }
            result = &mut server_task => {
                if let Ok(Err(e)) = result {
                    error!(error = %e, "HTTP server error");
                }
                true
            }
        };

        let _ = shutdown_tx.send(true);

        for handle in worker_handles {
            if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, handle)
                .await
                .is_err()
            {
                error!("Worker did not stop within the grace period");
            }
        }
        if !server_finished {
            let _ = tokio::time::timeout(Duration::from_secs(10), server_task).await;
        }

        self.broker.close().await;
        self.state.db.close().await;

        info!("Service shutdown complete");
        Ok(())
    }
}
