//! A reverse request broker: inbound HTTP requests on short URL slugs are
//! dispatched to remote handlers connected over a persistent control
//! channel, and the handler's structured response becomes the HTTP reply.
//!
//! The crate is organised around the dispatch engine ([`engine::Engine`]),
//! which owns the slug registry ([`registry`]) and the pending-request
//! correlation table ([`pending`]). HTTP requests arrive through
//! [`http::build_router`]; handlers connect through [`control::run_session`]
//! on the same listener's `/ws` path.

pub mod auth;
pub mod config;
pub mod control;
pub mod engine;
pub mod errors;
pub mod http;
pub mod observability;
pub mod pending;
pub mod ratelimit;
pub mod registry;
pub mod telemetry;
pub mod types;
pub mod validation;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::Config;
pub use engine::Engine;

/// The running broker: an assembled router bound to a listener, plus the
/// background maintenance tasks it owns for its lifetime.
pub struct Application {
    router: axum::Router,
    bind_address: String,
    engine: Arc<Engine>,
    maintenance_tasks: Vec<tokio::task::JoinHandle<()>>,
    maintenance_shutdown: CancellationToken,
    shutdown_grace_period: std::time::Duration,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let engine = Engine::new(config.clone());
        let state = http::AppState { config: config.clone(), engine: engine.clone() };
        let router = http::build_router(state);

        let maintenance_shutdown = CancellationToken::new();
        let mut maintenance_tasks = observability::spawn_maintenance_tasks(
            engine.sink_handle(),
            engine.stats_handle(),
            config.stats_retention_days,
            maintenance_shutdown.clone(),
        );
        maintenance_tasks.push(spawn_rate_limit_pruning(engine.clone(), maintenance_shutdown.clone()));

        Ok(Self {
            router,
            bind_address: config.bind_address(),
            engine,
            maintenance_tasks,
            maintenance_shutdown,
            shutdown_grace_period: config.shutdown_grace_period,
        })
    }

    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.bind_address).await?;
        info!("broker listening on http://{}", self.bind_address);

        let engine = self.engine.clone();
        let grace_period = self.shutdown_grace_period;
        let graceful_shutdown = async move {
            shutdown.await;
            info!("shutdown signal received, draining in-flight requests");
            if tokio::time::timeout(grace_period, engine.shutdown()).await.is_err() {
                tracing::warn!(severity = "server", "shutdown grace period elapsed before drain completed");
            }
        };

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(graceful_shutdown)
            .await?;

        self.maintenance_shutdown.cancel();
        for task in self.maintenance_tasks {
            let _ = task.await;
        }

        Ok(())
    }
}

/// Drops rate-limit buckets whose windows have gone empty, bounding the
/// tracker's size under sustained traffic from a changing set of addresses.
fn spawn_rate_limit_pruning(engine: Arc<Engine>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => engine.rate_limit().prune_idle(),
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
