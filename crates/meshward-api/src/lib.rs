//! meshward-api: REST API for the meshward server.
//!
//! Clients register their overlay address here; operators query the
//! registry, evict dead entries, and scrape metrics.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/clients/remember` | Register or refresh a client address |
//! | GET | `/clients` | List every known client |
//! | GET | `/clients/active` | List clients seen within `stale_after_secs` |
//! | GET | `/clients/stats` | Client counts by state |
//! | DELETE | `/clients/{identity}` | Forget one client |
//! | POST | `/clients/evict` | Forget clients older than `max_age_secs` |
//! | GET | `/health` | Scheduler and persistence health |
//! | GET | `/config` | Effective server configuration |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod validate;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{delete, get, post};
use meshward_core::{ConfigHandle, ServerConfig};
use meshward_registry::ClientRegistry;
use meshward_scheduler::PingScheduler;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ClientRegistry>,
    pub scheduler: Arc<PingScheduler>,
    pub config: ConfigHandle<ServerConfig>,
    pub started: Instant,
}

impl ApiState {
    pub fn new(
        registry: Arc<ClientRegistry>,
        scheduler: Arc<PingScheduler>,
        config: ConfigHandle<ServerConfig>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            config,
            started: Instant::now(),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/clients", get(handlers::list_clients))
        .route("/clients/remember", post(handlers::remember))
        .route("/clients/active", get(handlers::list_active_clients))
        .route("/clients/stats", get(handlers::client_stats))
        .route("/clients/evict", post(handlers::evict_stale))
        .route("/clients/{identity}", delete(handlers::forget_client))
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::current_config))
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
}
