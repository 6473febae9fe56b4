//! Local control endpoint of a running `meshward heal`.
//!
//! Bound to loopback on `control_port`. `meshward restart`, `enable`,
//! `disable` and `status` go through it, so every trigger on a host
//! reaches the one live `HealController` and its remediation gate.
//! Holding the port is also the host-wide lock: a second `heal` cannot
//! start, and `restart` only runs in-process when it can bind the port.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/heal/status` | Phase, health snapshot and last report |
//! | POST | `/heal/restart` | Run the remediation sequence now |
//! | POST | `/heal/enable` | Turn auto-heal on |
//! | POST | `/heal/disable` | Turn auto-heal off |

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use meshward_core::ClientConfig;
use meshward_heal::{
    HealController, HealError, HealPhase, HealResult, HealthSnapshot, RemediationReport,
    RemediationStep, ServerClient,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::REQUEST_TIMEOUT;

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// State of the live controller as reported by `/heal/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealStatus {
    pub enabled: bool,
    pub phase: HealPhase,
    pub health: HealthSnapshot,
    pub last_report: Option<RemediationReport>,
}

impl HealStatus {
    fn of(controller: &HealController) -> Self {
        Self {
            enabled: controller.is_enabled(),
            phase: controller.phase(),
            health: controller.snapshot(),
            last_report: controller.last_report(),
        }
    }
}

pub fn router(controller: Arc<HealController>) -> Router {
    Router::new()
        .route("/heal/status", get(status))
        .route("/heal/restart", post(restart))
        .route("/heal/enable", post(enable))
        .route("/heal/disable", post(disable))
        .with_state(controller)
}

/// GET /heal/status
async fn status(State(controller): State<Arc<HealController>>) -> impl IntoResponse {
    ApiResponse::ok(HealStatus::of(&controller))
}

/// POST /heal/restart
///
/// The sequence runs on its own task: a caller that gives up waiting does
/// not cut a remediation short.
async fn restart(State(controller): State<Arc<HealController>>) -> impl IntoResponse {
    let task = tokio::spawn(async move { controller.run_now().await });
    match task.await {
        Ok(Ok(report)) => ApiResponse::ok(report).into_response(),
        Ok(Err(HealError::RemediationInProgress)) => {
            info!("restart refused, remediation already running");
            error_response(
                &HealError::RemediationInProgress.to_string(),
                StatusCode::CONFLICT,
            )
            .into_response()
        }
        Ok(Err(e)) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
        Err(e) => {
            error!(error = %e, "remediation task failed");
            error_response("remediation task failed", StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

/// POST /heal/enable
async fn enable(State(controller): State<Arc<HealController>>) -> impl IntoResponse {
    controller.set_enabled(true);
    ApiResponse::ok(HealStatus::of(&controller))
}

/// POST /heal/disable
async fn disable(State(controller): State<Arc<HealController>>) -> impl IntoResponse {
    controller.set_enabled(false);
    ApiResponse::ok(HealStatus::of(&controller))
}

/// Take the control port. Fails with `AddrInUse` while another heal loop
/// or in-process restart holds it.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await
}

/// Serve the control endpoint until `shutdown` fires. Requests in flight,
/// including a running restart, are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    controller: Arc<HealController>,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "control endpoint listening"),
        Err(e) => warn!(error = %e, "control endpoint address unknown"),
    }
    let result = axum::serve(listener, router(controller))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        error!(error = %e, "control endpoint failed");
    }
}

/// Client for the control endpoint on this host.
pub fn client(config: &ClientConfig, timeout: Duration) -> HealResult<ServerClient> {
    ServerClient::new(&format!("http://127.0.0.1:{}", config.control_port), timeout)
}

/// Longest a full remediation can take, plus one request's worth of slack.
pub fn remediation_budget(config: &ClientConfig) -> Duration {
    let steps = RemediationStep::SEQUENCE.len() as u32;
    config.step_timeout() * steps + config.step_pause() * (steps - 1) + REQUEST_TIMEOUT
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use meshward_core::ConfigHandle;
    use meshward_heal::{AddressReporter, OverlayControl};
    use meshward_scheduler::{ProbeOutcome, Prober};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    struct Unreachable;

    #[async_trait]
    impl Prober for Unreachable {
        async fn probe(&self, _address: &str, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::Unreachable
        }
    }

    /// Each service action takes five seconds; records how many overlap.
    #[derive(Default)]
    struct SlowControl {
        actions: AtomicU32,
        active: AtomicU32,
        peak: AtomicU32,
    }

    impl SlowControl {
        async fn act(&self) -> HealResult<()> {
            self.actions.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl OverlayControl for SlowControl {
        async fn stop_app(&self) -> HealResult<()> {
            self.act().await
        }
        async fn stop_service(&self) -> HealResult<()> {
            self.act().await
        }
        async fn start_service(&self) -> HealResult<()> {
            self.act().await
        }
        async fn start_app(&self) -> HealResult<()> {
            self.act().await
        }
    }

    struct Registered;

    #[async_trait]
    impl AddressReporter for Registered {
        async fn report(&self) -> HealResult<()> {
            Ok(())
        }
    }

    fn live_controller(control: Arc<SlowControl>) -> Arc<HealController> {
        let config = ConfigHandle::new(ClientConfig {
            target_address: "10.147.17.1".to_string(),
            failure_threshold: 1,
            cooldown_secs: 60,
            ..ClientConfig::default()
        });
        Arc::new(HealController::new(
            config,
            Arc::new(Unreachable),
            control,
            Arc::new(Registered),
        ))
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn restart_during_automatic_remediation_is_refused() {
        let control = Arc::new(SlowControl::default());
        let controller = live_controller(control.clone());
        let router = router(Arc::clone(&controller));

        let (shutdown, rx) = watch::channel(false);
        let heal_loop = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(rx).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.phase(), HealPhase::Remediating);

        let resp = router.clone().oneshot(post("/heal/restart")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("in progress"));

        // Once the automatic run is over, a manual one goes through.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let resp = router.clone().oneshot(post("/heal/restart")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["steps"].as_array().unwrap().len(), 5);

        assert_eq!(control.actions.load(Ordering::SeqCst), 8);
        assert_eq!(control.peak.load(Ordering::SeqCst), 1);

        shutdown.send(true).unwrap();
        heal_loop.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_restarts_share_one_gate() {
        let control = Arc::new(SlowControl::default());
        let controller = live_controller(control.clone());
        controller.set_enabled(false);
        let router = router(controller);

        let (first, second) = tokio::join!(
            router.clone().oneshot(post("/heal/restart")),
            router.clone().oneshot(post("/heal/restart")),
        );
        let mut statuses = vec![first.unwrap().status(), second.unwrap().status()];
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
        assert_eq!(control.actions.load(Ordering::SeqCst), 4);
        assert_eq!(control.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enable_and_disable_reach_the_controller() {
        let controller = live_controller(Arc::new(SlowControl::default()));
        let router = router(Arc::clone(&controller));

        let resp = router.clone().oneshot(post("/heal/disable")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["enabled"], false);
        assert_eq!(json["data"]["phase"], "idle");
        assert!(!controller.is_enabled());

        let resp = router.clone().oneshot(post("/heal/enable")).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["data"]["enabled"], true);
        assert_eq!(json["data"]["phase"], "monitoring");

        let resp = router
            .oneshot(Request::builder().uri("/heal/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status: HealStatus = serde_json::from_value(body_json(resp).await["data"].clone()).unwrap();
        assert!(status.enabled);
        assert!(status.last_report.is_none());
    }

    #[tokio::test]
    async fn control_port_admits_one_holder() {
        let first = bind(0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind(port).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);

        drop(first);
        assert!(bind(port).await.is_ok());
    }

    #[test]
    fn restart_budget_covers_every_step() {
        let config = ClientConfig {
            step_timeout_secs: 30,
            step_pause_millis: 1000,
            ..ClientConfig::default()
        };
        assert_eq!(
            remediation_budget(&config),
            Duration::from_secs(30 * 5 + 4) + REQUEST_TIMEOUT
        );
    }
}
