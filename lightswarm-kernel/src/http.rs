/**
 * API REST LIGHTSWARM - Observation et commandes opérateur
 *
 * RÔLE :
 * Expose l'état de l'essaim (snapshot publié par la boucle du kernel) et
 * quelques commandes : reset de l'essaim, reset d'un membre, clignotement.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum (0.0.0.0:8080 par défaut) avec middleware auth API key
 * - Lecture : copie du dernier SwarmSnapshot reçu sur le canal watch
 * - Commandes : envoyées à la boucle du kernel par mpsc, réponse 202
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - LIGHTSWARM_API_KEY absente => tout est refusé
 */

use crate::coordinator::{MemberView, SwarmSnapshot};
use crate::health::{HealthTracker, KernelHealth};
use crate::protocol::MemberId;
use crate::runtime::OperatorCommand;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::warn;

pub const API_KEY_ENV: &str = "LIGHTSWARM_API_KEY";

#[derive(Clone)]
pub struct AppState {
    pub snapshots: watch::Receiver<SwarmSnapshot>,
    pub commands: mpsc::Sender<OperatorCommand>,
    pub health_tracker: HealthTracker,
}

#[derive(Debug, Serialize)]
pub struct HistoryView {
    pub avg_values: Vec<f64>,
    pub slices: usize,
    pub pending_samples: usize,
    pub current_average: f64,
    pub sum_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct BlinkParams {
    pub seconds: Option<f32>,
}

/// Vérifie un header x-api-key contre la clé attendue ; clé vide => refus
pub fn api_key_matches(expected: &str, provided: Option<&str>) -> bool {
    !expected.is_empty() && provided == Some(expected)
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("SECURITY: {API_KEY_ENV} not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !api_key_matches(&expected, provided) {
        warn!(path = %req.uri().path(), "rejected request with bad api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/swarm", get(get_swarm))
        .route("/swarm/members", get(get_members))
        .route("/swarm/history", get(get_history))
        .route("/swarm/reset", post(post_reset))
        .route("/swarm/members/{id}/reset", post(post_member_reset))
        .route("/swarm/members/{id}/blink", post(post_member_blink))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let health = app.health_tracker.get_health(&app.snapshots.borrow());
    Json(health)
}

// GET /swarm (snapshot complet)
async fn get_swarm(State(app): State<AppState>) -> Json<SwarmSnapshot> {
    Json(app.snapshots.borrow().clone())
}

// GET /swarm/members (les 6 slots)
async fn get_members(State(app): State<AppState>) -> Json<Vec<MemberView>> {
    Json(app.snapshots.borrow().members.clone())
}

// GET /swarm/history (tranches de 4s)
async fn get_history(State(app): State<AppState>) -> Json<HistoryView> {
    let snap = app.snapshots.borrow();
    Json(HistoryView {
        avg_values: snap.avg_values.clone(),
        slices: snap.slices,
        pending_samples: snap.pending_samples,
        current_average: snap.average.current_average,
        sum_count: snap.average.sum_count,
    })
}

async fn submit(app: &AppState, command: OperatorCommand) -> (StatusCode, Json<serde_json::Value>) {
    match app.commands.send(command).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "ok": true }))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "msg": "kernel loop stopped" })),
        ),
    }
}

fn member_or_400(id: u8) -> Result<MemberId, (StatusCode, Json<serde_json::Value>)> {
    MemberId::new(id).ok_or((
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "ok": false, "msg": "member id 0 is reserved" })),
    ))
}

// POST /swarm/reset
async fn post_reset(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    submit(&app, OperatorCommand::ResetSwarm).await
}

// POST /swarm/members/{id}/reset
async fn post_member_reset(
    State(app): State<AppState>,
    Path(id): Path<u8>,
) -> (StatusCode, Json<serde_json::Value>) {
    match member_or_400(id) {
        Ok(member) => submit(&app, OperatorCommand::ResetMember(member)).await,
        Err(rejected) => rejected,
    }
}

// POST /swarm/members/{id}/blink?seconds=2.5
async fn post_member_blink(
    State(app): State<AppState>,
    Path(id): Path<u8>,
    Query(params): Query<BlinkParams>,
) -> (StatusCode, Json<serde_json::Value>) {
    let member = match member_or_400(id) {
        Ok(member) => member,
        Err(rejected) => return rejected,
    };
    let seconds = params.seconds.unwrap_or(1.0);
    submit(&app, OperatorCommand::Blink { member, seconds }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{SwarmCoordinator, SwarmSettings};
    use crate::display::{DisplayScheduler, DisplaySurface};
    use crate::journal::MemorySink;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct NoDisplay;

    impl DisplayScheduler for NoDisplay {
        fn request_refresh(&self, _surface: DisplaySurface, _value: u32) {}
        fn arm_indicator(&self, _duration: Duration) {}
    }

    fn app() -> (AppState, mpsc::Receiver<OperatorCommand>) {
        let now = Instant::now();
        let coordinator = SwarmCoordinator::new(
            SwarmSettings::new(MemberId::MIN, Ipv4Addr::LOCALHOST),
            Arc::new(NoDisplay),
            Box::new(MemorySink::new()),
            now,
        );
        let (_snap_tx, snapshots) = watch::channel(coordinator.snapshot(now));
        let (commands, rx) = mpsc::channel(4);
        (
            AppState {
                snapshots,
                commands,
                health_tracker: HealthTracker::new(),
            },
            rx,
        )
    }

    #[test]
    fn test_api_key_guard() {
        assert!(api_key_matches("s3cret", Some("s3cret")));
        assert!(!api_key_matches("s3cret", Some("other")));
        assert!(!api_key_matches("s3cret", None));
        assert!(!api_key_matches("", Some("")));
        assert!(!api_key_matches("", None));
    }

    #[tokio::test]
    async fn test_blink_forwards_command() {
        let (app, mut rx) = app();
        let (code, _) = post_member_blink(State(app), Path(23), Query(BlinkParams { seconds: Some(2.5) })).await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(
            rx.recv().await,
            Some(OperatorCommand::Blink {
                member: MemberId::new(23).unwrap(),
                seconds: 2.5,
            })
        );
    }

    #[tokio::test]
    async fn test_member_zero_rejected() {
        let (app, mut rx) = app();
        let (code, _) = post_member_reset(State(app.clone()), Path(0)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let (code, _) = post_member_blink(State(app), Path(0), Query(BlinkParams { seconds: None })).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reset_when_loop_stopped() {
        let (app, rx) = app();
        drop(rx);
        let (code, _) = post_reset(State(app)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_members_view_has_every_slot() {
        let (app, _rx) = app();
        let Json(members) = get_members(State(app)).await;
        assert_eq!(members.len(), crate::roster::SWARM_SIZE);
        assert!(members.iter().all(|m| m.external_id == 0));
    }
}
