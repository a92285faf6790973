//! # Health Check
//!
//! `GET /health` and `GET /api/v1/health` report liveness plus a snapshot of
//! the relay: open connections by role, session counts by state, delivery
//! counters, round queues, per-tier provider outcomes and stage latency.

use crate::session::SessionState;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};
use tracing::warn;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let roles = state.registry.role_counts().await;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "connections": {
            "open": state.transport.connection_count(),
            "roles": roles
        },
        "sessions": session_summary(&state).await,
        "delivery": state.delivery.stats(),
        "rounds": state.rounds.snapshot(),
        "providers": provider_summary(&state),
        "stages": stage_summary(&state),
        "memory": memory_info()
    }))
}

async fn session_summary(state: &AppState) -> Value {
    let sessions = match state.lifecycle.store().list().await {
        Ok(sessions) => sessions,
        Err(err) => {
            warn!(error = %err, "Session store unavailable for health check");
            return json!({ "available": false });
        }
    };

    let count = |wanted: SessionState| sessions.iter().filter(|s| s.state() == wanted).count();
    json!({
        "available": true,
        "total": sessions.len(),
        "active_empty": count(SessionState::ActiveEmpty),
        "active_with_students": count(SessionState::ActiveWithStudents),
        "grace_period": count(SessionState::GracePeriod),
        "inactive": count(SessionState::Inactive)
    })
}

fn provider_summary(state: &AppState) -> Vec<Value> {
    state
        .pipeline
        .tier_counters()
        .into_iter()
        .map(|(stage, tier, counters)| {
            json!({
                "stage": stage,
                "tier": tier,
                "successes": counters.successes,
                "failures": counters.failures
            })
        })
        .collect()
}

fn stage_summary(state: &AppState) -> Vec<Value> {
    state
        .pipeline
        .stage_latency()
        .into_iter()
        .map(|(stage, latency)| {
            json!({
                "stage": stage,
                "calls": latency.calls,
                "failures": latency.failures,
                "mean_ms": latency.mean_ms(),
                "max_ms": latency.max_ms
            })
        })
        .collect()
}

fn memory_info() -> Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };
            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({ "available": false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::delivery::ChannelTranslationStore;
    use actix_web::{test as actix_test, App};
    use chrono::Utc;
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_health_reports_relay_snapshot() {
        let (store, _actor) = ChannelTranslationStore::channel(8);
        let state = AppState::new(AppConfig::default(), Arc::new(store)).unwrap();
        state.lifecycle.register_teacher("en", None, Utc::now()).await.unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"]["open"], 0);
        assert_eq!(body["sessions"]["active_empty"], 1);
        assert_eq!(body["delivery"]["rounds"], 0);
        assert!(body["providers"].is_array());
        assert_eq!(body["rounds"]["active_sessions"], 0);
        assert_eq!(body["stages"], json!([]));
    }

    #[actix_web::test]
    async fn test_health_reports_stage_latency() {
        let (store, _actor) = ChannelTranslationStore::channel(8);
        let state = AppState::new(AppConfig::default(), Arc::new(store)).unwrap();
        state.pipeline.translate("Hello", "en", "es").await.unwrap();
        state.pipeline.synthesize("Hola", "es", &[]).await;

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["stages"][0]["stage"], "translation");
        assert_eq!(body["stages"][0]["calls"], 1);
        assert_eq!(body["stages"][1]["stage"], "synthesis");
    }
}
