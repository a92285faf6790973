//! # Configuration Endpoints
//!
//! - `GET /api/v1/config`: current configuration (the shared secret is masked)
//! - `PUT /api/v1/config`: partial update, e.g. `{"lifecycle": {"grace_period_secs": 120}}`
//!
//! Lifecycle, audio and delivery changes apply to the running relay. Provider
//! tiers and the bind address are fixed at startup.

use crate::config::AppConfig;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

fn config_view(config: &AppConfig) -> Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "gate": {
            "allowed_ips": config.gate.allowed_ips,
            "shared_secret_configured": config
                .gate
                .shared_secret
                .as_deref()
                .map_or(false, |s| !s.is_empty())
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "min_flush_bytes": config.audio.min_flush_bytes,
            "silence_gap_ms": config.audio.silence_gap_ms,
            "max_buffered_chunks": config.audio.max_buffered_chunks,
            "screen_suspicious_input": config.audio.screen_suspicious_input
        },
        "providers": config.providers,
        "lifecycle": config.lifecycle,
        "delivery": config.delivery
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
