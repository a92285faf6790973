//! Session inspection and manual termination.

use crate::session::{Session, SessionState};
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

const MANUAL_END_REASON: &str = "ended by operator";

#[derive(Debug, Default, Deserialize)]
pub struct SessionListQuery {
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EndSessionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

fn session_view(session: &Session) -> Value {
    let state: SessionState = session.state();
    json!({
        "state": state,
        "session": session
    })
}

/// `GET /api/v1/sessions[?active=true]`
pub async fn list_sessions(
    state: web::Data<AppState>,
    query: web::Query<SessionListQuery>,
) -> Result<HttpResponse, AppError> {
    let store = state.lifecycle.store();
    let sessions = match query.active {
        Some(true) => store.active().await?,
        Some(false) => store.list().await?.into_iter().filter(|s| !s.is_active).collect(),
        None => store.list().await?,
    };

    let views: Vec<Value> = sessions.iter().map(session_view).collect();
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "count": views.len(),
        "sessions": views
    })))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let session = state
        .lifecycle
        .store()
        .get(&session_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;

    Ok(HttpResponse::Ok().json(session_view(&session)))
}

/// `POST /api/v1/sessions/{id}/end`, body `{"reason": "..."}` optional.
///
/// Ending an already inactive session succeeds with `ended: false`.
pub async fn end_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<EndSessionRequest>>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    if state.lifecycle.store().get(&session_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Session '{}' not found", session_id)));
    }

    let reason = body
        .and_then(|b| b.into_inner().reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| MANUAL_END_REASON.to_string());

    let ended = state
        .lifecycle
        .end_session(&session_id, &reason, Utc::now())
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "ended": ended,
        "reason": reason,
        "timestamp": Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::delivery::ChannelTranslationStore;
    use actix_web::{http::StatusCode, test as actix_test, App};
    use std::sync::Arc;

    fn state() -> AppState {
        let (store, _actor) = ChannelTranslationStore::channel(8);
        AppState::new(AppConfig::default(), Arc::new(store)).unwrap()
    }

    #[actix_web::test]
    async fn test_list_and_end_session() {
        let state = state();
        let session = state
            .lifecycle
            .register_teacher("en", Some("class-1"), Utc::now())
            .await
            .unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/sessions", web::get().to(list_sessions))
                .route("/sessions/{id}", web::get().to(get_session))
                .route("/sessions/{id}/end", web::post().to(end_session)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/sessions?active=true").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["state"], "active_empty");
        assert_eq!(body["sessions"][0]["session"]["sessionId"], session.session_id);

        let req = actix_test::TestRequest::post()
            .uri("/sessions/class-1/end")
            .set_json(json!({ "reason": "class over" }))
            .to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ended"], true);

        let req = actix_test::TestRequest::post().uri("/sessions/class-1/end").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ended"], false);
        assert_eq!(body["reason"], MANUAL_END_REASON);

        let req = actix_test::TestRequest::get().uri("/sessions/class-1").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "inactive");
        assert_eq!(body["session"]["qualityReason"], "class over");
    }

    #[actix_web::test]
    async fn test_unknown_session_is_not_found() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .route("/sessions/{id}/end", web::post().to(end_session)),
        )
        .await;

        let req = actix_test::TestRequest::post().uri("/sessions/missing/end").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
