//! # Connection Gate
//!
//! Pass-through allow/deny check applied once at the WebSocket handshake.
//!
//! ## Rules:
//! - **IP allow-list**: empty list or `*` admits everyone; an entry ending in
//!   `*` matches by prefix (`10.0.*`); anything else must match exactly
//! - **Shared secret**: when configured, the request must carry it as
//!   `?token=` or in the `x-relay-secret` header
//!
//! Denied requests get a 403 JSON error and never reach the upgrade handler.

use crate::config::GateConfig;
use crate::error::AppError;
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error, ResponseError,
};
use futures_util::future::LocalBoxFuture;
use std::collections::HashMap;
use std::future::{ready, Ready};
use tracing::{debug, warn};

pub const SECRET_HEADER: &str = "x-relay-secret";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GateDenial {
    #[error("address {0} is not on the allow-list")]
    AddressNotAllowed(String),
    #[error("peer address is unknown")]
    UnknownPeer,
    #[error("missing connection secret")]
    MissingSecret,
    #[error("connection secret does not match")]
    WrongSecret,
}

/// Decide whether a peer may open a realtime connection.
pub fn permits(peer_ip: Option<&str>, secret: Option<&str>, gate: &GateConfig) -> Result<(), GateDenial> {
    let open = gate.allowed_ips.is_empty() || gate.allowed_ips.iter().any(|ip| ip == "*");
    if !open {
        let ip = peer_ip.ok_or(GateDenial::UnknownPeer)?;
        if !gate.allowed_ips.iter().any(|allowed| ip_matches(allowed, ip)) {
            return Err(GateDenial::AddressNotAllowed(ip.to_string()));
        }
    }

    match gate.shared_secret.as_deref().filter(|s| !s.is_empty()) {
        None => Ok(()),
        Some(expected) => match secret {
            None => Err(GateDenial::MissingSecret),
            Some(given) if given == expected => Ok(()),
            Some(_) => Err(GateDenial::WrongSecret),
        },
    }
}

fn ip_matches(allowed: &str, ip: &str) -> bool {
    match allowed.strip_suffix('*') {
        Some(prefix) => ip.starts_with(prefix),
        None => allowed == ip,
    }
}

fn request_secret(req: &ServiceRequest) -> Option<String> {
    if let Some(value) = req.headers().get(SECRET_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .ok()
        .and_then(|query| query.get("token").cloned())
}

pub struct ConnectionGate {
    gate: GateConfig,
}

impl ConnectionGate {
    pub fn new(gate: GateConfig) -> Self {
        Self { gate }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ConnectionGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = ConnectionGateMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ConnectionGateMiddleware {
            service,
            gate: self.gate.clone(),
        }))
    }
}

pub struct ConnectionGateMiddleware<S> {
    service: S,
    gate: GateConfig,
}

impl<S, B> Service<ServiceRequest> for ConnectionGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let peer = req.peer_addr().map(|addr| addr.ip().to_string());
        let secret = request_secret(&req);

        match permits(peer.as_deref(), secret.as_deref(), &self.gate) {
            Ok(()) => {
                debug!(peer = ?peer, "Connection gate admitted request");
                let fut = self.service.call(req);
                Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
            }
            Err(denial) => {
                warn!(peer = ?peer, reason = %denial, "Connection gate denied request");
                let response = AppError::Forbidden(denial.to_string()).error_response();
                Box::pin(async move { Ok(req.into_response(response).map_into_right_body()) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test as actix_test, App, HttpResponse};

    fn gate(ips: &[&str], secret: Option<&str>) -> GateConfig {
        GateConfig {
            allowed_ips: ips.iter().map(|s| s.to_string()).collect(),
            shared_secret: secret.map(str::to_string),
        }
    }

    #[test]
    fn test_allow_list_rules() {
        assert_eq!(permits(None, None, &gate(&[], None)), Ok(()));
        assert_eq!(permits(Some("1.2.3.4"), None, &gate(&["*"], None)), Ok(()));
        assert_eq!(permits(Some("10.0.4.2"), None, &gate(&["10.0.*"], None)), Ok(()));
        assert_eq!(
            permits(Some("10.1.4.2"), None, &gate(&["10.0.*", "127.0.0.1"], None)),
            Err(GateDenial::AddressNotAllowed("10.1.4.2".to_string()))
        );
        assert_eq!(permits(None, None, &gate(&["127.0.0.1"], None)), Err(GateDenial::UnknownPeer));
    }

    #[test]
    fn test_shared_secret_rules() {
        let gated = gate(&[], Some("classroom"));
        assert_eq!(permits(Some("1.2.3.4"), None, &gated), Err(GateDenial::MissingSecret));
        assert_eq!(permits(Some("1.2.3.4"), Some("nope"), &gated), Err(GateDenial::WrongSecret));
        assert_eq!(permits(Some("1.2.3.4"), Some("classroom"), &gated), Ok(()));
        assert_eq!(permits(Some("1.2.3.4"), None, &gate(&[], Some(""))), Ok(()));
    }

    #[actix_web::test]
    async fn test_middleware_blocks_before_handler() {
        let app = actix_test::init_service(
            App::new()
                .wrap(ConnectionGate::new(gate(&["127.0.0.1"], Some("classroom"))))
                .route("/ws", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let admitted = actix_test::TestRequest::get()
            .uri("/ws?token=classroom")
            .peer_addr("127.0.0.1:40000".parse().unwrap())
            .to_request();
        assert_eq!(actix_test::call_service(&app, admitted).await.status(), StatusCode::OK);

        let by_header = actix_test::TestRequest::get()
            .uri("/ws")
            .insert_header((SECRET_HEADER, "classroom"))
            .peer_addr("127.0.0.1:40001".parse().unwrap())
            .to_request();
        assert_eq!(actix_test::call_service(&app, by_header).await.status(), StatusCode::OK);

        let stranger = actix_test::TestRequest::get()
            .uri("/ws?token=classroom")
            .peer_addr("192.168.1.9:40000".parse().unwrap())
            .to_request();
        let denied = actix_test::call_service(&app, stranger).await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = actix_test::read_body_json(denied).await;
        assert_eq!(body["error"]["type"], "forbidden");
    }
}
