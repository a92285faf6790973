//! HTTP middleware. Request logging comes from `tracing-actix-web`.

pub mod gate;

pub use gate::ConnectionGate;
