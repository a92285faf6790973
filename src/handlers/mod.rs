//! REST handlers for operators: runtime configuration and session control.

pub mod config;
pub mod sessions;

pub use config::*;
pub use sessions::*;
