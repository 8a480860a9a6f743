// ABOUTME: HTTP middleware: API-key authentication and request logging

pub mod auth;
pub mod request_log;

pub use auth::api_key_middleware;
pub use request_log::request_logging_middleware;
