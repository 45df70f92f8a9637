//! HTTP route handlers for the cotflow server.

pub mod chat;
pub mod init;
pub mod model;

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}
