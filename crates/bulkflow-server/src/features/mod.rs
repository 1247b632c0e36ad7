//! Feature modules implementing the HTTP API
//!
//! Each feature is a vertical slice with its own commands and routes:
//!
//! - `commands/` - Write operations
//! - `routes.rs` - HTTP route definitions

pub mod uploads;

use axum::Router;

pub use uploads::UploadState;

/// Creates the router with all feature routes mounted
pub fn router(state: UploadState) -> Router {
    Router::new().merge(uploads::uploads_routes()).with_state(state)
}
