// ABOUTME: Codegate HTTP server library
// ABOUTME: Router, handlers, middleware and server settings used by the `codegate` binary

pub mod api;
pub mod config;
pub mod error;
pub mod middleware;

pub use api::{create_router, AppState};
pub use config::ServerConfig;
pub use error::{ApiResult, AppError};
pub use middleware::FloodGuard;
