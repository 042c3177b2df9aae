pub mod auth;
pub mod handlers;
pub mod server;

pub use auth::{ApiKeyEntry, ApiKeyResolver, ProjectAuth, StaticApiKeys};
pub use handlers::AppState;
pub use server::{build_router, run_server, ServerConfig};
