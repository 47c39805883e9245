mod handlers;
mod routes;
mod ws;

pub use routes::create_router;

/// Shared state of every handler.
pub type AppState = std::sync::Arc<crate::service::Service>;
