//! Gateway HTTP surface

pub mod auth;
mod proxy;
mod router;
mod server;

pub use auth::{auth_middleware, AuthState, AuthenticatedClient};
pub use router::{create_router, AppState};
pub use server::Gateway;
