//! Management HTTP surface

mod router;
mod server;

pub use router::{AppState, ResetParams, create_router, router_with_state};
pub use server::Server;
