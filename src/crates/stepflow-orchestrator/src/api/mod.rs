//! External API (C9, spec §6, §11.1-§11.4): axum HTTP + SSE surface over
//! [`crate::Runtime`].

pub mod error;
pub mod handlers;
pub mod models;
pub mod response;
pub mod routes;

pub use routes::create_router;
