//! HTTP surface for DeepTree: `POST /research` and `GET /health`.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::AppError;
pub use routes::build_router;
pub use state::AppState;
