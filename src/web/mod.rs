pub mod api;
pub mod error;
pub mod form;
pub mod server;

pub use api::AppState;
pub use error::ApiError;
pub use server::{create_router, run_server};
