pub mod config;
pub mod database;
pub mod document;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

pub use state::AppState;
pub use utils::error::{CoreError, CoreResult, ErrorKind};
