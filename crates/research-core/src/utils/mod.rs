pub mod error;
pub mod logger;

pub use error::{CoreError, CoreResult, ErrorKind};
pub use logger::{init_logger, init_logger_with, LogFormat, LogOptions};
