//! Activity logging module with async queue mechanism

mod logger;
mod sink;
pub mod types;

pub use logger::{ActivityLogger, LoggerConfig};
pub use sink::{ActivitySink, PgActivitySink, TracingActivitySink};
pub use types::{ActivityLog, ActivityStatus, ActivityType};
