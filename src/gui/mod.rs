//! Terminal front end for a running session.

mod error;
mod monitor;

pub use error::MonitorError;
pub use monitor::monitor_session;
