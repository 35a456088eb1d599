//! Process startup: logging and shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, run_with_shutdown, wait_for_shutdown_signal};
