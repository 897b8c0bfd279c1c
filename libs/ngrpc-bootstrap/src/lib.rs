//! Process bootstrap helpers for ngrpc binaries: logging setup and shutdown signals.

pub mod logging;
pub mod signals;

pub use logging::{LoggingConfig, init_logging};
pub use signals::wait_for_shutdown;
