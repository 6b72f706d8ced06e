pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod exec;
pub mod expr;
pub mod instance;
pub mod loader;
pub mod path;
pub mod session;
pub mod state;
pub mod subagent;
pub mod value;

pub use engine::{Engine, EngineEnvelope, WorkflowEngine};
pub use error::{EngineError, ErrorKind, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("workflow engine tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trips_through_the_envelope() {
        let err = EngineError::Path("state.missing is undeclared".to_string());
        assert_eq!(err.kind(), ErrorKind::PathError);
    }

    #[test]
    fn io_error_maps_to_internal() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let engine_err: EngineError = io_err.into();
        assert_eq!(engine_err.kind(), ErrorKind::Internal);
    }
}
