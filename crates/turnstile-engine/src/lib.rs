pub mod clock;
pub mod engine;
pub mod registry;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{EXPIRY_NOT_SET, Entitlements, Grant, format_expiry};
pub use registry::{ConfigSnapshot, Registry};

use thiserror::Error;
use turnstile_store::StoreError;

/// Failures surfaced by the engine and registry.
///
/// `InvalidArgument` is rejected before any store mutation; `Store` wraps a
/// backend failure and is fatal for the current request.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
