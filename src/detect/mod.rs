mod backend;
mod backends;
mod guard;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
pub use guard::{
    DetectorPolicy, DetectorStats, GuardedDetector, DEFAULT_CONFIDENCE_FLOOR,
    DEFAULT_MAX_CONSECUTIVE_FAILURES,
};
pub use result::Detection;

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
