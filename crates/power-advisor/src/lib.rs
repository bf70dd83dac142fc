//! Power advisor for a display-composition pipeline.
//!
//! Sits between the pipeline and the power service: aggregates per-display
//! state, debounces display-update-imminent signals, and feeds per-frame
//! target/actual work durations into the rate-limited hint-session
//! capability from `power-hal`.

mod advisor;
pub mod config;
pub mod timer;

pub use advisor::DisplayId;
pub use advisor::HalConnector;
pub use advisor::PowerAdvisor;
pub use config::PowerAdvisorConfig;
