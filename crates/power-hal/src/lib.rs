//! Client-side abstractions for a power-management service.
//!
//! The composition pipeline does not talk to the power service directly; it
//! goes through a [`PowerHal`] capability. The capability decides when a
//! remote call is actually worth making: the [`HintSessionHal`] implementation
//! rate-limits target/actual work-duration reports and keeps the remote hint
//! session alive across restarts and reconnects.

pub mod clock;
pub mod noop;
mod session;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use session::HintSessionHal;

/// A single measured unit of work, queued until the next report is flushed.
///
/// `duration_ns` may be negative: normalized reports carry a signed error
/// term relative to a constant target rather than a raw measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkDuration {
    pub duration_ns: i64,
    pub timestamp_ns: i64,
}

/// Observable lifecycle state of a hint session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has been started yet.
    Uninitialized,
    /// A session is live and was reported to recently.
    Active,
    /// A session is live but the remote side may expire it at any moment.
    Stale,
    /// The session was explicitly closed.
    Closed,
}

#[derive(Error, Debug)]
pub enum HalError {
    /// The connection to the power service is gone; the whole capability
    /// must be rebuilt before any further call can succeed.
    #[error("power service connection lost")]
    ServiceDied,
    /// The power service does not implement hint sessions.
    #[error("hint sessions unsupported by the power service")]
    Unsupported,
    /// The service rejected a single call; the next report is the retry.
    #[error("power service rejected the call: {0}")]
    CallFailed(String),
}

/// Tuning knobs for the hint-session rate limiter.
///
/// These are configuration constants, not derived invariants. In particular
/// the 80ms stale timeout is a deliberate margin under the service-side
/// 100ms expiry window, so a keep-alive report lands before the remote
/// session can lapse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HintSessionConfig {
    /// Max fraction the target may drift from the last-sent value without
    /// triggering a remote update (0.1 = 10%).
    pub allowed_target_deviation: f64,
    /// Max fraction an actual duration may drift from the last-sent value
    /// without triggering a report.
    pub allowed_actual_deviation: f64,
    /// Target used for session creation and normalization. The exact value
    /// does not matter much; it only needs to stay constant.
    pub default_target_ns: i64,
    /// Time since the last report after which the session counts as stale.
    pub stale_timeout_ns: i64,
    /// Report actual durations as signed error terms against the constant
    /// default target instead of re-sending the target every frame. Saves
    /// one remote call per frame.
    pub normalize_target: bool,
    /// Emit reported target/actual values through `tracing` at debug level.
    pub trace_hint_session_data: bool,
}

impl Default for HintSessionConfig {
    fn default() -> Self {
        Self {
            allowed_target_deviation: 0.1,
            allowed_actual_deviation: 0.1,
            default_target_ns: 50_000_000,
            stale_timeout_ns: 80_000_000,
            normalize_target: false,
            trace_hint_session_data: false,
        }
    }
}

/// Transport seam to the remote power service. Implementations own the RPC
/// mechanism; everything here is a bounded synchronous round trip.
pub trait PowerService: Send {
    fn set_expensive_rendering(&mut self, enabled: bool) -> Result<(), HalError>;

    fn notify_display_update_imminent(&mut self) -> Result<(), HalError>;

    /// Whether the service implements hint sessions. Queried once per
    /// connection and cached by the capability.
    fn hint_session_supported(&self) -> bool;

    fn create_hint_session(
        &mut self,
        thread_ids: &[i32],
        target_ns: i64,
    ) -> Result<Box<dyn HintSession>, HalError>;
}

/// A live remote hint session tracking one set of worker threads.
pub trait HintSession: Send {
    fn update_target_work_duration(&mut self, target_ns: i64) -> Result<(), HalError>;

    fn report_actual_work_durations(&mut self, durations: &[WorkDuration]) -> Result<(), HalError>;

    fn close(&mut self) -> Result<(), HalError>;
}

/// The session capability consumed by the advisor.
///
/// Operations map 1:1 onto remote calls and fail by returning an error (or
/// `false`) rather than panicking. After any failure the owner must consult
/// [`PowerHal::should_reconnect`] to learn whether the whole capability is
/// unusable and has to be rebuilt.
pub trait PowerHal: Send {
    fn set_expensive_rendering(&mut self, enabled: bool) -> Result<(), HalError>;

    fn notify_display_update_imminent(&mut self) -> Result<(), HalError>;

    fn supports_hint_session(&self) -> bool;

    fn is_hint_session_running(&self) -> bool;

    fn session_state(&self) -> SessionState;

    /// Close and reopen the session with the stored thread-id set.
    fn restart_hint_session(&mut self);

    /// Store a new thread-id set, restarting a live session if it changed.
    fn set_hint_session_thread_ids(&mut self, thread_ids: Vec<i32>);

    fn start_hint_session(&mut self) -> bool;

    fn close_hint_session(&mut self);

    fn set_target_work_duration(&mut self, target_ns: i64);

    fn send_actual_work_duration(&mut self, actual_ns: i64, timestamp_ns: i64);

    /// Whether the capability hit a connection-level failure and must be
    /// discarded and rebuilt by its owner.
    fn should_reconnect(&self) -> bool;

    /// The stored thread-id set, kept so a rebuilt capability can reopen an
    /// identical session.
    fn hint_session_thread_ids(&self) -> Vec<i32>;

    /// The last explicitly requested target, if any.
    fn target_work_duration(&self) -> Option<i64>;
}
