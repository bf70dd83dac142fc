use crate::HalError;
use crate::HintSession;
use crate::PowerService;

/// Service stub for hosts without a power service. Accepts the thin
/// pass-through calls and reports hint sessions as unsupported.
pub struct NoopPowerService;

impl PowerService for NoopPowerService {
    fn set_expensive_rendering(&mut self, _enabled: bool) -> Result<(), HalError> {
        Ok(())
    }

    fn notify_display_update_imminent(&mut self) -> Result<(), HalError> {
        Ok(())
    }

    fn hint_session_supported(&self) -> bool {
        false
    }

    fn create_hint_session(
        &mut self,
        _thread_ids: &[i32],
        _target_ns: i64,
    ) -> Result<Box<dyn HintSession>, HalError> {
        Err(HalError::Unsupported)
    }
}
