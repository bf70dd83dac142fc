//! Hint-session rate limiter and lifecycle manager.
//!
//! Wraps a [`PowerService`] connection and implements [`PowerHal`] on top of
//! it. Every target/actual work duration the pipeline produces lands here;
//! only the ones that actually change the remote picture go out on the wire.

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::clock::Clock;
use crate::clock::MonotonicClock;
use crate::HalError;
use crate::HintSession;
use crate::HintSessionConfig;
use crate::PowerHal;
use crate::PowerService;
use crate::SessionState;
use crate::WorkDuration;

/// Fractional deviation of `new` from `last`, e.g. 0.2 for a 20% change.
fn deviation(last: i64, new: i64) -> f64 {
    (1.0 - last as f64 / new as f64).abs()
}

pub struct HintSessionHal<S> {
    service: S,
    config: HintSessionConfig,
    clock: Box<dyn Clock>,
    /// Queried once per connection; never re-checked until reconnect.
    supports_hint_session: bool,
    session: Option<Box<dyn HintSession>>,
    /// Set on explicit close, so a missing session can be told apart from
    /// one that was never started.
    closed: bool,
    /// Durations accumulated since the last flush. Stays at one element
    /// under normal pacing.
    queue: Vec<WorkDuration>,
    /// Stored so the session can be rebuilt identically after a restart.
    thread_ids: Vec<i32>,
    /// Latest un-normalized target requested by the pipeline.
    target_ns: Option<i64>,
    /// Latest un-normalized actual received from the pipeline.
    actual_ns: Option<i64>,
    /// Last-sent snapshot, consulted only by the suppression decisions.
    last_target_sent_ns: i64,
    last_actual_sent_ns: Option<i64>,
    last_report_timestamp_ns: i64,
    should_reconnect: bool,
}

impl<S: PowerService> HintSessionHal<S> {
    pub fn new(service: S, config: HintSessionConfig) -> Self {
        Self::with_clock(service, config, Box::new(MonotonicClock::new()))
    }

    pub fn with_clock(service: S, config: HintSessionConfig, clock: Box<dyn Clock>) -> Self {
        let supports_hint_session = service.hint_session_supported();
        let default_target_ns = config.default_target_ns;
        Self {
            service,
            config,
            clock,
            supports_hint_session,
            session: None,
            closed: false,
            queue: Vec::new(),
            thread_ids: Vec::new(),
            target_ns: None,
            actual_ns: None,
            last_target_sent_ns: default_target_ns,
            last_actual_sent_ns: None,
            last_report_timestamp_ns: 0,
            should_reconnect: false,
        }
    }

    fn current_target_ns(&self) -> i64 {
        self.target_ns.unwrap_or(self.config.default_target_ns)
    }

    fn note_call_failure(&mut self, err: &HalError) {
        if matches!(err, HalError::ServiceDied) {
            self.should_reconnect = true;
        }
    }

    fn is_stale(&self, now_ns: i64) -> bool {
        self.last_actual_sent_ns.is_some()
            && now_ns - self.last_report_timestamp_ns > self.config.stale_timeout_ns
    }

    /// Target updates are suppressed entirely under normalization; otherwise
    /// only changes beyond the allowed deviation go out.
    fn should_send_target(&self, target_ns: i64) -> bool {
        if self.config.normalize_target {
            return false;
        }
        deviation(self.last_target_sent_ns, target_ns) >= self.config.allowed_target_deviation
    }

    /// A flush happens for the first report ever, when the session is about
    /// to go stale, or when the sample drifted beyond the allowed deviation.
    fn should_report_now(&self, now_ns: i64) -> bool {
        let Some(last_sent_ns) = self.last_actual_sent_ns else {
            return true;
        };
        if now_ns - self.last_report_timestamp_ns > self.config.stale_timeout_ns {
            return true;
        }
        let Some(actual_ns) = self.actual_ns else {
            return false;
        };
        deviation(last_sent_ns, actual_ns) >= self.config.allowed_actual_deviation
    }

    /// Flush the queued batch as one call. The batch is dropped either way;
    /// duration telemetry is best-effort and never retried.
    fn flush(&mut self, actual_ns: i64) {
        let now_ns = self.clock.now_nanos();
        if self.is_stale(now_ns) {
            info!("hint session went stale, restarting before the next report");
            self.restart_hint_session();
        }
        let batch = std::mem::take(&mut self.queue);
        // The snapshot advances even if the report call fails below: the
        // batch is never retried, so the next suppression decision has to
        // compare against what was attempted, not what last succeeded.
        self.last_report_timestamp_ns = now_ns;
        // Saved un-normalized so percentage comparison stays meaningful.
        self.last_actual_sent_ns = Some(actual_ns);
        let result = match self.session.as_mut() {
            Some(session) => session.report_actual_work_durations(&batch),
            None => {
                debug!(
                    dropped = batch.len(),
                    "hint session unavailable, dropping queued durations"
                );
                return;
            }
        };
        if let Err(err) = result {
            warn!("failed to report actual work durations: {err}");
            self.note_call_failure(&err);
        }
    }
}

impl<S: PowerService> PowerHal for HintSessionHal<S> {
    fn set_expensive_rendering(&mut self, enabled: bool) -> Result<(), HalError> {
        let result = self.service.set_expensive_rendering(enabled);
        if let Err(err) = &result {
            self.note_call_failure(err);
        }
        result
    }

    fn notify_display_update_imminent(&mut self) -> Result<(), HalError> {
        let result = self.service.notify_display_update_imminent();
        if let Err(err) = &result {
            self.note_call_failure(err);
        }
        result
    }

    fn supports_hint_session(&self) -> bool {
        self.supports_hint_session
    }

    fn is_hint_session_running(&self) -> bool {
        self.session.is_some()
    }

    fn session_state(&self) -> SessionState {
        if self.session.is_some() {
            if self.is_stale(self.clock.now_nanos()) {
                SessionState::Stale
            } else {
                SessionState::Active
            }
        } else if self.closed {
            SessionState::Closed
        } else {
            SessionState::Uninitialized
        }
    }

    fn restart_hint_session(&mut self) {
        self.close_hint_session();
        self.start_hint_session();
    }

    fn set_hint_session_thread_ids(&mut self, thread_ids: Vec<i32>) {
        if thread_ids == self.thread_ids {
            return;
        }
        self.thread_ids = thread_ids;
        if self.session.is_some() {
            self.restart_hint_session();
        }
    }

    fn start_hint_session(&mut self) -> bool {
        if self.session.is_some() {
            debug!("hint session already running");
            return false;
        }
        if !self.supports_hint_session {
            return false;
        }
        if self.thread_ids.is_empty() {
            warn!("cannot start hint session without thread ids");
            return false;
        }
        // Under normalization the session keeps the constant default target
        // for its whole lifetime; actuals carry the error term instead.
        let initial_target_ns = if self.config.normalize_target {
            self.config.default_target_ns
        } else {
            self.current_target_ns()
        };
        match self
            .service
            .create_hint_session(&self.thread_ids, initial_target_ns)
        {
            Ok(session) => {
                self.session = Some(session);
                self.closed = false;
                self.last_target_sent_ns = initial_target_ns;
                // A fresh session starts its keep-alive window from now.
                self.last_report_timestamp_ns = self.clock.now_nanos();
                true
            }
            Err(err) => {
                warn!("failed to start hint session: {err}");
                self.note_call_failure(&err);
                false
            }
        }
    }

    fn close_hint_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Err(err) = session.close() {
            debug!("failed to close hint session: {err}");
        }
        self.closed = true;
    }

    fn set_target_work_duration(&mut self, target_ns: i64) {
        self.target_ns = Some(target_ns);
        if self.config.trace_hint_session_data {
            debug!(target_ns, "pipeline target updated");
        }
        if self.session.is_none() || !self.should_send_target(target_ns) {
            return;
        }
        self.last_target_sent_ns = target_ns;
        let result = match self.session.as_mut() {
            Some(session) => session.update_target_work_duration(target_ns),
            None => return,
        };
        if let Err(err) = result {
            warn!("failed to update target work duration: {err}");
            self.note_call_failure(&err);
        }
    }

    fn send_actual_work_duration(&mut self, actual_ns: i64, timestamp_ns: i64) {
        if actual_ns < 0 {
            debug!(actual_ns, "skipping negative actual work duration");
            return;
        }
        if self.session.is_none() {
            debug!("hint session not running, dropping actual work duration");
            return;
        }
        self.actual_ns = Some(actual_ns);
        let mut reported_ns = actual_ns;
        if self.config.normalize_target {
            // Express the measurement as an error term against the constant
            // target the session was created with.
            reported_ns += self.last_target_sent_ns - self.current_target_ns();
        }
        self.queue.push(WorkDuration {
            duration_ns: reported_ns,
            timestamp_ns,
        });
        if self.config.trace_hint_session_data {
            debug!(actual_ns, reported_ns, "queued actual work duration");
        }
        if self.should_report_now(self.clock.now_nanos()) {
            self.flush(actual_ns);
        }
    }

    fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    fn hint_session_thread_ids(&self) -> Vec<i32> {
        self.thread_ids.clone()
    }

    fn target_work_duration(&self) -> Option<i64> {
        self.target_ns
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Mutex;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetExpensiveRendering(bool),
        NotifyUpdateImminent,
        CreateSession { thread_ids: Vec<i32>, target_ns: i64 },
        UpdateTarget(i64),
        ReportActuals(Vec<WorkDuration>),
        CloseSession,
    }

    #[derive(Default)]
    struct Remote {
        calls: Vec<Call>,
        fail_next_report: bool,
    }

    struct MockService {
        remote: Arc<Mutex<Remote>>,
        supported: bool,
    }

    struct MockSession {
        remote: Arc<Mutex<Remote>>,
    }

    impl PowerService for MockService {
        fn set_expensive_rendering(&mut self, enabled: bool) -> Result<(), HalError> {
            self.remote
                .lock()
                .unwrap()
                .calls
                .push(Call::SetExpensiveRendering(enabled));
            Ok(())
        }

        fn notify_display_update_imminent(&mut self) -> Result<(), HalError> {
            self.remote
                .lock()
                .unwrap()
                .calls
                .push(Call::NotifyUpdateImminent);
            Ok(())
        }

        fn hint_session_supported(&self) -> bool {
            self.supported
        }

        fn create_hint_session(
            &mut self,
            thread_ids: &[i32],
            target_ns: i64,
        ) -> Result<Box<dyn HintSession>, HalError> {
            self.remote.lock().unwrap().calls.push(Call::CreateSession {
                thread_ids: thread_ids.to_vec(),
                target_ns,
            });
            Ok(Box::new(MockSession {
                remote: self.remote.clone(),
            }))
        }
    }

    impl HintSession for MockSession {
        fn update_target_work_duration(&mut self, target_ns: i64) -> Result<(), HalError> {
            self.remote
                .lock()
                .unwrap()
                .calls
                .push(Call::UpdateTarget(target_ns));
            Ok(())
        }

        fn report_actual_work_durations(
            &mut self,
            durations: &[WorkDuration],
        ) -> Result<(), HalError> {
            let mut remote = self.remote.lock().unwrap();
            remote.calls.push(Call::ReportActuals(durations.to_vec()));
            if remote.fail_next_report {
                remote.fail_next_report = false;
                return Err(HalError::ServiceDied);
            }
            Ok(())
        }

        fn close(&mut self) -> Result<(), HalError> {
            self.remote.lock().unwrap().calls.push(Call::CloseSession);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeClock(Arc<AtomicI64>);

    impl FakeClock {
        fn advance(&self, ns: i64) {
            self.0.fetch_add(ns, Ordering::Relaxed);
        }
    }

    impl Clock for FakeClock {
        fn now_nanos(&self) -> i64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn hal_with(
        config: HintSessionConfig,
    ) -> (HintSessionHal<MockService>, Arc<Mutex<Remote>>, FakeClock) {
        let remote = Arc::new(Mutex::new(Remote::default()));
        let clock = FakeClock::default();
        let service = MockService {
            remote: remote.clone(),
            supported: true,
        };
        let hal = HintSessionHal::with_clock(service, config, Box::new(clock.clone()));
        (hal, remote, clock)
    }

    fn started_hal(
        config: HintSessionConfig,
    ) -> (HintSessionHal<MockService>, Arc<Mutex<Remote>>, FakeClock) {
        let (mut hal, remote, clock) = hal_with(config);
        hal.set_hint_session_thread_ids(vec![1, 2, 3]);
        assert!(hal.start_hint_session());
        remote.lock().unwrap().calls.clear();
        (hal, remote, clock)
    }

    fn calls(remote: &Arc<Mutex<Remote>>) -> Vec<Call> {
        remote.lock().unwrap().calls.clone()
    }

    #[test]
    fn target_updates_within_deviation_are_suppressed() {
        let (mut hal, remote, _clock) = started_hal(HintSessionConfig::default());

        // Session was created with the 50ms default, so the first real
        // target always deviates enough to be sent.
        hal.set_target_work_duration(1_000_000);
        // 5% away from the last-sent value: suppressed.
        hal.set_target_work_duration(1_050_000);
        // 16.7% away from 1_000_000: sent.
        hal.set_target_work_duration(1_200_000);

        assert_eq!(
            calls(&remote),
            vec![Call::UpdateTarget(1_000_000), Call::UpdateTarget(1_200_000)]
        );
        assert_eq!(hal.target_work_duration(), Some(1_200_000));
    }

    #[test]
    fn normalized_sessions_send_the_target_once() {
        let config = HintSessionConfig {
            normalize_target: true,
            ..Default::default()
        };
        let (mut hal, remote, _clock) = hal_with(config.clone());
        hal.set_hint_session_thread_ids(vec![7]);
        assert!(hal.start_hint_session());

        hal.set_target_work_duration(1_000_000);
        hal.set_target_work_duration(9_000_000);
        hal.set_target_work_duration(123_456_789);

        // The only target the remote ever sees is the constant default,
        // carried by session creation itself.
        assert_eq!(
            calls(&remote),
            vec![Call::CreateSession {
                thread_ids: vec![7],
                target_ns: config.default_target_ns,
            }]
        );
    }

    #[test]
    fn actual_reports_batch_until_deviation() {
        let (mut hal, remote, _clock) = started_hal(HintSessionConfig::default());

        // First report ever goes straight out.
        hal.send_actual_work_duration(1_000_000, 10);
        // 5% deviation: buffered, no remote call.
        hal.send_actual_work_duration(1_050_000, 20);
        // 20% deviation: the whole batch is flushed in one call.
        hal.send_actual_work_duration(1_200_000, 30);
        // 4.2% away from the new snapshot of 1_200_000: buffered again.
        hal.send_actual_work_duration(1_250_000, 40);

        assert_eq!(
            calls(&remote),
            vec![
                Call::ReportActuals(vec![WorkDuration {
                    duration_ns: 1_000_000,
                    timestamp_ns: 10,
                }]),
                Call::ReportActuals(vec![
                    WorkDuration {
                        duration_ns: 1_050_000,
                        timestamp_ns: 20,
                    },
                    WorkDuration {
                        duration_ns: 1_200_000,
                        timestamp_ns: 30,
                    },
                ]),
            ]
        );
    }

    #[test]
    fn stale_session_restarts_before_reporting() {
        let (mut hal, remote, clock) = started_hal(HintSessionConfig::default());

        hal.send_actual_work_duration(1_000_000, 0);
        assert_eq!(hal.session_state(), SessionState::Active);

        // Zero deviation inside the window: nothing is sent.
        clock.advance(50_000_000);
        hal.send_actual_work_duration(1_000_000, 50_000_000);
        assert_eq!(
            calls(&remote).len(),
            1,
            "no keep-alive expected before the stale timeout"
        );

        // Past the 80ms margin the sample forces a keep-alive, and the
        // session is restarted before the batch goes out.
        clock.advance(31_000_000);
        assert_eq!(hal.session_state(), SessionState::Stale);
        hal.send_actual_work_duration(1_000_000, 81_000_000);
        assert_eq!(hal.session_state(), SessionState::Active);

        let tail = calls(&remote)[1..].to_vec();
        assert_eq!(
            tail,
            vec![
                Call::CloseSession,
                Call::CreateSession {
                    thread_ids: vec![1, 2, 3],
                    target_ns: HintSessionConfig::default().default_target_ns,
                },
                Call::ReportActuals(vec![
                    WorkDuration {
                        duration_ns: 1_000_000,
                        timestamp_ns: 50_000_000,
                    },
                    WorkDuration {
                        duration_ns: 1_000_000,
                        timestamp_ns: 81_000_000,
                    },
                ]),
            ]
        );
    }

    #[test]
    fn normalized_actuals_carry_the_error_term() {
        let config = HintSessionConfig {
            normalize_target: true,
            ..Default::default()
        };
        let (mut hal, remote, _clock) = started_hal(config.clone());

        hal.set_target_work_duration(10_000_000);
        hal.send_actual_work_duration(9_000_000, 5);

        // 9ms actual against a 10ms target, rebased onto the constant 50ms
        // default: 9ms + (50ms - 10ms) = 49ms.
        assert_eq!(
            calls(&remote),
            vec![Call::ReportActuals(vec![WorkDuration {
                duration_ns: 49_000_000,
                timestamp_ns: 5,
            }])]
        );
    }

    #[test]
    fn negative_and_sessionless_durations_are_dropped() {
        let (mut hal, remote, _clock) = started_hal(HintSessionConfig::default());
        hal.send_actual_work_duration(-1, 0);
        assert_eq!(calls(&remote), vec![]);

        let (mut hal, remote, _clock) = hal_with(HintSessionConfig::default());
        hal.send_actual_work_duration(1_000_000, 0);
        assert_eq!(calls(&remote), vec![]);
    }

    #[test]
    fn thread_id_change_restarts_a_live_session() {
        let (mut hal, remote, _clock) = started_hal(HintSessionConfig::default());

        // Unchanged set: nothing happens.
        hal.set_hint_session_thread_ids(vec![1, 2, 3]);
        assert_eq!(calls(&remote), vec![]);

        hal.set_hint_session_thread_ids(vec![4, 5]);
        assert_eq!(
            calls(&remote),
            vec![
                Call::CloseSession,
                Call::CreateSession {
                    thread_ids: vec![4, 5],
                    target_ns: HintSessionConfig::default().default_target_ns,
                },
            ]
        );
        assert_eq!(hal.hint_session_thread_ids(), vec![4, 5]);
    }

    #[test]
    fn report_failure_marks_the_capability_for_reconnect() {
        let (mut hal, remote, _clock) = started_hal(HintSessionConfig::default());
        remote.lock().unwrap().fail_next_report = true;

        hal.send_actual_work_duration(1_000_000, 0);
        assert!(hal.should_reconnect());
        // The batch was dropped, not kept for a retry.
        hal.send_actual_work_duration(1_000_000, 10);
        assert_eq!(calls(&remote).len(), 1);
    }

    #[test]
    fn start_requires_support_and_thread_ids() {
        let remote = Arc::new(Mutex::new(Remote::default()));
        let service = MockService {
            remote: remote.clone(),
            supported: false,
        };
        let mut hal = HintSessionHal::new(service, HintSessionConfig::default());
        hal.set_hint_session_thread_ids(vec![1]);
        assert!(!hal.supports_hint_session());
        assert!(!hal.start_hint_session());

        let (mut hal, remote, _clock) = hal_with(HintSessionConfig::default());
        assert!(!hal.start_hint_session(), "empty thread-id set must refuse");
        assert_eq!(calls(&remote), vec![]);
    }

    #[test]
    fn session_lifecycle_states() {
        let (mut hal, _remote, clock) = hal_with(HintSessionConfig::default());
        assert_eq!(hal.session_state(), SessionState::Uninitialized);

        hal.set_hint_session_thread_ids(vec![1]);
        assert!(hal.start_hint_session());
        assert_eq!(hal.session_state(), SessionState::Active);
        assert!(hal.is_hint_session_running());

        hal.send_actual_work_duration(1_000_000, 0);
        clock.advance(81_000_000);
        assert_eq!(hal.session_state(), SessionState::Stale);

        hal.close_hint_session();
        assert_eq!(hal.session_state(), SessionState::Closed);
        assert!(!hal.is_hint_session_running());

        // CLOSED -> ACTIVE on the next explicit start.
        assert!(hal.start_hint_session());
        assert_eq!(hal.session_state(), SessionState::Active);
    }
}
