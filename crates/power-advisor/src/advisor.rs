use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use derive_more::Display;
use power_hal::clock::Clock;
use power_hal::clock::MonotonicClock;
use power_hal::HalError;
use power_hal::PowerHal;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::PowerAdvisorConfig;
use crate::timer::OneShotTimer;

/// Stable identifier of a connected display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub struct DisplayId(pub u64);

/// Builds a fresh session capability. Returning `None` means there is no
/// power service to talk to; the advisor then degrades to a no-op and stops
/// retrying.
pub type HalConnector = Box<dyn FnMut() -> Option<Box<dyn PowerHal>> + Send>;

/// Lock-guarded slot owning the capability, with reconnect expressed as a
/// swap-and-discard: no caller ever observes a half-rebuilt capability.
struct HalSlot {
    connector: HalConnector,
    hal: Option<Box<dyn PowerHal>>,
    /// Latched false once the connector definitively failed.
    has_hal: bool,
    reconnect: bool,
}

impl HalSlot {
    fn new(connector: HalConnector) -> Self {
        Self {
            connector,
            hal: None,
            has_hal: true,
            reconnect: false,
        }
    }

    fn mark_reconnect(&mut self) {
        self.reconnect = true;
    }

    /// Lazily (re)build the capability. A dead capability hands its session
    /// continuity state (thread ids, target, running flag) to its
    /// replacement before being discarded.
    fn get(&mut self) -> Option<&mut (dyn PowerHal + 'static)> {
        if !self.has_hal {
            return None;
        }
        let needs_rebuild = self.reconnect
            || self
                .hal
                .as_ref()
                .is_none_or(|hal| hal.should_reconnect());
        if needs_rebuild {
            let replay = self.hal.as_ref().map(|hal| {
                (
                    hal.hint_session_thread_ids(),
                    hal.target_work_duration(),
                    hal.is_hint_session_running(),
                )
            });
            self.hal = None;
            self.reconnect = false;
            match (self.connector)() {
                Some(mut hal) => {
                    if let Some((thread_ids, target_ns, was_running)) = replay {
                        info!("power service capability rebuilt, replaying session state");
                        if !thread_ids.is_empty() {
                            hal.set_hint_session_thread_ids(thread_ids);
                        }
                        if was_running {
                            hal.start_hint_session();
                        }
                        if let Some(target_ns) = target_ns {
                            hal.set_target_work_duration(target_ns);
                        }
                    }
                    self.hal = Some(hal);
                }
                None => {
                    error!("unable to connect to the power service, power advising disabled");
                    self.has_hal = false;
                }
            }
        }
        self.hal.as_deref_mut()
    }
}

struct AdvisorState {
    slot: HalSlot,
    /// None until `enable_power_hint` is called the first time.
    hint_enabled: Option<bool>,
    /// Cached on first query; a missing capability leaves it unset so the
    /// query is retried once a capability exists.
    supports_hint: Option<bool>,
    session_running: bool,
    expensive_displays: HashSet<DisplayId>,
    /// Last aggregate flag actually forwarded to the service.
    notified_expensive: bool,
}

/// Coordinates cross-display power state and owns the session capability.
///
/// Wraps the power service taking the full pipeline state into account:
/// per-display expensive-rendering flags are aggregated before anything is
/// forwarded, display-update-imminent signals are debounced, and all
/// hint-session traffic funnels through the rate-limiting capability behind
/// a single lock.
pub struct PowerAdvisor {
    state: Mutex<AdvisorState>,
    boot_finished: AtomicBool,
    init_done: AtomicBool,
    /// Cleared when an imminent notification is forwarded; re-armed by the
    /// debounce timer once updates stop arriving.
    send_update_imminent: Arc<AtomicBool>,
    last_update_time_ns: Arc<AtomicI64>,
    update_timer: Option<OneShotTimer>,
    clock: Arc<dyn Clock>,
}

impl PowerAdvisor {
    pub fn new(config: PowerAdvisorConfig, connector: HalConnector) -> Self {
        Self::with_clock(config, connector, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: PowerAdvisorConfig,
        connector: HalConnector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let send_update_imminent = Arc::new(AtomicBool::new(true));
        let last_update_time_ns = Arc::new(AtomicI64::new(0));
        let debounce = config.update_imminent_debounce();
        let update_timer = (debounce > Duration::ZERO).then(|| {
            let flag = send_update_imminent.clone();
            let last_update = last_update_time_ns.clone();
            let timer_clock = clock.clone();
            let window_ns = debounce.as_nanos() as i64;
            OneShotTimer::new(debounce, move || {
                // Updates may still be streaming in; wait until a full
                // window has passed since the last one before re-arming.
                loop {
                    let elapsed = timer_clock.now_nanos() - last_update.load(Ordering::Relaxed);
                    if elapsed >= window_ns {
                        break;
                    }
                    thread::sleep(Duration::from_nanos((window_ns - elapsed).max(0) as u64));
                }
                flag.store(true, Ordering::Relaxed);
            })
        });
        Self {
            state: Mutex::new(AdvisorState {
                slot: HalSlot::new(connector),
                hint_enabled: None,
                supports_hint: None,
                session_running: false,
                expensive_displays: HashSet::new(),
                notified_expensive: false,
            }),
            boot_finished: AtomicBool::new(false),
            init_done: AtomicBool::new(false),
            send_update_imminent,
            last_update_time_ns,
            update_timer,
            clock,
        }
    }

    /// Warm up the service connection. Idempotent; later calls are no-ops.
    pub fn init(&self) {
        if self.init_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = &mut *self.state.lock().expect("poisoned");
        if state.slot.get().is_none() {
            debug!("power service not reachable during init");
        }
    }

    pub fn on_boot_finished(&self) {
        self.boot_finished.store(true, Ordering::SeqCst);
    }

    /// Add or remove `display` from the expensive set, forwarding only the
    /// 0<->1 transitions of the aggregate flag.
    pub fn set_expensive_rendering_expected(&self, display: DisplayId, expected: bool) {
        let state = &mut *self.state.lock().expect("poisoned");
        if expected {
            state.expensive_displays.insert(display);
        } else {
            state.expensive_displays.remove(&display);
        }
        let expects_expensive = !state.expensive_displays.is_empty();
        if expects_expensive == state.notified_expensive {
            return;
        }
        let Some(hal) = state.slot.get() else {
            return;
        };
        match hal.set_expensive_rendering(expects_expensive) {
            Ok(()) => state.notified_expensive = expects_expensive,
            Err(err) => {
                warn!("failed to set expensive rendering: {err}");
                if matches!(err, HalError::ServiceDied) {
                    state.slot.mark_reconnect();
                }
            }
        }
    }

    /// Pure read of the last forwarded aggregate flag; no remote call.
    pub fn is_using_expensive_rendering(&self) -> bool {
        self.state.lock().expect("poisoned").notified_expensive
    }

    /// Forward a display-update-imminent signal unless one already went out
    /// within the current debounce window. Gated on boot completion so the
    /// pipeline gains no early-boot dependency on the power service.
    pub fn notify_display_update_imminent(&self) {
        if !self.boot_finished.load(Ordering::SeqCst) {
            return;
        }
        if self.send_update_imminent.swap(false, Ordering::Relaxed) {
            {
                let state = &mut *self.state.lock().expect("poisoned");
                if let Some(hal) = state.slot.get() {
                    if let Err(err) = hal.notify_display_update_imminent() {
                        warn!("failed to notify display update imminent: {err}");
                        if matches!(err, HalError::ServiceDied) {
                            state.slot.mark_reconnect();
                        }
                    }
                }
            }
            match &self.update_timer {
                Some(timer) => timer.reset(),
                // Without a timer nobody would ever re-arm the flag, so do
                // not throttle at all.
                None => self.send_update_imminent.store(true, Ordering::Relaxed),
            }
        }
        if self.update_timer.is_some() {
            self.last_update_time_ns
                .store(self.clock.now_nanos(), Ordering::Relaxed);
        }
    }

    /// Whether the next [`notify_display_update_imminent`] call would
    /// actually forward a notification.
    pub fn can_notify_display_update_imminent(&self) -> bool {
        self.boot_finished.load(Ordering::SeqCst)
            && self.send_update_imminent.load(Ordering::Relaxed)
    }

    /// Global kill-switch. Disabling closes any live session and turns the
    /// hint-session operations into no-ops.
    pub fn enable_power_hint(&self, enabled: bool) {
        let state = &mut *self.state.lock().expect("poisoned");
        info!(enabled, "power hint sessions toggled");
        state.hint_enabled = Some(enabled);
        if !enabled {
            if let Some(hal) = state.slot.get() {
                hal.close_hint_session();
            }
            state.session_running = false;
        }
    }

    pub fn use_power_hint_session(&self) -> bool {
        let state = &mut *self.state.lock().expect("poisoned");
        Self::use_hint_locked(state)
    }

    pub fn supports_power_hint_session(&self) -> bool {
        let state = &mut *self.state.lock().expect("poisoned");
        Self::supports_locked(state)
    }

    pub fn is_power_hint_session_running(&self) -> bool {
        self.state.lock().expect("poisoned").session_running
    }

    /// (Re)create the session for the given worker-thread set. Returns
    /// whether a session is running afterwards.
    pub fn start_power_hint_session(&self, thread_ids: Vec<i32>) -> bool {
        let state = &mut *self.state.lock().expect("poisoned");
        if !Self::use_hint_locked(state) {
            return false;
        }
        if thread_ids.is_empty() {
            warn!("cannot start power hint session without thread ids");
            return false;
        }
        let Some(hal) = state.slot.get() else {
            return false;
        };
        hal.set_hint_session_thread_ids(thread_ids);
        if !hal.is_hint_session_running() {
            state.session_running = hal.start_hint_session();
        }
        state.session_running
    }

    pub fn set_target_work_duration(&self, target_ns: i64) {
        let state = &mut *self.state.lock().expect("poisoned");
        if !Self::use_hint_locked(state) {
            return;
        }
        let Some(hal) = state.slot.get() else {
            return;
        };
        hal.set_target_work_duration(target_ns);
        if hal.should_reconnect() {
            state.slot.mark_reconnect();
        }
    }

    pub fn send_actual_work_duration(&self, actual_ns: i64, timestamp_ns: i64) {
        let state = &mut *self.state.lock().expect("poisoned");
        if !Self::use_hint_locked(state) {
            return;
        }
        let Some(hal) = state.slot.get() else {
            return;
        };
        hal.send_actual_work_duration(actual_ns, timestamp_ns);
        if hal.should_reconnect() {
            state.slot.mark_reconnect();
        }
    }

    fn use_hint_locked(state: &mut AdvisorState) -> bool {
        state.hint_enabled.unwrap_or(false) && Self::supports_locked(state)
    }

    fn supports_locked(state: &mut AdvisorState) -> bool {
        if state.supports_hint.is_none() {
            if let Some(hal) = state.slot.get() {
                state.supports_hint = Some(hal.supports_hint_session());
            }
        }
        state.supports_hint.unwrap_or(false)
    }
}
