//! Close decision logic: overrides, suppression, and timer control.
//!
//! [`ScreenPolicy`] is the sole mutator of the override state and the sole
//! caller into the [`IdleTimer`]. Bus handlers and the timer's fire callback
//! run on independent tasks; everything they touch lives behind one mutex so
//! the compute-compare-abort-schedule sequence is atomic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{
    events, ForceClose, Message, MessageBus, OverrideDirective, PageInteraction, PageShown,
};
use crate::timer::{FireNotice, IdleTimer};

/// Identity this daemon stamps on its own traffic. Page shows whose source
/// contains it are ignored to keep the idle screen from re-triggering itself.
pub const PLATFORM_IDENTITY: &str = "idlekeeper";

/// Which source, if any, has asked to suppress idle behaviour.
#[derive(Debug)]
pub struct OverrideState {
    /// True disables idle close entirely until explicitly cleared.
    suppressed: bool,
    /// Identity that set the current override.
    originating_id: Option<String>,
    /// Page-show event to replay if a host asks to reapply the active override.
    restore: Option<PageShown>,
    /// When the override was last touched.
    set_at: Instant,
}

impl OverrideState {
    fn new() -> Self {
        Self {
            suppressed: false,
            originating_id: None,
            restore: None,
            set_at: Instant::now(),
        }
    }

    fn suppress(&mut self, page: &PageShown) {
        self.suppressed = true;
        self.originating_id = Some(page.source_identity.clone());
        self.restore = Some(page.clone());
        self.set_at = Instant::now();
    }

    /// Return to idle-managed mode. The remembered override screen stays
    /// around until the next suppression replaces it.
    fn clear_suppression(&mut self) {
        if self.suppressed {
            debug!(was_held_by = ?self.originating_id, "suppression cleared");
        }
        self.suppressed = false;
        self.set_at = Instant::now();
    }
}

/// Everything the handlers and the fire callback share.
#[derive(Debug)]
struct PolicyState {
    timer: IdleTimer,
    override_state: OverrideState,
    /// Identity attributed to the most recent page-flip interaction.
    last_interaction_source: Option<String>,
    /// True while the current page was shown without requesting idle handling
    /// (also the startup state, before any page has been shown).
    idle_suppressed_by_default: bool,
}

/// Decides, for each inbound event, whether to arm, re-arm, cancel, or ignore
/// the idle timer, and whether an elapsed timer actually closes the screen.
pub struct ScreenPolicy {
    state: Mutex<PolicyState>,
    bus: MessageBus,
    default_timeout: Duration,
    running: AtomicBool,
    fire_rx: Mutex<Option<mpsc::UnboundedReceiver<FireNotice>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl ScreenPolicy {
    /// Create a policy publishing close events on `bus`, with the given
    /// default idle timeout.
    pub fn new(bus: MessageBus, default_timeout: Duration) -> Self {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(PolicyState {
                timer: IdleTimer::new(fire_tx),
                override_state: OverrideState::new(),
                last_interaction_source: None,
                idle_suppressed_by_default: true,
            }),
            bus,
            default_timeout,
            running: AtomicBool::new(false),
            fire_rx: Mutex::new(Some(fire_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register the bus handlers and start fire delivery.
    ///
    /// Idempotent: calling this twice registers nothing new, so close events
    /// are never duplicated.
    pub fn initialize(self: Arc<Self>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("screen policy must be initialized inside an async runtime")?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // Already registered
        }

        info!(
            default_timeout_secs = self.default_timeout.as_secs(),
            "registering screen policy handlers"
        );

        let mut handles = Vec::with_capacity(2);

        let policy = Arc::clone(&self);
        let mut bus_rx = self.bus.subscribe();
        let dispatch = runtime.spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(message) => policy.dispatch(&message),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "policy fell behind the bus, events lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("bus dispatch task exiting");
        });
        handles.push(dispatch.abort_handle());

        if let Some(mut fire_rx) = lock_recovering(&self.fire_rx).take() {
            let policy = Arc::clone(&self);
            let fire = runtime.spawn(async move {
                while let Some(notice) = fire_rx.recv().await {
                    policy.on_fire(notice);
                }
                debug!("fire delivery task exiting");
            });
            handles.push(fire.abort_handle());
        }

        lock_recovering(&self.tasks).extend(handles);
        Ok(())
    }

    /// Deregister handlers and cancel any armed timer. Idempotent; safe to
    /// call without a prior [`initialize`](Self::initialize).
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in lock_recovering(&self.tasks).drain(..) {
            handle.abort();
        }
        self.state().timer.cancel();
        info!("screen policy shut down");
    }

    /// Route one inbound bus message to its handler. Malformed payloads
    /// degrade to logged no-ops; nothing propagates back to the dispatcher.
    fn dispatch(&self, message: &Message) {
        match message.event.as_str() {
            events::PAGE_SHOWN => match PageShown::parse(message) {
                Some(page) => self.on_page_shown(&page),
                None => warn!("page_shown without source_identity, ignoring"),
            },
            events::PAGE_INTERACTION => match PageInteraction::parse(message) {
                Some(interaction) => self.on_page_interaction(&interaction),
                None => warn!("page_interaction without source_identity, ignoring"),
            },
            events::SCREEN_CLOSE_REQUESTED => self.on_screen_close_requested(),
            events::SCREEN_FORCE_CLOSE => match ForceClose::parse(message) {
                Some(request) => self.on_force_close(&request),
                None => warn!("screen_force_close without skill_id, ignoring"),
            },
            _ => {}
        }
    }

    /// A skill has shown a page; work out what its override directive means
    /// for the idle timer. The directive shapes form an if/else chain: the
    /// first match wins.
    pub fn on_page_shown(&self, page: &PageShown) {
        if page.source_identity.contains(PLATFORM_IDENTITY) {
            debug!("ignoring page show from the idle screen itself");
            return;
        }

        let mut state = self.state();
        match page.directive {
            OverrideDirective::Indefinite => {
                info!(source = %page.source_identity, "idle close suppressed until further notice");
                state.override_state.suppress(page);
                state.idle_suppressed_by_default = true;
                state.timer.cancel();
            }
            OverrideDirective::TimeoutSeconds(secs) => {
                info!(source = %page.source_identity, secs, "custom idle timeout requested");
                state.override_state.clear_suppression();
                state.idle_suppressed_by_default = false;
                self.arm_locked(
                    &mut state,
                    Duration::from_secs(secs),
                    Some(page.source_identity.clone()),
                );
            }
            OverrideDirective::Absent => {
                if page.page.as_deref().is_some_and(|p| !p.is_empty()) {
                    debug!(source = %page.source_identity, "page without override, default idle timeout");
                    state.override_state.clear_suppression();
                    state.idle_suppressed_by_default = false;
                    self.arm_locked(
                        &mut state,
                        self.default_timeout,
                        Some(page.source_identity.clone()),
                    );
                }
                // No page either: nothing to manage.
            }
        }
    }

    /// The user flipped a page: restart the countdown, unless the current
    /// page opted out of idle handling.
    pub fn on_page_interaction(&self, interaction: &PageInteraction) {
        let mut state = self.state();
        state.last_interaction_source = Some(interaction.source_identity.clone());
        if !state.idle_suppressed_by_default {
            info!(
                secs = self.default_timeout.as_secs(),
                "page interaction, resetting idle countdown"
            );
            self.arm_locked(
                &mut state,
                self.default_timeout,
                Some(interaction.source_identity.clone()),
            );
        }
    }

    /// Explicit close button. Always emits, regardless of suppression, and
    /// re-enables idle management for whatever is shown next. Attributed to
    /// the last interacting identity, or failing that to whoever set the
    /// active override (null when neither is known).
    pub fn on_screen_close_requested(&self) {
        let attributed = {
            let mut state = self.state();
            state.idle_suppressed_by_default = false;
            state
                .last_interaction_source
                .clone()
                .or_else(|| state.override_state.originating_id.clone())
        };
        info!(source = ?attributed, "explicit close requested");
        self.bus.emit(Message::close_idle(attributed.as_deref()));
    }

    /// Programmatic teardown. Attributed to the identity in the request, and
    /// like the explicit close it bypasses suppression.
    pub fn on_force_close(&self, request: &ForceClose) {
        info!(skill_id = %request.skill_id, "forced screen close");
        self.bus.emit(Message::close_idle(Some(&request.skill_id)));
    }

    /// An armed timer elapsed. Suppression is checked now, at fire time, so
    /// an override set between scheduling and firing still wins.
    fn on_fire(&self, notice: FireNotice) {
        let emit = {
            let mut state = self.state();
            state.timer.acknowledge_fired();
            if state.override_state.suppressed {
                debug!(
                    suppressed_for_secs = state.override_state.set_at.elapsed().as_secs(),
                    "idle timer elapsed while suppressed, discarding"
                );
                false
            } else {
                true
            }
        };
        if emit {
            info!(subject = ?notice.subject, "idle timeout elapsed, closing screen");
            self.bus.emit(Message::close_idle(notice.subject.as_deref()));
        }
    }

    /// The page-show event behind the active override, for hosts that want to
    /// reapply the override screen after showing something else.
    pub fn current_override(&self) -> Option<PageShown> {
        self.state().override_state.restore.clone()
    }

    /// Arm authoritatively; a failure means "no timer armed" and the screen
    /// is simply left unmanaged.
    fn arm_locked(&self, state: &mut PolicyState, offset: Duration, subject: Option<String>) {
        if let Err(err) = state.timer.arm(offset, false, subject) {
            warn!(error = %err, "could not arm idle timer, leaving screen unmanaged");
        }
    }

    fn state(&self) -> MutexGuard<'_, PolicyState> {
        lock_recovering(&self.state)
    }
}

/// Take a lock, recovering from poisoning. Handlers only mutate plain flags
/// under the lock, so a poisoned guard is still internally consistent and the
/// dispatcher must keep running.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
