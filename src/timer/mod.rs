//! The single idle deadline and its scheduled close action.
//!
//! [`IdleTimer`] is a pure scheduling primitive: it knows nothing about
//! suppression or overrides. When an armed delay elapses it delivers a
//! [`FireNotice`] on the channel it was built with; the policy decides what,
//! if anything, happens next.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Delivered when an armed timer elapses.
#[derive(Debug, Clone)]
pub struct FireNotice {
    /// Identity the eventual close event should be attributed to.
    pub subject: Option<String>,
}

/// What an [`IdleTimer::arm`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// A new close action was scheduled.
    Armed,
    /// A weak request lost to an existing later deadline; nothing changed.
    Preserved,
}

/// Reasons a timer could not be armed. The caller treats any of these as
/// "no timer armed" and carries on.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The fire channel has been torn down; nobody would hear the timer.
    #[error("fire channel closed, scheduler is no longer running")]
    SchedulerClosed,
    /// No async runtime is available to schedule the delay on.
    #[error("no async runtime available for scheduling")]
    NoRuntime,
}

/// Stand-in deadline for offsets that overflow the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

/// Owner of the single idle deadline.
///
/// Invariant: at most one scheduled action exists at any instant; arming
/// aborts the previous one before spawning its replacement. Callers must
/// serialize access (the policy holds this inside its state mutex).
#[derive(Debug)]
pub struct IdleTimer {
    /// Earliest time the next close may fire. `None` means no deadline set.
    deadline: Option<Instant>,
    /// Handle of the outstanding scheduled action, if any.
    scheduled: Option<AbortHandle>,
    fire_tx: mpsc::UnboundedSender<FireNotice>,
}

impl IdleTimer {
    /// Create a timer that delivers fire notices on `fire_tx`.
    pub fn new(fire_tx: mpsc::UnboundedSender<FireNotice>) -> Self {
        Self {
            deadline: None,
            scheduled: None,
            fire_tx,
        }
    }

    /// Schedule a close action `offset` from now, attributed to `subject`.
    ///
    /// A weak request whose candidate deadline falls before the recorded one
    /// is a no-op: an already-pending longer timer wins. A weak request that
    /// does reschedule leaves the recorded deadline untouched, so later weak
    /// requests are still compared against the last authoritative deadline.
    pub fn arm(
        &mut self,
        offset: Duration,
        weak: bool,
        subject: Option<String>,
    ) -> Result<ArmOutcome, TimerError> {
        // Offsets too large for the clock mean "effectively never"; clamp
        // rather than panic inside the dispatch task.
        let candidate = Instant::now()
            .checked_add(offset)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        if weak {
            if let Some(current) = self.deadline {
                if candidate < current {
                    debug!(offset_secs = offset.as_secs(), "weak arm before current deadline, keeping existing timer");
                    return Ok(ArmOutcome::Preserved);
                }
            }
        }

        if self.fire_tx.is_closed() {
            return Err(TimerError::SchedulerClosed);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TimerError::NoRuntime)?;

        if let Some(previous) = self.scheduled.take() {
            previous.abort();
        }
        if !weak {
            self.deadline = Some(candidate);
        }

        let tx = self.fire_tx.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(offset).await;
            let _ = tx.send(FireNotice { subject });
        });
        self.scheduled = Some(task.abort_handle());

        info!(offset_secs = offset.as_secs(), weak, "idle close scheduled");
        Ok(ArmOutcome::Armed)
    }

    /// Clear the deadline and abort any scheduled action. Idempotent; aborting
    /// an action that already fired is a safe no-op.
    pub fn cancel(&mut self) {
        self.deadline = None;
        if let Some(scheduled) = self.scheduled.take() {
            scheduled.abort();
        }
    }

    /// Drop the handle of an action that has already run.
    pub fn acknowledge_fired(&mut self) {
        if self.scheduled.as_ref().is_some_and(AbortHandle::is_finished) {
            self.scheduled = None;
        }
    }

    /// The recorded deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a scheduled action is still outstanding.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;
    use tokio_test::assert_ok;

    fn timer() -> (IdleTimer, mpsc::UnboundedReceiver<FireNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (IdleTimer::new(tx), rx)
    }

    /// Advance the paused clock and give spawned timers a chance to run.
    async fn advance_and_settle(duration: Duration) {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        advance(duration).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn authoritative_arm_records_deadline_and_fires() {
        let (mut timer, mut rx) = timer();
        let before = Instant::now();

        let outcome = assert_ok!(timer.arm(Duration::from_secs(30), false, Some("weather".into())));
        assert_eq!(outcome, ArmOutcome::Armed);
        assert_eq!(timer.deadline(), Some(before + Duration::from_secs(30)));
        assert!(timer.is_scheduled());

        advance_and_settle(Duration::from_secs(30)).await;
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.subject.as_deref(), Some("weather"));
    }

    #[tokio::test(start_paused = true)]
    async fn weak_arm_shorter_than_deadline_is_noop() {
        let (mut timer, mut rx) = timer();
        assert_ok!(timer.arm(Duration::from_secs(30), false, Some("long".into())));
        let deadline = timer.deadline();

        let outcome = assert_ok!(timer.arm(Duration::from_secs(10), true, Some("short".into())));
        assert_eq!(outcome, ArmOutcome::Preserved);
        assert_eq!(timer.deadline(), deadline);

        advance_and_settle(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err(), "short weak timer must not have been scheduled");

        advance_and_settle(Duration::from_secs(20)).await;
        assert_eq!(rx.try_recv().unwrap().subject.as_deref(), Some("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn weak_arm_longer_reschedules_without_advancing_deadline() {
        let (mut timer, mut rx) = timer();
        timer.arm(Duration::from_secs(30), false, Some("auth".into())).unwrap();
        let recorded = timer.deadline();

        let outcome = timer.arm(Duration::from_secs(40), true, Some("weak".into())).unwrap();
        assert_eq!(outcome, ArmOutcome::Armed);
        assert_eq!(timer.deadline(), recorded, "weak arm must not advance the recorded deadline");

        advance_and_settle(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err(), "superseded action must not fire");

        advance_and_settle(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv().unwrap().subject.as_deref(), Some("weak"));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_leaves_at_most_one_scheduled_action() {
        let (mut timer, mut rx) = timer();
        timer.arm(Duration::from_secs(30), false, Some("first".into())).unwrap();
        timer.arm(Duration::from_secs(5), false, Some("second".into())).unwrap();

        advance_and_settle(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv().unwrap().subject.as_deref(), Some("second"));

        advance_and_settle(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err(), "aborted action must never fire");
    }

    #[tokio::test(start_paused = true)]
    async fn weak_arm_with_no_deadline_schedules() {
        let (mut timer, mut rx) = timer();
        let outcome = timer.arm(Duration::from_secs(5), true, None).unwrap();
        assert_eq!(outcome, ArmOutcome::Armed);
        assert_eq!(timer.deadline(), None);

        advance_and_settle(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (mut timer, mut rx) = timer();
        timer.arm(Duration::from_secs(30), false, None).unwrap();

        timer.cancel();
        timer.cancel();
        assert_eq!(timer.deadline(), None);
        assert!(!timer.is_scheduled());

        advance_and_settle(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err(), "cancelled action must never fire");
    }

    #[tokio::test(start_paused = true)]
    async fn overflowing_offset_is_clamped_not_a_panic() {
        let (mut timer, _rx) = timer();

        let outcome = assert_ok!(timer.arm(Duration::from_secs(u64::MAX), false, None));
        assert_eq!(outcome, ArmOutcome::Armed);
        assert!(timer.is_scheduled());

        let deadline = timer.deadline().unwrap();
        assert!(deadline > Instant::now() + Duration::from_secs(365 * 86_400));
    }

    #[tokio::test(start_paused = true)]
    async fn arm_fails_when_fire_channel_closed() {
        let (mut timer, rx) = timer();
        drop(rx);

        let err = timer.arm(Duration::from_secs(30), false, None).unwrap_err();
        assert!(matches!(err, TimerError::SchedulerClosed));
        assert!(!timer.is_scheduled());
    }
}
