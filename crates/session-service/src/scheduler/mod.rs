//! Timer scheduling subsystem.
//!
//! [`SessionScheduler`] owns the in-memory registry of per-session timers.
//! It is built once by the composition root and shared by handle.
//!
//! # Timers
//!
//! Every timer is a spawned task racing `sleep` against a child of the
//! scheduler's shutdown token. Cancelling removes the registry entry
//! immediately and cancels the tokens; a callback that already started
//! runs to completion and re-validates persisted state.
//!
//! # Generations
//!
//! Each install gets a fresh generation number. A callback only releases
//! slots from the set it was installed with, so a late callback never
//! removes timers installed by a later reschedule.

pub mod effects;
pub mod reconciler;
pub mod task_set;

pub use effects::FillDeadlineOutcome;
pub use reconciler::ReconcileSummary;
pub use task_set::{ScheduledTaskSet, TimerHandle, TimerSlot};

use crate::observability::metrics;
use crate::services::lifecycle_actions::LifecycleActions;
use crate::services::notifier::Notifier;
use crate::services::session_store::SessionStore;
use crate::time::{self, SessionTimeline};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

struct Inner {
    store: Arc<dyn SessionStore>,
    lifecycle: Arc<dyn LifecycleActions>,
    notifier: Arc<dyn Notifier>,
    default_timezone: Tz,
    registry: Mutex<HashMap<Uuid, ScheduledTaskSet>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle to the timer registry. Cheap to clone.
#[derive(Clone)]
pub struct SessionScheduler {
    inner: Arc<Inner>,
}

impl SessionScheduler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        lifecycle: Arc<dyn LifecycleActions>,
        notifier: Arc<dyn Notifier>,
        default_timezone: Tz,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                lifecycle,
                notifier,
                default_timezone,
                registry: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Install reminder, fill-deadline and completion timers for
    /// `session_id`, skipping targets that are not in the future.
    ///
    /// Any existing set for the session is cancelled first. Returns the
    /// number of timers installed.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn schedule_session_tasks(
        &self,
        session_id: Uuid,
        scheduled_start: DateTime<Utc>,
    ) -> usize {
        let timeline = SessionTimeline::for_start(scheduled_start);
        self.install(
            session_id,
            &[
                (TimerSlot::Reminder, timeline.reminder_at),
                (TimerSlot::FillDeadline, timeline.fill_deadline_at),
                (TimerSlot::Completion, timeline.completion_at),
            ],
            Utc::now(),
        )
        .await
    }

    /// Cancel and discard every timer for `session_id`.
    ///
    /// Returns whether a set existed.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn cancel_session_tasks(&self, session_id: Uuid) -> bool {
        let mut registry = self.inner.registry.lock().await;
        let removed = registry.remove(&session_id);
        let existed = removed.is_some();
        if let Some(set) = removed {
            set.cancel_all();
            debug!(target: "ss.scheduler", session_id = %session_id, "Timers cancelled");
        }
        metrics::set_scheduled_task_sets(registry.len());
        existed
    }

    /// Number of sessions currently holding at least one timer.
    pub async fn scheduled_task_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Whether `session_id` currently holds a timer in `slot`.
    pub async fn has_slot(&self, session_id: Uuid, slot: TimerSlot) -> bool {
        self.inner
            .registry
            .lock()
            .await
            .get(&session_id)
            .is_some_and(|set| set.contains(slot))
    }

    /// When the timer in `slot` for `session_id` is due, if one is held.
    pub async fn slot_fires_at(
        &self,
        session_id: Uuid,
        slot: TimerSlot,
    ) -> Option<DateTime<Utc>> {
        self.inner
            .registry
            .lock()
            .await
            .get(&session_id)
            .and_then(|set| set.fires_at(slot))
    }

    /// Cancel every timer and clear the registry.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut registry = self.inner.registry.lock().await;
        let count = registry.len();
        registry.clear();
        metrics::set_scheduled_task_sets(0);
        info!(target: "ss.scheduler", cancelled_sets = count, "Scheduler shut down");
    }

    /// Replace the set for `session_id` with timers for the future
    /// `targets`. Past targets are skipped; no entry is kept when nothing
    /// is installed.
    pub(crate) async fn install(
        &self,
        session_id: Uuid,
        targets: &[(TimerSlot, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> usize {
        let mut registry = self.inner.registry.lock().await;

        if let Some(previous) = registry.remove(&session_id) {
            previous.cancel_all();
        }

        if self.inner.shutdown.is_cancelled() {
            metrics::set_scheduled_task_sets(registry.len());
            return 0;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut set = ScheduledTaskSet::new(generation);

        for &(slot, fires_at) in targets {
            let Some(delay) = time::until(fires_at, now) else {
                continue;
            };
            let token = self.inner.shutdown.child_token();
            self.spawn_timer(session_id, generation, slot, fires_at, delay, token.clone());
            set.insert(slot, TimerHandle::new(fires_at, token));
        }

        let installed = set.len();
        if !set.is_empty() {
            registry.insert(session_id, set);
        }
        metrics::set_scheduled_task_sets(registry.len());

        debug!(
            target: "ss.scheduler",
            session_id = %session_id,
            generation,
            installed,
            "Timers installed"
        );
        installed
    }

    fn spawn_timer(
        &self,
        session_id: Uuid,
        generation: u64,
        slot: TimerSlot,
        fires_at: DateTime<Utc>,
        delay: std::time::Duration,
        token: CancellationToken,
    ) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    scheduler.fire(session_id, generation, slot, fires_at).await;
                }
            }
        });
    }

    async fn fire(
        &self,
        session_id: Uuid,
        generation: u64,
        slot: TimerSlot,
        fires_at: DateTime<Utc>,
    ) {
        metrics::record_timer_fired(slot.as_str());
        debug!(target: "ss.scheduler", session_id = %session_id, slot = %slot, "Timer fired");

        let inner = &self.inner;
        match slot {
            TimerSlot::Reminder => {
                if let Err(e) = effects::send_reminders(
                    inner.store.as_ref(),
                    inner.notifier.as_ref(),
                    inner.default_timezone,
                    session_id,
                )
                .await
                {
                    error!(
                        target: "ss.scheduler",
                        session_id = %session_id,
                        error = %e,
                        "Reminder failed"
                    );
                }
                self.release_slot(session_id, generation, slot).await;
            }
            TimerSlot::FillDeadline => {
                match effects::apply_fill_deadline(
                    inner.store.as_ref(),
                    inner.lifecycle.as_ref(),
                    session_id,
                    Some(fires_at),
                )
                .await
                {
                    Ok(FillDeadlineOutcome::Canceled { .. }) => {
                        self.cancel_session_tasks(session_id).await;
                    }
                    Ok(_) => self.release_slot(session_id, generation, slot).await,
                    Err(e) => {
                        error!(
                            target: "ss.scheduler",
                            session_id = %session_id,
                            error = %e,
                            "Fill-deadline failed"
                        );
                        self.release_slot(session_id, generation, slot).await;
                    }
                }
            }
            TimerSlot::Completion => {
                if let Err(e) = effects::apply_completion(
                    inner.store.as_ref(),
                    inner.lifecycle.as_ref(),
                    session_id,
                )
                .await
                {
                    error!(
                        target: "ss.scheduler",
                        session_id = %session_id,
                        error = %e,
                        "Completion failed"
                    );
                }
                self.discard_set(session_id, generation).await;
            }
        }
    }

    /// Drop a fired slot from the set it belongs to; drop the set when empty.
    async fn release_slot(&self, session_id: Uuid, generation: u64, slot: TimerSlot) {
        let mut registry = self.inner.registry.lock().await;
        let now_empty = match registry.get_mut(&session_id) {
            Some(set) if set.generation == generation => {
                set.release(slot);
                set.is_empty()
            }
            _ => false,
        };
        if now_empty {
            registry.remove(&session_id);
        }
        metrics::set_scheduled_task_sets(registry.len());
    }

    /// Drop the whole set if it is still the one from `generation`.
    async fn discard_set(&self, session_id: Uuid, generation: u64) {
        let mut registry = self.inner.registry.lock().await;
        let current = registry
            .get(&session_id)
            .is_some_and(|set| set.generation == generation);
        if current {
            if let Some(set) = registry.remove(&session_id) {
                set.cancel_all();
            }
        }
        metrics::set_scheduled_task_sets(registry.len());
    }
}
