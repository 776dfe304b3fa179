//! Single-flight coordinator for one job's recomputations.
//!
//! At most one recomputation runs at any time for a given job. Submissions
//! that arrive while a run is in flight or queued merge into the pending
//! slot and are applied as one follow-up round using only the most recent
//! snapshot. Snapshots can be large, so superseded ones are dropped rather
//! than queued.
//!
//! Flow:
//! 1. `submit` merges into the slot, then acquires the permit if free
//! 2. The drain loop takes the slot, runs setup, applies the snapshot
//! 3. The loop re-checks the slot before releasing the permit, so work
//!    merged mid-run gets a follow-up round on the same task
//! 4. `wait_until_idle` / `shutdown` block until slot and loop are both done

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::executor::TaskSpawner;
use crate::handler::{ApplyError, RecomputeHandler};
use crate::slot::{PendingSlot, SetupAction};
use crate::snapshot::Snapshot;

/// State of the active drain-loop task, broadcast to idle-waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Finished,
    Cancelled,
}

/// How an observed drain-loop task ended.
enum RunOutcome {
    Finished,
    Cancelled,
    /// The task went away without reaching a terminal state.
    Aborted,
}

/// Cloneable observer of the currently active drain loop.
#[derive(Clone)]
struct RunHandle {
    state: watch::Receiver<RunState>,
}

impl RunHandle {
    async fn outcome(mut self) -> RunOutcome {
        loop {
            match *self.state.borrow_and_update() {
                RunState::Finished => return RunOutcome::Finished,
                RunState::Cancelled => return RunOutcome::Cancelled,
                RunState::Running => {}
            }
            if self.state.changed().await.is_err() {
                return RunOutcome::Aborted;
            }
        }
    }
}

/// Error from `wait_until_idle` / `shutdown`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WaitError {
    /// The drain-loop task was aborted out from under its waiters.
    #[error("recomputation task aborted")]
    Aborted,
}

/// Pending slot and execution permit, guarded together so "is there an
/// entry" and "is a run active" are never observed inconsistently.
struct CoordinatorState {
    slot: PendingSlot,
    permit_held: bool,
    active: Option<RunHandle>,
    shutting_down: bool,
}

/// Coalescing, single-flight recomputation coordinator for one job.
pub struct Coordinator {
    job_id: String,
    handler: Arc<dyn RecomputeHandler>,
    spawner: Arc<dyn TaskSpawner>,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    pub fn new(
        job_id: impl Into<String>,
        handler: Arc<dyn RecomputeHandler>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id: job_id.into(),
            handler,
            spawner,
            state: Mutex::new(CoordinatorState {
                slot: PendingSlot::new(),
                permit_held: false,
                active: None,
                shutting_down: false,
            }),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Coalescing is off when the handler's recompute window is zero;
    /// `submit` is then a no-op.
    pub fn is_enabled(&self) -> bool {
        !self.handler.recompute_window().is_zero()
    }

    /// Submit a snapshot for recomputation. Never blocks on completion.
    pub fn submit(self: &Arc<Self>, snapshot: Snapshot) {
        self.submit_inner(snapshot, None);
    }

    /// Submit a snapshot plus a setup action to run on the execution task
    /// immediately before the snapshot is applied. If the submission is
    /// superseded before it runs, the action is dropped unrun.
    pub fn submit_with_setup(
        self: &Arc<Self>,
        snapshot: Snapshot,
        setup: impl FnOnce() + Send + 'static,
    ) {
        self.submit_inner(snapshot, Some(Box::new(setup)));
    }

    fn submit_inner(self: &Arc<Self>, snapshot: Snapshot, setup: Option<SetupAction>) {
        if !self.is_enabled() {
            return;
        }

        let mut state = self.state();
        state.slot.merge(snapshot, setup);

        if state.shutting_down {
            // Merge first so concurrent idle-waiters share the latch, but
            // never start a new execution once shutdown has begun. An
            // active loop drains the entry itself.
            if !state.permit_held
                && let Some(entry) = state.slot.take()
            {
                entry.latch().release();
                tracing::warn!(job = %self.job_id, "Update discarded - coordinator is shutting down");
            }
            return;
        }

        self.try_start_work(&mut state);
    }

    /// Block until the pending slot is empty and no drain loop is active,
    /// observed in one consistent sample.
    ///
    /// A run that ended because the recomputation was cancelled terminates
    /// the wait normally - the cancelled loop drains before stopping.
    /// Returns [`WaitError::Aborted`] if the loop task was aborted instead
    /// of running to a terminal state. Dropping the returned future cancels
    /// the wait without affecting the coordinator.
    pub async fn wait_until_idle(&self) -> Result<(), WaitError> {
        loop {
            let latch = self.state().slot.latch();
            if let Some(latch) = latch {
                latch.wait().await;
            }

            let run = self.state().active.clone();
            if let Some(run) = run {
                match run.outcome().await {
                    RunOutcome::Finished => {}
                    RunOutcome::Cancelled => return Ok(()),
                    RunOutcome::Aborted => return Err(WaitError::Aborted),
                }
            }

            let state = self.state();
            if state.slot.is_empty() && state.active.is_none() {
                return Ok(());
            }
        }
    }

    /// Stop accepting new executions, signal the recompute collaborator to
    /// shut down, then block until idle.
    pub async fn shutdown(&self) -> Result<(), WaitError> {
        self.state().shutting_down = true;
        self.handler.shutdown();
        self.wait_until_idle().await
    }

    /// Acquire the permit and spawn the drain loop if the slot is non-empty
    /// and no execution is active. Runs under the state lock.
    fn try_start_work(self: &Arc<Self>, state: &mut CoordinatorState) {
        if state.slot.is_empty() || state.permit_held {
            return;
        }

        state.permit_held = true;
        let (state_tx, state_rx) = watch::channel(RunState::Running);

        match self
            .spawner
            .spawn(Box::pin(Arc::clone(self).drain_loop(state_tx)))
        {
            Ok(_task) => {
                state.active = Some(RunHandle { state: state_rx });
            }
            Err(rejected) => {
                // Waiters must never be left blocked on work that will not
                // run. Drain and release immediately.
                if let Some(entry) = state.slot.take() {
                    entry.latch().release();
                }
                state.permit_held = false;
                state.active = None;
                tracing::warn!(
                    job = %self.job_id,
                    error = %rejected,
                    "Recomputation discarded - executor is shutting down"
                );
            }
        }
    }

    /// The single execution task: repeatedly drain the slot and apply, then
    /// release the permit only after observing the slot empty under the
    /// same lock that cleared it.
    async fn drain_loop(self: Arc<Self>, state_tx: watch::Sender<RunState>) {
        loop {
            let entry = self.state().slot.take();

            if let Some(mut entry) = entry {
                entry.run_setup();

                let extension = entry.window_extension(&self.job_id);
                let result = self.handler.apply(entry.snapshot(), extension).await;
                entry.latch().release();

                match result {
                    Ok(()) => {}
                    Err(ApplyError::Cancelled) => {
                        self.finish_cancelled();
                        state_tx.send_replace(RunState::Cancelled);
                        return;
                    }
                    Err(ApplyError::Failed(error)) => {
                        tracing::error!(job = %self.job_id, error = %error, "Recomputation failed");
                    }
                }
            } else {
                debug_assert!(false, "drain loop ran with an empty slot");
                tracing::warn!(job = %self.job_id, "Recomputation requested with no pending update");
            }

            if self.try_finish_work() {
                state_tx.send_replace(RunState::Finished);
                return;
            }
        }
    }

    /// Returns false when more work merged in while the last round ran; the
    /// loop then runs another round without releasing the permit.
    fn try_finish_work(&self) -> bool {
        let mut state = self.state();
        if !state.slot.is_empty() {
            return false;
        }
        state.permit_held = false;
        state.active = None;
        true
    }

    /// Stop without re-arming after a cancelled recomputation, draining
    /// anything that merged while the cancelled round was in flight.
    fn finish_cancelled(&self) {
        let mut state = self.state();
        if let Some(entry) = state.slot.take() {
            entry.latch().release();
            tracing::warn!(job = %self.job_id, "Pending update discarded - recomputation cancelled");
        }
        state.permit_held = false;
        state.active = None;
    }

    /// Lock the coordinator state, recovering a poisoned lock.
    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(job = %self.job_id, "Coordinator state mutex poisoned");
                poisoned.into_inner()
            }
        }
    }
}
