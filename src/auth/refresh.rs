// Token refresh coordination
//
// At most one refresh operation exists at a time. Concurrent requests join
// the pending operation and share its result; the operation runs on its own
// task so it settles even if every waiter goes away.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::AuthError;

type SharedResult = Shared<BoxFuture<'static, Option<String>>>;

/// Identity of one refresh operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    id: u64,
}

impl RefreshTicket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Coordinator state as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing {
        operation_id: u64,
        started_at: DateTime<Utc>,
    },
}

/// Outcome of the check made before a new operation would start
pub enum Precheck {
    /// No refresh needed; resolve immediately with this value
    Settled(Option<String>),
    /// Start a refresh
    Refresh,
}

struct RefreshOperation {
    ticket: RefreshTicket,
    started_at: DateTime<Utc>,
    result: SharedResult,
}

/// What took over from a displaced operation
enum Successor {
    /// Forced operation that replaced it
    Pending(SharedResult),
    /// Value handed over by a cancellation
    Settled(Option<String>),
}

#[derive(Default)]
struct Slot {
    active: Option<RefreshOperation>,
    next_id: u64,
    started: u64,
    /// Displaced operations that have not settled yet, keyed by id
    displaced: HashMap<u64, Successor>,
}

/// Handle on a pending (or already settled) refresh result
#[derive(Clone)]
pub struct RefreshHandle {
    operation_id: Option<u64>,
    joined: bool,
    result: SharedResult,
}

impl RefreshHandle {
    fn ready(value: Option<String>) -> Self {
        Self {
            operation_id: None,
            joined: false,
            result: futures::future::ready(value).boxed().shared(),
        }
    }

    /// Operation this handle waits on; `None` when no refresh was needed
    pub fn operation_id(&self) -> Option<u64> {
        self.operation_id
    }

    /// True when the handle joined an operation started by someone else
    pub fn joined_existing(&self) -> bool {
        self.joined
    }

    /// Wait for the operation to settle
    pub async fn wait(self) -> Option<String> {
        self.result.await
    }
}

/// Coalesces refresh requests into a single in-flight operation
///
/// State machine: `Idle -> Refreshing -> Idle`. A failed operation settles
/// with `None` and the coordinator returns to `Idle` in the same step.
#[derive(Clone)]
pub struct RefreshCoordinator {
    slot: Arc<Mutex<Slot>>,
    settle_timeout: Duration,
}

impl RefreshCoordinator {
    /// `settle_timeout` bounds every operation; one that runs longer settles
    /// with `None`
    pub fn new(settle_timeout: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            settle_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join the in-flight operation, or start one with `start`
    ///
    /// Must be called inside a Tokio runtime. `start` runs under the slot
    /// lock and must only build the future, not call back into the
    /// coordinator.
    pub fn request_refresh<F, Fut>(&self, start: F) -> RefreshHandle
    where
        F: FnOnce(RefreshTicket) -> Fut,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        self.request_refresh_unless(|| Precheck::Refresh, start)
    }

    /// Like [`request_refresh`](Self::request_refresh), but when no operation
    /// is in flight `precheck` decides, under the slot lock, whether one is
    /// still needed
    ///
    /// A caller whose view of the session predates a just-settled operation
    /// uses this to pick up that operation's outcome instead of starting a
    /// second one.
    pub fn request_refresh_unless<P, F, Fut>(&self, precheck: P, start: F) -> RefreshHandle
    where
        P: FnOnce() -> Precheck,
        F: FnOnce(RefreshTicket) -> Fut,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        let mut slot = self.lock();

        if let Some(op) = slot.active.as_ref() {
            tracing::debug!(operation_id = op.ticket.id, "Joining in-flight refresh");
            return RefreshHandle {
                operation_id: Some(op.ticket.id),
                joined: true,
                result: op.result.clone(),
            };
        }

        if let Precheck::Settled(value) = precheck() {
            return RefreshHandle::ready(value);
        }

        self.install(&mut slot, start)
    }

    /// Detach any in-flight operation and unconditionally start a new one
    ///
    /// The displaced operation keeps running but can no longer commit; its
    /// waiters are handed over to the new operation.
    pub fn force_refresh<F, Fut>(&self, start: F) -> RefreshHandle
    where
        F: FnOnce(RefreshTicket) -> Fut,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        let mut slot = self.lock();

        let previous = slot.active.take();
        let handle = self.install(&mut slot, start);

        if let Some(previous) = previous {
            tracing::info!(
                superseded = previous.ticket.id,
                operation_id = ?handle.operation_id,
                "Forcing refresh over in-flight operation"
            );
            slot.displaced.insert(
                previous.ticket.id,
                Successor::Pending(handle.result.clone()),
            );
        }

        handle
    }

    /// Detach the in-flight operation without starting another
    ///
    /// Its waiters receive `settled`. Returns false when nothing was in
    /// flight.
    pub fn cancel(&self, settled: Option<String>) -> bool {
        let mut slot = self.lock();

        match slot.active.take() {
            Some(previous) => {
                tracing::info!(superseded = previous.ticket.id, "Cancelled in-flight refresh");
                slot.displaced
                    .insert(previous.ticket.id, Successor::Settled(settled));
                true
            }
            None => false,
        }
    }

    /// True while `ticket` owns the slot
    pub fn is_current(&self, ticket: RefreshTicket) -> bool {
        matches!(self.lock().active.as_ref(), Some(op) if op.ticket == ticket)
    }

    pub fn state(&self) -> RefreshState {
        match self.lock().active.as_ref() {
            Some(op) => RefreshState::Refreshing {
                operation_id: op.ticket.id,
                started_at: op.started_at,
            },
            None => RefreshState::Idle,
        }
    }

    /// Number of operations started since creation
    pub fn operations_started(&self) -> u64 {
        self.lock().started
    }

    fn install<F, Fut>(&self, slot: &mut Slot, start: F) -> RefreshHandle
    where
        F: FnOnce(RefreshTicket) -> Fut,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        // Callers hold the lock and have either seen an empty slot or emptied
        // it themselves.
        if slot.active.is_some() {
            panic!("{}", AuthError::ConcurrentAccessViolation);
        }

        slot.next_id += 1;
        slot.started += 1;
        let ticket = RefreshTicket { id: slot.next_id };
        let started_at = Utc::now();

        let operation = start(ticket);
        let this = self.clone();
        let task = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(this.settle_timeout, operation).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(
                        operation_id = ticket.id,
                        "Refresh did not settle within {:?}",
                        this.settle_timeout
                    );
                    None
                }
            };
            this.settle(ticket, outcome).await
        });

        let result = async move {
            match task.await {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!("Refresh task aborted: {}", e);
                    None
                }
            }
        }
        .boxed()
        .shared();

        tracing::debug!(operation_id = ticket.id, "Refresh started");

        slot.active = Some(RefreshOperation {
            ticket,
            started_at,
            result: result.clone(),
        });

        RefreshHandle {
            operation_id: Some(ticket.id),
            joined: false,
            result,
        }
    }

    /// Release the slot if `ticket` still owns it, otherwise defer to
    /// whatever displaced it: the forcing operation's result or the
    /// cancellation value
    async fn settle(&self, ticket: RefreshTicket, outcome: Option<String>) -> Option<String> {
        let successor = {
            let mut slot = self.lock();

            if matches!(slot.active.as_ref(), Some(op) if op.ticket == ticket) {
                slot.active = None;
                if outcome.is_some() {
                    tracing::debug!(operation_id = ticket.id, "Refresh settled");
                } else {
                    tracing::warn!(
                        operation_id = ticket.id,
                        "Refresh failed, coordinator back to idle"
                    );
                }
                return outcome;
            }

            slot.displaced
                .remove(&ticket.id)
                .unwrap_or(Successor::Settled(None))
        };

        tracing::debug!(operation_id = ticket.id, "Superseded refresh relinked");

        match successor {
            Successor::Pending(result) => result.await,
            Successor::Settled(value) => value,
        }
    }
}
