// Shared read model of challenge instances, keyed by challenge id.
//
// All presentation surfaces observe the same store. Writes are per-key merges;
// the map is never replaced wholesale. The mutex is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::client::InstanceApi;
use crate::error::ApiError;
use crate::metrics;
use crate::models::{ChallengeId, InstanceStatus, Operation};
use crate::reconcile::{available_actions, reconcile, Action, LocalStatus, Reconciled};

const EVENT_CAPACITY: usize = 256;

/// What presentation renders for one challenge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    pub id: ChallengeId,
    /// Optimistic state while an action is pending, else the confirmed one.
    pub local_status: LocalStatus,
    /// Empty unless `local_status` is `Running`.
    pub connection_info: Vec<String>,
    /// Last status confirmed by the backend, if any fetch has succeeded.
    pub confirmed: Option<InstanceStatus>,
    /// The action whose outcome is not yet confirmed.
    pub pending: Option<Operation>,
}

impl InstanceView {
    fn unknown(id: ChallengeId) -> Self {
        Self {
            id,
            local_status: LocalStatus::Stopped,
            connection_info: Vec::new(),
            confirmed: None,
            pending: None,
        }
    }

    pub fn has_instance(&self) -> bool {
        self.confirmed.as_ref().is_some_and(|s| s.has_instance)
    }

    pub fn actions(&self) -> Vec<Action> {
        available_actions(self.local_status, self.has_instance())
    }
}

/// User-facing message, the terminal equivalent of a toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub challenge_id: Option<ChallengeId>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The displayed state of a challenge changed.
    Updated(InstanceView),
    Notice(Notice),
}

/// Result of one sequenced status fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    Applied(InstanceView),
    /// A newer fetch for the same challenge was issued meanwhile.
    Stale,
    /// The owner went away before the response arrived.
    Cancelled,
    Failed(ApiError),
}

impl FetchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }
}

/// Optimistic state overlaying the confirmed one.
#[derive(Debug, Clone)]
struct Pending {
    token: u64,
    op: Operation,
    optimistic: LocalStatus,
    /// Set once the action request returned; fetches issued after this ticket
    /// confirm (and clear) the pending state.
    confirm_after: Option<u64>,
}

#[derive(Debug, Default)]
struct Entry {
    confirmed: Reconciled,
    raw: Option<InstanceStatus>,
    pending: Option<Pending>,
    /// Latest fetch ticket issued for this challenge.
    issued: u64,
    /// Tickets whose fetch was dropped or failed; they supersede nothing.
    abandoned: Vec<u64>,
}

impl Entry {
    /// A ticket is stale once a newer one that is still outstanding or already
    /// applied exists.
    fn superseded(&self, ticket: u64) -> bool {
        self.abandoned.contains(&ticket)
            || (ticket + 1..=self.issued).any(|t| !self.abandoned.contains(&t))
    }

    fn view(&self, id: ChallengeId) -> InstanceView {
        let (local_status, connection_info) = match &self.pending {
            Some(p) => (p.optimistic, Vec::new()),
            None => (
                self.confirmed.local_status,
                self.confirmed.connection_info.clone(),
            ),
        };
        InstanceView {
            id,
            local_status,
            connection_info,
            confirmed: self.raw.clone(),
            pending: self.pending.as_ref().map(|p| p.op),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<ChallengeId, Entry>,
    next_token: u64,
}

/// Thread-safe shared instance store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    inner: Arc<Mutex<Inner>>,
    in_flight: InFlight,
    events: broadcast::Sender<StoreEvent>,
}

impl InstanceStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            in_flight: InFlight::default(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive every subsequent [`StoreEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Operations currently in flight.
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Current view. A challenge never seen before reads as stopped.
    pub fn view(&self, id: ChallengeId) -> InstanceView {
        let inner = self.lock();
        inner
            .entries
            .get(&id)
            .map(|e| e.view(id))
            .unwrap_or_else(|| InstanceView::unknown(id))
    }

    /// Challenges the store knows about, in id order.
    pub fn tracked_ids(&self) -> Vec<ChallengeId> {
        let inner = self.lock();
        let mut ids: Vec<_> = inner.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Publish a user-facing notice.
    pub fn notify(&self, level: NoticeLevel, challenge_id: Option<ChallengeId>, message: impl Into<String>) {
        let _ = self.events.send(StoreEvent::Notice(Notice {
            level,
            challenge_id,
            message: message.into(),
        }));
    }

    fn publish_if_changed(&self, before: &InstanceView, after: &InstanceView) {
        if before != after {
            // No receivers is fine
            let _ = self.events.send(StoreEvent::Updated(after.clone()));
        }
    }

    /// Issue a fetch ticket. Only the response to the latest live ticket is
    /// applied.
    pub fn begin_fetch(&self, id: ChallengeId) -> u64 {
        let mut inner = self.lock();
        let entry = inner.entries.entry(id).or_default();
        entry.issued += 1;
        entry.issued
    }

    /// Give up on `ticket`: its response will never be applied, and older
    /// tickets still in flight are no longer superseded by it.
    pub fn abandon_fetch(&self, id: ChallengeId, ticket: u64) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            if ticket <= entry.issued && !entry.abandoned.contains(&ticket) {
                entry.abandoned.push(ticket);
            }
        }
    }

    /// Issue a ticket that is abandoned unless it is applied before drop.
    fn fetch_ticket(&self, id: ChallengeId) -> FetchTicket<'_> {
        FetchTicket {
            store: self,
            id,
            ticket: Some(self.begin_fetch(id)),
        }
    }

    /// Apply a fetched status unless a newer live ticket exists for `id`.
    /// Returns the new view, or `None` when the response was stale.
    pub fn apply_fetch(
        &self,
        id: ChallengeId,
        ticket: u64,
        raw: InstanceStatus,
    ) -> Option<InstanceView> {
        let (before, after) = {
            let mut inner = self.lock();
            let entry = inner.entries.entry(id).or_default();
            if entry.superseded(ticket) {
                debug!(
                    challenge_id = %id,
                    ticket,
                    latest = entry.issued,
                    "discarding stale status response"
                );
                metrics::STALE_RESPONSES_DISCARDED_TOTAL.inc();
                return None;
            }
            let before = entry.view(id);
            entry.abandoned.retain(|t| *t > ticket);
            entry.confirmed = reconcile(&raw);
            entry.raw = Some(raw);
            let confirms = entry
                .pending
                .as_ref()
                .and_then(|p| p.confirm_after)
                .is_some_and(|t| ticket > t);
            if confirms {
                entry.pending = None;
            }
            (before, entry.view(id))
        };
        self.publish_if_changed(&before, &after);
        Some(after)
    }

    /// Merge a status pushed by the backend. Supersedes any fetch in flight.
    pub fn apply_push(&self, id: ChallengeId, raw: InstanceStatus) -> InstanceView {
        let ticket = self.begin_fetch(id);
        match self.apply_fetch(id, ticket, raw) {
            Some(view) => view,
            // Another ticket was issued concurrently; its response wins.
            None => self.view(id),
        }
    }

    /// Overlay an optimistic state for `op`. Returns a token for
    /// [`settle`](Self::settle) and [`rollback`](Self::rollback).
    pub fn begin_optimistic(&self, id: ChallengeId, op: Operation, optimistic: LocalStatus) -> u64 {
        let (token, before, after) = {
            let mut inner = self.lock();
            inner.next_token += 1;
            let token = inner.next_token;
            let entry = inner.entries.entry(id).or_default();
            let before = entry.view(id);
            entry.pending = Some(Pending {
                token,
                op,
                optimistic,
                confirm_after: None,
            });
            (token, before, entry.view(id))
        };
        self.publish_if_changed(&before, &after);
        token
    }

    /// [`begin_optimistic`](Self::begin_optimistic) wrapped in a guard that
    /// rolls the overlay back if it is dropped before being settled.
    pub fn optimistic(&self, id: ChallengeId, op: Operation, optimistic: LocalStatus) -> OptimisticGuard {
        OptimisticGuard {
            store: self.clone(),
            id,
            token: Some(self.begin_optimistic(id, op, optimistic)),
        }
    }

    /// The action request succeeded: the next fetch issued from now on
    /// replaces the optimistic state.
    pub fn settle(&self, id: ChallengeId, token: u64) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            let issued = entry.issued;
            if let Some(p) = entry.pending.as_mut().filter(|p| p.token == token) {
                p.confirm_after = Some(issued);
            }
        }
    }

    /// Drop the optimistic state and show the last confirmed one again.
    /// A newer pending action (different token) is left alone.
    pub fn rollback(&self, id: ChallengeId, token: u64) -> bool {
        let (before, after) = {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return false;
            };
            if !entry.pending.as_ref().is_some_and(|p| p.token == token) {
                return false;
            }
            let before = entry.view(id);
            entry.pending = None;
            (before, entry.view(id))
        };
        self.publish_if_changed(&before, &after);
        true
    }

    /// Sequenced fetch: take a ticket, call the API, apply the result.
    pub async fn refresh(&self, api: &dyn InstanceApi, id: ChallengeId) -> FetchOutcome {
        self.refresh_while(api, id, || true).await
    }

    /// Like [`refresh`](Self::refresh), but the response is dropped when
    /// `is_live` returns false by the time it arrives.
    ///
    /// Transport and backend errors leave the state untouched. A malformed
    /// body is treated as "no instance".
    pub async fn refresh_while<F>(&self, api: &dyn InstanceApi, id: ChallengeId, is_live: F) -> FetchOutcome
    where
        F: Fn() -> bool,
    {
        if !is_live() {
            metrics::STATUS_FETCHES_TOTAL
                .with_label_values(&["cancelled"])
                .inc();
            return FetchOutcome::Cancelled;
        }

        // Abandoned on every early return and when the future is dropped.
        let mut ticket = self.fetch_ticket(id);
        let result = {
            let _guard = self.in_flight.enter(id, Operation::Status);
            api.status(id).await
        };

        if !is_live() {
            metrics::STATUS_FETCHES_TOTAL
                .with_label_values(&["cancelled"])
                .inc();
            return FetchOutcome::Cancelled;
        }

        let raw = match result {
            Ok(raw) => raw,
            Err(ApiError::Decode(reason)) => {
                warn!(challenge_id = %id, "malformed status response, treating as no instance: {reason}");
                metrics::STATUS_FETCHES_TOTAL
                    .with_label_values(&["malformed"])
                    .inc();
                InstanceStatus::no_instance()
            }
            Err(e) => {
                warn!(challenge_id = %id, "status fetch failed: {e}");
                metrics::STATUS_FETCHES_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                return FetchOutcome::Failed(e);
            }
        };

        match ticket.apply(raw) {
            Some(view) => {
                metrics::STATUS_FETCHES_TOTAL
                    .with_label_values(&["applied"])
                    .inc();
                FetchOutcome::Applied(view)
            }
            None => {
                metrics::STATUS_FETCHES_TOTAL
                    .with_label_values(&["stale"])
                    .inc();
                FetchOutcome::Stale
            }
        }
    }
}

/// Fetch ticket owned by one in-flight request.
struct FetchTicket<'a> {
    store: &'a InstanceStore,
    id: ChallengeId,
    ticket: Option<u64>,
}

impl FetchTicket<'_> {
    fn apply(&mut self, raw: InstanceStatus) -> Option<InstanceView> {
        let ticket = self.ticket.take()?;
        let applied = self.store.apply_fetch(self.id, ticket, raw);
        if applied.is_none() {
            self.store.abandon_fetch(self.id, ticket);
        }
        applied
    }
}

impl Drop for FetchTicket<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.store.abandon_fetch(self.id, ticket);
        }
    }
}

/// Optimistic overlay that rolls back on drop unless settled.
#[derive(Debug)]
pub struct OptimisticGuard {
    store: InstanceStore,
    id: ChallengeId,
    token: Option<u64>,
}

impl OptimisticGuard {
    /// The action request succeeded. Returns the token, so that a failed
    /// confirming fetch can still roll back.
    pub fn settle(mut self) -> u64 {
        let token = self.token.take().unwrap_or_default();
        self.store.settle(self.id, token);
        token
    }

    /// Roll back now. False if a newer action replaced the overlay.
    pub fn rollback(mut self) -> bool {
        self.token
            .take()
            .is_some_and(|token| rollback_counted(&self.store, self.id, token))
    }
}

impl Drop for OptimisticGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if rollback_counted(&self.store, self.id, token) {
                debug!(challenge_id = %self.id, "action dropped before completion, rolled back");
            }
        }
    }
}

/// Roll back and count it.
pub(crate) fn rollback_counted(store: &InstanceStore, id: ChallengeId, token: u64) -> bool {
    let rolled_back = store.rollback(id, token);
    if rolled_back {
        metrics::OPTIMISTIC_ROLLBACKS_TOTAL.inc();
    }
    rolled_back
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight operations keyed by `(challenge, operation)`.
///
/// Replaces a single shared loading flag: starting challenge 1 does not make
/// challenge 2 look busy.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashMap<(ChallengeId, Operation), usize>>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<(ChallengeId, Operation), usize>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `(id, op)` in flight until the returned guard is dropped.
    pub fn enter(&self, id: ChallengeId, op: Operation) -> InFlightGuard {
        *self.lock().entry((id, op)).or_insert(0) += 1;
        InFlightGuard {
            owner: self.clone(),
            key: (id, op),
        }
    }

    /// Any operation at all in flight.
    pub fn is_loading(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn is_busy(&self, id: ChallengeId, op: Operation) -> bool {
        self.lock().contains_key(&(id, op))
    }

    /// Any operation on this challenge in flight.
    pub fn is_challenge_busy(&self, id: ChallengeId) -> bool {
        self.lock().keys().any(|(cid, _)| *cid == id)
    }
}

/// Releases its in-flight key on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    owner: InFlight,
    key: (ChallengeId, Operation),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.owner.lock();
        if let Some(count) = map.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.key);
            }
        }
    }
}
