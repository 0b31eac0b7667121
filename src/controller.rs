// User-initiated instance actions: optimistic update, backend call, rollback
// on failure, and a follow-up status fetch on success.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info};

use crate::client::InstanceApi;
use crate::config::DEFAULT_REFETCH_DELAY;
use crate::error::ApiError;
use crate::metrics;
use crate::models::{ChallengeId, InstanceResponse, Operation};
use crate::reconcile::LocalStatus;
use crate::store::{rollback_counted, FetchOutcome, InstanceStore, NoticeLevel};

/// Runs start/stop/kill/build against the backend and keeps the store in step.
#[derive(Clone)]
pub struct InstanceController {
    api: Arc<dyn InstanceApi>,
    store: InstanceStore,
    refetch_delay: Duration,
}

impl InstanceController {
    pub fn new(api: Arc<dyn InstanceApi>, store: InstanceStore) -> Self {
        Self {
            api,
            store,
            refetch_delay: DEFAULT_REFETCH_DELAY,
        }
    }

    /// Wait this long after a successful action before confirming its effect.
    pub fn with_refetch_delay(mut self, delay: Duration) -> Self {
        self.refetch_delay = delay;
        self
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn api(&self) -> Arc<dyn InstanceApi> {
        self.api.clone()
    }

    /// Fetch and reconcile the status of one challenge.
    pub async fn refresh(&self, id: ChallengeId) -> FetchOutcome {
        self.store.refresh(self.api.as_ref(), id).await
    }

    /// Start (or restart) an instance. Shows `Building` until the backend
    /// confirms.
    pub async fn start(&self, id: ChallengeId) -> Result<InstanceResponse, ApiError> {
        let call = self.api.start(id);
        self.run(id, Operation::Start, Some(LocalStatus::Building), call)
            .await
    }

    /// Stop a running instance. Shows `Stopped` immediately.
    pub async fn stop(&self, id: ChallengeId) -> Result<Value, ApiError> {
        let call = self.api.stop(id);
        self.run(id, Operation::Stop, Some(LocalStatus::Stopped), call)
            .await
    }

    /// Kill an instance. Looks the same as stop to the player.
    pub async fn kill(&self, id: ChallengeId) -> Result<Value, ApiError> {
        let call = self.api.kill(id);
        self.run(id, Operation::Kill, Some(LocalStatus::Stopped), call)
            .await
    }

    /// Build the challenge image. No optimistic state.
    pub async fn build(&self, id: ChallengeId) -> Result<Value, ApiError> {
        let call = self.api.build(id);
        self.run(id, Operation::Build, None, call).await
    }

    async fn run<T, F>(
        &self,
        id: ChallengeId,
        op: Operation,
        optimistic: Option<LocalStatus>,
        call: F,
    ) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        // Rolled back if this future is dropped before the call returns.
        let overlay = optimistic.map(|state| self.store.optimistic(id, op, state));

        let result = {
            let _guard = self.store.in_flight().enter(id, op);
            info!(challenge_id = %id, op = %op, "instance action requested");
            call.await
        };

        match result {
            Ok(value) => {
                metrics::INSTANCE_ACTIONS_TOTAL
                    .with_label_values(&[op.as_str(), "ok"])
                    .inc();
                info!(challenge_id = %id, op = %op, "instance action succeeded");
                self.store
                    .notify(NoticeLevel::Success, Some(id), op.success_message());

                if let Some(overlay) = overlay {
                    let token = overlay.settle();
                    tokio::time::sleep(self.refetch_delay).await;
                    if let FetchOutcome::Failed(e) = self.refresh(id).await {
                        // Fall back to the last confirmed state; the next poll
                        // will correct it.
                        error!(challenge_id = %id, op = %op, "confirming status failed: {e}");
                        rollback_counted(&self.store, id, token);
                    }
                }
                Ok(value)
            }
            Err(e) => {
                metrics::INSTANCE_ACTIONS_TOTAL
                    .with_label_values(&[op.as_str(), "error"])
                    .inc();
                error!(challenge_id = %id, op = %op, "instance action failed: {e}");
                if let Some(overlay) = overlay {
                    overlay.rollback();
                }
                self.store
                    .notify(NoticeLevel::Error, Some(id), e.user_message(op));
                Err(e)
            }
        }
    }
}
