// In-memory backend used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::client::InstanceApi;
use crate::error::ApiError;
use crate::models::{ChallengeId, InstanceResponse, InstanceStatus, Operation};

pub const CONNECTION: &str = "tcp://1.2.3.4:31337";

/// Simulates the backend's per-team instance table.
#[derive(Default)]
pub struct FakeApi {
    instances: Mutex<HashMap<ChallengeId, InstanceStatus>>,
    failing_status: Mutex<HashSet<ChallengeId>>,
    malformed_status: Mutex<HashSet<ChallengeId>>,
    failing_ops: Mutex<HashMap<Operation, (u16, String)>>,
    status_delays: Mutex<HashMap<ChallengeId, Duration>>,
    calls: Mutex<Vec<(ChallengeId, Operation)>>,
    /// When set, start/stop/kill wait for a permit before answering.
    action_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, id: ChallengeId, status: InstanceStatus) {
        self.instances.lock().unwrap().insert(id, status);
    }

    pub fn fail_status(&self, id: ChallengeId) {
        self.failing_status.lock().unwrap().insert(id);
    }

    pub fn malformed_status(&self, id: ChallengeId) {
        self.malformed_status.lock().unwrap().insert(id);
    }

    pub fn fail_op(&self, op: Operation, status: u16, code: &str) {
        self.failing_ops
            .lock()
            .unwrap()
            .insert(op, (status, code.to_string()));
    }

    pub fn delay_status(&self, id: ChallengeId, delay: Duration) {
        self.status_delays.lock().unwrap().insert(id, delay);
    }

    pub fn gate_actions(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.action_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self, op: Operation) -> Vec<ChallengeId> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, o)| *o == op)
            .map(|(id, _)| *id)
            .collect()
    }

    fn record(&self, id: ChallengeId, op: Operation) {
        self.calls.lock().unwrap().push((id, op));
    }

    async fn action(&self, id: ChallengeId, op: Operation) -> Result<(), ApiError> {
        self.record(id, op);
        let gate = self.action_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        let failure = self.failing_ops.lock().unwrap().get(&op).cloned();
        if let Some((status, code)) = failure {
            let body = json!({ "error": code }).to_string();
            return Err(ApiError::from_response(op, status, &body));
        }
        Ok(())
    }

    pub fn running() -> InstanceStatus {
        InstanceStatus {
            has_instance: true,
            status: "running".into(),
            container: "ctr-1".into(),
            connection_info: vec![CONNECTION.into()],
            ..Default::default()
        }
    }
}

#[async_trait]
impl InstanceApi for FakeApi {
    async fn start(&self, id: ChallengeId) -> Result<InstanceResponse, ApiError> {
        self.action(id, Operation::Start).await?;
        self.set_status(id, Self::running());
        Ok(InstanceResponse {
            status: "instance_started".into(),
            image_name: "img".into(),
            container_name: "ctr-1".into(),
            ..Default::default()
        })
    }

    async fn stop(&self, id: ChallengeId) -> Result<Value, ApiError> {
        self.action(id, Operation::Stop).await?;
        self.set_status(
            id,
            InstanceStatus {
                has_instance: true,
                status: "stopped".into(),
                container: "ctr-1".into(),
                ..Default::default()
            },
        );
        Ok(json!({ "message": "instance_stopped" }))
    }

    async fn kill(&self, id: ChallengeId) -> Result<Value, ApiError> {
        self.action(id, Operation::Kill).await?;
        self.instances.lock().unwrap().remove(&id);
        Ok(json!({ "message": "instance_killed" }))
    }

    async fn status(&self, id: ChallengeId) -> Result<InstanceStatus, ApiError> {
        self.record(id, Operation::Status);
        let delay = self.status_delays.lock().unwrap().get(&id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_status.lock().unwrap().contains(&id) {
            return Err(ApiError::from_response(Operation::Status, 502, ""));
        }
        if self.malformed_status.lock().unwrap().contains(&id) {
            return Err(ApiError::Decode("expected value at line 1".into()));
        }
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(InstanceStatus::no_instance))
    }

    async fn build(&self, id: ChallengeId) -> Result<Value, ApiError> {
        self.action(id, Operation::Build).await?;
        Ok(json!({ "message": "built" }))
    }
}
