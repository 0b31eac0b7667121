// Client for pwnthemall challenge instances: API calls, status reconciliation,
// a shared store with polling and realtime invalidation.

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod models;
pub mod poller;
pub mod realtime;
pub mod reconcile;
pub mod render;
pub mod store;

#[cfg(test)]
mod fake;

pub use client::{HttpInstanceClient, InstanceApi};
pub use config::Config;
pub use controller::InstanceController;
pub use error::ApiError;
pub use models::{ChallengeId, InstanceResponse, InstanceStatus, Operation};
pub use reconcile::{reconcile, LocalStatus, Reconciled};
pub use store::{InstanceStore, InstanceView, StoreEvent};
