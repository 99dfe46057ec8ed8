//! Update-gating delay conditions.
//!
//! A pending bundle is applied only while the gate is open: every armed
//! condition must be satisfied. Conditions survive restarts through the
//! store; the `kill` condition is one-shot and is consumed by the first app
//! start after it was armed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::Store;

/// A single gating condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum DelayCondition {
    /// Open only while the host window is blurred or hidden.
    Background,
    /// Open only after the application exited and relaunched.
    Kill,
    /// Open only after the given instant.
    Date(DateTime<Utc>),
    /// Open only when the native build version equals the literal.
    NativeVersion(String),
}

/// Evaluates the conjunction of armed delay conditions.
pub struct DelayController {
    store: Arc<RwLock<Store>>,
    version_build: String,
    background: AtomicBool,
    kill_satisfied: AtomicBool,
}

impl DelayController {
    pub fn new(store: Arc<RwLock<Store>>, version_build: String) -> Self {
        Self {
            store,
            version_build,
            background: AtomicBool::new(false),
            kill_satisfied: AtomicBool::new(false),
        }
    }

    /// Arm a set of conditions, replacing any previous set.
    pub async fn set_multi_delay(&self, conditions: Vec<DelayCondition>) -> Result<()> {
        let arm_kill = conditions.iter().any(|c| matches!(c, DelayCondition::Kill));
        info!(count = conditions.len(), "Arming delay conditions");

        let mut store = self.store.write().await;
        store.set_delay_conditions(conditions);
        if arm_kill {
            store.set_kill_pending(true);
            self.kill_satisfied.store(false, Ordering::SeqCst);
        }
        store.save().await
    }

    /// Drop all armed conditions.
    pub async fn cancel_delay(&self) -> Result<()> {
        let mut store = self.store.write().await;
        if store.delay_conditions().is_empty() && !store.kill_pending() {
            return Ok(());
        }
        info!("Cancelling delay conditions");
        store.set_delay_conditions(Vec::new());
        store.set_kill_pending(false);
        store.save().await
    }

    /// Whether the gate is open. An empty condition set is always open.
    pub async fn are_conditions_satisfied(&self) -> bool {
        let store = self.store.read().await;
        let satisfied = store.delay_conditions().iter().all(|c| match c {
            DelayCondition::Background => self.background.load(Ordering::SeqCst),
            DelayCondition::Kill => self.kill_satisfied.load(Ordering::SeqCst),
            DelayCondition::Date(instant) => Utc::now() > *instant,
            DelayCondition::NativeVersion(version) => *version == self.version_build,
        });
        debug!(satisfied, "Evaluated delay gate");
        satisfied
    }

    /// Consume the one-shot `kill` flag. Called once per process launch.
    pub async fn on_app_start(&self) -> Result<()> {
        let mut store = self.store.write().await;
        if store.kill_pending() {
            store.set_kill_pending(false);
            self.kill_satisfied.store(true, Ordering::SeqCst);
            store.save().await?;
            info!("Kill condition satisfied by relaunch");
        }
        Ok(())
    }

    /// The host window gained focus.
    pub fn on_foreground(&self) {
        self.background.store(false, Ordering::SeqCst);
    }

    /// The host window was blurred or hidden.
    pub fn on_background(&self) {
        self.background.store(true, Ordering::SeqCst);
    }
}
