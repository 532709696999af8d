//! Model Manager (C8): load/unload state machine, admission through the
//! VRAM Accountant, and a FIFO queue for requests that cannot be admitted
//! yet. A per-model mutex serializes loads so at most one load is ever in
//! flight for the same model.

pub mod adapters;
pub mod preloader;

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

use crate::database::DatabaseConnection;
use crate::domain_types::{ModelId, Priority, VramMb};
use crate::error::Severity;
use crate::error_bus::{ErrorBus, ErrorRecord};
use crate::time_provider::SharedTimeProvider;
use crate::vram::{Admission, EvictionCandidate, EvictionPlan, VramAccountant, VramError};
use adapters::{AdapterError, ModelBackend};
use preloader::{PreloaderConfig, UsageTracker};

/// Errors raised by the Model Manager's public operations.
#[derive(Debug, Error, Clone)]
pub enum ModelError {
    /// No admission and no feasible eviction set; the model was enqueued
    /// instead (not itself an error, but `Infer` surfaces it as one since it
    /// cannot proceed synchronously).
    #[error("model {0} is queued pending VRAM availability")]
    Queued(String),

    /// Admission is impossible even after considering every evictable
    /// model (protected models alone exceed the budget).
    #[error("model {0} cannot be admitted: budget infeasible even after eviction")]
    InfeasibleBudget(String),

    /// The backend adapter failed.
    #[error("backend error for model {model_id}: {source}")]
    Backend {
        /// The model the backend call was for.
        model_id: String,
        /// The underlying adapter failure.
        source: AdapterError,
    },

    /// `UnloadModel`/`Infer` was called for a model that is not loaded.
    #[error("model {0} is not loaded")]
    NotLoaded(String),

    /// Internal accountant invariant violation (should be unreachable).
    #[error("vram accountant error: {0}")]
    Vram(#[from] VramError),

    /// The VRAM Accountant has entered `Paused` after detecting an
    /// accounting inconsistency; no new loads are admitted until
    /// [`ModelManagerHandle::reconcile_vram`] clears it.
    #[error("model manager is paused pending vram reconciliation")]
    Paused,
}

/// Lifecycle state of one model (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    /// Not resident; no VRAM reserved.
    Unloaded,
    /// Admission granted, backend load in flight.
    Loading,
    /// Resident and serving.
    Loaded,
    /// Marked for removal; still counted against the budget until released.
    Evicting,
}

/// Outcome of [`ModelManagerHandle::load_model`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult {
    /// The model is now `Loaded`.
    Loaded,
    /// Admission was infeasible right now; the request was queued.
    Queued,
    /// Admission is permanently infeasible (protected models alone exceed
    /// the configured budget).
    InfeasibleBudget,
}

/// Outcome of [`ModelManagerHandle::unload_model`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadResult {
    /// The model is now `Unloaded`.
    Unloaded,
    /// The model was not loaded to begin with.
    NotLoaded,
}

/// Per-model bookkeeping the manager holds alongside the VRAM reservation.
#[derive(Debug, Clone)]
struct ModelRecord {
    state: ModelState,
    priority: Priority,
    last_used_at_ms: u64,
    in_flight_inferences: u32,
    reserved_mb: Option<VramMb>,
    /// Size of the most recent load request for this model, used by the
    /// preloader to reissue a load at the same size without a live caller.
    last_requested_mb: VramMb,
}

impl Default for ModelRecord {
    fn default() -> Self {
        Self {
            state: ModelState::Unloaded,
            priority: Priority::default(),
            last_used_at_ms: 0,
            in_flight_inferences: 0,
            reserved_mb: None,
            last_requested_mb: VramMb::default(),
        }
    }
}

/// A model awaiting admission.
#[derive(Debug, Clone)]
struct PendingLoad {
    model_id: ModelId,
    params: serde_json::Value,
    requested_mb: VramMb,
}

/// The Model Manager: owns per-model state, the VRAM Accountant, and a
/// pending-load FIFO. Cloneable; every clone shares the same underlying
/// state via `Arc`.
#[derive(Clone)]
pub struct ModelManagerHandle {
    records: Arc<DashMap<String, ModelRecord>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    accountant: Arc<Mutex<VramAccountant>>,
    pending: Arc<Mutex<VecDeque<PendingLoad>>>,
    backend: Arc<dyn ModelBackend>,
    time: SharedTimeProvider,
    unload_grace: Duration,
    idle_timeout: Duration,
    error_bus: Arc<ErrorBus>,
    usage: Arc<Mutex<UsageTracker>>,
    preloader_config: PreloaderConfig,
    db: Option<DatabaseConnection>,
}

impl ModelManagerHandle {
    /// Creates a manager with `budget_mb` of VRAM, driving model
    /// load/unload/infer through `backend`. Accounting-inconsistency and
    /// restart conditions are published on `error_bus`; usage is persisted
    /// to `db`'s evaluation log when present, backing the preloader across
    /// restarts.
    #[must_use]
    pub fn new(
        budget_mb: VramMb,
        backend: Arc<dyn ModelBackend>,
        time: SharedTimeProvider,
        unload_grace: Duration,
        idle_timeout: Duration,
        error_bus: Arc<ErrorBus>,
        db: Option<DatabaseConnection>,
    ) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
            accountant: Arc::new(Mutex::new(VramAccountant::new(budget_mb))),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            backend,
            time,
            unload_grace,
            idle_timeout,
            error_bus,
            usage: Arc::new(Mutex::new(UsageTracker::default())),
            preloader_config: PreloaderConfig::default(),
            db,
        }
    }

    /// Overrides the default preloader tunables.
    #[must_use]
    pub fn with_preloader_config(mut self, config: PreloaderConfig) -> Self {
        self.preloader_config = config;
        self
    }

    fn lock_for(&self, model_id: &ModelId) -> Arc<Mutex<()>> {
        self.locks
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn now_ms(&self) -> u64 {
        self.time
            .now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Current state of `model_id`, or `Unloaded` if never seen.
    #[must_use]
    pub fn state_of(&self, model_id: &ModelId) -> ModelState {
        self.records
            .get(&model_id.to_string())
            .map_or(ModelState::Unloaded, |r| r.state)
    }

    /// Loads `model_id`, serialized per-model so at most one load is ever
    /// in flight for the same model (§4.8 "at-most-one concurrent load").
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Backend`] if the adapter's `load()` fails.
    #[tracing::instrument(skip(self, params))]
    pub async fn load_model(
        &self,
        model_id: &ModelId,
        params: serde_json::Value,
        requested_mb: VramMb,
        priority: Priority,
    ) -> Result<LoadResult, ModelError> {
        let lock = self.lock_for(model_id);
        let _guard = lock.lock().await;

        if self.state_of(model_id) == ModelState::Loaded {
            self.touch(model_id, priority).await;
            return Ok(LoadResult::Loaded);
        }

        self.try_admit_and_load(model_id, &params, requested_mb, priority)
            .await
    }

    async fn try_admit_and_load(
        &self,
        model_id: &ModelId,
        params: &serde_json::Value,
        requested_mb: VramMb,
        priority: Priority,
    ) -> Result<LoadResult, ModelError> {
        self.remember_request(model_id, requested_mb, priority);

        let admission = {
            let accountant = self.accountant.lock().await;
            if accountant.is_paused() {
                return Err(ModelError::Paused);
            }
            // A request that can never fit even with every evictable model
            // released is permanently infeasible, not merely queued.
            if requested_mb.into_inner() > accountant.budget_mb().into_inner() {
                return Ok(LoadResult::InfeasibleBudget);
            }
            accountant.can_admit(requested_mb)
        };

        let admitted = match admission {
            Admission::Admit => true,
            Admission::Deny { deficit_mb } => self.evict_to_cover(deficit_mb).await?,
            Admission::Paused => return Err(ModelError::Paused),
        };

        if !admitted {
            self.enqueue(model_id, params.clone(), requested_mb).await;
            return Ok(LoadResult::Queued);
        }

        {
            let mut accountant = self.accountant.lock().await;
            let result = accountant.reserve(model_id, requested_mb);
            drop(accountant);
            self.check_and_publish_vram_result(result)?;
        }
        self.set_state(model_id, ModelState::Loading, priority, requested_mb);

        match self.backend.load(model_id, params).await {
            Ok(()) => {
                self.set_state(model_id, ModelState::Loaded, priority, requested_mb);
                self.log_evaluation_event(model_id, "loaded", self.now_ms());
                self.touch(model_id, priority).await;
                Ok(LoadResult::Loaded)
            }
            Err(source) => {
                let mut accountant = self.accountant.lock().await;
                let result = accountant.release(model_id);
                drop(accountant);
                let _ = self.check_and_publish_vram_result(result);
                self.set_state(model_id, ModelState::Unloaded, priority, VramMb::default());
                Err(ModelError::Backend {
                    model_id: model_id.to_string(),
                    source,
                })
            }
        }
    }

    fn remember_request(&self, model_id: &ModelId, requested_mb: VramMb, priority: Priority) {
        if requested_mb.into_inner() == 0 {
            return;
        }
        let mut record = self.records.entry(model_id.to_string()).or_default();
        record.last_requested_mb = requested_mb;
        record.priority = priority;
    }

    fn last_known(&self, model_id: &ModelId) -> (VramMb, Priority) {
        self.records
            .get(&model_id.to_string())
            .map_or((VramMb::default(), Priority::default()), |r| {
                (r.last_requested_mb, r.priority)
            })
    }

    /// Publishes a critical Error Bus record when `result` carries a VRAM
    /// accounting inconsistency, leaving every other outcome untouched.
    fn check_and_publish_vram_result<T>(&self, result: Result<T, VramError>) -> Result<T, VramError> {
        if let Err(VramError::Inconsistent { recorded, recomputed }) = &result {
            self.error_bus.publish(ErrorRecord {
                source_agent: "model_manager".to_string(),
                kind: "vram_inconsistent".to_string(),
                severity: Severity::Critical,
                message: format!(
                    "vram accounting inconsistent: recorded {recorded} mb vs recomputed {recomputed} mb"
                ),
                context: serde_json::json!({"recorded_mb": recorded, "recomputed_mb": recomputed}),
                occurred_at_ms: 0,
                request_id: None,
            });
        }
        result
    }

    /// Attempts to clear a `Paused` condition by reconciling the VRAM
    /// Accountant's running total against the sum of individual
    /// reservations.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Vram`] if the inconsistency persists.
    pub async fn reconcile_vram(&self) -> Result<(), ModelError> {
        let mut accountant = self.accountant.lock().await;
        let result = accountant.reconcile();
        drop(accountant);
        self.check_and_publish_vram_result(result)?;
        Ok(())
    }

    /// Selects and releases eviction victims until `deficit_mb` is covered.
    /// Returns `true` if admission now succeeds.
    async fn evict_to_cover(&self, deficit_mb: VramMb) -> Result<bool, ModelError> {
        let candidates: Vec<EvictionCandidate> = self
            .records
            .iter()
            .filter(|entry| entry.state == ModelState::Loaded && entry.in_flight_inferences == 0)
            .filter_map(|entry| {
                let model_id = ModelId::try_new(entry.key().clone()).ok()?;
                let reserved_mb = entry.reserved_mb?;
                Some(EvictionCandidate {
                    model_id,
                    priority: entry.priority,
                    last_used_at_ms: entry.last_used_at_ms,
                    reserved_mb,
                })
            })
            .collect();

        let plan = {
            let accountant = self.accountant.lock().await;
            accountant.select_eviction_victims(deficit_mb, &candidates)
        };

        let victims = match plan {
            EvictionPlan::Victims(v) => v,
            EvictionPlan::Infeasible => return Ok(false),
        };

        for victim in &victims {
            let _ = self.evict_now(victim).await;
        }
        Ok(true)
    }

    async fn evict_now(&self, model_id: &ModelId) -> Result<(), ModelError> {
        let reserved = self.reserved_mb_of(model_id);
        self.set_state(model_id, ModelState::Evicting, self.priority_of(model_id), reserved);
        self.backend
            .unload(model_id)
            .await
            .map_err(|source| ModelError::Backend {
                model_id: model_id.to_string(),
                source,
            })?;
        let mut accountant = self.accountant.lock().await;
        let result = accountant.release(model_id);
        drop(accountant);
        self.check_and_publish_vram_result(result)?;
        self.set_state(model_id, ModelState::Unloaded, self.priority_of(model_id), VramMb::default());
        self.log_evaluation_event(model_id, "unloaded", self.now_ms());
        Ok(())
    }

    fn reserved_mb_of(&self, model_id: &ModelId) -> VramMb {
        self.records
            .get(&model_id.to_string())
            .and_then(|r| r.reserved_mb)
            .unwrap_or_default()
    }

    fn priority_of(&self, model_id: &ModelId) -> Priority {
        self.records
            .get(&model_id.to_string())
            .map_or_else(Priority::default, |r| r.priority)
    }

    /// Unloads `model_id`. If any inference currently holds it, waits up to
    /// `unload_grace` before forcing (§4.8).
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Backend`] if the adapter's `unload()` fails.
    pub async fn unload_model(&self, model_id: &ModelId) -> Result<UnloadResult, ModelError> {
        let lock = self.lock_for(model_id);
        let _guard = lock.lock().await;

        if self.state_of(model_id) != ModelState::Loaded {
            return Ok(UnloadResult::NotLoaded);
        }

        let reserved = self.reserved_mb_of(model_id);
        self.set_state(model_id, ModelState::Evicting, self.priority_of(model_id), reserved);
        let deadline = self.time.instant() + self.unload_grace;
        while self.in_flight(model_id) > 0 && self.time.instant() < deadline {
            self.time.sleep(Duration::from_millis(10)).await;
        }

        self.backend
            .unload(model_id)
            .await
            .map_err(|source| ModelError::Backend {
                model_id: model_id.to_string(),
                source,
            })?;

        {
            let mut accountant = self.accountant.lock().await;
            let result = accountant.release(model_id);
            drop(accountant);
            let _ = self.check_and_publish_vram_result(result);
        }
        self.set_state(model_id, ModelState::Unloaded, self.priority_of(model_id), VramMb::default());
        self.log_evaluation_event(model_id, "unloaded", self.now_ms());
        self.drain_pending().await;
        Ok(UnloadResult::Unloaded)
    }

    fn in_flight(&self, model_id: &ModelId) -> u32 {
        self.records
            .get(&model_id.to_string())
            .map_or(0, |r| r.in_flight_inferences)
    }

    /// Runs inference, loading the model first if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Queued`] if the model could not be admitted
    /// synchronously, or [`ModelError::Backend`] on an adapter failure.
    pub async fn infer(
        &self,
        model_id: &ModelId,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ModelError> {
        if self.state_of(model_id) != ModelState::Loaded {
            match self
                .load_model(model_id, serde_json::Value::Null, VramMb::default(), Priority::default())
                .await?
            {
                LoadResult::Loaded => {}
                LoadResult::Queued => return Err(ModelError::Queued(model_id.to_string())),
                LoadResult::InfeasibleBudget => {
                    return Err(ModelError::InfeasibleBudget(model_id.to_string()))
                }
            }
        }

        self.mark_in_flight(model_id, 1);
        let result = self.backend.infer(model_id, payload).await;
        self.mark_in_flight(model_id, -1);
        self.touch(model_id, self.priority_of(model_id)).await;

        result.map_err(|source| ModelError::Backend {
            model_id: model_id.to_string(),
            source,
        })
    }

    fn mark_in_flight(&self, model_id: &ModelId, delta: i32) {
        if let Some(mut record) = self.records.get_mut(&model_id.to_string()) {
            record.in_flight_inferences = record.in_flight_inferences.saturating_add_signed(delta);
        }
    }

    fn set_state(&self, model_id: &ModelId, state: ModelState, priority: Priority, reserved_mb: VramMb) {
        let mut record = self.records.entry(model_id.to_string()).or_default();
        record.state = state;
        record.priority = priority;
        record.reserved_mb = match state {
            ModelState::Unloaded => None,
            _ => Some(reserved_mb),
        };
    }

    async fn touch(&self, model_id: &ModelId, priority: Priority) {
        let now = self.now_ms();
        {
            let mut record = self.records.entry(model_id.to_string()).or_default();
            record.last_used_at_ms = now;
            record.priority = priority;
        }
        self.usage.lock().await.record_use(model_id, now);
        self.log_evaluation_event(model_id, "used", now);
    }

    /// Fire-and-forget persistence of one evaluation-log row; a failure here
    /// only degrades the preloader's cross-restart memory, never the caller.
    fn log_evaluation_event(&self, model_id: &ModelId, event: &'static str, at_ms: u64) {
        let Some(db) = self.db.clone() else { return };
        let model_id = model_id.to_string();
        tokio::spawn(async move {
            let at_ms = i64::try_from(at_ms).unwrap_or(i64::MAX);
            let result = sqlx::query(
                "INSERT INTO model_evaluation_log (model_id, event, at_ms) VALUES (?, ?, ?)",
            )
            .bind(&model_id)
            .bind(event)
            .bind(at_ms)
            .execute(db.pool())
            .await;
            if let Err(err) = result {
                tracing::warn!(model_id = %model_id, event, error = %err, "failed to persist model evaluation log entry");
            }
        });
    }

    async fn enqueue(&self, model_id: &ModelId, params: serde_json::Value, requested_mb: VramMb) {
        let mut pending = self.pending.lock().await;
        pending.push_back(PendingLoad {
            model_id: model_id.clone(),
            params,
            requested_mb,
        });
    }

    /// Drains the pending-load queue head-first while admission succeeds
    /// (invariant 6, §8): called after every successful release.
    pub async fn drain_pending(&self) {
        loop {
            let next = {
                let mut pending = self.pending.lock().await;
                let admits = if let Some(front) = pending.front() {
                    let accountant = self.accountant.lock().await;
                    matches!(accountant.can_admit(front.requested_mb), Admission::Admit)
                } else {
                    false
                };
                if admits {
                    pending.pop_front()
                } else {
                    None
                }
            };
            let Some(item) = next else { break };
            let _ = self
                .try_admit_and_load(&item.model_id, &item.params, item.requested_mb, Priority::default())
                .await;
        }
    }

    /// Unloads every model whose `last_used_at` is older than `idle_timeout`
    /// and whose priority is below the protected band (§4.8 "idle sweep").
    /// Also opportunistically reconciles a `Paused` accountant, since this
    /// runs on a steady background cadence regardless of load activity.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_idle(&self, protected_priority: Priority) {
        if self.accountant.lock().await.is_paused() {
            let _ = self.reconcile_vram().await;
        }

        let now = self.now_ms();
        let idle_ms = u64::try_from(self.idle_timeout.as_millis()).unwrap_or(u64::MAX);
        let candidates: Vec<ModelId> = self
            .records
            .iter()
            .filter(|entry| {
                entry.state == ModelState::Loaded
                    && entry.priority < protected_priority
                    && now.saturating_sub(entry.last_used_at_ms) >= idle_ms
            })
            .filter_map(|entry| ModelId::try_new(entry.key().clone()).ok())
            .collect();

        for model_id in candidates {
            let _ = self.unload_model(&model_id).await;
        }
    }

    /// Spawns the predictive preloader's background tick loop. Runs until
    /// `shutdown` fires, scoring recent usage and opportunistically warming
    /// the top-K predicted models (§4.8).
    pub fn spawn_preloader(&self, mut shutdown: oneshot::Receiver<()>) {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handle.time.sleep(handle.preloader_config.tick_interval) => {
                        handle.run_preload_tick().await;
                    }
                    _ = &mut shutdown => break,
                }
            }
        });
    }

    #[tracing::instrument(skip(self))]
    async fn run_preload_tick(&self) {
        if self.accountant.lock().await.is_paused() {
            return;
        }
        let now = self.now_ms();
        let candidates = {
            let mut usage = self.usage.lock().await;
            usage.top_k(now, &self.preloader_config)
        };

        for model_id_str in candidates {
            let Ok(model_id) = ModelId::try_new(model_id_str) else {
                continue;
            };
            if self.state_of(&model_id) == ModelState::Loaded {
                continue;
            }
            let (requested_mb, priority) = self.last_known(&model_id);
            if requested_mb.into_inner() == 0 {
                // Never successfully loaded before; nothing to reissue.
                continue;
            }
            if let Ok(LoadResult::Loaded) = self
                .load_model(&model_id, serde_json::Value::Null, requested_mb, priority)
                .await
            {
                self.log_evaluation_event(&model_id, "preloaded", now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_manager::adapters::{BackendDescription, ModelBackend};
    use crate::time_provider::test_time_provider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        loads: AtomicUsize,
        unloads: AtomicUsize,
    }

    impl Default for CountingBackend {
        fn default() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                unloads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelBackend for CountingBackend {
        async fn load(&self, _model_id: &ModelId, _params: &serde_json::Value) -> Result<(), AdapterError> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn unload(&self, _model_id: &ModelId) -> Result<(), AdapterError> {
            self.unloads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn infer(&self, _model_id: &ModelId, payload: serde_json::Value) -> Result<serde_json::Value, AdapterError> {
            Ok(payload)
        }
        fn describe(&self) -> BackendDescription {
            BackendDescription {
                serving_method: "counting".to_string(),
                caps: vec![],
            }
        }
    }

    fn manager(budget_mb: u64, backend: Arc<CountingBackend>) -> ModelManagerHandle {
        ModelManagerHandle::new(
            VramMb::try_new(budget_mb).unwrap(),
            backend,
            test_time_provider(),
            Duration::from_millis(50),
            Duration::from_secs(900),
            ErrorBus::new(16, test_time_provider()),
            None,
        )
    }

    #[tokio::test]
    async fn load_within_budget_succeeds_immediately() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(1000, backend.clone());
        let model_id = ModelId::try_new("llama").unwrap();

        let result = manager
            .load_model(&model_id, serde_json::Value::Null, VramMb::try_new(500).unwrap(), Priority::default())
            .await
            .unwrap();
        assert_eq!(result, LoadResult::Loaded);
        assert_eq!(backend.loads.load(Ordering::Relaxed), 1);
        assert_eq!(manager.state_of(&model_id), ModelState::Loaded);
    }

    #[tokio::test]
    async fn over_budget_load_evicts_a_lower_priority_model() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(1000, backend.clone());
        let cold = ModelId::try_new("cold").unwrap();
        let hot = ModelId::try_new("hot").unwrap();

        manager
            .load_model(&cold, serde_json::Value::Null, VramMb::try_new(900).unwrap(), Priority::try_new(5).unwrap())
            .await
            .unwrap();

        let result = manager
            .load_model(&hot, serde_json::Value::Null, VramMb::try_new(500).unwrap(), Priority::try_new(50).unwrap())
            .await
            .unwrap();

        assert_eq!(result, LoadResult::Loaded);
        assert_eq!(manager.state_of(&cold), ModelState::Unloaded);
        assert_eq!(backend.unloads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn infeasible_admission_queues_the_request() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(1000, backend);
        let protected = ModelId::try_new("protected").unwrap();
        let other = ModelId::try_new("other").unwrap();

        manager
            .load_model(&protected, serde_json::Value::Null, VramMb::try_new(900).unwrap(), Priority::max())
            .await
            .unwrap();

        let result = manager
            .load_model(&other, serde_json::Value::Null, VramMb::try_new(500).unwrap(), Priority::default())
            .await
            .unwrap();
        assert_eq!(result, LoadResult::Queued);
    }

    #[tokio::test]
    async fn request_larger_than_the_whole_budget_is_permanently_infeasible() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(1000, backend);
        let oversized = ModelId::try_new("oversized").unwrap();

        let result = manager
            .load_model(&oversized, serde_json::Value::Null, VramMb::try_new(1500).unwrap(), Priority::default())
            .await
            .unwrap();
        assert_eq!(result, LoadResult::InfeasibleBudget);
    }

    #[tokio::test]
    async fn unload_releases_reservation_and_drains_queue() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(1000, backend);
        // Protected (max priority) so it cannot be auto-evicted to make room;
        // the second load must genuinely queue rather than preempt it.
        let first = ModelId::try_new("first").unwrap();
        let second = ModelId::try_new("second").unwrap();

        manager
            .load_model(&first, serde_json::Value::Null, VramMb::try_new(900).unwrap(), Priority::max())
            .await
            .unwrap();
        let queued = manager
            .load_model(&second, serde_json::Value::Null, VramMb::try_new(500).unwrap(), Priority::try_new(5).unwrap())
            .await
            .unwrap();
        assert_eq!(queued, LoadResult::Queued);

        manager.unload_model(&first).await.unwrap();
        assert_eq!(manager.state_of(&second), ModelState::Loaded);
    }

    #[tokio::test]
    async fn paused_accountant_rejects_new_loads() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(1000, backend);
        manager.accountant.lock().await.pause();

        let model_id = ModelId::try_new("llama").unwrap();
        let result = manager
            .load_model(&model_id, serde_json::Value::Null, VramMb::try_new(500).unwrap(), Priority::default())
            .await;
        assert!(matches!(result, Err(ModelError::Paused)));
    }

    #[tokio::test]
    async fn reconcile_vram_clears_pause_once_totals_agree() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(1000, backend);
        let model_id = ModelId::try_new("llama").unwrap();
        manager
            .load_model(&model_id, serde_json::Value::Null, VramMb::try_new(400).unwrap(), Priority::default())
            .await
            .unwrap();
        manager.accountant.lock().await.pause();

        manager.reconcile_vram().await.unwrap();
        assert!(!manager.accountant.lock().await.is_paused());
    }

    #[tokio::test]
    async fn preload_tick_reloads_a_previously_used_model_once_evicted() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(1000, backend.clone());
        let hot = ModelId::try_new("hot").unwrap();

        manager
            .load_model(&hot, serde_json::Value::Null, VramMb::try_new(400).unwrap(), Priority::try_new(10).unwrap())
            .await
            .unwrap();
        manager.unload_model(&hot).await.unwrap();
        assert_eq!(manager.state_of(&hot), ModelState::Unloaded);

        manager.run_preload_tick().await;

        assert_eq!(manager.state_of(&hot), ModelState::Loaded);
        assert_eq!(backend.loads.load(Ordering::Relaxed), 2);
    }
}
