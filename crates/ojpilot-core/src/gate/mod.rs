//! Named counting gates bounding engine concurrency.
//!
//! A [`GateSet`] is the single source of truth for admission control:
//! global problem count, per-user fan-out, per-stage executor width, and
//! LLM call parallelism all flow through it. Gates are acquired in a fixed
//! outer-to-inner order (global → per-user → stage → llm.total →
//! llm.<provider>) so no hold-and-wait cycle can form.
//!
//! Unlike a plain semaphore, a gate can be rebased at runtime: permits
//! already held stay valid and new callers see the new limit. Waiters are
//! parked on a `Notify` and re-check the limit after every wakeup.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::ConcurrencyConfig;
use crate::error::GateError;

/// Gate name for the global in-flight problem bound.
pub const GLOBAL_TASKS: &str = "global_tasks";
/// Gate name for pending admissions.
pub const QUEUE: &str = "queue";
/// Gate name for concurrent Fetch executions.
pub const STAGE_FETCH: &str = "stage.fetch";
/// Gate name for concurrent Generate executions.
pub const STAGE_GENERATE: &str = "stage.generate";
/// Gate name for concurrent Upload executions.
pub const STAGE_UPLOAD: &str = "stage.upload";
/// Gate name for concurrent Solve executions.
pub const STAGE_SOLVE: &str = "stage.solve";
/// Gate name for total LLM call parallelism.
pub const LLM_TOTAL: &str = "llm.total";

struct GateState {
    limit: usize,
    in_use: usize,
}

struct Gate {
    name: String,
    state: Mutex<GateState>,
    notify: Notify,
}

impl Gate {
    fn new(name: &str, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(GateState { limit, in_use: 0 }),
            notify: Notify::new(),
        })
    }

    fn try_take(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.in_use < state.limit {
            state.in_use += 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    fn rebase(&self, new_limit: usize) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.limit = new_limit;
        }
        // Wake everyone; a raised limit may admit several waiters at once.
        self.notify.notify_waiters();
    }

    fn in_use(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .in_use
    }

    fn limit(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .limit
    }
}

/// RAII permit for one slot in a named gate. Releasing happens on drop.
pub struct GatePermit {
    gate: Arc<Gate>,
}

impl GatePermit {
    /// The name of the gate this permit belongs to.
    pub fn gate_name(&self) -> &str {
        &self.gate.name
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit")
            .field("gate", &self.gate.name)
            .finish()
    }
}

/// A set of named counting gates, hot-reconfigurable.
pub struct GateSet {
    gates: RwLock<HashMap<String, Arc<Gate>>>,
    per_user_limit: Mutex<usize>,
    llm_per_provider_limit: Mutex<usize>,
}

impl GateSet {
    /// Build the required gates from a concurrency configuration.
    ///
    /// Per-user (`user.<id>`) and per-provider (`llm.<provider>`) gates are
    /// created on demand with the configured default limits.
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        let mut gates = HashMap::new();
        for (name, limit) in [
            (GLOBAL_TASKS, config.global_tasks),
            (QUEUE, config.queue),
            (STAGE_FETCH, config.stage_fetch),
            (STAGE_GENERATE, config.stage_generate),
            (STAGE_UPLOAD, config.stage_upload),
            (STAGE_SOLVE, config.stage_solve),
            (LLM_TOTAL, config.llm_total),
        ] {
            gates.insert(name.to_string(), Gate::new(name, limit));
        }
        Self {
            gates: RwLock::new(gates),
            per_user_limit: Mutex::new(config.per_user),
            llm_per_provider_limit: Mutex::new(config.llm_per_provider),
        }
    }

    /// Acquire a permit from the named gate, suspending until one is
    /// available or `cancel` fires.
    pub async fn acquire(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, GateError> {
        let gate = self.lookup(name)?;
        self.acquire_gate(gate, cancel).await
    }

    /// Acquire a permit from the per-user gate for `user_id`, creating the
    /// gate on first use.
    pub async fn acquire_user(
        &self,
        user_id: i64,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, GateError> {
        let limit = *self
            .per_user_limit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let gate = self.lookup_or_create(&format!("user.{user_id}"), limit);
        self.acquire_gate(gate, cancel).await
    }

    /// Acquire a permit from the per-provider LLM gate, creating the gate
    /// on first use.
    pub async fn acquire_llm_provider(
        &self,
        provider: &str,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, GateError> {
        let limit = *self
            .llm_per_provider_limit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let gate = self.lookup_or_create(&format!("llm.{provider}"), limit);
        self.acquire_gate(gate, cancel).await
    }

    async fn acquire_gate(
        &self,
        gate: Arc<Gate>,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, GateError> {
        loop {
            if gate.try_take() {
                return Ok(GatePermit {
                    gate: Arc::clone(&gate),
                });
            }
            // Register interest before re-checking so a release between the
            // failed try_take and the await cannot be missed.
            let mut notified = pin!(gate.notify.notified());
            notified.as_mut().enable();
            if gate.try_take() {
                return Ok(GatePermit {
                    gate: Arc::clone(&gate),
                });
            }
            tokio::select! {
                () = notified => {}
                () = cancel.cancelled() => {
                    return Err(GateError::Cancelled {
                        name: gate.name.clone(),
                    });
                }
            }
        }
    }

    /// Rebase the named gate: held permits remain valid, new callers see
    /// the new limit.
    pub fn reconfigure(&self, name: &str, new_max: usize) -> Result<(), GateError> {
        let gate = self.lookup(name)?;
        tracing::info!(gate = %name, limit = new_max, "Gate reconfigured");
        gate.rebase(new_max);
        Ok(())
    }

    /// Apply a full concurrency configuration, rebasing every required gate
    /// and the defaults for dynamically-created ones.
    pub fn apply(&self, config: &ConcurrencyConfig) {
        for (name, limit) in [
            (GLOBAL_TASKS, config.global_tasks),
            (QUEUE, config.queue),
            (STAGE_FETCH, config.stage_fetch),
            (STAGE_GENERATE, config.stage_generate),
            (STAGE_UPLOAD, config.stage_upload),
            (STAGE_SOLVE, config.stage_solve),
            (LLM_TOTAL, config.llm_total),
        ] {
            if let Ok(gate) = self.lookup(name) {
                gate.rebase(limit);
            }
        }
        *self
            .per_user_limit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config.per_user;
        *self
            .llm_per_provider_limit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config.llm_per_provider;
        // Existing dynamic gates pick up the new default too.
        let gates = self.gates.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (name, gate) in gates.iter() {
            if name.starts_with("user.") {
                gate.rebase(config.per_user);
            } else if name.starts_with("llm.") && name != LLM_TOTAL {
                gate.rebase(config.llm_per_provider);
            }
        }
    }

    /// Current limits for the required gates, as a config snapshot.
    pub fn snapshot(&self) -> ConcurrencyConfig {
        let limit = |name: &str| self.lookup(name).map(|g| g.limit()).unwrap_or(0);
        ConcurrencyConfig {
            global_tasks: limit(GLOBAL_TASKS),
            per_user: *self
                .per_user_limit
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            stage_fetch: limit(STAGE_FETCH),
            stage_generate: limit(STAGE_GENERATE),
            stage_upload: limit(STAGE_UPLOAD),
            stage_solve: limit(STAGE_SOLVE),
            llm_total: limit(LLM_TOTAL),
            llm_per_provider: *self
                .llm_per_provider_limit
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            queue: limit(QUEUE),
            // The wall-clock budget is not a gate; callers keep it in Config.
            task_timeout_secs: 0,
        }
    }

    /// Number of permits currently held on the named gate.
    pub fn in_use(&self, name: &str) -> usize {
        self.lookup(name).map(|g| g.in_use()).unwrap_or(0)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Gate>, GateError> {
        self.gates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| GateError::UnknownGate {
                name: name.to_string(),
            })
    }

    fn lookup_or_create(&self, name: &str, limit: usize) -> Arc<Gate> {
        if let Ok(gate) = self.lookup(name) {
            return gate;
        }
        let mut gates = self.gates.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        gates
            .entry(name.to_string())
            .or_insert_with(|| Gate::new(name, limit))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn small_set() -> GateSet {
        let mut config = ConcurrencyConfig::default();
        config.stage_fetch = 2;
        config.per_user = 1;
        GateSet::from_config(&config)
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let gates = small_set();
        let cancel = CancellationToken::new();

        let p1 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p1");
        let p2 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p2");
        assert_eq!(gates.in_use(STAGE_FETCH), 2);

        drop(p1);
        assert_eq!(gates.in_use(STAGE_FETCH), 1);
        drop(p2);
        assert_eq!(gates.in_use(STAGE_FETCH), 0);
    }

    #[tokio::test]
    async fn blocked_acquire_resumes_on_release() {
        let gates = Arc::new(small_set());
        let cancel = CancellationToken::new();

        let p1 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p1");
        let p2 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p2");

        let gates_clone = Arc::clone(&gates);
        let cancel_clone = cancel.clone();
        let waiter = tokio::spawn(async move {
            gates_clone
                .acquire(STAGE_FETCH, &cancel_clone)
                .await
                .expect("p3")
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(p1);
        let p3 = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter resumed")
            .expect("no panic");
        assert_eq!(gates.in_use(STAGE_FETCH), 2);
        drop(p2);
        drop(p3);
    }

    #[tokio::test]
    async fn cancellation_aborts_wait_quickly() {
        let gates = Arc::new(small_set());
        let cancel = CancellationToken::new();

        let _p1 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p1");
        let _p2 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p2");

        let gates_clone = Arc::clone(&gates);
        let cancel_clone = cancel.clone();
        let waiter =
            tokio::spawn(async move { gates_clone.acquire(STAGE_FETCH, &cancel_clone).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let start = std::time::Instant::now();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("cancel observed within 100ms")
            .expect("no panic");
        assert!(matches!(result, Err(GateError::Cancelled { .. })));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn gate_respected_under_load() {
        let gates = Arc::new(small_set());
        let cancel = CancellationToken::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gates = Arc::clone(&gates);
            let cancel = cancel.clone();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = gates.acquire(STAGE_FETCH, &cancel).await.expect("permit");
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "fetch gate breached");
    }

    #[tokio::test]
    async fn reconfigure_raises_limit_and_admits_waiters() {
        let gates = Arc::new(small_set());
        let cancel = CancellationToken::new();

        let _p1 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p1");
        let _p2 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p2");

        let gates_clone = Arc::clone(&gates);
        let cancel_clone = cancel.clone();
        let waiter =
            tokio::spawn(async move { gates_clone.acquire(STAGE_FETCH, &cancel_clone).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        gates.reconfigure(STAGE_FETCH, 3).expect("reconfigure");
        let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("admitted after rebase")
            .expect("no panic")
            .expect("permit");
        assert_eq!(permit.gate_name(), STAGE_FETCH);
    }

    #[tokio::test]
    async fn reconfigure_lower_keeps_held_permits() {
        let gates = small_set();
        let cancel = CancellationToken::new();

        let p1 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p1");
        let p2 = gates.acquire(STAGE_FETCH, &cancel).await.expect("p2");

        gates.reconfigure(STAGE_FETCH, 1).expect("reconfigure");
        // Both held permits stay valid.
        assert_eq!(gates.in_use(STAGE_FETCH), 2);
        drop(p1);
        drop(p2);

        // New callers see the lowered limit.
        let _q1 = gates.acquire(STAGE_FETCH, &cancel).await.expect("q1");
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            gates.acquire(STAGE_FETCH, &cancel),
        )
        .await;
        assert!(blocked.is_err(), "second permit must block at limit 1");
    }

    #[tokio::test]
    async fn per_user_gates_are_independent() {
        let gates = small_set();
        let cancel = CancellationToken::new();

        let _a = gates.acquire_user(1, &cancel).await.expect("user 1");
        // User 1 is saturated (limit 1), user 2 is not.
        let _b = gates.acquire_user(2, &cancel).await.expect("user 2");

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), gates.acquire_user(1, &cancel)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn unknown_gate_is_an_error() {
        let gates = small_set();
        let cancel = CancellationToken::new();
        let err = gates.acquire("no.such.gate", &cancel).await.unwrap_err();
        assert!(matches!(err, GateError::UnknownGate { .. }));
    }

    #[tokio::test]
    async fn apply_rebases_dynamic_gates() {
        let gates = small_set();
        let cancel = CancellationToken::new();
        let _a = gates.acquire_user(7, &cancel).await.expect("user 7");

        let mut config = ConcurrencyConfig::default();
        config.per_user = 4;
        gates.apply(&config);

        // Three more fit under the raised per-user limit.
        let _b = gates.acquire_user(7, &cancel).await.expect("b");
        let _c = gates.acquire_user(7, &cancel).await.expect("c");
        let _d = gates.acquire_user(7, &cancel).await.expect("d");
    }

    #[tokio::test]
    async fn snapshot_reflects_reconfigure() {
        let gates = small_set();
        gates.reconfigure(LLM_TOTAL, 16).expect("reconfigure");
        let snap = gates.snapshot();
        assert_eq!(snap.llm_total, 16);
        assert_eq!(snap.stage_fetch, 2);
    }
}
