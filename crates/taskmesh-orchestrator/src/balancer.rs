use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use taskmesh_core::DispatchTarget;
use tracing::{debug, info, warn};

/// How the balancer picks among eligible candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Fixed rotation regardless of load.
    RoundRobin,
    /// Rotation with frequency proportional to weight.
    WeightedRoundRobin,
    /// Fewest active tasks.
    #[default]
    LeastLoaded,
    /// Fewest active tasks per unit of weight.
    WeightedLeastLoaded,
    /// Uniform random choice.
    Random,
}

impl LoadBalancingStrategy {
    /// Parse a strategy name. Unknown names fall back to least-loaded.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Self::RoundRobin,
            "weighted_round_robin" => Self::WeightedRoundRobin,
            "least_loaded" => Self::LeastLoaded,
            "weighted_least_loaded" => Self::WeightedLeastLoaded,
            "random" => Self::Random,
            other => {
                warn!(strategy = %other, "Unknown balancing strategy, using least_loaded");
                Self::LeastLoaded
            }
        }
    }

    /// Config name of the strategy.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastLoaded => "least_loaded",
            Self::WeightedLeastLoaded => "weighted_least_loaded",
            Self::Random => "random",
        }
    }
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balancer settings.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// How candidates are ranked.
    pub strategy: LoadBalancingStrategy,
    /// When false, failures are not recorded and no worker is excluded.
    pub failover_enabled: bool,
    /// Failures within `failure_window` that open the breaker.
    pub max_failures: usize,
    /// Failures older than this no longer count.
    pub failure_window: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::LeastLoaded,
            failover_enabled: true,
            max_failures: 3,
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Per-worker breaker state as reported by [`LoadBalancer::circuit_breaker_status`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CircuitStatus {
    /// Whether the worker is currently skipped.
    pub circuit_open: bool,
    /// Failures inside the window.
    pub failure_count: usize,
    /// Failures that open the circuit.
    pub max_failures: usize,
}

#[derive(Default)]
struct BalancerState {
    rr_index: usize,
    tickets: HashMap<String, f64>,
    failures: HashMap<String, VecDeque<Instant>>,
    open: HashSet<String>,
}

impl BalancerState {
    fn prune(&mut self, worker_id: &str, now: Instant, window: Duration) -> usize {
        match self.failures.get_mut(worker_id) {
            Some(times) => {
                while let Some(front) = times.front() {
                    if now.saturating_duration_since(*front) >= window {
                        times.pop_front();
                    } else {
                        break;
                    }
                }
                times.len()
            }
            None => 0,
        }
    }
}

/// Strategy-driven worker selection with a per-worker circuit breaker.
///
/// Selection is generic over [`DispatchTarget`], so the same balancer ranks
/// in-process workers and registry entries.
pub struct LoadBalancer {
    config: BalancerConfig,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    /// A balancer with the given settings.
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BalancerState::default()),
        }
    }

    /// Default settings with `strategy`.
    pub fn with_strategy(strategy: LoadBalancingStrategy) -> Self {
        Self::new(BalancerConfig {
            strategy,
            ..BalancerConfig::default()
        })
    }

    /// The ranking strategy in use.
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.config.strategy
    }

    /// Settings in use.
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Whether circuit breaking is on.
    pub fn failover_enabled(&self) -> bool {
        self.config.failover_enabled
    }

    /// Pick a worker for a task of `task_type`.
    ///
    /// Candidates are workers with the capability, or failing that any worker
    /// that can accept a task; circuit-broken workers are then excluded.
    pub fn select_worker<'a, T: DispatchTarget>(
        &self,
        workers: &'a [T],
        task_type: &str,
    ) -> Option<&'a T> {
        if workers.is_empty() {
            return None;
        }

        let mut candidates: Vec<&'a T> = workers
            .iter()
            .filter(|w| w.has_capability(task_type))
            .collect();
        if candidates.is_empty() {
            candidates = workers.iter().filter(|w| w.can_accept_task()).collect();
        }

        let mut state = self.state.lock();
        if self.config.failover_enabled {
            let now = Instant::now();
            candidates.retain(|w| !self.circuit_open_locked(&mut state, w.target_id(), now));
        }
        if candidates.is_empty() {
            debug!(task_type = %task_type, "No eligible worker");
            return None;
        }

        let chosen = match self.config.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let idx = state.rr_index % candidates.len();
                state.rr_index = state.rr_index.wrapping_add(1);
                candidates[idx]
            }
            LoadBalancingStrategy::WeightedRoundRobin => {
                Self::weighted_round_robin(&mut state, &candidates)
            }
            LoadBalancingStrategy::LeastLoaded => Self::least_loaded(&candidates),
            LoadBalancingStrategy::WeightedLeastLoaded => Self::weighted_least_loaded(&candidates),
            LoadBalancingStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                candidates[idx]
            }
        };
        Some(chosen)
    }

    fn least_loaded<'a, T: DispatchTarget>(candidates: &[&'a T]) -> &'a T {
        let mut best = candidates[0];
        for &c in &candidates[1..] {
            if c.active_task_count() < best.active_task_count() {
                best = c;
            }
        }
        best
    }

    fn weighted_least_loaded<'a, T: DispatchTarget>(candidates: &[&'a T]) -> &'a T {
        let ratio = |w: &T| {
            let weight = w.weight();
            if weight <= 0.0 {
                f64::INFINITY
            } else {
                w.active_task_count() as f64 / weight
            }
        };
        let mut best = candidates[0];
        let mut best_ratio = ratio(best);
        for &c in &candidates[1..] {
            let r = ratio(c);
            if r < best_ratio {
                best = c;
                best_ratio = r;
            }
        }
        best
    }

    // Smooth weighted rotation: lowest tickets/weight wins, then pays the total weight.
    fn weighted_round_robin<'a, T: DispatchTarget>(
        state: &mut BalancerState,
        candidates: &[&'a T],
    ) -> &'a T {
        let effective = |w: &T| {
            let weight = w.weight();
            if weight > 0.0 {
                weight
            } else {
                1.0
            }
        };
        let total: f64 = candidates.iter().map(|&w| effective(w)).sum();

        let mut best = candidates[0];
        let mut best_ratio = f64::INFINITY;
        for &c in candidates {
            let tickets = state.tickets.get(c.target_id()).copied().unwrap_or(0.0);
            let r = tickets / effective(c);
            if r < best_ratio {
                best = c;
                best_ratio = r;
            }
        }
        *state
            .tickets
            .entry(best.target_id().to_string())
            .or_insert(0.0) += total;
        best
    }

    /// Select repeatedly, dropping each picked-but-busy worker, until one can
    /// accept the task. Returns the choice and every id that was tried.
    pub fn select_with_failover<'a, T: DispatchTarget>(
        &self,
        workers: &'a [T],
        task_type: &str,
    ) -> (Option<&'a T>, Vec<String>) {
        let mut attempted = Vec::new();
        let mut remaining: Vec<&'a T> = workers.iter().collect();

        while !remaining.is_empty() {
            let Some(&worker) = self.select_worker(&remaining, task_type) else {
                break;
            };
            attempted.push(worker.target_id().to_string());
            if worker.can_accept_task() {
                return (Some(worker), attempted);
            }
            remaining.retain(|w| !std::ptr::eq(*w, worker));
        }
        (None, attempted)
    }

    /// Record a failed execution. Returns true when the breaker is open afterwards.
    pub fn record_failure(&self, worker_id: &str) -> bool {
        self.record_failure_at(worker_id, Instant::now())
    }

    /// [`record_failure`](Self::record_failure) with an explicit timestamp.
    pub fn record_failure_at(&self, worker_id: &str, at: Instant) -> bool {
        if !self.config.failover_enabled {
            return false;
        }
        let mut state = self.state.lock();
        state
            .failures
            .entry(worker_id.to_string())
            .or_default()
            .push_back(at);
        let count = state.prune(worker_id, Instant::now(), self.config.failure_window);
        if count >= self.config.max_failures {
            if state.open.insert(worker_id.to_string()) {
                warn!(worker_id = %worker_id, failures = count, "Circuit breaker opened");
            }
            true
        } else {
            false
        }
    }

    /// Clear the failure window and close the breaker.
    pub fn record_success(&self, worker_id: &str) {
        let mut state = self.state.lock();
        state.failures.remove(worker_id);
        if state.open.remove(worker_id) {
            info!(worker_id = %worker_id, "Circuit breaker closed");
        }
    }

    /// Administrative reset; same effect as a success.
    pub fn reset_circuit_breaker(&self, worker_id: &str) {
        self.record_success(worker_id);
    }

    /// True while `worker_id` has too many recent failures.
    pub fn is_circuit_open(&self, worker_id: &str) -> bool {
        let mut state = self.state.lock();
        self.circuit_open_locked(&mut state, worker_id, Instant::now())
    }

    // An open breaker closes on its own once its failures age out of the window.
    fn circuit_open_locked(&self, state: &mut BalancerState, worker_id: &str, now: Instant) -> bool {
        if !state.open.contains(worker_id) {
            return false;
        }
        if state.prune(worker_id, now, self.config.failure_window) >= self.config.max_failures {
            return true;
        }
        state.open.remove(worker_id);
        info!(worker_id = %worker_id, "Circuit breaker expired");
        false
    }

    /// Breaker state for every worker with recorded failures or an open breaker.
    pub fn circuit_breaker_status(&self) -> HashMap<String, CircuitStatus> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let ids: HashSet<String> = state
            .failures
            .keys()
            .chain(state.open.iter())
            .cloned()
            .collect();
        ids.into_iter()
            .map(|id| {
                let open = self.circuit_open_locked(&mut state, &id, now);
                let failure_count = state.prune(&id, now, self.config.failure_window);
                (
                    id,
                    CircuitStatus {
                        circuit_open: open,
                        failure_count,
                        max_failures: self.config.max_failures,
                    },
                )
            })
            .collect()
    }

    /// Forget a worker's rotation tickets and breaker state.
    pub fn forget(&self, worker_id: &str) {
        let mut state = self.state.lock();
        state.tickets.remove(worker_id);
        state.failures.remove(worker_id);
        state.open.remove(worker_id);
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(BalancerConfig::default())
    }
}
