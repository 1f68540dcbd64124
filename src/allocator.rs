//! Q-learning resource allocator.
//!
//! ## Responsibility
//! Map a discretised (load, headroom) state to an allocation action via an
//! ε-greedy policy over a Q-table, and learn from a latency-derived reward
//! signal after each request completes.
//!
//! ## Guarantees
//! - The state space is a fixed 3×3 grid, so the table never grows beyond
//!   nine states × four actions
//! - Exploration probability stays at the configured ε forever; the policy
//!   never collapses to pure greedy
//! - Allocation episodes are one-shot: the update rule carries no
//!   bootstrapped next-state value

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;

/// Default ε for the ε-greedy policy. Held constant for the process
/// lifetime.
pub const DEFAULT_EPSILON: f64 = 0.1;

/// Q-learning step size.
const LEARNING_RATE: f64 = 0.1;

/// Discount factor. Episodes are one-shot so this only scales the reward.
const DISCOUNT: f64 = 0.9;

/// Discretisation level for load or headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Bottom third of the range.
    Low,
    /// Middle third.
    Medium,
    /// Top third.
    High,
}

impl Level {
    /// Bucket a ratio in `[0, 1]` into thirds. Out-of-range input clamps.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 1.0 / 3.0 {
            Self::Low
        } else if ratio < 2.0 / 3.0 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

/// Discretised allocator state: (estimated load, available headroom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocState {
    /// Load bucket.
    pub load: Level,
    /// Headroom bucket.
    pub headroom: Level,
}

/// The closed set of allocation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocAction {
    /// Grow the allocation.
    Increase,
    /// Shrink the allocation.
    Decrease,
    /// Keep the allocation as is.
    Maintain,
    /// Let per-request signals steer the allocation.
    Adaptive,
}

impl AllocAction {
    const ALL: [Self; 4] = [Self::Increase, Self::Decrease, Self::Maintain, Self::Adaptive];

    fn index(self) -> usize {
        match self {
            Self::Increase => 0,
            Self::Decrease => 1,
            Self::Maintain => 2,
            Self::Adaptive => 3,
        }
    }

    /// Allocation scale for the chosen action: expansive actions 1.3×,
    /// conservative 0.8×.
    fn multiplier(self) -> f64 {
        match self {
            Self::Increase | Self::Adaptive => 1.3,
            Self::Decrease => 0.8,
            Self::Maintain => 1.0,
        }
    }
}

/// Request priority, scaling the base allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Background / best-effort (0.5×).
    Low,
    /// Default (1×).
    Normal,
    /// Latency-sensitive (1.5×).
    High,
}

impl Priority {
    fn multiplier(self) -> f64 {
        match self {
            Self::Low => 0.5,
            Self::Normal => 1.0,
            Self::High => 1.5,
        }
    }
}

/// Resources available to allocate from.
#[derive(Debug, Clone, Copy)]
pub struct AvailableResources {
    /// Free memory in bytes.
    pub memory_bytes: u64,
    /// Free CPU in millicores.
    pub cpu_millis: u64,
    /// Idle worker slots.
    pub workers: u32,
}

/// The allocation decision handed back to the caller.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// Memory grant in bytes.
    pub memory_bytes: u64,
    /// CPU grant in millicores.
    pub cpu_millis: u64,
    /// Worker slots to dedicate.
    pub workers: u32,
    /// The Q-table state the decision was made in.
    pub state: AllocState,
    /// The action the policy selected.
    pub action: AllocAction,
}

/// Selection statistics, used to verify the exploration invariant.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorStats {
    /// Total action selections.
    pub selections: u64,
    /// Selections that explored (random action).
    pub explorations: u64,
    /// Q-table updates applied.
    pub updates: u64,
}

#[derive(Debug, Default)]
struct AllocatorInner {
    q_table: HashMap<AllocState, [f64; 4]>,
    stats: AllocatorStats,
}

/// ε-greedy Q-learning allocator.
#[derive(Debug)]
pub struct ResourceAllocator {
    inner: RwLock<AllocatorInner>,
    epsilon: f64,
}

impl ResourceAllocator {
    /// Create an allocator with the given ε. Values are clamped to
    /// `[0.01, 1.0]` so exploration can never be disabled entirely.
    pub fn new(epsilon: f64) -> Self {
        Self {
            inner: RwLock::new(AllocatorInner::default()),
            epsilon: epsilon.clamp(0.01, 1.0),
        }
    }

    /// Allocator with the default ε = 0.1.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_EPSILON)
    }

    /// The fixed exploration probability.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Decide an allocation for the given load/headroom ratios and priority.
    ///
    /// `load_ratio` is current load over capacity; `headroom_ratio` is free
    /// resources over total. Both in `[0, 1]`.
    pub fn allocate(
        &self,
        load_ratio: f64,
        headroom_ratio: f64,
        available: AvailableResources,
        priority: Priority,
    ) -> Allocation {
        let state = AllocState {
            load: Level::from_ratio(load_ratio),
            headroom: Level::from_ratio(headroom_ratio),
        };

        let action = self.select_action(state);

        // Base allocation: a quarter of what is free, scaled by priority and
        // the action's posture.
        let scale = priority.multiplier() * action.multiplier() * 0.25;
        Allocation {
            memory_bytes: (available.memory_bytes as f64 * scale) as u64,
            cpu_millis: (available.cpu_millis as f64 * scale) as u64,
            workers: ((available.workers as f64 * scale).ceil() as u32).min(available.workers),
            state,
            action,
        }
    }

    /// ε-greedy action selection for a state.
    fn select_action(&self, state: AllocState) -> AllocAction {
        let mut rng = rand::thread_rng();
        let explore = rng.gen::<f64>() < self.epsilon;

        let mut inner = self.inner.write();
        inner.stats.selections += 1;

        if explore {
            inner.stats.explorations += 1;
            return AllocAction::ALL[rng.gen_range(0..AllocAction::ALL.len())];
        }

        let values = inner.q_table.entry(state).or_insert([0.0; 4]);
        let mut best = AllocAction::Maintain;
        let mut best_value = f64::NEG_INFINITY;
        for action in AllocAction::ALL {
            let v = values[action.index()];
            if v > best_value {
                best_value = v;
                best = action;
            }
        }
        best
    }

    /// Apply the one-shot Q-learning update:
    /// `Q(s,a) ← Q(s,a) + α · (γ·r − Q(s,a))`.
    pub fn update_q_value(&self, state: AllocState, action: AllocAction, reward: f64) {
        let mut inner = self.inner.write();
        let values = inner.q_table.entry(state).or_insert([0.0; 4]);
        let q = values[action.index()];
        values[action.index()] = q + LEARNING_RATE * (DISCOUNT * reward - q);
        inner.stats.updates += 1;
    }

    /// Reward for an observed outcome: `1 − min(observed/target, 2)`,
    /// giving `+1` at zero latency, `0` at target, `−1` at twice target or
    /// worse. Failures score a flat `−1`.
    pub fn reward_for(observed_ms: f64, target_ms: f64, success: bool) -> f64 {
        if !success {
            return -1.0;
        }
        let target = target_ms.max(1.0);
        (1.0 - (observed_ms / target).min(2.0)).clamp(-1.0, 1.0)
    }

    /// Current Q-value for a (state, action) pair; 0 when never visited.
    pub fn q_value(&self, state: AllocState, action: AllocAction) -> f64 {
        self.inner
            .read()
            .q_table
            .get(&state)
            .map_or(0.0, |values| values[action.index()])
    }

    /// Snapshot of selection statistics.
    pub fn stats(&self) -> AllocatorStats {
        self.inner.read().stats
    }

    /// Number of states ever visited. Bounded by the 3×3 grid.
    pub fn visited_states(&self) -> usize {
        self.inner.read().q_table.len()
    }
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        Self::with_defaults()
    }
}
