use std::collections::BTreeSet;
use std::time::{Duration, Instant};

pub const MIN_REATTACH_DELAY: Duration = Duration::from_millis(10);
pub const MAX_REATTACH_DELAY: Duration = Duration::from_millis(100);
pub const MAX_REATTACH_DURATION: Duration = Duration::from_secs(4);

/// Backoff state of the re-attach protocol for one shard.
#[derive(Clone, Debug, Default)]
pub struct ReattachState {
    pub delay: Duration,
    pub deadline: Option<Instant>,
    pub cookie: u64,
    pub reattaching: bool,
}

impl ReattachState {
    /// Decides whether another attach attempt is allowed, computing the next
    /// delay. Every call invalidates cookies of in-flight attempts.
    pub fn should_reattach(&mut self, now: Instant) -> bool {
        self.cookie += 1;

        if !self.reattaching {
            self.deadline = Some(now + MAX_REATTACH_DURATION);
            self.delay = Duration::ZERO;
            self.reattaching = true;
            return true;
        }

        let deadline = self.deadline.unwrap_or(now);
        let left = deadline.saturating_duration_since(now);
        if left.is_zero() {
            self.reattaching = false;
            return false;
        }

        self.delay = (self.delay * 2).clamp(MIN_REATTACH_DELAY, MAX_REATTACH_DELAY);

        // ±10% jitter.
        use rand::Rng;
        let jitter = 0.9 + 0.2 * rand::thread_rng().gen::<f64>();
        self.delay = self.delay.mul_f64(jitter).min(left);

        true
    }

    pub fn reattached(&mut self) {
        self.reattaching = false;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardPhase {
    Initial,
    Preparing, // planned tx only
    Prepared,  // planned tx only
    Executing,
    Finished,
}

impl ShardPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardPhase::Initial => "Initial",
            ShardPhase::Preparing => "Preparing",
            ShardPhase::Prepared => "Prepared",
            ShardPhase::Executing => "Executing",
            ShardPhase::Finished => "Finished",
        }
    }
}

/// Runtime state of one shard's proposal.
#[derive(Clone, Debug)]
pub struct ShardState {
    pub phase: ShardPhase,
    pub task_ids: BTreeSet<u64>,
    pub min_step: u64,
    pub max_step: u64,
    pub read_size: u64,
    pub read_locks: bool,
    pub follower: bool,
    pub reattach: ReattachState,
    pub restart_count: u32,
    pub restarting: bool,
}

impl ShardState {
    pub fn new(phase: ShardPhase, follower: bool) -> Self {
        Self {
            phase,
            task_ids: BTreeSet::new(),
            min_step: 0,
            max_step: 0,
            read_size: 0,
            read_locks: false,
            follower,
            reattach: ReattachState::default(),
            restart_count: 0,
            restarting: false,
        }
    }
}
