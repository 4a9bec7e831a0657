//! Start/stop triggers (spec.md §4.7 "Triggers"): a condition evaluated
//! against a monitored target's progress that, once satisfied, releases a
//! barrier. Kept separate from `supervisor` so each condition can be
//! unit-tested against a fake progress source instead of real I/O.

use std::time::{Duration, Instant};

/// What a trigger condition reads to decide whether it has fired. A
/// target's own counters implement this; a trigger may also watch a
/// different target's progress (spec.md §4.7: "inter-target signal").
pub trait ProgressSource: Send + Sync {
    fn ops_completed(&self) -> u64;
    fn bytes_completed(&self) -> u64;
    fn total_ops(&self) -> u64;
}

/// The threshold kinds named in spec.md §4.7.
#[derive(Debug, Clone, Copy)]
pub enum TriggerCondition {
    Delay(Duration),
    OpCount(u64),
    ByteCount(u64),
    /// Fraction of `total_ops` completed, in `[0.0, 1.0]`.
    Percentage(f64),
}

impl TriggerCondition {
    fn is_satisfied(&self, armed_at: Instant, progress: &dyn ProgressSource) -> bool {
        match self {
            TriggerCondition::Delay(d) => armed_at.elapsed() >= *d,
            TriggerCondition::OpCount(n) => progress.ops_completed() >= *n,
            TriggerCondition::ByteCount(n) => progress.bytes_completed() >= *n,
            TriggerCondition::Percentage(p) => {
                let total = progress.total_ops();
                total > 0 && (progress.ops_completed() as f64 / total as f64) >= *p
            }
        }
    }
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A trigger that must fire before the supervisor may enter its dispatch
/// loop for the pass (spec.md §4.7 step 2).
pub struct StartTrigger {
    condition: Option<TriggerCondition>,
}

impl StartTrigger {
    pub fn new(condition: Option<TriggerCondition>) -> Self {
        Self { condition }
    }

    pub fn none() -> Self {
        Self { condition: None }
    }

    /// Blocks until the condition is satisfied. Returns immediately if no
    /// condition was configured.
    pub fn block_until_armed(&self, progress: &dyn ProgressSource) {
        let Some(condition) = &self.condition else { return };
        let armed_at = Instant::now();
        while !condition.is_satisfied(armed_at, progress) {
            std::thread::sleep(DEFAULT_POLL_INTERVAL);
        }
    }
}

/// A trigger watched concurrently with the dispatch loop; once it fires,
/// the caller should stop issuing new tasks (spec.md §4.7: a stop trigger
/// "signals the target's start/stop barrier").
pub struct StopTrigger {
    condition: Option<TriggerCondition>,
    armed_at: Instant,
}

impl StopTrigger {
    pub fn new(condition: Option<TriggerCondition>) -> Self {
        Self { condition, armed_at: Instant::now() }
    }

    pub fn none() -> Self {
        Self::new(None)
    }

    /// Non-blocking check, polled once per dispatch-loop iteration.
    pub fn has_fired(&self, progress: &dyn ProgressSource) -> bool {
        match &self.condition {
            Some(c) => c.is_satisfied(self.armed_at, progress),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeProgress {
        ops: AtomicU64,
        bytes: AtomicU64,
        total: u64,
    }

    impl ProgressSource for FakeProgress {
        fn ops_completed(&self) -> u64 {
            self.ops.load(Ordering::Relaxed)
        }
        fn bytes_completed(&self) -> u64 {
            self.bytes.load(Ordering::Relaxed)
        }
        fn total_ops(&self) -> u64 {
            self.total
        }
    }

    #[test]
    fn no_condition_does_not_block() {
        let trigger = StartTrigger::none();
        let progress = FakeProgress { ops: AtomicU64::new(0), bytes: AtomicU64::new(0), total: 100 };
        trigger.block_until_armed(&progress);
    }

    #[test]
    fn op_count_condition_blocks_until_reached() {
        let progress = std::sync::Arc::new(FakeProgress {
            ops: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            total: 100,
        });
        let trigger = StartTrigger::new(Some(TriggerCondition::OpCount(10)));
        let p2 = progress.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            p2.ops.store(10, Ordering::Relaxed);
        });
        trigger.block_until_armed(progress.as_ref());
        handle.join().unwrap();
        assert_eq!(progress.ops_completed(), 10);
    }

    #[test]
    fn stop_trigger_fires_on_byte_threshold() {
        let progress = FakeProgress { ops: AtomicU64::new(0), bytes: AtomicU64::new(4096), total: 10 };
        let trigger = StopTrigger::new(Some(TriggerCondition::ByteCount(4096)));
        assert!(trigger.has_fired(&progress));
        let not_yet = FakeProgress { ops: AtomicU64::new(0), bytes: AtomicU64::new(1), total: 10 };
        let trigger2 = StopTrigger::new(Some(TriggerCondition::ByteCount(4096)));
        assert!(!trigger2.has_fired(&not_yet));
    }

    #[test]
    fn percentage_condition_requires_nonzero_total() {
        let progress = FakeProgress { ops: AtomicU64::new(50), bytes: AtomicU64::new(0), total: 0 };
        let trigger = StopTrigger::new(Some(TriggerCondition::Percentage(0.5)));
        assert!(!trigger.has_fired(&progress));
    }
}
