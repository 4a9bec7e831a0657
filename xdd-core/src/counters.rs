//! Per-target and per-worker counters (spec.md §3 "Counters"). Targets
//! hold their counters behind a single mutex; workers accumulate locally
//! and merge into the target under that mutex at well-defined points
//! (post-I/O, pass end), matching spec.md §5's locking discipline.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
pub struct IoTiming {
    pub total: Duration,
    pub read: Duration,
    pub write: Duration,
    pub noop: Duration,
}

impl IoTiming {
    fn merge(&mut self, other: &IoTiming) {
        self.total += other.total;
        self.read += other.read;
        self.write += other.write;
        self.noop += other.noop;
    }
}

/// Mutable accumulator used locally by one worker before merging into
/// the target's shared counters.
#[derive(Debug, Clone, Default)]
pub struct WorkerCounters {
    pub bytes_total: u64,
    pub bytes_read: u64,
    pub bytes_write: u64,
    pub ops_total: u64,
    pub ops_read: u64,
    pub ops_write: u64,
    pub ops_noop: u64,
    pub ops_error: u64,
    pub io_time: IoTiming,
    pub net_send_time: Duration,
    pub net_recv_time: Duration,
    pub first_op_time: Option<Instant>,
}

impl WorkerCounters {
    pub fn record_read(&mut self, bytes: u64, elapsed: Duration) {
        self.bytes_total += bytes;
        self.bytes_read += bytes;
        self.ops_total += 1;
        self.ops_read += 1;
        self.io_time.total += elapsed;
        self.io_time.read += elapsed;
        self.first_op_time.get_or_insert_with(Instant::now);
    }

    pub fn record_write(&mut self, bytes: u64, elapsed: Duration) {
        self.bytes_total += bytes;
        self.bytes_write += bytes;
        self.ops_total += 1;
        self.ops_write += 1;
        self.io_time.total += elapsed;
        self.io_time.write += elapsed;
        self.first_op_time.get_or_insert_with(Instant::now);
    }

    pub fn record_noop(&mut self, elapsed: Duration) {
        self.ops_total += 1;
        self.ops_noop += 1;
        self.io_time.total += elapsed;
        self.io_time.noop += elapsed;
        self.first_op_time.get_or_insert_with(Instant::now);
    }

    pub fn record_error(&mut self) {
        self.ops_error += 1;
    }
}

/// Shared, mutex-protected counters for one target, snapshotted by the
/// reporter at pass boundaries.
#[derive(Debug, Default)]
struct TargetCounterState {
    bytes_total: u64,
    bytes_read: u64,
    bytes_write: u64,
    ops_total: u64,
    ops_read: u64,
    ops_write: u64,
    ops_noop: u64,
    ops_error: u64,
    io_time: IoTiming,
    net_send_time: Duration,
    net_recv_time: Duration,
    pass_start: Option<Instant>,
    pass_end: Option<Instant>,
    earliest_first_op: Option<Instant>,
    latest_first_op: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TargetCountersSnapshot {
    pub bytes_total: u64,
    pub bytes_read: u64,
    pub bytes_write: u64,
    pub ops_total: u64,
    pub ops_read: u64,
    pub ops_write: u64,
    pub ops_noop: u64,
    pub ops_error: u64,
    pub io_time: IoTiming,
}

pub struct TargetCounters {
    state: Mutex<TargetCounterState>,
}

impl Default for TargetCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetCounters {
    pub fn new() -> Self {
        Self { state: Mutex::new(TargetCounterState::default()) }
    }

    pub fn start_pass(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.pass_start = Some(Instant::now());
        guard.pass_end = None;
        guard.earliest_first_op = None;
        guard.latest_first_op = None;
    }

    pub fn end_pass(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.pass_end = Some(Instant::now());
    }

    /// Overrides the pass start timestamp. Used by the E2E destination
    /// supervisor, which stamps pass start from the *end* of the first
    /// `receive_target_buffer` call rather than barrier-release time, so
    /// pre-sender idle time is excluded from bandwidth calculations
    /// (spec.md §9 open question).
    pub fn set_pass_start(&self, at: Instant) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.pass_start = Some(at);
    }

    /// Merge a worker's locally accumulated counters into the target's
    /// shared totals under the target's counter mutex (spec.md §4.6 step
    /// 6, §5 locking discipline).
    pub fn merge_worker(&self, worker: &WorkerCounters) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.bytes_total += worker.bytes_total;
        guard.bytes_read += worker.bytes_read;
        guard.bytes_write += worker.bytes_write;
        guard.ops_total += worker.ops_total;
        guard.ops_read += worker.ops_read;
        guard.ops_write += worker.ops_write;
        guard.ops_noop += worker.ops_noop;
        guard.ops_error += worker.ops_error;
        guard.io_time.merge(&worker.io_time);
        guard.net_send_time += worker.net_send_time;
        guard.net_recv_time += worker.net_recv_time;
        if let Some(t) = worker.first_op_time {
            guard.earliest_first_op = Some(guard.earliest_first_op.map_or(t, |e| e.min(t)));
            guard.latest_first_op = Some(guard.latest_first_op.map_or(t, |l| l.max(t)));
        }
    }

    pub fn snapshot(&self) -> TargetCountersSnapshot {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        TargetCountersSnapshot {
            bytes_total: guard.bytes_total,
            bytes_read: guard.bytes_read,
            bytes_write: guard.bytes_write,
            ops_total: guard.ops_total,
            ops_read: guard.ops_read,
            ops_write: guard.ops_write,
            ops_noop: guard.ops_noop,
            ops_error: guard.ops_error,
            io_time: guard.io_time,
        }
    }

    pub fn pass_duration(&self) -> Option<Duration> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match (guard.pass_start, guard.pass_end) {
            (Some(s), Some(e)) => Some(e.duration_since(s)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_across_workers() {
        let target = TargetCounters::new();
        let mut w1 = WorkerCounters::default();
        w1.record_read(4096, Duration::from_micros(10));
        let mut w2 = WorkerCounters::default();
        w2.record_write(8192, Duration::from_micros(20));
        target.merge_worker(&w1);
        target.merge_worker(&w2);
        let snap = target.snapshot();
        assert_eq!(snap.bytes_total, 4096 + 8192);
        assert_eq!(snap.ops_total, 2);
        assert_eq!(snap.ops_read, 1);
        assert_eq!(snap.ops_write, 1);
    }

    #[test]
    fn error_recorded_without_bytes() {
        let mut w = WorkerCounters::default();
        w.record_error();
        assert_eq!(w.ops_error, 1);
        assert_eq!(w.bytes_total, 0);
    }

    #[test]
    fn pass_duration_none_until_both_timestamps_set() {
        let target = TargetCounters::new();
        assert!(target.pass_duration().is_none());
        target.start_pass();
        assert!(target.pass_duration().is_none());
        target.end_pass();
        assert!(target.pass_duration().is_some());
    }
}
