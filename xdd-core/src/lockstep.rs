//! Master/slave target coupling (spec.md §4.7 "Lock-step coupling"): a
//! slave target rendezvous with its master every `interval` ops or bytes,
//! sharing a two-party `Barrier`. Kept separate from `supervisor` for the
//! same testability reason as `trigger` (spec.md §9/§10 note on
//! `original_source`'s `xdd_target_ttd_before_io_op.c` keeping this logic
//! in its own subroutine).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::barrier::{Barrier, Occupant, OccupantKind};

/// The unit a lock-step interval is expressed in.
#[derive(Debug, Clone, Copy)]
pub enum LockStepInterval {
    Ops(u64),
    Bytes(u64),
}

impl LockStepInterval {
    fn boundary_crossed(&self, ops_done: u64, bytes_done: u64) -> bool {
        match self {
            LockStepInterval::Ops(n) if *n > 0 => ops_done % n == 0,
            LockStepInterval::Bytes(n) if *n > 0 => bytes_done % n == 0,
            _ => false,
        }
    }
}

/// Shared coupling state for one master/slave pair. `terminated` lets the
/// master push a final rendezvous through so the slave is never left
/// parked once the master finishes (spec.md §4.7: "termination cascades
/// from master to slave").
pub struct LockStep {
    barrier: Arc<Barrier>,
    interval: LockStepInterval,
    terminated: AtomicBool,
}

impl LockStep {
    pub fn new(barrier: Arc<Barrier>, interval: LockStepInterval) -> Self {
        Self { barrier, interval, terminated: AtomicBool::new(false) }
    }

    /// Called by the master's dispatch loop after each completed op.
    /// Rendezvous with the slave whenever the interval boundary is
    /// crossed.
    pub fn master_tick(&self, ops_done: u64, bytes_done: u64) {
        if self.interval.boundary_crossed(ops_done, bytes_done) {
            self.barrier.wait(Occupant::new("lockstep-master", OccupantKind::Target), true);
        }
    }

    /// Called by the slave's dispatch loop before issuing op `op_number`.
    /// Blocks until the master releases the matching boundary.
    pub fn slave_wait(&self, op_number: u64, bytes_done: u64) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.interval.boundary_crossed(op_number, bytes_done) {
            self.barrier.wait(Occupant::new("lockstep-slave", OccupantKind::Target), false);
        }
    }

    /// Called once by the master when its pass ends, so a slave blocked
    /// on the next boundary is released rather than deadlocked.
    pub fn release_for_termination(&self) {
        self.terminated.store(true, Ordering::Release);
        self.barrier.wait(Occupant::new("lockstep-master-shutdown", OccupantKind::Target), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn slave_advances_in_step_with_master() {
        let barrier = Arc::new(Barrier::new("lockstep-test", 2));
        let lockstep = Arc::new(LockStep::new(barrier, LockStepInterval::Ops(4)));
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));

        let ls2 = lockstep.clone();
        let observed2 = observed.clone();
        let slave = thread::spawn(move || {
            for op in 1..=8u64 {
                ls2.slave_wait(op, 0);
                observed2.lock().unwrap().push(op);
            }
        });

        for op in 1..=8u64 {
            thread::sleep(Duration::from_millis(2));
            lockstep.master_tick(op, 0);
        }
        slave.join().unwrap();
        assert_eq!(*observed.lock().unwrap(), (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn termination_releases_a_blocked_slave() {
        let barrier = Arc::new(Barrier::new("lockstep-shutdown", 2));
        let lockstep = Arc::new(LockStep::new(barrier, LockStepInterval::Ops(4)));
        let ls2 = lockstep.clone();
        let slave = thread::spawn(move || {
            ls2.slave_wait(4, 0);
        });
        thread::sleep(Duration::from_millis(10));
        lockstep.release_for_termination();
        slave.join().unwrap();
    }
}
