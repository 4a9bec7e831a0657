//! Worker/target run-state, readable lock-free by the restart monitor and
//! a future interactive debugger (spec.md §4.6, §9 design note: "the
//! numerous `CURRENT_STATE_*` bits should become a sum type plus an
//! atomic holding the current variant").

use std::sync::atomic::{AtomicU8, Ordering};

/// The state a worker thread is in at any instant. Unlike the original
/// bitmask, exactly one variant is current at a time; compound states
/// from the source (e.g. "waiting for TOT lock AND barrier") are
/// resolved by which suspension point is outermost at the moment of
/// observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Init = 0,
    Idle = 1,
    TaskWait = 2,
    Io = 3,
    DestRecv = 4,
    SrcSend = 5,
    Barrier = 6,
    WaitingForTotWait = 7,
    WaitingForTotRelease = 8,
    WaitingForTotUpdate = 9,
    WaitingForPreviousIo = 10,
    PassComplete = 11,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Init,
            1 => WorkerState::Idle,
            2 => WorkerState::TaskWait,
            3 => WorkerState::Io,
            4 => WorkerState::DestRecv,
            5 => WorkerState::SrcSend,
            6 => WorkerState::Barrier,
            7 => WorkerState::WaitingForTotWait,
            8 => WorkerState::WaitingForTotRelease,
            9 => WorkerState::WaitingForTotUpdate,
            10 => WorkerState::WaitingForPreviousIo,
            _ => WorkerState::PassComplete,
        }
    }
}

/// Lock-free, atomic holder of a worker's current state.
#[derive(Debug)]
pub struct WorkerStateCell(AtomicU8);

impl Default for WorkerStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(WorkerState::Init as u8))
    }
}

impl WorkerStateCell {
    pub fn new(initial: WorkerState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_all_variants() {
        let cell = WorkerStateCell::default();
        let variants = [
            WorkerState::Init,
            WorkerState::Idle,
            WorkerState::TaskWait,
            WorkerState::Io,
            WorkerState::DestRecv,
            WorkerState::SrcSend,
            WorkerState::Barrier,
            WorkerState::WaitingForTotWait,
            WorkerState::WaitingForTotRelease,
            WorkerState::WaitingForTotUpdate,
            WorkerState::WaitingForPreviousIo,
            WorkerState::PassComplete,
        ];
        for v in variants {
            cell.set(v);
            assert_eq!(cell.get(), v);
        }
    }
}
