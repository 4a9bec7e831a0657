//! Target Supervisor (spec.md §4.7, C7): one OS thread per target,
//! running the bring-up + per-pass loop and owning the target's workers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{open_backend, BackendKind, OpenOptionsSpec, PreallocateOutcome};
use crate::barrier::{Barrier, Occupant, OccupantKind};
use crate::buffer::BufferPool;
use crate::error::Result;
use crate::lockstep::LockStep;
use crate::reporter::{PassReport, Reporter};
use crate::seeklist::OpType;
use crate::state::WorkerStateCell;
use crate::target::{E2ERole, Target, TargetConfig};
use crate::transport::header::COOKIE_LEN;
use crate::transport::E2EChannel;
use crate::trigger::{StartTrigger, StopTrigger};
use crate::worker::{self, RequestKind, Task, Worker, WorkerHandle};

/// This target's role in a master/slave lock-step coupling (spec.md §4.7
/// "Lock-step coupling"), if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStepRole {
    None,
    Master,
    Slave,
}

/// Plan-wide synchronization points and pluggable policy a supervisor
/// consults around each pass. Built once by the plan coordinator and
/// shared (for the barriers/reporter) or owned (for the triggers) by
/// each target's supervisor.
pub struct SupervisorHooks {
    pub start_barrier: Arc<Barrier>,
    pub end_barrier: Arc<Barrier>,
    pub reporter: Arc<dyn Reporter>,
    pub start_trigger: StartTrigger,
    pub stop_trigger: StopTrigger,
    pub lockstep: Option<Arc<LockStep>>,
    pub lockstep_role: LockStepRole,
}

/// One target's supervisor: its workers, its shared `Target`, and the
/// hooks it consults at pass boundaries.
pub struct TargetSupervisor {
    target: Arc<Target>,
    workers: Vec<WorkerHandle>,
    passes: u32,
    pass_delay: Option<Duration>,
    hooks: SupervisorHooks,
}

impl TargetSupervisor {
    /// Initialization (spec.md §4.7 "Initialization"): open the target,
    /// preallocate, build the seek list (done by `Target::new`), allocate
    /// the TOT (also `Target::new`), and spawn one worker thread per
    /// queue slot, each blocked in `TASK_WAIT`.
    pub fn new(
        config: TargetConfig,
        channel: Option<Arc<dyn E2EChannel>>,
        hooks: SupervisorHooks,
        passes: u32,
        pass_delay: Option<Duration>,
    ) -> Result<Self> {
        let queue_depth = config.access_plan.queue_depth;
        let xfer_size = config.access_plan.xfer_size;
        let backend_kind = config.backend_kind;
        let path = config.path.clone();
        let direct_io = config.options.direct_io;
        let stop_on_error = config.options.stop_on_error;
        let ordering = config.options.ordering;
        let e2e_role = config.options.e2e_role;
        let throttle = config.options.throttle;
        let preallocate = config.options.preallocate;
        let read_after_write = config.options.read_after_write;

        let target = Arc::new(Target::new(config)?);

        let open_spec = OpenOptionsSpec {
            kind: backend_kind,
            path: path.clone(),
            read: true,
            write: true,
            direct_io,
            create: backend_kind == BackendKind::File,
        };

        let mut backends = Vec::with_capacity(queue_depth);
        for _ in 0..queue_depth {
            backends.push(open_backend(&open_spec)?);
        }
        if preallocate {
            let total_bytes = target.config.access_plan.start_offset
                + target.config.access_plan.bytes_to_transfer_per_pass();
            let outcome = backends[0].preallocate(total_bytes);
            if outcome == PreallocateOutcome::Skipped {
                tracing::warn!(target = %path, "preallocation skipped for target");
            }
        }

        let cookie: [u8; COOKIE_LEN] = rand::random();
        let pool = BufferPool::new(target.config.options.shared_memory);
        let mut workers = Vec::with_capacity(queue_depth);
        for (index, backend) in backends.into_iter().enumerate() {
            let buffer = pool.allocate(xfer_size as usize)?;
            let worker = Worker {
                index,
                backend,
                buffer,
                channel: channel.clone(),
                ordering,
                is_e2e_source: e2e_role == E2ERole::Source,
                is_e2e_destination: e2e_role == E2ERole::Destination,
                stop_on_error,
                cookie,
                throttle,
                pass_start: Instant::now(),
                dio_enabled: direct_io,
                eof_received: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                state: Arc::new(WorkerStateCell::default()),
                counters: crate::counters::WorkerCounters::default(),
                read_after_write,
            };
            workers.push(worker::spawn(worker, target.clone()));
        }

        Ok(Self { target, workers, passes, pass_delay, hooks })
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// Swaps in the plan-wide start/end-of-pass barriers, replacing
    /// whatever placeholder barriers this supervisor was built with
    /// (spec.md §4.9: the plan coordinator owns pass-boundary
    /// synchronization across every target, not each supervisor alone).
    pub fn rebind_barriers(&mut self, start_barrier: Arc<Barrier>, end_barrier: Arc<Barrier>) {
        self.hooks.start_barrier = start_barrier;
        self.hooks.end_barrier = end_barrier;
    }

    /// Runs every configured pass, then stops every worker.
    pub fn run(&mut self) -> Result<()> {
        for pass in 0..self.passes as u64 {
            self.run_pass(pass)?;
            if pass + 1 < self.passes as u64 {
                if let Some(delay) = self.pass_delay {
                    std::thread::sleep(delay);
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(mut self) {
        for worker in self.workers.drain(..) {
            worker.stop();
        }
    }

    fn occupant(&self) -> Occupant {
        Occupant::new(format!("target-{}", self.target.config.index), OccupantKind::Target)
    }

    /// Steps 1-10 of spec.md §4.7's pass loop.
    fn run_pass(&mut self, pass_number: u64) -> Result<()> {
        self.hooks.start_barrier.wait(self.occupant(), false);
        self.hooks.start_trigger.block_until_armed(self.target.as_ref());

        self.target.runtime.reset_for_pass();
        self.target.counters.start_pass();
        self.target.shift_seek_list_for_pass(pass_number);

        if self.target.config.options.e2e_role == E2ERole::Destination {
            self.run_e2e_destination_pass()?;
        } else {
            self.run_local_pass()?;
        }

        if self.target.config.options.sync_after_write {
            self.sync_once()?;
        }

        self.target.counters.end_pass();
        let snapshot = self.target.counters.snapshot();
        let duration = self.target.counters.pass_duration();
        self.hooks.reporter.on_pass_complete(&PassReport {
            target_index: self.target.config.index,
            pass_number,
            snapshot,
            duration,
        });

        self.hooks.end_barrier.wait(self.occupant(), false);
        Ok(())
    }

    /// Dispatch loop for a non-destination (local or E2E-source) target:
    /// drive tasks from the target's own seek list (spec.md §4.7 step 4).
    fn run_local_pass(&mut self) -> Result<()> {
        let total_ops = self.target.config.access_plan.total_ops;
        let byte_cap = self.target.config.access_plan.bytes_to_transfer_per_pass();
        let xfer_size = self.target.config.access_plan.xfer_size;
        let block_size = self.target.config.access_plan.block_size;
        let start_offset = self.target.config.access_plan.start_offset;
        let pass_deadline = self.target.config.access_plan.time_limit.map(|d| Instant::now() + d);

        let mut op_number = 0u64;
        let mut bytes_dispatched = 0u64;
        while op_number < total_ops
            && bytes_dispatched < byte_cap
            && !self.target.runtime.is_aborted()
        {
            if let Some(deadline) = pass_deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
            if self.hooks.stop_trigger.has_fired(self.target.as_ref()) {
                break;
            }

            let entry = {
                let seek_list = self.target.seek_list.lock().unwrap_or_else(|e| e.into_inner());
                *seek_list.get(op_number).expect("op_number within total_ops")
            };
            let byte_offset = start_offset + entry.block_location * block_size;
            let length = xfer_size as usize;

            let idx = self.target.availability.take_idle();
            let task = Task {
                request_kind: RequestKind::Io,
                op_type: entry.op_type,
                op_number,
                byte_offset,
                length,
            };
            self.workers[idx].dispatch(task)?;

            op_number += 1;
            bytes_dispatched += xfer_size;

            if let Some(lockstep) = &self.hooks.lockstep {
                match self.hooks.lockstep_role {
                    LockStepRole::Master => lockstep.master_tick(op_number, bytes_dispatched),
                    LockStepRole::Slave => lockstep.slave_wait(op_number, bytes_dispatched),
                    LockStepRole::None => {}
                }
            }
        }

        if self.target.config.options.e2e_role == E2ERole::Source {
            let idx = self.target.availability.take_idle();
            let eof_task = Task {
                request_kind: RequestKind::Eof,
                op_type: OpType::NoOp,
                op_number,
                byte_offset: 0,
                length: 0,
            };
            self.workers[idx].dispatch(eof_task)?;
        }

        self.drain_all_workers();
        Ok(())
    }

    /// Destination loop: driven by received packets instead of the local
    /// seek list (spec.md §4.7 step 6). `Worker::run_task` fills in the
    /// offset/length from the received header itself; the dispatched
    /// task only carries the op number and op type (always a write).
    fn run_e2e_destination_pass(&mut self) -> Result<()> {
        let mut op_number = 0u64;

        // The first receive is awaited synchronously so pass-start time
        // reflects the moment data actually starts flowing rather than
        // barrier-release time (spec.md §9 open question).
        {
            let idx = self.target.availability.take_idle();
            let task = Task {
                request_kind: RequestKind::Io,
                op_type: OpType::Write,
                op_number,
                byte_offset: 0,
                length: 0,
            };
            self.workers[idx].dispatch(task)?;
            if let Ok(outcome) = self.workers[idx].outcome_rx.recv() {
                self.target.counters.set_pass_start(Instant::now());
                if outcome.eof {
                    self.drain_all_workers();
                    return Ok(());
                }
            }
            op_number += 1;
        }

        loop {
            if self.workers.iter().any(|w| w.eof_received.load(Ordering::Acquire)) {
                break;
            }
            if self.target.runtime.is_aborted() {
                break;
            }
            let idx = self.target.availability.take_idle();
            let task = Task {
                request_kind: RequestKind::Io,
                op_type: OpType::Write,
                op_number,
                byte_offset: 0,
                length: 0,
            };
            self.workers[idx].dispatch(task)?;
            op_number += 1;
        }

        self.drain_all_workers();
        Ok(())
    }

    /// Dispatches one `Sync` task and waits for it to complete; any one
    /// worker's `fdatasync` reaches the whole target file.
    fn sync_once(&mut self) -> Result<()> {
        let idx = self.target.availability.take_idle();
        let task = Task {
            request_kind: RequestKind::Sync,
            op_type: OpType::NoOp,
            op_number: 0,
            byte_offset: 0,
            length: 0,
        };
        self.workers[idx].dispatch(task)?;
        let _ = self.workers[idx].outcome_rx.recv();
        Ok(())
    }

    /// Forces every worker through its availability gate so none is left
    /// mid-task when the pass ends (spec.md §4.7 step 4).
    fn drain_all_workers(&mut self) {
        let qd = self.workers.len();
        let mut tokens = Vec::with_capacity(qd);
        for _ in 0..qd {
            tokens.push(self.target.availability.take_idle());
        }
        for idx in tokens {
            self.target.availability.mark_idle(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{HeartbeatReport, Reporter};
    use crate::seeklist::AccessPattern;
    use crate::target::{AccessPlan, TargetConfig, TargetOptions};
    use crate::tot::OrderingMode;
    use std::sync::Mutex;

    struct RecordingReporter {
        reports: Mutex<Vec<PassReport>>,
    }

    impl Reporter for RecordingReporter {
        fn on_pass_complete(&self, report: &PassReport) {
            self.reports.lock().unwrap().push(*report);
        }
        fn on_heartbeat(&self, _report: &HeartbeatReport) {}
    }

    fn hooks(reporter: Arc<dyn Reporter>) -> SupervisorHooks {
        SupervisorHooks {
            start_barrier: Arc::new(Barrier::new("start", 1)),
            end_barrier: Arc::new(Barrier::new("end", 1)),
            reporter,
            start_trigger: StartTrigger::none(),
            stop_trigger: StopTrigger::none(),
            lockstep: None,
            lockstep_role: LockStepRole::None,
        }
    }

    fn sample_config(queue_depth: usize, total_ops: u64) -> TargetConfig {
        TargetConfig {
            index: 0,
            path: String::new(),
            backend_kind: BackendKind::Null,
            access_plan: AccessPlan {
                block_size: 4096,
                xfer_size: 4096,
                start_offset: 0,
                pass_offset: 0,
                total_ops,
                rwratio: 0.0,
                byte_cap: None,
                queue_depth,
                time_limit: None,
                pattern: AccessPattern::Sequential,
            },
            options: TargetOptions { ordering: OrderingMode::Serial, ..TargetOptions::default() },
            address_table: None,
            restart_file: None,
        }
    }

    #[test]
    fn local_pass_reports_all_bytes_transferred() {
        let reporter = Arc::new(RecordingReporter { reports: Mutex::new(Vec::new()) });
        let config = sample_config(2, 8);
        let mut supervisor =
            TargetSupervisor::new(config, None, hooks(reporter.clone()), 1, None).unwrap();
        supervisor.run().unwrap();
        supervisor.shutdown();

        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].snapshot.bytes_total, 8 * 4096);
        assert_eq!(reports[0].snapshot.ops_write, 8);
    }

    #[test]
    fn multiple_passes_each_report_once() {
        let reporter = Arc::new(RecordingReporter { reports: Mutex::new(Vec::new()) });
        let config = sample_config(2, 4);
        let mut supervisor =
            TargetSupervisor::new(config, None, hooks(reporter.clone()), 3, None).unwrap();
        supervisor.run().unwrap();
        supervisor.shutdown();
        assert_eq!(reporter.reports.lock().unwrap().len(), 3);
    }
}
