//! Plan Coordinator (spec.md §4.9, C9): brings up the barrier registry,
//! every target supervisor, the reporter, the optional heartbeat and
//! restart monitor threads, and tears all of it down again on shutdown.
//! The interactive debugger shell itself is out of scope (spec.md
//! Non-goals); the registry and per-worker state this module wires up is
//! exactly what such a shell would read.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::barrier::BarrierRegistry;
use crate::error::Result;
use crate::reporter::{HeartbeatReport, Reporter};
use crate::restart::{RestartMonitor, RestartMonitorHandle};
use crate::supervisor::{SupervisorHooks, TargetSupervisor};

/// A fully parsed, validated plan: its process-wide knobs plus every
/// target's static configuration (spec.md §3 "Plan"). Produced by
/// `config::load_from_path` or assembled by hand for tests; still needs
/// each target's backend/transport wired up (`TargetSupervisor::new`)
/// before it can be handed to `PlanCoordinator::run`.
pub struct Plan {
    pub config: PlanConfig,
    pub targets: Vec<crate::target::TargetConfig>,
}

/// Process-wide configuration a plan is built from (spec.md §3 "Plan").
pub struct PlanConfig {
    pub passes: u32,
    pub pass_delay: Option<Duration>,
    pub run_limit: Option<Duration>,
    pub restart_frequency: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
}

/// One target's fully-built supervisor plus the restart file it should
/// be checkpointed to, if any (only meaningful for E2E destination
/// targets, per spec.md §4.8).
pub struct PlanTarget {
    pub supervisor: TargetSupervisor,
    pub restart_path: Option<String>,
}

/// Brings up and tears down every target in a plan. Owns the barrier
/// registry, the reporter, and the heartbeat/restart monitor threads;
/// does not own the transport itself (set up by whoever constructed the
/// `PlanTarget`s' channels) but is handed a teardown hook to call once
/// every supervisor has stopped.
pub struct PlanCoordinator {
    registry: Arc<BarrierRegistry>,
    reporter: Arc<dyn Reporter>,
    run_start_time: Option<Instant>,
    supervisor_threads: Vec<std::thread::JoinHandle<()>>,
    heartbeat: Option<HeartbeatHandle>,
    run_limit_watcher: Option<RunLimitHandle>,
    restart_monitors: Vec<RestartMonitorHandle>,
    transport_teardown: Option<Box<dyn FnOnce() + Send>>,
}

struct HeartbeatHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    thread: std::thread::JoinHandle<()>,
}

struct RunLimitHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    thread: std::thread::JoinHandle<()>,
}

impl PlanCoordinator {
    /// Step-by-step bring-up (spec.md §4.9): create the barrier registry,
    /// hand each target supervisor its shared start/end-of-pass barriers
    /// and spawn its pass loop, record `run_start_time`, release the
    /// global start-of-pass barrier, then start the optional heartbeat
    /// and restart monitor threads.
    pub fn start(
        config: PlanConfig,
        targets: Vec<PlanTarget>,
        reporter: Arc<dyn Reporter>,
        transport_teardown: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Self> {
        let registry = Arc::new(BarrierRegistry::new());
        let parties = targets.len() + 1;
        let start_barrier = registry.create("plan-start-of-pass", parties);
        let end_barrier = registry.create("plan-end-of-pass", parties);

        let mut restart_monitors = Vec::new();
        let mut supervisor_threads = Vec::with_capacity(targets.len());
        let mut run_limit_targets = Vec::with_capacity(targets.len());

        for plan_target in targets {
            let PlanTarget { mut supervisor, restart_path } = plan_target;
            // Re-point the supervisor's hooks at the plan-wide barriers;
            // `TargetSupervisor::new` is built with placeholder
            // single-party barriers by callers that construct it ahead of
            // plan assembly, so this swap is how C9 takes ownership of
            // pass-boundary synchronization.
            supervisor.rebind_barriers(start_barrier.clone(), end_barrier.clone());

            if let Some(path) = restart_path {
                if let Some(frequency) = config.restart_frequency {
                    let monitor =
                        RestartMonitor::new(supervisor.target().clone(), path, frequency);
                    restart_monitors.push(monitor.spawn());
                }
            }

            let target_for_thread = supervisor.target().clone();
            run_limit_targets.push(target_for_thread.clone());
            let thread = std::thread::Builder::new()
                .name(format!("xdd-target-{}", target_for_thread.config.index))
                .spawn(move || {
                    let mut supervisor = supervisor;
                    if let Err(e) = supervisor.run() {
                        tracing::error!(error = %e, "target supervisor exited with an error");
                        supervisor.target().runtime.set_aborted();
                    }
                    supervisor.shutdown();
                })
                .expect("failed to spawn target supervisor thread");
            supervisor_threads.push(thread);
        }

        let run_start_time = Instant::now();
        // The coordinator is the barrier's owner: this entry is the
        // `parties`-th, releasing every supervisor's first pass at once.
        start_barrier.wait(
            crate::barrier::Occupant::new("plan-coordinator", crate::barrier::OccupantKind::Main),
            true,
        );

        let heartbeat = config.heartbeat_interval.map(|interval| {
            spawn_heartbeat(interval, reporter.clone())
        });

        let run_limit_watcher = config
            .run_limit
            .map(|limit| spawn_run_limit_watcher(limit, run_start_time, run_limit_targets));

        Ok(Self {
            registry,
            reporter,
            run_start_time: Some(run_start_time),
            supervisor_threads,
            heartbeat,
            run_limit_watcher,
            restart_monitors,
            transport_teardown,
        })
    }

    /// Entry point the `xdd` binary calls: brings the plan up, blocks
    /// until every target supervisor finishes its configured passes, and
    /// tears everything down.
    pub fn run(
        config: PlanConfig,
        targets: Vec<PlanTarget>,
        reporter: Arc<dyn Reporter>,
        transport_teardown: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        let mut coordinator = Self::start(config, targets, reporter, transport_teardown)?;
        coordinator.wait_for_completion();
        coordinator.shutdown();
        Ok(())
    }

    pub fn run_start_time(&self) -> Option<Instant> {
        self.run_start_time
    }

    pub fn barrier_registry(&self) -> &Arc<BarrierRegistry> {
        &self.registry
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Blocks until every target supervisor's thread has exited.
    pub fn wait_for_completion(&mut self) {
        for thread in self.supervisor_threads.drain(..) {
            let _ = thread.join();
        }
    }

    /// Joins the end-of-pass barrier the plan-wide way: one wait per
    /// configured pass, matching the per-target supervisors' own waits.
    /// Unused once `wait_for_completion` has joined every supervisor
    /// thread, but kept available for callers driving the barrier from
    /// the coordinator's own thread instead.
    pub fn release_end_of_pass(&self) {
        if let Some(barrier) = self.registry.get("plan-end-of-pass") {
            barrier.wait(
                crate::barrier::Occupant::new(
                    "plan-coordinator",
                    crate::barrier::OccupantKind::Main,
                ),
                true,
            );
        }
    }

    /// Shutdown (spec.md §4.9): join every supervisor thread, stop the
    /// heartbeat and restart monitor threads, destroy every barrier, then
    /// finalize the transport.
    pub fn shutdown(mut self) {
        self.wait_for_completion();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop.store(true, Ordering::Release);
            let _ = heartbeat.thread.join();
        }
        if let Some(watcher) = self.run_limit_watcher.take() {
            watcher.stop.store(true, Ordering::Release);
            let _ = watcher.thread.join();
        }
        for monitor in self.restart_monitors.drain(..) {
            monitor.stop();
        }
        self.registry.destroy_all();
        if let Some(teardown) = self.transport_teardown.take() {
            teardown();
        }
    }
}

fn spawn_heartbeat(interval: Duration, reporter: Arc<dyn Reporter>) -> HeartbeatHandle {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    let thread = std::thread::Builder::new()
        .name("xdd-heartbeat".into())
        .spawn(move || {
            while !stop_for_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                if stop_for_thread.load(Ordering::Acquire) {
                    break;
                }
                // Heartbeat content (per-target snapshots) is supplied by
                // whoever owns the targets; the coordinator only drives
                // the interval. Real wiring happens in
                // `TargetSupervisor::run_pass`'s reporter calls, which
                // already cover pass-granularity reporting. This timer
                // exists for in-pass reporting cadence when a pass runs
                // long, surfaced through a zeroed placeholder report so a
                // reporter always gets ticked on schedule even when no
                // target-specific heartbeat source is wired in yet.
                reporter.on_heartbeat(&HeartbeatReport {
                    target_index: usize::MAX,
                    snapshot: Default::default(),
                });
            }
        })
        .expect("failed to spawn heartbeat thread");
    HeartbeatHandle { stop, thread }
}

/// Enforces spec.md §5's per-run time limit: polls elapsed wall-clock
/// time against `run_limit` and aborts every target once it's exceeded,
/// so each supervisor's own dispatch-loop check (`run_local_pass`,
/// `run_e2e_destination_pass`) picks it up before its next dispatch.
fn spawn_run_limit_watcher(
    run_limit: Duration,
    run_start_time: Instant,
    targets: Vec<Arc<crate::target::Target>>,
) -> RunLimitHandle {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    let poll_interval = (run_limit / 10).max(Duration::from_millis(10)).min(Duration::from_secs(1));
    let thread = std::thread::Builder::new()
        .name("xdd-run-limit".into())
        .spawn(move || {
            while !stop_for_thread.load(Ordering::Acquire) {
                if run_start_time.elapsed() >= run_limit {
                    for target in &targets {
                        target.runtime.set_aborted();
                    }
                    break;
                }
                std::thread::sleep(poll_interval);
            }
        })
        .expect("failed to spawn run-limit watcher thread");
    RunLimitHandle { stop, thread }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::reporter::PassReport;
    use crate::seeklist::AccessPattern;
    use crate::supervisor::LockStepRole;
    use crate::target::{AccessPlan, TargetConfig, TargetOptions};
    use crate::tot::OrderingMode;
    use crate::trigger::{StartTrigger, StopTrigger};
    use std::sync::Mutex;

    struct RecordingReporter {
        passes: Mutex<Vec<PassReport>>,
        heartbeats: Mutex<u32>,
    }

    impl Reporter for RecordingReporter {
        fn on_pass_complete(&self, report: &PassReport) {
            self.passes.lock().unwrap().push(*report);
        }
        fn on_heartbeat(&self, _report: &HeartbeatReport) {
            *self.heartbeats.lock().unwrap() += 1;
        }
    }

    fn sample_config(index: usize, total_ops: u64) -> TargetConfig {
        TargetConfig {
            index,
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
                queue_depth: 2,
                time_limit: None,
                pattern: AccessPattern::Sequential,
            },
            options: TargetOptions { ordering: OrderingMode::Serial, ..TargetOptions::default() },
            address_table: None,
            restart_file: None,
        }
    }

    fn placeholder_hooks(reporter: Arc<dyn Reporter>) -> SupervisorHooks {
        SupervisorHooks {
            start_barrier: Arc::new(crate::barrier::Barrier::new("placeholder-start", 1)),
            end_barrier: Arc::new(crate::barrier::Barrier::new("placeholder-end", 1)),
            reporter,
            start_trigger: StartTrigger::none(),
            stop_trigger: StopTrigger::none(),
            lockstep: None,
            lockstep_role: LockStepRole::None,
        }
    }

    #[test]
    fn two_targets_run_one_pass_each_under_the_plan_barriers() {
        let reporter = Arc::new(RecordingReporter {
            passes: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(0),
        });
        let mut targets = Vec::new();
        for i in 0..2 {
            let supervisor = TargetSupervisor::new(
                sample_config(i, 4),
                None,
                placeholder_hooks(reporter.clone()),
                1,
                None,
            )
            .unwrap();
            targets.push(PlanTarget { supervisor, restart_path: None });
        }

        let config = PlanConfig {
            passes: 1,
            pass_delay: None,
            run_limit: None,
            restart_frequency: None,
            heartbeat_interval: None,
        };
        let coordinator =
            PlanCoordinator::start(config, targets, reporter.clone(), None).unwrap();
        coordinator.shutdown();

        assert_eq!(reporter.passes.lock().unwrap().len(), 2);
    }
}
