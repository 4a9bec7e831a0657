//! A target's static configuration and runtime state (spec.md §3
//! "Target"). `Target` owns its TOT, seek list, worker handles, and
//! counters; workers refer back to their target by index into the plan's
//! target table rather than a back pointer (spec.md §9 design note on the
//! original's cyclic target/worker/buffer/transport graph).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::backend::BackendKind;
use crate::counters::TargetCounters;
use crate::error::{Result, XddError};
use crate::seeklist::{AccessPattern, SeekList};
use crate::tot::{OrderingMode, Tot};
use crate::transport::AddressTable;

/// The target's role in an E2E pipeline, if any (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E2ERole {
    None,
    Source,
    Destination,
}

/// Block/transfer-size and op-count parameters for a pass (spec.md §3
/// "Access plan").
#[derive(Debug, Clone)]
pub struct AccessPlan {
    pub block_size: u64,
    pub xfer_size: u64,
    pub start_offset: u64,
    pub pass_offset: i64,
    pub total_ops: u64,
    pub rwratio: f64,
    pub byte_cap: Option<u64>,
    pub queue_depth: usize,
    pub time_limit: Option<std::time::Duration>,
    pub pattern: AccessPattern,
}

impl AccessPlan {
    pub fn blocks_per_op(&self) -> u64 {
        self.xfer_size / self.block_size
    }

    /// `target_bytes_to_xfer_per_pass`, per spec.md §3's invariant,
    /// accounting for a short final op when `byte_cap` is not itself a
    /// multiple of `xfer_size`.
    pub fn bytes_to_transfer_per_pass(&self) -> u64 {
        match self.byte_cap {
            Some(cap) => cap.min(self.total_ops * self.xfer_size),
            None => self.total_ops * self.xfer_size,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(XddError::Config("block_size must be nonzero".into()));
        }
        if self.xfer_size % self.block_size != 0 {
            return Err(XddError::Config(format!(
                "xfer_size ({}) must be a multiple of block_size ({})",
                self.xfer_size, self.block_size
            )));
        }
        if !(0.0..=1.0).contains(&self.rwratio) {
            return Err(XddError::Config(format!("rwratio {} out of range [0.0, 1.0]", self.rwratio)));
        }
        if self.queue_depth == 0 {
            return Err(XddError::Config("queue_depth must be positive".into()));
        }
        Ok(())
    }
}

/// Boolean/enum options that shape how a target is opened and run
/// (spec.md §3 "Options").
#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub direct_io: bool,
    pub preallocate: bool,
    pub pretruncate: bool,
    pub shared_memory: bool,
    pub sync_after_write: bool,
    pub recreate_per_pass: bool,
    pub ordering: OrderingMode,
    pub e2e_role: E2ERole,
    pub stop_on_error: bool,
    pub read_after_write: bool,
    pub throttle: Option<crate::worker::Throttle>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            direct_io: false,
            preallocate: false,
            pretruncate: false,
            shared_memory: false,
            sync_after_write: false,
            recreate_per_pass: false,
            ordering: OrderingMode::None,
            e2e_role: E2ERole::None,
            stop_on_error: false,
            read_after_write: false,
            throttle: None,
        }
    }
}

/// Static, validated configuration for one target; immutable for the
/// lifetime of the `Target` it describes.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub index: usize,
    pub path: String,
    pub backend_kind: BackendKind,
    pub access_plan: AccessPlan,
    pub options: TargetOptions,
    pub address_table: Option<AddressTable>,
    pub restart_file: Option<String>,
}

impl TargetConfig {
    pub fn validate(&self) -> Result<()> {
        self.access_plan.validate()?;
        if self.options.e2e_role != E2ERole::None && self.address_table.is_none() {
            return Err(XddError::Config(format!(
                "target {} has an E2E role but no address table",
                self.index
            )));
        }
        if let Some(table) = &self.address_table {
            if table.total_ports() as usize != self.access_plan.queue_depth {
                return Err(XddError::Config(format!(
                    "target {} address table has {} ports but queue_depth is {}",
                    self.index,
                    table.total_ports(),
                    self.access_plan.queue_depth
                )));
            }
        }
        Ok(())
    }
}

/// Runtime, mutable-by-workers state not already covered by `Tot` slots
/// or `TargetCounters` (spec.md §3 "Runtime state").
pub struct TargetRuntime {
    pub current_pass: AtomicU64,
    pub bytes_issued: AtomicU64,
    pub bytes_completed: AtomicU64,
    pub abort: AtomicBool,
    pub dio_disabled_this_pass: AtomicBool,
}

impl Default for TargetRuntime {
    fn default() -> Self {
        Self {
            current_pass: AtomicU64::new(0),
            bytes_issued: AtomicU64::new(0),
            bytes_completed: AtomicU64::new(0),
            abort: AtomicBool::new(false),
            dio_disabled_this_pass: AtomicBool::new(false),
        }
    }
}

impl TargetRuntime {
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn set_aborted(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn reset_for_pass(&self) {
        self.bytes_issued.store(0, Ordering::Relaxed);
        self.bytes_completed.store(0, Ordering::Relaxed);
        self.dio_disabled_this_pass.store(false, Ordering::Relaxed);
    }
}

/// Pool of idle worker indices, guarded by the target's availability
/// mutex + condition (spec.md §5 "Shared resources": "Worker
/// availability: protected by the target's availability mutex +
/// condition; any worker becoming idle notifies; supervisors wait").
#[derive(Default)]
pub struct Availability {
    idle: Mutex<VecDeque<usize>>,
    cond: Condvar,
}

impl Availability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by a worker when it parks after finishing (or before
    /// starting) a task.
    pub fn mark_idle(&self, worker_index: usize) {
        let mut guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        guard.push_back(worker_index);
        self.cond.notify_one();
    }

    /// Called by the supervisor's dispatch loop; blocks until a worker is
    /// idle.
    pub fn take_idle(&self) -> usize {
        let mut guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        while guard.is_empty() {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        guard.pop_front().unwrap()
    }

    /// Non-blocking drain, used when forcing every worker through the
    /// availability gate at the end of a pass (spec.md §4.7 step 4: "for
    /// every worker force a transition through its availability gate").
    pub fn drain(&self) -> Vec<usize> {
        let mut guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        guard.drain(..).collect()
    }
}

/// One configured target: its static config, its TOT, its (possibly
/// per-pass-shifted) seek list, its shared counters, and its runtime
/// state. Owns its workers' lifetimes but not a pointer to them —
/// `supervisor::TargetSupervisor` holds the `Vec<WorkerHandle>`.
pub struct Target {
    pub config: TargetConfig,
    pub tot: Tot,
    pub seek_list: Mutex<SeekList>,
    pub counters: TargetCounters,
    pub runtime: TargetRuntime,
    pub availability: Availability,
}

impl Target {
    pub fn new(config: TargetConfig) -> Result<Self> {
        config.validate()?;
        let seek_list = SeekList::generate(
            config.access_plan.total_ops,
            config.access_plan.rwratio,
            config.access_plan.blocks_per_op(),
            &config.access_plan.pattern,
        );
        let tot = Tot::new(config.access_plan.queue_depth);
        Ok(Self {
            config,
            tot,
            seek_list: Mutex::new(seek_list),
            counters: TargetCounters::new(),
            runtime: TargetRuntime::default(),
            availability: Availability::new(),
        })
    }

    /// Shift the seek list for the upcoming pass (spec.md §4.4: "across
    /// passes the supervisor may shift all positions by `pass_offset`").
    pub fn shift_seek_list_for_pass(&self, pass_number: u64) {
        let mut guard = self.seek_list.lock().unwrap_or_else(|e| e.into_inner());
        *guard = guard.shifted(self.config.access_plan.pass_offset, pass_number);
    }
}

impl crate::trigger::ProgressSource for Target {
    fn ops_completed(&self) -> u64 {
        self.counters.snapshot().ops_total
    }

    fn bytes_completed(&self) -> u64 {
        self.counters.snapshot().bytes_total
    }

    fn total_ops(&self) -> u64 {
        self.config.access_plan.total_ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> AccessPlan {
        AccessPlan {
            block_size: 4096,
            xfer_size: 4096,
            start_offset: 0,
            pass_offset: 0,
            total_ops: 16,
            rwratio: 0.0,
            byte_cap: None,
            queue_depth: 4,
            time_limit: None,
            pattern: AccessPattern::Sequential,
        }
    }

    #[test]
    fn xfer_size_not_multiple_of_block_size_is_rejected() {
        let mut plan = sample_plan();
        plan.xfer_size = 4097;
        let config = TargetConfig {
            index: 0,
            path: "/tmp/x".into(),
            backend_kind: BackendKind::File,
            access_plan: plan,
            options: TargetOptions::default(),
            address_table: None,
            restart_file: None,
        };
        assert!(Target::new(config).is_err());
    }

    #[test]
    fn e2e_role_without_address_table_is_rejected() {
        let mut options = TargetOptions::default();
        options.e2e_role = E2ERole::Source;
        let config = TargetConfig {
            index: 0,
            path: "/tmp/x".into(),
            backend_kind: BackendKind::File,
            access_plan: sample_plan(),
            options,
            address_table: None,
            restart_file: None,
        };
        assert!(Target::new(config).is_err());
    }

    #[test]
    fn valid_config_builds_a_target() {
        let config = TargetConfig {
            index: 0,
            path: "/tmp/x".into(),
            backend_kind: BackendKind::File,
            access_plan: sample_plan(),
            options: TargetOptions::default(),
            address_table: None,
            restart_file: None,
        };
        let target = Target::new(config).unwrap();
        assert_eq!(target.tot.len(), 4);
        assert_eq!(target.seek_list.lock().unwrap().len(), 16);
    }
}
