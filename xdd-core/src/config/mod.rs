mod loader;
mod types;

pub use loader::load_from_path;
pub use types::{
    BackendKindFile, E2ERoleFile, OrderingModeFile, PatternFile, PlanFile, TargetFile,
    ThrottleFile,
};

use crate::backend::BackendKind;
use crate::error::Result;
use crate::plan::{Plan, PlanConfig};
use crate::seeklist::AccessPattern;
use crate::target::{AccessPlan, E2ERole, TargetConfig, TargetOptions};
use crate::tot::OrderingMode;
use crate::transport::AddressTable;
use crate::worker::Throttle;

impl From<BackendKindFile> for BackendKind {
    fn from(value: BackendKindFile) -> Self {
        match value {
            BackendKindFile::File => BackendKind::File,
            BackendKindFile::Blockdev => BackendKind::BlockDev,
            BackendKindFile::Chardev => BackendKind::CharDev,
            BackendKindFile::Socket => BackendKind::Socket,
            BackendKindFile::Null => BackendKind::Null,
            BackendKindFile::Sg => BackendKind::Sg,
        }
    }
}

impl From<OrderingModeFile> for OrderingMode {
    fn from(value: OrderingModeFile) -> Self {
        match value {
            OrderingModeFile::None => OrderingMode::None,
            OrderingModeFile::Loose => OrderingMode::Loose,
            OrderingModeFile::Serial => OrderingMode::Serial,
        }
    }
}

impl From<ThrottleFile> for Throttle {
    fn from(value: ThrottleFile) -> Self {
        match value {
            ThrottleFile::Bandwidth { bytes_per_sec } => Throttle::Bandwidth(bytes_per_sec),
            ThrottleFile::Ops { ops_per_sec } => Throttle::Ops(ops_per_sec),
            ThrottleFile::Delay { millis } => {
                Throttle::Delay(std::time::Duration::from_millis(millis))
            }
        }
    }
}

impl TargetFile {
    /// Converts one TOML target entry into the engine's `TargetConfig`,
    /// filling in the fields `TargetFile` leaves to sensible defaults
    /// (mirrors `huginn-proxy-lib`'s pattern of a thin deserialize struct
    /// feeding a richer runtime type).
    pub fn into_config(self, index: usize) -> TargetConfig {
        let pattern = match self.pattern.unwrap_or(PatternFile::Sequential) {
            PatternFile::Sequential => AccessPattern::Sequential,
            PatternFile::Random => AccessPattern::Random { seed: self.seed.unwrap_or(0) },
        };
        let access_plan = AccessPlan {
            block_size: self.block_size,
            xfer_size: self.xfer_size,
            start_offset: self.start_offset.unwrap_or(0),
            pass_offset: self.pass_offset.unwrap_or(0),
            total_ops: self.total_ops,
            rwratio: self.rwratio.unwrap_or(0.0),
            byte_cap: self.byte_cap,
            queue_depth: self.queue_depth,
            time_limit: self.time_limit_secs.map(std::time::Duration::from_secs_f64),
            pattern,
        };
        let e2e_role = match self.e2e_role.unwrap_or(E2ERoleFile::None) {
            E2ERoleFile::None => E2ERole::None,
            E2ERoleFile::Source => E2ERole::Source,
            E2ERoleFile::Destination => E2ERole::Destination,
        };
        let options = TargetOptions {
            direct_io: self.direct_io.unwrap_or(false),
            preallocate: self.preallocate.unwrap_or(false),
            pretruncate: self.pretruncate.unwrap_or(false),
            shared_memory: self.shared_memory.unwrap_or(false),
            sync_after_write: self.sync_after_write.unwrap_or(false),
            recreate_per_pass: self.recreate_per_pass.unwrap_or(false),
            ordering: self.ordering.unwrap_or(OrderingModeFile::None).into(),
            e2e_role,
            stop_on_error: self.stop_on_error.unwrap_or(false),
            read_after_write: self.read_after_write.unwrap_or(false),
            throttle: self.throttle.map(Throttle::from),
        };
        let address_table = self
            .address_table
            .map(|entries| AddressTable::new(entries.into_iter().map(|e| (e.host, e.base_port, e.port_count)).collect()));
        TargetConfig {
            index,
            path: self.path,
            backend_kind: self.backend.unwrap_or(BackendKindFile::File).into(),
            access_plan,
            options,
            address_table,
            restart_file: self.restart_file,
        }
    }
}

impl PlanFile {
    /// Parses, validates, and converts a whole plan file into the
    /// engine's `Plan` (spec.md §3 "Plan" + §4.9 "Plan Coordinator").
    pub fn into_plan(self) -> Result<Plan> {
        loader::validate(&self)?;
        let config = PlanConfig {
            passes: self.passes.unwrap_or(1),
            pass_delay: self.pass_delay_secs.map(std::time::Duration::from_secs_f64),
            run_limit: self.run_limit_secs.map(std::time::Duration::from_secs_f64),
            restart_frequency: self.restart_frequency_secs.map(std::time::Duration::from_secs_f64),
            heartbeat_interval: self.heartbeat_interval_secs.map(std::time::Duration::from_secs_f64),
        };
        let targets = self
            .targets
            .into_iter()
            .enumerate()
            .map(|(index, target)| target.into_config(index))
            .collect();
        Ok(Plan { config, targets })
    }
}
