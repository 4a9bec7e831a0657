//! TOML-deserializable plan/target schema (SPEC_FULL.md §6: "a typed
//! `PlanFile`/`TargetFile` pair covering the same knobs spec.md §6 lists
//! as CLI flags"). Thin by design; `TargetFile::into_config` fills in the
//! runtime defaults.

use serde::Deserialize;

/// Top-level TOML document: plan-wide knobs plus the target list.
#[derive(Debug, Deserialize, Clone)]
pub struct PlanFile {
    /// Number of passes to run. Default: 1.
    #[serde(default)]
    pub passes: Option<u32>,
    /// Delay between passes, in seconds.
    #[serde(default)]
    pub pass_delay_secs: Option<f64>,
    /// Wall-clock run limit, in seconds.
    #[serde(default)]
    pub run_limit_secs: Option<f64>,
    /// Restart checkpoint period, in seconds. Omit to disable the
    /// restart monitor entirely.
    #[serde(default)]
    pub restart_frequency_secs: Option<f64>,
    /// Heartbeat tick period, in seconds. Omit to disable heartbeats.
    #[serde(default)]
    pub heartbeat_interval_secs: Option<f64>,
    /// At least one target is required.
    pub targets: Vec<TargetFile>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKindFile {
    File,
    Blockdev,
    Chardev,
    Socket,
    Null,
    Sg,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderingModeFile {
    None,
    Loose,
    Serial,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum E2ERoleFile {
    None,
    Source,
    Destination,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatternFile {
    Sequential,
    Random,
}

/// One `-throttle {bw|ops|delay} F` equivalent (spec.md §6).
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ThrottleFile {
    Bandwidth { bytes_per_sec: f64 },
    Ops { ops_per_sec: f64 },
    Delay { millis: u64 },
}

/// One `(host, base_port, port_count)` address-table row.
#[derive(Debug, Deserialize, Clone)]
pub struct AddressTableEntryFile {
    pub host: String,
    pub base_port: u16,
    pub port_count: u16,
}

/// One target's TOML entry (spec.md §3 "Target", §6 CLI flags).
#[derive(Debug, Deserialize, Clone)]
pub struct TargetFile {
    pub path: String,
    #[serde(default)]
    pub backend: Option<BackendKindFile>,
    pub block_size: u64,
    pub xfer_size: u64,
    pub total_ops: u64,
    #[serde(default)]
    pub byte_cap: Option<u64>,
    pub queue_depth: usize,
    #[serde(default)]
    pub rwratio: Option<f64>,
    #[serde(default)]
    pub start_offset: Option<u64>,
    #[serde(default)]
    pub pass_offset: Option<i64>,
    #[serde(default)]
    pub time_limit_secs: Option<f64>,
    #[serde(default)]
    pub pattern: Option<PatternFile>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub direct_io: Option<bool>,
    #[serde(default)]
    pub preallocate: Option<bool>,
    #[serde(default)]
    pub pretruncate: Option<bool>,
    #[serde(default)]
    pub shared_memory: Option<bool>,
    #[serde(default)]
    pub sync_after_write: Option<bool>,
    #[serde(default)]
    pub recreate_per_pass: Option<bool>,
    #[serde(default)]
    pub ordering: Option<OrderingModeFile>,
    #[serde(default)]
    pub e2e_role: Option<E2ERoleFile>,
    #[serde(default)]
    pub stop_on_error: Option<bool>,
    #[serde(default)]
    pub read_after_write: Option<bool>,
    #[serde(default)]
    pub throttle: Option<ThrottleFile>,
    #[serde(default)]
    pub address_table: Option<Vec<AddressTableEntryFile>>,
    #[serde(default)]
    pub restart_file: Option<String>,
}
