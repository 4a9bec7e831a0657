use std::fs;
use std::path::Path;

use super::types::PlanFile;
use crate::error::{Result, XddError};
use crate::plan::Plan;

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Plan> {
    let text = fs::read_to_string(&p)
        .map_err(|e| XddError::Config(format!("failed to read plan file: {e}")))?;
    let plan_file: PlanFile = toml::from_str(&text)
        .map_err(|e| XddError::Config(format!("failed to parse plan file: {e}")))?;
    plan_file.into_plan()
}

/// Mirrors `huginn-proxy-lib/src/config/loader.rs::validate_config`'s
/// shape: non-empty target list, transfer-size/block-size divisibility,
/// positive queue depth, E2E role/address-table consistency.
pub fn validate(plan: &PlanFile) -> Result<()> {
    if plan.targets.is_empty() {
        return Err(XddError::Config("plan must declare at least one target".into()));
    }
    for (index, target) in plan.targets.iter().enumerate() {
        if target.block_size == 0 {
            return Err(XddError::Config(format!("target {index}: block_size must be nonzero")));
        }
        if target.xfer_size % target.block_size != 0 {
            return Err(XddError::Config(format!(
                "target {index}: xfer_size ({}) must be a multiple of block_size ({})",
                target.xfer_size, target.block_size
            )));
        }
        if target.queue_depth == 0 {
            return Err(XddError::Config(format!("target {index}: queue_depth must be positive")));
        }
        if let Some(rwratio) = target.rwratio {
            if !(0.0..=1.0).contains(&rwratio) {
                return Err(XddError::Config(format!(
                    "target {index}: rwratio {rwratio} out of range [0.0, 1.0]"
                )));
            }
        }
        let has_role = !matches!(
            target.e2e_role,
            None | Some(super::types::E2ERoleFile::None)
        );
        if has_role && target.address_table.is_none() {
            return Err(XddError::Config(format!(
                "target {index}: has an E2E role but no address_table"
            )));
        }
        if let Some(table) = &target.address_table {
            let total_ports: u32 = table.iter().map(|e| e.port_count as u32).sum();
            if total_ports as usize != target.queue_depth {
                return Err(XddError::Config(format!(
                    "target {index}: address_table has {total_ports} ports but queue_depth is {}",
                    target.queue_depth
                )));
            }
        }
    }
    Ok(())
}
