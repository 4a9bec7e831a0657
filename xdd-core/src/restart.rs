//! Restart Monitor (spec.md §4.8, C8): a singleton thread per destination
//! target that periodically checkpoints the lowest outstanding offset to
//! a restart file, so a failed transfer can resume without re-copying
//! confirmed bytes.

use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, XddError};
use crate::target::Target;

/// Computes the lowest outstanding byte offset across a target's TOT
/// (spec.md §4.8: "the lowest offset not yet confirmed written"). A slot
/// still marked unreleased is mid-flight; its own offset is the
/// checkpoint. If every slot has been released since the last scan, the
/// lowest of their recorded offsets is used instead — conservative, since
/// nothing earlier than that can still be outstanding.
fn lowest_outstanding_offset(target: &Target) -> Option<u64> {
    let snapshot = target.tot.snapshot();
    let outstanding = snapshot.iter().filter(|s| !s.released).map(|s| s.byte_offset).min();
    outstanding.or_else(|| snapshot.iter().map(|s| s.byte_offset).min())
}

/// Renders spec.md §4.8's ASCII restart-file line: `-restart offset
/// <decimal-bytes>\n`.
fn render_restart_line(offset: u64) -> String {
    format!("-restart offset {offset}\n")
}

/// Auto-generates a restart filename when the user did not supply one
/// (spec.md §4.8): `xdd.<src_host>.<src_basename>.<dst_host>.<dst_basename>.<YYYY-MM-DD-HHMM>-GMT.rst`.
pub fn default_restart_filename(
    src_host: &str,
    src_path: &str,
    dst_host: &str,
    dst_path: &str,
    now: std::time::SystemTime,
) -> String {
    let src_base = basename(src_path);
    let dst_base = basename(dst_path);
    let stamp = gmt_stamp(now);
    format!("xdd.{src_host}.{src_base}.{dst_host}.{dst_base}.{stamp}-GMT.rst")
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Formats `now` as `YYYY-MM-DD-HHMM` in GMT using `libc::gmtime_r`, since
/// no date/time crate is part of the dependency stack.
fn gmt_stamp(now: std::time::SystemTime) -> String {
    let secs = now
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as libc::time_t)
        .unwrap_or(0);
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        libc::gmtime_r(&secs, &mut tm);
    }
    format!(
        "{:04}-{:02}-{:02}-{:02}{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min
    )
}

/// Atomically rewrites `path` with `contents`: write to a sibling temp
/// file, then rename over the destination, so a reader never observes a
/// half-written restart file.
fn atomic_rewrite(path: &str, contents: &str) -> Result<()> {
    let tmp_path = format!("{path}.tmp");
    {
        let mut file = fs::File::create(&tmp_path)
            .map_err(|e| XddError::Io { target: tmp_path.clone(), source: e })?;
        file.write_all(contents.as_bytes())
            .map_err(|e| XddError::Io { target: tmp_path.clone(), source: e })?;
        file.sync_all().map_err(|e| XddError::Io { target: tmp_path.clone(), source: e })?;
    }
    fs::rename(&tmp_path, path).map_err(|e| XddError::Io { target: path.to_string(), source: e })
}

/// One restart monitor, watching one destination target and rewriting
/// one restart file every `frequency`.
pub struct RestartMonitor {
    target: Arc<Target>,
    path: String,
    frequency: Duration,
    stop: Arc<AtomicBool>,
}

impl RestartMonitor {
    pub fn new(target: Arc<Target>, path: String, frequency: Duration) -> Self {
        Self { target, path, frequency, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// Spawns the monitor thread. The returned handle's `stop()` ends the
    /// loop and performs one final checkpoint write.
    pub fn spawn(self) -> RestartMonitorHandle {
        let stop = self.stop.clone();
        let thread = std::thread::Builder::new()
            .name("xdd-restart-monitor".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(self.frequency);
                    if let Err(e) = self.checkpoint() {
                        tracing::warn!(path = %self.path, error = %e, "restart checkpoint failed");
                    }
                }
                if let Err(e) = self.checkpoint() {
                    tracing::warn!(path = %self.path, error = %e, "final restart checkpoint failed");
                }
            })
            .expect("failed to spawn restart monitor thread");
        RestartMonitorHandle { stop: self.stop, thread: Some(thread) }
    }

    fn checkpoint(&self) -> Result<()> {
        let Some(offset) = lowest_outstanding_offset(&self.target) else {
            return Ok(());
        };
        atomic_rewrite(&self.path, &render_restart_line(offset))
    }
}

pub struct RestartMonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RestartMonitorHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::seeklist::AccessPattern;
    use crate::target::{AccessPlan, TargetConfig, TargetOptions};

    fn sample_target() -> Arc<Target> {
        let plan = AccessPlan {
            block_size: 4096,
            xfer_size: 4096,
            start_offset: 0,
            pass_offset: 0,
            total_ops: 4,
            rwratio: 0.0,
            byte_cap: None,
            queue_depth: 2,
            time_limit: None,
            pattern: AccessPattern::Sequential,
        };
        let config = TargetConfig {
            index: 0,
            path: String::new(),
            backend_kind: BackendKind::Null,
            access_plan: plan,
            options: TargetOptions::default(),
            address_table: None,
            restart_file: None,
        };
        Arc::new(Target::new(config).unwrap())
    }

    #[test]
    fn lowest_outstanding_offset_prefers_unreleased_slots() {
        let target = sample_target();
        target.tot.update(0, 0, 0, 4096);
        target.tot.update(1, 1, 4096, 4096);
        target.tot.release(0, 0);
        // slot 1 stays unreleased: it is the outstanding checkpoint.
        assert_eq!(lowest_outstanding_offset(&target), Some(4096));
    }

    #[test]
    fn lowest_outstanding_offset_falls_back_when_all_released() {
        let target = sample_target();
        target.tot.update(0, 0, 0, 4096);
        target.tot.release(0, 0);
        target.tot.update(1, 1, 4096, 4096);
        target.tot.release(1, 1);
        assert_eq!(lowest_outstanding_offset(&target), Some(0));
    }

    #[test]
    fn checkpoint_writes_ascii_restart_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.rst");
        let target = sample_target();
        target.tot.update(0, 0, 8192, 4096);
        target.tot.release(0, 0);
        let monitor = RestartMonitor::new(
            target,
            path.to_str().unwrap().to_string(),
            Duration::from_secs(60),
        );
        monitor.checkpoint().unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "-restart offset 8192\n");
    }

    #[test]
    fn default_filename_follows_the_documented_scheme() {
        let name = default_restart_filename(
            "srchost",
            "/data/src.bin",
            "dsthost",
            "/data/dst.bin",
            std::time::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        );
        assert!(name.starts_with("xdd.srchost.src.bin.dsthost.dst.bin."));
        assert!(name.ends_with("-GMT.rst"));
    }
}
