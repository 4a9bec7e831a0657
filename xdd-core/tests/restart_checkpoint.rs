//! Drives a `RestartMonitor` against a live `Target` while another
//! thread advances its TOT, verifying the restart file converges on the
//! lowest outstanding offset without the caller ever calling
//! `checkpoint()` directly (that's covered by `restart.rs`'s own unit
//! tests; this exercises the spawned thread + atomic rewrite instead).

use std::sync::Arc;
use std::time::Duration;

use xdd_core::backend::BackendKind;
use xdd_core::restart::RestartMonitor;
use xdd_core::seeklist::AccessPattern;
use xdd_core::target::{AccessPlan, Target, TargetConfig, TargetOptions};

fn tmp_path(name: &str) -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("xdd-test-{nanos}-{name}"))
}

fn sample_target() -> Arc<Target> {
    let plan = AccessPlan {
        block_size: 4096,
        xfer_size: 4096,
        start_offset: 0,
        pass_offset: 0,
        total_ops: 8,
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
fn restart_file_tracks_the_lowest_outstanding_offset_over_time() {
    let target = sample_target();
    let restart_path = tmp_path("restart.rst");

    let monitor = RestartMonitor::new(
        target.clone(),
        restart_path.to_str().unwrap().to_string(),
        Duration::from_millis(20),
    );
    let handle = monitor.spawn();

    // Slot 0 starts out, then is released once slot 1 begins; slot 1
    // stays outstanding, so the checkpoint should settle on its offset.
    target.tot.update(0, 0, 0, 4096);
    target.tot.update(1, 1, 4096, 4096);
    target.tot.release(0, 0);
    std::thread::sleep(Duration::from_millis(80));

    handle.stop();

    let contents = std::fs::read_to_string(&restart_path).unwrap();
    std::fs::remove_file(&restart_path).ok();
    assert_eq!(contents, "-restart offset 4096\n");
}

#[test]
fn default_restart_filename_is_stable_across_calls_with_the_same_instant() {
    let now = std::time::UNIX_EPOCH + Duration::from_secs(1_700_000_500);
    let a = xdd_core::restart::default_restart_filename("src", "/a/f.bin", "dst", "/b/g.bin", now);
    let b = xdd_core::restart::default_restart_filename("src", "/a/f.bin", "dst", "/b/g.bin", now);
    assert_eq!(a, b);
    assert!(a.contains("f.bin") && a.contains("g.bin"));
}
