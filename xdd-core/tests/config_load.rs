//! Exercises `config::load_from_path` against a full TOML plan covering
//! the knobs the unit tests in `config/loader.rs` don't touch: E2E
//! roles, an address table, and a throttle.

use xdd_core::target::E2ERole;
use xdd_core::tot::OrderingMode;
use xdd_core::worker::Throttle;

fn tmp_path(name: &str) -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("xdd-test-{nanos}-{name}"))
}

#[test]
fn loads_an_e2e_plan_with_address_table_and_throttle() {
    let plan_path = tmp_path("plan.toml");
    std::fs::write(
        &plan_path,
        r#"
        passes = 2
        pass_delay_secs = 0.5
        restart_frequency_secs = 30
        heartbeat_interval_secs = 5

        [[targets]]
        path = "/tmp/xdd-test-source"
        block_size = 4096
        xfer_size = 8192
        total_ops = 100
        queue_depth = 2
        rwratio = 1.0
        ordering = "loose"
        e2e_role = "source"

        [[targets.address_table]]
        host = "127.0.0.1"
        base_port = 40000
        port_count = 2

        [[targets]]
        path = "/tmp/xdd-test-dest"
        block_size = 4096
        xfer_size = 8192
        total_ops = 100
        queue_depth = 2
        e2e_role = "destination"

        [targets.throttle]
        kind = "bandwidth"
        bytes_per_sec = 1000000.0

        [[targets.address_table]]
        host = "127.0.0.1"
        base_port = 40000
        port_count = 2
        "#,
    )
    .unwrap();

    let plan = xdd_core::config::load_from_path(&plan_path).unwrap();
    std::fs::remove_file(&plan_path).ok();

    assert_eq!(plan.config.passes, 2);
    assert_eq!(plan.config.pass_delay, Some(std::time::Duration::from_millis(500)));
    assert_eq!(plan.targets.len(), 2);

    let source = &plan.targets[0];
    assert_eq!(source.options.e2e_role, E2ERole::Source);
    assert_eq!(source.options.ordering, OrderingMode::Loose);
    assert_eq!(source.access_plan.rwratio, 1.0);
    let table = source.address_table.as_ref().expect("source has an address table");
    assert_eq!(table.total_ports(), 2);
    assert_eq!(table.worker_endpoint(1), Some(("127.0.0.1".to_string(), 40001)));

    let dest = &plan.targets[1];
    assert_eq!(dest.options.e2e_role, E2ERole::Destination);
    match dest.options.throttle {
        Some(Throttle::Bandwidth(bytes_per_sec)) => assert_eq!(bytes_per_sec, 1_000_000.0),
        other => panic!("expected a bandwidth throttle, got {other:?}"),
    }
}

#[test]
fn rejects_an_e2e_target_missing_its_address_table() {
    let plan_path = tmp_path("plan.toml");
    std::fs::write(
        &plan_path,
        r#"
        [[targets]]
        path = "/tmp/xdd-test-source"
        block_size = 4096
        xfer_size = 4096
        total_ops = 10
        queue_depth = 1
        e2e_role = "source"
        "#,
    )
    .unwrap();

    let result = xdd_core::config::load_from_path(&plan_path);
    std::fs::remove_file(&plan_path).ok();
    assert!(result.is_err());
}
