#![forbid(unsafe_code)]

//! XDD command-line entrypoint. Intentionally thin (SPEC_FULL.md §6):
//! points at a plan file, wires each target's transport if it has an E2E
//! role, and hands everything to `PlanCoordinator::run`. Statistics
//! formatting, the interactive shell, and CLI flag coverage of every
//! `xdd-core` knob are all out of scope here; a plan file covers them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use xdd_core::barrier::Barrier;
use xdd_core::config::load_from_path;
use xdd_core::plan::{PlanTarget, PlanCoordinator};
use xdd_core::reporter::{Reporter, TracingReporter};
use xdd_core::supervisor::{LockStepRole, SupervisorHooks, TargetSupervisor};
use xdd_core::target::E2ERole;
use xdd_core::transport::header::HEADER_LEN;
use xdd_core::transport::tcp::TcpTransport;
use xdd_core::transport::{BoundConnection, ControlBlock, E2EChannel, Transport};
use xdd_core::trigger::{StartTrigger, StopTrigger};

#[derive(Parser, Debug)]
#[command(author, version, about = "XDD target/worker transfer engine")]
struct Cli {
    /// Path to the plan TOML file describing every target to run.
    #[arg(short, long, value_name = "FILE", default_value = "plan.toml")]
    plan: PathBuf,

    /// Override the plan's configured pass count.
    #[arg(long)]
    passes: Option<u32>,

    /// Override the plan's configured heartbeat interval, in seconds.
    #[arg(long)]
    heartbeat_secs: Option<f64>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let mut plan = match load_from_path(&cli.plan) {
        Ok(plan) => plan,
        Err(err) => {
            error!(%err, "failed to load plan");
            std::process::exit(err.exit_code());
        }
    };
    if let Some(passes) = cli.passes {
        plan.config.passes = passes;
    }
    if let Some(secs) = cli.heartbeat_secs {
        plan.config.heartbeat_interval = Some(Duration::from_secs_f64(secs));
    }

    info!(targets = plan.targets.len(), passes = plan.config.passes, "plan loaded");

    let reporter: Arc<dyn Reporter> = Arc::new(TracingReporter);
    let mut plan_targets = Vec::with_capacity(plan.targets.len());
    // Keeps every E2E connection alive until teardown; dropping a
    // `TcpConnection` closes its sockets, which is how the destination
    // observes EOF once every source target has finished.
    let mut open_connections: Vec<Arc<dyn std::any::Any + Send + Sync>> = Vec::new();

    for target_config in plan.targets {
        let restart_path = target_config.restart_file.clone();
        let e2e_role = target_config.options.e2e_role;
        let channel: Option<Arc<dyn E2EChannel>> = if e2e_role == E2ERole::None {
            None
        } else {
            match wire_tcp_channel(&target_config) {
                Ok((channel, keepalive)) => {
                    open_connections.push(keepalive);
                    Some(channel)
                }
                Err(err) => {
                    error!(target = target_config.index, %err, "failed to establish E2E connection");
                    std::process::exit(err.exit_code());
                }
            }
        };

        let hooks = SupervisorHooks {
            start_barrier: Arc::new(Barrier::new("placeholder-start", 1)),
            end_barrier: Arc::new(Barrier::new("placeholder-end", 1)),
            reporter: reporter.clone(),
            start_trigger: StartTrigger::none(),
            stop_trigger: StopTrigger::none(),
            lockstep: None,
            lockstep_role: LockStepRole::None,
        };

        match TargetSupervisor::new(
            target_config,
            channel,
            hooks,
            plan.config.passes,
            plan.config.pass_delay,
        ) {
            Ok(supervisor) => plan_targets.push(PlanTarget { supervisor, restart_path }),
            Err(err) => {
                error!(%err, "failed to bring up target supervisor");
                std::process::exit(err.exit_code());
            }
        }
    }

    let teardown: Box<dyn FnOnce() + Send> = Box::new(move || {
        drop(open_connections);
    });

    if let Err(err) = PlanCoordinator::run(plan.config, plan_targets, reporter, Some(teardown)) {
        error!(%err, "plan exited with an error");
        std::process::exit(err.exit_code());
    }
}

/// Builds a TCP transport channel for one E2E target: connects (source)
/// or accepts (destination) on the target's address table, registers a
/// pool of header-sized buffers for `request_target_buffer`/
/// `receive_target_buffer`, and returns the channel plus a type-erased
/// handle the caller keeps alive until the connection should close.
fn wire_tcp_channel(
    target_config: &xdd_core::target::TargetConfig,
) -> xdd_core::Result<(Arc<dyn E2EChannel>, Arc<dyn std::any::Any + Send + Sync>)> {
    let table = target_config.address_table.as_ref().ok_or_else(|| {
        xdd_core::XddError::Config(format!(
            "target {}: E2E role requires an address_table",
            target_config.index
        ))
    })?;
    let socket_count = table.total_ports() as usize;
    let endpoints: Vec<(String, u16)> = (0..table.total_ports())
        .map(|k| {
            table.worker_endpoint(k).ok_or_else(|| {
                xdd_core::XddError::Config(format!(
                    "target {}: address_table has no entry for socket {k}",
                    target_config.index
                ))
            })
        })
        .collect::<xdd_core::Result<Vec<_>>>()?;

    let transport = Arc::new(TcpTransport::new(ControlBlock {
        socket_count: Some(socket_count),
        ..Default::default()
    }));

    let buffer_size = HEADER_LEN + target_config.access_plan.xfer_size as usize;
    let buffer_count = socket_count.max(1) * 2;
    let mut registered_buffers = Vec::with_capacity(buffer_count);
    for _ in 0..buffer_count {
        let mut boxed = vec![0u8; buffer_size].into_boxed_slice();
        transport.register_buffer(boxed.as_mut_ptr(), buffer_size, 0);
        registered_buffers.push(boxed);
    }

    let connection = match target_config.options.e2e_role {
        E2ERole::Source => transport.connect(&endpoints)?,
        E2ERole::Destination => transport.accept(&endpoints)?,
        E2ERole::None => unreachable!("wire_tcp_channel only called for E2E targets"),
    };

    let bound = Arc::new(BoundConnection::new(transport, connection));
    let channel: Arc<dyn E2EChannel> = bound.clone();
    // `registered_buffers` must outlive every in-flight `TargetBuffer`
    // handed out from the pool; bundling it with `bound` keeps both alive
    // for exactly as long as the caller holds the returned handle.
    let keepalive: Arc<dyn std::any::Any + Send + Sync> = Arc::new((bound, registered_buffers));
    Ok((channel, keepalive))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
