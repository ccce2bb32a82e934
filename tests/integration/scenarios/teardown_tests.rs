use crate::integration::infrastructure::{
    assert_process_gone, assert_within, pid_alive, DaemonBehavior, NodeTestHarness,
};
use anyhow::Result;
use node_harness::{
    ControllerConfig, Executable, FnProbe, HarnessError, LifecycleState, NormalMode, ProcessHandle, RunMode,
    ShutdownCommand, TeardownOutcome,
};
use std::time::{Duration, Instant};

fn normal() -> RunMode {
    RunMode::Normal(NormalMode::default())
}

fn ready_on_token() -> FnProbe<impl FnMut(&ProcessHandle) -> bool + Send> {
    FnProbe(|_: &ProcessHandle| true)
}

/// Cooperative node: shutdown request, exit within grace, diagnostics on disk
#[tokio::test]
async fn test_graceful_teardown() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let mut controller = harness.controller();
    controller.start(&normal(), &mut ready_on_token()).await?;
    let pid = harness.recorded_pid()?;

    let report = controller.teardown().await;

    assert_eq!(report.outcome, TeardownOutcome::Graceful);
    assert!(report.is_clean(), "unexpected warnings: {:?}", report.warnings);
    assert!(harness.shutdown_marker().exists());
    assert_process_gone(pid, "after graceful teardown");
    assert_eq!(controller.state(), LifecycleState::Terminated);
    assert!(controller.node_env().is_none());

    let bundle = report.diagnostics.expect("diagnostics collected before shutdown");
    assert!(bundle.render().contains("node starting"));
    assert!(harness.work_dir().join("diagnostics").join("diagnostics.txt").exists());
    Ok(())
}

/// Teardown twice: the second call has nothing to do
#[tokio::test]
async fn test_teardown_is_idempotent() -> Result<()> {
    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let mut controller = harness.controller();
    controller.start(&normal(), &mut ready_on_token()).await?;

    let first = controller.teardown().await;
    assert_eq!(first.outcome, TeardownOutcome::Graceful);

    let second = controller.teardown().await;
    assert_eq!(second.outcome, TeardownOutcome::Skipped);
    assert!(second.diagnostics.is_none());
    assert_eq!(controller.state(), LifecycleState::Terminated);
    Ok(())
}

/// A node that already exited is not sent a shutdown request
#[tokio::test]
async fn test_exited_node_needs_no_shutdown() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = NodeTestHarness::new(DaemonBehavior::ExitsAfterStart)?;
    let mut controller = harness.controller();
    controller.start(&normal(), &mut ready_on_token()).await?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.is_node_alive() {
        assert!(Instant::now() < deadline, "fake daemon should exit on its own");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = controller.teardown().await;
    assert_eq!(report.outcome, TeardownOutcome::ExitedOnItsOwn);
    assert!(report.is_clean());
    assert!(report.diagnostics.is_none(), "successful run, no dump for an exited node");
    assert!(!harness.shutdown_marker().exists());
    Ok(())
}

/// A node ignoring SIGTERM is killed after the grace period, with a warning
#[tokio::test]
async fn test_stubborn_node_is_force_killed() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = NodeTestHarness::new(DaemonBehavior::IgnoresSigterm)?;
    let grace = Duration::from_millis(500);
    let mut controller = harness.controller_with(ControllerConfig {
        grace_period: grace,
        ..harness.controller_config()
    });
    controller.start(&normal(), &mut ready_on_token()).await?;
    let pid = harness.recorded_pid()?;

    let started = Instant::now();
    let report = controller.teardown().await;
    let elapsed = started.elapsed();

    assert_eq!(report.outcome, TeardownOutcome::Forced);
    assert!(matches!(
        report.warnings.as_slice(),
        [HarnessError::ShutdownTimeout { .. }]
    ));
    assert!(report.warnings.iter().all(HarnessError::is_teardown_warning));
    assert!(elapsed >= grace, "SIGKILL sent before the grace period ran out");
    assert_within(elapsed, grace + Duration::from_secs(3), "forced teardown");
    assert_process_gone(pid, "after SIGKILL");
    Ok(())
}

/// Surviving the kill timeout is reported as a leak, not an error
#[tokio::test]
async fn test_node_outliving_kill_timeout_is_reported_as_leak() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = NodeTestHarness::new(DaemonBehavior::IgnoresSigterm)?;
    let mut controller = harness.controller_with(ControllerConfig {
        grace_period: Duration::from_millis(200),
        kill_timeout: Duration::ZERO,
        ..harness.controller_config()
    });
    controller.start(&normal(), &mut ready_on_token()).await?;

    let report = controller.teardown().await;

    assert_eq!(report.outcome, TeardownOutcome::Leaked);
    assert!(matches!(
        report.warnings.as_slice(),
        [
            HarnessError::ShutdownTimeout { .. },
            HarnessError::TeardownLeak { .. }
        ]
    ));
    assert!(!report.is_clean());
    assert_eq!(controller.state(), LifecycleState::Terminated);
    Ok(())
}

/// A shutdown command that hangs does not eat into the SIGTERM grace period
#[tokio::test]
async fn test_hung_shutdown_command_leaves_grace_for_sigterm() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = NodeTestHarness::new(DaemonBehavior::SlowToExit)?;
    let mut controller = harness.controller_with(ControllerConfig {
        grace_period: Duration::from_secs(1),
        shutdown: Some(ShutdownCommand::with_args(Executable::new("sleep"), ["5"])),
        ..harness.controller_config()
    });
    controller.start(&normal(), &mut ready_on_token()).await?;
    let pid = harness.recorded_pid()?;

    let report = controller.teardown().await;

    assert_eq!(report.outcome, TeardownOutcome::Graceful);
    assert!(report.is_clean(), "unexpected warnings: {:?}", report.warnings);
    assert_process_gone(pid, "after the SIGTERM fallback");
    Ok(())
}

/// A failing shutdown command falls back to SIGTERM
#[tokio::test]
async fn test_failed_shutdown_command_falls_back_to_sigterm() -> Result<()> {
    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let mut controller = harness.controller_with(ControllerConfig {
        shutdown: Some(ShutdownCommand::with_args(harness.cli(), ["bogus"])),
        ..harness.controller_config()
    });
    controller.start(&normal(), &mut ready_on_token()).await?;
    let pid = harness.recorded_pid()?;

    let report = controller.teardown().await;

    assert_eq!(report.outcome, TeardownOutcome::Graceful);
    assert!(!harness.shutdown_marker().exists());
    assert_process_gone(pid, "after SIGTERM fallback");
    Ok(())
}

/// Dropping a controller with a live node still stops it
#[tokio::test]
async fn test_drop_stops_live_node() -> Result<()> {
    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let mut controller = harness.controller();
    controller.start(&normal(), &mut ready_on_token()).await?;
    let pid = harness.recorded_pid()?;
    assert!(pid_alive(pid));

    drop(controller);

    assert_process_gone(pid, "after the controller was dropped");
    Ok(())
}
