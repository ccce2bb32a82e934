use crate::integration::infrastructure::{DaemonBehavior, NodeTestHarness};
use anyhow::Result;
use node_harness::{
    ApiEndpoint, FnProbe, HarnessError, NodeEnv, NormalMode, ProcessHandle, Query, QueryTarget,
    RunMode,
};

/// `archive info` fields of a snapshot file
#[tokio::test]
async fn test_archive_fields() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let snapshot = harness.temp_path().join("snapshot.car.zst");
    std::fs::write(&snapshot, b"not really a car file")?;
    let query = Query::new(harness.cli());

    assert_eq!(query.epoch(&snapshot).await?, "4242");
    assert_eq!(query.state_roots(&snapshot).await?, "900");
    assert_eq!(query.car_format(&snapshot).await?, "v2");
    Ok(())
}

/// A failing inspection command surfaces its exit status and stderr
#[tokio::test]
async fn test_missing_artifact_fails() -> Result<()> {
    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let query = Query::new(harness.cli());
    let missing = harness.temp_path().join("missing.car");

    let err = query.epoch(&missing).await.unwrap_err();
    match err {
        HarnessError::QueryExecutionFailed { command, stderr, .. } => {
            assert_eq!(command, "archive info");
            assert!(stderr.contains("no such archive"), "stderr was: {stderr}");
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

/// Instance queries reach the node through its API info
#[tokio::test]
async fn test_instance_query() -> Result<()> {
    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let mut controller = harness.controller();
    let env = controller
        .start(
            &RunMode::Normal(NormalMode::default()),
            &mut FnProbe(|_: &ProcessHandle| true),
        )
        .await?;
    let query = Query::new(harness.cli());

    let epoch = query.query(QueryTarget::Instance(&env), &["stats"], "Epoch").await?;
    assert_eq!(epoch, "12345");

    let api = query.query(QueryTarget::Instance(&env), &["stats"], "API").await?;
    assert_eq!(api, env.api_info);

    controller.teardown().await;
    Ok(())
}

/// A label absent from the output is an error, not an empty value
#[tokio::test]
async fn test_missing_label_is_reported() -> Result<()> {
    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let query = Query::new(harness.cli());
    let env = NodeEnv::new("token", &ApiEndpoint::default());

    let err = query
        .query(QueryTarget::Instance(&env), &["stats"], "Height")
        .await
        .unwrap_err();
    match err {
        HarnessError::QueryFieldNotFound { label } => assert_eq!(label, "Height"),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_db_stats() -> Result<()> {
    let harness = NodeTestHarness::new(DaemonBehavior::Cooperative)?;
    let stats = Query::new(harness.cli()).db_stats("calibnet").await?;
    assert!(stats.contains("Database path"));
    Ok(())
}
