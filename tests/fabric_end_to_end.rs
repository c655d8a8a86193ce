use agent_fabric::agent_fabric_core::{CapabilityAdapter, LocalAdapter};
use agent_fabric::{
    CoordinationEvent, CoordinationPattern, Fabric, FabricConfig, FabricError, ProtocolBridge,
    TranslationError,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn config(node_id: &str) -> FabricConfig {
    let mut config = FabricConfig::default();
    config.fabric.node_id = Some(node_id.to_string());
    config.fabric.invoke_timeout_ms = 2_000;
    config.router.tick_interval_ms = 10;
    config.consensus.round_timeout_ms = 300;
    config
}

fn echo(id: &str, namespace: &str) -> Arc<dyn CapabilityAdapter> {
    Arc::new(
        LocalAdapter::new(id, namespace).with_handler("echo", |payload| async move { Ok(payload) }),
    )
}

#[tokio::test]
async fn short_names_resolve_only_when_unique() {
    let fabric = Fabric::builder(config("n1"))
        .with_adapter(echo("a", "alpha"))
        .with_adapter(echo("b", "beta"))
        .build()
        .await
        .unwrap();
    fabric.start().await;

    match fabric.invoke("echo", json!(1)).await {
        Err(FabricError::Ambiguous { name, candidates }) => {
            assert_eq!(name, "echo");
            assert_eq!(candidates, vec!["alpha:echo", "beta:echo"]);
        }
        other => panic!("expected ambiguity, got {:?}", other),
    }
    assert!(matches!(
        fabric.submit("echo", json!(1), 5, None).await,
        Err(FabricError::Ambiguous { .. })
    ));

    assert_eq!(fabric.invoke("alpha:echo", json!("a")).await.unwrap(), json!("a"));
    assert_eq!(fabric.invoke("beta:echo", json!("b")).await.unwrap(), json!("b"));

    // the same name resolves the same way every time
    for _ in 0..5 {
        assert!(matches!(
            fabric.invoke("echo", Value::Null).await,
            Err(FabricError::Ambiguous { .. })
        ));
    }
    fabric.stop().await;
}

#[tokio::test]
async fn missing_translation_fails_closed() {
    let mut bridge = ProtocolBridge::with_default_translations();
    assert!(bridge.unregister(CoordinationPattern::Mesh, CoordinationPattern::Router));

    let fabric = Fabric::builder(config("n1"))
        .with_adapter(echo("a", "alpha"))
        .with_bridge(bridge)
        .build()
        .await
        .unwrap();
    fabric.start().await;
    fabric.register_local_worker(None).await.unwrap();

    let err = fabric
        .coordinate(
            CoordinationEvent::broadcast_task("alpha:echo", json!(1)),
            CoordinationPattern::Router,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FabricError::Translation(TranslationError::UnsupportedTranslation {
            from: CoordinationPattern::Mesh,
            to: CoordinationPattern::Router,
        })
    ));

    // nothing was queued and the fabric keeps serving
    assert_eq!(fabric.invoke("echo", json!("still here")).await.unwrap(), json!("still here"));
    let outcome = fabric
        .coordinate(
            CoordinationEvent::task_assignment("echo", json!(2)),
            CoordinationPattern::Router,
        )
        .await
        .unwrap();
    assert!(outcome.is_success());
    fabric.stop().await;
}

#[tokio::test]
async fn builds_from_a_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [fabric]
        node_id = "edge-1"
        invoke_timeout_ms = 1000

        [[adapters]]
        id = "search"
        namespace = "web"
        kind = "http"
        endpoint = "http://127.0.0.1:1"
        connect_timeout_ms = 200

        [adapters.reconnect]
        max_attempts = 0

        [consensus]
        algorithm = "simple_majority"
        round_timeout_ms = 250
        "#
    )
    .unwrap();

    let config = FabricConfig::load(file.path()).unwrap();
    let fabric = Fabric::builder(config).build().await.unwrap();
    assert_eq!(fabric.node_id(), "edge-1");
    assert_eq!(
        fabric.consensus().settings().round_timeout,
        Duration::from_millis(250)
    );

    let adapters = fabric.adapters().await;
    assert_eq!(adapters.len(), 1);
    assert_eq!(adapters[0].id, "search");
    assert_eq!(adapters[0].namespace, "web");
    assert!(!adapters[0].connected);

    // an unreachable adapter is reported but does not stop the fabric
    let report = fabric.start().await;
    assert!(report.connected.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "search");
    assert!(fabric.is_running());
    assert!(fabric.discover().await.is_empty());
    fabric.stop().await;
}

#[tokio::test]
async fn invocation_past_its_deadline_is_cancelled_downstream() {
    let adapter = Arc::new(LocalAdapter::new("slow", "slow").with_handler(
        "wait",
        |_payload| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        },
    ));
    let fabric = Fabric::builder(config("n1"))
        .with_adapter(adapter.clone())
        .build()
        .await
        .unwrap();
    fabric.start().await;

    let err = fabric
        .invoke_with_deadline("wait", json!({}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, FabricError::Timeout(_)));
    assert!(err.is_transient());

    for _ in 0..50 {
        if !adapter.cancelled_invocations().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(adapter.cancelled_invocations().await.len(), 1);
    fabric.stop().await;
}
