//! Cross-crate wiring: the manager assembled with real components against an
//! unreachable bus keeps serving, reports its state, and shuts down cleanly.

use meshtrace_consumer::{ConnectionState, ConsumerConfig};
use meshtrace_pipeline::{ExporterKind, PipelineConfig, TraceManager};
use std::time::Duration;

fn unreachable_consumer() -> ConsumerConfig {
    ConsumerConfig {
        event_bus_url: "redis://127.0.0.1:1/".to_string(),
        ..ConsumerConfig::default()
    }
}

#[tokio::test]
async fn correlation_pipeline_survives_unreachable_bus() {
    let config = PipelineConfig {
        enabled: true,
        exporter_type: ExporterKind::Console,
        consumer: unreachable_consumer(),
        ..PipelineConfig::default()
    };
    let mut manager = TraceManager::new(config);

    // Start must succeed: the registry keeps serving without tracing while
    // the connection manager retries in the background.
    manager.start().await.unwrap();
    assert!(manager.is_running());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let info = manager.info().await;
    assert!(info.enabled);
    assert!(!info.stream_through);
    let consumer = info.consumer.expect("consumer info present");
    assert_eq!(consumer.state, ConnectionState::Failed);
    assert!(consumer.retry_count >= 1);
    let correlator = info.correlator.expect("correlator stats present");
    assert_eq!(correlator.active_traces, 0);
    assert!(info.stats.is_some());

    manager.stop().await;
    assert!(!manager.is_running());
    // Second stop is a no-op.
    manager.stop().await;
}

#[tokio::test]
async fn json_pipeline_creates_no_files_without_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        enabled: true,
        exporter_type: ExporterKind::Json,
        json_output_directory: dir.path().join("out"),
        enable_stats: false,
        consumer: unreachable_consumer(),
        ..PipelineConfig::default()
    };
    let mut manager = TraceManager::new(config);
    manager.start().await.unwrap();
    manager.stop().await;
    assert!(!dir.path().join("out").exists());
}

#[tokio::test]
async fn info_serializes_for_health_endpoints() {
    let config = PipelineConfig {
        enabled: true,
        exporter_type: ExporterKind::Console,
        consumer: unreachable_consumer(),
        ..PipelineConfig::default()
    };
    let mut manager = TraceManager::new(config);
    manager.start().await.unwrap();

    let info = manager.info().await;
    let blob = serde_json::to_value(&info).unwrap();
    assert_eq!(blob["exporter_type"], "console");
    assert_eq!(blob["stream_through"], false);
    assert!(blob["consumer"]["consumer_group"]
        .as_str()
        .unwrap()
        .contains("mcp-mesh-registry-processors"));

    manager.stop().await;
}
