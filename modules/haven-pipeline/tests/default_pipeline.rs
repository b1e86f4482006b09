//! End-to-end runs of the default pipeline over stub services.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use haven_events::{EventBus, EventType, HistoryFilter};
use haven_pipeline::testing::{ScriptedUploader, StubAnalyzer, StubCipher, StubInspector, StubSyncer};
use haven_pipeline::{
    PipelineBuilder, PipelineContext, PipelineManager, PipelineServices, UploadClient,
};

fn media_file(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("vid_1.mp4");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(b"pretend this is mp4").unwrap();
    path
}

fn build_pipeline(uploader: Arc<dyn UploadClient>) -> (PipelineManager, EventBus) {
    let bus = EventBus::new();
    bus.enable_history(1000);
    let services = PipelineServices {
        inspector: Arc::new(StubInspector::default()),
        analyzer: Arc::new(StubAnalyzer),
        cipher: Arc::new(StubCipher::default()),
        uploader,
        syncer: Arc::new(StubSyncer::default()),
    };
    let manager = PipelineBuilder::new(services, bus.clone())
        .with_default_steps()
        .build();
    (manager, bus)
}

fn step_events(bus: &EventBus) -> Vec<(EventType, String)> {
    bus.history(HistoryFilter::default())
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                EventType::StepStarted
                    | EventType::StepComplete
                    | EventType::StepFailed
                    | EventType::StepSkipped
                    | EventType::PipelineComplete
                    | EventType::PipelineFailed
            )
        })
        .map(|e| {
            let step = e
                .payload
                .get("step_name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            (e.event_type, step)
        })
        .collect()
}

#[tokio::test]
async fn happy_path_with_default_toggles() {
    let dir = tempfile::tempdir().unwrap();
    let path = media_file(&dir);
    let (manager, bus) = build_pipeline(Arc::new(ScriptedUploader::new("bafyQ")));

    let mut ctx = PipelineContext::new(&path);
    let result = manager.process(&mut ctx).await;

    assert!(result.success);
    assert_eq!(result.final_content_id.as_deref(), Some("bafyQ"));

    // Default toggles: analyze/encrypt/sync skipped, ingest and upload run.
    let expected = vec![
        (EventType::StepStarted, "ingest".to_string()),
        (EventType::StepComplete, "ingest".to_string()),
        (EventType::StepSkipped, "analyze".to_string()),
        (EventType::StepSkipped, "encrypt".to_string()),
        (EventType::StepStarted, "upload".to_string()),
        (EventType::StepComplete, "upload".to_string()),
        (EventType::StepSkipped, "sync".to_string()),
        (EventType::PipelineComplete, "".to_string()),
    ];
    assert_eq!(step_events(&bus), expected);

    // All events belong to this context.
    assert!(bus
        .history(HistoryFilter::default())
        .iter()
        .all(|e| e.correlation_id == Some(ctx.correlation_id())));
}

#[tokio::test]
async fn transient_upload_failure_retries_to_success() {
    let dir = tempfile::tempdir().unwrap();
    let path = media_file(&dir);
    let uploader = Arc::new(ScriptedUploader::new("bafyQ").with_failure("503 unavailable"));
    let bus = EventBus::new();
    bus.enable_history(1000);
    let services = PipelineServices {
        inspector: Arc::new(StubInspector::default()),
        analyzer: Arc::new(StubAnalyzer),
        cipher: Arc::new(StubCipher::default()),
        uploader: uploader.clone(),
        syncer: Arc::new(StubSyncer::default()),
    };
    // Shrink the upload backoff so the retry happens quickly.
    let manager = PipelineBuilder::new(services, bus.clone())
        .with_ingest()
        .with_step(Arc::new(
            haven_pipeline::steps::UploadStep::new(uploader.clone(), bus.clone(), true)
                .with_retry_delay(Duration::from_millis(20)),
        ))
        .build();

    let started = std::time::Instant::now();
    let mut ctx = PipelineContext::new(&path);
    let result = manager.process(&mut ctx).await;

    assert!(result.success);
    let upload = result.step_result("upload").unwrap();
    assert_eq!(upload.attempts, 2);
    assert_eq!(uploader.calls(), 2);
    // Total backoff is at least the base delay.
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(result.final_content_id.as_deref(), Some("bafyQ"));
}

#[tokio::test]
async fn fatal_ingest_error_halts_everything() {
    let (manager, bus) = build_pipeline(Arc::new(ScriptedUploader::new("bafyQ")));

    // Source path does not exist: ingest fails fatally.
    let mut ctx = PipelineContext::new("/nowhere/vid_1.mp4");
    let result = manager.process(&mut ctx).await;

    assert!(!result.success);
    assert_eq!(result.step_results.len(), 1);
    assert_eq!(result.step_results[0].step_name, "ingest");

    let started: Vec<String> = bus
        .history(HistoryFilter {
            event_type: Some(EventType::StepStarted),
            ..Default::default()
        })
        .iter()
        .map(|e| e.payload["step_name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(started, vec!["ingest"]);
}

#[tokio::test]
async fn batch_respects_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _bus) = build_pipeline(Arc::new(ScriptedUploader::new("bafyQ")));

    let mut contexts = Vec::new();
    for n in 0..6 {
        let path = dir.path().join(format!("vid_{n}.mp4"));
        std::fs::write(&path, b"media").unwrap();
        contexts.push(PipelineContext::new(path));
    }
    let expected: Vec<String> = contexts
        .iter()
        .map(|c| c.source_path.display().to_string())
        .collect();

    let results = manager.process_batch(contexts).await;

    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.success));
    let got: Vec<String> = results.iter().map(|r| r.source_path.clone()).collect();
    assert_eq!(got, expected);
}
