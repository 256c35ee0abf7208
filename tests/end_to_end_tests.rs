use std::sync::Arc;

use hca_domain::{MessageQueue, RunStatus, TaskStatus};
use hca_pipeline::{AppMode, Application};
use hca_testing_utils::{
    is_monotonic_history, MetadataDocumentBuilder, PipelineFixture, ScriptedAnalysisTool, ToolScript,
    RECORD_BUCKET,
};
use hca_worker::CompletionDetector;
use proptest::prelude::*;
use tokio::sync::broadcast;

const WELLS: [&str; 3] = ["A - 1", "A - 2", "A - 3"];

fn plate() -> MetadataDocumentBuilder {
    WELLS
        .iter()
        .enumerate()
        .fold(MetadataDocumentBuilder::new(), |doc, (i, well)| {
            doc.with_well(well, 1, i as u32 + 1, &[1, 2], &["DAPI", "FITC"])
        })
}

fn measuring_tool() -> ScriptedAnalysisTool {
    ScriptedAnalysisTool::new(ToolScript::Succeed(vec![
        ("m.csv".to_string(), "Well,Nuclei\n{task_id},10\n{task_id},12\n".to_string()),
        ("Experiment.csv".to_string(), "Key,Value\nwell,{task_id}\n".to_string()),
    ]))
}

async fn run_all(
    fixture: &PipelineFixture,
    tool: ScriptedAnalysisTool,
    workers: usize,
) -> hca_pipeline::AppReport {
    let request = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(request.path(), fixture.submission_json("alice", "run-e2e")).unwrap();

    let app = Application::from_parts(
        fixture.config.clone(),
        AppMode::All,
        fixture.queue_dyn(),
        fixture.status_store_dyn(),
        fixture.blob_store_dyn(),
    )
    .with_request(request.path())
    .with_workers(workers)
    .with_tool(Arc::new(tool));

    let (_tx, rx) = broadcast::channel(1);
    app.run(rx).await.unwrap()
}

#[tokio::test]
async fn test_failed_well_fails_run_but_still_consolidates() {
    let fixture = PipelineFixture::new();
    fixture.seed_inputs("plate.xdce", &plate()).await;
    let tool = measuring_tool().with_script("A - 2", ToolScript::NoSentinel);

    let report = run_all(&fixture, tool, 2).await;
    let dispatch = report.dispatch.unwrap();
    assert_eq!(dispatch.run_id, "run-e2e");
    assert_eq!(dispatch.task_ids, WELLS);
    assert_eq!(report.workers.iter().map(|w| w.received).sum::<usize>(), 3);
    assert_eq!(report.consolidator.unwrap().consolidated, 1);

    let tracker = fixture.tracker();
    assert_eq!(tracker.get_run("run-e2e").await.unwrap().status, RunStatus::Failed);
    let statuses: Vec<(String, TaskStatus)> = tracker
        .query_tasks("run-e2e")
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.task_id, t.status))
        .collect();
    assert!(statuses.contains(&("A - 2".to_string(), TaskStatus::Failed)));
    assert!(statuses.contains(&("A - 3".to_string(), TaskStatus::Finished)));

    let combined = fixture
        .get_text(
            RECORD_BUCKET,
            "analysis_result/run-e2e/consolidated_results/combined_m.csv",
        )
        .await
        .unwrap();
    assert_eq!(
        combined.trim_start_matches('\u{feff}'),
        "Well,Nuclei\nA - 1,10\nA - 1,12\nA - 3,10\nA - 3,12\n"
    );
    assert!(fixture
        .get_text(
            RECORD_BUCKET,
            "analysis_result/run-e2e/consolidated_results/combined_Experiment.csv",
        )
        .await
        .is_none());

    assert_eq!(
        fixture.status_store.run_history("run-e2e"),
        vec![RunStatus::Scheduled, RunStatus::Running, RunStatus::Failed]
    );
}

#[tokio::test]
async fn test_rowsets_reference_mounted_images() {
    let fixture = PipelineFixture::new();
    fixture.seed_inputs("plate.xdce", &plate()).await;

    let report = run_all(&fixture, measuring_tool(), 1).await;
    assert_eq!(report.workers[0].finished, 3);

    let rowset = fixture
        .get_text(
            RECORD_BUCKET,
            "analysis_result/run-e2e/sub_tasks/A - 3/input/A - 3.csv",
        )
        .await
        .unwrap();
    let mut reader = csv::Reader::from_reader(rowset.as_bytes());
    let headers = reader.headers().unwrap().clone();
    assert_eq!(
        headers.iter().collect::<Vec<_>>(),
        vec![
            "Row_Number",
            "Column_Number",
            "Well_Location",
            "Field_Index",
            "URL_DAPI",
            "URL_FITC"
        ]
    );
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0][4].starts_with("file:/mnt/images/plate1/"));
    assert_eq!(
        fixture.tracker().get_run("run-e2e").await.unwrap().status,
        RunStatus::Finished
    );
}

#[tokio::test]
async fn test_missing_metadata_dispatches_nothing() {
    let fixture = PipelineFixture::new();
    let request = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(request.path(), fixture.submission_json("alice", "run-none")).unwrap();

    let app = Application::from_parts(
        fixture.config.clone(),
        AppMode::Submit,
        fixture.queue_dyn(),
        fixture.status_store_dyn(),
        fixture.blob_store_dyn(),
    )
    .with_request(request.path());
    let (_tx, rx) = broadcast::channel(1);
    assert!(app.run(rx).await.is_err());

    assert!(fixture.tracker().get_run("run-none").await.is_err());
    assert_eq!(
        fixture.queue.depth(fixture.dispatch_queue()).await.unwrap().total(),
        0
    );
}

async fn finalize_concurrently(
    statuses: Vec<TaskStatus>,
) -> (usize, Vec<RunStatus>, RunStatus) {
    let fixture = PipelineFixture::new();
    let wells: Vec<String> = (0..statuses.len()).map(|i| format!("B - {}", i + 1)).collect();
    let well_refs: Vec<&str> = wells.iter().map(String::as_str).collect();
    let (_run, messages) = fixture.seed_dispatched_run("run-prop", &well_refs).await;

    let mut handles = Vec::new();
    for (message, status) in messages.into_iter().zip(statuses) {
        let tracker = fixture.tracker();
        let detector = CompletionDetector::new(tracker.clone(), fixture.queue_dyn());
        handles.push(tokio::spawn(async move {
            tracker.finalize_task(message.task_key(), status).await.unwrap();
            detector.check(&message).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let consolidations = fixture
        .queue
        .depth(fixture.consolidation_queue())
        .await
        .unwrap()
        .visible as usize;
    let final_status = fixture.tracker().get_run("run-prop").await.unwrap().status;
    (
        consolidations,
        fixture.status_store.run_history("run-prop"),
        final_status,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_concurrent_completion_enqueues_exactly_once(
        failed in proptest::collection::vec(any::<bool>(), 1..8)
    ) {
        let statuses: Vec<TaskStatus> = failed
            .iter()
            .map(|&f| if f { TaskStatus::Failed } else { TaskStatus::Finished })
            .collect();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let (consolidations, history, final_status) =
            runtime.block_on(finalize_concurrently(statuses));

        prop_assert_eq!(consolidations, 1);
        prop_assert!(is_monotonic_history(&history));
        let expected = if failed.iter().any(|&f| f) { RunStatus::Failed } else { RunStatus::Finished };
        prop_assert_eq!(final_status, expected);
    }
}
