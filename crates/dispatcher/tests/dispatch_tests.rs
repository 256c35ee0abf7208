use std::sync::Arc;
use std::time::Duration;

use hca_dispatcher::{JobSubmitter, SubmissionRequest};
use hca_domain::{
    MessageQueue, MessageType, RunStatus, StatusStore, StatusTracker, TaskKey, TaskStatus,
};
use hca_errors::PipelineError;
use hca_testing_utils::{
    FaultyMessageQueue, MetadataDocumentBuilder, PipelineFixture, IMAGE_BUCKET, RECORD_BUCKET,
};

fn three_well_document() -> MetadataDocumentBuilder {
    MetadataDocumentBuilder::new()
        .with_well("A - 1", 1, 1, &[1, 2], &["DAPI", "FITC"])
        .with_well("A - 2", 1, 2, &[1], &["DAPI", "FITC"])
        .with_well("B - 1", 2, 1, &[1, 2, 3], &["DAPI"])
}

fn submitter(fixture: &PipelineFixture) -> JobSubmitter {
    JobSubmitter::new(
        fixture.config.clone(),
        fixture.blob_store_dyn(),
        fixture.tracker(),
        fixture.queue_dyn(),
    )
}

fn request(fixture: &PipelineFixture, run_id: &str) -> SubmissionRequest {
    SubmissionRequest::from_json(fixture.submission_json("alice", run_id).as_bytes()).unwrap()
}

#[tokio::test]
async fn test_submit_dispatches_one_task_per_well() {
    let fixture = PipelineFixture::new();
    fixture.seed_inputs("plate.xdce", &three_well_document()).await;

    let report = submitter(&fixture)
        .submit(request(&fixture, "alice_1"))
        .await
        .unwrap();

    assert_eq!(report.run_id, "alice_1");
    assert_eq!(report.metadata.key, "plate1/plate.xdce");
    assert_eq!(report.task_ids, vec!["A - 1", "A - 2", "B - 1"]);
    assert_eq!(report.queue_depth.visible, 3);

    let tracker = fixture.tracker();
    let run = tracker.get_run("alice_1").await.unwrap();
    assert_eq!(run.status, RunStatus::Scheduled);
    let tasks = tracker.query_tasks("alice_1").await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Scheduled));

    let rowset = fixture
        .get_text(
            RECORD_BUCKET,
            "analysis_result/alice_1/sub_tasks/B - 1/input/B - 1.csv",
        )
        .await
        .unwrap();
    let lines: Vec<&str> = rowset.lines().collect();
    assert_eq!(
        lines[0],
        "Row_Number,Column_Number,Well_Location,Field_Index,URL_DAPI"
    );
    assert_eq!(lines.len(), 4);
    assert_eq!(
        lines[3],
        "2,1,B - 1,3,file:/mnt/images/plate1/B-1_f3_DAPI.tif"
    );
}

#[tokio::test]
async fn test_dispatch_message_contents() {
    let fixture = PipelineFixture::with_config(|config| {
        config.consolidator.excluded_filename_patterns =
            vec!["Experiment.csv".to_string(), "Image*.csv".to_string()];
    });
    fixture
        .seed_inputs(
            "plate.xdce",
            &MetadataDocumentBuilder::new().with_well("C - 3", 3, 3, &[1], &["DAPI"]),
        )
        .await;
    submitter(&fixture)
        .submit(request(&fixture, "run-msg"))
        .await
        .unwrap();

    let delivery = fixture
        .queue
        .receive(fixture.dispatch_queue(), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    let MessageType::TaskDispatch(message) = delivery.message.message_type else {
        panic!("expected a dispatch message");
    };
    assert_eq!(message.task_id, "C - 3");
    assert_eq!(message.task_key(), &TaskKey::new("run-msg", "C - 3"));
    assert_eq!(message.consolidation_queue_address, "hca-consolidation");
    assert_eq!(message.run_record_bucket, RECORD_BUCKET);
    assert_eq!(
        message.sub_task_record_prefix,
        "analysis_result/run-msg/sub_tasks/"
    );
    assert_eq!(
        message.final_output_prefix,
        "analysis_result/run-msg/consolidated_results/"
    );
    assert_eq!(
        message.output_prefix,
        "analysis_result/run-msg/sub_tasks/C - 3/output/"
    );
    assert_eq!(message.pipeline_location.key, "cp/measure.cppipe");
    assert_eq!(message.excluded_filename_patterns.len(), 2);
}

#[tokio::test]
async fn test_missing_metadata_aborts_without_side_effects() {
    let fixture = PipelineFixture::new();
    fixture
        .put_text("pipelines", "cp/measure.cppipe", "pipeline")
        .await;
    // 子目录中的元数据不参与定位
    fixture
        .put_text(IMAGE_BUCKET, "plate1/old/plate.xdce", &three_well_document().build())
        .await;

    let err = submitter(&fixture)
        .submit(request(&fixture, "run-none"))
        .await
        .unwrap_err();
    match err {
        PipelineError::ValidationError(message) => {
            assert!(message.contains('1'));
            assert!(message.contains('0'));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(fixture.status_store.get_run("run-none").await.unwrap().is_none());
    assert_eq!(
        fixture.queue.depth(fixture.dispatch_queue()).await.unwrap().total(),
        0
    );
    assert!(fixture.blob_store.keys(RECORD_BUCKET).await.is_empty());
}

#[tokio::test]
async fn test_multiple_metadata_files_rejected() {
    let fixture = PipelineFixture::new();
    fixture.seed_inputs("a.xdce", &three_well_document()).await;
    fixture.seed_inputs("b.xdce", &three_well_document()).await;

    let err = submitter(&fixture)
        .submit(request(&fixture, "run-two"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ValidationError(ref m) if m.contains('2')));
    assert!(fixture.status_store.get_run("run-two").await.unwrap().is_none());
    assert!(fixture
        .status_store
        .query_tasks("run-two")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_malformed_metadata_aborts_before_run_record() {
    let fixture = PipelineFixture::new();
    fixture
        .put_text(IMAGE_BUCKET, "plate1/plate.xdce", "<Images><Image filename=\"x\">")
        .await;

    let err = submitter(&fixture)
        .submit(request(&fixture, "run-bad"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::MetadataParse(_)));
    assert!(fixture.status_store.get_run("run-bad").await.unwrap().is_none());
}

#[tokio::test]
async fn test_metadata_without_images_rejected() {
    let fixture = PipelineFixture::new();
    fixture
        .seed_inputs("plate.xdce", &MetadataDocumentBuilder::new())
        .await;

    let err = submitter(&fixture)
        .submit(request(&fixture, "run-empty"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ValidationError(_)));
    assert!(fixture.status_store.get_run("run-empty").await.unwrap().is_none());
    assert_eq!(
        fixture.queue.depth(fixture.dispatch_queue()).await.unwrap().total(),
        0
    );
}

#[tokio::test]
async fn test_resubmitting_existing_run_id_rejected() {
    let fixture = PipelineFixture::new();
    fixture.seed_inputs("plate.xdce", &three_well_document()).await;
    let submitter = submitter(&fixture);
    submitter.submit(request(&fixture, "run-x")).await.unwrap();

    let tracker = fixture.tracker();
    let key = TaskKey::new("run-x", "A - 1");
    tracker.finalize_task(&key, TaskStatus::Finished).await.unwrap();
    tracker.mark_run_running("run-x").await.unwrap();
    assert!(tracker
        .try_transition_run("run-x", RunStatus::Running, RunStatus::Finished)
        .await
        .unwrap());
    let rowset_key = "analysis_result/run-x/sub_tasks/A - 1/input/A - 1.csv";
    fixture.put_text(RECORD_BUCKET, rowset_key, "marker").await;

    let err = submitter
        .submit(request(&fixture, "run-x"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ValidationError(ref m) if m.contains("run-x")));

    assert_eq!(tracker.get_run("run-x").await.unwrap().status, RunStatus::Finished);
    assert_eq!(
        fixture.status_store.get_task(&key).await.unwrap().unwrap().status,
        TaskStatus::Finished
    );
    assert_eq!(
        fixture.get_text(RECORD_BUCKET, rowset_key).await.as_deref(),
        Some("marker")
    );
    assert_eq!(
        fixture.queue.depth(fixture.dispatch_queue()).await.unwrap().visible,
        3
    );
}

#[tokio::test]
async fn test_enqueue_failure_leaves_task_record_without_message() {
    let fixture = PipelineFixture::new();
    fixture.seed_inputs("plate.xdce", &three_well_document()).await;
    let queue = Arc::new(
        FaultyMessageQueue::new(fixture.queue_dyn())
            .with_enqueue_failures(fixture.dispatch_queue(), 1),
    );
    let submitter = JobSubmitter::new(
        fixture.config.clone(),
        fixture.blob_store_dyn(),
        StatusTracker::new(fixture.status_store_dyn()),
        queue,
    );

    let err = submitter
        .submit(request(&fixture, "run-orphan"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::MessageQueue(_)));

    // 清单和任务记录先于入队写入
    let tasks = fixture.status_store.query_tasks("run-orphan").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_id, "A - 1");
    assert!(fixture
        .get_text(RECORD_BUCKET, &tasks[0].input_rowset.key)
        .await
        .is_some());
    assert_eq!(
        fixture.queue.depth(fixture.dispatch_queue()).await.unwrap().total(),
        0
    );
}
