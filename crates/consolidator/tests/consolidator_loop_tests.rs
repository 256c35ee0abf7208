use std::sync::Arc;
use std::time::Duration;

use hca_consolidator::ConsolidatorLoop;
use hca_domain::{ConsolidationMessage, DispatchMessage, Message, MessageQueue};
use hca_testing_utils::{FlakyBlobStore, PipelineFixture, RECORD_BUCKET};
use tokio::sync::broadcast;

const SUB_TASKS: &str = "analysis_result/run-1/sub_tasks/";
const COMBINED: &str = "analysis_result/run-1/consolidated_results/";

async fn seed_outputs(fixture: &PipelineFixture) -> Vec<DispatchMessage> {
    let (_run, messages) = fixture
        .seed_dispatched_run("run-1", &["A - 1", "B - 1"])
        .await;
    for (well, count) in [("A - 1", 4), ("B - 1", 9)] {
        fixture
            .put_text(
                RECORD_BUCKET,
                &format!("{SUB_TASKS}{well}/output/Nuclei.csv"),
                &format!("ImageNumber,Well,Count\n1,{well},{count}\n"),
            )
            .await;
        fixture
            .put_text(
                RECORD_BUCKET,
                &format!("{SUB_TASKS}{well}/output/Experiment.csv"),
                "Key,Value\nRun_Timestamp,now\n",
            )
            .await;
    }
    messages
}

async fn enqueue_consolidation(fixture: &PipelineFixture, message: ConsolidationMessage) {
    fixture
        .queue
        .enqueue(fixture.consolidation_queue(), &Message::consolidation(message))
        .await
        .unwrap();
}

fn consolidator(fixture: &PipelineFixture) -> ConsolidatorLoop {
    ConsolidatorLoop::builder("consolidator-1", fixture.queue_dyn(), fixture.blob_store_dyn())
        .with_config(&fixture.config)
        .build()
}

#[tokio::test]
async fn test_consolidates_run_outputs() {
    let fixture = PipelineFixture::new();
    let messages = seed_outputs(&fixture).await;
    enqueue_consolidation(&fixture, messages[0].consolidation_message()).await;

    let (_tx, rx) = broadcast::channel(1);
    let summary = consolidator(&fixture).run(rx).await;
    assert_eq!(summary.received, 1);
    assert_eq!(summary.consolidated, 1);

    let combined = fixture
        .get_text(RECORD_BUCKET, &format!("{COMBINED}combined_Nuclei.csv"))
        .await
        .unwrap();
    assert_eq!(
        combined.trim_start_matches('\u{feff}'),
        "ImageNumber,Well,Count\n1,A - 1,4\n1,B - 1,9\n"
    );
    assert!(fixture
        .get_text(RECORD_BUCKET, &format!("{COMBINED}combined_Experiment.csv"))
        .await
        .is_none());
    // 输入清单不在 output 目录下
    assert!(fixture
        .get_text(RECORD_BUCKET, &format!("{COMBINED}combined_A - 1.csv"))
        .await
        .is_none());
    assert_eq!(
        fixture
            .queue
            .depth(fixture.consolidation_queue())
            .await
            .unwrap()
            .total(),
        0
    );
}

#[tokio::test]
async fn test_repeated_consolidation_overwrites() {
    let fixture = PipelineFixture::new();
    let messages = seed_outputs(&fixture).await;
    enqueue_consolidation(&fixture, messages[0].consolidation_message()).await;
    enqueue_consolidation(&fixture, messages[1].consolidation_message()).await;

    let (_tx, rx) = broadcast::channel(1);
    let summary = consolidator(&fixture).run(rx).await;
    assert_eq!(summary.consolidated, 2);

    let combined = fixture
        .get_text(RECORD_BUCKET, &format!("{COMBINED}combined_Nuclei.csv"))
        .await
        .unwrap();
    assert_eq!(combined.lines().count(), 3);
}

#[tokio::test]
async fn test_failed_consolidation_stays_on_queue() {
    let fixture = PipelineFixture::with_config(|config| {
        config.message_queue.visibility_timeout_seconds = 1;
        config.message_queue.redelivery_delay_seconds = 1;
    });
    let messages = seed_outputs(&fixture).await;
    enqueue_consolidation(&fixture, messages[0].consolidation_message()).await;

    let broken = Arc::new(
        FlakyBlobStore::new(fixture.blob_store_dyn()).with_failing_key("B - 1/output/Nuclei.csv"),
    );
    let failing = ConsolidatorLoop::builder("consolidator-1", fixture.queue_dyn(), broken)
        .with_config(&fixture.config)
        .build();
    let (_tx, rx) = broadcast::channel(1);
    let summary = failing.run(rx).await;
    assert_eq!(summary.unacknowledged, 1);
    assert_eq!(
        fixture
            .queue
            .depth(fixture.consolidation_queue())
            .await
            .unwrap()
            .in_flight,
        1
    );
    assert!(fixture
        .get_text(RECORD_BUCKET, &format!("{COMBINED}combined_Nuclei.csv"))
        .await
        .is_none());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let (_tx, rx) = broadcast::channel(1);
    let summary = consolidator(&fixture).run(rx).await;
    assert_eq!(summary.consolidated, 1);
    assert!(fixture
        .get_text(RECORD_BUCKET, &format!("{COMBINED}combined_Nuclei.csv"))
        .await
        .is_some());
}

#[tokio::test]
async fn test_dispatch_messages_are_dropped() {
    let fixture = PipelineFixture::new();
    let messages = seed_outputs(&fixture).await;
    fixture
        .queue
        .enqueue(
            fixture.consolidation_queue(),
            &Message::task_dispatch(messages[0].clone()),
        )
        .await
        .unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let summary = consolidator(&fixture).run(rx).await;
    assert_eq!(summary.received, 1);
    assert_eq!(summary.consolidated, 0);
    assert_eq!(
        fixture
            .queue
            .depth(fixture.consolidation_queue())
            .await
            .unwrap()
            .total(),
        0
    );
}

#[tokio::test]
async fn test_long_poll_consolidator_stops_on_shutdown() {
    let fixture = PipelineFixture::with_config(|config| {
        config.consolidator.mode = hca_config::ConsumerMode::LongPoll;
    });
    let consolidator = consolidator(&fixture);
    let (tx, rx) = broadcast::channel(1);

    let (summary, _) = tokio::join!(consolidator.run(rx), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
    });
    assert_eq!(summary.received, 0);
}

#[tokio::test]
async fn test_failed_consolidation_is_returned_after_redelivery_delay() {
    let fixture = PipelineFixture::new();
    let messages = seed_outputs(&fixture).await;
    enqueue_consolidation(&fixture, messages[0].consolidation_message()).await;

    let broken = Arc::new(
        FlakyBlobStore::new(fixture.blob_store_dyn()).with_failing_key("B - 1/output/Nuclei.csv"),
    );
    let failing = ConsolidatorLoop::builder("consolidator-1", fixture.queue_dyn(), broken)
        .with_config(&fixture.config)
        .redelivery_delay(Duration::ZERO)
        .max_messages(Some(1))
        .build();
    let (_tx, rx) = broadcast::channel(1);
    let summary = failing.run(rx).await;
    assert_eq!(summary.unacknowledged, 1);

    let depth = fixture
        .queue
        .depth(fixture.consolidation_queue())
        .await
        .unwrap();
    assert_eq!(depth.visible, 1);
    assert_eq!(depth.in_flight, 0);

    let (_tx, rx) = broadcast::channel(1);
    assert_eq!(consolidator(&fixture).run(rx).await.consolidated, 1);
}
