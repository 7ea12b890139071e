/*
[INPUT]:  Job store + push gateway + real WebSocket clients
[OUTPUT]: Sweep-before-listener and push delivery verification
[POS]:    Integration test layer - full server-side protocol
[UPDATE]: When changing gateway delivery or recovery ordering
*/

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use docuflow_channel::{ControlFrame, TaskEvent, TaskFrame};
use docuflow_server::recovery::RECOVERY_REASON;
use docuflow_server::{JobRecord, JobStage, JobStore, PushGateway, recover_stuck_jobs};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

type ClientWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct GatewayHarness {
    store: Arc<JobStore>,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

async fn start_gateway() -> GatewayHarness {
    let store = Arc::new(JobStore::in_memory().unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let gateway = PushGateway::new(store.clone(), shutdown.clone());
    tokio::spawn(async move {
        gateway.serve(listener).await;
    });

    GatewayHarness {
        store,
        addr,
        shutdown,
    }
}

async fn connect_client(addr: std::net::SocketAddr) -> ClientWs {
    let (ws, _) = timeout(TEST_TIMEOUT, connect_async(format!("ws://{addr}")))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn subscribe(ws: &mut ClientWs, task_id: &str) {
    let payload = serde_json::to_string(&ControlFrame::subscribe(task_id)).unwrap();
    timeout(TEST_TIMEOUT, ws.send(WsMessage::Text(payload.into())))
        .await
        .expect("send timed out")
        .expect("send failed");
}

/// Read frames until one matches, tolerating heartbeat repeats in between.
async fn next_matching_frame(ws: &mut ClientWs, predicate: impl Fn(&TaskFrame) -> bool) -> TaskFrame {
    loop {
        let message = timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("frame timed out")
            .expect("stream ended")
            .expect("read failed");
        if let WsMessage::Text(text) = message {
            let frame: TaskFrame = serde_json::from_str(&text).expect("frame parses");
            if predicate(&frame) {
                return frame;
            }
        }
    }
}

#[tokio::test]
async fn recovered_job_is_pushed_as_failure_to_subscribers() {
    let harness = start_gateway().await;

    // The sweep already ran before the listener in a real boot; emulate the
    // same ordering here.
    let orphan = JobRecord::new(None, "orphan.pdf");
    harness.store.insert_job(&orphan).unwrap();
    let report = recover_stuck_jobs(&harness.store);
    assert_eq!(report.recovered_count, 1);

    let mut ws = connect_client(harness.addr).await;
    subscribe(&mut ws, &orphan.job_id).await;

    let frame = next_matching_frame(&mut ws, |f| f.event.is_terminal()).await;
    assert_eq!(frame.task_id, orphan.job_id);
    assert_eq!(
        frame.event,
        TaskEvent::Failure {
            error: RECOVERY_REASON.to_string()
        }
    );

    harness.shutdown.cancel();
}

#[tokio::test]
async fn live_job_progress_is_pushed_in_stage_order() {
    let harness = start_gateway().await;

    let job = JobRecord::new(None, "report.pdf");
    harness.store.insert_job(&job).unwrap();

    let mut ws = connect_client(harness.addr).await;
    subscribe(&mut ws, &job.job_id).await;

    let first = next_matching_frame(&mut ws, |f| matches!(f.event, TaskEvent::Step { .. })).await;
    assert_eq!(first.event, TaskEvent::Step { step: 1 });

    harness.store.advance_stage(&job.job_id, JobStage::Embed).unwrap();
    let step = next_matching_frame(
        &mut ws,
        |f| matches!(f.event, TaskEvent::Step { step } if step == 3),
    )
    .await;
    assert_eq!(step.task_id, job.job_id);

    harness.store.mark_success(&job.job_id, "doc-42").unwrap();
    let done = next_matching_frame(&mut ws, |f| f.event.is_terminal()).await;
    match done.event {
        TaskEvent::Success { document, step } => {
            let document = document.expect("document present");
            assert_eq!(document.id, "doc-42");
            assert_eq!(document.redirect_url.as_deref(), Some("/documents/doc-42"));
            assert_eq!(step, Some(7));
        }
        other => panic!("expected success frame, got {other:?}"),
    }

    harness.shutdown.cancel();
}

#[tokio::test]
async fn unsubscribed_task_stops_being_pushed() {
    let harness = start_gateway().await;

    let job = JobRecord::new(None, "report.pdf");
    harness.store.insert_job(&job).unwrap();

    let mut ws = connect_client(harness.addr).await;
    subscribe(&mut ws, &job.job_id).await;
    let _ = next_matching_frame(&mut ws, |f| matches!(f.event, TaskEvent::Step { .. })).await;

    let payload = serde_json::to_string(&ControlFrame::unsubscribe(&job.job_id)).unwrap();
    ws.send(WsMessage::Text(payload.into())).await.unwrap();

    // Give the unsubscribe a poll cycle to land, then verify silence even
    // across a state change.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    harness.store.mark_success(&job.job_id, "doc-1").unwrap();

    let quiet = timeout(Duration::from_secs(3), ws.next()).await;
    assert!(quiet.is_err(), "expected no further frames after unsubscribe");

    harness.shutdown.cancel();
}

mod end_to_end {
    use super::*;
    use docuflow_tracker::{
        BatchContext, DurableTaskStore, ProgressRegistry, SharedPushChannel, TaskInfo, TaskStatus,
        TaskTracker,
    };

    /// Full protocol roundtrip: the real tracker client follows a job from
    /// step to success over the real gateway.
    #[tokio::test]
    async fn tracker_client_follows_job_to_completion() {
        let harness = start_gateway().await;

        let job = JobRecord::new(None, "report.pdf");
        harness.store.insert_job(&job).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ProgressRegistry::new());
        let handle_store =
            Arc::new(DurableTaskStore::open(dir.path().join("pending-tasks.json")).await);
        let channel = SharedPushChannel::new(format!("ws://{}", harness.addr));
        let tracker = Arc::new(TaskTracker::new(
            registry.clone(),
            handle_store.clone(),
            Arc::new(channel.clone()),
        ));

        let batch = Arc::new(BatchContext::new(1));
        let info = TaskInfo {
            task_id: job.job_id.clone(),
            document_id: None,
            file_name: "report.pdf".to_string(),
            batch_index: 1,
        };
        let tracking = tokio::spawn({
            let tracker = tracker.clone();
            let batch = batch.clone();
            async move { tracker.track_task(info, batch, false).await }
        });

        // Drive the pipeline: stages advance, then the job succeeds.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        harness.store.advance_stage(&job.job_id, JobStage::Classify).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        harness.store.mark_success(&job.job_id, "doc-77").unwrap();

        let outcome = timeout(TEST_TIMEOUT, tracking)
            .await
            .expect("tracking timed out")
            .expect("tracking panicked");
        assert!(outcome.is_success());
        assert_eq!(outcome.batch_index(), 1);

        let tracked = registry.get_task(&job.job_id).await.expect("task visible");
        assert_eq!(tracked.status, TaskStatus::Success);
        assert_eq!(tracked.progress_percent, 100);
        assert_eq!(tracked.document_id.as_deref(), Some("doc-77"));

        // Terminal resolution cleared the durable handle.
        assert!(handle_store.load_tasks().await.is_empty());
        assert_eq!(batch.first_document_id().await, Some("doc-77".to_string()));

        channel.shutdown().await;
        harness.shutdown.cancel();
    }
}
