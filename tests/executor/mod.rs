//! Integration tests for request execution
//!
//! These tests drive the executor against a scripted transport and check the
//! admission limit, priority ordering, cancellation and failure handling.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;

use common::{Script, ScriptedTransport};
use resource_fetcher::app::{
    ExecutorConfig, Priority, RequestBuilder, RequestExecutor, RequestSpec, ResultInfo,
    RetryTransient, StringTranslator, WebRequest,
};

type TextRequest = WebRequest<StringTranslator>;

fn text_request(path: &str) -> TextRequest {
    let url = format!("http://fixture.test{}", path);
    WebRequest::new(RequestBuilder::get(&url).unwrap(), StringTranslator)
}

fn executor_with(capacity: usize) -> (Arc<RequestExecutor>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new());
    let config = ExecutorConfig::default().with_max_connections(capacity);
    let executor = RequestExecutor::new(config, transport.clone()).unwrap();
    (Arc::new(executor), transport)
}

/// Queue a request and forward its result to `tx` tagged with `path`
fn submit(
    executor: &RequestExecutor,
    path: &'static str,
    priority: Priority,
    tx: &mpsc::UnboundedSender<(&'static str, ResultInfo<String>)>,
) {
    let tx = tx.clone();
    executor
        .execute_async(
            Arc::new(text_request(path)),
            move |info| {
                let _ = tx.send((path, info));
            },
            priority,
        )
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_capacity() {
    let (executor, transport) = executor_with(3);
    transport.set_delay(Duration::from_millis(30));

    let requests: Vec<_> = (0..12).map(|i| text_request(&format!("/item/{}", i))).collect();
    let results = join_all(requests.iter().map(|r| executor.execute(r))).await;

    assert!(results.iter().all(|info| info.is_status_ok()));
    assert_eq!(transport.performs(), 12);
    assert!(transport.peak() <= 3, "peak was {}", transport.peak());
    assert_eq!(transport.peak(), 3);
    assert_eq!(executor.available_connections(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_execution_respects_capacity() {
    let (executor, transport) = executor_with(2);
    transport.set_delay(Duration::from_millis(20));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let paths = ["/a", "/b", "/c", "/d", "/e", "/f"];
    for path in paths {
        submit(&executor, path, Priority::Normal, &tx);
    }
    for _ in paths {
        let (_, info) = rx.recv().await.unwrap();
        assert!(info.is_status_ok());
    }

    assert!(transport.peak() <= 2);
}

#[tokio::test]
async fn test_priority_scenario() {
    let (executor, transport) = executor_with(2);
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Occupy both workers so the next submissions queue up
    transport.hold();
    submit(&executor, "/blocker-1", Priority::Normal, &tx);
    submit(&executor, "/blocker-2", Priority::Normal, &tx);
    transport.wait_for_in_flight(2).await;

    submit(&executor, "/low-1", Priority::Low, &tx);
    submit(&executor, "/high-1", Priority::High, &tx);
    submit(&executor, "/normal-1", Priority::Normal, &tx);
    submit(&executor, "/high-2", Priority::High, &tx);
    submit(&executor, "/low-2", Priority::Low, &tx);
    assert_eq!(executor.pending(), 5);

    transport.release();
    for _ in 0..7 {
        rx.recv().await.unwrap();
    }

    let started: Vec<_> = transport.log().into_iter().skip(2).collect();
    assert_eq!(
        started,
        vec!["/high-1", "/high-2", "/normal-1", "/low-1", "/low-2"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_in_flight_aborts_transport() {
    let (executor, transport) = executor_with(2);
    transport.script("/slow", Script::WaitForAbort);

    let spec = Arc::new(text_request("/slow"));
    let running = {
        let executor = Arc::clone(&executor);
        let spec = Arc::clone(&spec);
        tokio::spawn(async move { executor.execute(spec.as_ref()).await })
    };

    transport.wait_for_in_flight(1).await;
    assert!(spec.cancel());
    assert!(!spec.cancel());

    let info = running.await.unwrap();
    assert!(info.cancelled);
    assert_eq!(info.response_code, -1);
    assert!(info.result.is_none());
    assert_eq!(transport.aborts(), 1);
    assert_eq!(transport.releases(), 1);
    assert_eq!(transport.remembered_aborts(), 0);
    assert_eq!(executor.available_connections(), 2);
}

#[tokio::test]
async fn test_cancel_while_queued_never_reaches_transport() {
    let (executor, transport) = executor_with(1);
    let (tx, mut rx) = mpsc::unbounded_channel();

    transport.hold();
    submit(&executor, "/blocker", Priority::Normal, &tx);
    transport.wait_for_in_flight(1).await;

    let queued = Arc::new(text_request("/queued"));
    {
        let tx = tx.clone();
        executor
            .execute_async(
                Arc::clone(&queued),
                move |info| {
                    let _ = tx.send(("/queued", info));
                },
                Priority::High,
            )
            .unwrap();
    }
    queued.cancel();
    transport.release();

    let mut cancelled = None;
    for _ in 0..2 {
        let (path, info) = rx.recv().await.unwrap();
        if path == "/queued" {
            cancelled = Some(info);
        }
    }

    let info = cancelled.unwrap();
    assert!(info.cancelled);
    assert_eq!(info.response_code, -1);
    assert_eq!(transport.performs_of("/queued"), 0);
    assert_eq!(transport.aborts(), 0);
}

#[tokio::test]
async fn test_transport_failure_becomes_failed_result() {
    let (executor, transport) = executor_with(2);
    transport.script("/down", Script::Fail);

    let info = executor.execute(&text_request("/down")).await;

    assert_eq!(info.response_code, -1);
    assert!(info.response_message.is_none());
    assert!(info.result.is_none());
    assert!(!info.cancelled);
    assert_eq!(executor.available_connections(), 2);
}

#[tokio::test]
async fn test_http_error_status_is_reported() {
    let (executor, transport) = executor_with(2);
    transport.script(
        "/gone",
        Script::Respond {
            status: 410,
            body: b"gone".to_vec(),
        },
    );

    let info = executor.execute(&text_request("/gone")).await;

    assert_eq!(info.response_code, 410);
    assert!(!info.is_status_ok());
    assert_eq!(info.result.as_deref(), Some("gone"));
}

#[tokio::test]
async fn test_retry_policy_allows_exactly_one_retry() {
    let transport = Arc::new(ScriptedTransport::new());
    let executor = RequestExecutor::with_retry_policy(
        ExecutorConfig::default(),
        transport.clone(),
        RetryTransient,
    )
    .unwrap();

    transport.script("/flaky", Script::TimeOut(1));
    let info = executor.execute(&text_request("/flaky")).await;
    assert!(info.is_status_ok());
    assert_eq!(transport.performs_of("/flaky"), 2);

    transport.script("/broken", Script::TimeOut(5));
    let info = executor.execute(&text_request("/broken")).await;
    assert_eq!(info.response_code, -1);
    assert_eq!(transport.performs_of("/broken"), 2);
}

#[tokio::test]
async fn test_default_policy_does_not_retry() {
    let (executor, transport) = executor_with(2);
    transport.script("/flaky", Script::TimeOut(1));

    let info = executor.execute(&text_request("/flaky")).await;
    assert_eq!(info.response_code, -1);
    assert_eq!(transport.performs(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_growing_capacity_admits_more_work() {
    let (executor, transport) = executor_with(1);
    executor.set_max_connections(4).await.unwrap();
    assert_eq!(executor.max_connections(), 4);

    transport.set_delay(Duration::from_millis(30));
    let requests: Vec<_> = (0..4).map(|i| text_request(&format!("/grow/{}", i))).collect();
    join_all(requests.iter().map(|r| executor.execute(r))).await;

    assert_eq!(transport.peak(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shrinking_capacity_waits_for_in_flight_work() {
    let (executor, transport) = executor_with(3);
    transport.hold();

    let specs: Vec<_> = (0..3)
        .map(|i| Arc::new(text_request(&format!("/shrink/{}", i))))
        .collect();
    let running: Vec<_> = specs
        .iter()
        .map(|spec| {
            let executor = Arc::clone(&executor);
            let spec = Arc::clone(spec);
            tokio::spawn(async move { executor.execute(spec.as_ref()).await })
        })
        .collect();
    transport.wait_for_in_flight(3).await;

    let resize = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.set_max_connections(1).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!resize.is_finished());

    transport.release();
    for handle in running {
        assert!(handle.await.unwrap().is_status_ok());
    }
    resize.await.unwrap().unwrap();
    assert_eq!(executor.max_connections(), 1);
    assert_eq!(executor.available_connections(), 1);
}

#[tokio::test]
async fn test_shutdown_drops_queued_work() {
    let (executor, transport) = executor_with(1);
    let (tx, mut rx) = mpsc::unbounded_channel();

    transport.hold();
    submit(&executor, "/running", Priority::Normal, &tx);
    transport.wait_for_in_flight(1).await;
    submit(&executor, "/queued", Priority::Normal, &tx);

    executor.shutdown();
    let (path, info) = rx.recv().await.unwrap();
    assert_eq!(path, "/queued");
    assert!(info.cancelled);

    transport.release();
    let (path, info) = rx.recv().await.unwrap();
    assert_eq!(path, "/running");
    assert!(info.is_status_ok());
    assert_eq!(transport.performs_of("/queued"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_fails_requests_waiting_for_a_connection() {
    let (executor, transport) = executor_with(1);

    transport.hold();
    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(&text_request("/running")).await })
    };
    transport.wait_for_in_flight(1).await;
    let waiting = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(&text_request("/waiting")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());

    executor.shutdown();
    let info = waiting.await.unwrap();
    assert!(info.cancelled);
    assert_eq!(info.response_code, -1);

    transport.release();
    let info = running.await.unwrap();
    assert_eq!(info.result.as_deref(), Some("/running"));
    assert_eq!(transport.performs_of("/waiting"), 0);
}
