//! Integration tests for the keyed download cache
//!
//! Downloads go through a real executor backed by the scripted transport, and
//! files land in a temporary cache directory.

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use common::{Script, ScriptedTransport};
use resource_fetcher::app::{
    CacheConfig, CacheOutcome, ExecutorConfig, KeyedDownloadCache, Priority, RequestBuilder,
    RequestExecutor,
};
use resource_fetcher::errors::CacheError;

struct Fixture {
    cache: Arc<KeyedDownloadCache>,
    executor: Arc<RequestExecutor>,
    transport: Arc<ScriptedTransport>,
    temp_dir: TempDir,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_config(|config| config).await
    }

    async fn with_config(adjust: impl FnOnce(CacheConfig) -> CacheConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let executor = Arc::new(
            RequestExecutor::new(
                ExecutorConfig::default().with_max_connections(4),
                transport.clone(),
            )
            .unwrap(),
        );
        let config = adjust(CacheConfig::named("tiles").with_cache_root(temp_dir.path()));
        let cache = KeyedDownloadCache::new(config, Arc::clone(&executor))
            .await
            .unwrap();

        Self {
            cache: Arc::new(cache),
            executor,
            transport,
            temp_dir,
        }
    }

    /// A second cache instance over the same directory and executor
    async fn reopen(&self) -> KeyedDownloadCache {
        let config = self.cache.config().clone();
        KeyedDownloadCache::new(config, Arc::clone(&self.executor))
            .await
            .unwrap()
    }
}

fn request(path: &str) -> RequestBuilder {
    RequestBuilder::get(&format!("http://tiles.test{}", path)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_share_one_download() {
    let fixture = Fixture::new().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    fixture.transport.hold();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tx = tx.clone();
            fixture
                .cache
                .get(request("/data/a.json"), false, Priority::Normal, move |outcome| {
                    let _ = tx.send(outcome);
                })
                .unwrap()
        })
        .collect();
    assert!(fixture.cache.is_downloading(&request("/data/a.json")));
    assert!(handles.iter().all(|handle| !handle.is_completed()));
    fixture.transport.release();

    let mut outcomes = Vec::new();
    for _ in 0..8 {
        outcomes.push(rx.recv().await.unwrap());
    }

    assert_eq!(fixture.transport.performs_of("/data/a.json"), 1);
    assert!(outcomes.iter().all(|outcome| outcome == &outcomes[0]));
    let path = outcomes[0].path().unwrap().to_path_buf();
    assert_eq!(path.extension().unwrap(), "json");
    assert!(path.starts_with(fixture.temp_dir.path()));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "/data/a.json");
    assert!(!fixture.cache.is_downloading(&request("/data/a.json")));
}

#[tokio::test]
async fn test_hit_is_delivered_before_get_returns() {
    let fixture = Fixture::new().await;
    fixture
        .cache
        .get_and_wait(request("/tile/1.png"), false)
        .await
        .unwrap();

    let delivered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&delivered);
    let handle = fixture
        .cache
        .get(request("/tile/1.png"), false, Priority::High, move |outcome| {
            assert!(outcome.is_ready());
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    assert!(delivered.load(Ordering::SeqCst));
    assert!(handle.is_completed());
    assert!(!handle.cancel());
    assert_eq!(fixture.transport.performs(), 1);
}

#[tokio::test]
async fn test_failed_download_reaches_every_caller() {
    let fixture = Fixture::new().await;
    fixture.transport.script("/img1.png", Script::Fail);

    fixture.transport.hold();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            fixture
                .cache
                .fetch(request("/img1.png"), false, Priority::Normal)
                .unwrap()
        })
        .collect();
    fixture.transport.release();

    for handle in &handles {
        match handle.wait().await {
            CacheOutcome::Failed(failure) => {
                assert_eq!(failure.response_code, -1);
                assert!(!failure.cancelled);
                assert!(failure.key.contains("img1.png"));
            }
            CacheOutcome::Ready(path) => panic!("unexpected file {}", path.display()),
        }
    }

    let path = fixture.cache.file_path_for(&request("/img1.png")).unwrap();
    assert!(!path.exists());
    assert!(fixture.cache.store().is_empty());
    assert_eq!(fixture.transport.performs_of("/img1.png"), 1);
}

#[tokio::test]
async fn test_http_error_is_a_failure() {
    let fixture = Fixture::new().await;
    fixture.transport.script(
        "/missing.png",
        Script::Respond {
            status: 404,
            body: b"not found".to_vec(),
        },
    );

    let result = fixture
        .cache
        .get_and_wait(request("/missing.png"), false)
        .await;

    match result {
        Err(CacheError::DownloadFailed(failure)) => {
            assert_eq!(failure.response_code, 404);
            assert!(failure.reason.contains("404"));
        }
        other => panic!("expected a download failure, got {:?}", other),
    }
    let path = fixture.cache.file_path_for(&request("/missing.png")).unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_stale_copy_is_fetched_again() {
    let fixture =
        Fixture::with_config(|config| config.with_max_age(Duration::from_millis(200))).await;

    fixture
        .cache
        .get_and_wait(request("/weather.json"), false)
        .await
        .unwrap();
    fixture
        .cache
        .get_and_wait(request("/weather.json"), false)
        .await
        .unwrap();
    assert_eq!(fixture.transport.performs(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fixture
        .cache
        .get_file_if_cached(&request("/weather.json"), true)
        .is_none());
    assert!(fixture
        .cache
        .get_file_if_cached(&request("/weather.json"), false)
        .is_some());

    let path = fixture
        .cache
        .get_and_wait(request("/weather.json"), false)
        .await
        .unwrap();
    assert_eq!(fixture.transport.performs(), 2);
    assert!(path.exists());
}

#[tokio::test]
async fn test_force_refresh_downloads_again() {
    let fixture = Fixture::new().await;

    fixture
        .cache
        .get_and_wait(request("/list.txt"), false)
        .await
        .unwrap();
    fixture
        .cache
        .get_and_wait(request("/list.txt"), true)
        .await
        .unwrap();

    assert_eq!(fixture.transport.performs_of("/list.txt"), 2);
}

#[tokio::test]
async fn test_completion_records_survive_restart() {
    let fixture = Fixture::new().await;
    let path = fixture
        .cache
        .get_and_wait(request("/archive.zip"), false)
        .await
        .unwrap();
    fixture.cache.flush().await.unwrap();

    let reopened = fixture.reopen().await;
    assert_eq!(
        reopened.get_file_if_cached(&request("/archive.zip"), true),
        Some(path.clone())
    );

    let handle = reopened
        .fetch(request("/archive.zip"), false, Priority::Normal)
        .unwrap();
    assert_eq!(handle.outcome(), Some(CacheOutcome::Ready(path)));
    assert_eq!(fixture.transport.performs(), 1);
}

#[tokio::test]
async fn test_remove_file_refused_during_download() {
    let fixture = Fixture::new().await;

    fixture.transport.hold();
    let handle = fixture
        .cache
        .fetch(request("/photo.jpg"), false, Priority::Normal)
        .unwrap();
    assert!(!fixture.cache.remove_file(&request("/photo.jpg")));
    fixture.transport.release();

    let path = handle.wait().await.into_result().unwrap();
    assert!(path.exists());

    assert!(fixture.cache.remove_file(&request("/photo.jpg")));
    assert!(!path.exists());
    assert!(fixture
        .cache
        .get_file_if_cached(&request("/photo.jpg"), false)
        .is_none());
    assert!(!fixture.cache.remove_file(&request("/photo.jpg")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_fails_every_waiter() {
    let fixture = Fixture::new().await;
    fixture.transport.script("/big.bin", Script::WaitForAbort);

    let first = fixture
        .cache
        .fetch(request("/big.bin"), false, Priority::Normal)
        .unwrap();
    let second = fixture
        .cache
        .fetch(request("/big.bin"), false, Priority::Normal)
        .unwrap();
    fixture.transport.wait_for_in_flight(1).await;
    assert!(second.is_started());

    assert!(first.cancel());

    for handle in [&first, &second] {
        match handle.wait().await {
            CacheOutcome::Failed(failure) => assert!(failure.cancelled),
            CacheOutcome::Ready(path) => panic!("unexpected file {}", path.display()),
        }
    }
    assert!(!second.cancel());
    assert_eq!(fixture.transport.aborts(), 1);

    let path = fixture.cache.file_path_for(&request("/big.bin")).unwrap();
    assert!(!path.exists());
    assert!(fixture.cache.store().is_empty());
}

#[tokio::test]
async fn test_clear_skips_download_in_flight() {
    let fixture = Fixture::new().await;
    for path in ["/a.txt", "/b.txt", "/c.txt"] {
        fixture.cache.get_and_wait(request(path), false).await.unwrap();
    }

    fixture.transport.hold();
    let refresh = fixture
        .cache
        .fetch(request("/c.txt"), true, Priority::Normal)
        .unwrap();

    assert_eq!(fixture.cache.clear(), 2);
    assert!(fixture
        .cache
        .get_file_if_cached(&request("/a.txt"), false)
        .is_none());

    fixture.transport.release();
    let path = refresh.wait().await.into_result().unwrap();
    assert!(path.exists());
    assert_eq!(fixture.cache.store().completed_paths(), vec![path]);
}

#[tokio::test]
async fn test_unsubscribed_listener_does_not_run() {
    let fixture = Fixture::new().await;
    let called = Arc::new(AtomicBool::new(false));

    fixture.transport.hold();
    let flag = Arc::clone(&called);
    let handle = fixture
        .cache
        .fetch(request("/quiet.txt"), false, Priority::Low)
        .unwrap();
    let id = handle.subscribe(move |_| flag.store(true, Ordering::SeqCst));
    assert!(handle.unsubscribe(id));
    fixture.transport.release();

    assert!(handle.wait().await.is_ready());
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delivered_file_survives_concurrent_removal() {
    let fixture = Fixture::new().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    fixture.transport.hold();
    let _handles: Vec<_> = (0..6)
        .map(|_| {
            let tx = tx.clone();
            fixture
                .cache
                .get(request("/layer.bin"), false, Priority::Normal, move |outcome| {
                    let present = outcome.path().map_or(false, |path| path.is_file());
                    let _ = tx.send((outcome, present));
                })
                .unwrap()
        })
        .collect();
    fixture.transport.wait_for_in_flight(1).await;

    let stop = Arc::new(AtomicBool::new(false));
    let remover = {
        let cache = Arc::clone(&fixture.cache);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                cache.remove_file(&request("/layer.bin"));
                std::thread::yield_now();
            }
        })
    };
    fixture.transport.release();

    for _ in 0..6 {
        let (outcome, present) = rx.recv().await.unwrap();
        assert!(outcome.is_ready());
        assert!(present, "waiter got {:?} but the file was gone", outcome);
    }
    stop.store(true, Ordering::SeqCst);
    remover.join().unwrap();
    assert_eq!(fixture.transport.performs_of("/layer.bin"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_and_removal_from_completion_listener() {
    let fixture = Fixture::new().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    fixture.transport.hold();
    let first = fixture
        .cache
        .fetch(request("/feed.xml"), false, Priority::Normal)
        .unwrap();
    {
        let cache = Arc::clone(&fixture.cache);
        first.subscribe(move |outcome| {
            let refresh = cache
                .fetch(request("/feed.xml"), true, Priority::Normal)
                .unwrap();
            let removed = cache.remove_file(&request("/feed.xml"));
            let present = outcome.path().map_or(false, |path| path.is_file());
            let _ = tx.send((outcome, refresh.outcome(), removed, present));
        });
    }
    fixture.transport.release();

    let (outcome, refreshed, removed, present) = rx.recv().await.unwrap();
    assert!(outcome.is_ready());
    assert_eq!(refreshed, Some(outcome.clone()));
    assert!(!removed);
    assert!(present);

    let path = first.wait().await.into_result().unwrap();
    assert!(path.is_file());
    assert!(fixture.cache.store().is_downloaded(&path));
    assert_eq!(fixture.transport.performs_of("/feed.xml"), 1);
}

#[tokio::test]
async fn test_download_progress_reaches_handle() {
    let fixture = Fixture::new().await;
    fixture.transport.script(
        "/blob.bin",
        Script::Respond {
            status: 200,
            body: vec![1u8; 1000],
        },
    );

    fixture.transport.hold();
    let handle = fixture
        .cache
        .fetch(request("/blob.bin"), false, Priority::Normal)
        .unwrap();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let id = {
        let updates = Arc::clone(&updates);
        handle.add_progress_listener(move |current, total| {
            updates.lock().unwrap().push((current, total))
        })
    };
    assert!(id.is_some());
    fixture.transport.release();

    handle.wait().await.into_result().unwrap();
    let updates = updates.lock().unwrap().clone();
    assert_eq!(updates.first(), Some(&(0, None)));
    assert_eq!(updates.last(), Some(&(1000, None)));

    // Served from disk, so there is no download to follow
    let hit = fixture
        .cache
        .fetch(request("/blob.bin"), false, Priority::Normal)
        .unwrap();
    assert!(hit.add_progress_listener(|_, _| {}).is_none());
}
