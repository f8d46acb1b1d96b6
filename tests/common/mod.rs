//! Scripted in-memory transport shared by the integration tests
//!
//! Responses are keyed by URL path. By default every request succeeds with
//! HTTP 200 and the path as its body. `hold` parks every transfer until
//! `release`, which lets tests pile up concurrent callers deterministically.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use resource_fetcher::app::{ExecutableRequest, RawResponse, RequestId, Transport};
use resource_fetcher::errors::{TransportError, TransportResult};

/// What the transport does for a path
#[derive(Debug, Clone)]
pub enum Script {
    /// Answer with this status and body
    Respond { status: u16, body: Vec<u8> },
    /// Fail without a response
    Fail,
    /// Time out this many times, then answer normally
    TimeOut(usize),
    /// Block until aborted
    WaitForAbort,
}

pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    delay: Mutex<Duration>,
    held: watch::Sender<bool>,
    aborted: Mutex<HashSet<RequestId>>,
    abort_signal: Notify,
    log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    performs: AtomicUsize,
    aborts: AtomicUsize,
    releases: AtomicUsize,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            scripts: Mutex::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
            held,
            aborted: Mutex::new(HashSet::new()),
            abort_signal: Notify::new(),
            log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            performs: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, path: &str, script: Script) {
        self.scripts.lock().unwrap().insert(path.to_string(), script);
    }

    /// Time every transfer takes once released
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Park every transfer until `release`
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Paths in the order transfers started
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn performs(&self) -> usize {
        self.performs.load(Ordering::SeqCst)
    }

    pub fn performs_of(&self, path: &str) -> usize {
        self.log().iter().filter(|p| p.as_str() == path).count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Aborts not yet cleared by `release`
    pub fn remembered_aborts(&self) -> usize {
        self.aborted.lock().unwrap().len()
    }

    /// Wait until `count` transfers are in flight
    pub async fn wait_for_in_flight(&self, count: usize) {
        for _ in 0..500 {
            if self.in_flight() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {} transfers in flight, saw {}", count, self.in_flight());
    }

    fn is_aborted(&self, id: RequestId) -> bool {
        self.aborted.lock().unwrap().contains(&id)
    }

    async fn wait_aborted(&self, id: RequestId) {
        loop {
            let notified = self.abort_signal.notified();
            if self.is_aborted(id) {
                return;
            }
            notified.await;
        }
    }

    async fn wait_released(&self) {
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
    }

    fn next_script(&self, path: &str) -> Option<Script> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(path) {
            Some(Script::TimeOut(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(Script::TimeOut(1))
            }
            Some(Script::TimeOut(_)) => None,
            other => other.cloned(),
        }
    }

    async fn respond(
        &self,
        request: &ExecutableRequest,
        path: &str,
    ) -> TransportResult<RawResponse> {
        let aborted = || TransportError::Aborted {
            request_id: request.id.value(),
        };

        tokio::select! {
            _ = self.wait_released() => {}
            _ = self.wait_aborted(request.id) => return Err(aborted()),
        }

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wait_aborted(request.id) => return Err(aborted()),
            }
        }

        match self.next_script(path) {
            None => Ok(RawResponse {
                status: 200,
                reason: Some("OK".to_string()),
                headers: Vec::new(),
                body: path.as_bytes().to_vec(),
            }),
            Some(Script::Respond { status, body }) => Ok(RawResponse::new(status, body)),
            Some(Script::Fail) => Err(TransportError::Other("connection refused".to_string())),
            Some(Script::TimeOut(_)) => Err(TransportError::Timeout { millis: 15_000 }),
            Some(Script::WaitForAbort) => {
                self.wait_aborted(request.id).await;
                Err(aborted())
            }
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn perform(&self, request: &ExecutableRequest) -> TransportResult<RawResponse> {
        let path = request.url.path().to_string();
        self.log.lock().unwrap().push(path.clone());
        self.performs.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = self.respond(request, &path).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn abort(&self, request: &ExecutableRequest) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.aborted.lock().unwrap().insert(request.id);
        self.abort_signal.notify_waiters();
    }

    fn release(&self, request: &ExecutableRequest) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.aborted.lock().unwrap().remove(&request.id);
    }
}
