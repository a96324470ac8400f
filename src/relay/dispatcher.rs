//! Relay dispatcher
//!
//! Turns one work request into one outbound call and exactly one work
//! result. Dispatches run as independent tasks; results are delivered in
//! completion order on the dispatcher's result channel.

use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{WorkRequest, WorkResult};

use super::target::{parse_method, RelayTarget, TargetCall};
use super::RelayTracker;

// ─────────────────────────────────────────────────────────────────
// Dispatcher Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the relay dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Base URL every request path is appended to
    pub base_url: String,

    /// Method used when a request does not name one
    pub default_method: Method,

    /// Maximum concurrent outbound calls (0 = unbounded)
    pub max_in_flight: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8888/x".to_string(),
            default_method: Method::POST,
            max_in_flight: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Relay Dispatcher
// ─────────────────────────────────────────────────────────────────

/// Relays work requests to the target and reports their results
#[derive(Clone)]
pub struct RelayDispatcher {
    config: Arc<DispatcherConfig>,
    target: Arc<dyn RelayTarget>,
    limiter: Option<Arc<Semaphore>>,
    tracker: Arc<RelayTracker>,
    result_tx: mpsc::UnboundedSender<WorkResult>,
}

impl RelayDispatcher {
    /// Create a dispatcher and the receiver its results arrive on
    pub fn new(
        config: DispatcherConfig,
        target: Arc<dyn RelayTarget>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkResult>) {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let limiter = (config.max_in_flight > 0)
            .then(|| Arc::new(Semaphore::new(config.max_in_flight)));

        info!(
            base_url = %config.base_url,
            default_method = %config.default_method,
            max_in_flight = config.max_in_flight,
            target = target.name(),
            "Relay dispatcher created"
        );

        (
            Self {
                config: Arc::new(config),
                target,
                limiter,
                tracker: Arc::new(RelayTracker::new()),
                result_tx,
            },
            result_rx,
        )
    }

    /// Dispatch in the background; the result arrives on the result channel
    pub fn submit(&self, request: WorkRequest) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let result = dispatcher.dispatch(request).await;
            if dispatcher.result_tx.send(result).is_err() {
                warn!("Result channel closed; dropping work result");
            }
        });
    }

    /// Relay one request and produce its result.
    ///
    /// Never fails: transport errors become `success: false` results.
    pub async fn dispatch(&self, request: WorkRequest) -> WorkResult {
        // Held until the call settles.
        let _permit = match &self.limiter {
            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
            None => None,
        };

        let queued_ms = (Utc::now() - request.received_at).num_milliseconds().max(0);
        let seq = self.tracker.begin(&request);

        let outcome = match self.build_call(&request) {
            Ok(call) => {
                debug!(id = %request.id, method = %call.method, url = %call.url, "Relaying request");
                self.target.call(call).await
            }
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok(data) => WorkResult::success(&request, data),
            Err(e) => {
                warn!(
                    id = %request.id,
                    error = %e.log_line(),
                    transient = e.is_transient(),
                    "Relay failed"
                );
                WorkResult::failure(&request)
            }
        };

        let elapsed = self.tracker.finish(seq, result.success);
        info!(
            id = %result.id,
            success = result.success,
            queued_ms,
            elapsed_ms = elapsed.map(|d| d.as_millis() as u64).unwrap_or(0),
            "Relay completed"
        );

        result
    }

    /// URL for a request path: base URL with the path appended verbatim
    pub fn target_url(&self, path: Option<&str>) -> String {
        match path {
            Some(path) => format!("{}{}", self.config.base_url, path),
            None => self.config.base_url.clone(),
        }
    }

    fn build_call(&self, request: &WorkRequest) -> Result<TargetCall> {
        let method = match request.method.as_deref() {
            Some(method) => parse_method(method)?,
            None => self.config.default_method.clone(),
        };

        let body = match &request.payload {
            Value::Null => None,
            payload => Some(payload.clone()),
        };

        Ok(TargetCall {
            method,
            url: self.target_url(request.path.as_deref()),
            body,
        })
    }

    /// In-flight and outcome counters
    pub fn tracker(&self) -> &RelayTracker {
        &self.tracker
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::oneshot;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::error::Error;
    use crate::relay::{HttpTarget, HttpTargetOptions};
    use crate::types::{CorrelationId, RequestKind};

    fn http_dispatcher(base_url: String) -> (RelayDispatcher, mpsc::UnboundedReceiver<WorkResult>) {
        let target = HttpTarget::new(&HttpTargetOptions::default()).unwrap();
        RelayDispatcher::new(
            DispatcherConfig {
                base_url,
                ..Default::default()
            },
            Arc::new(target),
        )
    }

    /// Target whose calls complete only when the test releases them
    #[derive(Default)]
    struct GatedTarget {
        gates: Mutex<HashMap<String, oneshot::Receiver<Value>>>,
        calls: Mutex<Vec<TargetCall>>,
    }

    impl GatedTarget {
        fn gate(&self, url: &str) -> oneshot::Sender<Value> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().insert(url.to_string(), rx);
            tx
        }
    }

    #[async_trait]
    impl RelayTarget for GatedTarget {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn call(&self, call: TargetCall) -> Result<Value> {
            let gate = self.gates.lock().remove(&call.url);
            self.calls.lock().push(call);
            match gate {
                Some(rx) => rx.await.map_err(|_| Error::Internal("gate dropped".into())),
                None => Ok(Value::Null),
            }
        }
    }

    #[test]
    fn test_target_url_concatenation() {
        let (dispatcher, _rx) = http_dispatcher("http://host/base".to_string());
        assert_eq!(dispatcher.target_url(Some("/x")), "http://host/base/x");
        assert_eq!(dispatcher.target_url(Some("?q=1")), "http://host/base?q=1");
        assert_eq!(dispatcher.target_url(None), "http://host/base");
    }

    #[tokio::test]
    async fn test_dispatch_get_with_path() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/base/x"))
            .and(body_json(json!({"a": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"b": 2})))
            .expect(1)
            .mount(&server)
            .await;

        let (dispatcher, _rx) = http_dispatcher(format!("{}/base", server.uri()));
        let request = WorkRequest::new("req-1", json!({"a": 1}))
            .with_method("GET")
            .with_path("/x");

        let result = dispatcher.dispatch(request).await;

        assert_eq!(result.id, CorrelationId::from("req-1"));
        assert!(result.success);
        assert_eq!(result.data, json!({"b": 2}));
    }

    #[tokio::test]
    async fn test_dispatch_defaults_to_post_on_base_url() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/x"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&server)
            .await;

        let (dispatcher, _rx) = http_dispatcher(format!("{}/x", server.uri()));
        let result = dispatcher.dispatch(WorkRequest::new("req-2", json!([1, 2]))).await;

        assert!(result.success);
        assert_eq!(result.data, json!("created"));
    }

    #[tokio::test]
    async fn test_dispatch_non_2xx_is_still_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "busy"})))
            .mount(&server)
            .await;

        let (dispatcher, _rx) = http_dispatcher(server.uri());
        let result = dispatcher.dispatch(WorkRequest::new("req-3", json!({}))).await;

        assert!(result.success);
        assert_eq!(result.data, json!({"error": "busy"}));
    }

    #[tokio::test]
    async fn test_dispatch_unreachable_target_fails() {
        // Reserve a port, then free it so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (dispatcher, _rx) = http_dispatcher(format!("http://{}", addr));
        let request = WorkRequest::new("req-4", json!({"keep": "out of the result"}))
            .with_kind(RequestKind::Handle);

        let result = dispatcher.dispatch(request).await;

        assert_eq!(result.id, CorrelationId::from("req-4"));
        assert!(!result.success);
        assert_eq!(result.data, json!({}));
        assert_eq!(result.event_name(), "response");
        assert_eq!(dispatcher.tracker().failed_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_invalid_method_fails() {
        let target = Arc::new(GatedTarget::default());
        let (dispatcher, _rx) = RelayDispatcher::new(DispatcherConfig::default(), target.clone());

        let request = WorkRequest::new("req-5", json!({})).with_method("NOT VALID");
        let result = dispatcher.dispatch(request).await;

        assert!(!result.success);
        assert_eq!(result.data, json!({}));
        assert!(target.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_null_payload_sends_no_body() {
        let target = Arc::new(GatedTarget::default());
        let (dispatcher, _rx) = RelayDispatcher::new(DispatcherConfig::default(), target.clone());

        dispatcher.dispatch(WorkRequest::new("req-6", Value::Null)).await;

        let calls = target.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, Method::POST);
        assert!(calls[0].body.is_none());
    }

    #[tokio::test]
    async fn test_results_follow_completion_order() {
        let target = Arc::new(GatedTarget::default());
        let base = DispatcherConfig::default().base_url;
        let release_a = target.gate(&format!("{}/a", base));
        let release_b = target.gate(&format!("{}/b", base));

        let (dispatcher, mut results) =
            RelayDispatcher::new(DispatcherConfig::default(), target.clone());

        dispatcher.submit(WorkRequest::new("A", json!({})).with_path("/a"));
        dispatcher.submit(WorkRequest::new("B", json!({})).with_path("/b"));

        // Let both calls start before releasing them in reverse order.
        while target.calls.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.tracker().in_flight_count(), 2);

        release_b.send(json!("b")).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();

        release_a.send(json!("a")).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.id, CorrelationId::from("B"));
        assert_eq!(first.data, json!("b"));
        assert_eq!(second.id, CorrelationId::from("A"));
        assert_eq!(dispatcher.tracker().succeeded_count(), 2);
    }

    #[tokio::test]
    async fn test_every_request_gets_exactly_one_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let (dispatcher, mut results) = http_dispatcher(server.uri());

        // Even ids hit a mounted route, odd ids use an invalid method.
        for i in 0..10 {
            let request = if i % 2 == 0 {
                WorkRequest::new(CorrelationId::new(json!(i)), json!({})).with_path("/ok")
            } else {
                WorkRequest::new(CorrelationId::new(json!(i)), json!({})).with_method("BAD METHOD")
            };
            dispatcher.submit(request);
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
                .await
                .unwrap()
                .unwrap();
            let id: u64 = result.id.to_string().parse().unwrap();
            assert_eq!(result.success, id % 2 == 0);
            seen.push(id);
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<u64>>());
        assert!(tokio::time::timeout(Duration::from_millis(100), results.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_max_in_flight_bounds_concurrency() {
        let target = Arc::new(GatedTarget::default());
        let base = DispatcherConfig::default().base_url;
        let release_a = target.gate(&format!("{}/a", base));
        let _release_b = target.gate(&format!("{}/b", base));

        let (dispatcher, mut results) = RelayDispatcher::new(
            DispatcherConfig {
                max_in_flight: 1,
                ..Default::default()
            },
            target.clone(),
        );

        dispatcher.submit(WorkRequest::new("A", json!({})).with_path("/a"));
        dispatcher.submit(WorkRequest::new("B", json!({})).with_path("/b"));

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(target.calls.lock().len(), 1);

        release_a.send(Value::Null).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, CorrelationId::from("A"));

        while target.calls.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
    }
}
