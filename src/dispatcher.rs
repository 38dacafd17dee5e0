//! Fire-and-forget webhook fan-out.
//!
//! Each lifecycle event is serialized once and handed to one detached task
//! per matching subscription. Tasks share nothing but the append-only log.
//! A delivery is attempted exactly once; whatever happens is written to the
//! log and never reported back to the caller.

use crate::clock::Clock;
use crate::config::WebhookSettings;
use crate::store::SharedStore;
use crate::types::{DeliveryLogEntry, EventType, WebhookSubscription};
use crate::verification::{sign_payload, SIGNATURE_HEADER};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::Value;
use std::error::Error as _;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const TIMEOUT_ERROR: &str = "timeout";

#[derive(Serialize)]
struct Envelope<'a> {
    event: EventType,
    timestamp: String,
    data: &'a Value,
}

/// The wire body: `{"event": ..., "timestamp": ..., "data": ...}`, compact,
/// keys in that order.
pub fn build_payload(
    event: EventType,
    at: DateTime<Utc>,
    data: &Value,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        event,
        timestamp: at.to_rfc3339_opts(SecondsFormat::Micros, true),
        data,
    })
}

/// Longest prefix of `body` that fits in `limit` bytes without splitting a char.
fn excerpt(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_owned();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_owned()
}

/// Read at most `limit` bytes of the body, then stop pulling from the socket.
async fn read_excerpt(response: &mut reqwest::Response, limit: usize) -> Result<String, reqwest::Error> {
    let mut buf = Vec::with_capacity(limit.min(8 * 1024));
    while buf.len() < limit {
        match response.chunk().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => break,
        }
    }
    buf.truncate(limit);
    // A char cut at the limit decodes to U+FFFD and is dropped again here.
    Ok(excerpt(&String::from_utf8_lossy(&buf), limit))
}

/// `reqwest` hides the useful part (connection refused, dns) in the source chain.
fn describe(err: &reqwest::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// Perform one delivery attempt and describe its outcome. Never fails.
pub async fn deliver(
    client: &reqwest::Client,
    sub: &WebhookSubscription,
    event: EventType,
    payload: &str,
    triggered_at: DateTime<Utc>,
    settings: &WebhookSettings,
    clock: &dyn Clock,
) -> DeliveryLogEntry {
    let mut request = client
        .post(&sub.url)
        .header(CONTENT_TYPE, "application/json")
        .body(payload.to_owned());
    if let Some(secret) = sub.signing_secret() {
        request = request.header(SIGNATURE_HEADER, sign_payload(secret, payload.as_bytes()));
    }

    let limit = settings.response_excerpt_bytes;
    let outcome = tokio::time::timeout(settings.timeout(), async {
        let mut response = request.send().await?;
        let status = response.status().as_u16();
        let body = read_excerpt(&mut response, limit).await;
        Ok::<_, reqwest::Error>((status, body))
    })
    .await;

    let mut entry = DeliveryLogEntry {
        id: format!("dlv_{}", Uuid::new_v4().simple()),
        subscription_id: sub.id.clone(),
        event_type: event,
        payload: payload.to_owned(),
        response_status: None,
        response_body: None,
        error_message: None,
        triggered_at,
        delivered_at: None,
    };

    match outcome {
        Ok(Ok((status, Ok(body)))) => {
            entry.response_status = Some(status);
            entry.response_body = Some(body);
        }
        Ok(Ok((status, Err(e)))) => {
            entry.response_status = Some(status);
            entry.error_message = Some(format!("failed to read response body: {}", describe(&e)));
        }
        Ok(Err(e)) if e.is_timeout() => entry.error_message = Some(TIMEOUT_ERROR.into()),
        Ok(Err(e)) => entry.error_message = Some(describe(&e)),
        Err(_) => entry.error_message = Some(TIMEOUT_ERROR.into()),
    }
    entry.delivered_at = Some(clock.now());
    entry
}

pub struct Dispatcher {
    client: reqwest::Client,
    store: SharedStore,
    settings: WebhookSettings,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        store: SharedStore,
        settings: WebhookSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            store,
            settings,
            clock,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    /// Schedule one delivery per active subscriber of `event` and return how
    /// many were scheduled. Does not wait for any of them.
    pub async fn dispatch(&self, event: EventType, data: Value) -> usize {
        let subscribers = self.store.read().await.registry.subscribers_for(event);
        if subscribers.is_empty() {
            return 0;
        }

        let triggered_at = self.clock.now();
        let payload: Arc<str> = match build_payload(event, triggered_at, &data) {
            Ok(p) => p.into(),
            Err(e) => {
                tracing::error!(event = %event, error = %e, "failed to serialize webhook payload");
                return 0;
            }
        };

        let count = subscribers.len();
        let mut handles = Vec::with_capacity(count);
        for sub in subscribers {
            let client = self.client.clone();
            let store = self.store.clone();
            let settings = self.settings.clone();
            let clock = self.clock.clone();
            let payload = payload.clone();

            handles.push(tokio::spawn(async move {
                let entry = deliver(
                    &client,
                    &sub,
                    event,
                    &payload,
                    triggered_at,
                    &settings,
                    clock.as_ref(),
                )
                .await;

                match (&entry.response_status, &entry.error_message) {
                    (Some(status), _) => tracing::debug!(
                        subscription_id = %sub.id,
                        event = %event,
                        status = *status,
                        "webhook delivered"
                    ),
                    (None, error) => tracing::warn!(
                        subscription_id = %sub.id,
                        event = %event,
                        error = error.as_deref().unwrap_or_default(),
                        "webhook delivery failed"
                    ),
                }

                let reached = entry.reached_target();
                let mut st = store.write().await;
                if let Err(e) = st.record_delivery(entry) {
                    tracing::warn!(subscription_id = %sub.id, error = %e, "failed to persist delivery log entry");
                }
                if reached {
                    if let Err(e) = st.save_webhooks() {
                        tracing::warn!(error = %e, "failed to persist webhooks");
                    }
                }
            }));
        }

        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|h| !h.is_finished());
        in_flight.extend(handles);
        count
    }

    /// Wait until every delivery scheduled so far has been logged. Each one is
    /// bounded by the attempt timeout.
    pub async fn wait_idle(&self) {
        loop {
            let handles = std::mem::take(&mut *self.in_flight.lock().await);
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "delivery task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::NewWebhook;
    use crate::store::Store;
    use crate::verification::verify_signature;
    use axum::{
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::post,
        Router,
    };
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<(String, HeaderMap, Bytes)>>>;

    /// Local receiver: `/hooks/ok` answers 200, `/hooks/fail` 500 with a long
    /// body, `/hooks/slow` never answers in time.
    async fn start_receiver() -> (SocketAddr, Captured) {
        async fn handle(
            Path(name): Path<String>,
            State(captured): State<Captured>,
            headers: HeaderMap,
            body: Bytes,
        ) -> (StatusCode, String) {
            captured.lock().await.push((name.clone(), headers, body));
            match name.as_str() {
                "fail" => (StatusCode::INTERNAL_SERVER_ERROR, "é".repeat(4000)),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    (StatusCode::OK, String::new())
                }
                _ => (StatusCode::OK, "ok".into()),
            }
        }

        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hooks/{name}", post(handle))
            .with_state(captured.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, captured)
    }

    fn settings() -> WebhookSettings {
        WebhookSettings {
            timeout_secs: 1,
            response_excerpt_bytes: 64,
            user_agent: "test-agent".into(),
        }
    }

    async fn subscribe(
        store: &SharedStore,
        url: String,
        secret: Option<&str>,
        events: &[EventType],
    ) -> String {
        store
            .write()
            .await
            .registry
            .create(
                NewWebhook {
                    name: url.clone(),
                    url,
                    secret: secret.map(str::to_string),
                    events: events.iter().copied().collect(),
                    is_active: true,
                },
                Utc::now(),
            )
            .unwrap()
            .id
    }

    fn dispatcher(store: &SharedStore) -> Dispatcher {
        Dispatcher::new(store.clone(), settings(), Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn payload_shape_and_key_order() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let body = build_payload(EventType::TicketCreated, at, &serde_json::json!({"id": "tkt_1"})).unwrap();
        assert_eq!(
            body,
            r#"{"event":"ticket.created","timestamp":"2024-03-01T09:00:00.000000Z","data":{"id":"tkt_1"}}"#
        );
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("short", 64), "short");
        assert_eq!(excerpt("aé", 2), "a");
        assert_eq!(excerpt("abcdef", 3), "abc");
    }

    #[tokio::test]
    async fn fans_out_identical_bytes_with_per_subscriber_signatures() {
        let (addr, captured) = start_receiver().await;
        let store = Store::in_memory().into_shared();
        let a = subscribe(&store, format!("http://{addr}/hooks/ok"), Some("alpha"), &[EventType::TicketCreated]).await;
        let b = subscribe(&store, format!("http://{addr}/hooks/ok"), Some("beta"), &[EventType::TicketCreated, EventType::TicketClosed]).await;
        subscribe(&store, format!("http://{addr}/hooks/ok"), None, &[EventType::CommentAdded]).await;

        let d = dispatcher(&store);
        let scheduled = d
            .dispatch(EventType::TicketCreated, serde_json::json!({"id": "tkt_1"}))
            .await;
        assert_eq!(scheduled, 2);
        d.wait_idle().await;

        let st = store.read().await;
        let la = st.deliveries_page(&a, 0, 10);
        let lb = st.deliveries_page(&b, 0, 10);
        assert_eq!(la.len(), 1);
        assert_eq!(lb.len(), 1);
        assert_eq!(la[0].payload, lb[0].payload);
        assert_eq!(la[0].response_status, Some(200));
        assert_eq!(la[0].response_body.as_deref(), Some("ok"));
        assert!(st.stats(&a).unwrap().last_triggered_at.is_some());

        let requests = captured.lock().await;
        assert_eq!(requests.len(), 2);
        let mut signatures = Vec::new();
        for (_, headers, body) in requests.iter() {
            assert_eq!(body.as_ref(), la[0].payload.as_bytes());
            assert_eq!(headers["content-type"], "application/json");
            assert_eq!(headers["user-agent"], "test-agent");
            let sig = headers["x-webhook-signature"].to_str().unwrap().to_string();
            assert!(verify_signature("alpha", body, &sig) || verify_signature("beta", body, &sig));
            signatures.push(sig);
        }
        assert_ne!(signatures[0], signatures[1]);
        assert_eq!(
            signatures.iter().filter(|s| **s == sign_payload("alpha", la[0].payload.as_bytes())).count(),
            1
        );
    }

    #[tokio::test]
    async fn unsigned_subscription_gets_no_signature_header() {
        let (addr, captured) = start_receiver().await;
        let store = Store::in_memory().into_shared();
        subscribe(&store, format!("http://{addr}/hooks/ok"), None, &[EventType::TicketUpdated]).await;

        let d = dispatcher(&store);
        d.dispatch(EventType::TicketUpdated, serde_json::json!({})).await;
        d.wait_idle().await;

        let requests = captured.lock().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].1.get("x-webhook-signature").is_none());
    }

    #[tokio::test]
    async fn error_status_is_recorded_as_completed_transport() {
        let (addr, _captured) = start_receiver().await;
        let store = Store::in_memory().into_shared();
        let id = subscribe(&store, format!("http://{addr}/hooks/fail"), None, &[EventType::TicketClosed]).await;

        let d = dispatcher(&store);
        d.dispatch(EventType::TicketClosed, serde_json::json!({})).await;
        d.wait_idle().await;

        let st = store.read().await;
        let entry = st.deliveries_page(&id, 0, 1)[0];
        assert_eq!(entry.response_status, Some(500));
        assert_eq!(entry.error_message, None);
        let body = entry.response_body.as_deref().unwrap();
        assert!(body.len() <= 64 && !body.is_empty());
        assert!(st.stats(&id).unwrap().last_triggered_at.is_some());
    }

    /// Answers every request with a chunked body that never ends.
    async fn start_endless_receiver() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 4096];
                    let _ = socket.read(&mut request).await;
                    let head = b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n";
                    if socket.write_all(head).await.is_err() {
                        return;
                    }
                    let chunk = format!("400\r\n{}\r\n", "x".repeat(1024));
                    while socket.write_all(chunk.as_bytes()).await.is_ok() {}
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn endless_response_body_is_cut_at_the_excerpt_limit() {
        let addr = start_endless_receiver().await;
        let store = Store::in_memory().into_shared();
        let id = subscribe(&store, format!("http://{addr}/stream"), None, &[EventType::TicketUpdated]).await;

        let d = dispatcher(&store);
        d.dispatch(EventType::TicketUpdated, serde_json::json!({})).await;
        d.wait_idle().await;

        let st = store.read().await;
        let entry = st.deliveries_page(&id, 0, 1)[0];
        assert_eq!(entry.response_status, Some(200));
        assert_eq!(entry.error_message, None);
        assert_eq!(entry.response_body.as_deref(), Some("x".repeat(64).as_str()));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_without_holding_up_others() {
        let (addr, _captured) = start_receiver().await;
        let store = Store::in_memory().into_shared();
        let slow = subscribe(&store, format!("http://{addr}/hooks/slow"), None, &[EventType::TicketCreated]).await;
        let fast = subscribe(&store, format!("http://{addr}/hooks/ok"), None, &[EventType::TicketCreated]).await;

        let d = dispatcher(&store);
        let started = std::time::Instant::now();
        d.dispatch(EventType::TicketCreated, serde_json::json!({})).await;
        assert!(started.elapsed() < Duration::from_millis(500));

        // The fast delivery lands well before the slow one gives up.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.read().await.delivery_count(&fast), 1);
        assert_eq!(store.read().await.delivery_count(&slow), 0);

        d.wait_idle().await;
        let st = store.read().await;
        let entry = st.deliveries_page(&slow, 0, 1)[0];
        assert_eq!(entry.error_message.as_deref(), Some(TIMEOUT_ERROR));
        assert_eq!(entry.response_status, None);
        assert!(entry.delivered_at.unwrap() >= entry.triggered_at);
        assert_eq!(st.stats(&slow).unwrap().last_triggered_at, None);
    }

    #[tokio::test]
    async fn refused_connection_is_logged_not_raised() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let store = Store::in_memory().into_shared();
        let id = subscribe(&store, format!("http://{addr}/hooks/gone"), None, &[EventType::CommentAdded]).await;

        let d = dispatcher(&store);
        assert_eq!(d.dispatch(EventType::CommentAdded, serde_json::json!({})).await, 1);
        d.wait_idle().await;

        let st = store.read().await;
        let entry = st.deliveries_page(&id, 0, 1)[0];
        assert_eq!(entry.response_status, None);
        assert!(entry.error_message.is_some());
        assert!(entry.delivered_at.is_some());
    }

    #[tokio::test]
    async fn no_subscribers_schedules_nothing() {
        let store = Store::in_memory().into_shared();
        let d = dispatcher(&store);
        assert_eq!(d.dispatch(EventType::TicketResolved, serde_json::json!({})).await, 0);
        d.wait_idle().await;
    }
}
