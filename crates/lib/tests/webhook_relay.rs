//! Integration tests: real gateway on an ephemeral port, in-process completion and delivery fakes.

use async_trait::async_trait;
use relay_lib::channels::{
    DeliveryClient, DeliveryError, DeliveryResult, OutboundMessage, SchemaMatcher,
};
use relay_lib::gateway;
use relay_lib::llm::{CompletionClient, CompletionError, CompletionRequest};
use relay_lib::relay::{RelayOrchestrator, RelaySettings};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct ScriptedCompletion {
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        _timeout: Duration,
    ) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(format!("Rest and drink fluids ({})", request.user_text))
    }
}

#[derive(Default)]
struct RecordingDelivery {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingDelivery {
    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryClient for RecordingDelivery {
    fn id(&self) -> &str {
        "recording"
    }

    async fn deliver(
        &self,
        message: &OutboundMessage,
        _timeout: Duration,
    ) -> Result<DeliveryResult, DeliveryError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryResult {
            success: true,
            provider_status: 202,
            provider_body: r#"{"status":"submitted"}"#.to_string(),
        })
    }
}

struct Harness {
    base: String,
    client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(
        completion: Arc<ScriptedCompletion>,
        delivery: Arc<RecordingDelivery>,
        settings: RelaySettings,
    ) -> Self {
        let orchestrator =
            RelayOrchestrator::new(SchemaMatcher::default(), completion, delivery, settings);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local_addr").port();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            gateway::serve(listener, orchestrator, "/webhook", async {
                let _ = stopped.await;
            })
            .await
        });
        Self {
            base: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
            stop: Some(stop),
            server,
        }
    }

    async fn post(&self, body: &Value) -> (u16, Value) {
        post_raw(&self.client, &self.base, body.to_string()).await
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("gateway stops within 5s")
            .expect("gateway task")
            .expect("gateway result");
    }
}

async fn post_raw(client: &reqwest::Client, base: &str, body: String) -> (u16, Value) {
    let resp = client
        .post(format!("{}/webhook", base))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .expect("send webhook");
    let status = resp.status().as_u16();
    let json = resp.json().await.expect("JSON response");
    (status, json)
}

fn settings() -> RelaySettings {
    RelaySettings {
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(2),
        ..RelaySettings::default()
    }
}

fn meta_payload(id: &str, from: &str, text: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{ "changes": [{ "value": { "messages": [{
            "id": id, "from": from, "timestamp": "1717000000",
            "type": "text", "text": { "body": text }
        }]}}]}]
    })
}

fn gupshup_payload(id: &str, phone: &str, text: &str) -> Value {
    json!({
        "app": "Connectify",
        "timestamp": 1717000000000u64,
        "type": "message",
        "payload": {
            "id": id,
            "type": "text",
            "payload": { "text": text },
            "sender": { "phone": phone, "name": "Asha" }
        }
    })
}

#[tokio::test]
async fn every_envelope_shape_relays_the_same_conversation_and_text() {
    let completion = ScriptedCompletion::new(Duration::ZERO);
    let delivery = Arc::new(RecordingDelivery::default());
    let h = Harness::start(completion.clone(), delivery.clone(), settings()).await;

    let payloads = [
        meta_payload("wamid.1", "15551234567", "I have a headache"),
        gupshup_payload("gs-2", "15551234567", "I have a headache"),
        json!({ "id": "flat-3", "sender": "15551234567", "message": "I have a headache" }),
    ];
    for p in &payloads {
        let (status, body) = h.post(p).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "success");
        assert_eq!(body["reply"], "Rest and drink fluids (I have a headache)");
    }

    let sent = delivery.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|m| m == &sent[0]));
    assert_eq!(sent[0].conversation_id, "15551234567");
    assert_eq!(completion.calls(), 3);
    h.shutdown().await;
}

#[tokio::test]
async fn missing_fields_are_acknowledged_as_ignored() {
    let completion = ScriptedCompletion::new(Duration::ZERO);
    let delivery = Arc::new(RecordingDelivery::default());
    let h = Harness::start(completion.clone(), delivery.clone(), settings()).await;

    let (status, body) = h.post(&json!({ "entry": [] })).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "status": "ignored", "reason": "unrecognized-schema" }));

    // Status callbacks (no text) are recognized but carry nothing to answer.
    let status_update = json!({
        "entry": [{ "changes": [{ "value": {
            "messages": [{ "id": "wamid.9", "from": "1555", "type": "image" }]
        }}]}]
    });
    let (status, body) = h.post(&status_update).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["reason"], "empty-text");

    assert_eq!(completion.calls(), 0);
    assert!(delivery.sent().is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn invalid_json_is_a_bad_request() {
    let completion = ScriptedCompletion::new(Duration::ZERO);
    let delivery = Arc::new(RecordingDelivery::default());
    let h = Harness::start(completion.clone(), delivery, settings()).await;

    let (status, body) = post_raw(&h.client, &h.base, "{not json".to_string()).await;
    assert_eq!(status, 400);
    assert_eq!(body, json!({ "status": "error", "reason": "invalid-json" }));
    assert_eq!(completion.calls(), 0);
    h.shutdown().await;
}

#[tokio::test]
async fn provider_redelivery_is_answered_once() {
    let completion = ScriptedCompletion::new(Duration::ZERO);
    let delivery = Arc::new(RecordingDelivery::default());
    let h = Harness::start(completion.clone(), delivery.clone(), settings()).await;

    let payload = gupshup_payload("gs-42", "15550009999", "fever since morning");
    let (_, first) = h.post(&payload).await;
    assert_eq!(first["status"], "success");
    let (status, second) = h.post(&payload).await;
    assert_eq!(status, 200);
    assert_eq!(second["status"], "ignored");
    assert_eq!(second["reason"], "duplicate");
    assert_eq!(second["messageId"], "gs-42");

    assert_eq!(completion.calls(), 1);
    assert_eq!(delivery.sent().len(), 1);

    let health: Value = h
        .client
        .get(format!("{}/", h.base))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health JSON");
    assert_eq!(health["stats"]["received"], 2);
    assert_eq!(health["stats"]["succeeded"], 1);
    assert_eq!(health["stats"]["duplicates"], 1);
    assert_eq!(health["stats"]["trackedIds"], 1);
    h.shutdown().await;
}

#[tokio::test]
async fn shutdown_finishes_in_flight_and_asks_provider_to_retry_queued() {
    let completion = ScriptedCompletion::new(Duration::from_millis(300));
    let delivery = Arc::new(RecordingDelivery::default());
    let mut s = settings();
    s.workers = 1;
    let h = Harness::start(completion.clone(), delivery.clone(), s).await;

    let first = {
        let (client, base) = (h.client.clone(), h.base.clone());
        let body = json!({ "id": "a", "sender": "1555", "message": "first" }).to_string();
        tokio::spawn(async move { post_raw(&client, &base, body).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let (client, base) = (h.client.clone(), h.base.clone());
        let body = json!({ "id": "b", "sender": "1555", "message": "second" }).to_string();
        tokio::spawn(async move { post_raw(&client, &base, body).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.shutdown().await;

    let (status, body) = first.await.expect("first request");
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    let (status, body) = second.await.expect("second request");
    assert_eq!(status, 503);
    assert_eq!(body["status"], "retry");

    assert_eq!(completion.calls(), 1);
    assert_eq!(delivery.sent().len(), 1);
}
