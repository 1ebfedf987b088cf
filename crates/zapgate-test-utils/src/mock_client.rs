// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock browser client adapter for deterministic testing.
//!
//! [`MockWebClient`] implements `WebClient` with scripted initialize
//! behavior, injectable events, settable states, and captured sends.
//! [`MockClientFactory`] hands the engine a fresh mock per `create` call and
//! keeps every handle reachable for assertions.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use zapgate_core::{
    ClientEvent, ClientFactory, ClientInfo, ClientState, MediaRef, WebClient, ZapgateError,
};

/// Scripted behavior applied to the next client created for an instance.
#[derive(Clone)]
pub struct MockBehavior {
    /// Events emitted (in order) when `initialize` is called.
    pub init_events: Vec<ClientEvent>,
    /// Error returned from `initialize` instead of emitting events.
    pub init_error: Option<String>,
    /// Sleep before `initialize` returns; simulates a frozen adapter.
    pub init_delay: Option<Duration>,
    /// Initial `get_state` answer.
    pub state: ClientState,
    /// Initial `socket_state` answer.
    pub socket_state: ClientState,
    pub browser_healthy: bool,
    pub heap_bytes: u64,
    pub phone: Option<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            init_events: vec![ClientEvent::Qr("mock-qr-payload".to_string())],
            init_error: None,
            init_delay: None,
            state: ClientState::Opening,
            socket_state: ClientState::Connected,
            browser_healthy: true,
            heap_bytes: 64 * 1024 * 1024,
            phone: Some("5511999887766".to_string()),
        }
    }
}

impl MockBehavior {
    /// A client that pairs: emits a QR on initialize.
    pub fn cold() -> Self {
        Self::default()
    }

    /// A client with a valid stored session: authenticates and readies.
    pub fn warm() -> Self {
        Self {
            init_events: vec![
                ClientEvent::Loading {
                    percent: 100,
                    message: "loading chats".to_string(),
                },
                ClientEvent::Authenticated,
                ClientEvent::Ready,
            ],
            state: ClientState::Connected,
            ..Self::default()
        }
    }
}

/// A mock browser-backed client driven entirely by the test.
pub struct MockWebClient {
    instance_id: String,
    behavior: Mutex<MockBehavior>,
    events_tx: mpsc::Sender<ClientEvent>,
    state: Mutex<ClientState>,
    socket_state: Mutex<ClientState>,
    browser_healthy: AtomicBool,
    heap_bytes: AtomicU64,
    sent: Mutex<Vec<(String, String)>>,
    send_error: Mutex<Option<String>>,
    state_error: Mutex<Option<String>>,
    init_calls: AtomicU32,
    destroy_calls: AtomicU32,
    takeover_calls: AtomicU32,
    destroyed: AtomicBool,
}

impl MockWebClient {
    fn new(instance_id: &str, behavior: MockBehavior, events_tx: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            state: Mutex::new(behavior.state.clone()),
            socket_state: Mutex::new(behavior.socket_state.clone()),
            browser_healthy: AtomicBool::new(behavior.browser_healthy),
            heap_bytes: AtomicU64::new(behavior.heap_bytes),
            behavior: Mutex::new(behavior),
            events_tx,
            sent: Mutex::new(Vec::new()),
            send_error: Mutex::new(None),
            state_error: Mutex::new(None),
            init_calls: AtomicU32::new(0),
            destroy_calls: AtomicU32::new(0),
            takeover_calls: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Push an event into the engine as if the adapter emitted it.
    pub async fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// Change the `get_state` answer.
    pub async fn set_state(&self, state: ClientState) {
        *self.state.lock().await = state;
    }

    /// Change the `socket_state` answer.
    pub async fn set_socket_state(&self, state: ClientState) {
        *self.socket_state.lock().await = state;
    }

    pub fn set_browser_healthy(&self, healthy: bool) {
        self.browser_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_heap_bytes(&self, bytes: u64) {
        self.heap_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Make every send fail with the given message until cleared.
    pub async fn fail_sends(&self, message: Option<&str>) {
        *self.send_error.lock().await = message.map(|m| m.to_string());
    }

    /// Make every `get_state` call fail with the given message until cleared.
    pub async fn fail_state_checks(&self, message: Option<&str>) {
        *self.state_error.lock().await = message.map(|m| m.to_string());
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Messages sent through this client, as `(to, body)` pairs.
    pub async fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn takeover_calls(&self) -> u32 {
        self.takeover_calls.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebClient for MockWebClient {
    async fn initialize(&self) -> Result<(), ZapgateError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().await.clone();

        // Progress events surface before a scripted freeze or failure, the
        // way a real adapter reports sync progress and then stalls.
        for event in behavior.init_events {
            let _ = self.events_tx.send(event).await;
        }
        if let Some(delay) = behavior.init_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = behavior.init_error {
            return Err(ZapgateError::Client {
                message,
                source: None,
            });
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<ClientState, ZapgateError> {
        if let Some(message) = self.state_error.lock().await.clone() {
            return Err(ZapgateError::Client {
                message,
                source: None,
            });
        }
        Ok(self.state.lock().await.clone())
    }

    async fn socket_state(&self) -> Result<ClientState, ZapgateError> {
        Ok(self.socket_state.lock().await.clone())
    }

    async fn browser_healthy(&self) -> Result<bool, ZapgateError> {
        Ok(self.browser_healthy.load(Ordering::SeqCst))
    }

    async fn heap_used_bytes(&self) -> Result<u64, ZapgateError> {
        Ok(self.heap_bytes.load(Ordering::SeqCst))
    }

    async fn info(&self) -> Result<Option<ClientInfo>, ZapgateError> {
        let behavior = self.behavior.lock().await;
        Ok(behavior.phone.as_ref().map(|phone| ClientInfo {
            phone: Some(phone.clone()),
            pushname: Some("Mock".to_string()),
            platform: Some("mock".to_string()),
        }))
    }

    async fn take_over(&self) -> Result<(), ZapgateError> {
        self.takeover_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().await = ClientState::Connected;
        Ok(())
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<String, ZapgateError> {
        if let Some(message) = self.send_error.lock().await.clone() {
            return Err(ZapgateError::Client {
                message,
                source: None,
            });
        }
        self.sent
            .lock()
            .await
            .push((to.to_string(), body.to_string()));
        Ok(format!("mock-wire-{}", uuid::Uuid::new_v4()))
    }

    async fn send_media(
        &self,
        to: &str,
        media: &MediaRef,
        caption: Option<&str>,
    ) -> Result<String, ZapgateError> {
        if let Some(message) = self.send_error.lock().await.clone() {
            return Err(ZapgateError::Client {
                message,
                source: None,
            });
        }
        let label = media
            .url
            .clone()
            .or_else(|| media.filename.clone())
            .unwrap_or_else(|| "media".to_string());
        self.sent
            .lock()
            .await
            .push((to.to_string(), format!("[media:{label}] {}", caption.unwrap_or(""))));
        Ok(format!("mock-wire-{}", uuid::Uuid::new_v4()))
    }

    async fn destroy(&self) -> Result<(), ZapgateError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out scripted mocks, one per `create` call.
#[derive(Default)]
pub struct MockClientFactory {
    behaviors: DashMap<String, MockBehavior>,
    clients: DashMap<String, Arc<MockWebClient>>,
    create_counts: DashMap<String, u32>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next client created for `id`.
    pub fn script(&self, id: &str, behavior: MockBehavior) {
        self.behaviors.insert(id.to_string(), behavior);
    }

    /// The most recent client created for `id`.
    pub fn client(&self, id: &str) -> Option<Arc<MockWebClient>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// How many times the engine asked for a client for `id`.
    pub fn create_count(&self, id: &str) -> u32 {
        self.create_counts.get(id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn create(
        &self,
        instance_id: &str,
    ) -> Result<(Arc<dyn WebClient>, mpsc::Receiver<ClientEvent>), ZapgateError> {
        let behavior = self
            .behaviors
            .get(instance_id)
            .map(|b| b.clone())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(64);
        let client = Arc::new(MockWebClient::new(instance_id, behavior, tx));
        self.clients.insert(instance_id.to_string(), client.clone());
        *self
            .create_counts
            .entry(instance_id.to_string())
            .or_insert(0) += 1;

        Ok((client, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_emits_scripted_events() {
        let factory = MockClientFactory::new();
        factory.script("a", MockBehavior::warm());

        let (client, mut rx) = factory.create("a").await.unwrap();
        client.initialize().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ClientEvent::Loading { percent: 100, .. }));
        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::Authenticated));
        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::Ready));
    }

    #[tokio::test]
    async fn default_behavior_pairs_with_qr() {
        let factory = MockClientFactory::new();
        let (client, mut rx) = factory.create("a").await.unwrap();
        client.initialize().await.unwrap();

        match rx.recv().await.unwrap() {
            ClientEvent::Qr(payload) => assert_eq!(payload, "mock-qr-payload"),
            other => panic!("expected QR event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_capture_and_failure_injection() {
        let factory = MockClientFactory::new();
        let (client, _rx) = factory.create("a").await.unwrap();

        let wire = client.send_text("x@c.us", "hello").await.unwrap();
        assert!(wire.starts_with("mock-wire-"));

        let mock = factory.client("a").unwrap();
        assert_eq!(mock.sent_count().await, 1);

        mock.fail_sends(Some("Session closed")).await;
        assert!(client.send_text("x@c.us", "boom").await.is_err());

        mock.fail_sends(None).await;
        assert!(client.send_text("x@c.us", "ok").await.is_ok());
    }

    #[tokio::test]
    async fn create_count_tracks_recreations() {
        let factory = MockClientFactory::new();
        assert_eq!(factory.create_count("a"), 0);
        factory.create("a").await.unwrap();
        factory.create("a").await.unwrap();
        assert_eq!(factory.create_count("a"), 2);
    }

    #[tokio::test]
    async fn init_error_is_returned() {
        let factory = MockClientFactory::new();
        factory.script(
            "a",
            MockBehavior {
                init_error: Some("browser failed to launch".to_string()),
                ..MockBehavior::default()
            },
        );
        let (client, _rx) = factory.create("a").await.unwrap();
        assert!(client.initialize().await.is_err());
    }
}
