//! Test doubles for the engine's collaborators.
#![allow(dead_code)]

use async_trait::async_trait;
use chat_core::{
    ChatError, ChatEvent, ChatMessageContent, ChatService, ChatSettings, CryptoProvider,
    DeviceDirectory, DevicePublicKeys, IncomingHandler, KvStore, ReceiptKind, SealContext,
    Subscription, Transport, Unsealed, WireMessage,
};
use chrono::Utc;
use mockall::mock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LOCAL: &str = "device-me";

pub fn keys(peer: &str) -> DevicePublicKeys {
    DevicePublicKeys {
        identity_key: format!("{}-identity", peer),
        signing_key: format!("{}-signing", peer),
        pre_key_bundle: None,
    }
}

/// Settings with no background drain and no backoff, so tests drive every
/// pass and each pass retries.
pub fn settings() -> ChatSettings {
    ChatSettings {
        drain_on_enqueue: false,
        retry_backoff: false,
        send_timeout_secs: 1,
        ..ChatSettings::default()
    }
}

// ── Crypto ─────────────────────────────────────────────────────

/// "Seals" by prefixing the sender id and a NUL byte.
pub struct PlainCrypto {
    pub local_device_id: String,
}

impl PlainCrypto {
    pub fn new(local_device_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_device_id: local_device_id.to_string(),
        })
    }
}

pub fn envelope(sender: &str, plaintext: &[u8]) -> Vec<u8> {
    let mut out = sender.as_bytes().to_vec();
    out.push(0);
    out.extend_from_slice(plaintext);
    out
}

#[async_trait]
impl CryptoProvider for PlainCrypto {
    async fn seal(&self, _context: &SealContext, plaintext: &[u8]) -> chat_core::Result<Vec<u8>> {
        Ok(envelope(&self.local_device_id, plaintext))
    }

    async fn unseal(&self, payload: &[u8]) -> chat_core::Result<Unsealed> {
        let split = payload
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ChatError::CryptoError("bad envelope".into()))?;
        let sender_id = String::from_utf8(payload[..split].to_vec())
            .map_err(|e| ChatError::CryptoError(e.to_string()))?;
        Ok(Unsealed {
            sender_id,
            plaintext: payload[split + 1..].to_vec(),
        })
    }
}

/// Inbound wire message from `sender` to the local device.
pub fn inbound(message_id: &str, sender: &str, text: &str) -> WireMessage {
    let body = ChatMessageContent {
        text: text.to_string(),
        sent_at: Utc::now(),
        expiration: None,
    };
    WireMessage {
        message_id: message_id.to_string(),
        recipient_id: LOCAL.to_string(),
        payload: envelope(sender, &serde_json::to_vec(&body).unwrap()),
    }
}

// ── Device directory ───────────────────────────────────────────

mock! {
    pub Devices {}

    #[async_trait]
    impl DeviceDirectory for Devices {
        async fn lookup_public_keys(&self, device_id: &str) -> chat_core::Result<Option<DevicePublicKeys>>;
    }
}

/// Directory that knows every device.
pub fn open_directory() -> Arc<MockDevices> {
    let mut devices = MockDevices::new();
    devices
        .expect_lookup_public_keys()
        .returning(|id| Ok(Some(keys(id))));
    Arc::new(devices)
}

// ── Transport ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SendMode {
    Ok,
    Fail,
    /// Wait this long before succeeding.
    Slow(Duration),
    /// The peer's receipt arrives before `send` returns.
    Acked(ReceiptKind),
    /// As `Acked`, but the local side then sees the connection drop.
    AckedThenFail(ReceiptKind),
    /// A failure retrying cannot fix.
    Reject,
}

/// Transport that records sends and follows a script of outcomes.
pub struct ScriptedTransport {
    default_mode: Mutex<SendMode>,
    script: Mutex<VecDeque<SendMode>>,
    sent: Mutex<Vec<WireMessage>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    handler: Mutex<Option<IncomingHandler>>,
    receipt_results: Mutex<Vec<Result<(), String>>>,
}

impl ScriptedTransport {
    pub fn new(mode: SendMode) -> Arc<Self> {
        Arc::new(Self {
            default_mode: Mutex::new(mode),
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            handler: Mutex::new(None),
            receipt_results: Mutex::new(Vec::new()),
        })
    }

    /// Outcomes for the next sends, before falling back to the default.
    pub fn then(&self, modes: &[SendMode]) {
        self.script.lock().unwrap().extend(modes.iter().copied());
    }

    pub fn set_mode(&self, mode: SendMode) {
        *self.default_mode.lock().unwrap() = mode;
    }

    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_ids(&self) -> Vec<String> {
        self.sent().into_iter().map(|w| w.message_id).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Results of receipts delivered from inside `send`.
    pub fn receipt_results(&self) -> Vec<Result<(), String>> {
        self.receipt_results.lock().unwrap().clone()
    }

    pub fn handler(&self) -> Option<IncomingHandler> {
        self.handler.lock().unwrap().clone()
    }

    /// Deliver an inbound message through the registered handler.
    pub async fn deliver(&self, wire: WireMessage) -> Result<(), String> {
        let handler = self
            .handler()
            .ok_or_else(|| "no handler registered".to_string())?;
        handler.handle_message(wire).await
    }

    pub async fn deliver_receipt(&self, message_id: &str, kind: ReceiptKind) -> Result<(), String> {
        let handler = self
            .handler()
            .ok_or_else(|| "no handler registered".to_string())?;
        handler.handle_receipt(message_id.to_string(), kind).await
    }

    fn next_mode(&self) -> SendMode {
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| *self.default_mode.lock().unwrap())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, message: WireMessage) -> chat_core::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match self.next_mode() {
            SendMode::Ok => Ok(()),
            SendMode::Fail => Err(ChatError::TransportError("connection refused".into())),
            SendMode::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            SendMode::Acked(kind) => {
                let ack = self.deliver_receipt(&message.message_id, kind).await;
                self.receipt_results.lock().unwrap().push(ack);
                Ok(())
            }
            SendMode::AckedThenFail(kind) => {
                let ack = self.deliver_receipt(&message.message_id, kind).await;
                self.receipt_results.lock().unwrap().push(ack);
                Err(ChatError::TransportError("connection reset".into()))
            }
            SendMode::Reject => Err(ChatError::MalformedMessage("rejected by relay".into())),
        };
        if result.is_ok() {
            self.sent.lock().unwrap().push(message);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn on_receive(&self, handler: IncomingHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

// ── Engine + events ────────────────────────────────────────────

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn open_service(
    store: Arc<dyn KvStore>,
    transport: Arc<ScriptedTransport>,
    settings: ChatSettings,
) -> ChatService {
    init_test_logging();
    ChatService::open(
        LOCAL.to_string(),
        settings,
        store,
        transport,
        PlainCrypto::new(LOCAL),
        open_directory(),
    )
    .await
    .unwrap()
}

/// Collects every published event.
pub struct EventLog {
    events: Arc<Mutex<Vec<ChatEvent>>>,
    _subscription: Subscription,
}

impl EventLog {
    pub fn attach(service: &ChatService) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = service.subscribe(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn all(&self) -> Vec<ChatEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Status sequence observed for one message.
    pub fn statuses(&self, message_id: &str) -> Vec<chat_core::MessageStatus> {
        self.all()
            .iter()
            .filter(|e| e.message_id() == Some(message_id))
            .filter_map(|e| e.status())
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&ChatEvent) -> bool) -> usize {
        self.all().iter().filter(|e| pred(e)).count()
    }
}
