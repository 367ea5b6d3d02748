//! Chat orchestrator: ties the directory, message store, outbound queue and
//! inbound pipeline to the injected transport and crypto collaborators.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::chat_delivery_queue::{DeliveryQueue, PendingDelivery};
use super::chat_directory::ConversationDirectory;
use super::chat_events::{ChatEvent, EventBus, EventError, ExpireReason, Subscription};
use super::chat_ingest::InboundPipeline;
use super::chat_message_store::MessageStore;
use super::chat_transport::{InboundHandler, Transport};
use super::chat_types::{
    ChatMessageContent, Conversation, ConversationId, DeviceId, ExpirationPolicy, Message,
    MessageId, MessageStatus, ReceiptKind, WireMessage,
};
use super::config::ChatSettings;
use crate::crypto::{CryptoProvider, DeviceDirectory, DevicePublicKeys, SealContext};
use crate::error::{ChatError, Result};
use crate::storage::KvStore;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: Vec<MessageId>,
    pub failed: Vec<MessageId>,
    /// Given up on after exhausting the retry budget.
    pub expired: Vec<MessageId>,
    /// Ready entries another pass already held, or that left the queue.
    pub skipped: usize,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.sent.len() + self.failed.len() + self.expired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempted() == 0 && self.skipped == 0
    }
}

enum SendOutcome {
    Sent(MessageId),
    Failed(MessageId),
    Expired(MessageId),
    Skipped,
}

struct Ticker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Cheap to clone; all clones share the same engine.
#[derive(Clone)]
pub struct ChatService {
    local_device_id: DeviceId,
    settings: ChatSettings,
    directory: Arc<ConversationDirectory>,
    messages: Arc<MessageStore>,
    queue: Arc<DeliveryQueue>,
    pipeline: Arc<InboundPipeline>,
    transport: Arc<dyn Transport>,
    crypto: Arc<dyn CryptoProvider>,
    devices: Arc<dyn DeviceDirectory>,
    events: EventBus,
    ticker: Arc<StdMutex<Option<Ticker>>>,
}

impl ChatService {
    /// Load persisted state and reconcile it after a previous run.
    pub async fn open(
        local_device_id: DeviceId,
        settings: ChatSettings,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> Result<Self> {
        let events = EventBus::new();
        let directory = Arc::new(
            ConversationDirectory::load(local_device_id.clone(), store.clone(), events.clone())
                .await?,
        );
        let messages = Arc::new(MessageStore::load(store.clone()).await?);
        let queue = Arc::new(DeliveryQueue::load(store).await?);
        let pipeline = Arc::new(InboundPipeline::new(
            directory.clone(),
            messages.clone(),
            crypto.clone(),
            devices.clone(),
            events.clone(),
            settings.max_message_size,
        ));

        let service = Self {
            local_device_id,
            settings,
            directory,
            messages,
            queue,
            pipeline,
            transport,
            crypto,
            devices,
            events,
            ticker: Arc::new(StdMutex::new(None)),
        };
        service.recover().await?;
        Ok(service)
    }

    /// Messages caught in `Sending` by a crash go back to `Failed`, queued
    /// messages missing from the queue snapshot are re-queued, and queue
    /// entries without a queued message are dropped.
    async fn recover(&self) -> Result<()> {
        let mut statuses: HashMap<MessageId, MessageStatus> = HashMap::new();
        let mut requeue = Vec::new();

        for message in self.messages.all().await {
            let mut status = message.status;
            if status == MessageStatus::Sending {
                self.messages
                    .transition(&message.id, MessageStatus::Failed, |_| {})
                    .await?;
                log::warn!("Message {} was interrupted mid-send, marked failed", message.id);
                status = MessageStatus::Failed;
            }
            if message.is_outgoing && status.is_queued() && !self.queue.contains(&message.id).await
            {
                requeue.push(PendingDelivery::new(
                    message.id.clone(),
                    message.conversation_id.clone(),
                    message.recipient_id.clone(),
                ));
            }
            statuses.insert(message.id, status);
        }

        let requeued = requeue.len();
        for delivery in requeue {
            self.queue.enqueue(delivery).await?;
        }
        let dropped = self
            .queue
            .retain(|p| statuses.get(&p.message_id).is_some_and(|s| s.is_queued()))
            .await?;

        if requeued > 0 || dropped > 0 {
            log::info!(
                "Outbound queue reconciled: {} re-queued, {} stale entries dropped",
                requeued,
                dropped
            );
        }
        Ok(())
    }

    /// Start the periodic drain/expiry ticker and register for inbound
    /// traffic. Calling it again while running is a no-op.
    ///
    /// Must be called from within a tokio runtime; the ticker is spawned on
    /// the current one.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ChatError::RuntimeUnavailable(e.to_string()))?;
        let mut ticker = self.ticker_guard();
        if ticker.is_some() {
            return Ok(());
        }

        self.transport
            .on_receive(Arc::new(ChatIncomingAdapter::new(self.pipeline.clone())));

        let (shutdown, mut stop) = oneshot::channel::<()>();
        let service = self.clone();
        let period = self.settings.drain_interval();
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => service.tick().await,
                }
            }
            log::info!("Chat delivery ticker stopped");
        });

        *ticker = Some(Ticker { shutdown, handle });
        log::info!(
            "Chat delivery ticker started ({}s interval)",
            self.settings.drain_interval_secs
        );
        Ok(())
    }

    /// Stop the ticker and wait for an in-progress pass to finish.
    pub async fn dispose(&self) {
        let ticker = self.ticker_guard().take();
        if let Some(ticker) = ticker {
            let _ = ticker.shutdown.send(());
            if let Err(e) = ticker.handle.await {
                log::error!("Chat delivery ticker ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker_guard().is_some()
    }

    async fn tick(&self) {
        match self.sweep_expired().await {
            Ok(expired) if !expired.is_empty() => {
                log::info!("Expired {} messages", expired.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("Expiry sweep failed: {}", e),
        }
        let report = self.drain().await;
        if !report.is_empty() {
            log::debug!(
                "Drain: {} sent, {} failed, {} expired, {} skipped",
                report.sent.len(),
                report.failed.len(),
                report.expired.len(),
                report.skipped
            );
        }
    }

    // ── Outbound ───────────────────────────────────────────────

    /// Queue a message for `recipient_id`. The message is visible in history
    /// as `Pending` when this returns; sending happens in the background.
    ///
    /// `recipient_keys` is only needed for a first message to an unknown peer;
    /// without it the device directory is consulted.
    pub async fn enqueue(
        &self,
        recipient_id: &str,
        recipient_keys: Option<DevicePublicKeys>,
        content: &str,
        expiration: Option<ExpirationPolicy>,
    ) -> Result<Message> {
        if content.len() > self.settings.max_message_size {
            return Err(ChatError::MessageTooLarge {
                size: content.len(),
                max: self.settings.max_message_size,
            });
        }

        let conv = self.resolve_conversation(recipient_id, recipient_keys).await?;
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conv.id.clone(),
            sender_id: self.local_device_id.clone(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            is_outgoing: true,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            expiration,
        };

        self.messages.append(message.clone()).await?;
        self.directory.touch(&conv.id, &message).await?;
        self.events.publish(ChatEvent::MessagePending {
            conversation_id: conv.id.clone(),
            message_id: message.id.clone(),
        });
        self.queue
            .enqueue(PendingDelivery::new(
                message.id.clone(),
                conv.id,
                message.recipient_id.clone(),
            ))
            .await?;

        if self.settings.drain_on_enqueue {
            let service = self.clone();
            tokio::spawn(async move {
                service.drain().await;
            });
        }
        Ok(message)
    }

    async fn resolve_conversation(
        &self,
        peer_id: &str,
        keys: Option<DevicePublicKeys>,
    ) -> Result<Conversation> {
        if let Some(conv) = self.directory.find_by_peer(peer_id).await {
            return Ok(conv);
        }
        let keys = match keys {
            Some(keys) => Some(keys),
            None => self.devices.lookup_public_keys(peer_id).await?,
        };
        self.directory.get_or_create(peer_id, keys).await
    }

    /// Attempt every eligible queued message once.
    ///
    /// Messages are independent: one failure never blocks another. A message
    /// already `Sending` (held by an overlapping pass) is skipped.
    pub async fn drain(&self) -> DrainReport {
        let ready = self.queue.ready(self.settings.retry_backoff).await;
        if ready.is_empty() {
            return DrainReport::default();
        }

        let attempts: Vec<_> = ready.into_iter().map(|entry| self.attempt(entry)).collect();
        let outcomes: Vec<SendOutcome> = futures::stream::iter(attempts)
            .buffer_unordered(self.settings.max_concurrent_sends.max(1))
            .collect()
            .await;

        let mut report = DrainReport::default();
        for outcome in outcomes {
            match outcome {
                SendOutcome::Sent(id) => report.sent.push(id),
                SendOutcome::Failed(id) => report.failed.push(id),
                SendOutcome::Expired(id) => report.expired.push(id),
                SendOutcome::Skipped => report.skipped += 1,
            }
        }
        report
    }

    async fn attempt(&self, entry: PendingDelivery) -> SendOutcome {
        let message = match self.messages.try_claim(&entry.message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => return SendOutcome::Skipped,
            Err(e) => {
                log::warn!("Cannot claim {} for sending: {}", entry.message_id, e);
                return SendOutcome::Skipped;
            }
        };

        let attempt = match self.queue.begin_attempt(&message.id).await {
            Ok(Some(n)) => n,
            Ok(None) => entry.attempts + 1,
            Err(e) => {
                log::warn!("Could not record attempt for {}: {}", message.id, e);
                entry.attempts + 1
            }
        };
        self.events.publish(ChatEvent::MessageSending {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            attempt,
        });

        let timeout = self.settings.send_timeout();
        let result = match tokio::time::timeout(timeout, self.seal_and_send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Timeout(self.settings.send_timeout_secs)),
        };

        let outcome = match result {
            Ok(()) => self.complete_send(&message).await,
            Err(e) => {
                if self.messages.has_early_receipt(&message.id).await {
                    log::info!(
                        "Send of {} reported {} but the peer already acknowledged it",
                        message.id,
                        e
                    );
                    self.complete_send(&message).await
                } else {
                    self.fail_send(&message, attempt, e).await
                }
            }
        };
        match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Failed to record send result for {}: {}", message.id, e);
                self.release_claim(&message.id).await;
                SendOutcome::Failed(message.id.clone())
            }
        }
    }

    /// Never leave a message claimed after its attempt is over.
    async fn release_claim(&self, message_id: &str) {
        let still_sending = matches!(
            self.messages.get(message_id).await,
            Ok(Message {
                status: MessageStatus::Sending,
                ..
            })
        );
        if !still_sending {
            return;
        }
        if let Err(e) = self
            .messages
            .transition(message_id, MessageStatus::Failed, |_| {})
            .await
        {
            log::error!("Message {} may be stuck sending: {}", message_id, e);
        }
    }

    async fn seal_and_send(&self, message: &Message) -> Result<()> {
        let conv = self
            .directory
            .get(&message.conversation_id)
            .await
            .ok_or_else(|| ChatError::ConversationNotFound(message.conversation_id.clone()))?;

        let body = ChatMessageContent {
            text: message.content.clone(),
            sent_at: message.timestamp,
            expiration: message.expiration,
        };
        let plaintext = serde_json::to_vec(&body)?;
        let context = SealContext {
            conversation_id: conv.id,
            local_device_id: self.local_device_id.clone(),
            peer_id: conv.peer_id,
            peer_keys: conv.peer_keys,
        };
        let payload = self.crypto.seal(&context, &plaintext).await?;

        self.transport
            .send(WireMessage {
                message_id: message.id.clone(),
                recipient_id: message.recipient_id.clone(),
                payload,
            })
            .await
    }

    async fn complete_send(&self, message: &Message) -> Result<SendOutcome> {
        let now = Utc::now();
        let events = &self.events;
        let sent = self
            .messages
            .transition_notify(
                &message.id,
                MessageStatus::Sent,
                |m| m.sent_at = Some(now),
                |m| {
                    events.publish(ChatEvent::MessageSent {
                        conversation_id: m.conversation_id.clone(),
                        message_id: m.id.clone(),
                    })
                },
            )
            .await?;
        log::info!("Sent message {} to {}", sent.id, sent.recipient_id);

        // The message is terminal now; queue and preview upkeep must not undo that.
        if let Err(e) = self.queue.remove(&sent.id).await {
            log::warn!("Failed to drop {} from the outbound queue: {}", sent.id, e);
        }
        if let Err(e) = self.directory.touch(&sent.conversation_id, &sent).await {
            log::warn!("Failed to touch conversation {}: {}", sent.conversation_id, e);
        }
        if let Some(kind) = self.messages.take_early_receipt(&sent.id).await {
            if let Err(e) = self.pipeline.apply_receipt(&sent.id, kind).await {
                log::warn!("Failed to apply held {:?} receipt for {}: {}", kind, sent.id, e);
            }
        }
        Ok(SendOutcome::Sent(sent.id))
    }

    async fn fail_send(&self, message: &Message, attempt: u32, error: ChatError) -> Result<SendOutcome> {
        log::warn!(
            "Delivery of {} failed: {} (attempt {})",
            message.id,
            error,
            attempt
        );
        let event_error = EventError::from(&error);
        let events = &self.events;
        let failed = self
            .messages
            .transition_notify(
                &message.id,
                MessageStatus::Failed,
                |_| {},
                |m| {
                    events.publish(ChatEvent::MessageFailed {
                        conversation_id: m.conversation_id.clone(),
                        message_id: m.id.clone(),
                        attempt,
                        error: event_error.clone(),
                    })
                },
            )
            .await?;
        let permanent = !event_error.kind.is_transient();
        self.queue.record_failure(&failed.id, event_error).await?;

        if permanent {
            log::warn!("Giving up on {}: the failure is not retryable", failed.id);
            self.expire(&failed.id, ExpireReason::Undeliverable).await?;
            return Ok(SendOutcome::Expired(failed.id));
        }
        if !self.settings.allows_retry(attempt) {
            log::warn!(
                "Giving up on {} after {} attempts",
                failed.id,
                attempt
            );
            self.expire(&failed.id, ExpireReason::RetriesExhausted).await?;
            return Ok(SendOutcome::Expired(failed.id));
        }
        Ok(SendOutcome::Failed(failed.id))
    }

    async fn expire(&self, message_id: &str, reason: ExpireReason) -> Result<Message> {
        let events = &self.events;
        let expired = self
            .messages
            .transition_notify(
                message_id,
                MessageStatus::Expired,
                |_| {},
                |m| {
                    events.publish(ChatEvent::MessageExpired {
                        conversation_id: m.conversation_id.clone(),
                        message_id: m.id.clone(),
                        reason,
                    })
                },
            )
            .await?;
        self.queue.remove(message_id).await?;
        Ok(expired)
    }

    /// Abandon a queued message. It stays in history as `Expired`.
    ///
    /// Fails with `MessageInFlight` while a send attempt holds it.
    pub async fn cancel(&self, message_id: &str) -> Result<Message> {
        let message = self.messages.get(message_id).await?;
        match message.status {
            MessageStatus::Sending => Err(ChatError::MessageInFlight(message_id.to_string())),
            MessageStatus::Pending | MessageStatus::Failed => {
                match self.expire(message_id, ExpireReason::Cancelled).await {
                    Err(ChatError::InvalidTransition {
                        from: MessageStatus::Sending,
                        ..
                    }) => Err(ChatError::MessageInFlight(message_id.to_string())),
                    result => {
                        if result.is_ok() {
                            log::info!("Cancelled message {}", message_id);
                        }
                        result
                    }
                }
            }
            from => Err(ChatError::InvalidTransition {
                id: message_id.to_string(),
                from,
                to: MessageStatus::Expired,
            }),
        }
    }

    /// Apply expiration policies. Messages mid-send are left alone until the
    /// attempt settles.
    pub async fn sweep_expired(&self) -> Result<Vec<MessageId>> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for message in self.messages.all().await {
            if matches!(message.status, MessageStatus::Expired | MessageStatus::Sending) {
                continue;
            }
            if !message.expires_at().is_some_and(|at| at <= now) {
                continue;
            }
            match self.expire(&message.id, ExpireReason::Policy).await {
                Ok(_) => expired.push(message.id),
                // Claimed by a drain since the snapshot; next sweep.
                Err(ChatError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    // ── Inbound ────────────────────────────────────────────────

    pub async fn ingest(&self, wire: WireMessage) -> Result<Message> {
        self.pipeline.ingest(wire).await
    }

    pub async fn apply_receipt(&self, message_id: &str, kind: ReceiptKind) -> Result<Option<Message>> {
        self.pipeline.apply_receipt(message_id, kind).await
    }

    /// Clear unread and mark inbound messages read. Unknown conversations are
    /// a no-op. Returns whether anything changed.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<bool> {
        let cleared = self.directory.mark_read(conversation_id).await?;

        let now = Utc::now();
        let events = &self.events;
        let mut stamped = 0;
        for message in self.messages.messages(conversation_id, usize::MAX, None).await {
            if message.is_outgoing || message.status != MessageStatus::Delivered {
                continue;
            }
            match self
                .messages
                .transition_notify(
                    &message.id,
                    MessageStatus::Read,
                    |m| m.read_at = Some(now),
                    |m| {
                        events.publish(ChatEvent::MessageRead {
                            conversation_id: m.conversation_id.clone(),
                            message_id: m.id.clone(),
                            at: now,
                        })
                    },
                )
                .await
            {
                Ok(_) => stamped += 1,
                Err(ChatError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let changed = cleared || stamped > 0;
        if changed {
            self.events.publish(ChatEvent::ConversationRead {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(changed)
    }

    /// The conversation currently on screen. Inbound messages for it do not
    /// count as unread.
    pub fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        self.directory.set_active(conversation_id);
    }

    // ── Observer API ───────────────────────────────────────────

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn local_device_id(&self) -> &str {
        &self.local_device_id
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.directory.list().await
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.directory.get(conversation_id).await
    }

    pub async fn conversation_with(&self, peer_id: &str) -> Option<Conversation> {
        self.directory.find_by_peer(peer_id).await
    }

    pub async fn get_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Vec<Message> {
        self.messages.messages(conversation_id, limit, before).await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message> {
        self.messages.get(message_id).await
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.len().await
    }

    pub async fn pending_deliveries(&self) -> Vec<PendingDelivery> {
        self.queue.entries().await
    }

    pub async fn total_unread(&self) -> u32 {
        self.directory.total_unread().await
    }

    fn ticker_guard(&self) -> MutexGuard<'_, Option<Ticker>> {
        match self.ticker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Bridges transport callbacks to the inbound pipeline.
pub struct ChatIncomingAdapter {
    pipeline: Arc<InboundPipeline>,
}

impl ChatIncomingAdapter {
    pub fn new(pipeline: Arc<InboundPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl InboundHandler for ChatIncomingAdapter {
    async fn handle_message(&self, message: WireMessage) -> std::result::Result<(), String> {
        self.pipeline
            .ingest(message)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn handle_receipt(
        &self,
        message_id: MessageId,
        kind: ReceiptKind,
    ) -> std::result::Result<(), String> {
        self.pipeline
            .apply_receipt(&message_id, kind)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
