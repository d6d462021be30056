//! Chat engine: rooms, messages, receipts, reactions, typing.
//!
//! A synchronous state machine owned by the host: explicit calls mutate
//! local state optimistically and hand frames to the connection manager;
//! inbound frames are applied through [`ChatEngine::handle_envelope`].
//! Messages within a room are kept in non-decreasing timestamp order —
//! out-of-order arrivals (typical after a reconnect) are re-sorted on
//! insertion, never appended blindly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ApiError, AttachmentDescriptor, AttachmentStore, AttachmentUpload, RestClient};
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::events::{EventBus, Subscription};
use crate::protocol::{now_ms, Envelope, EventKind, ProtocolError, UserIdentity};

/// Maximum message body length, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 4_000;
/// Maximum attachments per message.
pub const MAX_ATTACHMENTS: usize = 10;
/// Maximum bytes per attachment.
pub const MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

const ALLOWED_MIME_PREFIXES: &[&str] = &["image/", "video/", "audio/", "text/", "application/pdf"];

/// Room flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomKind {
    Direct,
    MultiParty,
}

/// A chat room as mirrored locally. Rooms are archived, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: Uuid,
    pub kind: RoomKind,
    /// Ordered, duplicate-free
    pub participants: Vec<Uuid>,
    pub unread: u32,
    pub archived: bool,
    pub metadata: HashMap<String, String>,
}

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Attachment,
}

/// Delivery status. Transitions are monotonic forward, except the
/// explicit `Failed → Sending` retry edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Failed => 3,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition(self, next: Self) -> bool {
        if self == Self::Failed {
            return next == Self::Sending;
        }
        next.rank() > self.rank()
    }
}

/// A reaction on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: Uuid,
}

/// A chat message. Id is assigned locally and immutable once the
/// transport has carried it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender: UserIdentity,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp_ms: u64,
    pub status: DeliveryStatus,
    pub read_by: HashSet<Uuid>,
    pub reactions: Vec<Reaction>,
    pub attachments: Vec<AttachmentDescriptor>,
    pub edited_at_ms: Option<u64>,
}

// Wire payloads shared with remote peers.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    /// Message / edit / delete target being acknowledged
    pub target: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditPayload {
    pub message_id: Uuid,
    pub content: String,
    pub edited_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePayload {
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: Uuid,
    pub emoji: String,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub reader: Uuid,
    pub message_ids: Vec<Uuid>,
}

/// Chat engine errors.
#[derive(Debug, Clone)]
pub enum ChatError {
    MessageTooLong { length: usize, max: usize },
    TooManyAttachments { count: usize, max: usize },
    AttachmentTooLarge { size: u64, max: u64 },
    UnsupportedAttachmentType(String),
    RateLimited,
    RoomCreationFailed(ApiError),
    RoomNotFound(Uuid),
    MessageNotFound(Uuid),
    Api(ApiError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLong { length, max } => {
                write!(f, "message of {length} chars exceeds limit of {max}")
            }
            Self::TooManyAttachments { count, max } => {
                write!(f, "{count} attachments exceed limit of {max}")
            }
            Self::AttachmentTooLarge { size, max } => {
                write!(f, "attachment of {size} bytes exceeds limit of {max}")
            }
            Self::UnsupportedAttachmentType(mime) => {
                write!(f, "unsupported attachment type: {mime}")
            }
            Self::RateLimited => write!(f, "message rate limit exceeded"),
            Self::RoomCreationFailed(e) => write!(f, "room creation failed: {e}"),
            Self::RoomNotFound(id) => write!(f, "unknown room {id}"),
            Self::MessageNotFound(id) => write!(f, "unknown message {id}"),
            Self::Api(e) => write!(f, "backend error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<ApiError> for ChatError {
    fn from(e: ApiError) -> Self {
        Self::Api(e)
    }
}

impl From<ProtocolError> for ChatError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Events published to UI consumers.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    RoomRegistered { room_id: Uuid },
    MessageReceived { room_id: Uuid, message_id: Uuid },
    MessageStatus { message_id: Uuid, status: DeliveryStatus },
    MessageEdited { room_id: Uuid, message_id: Uuid },
    MessageDeleted { room_id: Uuid, message_id: Uuid },
    ReactionToggled { message_id: Uuid },
    ReceiptRecorded { room_id: Uuid, message_id: Uuid },
    TypingChanged { room_id: Uuid },
    /// An optimistic edit/delete was in flight when the connection
    /// dropped; the local change stands but was never confirmed.
    ChangeUnconfirmed { room_id: Uuid, message_id: Uuid },
}

/// Chat tunables.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub max_message_length: usize,
    pub max_attachments: usize,
    pub max_attachment_bytes: u64,
    /// Typing indicator expiry since the last signal
    pub typing_timeout: Duration,
    /// Rolling rate-limit window
    pub rate_limit_window: Duration,
    /// Messages allowed per window
    pub rate_limit_max: usize,
    pub event_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: MAX_MESSAGE_LENGTH,
            max_attachments: MAX_ATTACHMENTS,
            max_attachment_bytes: MAX_ATTACHMENT_BYTES,
            typing_timeout: Duration::from_secs(5),
            rate_limit_window: Duration::from_secs(10),
            rate_limit_max: 20,
            event_capacity: 256,
        }
    }
}

/// Rolling-window rate limiter.
pub struct RateLimiter {
    window: Duration,
    max: usize,
    sent: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            sent: VecDeque::new(),
        }
    }

    /// Record an event at `now` if the window allows it.
    pub fn check_and_record(&mut self, now: Instant) -> bool {
        while self
            .sent
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            self.sent.pop_front();
        }
        if self.sent.len() >= self.max {
            return false;
        }
        self.sent.push_back(now);
        true
    }
}

/// What we are waiting on the server to acknowledge.
///
/// `transmitted` distinguishes in-flight frames (lost on a drop) from
/// frames still sitting in the offline queue (replayed on reconnect).
#[derive(Debug, Clone, Copy)]
enum PendingAck {
    Message { room_id: Uuid, transmitted: bool },
    Edit { room_id: Uuid, transmitted: bool },
    Delete { room_id: Uuid, transmitted: bool },
}

/// The chat engine. One per client session.
pub struct ChatEngine<A, S> {
    user: UserIdentity,
    api: A,
    store: S,
    conn: ConnectionHandle,
    config: ChatConfig,
    rooms: HashMap<Uuid, ChatRoom>,
    /// Per-room messages, timestamp-ordered
    messages: HashMap<Uuid, Vec<ChatMessage>>,
    /// message id → room id
    index: HashMap<Uuid, Uuid>,
    /// room → user → last typing signal
    typing: HashMap<Uuid, HashMap<Uuid, Instant>>,
    pending_acks: HashMap<Uuid, PendingAck>,
    rate: RateLimiter,
    events: EventBus<ChatEvent>,
}

impl<A: RestClient, S: AttachmentStore> ChatEngine<A, S> {
    pub fn new(user: UserIdentity, api: A, store: S, conn: ConnectionHandle) -> Self {
        Self::with_config(user, api, store, conn, ChatConfig::default())
    }

    pub fn with_config(
        user: UserIdentity,
        api: A,
        store: S,
        conn: ConnectionHandle,
        config: ChatConfig,
    ) -> Self {
        let rate = RateLimiter::new(config.rate_limit_window, config.rate_limit_max);
        let events = EventBus::new(config.event_capacity);
        Self {
            user,
            api,
            store,
            conn,
            config,
            rooms: HashMap::new(),
            messages: HashMap::new(),
            index: HashMap::new(),
            typing: HashMap::new(),
            pending_acks: HashMap::new(),
            rate,
            events,
        }
    }

    /// Subscribe to chat events.
    pub fn subscribe(&self) -> Subscription<ChatEvent> {
        self.events.subscribe()
    }

    // ── Room lifecycle ───────────────────────────────────────────

    /// Request room creation from the backend and register it locally.
    pub async fn create_chat(
        &mut self,
        participants: Vec<Uuid>,
        metadata: HashMap<String, String>,
    ) -> Result<Uuid, ChatError> {
        let room = self
            .api
            .create_room(self.user.user_id, participants, metadata)
            .await
            .map_err(ChatError::RoomCreationFailed)?;
        let room_id = room.id;
        self.register_room(room);
        log::info!("created room {room_id}");
        Ok(room_id)
    }

    /// Fetch room state and history, then subscribe to the room's
    /// event channel over the transport.
    pub async fn join_chat(&mut self, room_id: Uuid) -> Result<(), ChatError> {
        let room = self.api.fetch_room(room_id).await?;
        let mut history = self.api.fetch_history(room_id).await?;
        history.sort_by_key(|m| (m.timestamp_ms, m.id));

        for message in &history {
            self.index.insert(message.id, room_id);
        }
        self.messages.insert(room_id, history);
        self.register_room(room);

        self.conn
            .send(Envelope::new(
                EventKind::ChannelJoin,
                self.user.user_id,
                room_id,
                &(),
            )?)
            .await;
        log::info!("joined room {room_id}");
        Ok(())
    }

    fn register_room(&mut self, room: ChatRoom) {
        let room_id = room.id;
        self.rooms.insert(room_id, room);
        self.messages.entry(room_id).or_default();
        self.events.publish(ChatEvent::RoomRegistered { room_id });
    }

    /// Mark a room archived. The client never deletes rooms.
    pub fn archive_room(&mut self, room_id: Uuid) -> Result<(), ChatError> {
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(ChatError::RoomNotFound(room_id))?;
        room.archived = true;
        Ok(())
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Validate, create the local `Sending` message, and transmit.
    ///
    /// Returns the message id as soon as the frame is handed to the
    /// transport (or its offline queue). The status moves to `Sent`
    /// when the server acknowledges.
    pub async fn send_message(
        &mut self,
        room_id: Uuid,
        content: String,
        kind: MessageKind,
        attachments: Vec<AttachmentUpload>,
    ) -> Result<Uuid, ChatError> {
        if !self.rooms.contains_key(&room_id) {
            return Err(ChatError::RoomNotFound(room_id));
        }
        let length = content.chars().count();
        if length > self.config.max_message_length {
            return Err(ChatError::MessageTooLong {
                length,
                max: self.config.max_message_length,
            });
        }
        if attachments.len() > self.config.max_attachments {
            return Err(ChatError::TooManyAttachments {
                count: attachments.len(),
                max: self.config.max_attachments,
            });
        }
        for upload in &attachments {
            let size = upload.bytes.len() as u64;
            if size > self.config.max_attachment_bytes {
                return Err(ChatError::AttachmentTooLarge {
                    size,
                    max: self.config.max_attachment_bytes,
                });
            }
            if !ALLOWED_MIME_PREFIXES.iter().any(|p| upload.mime.starts_with(p)) {
                return Err(ChatError::UnsupportedAttachmentType(upload.mime.clone()));
            }
        }
        // Rate-limit only after every validation has passed, so a
        // rejected call does not burn quota.
        if !self.rate.check_and_record(Instant::now()) {
            return Err(ChatError::RateLimited);
        }

        // Upload attachments first; the message only ever carries
        // descriptors, never bytes.
        let mut descriptors = Vec::with_capacity(attachments.len());
        for upload in attachments {
            descriptors.push(self.store.upload(upload).await?);
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            sender: self.user.clone(),
            content,
            kind,
            timestamp_ms: now_ms(),
            status: DeliveryStatus::Sending,
            read_by: HashSet::new(),
            reactions: Vec::new(),
            attachments: descriptors,
            edited_at_ms: None,
        };
        let message_id = message.id;
        let envelope = Envelope::new(EventKind::ChatMessage, self.user.user_id, room_id, &message)?;

        self.insert_ordered(message);
        let transmitted = self.conn.state() == ConnectionState::Connected;
        self.pending_acks.insert(
            message_id,
            PendingAck::Message {
                room_id,
                transmitted,
            },
        );
        self.conn.send(envelope).await;
        Ok(message_id)
    }

    /// Re-send a failed message. `Failed → Sending` is the one backward
    /// status edge.
    pub async fn retry_message(&mut self, message_id: Uuid) -> Result<(), ChatError> {
        let room_id = self.room_of(message_id)?;
        let envelope = {
            let message = self.message_mut(room_id, message_id)?;
            if message.status != DeliveryStatus::Failed {
                return Ok(());
            }
            message.status = DeliveryStatus::Sending;
            Envelope::new(EventKind::ChatMessage, message.sender.user_id, room_id, message)?
        };
        let transmitted = self.conn.state() == ConnectionState::Connected;
        self.pending_acks.insert(
            message_id,
            PendingAck::Message {
                room_id,
                transmitted,
            },
        );
        self.events.publish(ChatEvent::MessageStatus {
            message_id,
            status: DeliveryStatus::Sending,
        });
        self.conn.send(envelope).await;
        Ok(())
    }

    // ── Typing ───────────────────────────────────────────────────

    /// Signal that the local user is typing. Expiry is implicit: peers
    /// drop the indicator after the shared timeout with no new signal.
    pub async fn start_typing(&mut self, room_id: Uuid) -> Result<(), ChatError> {
        if !self.rooms.contains_key(&room_id) {
            return Err(ChatError::RoomNotFound(room_id));
        }
        self.conn
            .send(Envelope::new(EventKind::Typing, self.user.user_id, room_id, &())?)
            .await;
        Ok(())
    }

    /// Users currently typing in a room, pruning expired entries.
    pub fn typing_users(&mut self, room_id: Uuid, now: Instant) -> Vec<Uuid> {
        let timeout = self.config.typing_timeout;
        let Some(entries) = self.typing.get_mut(&room_id) else {
            return Vec::new();
        };
        entries.retain(|_, last| now.duration_since(*last) < timeout);
        let mut users: Vec<Uuid> = entries.keys().copied().collect();
        users.sort();
        users
    }

    /// Periodic maintenance: prune expired typing indicators.
    pub fn tick(&mut self, now: Instant) {
        let timeout = self.config.typing_timeout;
        for (room_id, entries) in self.typing.iter_mut() {
            let before = entries.len();
            entries.retain(|_, last| now.duration_since(*last) < timeout);
            if entries.len() != before {
                self.events
                    .publish(ChatEvent::TypingChanged { room_id: *room_id });
            }
        }
    }

    // ── Reactions, receipts, edit/delete ─────────────────────────

    /// Toggle a reaction: a second identical reaction by the same user
    /// removes the first.
    pub async fn add_reaction(&mut self, message_id: Uuid, emoji: &str) -> Result<(), ChatError> {
        let room_id = self.room_of(message_id)?;
        let user_id = self.user.user_id;
        {
            let message = self.message_mut(room_id, message_id)?;
            toggle_reaction(message, user_id, emoji);
        }
        self.events.publish(ChatEvent::ReactionToggled { message_id });
        self.conn
            .send(Envelope::new(
                EventKind::Reaction,
                user_id,
                room_id,
                &ReactionPayload {
                    message_id,
                    emoji: emoji.to_string(),
                    user_id,
                },
            )?)
            .await;
        Ok(())
    }

    /// Zero the unread counter, record ourselves in every message's
    /// read-by set, and emit a receipt.
    pub async fn mark_as_read(&mut self, room_id: Uuid) -> Result<(), ChatError> {
        let user_id = self.user.user_id;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(ChatError::RoomNotFound(room_id))?;
        room.unread = 0;

        let mut read_ids = Vec::new();
        if let Some(messages) = self.messages.get_mut(&room_id) {
            for message in messages.iter_mut() {
                if message.sender.user_id != user_id && message.read_by.insert(user_id) {
                    read_ids.push(message.id);
                }
            }
        }
        if read_ids.is_empty() {
            return Ok(());
        }
        self.conn
            .send(Envelope::new(
                EventKind::ReadReceipt,
                user_id,
                room_id,
                &ReadReceiptPayload {
                    reader: user_id,
                    message_ids: read_ids,
                },
            )?)
            .await;
        Ok(())
    }

    /// Edit a message optimistically; durable once acknowledged.
    pub async fn edit_message(
        &mut self,
        message_id: Uuid,
        content: String,
    ) -> Result<(), ChatError> {
        let room_id = self.room_of(message_id)?;
        let edited_at_ms = now_ms();
        {
            let message = self.message_mut(room_id, message_id)?;
            message.content = content.clone();
            message.edited_at_ms = Some(edited_at_ms);
        }
        let transmitted = self.conn.state() == ConnectionState::Connected;
        self.pending_acks
            .insert(message_id, PendingAck::Edit { room_id, transmitted });
        self.events
            .publish(ChatEvent::MessageEdited { room_id, message_id });
        self.conn
            .send(Envelope::new(
                EventKind::MessageEdit,
                self.user.user_id,
                room_id,
                &EditPayload {
                    message_id,
                    content,
                    edited_at_ms,
                },
            )?)
            .await;
        Ok(())
    }

    /// Delete a message optimistically; durable once acknowledged.
    pub async fn delete_message(&mut self, message_id: Uuid) -> Result<(), ChatError> {
        let room_id = self.room_of(message_id)?;
        self.remove_local(room_id, message_id)?;
        let transmitted = self.conn.state() == ConnectionState::Connected;
        self.pending_acks
            .insert(message_id, PendingAck::Delete { room_id, transmitted });
        self.events
            .publish(ChatEvent::MessageDeleted { room_id, message_id });
        self.conn
            .send(Envelope::new(
                EventKind::MessageDelete,
                self.user.user_id,
                room_id,
                &DeletePayload { message_id },
            )?)
            .await;
        Ok(())
    }

    /// Whether a locally-applied message/edit/delete has been
    /// acknowledged by the server.
    pub fn is_durable(&self, target: Uuid) -> bool {
        !self.pending_acks.contains_key(&target)
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Apply one inbound frame. Frames for other engines are ignored.
    pub fn handle_envelope(&mut self, env: &Envelope) {
        let result = match env.kind {
            EventKind::ChatMessage => self.on_remote_message(env),
            EventKind::MessageAck => self.on_ack(env),
            EventKind::MessageEdit => self.on_remote_edit(env),
            EventKind::MessageDelete => self.on_remote_delete(env),
            EventKind::Reaction => self.on_remote_reaction(env),
            EventKind::ReadReceipt => self.on_receipt(env),
            EventKind::Typing => self.on_typing(env),
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("dropping undecodable {:?} frame: {e}", env.kind);
        }
    }

    fn on_remote_message(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        let mut message: ChatMessage = env.payload_as()?;
        if message.sender.user_id == self.user.user_id {
            return Ok(());
        }
        // Exactly-once: a redelivered id is not inserted twice.
        if self.index.contains_key(&message.id) {
            return Ok(());
        }
        let room_id = message.room_id;
        if !self.rooms.contains_key(&room_id) {
            log::debug!("message for unknown room {room_id}, ignoring");
            return Ok(());
        }
        message.status = DeliveryStatus::Delivered;
        let message_id = message.id;
        self.insert_ordered(message);
        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.unread += 1;
        }
        self.events
            .publish(ChatEvent::MessageReceived { room_id, message_id });
        Ok(())
    }

    fn on_ack(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        let ack: AckPayload = env.payload_as()?;
        let Some(pending) = self.pending_acks.remove(&ack.target) else {
            return Ok(());
        };
        match pending {
            PendingAck::Message { room_id, .. } => {
                if let Ok(message) = self.message_mut(room_id, ack.target) {
                    if message.status.can_transition(DeliveryStatus::Sent) {
                        message.status = DeliveryStatus::Sent;
                    }
                }
                self.events.publish(ChatEvent::MessageStatus {
                    message_id: ack.target,
                    status: DeliveryStatus::Sent,
                });
            }
            PendingAck::Edit { room_id, .. } | PendingAck::Delete { room_id, .. } => {
                log::debug!(
                    "change to message {} in room {room_id} acknowledged",
                    ack.target
                );
            }
        }
        Ok(())
    }

    fn on_remote_edit(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        let edit: EditPayload = env.payload_as()?;
        if env.sender == self.user.user_id {
            return Ok(());
        }
        if let Some(room_id) = self.index.get(&edit.message_id).copied() {
            if let Ok(message) = self.message_mut(room_id, edit.message_id) {
                message.content = edit.content;
                message.edited_at_ms = Some(edit.edited_at_ms);
                self.events.publish(ChatEvent::MessageEdited {
                    room_id,
                    message_id: edit.message_id,
                });
            }
        }
        Ok(())
    }

    fn on_remote_delete(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        let del: DeletePayload = env.payload_as()?;
        if env.sender == self.user.user_id {
            return Ok(());
        }
        if let Some(room_id) = self.index.get(&del.message_id).copied() {
            let _ = self.remove_local(room_id, del.message_id);
            self.events.publish(ChatEvent::MessageDeleted {
                room_id,
                message_id: del.message_id,
            });
        }
        Ok(())
    }

    fn on_remote_reaction(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        let reaction: ReactionPayload = env.payload_as()?;
        if reaction.user_id == self.user.user_id {
            return Ok(());
        }
        if let Some(room_id) = self.index.get(&reaction.message_id).copied() {
            if let Ok(message) = self.message_mut(room_id, reaction.message_id) {
                toggle_reaction(message, reaction.user_id, &reaction.emoji);
                self.events.publish(ChatEvent::ReactionToggled {
                    message_id: reaction.message_id,
                });
            }
        }
        Ok(())
    }

    fn on_receipt(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        let receipt: ReadReceiptPayload = env.payload_as()?;
        if receipt.reader == self.user.user_id {
            return Ok(());
        }
        let local_user = self.user.user_id;
        for message_id in receipt.message_ids {
            let Some(room_id) = self.index.get(&message_id).copied() else {
                continue;
            };
            if let Ok(message) = self.message_mut(room_id, message_id) {
                message.read_by.insert(receipt.reader);
                // A read implies our own message reached the reader.
                if message.sender.user_id == local_user
                    && message.status.can_transition(DeliveryStatus::Delivered)
                {
                    message.status = DeliveryStatus::Delivered;
                }
                self.events
                    .publish(ChatEvent::ReceiptRecorded { room_id, message_id });
            }
        }
        Ok(())
    }

    fn on_typing(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        if env.sender == self.user.user_id {
            return Ok(());
        }
        self.typing
            .entry(env.channel)
            .or_default()
            .insert(env.sender, Instant::now());
        self.events
            .publish(ChatEvent::TypingChanged { room_id: env.channel });
        Ok(())
    }

    /// React to a connection state change. An unexpected drop fails
    /// every in-flight (transmitted, unacknowledged) message; frames
    /// still in the offline queue stay pending and are delivered on
    /// reconnect. In-flight edits/deletes keep their local effect but
    /// are reported as unconfirmed, since their ack is gone for good.
    pub fn handle_connection_state(&mut self, state: ConnectionState) {
        if !matches!(state, ConnectionState::Reconnecting | ConnectionState::Failed) {
            return;
        }
        let in_flight: Vec<(Uuid, PendingAck)> = self
            .pending_acks
            .iter()
            .filter_map(|(id, pending)| match pending {
                PendingAck::Message { transmitted: true, .. }
                | PendingAck::Edit { transmitted: true, .. }
                | PendingAck::Delete { transmitted: true, .. } => Some((*id, *pending)),
                _ => None,
            })
            .collect();

        for (message_id, pending) in in_flight {
            self.pending_acks.remove(&message_id);
            match pending {
                PendingAck::Message { room_id, .. } => {
                    if let Ok(message) = self.message_mut(room_id, message_id) {
                        if message.status == DeliveryStatus::Sending {
                            message.status = DeliveryStatus::Failed;
                            self.events.publish(ChatEvent::MessageStatus {
                                message_id,
                                status: DeliveryStatus::Failed,
                            });
                        }
                    }
                }
                PendingAck::Edit { room_id, .. } | PendingAck::Delete { room_id, .. } => {
                    self.events
                        .publish(ChatEvent::ChangeUnconfirmed { room_id, message_id });
                }
            }
        }
    }

    // ── State access ─────────────────────────────────────────────

    pub fn user_id(&self) -> Uuid {
        self.user.user_id
    }

    pub fn backend(&self) -> &A {
        &self.api
    }

    pub fn room(&self, room_id: Uuid) -> Option<&ChatRoom> {
        self.rooms.get(&room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &ChatRoom> {
        self.rooms.values()
    }

    /// Messages of a room, in display (timestamp) order.
    pub fn messages(&self, room_id: Uuid) -> &[ChatMessage] {
        self.messages.get(&room_id).map_or(&[], Vec::as_slice)
    }

    pub fn message(&self, message_id: Uuid) -> Option<&ChatMessage> {
        let room_id = self.index.get(&message_id)?;
        self.messages
            .get(room_id)?
            .iter()
            .find(|m| m.id == message_id)
    }

    // ── Internals ────────────────────────────────────────────────

    fn insert_ordered(&mut self, message: ChatMessage) {
        let key = (message.timestamp_ms, message.id);
        self.index.insert(message.id, message.room_id);
        let list = self.messages.entry(message.room_id).or_default();
        let idx = list.partition_point(|m| (m.timestamp_ms, m.id) <= key);
        list.insert(idx, message);
    }

    fn remove_local(&mut self, room_id: Uuid, message_id: Uuid) -> Result<(), ChatError> {
        let list = self
            .messages
            .get_mut(&room_id)
            .ok_or(ChatError::RoomNotFound(room_id))?;
        let idx = list
            .iter()
            .position(|m| m.id == message_id)
            .ok_or(ChatError::MessageNotFound(message_id))?;
        list.remove(idx);
        self.index.remove(&message_id);
        Ok(())
    }

    fn room_of(&self, message_id: Uuid) -> Result<Uuid, ChatError> {
        self.index
            .get(&message_id)
            .copied()
            .ok_or(ChatError::MessageNotFound(message_id))
    }

    fn message_mut(
        &mut self,
        room_id: Uuid,
        message_id: Uuid,
    ) -> Result<&mut ChatMessage, ChatError> {
        self.messages
            .get_mut(&room_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
            .ok_or(ChatError::MessageNotFound(message_id))
    }
}

fn toggle_reaction(message: &mut ChatMessage, user_id: Uuid, emoji: &str) {
    if let Some(idx) = message
        .reactions
        .iter()
        .position(|r| r.user_id == user_id && r.emoji == emoji)
    {
        message.reactions.remove(idx);
    } else {
        message.reactions.push(Reaction {
            emoji: emoji.to_string(),
            user_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InMemoryBackend;
    use crate::connection::{ConnectionConfig, ConnectionManager};
    use crate::protocol::Role;

    fn offline_conn() -> (ConnectionManager, ConnectionHandle) {
        let mgr = ConnectionManager::new(
            Uuid::new_v4(),
            ConnectionConfig {
                url: "ws://127.0.0.1:1".into(),
                ..ConnectionConfig::default()
            },
        );
        let handle = mgr.handle();
        (mgr, handle)
    }

    fn engine() -> (ConnectionManager, ChatEngine<InMemoryBackend, InMemoryBackend>) {
        let (mgr, handle) = offline_conn();
        let user = UserIdentity::new("Dana", Role::Family);
        let engine = ChatEngine::new(user, InMemoryBackend::new(), InMemoryBackend::new(), handle);
        (mgr, engine)
    }

    fn remote_message(room_id: Uuid, ts: u64, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            sender: UserIdentity::new("Remote", Role::Coordinator),
            content: content.into(),
            kind: MessageKind::Text,
            timestamp_ms: ts,
            status: DeliveryStatus::Sent,
            read_by: HashSet::new(),
            reactions: Vec::new(),
            attachments: Vec::new(),
            edited_at_ms: None,
        }
    }

    #[tokio::test]
    async fn test_create_chat_registers_room() {
        let (_mgr, mut chat) = engine();
        let room_id = chat
            .create_chat(vec![Uuid::new_v4()], HashMap::new())
            .await
            .unwrap();
        assert!(chat.room(room_id).is_some());
        assert_eq!(chat.room(room_id).unwrap().kind, RoomKind::Direct);
    }

    #[tokio::test]
    async fn test_create_chat_failure_surfaces() {
        let (_mgr, mut chat) = engine();
        chat.api.set_fail_room_creation(true);
        let result = chat.create_chat(vec![], HashMap::new()).await;
        assert!(matches!(result, Err(ChatError::RoomCreationFailed(_))));
    }

    #[tokio::test]
    async fn test_send_message_validation() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();

        let long = "x".repeat(MAX_MESSAGE_LENGTH + 1);
        let result = chat
            .send_message(room_id, long, MessageKind::Text, vec![])
            .await;
        assert!(matches!(result, Err(ChatError::MessageTooLong { .. })));

        let uploads: Vec<AttachmentUpload> = (0..MAX_ATTACHMENTS + 1)
            .map(|i| AttachmentUpload {
                file_name: format!("f{i}.png"),
                mime: "image/png".into(),
                bytes: vec![0],
            })
            .collect();
        let result = chat
            .send_message(room_id, "hi".into(), MessageKind::Attachment, uploads)
            .await;
        assert!(matches!(result, Err(ChatError::TooManyAttachments { .. })));
    }

    #[tokio::test]
    async fn test_send_message_unknown_room() {
        let (_mgr, mut chat) = engine();
        let result = chat
            .send_message(Uuid::new_v4(), "hi".into(), MessageKind::Text, vec![])
            .await;
        assert!(matches!(result, Err(ChatError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_offline_send_stays_sending() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();

        let id = chat
            .send_message(room_id, "Hello".into(), MessageKind::Text, vec![])
            .await
            .unwrap();
        assert_eq!(chat.message(id).unwrap().status, DeliveryStatus::Sending);
        assert!(!chat.is_durable(id));

        // A drop does not fail messages that never left the queue.
        chat.handle_connection_state(ConnectionState::Reconnecting);
        assert_eq!(chat.message(id).unwrap().status, DeliveryStatus::Sending);
    }

    #[tokio::test]
    async fn test_ack_moves_to_sent() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();
        let id = chat
            .send_message(room_id, "Hello".into(), MessageKind::Text, vec![])
            .await
            .unwrap();

        let ack = Envelope::new(
            EventKind::MessageAck,
            Uuid::nil(),
            room_id,
            &AckPayload { target: id },
        )
        .unwrap();
        chat.handle_envelope(&ack);

        assert_eq!(chat.message(id).unwrap().status, DeliveryStatus::Sent);
        assert!(chat.is_durable(id));
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let (_mgr, handle) = offline_conn();
        let user = UserIdentity::new("Dana", Role::Family);
        let config = ChatConfig {
            rate_limit_max: 2,
            ..ChatConfig::default()
        };
        let mut chat = ChatEngine::with_config(
            user,
            InMemoryBackend::new(),
            InMemoryBackend::new(),
            handle,
            config,
        );
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();

        for _ in 0..2 {
            chat.send_message(room_id, "ok".into(), MessageKind::Text, vec![])
                .await
                .unwrap();
        }
        let result = chat
            .send_message(room_id, "too much".into(), MessageKind::Text, vec![])
            .await;
        assert!(matches!(result, Err(ChatError::RateLimited)));
    }

    #[tokio::test]
    async fn test_ordering_resorts_out_of_order_arrivals() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();

        // Arrive newest-first, as after a reconnect replay
        for (ts, body) in [(300u64, "c"), (100, "a"), (200, "b")] {
            let msg = remote_message(room_id, ts, body);
            let env =
                Envelope::new(EventKind::ChatMessage, msg.sender.user_id, room_id, &msg).unwrap();
            chat.handle_envelope(&env);
        }

        let contents: Vec<&str> = chat
            .messages(room_id)
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
        assert_eq!(chat.room(room_id).unwrap().unread, 3);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_inserted_once() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();

        let msg = remote_message(room_id, 100, "Hello");
        let env = Envelope::new(EventKind::ChatMessage, msg.sender.user_id, room_id, &msg).unwrap();
        chat.handle_envelope(&env);
        chat.handle_envelope(&env);

        assert_eq!(chat.messages(room_id).len(), 1);
    }

    #[tokio::test]
    async fn test_reaction_toggle_idempotent() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();
        let id = chat
            .send_message(room_id, "Hello".into(), MessageKind::Text, vec![])
            .await
            .unwrap();

        chat.add_reaction(id, "👍").await.unwrap();
        assert_eq!(chat.message(id).unwrap().reactions.len(), 1);

        chat.add_reaction(id, "👍").await.unwrap();
        assert!(chat.message(id).unwrap().reactions.is_empty());
    }

    #[tokio::test]
    async fn test_mark_as_read_and_inbound_receipt() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();

        let msg = remote_message(room_id, 100, "Hello");
        let remote_id = msg.id;
        let env = Envelope::new(EventKind::ChatMessage, msg.sender.user_id, room_id, &msg).unwrap();
        chat.handle_envelope(&env);
        assert_eq!(chat.room(room_id).unwrap().unread, 1);

        chat.mark_as_read(room_id).await.unwrap();
        assert_eq!(chat.room(room_id).unwrap().unread, 0);

        // An inbound receipt updates our own message's read-by set
        let own_id = chat
            .send_message(room_id, "mine".into(), MessageKind::Text, vec![])
            .await
            .unwrap();
        let reader = Uuid::new_v4();
        let receipt = Envelope::new(
            EventKind::ReadReceipt,
            reader,
            room_id,
            &ReadReceiptPayload {
                reader,
                message_ids: vec![own_id, remote_id],
            },
        )
        .unwrap();
        chat.handle_envelope(&receipt);
        assert!(chat.message(own_id).unwrap().read_by.contains(&reader));
        assert_eq!(
            chat.message(own_id).unwrap().status,
            DeliveryStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_edit_and_delete_optimistic() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();
        let id = chat
            .send_message(room_id, "draft".into(), MessageKind::Text, vec![])
            .await
            .unwrap();

        chat.edit_message(id, "final".into()).await.unwrap();
        assert_eq!(chat.message(id).unwrap().content, "final");
        assert!(chat.message(id).unwrap().edited_at_ms.is_some());
        assert!(!chat.is_durable(id));

        chat.delete_message(id).await.unwrap();
        assert!(chat.message(id).is_none());
        assert!(chat.messages(room_id).is_empty());
    }

    #[tokio::test]
    async fn test_edit_durable_after_ack() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();
        let id = chat
            .send_message(room_id, "draft".into(), MessageKind::Text, vec![])
            .await
            .unwrap();

        chat.edit_message(id, "final".into()).await.unwrap();
        assert!(!chat.is_durable(id));

        let ack = Envelope::new(
            EventKind::MessageAck,
            Uuid::nil(),
            room_id,
            &AckPayload { target: id },
        )
        .unwrap();
        chat.handle_envelope(&ack);
        assert!(chat.is_durable(id));
    }

    #[tokio::test]
    async fn test_in_flight_edit_reported_unconfirmed_on_drop() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();
        let id = chat
            .send_message(room_id, "draft".into(), MessageKind::Text, vec![])
            .await
            .unwrap();
        chat.handle_envelope(
            &Envelope::new(
                EventKind::MessageAck,
                Uuid::nil(),
                room_id,
                &AckPayload { target: id },
            )
            .unwrap(),
        );

        // Edited offline: the frame sits in the queue, so a drop keeps
        // the pending ack alive for the replay.
        chat.edit_message(id, "offline edit".into()).await.unwrap();
        chat.handle_connection_state(ConnectionState::Reconnecting);
        assert!(!chat.is_durable(id));

        // Edited over a live socket that then dropped: the ack can
        // never arrive, so the entry is cleared and the UI is told.
        chat.pending_acks.insert(
            id,
            PendingAck::Edit {
                room_id,
                transmitted: true,
            },
        );
        let mut sub = chat.subscribe();
        chat.handle_connection_state(ConnectionState::Failed);
        assert!(chat.is_durable(id));
        assert!(matches!(
            sub.try_recv(),
            Some(ChatEvent::ChangeUnconfirmed { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_attachment_does_not_burn_rate_quota() {
        let (_mgr, handle) = offline_conn();
        let user = UserIdentity::new("Dana", Role::Family);
        let config = ChatConfig {
            rate_limit_max: 1,
            ..ChatConfig::default()
        };
        let mut chat = ChatEngine::with_config(
            user,
            InMemoryBackend::new(),
            InMemoryBackend::new(),
            handle,
            config,
        );
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();

        let result = chat
            .send_message(
                room_id,
                "too big".into(),
                MessageKind::Attachment,
                vec![AttachmentUpload {
                    file_name: "video.mp4".into(),
                    mime: "video/mp4".into(),
                    bytes: vec![0; (MAX_ATTACHMENT_BYTES + 1) as usize],
                }],
            )
            .await;
        assert!(matches!(result, Err(ChatError::AttachmentTooLarge { .. })));

        // The single slot is still available
        chat.send_message(room_id, "ok".into(), MessageKind::Text, vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_typing_expiry() {
        let (_mgr, handle) = offline_conn();
        let user = UserIdentity::new("Dana", Role::Family);
        let config = ChatConfig {
            typing_timeout: Duration::from_millis(50),
            ..ChatConfig::default()
        };
        let mut chat = ChatEngine::with_config(
            user,
            InMemoryBackend::new(),
            InMemoryBackend::new(),
            handle,
            config,
        );
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();

        let typist = Uuid::new_v4();
        let env = Envelope::new(EventKind::Typing, typist, room_id, &()).unwrap();
        chat.handle_envelope(&env);

        let now = Instant::now();
        assert_eq!(chat.typing_users(room_id, now), vec![typist]);
        assert!(chat
            .typing_users(room_id, now + Duration::from_millis(100))
            .is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_message() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();
        let id = chat
            .send_message(room_id, "Hello".into(), MessageKind::Text, vec![])
            .await
            .unwrap();

        // Force a Failed status as if the drop happened mid-flight
        {
            let message = chat.message_mut(room_id, id).unwrap();
            message.status = DeliveryStatus::Failed;
        }
        chat.retry_message(id).await.unwrap();
        assert_eq!(chat.message(id).unwrap().status, DeliveryStatus::Sending);
    }

    #[test]
    fn test_status_transitions_monotonic() {
        use DeliveryStatus::*;
        assert!(Sending.can_transition(Sent));
        assert!(Sent.can_transition(Delivered));
        assert!(Sending.can_transition(Failed));
        assert!(Failed.can_transition(Sending));
        assert!(!Sent.can_transition(Sending));
        assert!(!Delivered.can_transition(Sent));
    }

    #[test]
    fn test_rate_limiter_window_slides() {
        let mut limiter = RateLimiter::new(Duration::from_millis(100), 2);
        let start = Instant::now();
        assert!(limiter.check_and_record(start));
        assert!(limiter.check_and_record(start));
        assert!(!limiter.check_and_record(start));
        // Past the window, capacity is back
        assert!(limiter.check_and_record(start + Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_unsupported_attachment_type() {
        let (_mgr, mut chat) = engine();
        let room_id = chat.create_chat(vec![], HashMap::new()).await.unwrap();
        let result = chat
            .send_message(
                room_id,
                "payload".into(),
                MessageKind::Attachment,
                vec![AttachmentUpload {
                    file_name: "tool.exe".into(),
                    mime: "application/x-msdownload".into(),
                    bytes: vec![0],
                }],
            )
            .await;
        assert!(matches!(result, Err(ChatError::UnsupportedAttachmentType(_))));
    }
}
