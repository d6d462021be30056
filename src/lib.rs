//! # fete-collab — Real-time collaboration engine for event planning
//!
//! Client-side engine powering live chat, presence, shared document
//! editing, and sharing controls for multi-party event coordination.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌─────────────┐
//! │ ConnectionManager│ ◄─────────────────► │ Sync Server │
//! │ (heartbeat,      │     Binary Proto    │ (fan-out)   │
//! │  offline queue)  │                     └─────────────┘
//! └────────┬─────────┘
//!          │ Envelope fan-in / fan-out          REST
//!    ┌─────┴──────┬──────────────┬───────────┐ ┌─────────┐
//!    ▼            ▼              ▼           ▼ │ Backend │
//! ┌──────┐  ┌──────────┐  ┌──────────┐  ┌─────┴───┐─────┘
//! │ Chat │  │ Presence │  │ Document │  │ Sharing │
//! │Engine│  │ Tracker  │  │ Engine   │  │ Engine  │
//! └──────┘  └──────────┘  └──────────┘  └─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded [`Envelope`])
//! - [`connection`] — WebSocket manager: heartbeat, reconnect backoff,
//!   FIFO offline queue
//! - [`events`] — Broadcast event bus between engines and UI consumers
//! - [`chat`] — Rooms, ordered messages, receipts, reactions, typing
//! - [`presence`] — Multi-device presence with idle detection
//! - [`document`] — Path-addressed edits, LWW merge with surfaced
//!   conflicts, advisory locks, version snapshots
//! - [`sharing`] — Grants, public links, access log
//! - [`api`] — REST backend and attachment store traits
//!
//! Each engine is a synchronous state machine: the host event loop
//! pumps inbound frames from [`connection::ConnectionHandle::inbound`]
//! into `handle_envelope` and drives periodic work through `tick`.

pub mod api;
pub mod chat;
pub mod connection;
pub mod document;
pub mod events;
pub mod presence;
pub mod protocol;
pub mod sharing;

// Re-exports for convenience
pub use api::{
    ApiError, AttachmentDescriptor, AttachmentStore, AttachmentUpload, ConflictInfo,
    InMemoryBackend, RestClient, SessionRecord,
};
pub use chat::{
    ChatConfig, ChatEngine, ChatError, ChatEvent, ChatMessage, ChatRoom, DeliveryStatus,
    MessageKind, Reaction, RoomKind,
};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionManager, ConnectionState,
    OutboundQueue,
};
pub use document::{
    Conflict, ConflictKind, ConflictResolution, DocumentEngine, DocumentError, DocumentEvent,
    DocumentSession, EditOperation, Lock, LockKind, OperationKind, PathSegment, VersionSnapshot,
};
pub use events::{EventBus, Subscription};
pub use presence::{
    PresenceConfig, PresenceEvent, PresenceStatus, PresenceTracker, UserPresence,
};
pub use protocol::{now_ms, Envelope, EventKind, ProtocolError, Role, UserIdentity};
pub use sharing::{
    AccessEntry, AccessKind, PermissionLevel, ShareGrant, ShareMode, ShareRequest, SharedDocument,
    SharingEngine, SharingError, SharingEvent,
};
