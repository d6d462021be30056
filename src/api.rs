//! External collaborator interfaces: the REST-style backend and the
//! attachment store.
//!
//! The engine only ever talks to these through traits; real HTTP
//! implementations live outside this crate. [`InMemoryBackend`] is the
//! reference implementation used by the test suites — it honors the
//! same contracts (lock expiry, permission denials, newest-first
//! snapshot history) without any network.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::chat::{ChatMessage, ChatRoom, RoomKind};
use crate::document::{Lock, LockKind, VersionSnapshot};
use crate::protocol::now_ms;
use crate::sharing::{ShareMode, ShareRequest, SharedDocument};

/// Backend error, classified the way the REST backend reports status.
#[derive(Debug, Clone)]
pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    /// Resource contention (e.g. a lock already held)
    Conflict(ConflictInfo),
    NotFound(String),
    RateLimited,
    Server(String),
    Network(String),
}

/// Detail attached to a `Conflict` response.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub detail: String,
    /// Current lock holder, when the conflict is a held lock
    pub holder: Option<Uuid>,
    pub expires_at_ms: Option<u64>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Forbidden(d) => write!(f, "forbidden: {d}"),
            Self::Conflict(info) => write!(f, "conflict: {}", info.detail),
            Self::NotFound(d) => write!(f, "not found: {d}"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::Server(d) => write!(f, "server error: {d}"),
            Self::Network(d) => write!(f, "network error: {d}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// A collaborative session as returned by the backend.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub participants: Vec<Uuid>,
    pub version: u64,
    pub content: serde_json::Value,
}

/// The REST-style API backend consumed by the engines.
#[allow(async_fn_in_trait)]
pub trait RestClient: Send + Sync {
    async fn create_room(
        &self,
        creator: Uuid,
        participants: Vec<Uuid>,
        metadata: HashMap<String, String>,
    ) -> Result<ChatRoom, ApiError>;

    async fn fetch_room(&self, room_id: Uuid) -> Result<ChatRoom, ApiError>;

    /// Message history for a room, oldest first.
    async fn fetch_history(&self, room_id: Uuid) -> Result<Vec<ChatMessage>, ApiError>;

    async fn create_session(
        &self,
        creator: Uuid,
        document_id: Uuid,
        initial_content: serde_json::Value,
    ) -> Result<SessionRecord, ApiError>;

    async fn fetch_session(&self, user: Uuid, session_id: Uuid)
        -> Result<SessionRecord, ApiError>;

    async fn acquire_lock(
        &self,
        session_id: Uuid,
        holder: Uuid,
        kind: LockKind,
        ttl_ms: u64,
    ) -> Result<Lock, ApiError>;

    async fn release_lock(&self, session_id: Uuid, lock_id: Uuid) -> Result<(), ApiError>;

    async fn save_snapshot(&self, snapshot: VersionSnapshot) -> Result<VersionSnapshot, ApiError>;

    async fn fetch_snapshot(
        &self,
        session_id: Uuid,
        version: u64,
    ) -> Result<VersionSnapshot, ApiError>;

    /// Snapshot history, newest first.
    async fn list_snapshots(&self, session_id: Uuid) -> Result<Vec<VersionSnapshot>, ApiError>;

    async fn create_share(&self, request: ShareRequest) -> Result<SharedDocument, ApiError>;

    async fn revoke_share_grant(&self, document_id: Uuid, grantee: Uuid) -> Result<(), ApiError>;
}

/// Upload request handed to the attachment store.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Descriptor returned by the attachment store; the engines hold this,
/// never the raw bytes past the upload call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AttachmentDescriptor {
    pub id: Uuid,
    pub url: String,
    pub size: u64,
    pub mime: String,
}

/// The file/object storage collaborator.
#[allow(async_fn_in_trait)]
pub trait AttachmentStore: Send + Sync {
    async fn upload(&self, upload: AttachmentUpload) -> Result<AttachmentDescriptor, ApiError>;
}

// ───────────────────────────────────────────────────────────────────
// In-memory reference backend
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct BackendState {
    rooms: HashMap<Uuid, ChatRoom>,
    history: HashMap<Uuid, Vec<ChatMessage>>,
    sessions: HashMap<Uuid, SessionRecord>,
    /// (session, user) pairs denied access
    denied: HashSet<(Uuid, Uuid)>,
    locks: HashMap<Uuid, Lock>,
    snapshots: HashMap<Uuid, Vec<VersionSnapshot>>,
    shares: HashMap<Uuid, SharedDocument>,
    fail_room_creation: bool,
}

/// In-memory backend implementing both collaborator traits.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panicked holder cannot corrupt this state beyond a half-applied
    /// request, so a poisoned lock is recovered rather than propagated.
    fn locked(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent room creations fail with a server error.
    pub fn set_fail_room_creation(&self, fail: bool) {
        self.locked().fail_room_creation = fail;
    }

    /// Deny `user` access to `session_id`.
    pub fn deny_session(&self, session_id: Uuid, user: Uuid) {
        self.locked().denied.insert((session_id, user));
    }

    /// Seed message history for a room.
    pub fn seed_history(&self, room_id: Uuid, messages: Vec<ChatMessage>) {
        self.locked().history.insert(room_id, messages);
    }

    /// Register a pre-existing room.
    pub fn seed_room(&self, room: ChatRoom) {
        self.locked().rooms.insert(room.id, room);
    }

    /// Register a pre-existing session.
    pub fn seed_session(&self, record: SessionRecord) {
        self.locked().sessions.insert(record.session_id, record);
    }

    pub fn room_count(&self) -> usize {
        self.locked().rooms.len()
    }
}

impl RestClient for InMemoryBackend {
    async fn create_room(
        &self,
        creator: Uuid,
        participants: Vec<Uuid>,
        metadata: HashMap<String, String>,
    ) -> Result<ChatRoom, ApiError> {
        let mut state = self.locked();
        if state.fail_room_creation {
            return Err(ApiError::Server("room service unavailable".into()));
        }

        let mut members = vec![creator];
        for p in participants {
            if !members.contains(&p) {
                members.push(p);
            }
        }
        let kind = if members.len() <= 2 {
            RoomKind::Direct
        } else {
            RoomKind::MultiParty
        };
        let room = ChatRoom {
            id: Uuid::new_v4(),
            kind,
            participants: members,
            unread: 0,
            archived: false,
            metadata,
        };
        state.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn fetch_room(&self, room_id: Uuid) -> Result<ChatRoom, ApiError> {
        self.state
            .lock()
            .unwrap()
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("room {room_id}")))
    }

    async fn fetch_history(&self, room_id: Uuid) -> Result<Vec<ChatMessage>, ApiError> {
        let state = self.locked();
        let mut messages = state.history.get(&room_id).cloned().unwrap_or_default();
        messages.sort_by_key(|m| (m.timestamp_ms, m.id));
        Ok(messages)
    }

    async fn create_session(
        &self,
        creator: Uuid,
        document_id: Uuid,
        initial_content: serde_json::Value,
    ) -> Result<SessionRecord, ApiError> {
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            document_id,
            participants: vec![creator],
            version: 1,
            content: initial_content,
        };
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(record.session_id, record.clone());
        Ok(record)
    }

    async fn fetch_session(
        &self,
        user: Uuid,
        session_id: Uuid,
    ) -> Result<SessionRecord, ApiError> {
        let mut state = self.locked();
        if state.denied.contains(&(session_id, user)) {
            return Err(ApiError::Forbidden(format!(
                "user {user} has no access to session {session_id}"
            )));
        }
        let record = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))?;
        if !record.participants.contains(&user) {
            record.participants.push(user);
        }
        Ok(record.clone())
    }

    async fn acquire_lock(
        &self,
        session_id: Uuid,
        holder: Uuid,
        kind: LockKind,
        ttl_ms: u64,
    ) -> Result<Lock, ApiError> {
        let mut state = self.locked();
        let now = now_ms();

        if let Some(existing) = state.locks.get(&session_id) {
            if !existing.is_expired(now) && existing.holder != holder {
                return Err(ApiError::Conflict(ConflictInfo {
                    detail: format!("session {session_id} is locked"),
                    holder: Some(existing.holder),
                    expires_at_ms: Some(existing.expires_at_ms),
                }));
            }
        }

        let lock = Lock {
            lock_id: Uuid::new_v4(),
            session_id,
            holder,
            kind,
            acquired_at_ms: now,
            expires_at_ms: now + ttl_ms,
        };
        state.locks.insert(session_id, lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, session_id: Uuid, lock_id: Uuid) -> Result<(), ApiError> {
        let mut state = self.locked();
        if state
            .locks
            .get(&session_id)
            .is_some_and(|l| l.lock_id == lock_id)
        {
            state.locks.remove(&session_id);
        }
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: VersionSnapshot) -> Result<VersionSnapshot, ApiError> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .entry(snapshot.session_id)
            .or_default()
            .push(snapshot.clone());
        Ok(snapshot)
    }

    async fn fetch_snapshot(
        &self,
        session_id: Uuid,
        version: u64,
    ) -> Result<VersionSnapshot, ApiError> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .get(&session_id)
            .and_then(|list| list.iter().find(|s| s.version == version))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("snapshot v{version} of {session_id}")))
    }

    async fn list_snapshots(&self, session_id: Uuid) -> Result<Vec<VersionSnapshot>, ApiError> {
        let state = self.locked();
        let mut list = state
            .snapshots
            .get(&session_id)
            .cloned()
            .unwrap_or_default();
        list.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        Ok(list)
    }

    async fn create_share(&self, request: ShareRequest) -> Result<SharedDocument, ApiError> {
        let public_url = match request.mode {
            ShareMode::PublicLink => Some(format!(
                "https://share.fete.example/d/{}",
                Uuid::new_v4().simple()
            )),
            ShareMode::Users => None,
        };
        let share = SharedDocument {
            document_id: request.document_id,
            grantor: request.grantor,
            mode: request.mode,
            grants: request.grants,
            public_url,
            access_log: Vec::new(),
        };
        self.state
            .lock()
            .unwrap()
            .shares
            .insert(share.document_id, share.clone());
        Ok(share)
    }

    async fn revoke_share_grant(&self, document_id: Uuid, grantee: Uuid) -> Result<(), ApiError> {
        let mut state = self.locked();
        let share = state
            .shares
            .get_mut(&document_id)
            .ok_or_else(|| ApiError::NotFound(format!("share for {document_id}")))?;
        share.grants.retain(|g| g.grantee != grantee);
        Ok(())
    }
}

impl AttachmentStore for InMemoryBackend {
    async fn upload(&self, upload: AttachmentUpload) -> Result<AttachmentDescriptor, ApiError> {
        let id = Uuid::new_v4();
        Ok(AttachmentDescriptor {
            id,
            url: format!("https://files.fete.example/{}/{}", id.simple(), upload.file_name),
            size: upload.bytes.len() as u64,
            mime: upload.mime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_fetch_room() {
        let backend = InMemoryBackend::new();
        let creator = Uuid::new_v4();
        let other = Uuid::new_v4();

        let room = backend
            .create_room(creator, vec![other], HashMap::new())
            .await
            .unwrap();
        assert_eq!(room.kind, RoomKind::Direct);
        assert_eq!(room.participants, vec![creator, other]);

        let fetched = backend.fetch_room(room.id).await.unwrap();
        assert_eq!(fetched.id, room.id);
    }

    #[tokio::test]
    async fn test_room_creation_failure_injection() {
        let backend = InMemoryBackend::new();
        backend.set_fail_room_creation(true);
        let result = backend
            .create_room(Uuid::new_v4(), vec![], HashMap::new())
            .await;
        assert!(matches!(result, Err(ApiError::Server(_))));
    }

    #[tokio::test]
    async fn test_fetch_missing_room() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.fetch_room(Uuid::new_v4()).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_access_denied() {
        let backend = InMemoryBackend::new();
        let creator = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let record = backend
            .create_session(creator, Uuid::new_v4(), serde_json::json!({}))
            .await
            .unwrap();

        backend.deny_session(record.session_id, intruder);
        let result = backend.fetch_session(intruder, record.session_id).await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));

        // The creator still gets in
        assert!(backend.fetch_session(creator, record.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_conflict_reports_holder() {
        let backend = InMemoryBackend::new();
        let session = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let lock = backend
            .acquire_lock(session, alice, LockKind::Exclusive, 60_000)
            .await
            .unwrap();
        assert_eq!(lock.holder, alice);

        match backend
            .acquire_lock(session, bob, LockKind::Exclusive, 60_000)
            .await
        {
            Err(ApiError::Conflict(info)) => {
                assert_eq!(info.holder, Some(alice));
                assert_eq!(info.expires_at_ms, Some(lock.expires_at_ms));
            }
            other => panic!("expected lock conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let backend = InMemoryBackend::new();
        let session = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        // Zero TTL: expired the moment it is granted
        backend
            .acquire_lock(session, alice, LockKind::Exclusive, 0)
            .await
            .unwrap();

        let taken = backend
            .acquire_lock(session, bob, LockKind::Exclusive, 60_000)
            .await
            .unwrap();
        assert_eq!(taken.holder, bob);
    }

    #[tokio::test]
    async fn test_snapshots_listed_newest_first() {
        let backend = InMemoryBackend::new();
        let session = Uuid::new_v4();

        for (version, at) in [(1u64, 100u64), (2, 200), (3, 300)] {
            backend
                .save_snapshot(VersionSnapshot {
                    id: Uuid::new_v4(),
                    session_id: session,
                    version,
                    content: serde_json::json!({ "v": version }),
                    comment: String::new(),
                    major: false,
                    created_at_ms: at,
                })
                .await
                .unwrap();
        }

        let list = backend.list_snapshots(session).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].version, 3);
        assert_eq!(list[2].version, 1);
    }

    #[tokio::test]
    async fn test_attachment_upload_descriptor() {
        let backend = InMemoryBackend::new();
        let descriptor = backend
            .upload(AttachmentUpload {
                file_name: "menu.pdf".into(),
                mime: "application/pdf".into(),
                bytes: vec![0u8; 1024],
            })
            .await
            .unwrap();

        assert_eq!(descriptor.size, 1024);
        assert_eq!(descriptor.mime, "application/pdf");
        assert!(descriptor.url.contains("menu.pdf"));
    }
}
