//! Collaborative document engine: path-addressed edits over a JSON
//! content tree, last-write-wins merge with surfaced conflicts,
//! advisory locks, and version snapshots.
//!
//! Every edit names the node it touches by path from the root, so two
//! collaborators touching disjoint subtrees never interfere. When two
//! edits race on the same path the later wall-clock wins, and the
//! losing edit is kept as a [`Conflict`] record for the user to review
//! rather than silently discarded.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::{ApiError, RestClient};
use crate::connection::ConnectionHandle;
use crate::events::{EventBus, Subscription};
use crate::protocol::{now_ms, Envelope, EventKind, ProtocolError, UserIdentity};

/// One step into the content tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Object field
    Key(String),
    /// Array position
    Index(usize),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(k) => write!(f, ".{k}"),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Render a path for logs and errors, e.g. `.guests[2].name`.
pub fn path_display(path: &[PathSegment]) -> String {
    path.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// An edit as it travels between collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditOperation {
    pub id: Uuid,
    pub session_id: Uuid,
    pub author: Uuid,
    pub kind: OperationKind,
    pub path: Vec<PathSegment>,
    /// New value for Insert/Update; absent for Delete
    pub value: Option<Value>,
    pub timestamp_ms: u64,
    /// Session version the author had applied when producing this
    /// edit. Used to tell causal succession from concurrency.
    pub base_version: u64,
}

/// Advisory lock kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Exclusive,
}

/// An advisory lock on a session. Expiry is enforced by timestamp so a
/// crashed holder cannot wedge the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: Uuid,
    pub session_id: Uuid,
    pub holder: Uuid,
    pub kind: LockKind,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Lock {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Wire payload announcing a lock change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LockUpdatePayload {
    Acquired(Lock),
    Released { session_id: Uuid, lock_id: Uuid },
}

/// A saved document version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub id: Uuid,
    pub session_id: Uuid,
    pub version: u64,
    pub content: Value,
    pub comment: String,
    /// Marked by the user as a milestone
    pub major: bool,
    pub created_at_ms: u64,
}

/// How two racing edits collided.
#[derive(Debug, Clone)]
pub enum ConflictKind {
    /// Two writes to the same path; `winner` is applied
    Field {
        winner: EditOperation,
        loser: EditOperation,
    },
    /// Two insertions at the same position; both kept, in this order
    Insertion {
        first: EditOperation,
        second: EditOperation,
    },
}

#[derive(Debug, Clone)]
pub enum ConflictResolution {
    Unresolved,
    Resolved { value: Option<Value>, resolver: Uuid },
}

/// A surfaced merge conflict.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub id: Uuid,
    pub session_id: Uuid,
    pub path: Vec<PathSegment>,
    pub kind: ConflictKind,
    pub resolution: ConflictResolution,
}

/// Document engine errors.
#[derive(Debug)]
pub enum DocumentError {
    SessionNotFound(Uuid),
    InvalidPath(String),
    /// Someone else holds the lock
    LockConflict {
        holder: Uuid,
        expires_at_ms: u64,
    },
    /// The edit demanded a held lock and none is held
    LockRequired,
    /// Our own lock lapsed before the edit
    LockExpired,
    ConflictNotFound(Uuid),
    /// The session moved on while the snapshot was in flight
    StaleRevert {
        expected: u64,
        actual: u64,
    },
    Api(ApiError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "unknown session {id}"),
            Self::InvalidPath(p) => write!(f, "path does not resolve: {p}"),
            Self::LockConflict { holder, .. } => {
                write!(f, "session locked by {holder}")
            }
            Self::LockRequired => write!(f, "edit requires holding the session lock"),
            Self::LockExpired => write!(f, "held lock has expired"),
            Self::ConflictNotFound(id) => write!(f, "unknown conflict {id}"),
            Self::StaleRevert { expected, actual } => write!(
                f,
                "revert abandoned: session at v{actual}, expected v{expected}"
            ),
            Self::Api(e) => write!(f, "backend error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

impl From<ApiError> for DocumentError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Conflict(info) => Self::LockConflict {
                holder: info.holder.unwrap_or(Uuid::nil()),
                expires_at_ms: info.expires_at_ms.unwrap_or(0),
            },
            other => Self::Api(other),
        }
    }
}

impl From<ProtocolError> for DocumentError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Events published to UI consumers.
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    ContentChanged { session_id: Uuid, version: u64 },
    ConflictDetected { session_id: Uuid, conflict_id: Uuid },
    ConflictResolved { session_id: Uuid, conflict_id: Uuid },
    LockChanged { session_id: Uuid },
    Reverted { session_id: Uuid, version: u64 },
}

/// The version and edit that last touched a path.
#[derive(Debug, Clone)]
struct LastWrite {
    version: u64,
    op: EditOperation,
}

/// One open collaborative session.
pub struct DocumentSession {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub content: Value,
    pub version: u64,
    pub participants: Vec<Uuid>,
    /// The most recent write per path, for concurrency detection
    last_writes: HashMap<Vec<PathSegment>, LastWrite>,
    /// Edits since the last snapshot
    op_log: Vec<EditOperation>,
    /// Current advisory lock, ours or a peer's
    pub lock: Option<Lock>,
}

impl DocumentSession {
    fn from_record(record: crate::api::SessionRecord) -> Self {
        Self {
            session_id: record.session_id,
            document_id: record.document_id,
            content: record.content,
            version: record.version,
            participants: record.participants,
            last_writes: HashMap::new(),
            op_log: Vec::new(),
            lock: None,
        }
    }
}

/// The document engine. One per client session, holding every open
/// collaborative session.
pub struct DocumentEngine<A> {
    user: UserIdentity,
    api: A,
    conn: ConnectionHandle,
    sessions: HashMap<Uuid, DocumentSession>,
    conflicts: HashMap<Uuid, Conflict>,
    events: EventBus<DocumentEvent>,
}

impl<A: RestClient> DocumentEngine<A> {
    pub fn new(user: UserIdentity, api: A, conn: ConnectionHandle) -> Self {
        Self {
            user,
            api,
            conn,
            sessions: HashMap::new(),
            conflicts: HashMap::new(),
            events: EventBus::new(256),
        }
    }

    /// Subscribe to document events.
    pub fn subscribe(&self) -> Subscription<DocumentEvent> {
        self.events.subscribe()
    }

    // ── Session lifecycle ────────────────────────────────────────

    /// Create a session for a document and open it locally.
    pub async fn create_session(
        &mut self,
        document_id: Uuid,
        initial_content: Value,
    ) -> Result<Uuid, DocumentError> {
        let record = self
            .api
            .create_session(self.user.user_id, document_id, initial_content)
            .await?;
        let session_id = record.session_id;
        self.sessions
            .insert(session_id, DocumentSession::from_record(record));
        self.announce_join(session_id).await;
        log::info!("created session {session_id} for document {document_id}");
        Ok(session_id)
    }

    /// Join an existing session. Access denial surfaces as an error.
    pub async fn join_session(&mut self, session_id: Uuid) -> Result<(), DocumentError> {
        let record = self.api.fetch_session(self.user.user_id, session_id).await?;
        self.sessions
            .insert(session_id, DocumentSession::from_record(record));
        self.announce_join(session_id).await;
        log::info!("joined session {session_id}");
        Ok(())
    }

    /// Close a session locally and tell peers we left.
    pub async fn leave_session(&mut self, session_id: Uuid) {
        if self.sessions.remove(&session_id).is_some() {
            self.conflicts.retain(|_, c| c.session_id != session_id);
            if let Ok(env) = Envelope::new(
                EventKind::ChannelLeave,
                self.user.user_id,
                session_id,
                &(),
            ) {
                self.conn.send(env).await;
            }
        }
    }

    async fn announce_join(&self, session_id: Uuid) {
        if let Ok(env) = Envelope::new(EventKind::ChannelJoin, self.user.user_id, session_id, &()) {
            self.conn.send(env).await;
        }
    }

    // ── Editing ──────────────────────────────────────────────────

    /// Apply a local edit and broadcast it.
    ///
    /// Fails without touching the tree when a peer holds an unexpired
    /// exclusive lock on the session.
    pub async fn apply_edit(
        &mut self,
        session_id: Uuid,
        kind: OperationKind,
        path: Vec<PathSegment>,
        value: Option<Value>,
    ) -> Result<Uuid, DocumentError> {
        self.apply_edit_inner(session_id, kind, path, value, false)
            .await
    }

    /// Like [`apply_edit`](Self::apply_edit), but the local user must
    /// hold the session lock, and it must not have lapsed.
    pub async fn apply_edit_locked(
        &mut self,
        session_id: Uuid,
        kind: OperationKind,
        path: Vec<PathSegment>,
        value: Option<Value>,
    ) -> Result<Uuid, DocumentError> {
        self.apply_edit_inner(session_id, kind, path, value, true)
            .await
    }

    async fn apply_edit_inner(
        &mut self,
        session_id: Uuid,
        kind: OperationKind,
        path: Vec<PathSegment>,
        value: Option<Value>,
        require_lock: bool,
    ) -> Result<Uuid, DocumentError> {
        let user_id = self.user.user_id;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(DocumentError::SessionNotFound(session_id))?;

        match &session.lock {
            Some(lock) if !lock.is_expired(now_ms()) && lock.holder != user_id => {
                return Err(DocumentError::LockConflict {
                    holder: lock.holder,
                    expires_at_ms: lock.expires_at_ms,
                });
            }
            Some(lock) if require_lock && lock.holder == user_id => {
                if lock.is_expired(now_ms()) {
                    return Err(DocumentError::LockExpired);
                }
            }
            _ if require_lock => return Err(DocumentError::LockRequired),
            _ => {}
        }

        let op = EditOperation {
            id: Uuid::new_v4(),
            session_id,
            author: user_id,
            kind,
            path,
            value,
            timestamp_ms: now_ms(),
            base_version: session.version,
        };

        apply_to_tree(&mut session.content, &op)?;
        session.version += 1;
        session.last_writes.insert(
            op.path.clone(),
            LastWrite {
                version: session.version,
                op: op.clone(),
            },
        );
        session.op_log.push(op.clone());

        let op_id = op.id;
        let version = session.version;
        self.events
            .publish(DocumentEvent::ContentChanged { session_id, version });
        self.conn
            .send(Envelope::json(EventKind::Operation, user_id, session_id, &op)?)
            .await;
        Ok(op_id)
    }

    /// Merge one remote edit.
    ///
    /// An edit is concurrent with local state when its base version
    /// predates the last write to the same path. Concurrent field
    /// writes resolve last-write-wins on timestamp (author id breaks
    /// ties), and the loser is recorded as a conflict. Concurrent
    /// insertions are both kept, ordered by the same rule, and
    /// recorded too. Edits on untouched paths merge cleanly.
    fn merge_remote(&mut self, op: EditOperation) -> Result<(), DocumentError> {
        let session_id = op.session_id;
        let Some(session) = self.sessions.get_mut(&session_id) else {
            log::debug!("edit for unknown session {session_id}, ignoring");
            return Ok(());
        };

        let concurrent = session
            .last_writes
            .get(&op.path)
            .map(|lw| op.base_version < lw.version)
            .unwrap_or(false);

        if !concurrent {
            apply_to_tree(&mut session.content, &op)?;
            session.version += 1;
            session.last_writes.insert(
                op.path.clone(),
                LastWrite {
                    version: session.version,
                    op: op.clone(),
                },
            );
            session.op_log.push(op);
            let version = session.version;
            self.events
                .publish(DocumentEvent::ContentChanged { session_id, version });
            return Ok(());
        }

        let local = session.last_writes.get(&op.path).cloned().map(|lw| lw.op);
        let local = match local {
            Some(l) => l,
            None => return Ok(()),
        };

        if op.kind == OperationKind::Insert && local.kind == OperationKind::Insert {
            // Keep both; deterministic order by (timestamp, author).
            // The ordering decides the slot too: a remote insert that
            // sorts after the local one lands right behind it, so both
            // peers converge on the same array regardless of delivery
            // order.
            let remote_first = ordering_key(&op) < ordering_key(&local);
            let mut placed = op.clone();
            if !remote_first {
                if let Some(PathSegment::Index(i)) = placed.path.last_mut() {
                    *i += 1;
                }
            }
            apply_to_tree(&mut session.content, &placed)?;
            session.version += 1;
            session.op_log.push(placed);
            let (first, second) = if remote_first {
                (op.clone(), local)
            } else {
                (local, op.clone())
            };
            let version = session.version;
            self.record_conflict(session_id, op.path, ConflictKind::Insertion { first, second });
            self.events
                .publish(DocumentEvent::ContentChanged { session_id, version });
            return Ok(());
        }

        let remote_wins = ordering_key(&op) > ordering_key(&local);
        if remote_wins {
            apply_to_tree(&mut session.content, &op)?;
            session.version += 1;
            session.last_writes.insert(
                op.path.clone(),
                LastWrite {
                    version: session.version,
                    op: op.clone(),
                },
            );
            session.op_log.push(op.clone());
            let version = session.version;
            self.events
                .publish(DocumentEvent::ContentChanged { session_id, version });
            self.record_conflict(
                session_id,
                op.path.clone(),
                ConflictKind::Field {
                    winner: op,
                    loser: local,
                },
            );
        } else {
            // Local stands; the remote edit is only recorded
            self.record_conflict(
                session_id,
                op.path.clone(),
                ConflictKind::Field {
                    winner: local,
                    loser: op,
                },
            );
        }
        Ok(())
    }

    fn record_conflict(&mut self, session_id: Uuid, path: Vec<PathSegment>, kind: ConflictKind) {
        let conflict = Conflict {
            id: Uuid::new_v4(),
            session_id,
            path,
            kind,
            resolution: ConflictResolution::Unresolved,
        };
        let conflict_id = conflict.id;
        log::info!(
            "conflict on {} in session {session_id}",
            path_display(&conflict.path)
        );
        self.conflicts.insert(conflict_id, conflict);
        self.events
            .publish(DocumentEvent::ConflictDetected { session_id, conflict_id });
    }

    /// The candidate values a user can pick from when settling a
    /// conflict, winner first.
    pub fn conflict_resolution_options(
        &self,
        conflict_id: Uuid,
    ) -> Result<Vec<Option<Value>>, DocumentError> {
        let conflict = self
            .conflicts
            .get(&conflict_id)
            .ok_or(DocumentError::ConflictNotFound(conflict_id))?;
        Ok(match &conflict.kind {
            ConflictKind::Field { winner, loser } => {
                vec![winner.value.clone(), loser.value.clone()]
            }
            ConflictKind::Insertion { first, second } => {
                vec![first.value.clone(), second.value.clone()]
            }
        })
    }

    /// Settle a recorded conflict by writing the chosen value at its
    /// path (or keeping the applied state when `value` is None).
    pub async fn resolve_conflict(
        &mut self,
        conflict_id: Uuid,
        value: Option<Value>,
    ) -> Result<(), DocumentError> {
        let conflict = self
            .conflicts
            .get(&conflict_id)
            .ok_or(DocumentError::ConflictNotFound(conflict_id))?;
        let session_id = conflict.session_id;
        let path = conflict.path.clone();

        if let Some(chosen) = value.clone() {
            self.apply_edit(session_id, OperationKind::Update, path, Some(chosen))
                .await?;
        }
        if let Some(conflict) = self.conflicts.get_mut(&conflict_id) {
            conflict.resolution = ConflictResolution::Resolved {
                value,
                resolver: self.user.user_id,
            };
        }
        self.events
            .publish(DocumentEvent::ConflictResolved { session_id, conflict_id });
        Ok(())
    }

    // ── Locks ────────────────────────────────────────────────────

    /// Take the session's exclusive lock for `ttl_ms`. A conflict
    /// reports the current holder and when their claim lapses.
    pub async fn acquire_lock(
        &mut self,
        session_id: Uuid,
        ttl_ms: u64,
    ) -> Result<Lock, DocumentError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(DocumentError::SessionNotFound(session_id));
        }
        let lock = self
            .api
            .acquire_lock(session_id, self.user.user_id, LockKind::Exclusive, ttl_ms)
            .await?;
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.lock = Some(lock.clone());
        }
        self.events.publish(DocumentEvent::LockChanged { session_id });
        self.conn
            .send(Envelope::new(
                EventKind::LockUpdate,
                self.user.user_id,
                session_id,
                &LockUpdatePayload::Acquired(lock.clone()),
            )?)
            .await;
        Ok(lock)
    }

    /// Release a lock we hold. Releasing an expired lock is a no-op.
    pub async fn release_lock(&mut self, session_id: Uuid) -> Result<(), DocumentError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(DocumentError::SessionNotFound(session_id))?;
        let Some(lock) = session.lock.take() else {
            return Ok(());
        };
        if lock.holder != self.user.user_id {
            session.lock = Some(lock);
            return Ok(());
        }
        // Best effort: local state is already cleared, and the backend
        // expires the lock on its own if this call never lands.
        if let Err(e) = self.api.release_lock(session_id, lock.lock_id).await {
            log::warn!("lock release for session {session_id} failed: {e}");
        }
        self.events.publish(DocumentEvent::LockChanged { session_id });
        self.conn
            .send(Envelope::new(
                EventKind::LockUpdate,
                self.user.user_id,
                session_id,
                &LockUpdatePayload::Released {
                    session_id,
                    lock_id: lock.lock_id,
                },
            )?)
            .await;
        Ok(())
    }

    /// Drop expired locks so the UI stops showing a dead claim.
    pub fn expire_locks(&mut self, now_ms: u64) {
        for session in self.sessions.values_mut() {
            if session.lock.as_ref().is_some_and(|l| l.is_expired(now_ms)) {
                let session_id = session.session_id;
                session.lock = None;
                self.events.publish(DocumentEvent::LockChanged { session_id });
            }
        }
    }

    // ── Versions ─────────────────────────────────────────────────

    /// Save the session's current state as a named version and compact
    /// the edit log.
    pub async fn create_version_snapshot(
        &mut self,
        session_id: Uuid,
        comment: impl Into<String>,
        major: bool,
    ) -> Result<VersionSnapshot, DocumentError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(DocumentError::SessionNotFound(session_id))?;
        let snapshot = VersionSnapshot {
            id: Uuid::new_v4(),
            session_id,
            version: session.version,
            content: session.content.clone(),
            comment: comment.into(),
            major,
            created_at_ms: now_ms(),
        };
        let saved = self.api.save_snapshot(snapshot).await?;
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.op_log.clear();
        }
        Ok(saved)
    }

    /// Restore an earlier version. The fetched state is applied as a
    /// fresh edit on top of the history (never a rollback), and the
    /// whole operation is abandoned if the session advanced while the
    /// snapshot was in flight.
    pub async fn revert_to_version(
        &mut self,
        session_id: Uuid,
        version: u64,
    ) -> Result<(), DocumentError> {
        let expected = self
            .sessions
            .get(&session_id)
            .ok_or(DocumentError::SessionNotFound(session_id))?
            .version;

        let snapshot = self.api.fetch_snapshot(session_id, version).await?;

        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(DocumentError::SessionNotFound(session_id))?;
        if session.version != expected {
            return Err(DocumentError::StaleRevert {
                expected,
                actual: session.version,
            });
        }

        let op = EditOperation {
            id: Uuid::new_v4(),
            session_id,
            author: self.user.user_id,
            kind: OperationKind::Update,
            path: Vec::new(),
            value: Some(snapshot.content.clone()),
            timestamp_ms: now_ms(),
            base_version: session.version,
        };
        session.content = snapshot.content;
        session.version += 1;
        session.last_writes.clear();
        session.last_writes.insert(
            Vec::new(),
            LastWrite {
                version: session.version,
                op: op.clone(),
            },
        );
        session.op_log.push(op.clone());
        let new_version = session.version;

        self.events.publish(DocumentEvent::Reverted {
            session_id,
            version: new_version,
        });
        self.conn
            .send(Envelope::json(
                EventKind::Operation,
                self.user.user_id,
                session_id,
                &op,
            )?)
            .await;
        Ok(())
    }

    /// Saved versions, newest first.
    pub async fn version_history(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<VersionSnapshot>, DocumentError> {
        Ok(self.api.list_snapshots(session_id).await?)
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Apply one inbound frame. Frames for other engines are ignored.
    pub fn handle_envelope(&mut self, env: &Envelope) {
        let result = match env.kind {
            EventKind::Operation => self.on_operation(env),
            EventKind::LockUpdate => self.on_lock_update(env),
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("dropping unappliable {:?} frame: {e}", env.kind);
        }
    }

    fn on_operation(&mut self, env: &Envelope) -> Result<(), DocumentError> {
        let op: EditOperation = env.payload_as_json()?;
        if op.author == self.user.user_id {
            return Ok(());
        }
        self.merge_remote(op)
    }

    fn on_lock_update(&mut self, env: &Envelope) -> Result<(), DocumentError> {
        let payload: LockUpdatePayload = env.payload_as()?;
        if env.sender == self.user.user_id {
            return Ok(());
        }
        match payload {
            LockUpdatePayload::Acquired(lock) => {
                let session_id = lock.session_id;
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.lock = Some(lock);
                    self.events.publish(DocumentEvent::LockChanged { session_id });
                }
            }
            LockUpdatePayload::Released { session_id, lock_id } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    if session.lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
                        session.lock = None;
                        self.events.publish(DocumentEvent::LockChanged { session_id });
                    }
                }
            }
        }
        Ok(())
    }

    // ── State access ─────────────────────────────────────────────

    pub fn user_id(&self) -> Uuid {
        self.user.user_id
    }

    pub fn backend(&self) -> &A {
        &self.api
    }

    pub fn session(&self, session_id: Uuid) -> Option<&DocumentSession> {
        self.sessions.get(&session_id)
    }

    pub fn conflicts(&self, session_id: Uuid) -> Vec<&Conflict> {
        self.conflicts
            .values()
            .filter(|c| c.session_id == session_id)
            .collect()
    }

    pub fn conflict(&self, conflict_id: Uuid) -> Option<&Conflict> {
        self.conflicts.get(&conflict_id)
    }

    pub fn unresolved_conflicts(&self, session_id: Uuid) -> usize {
        self.conflicts
            .values()
            .filter(|c| {
                c.session_id == session_id
                    && matches!(c.resolution, ConflictResolution::Unresolved)
            })
            .count()
    }
}

/// LWW ordering: later timestamp wins, author id breaks ties.
fn ordering_key(op: &EditOperation) -> (u64, Uuid) {
    (op.timestamp_ms, op.author)
}

/// Apply one edit to the content tree in place.
///
/// An empty path addresses the root itself (Update only). Cost is
/// linear in path depth.
fn apply_to_tree(root: &mut Value, op: &EditOperation) -> Result<(), DocumentError> {
    let invalid = || DocumentError::InvalidPath(path_display(&op.path));

    if op.path.is_empty() {
        return match (op.kind, &op.value) {
            (OperationKind::Update, Some(v)) => {
                *root = v.clone();
                Ok(())
            }
            _ => Err(invalid()),
        };
    }

    let (last, parents) = op.path.split_last().ok_or_else(invalid)?;
    let mut node = root;
    for segment in parents {
        node = match segment {
            PathSegment::Key(k) => node.get_mut(k.as_str()).ok_or_else(invalid)?,
            PathSegment::Index(i) => node.get_mut(*i).ok_or_else(invalid)?,
        };
    }

    match (op.kind, last) {
        (OperationKind::Insert, PathSegment::Key(k)) => {
            let map = node.as_object_mut().ok_or_else(invalid)?;
            let value = op.value.clone().ok_or_else(invalid)?;
            map.insert(k.clone(), value);
        }
        (OperationKind::Insert, PathSegment::Index(i)) => {
            let list = node.as_array_mut().ok_or_else(invalid)?;
            if *i > list.len() {
                return Err(invalid());
            }
            let value = op.value.clone().ok_or_else(invalid)?;
            list.insert(*i, value);
        }
        (OperationKind::Update, PathSegment::Key(k)) => {
            let map = node.as_object_mut().ok_or_else(invalid)?;
            let slot = map.get_mut(k.as_str()).ok_or_else(invalid)?;
            *slot = op.value.clone().ok_or_else(invalid)?;
        }
        (OperationKind::Update, PathSegment::Index(i)) => {
            let slot = node.get_mut(*i).ok_or_else(invalid)?;
            *slot = op.value.clone().ok_or_else(invalid)?;
        }
        (OperationKind::Delete, PathSegment::Key(k)) => {
            let map = node.as_object_mut().ok_or_else(invalid)?;
            map.remove(k.as_str()).ok_or_else(invalid)?;
        }
        (OperationKind::Delete, PathSegment::Index(i)) => {
            let list = node.as_array_mut().ok_or_else(invalid)?;
            if *i >= list.len() {
                return Err(invalid());
            }
            list.remove(*i);
        }
    }
    Ok(())
}
