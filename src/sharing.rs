//! Sharing and access control: grants, public links, and the
//! append-only access log.
//!
//! Permission levels are totally ordered so a check is a single
//! comparison. Expired grants are treated as absent at check time
//! rather than eagerly deleted, so the grant list still shows who was
//! invited. The access log is append-only and capped to the newest
//! entries.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ApiError, RestClient};
use crate::connection::ConnectionHandle;
use crate::events::{EventBus, Subscription};
use crate::protocol::{now_ms, Envelope, EventKind, ProtocolError, UserIdentity};

/// Entries kept per document access log.
pub const ACCESS_LOG_CAP: usize = 256;

/// Permission level, ordered weakest to strongest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PermissionLevel {
    View,
    Comment,
    Edit,
    Manage,
}

/// How a document is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareMode {
    /// Explicit per-user grants
    Users,
    /// Anyone with the link can view
    PublicLink,
}

/// One user's grant on a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareGrant {
    pub grantee: Uuid,
    pub level: PermissionLevel,
    /// Absent means the grant never expires
    pub expires_at_ms: Option<u64>,
}

impl ShareGrant {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// Request handed to the backend when sharing a document.
#[derive(Debug, Clone)]
pub struct ShareRequest {
    pub document_id: Uuid,
    pub grantor: Uuid,
    pub mode: ShareMode,
    pub grants: Vec<ShareGrant>,
}

/// What an access-log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    View,
    Download,
}

/// One access-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEntry {
    pub user_id: Uuid,
    pub kind: AccessKind,
    pub at_ms: u64,
}

/// A shared document as mirrored locally.
#[derive(Debug, Clone)]
pub struct SharedDocument {
    pub document_id: Uuid,
    pub grantor: Uuid,
    pub mode: ShareMode,
    pub grants: Vec<ShareGrant>,
    /// Set when `mode` is `PublicLink`
    pub public_url: Option<String>,
    /// Newest last, capped to [`ACCESS_LOG_CAP`]
    pub access_log: Vec<AccessEntry>,
}

/// Wire payload announcing an access event to the document's sharer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareAccessPayload {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub kind: AccessKind,
    pub at_ms: u64,
}

/// Sharing errors.
#[derive(Debug)]
pub enum SharingError {
    DocumentNotShared(Uuid),
    /// The user's effective level is below what the action needs
    InsufficientPermission {
        required: PermissionLevel,
        actual: Option<PermissionLevel>,
    },
    Api(ApiError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for SharingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentNotShared(id) => write!(f, "document {id} is not shared"),
            Self::InsufficientPermission { required, actual } => match actual {
                Some(level) => write!(f, "{level:?} access held, {required:?} required"),
                None => write!(f, "no access held, {required:?} required"),
            },
            Self::Api(e) => write!(f, "backend error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for SharingError {}

impl From<ApiError> for SharingError {
    fn from(e: ApiError) -> Self {
        Self::Api(e)
    }
}

/// Events published to UI consumers.
#[derive(Debug, Clone)]
pub enum SharingEvent {
    ShareCreated { document_id: Uuid },
    GrantRevoked { document_id: Uuid, grantee: Uuid },
    AccessRecorded { document_id: Uuid },
}

/// The sharing engine. One per client session.
pub struct SharingEngine<A> {
    user: UserIdentity,
    api: A,
    conn: ConnectionHandle,
    shares: HashMap<Uuid, SharedDocument>,
    events: EventBus<SharingEvent>,
}

impl<A: RestClient> SharingEngine<A> {
    pub fn new(user: UserIdentity, api: A, conn: ConnectionHandle) -> Self {
        Self {
            user,
            api,
            conn,
            shares: HashMap::new(),
            events: EventBus::new(256),
        }
    }

    /// Subscribe to sharing events.
    pub fn subscribe(&self) -> Subscription<SharingEvent> {
        self.events.subscribe()
    }

    /// Share a document. Public-link mode returns the generated URL on
    /// the share record.
    pub async fn share_document(
        &mut self,
        document_id: Uuid,
        mode: ShareMode,
        grants: Vec<ShareGrant>,
    ) -> Result<SharedDocument, SharingError> {
        let share = self
            .api
            .create_share(ShareRequest {
                document_id,
                grantor: self.user.user_id,
                mode,
                grants,
            })
            .await?;
        self.shares.insert(document_id, share.clone());
        self.events
            .publish(SharingEvent::ShareCreated { document_id });
        log::info!("shared document {document_id} ({mode:?})");
        Ok(share)
    }

    /// Revoke one grantee's access. Revocation takes effect for every
    /// future permission check; it never rewrites the access log.
    pub async fn revoke_grant(
        &mut self,
        document_id: Uuid,
        grantee: Uuid,
    ) -> Result<(), SharingError> {
        if !self.shares.contains_key(&document_id) {
            return Err(SharingError::DocumentNotShared(document_id));
        }
        self.api.revoke_share_grant(document_id, grantee).await?;
        if let Some(share) = self.shares.get_mut(&document_id) {
            share.grants.retain(|g| g.grantee != grantee);
        }
        self.events
            .publish(SharingEvent::GrantRevoked { document_id, grantee });
        Ok(())
    }

    /// A user's effective permission level right now, if any.
    ///
    /// Expired grants confer nothing. The grantor always holds Manage.
    /// A public link grants View to anyone not otherwise granted.
    pub fn effective_level(&self, document_id: Uuid, user: Uuid) -> Option<PermissionLevel> {
        let share = self.shares.get(&document_id)?;
        if user == share.grantor {
            return Some(PermissionLevel::Manage);
        }
        let now = now_ms();
        let granted = share
            .grants
            .iter()
            .filter(|g| g.grantee == user && !g.is_expired(now))
            .map(|g| g.level)
            .max();
        if granted.is_some() {
            return granted;
        }
        match share.mode {
            ShareMode::PublicLink => Some(PermissionLevel::View),
            ShareMode::Users => None,
        }
    }

    /// Check that `user` may act at `required` level on a document.
    pub fn check_user_permission(
        &self,
        document_id: Uuid,
        user: Uuid,
        required: PermissionLevel,
    ) -> Result<(), SharingError> {
        if !self.shares.contains_key(&document_id) {
            return Err(SharingError::DocumentNotShared(document_id));
        }
        let actual = self.effective_level(document_id, user);
        if actual.is_some_and(|level| level >= required) {
            Ok(())
        } else {
            Err(SharingError::InsufficientPermission { required, actual })
        }
    }

    /// Record a local access and announce it so the sharer's log stays
    /// current.
    pub async fn record_access(
        &mut self,
        document_id: Uuid,
        kind: AccessKind,
    ) -> Result<(), SharingError> {
        let user_id = self.user.user_id;
        let at_ms = now_ms();
        self.append_entry(document_id, AccessEntry { user_id, kind, at_ms })?;
        let env = Envelope::new(
            EventKind::ShareAccess,
            user_id,
            document_id,
            &ShareAccessPayload {
                document_id,
                user_id,
                kind,
                at_ms,
            },
        )
        .map_err(SharingError::Protocol)?;
        self.conn.send(env).await;
        Ok(())
    }

    fn append_entry(&mut self, document_id: Uuid, entry: AccessEntry) -> Result<(), SharingError> {
        let share = self
            .shares
            .get_mut(&document_id)
            .ok_or(SharingError::DocumentNotShared(document_id))?;
        share.access_log.push(entry);
        if share.access_log.len() > ACCESS_LOG_CAP {
            let excess = share.access_log.len() - ACCESS_LOG_CAP;
            share.access_log.drain(..excess);
        }
        self.events
            .publish(SharingEvent::AccessRecorded { document_id });
        Ok(())
    }

    /// Apply one inbound frame. Frames for other engines are ignored.
    pub fn handle_envelope(&mut self, env: &Envelope) {
        if env.kind != EventKind::ShareAccess {
            return;
        }
        match env.payload_as::<ShareAccessPayload>() {
            Ok(payload) => {
                if payload.user_id == self.user.user_id {
                    return;
                }
                let _ = self.append_entry(
                    payload.document_id,
                    AccessEntry {
                        user_id: payload.user_id,
                        kind: payload.kind,
                        at_ms: payload.at_ms,
                    },
                );
            }
            Err(e) => log::warn!("dropping undecodable ShareAccess frame: {e}"),
        }
    }

    // ── State access ─────────────────────────────────────────────

    pub fn share(&self, document_id: Uuid) -> Option<&SharedDocument> {
        self.shares.get(&document_id)
    }

    /// The access log, oldest to newest.
    pub fn access_log(&self, document_id: Uuid) -> &[AccessEntry] {
        self.shares
            .get(&document_id)
            .map_or(&[], |s| s.access_log.as_slice())
    }
}
