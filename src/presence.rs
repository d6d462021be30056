//! Presence tracking: who is online, where, and on how many devices.
//!
//! The local side derives its own status from activity signals (input,
//! tab visibility, network reachability) and broadcasts changes; the
//! remote side mirrors peer announcements last-write-wins by their
//! wall-clock timestamp. A user on several devices is shown at the
//! strongest status any device reports.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::events::{EventBus, Subscription};
use crate::protocol::{now_ms, Envelope, EventKind, ProtocolError, UserIdentity};

/// Presence status, ordered weakest to strongest so that multi-device
/// aggregation is a plain `max`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PresenceStatus {
    Offline,
    Away,
    Idle,
    Online,
}

/// One peer as mirrored locally.
#[derive(Debug, Clone)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub name: String,
    pub status: PresenceStatus,
    /// Last time any announcement from this user arrived
    pub last_seen_ms: u64,
    pub current_page: Option<String>,
    /// Per-device status; the user-level `status` is the max of these
    pub devices: HashMap<Uuid, PresenceStatus>,
}

impl UserPresence {
    fn aggregate(&mut self) {
        self.status = self
            .devices
            .values()
            .copied()
            .max()
            .unwrap_or(PresenceStatus::Offline);
    }
}

/// Wire payload for a presence announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user: UserIdentity,
    pub device_id: Uuid,
    pub status: PresenceStatus,
    pub current_page: Option<String>,
}

/// Presence tunables.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// No activity for this long downgrades Online to Idle
    pub idle_threshold: Duration,
    /// Peers silent for this long are purged entirely
    pub stale_retention: Duration,
    pub event_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(10 * 60),
            stale_retention: Duration::from_secs(30 * 60),
            event_capacity: 256,
        }
    }
}

/// Events published to UI consumers.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    PeerChanged { user_id: Uuid, status: PresenceStatus },
    PeerRemoved { user_id: Uuid },
    LocalChanged { status: PresenceStatus },
    ChannelChanged { channel_id: Uuid },
}

/// The presence tracker. One per client session.
pub struct PresenceTracker {
    user: UserIdentity,
    device_id: Uuid,
    conn: ConnectionHandle,
    config: PresenceConfig,
    tracking: bool,
    current_page: Option<String>,
    visibility_hidden: bool,
    network_offline: bool,
    last_activity: Instant,
    local_status: PresenceStatus,
    peers: HashMap<Uuid, UserPresence>,
    /// Monotonic arrival clock per peer, for stale purge
    peer_seen: HashMap<Uuid, Instant>,
    /// channel → member user ids, mirrored from join/leave frames
    channels: HashMap<Uuid, HashSet<Uuid>>,
    /// Channels the local user has joined
    joined: HashSet<Uuid>,
    events: EventBus<PresenceEvent>,
}

impl PresenceTracker {
    pub fn new(user: UserIdentity, conn: ConnectionHandle) -> Self {
        Self::with_config(user, conn, PresenceConfig::default())
    }

    pub fn with_config(user: UserIdentity, conn: ConnectionHandle, config: PresenceConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            user,
            device_id: Uuid::new_v4(),
            conn,
            config,
            tracking: false,
            current_page: None,
            visibility_hidden: false,
            network_offline: false,
            last_activity: Instant::now(),
            local_status: PresenceStatus::Offline,
            peers: HashMap::new(),
            peer_seen: HashMap::new(),
            channels: HashMap::new(),
            joined: HashSet::new(),
            events,
        }
    }

    /// Subscribe to presence events.
    pub fn subscribe(&self) -> Subscription<PresenceEvent> {
        self.events.subscribe()
    }

    // ── Local signals ────────────────────────────────────────────

    /// Start announcing the local user on the given page.
    pub async fn start_tracking(&mut self, page: impl Into<String>) {
        self.tracking = true;
        self.current_page = Some(page.into());
        self.last_activity = Instant::now();
        self.refresh_local(Instant::now()).await;
    }

    /// Stop announcing and broadcast an Offline farewell.
    pub async fn stop_tracking(&mut self) {
        self.tracking = false;
        if self.local_status != PresenceStatus::Offline {
            self.local_status = PresenceStatus::Offline;
            self.broadcast().await;
            self.events.publish(PresenceEvent::LocalChanged {
                status: PresenceStatus::Offline,
            });
        }
    }

    /// User input happened: reset the idle timer.
    pub async fn update_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.refresh_local(now).await;
    }

    /// Tab hidden/shown. A hidden tab reads as Away regardless of the
    /// idle timer.
    pub async fn set_visibility_hidden(&mut self, hidden: bool) {
        self.visibility_hidden = hidden;
        self.refresh_local(Instant::now()).await;
    }

    /// Network reachability changed.
    pub async fn set_network_offline(&mut self, offline: bool) {
        self.network_offline = offline;
        self.refresh_local(Instant::now()).await;
    }

    /// Navigated to a new page.
    pub async fn set_current_page(&mut self, page: impl Into<String>) {
        self.current_page = Some(page.into());
        if self.tracking {
            self.broadcast().await;
        }
    }

    /// Periodic maintenance: idle detection and stale peer purge.
    pub async fn tick(&mut self, now: Instant) {
        self.refresh_local(now).await;

        let retention = self.config.stale_retention;
        let stale: Vec<Uuid> = self
            .peer_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > retention)
            .map(|(id, _)| *id)
            .collect();
        for user_id in stale {
            self.peer_seen.remove(&user_id);
            self.peers.remove(&user_id);
            for members in self.channels.values_mut() {
                members.remove(&user_id);
            }
            self.events.publish(PresenceEvent::PeerRemoved { user_id });
            log::debug!("purged stale peer {user_id}");
        }
    }

    fn derive_status(&self, now: Instant) -> PresenceStatus {
        if !self.tracking || self.network_offline {
            return PresenceStatus::Offline;
        }
        if self.visibility_hidden {
            return PresenceStatus::Away;
        }
        if now.duration_since(self.last_activity) >= self.config.idle_threshold {
            return PresenceStatus::Idle;
        }
        PresenceStatus::Online
    }

    async fn refresh_local(&mut self, now: Instant) {
        let status = self.derive_status(now);
        if status == self.local_status {
            return;
        }
        self.local_status = status;
        self.events.publish(PresenceEvent::LocalChanged { status });
        // Nothing to announce while unreachable; the frame would only
        // sit in the offline queue and arrive stale.
        if !self.network_offline {
            self.broadcast().await;
        }
    }

    async fn broadcast(&self) {
        let payload = PresencePayload {
            user: self.user.clone(),
            device_id: self.device_id,
            status: self.local_status,
            current_page: self.current_page.clone(),
        };
        match Envelope::new(EventKind::Presence, self.user.user_id, Uuid::nil(), &payload) {
            Ok(env) => self.conn.send(env).await,
            Err(e) => log::error!("presence announcement failed to encode: {e}"),
        }
    }

    // ── Channels ─────────────────────────────────────────────────

    /// Join a presence channel (a room or a session scope).
    pub async fn join_channel(&mut self, channel_id: Uuid) {
        self.joined.insert(channel_id);
        self.channels
            .entry(channel_id)
            .or_default()
            .insert(self.user.user_id);
        self.events
            .publish(PresenceEvent::ChannelChanged { channel_id });
        match Envelope::new(EventKind::ChannelJoin, self.user.user_id, channel_id, &()) {
            Ok(env) => self.conn.send(env).await,
            Err(e) => log::error!("channel join failed to encode: {e}"),
        }
    }

    /// Leave a presence channel.
    pub async fn leave_channel(&mut self, channel_id: Uuid) {
        self.joined.remove(&channel_id);
        if let Some(members) = self.channels.get_mut(&channel_id) {
            members.remove(&self.user.user_id);
        }
        self.events
            .publish(PresenceEvent::ChannelChanged { channel_id });
        match Envelope::new(EventKind::ChannelLeave, self.user.user_id, channel_id, &()) {
            Ok(env) => self.conn.send(env).await,
            Err(e) => log::error!("channel leave failed to encode: {e}"),
        }
    }

    /// Members of a channel, as mirrored from join/leave traffic.
    pub fn channel_members(&self, channel_id: Uuid) -> Vec<Uuid> {
        let mut members: Vec<Uuid> = self
            .channels
            .get(&channel_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Apply one inbound frame. Frames for other engines are ignored.
    pub fn handle_envelope(&mut self, env: &Envelope) {
        let result = match env.kind {
            EventKind::Presence => self.on_presence(env),
            EventKind::ChannelJoin => {
                self.on_channel(env, true);
                Ok(())
            }
            EventKind::ChannelLeave => {
                self.on_channel(env, false);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("dropping undecodable {:?} frame: {e}", env.kind);
        }
    }

    fn on_presence(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        let payload: PresencePayload = env.payload_as()?;
        if payload.user.user_id == self.user.user_id {
            return Ok(());
        }

        let entry = self
            .peers
            .entry(payload.user.user_id)
            .or_insert_with(|| UserPresence {
                user_id: payload.user.user_id,
                name: payload.user.name.clone(),
                status: PresenceStatus::Offline,
                last_seen_ms: 0,
                current_page: None,
                devices: HashMap::new(),
            });

        // Last write wins per device; an older announcement from a
        // replay never regresses newer state.
        if env.timestamp_ms < entry.last_seen_ms {
            return Ok(());
        }
        entry.last_seen_ms = env.timestamp_ms;
        entry.name = payload.user.name;
        entry.current_page = payload.current_page;
        if payload.status == PresenceStatus::Offline {
            entry.devices.remove(&payload.device_id);
        } else {
            entry.devices.insert(payload.device_id, payload.status);
        }
        let before = entry.status;
        entry.aggregate();
        let (user_id, status) = (entry.user_id, entry.status);
        self.peer_seen.insert(user_id, Instant::now());
        if status != before {
            self.events
                .publish(PresenceEvent::PeerChanged { user_id, status });
        }
        Ok(())
    }

    fn on_channel(&mut self, env: &Envelope, joined: bool) {
        if env.sender == self.user.user_id {
            return;
        }
        let members = self.channels.entry(env.channel).or_default();
        let changed = if joined {
            members.insert(env.sender)
        } else {
            members.remove(&env.sender)
        };
        if changed {
            self.events.publish(PresenceEvent::ChannelChanged {
                channel_id: env.channel,
            });
        }
    }

    // ── State access ─────────────────────────────────────────────

    pub fn local_status(&self) -> PresenceStatus {
        self.local_status
    }

    pub fn peer(&self, user_id: Uuid) -> Option<&UserPresence> {
        self.peers.get(&user_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &UserPresence> {
        self.peers.values()
    }

    /// Peers currently reachable at any status above Offline.
    pub fn online_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.status > PresenceStatus::Offline)
            .count()
    }
}
