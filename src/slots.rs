//! # Connection Slots
//!
//! Role assignment and lifecycle for the peers of one port pair.
//!
//! ## Roles
//!
//! | Port | Role | Limit |
//! |------|------|-------|
//! | `port1` | User | one; a second peer is handled by [`UserSlotPolicy`] |
//! | `port2` | Engineer | `max_engineers` across all transports |
//!
//! ## Lifecycle
//!
//! ```text
//! New ──handshake──► Established ──first valid frame──► Active
//!  │                      │                               │
//!  └──────────────────────┴───────────────────────────────┴──► Closed
//! ```
//!
//! Stream transports with a handshake (WebSocket, secure WebSocket) start in
//! `New`; raw TCP and UDP peers are admitted already `Established`. Dropping a
//! [`Slot`] drops its egress sender, which ends the transport worker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::signing::{SigningGate, TrustLevel};

pub type SlotId = u64;

// ============================================================================
// Slot Attributes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Engineer,
}

impl Role {
    /// Connection name used in log lines (`conn1` for users, `conn2` for engineers).
    pub fn conn_label(&self) -> &'static str {
        match self {
            Role::User => "conn1",
            Role::Engineer => "conn2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    WebSocket,
    SecureWebSocket,
}

impl TransportKind {
    /// Prefix used in log lines; UDP has none.
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Udp => "",
            TransportKind::Tcp => "TCP ",
            TransportKind::WebSocket => "WS ",
            TransportKind::SecureWebSocket => "WSS ",
        }
    }

    pub fn has_handshake(&self) -> bool {
        matches!(self, TransportKind::WebSocket | TransportKind::SecureWebSocket)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    New,
    Established,
    Active,
    Closed,
}

impl SlotState {
    pub fn can_enter(self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (SlotState::New, SlotState::Established)
                | (SlotState::Established, SlotState::Active)
                | (SlotState::New | SlotState::Established | SlotState::Active, SlotState::Closed)
        )
    }
}

/// What to do when a second user peer arrives while one is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserSlotPolicy {
    /// Close the existing user slot; the newcomer wins.
    #[default]
    ReplaceExisting,
    /// Keep the existing user slot and refuse the newcomer.
    RejectNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    EngineerCapReached,
    UserSlotTaken,
}

// ============================================================================
// Slot
// ============================================================================

#[derive(Debug)]
pub struct Slot {
    pub id: SlotId,
    pub role: Role,
    pub transport: TransportKind,
    pub peer: SocketAddr,
    state: SlotState,
    pub gate: SigningGate,
    pub created: Instant,
    pub last_activity: Instant,
    /// Frames received from this peer.
    pub messages: u32,
    egress: mpsc::Sender<Vec<u8>>,
    last_notice: Option<Instant>,
}

impl Slot {
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn trust(&self) -> TrustLevel {
        self.gate.trust()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SlotState::Established | SlotState::Active)
    }

    /// Apply a guarded transition; returns false when it is not allowed.
    pub fn advance(&mut self, next: SlotState) -> bool {
        if !self.state.can_enter(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Queue bytes for the peer without waiting. Returns false when the
    /// queue is full or the worker is gone; the bytes are dropped.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.egress.try_send(bytes).is_ok()
    }

    /// Rate limiter for engineer notices.
    pub fn notice_due(&mut self, now: Instant, interval: Duration) -> bool {
        match self.last_notice {
            Some(last) if now.saturating_duration_since(last) < interval => false,
            _ => {
                self.last_notice = Some(now);
                true
            }
        }
    }

    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            id: self.id,
            role: self.role,
            transport: self.transport,
            peer: self.peer,
            state: self.state,
            trust: self.trust(),
            messages: self.messages,
        }
    }
}

/// Snapshot of a slot for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: SlotId,
    pub role: Role,
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub state: SlotState,
    pub trust: TrustLevel,
    pub messages: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairStatus {
    pub user: Option<SlotInfo>,
    pub engineers: Vec<SlotInfo>,
}

// ============================================================================
// Slot Manager
// ============================================================================

#[derive(Debug)]
pub struct SlotManager {
    max_engineers: usize,
    user_policy: UserSlotPolicy,
    slots: HashMap<SlotId, Slot>,
    user: Option<SlotId>,
    next_id: SlotId,
}

/// Successful admission. `replaced` is the user slot evicted by the newcomer.
#[derive(Debug)]
pub struct Admitted {
    pub id: SlotId,
    pub replaced: Option<Slot>,
}

impl SlotManager {
    pub fn new(max_engineers: usize, user_policy: UserSlotPolicy) -> Self {
        Self {
            max_engineers,
            user_policy,
            slots: HashMap::new(),
            user: None,
            next_id: 1,
        }
    }

    pub fn admit(
        &mut self,
        role: Role,
        transport: TransportKind,
        peer: SocketAddr,
        egress: mpsc::Sender<Vec<u8>>,
        now: Instant,
    ) -> Result<Admitted, Refusal> {
        let mut replaced = None;
        match role {
            Role::Engineer => {
                if self.engineer_count() >= self.max_engineers {
                    return Err(Refusal::EngineerCapReached);
                }
            }
            Role::User => {
                if let Some(existing) = self.user {
                    match self.user_policy {
                        UserSlotPolicy::RejectNew => return Err(Refusal::UserSlotTaken),
                        UserSlotPolicy::ReplaceExisting => replaced = self.close(existing),
                    }
                }
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let state = if transport.has_handshake() { SlotState::New } else { SlotState::Established };
        self.slots.insert(
            id,
            Slot {
                id,
                role,
                transport,
                peer,
                state,
                gate: SigningGate::new(),
                created: now,
                last_activity: now,
                messages: 0,
                egress,
                last_notice: None,
            },
        );
        if role == Role::User {
            self.user = Some(id);
        }
        Ok(Admitted { id, replaced })
    }

    pub fn max_engineers(&self) -> usize {
        self.max_engineers
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(&id)
    }

    pub fn user(&self) -> Option<&Slot> {
        self.user.and_then(|id| self.slots.get(&id))
    }

    pub fn engineers(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values().filter(|s| s.role == Role::Engineer)
    }

    pub fn engineers_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.values_mut().filter(|s| s.role == Role::Engineer)
    }

    pub fn engineer_count(&self) -> usize {
        self.engineers().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot for a UDP peer already known under `role`.
    pub fn find_udp(&self, role: Role, peer: SocketAddr) -> Option<SlotId> {
        self.slots
            .values()
            .find(|s| s.role == role && s.transport == TransportKind::Udp && s.peer == peer)
            .map(|s| s.id)
    }

    /// Mark a slot closed and release it. `None` if it was already gone.
    pub fn close(&mut self, id: SlotId) -> Option<Slot> {
        let mut slot = self.slots.remove(&id)?;
        slot.advance(SlotState::Closed);
        if self.user == Some(id) {
            self.user = None;
        }
        Some(slot)
    }

    pub fn expired(&self, now: Instant, idle_timeout: Duration) -> Vec<SlotId> {
        self.slots
            .values()
            .filter(|s| s.idle_for(now) >= idle_timeout)
            .map(|s| s.id)
            .collect()
    }

    /// Close every slot.
    pub fn drain(&mut self) -> Vec<Slot> {
        let ids: Vec<SlotId> = self.slots.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.close(id)).collect()
    }

    pub fn status(&self) -> PairStatus {
        let mut engineers: Vec<SlotInfo> = self.engineers().map(Slot::info).collect();
        engineers.sort_by_key(|s| s.id);
        PairStatus {
            user: self.user().map(Slot::info),
            engineers,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn egress() -> mpsc::Sender<Vec<u8>> {
        mpsc::channel(4).0
    }

    #[test]
    fn test_state_transitions_are_guarded() {
        assert!(SlotState::New.can_enter(SlotState::Established));
        assert!(SlotState::Established.can_enter(SlotState::Active));
        assert!(SlotState::Active.can_enter(SlotState::Closed));
        assert!(!SlotState::New.can_enter(SlotState::Active));
        assert!(!SlotState::Active.can_enter(SlotState::Established));
        assert!(!SlotState::Closed.can_enter(SlotState::Closed));
        assert!(!SlotState::Closed.can_enter(SlotState::Active));
    }

    #[test]
    fn test_engineer_cap() {
        let now = Instant::now();
        let mut slots = SlotManager::new(2, UserSlotPolicy::default());
        for port in 0..2 {
            slots.admit(Role::Engineer, TransportKind::Tcp, addr(port), egress(), now).unwrap();
        }
        let refused = slots.admit(Role::Engineer, TransportKind::Udp, addr(9), egress(), now);
        assert_eq!(refused.unwrap_err(), Refusal::EngineerCapReached);
        assert_eq!(slots.engineer_count(), 2);

        // The user slot does not count toward the cap.
        slots.admit(Role::User, TransportKind::Udp, addr(10), egress(), now).unwrap();
    }

    #[test]
    fn test_user_policy_replace() {
        let now = Instant::now();
        let mut slots = SlotManager::new(8, UserSlotPolicy::ReplaceExisting);
        let first = slots.admit(Role::User, TransportKind::Udp, addr(1), egress(), now).unwrap();
        let second = slots.admit(Role::User, TransportKind::Tcp, addr(2), egress(), now).unwrap();

        let replaced = second.replaced.unwrap();
        assert_eq!(replaced.id, first.id);
        assert_eq!(replaced.state(), SlotState::Closed);
        assert_eq!(slots.user().unwrap().peer, addr(2));
    }

    #[test]
    fn test_user_policy_reject() {
        let now = Instant::now();
        let mut slots = SlotManager::new(8, UserSlotPolicy::RejectNew);
        slots.admit(Role::User, TransportKind::Udp, addr(1), egress(), now).unwrap();
        let refused = slots.admit(Role::User, TransportKind::Udp, addr(2), egress(), now);
        assert_eq!(refused.unwrap_err(), Refusal::UserSlotTaken);
        assert_eq!(slots.user().unwrap().peer, addr(1));
    }

    #[test]
    fn test_handshake_transports_start_new() {
        let now = Instant::now();
        let mut slots = SlotManager::new(8, UserSlotPolicy::default());
        let ws = slots.admit(Role::Engineer, TransportKind::WebSocket, addr(1), egress(), now).unwrap();
        let tcp = slots.admit(Role::Engineer, TransportKind::Tcp, addr(2), egress(), now).unwrap();
        assert_eq!(slots.get(ws.id).unwrap().state(), SlotState::New);
        assert_eq!(slots.get(tcp.id).unwrap().state(), SlotState::Established);
    }

    #[test]
    fn test_expired_and_close() {
        let start = Instant::now();
        let mut slots = SlotManager::new(8, UserSlotPolicy::default());
        let a = slots.admit(Role::Engineer, TransportKind::Udp, addr(1), egress(), start).unwrap();
        let b = slots.admit(Role::Engineer, TransportKind::Udp, addr(2), egress(), start).unwrap();

        let later = start + Duration::from_secs(11);
        slots.get_mut(b.id).unwrap().touch(later);
        assert_eq!(slots.expired(later, Duration::from_secs(10)), vec![a.id]);

        assert!(slots.close(a.id).is_some());
        assert!(slots.close(a.id).is_none());
        assert_eq!(slots.find_udp(Role::Engineer, addr(2)), Some(b.id));
        assert_eq!(slots.find_udp(Role::User, addr(2)), None);
    }

    #[test]
    fn test_notice_rate_limit() {
        let now = Instant::now();
        let mut slots = SlotManager::new(8, UserSlotPolicy::default());
        let id = slots.admit(Role::Engineer, TransportKind::Udp, addr(1), egress(), now).unwrap().id;
        let slot = slots.get_mut(id).unwrap();
        let interval = Duration::from_secs(2);
        assert!(slot.notice_due(now, interval));
        assert!(!slot.notice_due(now + Duration::from_secs(1), interval));
        assert!(slot.notice_due(now + Duration::from_secs(3), interval));
    }

    #[test]
    fn test_send_drops_when_full() {
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel(1);
        let mut slots = SlotManager::new(8, UserSlotPolicy::default());
        let id = slots.admit(Role::Engineer, TransportKind::Udp, addr(1), tx, now).unwrap().id;
        let slot = slots.get(id).unwrap();
        assert!(slot.send(vec![1]));
        assert!(!slot.send(vec![2]));
    }

    #[test]
    fn test_drain_closes_everything() {
        let now = Instant::now();
        let mut slots = SlotManager::new(8, UserSlotPolicy::default());
        slots.admit(Role::User, TransportKind::Udp, addr(1), egress(), now).unwrap();
        slots.admit(Role::Engineer, TransportKind::Udp, addr(2), egress(), now).unwrap();
        let drained = slots.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|s| s.state() == SlotState::Closed));
        assert!(slots.is_empty());
        assert!(slots.user().is_none());
    }
}
