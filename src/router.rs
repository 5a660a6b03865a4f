//! # Port Pair Router
//!
//! One actor per port pair owns the slot table, every slot's signing gate and
//! the pair's signing key. Listeners and transport workers talk to it through
//! a cheap-to-clone [`PairRouter`] handle.
//!
//! ## Forwarding Rules
//!
//! | Direction | Frames | Delivered to |
//! |-----------|--------|--------------|
//! | user → engineer | HEARTBEAT | every open engineer slot |
//! | user → engineer | anything else | authenticated engineer slots only |
//! | engineer → user | everything except a signed SETUP_SIGNING | the user slot |
//!
//! v2 frames to engineers are re-signed with the pair key, so a ground station
//! that enforces signing accepts them. Frames to the user lose their signature.
//! Relay notices stay unsigned so an engineer without the key can read them.
//!
//! Delivery uses `try_send` on each slot's bounded egress queue, so a slow
//! peer loses frames instead of stalling the pair.
//!
//! ## Engineer Feedback
//!
//! Problems with an engineer's signing are logged when they first appear on a
//! slot and reported to the engineer as unsigned STATUSTEXT notices, at most
//! one per [`NOTICE_INTERVAL`].

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::crypto::signing_timestamp_now;
use crate::frame::{
    Frame, MSG_ID_HEARTBEAT, MSG_ID_SETUP_SIGNING, SEVERITY_CRITICAL, SetupSigning, statustext,
};
use crate::signing::{SigningKey, TrustLevel, Verdict};
use crate::slots::{
    PairStatus, Refusal, Role, Slot, SlotId, SlotManager, SlotState, TransportKind, UserSlotPolicy,
};
use crate::store::StoreHandle;
use crate::transport::spawn_udp_writer;

// ============================================================================
// Constants
// ============================================================================

/// Depth of the router's command queue.
pub const ROUTER_QUEUE_DEPTH: usize = 1024;

/// Frames buffered per slot before forwarding starts dropping.
pub const EGRESS_QUEUE_DEPTH: usize = 256;

/// Minimum spacing between notices sent to one engineer slot.
pub const NOTICE_INTERVAL: Duration = Duration::from_secs(2);

/// Interval for idle sweeps and signing clock updates.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Refused UDP peers remembered so a refusal is logged once.
/// SECURITY: Bounded so spoofed sources cannot grow memory.
pub const MAX_REFUSED_PEERS: usize = 256;

/// Source ids for notices sent before any user HEARTBEAT has been seen.
pub const DEFAULT_NOTICE_SOURCE: (u8, u8) = (1, 1);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub max_engineers: usize,
    pub idle_timeout: Duration,
    pub user_policy: UserSlotPolicy,
}

// ============================================================================
// Commands
// ============================================================================

enum RouterCommand {
    Connect {
        role: Role,
        transport: TransportKind,
        peer: SocketAddr,
        egress: mpsc::Sender<Vec<u8>>,
        reply: oneshot::Sender<Option<SlotId>>,
    },
    Established {
        slot: SlotId,
    },
    Datagram {
        role: Role,
        peer: SocketAddr,
        frames: Vec<Frame>,
        socket: Arc<UdpSocket>,
    },
    Frames {
        slot: SlotId,
        frames: Vec<Frame>,
    },
    Disconnected {
        slot: SlotId,
        reason: &'static str,
    },
    Status {
        reply: oneshot::Sender<PairStatus>,
    },
    Quit {
        done: oneshot::Sender<()>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to one port pair's router actor.
#[derive(Clone)]
pub struct PairRouter {
    cmd_tx: mpsc::Sender<RouterCommand>,
    port1: u16,
    port2: u16,
}

impl std::fmt::Debug for PairRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairRouter")
            .field("port1", &self.port1)
            .field("port2", &self.port2)
            .finish()
    }
}

impl PairRouter {
    /// Spawn the actor for a pair. `key` is the pair's key at startup.
    pub fn spawn(
        port1: u16,
        port2: u16,
        key: Option<SigningKey>,
        store: StoreHandle,
        config: RouterConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(ROUTER_QUEUE_DEPTH);
        let actor = PairActor::new(port1, port2, key, store, config);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx, port1, port2 }
    }

    pub fn port1(&self) -> u16 {
        self.port1
    }

    pub fn port2(&self) -> u16 {
        self.port2
    }

    /// Ask for a slot for a stream peer. `None` means refused; the caller
    /// closes the connection.
    pub async fn connect(
        &self,
        role: Role,
        transport: TransportKind,
        peer: SocketAddr,
        egress: mpsc::Sender<Vec<u8>>,
    ) -> Option<SlotId> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RouterCommand::Connect { role, transport, peer, egress, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Report that a slot finished its transport handshake.
    pub async fn established(&self, slot: SlotId) {
        let _ = self.cmd_tx.send(RouterCommand::Established { slot }).await;
    }

    pub async fn datagram(&self, role: Role, peer: SocketAddr, frames: Vec<Frame>, socket: Arc<UdpSocket>) {
        let _ = self
            .cmd_tx
            .send(RouterCommand::Datagram { role, peer, frames, socket })
            .await;
    }

    pub async fn frames(&self, slot: SlotId, frames: Vec<Frame>) {
        let _ = self.cmd_tx.send(RouterCommand::Frames { slot, frames }).await;
    }

    pub async fn disconnected(&self, slot: SlotId, reason: &'static str) {
        let _ = self.cmd_tx.send(RouterCommand::Disconnected { slot, reason }).await;
    }

    pub async fn status(&self) -> Option<PairStatus> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(RouterCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Close every slot, flush accounting and stop the actor.
    pub async fn quit(&self) {
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(RouterCommand::Quit { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct PairActor {
    port1: u16,
    port2: u16,
    slots: SlotManager,
    key: Option<SigningKey>,
    store: StoreHandle,
    idle_timeout: Duration,
    /// SECURITY: Bounded by MAX_REFUSED_PEERS via LruCache.
    refused_udp: LruCache<SocketAddr, ()>,
    /// sysid/compid of the latest user HEARTBEAT; notices claim to come from it.
    user_source: Option<(u8, u8)>,
    saved_timestamp: u64,
}

impl PairActor {
    fn new(
        port1: u16,
        port2: u16,
        key: Option<SigningKey>,
        store: StoreHandle,
        config: RouterConfig,
    ) -> Self {
        let refused_cap = NonZeroUsize::new(MAX_REFUSED_PEERS)
            .expect("MAX_REFUSED_PEERS must be non-zero");
        Self {
            port1,
            port2,
            slots: SlotManager::new(config.max_engineers, config.user_policy),
            key,
            store,
            idle_timeout: config.idle_timeout,
            refused_udp: LruCache::new(refused_cap),
            user_source: None,
            saved_timestamp: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RouterCommand>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RouterCommand::Connect { role, transport, peer, egress, reply }) => {
                            let result = self.connect(role, transport, peer, egress).await;
                            let _ = reply.send(result);
                        }
                        Some(RouterCommand::Established { slot }) => {
                            self.established(slot);
                        }
                        Some(RouterCommand::Datagram { role, peer, frames, socket }) => {
                            self.datagram(role, peer, frames, socket).await;
                        }
                        Some(RouterCommand::Frames { slot, frames }) => {
                            self.handle_frames(slot, frames).await;
                        }
                        Some(RouterCommand::Disconnected { slot, reason }) => {
                            self.close_slot(slot, reason);
                        }
                        Some(RouterCommand::Status { reply }) => {
                            let _ = reply.send(self.slots.status());
                        }
                        Some(RouterCommand::Quit { done }) => {
                            self.shutdown();
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }

                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
        debug!(port2 = self.port2, "router actor stopped");
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    async fn connect(
        &mut self,
        role: Role,
        transport: TransportKind,
        peer: SocketAddr,
        egress: mpsc::Sender<Vec<u8>>,
    ) -> Option<SlotId> {
        let first_engineer = role == Role::Engineer && self.slots.engineer_count() == 0;
        let admitted = match self.slots.admit(role, transport, peer, egress, Instant::now()) {
            Ok(admitted) => admitted,
            Err(refusal) => {
                self.log_refusal(refusal, transport, peer);
                return None;
            }
        };

        if let Some(old) = admitted.replaced {
            self.finish_slot(old, "replaced");
        }
        if first_engineer {
            self.reload_key().await;
        }
        if !transport.has_handshake() {
            self.log_have(role, transport, peer);
        }
        Some(admitted.id)
    }

    fn established(&mut self, id: SlotId) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.advance(SlotState::Established) {
            let (role, transport, peer) = (slot.role, slot.transport, slot.peer);
            slot.touch(Instant::now());
            self.log_have(role, transport, peer);
        }
    }

    async fn datagram(&mut self, role: Role, peer: SocketAddr, frames: Vec<Frame>, socket: Arc<UdpSocket>) {
        let id = match self.slots.find_udp(role, peer) {
            Some(id) => id,
            None => {
                if self.refused_udp.contains(&peer) && !self.has_room(role) {
                    trace!(port2 = self.port2, %peer, "dropping datagram from refused peer");
                    return;
                }
                let egress = spawn_udp_writer(socket, peer);
                match self.connect(role, TransportKind::Udp, peer, egress).await {
                    Some(id) => {
                        self.refused_udp.pop(&peer);
                        id
                    }
                    None => {
                        self.refused_udp.put(peer, ());
                        return;
                    }
                }
            }
        };
        self.handle_frames(id, frames).await;
    }

    fn has_room(&self, role: Role) -> bool {
        match role {
            Role::Engineer => self.slots.engineer_count() < self.slots.max_engineers(),
            Role::User => self.slots.user().is_none(),
        }
    }

    fn log_refusal(&mut self, refusal: Refusal, transport: TransportKind, peer: SocketAddr) {
        // UDP refusals repeat for every datagram; log them once per peer.
        if transport == TransportKind::Udp && self.refused_udp.contains(&peer) {
            return;
        }
        match refusal {
            Refusal::EngineerCapReached => warn!(
                port2 = self.port2,
                %peer,
                limit = self.slots.max_engineers(),
                "Engineer connection refused: {}limit reached",
                transport.label()
            ),
            Refusal::UserSlotTaken => warn!(
                port2 = self.port2,
                %peer,
                "User connection refused: {}user already connected",
                transport.label()
            ),
        }
    }

    fn log_have(&self, role: Role, transport: TransportKind, peer: SocketAddr) {
        info!(
            port2 = self.port2,
            %peer,
            "have {}{} from {}",
            transport.label(),
            role.conn_label(),
            peer
        );
    }

    async fn reload_key(&mut self) {
        match self.store.load(i32::from(self.port2)).await {
            Ok(record) => {
                let previous = self.key.take();
                self.key = record.as_ref().and_then(SigningKey::from_record);
                // Same secret: keep the replay clock that is already ahead.
                if let (Some(key), Some(previous)) = (self.key.as_mut(), previous.as_ref())
                    && key.same_secret(previous)
                {
                    key.observe(previous.timestamp());
                }
                if let Some(key) = self.key.as_mut() {
                    key.tick(signing_timestamp_now());
                }
                debug!(port2 = self.port2, has_key = self.key.is_some(), "signing key loaded");
            }
            Err(e) => warn!(port2 = self.port2, error = %e, "failed to load signing key"),
        }
    }

    // ------------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------------

    async fn handle_frames(&mut self, id: SlotId, frames: Vec<Frame>) {
        let now = Instant::now();
        let role = {
            let Some(slot) = self.slots.get_mut(id) else {
                return;
            };
            if slot.state() == SlotState::New {
                slot.advance(SlotState::Established);
            }
            if !frames.is_empty() {
                slot.advance(SlotState::Active);
            }
            slot.touch(now);
            slot.messages = slot.messages.saturating_add(frames.len() as u32);
            slot.role
        };

        match role {
            Role::User => {
                for frame in frames {
                    self.from_user(frame);
                }
            }
            Role::Engineer => {
                for frame in frames {
                    self.from_engineer(id, frame, now).await;
                }
            }
        }
    }

    fn from_user(&mut self, frame: Frame) {
        let always_visible = frame.msg_id() == MSG_ID_HEARTBEAT;
        if always_visible {
            self.user_source = Some((frame.sysid(), frame.compid()));
        }
        let mut recipients = self
            .slots
            .engineers()
            .filter(|slot| slot.is_open())
            .filter(|slot| always_visible || slot.trust() == TrustLevel::Authenticated)
            .peekable();
        if recipients.peek().is_none() {
            return;
        }
        let signed = self.key.as_mut().and_then(|key| key.sign(&frame));
        let bytes = signed.as_ref().unwrap_or(&frame).as_bytes();
        for slot in recipients {
            if !slot.send(bytes.to_vec()) {
                trace!(port2 = self.port2, slot = slot.id, "engineer egress full, frame dropped");
            }
        }
    }

    async fn from_engineer(&mut self, id: SlotId, frame: Frame, now: Instant) {
        let port2 = self.port2;
        let (sysid, compid) = self.user_source.unwrap_or(DEFAULT_NOTICE_SOURCE);
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let outcome = slot.gate.check(&frame, self.key.as_mut());

        if outcome.trust_changed && outcome.trust == TrustLevel::Authenticated {
            info!(port2, peer = %slot.peer, "Got good signature");
        }
        if outcome.announce
            && let Some(text) = outcome.verdict.notice()
        {
            match outcome.verdict {
                Verdict::Rejected(_) => warn!(port2, peer = %slot.peer, "{}", text),
                _ => info!(port2, peer = %slot.peer, "{}", text),
            }
        }
        if outcome.notify
            && let Some(text) = outcome.verdict.notice()
            && slot.notice_due(now, NOTICE_INTERVAL)
        {
            debug!(port2, peer = %slot.peer, notice = text, "sending notice");
            let _ = slot.send(statustext(sysid, compid, SEVERITY_CRITICAL, text).into_bytes());
        }

        if let Verdict::Good { .. } = outcome.verdict {
            self.save_timestamp();
            if frame.msg_id() == MSG_ID_SETUP_SIGNING {
                self.rotate_key(&frame).await;
                return;
            }
        }

        match self.slots.user() {
            Some(user) if user.is_open() => {
                if !user.send(frame.without_signature().into_bytes()) {
                    trace!(port2, "user egress full, frame dropped");
                }
            }
            _ => trace!(port2, "no user connected, engineer frame dropped"),
        }
    }

    async fn rotate_key(&mut self, frame: &Frame) {
        let request = match SetupSigning::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(port2 = self.port2, error = %e, "bad SETUP_SIGNING");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set_signing_key(i32::from(self.port2), request.secret_key, request.initial_timestamp)
            .await
        {
            warn!(port2 = self.port2, error = %e, "failed to store new signing key");
            return;
        }

        info!(port2 = self.port2, "Set new signing key");
        let mut key = SigningKey::new(request.secret_key, request.initial_timestamp);
        key.tick(signing_timestamp_now());
        self.saved_timestamp = request.initial_timestamp;
        self.key = Some(key);
        for slot in self.slots.engineers_mut() {
            slot.gate.reset();
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn sweep(&mut self, now: Instant) {
        for id in self.slots.expired(now, self.idle_timeout) {
            self.close_slot(id, "idle timeout");
        }
        if self.slots.engineer_count() > 0
            && let Some(key) = self.key.as_mut()
        {
            key.tick(signing_timestamp_now());
        }
    }

    fn close_slot(&mut self, id: SlotId, reason: &'static str) {
        if let Some(slot) = self.slots.close(id) {
            self.finish_slot(slot, reason);
        }
    }

    /// Log and account for a slot that has left the table.
    fn finish_slot(&mut self, slot: Slot, reason: &'static str) {
        info!(
            port2 = self.port2,
            peer = %slot.peer,
            reason,
            messages = slot.messages,
            "Closed connection {}{}",
            slot.transport.label(),
            slot.role.conn_label()
        );
        let port2 = i32::from(self.port2);
        match slot.role {
            Role::User => self.store.record_session(port2, slot.messages, 0, true),
            Role::Engineer => {
                self.store.record_session(port2, 0, slot.messages, false);
                if self.slots.engineer_count() == 0 {
                    self.save_timestamp();
                }
            }
        }
    }

    /// Persist the key timestamp if it moved since the last write.
    fn save_timestamp(&mut self) {
        let Some(key) = self.key.as_ref() else {
            return;
        };
        if key.timestamp() <= self.saved_timestamp {
            return;
        }
        self.store.advance_timestamp(i32::from(self.port2), key.timestamp());
        self.saved_timestamp = key.timestamp();
    }

    fn shutdown(&mut self) {
        for slot in self.slots.drain() {
            self.finish_slot(slot, "shutdown");
        }
        self.save_timestamp();
        debug!(port1 = self.port1, port2 = self.port2, "port pair closed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::crypto::derive_secret;
    use crate::frame::{
        FrameHeader, MSG_ID_SYSTEM_TIME, SigningParams, encode_v2, encode_v2_signed,
        heartbeat_payload, statustext_text,
    };
    use crate::store::{CredentialStore, MemoryBackend};

    static TS_BUMP: AtomicU64 = AtomicU64::new(0);

    const PORT1: u16 = 14552;
    const PORT2: u16 = 14553;

    fn store_with_record(passphrase: &str) -> StoreHandle {
        let mut store = CredentialStore::new(MemoryBackend::new());
        let mut txn = store.transaction().unwrap();
        txn.add(i32::from(PORT1), i32::from(PORT2), "test", passphrase).unwrap();
        txn.commit().unwrap();
        StoreHandle::spawn(store).unwrap()
    }

    fn config(max_engineers: usize) -> RouterConfig {
        RouterConfig {
            max_engineers,
            idle_timeout: Duration::from_secs(10),
            user_policy: UserSlotPolicy::ReplaceExisting,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn frame(msg_id: u32, payload: &[u8]) -> Frame {
        encode_v2(&FrameHeader { msg_id, sysid: 1, compid: 1, seq: 0 }, payload).unwrap()
    }

    fn signed(secret: &[u8; 32], msg_id: u32, payload: &[u8]) -> Frame {
        // Strictly increasing even when two frames land in the same 10µs tick.
        let timestamp = signing_timestamp_now() + TS_BUMP.fetch_add(1, Ordering::Relaxed);
        signed_at(secret, msg_id, payload, timestamp)
    }

    fn signed_at(secret: &[u8; 32], msg_id: u32, payload: &[u8], timestamp: u64) -> Frame {
        let header = FrameHeader { msg_id, sysid: 255, compid: 190, seq: 0 };
        let signing = SigningParams { secret, link_id: 0, timestamp };
        encode_v2_signed(&header, payload, &signing).unwrap()
    }

    async fn recv_frames(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Some(bytes)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            frames.extend(crate::frame::parse_datagram(&bytes));
        }
        frames
    }

    async fn pair(passphrase: &str) -> (PairRouter, StoreHandle) {
        let store = store_with_record(passphrase);
        let record = store.load(i32::from(PORT2)).await.unwrap().unwrap();
        let key = SigningKey::from_record(&record);
        (PairRouter::spawn(PORT1, PORT2, key, store.clone(), config(2)), store)
    }

    async fn recv_msg_ids(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u32> {
        recv_frames(rx).await.iter().map(Frame::msg_id).collect()
    }

    #[tokio::test]
    async fn test_unauthenticated_engineer_sees_only_heartbeat() {
        let (router, _store) = pair("pw").await;
        let (user_tx, _user_rx) = mpsc::channel(16);
        let (eng_tx, mut eng_rx) = mpsc::channel(16);

        let user = router.connect(Role::User, TransportKind::Tcp, addr(1), user_tx).await.unwrap();
        let eng = router.connect(Role::Engineer, TransportKind::Tcp, addr(2), eng_tx).await.unwrap();
        router.frames(eng, vec![frame(MSG_ID_HEARTBEAT, &heartbeat_payload())]).await;

        router
            .frames(user, vec![frame(MSG_ID_HEARTBEAT, &heartbeat_payload()), frame(MSG_ID_SYSTEM_TIME, &[1; 12])])
            .await;

        let ids = recv_msg_ids(&mut eng_rx).await;
        assert!(ids.contains(&MSG_ID_HEARTBEAT));
        assert!(!ids.contains(&MSG_ID_SYSTEM_TIME));
        router.quit().await;
    }

    #[tokio::test]
    async fn test_authenticated_engineer_sees_everything() {
        let (router, _store) = pair("pw").await;
        let secret = derive_secret("pw");
        let (user_tx, mut user_rx) = mpsc::channel(16);
        let (eng_tx, mut eng_rx) = mpsc::channel(16);

        let user = router.connect(Role::User, TransportKind::Tcp, addr(1), user_tx).await.unwrap();
        let eng = router.connect(Role::Engineer, TransportKind::Tcp, addr(2), eng_tx).await.unwrap();
        router.frames(eng, vec![signed(&secret, MSG_ID_HEARTBEAT, &heartbeat_payload())]).await;

        let status = router.status().await.unwrap();
        assert_eq!(status.engineers[0].trust, TrustLevel::Authenticated);
        assert_eq!(status.engineers[0].state, SlotState::Active);

        router.frames(user, vec![frame(MSG_ID_SYSTEM_TIME, &[1; 12])]).await;
        assert_eq!(recv_msg_ids(&mut eng_rx).await, vec![MSG_ID_SYSTEM_TIME]);
        assert_eq!(recv_msg_ids(&mut user_rx).await, vec![MSG_ID_HEARTBEAT]);
        router.quit().await;
    }

    #[tokio::test]
    async fn test_forwarded_frames_signed_toward_engineer_only() {
        let (router, _store) = pair("pw").await;
        let secret = derive_secret("pw");
        let (user_tx, mut user_rx) = mpsc::channel(16);
        let (eng_tx, mut eng_rx) = mpsc::channel(16);

        let user = router.connect(Role::User, TransportKind::Tcp, addr(1), user_tx).await.unwrap();
        let eng = router.connect(Role::Engineer, TransportKind::Tcp, addr(2), eng_tx).await.unwrap();
        router.frames(eng, vec![signed(&secret, MSG_ID_HEARTBEAT, &heartbeat_payload())]).await;
        router.frames(user, vec![frame(MSG_ID_SYSTEM_TIME, &[1; 12])]).await;

        let to_engineer = recv_frames(&mut eng_rx).await;
        assert_eq!(to_engineer.len(), 1);
        let block = to_engineer[0].signature().expect("engineer egress must be signed");
        assert!(crate::crypto::verify_signature(
            &secret,
            to_engineer[0].signed_region().unwrap(),
            &block.signature
        ));
        assert_eq!(to_engineer[0].payload(), frame(MSG_ID_SYSTEM_TIME, &[1; 12]).payload());

        let to_user = recv_frames(&mut user_rx).await;
        assert_eq!(to_user.len(), 1);
        assert_eq!(to_user[0].msg_id(), MSG_ID_HEARTBEAT);
        assert!(!to_user[0].is_signed());
        router.quit().await;
    }

    #[tokio::test]
    async fn test_every_good_signature_is_persisted() {
        let (router, store) = pair("pw").await;
        let secret = derive_secret("pw");
        let (eng_tx, _eng_rx) = mpsc::channel(16);
        let eng = router.connect(Role::Engineer, TransportKind::Tcp, addr(2), eng_tx).await.unwrap();

        let ts1 = signing_timestamp_now() + TS_BUMP.fetch_add(1, Ordering::Relaxed);
        // Three seconds later: well inside any batching window.
        let ts2 = ts1 + 300_000;
        for ts in [ts1, ts2] {
            router.frames(eng, vec![signed_at(&secret, MSG_ID_HEARTBEAT, &heartbeat_payload(), ts)]).await;
            // Status round trip: the write was queued before the reply.
            router.status().await.unwrap();
            let stored = store.load(i32::from(PORT2)).await.unwrap().unwrap().timestamp;
            assert!(stored >= ts, "timestamp {ts} not persisted, store has {stored}");
        }
        router.quit().await;
    }

    #[tokio::test]
    async fn test_unsigned_after_authentication_keeps_access_quietly() {
        let (router, _store) = pair("pw").await;
        let secret = derive_secret("pw");
        let (user_tx, _user_rx) = mpsc::channel(16);
        let (eng_tx, mut eng_rx) = mpsc::channel(64);

        let user = router.connect(Role::User, TransportKind::Tcp, addr(1), user_tx).await.unwrap();
        let eng = router.connect(Role::Engineer, TransportKind::Tcp, addr(2), eng_tx).await.unwrap();
        for _ in 0..3 {
            router.frames(eng, vec![signed(&secret, MSG_ID_HEARTBEAT, &heartbeat_payload())]).await;
            router.frames(eng, vec![frame(MSG_ID_HEARTBEAT, &heartbeat_payload())]).await;
        }
        router.frames(user, vec![frame(MSG_ID_SYSTEM_TIME, &[1; 12])]).await;

        let ids = recv_msg_ids(&mut eng_rx).await;
        assert_eq!(ids, vec![MSG_ID_SYSTEM_TIME], "no notices after authentication");
        assert_eq!(router.status().await.unwrap().engineers[0].trust, TrustLevel::Authenticated);
        router.quit().await;
    }

    #[tokio::test]
    async fn test_unsigned_engineer_gets_notice() {
        let (router, _store) = pair("pw").await;
        let (eng_tx, mut eng_rx) = mpsc::channel(16);
        let eng = router.connect(Role::Engineer, TransportKind::Tcp, addr(2), eng_tx).await.unwrap();
        router.frames(eng, vec![frame(MSG_ID_HEARTBEAT, &heartbeat_payload())]).await;

        let bytes = tokio::time::timeout(Duration::from_secs(1), eng_rx.recv()).await.unwrap().unwrap();
        let notice = crate::frame::parse_datagram(&bytes).remove(0);
        assert_eq!(statustext_text(&notice).unwrap(), "Need to use support signing key");
        router.quit().await;
    }

    #[tokio::test]
    async fn test_engineer_cap_refuses() {
        let (router, _store) = pair("pw").await;
        for port in 0..2 {
            let (tx, _rx) = mpsc::channel(1);
            assert!(router.connect(Role::Engineer, TransportKind::Tcp, addr(port), tx).await.is_some());
        }
        let (tx, _rx) = mpsc::channel(1);
        assert!(router.connect(Role::Engineer, TransportKind::Tcp, addr(9), tx).await.is_none());
        assert_eq!(router.status().await.unwrap().engineers.len(), 2);
        router.quit().await;
    }

    #[tokio::test]
    async fn test_setup_signing_rotates_key() {
        let (router, store) = pair("pw").await;
        let secret = derive_secret("pw");
        let (eng_tx, _eng_rx) = mpsc::channel(16);
        let eng = router.connect(Role::Engineer, TransportKind::Tcp, addr(2), eng_tx).await.unwrap();
        router.frames(eng, vec![signed(&secret, MSG_ID_HEARTBEAT, &heartbeat_payload())]).await;

        let new_secret = derive_secret("rotated");
        let request = SetupSigning {
            initial_timestamp: 5,
            target_system: 1,
            target_component: 1,
            secret_key: new_secret,
        };
        router.frames(eng, vec![signed(&secret, MSG_ID_SETUP_SIGNING, &request.to_payload())]).await;

        let status = router.status().await.unwrap();
        assert_eq!(status.engineers[0].trust, TrustLevel::Unauthenticated);
        let record = store.load(i32::from(PORT2)).await.unwrap().unwrap();
        assert_eq!(record.secret_key, new_secret);

        router.frames(eng, vec![signed(&new_secret, MSG_ID_HEARTBEAT, &heartbeat_payload())]).await;
        assert_eq!(router.status().await.unwrap().engineers[0].trust, TrustLevel::Authenticated);
        router.quit().await;
    }

    #[tokio::test]
    async fn test_close_records_session() {
        let (router, store) = pair("pw").await;
        let (user_tx, _user_rx) = mpsc::channel(16);
        let user = router.connect(Role::User, TransportKind::Tcp, addr(1), user_tx).await.unwrap();
        router.frames(user, vec![frame(MSG_ID_HEARTBEAT, &heartbeat_payload()); 3]).await;
        router.disconnected(user, "eof").await;
        router.quit().await;

        let record = store.load(i32::from(PORT2)).await.unwrap().unwrap();
        assert_eq!(record.count1, 3);
        assert_eq!(record.connections, 1);
    }
}
