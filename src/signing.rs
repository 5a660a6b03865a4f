//! # Signature Gate
//!
//! Per-slot evaluation of engineer frames against the port pair's signing key.
//!
//! ## Trust Levels
//!
//! ```text
//!                  good signature
//!   Unauthenticated ─────────────────────────────► Authenticated
//!        │                                            ▲
//!        │ bad signature / replay / old timestamp     │ good signature
//!        ▼                                            │
//!   BadSignature ─────────────────────────────────────┘
//! ```
//!
//! Unsigned frames never change the level. `Authenticated` is only left when
//! the key itself changes ([`SigningGate::reset`]). While authenticated, later
//! unsigned or rejected frames are neither announced nor answered with a
//! notice.
//!
//! ## Replay Window
//!
//! | Case | Rule |
//! |------|------|
//! | Known stream `(link_id, sysid, compid)` | timestamp must be strictly greater than its last one |
//! | New stream | timestamp must be within 60s of the key timestamp |
//! | Key timestamp | starts at the stored timestamp + 15s, then follows accepted frames and the wall clock |
//!
//! At most [`MAX_SIGNING_STREAMS`] streams are remembered; the least recently
//! used one is forgotten first.

use std::num::NonZeroUsize;

use lru::LruCache;
use subtle::ConstantTimeEq;

use crate::crypto::verify_signature;
use crate::frame::{Frame, SigningParams};
use crate::record::{KeyRecord, SECRET_KEY_LEN};

// ============================================================================
// Constants
// ============================================================================

/// Streams tracked per slot.
/// SECURITY: Bounded so a peer cycling link ids cannot grow memory.
pub const MAX_SIGNING_STREAMS: usize = 16;

/// How far behind the key timestamp a new stream may start (60s).
pub const NEW_STREAM_WINDOW: u64 = 6_000_000;

/// Offset added to the stored timestamp when a key is loaded (15s).
/// Covers timestamps accepted but not yet persisted before a restart.
pub const LOAD_TIMESTAMP_OFFSET: u64 = 1_500_000;

/// Consecutive bad-signature or replay frames tolerated before notices start.
pub const FAULT_GRACE: u32 = 3;

/// Link id the relay signs its own outgoing frames with.
pub const OUTGOING_LINK_ID: u8 = 0;

// ============================================================================
// Verdicts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureFault {
    BadSignature,
    Replay,
    OldTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No usable key exists for this port pair.
    NoKey,
    /// Frame carries no signature.
    Unsigned,
    Rejected(SignatureFault),
    Good { timestamp: u64 },
}

impl Verdict {
    /// Text sent to the engineer (and logged) for this verdict.
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            Verdict::NoKey => Some("Need to setup support signing key"),
            Verdict::Unsigned => Some("Need to use support signing key"),
            Verdict::Rejected(SignatureFault::BadSignature) => Some("Bad support signing key"),
            Verdict::Rejected(SignatureFault::Replay) => Some("Bad signing timestamp - replay"),
            Verdict::Rejected(SignatureFault::OldTimestamp) => {
                Some("Bad signing timestamp - old timestamp")
            }
            Verdict::Good { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustLevel {
    #[default]
    Unauthenticated,
    BadSignature,
    Authenticated,
}

impl TrustLevel {
    pub fn after(self, verdict: &Verdict) -> TrustLevel {
        match verdict {
            Verdict::NoKey | Verdict::Unsigned => self,
            Verdict::Rejected(_) if self == TrustLevel::Authenticated => self,
            Verdict::Rejected(_) => TrustLevel::BadSignature,
            Verdict::Good { .. } => TrustLevel::Authenticated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Unauthenticated => "unauthenticated",
            TrustLevel::BadSignature => "bad-signature",
            TrustLevel::Authenticated => "authenticated",
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Signing Key
// ============================================================================

/// Secret and replay clock shared by every engineer slot of a port pair.
#[derive(Clone)]
pub struct SigningKey {
    secret: [u8; SECRET_KEY_LEN],
    timestamp: u64,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    pub fn new(secret: [u8; SECRET_KEY_LEN], stored_timestamp: u64) -> Self {
        Self {
            secret,
            timestamp: stored_timestamp.saturating_add(LOAD_TIMESTAMP_OFFSET),
        }
    }

    /// Key for a stored record. A record whose secret and timestamp are both
    /// zero has never been configured and yields no key.
    pub fn from_record(record: &KeyRecord) -> Option<Self> {
        if !record.has_secret() && record.timestamp == 0 {
            return None;
        }
        Some(Self::new(record.secret_key, record.timestamp))
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn same_secret(&self, other: &SigningKey) -> bool {
        bool::from(self.secret.ct_eq(&other.secret))
    }

    /// Advance to an accepted frame timestamp; never moves backwards.
    pub fn observe(&mut self, timestamp: u64) {
        self.timestamp = self.timestamp.max(timestamp);
    }

    /// Advance to the wall clock.
    pub fn tick(&mut self, now: u64) {
        self.observe(now);
    }

    /// Sign `frame` for delivery to engineers. Every call takes a fresh,
    /// strictly larger timestamp. `None` for frames that cannot be signed.
    pub fn sign(&mut self, frame: &Frame) -> Option<Frame> {
        self.timestamp = self.timestamp.saturating_add(1);
        let signing = SigningParams {
            secret: &self.secret,
            link_id: OUTGOING_LINK_ID,
            timestamp: self.timestamp,
        };
        frame.signed_with(&signing)
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Result of checking one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateOutcome {
    pub verdict: Verdict,
    pub trust: TrustLevel,
    pub trust_changed: bool,
    /// First time this kind of problem is seen since the last good frame.
    pub announce: bool,
    /// Whether the engineer should be told (grace period elapsed).
    pub notify: bool,
}

type StreamId = (u8, u8, u8);

pub struct SigningGate {
    trust: TrustLevel,
    streams: LruCache<StreamId, u64>,
    last_problem: Option<Verdict>,
    consecutive_faults: u32,
}

impl std::fmt::Debug for SigningGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningGate")
            .field("trust", &self.trust)
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl Default for SigningGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningGate {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_SIGNING_STREAMS)
            .expect("MAX_SIGNING_STREAMS must be non-zero");
        Self {
            trust: TrustLevel::Unauthenticated,
            streams: LruCache::new(cap),
            last_problem: None,
            consecutive_faults: 0,
        }
    }

    pub fn trust(&self) -> TrustLevel {
        self.trust
    }

    /// Forget everything learned under the previous key.
    pub fn reset(&mut self) {
        self.trust = TrustLevel::Unauthenticated;
        self.streams.clear();
        self.last_problem = None;
        self.consecutive_faults = 0;
    }

    pub fn check(&mut self, frame: &Frame, key: Option<&mut SigningKey>) -> GateOutcome {
        let verdict = match key {
            None => Verdict::NoKey,
            Some(key) => self.verify(frame, key),
        };

        let previous = self.trust;
        self.trust = previous.after(&verdict);

        let (announce, notify) = match verdict {
            // No transition out of Authenticated: nothing to say.
            Verdict::NoKey | Verdict::Unsigned | Verdict::Rejected(_)
                if previous == TrustLevel::Authenticated =>
            {
                (false, false)
            }
            Verdict::Good { .. } => {
                self.last_problem = None;
                self.consecutive_faults = 0;
                (false, false)
            }
            Verdict::Rejected(fault) => {
                self.consecutive_faults = self.consecutive_faults.saturating_add(1);
                let announce = self.last_problem != Some(verdict);
                self.last_problem = Some(verdict);
                let notify = match fault {
                    SignatureFault::OldTimestamp => true,
                    SignatureFault::BadSignature | SignatureFault::Replay => {
                        self.consecutive_faults >= FAULT_GRACE
                    }
                };
                (announce, notify)
            }
            Verdict::NoKey | Verdict::Unsigned => {
                let announce = self.last_problem != Some(verdict);
                self.last_problem = Some(verdict);
                (announce, true)
            }
        };

        GateOutcome {
            verdict,
            trust: self.trust,
            trust_changed: previous != self.trust,
            announce,
            notify,
        }
    }

    fn verify(&mut self, frame: &Frame, key: &mut SigningKey) -> Verdict {
        let (Some(block), Some(signed)) = (frame.signature(), frame.signed_region()) else {
            return Verdict::Unsigned;
        };
        if !verify_signature(&key.secret, signed, &block.signature) {
            return Verdict::Rejected(SignatureFault::BadSignature);
        }

        let stream = (block.link_id, frame.sysid(), frame.compid());
        match self.streams.get_mut(&stream) {
            Some(last) => {
                if block.timestamp <= *last {
                    return Verdict::Rejected(SignatureFault::Replay);
                }
                *last = block.timestamp;
            }
            None => {
                if block.timestamp.saturating_add(NEW_STREAM_WINDOW) < key.timestamp {
                    return Verdict::Rejected(SignatureFault::OldTimestamp);
                }
                self.streams.put(stream, block.timestamp);
            }
        }

        key.observe(block.timestamp);
        Verdict::Good { timestamp: block.timestamp }
    }
}

// ============================================================================
// Tests
// ============================================================================
