//! # Keyrelay - Credential-Gated Telemetry Relay
//!
//! Keyrelay lets a primary telemetry endpoint (the **user**) share its live
//! link with support **engineers**, who only see more than heartbeats once
//! they prove they hold a shared secret by signing their traffic.
//!
//! - **Credentials**: port-keyed records holding the shared secret, port
//!   pairing and session counters, managed with the `keydb` tool
//! - **Transports**: UDP, TCP, WebSocket and secure WebSocket on every port
//! - **Signing**: per-frame signature checks with a replay window
//! - **Routing**: one actor per port pair, never blocked by a slow peer
//!
//! ## Architecture
//!
//! The relay follows the **Actor Pattern** for shared state:
//! - Each port pair has a `PairRouter` handle and a private actor owning the
//!   slot table, trust levels and signing key
//! - Store access runs on a dedicated thread behind a `StoreHandle`
//! - Transport workers only parse bytes and forward batches to the actor
//!
//! ## Security Model
//!
//! - Engineers see HEARTBEAT frames only until a frame verifies under the
//!   pair's secret; then they see everything
//! - Replayed or stale signed frames are rejected per signing stream
//! - Key rotation requires a correctly signed request
//! - All per-peer state is bounded (slot caps, LRU stream tables)
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `record` | Fixed-layout credential record |
//! | `store` | Key-value backends, transactional store, persistence actor |
//! | `crypto` | Secret derivation, frame signatures, TLS loading |
//! | `frame` | Telemetry framing, CRC, relay-originated messages |
//! | `signing` | Signature gate and trust levels |
//! | `slots` | Slot roles, lifecycle and admission |
//! | `router` | Per-pair forwarding actor |
//! | `transport` | UDP/TCP listeners and stream workers |
//! | `relay` | Port pair lifecycle and reload |

pub mod crypto;
pub mod frame;
pub mod record;
pub mod relay;
pub mod router;
pub mod signing;
pub mod slots;
pub mod store;
pub mod transport;

pub use record::{KEY_MAGIC, KeyRecord, RecordError};
pub use relay::{Relay, RelayConfig};
pub use signing::{SigningGate, SigningKey, TrustLevel, Verdict};
pub use slots::{PairStatus, Role, SlotInfo, SlotState, TransportKind, UserSlotPolicy};
pub use store::{CredentialStore, KvBackend, MemoryBackend, SqliteBackend, StoreError, StoreHandle};
