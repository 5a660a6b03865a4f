//! # Credential Store
//!
//! Durable `port2 -> KeyRecord` mapping over a flat key-value backend.
//!
//! ## Layers
//!
//! | Type | Role |
//! |------|------|
//! | [`KvBackend`] | Byte-level get/put/delete/keys plus begin/commit/rollback |
//! | [`MemoryBackend`] | In-process map; tests and ephemeral use |
//! | [`SqliteBackend`] | One `keys` table in a WAL-mode SQLite file |
//! | [`CredentialStore`] | Typed record operations over any backend |
//! | [`StoreTxn`] | All-or-nothing mutation scope; rolls back on drop |
//! | [`StoreHandle`] | Actor running blocking store calls off the async workers |
//!
//! ## Integrity
//!
//! A stored value with the wrong length or magic is never handed out as a
//! record. Lookups treat it as absent and log it at debug level; listings skip
//! it. Only [`StoreTxn::convert_legacy`] looks at 48-byte legacy values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::record::{
    KEY_MAGIC, KeyRecord, LEGACY_RECORD_SIZE, RecordError, SECRET_KEY_LEN, port_from_key,
    store_key,
};

// ============================================================================
// Constants
// ============================================================================

/// How long a writer waits on a lock held by another process.
/// The relay and the management tool share the database file.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the persistence actor's command queue.
/// Fire-and-forget writes are dropped when it is full.
pub const STORE_QUEUE_DEPTH: usize = 256;

const SCHEMA_SQL: &str =
    "CREATE TABLE IF NOT EXISTS keys (k BLOB PRIMARY KEY NOT NULL, v BLOB NOT NULL) WITHOUT ROWID";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Entry already exists for port2 {port2}")]
    AlreadyExists { port2: i32 },

    #[error("No entry for port2 {port2}")]
    NotFound { port2: i32 },

    #[error("corrupt record for port2 {port2}: {reason}")]
    CorruptRecord { port2: i32, reason: RecordError },

    #[error("database not found: {}", .0.display())]
    DatabaseMissing(PathBuf),

    #[error("transaction already in progress")]
    TransactionActive,

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store actor is not running")]
    ActorGone,
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Backend Trait
// ============================================================================

/// Flat key/value storage with a single level of transactions.
pub trait KvBackend: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    /// Returns whether the key existed.
    fn delete(&mut self, key: &[u8]) -> Result<bool>;
    fn keys(&self) -> Result<Vec<Vec<u8>>>;
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}

// ============================================================================
// MemoryBackend
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Pre-transaction contents, restored on rollback.
    snapshot: Option<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.snapshot = Some(self.entries.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.snapshot.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.entries = self.snapshot.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }
}

// ============================================================================
// SqliteBackend
// ============================================================================

pub struct SqliteBackend {
    conn: Connection,
    path: Option<PathBuf>,
    in_txn: bool,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .field("in_txn", &self.in_txn)
            .finish()
    }
}

impl SqliteBackend {
    /// Open an existing database. Fails with [`StoreError::DatabaseMissing`]
    /// when the file does not exist; use [`create`](Self::create) for that.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::DatabaseMissing(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Open or create a database and make sure the schema exists.
    /// Idempotent on an existing store.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns the resulting mode as a row; in-memory stays "memory".
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(mode = %mode, "sqlite journal mode");
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn, path, in_txn: false })
    }
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row("SELECT v FROM keys WHERE k = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO keys (k, v) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let removed = self.conn.execute("DELETE FROM keys WHERE k = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut stmt = self.conn.prepare("SELECT k FROM keys ORDER BY k")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_txn {
            return Err(StoreError::TransactionActive);
        }
        // IMMEDIATE takes the write lock up front so two writers cannot
        // both read-modify-write the same record.
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_txn = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(StoreError::NoTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_txn = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(StoreError::NoTransaction);
        }
        self.in_txn = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

// ============================================================================
// CredentialStore
// ============================================================================

#[derive(Debug)]
pub struct CredentialStore<B: KvBackend> {
    backend: B,
}

impl<B: KvBackend> CredentialStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start an all-or-nothing mutation scope.
    pub fn transaction(&mut self) -> Result<StoreTxn<'_, B>> {
        self.backend.begin()?;
        Ok(StoreTxn { backend: &mut self.backend, finished: false })
    }

    /// Read a record outside any transaction.
    pub fn get(&self, port2: i32) -> Result<Option<KeyRecord>> {
        fetch(&self.backend, port2)
    }

    /// Lazily iterate all valid records.
    pub fn list(&self) -> Result<Records<'_, B>> {
        Records::new(&self.backend)
    }
}

fn fetch<B: KvBackend>(backend: &B, port2: i32) -> Result<Option<KeyRecord>> {
    let Some(data) = backend.get(&store_key(port2))? else {
        return Ok(None);
    };
    match KeyRecord::unpack(port2, &data) {
        Ok(record) => Ok(Some(record)),
        Err(reason) => {
            debug!(port2, %reason, "ignoring corrupt record");
            Ok(None)
        }
    }
}

// ============================================================================
// Record Iterator
// ============================================================================

/// Lazy iterator over valid records. Keys are snapshotted up front; each value
/// is read when the iterator reaches it. Call [`CredentialStore::list`] again
/// to restart.
pub struct Records<'a, B: KvBackend> {
    backend: &'a B,
    keys: std::vec::IntoIter<Vec<u8>>,
}

impl<'a, B: KvBackend> Records<'a, B> {
    fn new(backend: &'a B) -> Result<Self> {
        Ok(Self { backend, keys: backend.keys()?.into_iter() })
    }
}

impl<B: KvBackend> Iterator for Records<'_, B> {
    type Item = Result<KeyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            let Some(port2) = port_from_key(&key) else {
                continue;
            };
            match fetch(self.backend, port2) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Mutation scope over a backend. Dropping it without [`commit`](Self::commit)
/// rolls back every write made through it.
pub struct StoreTxn<'a, B: KvBackend> {
    backend: &'a mut B,
    finished: bool,
}

impl<B: KvBackend> StoreTxn<'_, B> {
    pub fn get(&self, port2: i32) -> Result<Option<KeyRecord>> {
        fetch(&*self.backend, port2)
    }

    pub fn list(&self) -> Result<Records<'_, B>> {
        Records::new(&*self.backend)
    }

    /// Create a record. Fails if any value is stored under `port2`.
    pub fn add(&mut self, port1: i32, port2: i32, name: &str, passphrase: &str) -> Result<KeyRecord> {
        if self.backend.get(&store_key(port2))?.is_some() {
            return Err(StoreError::AlreadyExists { port2 });
        }
        let mut record = KeyRecord::new(port2);
        record.port1 = port1;
        record.name = name.to_string();
        record.set_passphrase(passphrase);
        self.save(&record)?;
        Ok(record)
    }

    pub fn remove(&mut self, port2: i32) -> Result<KeyRecord> {
        let record = self.require(port2)?;
        self.backend.delete(&store_key(port2))?;
        Ok(record)
    }

    pub fn set_name(&mut self, port2: i32, name: &str) -> Result<KeyRecord> {
        self.update(port2, |record| record.name = name.to_string())
    }

    pub fn set_passphrase(&mut self, port2: i32, passphrase: &str) -> Result<KeyRecord> {
        self.update(port2, |record| record.set_passphrase(passphrase))
    }

    pub fn set_port1(&mut self, port2: i32, port1: i32) -> Result<KeyRecord> {
        self.update(port2, |record| record.port1 = port1)
    }

    /// Clear the stored replay timestamp.
    pub fn reset_timestamp(&mut self, port2: i32) -> Result<KeyRecord> {
        self.update(port2, |record| record.timestamp = 0)
    }

    /// Add a finished session's message tallies.
    pub fn record_session(&mut self, port2: i32, count1: u32, count2: u32, new_connection: bool) -> Result<KeyRecord> {
        self.update(port2, |record| {
            record.count1 = record.count1.wrapping_add(count1);
            record.count2 = record.count2.wrapping_add(count2);
            if new_connection {
                record.connections = record.connections.wrapping_add(1);
            }
        })
    }

    /// Raise the stored timestamp to `timestamp`; never lowers it.
    pub fn advance_timestamp(&mut self, port2: i32, timestamp: u64) -> Result<KeyRecord> {
        self.update(port2, |record| record.timestamp = record.timestamp.max(timestamp))
    }

    /// Replace the signing secret and its initial timestamp.
    pub fn set_signing_key(
        &mut self,
        port2: i32,
        secret: [u8; SECRET_KEY_LEN],
        initial_timestamp: u64,
    ) -> Result<KeyRecord> {
        self.update(port2, |record| {
            record.secret_key = secret;
            record.timestamp = initial_timestamp;
        })
    }

    /// Rewrite every 48-byte legacy record in the current layout.
    /// Returns the converted records; everything else is left untouched.
    pub fn convert_legacy(&mut self) -> Result<Vec<KeyRecord>> {
        let mut converted = Vec::new();
        for key in self.backend.keys()? {
            let Some(port2) = port_from_key(&key) else {
                continue;
            };
            let Some(data) = self.backend.get(&key)? else {
                continue;
            };
            if data.len() != LEGACY_RECORD_SIZE || data[0..8] != KEY_MAGIC.to_le_bytes() {
                continue;
            }
            let record = KeyRecord::from_legacy(port2, &data)
                .map_err(|reason| StoreError::CorruptRecord { port2, reason })?;
            self.save(&record)?;
            info!(port2, "converted legacy record");
            converted.push(record);
        }
        Ok(converted)
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.backend.commit()
    }

    /// Explicitly discard every write made in this scope.
    pub fn cancel(mut self) -> Result<()> {
        self.finished = true;
        self.backend.rollback()
    }

    fn require(&self, port2: i32) -> Result<KeyRecord> {
        self.get(port2)?.ok_or(StoreError::NotFound { port2 })
    }

    fn update(&mut self, port2: i32, mutate: impl FnOnce(&mut KeyRecord)) -> Result<KeyRecord> {
        let mut record = self.require(port2)?;
        mutate(&mut record);
        self.save(&record)?;
        Ok(record)
    }

    fn save(&mut self, record: &KeyRecord) -> Result<()> {
        self.backend.put(&record.key(), &record.pack())
    }
}

impl<B: KvBackend> Drop for StoreTxn<'_, B> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.backend.rollback()
        {
            warn!(error = %e, "transaction rollback failed");
        }
    }
}

// ============================================================================
// Persistence Actor
// ============================================================================
//
// SQLite calls block, so the relay funnels every store access through a
// dedicated thread. Reads reply over oneshot channels; relay-side writes are
// fire-and-forget and each runs in its own transaction.

enum StoreCommand {
    Load {
        port2: i32,
        reply: oneshot::Sender<Result<Option<KeyRecord>>>,
    },
    LoadAll {
        reply: oneshot::Sender<Result<Vec<KeyRecord>>>,
    },
    AdvanceTimestamp {
        port2: i32,
        timestamp: u64,
    },
    RecordSession {
        port2: i32,
        count1: u32,
        count2: u32,
        new_connection: bool,
    },
    SetSigningKey {
        port2: i32,
        secret: [u8; SECRET_KEY_LEN],
        initial_timestamp: u64,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Quit {
        done: std_mpsc::Sender<()>,
    },
}

/// Cheap-to-clone handle to the persistence actor.
#[derive(Clone)]
pub struct StoreHandle {
    cmd_tx: mpsc::Sender<StoreCommand>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

impl StoreHandle {
    /// Move `store` onto its own thread and return a handle to it.
    pub fn spawn<B: KvBackend + 'static>(store: CredentialStore<B>) -> std::io::Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(STORE_QUEUE_DEPTH);
        thread::Builder::new()
            .name("keyrelay-store".to_string())
            .spawn(move || StoreActor { store }.run(cmd_rx))?;
        Ok(Self { cmd_tx })
    }

    pub async fn load(&self, port2: i32) -> Result<Option<KeyRecord>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::Load { port2, reply })
            .await
            .map_err(|_| StoreError::ActorGone)?;
        rx.await.map_err(|_| StoreError::ActorGone)?
    }

    pub async fn load_all(&self) -> Result<Vec<KeyRecord>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::LoadAll { reply })
            .await
            .map_err(|_| StoreError::ActorGone)?;
        rx.await.map_err(|_| StoreError::ActorGone)?
    }

    pub fn advance_timestamp(&self, port2: i32, timestamp: u64) {
        self.post(StoreCommand::AdvanceTimestamp { port2, timestamp });
    }

    pub fn record_session(&self, port2: i32, count1: u32, count2: u32, new_connection: bool) {
        self.post(StoreCommand::RecordSession { port2, count1, count2, new_connection });
    }

    /// Persist a rotated key and wait for the write to commit.
    pub async fn set_signing_key(
        &self,
        port2: i32,
        secret: [u8; SECRET_KEY_LEN],
        initial_timestamp: u64,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::SetSigningKey { port2, secret, initial_timestamp, reply: Some(reply) })
            .await
            .map_err(|_| StoreError::ActorGone)?;
        rx.await.map_err(|_| StoreError::ActorGone)?
    }

    /// Stop the actor after it drains queued writes.
    pub async fn quit(&self) {
        let (done, done_rx) = std_mpsc::channel();
        if self.cmd_tx.send(StoreCommand::Quit { done }).await.is_ok() {
            let _ = tokio::task::spawn_blocking(move || done_rx.recv()).await;
        }
    }

    fn post(&self, cmd: StoreCommand) {
        if let Err(e) = self.cmd_tx.try_send(cmd) {
            warn!(error = %e, "store queue full, dropping write");
        }
    }
}

struct StoreActor<B: KvBackend> {
    store: CredentialStore<B>,
}

impl<B: KvBackend> StoreActor<B> {
    fn run(mut self, mut cmd_rx: mpsc::Receiver<StoreCommand>) {
        while let Some(cmd) = cmd_rx.blocking_recv() {
            match cmd {
                StoreCommand::Load { port2, reply } => {
                    let _ = reply.send(self.store.get(port2));
                }
                StoreCommand::LoadAll { reply } => {
                    let records = self
                        .store
                        .list()
                        .and_then(|records| records.collect::<Result<Vec<_>>>());
                    let _ = reply.send(records);
                }
                StoreCommand::AdvanceTimestamp { port2, timestamp } => {
                    // Failures are logged by `write`.
                    let _ = self.write(port2, "advance timestamp", |txn| {
                        txn.advance_timestamp(port2, timestamp).map(drop)
                    });
                }
                StoreCommand::RecordSession { port2, count1, count2, new_connection } => {
                    let _ = self.write(port2, "record session", |txn| {
                        txn.record_session(port2, count1, count2, new_connection).map(drop)
                    });
                }
                StoreCommand::SetSigningKey { port2, secret, initial_timestamp, reply } => {
                    let result = self.write(port2, "set signing key", |txn| {
                        txn.set_signing_key(port2, secret, initial_timestamp).map(drop)
                    });
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                StoreCommand::Quit { done } => {
                    debug!("store actor shutting down");
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    fn write(
        &mut self,
        port2: i32,
        what: &'static str,
        op: impl FnOnce(&mut StoreTxn<'_, B>) -> Result<()>,
    ) -> Result<()> {
        let result = self.store.transaction().and_then(|mut txn| {
            op(&mut txn)?;
            txn.commit()
        });
        if let Err(e) = &result {
            warn!(port2, op = what, error = %e, "store write failed");
        }
        result
    }
}

// ============================================================================
// Tests
// ============================================================================
