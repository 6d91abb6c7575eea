//! Session registry: secrets, session records and the listener table.
//!
//! All protocol state shared between listener tasks lives in one
//! [`SessionTable`] behind one lock.  [`SessionRegistry`] is the cheap,
//! cloneable handle every task holds.
//!
//! # Critical sections
//!
//! A stage transition is a compound operation (expire the old secret, mint
//! a new one, bind and register a listener, store the new record) that
//! other sessions must observe atomically.  [`SessionRegistry::transaction`]
//! runs a closure with `&mut SessionTable` while holding the lock; the
//! table's own methods never lock, so a handler can call any number of them
//! inside one transaction without re-acquiring anything.
//!
//! The one rule: never call a `SessionRegistry` method (or drop a
//! listener guard) from inside a transaction closure.  Debug builds panic
//! on such a nested lock instead of deadlocking.
//!
//! Expired secrets are kept for the lifetime of the registry so a secret is
//! never issued twice, even after its session is gone.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use thiserror::Error;

use crate::state::Stage;
use crate::transfer::{random_chunk_len, TransferState};

/// Bounds for the randomly chosen number of stage-D frames.
pub const REPEAT_COUNT_RANGE: RangeInclusive<u32> = 1..=10;

/// Default range from which per-session ports are drawn.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 1024..=49151;

/// State waiting for the client to open the stage-C TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffState {
    pub client_id: u16,
    pub tcp_port: u16,
}

/// Parameters the client must satisfy in stage D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkState {
    pub client_id: u16,
    /// Number of frames the client must send.
    pub repeat_count: u32,
    /// Declared payload length of each frame.
    pub chunk_len: u32,
    /// The byte every payload position must hold.
    pub expected_byte: u8,
}

impl BulkState {
    /// Draw fresh random stage-C/D parameters.
    pub fn random<R: Rng + ?Sized>(client_id: u16, rng: &mut R) -> Self {
        Self {
            client_id,
            repeat_count: rng.random_range(REPEAT_COUNT_RANGE),
            chunk_len: random_chunk_len(rng),
            expected_byte: rng.random(),
        }
    }

    /// `true` when `payload` is `expected_byte` repeated `chunk_len` times.
    pub fn accepts(&self, payload: &[u8]) -> bool {
        payload.len() == self.chunk_len as usize && payload.iter().all(|b| *b == self.expected_byte)
    }
}

/// A session record, tagged by the stage that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRecord {
    /// Issued by stage A, consumed by stage B.
    Transfer(TransferState),
    /// Issued when stage B completes, consumed by stage C.
    Handoff(HandoffState),
    /// Issued by stage C, consumed by stage D.
    Bulk(BulkState),
}

impl SessionRecord {
    /// The stage whose completion produced this record.
    pub fn issued_by(&self) -> Stage {
        match self {
            SessionRecord::Transfer(_) => Stage::A,
            SessionRecord::Handoff(_) => Stage::B,
            SessionRecord::Bulk(_) => Stage::C,
        }
    }

    pub fn client_id(&self) -> u16 {
        match self {
            SessionRecord::Transfer(st) => st.client_id,
            SessionRecord::Handoff(st) => st.client_id,
            SessionRecord::Bulk(st) => st.client_id,
        }
    }
}

/// What a bound port is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// The well-known stage-A UDP port.
    Discovery,
    /// A per-session stage-B UDP port.
    Transfer,
    /// A per-session stage-C/D TCP port.
    Bulk,
}

impl std::fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ListenerKind::Discovery => "udp/discovery",
            ListenerKind::Transfer => "udp/transfer",
            ListenerKind::Bulk => "tcp/bulk",
        };
        f.write_str(s)
    }
}

/// Registry lookups that found nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The secret was never issued, or has already been expired.
    #[error("unknown secret {0:#010x}")]
    UnknownSecret(u32),
    /// Every port in the configured range is already bound.
    #[error("no free port left in {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },
}

/// The unlocked registry state.  Only reachable through
/// [`SessionRegistry::transaction`].
#[derive(Debug)]
pub struct SessionTable {
    active: HashMap<u32, SessionRecord>,
    /// Minted by `new_secret` but not yet stored with `put`.
    pending: HashSet<u32>,
    expired: HashSet<u32>,
    listeners: BTreeMap<u16, ListenerKind>,
    port_range: RangeInclusive<u16>,
}

impl SessionTable {
    fn new(port_range: RangeInclusive<u16>) -> Self {
        Self {
            active: HashMap::new(),
            pending: HashSet::new(),
            expired: HashSet::new(),
            listeners: BTreeMap::new(),
            port_range,
        }
    }

    fn is_known(&self, secret: u32) -> bool {
        self.active.contains_key(&secret)
            || self.pending.contains(&secret)
            || self.expired.contains(&secret)
    }

    /// Draw a fresh, non-zero secret that has never been issued.
    pub fn new_secret(&mut self) -> u32 {
        let mut rng = rand::rng();
        loop {
            let secret: u32 = rng.random();
            if secret != 0 && !self.is_known(secret) {
                self.pending.insert(secret);
                return secret;
            }
        }
    }

    /// Draw a random port from the configured range that no listener holds.
    ///
    /// The port is not reserved; bind it and call
    /// [`register_listener`](Self::register_listener) in the same
    /// transaction.
    pub fn new_port(&self) -> Result<u16, RegistryError> {
        let (start, end) = (*self.port_range.start(), *self.port_range.end());
        if start > end
            || self.listeners.range(start..=end).count() > usize::from(end - start)
        {
            return Err(RegistryError::PortsExhausted { start, end });
        }
        let mut rng = rand::rng();
        loop {
            let port = rng.random_range(start..=end);
            if !self.listeners.contains_key(&port) {
                return Ok(port);
            }
        }
    }

    /// Store `record` under `secret`, replacing any active record.
    pub fn put(&mut self, secret: u32, record: SessionRecord) {
        self.pending.remove(&secret);
        self.active.insert(secret, record);
    }

    pub fn get(&self, secret: u32) -> Result<&SessionRecord, RegistryError> {
        self.active
            .get(&secret)
            .ok_or(RegistryError::UnknownSecret(secret))
    }

    pub fn get_mut(&mut self, secret: u32) -> Result<&mut SessionRecord, RegistryError> {
        self.active
            .get_mut(&secret)
            .ok_or(RegistryError::UnknownSecret(secret))
    }

    /// Retire `secret` for good.  Returns `true` if it held a record.
    ///
    /// Idempotent: expiring an expired or unknown secret is a no-op, except
    /// that a minted-but-unstored secret also moves to the expired set.
    pub fn expire(&mut self, secret: u32) -> bool {
        let had_record = self.active.remove(&secret).is_some();
        if had_record || self.pending.remove(&secret) {
            self.expired.insert(secret);
        }
        had_record
    }

    pub fn is_expired(&self, secret: u32) -> bool {
        self.expired.contains(&secret)
    }

    /// Mint a secret that is issued but never backed by a record.
    pub fn mint_terminal(&mut self) -> u32 {
        let secret = self.new_secret();
        self.expire(secret);
        secret
    }

    /// Record that `port` is bound.  Returns `false` if it already was.
    pub fn register_listener(&mut self, port: u16, kind: ListenerKind) -> bool {
        match self.listeners.entry(port) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(kind);
                true
            }
        }
    }

    pub fn release_listener(&mut self, port: u16) -> Option<ListenerKind> {
        self.listeners.remove(&port)
    }

    /// Snapshot of bound ports, sorted by port.
    pub fn listeners(&self) -> Vec<(u16, ListenerKind)> {
        self.listeners.iter().map(|(p, k)| (*p, *k)).collect()
    }

    /// Number of secrets currently backed by a record.
    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }
}

thread_local! {
    /// Set while this thread runs a transaction closure.
    static IN_TRANSACTION: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a transaction until dropped.
struct TransactionScope;

impl TransactionScope {
    fn enter() -> Self {
        IN_TRANSACTION.with(|flag| flag.set(true));
        TransactionScope
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        IN_TRANSACTION.with(|flag| flag.set(false));
    }
}

/// Thread-safe handle to the shared [`SessionTable`].
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<SessionTable>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_port_range(DEFAULT_PORT_RANGE)
    }

    pub fn with_port_range(port_range: RangeInclusive<u16>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionTable::new(port_range))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        debug_assert!(
            !IN_TRANSACTION.with(Cell::get),
            "session registry locked again inside a transaction"
        );
        // A panicking handler must not wedge every other session.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` as one critical section over the table.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut SessionTable) -> R) -> R {
        let mut table = self.lock();
        let _scope = TransactionScope::enter();
        f(&mut table)
    }

    pub fn new_secret(&self) -> u32 {
        self.lock().new_secret()
    }

    pub fn new_port(&self) -> Result<u16, RegistryError> {
        self.lock().new_port()
    }

    pub fn put(&self, secret: u32, record: SessionRecord) {
        self.lock().put(secret, record);
    }

    /// Clone of the record stored under `secret`.
    pub fn get(&self, secret: u32) -> Result<SessionRecord, RegistryError> {
        self.lock().get(secret).cloned()
    }

    pub fn expire(&self, secret: u32) -> bool {
        self.lock().expire(secret)
    }

    pub fn is_expired(&self, secret: u32) -> bool {
        self.lock().is_expired(secret)
    }

    pub fn release_listener(&self, port: u16) -> Option<ListenerKind> {
        self.lock().release_listener(port)
    }

    pub fn listeners(&self) -> Vec<(u16, ListenerKind)> {
        self.lock().listeners()
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().active_sessions()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
