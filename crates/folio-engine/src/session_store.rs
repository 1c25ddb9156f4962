//! Keyed registry of sessions with per-session exclusive leases.
//!
//! A turn works on a session only through a [`Lease`]. Readers use
//! [`SessionStore::snapshot`], which returns the last persisted state and
//! never waits for the lease.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use folio_core::document::{ContextFile, Document, StyleTemplate};
use folio_core::edits::{AppliedEdit, CommitResult, EditError, Operation, PendingEdit};
use folio_core::ids::{ContinuationHandle, SessionId, TurnId};
use folio_store::{Database, SessionRecord, SessionRepo, StoreError};

use crate::capabilities::CapabilitySet;
use crate::error::EngineError;
use crate::ledger::EditLedger;

const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct SessionStoreConfig {
    /// How long a turn waits for a busy session before failing.
    pub lease_timeout: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }
}

/// Live session state. Only reachable through a lease.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub document: Document,
    pub ledger: EditLedger,
    pub continuation_handle: Option<ContinuationHandle>,
    pub context_files: Vec<ContextFile>,
    pub style_template: Option<StyleTemplate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn from_record(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            document: record.document,
            ledger: EditLedger::with_history(record.history),
            continuation_handle: record.continuation_handle,
            context_files: record.context_files,
            style_template: record.style_template,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            document: self.document.clone(),
            history: self.ledger.history().to_vec(),
            continuation_handle: self.continuation_handle.clone(),
            context_files: self.context_files.clone(),
            style_template: self.style_template.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// True when nothing has changed since `committed` was written.
    fn matches(&self, committed: &CommittedState) -> bool {
        self.ledger.list_pending().is_empty()
            && self.ledger.history().len() == committed.history.len()
            && self.document == committed.document
            && self.continuation_handle == committed.continuation_handle
            && self.context_files == committed.context_files
            && self.style_template == committed.style_template
    }
}

/// Last persisted state of a session.
#[derive(Clone, Debug)]
pub struct CommittedState {
    pub session_id: SessionId,
    pub document: Document,
    pub history: Vec<AppliedEdit>,
    pub continuation_handle: Option<ContinuationHandle>,
    pub context_files: Vec<ContextFile>,
    pub style_template: Option<StyleTemplate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SessionRecord> for CommittedState {
    fn from(record: SessionRecord) -> Self {
        Self {
            session_id: record.id,
            document: record.document,
            history: record.history,
            continuation_handle: record.continuation_handle,
            context_files: record.context_files,
            style_template: record.style_template,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(TurnId),
}

#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub state: Arc<CommittedState>,
    pub lock: LockState,
}

impl SessionSnapshot {
    fn unlocked(record: SessionRecord) -> Self {
        Self {
            state: Arc::new(CommittedState::from(record)),
            lock: LockState::Free,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.state.session_id
    }

    pub fn revision(&self) -> u64 {
        self.state.document.revision
    }
}

struct Slot {
    gate: Arc<tokio::sync::Mutex<()>>,
    session: Mutex<Session>,
    committed: RwLock<Arc<CommittedState>>,
    holder: Mutex<Option<TurnId>>,
}

impl Slot {
    fn new(session: Session) -> Self {
        let committed = Arc::new(CommittedState::from(session.to_record()));
        Self {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            session: Mutex::new(session),
            committed: RwLock::new(committed),
            holder: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let lock = match self.holder.lock().clone() {
            Some(turn_id) => LockState::Held(turn_id),
            None => LockState::Free,
        };
        SessionSnapshot {
            state: Arc::clone(&self.committed.read()),
            lock,
        }
    }
}

type Slots = Arc<DashMap<SessionId, Arc<Slot>>>;

/// Sessions are resident only while a lease holds them or while they carry
/// changes that were never persisted. Reads of other sessions go to storage.
pub struct SessionStore {
    repo: SessionRepo,
    capabilities: Arc<CapabilitySet>,
    slots: Slots,
    quarantined: DashMap<SessionId, String>,
    config: SessionStoreConfig,
}

impl SessionStore {
    pub fn new(db: Database, capabilities: Arc<CapabilitySet>, config: SessionStoreConfig) -> Self {
        Self {
            repo: SessionRepo::new(db),
            capabilities,
            slots: Arc::new(DashMap::new()),
            quarantined: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionStoreConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Arc<CapabilitySet> {
        &self.capabilities
    }

    /// Number of sessions held in memory.
    pub fn resident_count(&self) -> usize {
        self.slots.len()
    }

    /// Existing session for a known id, otherwise a fresh one with a new id.
    #[instrument(skip(self))]
    pub fn get_or_create(&self, id: Option<&SessionId>) -> Result<SessionSnapshot, EngineError> {
        if let Some(id) = id {
            if let Some(snapshot) = self.peek(id)? {
                return Ok(snapshot);
            }
            info!(requested = %id, "unknown session id, creating a fresh session");
        }

        let record = SessionRecord::new(SessionId::new());
        self.repo.save(&record)?;
        info!(session_id = %record.id, "session created");
        Ok(SessionSnapshot::unlocked(record))
    }

    /// Last committed state. Never waits on the lease.
    pub fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot, EngineError> {
        self.peek(id)?
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))
    }

    /// Applied edit history, oldest first.
    pub fn history(&self, id: &SessionId) -> Result<Vec<AppliedEdit>, EngineError> {
        Ok(self.snapshot(id)?.state.history.clone())
    }

    /// Wait up to `timeout` for exclusive access to a session.
    ///
    /// A zero timeout fails at once when the session is held. The wait is
    /// never retried here.
    #[instrument(skip(self, id, turn_id), fields(session_id = %id, turn_id = %turn_id))]
    pub async fn acquire_exclusive(
        &self,
        id: &SessionId,
        turn_id: &TurnId,
        timeout: Duration,
    ) -> Result<Lease, EngineError> {
        let slot = self
            .resident_or_load(id)?
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))?;

        let busy = || EngineError::SessionBusy {
            session_id: id.clone(),
            waited: timeout,
        };
        let gate = Arc::clone(&slot.gate);
        let guard = if timeout.is_zero() {
            gate.try_lock_owned().map_err(|_| busy())?
        } else {
            tokio::time::timeout(timeout, gate.lock_owned())
                .await
                .map_err(|_| busy())?
        };

        *slot.holder.lock() = Some(turn_id.clone());
        debug!("lease acquired");
        Ok(Lease {
            slot,
            capabilities: Arc::clone(&self.capabilities),
            repo: self.repo.clone(),
            slots: Arc::clone(&self.slots),
            session_id: id.clone(),
            turn_id: turn_id.clone(),
            guard: Some(guard),
        })
    }

    /// Durably write the lease holder's committed state.
    pub fn persist(&self, lease: &Lease) -> Result<(), EngineError> {
        lease.persist().map_err(EngineError::from)
    }

    /// Resident state when present, else a read of storage that is not kept.
    fn peek(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, EngineError> {
        if let Some(slot) = self.slots.get(id) {
            return Ok(Some(slot.snapshot()));
        }
        Ok(self.load(id)?.map(SessionSnapshot::unlocked))
    }

    fn resident_or_load(&self, id: &SessionId) -> Result<Option<Arc<Slot>>, EngineError> {
        if let Some(slot) = self.slots.get(id) {
            return Ok(Some(Arc::clone(&slot)));
        }
        Ok(self.load(id)?.map(|record| {
            debug!(session_id = %id, revision = record.document.revision, "session made resident");
            let slot = Arc::new(Slot::new(Session::from_record(record)));
            Arc::clone(&self.slots.entry(id.clone()).or_insert(slot))
        }))
    }

    fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>, EngineError> {
        if let Some(reason) = self.quarantined.get(id) {
            return Err(EngineError::SessionCorrupt {
                session_id: id.clone(),
                reason: reason.clone(),
            });
        }
        match self.repo.load(id) {
            Ok(record) => Ok(record),
            Err(e) if e.is_corruption() => Err(self.quarantine(id, e)),
            Err(e) => Err(e.into()),
        }
    }

    fn quarantine(&self, id: &SessionId, error: StoreError) -> EngineError {
        let reason = match &error {
            StoreError::Quarantined { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        if !matches!(error, StoreError::Quarantined { .. }) {
            if let Err(e) = self.repo.quarantine(id, &reason) {
                warn!(session_id = %id, error = %e, "failed to mark session quarantined");
            }
        }
        self.quarantined.insert(id.clone(), reason.clone());
        EngineError::SessionCorrupt {
            session_id: id.clone(),
            reason,
        }
    }
}

/// Exclusive access to one session for the duration of a turn.
///
/// Dropping the lease discards staged edits and frees the session, on every
/// exit path including cancellation and panics.
pub struct Lease {
    slot: Arc<Slot>,
    capabilities: Arc<CapabilitySet>,
    repo: SessionRepo,
    slots: Slots,
    session_id: SessionId,
    turn_id: TurnId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Lease {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.slot.session.lock())
    }

    /// The last committed document. Staged edits are not reflected.
    pub fn document(&self) -> Document {
        self.with_session(|s| s.document.clone())
    }

    pub fn stage(
        &self,
        operation: Operation,
        unit_index: Option<usize>,
        params: Value,
    ) -> Result<PendingEdit, EditError> {
        self.with_session(|s| {
            s.ledger
                .stage(&self.capabilities, &s.document, operation, unit_index, params)
        })
    }

    pub fn pending(&self) -> Vec<PendingEdit> {
        self.with_session(|s| s.ledger.list_pending().to_vec())
    }

    pub fn commit(&self) -> Result<CommitResult, EditError> {
        self.with_session(|s| {
            let result = s.ledger.commit(&self.capabilities, &mut s.document)?;
            if !result.applied.is_empty() {
                s.updated_at = Utc::now();
            }
            Ok(result)
        })
    }

    pub fn discard_pending(&self) -> usize {
        self.with_session(|s| s.ledger.discard_pending())
    }

    pub fn history_len(&self) -> usize {
        self.with_session(|s| s.ledger.history().len())
    }

    pub fn continuation_handle(&self) -> Option<ContinuationHandle> {
        self.with_session(|s| s.continuation_handle.clone())
    }

    pub fn set_continuation_handle(&self, handle: ContinuationHandle) {
        self.with_session(|s| {
            s.continuation_handle = Some(handle);
            s.updated_at = Utc::now();
        });
    }

    pub fn context_files(&self) -> Vec<ContextFile> {
        self.with_session(|s| s.context_files.clone())
    }

    pub fn set_context_files(&self, files: Vec<ContextFile>) {
        self.with_session(|s| {
            s.context_files = files;
            s.updated_at = Utc::now();
        });
    }

    pub fn style_template(&self) -> Option<StyleTemplate> {
        self.with_session(|s| s.style_template.clone())
    }

    pub fn set_style_template(&self, template: StyleTemplate) {
        self.with_session(|s| {
            s.style_template = Some(template);
            s.updated_at = Utc::now();
        });
    }

    /// Write document, history, handle and reference material, then publish them
    /// to readers. Staged edits are never written.
    #[instrument(skip(self), fields(session_id = %self.session_id, turn_id = %self.turn_id))]
    pub fn persist(&self) -> Result<(), StoreError> {
        let record = self.with_session(|s| s.to_record());
        self.repo.save(&record)?;
        *self.slot.committed.write() = Arc::new(CommittedState::from(record));
        Ok(())
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("session_id", &self.session_id)
            .field("turn_id", &self.turn_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let persisted = {
            let mut session = self.slot.session.lock();
            let discarded = session.ledger.discard_pending();
            if discarded > 0 {
                warn!(
                    session_id = %self.session_id,
                    turn_id = %self.turn_id,
                    discarded,
                    "lease released with staged edits; discarding"
                );
            }
            session.matches(&self.slot.committed.read())
        };
        *self.slot.holder.lock() = None;
        drop(self.guard.take());

        // Evict only when no waiter or reader holds the slot besides this lease.
        let slot = &self.slot;
        let evicted = persisted
            && self
                .slots
                .remove_if(&self.session_id, |_, resident| {
                    Arc::ptr_eq(resident, slot) && Arc::strong_count(resident) == 2
                })
                .is_some();
        debug!(session_id = %self.session_id, turn_id = %self.turn_id, evicted, "lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store_on(db: Database) -> Arc<SessionStore> {
        Arc::new(SessionStore::new(
            db,
            Arc::new(CapabilitySet::builtin()),
            SessionStoreConfig::default(),
        ))
    }

    fn store() -> Arc<SessionStore> {
        store_on(Database::in_memory().unwrap())
    }

    #[test]
    fn create_then_reload_from_storage() {
        let db = Database::in_memory().unwrap();
        let first = store_on(db.clone());
        let snap = first.get_or_create(None).unwrap();
        assert_eq!(snap.revision(), 0);
        assert_eq!(snap.lock, LockState::Free);

        let second = store_on(db);
        let again = second.get_or_create(Some(snap.session_id())).unwrap();
        assert_eq!(again.session_id(), snap.session_id());
    }

    #[test]
    fn unknown_id_gets_fresh_identity() {
        let store = store();
        let requested = SessionId::from_raw("sess_nope");
        let snap = store.get_or_create(Some(&requested)).unwrap();
        assert_ne!(snap.session_id(), &requested);
        assert!(matches!(
            store.snapshot(&requested),
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn zero_timeout_fails_fast_when_held() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();

        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        let err = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy { .. }));

        drop(lease);
        assert!(store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_lease_after_release() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                store
                    .acquire_exclusive(&id, &TurnId::new(), Duration::from_secs(10))
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(lease);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_as_busy() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let _lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        let err = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy { waited, .. } if waited == Duration::from_secs(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_leases_never_overlap() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let id = id.clone();
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _lease = store
                    .acquire_exclusive(&id, &TurnId::new(), Duration::from_secs(30))
                    .await
                    .unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lease_released_when_holder_panics() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let task = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                let _lease = store
                    .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
                    .await
                    .unwrap();
                panic!("tool blew up");
            })
        };
        assert!(task.await.is_err());
        assert!(store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn drop_discards_staged_edits() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        {
            let lease = store
                .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
                .await
                .unwrap();
            lease
                .stage(Operation::new(Operation::ADD), None, json!({"content": "x"}))
                .unwrap();
            assert_eq!(lease.pending().len(), 1);
        }
        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        assert!(lease.pending().is_empty());
        assert!(lease.document().is_empty());
    }

    #[tokio::test]
    async fn snapshot_sees_only_persisted_state_and_lock() {
        let db = Database::in_memory().unwrap();
        let store = store_on(db.clone());
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let turn = TurnId::new();
        let lease = store.acquire_exclusive(&id, &turn, Duration::ZERO).await.unwrap();

        lease
            .stage(Operation::new(Operation::ADD), None, json!({"content": "Title"}))
            .unwrap();
        lease.commit().unwrap();

        let snap = store.snapshot(&id).unwrap();
        assert_eq!(snap.revision(), 0);
        assert_eq!(snap.lock, LockState::Held(turn));

        store.persist(&lease).unwrap();
        let snap = store.snapshot(&id).unwrap();
        assert_eq!(snap.revision(), 1);
        assert_eq!(snap.state.history.len(), 1);
        drop(lease);
        assert_eq!(store.snapshot(&id).unwrap().lock, LockState::Free);

        let reloaded = store_on(db).snapshot(&id).unwrap();
        assert_eq!(reloaded.state.document.units[0].content, "Title");
        assert_eq!(reloaded.state.history.len(), 1);
    }

    #[tokio::test]
    async fn released_session_leaves_memory() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        assert_eq!(store.resident_count(), 0);

        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.resident_count(), 1);
        lease
            .stage(Operation::new(Operation::ADD), None, json!({"content": "kept"}))
            .unwrap();
        lease.commit().unwrap();
        lease.persist().unwrap();
        drop(lease);
        assert_eq!(store.resident_count(), 0);

        let snap = store.snapshot(&id).unwrap();
        assert_eq!(snap.state.document.units[0].content, "kept");
        assert_eq!(snap.lock, LockState::Free);
        assert_eq!(store.resident_count(), 0);
    }

    #[tokio::test]
    async fn unpersisted_commit_stays_resident() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        lease
            .stage(Operation::new(Operation::ADD), None, json!({"content": "draft"}))
            .unwrap();
        lease.commit().unwrap();
        drop(lease);
        assert_eq!(store.resident_count(), 1);

        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(lease.document().units[0].content, "draft");
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_keeps_session_resident() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                let lease = store
                    .acquire_exclusive(&id, &TurnId::new(), Duration::from_secs(10))
                    .await
                    .unwrap();
                let resident = store.resident_count();
                drop(lease);
                resident
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(lease);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(store.resident_count(), 0);
    }

    #[tokio::test]
    async fn lease_debug_names_session_and_turn() {
        let store = store();
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        let rendered = format!("{lease:?}");
        assert!(rendered.starts_with("Lease {"));
        assert!(rendered.contains(id.as_str()));
    }

    #[tokio::test]
    async fn style_template_persists_with_session() {
        let db = Database::in_memory().unwrap();
        let store = store_on(db.clone());
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        lease.set_style_template(StyleTemplate {
            filename: "brand.pptx".into(),
            text: "Navy headings".into(),
        });
        lease.persist().unwrap();
        drop(lease);

        let snap = store_on(db).snapshot(&id).unwrap();
        let template = snap.state.style_template.as_ref().unwrap();
        assert_eq!(template.filename, "brand.pptx");
    }

    #[test]
    fn corrupt_session_is_quarantined() {
        let db = Database::in_memory().unwrap();
        let id = store_on(db.clone()).get_or_create(None).unwrap().session_id().clone();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET document = '{not json' WHERE id = ?1",
                [id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let store = store_on(db.clone());
        assert!(matches!(
            store.get_or_create(Some(&id)),
            Err(EngineError::SessionCorrupt { .. })
        ));
        assert!(matches!(
            store.snapshot(&id),
            Err(EngineError::SessionCorrupt { .. })
        ));

        let fresh = store_on(db);
        assert!(matches!(
            fresh.snapshot(&id),
            Err(EngineError::SessionCorrupt { .. })
        ));
    }
}
