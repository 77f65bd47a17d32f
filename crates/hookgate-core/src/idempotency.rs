//! Duplicate suppression keyed by idempotency key within a TTL window.
//!
//! `check_and_reserve` is the only admission point: it atomically either
//! records a fresh pending reservation (`New`) or reports what the first
//! request with that key did (`Duplicate`). The winner later commits its
//! outcome or releases the reservation so a genuine retry can proceed.
//!
//! Two backends share the contract: an in-memory map for single-process
//! deployments and a redb table that survives restarts.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{GateError, Result};

/// Default dedupe window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Accepted,
    AwaitingApproval,
}

/// What the first submission for a key produced; replayed to duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutcome {
    pub job_id: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub first_seen_at: DateTime<Utc>,
    /// `None` while the winning request is still in flight.
    #[serde(default)]
    pub outcome: Option<StoredOutcome>,
}

impl IdempotencyRecord {
    fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.first_seen_at >= ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    New,
    Duplicate(Option<StoredOutcome>),
}

pub trait IdempotencyStore: Send + Sync {
    fn check_and_reserve(&self, key: &str, now: DateTime<Utc>) -> Result<Reservation>;
    fn commit(&self, key: &str, outcome: &StoredOutcome) -> Result<()>;
    /// Drop a pending reservation. Committed records are left alone.
    fn release(&self, key: &str) -> Result<()>;
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

// ---------------------------------------------------------------------------
// ReservationGuard
// ---------------------------------------------------------------------------

/// Releases the reservation on drop unless it was committed, so every
/// early return or panic on the submission path leaves the key retryable.
pub struct ReservationGuard<'a> {
    store: &'a dyn IdempotencyStore,
    key: String,
    armed: bool,
}

impl<'a> ReservationGuard<'a> {
    pub fn new(store: &'a dyn IdempotencyStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            armed: true,
        }
    }

    pub fn commit(mut self, outcome: &StoredOutcome) -> Result<()> {
        self.armed = false;
        self.store.commit(&self.key, outcome)
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.store.release(&self.key) {
                tracing::warn!(key = %self.key, error = %e, "failed to release idempotency reservation");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryIdempotencyStore
// ---------------------------------------------------------------------------

pub struct MemoryIdempotencyStore {
    ttl: chrono::Duration,
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono_ttl(ttl),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, IdempotencyRecord>>> {
        self.records
            .lock()
            .map_err(|_| GateError::Internal("idempotency table lock poisoned".into()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn check_and_reserve(&self, key: &str, now: DateTime<Utc>) -> Result<Reservation> {
        let mut records = self.lock()?;
        if let Some(existing) = records.get(key) {
            if !existing.is_expired(now, self.ttl) {
                return Ok(Reservation::Duplicate(existing.outcome.clone()));
            }
        }
        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                first_seen_at: now,
                outcome: None,
            },
        );
        Ok(Reservation::New)
    }

    fn commit(&self, key: &str, outcome: &StoredOutcome) -> Result<()> {
        let mut records = self.lock()?;
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| IdempotencyRecord {
                key: key.to_string(),
                first_seen_at: Utc::now(),
                outcome: None,
            });
        record.outcome = Some(outcome.clone());
        Ok(())
    }

    fn release(&self, key: &str) -> Result<()> {
        let mut records = self.lock()?;
        if records.get(key).is_some_and(|r| r.outcome.is_none()) {
            records.remove(key);
        }
        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now, self.ttl));
        Ok(before - records.len())
    }
}

// ---------------------------------------------------------------------------
// RedbIdempotencyStore
// ---------------------------------------------------------------------------

/// Key: idempotency key. Value: JSON-encoded `IdempotencyRecord`.
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("idempotency");

fn store_err(e: impl std::fmt::Display) -> GateError {
    GateError::Store(e.to_string())
}

pub struct RedbIdempotencyStore {
    ttl: chrono::Duration,
    db: Database,
}

impl RedbIdempotencyStore {
    /// Open or create the database at `path`, creating the table up front.
    ///
    /// redb holds the file exclusively, so any pending reservation found here
    /// belongs to a process that died mid-submission. Those are dropped so the
    /// key can be retried; committed outcomes are kept.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        let abandoned = {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let mut pending = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (k, v) = entry.map_err(store_err)?;
                let record: IdempotencyRecord = serde_json::from_slice(v.value())?;
                if record.outcome.is_none() {
                    pending.push(k.value().to_string());
                }
            }
            for key in &pending {
                table.remove(key.as_str()).map_err(store_err)?;
            }
            pending.len()
        };
        wt.commit().map_err(store_err)?;
        if abandoned > 0 {
            tracing::warn!(abandoned, "dropped reservations left by an interrupted run");
        }
        Ok(Self {
            ttl: chrono_ttl(ttl),
            db,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(RECORDS).map_err(store_err)?;
        let value = table.get(key).map_err(store_err)?;
        match value {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }
}

impl IdempotencyStore for RedbIdempotencyStore {
    fn check_and_reserve(&self, key: &str, now: DateTime<Utc>) -> Result<Reservation> {
        // redb serializes write transactions, which makes read-then-insert atomic.
        let wt = self.db.begin_write().map_err(store_err)?;
        let reservation = {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let existing = table
                .get(key)
                .map_err(store_err)?
                .map(|v| v.value().to_vec());
            let existing: Option<IdempotencyRecord> = match existing {
                Some(bytes) => Some(serde_json::from_slice(&bytes)?),
                None => None,
            };
            match existing {
                Some(record) if !record.is_expired(now, self.ttl) => {
                    Reservation::Duplicate(record.outcome)
                }
                _ => {
                    let record = IdempotencyRecord {
                        key: key.to_string(),
                        first_seen_at: now,
                        outcome: None,
                    };
                    let bytes = serde_json::to_vec(&record)?;
                    table.insert(key, bytes.as_slice()).map_err(store_err)?;
                    Reservation::New
                }
            }
        };
        wt.commit().map_err(store_err)?;
        Ok(reservation)
    }

    fn commit(&self, key: &str, outcome: &StoredOutcome) -> Result<()> {
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let existing = table
                .get(key)
                .map_err(store_err)?
                .map(|v| v.value().to_vec());
            let mut record = match existing {
                Some(bytes) => serde_json::from_slice::<IdempotencyRecord>(&bytes)?,
                None => IdempotencyRecord {
                    key: key.to_string(),
                    first_seen_at: Utc::now(),
                    outcome: None,
                },
            };
            record.outcome = Some(outcome.clone());
            let bytes = serde_json::to_vec(&record)?;
            table.insert(key, bytes.as_slice()).map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn release(&self, key: &str) -> Result<()> {
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let existing = table
                .get(key)
                .map_err(store_err)?
                .map(|v| v.value().to_vec());
            if let Some(bytes) = existing {
                let record: IdempotencyRecord = serde_json::from_slice(&bytes)?;
                if record.outcome.is_none() {
                    table.remove(key).map_err(store_err)?;
                }
            }
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let count = {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (k, v) = entry.map_err(store_err)?;
                let record: IdempotencyRecord = serde_json::from_slice(v.value())?;
                if record.is_expired(now, self.ttl) {
                    expired.push(k.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(store_err)?;
            }
            expired.len()
        };
        wt.commit().map_err(store_err)?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as CDur;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn accepted(job_id: &str) -> StoredOutcome {
        StoredOutcome {
            job_id: job_id.into(),
            status: OutcomeStatus::Accepted,
            approval_id: None,
        }
    }

    fn open_redb(dir: &TempDir) -> RedbIdempotencyStore {
        RedbIdempotencyStore::open(&dir.path().join("idem.redb"), Duration::from_secs(60)).unwrap()
    }

    fn contract(store: &dyn IdempotencyStore) {
        let now = Utc::now();
        assert_eq!(store.check_and_reserve("k1", now).unwrap(), Reservation::New);
        // Loser sees pending while the winner is in flight.
        assert_eq!(
            store.check_and_reserve("k1", now).unwrap(),
            Reservation::Duplicate(None)
        );
        store.commit("k1", &accepted("abc123")).unwrap();
        assert_eq!(
            store.check_and_reserve("k1", now).unwrap(),
            Reservation::Duplicate(Some(accepted("abc123")))
        );
        // Committed records survive release.
        store.release("k1").unwrap();
        assert!(matches!(
            store.check_and_reserve("k1", now).unwrap(),
            Reservation::Duplicate(Some(_))
        ));

        // Released reservations can be retried.
        assert_eq!(store.check_and_reserve("k2", now).unwrap(), Reservation::New);
        store.release("k2").unwrap();
        assert_eq!(store.check_and_reserve("k2", now).unwrap(), Reservation::New);

        // After the TTL the key is new again.
        let later = now + CDur::seconds(61);
        assert_eq!(store.check_and_reserve("k1", later).unwrap(), Reservation::New);
    }

    #[test]
    fn memory_store_contract() {
        contract(&MemoryIdempotencyStore::new(Duration::from_secs(60)));
    }

    #[test]
    fn redb_store_contract() {
        let dir = TempDir::new().unwrap();
        contract(&open_redb(&dir));
    }

    #[test]
    fn redb_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_redb(&dir);
            store.check_and_reserve("job-1", Utc::now()).unwrap();
            store.commit("job-1", &accepted("job-1")).unwrap();
        }
        let store = open_redb(&dir);
        let record = store.get("job-1").unwrap().unwrap();
        assert_eq!(record.outcome, Some(accepted("job-1")));
    }

    #[test]
    fn reopen_drops_reservations_left_in_flight() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        {
            let store = open_redb(&dir);
            assert_eq!(store.check_and_reserve("k", now).unwrap(), Reservation::New);
            store.check_and_reserve("done", now).unwrap();
            store.commit("done", &accepted("done")).unwrap();
            // Dropped without commit or release, as after a crash.
        }
        let store = open_redb(&dir);
        assert!(store.get("k").unwrap().is_none());
        assert_eq!(
            store.check_and_reserve("k", now + CDur::seconds(1)).unwrap(),
            Reservation::New
        );
        assert_eq!(
            store.check_and_reserve("done", now + CDur::seconds(1)).unwrap(),
            Reservation::Duplicate(Some(accepted("done")))
        );
    }

    #[test]
    fn purge_removes_only_expired() {
        let store = MemoryIdempotencyStore::new(Duration::from_secs(60));
        let now = Utc::now();
        store.check_and_reserve("old", now - CDur::seconds(120)).unwrap();
        store.check_and_reserve("fresh", now).unwrap();
        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert_eq!(store.len(), 1);

        let dir = TempDir::new().unwrap();
        let redb = open_redb(&dir);
        redb.check_and_reserve("old", now - CDur::seconds(120)).unwrap();
        redb.check_and_reserve("fresh", now).unwrap();
        assert_eq!(redb.purge_expired(now).unwrap(), 1);
        assert!(redb.get("fresh").unwrap().is_some());
    }

    #[test]
    fn guard_releases_on_drop_and_not_after_commit() {
        let store = MemoryIdempotencyStore::new(Duration::from_secs(60));
        let now = Utc::now();
        store.check_and_reserve("a", now).unwrap();
        drop(ReservationGuard::new(&store, "a"));
        assert!(store.is_empty());

        store.check_and_reserve("b", now).unwrap();
        let guard = ReservationGuard::new(&store, "b");
        guard.commit(&accepted("b")).unwrap();
        assert_eq!(store.len(), 1);
    }

    fn race(store: &dyn IdempotencyStore) {
        let winners = AtomicUsize::new(0);
        let now = Utc::now();
        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    if store.check_and_reserve("same-key", now).unwrap() == Reservation::New {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_reservations_have_one_winner_memory() {
        race(&MemoryIdempotencyStore::new(Duration::from_secs(60)));
    }

    #[test]
    fn concurrent_reservations_have_one_winner_redb() {
        let dir = TempDir::new().unwrap();
        race(&open_redb(&dir));
    }
}
