//! Human-in-the-loop approval gate.
//!
//! ```text
//! pending ──approve──▶ approved ──execute──▶ executed
//!    │                    └────────────────▶ execution_failed
//!    ├──reject──▶ rejected
//!    └──expire──▶ expired
//! ```
//!
//! Terminal states never change. Every transition is appended to the audit
//! trail before the record is persisted, and the payload digest is
//! re-verified before a record is approved or handed to the engine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audit::{AuditEvent, AuditTrail, Outcome};
use crate::canonical;
use crate::engine::{EngineReceipt, RenderedPayload};
use crate::error::{GateError, Result};
use crate::paths::{self, validate_ident};
use crate::types::{Lane, ReasonCode};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
    ExecutionFailed,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Executed => "executed",
            ApprovalStatus::ExecutionFailed => "execution_failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApprovalStatus::Rejected
                | ApprovalStatus::Expired
                | ApprovalStatus::Executed
                | ApprovalStatus::ExecutionFailed
        )
    }

    /// The only legal moves. Everything else is `invalid_transition`.
    pub fn transition(self, to: ApprovalStatus) -> Result<ApprovalStatus> {
        use ApprovalStatus::*;
        match (self, to) {
            (Pending, Approved)
            | (Pending, Rejected)
            | (Pending, Expired)
            | (Approved, Executed)
            | (Approved, ExecutionFailed) => Ok(to),
            (from, to) => Err(GateError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "expired" => Ok(ApprovalStatus::Expired),
            "executed" => Ok(ApprovalStatus::Executed),
            "execution_failed" => Ok(ApprovalStatus::ExecutionFailed),
            _ => Err(GateError::SchemaInvalid(format!(
                "unknown approval status '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub status: ApprovalStatus,
    pub lane: Lane,
    pub template_id: String,
    pub payload: RenderedPayload,
    pub payload_digest: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub auto_execute: bool,
    /// Job id reported by the engine once executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ApprovalRecord {
    pub fn verify_digest(&self) -> Result<()> {
        let current = canonical::digest(&self.payload)?;
        if current == self.payload_digest {
            Ok(())
        } else {
            Err(GateError::IntegrityViolation(format!(
                "payload digest mismatch for approval {}",
                self.approval_id
            )))
        }
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What a gated submission hands to `ApprovalGate::create`.
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub lane: Lane,
    pub template_id: String,
    pub payload: RenderedPayload,
}

pub fn new_approval_id() -> String {
    format!("apr-{}", uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

pub trait ApprovalStore: Send + Sync {
    fn load(&self, approval_id: &str) -> Result<ApprovalRecord>;
    fn save(&self, record: &ApprovalRecord) -> Result<()>;
    fn list(&self) -> Result<Vec<ApprovalRecord>>;
}

/// One JSON file per record under `.hookgate/approvals/`, written atomically.
pub struct DirApprovalStore {
    dir: PathBuf,
}

impl DirApprovalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_root(root: &Path) -> Self {
        Self::new(paths::approvals_dir(root))
    }

    fn path(&self, approval_id: &str) -> PathBuf {
        self.dir.join(format!("{approval_id}.json"))
    }
}

impl ApprovalStore for DirApprovalStore {
    fn load(&self, approval_id: &str) -> Result<ApprovalRecord> {
        validate_ident("approval_id", approval_id)?;
        let path = self.path(approval_id);
        if !path.exists() {
            return Err(GateError::ApprovalNotFound(approval_id.to_string()));
        }
        let data = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn save(&self, record: &ApprovalRecord) -> Result<()> {
        validate_ident("approval_id", &record.approval_id)?;
        let data = serde_json::to_vec_pretty(record)?;
        crate::io::atomic_write(&self.path(&record.approval_id), &data)
    }

    fn list(&self) -> Result<Vec<ApprovalRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(GateError::from)
                .and_then(|d| serde_json::from_slice::<ApprovalRecord>(&d).map_err(GateError::from))
            {
                Ok(rec) => out.push(rec),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable approval record"),
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryApprovalStore {
    records: Mutex<HashMap<String, ApprovalRecord>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ApprovalRecord>>> {
        self.records
            .lock()
            .map_err(|_| GateError::Internal("approval store lock poisoned".into()))
    }
}

impl ApprovalStore for MemoryApprovalStore {
    fn load(&self, approval_id: &str) -> Result<ApprovalRecord> {
        self.lock()?
            .get(approval_id)
            .cloned()
            .ok_or_else(|| GateError::ApprovalNotFound(approval_id.to_string()))
    }

    fn save(&self, record: &ApprovalRecord) -> Result<()> {
        self.lock()?
            .insert(record.approval_id.clone(), record.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<ApprovalRecord>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub struct ApprovalGate {
    store: Box<dyn ApprovalStore>,
    audit: Arc<AuditTrail>,
    /// Serializes read-modify-write of records.
    transitions: Mutex<()>,
    executing: Mutex<HashSet<String>>,
}

/// Exclusive right to hand one approved record to the engine. Dropping it
/// without `finish` leaves the record `approved` so execution can be retried.
pub struct ExecutionClaim<'a> {
    gate: &'a ApprovalGate,
    record: ApprovalRecord,
}

impl ExecutionClaim<'_> {
    pub fn record(&self) -> &ApprovalRecord {
        &self.record
    }

    pub fn finish(
        self,
        actor: &str,
        result: std::result::Result<EngineReceipt, String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord> {
        self.gate
            .finish_execution(&self.record.approval_id, actor, result, now)
    }
}

impl Drop for ExecutionClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.gate.executing.lock() {
            set.remove(&self.record.approval_id);
        }
    }
}

impl ApprovalGate {
    pub fn new(store: Box<dyn ApprovalStore>, audit: Arc<AuditTrail>) -> Self {
        Self {
            store,
            audit,
            transitions: Mutex::new(()),
            executing: Mutex::new(HashSet::new()),
        }
    }

    fn serialize(&self) -> Result<MutexGuard<'_, ()>> {
        self.transitions
            .lock()
            .map_err(|_| GateError::Internal("approval transition lock poisoned".into()))
    }

    fn record_event(
        &self,
        actor: &str,
        action: &str,
        rec: &ApprovalRecord,
        outcome: Outcome,
        reason: Option<ReasonCode>,
    ) -> Result<()> {
        let mut event = AuditEvent::new(actor, action, rec.approval_id.clone(), outcome);
        if let Some(r) = reason {
            event = event.with_reason(r.as_str());
        }
        self.audit.append(event)?;
        Ok(())
    }

    pub fn create(
        &self,
        new: NewApproval,
        actor: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord> {
        let record = ApprovalRecord {
            approval_id: new_approval_id(),
            status: ApprovalStatus::Pending,
            lane: new.lane,
            template_id: new.template_id,
            payload_digest: canonical::digest(&new.payload)?,
            payload: new.payload,
            created_at: now,
            expires_at: now + ttl,
            decided_at: None,
            decided_by: None,
            auto_execute: false,
            job_id: None,
            failure_reason: None,
        };
        let _guard = self.serialize()?;
        self.record_event(actor, "approval.create", &record, Outcome::Recorded, None)?;
        self.store.save(&record)?;
        tracing::info!(approval_id = %record.approval_id, lane = %record.lane, "approval created");
        Ok(record)
    }

    pub fn get(&self, approval_id: &str) -> Result<ApprovalRecord> {
        self.store.load(approval_id)
    }

    /// Newest first, optionally filtered by status.
    pub fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRecord>> {
        let mut records: Vec<_> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    pub fn approve(
        &self,
        approval_id: &str,
        actor: &str,
        auto_execute: bool,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord> {
        let _guard = self.serialize()?;
        let mut rec = self.store.load(approval_id)?;

        if rec.status == ApprovalStatus::Pending && rec.is_past_expiry(now) {
            self.expire_locked(&mut rec, now)?;
            return Err(GateError::ApprovalExpired(approval_id.to_string()));
        }
        if rec.status == ApprovalStatus::Expired {
            return Err(GateError::ApprovalExpired(approval_id.to_string()));
        }
        let next = rec.status.transition(ApprovalStatus::Approved)?;

        if let Err(e) = rec.verify_digest() {
            tracing::error!(approval_id, "approval payload digest mismatch");
            self.record_event(
                actor,
                "approval.approve",
                &rec,
                Outcome::Rejected,
                Some(ReasonCode::IntegrityViolation),
            )?;
            return Err(e);
        }

        rec.status = next;
        rec.decided_at = Some(now);
        rec.decided_by = Some(actor.to_string());
        rec.auto_execute = auto_execute;
        self.record_event(actor, "approval.approve", &rec, Outcome::Accepted, None)?;
        self.store.save(&rec)?;
        tracing::info!(approval_id, auto_execute, "approval approved");
        Ok(rec)
    }

    /// Idempotent on an already rejected record.
    pub fn reject(&self, approval_id: &str, actor: &str, now: DateTime<Utc>) -> Result<ApprovalRecord> {
        let _guard = self.serialize()?;
        let mut rec = self.store.load(approval_id)?;
        if rec.status == ApprovalStatus::Rejected {
            return Ok(rec);
        }
        rec.status = rec.status.transition(ApprovalStatus::Rejected)?;
        rec.decided_at = Some(now);
        rec.decided_by = Some(actor.to_string());
        self.record_event(actor, "approval.reject", &rec, Outcome::Accepted, None)?;
        self.store.save(&rec)?;
        tracing::info!(approval_id, "approval rejected");
        Ok(rec)
    }

    /// Claim an approved record for hand-off. The digest is checked again so
    /// a payload edited after approval never reaches the engine.
    ///
    /// The status check and the entry into the executing set happen under the
    /// same transition guard, so a record that finished between the two can
    /// never be claimed again.
    pub fn claim_execution(&self, approval_id: &str, actor: &str) -> Result<ExecutionClaim<'_>> {
        let _guard = self.serialize()?;
        let rec = self.store.load(approval_id)?;
        rec.status.transition(ApprovalStatus::Executed)?;
        if let Err(e) = rec.verify_digest() {
            tracing::error!(approval_id, "approved payload digest mismatch at execution");
            self.record_event(
                actor,
                "approval.execute",
                &rec,
                Outcome::Rejected,
                Some(ReasonCode::IntegrityViolation),
            )?;
            return Err(e);
        }

        // Lock order: transitions, then executing. `Drop` only takes executing.
        let mut executing = self
            .executing
            .lock()
            .map_err(|_| GateError::Internal("approval execution set poisoned".into()))?;
        if !executing.insert(approval_id.to_string()) {
            return Err(GateError::DuplicatePending(approval_id.to_string()));
        }
        Ok(ExecutionClaim { gate: self, record: rec })
    }

    fn finish_execution(
        &self,
        approval_id: &str,
        actor: &str,
        result: std::result::Result<EngineReceipt, String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord> {
        let _guard = self.serialize()?;
        let mut rec = self.store.load(approval_id)?;
        let (to, outcome) = match &result {
            Ok(_) => (ApprovalStatus::Executed, Outcome::Accepted),
            Err(_) => (ApprovalStatus::ExecutionFailed, Outcome::Failed),
        };
        rec.status = rec.status.transition(to)?;
        match result {
            Ok(receipt) => rec.job_id = Some(receipt.job_id),
            Err(reason) => rec.failure_reason = Some(reason),
        }
        let reason = (outcome == Outcome::Failed).then_some(ReasonCode::EngineUnavailable);
        self.record_event(actor, "approval.execute", &rec, outcome, reason)?;
        self.store.save(&rec)?;
        tracing::info!(approval_id, status = %rec.status, "approval execution finished");
        Ok(rec)
    }

    fn expire_locked(&self, rec: &mut ApprovalRecord, now: DateTime<Utc>) -> Result<()> {
        rec.status = rec.status.transition(ApprovalStatus::Expired)?;
        rec.decided_at = Some(now);
        rec.decided_by = Some("system".into());
        self.record_event("system", "approval.expire", rec, Outcome::Accepted, None)?;
        self.store.save(rec)?;
        tracing::info!(approval_id = %rec.approval_id, "approval expired");
        Ok(())
    }

    /// Expire every pending record past its horizon. Returns how many moved.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.serialize()?;
        let mut expired = 0;
        for mut rec in self.store.list()? {
            if rec.status == ApprovalStatus::Pending && rec.is_past_expiry(now) {
                self.expire_locked(&mut rec, now)?;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
