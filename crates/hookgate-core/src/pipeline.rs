//! The admission pipeline: authenticate → normalize → dedupe → render →
//! (gate) → admit → hand off, recording every privileged decision.
//!
//! Configuration-derived state (authenticator, budgets, retry policy,
//! admin token) lives in one immutable snapshot swapped as a unit on
//! reload. Admission counters, the nonce cache, idempotency records and
//! the audit chain outlive any reload.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::admission::{AdmissionController, AdmissionSnapshot};
use crate::approval::{ApprovalGate, ApprovalRecord, ApprovalStatus, ApprovalStore, DirApprovalStore, NewApproval};
use crate::audit::{AuditEntry, AuditEvent, AuditQuery, AuditTrail, ChainReport, Outcome};
use crate::auth::{Authenticator, Envelope, NonceCache};
use crate::config::{Config, ConfigWarning, IdempotencyBackend};
use crate::engine::{self, ExecutionEngine, HttpEngine, RenderedPayload, RetryPolicy, UnconfiguredEngine};
use crate::error::{GateError, Result};
use crate::idempotency::{
    IdempotencyStore, MemoryIdempotencyStore, OutcomeStatus, RedbIdempotencyStore, Reservation,
    ReservationGuard, StoredOutcome,
};
use crate::normalize::{self, CanonicalJobRequest};
use crate::paths;
use crate::render::{self, RenderWarning};
use crate::template::{DirTemplateStore, Template, TemplateStore};
use crate::types::{ErrorKind, Lane, ReasonCode};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted {
        job_id: String,
        trace_id: String,
        engine_job_id: String,
    },
    /// A committed earlier submission with the same key.
    Duplicate(StoredOutcome),
    AwaitingApproval {
        job_id: String,
        approval_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResponse {
    pub accepted: bool,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub awaiting_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

impl SubmitOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            SubmitOutcome::Accepted { job_id, .. } | SubmitOutcome::AwaitingApproval { job_id, .. } => job_id,
            SubmitOutcome::Duplicate(o) => &o.job_id,
        }
    }

    fn awaiting(&self) -> bool {
        match self {
            SubmitOutcome::AwaitingApproval { .. } => true,
            SubmitOutcome::Duplicate(o) => o.status == OutcomeStatus::AwaitingApproval,
            SubmitOutcome::Accepted { .. } => false,
        }
    }

    /// 200 for accepted jobs (first or duplicate), 202 while gated.
    pub fn http_status(&self) -> u16 {
        if self.awaiting() {
            202
        } else {
            200
        }
    }

    pub fn response(&self) -> SubmitResponse {
        let awaiting = self.awaiting();
        SubmitResponse {
            accepted: !awaiting,
            job_id: self.job_id().to_string(),
            trace_id: match self {
                SubmitOutcome::Accepted { trace_id, .. } => Some(trace_id.clone()),
                _ => None,
            },
            duplicate: matches!(self, SubmitOutcome::Duplicate(_)),
            awaiting_approval: awaiting,
            approval_id: match self {
                SubmitOutcome::AwaitingApproval { approval_id, .. } => Some(approval_id.clone()),
                SubmitOutcome::Duplicate(o) => o.approval_id.clone(),
                SubmitOutcome::Accepted { .. } => None,
            },
        }
    }
}

/// Dry-run result: everything up to and including rendering.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub normalized: CanonicalJobRequest,
    pub job_id: String,
    pub idempotency_key: String,
    pub requires_approval: bool,
    pub document: serde_json::Value,
    pub size_bytes: usize,
    pub render_warnings: Vec<RenderWarning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalDecision {
    pub record: ApprovalRecord,
    /// Set when auto-execute was requested but could not run now; the
    /// record stays `approved` and can be executed later.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferred: Option<ReasonCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub approvals_expired: usize,
    pub idempotency_purged: usize,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

pub struct PipelineParts {
    pub config: Config,
    pub templates: Arc<dyn TemplateStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub approvals: Box<dyn ApprovalStore>,
    pub audit: Arc<AuditTrail>,
    pub engine: Arc<dyn ExecutionEngine>,
}

impl PipelineParts {
    /// Wire the on-disk stores under `root` from an already validated config.
    pub fn from_root(root: &Path, config: Config) -> Result<Self> {
        let ttl = Duration::from_secs(config.idempotency.ttl_seconds);
        let idempotency: Arc<dyn IdempotencyStore> = match config.idempotency.backend {
            IdempotencyBackend::Memory => Arc::new(MemoryIdempotencyStore::new(ttl)),
            IdempotencyBackend::Disk => {
                Arc::new(RedbIdempotencyStore::open(&paths::idempotency_db_path(root), ttl)?)
            }
        };
        let engine: Arc<dyn ExecutionEngine> = match config.engine.base_url {
            Some(_) => Arc::new(HttpEngine::from_config(&config.engine)?),
            None => Arc::new(UnconfiguredEngine),
        };
        Ok(Self {
            templates: Arc::new(DirTemplateStore::for_root(root)),
            idempotency,
            approvals: Box::new(DirApprovalStore::for_root(root)),
            audit: Arc::new(AuditTrail::open(&paths::audit_path(root))?),
            engine,
            config,
        })
    }
}

struct Snapshot {
    config: Config,
    authenticator: Authenticator,
    retry: RetryPolicy,
    admin_token: Option<String>,
}

impl Snapshot {
    fn build(config: Config, nonces: &Arc<NonceCache>) -> Self {
        Self {
            authenticator: Authenticator::new(config.credential(), Arc::clone(nonces)),
            retry: RetryPolicy::from_config(&config.engine),
            admin_token: config.admin_token(),
            config,
        }
    }

    fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.config.admission.wait_timeout_ms)
    }

    fn approval_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.approvals.expiry_seconds)
    }
}

pub struct Pipeline {
    snapshot: RwLock<Arc<Snapshot>>,
    nonces: Arc<NonceCache>,
    templates: Arc<dyn TemplateStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    admission: AdmissionController,
    approvals: ApprovalGate,
    audit: Arc<AuditTrail>,
    engine: Arc<dyn ExecutionEngine>,
}

struct Prepared {
    request: CanonicalJobRequest,
    template: Template,
    job_id: String,
    key: String,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Result<Self> {
        for w in parts.config.check()? {
            tracing::warn!("config: {}", w.message);
        }
        let nonces = Arc::new(NonceCache::new());
        let admission = AdmissionController::new(parts.config.admission.limits());
        let snapshot = Snapshot::build(parts.config, &nonces);
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            nonces,
            templates: parts.templates,
            idempotency: parts.idempotency,
            admission,
            approvals: ApprovalGate::new(parts.approvals, Arc::clone(&parts.audit)),
            audit: parts.audit,
            engine: parts.engine,
        })
    }

    /// Load and validate `<root>/.hookgate/config.yaml` and open every store.
    pub fn open(root: &Path) -> Result<Self> {
        let (config, _warnings) = Config::load_validated(root)?;
        Self::new(PipelineParts::from_root(root, config)?)
    }

    fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&s))
            .map_err(|_| GateError::Internal("config snapshot lock poisoned".into()))
    }

    pub fn config(&self) -> Result<Config> {
        Ok(self.snapshot()?.config.clone())
    }

    pub fn admin_token(&self) -> Result<Option<String>> {
        Ok(self.snapshot()?.admin_token.clone())
    }

    pub fn approval_sweep_interval(&self) -> Result<Duration> {
        Ok(Duration::from_secs(
            self.snapshot()?.config.approvals.sweep_interval_seconds,
        ))
    }

    fn record(&self, event: AuditEvent) -> Result<AuditEntry> {
        self.audit.append(event)
    }

    /// Record a rejection. The original error wins over an audit failure.
    fn record_rejection(&self, actor: &str, action: &str, subject: &str, err: &GateError) {
        let outcome = if err.kind() == ErrorKind::Engine {
            Outcome::Failed
        } else {
            Outcome::Rejected
        };
        let event = AuditEvent::new(actor, action, subject, outcome).with_reason(err.reason().as_str());
        if let Err(e) = self.record(event) {
            tracing::error!(error = %e, action, "could not record rejection in audit trail");
        }
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    fn authenticate(&self, snap: &Snapshot, env: &Envelope, now: DateTime<Utc>) -> Result<String> {
        let lane = env.lane.as_str();
        match snap.authenticator.authenticate(env, now) {
            Ok(ok) => {
                let actor = format!("{lane}:{}", ok.method);
                self.record(AuditEvent::new(&actor, "auth.accept", lane, Outcome::Accepted))?;
                Ok(actor)
            }
            Err(e) => {
                tracing::info!(lane, reason = %e.reason(), "request rejected at authentication");
                self.record_rejection(lane, "auth.reject", lane, &e);
                Err(e)
            }
        }
    }

    fn prepare(&self, snap: &Snapshot, body: &[u8], mapping: Option<&str>) -> Result<Prepared> {
        let profile = mapping.map(|m| snap.config.mapping(m)).transpose()?;
        let request = normalize::normalize_bytes(body, profile)?;
        let template = self.templates.get(&request.template_id)?;
        let undeclared = template.undeclared(request.inputs.keys());
        if !undeclared.is_empty() {
            return Err(GateError::SchemaInvalid(format!(
                "inputs not allowed by template '{}': {}",
                template.id,
                undeclared.join(", ")
            )));
        }
        Ok(Prepared {
            job_id: request.effective_job_id()?,
            key: request.idempotency_key()?,
            request,
            template,
        })
    }

    fn payload_for(&self, prepared: &Prepared, document: serde_json::Value) -> RenderedPayload {
        RenderedPayload {
            job_id: prepared.job_id.clone(),
            trace_id: prepared
                .request
                .trace_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            profile_id: prepared.request.profile_id.clone(),
            callback: prepared.request.callback.clone(),
            document,
        }
    }

    pub fn submit_webhook(&self, env: &Envelope) -> Result<SubmitOutcome> {
        let snap = self.snapshot()?;
        let now = Utc::now();
        let actor = self.authenticate(&snap, env, now)?;

        let mut subject = env.lane.as_str().to_string();
        let result = self.run_submission(&snap, env, &actor, &mut subject, now);
        if let Err(e) = &result {
            match e {
                GateError::DuplicatePending(_) | GateError::AuditUnavailable(_) => {}
                GateError::Engine(_) => self.record_rejection(&actor, "submit.fail", &subject, e),
                _ => self.record_rejection(&actor, "submit.reject", &subject, e),
            }
            tracing::info!(lane = %env.lane, job_id = %subject, reason = %e.reason(), "submission not accepted");
        }
        result
    }

    fn run_submission(
        &self,
        snap: &Snapshot,
        env: &Envelope,
        actor: &str,
        subject: &mut String,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let prepared = self.prepare(snap, &env.body, env.mapping.as_deref())?;
        *subject = prepared.job_id.clone();

        let guard = match self.idempotency.check_and_reserve(&prepared.key, now)? {
            Reservation::New => ReservationGuard::new(self.idempotency.as_ref(), prepared.key.clone()),
            Reservation::Duplicate(Some(first)) => {
                self.record(
                    AuditEvent::new(actor, "submit.duplicate", subject.as_str(), Outcome::Recorded)
                        .with_reason(ReasonCode::Duplicate.as_str()),
                )?;
                tracing::info!(job_id = %first.job_id, "duplicate submission answered from first outcome");
                return Ok(SubmitOutcome::Duplicate(first));
            }
            Reservation::Duplicate(None) => {
                self.record(
                    AuditEvent::new(actor, "submit.duplicate", subject.as_str(), Outcome::Rejected)
                        .with_reason(ReasonCode::Duplicate.as_str()),
                )?;
                return Err(GateError::DuplicatePending(prepared.job_id.clone()));
            }
        };

        let rendered =
            render::render_template(&prepared.template, &prepared.request.inputs, snap.config.render.max_bytes)?;
        for w in &rendered.warnings {
            tracing::debug!(placeholder = %w.placeholder, path = %w.path, "unresolved placeholder in rendered job");
        }
        let payload = self.payload_for(&prepared, rendered.document);

        if prepared.template.requires_approval {
            let rec = self.approvals.create(
                NewApproval {
                    lane: env.lane,
                    template_id: prepared.template.id.clone(),
                    payload,
                },
                actor,
                snap.approval_ttl(),
                now,
            )?;
            guard.commit(&StoredOutcome {
                job_id: prepared.job_id.clone(),
                status: OutcomeStatus::AwaitingApproval,
                approval_id: Some(rec.approval_id.clone()),
            })?;
            return Ok(SubmitOutcome::AwaitingApproval {
                job_id: prepared.job_id,
                approval_id: rec.approval_id,
            });
        }

        let ticket = self.admission.acquire(env.lane, snap.admission_wait())?;
        let receipt = engine::submit_with_retry(self.engine.as_ref(), &payload, snap.retry)?;
        ticket.release()?;

        guard.commit(&StoredOutcome {
            job_id: prepared.job_id.clone(),
            status: OutcomeStatus::Accepted,
            approval_id: None,
        })?;
        self.record(AuditEvent::new(actor, "submit.accept", subject.as_str(), Outcome::Accepted))?;
        tracing::info!(lane = %env.lane, job_id = %prepared.job_id, engine_job_id = %receipt.job_id, "job accepted");

        Ok(SubmitOutcome::Accepted {
            job_id: prepared.job_id,
            trace_id: payload.trace_id,
            engine_job_id: receipt.job_id,
        })
    }

    /// Authenticated dry run: no reservation, no admission, no hand-off.
    pub fn validate_webhook(&self, env: &Envelope) -> Result<ValidationReport> {
        let snap = self.snapshot()?;
        self.authenticate(&snap, env, Utc::now())?;
        self.dry_run(&snap, &env.body, env.mapping.as_deref())
    }

    /// Operator dry run from the CLI; skips authentication and auditing.
    pub fn render_local(&self, body: &[u8], mapping: Option<&str>) -> Result<ValidationReport> {
        let snap = self.snapshot()?;
        self.dry_run(&snap, body, mapping)
    }

    fn dry_run(&self, snap: &Snapshot, body: &[u8], mapping: Option<&str>) -> Result<ValidationReport> {
        let prepared = self.prepare(snap, body, mapping)?;
        let rendered =
            render::render_template(&prepared.template, &prepared.request.inputs, snap.config.render.max_bytes)?;
        Ok(ValidationReport {
            job_id: prepared.job_id,
            idempotency_key: prepared.key,
            requires_approval: prepared.template.requires_approval,
            document: rendered.document,
            size_bytes: rendered.size_bytes,
            render_warnings: rendered.warnings,
            normalized: prepared.request,
        })
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// Gate a canonical job request directly (operator-initiated).
    pub fn create_approval(&self, lane: Lane, body: &[u8], actor: &str) -> Result<ApprovalRecord> {
        let snap = self.snapshot()?;
        let prepared = self.prepare(&snap, body, None)?;
        let rendered =
            render::render_template(&prepared.template, &prepared.request.inputs, snap.config.render.max_bytes)?;
        let payload = self.payload_for(&prepared, rendered.document);
        self.approvals.create(
            NewApproval {
                lane,
                template_id: prepared.template.id,
                payload,
            },
            actor,
            snap.approval_ttl(),
            Utc::now(),
        )
    }

    pub fn approve(&self, approval_id: &str, actor: &str, auto_execute: bool) -> Result<ApprovalDecision> {
        let record = self.approvals.approve(approval_id, actor, auto_execute, Utc::now())?;
        if !auto_execute {
            return Ok(ApprovalDecision { record, deferred: None });
        }
        match self.execute_approval(approval_id, actor) {
            Ok(record) => Ok(ApprovalDecision { record, deferred: None }),
            Err(e) if e.kind() == ErrorKind::Admission || matches!(e, GateError::DuplicatePending(_)) => {
                tracing::info!(approval_id, reason = %e.reason(), "auto-execute deferred");
                Ok(ApprovalDecision {
                    record: self.approvals.get(approval_id)?,
                    deferred: Some(e.reason()),
                })
            }
            // Another caller executed it between the approval and the claim.
            Err(GateError::InvalidTransition { .. }) => Ok(ApprovalDecision {
                record: self.approvals.get(approval_id)?,
                deferred: None,
            }),
            Err(e) => Err(e),
        }
    }

    /// Hand an approved record to the engine through the normal admission path.
    pub fn execute_approval(&self, approval_id: &str, actor: &str) -> Result<ApprovalRecord> {
        let snap = self.snapshot()?;
        let claim = self.approvals.claim_execution(approval_id, actor)?;
        let ticket = self.admission.acquire(claim.record().lane, snap.admission_wait())?;
        let result = engine::submit_with_retry(self.engine.as_ref(), &claim.record().payload, snap.retry);
        ticket.release()?;
        claim.finish(actor, result.map_err(|e| e.to_string()), Utc::now())
    }

    pub fn reject(&self, approval_id: &str, actor: &str) -> Result<ApprovalRecord> {
        self.approvals.reject(approval_id, actor, Utc::now())
    }

    pub fn get_approval(&self, approval_id: &str) -> Result<ApprovalRecord> {
        self.approvals.get(approval_id)
    }

    pub fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRecord>> {
        self.approvals.list(status)
    }

    pub fn sweep_expired(&self) -> Result<SweepReport> {
        let now = Utc::now();
        Ok(SweepReport {
            approvals_expired: self.approvals.sweep_expired(now)?,
            idempotency_purged: self.idempotency.purge_expired(now)?,
        })
    }

    // -----------------------------------------------------------------------
    // Audit, admission, config
    // -----------------------------------------------------------------------

    pub fn audit_query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        self.audit.query(query)
    }

    pub fn audit_verify(&self) -> Result<ChainReport> {
        self.audit.verify()
    }

    pub fn admission_snapshot(&self) -> Result<AdmissionSnapshot> {
        self.admission.snapshot()
    }

    /// Validate, then swap every config-derived component at once.
    pub fn reload(&self, config: Config, actor: &str) -> Result<Vec<ConfigWarning>> {
        let warnings = match config.check() {
            Ok(w) => w,
            Err(e) => {
                self.record_rejection(actor, "config.reload", "config", &e);
                return Err(e);
            }
        };
        let limits = config.admission.limits();
        let next = Arc::new(Snapshot::build(config, &self.nonces));
        self.record(AuditEvent::new(actor, "config.reload", "config", Outcome::Accepted))?;
        {
            let mut current = self
                .snapshot
                .write()
                .map_err(|_| GateError::Internal("config snapshot lock poisoned".into()))?;
            self.admission.set_limits(limits)?;
            *current = next;
        }
        tracing::info!(warnings = warnings.len(), "configuration reloaded");
        Ok(warnings)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
