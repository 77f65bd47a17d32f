//! Hash-chained, append-only audit trail.
//!
//! One dedicated writer thread owns the chain head and the sink. Callers
//! send commands over a bounded channel and block on a per-call reply, so
//! appends are totally ordered by `seq` without any lock shared with the
//! rest of the pipeline.
//!
//! `this_hash = sha256(prev_hash || jcs(entry without hashes))`. The first
//! entry links to [`GENESIS_HASH`]. A trail whose stored chain does not
//! verify refuses to open, and a failed write poisons the trail so no
//! disconnected chain can ever be started behind it. A file trail holds an
//! exclusive advisory lock for its whole life: one writer per file.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::canonical::{self, GENESIS_HASH};
use crate::error::{GateError, Result};
use crate::io;

const QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_QUERY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
    Failed,
    Recorded,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Rejected => "rejected",
            Outcome::Failed => "failed",
            Outcome::Recorded => "recorded",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asks to record. The trail assigns `seq`, time and hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub subject_id: String,
    pub outcome: Outcome,
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        subject_id: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            subject_id: subject_id.into(),
            outcome,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub subject_id: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub prev_hash: String,
    pub this_hash: String,
}

#[derive(Serialize)]
struct HashedBody<'a> {
    seq: u64,
    timestamp: &'a DateTime<Utc>,
    actor: &'a str,
    action: &'a str,
    subject_id: &'a str,
    outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

impl AuditEntry {
    pub fn compute_hash(&self) -> Result<String> {
        let body = canonical::canonical_bytes(&HashedBody {
            seq: self.seq,
            timestamp: &self.timestamp,
            actor: &self.actor,
            action: &self.action,
            subject_id: &self.subject_id,
            outcome: self.outcome,
            reason: self.reason.as_deref(),
        })?;
        Ok(canonical::chain_hash(&self.prev_hash, &body))
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub entries: u64,
    pub head_seq: u64,
    pub head_hash: String,
}

impl ChainReport {
    fn genesis() -> Self {
        Self {
            entries: 0,
            head_seq: 0,
            head_hash: GENESIS_HASH.to_string(),
        }
    }
}

/// Recompute the chain front to back.
pub fn verify_entries(entries: &[AuditEntry]) -> Result<ChainReport> {
    let mut report = ChainReport::genesis();
    for entry in entries {
        let expected_seq = report.head_seq + 1;
        if entry.seq != expected_seq {
            return Err(GateError::AuditChainBroken {
                seq: entry.seq,
                detail: format!("expected seq {expected_seq}"),
            });
        }
        if entry.prev_hash != report.head_hash {
            return Err(GateError::AuditChainBroken {
                seq: entry.seq,
                detail: "prev_hash does not match the preceding entry".into(),
            });
        }
        if entry.compute_hash()? != entry.this_hash {
            return Err(GateError::AuditChainBroken {
                seq: entry.seq,
                detail: "stored hash does not match recomputed hash".into(),
            });
        }
        report.entries += 1;
        report.head_seq = entry.seq;
        report.head_hash = entry.this_hash.clone();
    }
    Ok(report)
}

/// Verify a trail file without opening it for writing.
pub fn verify_file(path: &Path) -> Result<ChainReport> {
    verify_entries(&read_entries(path)?)
}

/// Every entry in a trail file, oldest first. A missing file is an empty trail.
pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry =
            serde_json::from_str(&line).map_err(|e| GateError::AuditChainBroken {
                seq: i as u64 + 1,
                detail: format!("unparseable line {}: {e}", i + 1),
            })?;
        entries.push(entry);
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Durable storage behind the writer thread.
pub trait AuditSink: Send + 'static {
    fn persist(&mut self, entry: &AuditEntry) -> Result<()>;
    fn entries(&self) -> Result<Vec<AuditEntry>>;
}

/// JSON Lines file, one entry per line, synced before the append returns.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            io::ensure_dir(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        file.try_lock_exclusive().map_err(|e| {
            GateError::AuditUnavailable(format!(
                "{} is locked by another writer ({e}); stop the running gateway or use its admin API",
                path.display()
            ))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl AuditSink for FileSink {
    fn persist(&mut self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_vec(entry)?;
        io::append_line_synced(&mut self.file, &line)
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        read_entries(&self.path)
    }
}

#[derive(Default)]
pub struct MemorySink {
    entries: Vec<AuditEntry>,
}

impl AuditSink for MemorySink {
    fn persist(&mut self, entry: &AuditEntry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.clone())
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
}

impl AuditQuery {
    fn matches(&self, e: &AuditEntry) -> bool {
        self.action.as_deref().map_or(true, |a| e.action == a)
            && self.actor.as_deref().map_or(true, |a| e.actor == a)
            && self.subject_id.as_deref().map_or(true, |s| e.subject_id == s)
    }

    /// Newest first.
    pub fn apply(&self, entries: Vec<AuditEntry>) -> Vec<AuditEntry> {
        entries
            .into_iter()
            .rev()
            .filter(|e| self.matches(e))
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

type Reply<T> = mpsc::Sender<Result<T>>;

enum Command {
    Append(AuditEvent, Reply<AuditEntry>),
    Query(AuditQuery, Reply<Vec<AuditEntry>>),
    Verify(Reply<ChainReport>),
    Head(Reply<ChainReport>),
}

struct Writer {
    sink: Box<dyn AuditSink>,
    head: ChainReport,
    poisoned: Option<String>,
}

impl Writer {
    fn run(mut self, rx: mpsc::Receiver<Command>) {
        for cmd in rx {
            match cmd {
                Command::Append(event, reply) => {
                    let _ = reply.send(self.append(event));
                }
                Command::Query(q, reply) => {
                    let _ = reply.send(self.sink.entries().map(|all| q.apply(all)));
                }
                Command::Verify(reply) => {
                    let _ = reply.send(self.sink.entries().and_then(|all| verify_entries(&all)));
                }
                Command::Head(reply) => {
                    let _ = reply.send(Ok(self.head.clone()));
                }
            }
        }
        tracing::debug!("audit writer stopped");
    }

    fn append(&mut self, event: AuditEvent) -> Result<AuditEntry> {
        if let Some(why) = &self.poisoned {
            return Err(GateError::AuditUnavailable(why.clone()));
        }
        let mut entry = AuditEntry {
            seq: self.head.head_seq + 1,
            timestamp: Utc::now(),
            actor: event.actor,
            action: event.action,
            subject_id: event.subject_id,
            outcome: event.outcome,
            reason: event.reason,
            prev_hash: self.head.head_hash.clone(),
            this_hash: String::new(),
        };
        entry.this_hash = entry.compute_hash()?;

        if let Err(e) = self.sink.persist(&entry) {
            tracing::error!(seq = entry.seq, error = %e, "audit write failed, trail is now closed");
            let why = format!("write of seq {} failed: {e}", entry.seq);
            self.poisoned = Some(why.clone());
            return Err(GateError::AuditUnavailable(why));
        }

        self.head.entries += 1;
        self.head.head_seq = entry.seq;
        self.head.head_hash = entry.this_hash.clone();
        tracing::debug!(seq = entry.seq, action = %entry.action, "audit entry appended");
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// AuditTrail
// ---------------------------------------------------------------------------

/// Handle to the writer thread. Share it behind an `Arc`. Dropping it stops
/// the thread and waits for it, so the sink (and any file lock) is released
/// before `drop` returns.
pub struct AuditTrail {
    tx: Option<mpsc::SyncSender<Command>>,
    writer: Option<JoinHandle<()>>,
}

impl AuditTrail {
    /// Open (or create) the JSONL trail at `path`, verifying the stored
    /// chain first.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_sink(Box::new(FileSink::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_sink(Box::new(MemorySink::default()))
    }

    pub fn with_sink(sink: Box<dyn AuditSink>) -> Result<Self> {
        let head = verify_entries(&sink.entries()?)?;
        tracing::info!(entries = head.entries, seq = head.head_seq, "audit trail opened");

        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let writer = Writer {
            sink,
            head,
            poisoned: None,
        };
        let handle = std::thread::Builder::new()
            .name("hookgate-audit".into())
            .spawn(move || writer.run(rx))?;
        Ok(Self {
            tx: Some(tx),
            writer: Some(handle),
        })
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .as_ref()
            .ok_or_else(|| GateError::AuditUnavailable("audit writer stopped".into()))?
            .send(make(reply_tx))
            .map_err(|_| GateError::AuditUnavailable("audit writer stopped".into()))?;
        reply_rx
            .recv()
            .map_err(|_| GateError::AuditUnavailable("audit writer dropped the reply".into()))?
    }

    pub fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
        self.call(|reply| Command::Append(event, reply))
    }

    pub fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        self.call(|reply| Command::Query(query, reply))
    }

    /// Re-read storage and recompute every hash.
    pub fn verify(&self) -> Result<ChainReport> {
        self.call(Command::Verify)
    }

    pub fn head(&self) -> Result<ChainReport> {
        self.call(Command::Head)
    }
}

impl Drop for AuditTrail {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.writer.take() {
            if handle.join().is_err() {
                tracing::error!("audit writer panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
