//! Security audit trail
//!
//! NIST 800-53: AU-2 (Audit Events), AU-3 (Content of Audit Records), AU-12 (Audit Generation)
//! STIG: V-222648 (Audit Records)
//! Implementation: Append-only entries fanned out to pluggable sinks. Recording
//! never fails the triggering operation; sink failures are counted and dropped.

use crate::config::AuditConfig;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Operation tag of an audit entry
///
/// NIST 800-53: AU-2 (Audit Events)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    /// Login accepted
    LoginSuccess,
    /// Login rejected
    LoginFailure,
    /// Login rejected because the key is locked out
    AccountLocked,
    /// Session ended
    Logout,
    /// Token introspection
    TokenValidation,
    /// File search
    Search,
    /// Content search
    ContentSearch,
    /// File download
    Download,
    /// File upload
    Upload,
    /// Capability summary
    Status,
    /// Traversal, excluded path, forged token or denied operation
    SecurityViolation,
}

impl AuditOperation {
    /// Wire form of the tag
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailure => "LOGIN_FAILURE",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::Logout => "LOGOUT",
            Self::TokenValidation => "TOKEN_VALIDATION",
            Self::Search => "SEARCH",
            Self::ContentSearch => "CONTENT_SEARCH",
            Self::Download => "DOWNLOAD",
            Self::Upload => "UPLOAD",
            Self::Status => "STATUS",
            Self::SecurityViolation => "SECURITY_VIOLATION",
        }
    }
}

/// An immutable audit record
///
/// NIST 800-53: AU-3 (Content of Audit Records)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Entry id
    pub id: uuid::Uuid,
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Acting identity; absent before authentication
    pub identity: Option<String>,
    /// Operation tag
    pub operation: AuditOperation,
    /// Target resource (path, identity, endpoint)
    pub resource: String,
    /// Outcome
    pub success: bool,
    /// Free-text detail; full error text for failures
    pub detail: String,
    /// Client origin address
    pub origin: String,
    /// Session token id
    pub session_id: Option<String>,
}

impl AuditEntry {
    /// Start an entry for `operation` from `origin`
    pub fn new(operation: AuditOperation, origin: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            identity: None,
            operation,
            resource: String::new(),
            success: false,
            detail: String::new(),
            origin: origin.into(),
            session_id: None,
        }
    }

    /// Set the acting identity
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the target resource
    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Set the session id
    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Mark as succeeded with detail
    #[must_use]
    pub fn succeeded(mut self, detail: impl Into<String>) -> Self {
        self.success = true;
        self.detail = detail.into();
        self
    }

    /// Mark as failed with detail
    #[must_use]
    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.success = false;
        self.detail = detail.into();
        self
    }
}

/// Destination for audit entries
pub trait AuditSink: Send + Sync {
    /// Sink name for diagnostics
    fn name(&self) -> &'static str;

    /// Persist one entry
    ///
    /// # Errors
    ///
    /// Any I/O failure; the caller counts it as a dropped write
    fn write(&self, entry: &AuditEntry) -> std::io::Result<()>;
}

/// Emits entries as structured tracing events
///
/// NIST 800-53: AU-12 (Audit Generation)
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let identity = entry.identity.as_deref().unwrap_or("-");
        let session = entry.session_id.as_deref().unwrap_or("-");
        if entry.success {
            info!(
                event = "audit",
                operation = entry.operation.as_str(),
                identity,
                origin = %entry.origin,
                resource = %entry.resource,
                session,
                success = true,
                detail = %entry.detail,
                "Audit event"
            );
        } else {
            warn!(
                event = "audit",
                operation = entry.operation.as_str(),
                identity,
                origin = %entry.origin,
                resource = %entry.resource,
                session,
                success = false,
                detail = %entry.detail,
                "Audit event"
            );
        }
        Ok(())
    }
}

/// Appends entries as JSON lines
///
/// NIST 800-53: AU-9 (Protection of Audit Information)
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    file: Mutex<File>,
}

impl JsonLinesAuditSink {
    /// Open `path` for appending, creating it if needed
    ///
    /// # Errors
    ///
    /// `Error::Io` if the file cannot be opened
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn name(&self) -> &'static str {
        "json-lines"
    }

    fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("audit file lock poisoned"))?;
        file.write_all(&line)?;
        file.flush()
    }
}

/// Keeps the most recent entries in memory
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl MemoryAuditSink {
    /// Retain at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Snapshot, oldest first
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| std::io::Error::other("audit buffer lock poisoned"))?;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        Ok(())
    }
}

/// Counters exposed by the status endpoint
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    /// Entries recorded
    pub recorded: u64,
    /// Sink writes that failed
    pub dropped: u64,
}

/// Audit log fan-out
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
    memory: Option<Arc<MemoryAuditSink>>,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl AuditLog {
    /// Audit log with only the tracing sink
    pub fn new() -> Self {
        Self {
            sinks: vec![Arc::new(TracingAuditSink)],
            memory: None,
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Build the sinks named in configuration
    ///
    /// # Errors
    ///
    /// `Error::Io` if the JSON lines file cannot be opened
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        let mut log = Self::new();
        if let Some(path) = &config.json_file {
            log = log.with_sink(Arc::new(JsonLinesAuditSink::open(path)?));
        }
        if config.memory_capacity > 0 {
            log = log.with_memory(config.memory_capacity);
        }
        Ok(log)
    }

    /// Add a sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Add a bounded in-memory sink
    #[must_use]
    pub fn with_memory(mut self, capacity: usize) -> Self {
        let memory = Arc::new(MemoryAuditSink::new(capacity));
        self.sinks.push(Arc::clone(&memory) as Arc<dyn AuditSink>);
        self.memory = Some(memory);
        self
    }

    /// Record an entry
    ///
    /// NIST 800-53: AU-12 (Audit Generation)
    pub fn record(&self, entry: AuditEntry) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        for sink in &self.sinks {
            if let Err(e) = sink.write(&entry) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = "audit_write_failed",
                    sink = sink.name(),
                    error = %e,
                    "Audit sink write failed"
                );
            }
        }
    }

    /// Entries held by the in-memory sink, oldest first
    pub fn recent(&self) -> Vec<AuditEntry> {
        self.memory.as_ref().map(|m| m.entries()).unwrap_or_default()
    }

    /// Current counters
    pub fn stats(&self) -> AuditStats {
        AuditStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
