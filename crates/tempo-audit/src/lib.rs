//! Correlation-scoped audit ledger for Tempo.
//!
//! Every archival run allocates a fresh correlation id; every audit record
//! written during the run carries it, and child records point at the root
//! via `parent_audit_id`, so the tree under one correlation id reconstructs
//! the causal chain of one user-visible action. Records are chained with
//! SHA-256 hashes — tampering with any stored record breaks the chain.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::time::Instant;
use tempo_store::Session;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod sanitize;

const TABLE: &str = "audit_log";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit record {0} not found")]
    NotFound(i64),
    #[error("store error: {0}")]
    Store(#[from] tempo_store::StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Started,
    InProgress,
    Success,
    Partial,
    Failure,
}

impl AuditStatus {
    /// A closed audit record must hold a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Partial | Self::Failure)
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

// ─── Record ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Option<i64>,
    pub user_id: i64,
    pub action_type: String,
    pub operation: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub status: AuditStatus,
    pub message: String,
    pub details: Value,
    pub request_data: Value,
    pub response_data: Value,
    pub duration_ms: Option<f64>,
    pub correlation_id: String,
    pub parent_audit_id: Option<i64>,
    #[serde(with = "tempo_store::utc_naive")]
    pub created_at: DateTime<Utc>,
    /// SHA-256 hex of the previous record (empty for the first record).
    pub previous_hash: String,
    /// SHA-256 hex of this record's canonical JSON.
    pub record_hash: String,
}

/// Fields of a record about to be written; the ledger fills in identity,
/// timestamps, and the hash chain.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: i64,
    pub action_type: String,
    pub operation: String,
    pub status: AuditStatus,
    pub message: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: Value,
    pub request_data: Value,
    pub response_data: Value,
    pub duration_ms: Option<f64>,
    pub correlation_id: String,
    pub parent_audit_id: Option<i64>,
}

impl AuditEntry {
    pub fn new(
        user_id: i64,
        action_type: impl Into<String>,
        operation: impl Into<String>,
        status: AuditStatus,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            action_type: action_type.into(),
            operation: operation.into(),
            status,
            message: message.into(),
            resource_type: None,
            resource_id: None,
            details: Value::Null,
            request_data: Value::Null,
            response_data: Value::Null,
            duration_ms: None,
            correlation_id: correlation_id.into(),
            parent_audit_id: None,
        }
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn parent(mut self, parent_audit_id: i64) -> Self {
        self.parent_audit_id = Some(parent_audit_id);
        self
    }
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

/// Session-backed audit ledger. All writes share the run's transactional
/// session and commit (or vanish) with it.
#[derive(Clone)]
pub struct AuditLedger {
    session: Session,
}

impl AuditLedger {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn generate_correlation_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Append one audit record, sanitizing its payloads and continuing the
    /// hash chain.
    pub fn log_operation(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let previous_hash = self.last_hash()?;
        let created_at = Utc::now();

        let details = sanitize::sanitize_value(&entry.details);
        let request_data = sanitize::sanitize_value(&entry.request_data);
        let response_data = sanitize::sanitize_value(&entry.response_data);

        let canonical = json!({
            "user_id": entry.user_id,
            "action_type": entry.action_type,
            "operation": entry.operation,
            "status": entry.status,
            "message": entry.message,
            "details": details,
            "correlation_id": entry.correlation_id,
            "parent_audit_id": entry.parent_audit_id,
            "created_at": created_at.to_rfc3339(),
            "previous_hash": previous_hash,
        });
        let record_hash = sha256_hex(&canonical.to_string());

        let mut record = AuditRecord {
            id: None,
            user_id: entry.user_id,
            action_type: entry.action_type,
            operation: entry.operation,
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            status: entry.status,
            message: entry.message,
            details,
            request_data,
            response_data,
            duration_ms: entry.duration_ms,
            correlation_id: entry.correlation_id,
            parent_audit_id: entry.parent_audit_id,
            created_at,
            previous_hash,
            record_hash,
        };

        let id = self.session.insert(TABLE, serde_json::to_value(&record)?);
        record.id = Some(id);
        debug!(
            id,
            operation = %record.operation,
            status = %record.status,
            correlation_id = %record.correlation_id,
            "audit record appended"
        );
        Ok(record)
    }

    pub fn get(&self, id: i64) -> Result<AuditRecord, AuditError> {
        let row = self
            .session
            .get(TABLE, id)
            .ok_or(AuditError::NotFound(id))?;
        let mut record: AuditRecord = serde_json::from_value(row)?;
        record.id = Some(id);
        Ok(record)
    }

    /// Update a previously written record in place (used to close `started`
    /// records). The hash chain covers records as first written.
    pub fn update<F>(&self, id: i64, mutate: F) -> Result<AuditRecord, AuditError>
    where
        F: FnOnce(&mut AuditRecord),
    {
        let mut record = self.get(id)?;
        mutate(&mut record);
        record.details = sanitize::sanitize_value(&record.details);
        record.response_data = sanitize::sanitize_value(&record.response_data);
        self.session
            .update(TABLE, id, serde_json::to_value(&record)?)?;
        Ok(record)
    }

    /// All records under one correlation id, in write order.
    pub fn list_by_correlation(&self, correlation_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| r.correlation_id == correlation_id)
            .collect())
    }

    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| r.user_id == user_id)
            .collect())
    }

    /// Verify the hash chain over every stored record, in id order.
    pub fn verify_chain(&self) -> Result<bool, AuditError> {
        let mut prev_hash = String::new();
        for record in self.all()? {
            if record.previous_hash != prev_hash {
                warn!(
                    id = record.id,
                    expected = %prev_hash,
                    got = %record.previous_hash,
                    "audit chain integrity violation"
                );
                return Ok(false);
            }
            prev_hash = record.record_hash.clone();
        }
        Ok(true)
    }

    fn last_hash(&self) -> Result<String, AuditError> {
        Ok(self
            .all()?
            .last()
            .map(|r| r.record_hash.clone())
            .unwrap_or_default())
    }

    fn all(&self) -> Result<Vec<AuditRecord>, AuditError> {
        self.session
            .scan(TABLE)
            .into_iter()
            .map(|(id, row)| {
                let mut record: AuditRecord = serde_json::from_value(row)?;
                record.id = Some(id);
                Ok(record)
            })
            .collect()
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Scoped context ──────────────────────────────────────────────────────────

/// Error shape recorded by a failed context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditFailure {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub traceback: Option<String>,
}

/// Scoped audit guard around one unit of work.
///
/// Accumulates details incrementally; exactly one terminal record is
/// written when the scope closes via [`AuditContext::succeed`] or
/// [`AuditContext::fail`]. Duration is wall-clock milliseconds from
/// construction.
pub struct AuditContext {
    ledger: AuditLedger,
    user_id: i64,
    action_type: String,
    operation: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
    correlation_id: String,
    parent_audit_id: Option<i64>,
    started: Instant,
    details: Map<String, Value>,
    request_data: Value,
    response_data: Value,
}

impl AuditContext {
    pub fn begin(
        ledger: AuditLedger,
        user_id: i64,
        action_type: impl Into<String>,
        operation: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            user_id,
            action_type: action_type.into(),
            operation: operation.into(),
            resource_type: None,
            resource_id: None,
            correlation_id: correlation_id.into(),
            parent_audit_id: None,
            started: Instant::now(),
            details: Map::new(),
            request_data: Value::Null,
            response_data: Value::Null,
        }
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_parent(mut self, parent_audit_id: i64) -> Self {
        self.parent_audit_id = Some(parent_audit_id);
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Record one detail; the value is sanitized on write so an
    /// unserializable value can never poison the closing record.
    pub fn add_detail<T: Serialize>(&mut self, key: &str, value: T) {
        self.details
            .insert(key.to_string(), sanitize::sanitize_field(&value));
    }

    pub fn set_request_data<T: Serialize>(&mut self, data: T) {
        self.request_data = sanitize::sanitize_field(&data);
    }

    pub fn set_response_data<T: Serialize>(&mut self, data: T) {
        self.response_data = sanitize::sanitize_field(&data);
    }

    pub fn update_resource(&mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
    }

    /// Close the scope with a terminal status.
    pub fn close(self, status: AuditStatus, message: Option<String>) -> Result<AuditRecord, AuditError> {
        let message = message.unwrap_or_else(|| match status {
            AuditStatus::Success => format!("Operation {} completed successfully", self.operation),
            _ => format!("Operation {} finished with status {status}", self.operation),
        });
        self.write(status, message)
    }

    /// Close the scope as a success.
    pub fn succeed(self) -> Result<AuditRecord, AuditError> {
        let message = format!("Operation {} completed successfully", self.operation);
        self.write(AuditStatus::Success, message)
    }

    /// Close the scope as a failure, recording the error shape. The caller
    /// re-raises the error itself; the context never swallows it.
    pub fn fail(mut self, failure: AuditFailure) -> Result<AuditRecord, AuditError> {
        let message = format!("Operation {} failed: {}", self.operation, failure.message);
        self.details
            .insert("error".to_string(), sanitize::sanitize_field(&failure));
        self.write(AuditStatus::Failure, message)
    }

    fn write(self, status: AuditStatus, message: String) -> Result<AuditRecord, AuditError> {
        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut entry = AuditEntry::new(
            self.user_id,
            self.action_type,
            self.operation,
            status,
            message,
            self.correlation_id,
        );
        entry.resource_type = self.resource_type;
        entry.resource_id = self.resource_id;
        entry.parent_audit_id = self.parent_audit_id;
        entry.details = Value::Object(self.details);
        entry.request_data = self.request_data;
        entry.response_data = self.response_data;
        entry.duration_ms = Some(duration_ms);
        self.ledger.log_operation(entry)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Write the opening record of a batch operation; returns its audit id.
pub fn log_batch_operation_start(
    ledger: &AuditLedger,
    user_id: i64,
    operation: &str,
    batch_size: usize,
    correlation_id: &str,
) -> Result<i64, AuditError> {
    let record = ledger.log_operation(
        AuditEntry::new(
            user_id,
            "batch_operation",
            format!("{operation}_batch_start"),
            AuditStatus::InProgress,
            format!("Started batch operation {operation} with {batch_size} items"),
            correlation_id,
        )
        .details(json!({"batch_size": batch_size, "phase": "start"})),
    )?;
    Ok(record.id.unwrap_or_default())
}

/// Write the closing record of a batch operation. Status derives from the
/// counts: all good → success, some good → partial, none → failure.
pub fn log_batch_operation_end(
    ledger: &AuditLedger,
    user_id: i64,
    operation: &str,
    parent_audit_id: i64,
    success_count: usize,
    failure_count: usize,
    correlation_id: &str,
) -> Result<AuditRecord, AuditError> {
    let total = success_count + failure_count;
    let status = if failure_count == 0 {
        AuditStatus::Success
    } else if success_count > 0 {
        AuditStatus::Partial
    } else {
        AuditStatus::Failure
    };
    ledger.log_operation(
        AuditEntry::new(
            user_id,
            "batch_operation",
            format!("{operation}_batch_end"),
            status,
            format!("Completed batch operation {operation}: {success_count}/{total} successful"),
            correlation_id,
        )
        .parent(parent_audit_id)
        .details(json!({
            "success_count": success_count,
            "failure_count": failure_count,
            "total_count": total,
            "phase": "end",
        })),
    )
}

/// Record a data modification with the `{key: {old, new}}` diff of every
/// changed field.
pub fn log_data_modification(
    ledger: &AuditLedger,
    user_id: i64,
    operation: &str,
    resource_type: &str,
    resource_id: &str,
    old_values: &Map<String, Value>,
    new_values: &Map<String, Value>,
    correlation_id: &str,
) -> Result<AuditRecord, AuditError> {
    let mut changes = Map::new();
    let keys: std::collections::BTreeSet<&String> =
        old_values.keys().chain(new_values.keys()).collect();
    for key in keys {
        let old = old_values.get(key).cloned().unwrap_or(Value::Null);
        let new = new_values.get(key).cloned().unwrap_or(Value::Null);
        if old != new {
            changes.insert(key.clone(), json!({"old": old, "new": new}));
        }
    }
    let fields: Vec<&String> = changes.keys().collect();
    let message = format!(
        "Modified {resource_type} {resource_id}: {} fields changed",
        changes.len()
    );
    let details = json!({
        "changes": changes,
        "fields_modified": fields,
    });
    ledger.log_operation(
        AuditEntry::new(
            user_id,
            "data_modification",
            operation,
            AuditStatus::Success,
            message,
            correlation_id,
        )
        .resource(resource_type, resource_id)
        .details(details),
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_store::Database;

    fn ledger() -> AuditLedger {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path());
        AuditLedger::new(db.begin())
    }

    #[test]
    fn test_log_operation_and_get() {
        let ledger = ledger();
        let record = ledger
            .log_operation(AuditEntry::new(
                1,
                "archive",
                "calendar_archive",
                AuditStatus::Started,
                "Started",
                "corr-1",
            ))
            .expect("log");
        let id = record.id.expect("id");
        let fetched = ledger.get(id).expect("get");
        assert_eq!(fetched.operation, "calendar_archive");
        assert_eq!(fetched.status, AuditStatus::Started);
    }

    #[test]
    fn test_chain_integrity() {
        let ledger = ledger();
        for i in 0..5 {
            ledger
                .log_operation(AuditEntry::new(
                    1,
                    "archive",
                    format!("op-{i}"),
                    AuditStatus::Success,
                    "ok",
                    "corr-1",
                ))
                .expect("log");
        }
        assert!(ledger.verify_chain().expect("verify"));
    }

    #[test]
    fn test_chain_detects_tampering() {
        let ledger = ledger();
        ledger
            .log_operation(AuditEntry::new(
                1,
                "archive",
                "op-a",
                AuditStatus::Success,
                "ok",
                "corr-1",
            ))
            .expect("log");
        let second = ledger
            .log_operation(AuditEntry::new(
                1,
                "archive",
                "op-b",
                AuditStatus::Success,
                "ok",
                "corr-1",
            ))
            .expect("log");

        // Break the chain by rewriting the second record's previous hash.
        ledger
            .update(second.id.unwrap(), |r| {
                r.previous_hash = "0000".to_string();
            })
            .expect("update");
        assert!(!ledger.verify_chain().expect("verify"));
    }

    #[test]
    fn test_correlation_listing_in_write_order() {
        let ledger = ledger();
        for op in ["first", "second", "third"] {
            ledger
                .log_operation(AuditEntry::new(
                    1,
                    "archive",
                    op,
                    AuditStatus::Success,
                    "ok",
                    "corr-x",
                ))
                .expect("log");
        }
        ledger
            .log_operation(AuditEntry::new(
                1,
                "archive",
                "other",
                AuditStatus::Success,
                "ok",
                "corr-y",
            ))
            .expect("log");

        let records = ledger.list_by_correlation("corr-x").expect("list");
        let ops: Vec<&str> = records.iter().map(|r| r.operation.as_str()).collect();
        assert_eq!(ops, ["first", "second", "third"]);
    }

    #[test]
    fn test_context_success_writes_one_terminal_record() {
        let ledger = ledger();
        let mut ctx = AuditContext::begin(ledger.clone(), 1, "archive", "calendar_archive", "corr-1")
            .with_resource("calendar", "msgraph://calendars/primary");
        ctx.add_detail("phase", "fetching");
        ctx.add_detail("initial_appointment_count", 12);
        let record = ctx.succeed().expect("succeed");

        assert_eq!(record.status, AuditStatus::Success);
        assert!(record.status.is_terminal());
        assert_eq!(record.details["initial_appointment_count"], 12);
        assert!(record.duration_ms.is_some());
        assert_eq!(ledger.list_by_correlation("corr-1").expect("list").len(), 1);
    }

    #[test]
    fn test_context_failure_records_error_shape() {
        let ledger = ledger();
        let ctx = AuditContext::begin(ledger.clone(), 1, "archive", "calendar_archive", "corr-1");
        let record = ctx
            .fail(AuditFailure {
                error_type: "RepoError".to_string(),
                message: "fetch failed".to_string(),
                traceback: None,
            })
            .expect("fail");

        assert_eq!(record.status, AuditStatus::Failure);
        assert_eq!(record.details["error"]["type"], "RepoError");
        assert!(record.message.contains("fetch failed"));
    }

    #[test]
    fn test_batch_helpers_status() {
        let ledger = ledger();
        let parent = log_batch_operation_start(&ledger, 1, "archive_add", 10, "corr-1").expect("start");

        let end = log_batch_operation_end(&ledger, 1, "archive_add", parent, 7, 3, "corr-1")
            .expect("end");
        assert_eq!(end.status, AuditStatus::Partial);
        assert_eq!(end.parent_audit_id, Some(parent));

        let all_good = log_batch_operation_end(&ledger, 1, "archive_add", parent, 5, 0, "corr-1")
            .expect("end");
        assert_eq!(all_good.status, AuditStatus::Success);

        let all_bad = log_batch_operation_end(&ledger, 1, "archive_add", parent, 0, 4, "corr-1")
            .expect("end");
        assert_eq!(all_bad.status, AuditStatus::Failure);
    }

    #[test]
    fn test_data_modification_diff() {
        let ledger = ledger();
        let old = json!({"sensitivity": "normal", "subject": "Standup"});
        let new = json!({"sensitivity": "private", "subject": "Standup"});
        let record = log_data_modification(
            &ledger,
            1,
            "privacy_automation",
            "appointment",
            "42",
            old.as_object().unwrap(),
            new.as_object().unwrap(),
            "corr-1",
        )
        .expect("log");

        assert_eq!(record.details["changes"]["sensitivity"]["old"], "normal");
        assert_eq!(record.details["changes"]["sensitivity"]["new"], "private");
        assert!(record.details["changes"].get("subject").is_none());
    }

    #[test]
    fn test_generate_correlation_id_unique() {
        assert_ne!(
            AuditLedger::generate_correlation_id(),
            AuditLedger::generate_correlation_id()
        );
    }
}
