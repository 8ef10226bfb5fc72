//! Reversible-operation ledger for Tempo.
//!
//! Every side-effectful archive step records, per affected item, enough
//! before-state to undo it. The ledger checks dependencies and ownership
//! before reversing, supports dry-run, and drives the action-specific
//! reversers while capturing per-item failures instead of aborting.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempo_audit::{sanitize, AuditEntry, AuditLedger, AuditStatus};
use tempo_store::Session;
use tracing::{debug, warn};

const OPERATIONS_TABLE: &str = "reversible_operations";
const ITEMS_TABLE: &str = "reversible_operation_items";

/// Reason recorded when a failed run leaves the ledger unable to reverse.
pub const REASON_OPERATION_FAILED: &str = "Operation failed - cannot reverse";
/// Reason recorded when a cancelled run leaves the ledger unable to reverse.
pub const REASON_OPERATION_CANCELLED: &str = "Operation cancelled mid-flight";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("reversible operation {0} not found")]
    NotFound(i64),
    #[error("operation item {0} not found")]
    ItemNotFound(i64),
    #[error("dependency cycle: operation {dependent} already reaches {prerequisite}")]
    DependencyCycle { dependent: i64, prerequisite: i64 },
    #[error("store error: {0}")]
    Store(#[from] tempo_store::StoreError),
    #[error("audit error: {0}")]
    Audit(#[from] tempo_audit::AuditError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ─── Models ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReverseAction {
    /// Recreate the item from `before_state`.
    Restore,
    /// Remove the item this operation created.
    Delete,
    /// Write `before_state` back over the current state.
    Update,
}

impl std::fmt::Display for ReverseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Restore => "restore",
            Self::Delete => "delete",
            Self::Update => "update",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversibleOperation {
    pub id: Option<i64>,
    pub audit_log_id: i64,
    pub user_id: i64,
    pub operation_type: String,
    pub operation_name: String,
    pub correlation_id: String,
    /// Operations this one builds on.
    pub depends_on: Vec<i64>,
    /// Operations that build on this one; all must be reversed first.
    pub blocks: Vec<i64>,
    pub is_reversible: bool,
    pub is_reversed: bool,
    pub reverse_reason: Option<String>,
    #[serde(with = "tempo_store::utc_naive::option")]
    pub reversed_at: Option<DateTime<Utc>>,
    pub reversed_by_user_id: Option<i64>,
    #[serde(with = "tempo_store::utc_naive")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversibleOperationItem {
    pub id: Option<i64>,
    pub operation_id: i64,
    pub item_type: String,
    pub item_id: String,
    pub external_id: Option<String>,
    pub before_state: Value,
    pub after_state: Option<Value>,
    pub reverse_action: ReverseAction,
    pub reverse_data: Value,
    pub is_reversed: bool,
    #[serde(with = "tempo_store::utc_naive::option")]
    pub reversed_at: Option<DateTime<Utc>>,
    pub reverse_error: Option<String>,
}

// ─── Reverse outcome ─────────────────────────────────────────────────────────

/// Result shape of a reverse request. Fields are populated per path:
/// dry-run fills the `items_to_reverse`/`reverse_actions` pair, a real
/// reversal fills the counters, refusals fill `reasons` or `error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReverseOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_to_reverse: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_actions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversed_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasons: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReverseOutcome {
    fn refused(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

// ─── Item reverser ───────────────────────────────────────────────────────────

/// Action-specific reversal, implemented over the appointment repositories
/// by the archive layer. Per-item failures are reported as strings and
/// never abort the surrounding reversal.
#[async_trait]
pub trait ItemReverser: Send + Sync {
    async fn restore(&self, item: &ReversibleOperationItem) -> Result<(), String>;
    async fn delete(&self, item: &ReversibleOperationItem) -> Result<(), String>;
    async fn update(&self, item: &ReversibleOperationItem) -> Result<(), String>;
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ReversibleLedger {
    session: Session,
    audit: AuditLedger,
}

impl ReversibleLedger {
    pub fn new(session: Session, audit: AuditLedger) -> Self {
        Self { session, audit }
    }

    /// Start a reversible operation: allocate a correlation id if absent,
    /// write the `started` audit record, create the operation row.
    pub fn start_operation(
        &self,
        user_id: i64,
        operation_type: &str,
        operation_name: &str,
        correlation_id: Option<String>,
        depends_on: Vec<i64>,
    ) -> Result<ReversibleOperation, LedgerError> {
        let correlation_id = correlation_id.unwrap_or_else(AuditLedger::generate_correlation_id);

        let audit_record = self.audit.log_operation(AuditEntry::new(
            user_id,
            operation_type,
            operation_name,
            AuditStatus::Started,
            format!("Started reversible operation: {operation_name}"),
            correlation_id.clone(),
        ))?;

        let mut operation = ReversibleOperation {
            id: None,
            audit_log_id: audit_record.id.unwrap_or_default(),
            user_id,
            operation_type: operation_type.to_string(),
            operation_name: operation_name.to_string(),
            correlation_id,
            depends_on: depends_on.clone(),
            blocks: Vec::new(),
            is_reversible: true,
            is_reversed: false,
            reverse_reason: None,
            reversed_at: None,
            reversed_by_user_id: None,
            created_at: Utc::now(),
        };
        let id = self
            .session
            .insert(OPERATIONS_TABLE, serde_json::to_value(&operation)?);
        operation.id = Some(id);

        // Wire the reverse edges of declared dependencies.
        for prerequisite in depends_on {
            if let Ok(mut pre) = self.get_operation(prerequisite) {
                if !pre.blocks.contains(&id) {
                    pre.blocks.push(id);
                    self.put_operation(&pre)?;
                }
            }
        }

        debug!(id, operation_name, "reversible operation started");
        Ok(operation)
    }

    /// Declare that `dependent` builds on `prerequisite`; reversing the
    /// prerequisite then requires the dependent to be reversed first.
    /// Rejects edges that would close a cycle.
    pub fn add_dependency(&self, dependent: i64, prerequisite: i64) -> Result<(), LedgerError> {
        if dependent == prerequisite || self.reaches(prerequisite, dependent)? {
            return Err(LedgerError::DependencyCycle {
                dependent,
                prerequisite,
            });
        }
        let mut dep = self.get_operation(dependent)?;
        if !dep.depends_on.contains(&prerequisite) {
            dep.depends_on.push(prerequisite);
            self.put_operation(&dep)?;
        }
        let mut pre = self.get_operation(prerequisite)?;
        if !pre.blocks.contains(&dependent) {
            pre.blocks.push(dependent);
            self.put_operation(&pre)?;
        }
        Ok(())
    }

    /// Whether `from` reaches `target` along `depends_on` edges.
    fn reaches(&self, from: i64, target: i64) -> Result<bool, LedgerError> {
        let mut stack = vec![from];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return Ok(true);
            }
            if !seen.insert(current) {
                continue;
            }
            if let Ok(op) = self.get_operation(current) {
                stack.extend(op.depends_on.iter().copied());
            }
        }
        Ok(false)
    }

    /// Snapshot one item's observable state before it is mutated.
    pub fn capture_item(
        &self,
        operation: &ReversibleOperation,
        item_type: &str,
        item_id: &str,
        before_state: Value,
        reverse_action: ReverseAction,
        reverse_data: Value,
        external_id: Option<String>,
    ) -> Result<ReversibleOperationItem, LedgerError> {
        let mut item = ReversibleOperationItem {
            id: None,
            operation_id: operation.id.unwrap_or_default(),
            item_type: item_type.to_string(),
            item_id: item_id.to_string(),
            external_id,
            before_state: sanitize::sanitize_value(&before_state),
            after_state: None,
            reverse_action,
            reverse_data: sanitize::sanitize_value(&reverse_data),
            is_reversed: false,
            reversed_at: None,
            reverse_error: None,
        };
        let id = self.session.insert(ITEMS_TABLE, serde_json::to_value(&item)?);
        item.id = Some(id);
        Ok(item)
    }

    /// Record an item's state after the operation completed.
    pub fn set_after_state(&self, item_id: i64, after_state: Value) -> Result<(), LedgerError> {
        let mut item = self.get_item(item_id)?;
        item.after_state = Some(sanitize::sanitize_value(&after_state));
        self.put_item(&item)
    }

    /// Close the wrapping operation: the `started` audit record gets its
    /// terminal status, and a failed operation becomes non-reversible.
    pub fn complete_operation(
        &self,
        operation_id: i64,
        status: AuditStatus,
        message: &str,
        response_data: Value,
        duration_ms: Option<f64>,
    ) -> Result<(), LedgerError> {
        let operation = self.get_operation(operation_id)?;
        self.audit.update(operation.audit_log_id, |record| {
            record.status = status;
            record.message = message.to_string();
            record.response_data = response_data.clone();
            record.duration_ms = duration_ms;
        })?;

        if status == AuditStatus::Failure {
            self.mark_not_reversible(operation_id, REASON_OPERATION_FAILED)?;
        }
        Ok(())
    }

    /// Persist the trace of a failed or cancelled run after its session was
    /// rolled back: a non-reversible operation row pointing at the failure
    /// audit record.
    pub fn record_failed_operation(
        &self,
        user_id: i64,
        operation_type: &str,
        operation_name: &str,
        correlation_id: &str,
        audit_log_id: i64,
        reason: &str,
    ) -> Result<ReversibleOperation, LedgerError> {
        let mut operation = ReversibleOperation {
            id: None,
            audit_log_id,
            user_id,
            operation_type: operation_type.to_string(),
            operation_name: operation_name.to_string(),
            correlation_id: correlation_id.to_string(),
            depends_on: Vec::new(),
            blocks: Vec::new(),
            is_reversible: false,
            is_reversed: false,
            reverse_reason: Some(reason.to_string()),
            reversed_at: None,
            reversed_by_user_id: None,
            created_at: Utc::now(),
        };
        let id = self
            .session
            .insert(OPERATIONS_TABLE, serde_json::to_value(&operation)?);
        operation.id = Some(id);
        Ok(operation)
    }

    pub fn mark_not_reversible(&self, operation_id: i64, reason: &str) -> Result<(), LedgerError> {
        let mut operation = self.get_operation(operation_id)?;
        operation.is_reversible = false;
        operation.reverse_reason = Some(reason.to_string());
        self.put_operation(&operation)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn get_operation(&self, id: i64) -> Result<ReversibleOperation, LedgerError> {
        let row = self
            .session
            .get(OPERATIONS_TABLE, id)
            .ok_or(LedgerError::NotFound(id))?;
        let mut op: ReversibleOperation = serde_json::from_value(row)?;
        op.id = Some(id);
        Ok(op)
    }

    pub fn get_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<ReversibleOperation>, LedgerError> {
        Ok(self
            .all_operations()?
            .into_iter()
            .filter(|op| op.correlation_id == correlation_id)
            .collect())
    }

    /// Filtered, newest-first listing.
    pub fn list_operations(
        &self,
        user_id: Option<i64>,
        operation_type: Option<&str>,
        is_reversed: Option<bool>,
        limit: Option<usize>,
    ) -> Result<Vec<ReversibleOperation>, LedgerError> {
        let mut ops: Vec<ReversibleOperation> = self
            .all_operations()?
            .into_iter()
            .filter(|op| user_id.is_none_or(|u| op.user_id == u))
            .filter(|op| operation_type.is_none_or(|t| op.operation_type == t))
            .filter(|op| is_reversed.is_none_or(|r| op.is_reversed == r))
            .collect();
        ops.reverse();
        if let Some(limit) = limit {
            ops.truncate(limit);
        }
        Ok(ops)
    }

    pub fn items_for(&self, operation_id: i64) -> Result<Vec<ReversibleOperationItem>, LedgerError> {
        let mut items = Vec::new();
        for (id, row) in self.session.scan(ITEMS_TABLE) {
            let mut item: ReversibleOperationItem = serde_json::from_value(row)?;
            item.id = Some(id);
            if item.operation_id == operation_id {
                items.push(item);
            }
        }
        Ok(items)
    }

    // ── Dependency check ────────────────────────────────────────────────────

    /// Whether the operation can be reversed, with the blocking reasons.
    pub fn check_dependencies(
        &self,
        operation: &ReversibleOperation,
    ) -> Result<(bool, Vec<String>), LedgerError> {
        let mut reasons = Vec::new();

        if operation.is_reversed {
            reasons.push("Operation has already been reversed".to_string());
        }
        if !operation.is_reversible {
            reasons.push(format!(
                "Operation is not reversible: {}",
                operation.reverse_reason.as_deref().unwrap_or("no reason recorded")
            ));
        }

        let mut unreversed_dependents = Vec::new();
        for blocked_id in &operation.blocks {
            if let Ok(dependent) = self.get_operation(*blocked_id) {
                if !dependent.is_reversed {
                    unreversed_dependents.push(dependent.operation_name);
                }
            }
        }
        if !unreversed_dependents.is_empty() {
            reasons.push(format!(
                "Dependent operations must be reversed first: {}",
                unreversed_dependents.join(", ")
            ));
        }

        Ok((reasons.is_empty(), reasons))
    }

    // ── Reverse driver ──────────────────────────────────────────────────────

    /// Reverse a completed operation.
    ///
    /// Only the owning user may reverse; a cross-user request is refused
    /// before the operation is inspected further. Per-item failures are
    /// recorded on the item and never abort the loop: all-good marks the
    /// operation reversed with a `success` audit child, anything less closes
    /// as `partial`.
    pub async fn reverse_operation(
        &self,
        operation_id: i64,
        reversed_by_user_id: i64,
        reason: &str,
        dry_run: bool,
        reverser: &dyn ItemReverser,
    ) -> Result<ReverseOutcome, LedgerError> {
        let Ok(operation) = self.get_operation(operation_id) else {
            return Ok(ReverseOutcome::refused("Operation not found"));
        };

        if operation.user_id != reversed_by_user_id {
            return Ok(ReverseOutcome::refused(format!(
                "User {reversed_by_user_id} is not the owner of operation {operation_id}"
            )));
        }

        let (can_reverse, reasons) = self.check_dependencies(&operation)?;
        if !can_reverse {
            return Ok(ReverseOutcome {
                success: false,
                error: Some("Cannot reverse operation".to_string()),
                reasons: Some(reasons),
                ..ReverseOutcome::default()
            });
        }

        let items = self.items_for(operation_id)?;

        if dry_run {
            return Ok(ReverseOutcome {
                success: true,
                dry_run: Some(true),
                items_to_reverse: Some(items.len()),
                reverse_actions: Some(items.iter().map(|i| i.reverse_action.to_string()).collect()),
                ..ReverseOutcome::default()
            });
        }

        let reversal_audit = self.audit.log_operation(
            AuditEntry::new(
                reversed_by_user_id,
                "reverse",
                format!("reverse_{}", operation.operation_name),
                AuditStatus::Started,
                format!("Started reversal of operation {operation_id}: {reason}"),
                operation.correlation_id.clone(),
            )
            .parent(operation.audit_log_id),
        )?;

        let mut reversed_items = 0usize;
        let mut failed_items = 0usize;
        let mut errors = Vec::new();

        for mut item in items {
            let result = match item.reverse_action {
                ReverseAction::Restore => reverser.restore(&item).await,
                ReverseAction::Delete => reverser.delete(&item).await,
                ReverseAction::Update => reverser.update(&item).await,
            };
            match result {
                Ok(()) => {
                    item.is_reversed = true;
                    item.reversed_at = Some(Utc::now());
                    reversed_items += 1;
                }
                Err(e) => {
                    warn!(
                        item_type = %item.item_type,
                        item_id = %item.item_id,
                        error = %e,
                        "item reversal failed"
                    );
                    item.reverse_error = Some(e.clone());
                    failed_items += 1;
                    errors.push(format!(
                        "Failed to reverse {} {}: {e}",
                        item.item_type, item.item_id
                    ));
                }
            }
            self.put_item(&item)?;
        }

        let (status, message) = if failed_items == 0 {
            let mut op = self.get_operation(operation_id)?;
            op.is_reversed = true;
            op.reversed_at = Some(Utc::now());
            op.reversed_by_user_id = Some(reversed_by_user_id);
            op.reverse_reason = Some(reason.to_string());
            self.put_operation(&op)?;
            (
                AuditStatus::Success,
                format!("Successfully reversed operation {operation_id}"),
            )
        } else {
            (
                AuditStatus::Partial,
                format!("Partially reversed operation {operation_id}: {failed_items} items failed"),
            )
        };

        let outcome = ReverseOutcome {
            success: true,
            reversed_items: Some(reversed_items),
            failed_items: Some(failed_items),
            errors: Some(errors),
            ..ReverseOutcome::default()
        };

        self.audit.update(reversal_audit.id.unwrap_or_default(), |record| {
            record.status = status;
            record.message = message.clone();
            record.response_data = serde_json::to_value(&outcome).unwrap_or(Value::Null);
        })?;

        Ok(outcome)
    }

    // ── Row plumbing ────────────────────────────────────────────────────────

    fn put_operation(&self, operation: &ReversibleOperation) -> Result<(), LedgerError> {
        let id = operation.id.ok_or(LedgerError::NotFound(0))?;
        self.session
            .update(OPERATIONS_TABLE, id, serde_json::to_value(operation)?)?;
        Ok(())
    }

    fn get_item(&self, id: i64) -> Result<ReversibleOperationItem, LedgerError> {
        let row = self
            .session
            .get(ITEMS_TABLE, id)
            .ok_or(LedgerError::ItemNotFound(id))?;
        let mut item: ReversibleOperationItem = serde_json::from_value(row)?;
        item.id = Some(id);
        Ok(item)
    }

    fn put_item(&self, item: &ReversibleOperationItem) -> Result<(), LedgerError> {
        let id = item.id.ok_or(LedgerError::ItemNotFound(0))?;
        self.session
            .update(ITEMS_TABLE, id, serde_json::to_value(item)?)?;
        Ok(())
    }

    fn all_operations(&self) -> Result<Vec<ReversibleOperation>, LedgerError> {
        self.session
            .scan(OPERATIONS_TABLE)
            .into_iter()
            .map(|(id, row)| {
                let mut op: ReversibleOperation = serde_json::from_value(row)?;
                op.id = Some(id);
                Ok(op)
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
