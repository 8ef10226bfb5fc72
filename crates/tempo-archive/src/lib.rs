//! Archive orchestration for Tempo.
//!
//! One archival run, inside one audit context and one transactional
//! session: resolve URIs, fetch, expand recurrences, apply categories and
//! privacy, merge modifications, deduplicate, resolve overlaps, capture
//! before-state, write to the destination, mark immutable (local only),
//! and file manual-action tasks for whatever could not be resolved
//! mechanically. The run commits atomically; on failure only the failure
//! trace is persisted.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tempo_actions::{ActionLog, ActionLogStore, EventType, TaskState};
use tempo_assoc::AssociationStore;
use tempo_audit::{sanitize, AuditContext, AuditFailure, AuditLedger, AuditStatus};
use tempo_category::{apply_privacy, category_statistics, extract_billing_info, CategoryStats};
use tempo_ledger::{ReverseAction, ReversibleLedger};
use tempo_proto::{
    Appointment, ArchivePurpose, ArchiveResult, ArchiveStatus, ArchiveType, CancelToken,
    ResolutionStats, User,
};
use tempo_repo::{AppointmentRepository, BulkOutcome, RepoError};
use tempo_resolve::resolve_group;
use tempo_store::Session;
use tempo_uri::{CalendarDirectory, CalendarResolver, UriError, SCHEME_LOCAL};
use tracing::{debug, info, warn};

pub mod reverser;
pub mod timesheet;

pub use reverser::ArchiveReverser;

/// Category-validation tasks filed per run are capped here.
const CATEGORY_ISSUE_TASK_CAP: usize = 10;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Recurrence(#[from] tempo_recur::RecurrenceError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Audit(#[from] tempo_audit::AuditError),
    #[error(transparent)]
    Ledger(#[from] tempo_ledger::LedgerError),
    #[error(transparent)]
    Actions(#[from] tempo_actions::ActionLogError),
    #[error(transparent)]
    Assoc(#[from] tempo_assoc::AssocError),
    #[error(transparent)]
    Store(#[from] tempo_store::StoreError),
    #[error("operation cancelled during {0}")]
    Cancelled(String),
}

impl ArchiveError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Uri(_) => "UriError",
            Self::Recurrence(_) => "RecurrenceError",
            Self::Repo(_) => "RepoError",
            Self::Audit(_) => "AuditError",
            Self::Ledger(_) => "LedgerError",
            Self::Actions(_) => "ActionLogError",
            Self::Assoc(_) => "AssocError",
            Self::Store(_) => "StoreError",
            Self::Cancelled(_) => "Cancelled",
        }
    }
}

// ─── Repository provider ─────────────────────────────────────────────────────

/// Seam between the orchestrator and the repository variants: given a
/// resolved backend id and its scheme, hand back the repository to use.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    async fn repository(
        &self,
        user: &User,
        scheme: &str,
        calendar_id: &str,
    ) -> Result<Arc<dyn AppointmentRepository>, RepoError>;
}

/// Production wiring: `local` calendars live in the session-backed store,
/// `msgraph` calendars go through the provider client.
pub struct StandardRepositoryProvider {
    session: Session,
    client: Option<Arc<tempo_repo::GraphCalendarClient>>,
}

impl StandardRepositoryProvider {
    pub fn new(session: Session, client: Option<Arc<tempo_repo::GraphCalendarClient>>) -> Self {
        Self { session, client }
    }
}

#[async_trait]
impl RepositoryProvider for StandardRepositoryProvider {
    async fn repository(
        &self,
        user: &User,
        scheme: &str,
        calendar_id: &str,
    ) -> Result<Arc<dyn AppointmentRepository>, RepoError> {
        if scheme == SCHEME_LOCAL {
            Ok(Arc::new(tempo_repo::LocalAppointmentRepository::new(
                self.session.clone(),
                user.clone(),
                calendar_id,
            )))
        } else {
            let client = self
                .client
                .clone()
                .ok_or_else(|| RepoError::Fetch("no provider client configured".to_string()))?;
            Ok(Arc::new(tempo_repo::RemoteAppointmentRepository::new(
                client,
                user.clone(),
                calendar_id,
            )))
        }
    }
}

// ─── Request ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub user: User,
    pub source_uri: String,
    pub destination_uri: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub allow_overlaps: bool,
    pub archive_purpose: ArchivePurpose,
    /// Timesheet runs only: include travel appointments detected by subject.
    pub include_travel: bool,
    pub cancel: CancelToken,
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct ArchiveOrchestrator {
    session: Session,
    audit: AuditLedger,
    ledger: ReversibleLedger,
    actions: ActionLogStore,
    associations: AssociationStore,
    resolver: CalendarResolver,
    repositories: Arc<dyn RepositoryProvider>,
}

impl ArchiveOrchestrator {
    pub fn new(
        session: Session,
        directory: Arc<dyn CalendarDirectory>,
        repositories: Arc<dyn RepositoryProvider>,
    ) -> Self {
        let audit = AuditLedger::new(session.clone());
        let ledger = ReversibleLedger::new(session.clone(), audit.clone());
        Self {
            actions: ActionLogStore::new(session.clone()),
            associations: AssociationStore::new(session.clone()),
            resolver: CalendarResolver::new(directory),
            ledger,
            audit,
            session,
            repositories,
        }
    }

    pub fn audit(&self) -> &AuditLedger {
        &self.audit
    }

    pub fn ledger(&self) -> &ReversibleLedger {
        &self.ledger
    }

    /// Run one archival transaction. Always returns the result shape;
    /// failures come back as `status = error` with the correlation id that
    /// locates the failure in the audit trail.
    pub async fn run(&self, request: &ArchiveRequest) -> ArchiveResult {
        let correlation_id = AuditLedger::generate_correlation_id();
        let started = Instant::now();

        let mut ctx = AuditContext::begin(
            self.audit.clone(),
            request.user.id,
            "archive",
            "calendar_archive",
            correlation_id.clone(),
        )
        .with_resource("calendar", &request.source_uri);
        ctx.set_request_data(json!({
            "source_calendar_uri": request.source_uri,
            "destination_calendar_uri": request.destination_uri,
            "start_date": request.start_date.to_string(),
            "end_date": request.end_date.to_string(),
            "archive_purpose": request.archive_purpose.to_string(),
            "allow_overlaps": request.allow_overlaps,
        }));

        let mut operation_id = None;
        match self
            .run_inner(request, &mut ctx, &correlation_id, &mut operation_id)
            .await
        {
            Ok(result) => {
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                if let Some(op_id) = operation_id {
                    let op_status = match result.status {
                        ArchiveStatus::Success => AuditStatus::Success,
                        ArchiveStatus::Partial => AuditStatus::Partial,
                        ArchiveStatus::Error => AuditStatus::Failure,
                    };
                    if let Err(e) = self.ledger.complete_operation(
                        op_id,
                        op_status,
                        &format!("Archive run finished with status {}", result.status),
                        sanitize::sanitize_field(&result),
                        Some(duration_ms),
                    ) {
                        warn!(error = %e, "failed to close reversible operation");
                    }
                }
                ctx.set_response_data(&result);
                let audit_status = match result.status {
                    ArchiveStatus::Success => AuditStatus::Success,
                    ArchiveStatus::Partial => AuditStatus::Partial,
                    ArchiveStatus::Error => AuditStatus::Failure,
                };
                if let Err(e) = ctx.close(audit_status, None) {
                    warn!(error = %e, "failed to close audit context");
                }
                if let Err(e) = self.session.commit() {
                    warn!(error = %e, "session commit failed, rolling back");
                    self.session.rollback();
                    return self.failure_result(request, &correlation_id, &e.to_string());
                }
                info!(
                    archived = result.archived_count,
                    overlaps = result.overlap_count,
                    status = %result.status,
                    correlation_id = %correlation_id,
                    "archive run complete"
                );
                result
            }
            Err(e) => {
                warn!(error = %e, correlation_id = %correlation_id, "archive run failed");
                // Abort atomically, then persist just the failure trace.
                self.session.rollback();
                let failure_record = ctx.fail(AuditFailure {
                    error_type: e.kind().to_string(),
                    message: e.to_string(),
                    traceback: None,
                });
                let reason = match &e {
                    ArchiveError::Cancelled(_) => tempo_ledger::REASON_OPERATION_CANCELLED,
                    _ => tempo_ledger::REASON_OPERATION_FAILED,
                };
                match failure_record {
                    Ok(record) => {
                        if let Err(le) = self.ledger.record_failed_operation(
                            request.user.id,
                            "archive",
                            "calendar_archive_replace",
                            &correlation_id,
                            record.id.unwrap_or_default(),
                            reason,
                        ) {
                            warn!(error = %le, "failed to record failed operation");
                        }
                    }
                    Err(ae) => warn!(error = %ae, "failed to write failure audit record"),
                }
                if let Err(ce) = self.session.commit() {
                    warn!(error = %ce, "failed to persist failure trace");
                }
                self.failure_result(request, &correlation_id, &e.to_string())
            }
        }
    }

    fn failure_result(
        &self,
        request: &ArchiveRequest,
        correlation_id: &str,
        error: &str,
    ) -> ArchiveResult {
        ArchiveResult {
            status: ArchiveStatus::Error,
            archive_type: archive_type_of(request.archive_purpose),
            archived_count: 0,
            overlap_count: 0,
            resolution_stats: ResolutionStats::default(),
            category_stats: json!({}),
            category_issue_count: 0,
            modification_count: 0,
            privacy_applied_count: 0,
            errors: vec![error.to_string()],
            correlation_id: correlation_id.to_string(),
        }
    }

    async fn run_inner(
        &self,
        request: &ArchiveRequest,
        ctx: &mut AuditContext,
        correlation_id: &str,
        operation_slot: &mut Option<i64>,
    ) -> Result<ArchiveResult, ArchiveError> {
        let user = &request.user;

        // 1. Resolve the source and fetch.
        ctx.add_detail("phase", "initialization");
        let source_parsed = tempo_uri::parse_or_migrate(&request.source_uri, None)?;
        let source_backend = self.resolver.resolve(&request.source_uri, user).await?;
        ctx.add_detail("source_calendar_id", &source_backend);

        ensure_not_cancelled(&request.cancel, "fetching_appointments")?;
        ctx.add_detail("phase", "fetching_appointments");
        let source_repo = self
            .repositories
            .repository(user, &source_parsed.scheme, &source_backend)
            .await?;
        let appointments = source_repo
            .list_for_user(request.start_date, request.end_date)
            .await?;
        ctx.add_detail("initial_appointment_count", appointments.len());

        // 2. Expand recurrences.
        ctx.add_detail("phase", "processing_appointments");
        let expanded =
            tempo_recur::expand_range(&appointments, request.start_date, request.end_date)?;
        ctx.add_detail("expanded_appointment_count", expanded.len());

        // 3. Categories and privacy automation.
        let category_stats = category_statistics(&expanded);
        ctx.add_detail("category_stats", &category_stats);
        let mut expanded = expanded;
        let privacy_applied_count = apply_privacy(&mut expanded);
        ctx.add_detail("privacy_applied_count", privacy_applied_count);

        // 4. Fold modification side-records into their originals.
        let pre_modification_count = expanded.len();
        let processed = tempo_modify::process_modifications(expanded);
        let modification_count = pre_modification_count - processed.appointments.len();
        ctx.add_detail("modification_count", modification_count);
        ctx.add_detail("processed_appointment_count", processed.appointments.len());

        // 5. Deduplicate.
        let deduped = tempo_overlap::merge_duplicates(processed.appointments);
        ctx.add_detail("deduped_appointment_count", deduped.len());

        // 6/7. Overlaps and candidate selection, per purpose.
        ctx.add_detail("phase", "overlap_resolution");
        let selection = match request.archive_purpose {
            ArchivePurpose::Timesheet => {
                let filtered = timesheet::filter_for_timesheet(&deduped, request.include_travel);
                ctx.add_detail("timesheet_statistics", &filtered.statistics);
                select_from_timesheet(filtered)
            }
            _ => select_general(&deduped, request.allow_overlaps),
        };
        ctx.add_detail("resolution_stats", &selection.resolution_stats);
        ctx.add_detail("appointments_to_archive_count", selection.to_archive.len());
        ctx.add_detail("remaining_conflicts_count", selection.residual_groups.len());

        // 8. Resolve the destination and pick the repository variant.
        ensure_not_cancelled(&request.cancel, "archiving")?;
        ctx.add_detail("phase", "archiving");
        let dest_parsed = tempo_uri::parse_or_migrate(&request.destination_uri, None)?;
        let dest_backend = self.resolver.resolve(&request.destination_uri, user).await?;
        let archive_repo = self
            .repositories
            .repository(user, &dest_parsed.scheme, &dest_backend)
            .await?;
        ctx.add_detail("archive_repository_type", &dest_parsed.scheme);
        ctx.add_detail("resolved_destination_id", &dest_backend);

        let mut errors: Vec<String> = Vec::new();

        // Duplicates already in the destination are skipped, not re-archived.
        let candidates = archive_repo
            .check_for_duplicates(&selection.to_archive, request.start_date, request.end_date)
            .await?;
        if candidates.len() < selection.to_archive.len() {
            let fresh: HashSet<_> = candidates.iter().map(Appointment::duplicate_key).collect();
            for skipped in selection
                .to_archive
                .iter()
                .filter(|a| !fresh.contains(&a.duplicate_key()))
            {
                errors.push(format!(
                    "Skipped duplicate appointment already in destination: {}",
                    skipped.subject
                ));
            }
        }

        // 9. Capture before-state per item to be written.
        let operation = self.ledger.start_operation(
            user.id,
            "archive",
            "calendar_archive_replace",
            Some(correlation_id.to_string()),
            Vec::new(),
        )?;
        *operation_slot = operation.id;

        let reverse_data = json!({
            "scheme": dest_parsed.scheme,
            "calendar_id": dest_backend,
        });
        let mut item_ids: HashMap<(String, String), i64> = HashMap::new();
        for appointment in &candidates {
            let item = self.ledger.capture_item(
                &operation,
                "appointment",
                &item_key(appointment),
                sanitize::sanitize_field(appointment),
                ReverseAction::Delete,
                reverse_data.clone(),
                appointment.external_id.clone(),
            )?;
            item_ids.insert(match_key(appointment), item.id.unwrap_or_default());
        }

        // 10. Write, bulk first, per-item on bulk-path failure.
        ensure_not_cancelled(&request.cancel, "writing")?;
        let batch_audit = tempo_audit::log_batch_operation_start(
            &self.audit,
            user.id,
            "archive_add",
            candidates.len(),
            correlation_id,
        )?;
        let bulk = match archive_repo.add_bulk(&candidates).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "bulk add failed, falling back to per-item adds");
                let mut outcome = BulkOutcome::default();
                for appointment in &candidates {
                    match archive_repo.add(appointment).await {
                        Ok(stored) => outcome.added.push(stored),
                        Err(item_err) => outcome.errors.push(format!(
                            "Failed to archive appointment {}: {item_err}",
                            appointment.subject
                        )),
                    }
                }
                outcome
            }
        };
        let archived_count = bulk.added.len();
        errors.extend(bulk.errors.iter().cloned());
        tempo_audit::log_batch_operation_end(
            &self.audit,
            user.id,
            "archive_add",
            batch_audit,
            archived_count,
            bulk.errors.len(),
            correlation_id,
        )?;
        ctx.add_detail("archived_count", archived_count);
        ctx.add_detail("archive_errors", &errors);

        // 11. Immutability gate (local store only; remote archives are
        // immutable by convention).
        let stored_ids: Vec<i64> = bulk.added.iter().filter_map(|a| a.id).collect();
        if dest_parsed.scheme == SCHEME_LOCAL {
            let marked = archive_repo.make_immutable(&stored_ids).await?;
            ctx.add_detail("immutable_marked", true);
            ctx.add_detail("immutable_count", marked);
        } else {
            ctx.add_detail("immutable_marked", false);
            ctx.add_detail("immutable_reason", "remote storage inherently immutable");
        }

        // Record final state per written item.
        for added in &bulk.added {
            if let Some(item_id) = item_ids.get(&match_key(added)) {
                let mut after = added.clone();
                after.is_archived = true;
                self.ledger
                    .set_after_state(*item_id, sanitize::sanitize_field(&after))?;
            }
        }

        // 12. Manual-action tasks for residue.
        ctx.add_detail("phase", "logging_issues");
        let overlap_count = self.log_residual_conflicts(
            user.id,
            &selection.residual_groups,
            correlation_id,
        )?;
        let category_issue_count = self.log_category_issues(
            user.id,
            &deduped,
            &category_stats,
            request,
            correlation_id,
        )?;
        ctx.add_detail("overlap_count", overlap_count);
        ctx.add_detail("category_issue_count", category_issue_count);
        ctx.add_detail("phase", "completed");

        // 13. Result. The session commits in `run` after the audit context
        // closes.
        let status = if errors.is_empty() {
            ArchiveStatus::Success
        } else {
            ArchiveStatus::Partial
        };
        Ok(ArchiveResult {
            status,
            archive_type: archive_type_of(request.archive_purpose),
            archived_count,
            overlap_count,
            resolution_stats: selection.resolution_stats,
            category_stats: sanitize::sanitize_field(&category_stats),
            category_issue_count,
            modification_count,
            privacy_applied_count,
            errors,
            correlation_id: correlation_id.to_string(),
        })
    }

    /// One task per conflicting appointment, linked to the appointment
    /// through an `overlap` association.
    fn log_residual_conflicts(
        &self,
        user_id: i64,
        residual_groups: &[Vec<Appointment>],
        correlation_id: &str,
    ) -> Result<usize, ArchiveError> {
        let mut overlap_count = 0;
        for group in residual_groups {
            for appointment in group {
                let log = self.actions.create(ActionLog::new(
                    user_id,
                    EventType::Overlap,
                    TaskState::NeedsUserAction,
                    format!(
                        "Overlapping event (manual resolution needed): {}",
                        appointment.subject
                    ),
                    json!({
                        "external_id": appointment.external_id,
                        "subject": appointment.subject,
                        "start": appointment.start.to_rfc3339(),
                        "end": appointment.end.to_rfc3339(),
                        "show_as": appointment.show_as,
                        "importance": appointment.importance,
                        "resolution_status": "auto_resolution_failed",
                        "correlation_id": correlation_id,
                    }),
                ))?;
                let task_id = log.id.unwrap_or_default().to_string();
                self.associations.associate(
                    "action_log",
                    &task_id,
                    "appointment",
                    &appointment_ref(appointment),
                    "overlap",
                )?;
                overlap_count += 1;
            }
        }
        Ok(overlap_count)
    }

    /// Category-validation tasks, one per issue, capped per run; each task
    /// references the appointment that produced the issue.
    fn log_category_issues(
        &self,
        user_id: i64,
        appointments: &[Appointment],
        stats: &CategoryStats,
        request: &ArchiveRequest,
        correlation_id: &str,
    ) -> Result<usize, ArchiveError> {
        let mut filed = 0;
        'outer: for appointment in appointments {
            let info = extract_billing_info(appointment);
            for issue in &info.issues {
                if filed >= CATEGORY_ISSUE_TASK_CAP {
                    break 'outer;
                }
                let log = self.actions.create(ActionLog::new(
                    user_id,
                    EventType::CategoryValidation,
                    TaskState::NeedsUserAction,
                    format!("Category validation issue: {issue}"),
                    json!({
                        "issue_type": "category_format",
                        "issue_description": issue,
                        "date_range": format!("{} to {}", request.start_date, request.end_date),
                        "total_issues": stats.issues.len(),
                        "correlation_id": correlation_id,
                    }),
                ))?;
                let task_id = log.id.unwrap_or_default().to_string();
                self.associations.associate(
                    "action_log",
                    &task_id,
                    "appointment",
                    &appointment_ref(appointment),
                    "category_validation",
                )?;
                filed += 1;
            }
        }
        Ok(filed)
    }
}

// ─── Candidate selection ─────────────────────────────────────────────────────

struct Selection {
    to_archive: Vec<Appointment>,
    residual_groups: Vec<Vec<Appointment>>,
    resolution_stats: ResolutionStats,
}

fn match_key(appointment: &Appointment) -> (String, String) {
    (
        appointment.subject.clone(),
        format!("{}|{}", appointment.start.to_rfc3339(), appointment.end.to_rfc3339()),
    )
}

fn item_key(appointment: &Appointment) -> String {
    format!(
        "{}|{}|{}",
        appointment.subject,
        appointment.start.to_rfc3339(),
        appointment.end.to_rfc3339()
    )
}

/// Stable reference to an appointment for associations: the provider id
/// when it exists, the composite key otherwise.
fn appointment_ref(appointment: &Appointment) -> String {
    appointment
        .external_id
        .clone()
        .unwrap_or_else(|| item_key(appointment))
}

fn archive_type_of(purpose: ArchivePurpose) -> ArchiveType {
    match purpose {
        ArchivePurpose::Timesheet => ArchiveType::Timesheet,
        _ => ArchiveType::General,
    }
}

/// General purpose: resolve each overlap group; the archive set depends on
/// `allow_overlaps`.
fn select_general(deduped: &[Appointment], allow_overlaps: bool) -> Selection {
    let groups = tempo_overlap::detect_overlaps(deduped);
    let mut stats = ResolutionStats {
        total_overlaps: groups.len(),
        ..ResolutionStats::default()
    };

    let overlapping: HashSet<_> = groups
        .iter()
        .flatten()
        .map(Appointment::duplicate_key)
        .collect();

    let mut auto_resolved = Vec::new();
    let mut residual_groups = Vec::new();
    let mut free_filtered: HashSet<_> = HashSet::new();

    for group in groups {
        let outcome = resolve_group(group);
        if !outcome.resolved.is_empty() {
            stats.auto_resolved += 1;
        }
        if !outcome.conflicts.is_empty() {
            stats.remaining_conflicts += 1;
            residual_groups.push(outcome.conflicts.clone());
        }
        stats.filtered_appointments += outcome.filtered.len();
        for filtered in &outcome.filtered {
            if filtered.show_as == tempo_proto::ShowAs::Free {
                free_filtered.insert(filtered.duplicate_key());
            }
        }
        if !outcome.resolution_log.is_empty() {
            debug!(log = outcome.resolution_log.join("; "), "overlap resolution");
        }
        auto_resolved.extend(outcome.resolved);
    }

    let to_archive = if allow_overlaps {
        // Overlaps are reported but not suppressed; only free-filtered
        // members of overlap groups drop out.
        deduped
            .iter()
            .filter(|a| !free_filtered.contains(&a.duplicate_key()))
            .cloned()
            .collect()
    } else {
        let mut selected: Vec<Appointment> = deduped
            .iter()
            .filter(|a| !overlapping.contains(&a.duplicate_key()))
            .cloned()
            .collect();
        selected.extend(auto_resolved);
        selected
    };

    Selection {
        to_archive,
        residual_groups,
        resolution_stats: stats,
    }
}

/// Timesheet purpose: the filter has already run the overlap engine over
/// the business set; collect its outcomes.
fn select_from_timesheet(filtered: timesheet::TimesheetFiltered) -> Selection {
    let mut stats = ResolutionStats {
        total_overlaps: filtered.overlap_resolutions.len(),
        ..ResolutionStats::default()
    };
    let mut residual_groups = Vec::new();
    for outcome in &filtered.overlap_resolutions {
        if !outcome.resolved.is_empty() {
            stats.auto_resolved += 1;
        }
        if !outcome.conflicts.is_empty() {
            stats.remaining_conflicts += 1;
            residual_groups.push(outcome.conflicts.clone());
        }
        stats.filtered_appointments += outcome.filtered.len();
    }
    Selection {
        to_archive: filtered.filtered,
        residual_groups,
        resolution_stats: stats,
    }
}

fn ensure_not_cancelled(cancel: &CancelToken, phase: &str) -> Result<(), ArchiveError> {
    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled(phase.to_string()));
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
