//! Domain types for the Tempo calendar archiving platform.
//!
//! Defines the appointment record exchanged between the calendar provider,
//! the normalization pipeline, and the archive stores, plus the archive
//! configuration and result shapes shared across crates.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ─── Availability, sensitivity, importance ───────────────────────────────────

/// Free/busy state reported by the calendar provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ShowAs {
    Free,
    Tentative,
    Busy,
    Oof,
    WorkingElsewhere,
    #[default]
    Unknown,
}

impl std::fmt::Display for ShowAs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Free => "free",
            Self::Tentative => "tentative",
            Self::Busy => "busy",
            Self::Oof => "oof",
            Self::WorkingElsewhere => "working-elsewhere",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    #[default]
    Normal,
    Personal,
    Private,
    Confidential,
}

impl std::fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Personal => "personal",
            Self::Private => "private",
            Self::Confidential => "confidential",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

// ─── Appointment ─────────────────────────────────────────────────────────────

/// A single calendar entry. After recurrence expansion, one instance per
/// occurrence; instances carry `recurrence = None` and reference the source
/// series by `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    /// Local surrogate id; `None` until persisted in the local store.
    pub id: Option<i64>,
    /// Provider-assigned event id.
    pub external_id: Option<String>,
    pub user_id: i64,
    pub calendar_id: String,
    pub subject: String,
    /// Canonical storage is UTC.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// RFC 5545 RRULE content (without the `RRULE:` prefix), if recurring.
    pub recurrence: Option<String>,
    /// Ordered provider categories, e.g. `"Acme Corp - billable"`.
    pub categories: Vec<String>,
    pub show_as: ShowAs,
    pub sensitivity: Sensitivity,
    pub importance: Importance,
    /// Once archived, the appointment is immutable except by its owner.
    pub is_archived: bool,
    /// Opaque provider payload, kept verbatim so a reversed archive can
    /// reconstruct the original event.
    pub provider_payload: Option<serde_json::Value>,
}

impl Appointment {
    pub fn new(
        user_id: i64,
        calendar_id: impl Into<String>,
        subject: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            external_id: None,
            user_id,
            calendar_id: calendar_id.into(),
            subject: subject.into(),
            start,
            end,
            recurrence: None,
            categories: Vec::new(),
            show_as: ShowAs::default(),
            sensitivity: Sensitivity::default(),
            importance: Importance::default(),
            is_archived: false,
            provider_payload: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Identity of an expanded recurrence instance.
    pub fn instance_key(&self) -> (Option<&str>, NaiveDate) {
        (self.external_id.as_deref(), self.start.date_naive())
    }

    /// Key used for exact-duplicate merging.
    pub fn duplicate_key(&self) -> (String, DateTime<Utc>, DateTime<Utc>) {
        (self.subject.clone(), self.start, self.end)
    }

    /// A zero-length interval is legal only for modification side-records.
    pub fn is_well_formed(&self) -> bool {
        self.end >= self.start
    }
}

// ─── User ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: Option<String>,
    pub username: Option<String>,
}

impl User {
    pub fn new(id: i64, email: impl Into<String>) -> Self {
        Self {
            id,
            email: Some(email.into()),
            username: None,
        }
    }
}

// ─── Archive configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchivePurpose {
    #[default]
    General,
    Timesheet,
    Billing,
    Travel,
}

impl std::fmt::Display for ArchivePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::General => "general",
            Self::Timesheet => "timesheet",
            Self::Billing => "billing",
            Self::Travel => "travel",
        };
        write!(f, "{s}")
    }
}

/// Per-user archiving configuration, addressed by name from the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfiguration {
    pub id: Option<i64>,
    pub user_id: i64,
    pub name: String,
    pub source_calendar_uri: String,
    pub destination_calendar_uri: String,
    pub is_active: bool,
    /// IANA timezone name for schedule interpretation.
    pub timezone: String,
    pub allow_overlaps: bool,
    pub archive_purpose: ArchivePurpose,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Archive run result ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Success,
    Partial,
    Error,
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    General,
    Timesheet,
}

/// Per-run overlap resolution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub total_overlaps: usize,
    pub auto_resolved: usize,
    pub remaining_conflicts: usize,
    pub filtered_appointments: usize,
}

/// Summary returned by every archival run, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveResult {
    pub status: ArchiveStatus,
    pub archive_type: ArchiveType,
    pub archived_count: usize,
    pub overlap_count: usize,
    pub resolution_stats: ResolutionStats,
    pub category_stats: serde_json::Value,
    pub category_issue_count: usize,
    pub modification_count: usize,
    pub privacy_applied_count: usize,
    pub errors: Vec<String>,
    pub correlation_id: String,
}

// ─── Cancellation ────────────────────────────────────────────────────────────

/// Cooperative cancellation flag checked at each suspension point of an
/// archival run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate a provider event id: non-empty, bounded, URL-safe-ish.
pub fn validate_external_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 256
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '=' | '+' | '/'))
}

/// Validate an archive configuration name.
pub fn validate_config_name(name: &str) -> bool {
    !name.trim().is_empty() && name.len() <= 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, m, 0).unwrap()
    }

    #[test]
    fn test_appointment_duration() {
        let appt = Appointment::new(1, "cal-1", "Standup", ts(9, 0), ts(9, 30));
        assert_eq!(appt.duration(), Duration::minutes(30));
        assert!(appt.is_well_formed());
    }

    #[test]
    fn test_zero_length_is_well_formed() {
        // Modification side-records may be zero-length before merging.
        let appt = Appointment::new(1, "cal-1", "Extended", ts(10, 0), ts(10, 0));
        assert!(appt.is_well_formed());
    }

    #[test]
    fn test_instance_key() {
        let mut appt = Appointment::new(1, "cal-1", "Weekly sync", ts(9, 0), ts(10, 0));
        appt.external_id = Some("AAMkAD=".to_string());
        let (ext, day) = appt.instance_key();
        assert_eq!(ext, Some("AAMkAD="));
        assert_eq!(day, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
    }

    #[test]
    fn test_show_as_serialization() {
        assert_eq!(
            serde_json::to_string(&ShowAs::WorkingElsewhere).unwrap(),
            "\"working-elsewhere\""
        );
        assert_eq!(ShowAs::Oof.to_string(), "oof");
    }

    #[test]
    fn test_archive_result_serialization() {
        let result = ArchiveResult {
            status: ArchiveStatus::Partial,
            archive_type: ArchiveType::General,
            archived_count: 4,
            overlap_count: 1,
            resolution_stats: ResolutionStats::default(),
            category_stats: serde_json::json!({}),
            category_issue_count: 0,
            modification_count: 1,
            privacy_applied_count: 0,
            errors: vec!["Failed to archive appointment Standup".to_string()],
            correlation_id: "c0ffee".to_string(),
        };
        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"status\":\"partial\""));
        let back: ArchiveResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.archived_count, 4);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_validate_external_id() {
        assert!(validate_external_id("AAMkADg4ZmQ="));
        assert!(!validate_external_id(""));
        assert!(!validate_external_id("has spaces"));
    }
}
