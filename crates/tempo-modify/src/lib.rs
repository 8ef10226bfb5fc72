//! Meeting-modification merging for Tempo.
//!
//! Users record schedule changes as small side-appointments ("Extended",
//! "Meeting shortened", "early start", "late start"). This crate detects
//! those side-records, pairs each with its original appointment, and folds
//! the change into the original. Orphan modifications are dropped with a
//! warning and never archived.

#![forbid(unsafe_code)]

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tempo_proto::Appointment;
use tracing::{debug, warn};

/// Pairing tolerance between a modification and its original.
pub const PAIRING_TOLERANCE_SECS: i64 = 300;

/// Shortening and late starts never collapse an appointment below this.
const MINIMUM_DURATION_MINS: i64 = 1;

static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^Extended$").expect("extension regex"));
static SHORTENED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bshortened\b").expect("shortened regex"));
static EARLY_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bearly\s+start\b").expect("early start regex"));
static LATE_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blate\s+start\b").expect("late start regex"));

// ─── Modification kinds ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Extension,
    Shortened,
    EarlyStart,
    LateStart,
}

impl std::fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Extension => "extension",
            Self::Shortened => "shortened",
            Self::EarlyStart => "early_start",
            Self::LateStart => "late_start",
        };
        write!(f, "{s}")
    }
}

/// Classify a subject as a modification side-record.
pub fn detect_modification(subject: &str) -> Option<ModificationKind> {
    if subject.is_empty() {
        return None;
    }
    if EXTENSION_RE.is_match(subject) {
        Some(ModificationKind::Extension)
    } else if SHORTENED_RE.is_match(subject) {
        Some(ModificationKind::Shortened)
    } else if EARLY_START_RE.is_match(subject) {
        Some(ModificationKind::EarlyStart)
    } else if LATE_START_RE.is_match(subject) {
        Some(ModificationKind::LateStart)
    } else {
        None
    }
}

// ─── Processing ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ProcessedModifications {
    /// Regular appointments with every paired modification applied.
    pub appointments: Vec<Appointment>,
    /// Modifications that found no original within policy.
    pub orphaned: usize,
    /// Human-readable account of what was applied or dropped.
    pub log: Vec<String>,
}

/// Separate modification side-records from regular appointments and fold
/// each modification into its original.
pub fn process_modifications(appointments: Vec<Appointment>) -> ProcessedModifications {
    let mut regular = Vec::new();
    let mut modifications = Vec::new();

    for appt in appointments {
        match detect_modification(&appt.subject) {
            Some(kind) => modifications.push((kind, appt)),
            None => regular.push(appt),
        }
    }

    let mut outcome = ProcessedModifications::default();

    for (kind, modification) in modifications {
        match find_original(&modification, kind, &regular) {
            Some(index) => {
                let merged = apply_modification(&regular[index], &modification, kind);
                outcome
                    .log
                    .push(format!("Applied {kind} to appointment: {}", regular[index].subject));
                regular[index] = merged;
            }
            None => {
                warn!(
                    kind = %kind,
                    subject = %modification.subject,
                    "no original appointment found for modification"
                );
                outcome
                    .log
                    .push(format!("Orphaned {kind} modification: {}", modification.subject));
                outcome.orphaned += 1;
            }
        }
    }

    if !outcome.log.is_empty() {
        debug!(log = outcome.log.join("; "), "modification processing completed");
    }

    outcome.appointments = regular;
    outcome
}

/// Find the index of the original appointment for a modification, applying
/// the per-kind pairing policy. Ties keep the earliest candidate.
fn find_original(
    modification: &Appointment,
    kind: ModificationKind,
    candidates: &[Appointment],
) -> Option<usize> {
    let tolerance = PAIRING_TOLERANCE_SECS;
    let mod_start = modification.start;
    let mod_end = modification.end;

    let mut best: Option<(i64, usize)> = None;
    for (index, appt) in candidates.iter().enumerate() {
        // Categories must match when both sides carry them.
        if !modification.categories.is_empty()
            && !appt.categories.is_empty()
            && modification.categories != appt.categories
        {
            continue;
        }

        let score = match kind {
            ModificationKind::Extension => {
                // The extension starts where the original ends.
                let diff = (mod_start - appt.end).num_seconds().abs();
                (diff <= tolerance).then_some(diff)
            }
            ModificationKind::Shortened => {
                // The shortening overlaps the original; largest overlap wins.
                let overlaps = (mod_start >= appt.start && mod_start < appt.end)
                    || (mod_end > appt.start && mod_end <= appt.end);
                overlaps.then(|| {
                    let overlap_start = mod_start.max(appt.start);
                    let overlap_end = mod_end.min(appt.end);
                    -(overlap_end - overlap_start).num_seconds()
                })
            }
            ModificationKind::EarlyStart => {
                // The early-start block ends where the original begins.
                let before = mod_start <= appt.start && mod_end <= appt.end;
                let diff = (mod_end - appt.start).num_seconds().abs();
                (before && diff <= tolerance).then_some(diff)
            }
            ModificationKind::LateStart => {
                // The late-start block begins with the original.
                let diff = (mod_start - appt.start).num_seconds().abs();
                (diff <= tolerance).then_some(diff)
            }
        };

        if let Some(score) = score {
            if best.is_none_or(|(best_score, _)| score < best_score) {
                best = Some((score, index));
            }
        }
    }

    best.map(|(_, index)| index)
}

/// Apply a modification to a copy of the original. The copy is a new record:
/// no local id, no provider id.
fn apply_modification(
    original: &Appointment,
    modification: &Appointment,
    kind: ModificationKind,
) -> Appointment {
    let mut merged = original.clone();
    merged.id = None;
    merged.external_id = None;
    let delta = modification.duration();

    match kind {
        ModificationKind::Extension => {
            merged.end = original.end + delta;
        }
        ModificationKind::Shortened => {
            merged.end = original.end - delta;
            if merged.end <= original.start {
                merged.end = original.start + Duration::minutes(MINIMUM_DURATION_MINS);
                warn!(
                    subject = %original.subject,
                    "shortening would produce a non-positive duration, clamped to one minute"
                );
            }
        }
        ModificationKind::EarlyStart => {
            merged.start = modification.start;
        }
        ModificationKind::LateStart => {
            merged.start = original.start + delta;
            if merged.start >= original.end {
                merged.start = original.end - Duration::minutes(MINIMUM_DURATION_MINS);
                warn!(
                    subject = %original.subject,
                    "late start would produce a non-positive duration, clamped to one minute"
                );
            }
        }
    }

    merged
}

// ─── Tests ───────────────────────────────────────────────────────────────────
