//! Automatic overlap resolution for Tempo.
//!
//! Three stages, applied in order to each overlap group:
//! 1. drop `free` appointments;
//! 2. drop tentatives when a confirmed appointment is present;
//! 3. keep the unique highest-priority appointment.
//!
//! A group that survives all three stages with a tied maximum becomes a
//! residual conflict for manual resolution. Every stage appends a
//! human-readable line to the resolution log so the audit trail can explain
//! the decision.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tempo_proto::{Appointment, Importance, ShowAs};
use tracing::debug;

/// Partition of one overlap group after automatic resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    /// Appointments to keep.
    pub resolved: Vec<Appointment>,
    /// Still-tied appointments needing manual resolution.
    pub conflicts: Vec<Appointment>,
    /// Appointments dropped by one of the stages.
    pub filtered: Vec<Appointment>,
    /// One line per stage invoked.
    pub resolution_log: Vec<String>,
}

/// Apply the automatic resolution rules to one overlap group.
pub fn resolve_group(group: Vec<Appointment>) -> ResolutionOutcome {
    if group.is_empty() {
        return ResolutionOutcome::default();
    }

    let mut outcome = ResolutionOutcome::default();

    // Stage 1: drop 'free' appointments.
    let (remaining, free) = filter_free(group);
    if !free.is_empty() {
        outcome
            .resolution_log
            .push(format!("Filtered out {} 'Free' appointments", free.len()));
        outcome.filtered.extend(free);
    }
    if remaining.len() <= 1 {
        outcome.resolved = remaining;
        return outcome;
    }

    // Stage 2: confirmed beats tentative.
    let (remaining, tentative) = resolve_tentative(remaining);
    if !tentative.is_empty() {
        outcome.resolution_log.push(format!(
            "Discarded {} 'Tentative' appointments in favor of confirmed",
            tentative.len()
        ));
        outcome.filtered.extend(tentative);
    }
    if remaining.len() <= 1 {
        outcome.resolved = remaining;
        return outcome;
    }

    // Stage 3: priority.
    match resolve_by_priority(remaining) {
        PriorityOutcome::Winner { primary, secondary } => {
            if !secondary.is_empty() {
                outcome.resolution_log.push(format!(
                    "Selected highest priority appointment, filtered {} lower priority",
                    secondary.len()
                ));
                outcome.filtered.extend(secondary);
            }
            outcome.resolved = vec![primary];
        }
        PriorityOutcome::Tied {
            tied,
            outranked,
            score,
        } => {
            if !outranked.is_empty() {
                outcome.resolution_log.push(format!(
                    "Filtered {} lower priority appointments below the tied maximum",
                    outranked.len()
                ));
                outcome.filtered.extend(outranked);
            }
            outcome.resolution_log.push(format!(
                "Unable to resolve by priority: multiple appointments share the highest priority ({score})"
            ));
            outcome.conflicts = tied;
        }
    }

    debug!(
        resolved = outcome.resolved.len(),
        conflicts = outcome.conflicts.len(),
        filtered = outcome.filtered.len(),
        "overlap group resolved"
    );
    outcome
}

/// Separate `free` appointments from the rest.
pub fn filter_free(group: Vec<Appointment>) -> (Vec<Appointment>, Vec<Appointment>) {
    group
        .into_iter()
        .partition(|appt| appt.show_as != ShowAs::Free)
}

/// When the group holds both confirmed and tentative appointments, drop the
/// tentatives. An all-tentative (or all-confirmed) group is left alone.
pub fn resolve_tentative(group: Vec<Appointment>) -> (Vec<Appointment>, Vec<Appointment>) {
    let any_confirmed = group.iter().any(|a| a.show_as != ShowAs::Tentative);
    let any_tentative = group.iter().any(|a| a.show_as == ShowAs::Tentative);
    if any_confirmed && any_tentative {
        group
            .into_iter()
            .partition(|appt| appt.show_as != ShowAs::Tentative)
    } else {
        (group, Vec::new())
    }
}

enum PriorityOutcome {
    Winner {
        primary: Appointment,
        secondary: Vec<Appointment>,
    },
    Tied {
        tied: Vec<Appointment>,
        outranked: Vec<Appointment>,
        score: u8,
    },
}

/// Keep the unique maximum-priority appointment; a tied maximum cannot be
/// auto-resolved.
fn resolve_by_priority(group: Vec<Appointment>) -> PriorityOutcome {
    let top = group.iter().map(priority_score).max().unwrap_or_default();
    let winners = group.iter().filter(|a| priority_score(a) == top).count();

    if winners == 1 {
        let mut primary = None;
        let mut secondary = Vec::new();
        for appt in group {
            if primary.is_none() && priority_score(&appt) == top {
                primary = Some(appt);
            } else {
                secondary.push(appt);
            }
        }
        match primary {
            Some(primary) => PriorityOutcome::Winner { primary, secondary },
            // Unreachable with winners == 1; keep the group as tied rather
            // than drop anything.
            None => PriorityOutcome::Tied {
                tied: secondary,
                outranked: Vec::new(),
                score: top,
            },
        }
    } else {
        let (tied, outranked) = group
            .into_iter()
            .partition(|a| priority_score(a) == top);
        PriorityOutcome::Tied {
            tied,
            outranked,
            score: top,
        }
    }
}

/// Priority score: high = 3, normal = 2, low = 1.
pub fn priority_score(appointment: &Appointment) -> u8 {
    match appointment.importance {
        Importance::High => 3,
        Importance::Normal => 2,
        Importance::Low => 1,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn appt(subject: &str, show_as: ShowAs, importance: Importance) -> Appointment {
        let mut appt = Appointment::new(
            1,
            "cal-1",
            subject,
            Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
        );
        appt.show_as = show_as;
        appt.importance = importance;
        appt
    }

    fn partition_is_complete(input: usize, outcome: &ResolutionOutcome) {
        assert_eq!(
            input,
            outcome.resolved.len() + outcome.conflicts.len() + outcome.filtered.len(),
            "resolution must partition the group"
        );
    }

    #[test]
    fn test_empty_group() {
        let outcome = resolve_group(vec![]);
        assert!(outcome.resolved.is_empty());
        assert!(outcome.resolution_log.is_empty());
    }

    #[test]
    fn test_free_filter_resolves_group() {
        let group = vec![
            appt("Focus block", ShowAs::Free, Importance::Normal),
            appt("Standup", ShowAs::Busy, Importance::Normal),
        ];
        let outcome = resolve_group(group);
        partition_is_complete(2, &outcome);
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].subject, "Standup");
        assert_eq!(outcome.filtered.len(), 1);
        assert!(outcome.resolution_log[0].contains("'Free'"));
    }

    #[test]
    fn test_all_free_resolves_to_empty() {
        let group = vec![
            appt("Block A", ShowAs::Free, Importance::Normal),
            appt("Block B", ShowAs::Free, Importance::Normal),
        ];
        let outcome = resolve_group(group);
        partition_is_complete(2, &outcome);
        assert!(outcome.resolved.is_empty());
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.filtered.len(), 2);
    }

    #[test]
    fn test_tentative_discarded_for_confirmed() {
        let group = vec![
            appt("Maybe", ShowAs::Tentative, Importance::Normal),
            appt("Confirmed", ShowAs::Busy, Importance::Normal),
        ];
        let outcome = resolve_group(group);
        partition_is_complete(2, &outcome);
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].subject, "Confirmed");
        assert!(outcome
            .resolution_log
            .iter()
            .any(|l| l.contains("'Tentative'")));
    }

    #[test]
    fn test_all_tentative_falls_through_to_priority() {
        let group = vec![
            appt("Maybe A", ShowAs::Tentative, Importance::High),
            appt("Maybe B", ShowAs::Tentative, Importance::Normal),
        ];
        let outcome = resolve_group(group);
        partition_is_complete(2, &outcome);
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].subject, "Maybe A");
    }

    #[test]
    fn test_priority_resolution() {
        let group = vec![
            appt("Normal one", ShowAs::Busy, Importance::Normal),
            appt("Important one", ShowAs::Busy, Importance::High),
            appt("Low one", ShowAs::Busy, Importance::Low),
        ];
        let outcome = resolve_group(group);
        partition_is_complete(3, &outcome);
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].subject, "Important one");
        assert_eq!(outcome.filtered.len(), 2);
        assert!(outcome
            .resolution_log
            .iter()
            .any(|l| l.contains("highest priority")));
    }

    #[test]
    fn test_tied_priority_becomes_conflict() {
        let group = vec![
            appt("First", ShowAs::Busy, Importance::Normal),
            appt("Second", ShowAs::Busy, Importance::Normal),
        ];
        let outcome = resolve_group(group);
        partition_is_complete(2, &outcome);
        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.conflicts.len(), 2);
        assert!(outcome
            .resolution_log
            .iter()
            .any(|l| l.contains("Unable to resolve by priority")));
    }

    #[test]
    fn test_stages_compose() {
        let group = vec![
            appt("Free block", ShowAs::Free, Importance::High),
            appt("Tentative", ShowAs::Tentative, Importance::High),
            appt("Winner", ShowAs::Busy, Importance::High),
            appt("Loser", ShowAs::Busy, Importance::Low),
        ];
        let outcome = resolve_group(group);
        partition_is_complete(4, &outcome);
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].subject, "Winner");
        assert_eq!(outcome.filtered.len(), 3);
        assert_eq!(outcome.resolution_log.len(), 3);
    }

    #[test]
    fn test_lower_priority_losers_are_filtered_not_conflicts() {
        // Tied maximum: only the tied appointments become conflicts; lower
        // scores are filtered.
        let group = vec![
            appt("Tied A", ShowAs::Busy, Importance::High),
            appt("Tied B", ShowAs::Busy, Importance::High),
            appt("Low", ShowAs::Busy, Importance::Low),
        ];
        let outcome = resolve_group(group);
        partition_is_complete(3, &outcome);
        assert_eq!(outcome.conflicts.len(), 2);
        assert_eq!(outcome.filtered.len(), 1);
        assert_eq!(outcome.filtered[0].subject, "Low");
    }
}
