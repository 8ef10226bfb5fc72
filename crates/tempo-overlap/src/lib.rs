//! Duplicate merging and overlap detection for Tempo timelines.
//!
//! Overlap groups are found with a single sweep over the start-sorted
//! timeline. Boundary-touching intervals (`end == next.start`) do not
//! overlap.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tempo_proto::{Appointment, Importance, Sensitivity, ShowAs};

// ─── Duplicate merging ───────────────────────────────────────────────────────

/// Merge exact duplicates, keyed by `(subject, start, end)`. The first
/// occurrence wins; the order of the survivors is unchanged.
pub fn merge_duplicates(appointments: Vec<Appointment>) -> Vec<Appointment> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(appointments.len());
    for appt in appointments {
        if seen.insert(appt.duplicate_key()) {
            merged.push(appt);
        }
    }
    merged
}

// ─── Overlap detection ───────────────────────────────────────────────────────

/// Detect overlapping groups in a timeline. Ill-formed appointments
/// (`end < start`) are ignored. Returns only groups of size ≥ 2.
pub fn detect_overlaps(appointments: &[Appointment]) -> Vec<Vec<Appointment>> {
    let mut sorted: Vec<&Appointment> = appointments.iter().filter(|a| a.is_well_formed()).collect();
    sorted.sort_by_key(|a| a.start);

    let mut groups: Vec<Vec<Appointment>> = Vec::new();
    let mut current: Vec<&Appointment> = Vec::new();
    let mut current_max_end: Option<DateTime<Utc>> = None;

    for appt in sorted {
        match current_max_end {
            Some(max_end) if appt.start < max_end => {
                current.push(appt);
                if appt.end > max_end {
                    current_max_end = Some(appt.end);
                }
            }
            _ => {
                if current.len() > 1 {
                    groups.push(current.iter().map(|a| (*a).clone()).collect());
                }
                current = vec![appt];
                current_max_end = Some(appt.end);
            }
        }
    }
    if current.len() > 1 {
        groups.push(current.iter().map(|a| (*a).clone()).collect());
    }
    groups
}

// ─── Overlap metadata ────────────────────────────────────────────────────────

/// Resolution-relevant projection of one overlap group, kept as parallel
/// lists for downstream display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlapMetadata {
    pub show_as_values: Vec<ShowAs>,
    pub importance_values: Vec<Importance>,
    pub sensitivity_values: Vec<Sensitivity>,
    pub subjects: Vec<String>,
    pub start_times: Vec<DateTime<Utc>>,
    pub end_times: Vec<DateTime<Utc>>,
    pub group_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlapGroup {
    pub appointments: Vec<Appointment>,
    pub metadata: OverlapMetadata,
}

/// Overlap detection augmented with resolution metadata per group.
pub fn detect_overlaps_with_metadata(appointments: &[Appointment]) -> Vec<OverlapGroup> {
    detect_overlaps(appointments)
        .into_iter()
        .map(|group| {
            let metadata = OverlapMetadata {
                show_as_values: group.iter().map(|a| a.show_as).collect(),
                importance_values: group.iter().map(|a| a.importance).collect(),
                sensitivity_values: group.iter().map(|a| a.sensitivity).collect(),
                subjects: group.iter().map(|a| a.subject.clone()).collect(),
                start_times: group.iter().map(|a| a.start).collect(),
                end_times: group.iter().map(|a| a.end).collect(),
                group_size: group.len(),
            };
            OverlapGroup {
                appointments: group,
                metadata,
            }
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn appt(subject: &str, start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> Appointment {
        Appointment::new(
            1,
            "cal-1",
            subject,
            Utc.with_ymd_and_hms(2025, 6, 2, start_h, start_m, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, end_h, end_m, 0).unwrap(),
        )
    }

    #[test]
    fn test_merge_duplicates_first_wins() {
        let mut first = appt("Standup", 9, 0, 9, 15);
        first.importance = Importance::High;
        let second = appt("Standup", 9, 0, 9, 15);
        let third = appt("Review", 10, 0, 11, 0);

        let merged = merge_duplicates(vec![first, second, third]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].subject, "Standup");
        assert_eq!(merged[0].importance, Importance::High);
        assert_eq!(merged[1].subject, "Review");
    }

    #[test]
    fn test_merge_keeps_distinct_times() {
        let merged = merge_duplicates(vec![appt("Standup", 9, 0, 9, 15), appt("Standup", 10, 0, 10, 15)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_detect_no_overlaps() {
        let groups = detect_overlaps(&[appt("A", 9, 0, 10, 0), appt("B", 10, 30, 11, 0)]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_detect_simple_overlap() {
        let groups = detect_overlaps(&[
            appt("A", 9, 0, 10, 0),
            appt("B", 9, 30, 10, 30),
            appt("C", 12, 0, 13, 0),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
        let subjects: Vec<&str> = groups[0].iter().map(|a| a.subject.as_str()).collect();
        assert_eq!(subjects, ["A", "B"]);
    }

    #[test]
    fn test_boundary_touch_is_not_overlap() {
        let groups = detect_overlaps(&[appt("A", 9, 0, 10, 0), appt("B", 10, 0, 11, 0)]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_containment_extends_group_by_max_end() {
        // A spans 9-12; B sits inside it; C starts after B ends but still
        // inside A, so all three share one group.
        let groups = detect_overlaps(&[
            appt("A", 9, 0, 12, 0),
            appt("B", 9, 30, 10, 0),
            appt("C", 10, 30, 11, 0),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn test_two_separate_groups() {
        let groups = detect_overlaps(&[
            appt("A", 9, 0, 10, 0),
            appt("B", 9, 30, 10, 30),
            appt("C", 14, 0, 15, 0),
            appt("D", 14, 15, 14, 45),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_ill_formed_ignored() {
        let mut bad = appt("Bad", 10, 0, 9, 0);
        bad.end = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let groups = detect_overlaps(&[bad, appt("A", 9, 0, 10, 0), appt("B", 9, 30, 10, 30)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn test_unsorted_input() {
        let groups = detect_overlaps(&[appt("B", 9, 30, 10, 30), appt("A", 9, 0, 10, 0)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0][0].subject, "A");
    }

    #[test]
    fn test_metadata_parallel_lists() {
        let mut a = appt("A", 9, 0, 10, 0);
        a.show_as = ShowAs::Busy;
        a.importance = Importance::High;
        let mut b = appt("B", 9, 30, 10, 30);
        b.show_as = ShowAs::Tentative;

        let groups = detect_overlaps_with_metadata(&[a, b]);
        assert_eq!(groups.len(), 1);
        let meta = &groups[0].metadata;
        assert_eq!(meta.group_size, 2);
        assert_eq!(meta.show_as_values, vec![ShowAs::Busy, ShowAs::Tentative]);
        assert_eq!(meta.importance_values, vec![Importance::High, Importance::Normal]);
        assert_eq!(meta.subjects, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(meta.start_times[0], groups[0].appointments[0].start);
    }
}
