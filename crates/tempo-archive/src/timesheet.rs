//! Category-driven filtering for timesheet and billing archives.
//!
//! Keeps only business appointments — billable, non-billable, and
//! (optionally) travel detected by subject keywords — and resolves their
//! overlaps automatically so the output is a clean billing view. Personal
//! appointments and `free` blocks are excluded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tempo_category::{extract_billing_info, BillingType};
use tempo_proto::{Appointment, ShowAs};
use tempo_resolve::{resolve_group, ResolutionOutcome};

/// Subject keywords that mark an appointment as travel.
pub const TRAVEL_KEYWORDS: [&str; 17] = [
    "travel",
    "drive",
    "driving",
    "flight",
    "flying",
    "commute",
    "commuting",
    "transit",
    "transport",
    "journey",
    "trip",
    "departure",
    "arrival",
    "airport",
    "station",
    "highway",
    "route",
];

/// Why an appointment was excluded from the timesheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionReasons {
    pub personal: usize,
    pub free_status: usize,
    pub invalid_category: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimesheetStats {
    pub total_appointments: usize,
    pub business_appointments: usize,
    pub excluded_appointments: usize,
    pub overlap_groups_processed: usize,
    pub appointments_resolved_by_overlap: usize,
    pub appointments_filtered_by_overlap: usize,
    pub appointments_still_conflicted: usize,
    pub exclusion_reasons: ExclusionReasons,
    pub category_breakdown: BTreeMap<String, usize>,
    pub exclusion_rate: f64,
    pub business_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TimesheetFiltered {
    /// Business appointments with overlaps resolved — the billing view.
    pub filtered: Vec<Appointment>,
    pub excluded: Vec<Appointment>,
    pub overlap_resolutions: Vec<ResolutionOutcome>,
    pub statistics: TimesheetStats,
}

/// True when the subject names travel.
pub fn detect_travel(appointment: &Appointment) -> bool {
    let subject = appointment.subject.to_lowercase();
    TRAVEL_KEYWORDS.iter().any(|k| subject.contains(k))
}

fn is_free(appointment: &Appointment) -> bool {
    appointment.show_as == ShowAs::Free
}

fn is_business_billing(billing: Option<BillingType>) -> bool {
    matches!(billing, Some(BillingType::Billable) | Some(BillingType::NonBillable))
}

/// Filter appointments for timesheet archiving with automatic overlap
/// resolution. Overlaps in the business set are always resolved — a billing
/// view never carries double-booked time.
pub fn filter_for_timesheet(appointments: &[Appointment], include_travel: bool) -> TimesheetFiltered {
    let mut result = TimesheetFiltered::default();
    if appointments.is_empty() {
        return result;
    }

    let mut business = Vec::new();
    for appointment in appointments {
        if is_free(appointment) {
            result.statistics.exclusion_reasons.free_status += 1;
            result.excluded.push(appointment.clone());
            continue;
        }
        if include_travel && detect_travel(appointment) {
            business.push(appointment.clone());
            continue;
        }
        let info = extract_billing_info(appointment);
        if info.is_personal {
            result.statistics.exclusion_reasons.personal += 1;
            result.excluded.push(appointment.clone());
            continue;
        }
        if is_business_billing(info.billing_type) {
            business.push(appointment.clone());
        } else {
            result.statistics.exclusion_reasons.invalid_category += 1;
            result.excluded.push(appointment.clone());
        }
    }

    let business_count = business.len();

    // Resolve overlaps inside the business set.
    let groups = tempo_overlap::detect_overlaps(&business);
    let overlapping: std::collections::HashSet<_> = groups
        .iter()
        .flatten()
        .map(Appointment::duplicate_key)
        .collect();

    for group in groups {
        let outcome = resolve_group(group);
        result.filtered.extend(outcome.resolved.iter().cloned());
        result.overlap_resolutions.push(outcome);
    }
    for appointment in business {
        if !overlapping.contains(&appointment.duplicate_key()) {
            result.filtered.push(appointment);
        }
    }

    // Statistics.
    let stats = &mut result.statistics;
    stats.total_appointments = appointments.len();
    stats.business_appointments = business_count;
    stats.excluded_appointments = result.excluded.len();
    stats.overlap_groups_processed = result.overlap_resolutions.len();
    for outcome in &result.overlap_resolutions {
        stats.appointments_resolved_by_overlap += outcome.resolved.len();
        stats.appointments_filtered_by_overlap += outcome.filtered.len();
        stats.appointments_still_conflicted += outcome.conflicts.len();
    }
    stats.exclusion_rate = stats.excluded_appointments as f64 / stats.total_appointments as f64;
    stats.business_rate = business_count as f64 / stats.total_appointments as f64;

    for appointment in &result.filtered {
        let bucket = if detect_travel(appointment) {
            "travel".to_string()
        } else {
            extract_billing_info(appointment)
                .billing_type
                .map(|b| b.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        };
        *stats.category_breakdown.entry(bucket).or_insert(0) += 1;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempo_proto::Importance;

    fn appt(subject: &str, categories: &[&str], show_as: ShowAs, start_h: u32, end_h: u32) -> Appointment {
        let mut appt = Appointment::new(
            1,
            "cal-1",
            subject,
            Utc.with_ymd_and_hms(2025, 6, 2, start_h, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, end_h, 0, 0).unwrap(),
        );
        appt.categories = categories.iter().map(|c| c.to_string()).collect();
        appt.show_as = show_as;
        appt
    }

    #[test]
    fn test_timesheet_filter_scenario() {
        let inputs = vec![
            appt("Client meeting", &["Acme - billable"], ShowAs::Busy, 9, 10),
            appt("Paperwork", &["admin - non-billable"], ShowAs::Busy, 10, 11),
            appt("Drive to client", &[], ShowAs::Busy, 11, 12),
            appt("Dentist", &[], ShowAs::Busy, 13, 14),
            appt("Focus time", &["Acme - billable"], ShowAs::Free, 14, 15),
        ];
        let result = filter_for_timesheet(&inputs, true);

        assert_eq!(result.filtered.len(), 3);
        assert_eq!(result.excluded.len(), 2);
        assert!((result.statistics.exclusion_rate - 0.4).abs() < 1e-9);
        assert_eq!(result.statistics.exclusion_reasons.personal, 1);
        assert_eq!(result.statistics.exclusion_reasons.free_status, 1);
        assert_eq!(result.statistics.category_breakdown.get("travel"), Some(&1));
        assert_eq!(result.statistics.category_breakdown.get("billable"), Some(&1));
        assert_eq!(
            result.statistics.category_breakdown.get("non-billable"),
            Some(&1)
        );
    }

    #[test]
    fn test_detect_travel_keywords() {
        assert!(detect_travel(&appt("Drive to client", &[], ShowAs::Busy, 9, 10)));
        assert!(detect_travel(&appt("Route planning for site visit", &[], ShowAs::Busy, 9, 10)));
        assert!(detect_travel(&appt("Flight to Berlin", &[], ShowAs::Busy, 9, 10)));
        assert!(!detect_travel(&appt("Quarterly review", &[], ShowAs::Busy, 9, 10)));
    }

    #[test]
    fn test_travel_excluded_when_disabled() {
        let inputs = vec![appt("Drive to client", &[], ShowAs::Busy, 11, 12)];
        let result = filter_for_timesheet(&inputs, false);
        // Without travel detection the uncategorized drive is personal.
        assert!(result.filtered.is_empty());
        assert_eq!(result.statistics.exclusion_reasons.personal, 1);
    }

    #[test]
    fn test_online_category_is_not_business() {
        let inputs = vec![appt("Webinar", &["online"], ShowAs::Busy, 9, 10)];
        let result = filter_for_timesheet(&inputs, true);
        assert!(result.filtered.is_empty());
        assert_eq!(result.statistics.exclusion_reasons.invalid_category, 1);
    }

    #[test]
    fn test_overlaps_resolved_in_business_set() {
        let mut important = appt("Board review", &["Acme - billable"], ShowAs::Busy, 9, 10);
        important.importance = Importance::High;
        let mut overlapping = appt("Sync", &["Acme - billable"], ShowAs::Busy, 9, 10);
        overlapping.start = Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap();
        overlapping.end = Utc.with_ymd_and_hms(2025, 6, 2, 10, 30, 0).unwrap();

        let result = filter_for_timesheet(&[important, overlapping], true);
        assert_eq!(result.filtered.len(), 1);
        assert_eq!(result.filtered[0].subject, "Board review");
        assert_eq!(result.statistics.appointments_filtered_by_overlap, 1);
    }

    #[test]
    fn test_empty_input() {
        let result = filter_for_timesheet(&[], true);
        assert!(result.filtered.is_empty());
        assert_eq!(result.statistics.total_appointments, 0);
        assert_eq!(result.statistics.exclusion_rate, 0.0);
    }
}
