//! UTC normalization and recurrence expansion for Tempo.
//!
//! Expands RFC 5545 recurrence rules over an inclusive date range: each
//! occurrence becomes a non-recurring instance that keeps the original
//! time-of-day and duration and references its series by external id.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rrule::RRuleSet;
use tempo_proto::Appointment;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RecurrenceError {
    #[error("invalid recurrence rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },
}

// ─── UTC normalization ───────────────────────────────────────────────────────

/// Interpret a naive timestamp as UTC.
pub fn naive_to_utc(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt, Utc)
}

/// Convert an offset-aware timestamp to UTC.
pub fn to_utc(dt: DateTime<FixedOffset>) -> DateTime<Utc> {
    dt.with_timezone(&Utc)
}

// ─── Expansion ───────────────────────────────────────────────────────────────

/// Expand recurring appointments to one instance per occurrence over
/// `[start_date, end_date]` (inclusive). Non-recurring appointments are kept
/// iff their start date falls inside the range.
pub fn expand_range(
    appointments: &[Appointment],
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<Vec<Appointment>, RecurrenceError> {
    let mut expanded = Vec::new();
    for appt in appointments {
        match &appt.recurrence {
            Some(rule) => {
                let mut day = start_date;
                while day <= end_date {
                    if occurs_on(appt, rule, day)? {
                        expanded.push(instance_for(appt, day));
                    }
                    match day.succ_opt() {
                        Some(next) => day = next,
                        None => break,
                    }
                }
            }
            None => {
                let start_day = appt.start.date_naive();
                if start_day >= start_date && start_day <= end_date {
                    expanded.push(appt.clone());
                }
            }
        }
    }
    debug!(
        input = appointments.len(),
        output = expanded.len(),
        "expanded recurring appointments"
    );
    Ok(expanded)
}

/// True when the appointment's rule produces an occurrence between the UTC
/// bounds of `target_date`.
pub fn occurs_on(
    appt: &Appointment,
    rule: &str,
    target_date: NaiveDate,
) -> Result<bool, RecurrenceError> {
    let set = rule_set(appt.start, rule)?;

    let day_start = target_date
        .and_time(chrono::NaiveTime::MIN)
        .and_utc()
        .with_timezone(&rrule::Tz::UTC);
    let day_end = (target_date.and_time(chrono::NaiveTime::MIN) + Duration::days(1)
        - Duration::milliseconds(1))
    .and_utc()
    .with_timezone(&rrule::Tz::UTC);

    let result = set.after(day_start).before(day_end).all(1);
    Ok(!result.dates.is_empty())
}

/// Build the non-recurring instance of `appt` on `target_date`: same
/// time-of-day, same duration, `recurrence = None`, series referenced by
/// external id.
pub fn instance_for(appt: &Appointment, target_date: NaiveDate) -> Appointment {
    let duration = appt.duration();
    let new_start = Utc
        .from_utc_datetime(&target_date.and_time(appt.start.time()));
    let mut instance = appt.clone();
    instance.id = None;
    instance.start = new_start;
    instance.end = new_start + duration;
    instance.recurrence = None;
    instance
}

fn rule_set(dtstart: DateTime<Utc>, rule: &str) -> Result<RRuleSet, RecurrenceError> {
    let body = rule.trim();
    let body = body.strip_prefix("RRULE:").unwrap_or(body);
    let source = format!(
        "DTSTART:{}\nRRULE:{}",
        dtstart.format("%Y%m%dT%H%M%SZ"),
        body
    );
    source
        .parse::<RRuleSet>()
        .map_err(|e| RecurrenceError::InvalidRule {
            rule: rule.to_string(),
            message: e.to_string(),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
