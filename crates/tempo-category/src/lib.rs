//! Category parsing and privacy automation for Tempo.
//!
//! Provider categories follow `"<customer> - <billing type>"` in either
//! order. Appointments with no categories at all are personal and get
//! their sensitivity flipped to private; appointments whose categories all
//! fail to parse are misconfigured work, not personal.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tempo_proto::{Appointment, Sensitivity};
use tracing::debug;

const SEPARATOR: &str = " - ";

// ─── Billing type ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingType {
    Billable,
    NonBillable,
    Online,
}

impl BillingType {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "billable" => Some(Self::Billable),
            "non-billable" => Some(Self::NonBillable),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Billable => "billable",
            Self::NonBillable => "non-billable",
            Self::Online => "online",
        };
        write!(f, "{s}")
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// Parse one category string to `(customer, billing_type)`.
///
/// Recognized specials: `admin - non-billable`, `break - non-billable`,
/// and `online` (customer `Online`, billing type `online`).
pub fn parse_category(raw: &str) -> Option<(String, BillingType)> {
    let cleaned = raw.trim().to_lowercase();
    if cleaned.is_empty() {
        return None;
    }

    match cleaned.as_str() {
        "online" => return Some(("Online".to_string(), BillingType::Online)),
        "admin - non-billable" => return Some(("Admin".to_string(), BillingType::NonBillable)),
        "break - non-billable" => return Some(("Break".to_string(), BillingType::NonBillable)),
        _ => {}
    }

    let mut parts = raw.split(SEPARATOR);
    let (Some(first), Some(second), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };
    let first = first.trim();
    let second = second.trim();
    if first.is_empty() || second.is_empty() {
        return None;
    }

    if let Some(billing) = BillingType::from_token(&second.to_lowercase()) {
        return Some((first.to_string(), billing));
    }
    if let Some(billing) = BillingType::from_token(&first.to_lowercase()) {
        return Some((second.to_string(), billing));
    }
    None
}

/// True for the special categories (`admin`, `break`, `online`).
pub fn is_special_category(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "admin - non-billable" | "break - non-billable" | "online"
    )
}

// ─── Validation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryValidation {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
    pub issues: Vec<String>,
}

/// Validate a list of category strings, collecting a specific issue per
/// rejected category.
pub fn validate_categories(categories: &[String]) -> CategoryValidation {
    let mut result = CategoryValidation::default();

    for category in categories {
        if category.trim().is_empty() {
            result.invalid.push(category.clone());
            result
                .issues
                .push(format!("Empty category: {category}"));
            continue;
        }

        if parse_category(category).is_some() {
            result.valid.push(category.clone());
            continue;
        }

        result.invalid.push(category.clone());
        let parts: Vec<&str> = category.split(SEPARATOR).collect();
        if !category.contains(SEPARATOR) {
            result
                .issues
                .push(format!("Missing ' - ' separator in category: {category}"));
        } else if parts.len() != 2 {
            result
                .issues
                .push(format!("Too many ' - ' separators in category: {category}"));
        } else if parts[0].trim().is_empty() {
            result
                .issues
                .push(format!("Empty customer name in category: {category}"));
        } else {
            result
                .issues
                .push(format!("Invalid billing type in category: {category}"));
        }
    }

    result
}

// ─── Per-appointment extraction ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingInfo {
    pub customer: Option<String>,
    pub billing_type: Option<BillingType>,
    pub is_valid: bool,
    /// True iff the appointment has no categories at all.
    pub is_personal: bool,
    pub issues: Vec<String>,
    pub categories_found: Vec<String>,
}

/// Extract customer and billing information from an appointment's
/// categories. Multiple valid categories pick the first and record an issue.
pub fn extract_billing_info(appointment: &Appointment) -> BillingInfo {
    let mut info = BillingInfo {
        categories_found: appointment.categories.clone(),
        ..BillingInfo::default()
    };

    if appointment.categories.is_empty() {
        info.is_personal = true;
        info.issues
            .push("No categories found - treating as personal appointment".to_string());
        return info;
    }

    let validation = validate_categories(&appointment.categories);

    if let Some(first_valid) = validation.valid.first() {
        if let Some((customer, billing)) = parse_category(first_valid) {
            info.customer = Some(customer);
            info.billing_type = Some(billing);
            info.is_valid = true;
        }
        if validation.valid.len() > 1 {
            info.issues.push(format!(
                "Multiple valid categories found, using first: {first_valid}"
            ));
        }
    }

    info.issues.extend(validation.issues);
    info
}

/// Privacy rule: exactly the personal appointments are marked private.
pub fn should_mark_private(appointment: &Appointment) -> bool {
    extract_billing_info(appointment).is_personal
}

/// Flip sensitivity to private on every personal appointment. Returns the
/// number of appointments changed.
pub fn apply_privacy(appointments: &mut [Appointment]) -> usize {
    let mut applied = 0;
    for appt in appointments.iter_mut() {
        if should_mark_private(appt) {
            appt.sensitivity = Sensitivity::Private;
            applied += 1;
        }
    }
    debug!(applied, "privacy automation applied");
    applied
}

// ─── Batch statistics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total_appointments: usize,
    pub appointments_with_categories: usize,
    pub personal_appointments: usize,
    pub valid_categories: usize,
    pub invalid_categories: usize,
    /// Distinct customers, sorted.
    pub customers: Vec<String>,
    pub billing_types: BTreeMap<String, usize>,
    pub issues: Vec<String>,
}

/// Category statistics across an archival run's appointment set.
pub fn category_statistics(appointments: &[Appointment]) -> CategoryStats {
    let mut stats = CategoryStats {
        total_appointments: appointments.len(),
        ..CategoryStats::default()
    };
    let mut customers = std::collections::BTreeSet::new();

    for appt in appointments {
        let info = extract_billing_info(appt);

        if !info.categories_found.is_empty() {
            stats.appointments_with_categories += 1;
        }
        if info.is_personal {
            stats.personal_appointments += 1;
        }
        if info.is_valid {
            stats.valid_categories += 1;
            if let Some(customer) = &info.customer {
                customers.insert(customer.clone());
            }
            if let Some(billing) = info.billing_type {
                *stats.billing_types.entry(billing.to_string()).or_insert(0) += 1;
            }
        } else {
            stats.invalid_categories += 1;
        }
        stats.issues.extend(info.issues);
    }

    stats.customers = customers.into_iter().collect();
    stats
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn appt_with(categories: &[&str]) -> Appointment {
        let mut appt = Appointment::new(
            1,
            "cal-1",
            "Planning",
            Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
        );
        appt.categories = categories.iter().map(|c| c.to_string()).collect();
        appt
    }

    #[test]
    fn test_parse_standard_order() {
        assert_eq!(
            parse_category("Acme Corp - billable"),
            Some(("Acme Corp".to_string(), BillingType::Billable))
        );
        assert_eq!(
            parse_category("Client XYZ - non-billable"),
            Some(("Client XYZ".to_string(), BillingType::NonBillable))
        );
    }

    #[test]
    fn test_parse_reversed_order() {
        assert_eq!(
            parse_category("Billable - Acme Corp"),
            Some(("Acme Corp".to_string(), BillingType::Billable))
        );
        assert_eq!(
            parse_category("non-billable - Client XYZ"),
            Some(("Client XYZ".to_string(), BillingType::NonBillable))
        );
    }

    #[test]
    fn test_parse_specials() {
        assert_eq!(
            parse_category("admin - non-billable"),
            Some(("Admin".to_string(), BillingType::NonBillable))
        );
        assert_eq!(
            parse_category("Break - Non-Billable"),
            Some(("Break".to_string(), BillingType::NonBillable))
        );
        assert_eq!(
            parse_category("online"),
            Some(("Online".to_string(), BillingType::Online))
        );
        assert!(is_special_category(" Online "));
        assert!(!is_special_category("Acme - billable"));
    }

    #[test]
    fn test_parse_rejections() {
        assert_eq!(parse_category("Invalid Category"), None);
        assert_eq!(parse_category("A - B - C"), None);
        assert_eq!(parse_category(" - billable"), None);
        assert_eq!(parse_category(""), None);
        assert_eq!(parse_category("Acme - hourly"), None);
    }

    #[test]
    fn test_validate_issue_phrasing() {
        let result = validate_categories(&[
            "Acme - billable".to_string(),
            "No separator".to_string(),
            "A - B - C".to_string(),
            "Acme - weekly".to_string(),
        ]);
        assert_eq!(result.valid.len(), 1);
        assert_eq!(result.invalid.len(), 3);
        assert!(result.issues[0].contains("Missing ' - ' separator"));
        assert!(result.issues[1].contains("Too many ' - ' separators"));
        assert!(result.issues[2].contains("Invalid billing type"));
    }

    #[test]
    fn test_extract_personal_when_no_categories() {
        let info = extract_billing_info(&appt_with(&[]));
        assert!(info.is_personal);
        assert!(!info.is_valid);
        assert!(info.customer.is_none());
        assert!(info.issues[0].contains("personal"));
    }

    #[test]
    fn test_extract_misconfigured_work_is_not_personal() {
        let info = extract_billing_info(&appt_with(&["Not A Valid Format"]));
        assert!(!info.is_personal);
        assert!(!info.is_valid);
    }

    #[test]
    fn test_extract_multiple_valid_picks_first_and_records_issue() {
        let info = extract_billing_info(&appt_with(&["Acme - billable", "Beta - non-billable"]));
        assert_eq!(info.customer.as_deref(), Some("Acme"));
        assert_eq!(info.billing_type, Some(BillingType::Billable));
        assert!(info
            .issues
            .iter()
            .any(|i| i.contains("Multiple valid categories")));
    }

    #[test]
    fn test_should_mark_private_only_personal() {
        assert!(should_mark_private(&appt_with(&[])));
        assert!(!should_mark_private(&appt_with(&["Acme - billable"])));
        assert!(!should_mark_private(&appt_with(&["garbage"])));
    }

    #[test]
    fn test_apply_privacy() {
        let mut appts = vec![appt_with(&[]), appt_with(&["Acme - billable"])];
        let applied = apply_privacy(&mut appts);
        assert_eq!(applied, 1);
        assert_eq!(appts[0].sensitivity, Sensitivity::Private);
        assert_eq!(appts[1].sensitivity, Sensitivity::Normal);
    }

    #[test]
    fn test_category_statistics() {
        let appts = vec![
            appt_with(&["Acme - billable"]),
            appt_with(&["Acme - billable"]),
            appt_with(&["Beta - non-billable"]),
            appt_with(&["broken category"]),
            appt_with(&[]),
        ];
        let stats = category_statistics(&appts);
        assert_eq!(stats.total_appointments, 5);
        assert_eq!(stats.appointments_with_categories, 4);
        assert_eq!(stats.personal_appointments, 1);
        assert_eq!(stats.valid_categories, 3);
        assert_eq!(stats.invalid_categories, 2);
        assert_eq!(stats.customers, vec!["Acme".to_string(), "Beta".to_string()]);
        assert_eq!(stats.billing_types.get("billable"), Some(&2));
        assert_eq!(stats.billing_types.get("non-billable"), Some(&1));
        assert!(!stats.issues.is_empty());
    }
}
