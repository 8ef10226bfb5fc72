//! Remote calendar provider client and repository.
//!
//! A thin typed client over the provider's HTTP API (Microsoft-Graph-style
//! endpoints), plus the [`AppointmentRepository`] variant that maps provider
//! events into domain appointments at one boundary. The base URL is
//! injectable so tests can point the client at a fixture server.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tempo_proto::{Appointment, Importance, Sensitivity, ShowAs, User};
use tempo_uri::{CalendarDirectory, CalendarInfo, UriError};
use tracing::{debug, warn};

use crate::{AppointmentRepository, RepoError, TokenCache};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDateTime {
    pub date_time: String,
    pub time_zone: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub subject: Option<String>,
    pub start: Option<GraphDateTime>,
    pub end: Option<GraphDateTime>,
    pub categories: Vec<String>,
    pub show_as: Option<String>,
    pub sensitivity: Option<String>,
    pub importance: Option<String>,
    /// Serialized recurrence rule, when the event is a series master.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence_rule: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphCollection<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphCalendar {
    id: String,
    name: String,
    #[serde(default)]
    is_default_calendar: bool,
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Typed HTTP client for the calendar provider.
pub struct GraphCalendarClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCache>,
}

impl GraphCalendarClient {
    pub fn new(tokens: Arc<TokenCache>) -> Result<Self, RepoError> {
        Self::with_base_url(tokens, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(tokens: Arc<TokenCache>, base_url: &str) -> Result<Self, RepoError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| RepoError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn bearer(&self) -> Result<String, RepoError> {
        self.tokens.get().ok_or(RepoError::MissingToken)
    }

    /// Events in `[start_date, end_date]` on one calendar. An empty
    /// calendar id addresses the primary calendar.
    pub async fn list_events(
        &self,
        user_email: &str,
        calendar_id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<GraphEvent>, RepoError> {
        let path = if calendar_id.is_empty() {
            format!("{}/users/{user_email}/calendarView", self.base_url)
        } else {
            format!(
                "{}/users/{user_email}/calendars/{calendar_id}/calendarView",
                self.base_url
            )
        };
        let response = self
            .http
            .get(&path)
            .bearer_auth(self.bearer()?)
            .query(&[
                ("startDateTime", format!("{start_date}T00:00:00Z")),
                ("endDateTime", format!("{end_date}T23:59:59Z")),
            ])
            .send()
            .await
            .map_err(|e| RepoError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RepoError::Fetch(format!(
                "calendar view request failed: {}",
                response.status()
            )));
        }
        let collection: GraphCollection<GraphEvent> = response
            .json()
            .await
            .map_err(|e| RepoError::Fetch(e.to_string()))?;
        debug!(count = collection.value.len(), "fetched events from provider");
        Ok(collection.value)
    }

    pub async fn create_event(
        &self,
        user_email: &str,
        calendar_id: &str,
        event: &GraphEvent,
    ) -> Result<GraphEvent, RepoError> {
        let path = if calendar_id.is_empty() {
            format!("{}/users/{user_email}/events", self.base_url)
        } else {
            format!(
                "{}/users/{user_email}/calendars/{calendar_id}/events",
                self.base_url
            )
        };
        let response = self
            .http
            .post(&path)
            .bearer_auth(self.bearer()?)
            .json(event)
            .send()
            .await
            .map_err(|e| RepoError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RepoError::Add(format!(
                "event create failed: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RepoError::Add(e.to_string()))
    }

    pub async fn get_event(
        &self,
        user_email: &str,
        event_id: &str,
    ) -> Result<Option<GraphEvent>, RepoError> {
        let path = format!("{}/users/{user_email}/events/{event_id}", self.base_url);
        let response = self
            .http
            .get(&path)
            .bearer_auth(self.bearer()?)
            .send()
            .await
            .map_err(|e| RepoError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RepoError::Fetch(format!(
                "event fetch failed: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| RepoError::Fetch(e.to_string()))
    }

    pub async fn update_event(
        &self,
        user_email: &str,
        event_id: &str,
        event: &GraphEvent,
    ) -> Result<(), RepoError> {
        let path = format!("{}/users/{user_email}/events/{event_id}", self.base_url);
        let response = self
            .http
            .patch(&path)
            .bearer_auth(self.bearer()?)
            .json(event)
            .send()
            .await
            .map_err(|e| RepoError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RepoError::Add(format!(
                "event update failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn delete_event(&self, user_email: &str, event_id: &str) -> Result<(), RepoError> {
        let path = format!("{}/users/{user_email}/events/{event_id}", self.base_url);
        let response = self
            .http
            .delete(&path)
            .bearer_auth(self.bearer()?)
            .send()
            .await
            .map_err(|e| RepoError::Network(e.to_string()))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(RepoError::Add(format!(
                "event delete failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn list_calendars(&self, user_email: &str) -> Result<Vec<CalendarInfo>, RepoError> {
        let path = format!("{}/users/{user_email}/calendars", self.base_url);
        let response = self
            .http
            .get(&path)
            .bearer_auth(self.bearer()?)
            .query(&[("$select", "id,name,isDefaultCalendar")])
            .send()
            .await
            .map_err(|e| RepoError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RepoError::Fetch(format!(
                "calendar list failed: {}",
                response.status()
            )));
        }
        let collection: GraphCollection<GraphCalendar> = response
            .json()
            .await
            .map_err(|e| RepoError::Fetch(e.to_string()))?;
        Ok(collection
            .value
            .into_iter()
            .map(|c| CalendarInfo {
                id: c.id,
                name: c.name,
                is_default: c.is_default_calendar,
            })
            .collect())
    }
}

#[async_trait]
impl CalendarDirectory for GraphCalendarClient {
    async fn list_calendars(&self, user: &User) -> Result<Vec<CalendarInfo>, UriError> {
        let email = user
            .email
            .as_deref()
            .ok_or_else(|| UriError::Resolution("user has no email".to_string()))?;
        GraphCalendarClient::list_calendars(self, email)
            .await
            .map_err(|e| UriError::Resolution(e.to_string()))
    }
}

// ─── Boundary mapping ────────────────────────────────────────────────────────

fn parse_show_as(raw: Option<&str>) -> ShowAs {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("free") => ShowAs::Free,
        Some("tentative") => ShowAs::Tentative,
        Some("busy") => ShowAs::Busy,
        Some("oof") => ShowAs::Oof,
        Some("workingelsewhere") => ShowAs::WorkingElsewhere,
        _ => ShowAs::Unknown,
    }
}

fn parse_sensitivity(raw: Option<&str>) -> Sensitivity {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("personal") => Sensitivity::Personal,
        Some("private") => Sensitivity::Private,
        Some("confidential") => Sensitivity::Confidential,
        _ => Sensitivity::Normal,
    }
}

fn parse_importance(raw: Option<&str>) -> Importance {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("low") => Importance::Low,
        Some("high") => Importance::High,
        _ => Importance::Normal,
    }
}

fn render_show_as(show_as: ShowAs) -> &'static str {
    match show_as {
        ShowAs::Free => "free",
        ShowAs::Tentative => "tentative",
        ShowAs::Busy => "busy",
        ShowAs::Oof => "oof",
        ShowAs::WorkingElsewhere => "workingElsewhere",
        ShowAs::Unknown => "unknown",
    }
}

fn parse_graph_datetime(value: &GraphDateTime) -> Option<chrono::DateTime<chrono::Utc>> {
    // Provider timestamps are naive strings qualified by a zone name; only
    // UTC payloads are requested, so naive values are read as UTC.
    let naive = chrono::NaiveDateTime::parse_from_str(&value.date_time, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(&value.date_time, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    Some(chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc))
}

/// Map one provider event into the domain record. The raw payload is kept
/// verbatim so a reversed archive can reconstruct the event.
pub fn event_to_appointment(
    user: &User,
    calendar_id: &str,
    event: &GraphEvent,
) -> Option<Appointment> {
    let start = event.start.as_ref().and_then(parse_graph_datetime)?;
    let end = event.end.as_ref().and_then(parse_graph_datetime)?;

    let mut appointment = Appointment::new(
        user.id,
        calendar_id,
        event.subject.clone().unwrap_or_default(),
        start,
        end,
    );
    appointment.external_id = event.id.clone();
    appointment.categories = event.categories.clone();
    appointment.show_as = parse_show_as(event.show_as.as_deref());
    appointment.sensitivity = parse_sensitivity(event.sensitivity.as_deref());
    appointment.importance = parse_importance(event.importance.as_deref());
    appointment.recurrence = event.recurrence_rule.clone();
    appointment.provider_payload = serde_json::to_value(event).ok();
    Some(appointment)
}

/// Render a domain appointment as a provider event payload.
pub fn appointment_to_event(appointment: &Appointment) -> GraphEvent {
    GraphEvent {
        id: None,
        subject: Some(appointment.subject.clone()),
        start: Some(GraphDateTime {
            date_time: appointment.start.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string(),
            time_zone: "UTC".to_string(),
        }),
        end: Some(GraphDateTime {
            date_time: appointment.end.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string(),
            time_zone: "UTC".to_string(),
        }),
        categories: appointment.categories.clone(),
        show_as: Some(render_show_as(appointment.show_as).to_string()),
        sensitivity: Some(appointment.sensitivity.to_string()),
        importance: Some(appointment.importance.to_string()),
        recurrence_rule: appointment.recurrence.clone(),
    }
}

// ─── Remote repository ───────────────────────────────────────────────────────

/// Repository over the remote provider. No local persistence; archived
/// events are immutable on the provider side by convention.
pub struct RemoteAppointmentRepository {
    client: Arc<GraphCalendarClient>,
    user: User,
    calendar_id: String,
}

impl RemoteAppointmentRepository {
    pub fn new(client: Arc<GraphCalendarClient>, user: User, calendar_id: impl Into<String>) -> Self {
        Self {
            client,
            user,
            calendar_id: calendar_id.into(),
        }
    }

    fn email(&self) -> Result<&str, RepoError> {
        self.user
            .email
            .as_deref()
            .ok_or_else(|| RepoError::Fetch("user has no email".to_string()))
    }
}

#[async_trait]
impl AppointmentRepository for RemoteAppointmentRepository {
    fn calendar_id(&self) -> &str {
        &self.calendar_id
    }

    async fn list_for_user(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<Appointment>, RepoError> {
        let events = self
            .client
            .list_events(self.email()?, &self.calendar_id, start_date, end_date)
            .await?;
        let mut appointments = Vec::with_capacity(events.len());
        for event in &events {
            match event_to_appointment(&self.user, &self.calendar_id, event) {
                Some(appointment) => appointments.push(appointment),
                None => warn!(id = ?event.id, "skipping event without usable start/end"),
            }
        }
        Ok(appointments)
    }

    async fn add(&self, appointment: &Appointment) -> Result<Appointment, RepoError> {
        let event = appointment_to_event(appointment);
        let created = self
            .client
            .create_event(self.email()?, &self.calendar_id, &event)
            .await?;
        let mut stored = appointment.clone();
        stored.external_id = created.id;
        Ok(stored)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Appointment>, RepoError> {
        let event = self.client.get_event(self.email()?, id).await?;
        Ok(event.and_then(|e| event_to_appointment(&self.user, &self.calendar_id, &e)))
    }

    async fn update(&self, appointment: &Appointment) -> Result<(), RepoError> {
        let external_id = appointment
            .external_id
            .as_deref()
            .ok_or_else(|| RepoError::NotFound("<no external id>".to_string()))?;
        let event = appointment_to_event(appointment);
        self.client
            .update_event(self.email()?, external_id, &event)
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), RepoError> {
        self.client.delete_event(self.email()?, id).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn user() -> User {
        User::new(1, "bruce@company.com")
    }

    fn event() -> GraphEvent {
        GraphEvent {
            id: Some("AAMkAD=".to_string()),
            subject: Some("Quarterly review".to_string()),
            start: Some(GraphDateTime {
                date_time: "2025-06-02T09:00:00.0000000".to_string(),
                time_zone: "UTC".to_string(),
            }),
            end: Some(GraphDateTime {
                date_time: "2025-06-02T10:00:00".to_string(),
                time_zone: "UTC".to_string(),
            }),
            categories: vec!["Acme Corp - billable".to_string()],
            show_as: Some("busy".to_string()),
            sensitivity: Some("normal".to_string()),
            importance: Some("high".to_string()),
            recurrence_rule: None,
        }
    }

    #[test]
    fn test_event_to_appointment_mapping() {
        let appt = event_to_appointment(&user(), "cal-1", &event()).expect("mapped");
        assert_eq!(appt.subject, "Quarterly review");
        assert_eq!(appt.external_id.as_deref(), Some("AAMkAD="));
        assert_eq!(appt.start, Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap());
        assert_eq!(appt.end, Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap());
        assert_eq!(appt.show_as, ShowAs::Busy);
        assert_eq!(appt.importance, Importance::High);
        assert!(appt.provider_payload.is_some());
    }

    #[test]
    fn test_event_without_times_is_rejected() {
        let mut broken = event();
        broken.start = None;
        assert!(event_to_appointment(&user(), "cal-1", &broken).is_none());
    }

    #[test]
    fn test_show_as_round_trip() {
        for (raw, parsed) in [
            ("free", ShowAs::Free),
            ("tentative", ShowAs::Tentative),
            ("busy", ShowAs::Busy),
            ("oof", ShowAs::Oof),
            ("workingElsewhere", ShowAs::WorkingElsewhere),
            ("somethingNew", ShowAs::Unknown),
        ] {
            assert_eq!(parse_show_as(Some(raw)), parsed);
        }
        assert_eq!(render_show_as(ShowAs::WorkingElsewhere), "workingElsewhere");
    }

    #[test]
    fn test_appointment_to_event_renders_utc_naive() {
        let appt = Appointment::new(
            1,
            "cal-1",
            "Standup",
            Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 2, 9, 15, 0).unwrap(),
        );
        let event = appointment_to_event(&appt);
        let start = event.start.expect("start");
        assert_eq!(start.date_time, "2025-06-02T09:00:00");
        assert_eq!(start.time_zone, "UTC");
        assert!(event.id.is_none());
    }

    #[test]
    fn test_missing_token_is_typed_error() {
        let cache = Arc::new(TokenCache::new());
        let client = GraphCalendarClient::new(cache).expect("client");
        assert!(matches!(client.bearer(), Err(RepoError::MissingToken)));
    }
}
