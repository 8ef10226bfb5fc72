//! Appointment repositories for Tempo.
//!
//! One trait, two variants: the remote calendar provider (HTTP, no local
//! persistence, inherently immutable once archived) and the local store
//! (transactional session, `is_archived` as the immutability gate). Bulk
//! adds report a string error per failed item instead of failing the call.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempo_proto::{Appointment, Importance, Sensitivity, ShowAs, User};
use tempo_store::Session;
use tracing::debug;

pub mod graph;

pub use graph::{GraphCalendarClient, RemoteAppointmentRepository};

const APPOINTMENTS_TABLE: &str = "appointments";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("add failed: {0}")]
    Add(String),
    #[error("appointment {0} not found")]
    NotFound(String),
    #[error("appointment {id} is archived and immutable for user {user_id}")]
    Immutable { id: String, user_id: i64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("no access token available")]
    MissingToken,
    #[error("store error: {0}")]
    Store(#[from] tempo_store::StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ─── Repository trait ────────────────────────────────────────────────────────

/// Outcome of a bulk add: the stored appointments plus one error string per
/// failed item. Per-item failures never fail the call.
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub added: Vec<Appointment>,
    pub errors: Vec<String>,
}

/// Capability set shared by the remote provider and the local store.
#[async_trait]
pub trait AppointmentRepository: Send + Sync {
    fn calendar_id(&self) -> &str;

    async fn list_for_user(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<Appointment>, RepoError>;

    async fn add(&self, appointment: &Appointment) -> Result<Appointment, RepoError>;

    /// Add many appointments, collecting per-item failures as strings.
    async fn add_bulk(&self, appointments: &[Appointment]) -> Result<BulkOutcome, RepoError> {
        let mut outcome = BulkOutcome::default();
        for appointment in appointments {
            match self.add(appointment).await {
                Ok(stored) => outcome.added.push(stored),
                Err(e) => outcome.errors.push(format!(
                    "Failed to archive appointment {}: {e}",
                    appointment.subject
                )),
            }
        }
        Ok(outcome)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Appointment>, RepoError>;

    async fn update(&self, appointment: &Appointment) -> Result<(), RepoError>;

    async fn delete(&self, id: &str) -> Result<(), RepoError>;

    /// Mark stored rows immutable. Remote calendars are immutable by
    /// convention once archived, so the default is a no-op.
    async fn make_immutable(&self, _ids: &[i64]) -> Result<usize, RepoError> {
        Ok(0)
    }

    /// Return the candidates that are not already present in the
    /// destination over the given range. Duplicates are skipped silently;
    /// the caller records them.
    async fn check_for_duplicates(
        &self,
        candidates: &[Appointment],
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<Appointment>, RepoError> {
        let existing = self.list_for_user(start_date, end_date).await?;
        let keys: std::collections::HashSet<_> =
            existing.iter().map(|a| a.duplicate_key()).collect();
        Ok(candidates
            .iter()
            .filter(|c| !keys.contains(&c.duplicate_key()))
            .cloned()
            .collect())
    }
}

// ─── Token cache ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Process-wide access-token cache. Writers serialize on the lock; readers
/// share it. Token acquisition itself is outside this system — the cache
/// only stores what it is given.
#[derive(Default)]
pub struct TokenCache {
    inner: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, token: impl Into<String>, expires_at: DateTime<Utc>) {
        *self.inner.write() = Some(CachedToken {
            token: token.into(),
            expires_at,
        });
    }

    /// The cached token, if present and not expired.
    pub fn get(&self) -> Option<String> {
        let guard = self.inner.read();
        guard
            .as_ref()
            .filter(|t| t.expires_at > Utc::now())
            .map(|t| t.token.clone())
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

// ─── Local repository ────────────────────────────────────────────────────────

/// Stored row shape: datetime columns hold UTC-naive strings, the domain
/// layer exchanges `DateTime<Utc>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAppointment {
    external_id: Option<String>,
    user_id: i64,
    calendar_id: String,
    subject: String,
    #[serde(with = "tempo_store::utc_naive")]
    start: DateTime<Utc>,
    #[serde(with = "tempo_store::utc_naive")]
    end: DateTime<Utc>,
    recurrence: Option<String>,
    categories: Vec<String>,
    show_as: ShowAs,
    sensitivity: Sensitivity,
    importance: Importance,
    is_archived: bool,
    provider_payload: Option<serde_json::Value>,
    #[serde(with = "tempo_store::utc_naive")]
    created_at: DateTime<Utc>,
    #[serde(with = "tempo_store::utc_naive")]
    updated_at: DateTime<Utc>,
}

impl StoredAppointment {
    fn from_domain(appointment: &Appointment) -> Self {
        let now = Utc::now();
        Self {
            external_id: appointment.external_id.clone(),
            user_id: appointment.user_id,
            calendar_id: appointment.calendar_id.clone(),
            subject: appointment.subject.clone(),
            start: appointment.start,
            end: appointment.end,
            recurrence: appointment.recurrence.clone(),
            categories: appointment.categories.clone(),
            show_as: appointment.show_as,
            sensitivity: appointment.sensitivity,
            importance: appointment.importance,
            is_archived: appointment.is_archived,
            provider_payload: appointment.provider_payload.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    fn into_domain(self, id: i64) -> Appointment {
        Appointment {
            id: Some(id),
            external_id: self.external_id,
            user_id: self.user_id,
            calendar_id: self.calendar_id,
            subject: self.subject,
            start: self.start,
            end: self.end,
            recurrence: self.recurrence,
            categories: self.categories,
            show_as: self.show_as,
            sensitivity: self.sensitivity,
            importance: self.importance,
            is_archived: self.is_archived,
            provider_payload: self.provider_payload,
        }
    }
}

/// Session-backed appointment store. Writes commit (or vanish) with the
/// owning archival run's session.
pub struct LocalAppointmentRepository {
    session: Session,
    user: User,
    calendar_id: String,
}

impl LocalAppointmentRepository {
    pub fn new(session: Session, user: User, calendar_id: impl Into<String>) -> Self {
        Self {
            session,
            user,
            calendar_id: calendar_id.into(),
        }
    }

    fn load(&self, id: i64) -> Result<Option<StoredAppointment>, RepoError> {
        match self.session.get(APPOINTMENTS_TABLE, id) {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    fn guard_mutable(&self, id: &str, stored: &StoredAppointment) -> Result<(), RepoError> {
        if stored.is_archived && stored.user_id != self.user.id {
            return Err(RepoError::Immutable {
                id: id.to_string(),
                user_id: self.user.id,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AppointmentRepository for LocalAppointmentRepository {
    fn calendar_id(&self) -> &str {
        &self.calendar_id
    }

    async fn list_for_user(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<Appointment>, RepoError> {
        let mut appointments = Vec::new();
        for (id, row) in self.session.scan(APPOINTMENTS_TABLE) {
            let stored: StoredAppointment = serde_json::from_value(row)?;
            if stored.user_id != self.user.id || stored.calendar_id != self.calendar_id {
                continue;
            }
            let day = stored.start.date_naive();
            if day >= start_date && day <= end_date {
                appointments.push(stored.into_domain(id));
            }
        }
        Ok(appointments)
    }

    async fn add(&self, appointment: &Appointment) -> Result<Appointment, RepoError> {
        let mut stored = StoredAppointment::from_domain(appointment);
        stored.calendar_id = self.calendar_id.clone();
        let id = self
            .session
            .insert(APPOINTMENTS_TABLE, serde_json::to_value(&stored)?);
        Ok(stored.into_domain(id))
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Appointment>, RepoError> {
        let Ok(numeric) = id.parse::<i64>() else {
            return Ok(None);
        };
        Ok(self.load(numeric)?.map(|s| s.into_domain(numeric)))
    }

    async fn update(&self, appointment: &Appointment) -> Result<(), RepoError> {
        let id = appointment
            .id
            .ok_or_else(|| RepoError::NotFound("<unsaved>".to_string()))?;
        let stored = self
            .load(id)?
            .ok_or_else(|| RepoError::NotFound(id.to_string()))?;
        self.guard_mutable(&id.to_string(), &stored)?;

        let mut updated = StoredAppointment::from_domain(appointment);
        updated.created_at = stored.created_at;
        updated.updated_at = Utc::now();
        self.session
            .update(APPOINTMENTS_TABLE, id, serde_json::to_value(&updated)?)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RepoError> {
        let numeric = id
            .parse::<i64>()
            .map_err(|_| RepoError::NotFound(id.to_string()))?;
        let stored = self
            .load(numeric)?
            .ok_or_else(|| RepoError::NotFound(id.to_string()))?;
        self.guard_mutable(id, &stored)?;
        self.session.delete(APPOINTMENTS_TABLE, numeric)?;
        Ok(())
    }

    /// Set `is_archived` on the given rows. Archived rows reject mutation
    /// by anyone but their owner.
    async fn make_immutable(&self, ids: &[i64]) -> Result<usize, RepoError> {
        let mut marked = 0;
        for &id in ids {
            let Some(row) = self.session.get(APPOINTMENTS_TABLE, id) else {
                continue;
            };
            let mut stored: StoredAppointment = serde_json::from_value(row)?;
            if !stored.is_archived {
                stored.is_archived = true;
                stored.updated_at = Utc::now();
                self.session
                    .update(APPOINTMENTS_TABLE, id, serde_json::to_value(&stored)?)?;
                marked += 1;
            }
        }
        debug!(marked, "appointments marked immutable");
        Ok(marked)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempo_store::Database;

    fn repo_for(user: User) -> LocalAppointmentRepository {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path());
        LocalAppointmentRepository::new(db.begin(), user, "archive-cal")
    }

    fn appt(user_id: i64, subject: &str, day: u32) -> Appointment {
        Appointment::new(
            user_id,
            "archive-cal",
            subject,
            Utc.with_ymd_and_hms(2025, 6, day, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, day, 10, 0, 0).unwrap(),
        )
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_list_range() {
        let repo = repo_for(User::new(1, "bruce@company.com"));
        repo.add(&appt(1, "Inside", 3)).await.expect("add");
        repo.add(&appt(1, "Outside", 20)).await.expect("add");

        let listed = repo.list_for_user(date(1), date(7)).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].subject, "Inside");
        assert!(listed[0].id.is_some());
    }

    #[tokio::test]
    async fn test_list_scoped_to_user() {
        let repo = repo_for(User::new(1, "bruce@company.com"));
        repo.add(&appt(1, "Mine", 3)).await.expect("add");
        let mut other = appt(2, "Theirs", 3);
        other.user_id = 2;
        // Insert the other user's row directly through a second repo view.
        let other_repo = LocalAppointmentRepository::new(
            repo.session.clone(),
            User::new(2, "jane@company.com"),
            "archive-cal",
        );
        other_repo.add(&other).await.expect("add");

        let listed = repo.list_for_user(date(1), date(7)).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].subject, "Mine");
    }

    #[tokio::test]
    async fn test_get_update_delete() {
        let repo = repo_for(User::new(1, "bruce@company.com"));
        let mut stored = repo.add(&appt(1, "Planning", 3)).await.expect("add");
        let id = stored.id.unwrap().to_string();

        let fetched = repo.get_by_id(&id).await.expect("get").expect("present");
        assert_eq!(fetched.subject, "Planning");

        stored.end = stored.end + Duration::minutes(30);
        repo.update(&stored).await.expect("update");
        let fetched = repo.get_by_id(&id).await.expect("get").expect("present");
        assert_eq!(fetched.end, stored.end);

        repo.delete(&id).await.expect("delete");
        assert!(repo.get_by_id(&id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_archived_is_immutable_for_other_users() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path());
        let session = db.begin();
        let owner_repo = LocalAppointmentRepository::new(
            session.clone(),
            User::new(1, "bruce@company.com"),
            "archive-cal",
        );
        let other_repo = LocalAppointmentRepository::new(
            session.clone(),
            User::new(2, "jane@company.com"),
            "archive-cal",
        );

        let stored = owner_repo.add(&appt(1, "Planning", 3)).await.expect("add");
        let id = stored.id.unwrap();
        owner_repo.make_immutable(&[id]).await.expect("immutable");

        // A different user can neither update nor delete.
        let mut mutated = stored.clone();
        mutated.is_archived = true;
        mutated.subject = "Tampered".to_string();
        let err = other_repo.update(&mutated).await.unwrap_err();
        assert!(matches!(err, RepoError::Immutable { .. }));
        let err = other_repo.delete(&id.to_string()).await.unwrap_err();
        assert!(matches!(err, RepoError::Immutable { .. }));

        // The owner still can.
        owner_repo.delete(&id.to_string()).await.expect("owner delete");
    }

    #[tokio::test]
    async fn test_make_immutable_counts_only_changes() {
        let repo = repo_for(User::new(1, "bruce@company.com"));
        let a = repo.add(&appt(1, "A", 3)).await.expect("add");
        let ids = [a.id.unwrap()];
        assert_eq!(repo.make_immutable(&ids).await.expect("immutable"), 1);
        assert_eq!(repo.make_immutable(&ids).await.expect("immutable"), 0);
    }

    #[tokio::test]
    async fn test_add_bulk_returns_stored_rows() {
        let repo = repo_for(User::new(1, "bruce@company.com"));
        let outcome = repo
            .add_bulk(&[appt(1, "A", 3), appt(1, "B", 4)])
            .await
            .expect("bulk");
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.added.len(), 2);
        assert!(outcome.added.iter().all(|a| a.id.is_some()));
        assert_eq!(repo.list_for_user(date(1), date(7)).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn test_check_for_duplicates() {
        let repo = repo_for(User::new(1, "bruce@company.com"));
        repo.add(&appt(1, "Existing", 3)).await.expect("add");

        let fresh = appt(1, "Fresh", 4);
        let non_dupes = repo
            .check_for_duplicates(&[appt(1, "Existing", 3), fresh.clone()], date(1), date(7))
            .await
            .expect("check");
        assert_eq!(non_dupes.len(), 1);
        assert_eq!(non_dupes[0].subject, "Fresh");
    }

    #[test]
    fn test_token_cache_expiry() {
        let cache = TokenCache::new();
        assert!(cache.get().is_none());

        cache.store("tok-live", Utc::now() + Duration::minutes(5));
        assert_eq!(cache.get().as_deref(), Some("tok-live"));

        cache.store("tok-stale", Utc::now() - Duration::minutes(5));
        assert!(cache.get().is_none());

        cache.store("tok-live", Utc::now() + Duration::minutes(5));
        cache.clear();
        assert!(cache.get().is_none());
    }
}
