//! Shared fixtures: an in-memory source repository and an archive harness
//! wiring the orchestrator to a temp-dir database.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempo_archive::{ArchiveOrchestrator, ArchiveRequest, RepositoryProvider};
use tempo_proto::{
    Appointment, ArchivePurpose, CancelToken, Importance, Sensitivity, ShowAs, User,
};
use tempo_repo::{AppointmentRepository, LocalAppointmentRepository, RepoError};
use tempo_store::{Database, Session};
use tempo_uri::{CalendarDirectory, CalendarInfo, UriError};

/// In-memory stand-in for the remote calendar provider.
pub struct FixtureRepository {
    pub events: Mutex<Vec<Appointment>>,
    pub list_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl FixtureRepository {
    pub fn with_events(events: Vec<Appointment>) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(events),
            list_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        })
    }
}

#[async_trait]
impl AppointmentRepository for FixtureRepository {
    fn calendar_id(&self) -> &str {
        ""
    }

    async fn list_for_user(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<Appointment>, RepoError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|a| {
                let day = a.start.date_naive();
                day >= start_date && day <= end_date
            })
            .cloned()
            .collect())
    }

    async fn add(&self, appointment: &Appointment) -> Result<Appointment, RepoError> {
        let mut stored = appointment.clone();
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        stored.external_id = Some(format!("evt-{n}"));
        self.events.lock().push(stored.clone());
        Ok(stored)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Appointment>, RepoError> {
        Ok(self
            .events
            .lock()
            .iter()
            .find(|a| a.external_id.as_deref() == Some(id))
            .cloned())
    }

    async fn update(&self, appointment: &Appointment) -> Result<(), RepoError> {
        let mut events = self.events.lock();
        match events
            .iter_mut()
            .find(|a| a.external_id == appointment.external_id)
        {
            Some(slot) => {
                *slot = appointment.clone();
                Ok(())
            }
            None => Err(RepoError::NotFound(
                appointment.external_id.clone().unwrap_or_default(),
            )),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), RepoError> {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|a| a.external_id.as_deref() != Some(id));
        if events.len() == before {
            return Err(RepoError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Routes `msgraph` to the fixture and `local` to the session-backed store.
pub struct TestProvider {
    pub session: Session,
    pub source: Arc<FixtureRepository>,
}

#[async_trait]
impl RepositoryProvider for TestProvider {
    async fn repository(
        &self,
        user: &User,
        scheme: &str,
        calendar_id: &str,
    ) -> Result<Arc<dyn AppointmentRepository>, RepoError> {
        if scheme == "local" {
            Ok(Arc::new(LocalAppointmentRepository::new(
                self.session.clone(),
                user.clone(),
                calendar_id,
            )))
        } else {
            Ok(self.source.clone())
        }
    }
}

pub struct EmptyDirectory;

#[async_trait]
impl CalendarDirectory for EmptyDirectory {
    async fn list_calendars(&self, _user: &User) -> Result<Vec<CalendarInfo>, UriError> {
        Ok(Vec::new())
    }
}

/// One archive run wired against a fresh temp database.
pub struct Harness {
    pub db: Database,
    pub session: Session,
    pub source: Arc<FixtureRepository>,
    pub orchestrator: ArchiveOrchestrator,
    pub user: User,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(events: Vec<Appointment>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path());
        let session = db.begin();
        let source = FixtureRepository::with_events(events);
        let provider = Arc::new(TestProvider {
            session: session.clone(),
            source: source.clone(),
        });
        let orchestrator =
            ArchiveOrchestrator::new(session.clone(), Arc::new(EmptyDirectory), provider);
        Self {
            db,
            session,
            source,
            orchestrator,
            user: User::new(1, "bruce@company.com"),
            _dir: dir,
        }
    }

    pub fn request(&self) -> ArchiveRequest {
        ArchiveRequest {
            user: self.user.clone(),
            source_uri: "msgraph://calendars/primary".to_string(),
            destination_uri: "local://calendars/archive".to_string(),
            start_date: day(2),
            end_date: day(2),
            allow_overlaps: false,
            archive_purpose: ArchivePurpose::General,
            include_travel: false,
            cancel: CancelToken::new(),
        }
    }

    /// What landed in the local archive calendar, in insertion order.
    pub async fn archived(&self) -> Vec<Appointment> {
        let repo = LocalAppointmentRepository::new(
            self.session.clone(),
            self.user.clone(),
            "archive",
        );
        repo.list_for_user(day(1), day(28)).await.expect("list archive")
    }
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
}

#[allow(clippy::too_many_arguments)]
pub fn appt(
    subject: &str,
    d: u32,
    start_h: u32,
    start_m: u32,
    end_h: u32,
    end_m: u32,
    show_as: ShowAs,
    importance: Importance,
) -> Appointment {
    let mut appt = Appointment::new(
        1,
        "primary",
        subject,
        Utc.with_ymd_and_hms(2025, 6, d, start_h, start_m, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 6, d, end_h, end_m, 0).unwrap(),
    );
    appt.external_id = Some(format!("src-{subject}-{d}-{start_h}{start_m}"));
    appt.show_as = show_as;
    appt.importance = importance;
    appt.sensitivity = Sensitivity::Normal;
    appt
}

pub fn busy(subject: &str, start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> Appointment {
    appt(subject, 2, start_h, start_m, end_h, end_m, ShowAs::Busy, Importance::Normal)
}
