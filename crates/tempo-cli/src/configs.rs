//! Archive-configuration store.
//!
//! Named per-user configurations pairing a source and destination calendar
//! URI with archiving policy. URIs are validated (and legacy forms
//! migrated) on write, so persisted configurations are always canonical.

use chrono::Utc;
use tempo_proto::{validate_config_name, ArchiveConfiguration, ArchivePurpose};
use tempo_store::Session;
use tempo_uri::{migrate_legacy_uri, parse_resource_uri};
use tracing::debug;

const TABLE: &str = "archive_configurations";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration name '{0}'")]
    InvalidName(String),
    #[error("configuration '{0}' already exists")]
    Duplicate(String),
    #[error("configuration '{0}' not found")]
    NotFound(String),
    #[error("configuration '{0}' is inactive")]
    Inactive(String),
    #[error("invalid calendar URI: {0}")]
    InvalidUri(#[from] tempo_uri::UriError),
    #[error("store error: {0}")]
    Store(#[from] tempo_store::StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct ConfigStore {
    session: Session,
}

impl ConfigStore {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        user_id: i64,
        name: &str,
        source_uri: &str,
        destination_uri: &str,
        timezone: &str,
        allow_overlaps: bool,
        archive_purpose: ArchivePurpose,
    ) -> Result<ArchiveConfiguration, ConfigError> {
        if !validate_config_name(name) {
            return Err(ConfigError::InvalidName(name.to_string()));
        }
        if self.find(user_id, name)?.is_some() {
            return Err(ConfigError::Duplicate(name.to_string()));
        }

        // Accept legacy URIs but always persist the canonical form.
        let source = migrate_legacy_uri(source_uri, None);
        parse_resource_uri(&source)?;
        let destination = migrate_legacy_uri(destination_uri, None);
        parse_resource_uri(&destination)?;

        let now = Utc::now();
        let mut config = ArchiveConfiguration {
            id: None,
            user_id,
            name: name.to_string(),
            source_calendar_uri: source,
            destination_calendar_uri: destination,
            is_active: true,
            timezone: timezone.to_string(),
            allow_overlaps,
            archive_purpose,
            created_at: now,
            updated_at: now,
        };
        let id = self.session.insert(TABLE, serde_json::to_value(&config)?);
        config.id = Some(id);
        debug!(name, user_id, "archive configuration created");
        Ok(config)
    }

    /// The configuration to run: must exist and be active.
    pub fn get_active(&self, user_id: i64, name: &str) -> Result<ArchiveConfiguration, ConfigError> {
        let config = self
            .find(user_id, name)?
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        if !config.is_active {
            return Err(ConfigError::Inactive(name.to_string()));
        }
        Ok(config)
    }

    pub fn list(&self, user_id: i64) -> Result<Vec<ArchiveConfiguration>, ConfigError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|c| c.user_id == user_id)
            .collect())
    }

    pub fn set_active(&self, user_id: i64, name: &str, active: bool) -> Result<(), ConfigError> {
        let mut config = self
            .find(user_id, name)?
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        config.is_active = active;
        config.updated_at = Utc::now();
        let id = config.id.unwrap_or_default();
        self.session.update(TABLE, id, serde_json::to_value(&config)?)?;
        Ok(())
    }

    fn find(&self, user_id: i64, name: &str) -> Result<Option<ArchiveConfiguration>, ConfigError> {
        Ok(self
            .all()?
            .into_iter()
            .find(|c| c.user_id == user_id && c.name == name))
    }

    fn all(&self) -> Result<Vec<ArchiveConfiguration>, ConfigError> {
        self.session
            .scan(TABLE)
            .into_iter()
            .map(|(id, row)| {
                let mut config: ArchiveConfiguration = serde_json::from_value(row)?;
                config.id = Some(id);
                Ok(config)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_store::Database;

    fn store() -> ConfigStore {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path());
        ConfigStore::new(db.begin())
    }

    #[test]
    fn test_create_and_get_active() {
        let store = store();
        store
            .create(
                1,
                "work-archive",
                "msgraph://calendars/primary",
                "local://calendars/archive",
                "Europe/Amsterdam",
                false,
                ArchivePurpose::General,
            )
            .expect("create");

        let config = store.get_active(1, "work-archive").expect("get");
        assert_eq!(config.destination_calendar_uri, "local://calendars/archive");
        assert!(!config.allow_overlaps);
    }

    #[test]
    fn test_legacy_uri_persisted_canonical() {
        let store = store();
        let config = store
            .create(
                1,
                "legacy",
                "msgraph://activity-archive",
                "local://backup",
                "UTC",
                true,
                ArchivePurpose::General,
            )
            .expect("create");
        assert_eq!(config.source_calendar_uri, "msgraph://calendars/activity-archive");
        assert_eq!(config.destination_calendar_uri, "local://calendars/backup");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let store = store();
        store
            .create(
                1,
                "work",
                "msgraph://calendars/primary",
                "local://calendars/archive",
                "UTC",
                false,
                ArchivePurpose::General,
            )
            .expect("create");
        let err = store
            .create(
                1,
                "work",
                "msgraph://calendars/primary",
                "local://calendars/archive",
                "UTC",
                false,
                ArchivePurpose::General,
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_inactive_config_refused() {
        let store = store();
        store
            .create(
                1,
                "work",
                "msgraph://calendars/primary",
                "local://calendars/archive",
                "UTC",
                false,
                ArchivePurpose::General,
            )
            .expect("create");
        store.set_active(1, "work", false).expect("deactivate");
        assert!(matches!(
            store.get_active(1, "work"),
            Err(ConfigError::Inactive(_))
        ));
    }

    #[test]
    fn test_scoped_per_user() {
        let store = store();
        store
            .create(
                1,
                "work",
                "msgraph://calendars/primary",
                "local://calendars/archive",
                "UTC",
                false,
                ArchivePurpose::General,
            )
            .expect("create");
        assert!(matches!(
            store.get_active(2, "work"),
            Err(ConfigError::NotFound(_))
        ));
        assert_eq!(store.list(1).expect("list").len(), 1);
        assert!(store.list(2).expect("list").is_empty());
    }
}
