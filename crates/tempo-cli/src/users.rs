//! CLI user resolution.
//!
//! `--user` accepts a numeric id or an email address; when absent, the
//! `TEMPO_USER` environment variable is consulted. Unknown emails are
//! registered on first use.

use serde::{Deserialize, Serialize};
use tempo_proto::User;
use tempo_store::Session;
use tracing::debug;

const TABLE: &str = "users";
pub const USER_ENV_VAR: &str = "TEMPO_USER";

#[derive(Debug, thiserror::Error)]
pub enum UserResolutionError {
    #[error("no user identifier given; pass --user <id-or-email> or set {USER_ENV_VAR}")]
    Missing,
    #[error("user {0} not found")]
    NotFound(i64),
    #[error("store error: {0}")]
    Store(#[from] tempo_store::StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRow {
    email: Option<String>,
    username: Option<String>,
}

pub struct UserStore {
    session: Session,
}

impl UserStore {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Resolve the CLI user input, falling back to the environment.
    pub fn resolve(&self, input: Option<&str>) -> Result<User, UserResolutionError> {
        let env_value = std::env::var(USER_ENV_VAR).ok();
        let value = input
            .map(str::to_string)
            .or(env_value)
            .ok_or(UserResolutionError::Missing)?;
        let value = value.trim();
        if value.is_empty() {
            return Err(UserResolutionError::Missing);
        }

        if let Ok(id) = value.parse::<i64>() {
            return self.by_id(id);
        }
        self.by_email(value)
    }

    fn by_id(&self, id: i64) -> Result<User, UserResolutionError> {
        let row = self
            .session
            .get(TABLE, id)
            .ok_or(UserResolutionError::NotFound(id))?;
        let row: UserRow = serde_json::from_value(row)?;
        Ok(User {
            id,
            email: row.email,
            username: row.username,
        })
    }

    fn by_email(&self, email: &str) -> Result<User, UserResolutionError> {
        for (id, row) in self.session.scan(TABLE) {
            let row: UserRow = serde_json::from_value(row)?;
            if row.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email)) {
                return Ok(User {
                    id,
                    email: row.email,
                    username: row.username,
                });
            }
        }
        // First use of this email: register the user.
        let row = UserRow {
            email: Some(email.to_string()),
            username: None,
        };
        let id = self.session.insert(TABLE, serde_json::to_value(&row)?);
        debug!(id, email, "registered new user");
        Ok(User::new(id, email))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_store::Database;

    fn store() -> UserStore {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path());
        UserStore::new(db.begin())
    }

    #[test]
    fn test_email_registers_and_reuses() {
        let store = store();
        let first = store.resolve(Some("bruce@company.com")).expect("resolve");
        let again = store.resolve(Some("BRUCE@company.com")).expect("resolve");
        assert_eq!(first.id, again.id);
        assert_eq!(again.email.as_deref(), Some("bruce@company.com"));
    }

    #[test]
    fn test_numeric_id_must_exist() {
        let store = store();
        let err = store.resolve(Some("42")).unwrap_err();
        assert!(matches!(err, UserResolutionError::NotFound(42)));

        let created = store.resolve(Some("bruce@company.com")).expect("resolve");
        let id_input = created.id.to_string();
        let by_id = store.resolve(Some(id_input.as_str())).expect("resolve");
        assert_eq!(by_id.email.as_deref(), Some("bruce@company.com"));
    }

    #[test]
    fn test_missing_identifier() {
        // The environment variable is not set under test.
        std::env::remove_var(USER_ENV_VAR);
        let store = store();
        assert!(matches!(
            store.resolve(None),
            Err(UserResolutionError::Missing)
        ));
    }
}
