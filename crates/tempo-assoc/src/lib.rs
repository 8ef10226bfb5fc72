//! Generic entity associations for Tempo.
//!
//! An association is an undirected-but-typed edge
//! `(source_type, source_id, target_type, target_id, association_type)`,
//! unique over the full tuple. Associations link audit records to
//! appointments, manual-action tasks to appointments, and so on, without a
//! dedicated join table per pair. Ids are strings so local surrogate ids
//! and provider-assigned ids can both be referenced.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_store::Session;
use tracing::debug;

const TABLE: &str = "entity_association";

#[derive(Debug, thiserror::Error)]
pub enum AssocError {
    #[error("duplicate association {0:?}")]
    Duplicate(AssociationKey),
    #[error("store error: {0}")]
    Store(#[from] tempo_store::StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The identity tuple of an association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationKey {
    pub source_type: String,
    pub source_id: String,
    pub target_type: String,
    pub target_id: String,
    pub association_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAssociation {
    pub id: Option<i64>,
    pub source_type: String,
    pub source_id: String,
    pub target_type: String,
    pub target_id: String,
    pub association_type: String,
    #[serde(with = "tempo_store::utc_naive")]
    pub created_at: DateTime<Utc>,
}

impl EntityAssociation {
    fn key(&self) -> AssociationKey {
        AssociationKey {
            source_type: self.source_type.clone(),
            source_id: self.source_id.clone(),
            target_type: self.target_type.clone(),
            target_id: self.target_id.clone(),
            association_type: self.association_type.clone(),
        }
    }
}

/// Session-backed association store.
pub struct AssociationStore {
    session: Session,
}

impl AssociationStore {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Create an association. A duplicate of the full tuple is an error.
    pub fn associate(
        &self,
        source_type: &str,
        source_id: &str,
        target_type: &str,
        target_id: &str,
        association_type: &str,
    ) -> Result<EntityAssociation, AssocError> {
        let mut assoc = EntityAssociation {
            id: None,
            source_type: source_type.to_string(),
            source_id: source_id.to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            association_type: association_type.to_string(),
            created_at: Utc::now(),
        };

        let key = assoc.key();
        if self.all()?.iter().any(|existing| existing.key() == key) {
            return Err(AssocError::Duplicate(key));
        }

        let id = self.session.insert(TABLE, serde_json::to_value(&assoc)?);
        assoc.id = Some(id);
        debug!(
            source = %format_args!("{source_type}:{source_id}"),
            target = %format_args!("{target_type}:{target_id}"),
            kind = association_type,
            "association created"
        );
        Ok(assoc)
    }

    /// Remove an association. Dissociating a missing tuple is a no-op.
    pub fn dissociate(
        &self,
        source_type: &str,
        source_id: &str,
        target_type: &str,
        target_id: &str,
        association_type: &str,
    ) -> Result<(), AssocError> {
        let key = AssociationKey {
            source_type: source_type.to_string(),
            source_id: source_id.to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            association_type: association_type.to_string(),
        };
        for assoc in self.all()? {
            if assoc.key() == key {
                if let Some(id) = assoc.id {
                    self.session.delete(TABLE, id)?;
                }
            }
        }
        Ok(())
    }

    pub fn list_by_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<Vec<EntityAssociation>, AssocError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|a| a.source_type == source_type && a.source_id == source_id)
            .collect())
    }

    pub fn list_by_target(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Result<Vec<EntityAssociation>, AssocError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|a| a.target_type == target_type && a.target_id == target_id)
            .collect())
    }

    /// All `(target_type, target_id)` related to a source entity, optionally
    /// restricted to one association type.
    pub fn get_related_entities(
        &self,
        source_type: &str,
        source_id: &str,
        association_type: Option<&str>,
    ) -> Result<Vec<(String, String)>, AssocError> {
        Ok(self
            .list_by_source(source_type, source_id)?
            .into_iter()
            .filter(|a| association_type.is_none_or(|t| a.association_type == t))
            .map(|a| (a.target_type, a.target_id))
            .collect())
    }

    fn all(&self) -> Result<Vec<EntityAssociation>, AssocError> {
        self.session
            .scan(TABLE)
            .into_iter()
            .map(|(id, row)| {
                let mut assoc: EntityAssociation = serde_json::from_value(row)?;
                assoc.id = Some(id);
                Ok(assoc)
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_store::Database;

    fn store() -> AssociationStore {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path());
        AssociationStore::new(db.begin())
    }

    #[test]
    fn test_associate_and_list() {
        let store = store();
        store
            .associate("action_log", "1", "appointment", "10", "overlap")
            .expect("associate");
        store
            .associate("action_log", "1", "appointment", "AAMkAD=", "overlap")
            .expect("associate");

        let from_source = store.list_by_source("action_log", "1").expect("list");
        assert_eq!(from_source.len(), 2);

        let from_target = store.list_by_target("appointment", "10").expect("list");
        assert_eq!(from_target.len(), 1);
        assert_eq!(from_target[0].source_id, "1");
    }

    #[test]
    fn test_duplicate_tuple_rejected() {
        let store = store();
        store
            .associate("action_log", "1", "appointment", "10", "overlap")
            .expect("associate");
        let err = store
            .associate("action_log", "1", "appointment", "10", "overlap")
            .unwrap_err();
        assert!(matches!(err, AssocError::Duplicate(_)));
    }

    #[test]
    fn test_same_pair_different_type_allowed() {
        let store = store();
        store
            .associate("chat_session", "3", "action_log", "7", "discussion")
            .expect("associate");
        store
            .associate("chat_session", "3", "action_log", "7", "recommendation")
            .expect("associate");
        assert_eq!(
            store.list_by_source("chat_session", "3").expect("list").len(),
            2
        );
    }

    #[test]
    fn test_dissociate_missing_is_noop() {
        let store = store();
        store
            .dissociate("action_log", "1", "appointment", "99", "overlap")
            .expect("dissociate");
    }

    #[test]
    fn test_dissociate_removes() {
        let store = store();
        store
            .associate("action_log", "1", "appointment", "10", "overlap")
            .expect("associate");
        store
            .dissociate("action_log", "1", "appointment", "10", "overlap")
            .expect("dissociate");
        assert!(store.list_by_source("action_log", "1").expect("list").is_empty());
    }

    #[test]
    fn test_get_related_entities_filter() {
        let store = store();
        store
            .associate("action_log", "1", "appointment", "10", "overlap")
            .expect("associate");
        store
            .associate("action_log", "1", "chat_session", "5", "discussion")
            .expect("associate");

        let all = store
            .get_related_entities("action_log", "1", None)
            .expect("related");
        assert_eq!(all.len(), 2);

        let overlaps = store
            .get_related_entities("action_log", "1", Some("overlap"))
            .expect("related");
        assert_eq!(overlaps, vec![("appointment".to_string(), "10".to_string())]);
    }
}
