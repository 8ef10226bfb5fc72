//! Manual-action task log for Tempo.
//!
//! Everything the pipeline cannot resolve mechanically lands here for a
//! human: residual overlap conflicts, category-validation issues. Task state
//! only moves forward: open → needs_user_action → resolved → archived.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tempo_store::Session;
use tracing::debug;

const TABLE: &str = "action_log";

#[derive(Debug, thiserror::Error)]
pub enum ActionLogError {
    #[error("action log {0} not found")]
    NotFound(i64),
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },
    #[error("store error: {0}")]
    Store(#[from] tempo_store::StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ─── Event type & state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Overlap,
    CategoryValidation,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Overlap => "overlap",
            Self::CategoryValidation => "category_validation",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Open,
    NeedsUserAction,
    Resolved,
    Archived,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::NeedsUserAction => "needs_user_action",
            Self::Resolved => "resolved",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

// ─── ActionLog ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: Option<i64>,
    pub user_id: i64,
    pub event_type: EventType,
    pub state: TaskState,
    pub description: String,
    pub details: Value,
    /// Serialized AI recommendations, attached later by the suggestion
    /// service; opaque to this crate.
    pub recommendations: Option<Value>,
    #[serde(with = "tempo_store::utc_naive")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "tempo_store::utc_naive")]
    pub updated_at: DateTime<Utc>,
}

impl ActionLog {
    pub fn new(
        user_id: i64,
        event_type: EventType,
        state: TaskState,
        description: impl Into<String>,
        details: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            user_id,
            event_type,
            state,
            description: description.into(),
            details,
            recommendations: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct ActionLogStore {
    session: Session,
}

impl ActionLogStore {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn create(&self, mut log: ActionLog) -> Result<ActionLog, ActionLogError> {
        let id = self.session.insert(TABLE, serde_json::to_value(&log)?);
        log.id = Some(id);
        debug!(id, event_type = %log.event_type, "action log created");
        Ok(log)
    }

    pub fn get(&self, id: i64) -> Result<ActionLog, ActionLogError> {
        let row = self
            .session
            .get(TABLE, id)
            .ok_or(ActionLogError::NotFound(id))?;
        let mut log: ActionLog = serde_json::from_value(row)?;
        log.id = Some(id);
        Ok(log)
    }

    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<ActionLog>, ActionLogError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|l| l.user_id == user_id)
            .collect())
    }

    pub fn list_by_state(&self, state: TaskState) -> Result<Vec<ActionLog>, ActionLogError> {
        Ok(self.all()?.into_iter().filter(|l| l.state == state).collect())
    }

    /// Move a task forward along open → needs_user_action → resolved →
    /// archived. Backward transitions are rejected.
    pub fn transition_state(&self, id: i64, new_state: TaskState) -> Result<(), ActionLogError> {
        let mut log = self.get(id)?;
        if new_state <= log.state {
            return Err(ActionLogError::InvalidTransition {
                from: log.state,
                to: new_state,
            });
        }
        log.state = new_state;
        log.updated_at = Utc::now();
        self.session.update(TABLE, id, serde_json::to_value(&log)?)?;
        Ok(())
    }

    /// Attach or replace the AI recommendations blob.
    pub fn attach_recommendations(
        &self,
        id: i64,
        recommendations: Value,
    ) -> Result<(), ActionLogError> {
        let mut log = self.get(id)?;
        log.recommendations = Some(recommendations);
        log.updated_at = Utc::now();
        self.session.update(TABLE, id, serde_json::to_value(&log)?)?;
        Ok(())
    }

    /// Group a user's tasks by state for display.
    pub fn summarize_for_user(
        &self,
        user_id: i64,
    ) -> Result<BTreeMap<String, Vec<ActionLog>>, ActionLogError> {
        let mut summary: BTreeMap<String, Vec<ActionLog>> = BTreeMap::new();
        for log in self.list_for_user(user_id)? {
            summary.entry(log.state.to_string()).or_default().push(log);
        }
        Ok(summary)
    }

    fn all(&self) -> Result<Vec<ActionLog>, ActionLogError> {
        self.session
            .scan(TABLE)
            .into_iter()
            .map(|(id, row)| {
                let mut log: ActionLog = serde_json::from_value(row)?;
                log.id = Some(id);
                Ok(log)
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
