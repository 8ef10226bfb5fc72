//! Action-specific reversal of archive writes.
//!
//! Reverse data captured with each ledger item names the destination
//! repository (scheme + backend calendar id); the reverser reopens that
//! repository and undoes the item: `delete` removes what the archive
//! created, `restore` recreates from before-state, `update` writes the
//! before-state back.

use async_trait::async_trait;
use std::sync::Arc;
use tempo_ledger::{ItemReverser, ReversibleOperationItem};
use tempo_proto::{Appointment, User};
use tempo_repo::AppointmentRepository;

use crate::RepositoryProvider;

pub struct ArchiveReverser {
    repositories: Arc<dyn RepositoryProvider>,
    user: User,
}

impl ArchiveReverser {
    pub fn new(repositories: Arc<dyn RepositoryProvider>, user: User) -> Self {
        Self { repositories, user }
    }

    async fn repository_for(
        &self,
        item: &ReversibleOperationItem,
    ) -> Result<Arc<dyn AppointmentRepository>, String> {
        let scheme = item.reverse_data["scheme"]
            .as_str()
            .ok_or("reverse data is missing the repository scheme")?;
        let calendar_id = item.reverse_data["calendar_id"].as_str().unwrap_or_default();
        self.repositories
            .repository(&self.user, scheme, calendar_id)
            .await
            .map_err(|e| e.to_string())
    }

    /// The stored id of the item in its destination repository: the local
    /// surrogate id when present, the provider id otherwise.
    fn stored_id(item: &ReversibleOperationItem) -> Result<String, String> {
        if let Some(after) = &item.after_state {
            if let Some(id) = after.get("id").and_then(|v| v.as_i64()) {
                return Ok(id.to_string());
            }
            if let Some(external) = after.get("external_id").and_then(|v| v.as_str()) {
                return Ok(external.to_string());
            }
        }
        item.external_id
            .clone()
            .ok_or_else(|| "no stored id available for reversal".to_string())
    }

    fn before_appointment(item: &ReversibleOperationItem) -> Result<Appointment, String> {
        serde_json::from_value(item.before_state.clone())
            .map_err(|e| format!("before_state is not a valid appointment: {e}"))
    }
}

#[async_trait]
impl ItemReverser for ArchiveReverser {
    async fn restore(&self, item: &ReversibleOperationItem) -> Result<(), String> {
        let repo = self.repository_for(item).await?;
        let appointment = Self::before_appointment(item)?;
        repo.add(&appointment).await.map(|_| ()).map_err(|e| e.to_string())
    }

    async fn delete(&self, item: &ReversibleOperationItem) -> Result<(), String> {
        let repo = self.repository_for(item).await?;
        let id = Self::stored_id(item)?;
        repo.delete(&id).await.map_err(|e| e.to_string())
    }

    async fn update(&self, item: &ReversibleOperationItem) -> Result<(), String> {
        let repo = self.repository_for(item).await?;
        let appointment = Self::before_appointment(item)?;
        repo.update(&appointment).await.map_err(|e| e.to_string())
    }
}
