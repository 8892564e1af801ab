//! Challenge CRUD over either backend, normalized to [`ChallengeView`].
//!
//! Ids are opaque strings: local challenges keep whatever id the device minted (older clients used
//! short base36 tokens), remote ones carry the row's UUID in its string form.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::challenge::{Challenge, ChallengeKind, CreateChallenge, UpdateChallenge},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ts_rs::TS;
use utils::storage::{KeyValueStorage, StorageError};
use uuid::Uuid;

use super::{
    backend::{BackendError, RemoteCallPolicy, StorageMode, degrade},
    progress::progress_key,
    share_code,
};

/// Local blob holding every challenge of the anonymous actor
pub const CHALLENGES_KEY: &str = "habitlink_challenges";

/// Durations offered by the creation form. Advisory only.
pub const SUGGESTED_DURATIONS: [i32; 6] = [7, 14, 21, 30, 60, 90];

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("invalid challenge: {0}")]
    Validation(String),
    #[error("challenge not found: {0}")]
    NotFound(String),
    #[error("no free share code after {} attempts", share_code::MAX_ATTEMPTS)]
    ShareCodeExhausted,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),
    #[error("local storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Shape shared by both backends and handed to views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeView {
    pub id: String,
    pub name: String,
    pub duration: i32,
    #[serde(rename = "type")]
    pub kind: ChallengeKind,
    pub emoji: String,
    pub participants: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl From<Challenge> for ChallengeView {
    fn from(row: Challenge) -> Self {
        Self {
            id: row.id.to_string(),
            name: row.name,
            duration: row.duration,
            kind: row.kind,
            emoji: row.emoji,
            participants: row.participants,
            created_at: row.created_at,
            is_public: row.is_public,
            share_code: row.share_code,
            created_by: Some(row.created_by.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct NewChallenge {
    pub name: String,
    pub duration: i32,
    pub kind: ChallengeKind,
    pub emoji: String,
}

impl NewChallenge {
    pub fn validate(&self) -> Result<(), ChallengeError> {
        validate_name(&self.name)?;
        validate_duration(self.duration)
    }
}

fn validate_name(name: &str) -> Result<(), ChallengeError> {
    if name.trim().is_empty() {
        return Err(ChallengeError::Validation("name must not be empty".to_string()));
    }
    Ok(())
}

fn validate_duration(duration: i32) -> Result<(), ChallengeError> {
    if duration <= 0 {
        return Err(ChallengeError::Validation(format!(
            "duration must be a positive number of days, got {duration}"
        )));
    }
    Ok(())
}

fn validate_patch(patch: &UpdateChallenge) -> Result<(), ChallengeError> {
    if let Some(name) = &patch.name {
        validate_name(name)?;
    }
    if let Some(duration) = patch.duration {
        validate_duration(duration)?;
    }
    if matches!(patch.participants, Some(p) if p < 1) {
        return Err(ChallengeError::Validation(
            "participants must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Storage contract behind [`ChallengeStore`]
#[async_trait]
pub trait ChallengeBackend: Send + Sync {
    fn mode(&self) -> StorageMode;

    /// Every challenge owned by the current actor
    async fn list(&self) -> Result<Vec<ChallengeView>, ChallengeError>;

    async fn find(&self, id: &str) -> Result<Option<ChallengeView>, ChallengeError>;

    async fn create(&self, new: &NewChallenge) -> Result<ChallengeView, ChallengeError>;

    async fn update(
        &self,
        id: &str,
        patch: &UpdateChallenge,
    ) -> Result<ChallengeView, ChallengeError>;

    /// Removes the challenge together with the progress it owns
    async fn delete(&self, id: &str) -> Result<(), ChallengeError>;
}

/// Anonymous actor: all challenges in one on-device blob
pub struct LocalChallenges {
    storage: Arc<dyn KeyValueStorage>,
}

impl LocalChallenges {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Fails with [`StorageError::Serde`] when the blob exists but cannot be decoded
    pub(crate) fn read(&self) -> Result<Vec<ChallengeView>, StorageError> {
        Ok(self
            .storage
            .get_json::<Vec<ChallengeView>>(CHALLENGES_KEY)?
            .unwrap_or_default())
    }

    pub(crate) fn write(&self, challenges: &[ChallengeView]) -> Result<(), StorageError> {
        if challenges.is_empty() {
            return self.storage.remove(CHALLENGES_KEY);
        }
        self.storage.set_json(CHALLENGES_KEY, challenges)
    }

    pub(crate) fn clear(&self) -> Result<(), StorageError> {
        self.storage.remove(CHALLENGES_KEY)
    }
}

#[async_trait]
impl ChallengeBackend for LocalChallenges {
    fn mode(&self) -> StorageMode {
        StorageMode::Local
    }

    async fn list(&self) -> Result<Vec<ChallengeView>, ChallengeError> {
        Ok(self.read()?)
    }

    async fn find(&self, id: &str) -> Result<Option<ChallengeView>, ChallengeError> {
        Ok(self.read()?.into_iter().find(|c| c.id == id))
    }

    async fn create(&self, new: &NewChallenge) -> Result<ChallengeView, ChallengeError> {
        let mut challenges = self.read()?;
        let challenge = ChallengeView {
            id: Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            duration: new.duration,
            kind: new.kind,
            emoji: new.emoji.clone(),
            participants: 1,
            created_at: Utc::now(),
            is_public: false,
            share_code: None,
            created_by: None,
        };
        challenges.push(challenge.clone());
        self.write(&challenges)?;
        Ok(challenge)
    }

    async fn update(
        &self,
        id: &str,
        patch: &UpdateChallenge,
    ) -> Result<ChallengeView, ChallengeError> {
        let mut challenges = self.read()?;
        let challenge = challenges
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ChallengeError::NotFound(id.to_string()))?;

        if let Some(name) = &patch.name {
            challenge.name = name.trim().to_string();
        }
        if let Some(duration) = patch.duration {
            challenge.duration = duration;
        }
        if let Some(kind) = patch.kind {
            challenge.kind = kind;
        }
        if let Some(emoji) = &patch.emoji {
            challenge.emoji = emoji.clone();
        }
        if let Some(participants) = patch.participants {
            challenge.participants = participants;
        }

        let updated = challenge.clone();
        self.write(&challenges)?;
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<(), ChallengeError> {
        let mut challenges = self.read()?;
        let before = challenges.len();
        challenges.retain(|c| c.id != id);
        if challenges.len() == before {
            return Err(ChallengeError::NotFound(id.to_string()));
        }
        self.write(&challenges)?;
        self.storage.remove(&progress_key(id))?;
        Ok(())
    }
}

/// Authenticated actor: rows of the `challenges` table created by `actor`
pub struct RemoteChallenges {
    db: DBService,
    actor: Uuid,
    policy: RemoteCallPolicy,
}

impl RemoteChallenges {
    pub fn new(db: DBService, actor: Uuid, policy: RemoteCallPolicy) -> Self {
        Self { db, actor, policy }
    }

    /// The row, if `id` names one that belongs to the actor
    async fn owned(&self, id: &str) -> Result<Option<Challenge>, ChallengeError> {
        let Ok(id) = Uuid::parse_str(id) else {
            return Ok(None);
        };
        let row = self
            .policy
            .run("challenges.find", Challenge::find_by_id(&self.db.pool, id))
            .await?;
        Ok(row.filter(|c| c.created_by == self.actor))
    }

    async fn fresh_share_code(&self) -> Result<String, ChallengeError> {
        self.policy
            .run("challenges.share_code", share_code::generate_unique(&self.db.pool))
            .await?
            .ok_or(ChallengeError::ShareCodeExhausted)
    }
}

#[async_trait]
impl ChallengeBackend for RemoteChallenges {
    fn mode(&self) -> StorageMode {
        StorageMode::Remote { actor: self.actor }
    }

    async fn list(&self) -> Result<Vec<ChallengeView>, ChallengeError> {
        let rows = self
            .policy
            .run(
                "challenges.list",
                Challenge::find_by_creator(&self.db.pool, self.actor),
            )
            .await?;
        Ok(rows.into_iter().map(ChallengeView::from).collect())
    }

    async fn find(&self, id: &str) -> Result<Option<ChallengeView>, ChallengeError> {
        Ok(self.owned(id).await?.map(ChallengeView::from))
    }

    /// A code can still be taken between the lookup and the insert; the unique index catches
    /// that and the insert is retried with a new code.
    async fn create(&self, new: &NewChallenge) -> Result<ChallengeView, ChallengeError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let share_code = if new.kind.is_group() {
                Some(self.fresh_share_code().await?)
            } else {
                None
            };
            let data = CreateChallenge {
                name: new.name.trim().to_string(),
                duration: new.duration,
                kind: new.kind,
                emoji: new.emoji.clone(),
                created_by: self.actor,
                share_code,
            };

            match self
                .policy
                .run(
                    "challenges.create",
                    Challenge::create(&self.db.pool, &data, id, created_at),
                )
                .await
            {
                Ok(row) => {
                    info!(challenge_id = %row.id, kind = %row.kind, "Challenge created");
                    return Ok(row.into());
                }
                Err(e)
                    if e.is_unique_violation()
                        && data.share_code.is_some()
                        && attempt < share_code::MAX_ATTEMPTS =>
                {
                    warn!(attempt, "Share code taken at insert, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn update(
        &self,
        id: &str,
        patch: &UpdateChallenge,
    ) -> Result<ChallengeView, ChallengeError> {
        let existing = self
            .owned(id)
            .await?
            .ok_or_else(|| ChallengeError::NotFound(id.to_string()))?;

        let fallback_code = match patch.kind {
            Some(ChallengeKind::Group) if existing.share_code.is_none() => {
                Some(self.fresh_share_code().await?)
            }
            _ => None,
        };
        let trimmed;
        let patch = match &patch.name {
            Some(name) => {
                trimmed = UpdateChallenge {
                    name: Some(name.trim().to_string()),
                    ..patch.clone()
                };
                &trimmed
            }
            None => patch,
        };

        let row = self
            .policy
            .run(
                "challenges.update",
                Challenge::update(&self.db.pool, existing.id, patch, fallback_code.as_deref()),
            )
            .await?
            .ok_or_else(|| ChallengeError::NotFound(id.to_string()))?;
        Ok(row.into())
    }

    async fn delete(&self, id: &str) -> Result<(), ChallengeError> {
        let existing = self
            .owned(id)
            .await?
            .ok_or_else(|| ChallengeError::NotFound(id.to_string()))?;
        let deleted = self
            .policy
            .run("challenges.delete", Challenge::delete(&self.db.pool, existing.id))
            .await?;
        if deleted == 0 {
            return Err(ChallengeError::NotFound(id.to_string()));
        }
        info!(challenge_id = %existing.id, "Challenge deleted");
        Ok(())
    }
}

/// In-memory challenge list kept consistent with the selected backend. Changes are applied
/// only after the backend accepted them.
pub struct ChallengeStore {
    backend: Arc<dyn ChallengeBackend>,
    challenges: RwLock<Vec<ChallengeView>>,
}

impl ChallengeStore {
    pub fn new(backend: Arc<dyn ChallengeBackend>) -> Self {
        Self {
            backend,
            challenges: RwLock::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.backend.mode()
    }

    /// Reload from the backend. Read failures leave an empty list rather than an error.
    pub async fn refresh(&self) -> Vec<ChallengeView> {
        let challenges = degrade("challenges.list", self.backend.list().await);
        debug!(count = challenges.len(), "Challenges loaded");
        *self.challenges.write().await = challenges.clone();
        challenges
    }

    /// Last list seen by this store
    pub async fn snapshot(&self) -> Vec<ChallengeView> {
        self.challenges.read().await.clone()
    }

    pub async fn create(&self, new: NewChallenge) -> Result<ChallengeView, ChallengeError> {
        new.validate()?;
        let created = self.backend.create(&new).await?;
        self.challenges.write().await.push(created.clone());
        Ok(created)
    }

    /// Apply whitelisted fields. An empty patch returns the current record untouched.
    pub async fn update(
        &self,
        id: &str,
        patch: UpdateChallenge,
    ) -> Result<ChallengeView, ChallengeError> {
        validate_patch(&patch)?;
        let updated = if patch.is_empty() {
            self.backend
                .find(id)
                .await?
                .ok_or_else(|| ChallengeError::NotFound(id.to_string()))?
        } else {
            self.backend.update(id, &patch).await?
        };

        let mut challenges = self.challenges.write().await;
        match challenges.iter_mut().find(|c| c.id == id) {
            Some(slot) => *slot = updated.clone(),
            None => challenges.push(updated.clone()),
        }
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<(), ChallengeError> {
        if let Err(e) = self.backend.delete(id).await {
            warn!(challenge_id = %id, error = %e, "Challenge delete failed");
            return Err(e);
        }
        self.challenges.write().await.retain(|c| c.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{auth::AuthState, backend::test_support};

    fn new_challenge(name: &str, duration: i32, kind: ChallengeKind) -> NewChallenge {
        NewChallenge {
            name: name.to_string(),
            duration,
            kind,
            emoji: "🔥".to_string(),
        }
    }

    fn anonymous() -> AuthState {
        AuthState::Anonymous {
            session_id: "session_test".to_string(),
        }
    }

    const LEGACY_BLOB: &str = r#"[{"id":"k3j9x2lmq8lz1y2x3w","name":"Leer","duration":21,
        "type":"grupal","emoji":"📚","participants":7,"progress":[true,false],
        "createdAt":"2025-03-01T10:00:00.000Z"}]"#;

    #[tokio::test]
    async fn test_group_challenge_gets_share_code_remotely() {
        let (backends, _) = test_support::backends().await;
        let store = ChallengeStore::new(backends.challenges(&AuthState::authenticated(Uuid::new_v4())));

        let group = store
            .create(new_challenge("Leer 15 minutos", 21, ChallengeKind::Group))
            .await
            .unwrap();
        let code = group.share_code.clone().unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert!(group.is_public);
        assert_eq!(group.participants, 1);

        let individual = store
            .create(new_challenge("Leer 15 minutos", 21, ChallengeKind::Individual))
            .await
            .unwrap();
        assert_eq!(individual.share_code, None);
        assert!(!individual.is_public);

        // duplicate names are fine
        assert_eq!(store.refresh().await.len(), 2);
    }

    #[tokio::test]
    async fn test_local_challenges_never_carry_share_codes() {
        let (backends, memory) = test_support::backends().await;
        let store = ChallengeStore::new(backends.challenges(&anonymous()));

        let created = store
            .create(new_challenge("Caminar", 30, ChallengeKind::Group))
            .await
            .unwrap();
        assert_eq!(created.share_code, None);
        assert!(memory.contains(CHALLENGES_KEY));
        assert_eq!(store.refresh().await, vec![created]);
    }

    #[tokio::test]
    async fn test_validation_happens_before_the_backend() {
        let (backends, memory) = test_support::backends().await;
        let store = ChallengeStore::new(backends.challenges(&anonymous()));

        let err = store
            .create(new_challenge("   ", 21, ChallengeKind::Individual))
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Validation(_)));
        let err = store
            .create(new_challenge("Yoga", 0, ChallengeKind::Individual))
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Validation(_)));
        assert!(!memory.contains(CHALLENGES_KEY));
    }

    #[tokio::test]
    async fn test_update_applies_whitelisted_fields() {
        let (backends, _) = test_support::backends().await;
        for auth in [anonymous(), AuthState::authenticated(Uuid::new_v4())] {
            let store = ChallengeStore::new(backends.challenges(&auth));
            let created = store
                .create(new_challenge("Correr", 14, ChallengeKind::Individual))
                .await
                .unwrap();

            let updated = store
                .update(
                    &created.id,
                    UpdateChallenge {
                        name: Some("Correr 5k".to_string()),
                        emoji: Some("🏃".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(updated.name, "Correr 5k");
            assert_eq!(updated.duration, 14);
            assert_eq!(store.snapshot().await, vec![updated]);
        }
    }

    #[tokio::test]
    async fn test_delete_then_update_is_not_found() {
        let (backends, _) = test_support::backends().await;
        for auth in [anonymous(), AuthState::authenticated(Uuid::new_v4())] {
            let store = ChallengeStore::new(backends.challenges(&auth));
            let created = store
                .create(new_challenge("Dormir 8h", 7, ChallengeKind::Individual))
                .await
                .unwrap();

            store.delete(&created.id).await.unwrap();
            assert!(store.refresh().await.is_empty());

            let err = store
                .update(
                    &created.id,
                    UpdateChallenge {
                        name: Some("x".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ChallengeError::NotFound(ref id) if *id == created.id));
            assert!(matches!(
                store.delete(&created.id).await,
                Err(ChallengeError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_other_actors_cannot_touch_a_challenge() {
        let (backends, _) = test_support::backends().await;
        let owner = ChallengeStore::new(backends.challenges(&AuthState::authenticated(Uuid::new_v4())));
        let stranger =
            ChallengeStore::new(backends.challenges(&AuthState::authenticated(Uuid::new_v4())));
        let created = owner
            .create(new_challenge("Estudiar", 60, ChallengeKind::Group))
            .await
            .unwrap();

        assert!(stranger.refresh().await.is_empty());
        assert!(matches!(
            stranger.delete(&created.id).await,
            Err(ChallengeError::NotFound(_))
        ));
        assert!(matches!(
            stranger.delete("not-a-uuid").await,
            Err(ChallengeError::NotFound(_))
        ));
        assert_eq!(owner.refresh().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_read_failure_degrades_to_empty_list() {
        let (backends, _) = test_support::backends().await;
        let store = ChallengeStore::new(backends.challenges(&AuthState::authenticated(Uuid::new_v4())));
        store
            .create(new_challenge("Agua", 21, ChallengeKind::Individual))
            .await
            .unwrap();

        backends.shutdown();
        assert!(store.refresh().await.is_empty());
        let err = store
            .create(new_challenge("Agua", 21, ChallengeKind::Individual))
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::BackendUnavailable(_)));
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_base36_local_ids_survive_every_operation() {
        let (backends, memory) = test_support::backends().await;
        memory.set(CHALLENGES_KEY, LEGACY_BLOB).unwrap();
        memory.set(&progress_key("k3j9x2lmq8lz1y2x3w"), "[true,false]").unwrap();
        let store = ChallengeStore::new(backends.challenges(&anonymous()));

        let listed = store.refresh().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "k3j9x2lmq8lz1y2x3w");
        assert_eq!(listed[0].kind, ChallengeKind::Group);
        assert!(!listed[0].is_public);

        store
            .create(new_challenge("Caminar", 30, ChallengeKind::Individual))
            .await
            .unwrap();
        let blob = memory.get(CHALLENGES_KEY).unwrap().unwrap();
        assert!(blob.contains("k3j9x2lmq8lz1y2x3w"));

        let renamed = store
            .update(
                "k3j9x2lmq8lz1y2x3w",
                UpdateChallenge {
                    name: Some("Leer 20 minutos".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.participants, 7);

        store.delete("k3j9x2lmq8lz1y2x3w").await.unwrap();
        assert!(!memory.contains(&progress_key("k3j9x2lmq8lz1y2x3w")));
        assert_eq!(store.refresh().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_blob_is_never_overwritten() {
        let (backends, memory) = test_support::backends().await;
        memory.set(CHALLENGES_KEY, "[{\"id\":").unwrap();
        let store = ChallengeStore::new(backends.challenges(&anonymous()));

        assert!(store.refresh().await.is_empty());
        let err = store
            .create(new_challenge("Caminar", 30, ChallengeKind::Individual))
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Storage(StorageError::Serde(_))));
        assert_eq!(memory.get(CHALLENGES_KEY).unwrap().as_deref(), Some("[{\"id\":"));
    }
}
