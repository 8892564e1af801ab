//! One-way copy of on-device state into the remote store after the actor signs in.
//!
//! Nothing here runs on its own; callers decide when to migrate. Local blobs are cleared only once
//! the remote transaction committed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{
        challenge::{Challenge, CreateChallenge},
        progress_entry::ProgressEntry,
    },
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use ts_rs::TS;
use utils::storage::{KeyValueStorage, StorageError};
use uuid::Uuid;

use super::{
    backend::{BackendError, RemoteCallPolicy},
    challenges::{ChallengeView, LocalChallenges},
    progress::progress_key,
    share_code,
};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("sign in to sync local challenges")]
    LoginRequired,
    #[error("challenge not found in the remote store: {0}")]
    NotFound(String),
    #[error("no free share code after {} attempts", share_code::MAX_ATTEMPTS)]
    ShareCodeExhausted,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),
    #[error("local storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct MigrationReport {
    pub challenges: usize,
    pub skipped_challenges: usize,
    pub progress_entries: usize,
}

/// Outcome of [`Migrator::migrate_challenges`]
#[derive(Debug, Clone, Default)]
pub struct ChallengeMigration {
    /// Rows written by this run, under their remote ids
    pub inserted: Vec<ChallengeView>,
    /// Local ids the actor already owns remotely from an earlier run
    pub already_migrated: Vec<String>,
}

/// A local challenge about to be written under `id`
struct PendingChallenge {
    local_id: String,
    id: Uuid,
    created_at: DateTime<Utc>,
    view: ChallengeView,
}

impl PendingChallenge {
    fn rekeyed(&self) -> bool {
        self.local_id != self.id.to_string()
    }
}

pub struct Migrator {
    local: Arc<dyn KeyValueStorage>,
    db: DBService,
    actor: Uuid,
    policy: RemoteCallPolicy,
}

impl Migrator {
    pub fn new(
        local: Arc<dyn KeyValueStorage>,
        db: DBService,
        actor: Uuid,
        policy: RemoteCallPolicy,
    ) -> Self {
        Self {
            local,
            db,
            actor,
            policy,
        }
    }

    /// Insert every local challenge under the actor, keeping creation times, then drop the local
    /// list. A local id that is not a UUID, or that another account already uses remotely, gets a
    /// fresh id and its local progress moves along with it.
    pub async fn migrate_challenges(&self) -> Result<ChallengeMigration, MigrationError> {
        let local = LocalChallenges::new(self.local.clone());
        let challenges = local.read()?;
        if challenges.is_empty() {
            return Ok(ChallengeMigration::default());
        }

        let mut outcome = ChallengeMigration::default();
        let mut pending = Vec::with_capacity(challenges.len());
        for challenge in challenges {
            let existing = match Uuid::parse_str(&challenge.id) {
                Ok(id) => self
                    .policy
                    .run(
                        "migration.find_challenge",
                        Challenge::find_by_id(&self.db.pool, id),
                    )
                    .await?
                    .map(|row| (id, row.created_by)),
                Err(_) => None,
            };
            let id = match existing {
                Some((_, owner)) if owner == self.actor => {
                    warn!(challenge_id = %challenge.id, "Challenge already migrated, skipping");
                    outcome.already_migrated.push(challenge.id);
                    continue;
                }
                Some(_) => {
                    warn!(challenge_id = %challenge.id, "Challenge id taken by another account, assigning a new one");
                    Uuid::new_v4()
                }
                None => Uuid::parse_str(&challenge.id).unwrap_or_else(|_| Uuid::new_v4()),
            };
            pending.push(PendingChallenge {
                local_id: challenge.id.clone(),
                id,
                created_at: challenge.created_at,
                view: challenge,
            });
        }

        outcome.inserted = self.insert_challenges(&pending).await?;

        for challenge in pending.iter().filter(|c| c.rekeyed()) {
            self.move_progress(&challenge.local_id, &challenge.id.to_string())?;
        }
        local.clear()?;
        info!(
            user_id = %self.actor,
            inserted = outcome.inserted.len(),
            skipped = outcome.already_migrated.len(),
            "Migrated local challenges"
        );
        Ok(outcome)
    }

    /// One transaction for the whole batch; a share code taken in the meantime restarts it with
    /// new codes
    async fn insert_challenges(
        &self,
        pending: &[PendingChallenge],
    ) -> Result<Vec<ChallengeView>, MigrationError> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut to_insert = Vec::with_capacity(pending.len());
            for challenge in pending {
                let share_code = if challenge.view.kind.is_group() {
                    let code = self
                        .policy
                        .run("migration.share_code", share_code::generate_unique(&self.db.pool))
                        .await?
                        .ok_or(MigrationError::ShareCodeExhausted)?;
                    Some(code)
                } else {
                    None
                };
                let data = CreateChallenge {
                    name: challenge.view.name.clone(),
                    duration: challenge.view.duration,
                    kind: challenge.view.kind,
                    emoji: challenge.view.emoji.clone(),
                    created_by: self.actor,
                    share_code,
                };
                to_insert.push((challenge.id, challenge.created_at, data));
            }

            let pool = &self.db.pool;
            let result = self
                .policy
                .run("migration.insert_challenges", async {
                    let mut tx = pool.begin().await?;
                    let mut inserted = Vec::with_capacity(to_insert.len());
                    for (id, created_at, data) in &to_insert {
                        inserted.push(Challenge::create(&mut *tx, data, *id, *created_at).await?);
                    }
                    tx.commit().await?;
                    Ok::<_, sqlx::Error>(inserted)
                })
                .await;

            match result {
                Ok(rows) => return Ok(rows.into_iter().map(ChallengeView::from).collect()),
                Err(e) if e.is_unique_violation() && attempt < share_code::MAX_ATTEMPTS => {
                    warn!(attempt, "Migration batch hit a unique constraint, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Re-home a local progress blob; the stored text is copied untouched
    fn move_progress(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let Some(raw) = self.local.get(&progress_key(from))? else {
            return Ok(());
        };
        self.local.set(&progress_key(to), &raw)?;
        self.local.remove(&progress_key(from))
    }

    /// Copy the completed days of one challenge, then drop its local sequence. Days past the
    /// challenge's duration are discarded. Returns the number of entries written.
    pub async fn migrate_progress(&self, challenge_id: &str) -> Result<usize, MigrationError> {
        let not_found = || MigrationError::NotFound(challenge_id.to_string());
        let row_id = Uuid::parse_str(challenge_id).map_err(|_| not_found())?;
        let challenge = self
            .policy
            .run(
                "migration.find_challenge",
                Challenge::find_by_id(&self.db.pool, row_id),
            )
            .await?
            .filter(|c| c.created_by == self.actor)
            .ok_or_else(not_found)?;

        let key = progress_key(challenge_id);
        let sequence = self.local.get_json::<Vec<bool>>(&key)?.unwrap_or_default();
        let days: Vec<i32> = sequence
            .iter()
            .enumerate()
            .filter(|(_, done)| **done)
            .map(|(i, _)| i as i32 + 1)
            .filter(|day| *day <= challenge.duration)
            .collect();

        if !days.is_empty() {
            let pool = &self.db.pool;
            let actor = self.actor;
            let completed_at = Utc::now();
            self.policy
                .run("migration.insert_progress", async {
                    let mut tx = pool.begin().await?;
                    for day in &days {
                        ProgressEntry::upsert_completed(&mut *tx, row_id, actor, *day, completed_at)
                            .await?;
                    }
                    tx.commit().await?;
                    Ok::<_, sqlx::Error>(())
                })
                .await?;
        }

        self.local.remove(&key)?;
        info!(challenge_id = %challenge_id, entries = days.len(), "Migrated local progress");
        Ok(days.len())
    }

    /// Challenges first, then the progress of every challenge that was in the local list
    pub async fn migrate_all(&self) -> Result<MigrationReport, MigrationError> {
        let outcome = self.migrate_challenges().await?;

        let mut report = MigrationReport {
            challenges: outcome.inserted.len(),
            skipped_challenges: outcome.already_migrated.len(),
            progress_entries: 0,
        };
        let ids = outcome
            .inserted
            .iter()
            .map(|c| c.id.as_str())
            .chain(outcome.already_migrated.iter().map(String::as_str));
        for id in ids {
            report.progress_entries += self.migrate_progress(id).await?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use db::models::challenge::ChallengeKind;

    use super::*;
    use crate::services::{
        auth::AuthState,
        backend::test_support,
        challenges::{CHALLENGES_KEY, ChallengeStore, NewChallenge},
        progress::ProgressStore,
    };

    fn anonymous() -> AuthState {
        AuthState::Anonymous {
            session_id: "session_test".to_string(),
        }
    }

    fn new_challenge(kind: ChallengeKind) -> NewChallenge {
        NewChallenge {
            name: "Leer 15 minutos".to_string(),
            duration: 21,
            kind,
            emoji: "📚".to_string(),
        }
    }

    fn entry_days(entries: &[ProgressEntry]) -> Vec<i32> {
        entries.iter().map(|e| e.day_number).collect()
    }

    #[tokio::test]
    async fn test_migration_copies_completed_days_only() {
        let (backends, memory) = test_support::backends().await;
        let anon = anonymous();
        let local = ChallengeStore::new(backends.challenges(&anon))
            .create(new_challenge(ChallengeKind::Group))
            .await
            .unwrap();
        let progress = ProgressStore::new(backends.progress(&anon, &local.id));
        progress.mark(0, true).await.unwrap();
        assert_eq!(progress.mark(2, true).await.unwrap(), vec![true, false, true]);

        let user = Uuid::new_v4();
        let report = backends
            .migrator(&AuthState::authenticated(user))
            .unwrap()
            .migrate_all()
            .await
            .unwrap();
        assert_eq!(
            report,
            MigrationReport {
                challenges: 1,
                skipped_challenges: 0,
                progress_entries: 2,
            }
        );

        let row_id = Uuid::parse_str(&local.id).unwrap();
        let entries = ProgressEntry::find_for_user(&backends.db().pool, row_id, user)
            .await
            .unwrap();
        assert_eq!(entry_days(&entries), vec![1, 3]);
        assert!(!memory.contains(&progress_key(&local.id)));
        assert!(!memory.contains(CHALLENGES_KEY));

        let remote = ChallengeStore::new(backends.challenges(&AuthState::authenticated(user)))
            .refresh()
            .await;
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].id, local.id);
        assert!(remote[0].share_code.is_some());
        assert!(remote[0].is_public);
    }

    #[tokio::test]
    async fn test_migration_requires_login() {
        let (backends, _) = test_support::backends().await;
        assert!(matches!(
            backends.migrator(&anonymous()),
            Err(MigrationError::LoginRequired)
        ));
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_local_data() {
        let (backends, memory) = test_support::backends().await;
        let anon = anonymous();
        let local = ChallengeStore::new(backends.challenges(&anon))
            .create(new_challenge(ChallengeKind::Individual))
            .await
            .unwrap();
        ProgressStore::new(backends.progress(&anon, &local.id))
            .mark(0, true)
            .await
            .unwrap();

        let migrator = backends
            .migrator(&AuthState::authenticated(Uuid::new_v4()))
            .unwrap();
        backends.shutdown();
        assert!(matches!(
            migrator.migrate_all().await,
            Err(MigrationError::BackendUnavailable(_))
        ));
        assert!(memory.contains(CHALLENGES_KEY));
        assert!(memory.contains(&progress_key(&local.id)));
    }

    #[tokio::test]
    async fn test_progress_for_unknown_challenge_is_left_alone() {
        let (backends, memory) = test_support::backends().await;
        let anon = anonymous();
        let local = ChallengeStore::new(backends.challenges(&anon))
            .create(new_challenge(ChallengeKind::Individual))
            .await
            .unwrap();
        ProgressStore::new(backends.progress(&anon, &local.id))
            .mark(1, true)
            .await
            .unwrap();

        let migrator = backends
            .migrator(&AuthState::authenticated(Uuid::new_v4()))
            .unwrap();
        assert!(matches!(
            migrator.migrate_progress(&local.id).await,
            Err(MigrationError::NotFound(ref id)) if *id == local.id
        ));
        assert!(memory.contains(&progress_key(&local.id)));

        let outcome = migrator.migrate_challenges().await.unwrap();
        assert_eq!(outcome.inserted.len(), 1);
        assert_eq!(migrator.migrate_progress(&local.id).await.unwrap(), 1);
        assert!(migrator.migrate_challenges().await.unwrap().inserted.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_after_partial_migration_skips_owned_rows() {
        let (backends, memory) = test_support::backends().await;
        let anon = anonymous();
        let local = ChallengeStore::new(backends.challenges(&anon))
            .create(new_challenge(ChallengeKind::Individual))
            .await
            .unwrap();
        let blob = memory.get(CHALLENGES_KEY).unwrap().unwrap();
        ProgressStore::new(backends.progress(&anon, &local.id))
            .mark(0, true)
            .await
            .unwrap();

        let user = AuthState::authenticated(Uuid::new_v4());
        let migrator = backends.migrator(&user).unwrap();
        migrator.migrate_challenges().await.unwrap();
        // the list comes back, as if clearing it had not happened
        memory.set(CHALLENGES_KEY, &blob).unwrap();

        let report = migrator.migrate_all().await.unwrap();
        assert_eq!(
            report,
            MigrationReport {
                challenges: 0,
                skipped_challenges: 1,
                progress_entries: 1,
            }
        );
        assert_eq!(ChallengeStore::new(backends.challenges(&user)).refresh().await.len(), 1);
    }

    #[tokio::test]
    async fn test_id_owned_by_another_account_is_rekeyed() {
        let (backends, memory) = test_support::backends().await;
        let other = AuthState::authenticated(Uuid::new_v4());
        let theirs = ChallengeStore::new(backends.challenges(&other))
            .create(new_challenge(ChallengeKind::Individual))
            .await
            .unwrap();

        // same id on this device, e.g. restored from someone else's backup
        let anon = anonymous();
        let copy = ChallengeView {
            name: "Correr".to_string(),
            created_by: None,
            ..theirs.clone()
        };
        LocalChallenges::new(memory.clone()).write(&[copy]).unwrap();
        let progress = ProgressStore::new(backends.progress(&anon, &theirs.id));
        progress.mark(0, true).await.unwrap();
        progress.mark(1, true).await.unwrap();

        let user = Uuid::new_v4();
        let report = backends
            .migrator(&AuthState::authenticated(user))
            .unwrap()
            .migrate_all()
            .await
            .unwrap();
        assert_eq!(report.challenges, 1);
        assert_eq!(report.progress_entries, 2);

        let mine = ChallengeStore::new(backends.challenges(&AuthState::authenticated(user)))
            .refresh()
            .await;
        assert_eq!(mine.len(), 1);
        assert_ne!(mine[0].id, theirs.id);
        assert_eq!(mine[0].name, "Correr");
        let row_id = Uuid::parse_str(&mine[0].id).unwrap();
        let entries = ProgressEntry::find_for_user(&backends.db().pool, row_id, user)
            .await
            .unwrap();
        assert_eq!(entry_days(&entries), vec![1, 2]);
        assert!(!memory.contains(&progress_key(&theirs.id)));
        assert!(!memory.contains(&progress_key(&mine[0].id)));

        let untouched = ChallengeStore::new(backends.challenges(&other)).refresh().await;
        assert_eq!(untouched.len(), 1);
        assert_eq!(untouched[0].id, theirs.id);
        assert_eq!(untouched[0].name, theirs.name);
    }

    #[tokio::test]
    async fn test_base36_local_ids_get_remote_ids() {
        let (backends, memory) = test_support::backends().await;
        memory
            .set(
                CHALLENGES_KEY,
                r#"[{"id":"k3j9x2lmq8","name":"Leer","duration":5,"type":"grupal",
                "emoji":"📚","participants":1,"createdAt":"2025-03-01T10:00:00Z"}]"#,
            )
            .unwrap();
        memory.set(&progress_key("k3j9x2lmq8"), "[true,false,true]").unwrap();

        let user = Uuid::new_v4();
        let report = backends
            .migrator(&AuthState::authenticated(user))
            .unwrap()
            .migrate_all()
            .await
            .unwrap();
        assert_eq!(report.challenges, 1);
        assert_eq!(report.progress_entries, 2);

        let mine = ChallengeStore::new(backends.challenges(&AuthState::authenticated(user)))
            .refresh()
            .await;
        assert!(Uuid::parse_str(&mine[0].id).is_ok());
        assert!(mine[0].share_code.is_some());
        assert!(!memory.contains(&progress_key("k3j9x2lmq8")));
        assert!(!memory.contains(CHALLENGES_KEY));
    }
}
