//! Day-by-day completion of one challenge by the current actor.
//!
//! Both backends store less than they show: local mode keeps a prefix of booleans, remote mode keeps
//! one row per completed day. [`materialize`] turns either into the same sequence, one slot per day
//! from day 1 up to the current day of the challenge (or the highest recorded day, if later), capped
//! at the duration.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{challenge::Challenge, challenge_participant::ChallengeParticipant, progress_entry::ProgressEntry},
};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use ts_rs::TS;
use utils::storage::{KeyValueStorage, StorageError};
use uuid::Uuid;

use super::{
    backend::{BackendError, RemoteCallPolicy, StorageMode},
    challenges::{CHALLENGES_KEY, ChallengeView},
};

const SECONDS_PER_DAY: i64 = 86_400;

pub fn progress_key(challenge_id: &str) -> String {
    format!("progress_{challenge_id}")
}

/// `round(completed / duration * 100)` clamped to `[0, 100]`
pub fn completion_percentage(completed: usize, duration: i32) -> u8 {
    if duration <= 0 {
        return 0;
    }
    let pct = (completed as f64 / f64::from(duration) * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// 1-based day of a challenge started at `start`; zero or negative before it started
pub fn day_of_challenge(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - start).num_seconds().div_euclid(SECONDS_PER_DAY) + 1
}

pub fn materialize(recorded: &[bool], duration: i32, current_day: i64) -> Vec<bool> {
    let duration = usize::try_from(duration).unwrap_or(0);
    let current_day = usize::try_from(current_day).unwrap_or(0);
    let len = current_day.max(recorded.len()).min(duration);
    (0..len)
        .map(|i| recorded.get(i).copied().unwrap_or(false))
        .collect()
}

/// Drop incomplete days after the last completed one. Both backends store sequences in this form.
fn trim_incomplete_tail(sequence: &mut Vec<bool>) {
    let len = sequence.iter().rposition(|done| *done).map_or(0, |i| i + 1);
    sequence.truncate(len);
}

/// `cached` with one day changed, for when the stored sequence cannot be read back
fn apply_mark(
    cached: &[bool],
    day_index: usize,
    completed: bool,
    duration: i32,
    current_day: i64,
) -> Vec<bool> {
    let mut raw = cached.to_vec();
    if raw.len() <= day_index {
        raw.resize(day_index + 1, false);
    }
    raw[day_index] = completed;
    trim_incomplete_tail(&mut raw);
    materialize(&raw, duration, current_day)
}

/// Completed rows as a sequence ending at the highest recorded day
fn entries_to_sequence(entries: &[ProgressEntry]) -> Vec<bool> {
    let len = entries
        .iter()
        .filter_map(|e| usize::try_from(e.day_number).ok())
        .max()
        .unwrap_or(0);
    let mut sequence = vec![false; len];
    for entry in entries.iter().filter(|e| e.completed) {
        if let Some(slot) = usize::try_from(entry.day_number - 1)
            .ok()
            .and_then(|i| sequence.get_mut(i))
        {
            *slot = true;
        }
    }
    sequence
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChallengeStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl ChallengeStatus {
    /// Completed once every day of the duration is done, in progress after the first one
    pub fn from_counts(completed_days: usize, duration: i32) -> Self {
        let duration = usize::try_from(duration).unwrap_or(0);
        match completed_days {
            0 => Self::NotStarted,
            n if n >= duration => Self::Completed,
            _ => Self::InProgress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ProgressSummary {
    pub completed_days: usize,
    pub total_days: i32,
    pub completion_percentage: u8,
    pub status: ChallengeStatus,
}

impl ProgressSummary {
    pub fn new(sequence: &[bool], duration: i32) -> Self {
        let completed_days = sequence.iter().filter(|done| **done).count();
        Self {
            completed_days,
            total_days: duration,
            completion_percentage: completion_percentage(completed_days, duration),
            status: ChallengeStatus::from_counts(completed_days, duration),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("challenge not found: {0}")]
    NotFound(String),
    #[error("invalid progress update: {0}")]
    Validation(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),
    #[error("local storage error: {0}")]
    Storage(#[from] StorageError),
}

#[async_trait]
pub trait ProgressBackend: Send + Sync {
    fn mode(&self) -> StorageMode;

    fn challenge_id(&self) -> &str;

    /// The challenge, if the actor can see it in this backend
    async fn find_challenge(&self) -> Result<Option<ChallengeView>, ProgressError>;

    /// Recorded days as stored, before materialization
    async fn load_raw(&self) -> Result<Vec<bool>, ProgressError>;

    async fn mark(&self, day_number: i32, completed: bool) -> Result<(), ProgressError>;
}

pub struct LocalProgress {
    storage: Arc<dyn KeyValueStorage>,
    challenge_id: String,
}

impl LocalProgress {
    pub fn new(storage: Arc<dyn KeyValueStorage>, challenge_id: impl Into<String>) -> Self {
        Self {
            storage,
            challenge_id: challenge_id.into(),
        }
    }
}

#[async_trait]
impl ProgressBackend for LocalProgress {
    fn mode(&self) -> StorageMode {
        StorageMode::Local
    }

    fn challenge_id(&self) -> &str {
        &self.challenge_id
    }

    async fn find_challenge(&self) -> Result<Option<ChallengeView>, ProgressError> {
        let challenges = self
            .storage
            .get_json::<Vec<ChallengeView>>(CHALLENGES_KEY)?
            .unwrap_or_default();
        Ok(challenges.into_iter().find(|c| c.id == self.challenge_id))
    }

    async fn load_raw(&self) -> Result<Vec<bool>, ProgressError> {
        let mut sequence = self
            .storage
            .get_json::<Vec<bool>>(&progress_key(&self.challenge_id))?
            .unwrap_or_default();
        trim_incomplete_tail(&mut sequence);
        Ok(sequence)
    }

    async fn mark(&self, day_number: i32, completed: bool) -> Result<(), ProgressError> {
        let index = usize::try_from(day_number - 1)
            .map_err(|_| ProgressError::Validation(format!("invalid day {day_number}")))?;
        let mut sequence = self.load_raw().await?;
        if sequence.len() <= index {
            sequence.resize(index + 1, false);
        }
        sequence[index] = completed;
        trim_incomplete_tail(&mut sequence);

        let key = progress_key(&self.challenge_id);
        if sequence.is_empty() {
            self.storage.remove(&key)?;
        } else {
            self.storage.set_json(&key, &sequence)?;
        }
        Ok(())
    }
}

/// Rows of `progress_entries` for (challenge, actor); a missing row means "not completed"
pub struct RemoteProgress {
    db: DBService,
    actor: Uuid,
    challenge_id: String,
    /// `None` when the id cannot name a remote row
    row_id: Option<Uuid>,
    policy: RemoteCallPolicy,
}

impl RemoteProgress {
    pub fn new(
        db: DBService,
        actor: Uuid,
        challenge_id: impl Into<String>,
        policy: RemoteCallPolicy,
    ) -> Self {
        let challenge_id = challenge_id.into();
        Self {
            db,
            actor,
            row_id: Uuid::parse_str(&challenge_id).ok(),
            challenge_id,
            policy,
        }
    }

    fn row_id(&self) -> Result<Uuid, ProgressError> {
        self.row_id
            .ok_or_else(|| ProgressError::NotFound(self.challenge_id.clone()))
    }
}

#[async_trait]
impl ProgressBackend for RemoteProgress {
    fn mode(&self) -> StorageMode {
        StorageMode::Remote { actor: self.actor }
    }

    fn challenge_id(&self) -> &str {
        &self.challenge_id
    }

    /// Visible to its creator and to anyone who joined it
    async fn find_challenge(&self) -> Result<Option<ChallengeView>, ProgressError> {
        let Some(row_id) = self.row_id else {
            return Ok(None);
        };
        let Some(challenge) = self
            .policy
            .run(
                "progress.find_challenge",
                Challenge::find_by_id(&self.db.pool, row_id),
            )
            .await?
        else {
            return Ok(None);
        };
        if challenge.created_by == self.actor {
            return Ok(Some(challenge.into()));
        }
        let joined = self
            .policy
            .run(
                "progress.find_participation",
                ChallengeParticipant::find(&self.db.pool, row_id, self.actor),
            )
            .await?;
        Ok(joined.map(|_| challenge.into()))
    }

    async fn load_raw(&self) -> Result<Vec<bool>, ProgressError> {
        let row_id = self.row_id()?;
        let entries = self
            .policy
            .run(
                "progress.load",
                ProgressEntry::find_for_user(&self.db.pool, row_id, self.actor),
            )
            .await?;
        Ok(entries_to_sequence(&entries))
    }

    async fn mark(&self, day_number: i32, completed: bool) -> Result<(), ProgressError> {
        let row_id = self.row_id()?;
        if completed {
            self.policy
                .run(
                    "progress.mark",
                    ProgressEntry::upsert_completed(
                        &self.db.pool,
                        row_id,
                        self.actor,
                        day_number,
                        Utc::now(),
                    ),
                )
                .await?;
        } else {
            self.policy
                .run(
                    "progress.unmark",
                    ProgressEntry::delete_day(&self.db.pool, row_id, self.actor, day_number),
                )
                .await?;
        }
        Ok(())
    }
}

/// Completion sequence of one challenge, scoped to the actor the backend was built for
pub struct ProgressStore {
    backend: Arc<dyn ProgressBackend>,
    state: RwLock<ProgressState>,
}

#[derive(Default)]
struct ProgressState {
    sequence: Vec<bool>,
    duration: i32,
}

impl ProgressStore {
    pub fn new(backend: Arc<dyn ProgressBackend>) -> Self {
        Self {
            backend,
            state: RwLock::new(ProgressState::default()),
        }
    }

    pub fn challenge_id(&self) -> &str {
        self.backend.challenge_id()
    }

    /// Materialized sequence. A missing challenge is reported; backend failures degrade to an
    /// empty sequence.
    pub async fn load(&self) -> Result<Vec<bool>, ProgressError> {
        self.load_at(Utc::now()).await
    }

    pub async fn load_at(&self, now: DateTime<Utc>) -> Result<Vec<bool>, ProgressError> {
        let id = self.challenge_id();
        let loaded = match self.backend.find_challenge().await {
            Ok(Some(challenge)) => self.backend.load_raw().await.map(|raw| (challenge, raw)),
            Ok(None) => return Err(ProgressError::NotFound(id.to_string())),
            Err(e) => Err(e),
        };
        let (challenge, raw) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(challenge_id = %id, error = %e, "Progress load failed, returning empty sequence");
                return Ok(Vec::new());
            }
        };

        let sequence = materialize(&raw, challenge.duration, day_of_challenge(challenge.created_at, now));
        let mut state = self.state.write().await;
        state.sequence = sequence.clone();
        state.duration = challenge.duration;
        Ok(sequence)
    }

    /// Set the 0-based `day_index` and return the whole updated sequence. Once the backend
    /// accepted the write the call succeeds, even if the sequence cannot be read back.
    pub async fn mark(&self, day_index: usize, completed: bool) -> Result<Vec<bool>, ProgressError> {
        let id = self.challenge_id();
        let challenge = self
            .backend
            .find_challenge()
            .await?
            .ok_or_else(|| ProgressError::NotFound(id.to_string()))?;
        let duration = usize::try_from(challenge.duration).unwrap_or(0);
        if day_index >= duration {
            return Err(ProgressError::Validation(format!(
                "day index {day_index} is outside a {duration}-day challenge"
            )));
        }

        let day_number = day_index as i32 + 1;
        self.backend.mark(day_number, completed).await?;
        debug!(challenge_id = %id, day_number, completed, "Progress marked");

        let current_day = day_of_challenge(challenge.created_at, Utc::now());
        let mut state = self.state.write().await;
        let sequence = match self.backend.load_raw().await {
            Ok(raw) => materialize(&raw, challenge.duration, current_day),
            Err(e) => {
                warn!(challenge_id = %id, error = %e, "Progress read-back failed, patching cached sequence");
                apply_mark(&state.sequence, day_index, completed, challenge.duration, current_day)
            }
        };
        state.sequence = sequence.clone();
        state.duration = challenge.duration;
        Ok(sequence)
    }

    /// Last sequence seen by this store
    pub async fn snapshot(&self) -> Vec<bool> {
        self.state.read().await.sequence.clone()
    }

    pub async fn summary(&self) -> ProgressSummary {
        let state = self.state.read().await;
        ProgressSummary::new(&state.sequence, state.duration)
    }
}
