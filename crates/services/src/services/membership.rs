//! Joining public group challenges and tracking progress inside them.
//!
//! Membership only exists in the remote store; an anonymous actor sees no public challenges and
//! cannot join.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{challenge::Challenge, challenge_participant::ChallengeParticipant, progress_entry::ProgressEntry},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::{
    backend::{BackendError, RemoteCallPolicy, degrade},
    challenges::ChallengeView,
    progress::{completion_percentage, day_of_challenge},
    share_code,
};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("sign in to join challenges")]
    LoginRequired,
    #[error("no public challenge uses this code")]
    InvalidCode,
    #[error("already joined challenge {0}")]
    AlreadyJoined(Uuid),
    #[error("challenge not found: {0}")]
    NotFound(Uuid),
    #[error("challenge {0} is not a public group challenge")]
    NotJoinable(Uuid),
    #[error("not a participant of challenge {0}")]
    NotJoined(Uuid),
    #[error("day {day} cannot be changed now")]
    DayLocked { day: i32 },
    #[error("invalid day: {0}")]
    Validation(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct JoinedChallenge {
    #[serde(flatten)]
    #[ts(flatten)]
    pub challenge: ChallengeView,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum DayAvailability {
    Completed,
    Open,
    /// The day passed before the actor joined
    LockedPast,
    LockedFuture,
}

/// Whether `day` (1-based) can be toggled at `now` by someone who joined at `joined_at`.
/// Never returns [`DayAvailability::Completed`]; that is overlaid from recorded progress.
pub fn availability(
    start: DateTime<Utc>,
    joined_at: DateTime<Utc>,
    now: DateTime<Utc>,
    day: i32,
) -> DayAvailability {
    let days_since_start = day_of_challenge(start, now);
    let join_day = (joined_at - start).num_seconds().div_euclid(SECONDS_PER_DAY) + 1;
    let day = i64::from(day);
    if day < join_day {
        DayAvailability::LockedPast
    } else if days_since_start <= 0 || day > days_since_start {
        DayAvailability::LockedFuture
    } else {
        DayAvailability::Open
    }
}

/// Per-day states of `challenge`, with `completed` days overlaid on [`availability`]
fn states_for(
    challenge: &Challenge,
    joined_at: DateTime<Utc>,
    now: DateTime<Utc>,
    completed: &HashSet<i32>,
) -> Vec<DayAvailability> {
    (1..=challenge.duration)
        .map(|day| {
            if completed.contains(&day) {
                DayAvailability::Completed
            } else {
                availability(challenge.created_at, joined_at, now, day)
            }
        })
        .collect()
}

fn apply_mark(completed: &mut HashSet<i32>, day: i32, done: bool) {
    if done {
        completed.insert(day);
    } else {
        completed.remove(&day);
    }
}

/// `(true entries / participants) / duration`, as a rounded percentage
pub fn group_average_percentage(completed_total: usize, participants: usize, duration: i32) -> u8 {
    if participants == 0 || duration <= 0 {
        return 0;
    }
    let pct = (completed_total as f64 / participants as f64 / f64::from(duration) * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ComparativeProgress {
    pub own: Vec<ProgressEntry>,
    pub all: Vec<ProgressEntry>,
    pub own_percentage: u8,
    pub group_average_percentage: u8,
    pub participant_count: usize,
}

pub struct MembershipService {
    db: DBService,
    actor: Option<Uuid>,
    policy: RemoteCallPolicy,
}

impl MembershipService {
    pub fn new(db: DBService, actor: Option<Uuid>, policy: RemoteCallPolicy) -> Self {
        Self { db, actor, policy }
    }

    fn actor(&self) -> Result<Uuid, MembershipError> {
        self.actor.ok_or(MembershipError::LoginRequired)
    }

    /// Public group challenges created by someone else
    pub async fn list_public(&self) -> Vec<ChallengeView> {
        let Some(actor) = self.actor else {
            return Vec::new();
        };
        let rows = degrade(
            "membership.list_public",
            self.policy
                .run(
                    "membership.list_public",
                    Challenge::find_public_excluding_creator(&self.db.pool, actor),
                )
                .await,
        );
        rows.into_iter().map(ChallengeView::from).collect()
    }

    pub async fn join_by_code(&self, code: &str) -> Result<JoinedChallenge, MembershipError> {
        let actor = self.actor()?;
        let code = share_code::normalize(code).ok_or(MembershipError::InvalidCode)?;
        let challenge = self
            .policy
            .run(
                "membership.find_by_code",
                Challenge::find_public_by_share_code(&self.db.pool, &code),
            )
            .await?
            .ok_or(MembershipError::InvalidCode)?;
        self.join(actor, challenge).await
    }

    pub async fn join_by_id(&self, challenge_id: Uuid) -> Result<JoinedChallenge, MembershipError> {
        let actor = self.actor()?;
        let challenge = self.find(challenge_id).await?;
        if !(challenge.is_public && challenge.kind.is_group()) {
            return Err(MembershipError::NotJoinable(challenge_id));
        }
        self.join(actor, challenge).await
    }

    async fn join(
        &self,
        actor: Uuid,
        mut challenge: Challenge,
    ) -> Result<JoinedChallenge, MembershipError> {
        let challenge_id = challenge.id;
        if self.joined_at(actor, &challenge).await?.is_some() {
            return Err(MembershipError::AlreadyJoined(challenge_id));
        }

        let joined_at = Utc::now();
        let pool = &self.db.pool;
        let result = self
            .policy
            .run("membership.join", async {
                let mut tx = pool.begin().await?;
                let participant =
                    ChallengeParticipant::create(&mut *tx, challenge_id, actor, joined_at).await?;
                Challenge::increment_participants(&mut *tx, challenge_id).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(participant)
            })
            .await;

        let participant = match result {
            Ok(participant) => participant,
            Err(e) if e.is_unique_violation() => {
                warn!(challenge_id = %challenge_id, "Concurrent join rejected by the store");
                return Err(MembershipError::AlreadyJoined(challenge_id));
            }
            Err(e) => return Err(e.into()),
        };

        info!(challenge_id = %challenge_id, user_id = %actor, "Joined challenge");
        challenge.participants += 1;
        Ok(JoinedChallenge {
            challenge: challenge.into(),
            joined_at: participant.joined_at,
        })
    }

    /// Challenges the actor joined, newest participation first
    pub async fn list_joined(&self) -> Vec<JoinedChallenge> {
        let Some(actor) = self.actor else {
            return Vec::new();
        };
        let rows = degrade(
            "membership.list_joined",
            self.policy
                .run(
                    "membership.list_joined",
                    Challenge::find_joined_by_user(&self.db.pool, actor),
                )
                .await,
        );
        rows.into_iter()
            .map(|row| JoinedChallenge {
                challenge: row.challenge.into(),
                joined_at: row.joined_at,
            })
            .collect()
    }

    /// Own entries next to everyone's. Entry reads degrade to empty lists.
    pub async fn comparative_progress(
        &self,
        challenge_id: Uuid,
    ) -> Result<ComparativeProgress, MembershipError> {
        let actor = self.actor()?;
        let challenge = self.find(challenge_id).await?;
        if self.joined_at(actor, &challenge).await?.is_none() {
            return Err(MembershipError::NotJoined(challenge_id));
        }

        let all = degrade(
            "membership.progress",
            self.policy
                .run(
                    "membership.progress",
                    ProgressEntry::find_for_challenge(&self.db.pool, challenge_id),
                )
                .await,
        );
        let own: Vec<ProgressEntry> = all.iter().filter(|e| e.user_id == actor).cloned().collect();

        let participant_count = all.iter().map(|e| e.user_id).collect::<HashSet<_>>().len();
        let completed_total = all.iter().filter(|e| e.completed).count();
        let own_completed = own.iter().filter(|e| e.completed).count();

        Ok(ComparativeProgress {
            own_percentage: completion_percentage(own_completed, challenge.duration),
            group_average_percentage: group_average_percentage(
                completed_total,
                participant_count,
                challenge.duration,
            ),
            participant_count,
            own,
            all,
        })
    }

    pub async fn day_states(&self, challenge_id: Uuid) -> Result<Vec<DayAvailability>, MembershipError> {
        self.day_states_at(challenge_id, Utc::now()).await
    }

    /// One state per day of the challenge, index 0 = day 1
    pub async fn day_states_at(
        &self,
        challenge_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<DayAvailability>, MembershipError> {
        let actor = self.actor()?;
        let challenge = self.find(challenge_id).await?;
        let joined_at = self
            .joined_at(actor, &challenge)
            .await?
            .ok_or(MembershipError::NotJoined(challenge_id))?;
        let completed = self.completed_days(actor, challenge.id).await?;
        Ok(states_for(&challenge, joined_at, now, &completed))
    }

    pub async fn mark_day(
        &self,
        challenge_id: Uuid,
        day: i32,
        completed: bool,
    ) -> Result<Vec<DayAvailability>, MembershipError> {
        self.mark_day_at(challenge_id, day, completed, Utc::now()).await
    }

    /// Toggle a 1-based `day`; only open or already completed days inside the window may change.
    /// A read failure after the write was accepted does not fail the call.
    pub async fn mark_day_at(
        &self,
        challenge_id: Uuid,
        day: i32,
        completed: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<DayAvailability>, MembershipError> {
        let actor = self.actor()?;
        let challenge = self.find(challenge_id).await?;
        let joined_at = self
            .joined_at(actor, &challenge)
            .await?
            .ok_or(MembershipError::NotJoined(challenge_id))?;

        if day < 1 || day > challenge.duration {
            return Err(MembershipError::Validation(format!(
                "day {day} is outside a {}-day challenge",
                challenge.duration
            )));
        }
        if availability(challenge.created_at, joined_at, now, day) != DayAvailability::Open {
            return Err(MembershipError::DayLocked { day });
        }
        let mut done_days = self.completed_days(actor, challenge.id).await?;

        if completed {
            self.policy
                .run(
                    "membership.mark",
                    ProgressEntry::upsert_completed(&self.db.pool, challenge_id, actor, day, now),
                )
                .await?;
        } else {
            self.policy
                .run(
                    "membership.unmark",
                    ProgressEntry::delete_day(&self.db.pool, challenge_id, actor, day),
                )
                .await?;
        }

        match self.completed_days(actor, challenge.id).await {
            Ok(stored) => done_days = stored,
            Err(e) => {
                warn!(challenge_id = %challenge_id, day, error = %e, "Day states read-back failed, patching");
                apply_mark(&mut done_days, day, completed);
            }
        }
        Ok(states_for(&challenge, joined_at, now, &done_days))
    }

    async fn completed_days(
        &self,
        actor: Uuid,
        challenge_id: Uuid,
    ) -> Result<HashSet<i32>, MembershipError> {
        let entries = self
            .policy
            .run(
                "membership.day_states",
                ProgressEntry::find_for_user(&self.db.pool, challenge_id, actor),
            )
            .await?;
        Ok(entries
            .iter()
            .filter(|e| e.completed)
            .map(|e| e.day_number)
            .collect())
    }

    async fn find(&self, challenge_id: Uuid) -> Result<Challenge, MembershipError> {
        self.policy
            .run(
                "membership.find",
                Challenge::find_by_id(&self.db.pool, challenge_id),
            )
            .await?
            .ok_or(MembershipError::NotFound(challenge_id))
    }

    /// The creator counts as joined from the moment the challenge was created
    async fn joined_at(
        &self,
        actor: Uuid,
        challenge: &Challenge,
    ) -> Result<Option<DateTime<Utc>>, MembershipError> {
        if challenge.created_by == actor {
            return Ok(Some(challenge.created_at));
        }
        let participant = self
            .policy
            .run(
                "membership.find_participation",
                ChallengeParticipant::find(&self.db.pool, challenge.id, actor),
            )
            .await?;
        Ok(participant.map(|p| p.joined_at))
    }
}
