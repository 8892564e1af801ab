use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

/// Whether a challenge is a personal goal or a shared one other users can join
#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "challenge_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChallengeKind {
    #[default]
    Individual,
    // older local blobs spell it "grupal"
    #[serde(alias = "grupal")]
    Group,
}

impl ChallengeKind {
    pub fn is_group(self) -> bool {
        matches!(self, ChallengeKind::Group)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Challenge {
    pub id: Uuid,
    pub name: String,
    pub duration: i32,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: ChallengeKind,
    pub emoji: String,
    pub participants: i32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub is_public: bool,
    pub share_code: Option<String>, // only set for group challenges
}

/// Challenge joined with the caller's participation timestamp
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct ChallengeWithJoin {
    #[sqlx(flatten)]
    #[serde(flatten)]
    #[ts(flatten)]
    pub challenge: Challenge,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateChallenge {
    pub name: String,
    pub duration: i32,
    pub kind: ChallengeKind,
    pub emoji: String,
    pub created_by: Uuid,
    pub share_code: Option<String>,
}

/// Whitelisted mutable columns; `None` leaves the column untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct UpdateChallenge {
    pub name: Option<String>,
    pub duration: Option<i32>,
    pub kind: Option<ChallengeKind>,
    pub emoji: Option<String>,
    pub participants: Option<i32>,
}

impl UpdateChallenge {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.duration.is_none()
            && self.kind.is_none()
            && self.emoji.is_none()
            && self.participants.is_none()
    }
}

const CHALLENGE_COLUMNS: &str = "id, name, duration, type, emoji, participants, created_by, created_at, is_public, share_code";

impl Challenge {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Challenge>(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_creator(
        pool: &SqlitePool,
        created_by: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Challenge>(&format!(
            "SELECT {CHALLENGE_COLUMNS}
               FROM challenges
              WHERE created_by = $1
              ORDER BY created_at ASC"
        ))
        .bind(created_by)
        .fetch_all(pool)
        .await
    }

    /// Public group challenge carrying `share_code` (already normalized by the caller)
    pub async fn find_public_by_share_code(
        pool: &SqlitePool,
        share_code: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Challenge>(&format!(
            "SELECT {CHALLENGE_COLUMNS}
               FROM challenges
              WHERE share_code = $1
                AND is_public = 1
                AND type = 'group'"
        ))
        .bind(share_code)
        .fetch_optional(pool)
        .await
    }

    pub async fn share_code_exists(pool: &SqlitePool, share_code: &str) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM challenges WHERE share_code = $1",
        )
        .bind(share_code)
        .fetch_one(pool)
        .await?;
        Ok(count > 0)
    }

    /// Public group challenges created by anyone except `user_id`
    pub async fn find_public_excluding_creator(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Challenge>(&format!(
            "SELECT {CHALLENGE_COLUMNS}
               FROM challenges
              WHERE is_public = 1
                AND type = 'group'
                AND created_by <> $1
              ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    /// Challenges `user_id` joined, annotated with their join time
    pub async fn find_joined_by_user(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Vec<ChallengeWithJoin>, sqlx::Error> {
        sqlx::query_as::<_, ChallengeWithJoin>(
            r#"SELECT c.id, c.name, c.duration, c.type, c.emoji, c.participants,
                      c.created_by, c.created_at, c.is_public, c.share_code,
                      cp.joined_at
                 FROM challenge_participants cp
                 JOIN challenges c ON c.id = cp.challenge_id
                WHERE cp.user_id = $1
                ORDER BY cp.joined_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub async fn create<'e, E>(
        executor: E,
        data: &CreateChallenge,
        id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let is_public = data.kind.is_group();
        sqlx::query_as::<_, Challenge>(&format!(
            "INSERT INTO challenges (id, name, duration, type, emoji, participants, created_by, created_at, is_public, share_code)
             VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8, $9)
             RETURNING {CHALLENGE_COLUMNS}"
        ))
        .bind(id)
        .bind(&data.name)
        .bind(data.duration)
        .bind(data.kind)
        .bind(&data.emoji)
        .bind(data.created_by)
        .bind(created_at)
        .bind(is_public)
        .bind(data.share_code.as_deref())
        .fetch_one(executor)
        .await
    }

    /// Apply the whitelisted fields. Switching kind keeps `is_public` and the share code in step:
    /// a challenge turned into a group one receives `fallback_share_code` unless it already has a
    /// code, an individual one loses its code. Returns `None` when `id` does not exist.
    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateChallenge,
        fallback_share_code: Option<&str>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Challenge>(&format!(
            "UPDATE challenges
                SET name         = COALESCE($2, name),
                    duration     = COALESCE($3, duration),
                    type         = COALESCE($4, type),
                    emoji        = COALESCE($5, emoji),
                    participants = COALESCE($6, participants),
                    is_public    = CASE WHEN $4 IS NULL THEN is_public ELSE $4 = 'group' END,
                    share_code   = CASE
                                     WHEN $4 IS NULL THEN share_code
                                     WHEN $4 = 'group' THEN COALESCE(share_code, $7)
                                     ELSE NULL
                                   END
              WHERE id = $1
              RETURNING {CHALLENGE_COLUMNS}"
        ))
        .bind(id)
        .bind(data.name.as_deref())
        .bind(data.duration)
        .bind(data.kind)
        .bind(data.emoji.as_deref())
        .bind(data.participants)
        .bind(fallback_share_code)
        .fetch_optional(pool)
        .await
    }

    pub async fn increment_participants<'e, E>(executor: E, id: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result =
            sqlx::query("UPDATE challenges SET participants = participants + 1 WHERE id = $1")
                .bind(id)
                .execute(executor)
                .await?;
        Ok(result.rows_affected())
    }

    /// Participants and progress rows go with it through `ON DELETE CASCADE`
    pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM challenges WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
