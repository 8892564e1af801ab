use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Completion of one day of a challenge by one user. Absence of a row means "not completed".
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct ProgressEntry {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub user_id: Uuid,
    pub day_number: i32, // 1-based
    pub completed: bool,
    pub completed_at: DateTime<Utc>,
}

impl ProgressEntry {
    pub async fn find_for_user(
        pool: &SqlitePool,
        challenge_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ProgressEntry>(
            r#"SELECT id, challenge_id, user_id, day_number, completed, completed_at
                 FROM progress_entries
                WHERE challenge_id = $1 AND user_id = $2
                ORDER BY day_number ASC"#,
        )
        .bind(challenge_id)
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    /// Entries of every participant of the challenge
    pub async fn find_for_challenge(
        pool: &SqlitePool,
        challenge_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ProgressEntry>(
            r#"SELECT id, challenge_id, user_id, day_number, completed, completed_at
                 FROM progress_entries
                WHERE challenge_id = $1
                ORDER BY user_id ASC, day_number ASC"#,
        )
        .bind(challenge_id)
        .fetch_all(pool)
        .await
    }

    /// Insert or refresh the completed entry for (challenge, user, day)
    pub async fn upsert_completed<'e, E>(
        executor: E,
        challenge_id: Uuid,
        user_id: Uuid,
        day_number: i32,
        completed_at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, ProgressEntry>(
            r#"INSERT INTO progress_entries (id, challenge_id, user_id, day_number, completed, completed_at)
               VALUES ($1, $2, $3, $4, 1, $5)
               ON CONFLICT(challenge_id, user_id, day_number) DO UPDATE SET
                   completed = 1,
                   completed_at = excluded.completed_at
               RETURNING id, challenge_id, user_id, day_number, completed, completed_at"#,
        )
        .bind(id)
        .bind(challenge_id)
        .bind(user_id)
        .bind(day_number)
        .bind(completed_at)
        .fetch_one(executor)
        .await
    }

    pub async fn delete_day<'e, E>(
        executor: E,
        challenge_id: Uuid,
        user_id: Uuid,
        day_number: i32,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "DELETE FROM progress_entries WHERE challenge_id = $1 AND user_id = $2 AND day_number = $3",
        )
        .bind(challenge_id)
        .bind(user_id)
        .bind(day_number)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DBService,
        models::challenge::{Challenge, ChallengeKind, CreateChallenge},
    };

    async fn seeded() -> (DBService, Challenge) {
        let db = DBService::new_in_memory().await.unwrap();
        let challenge = Challenge::create(
            &db.pool,
            &CreateChallenge {
                name: "Beber agua".to_string(),
                duration: 14,
                kind: ChallengeKind::Individual,
                emoji: "💧".to_string(),
                created_by: Uuid::new_v4(),
                share_code: None,
            },
            Uuid::new_v4(),
            Utc::now(),
        )
        .await
        .unwrap();
        (db, challenge)
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_on_day() {
        let (db, challenge) = seeded().await;
        let user = challenge.created_by;
        ProgressEntry::upsert_completed(&db.pool, challenge.id, user, 3, Utc::now())
            .await
            .unwrap();
        ProgressEntry::upsert_completed(&db.pool, challenge.id, user, 3, Utc::now())
            .await
            .unwrap();
        ProgressEntry::upsert_completed(&db.pool, challenge.id, user, 1, Utc::now())
            .await
            .unwrap();

        let entries = ProgressEntry::find_for_user(&db.pool, challenge.id, user)
            .await
            .unwrap();
        let days: Vec<i32> = entries.iter().map(|e| e.day_number).collect();
        assert_eq!(days, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_deleting_challenge_cascades_to_entries() {
        let (db, challenge) = seeded().await;
        let user = challenge.created_by;
        ProgressEntry::upsert_completed(&db.pool, challenge.id, user, 1, Utc::now())
            .await
            .unwrap();

        assert_eq!(Challenge::delete(&db.pool, challenge.id).await.unwrap(), 1);
        let entries = ProgressEntry::find_for_challenge(&db.pool, challenge.id)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }
}
