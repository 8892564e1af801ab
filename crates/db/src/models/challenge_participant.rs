use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// One user's participation in a group challenge; unique per (challenge, user)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct ChallengeParticipant {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

impl ChallengeParticipant {
    pub async fn find(
        pool: &SqlitePool,
        challenge_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ChallengeParticipant>(
            r#"SELECT id, challenge_id, user_id, joined_at
                 FROM challenge_participants
                WHERE challenge_id = $1 AND user_id = $2"#,
        )
        .bind(challenge_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn count_for_challenge(
        pool: &SqlitePool,
        challenge_id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM challenge_participants WHERE challenge_id = $1",
        )
        .bind(challenge_id)
        .fetch_one(pool)
        .await
    }

    pub async fn create<'e, E>(
        executor: E,
        challenge_id: Uuid,
        user_id: Uuid,
        joined_at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, ChallengeParticipant>(
            r#"INSERT INTO challenge_participants (id, challenge_id, user_id, joined_at)
               VALUES ($1, $2, $3, $4)
               RETURNING id, challenge_id, user_id, joined_at"#,
        )
        .bind(id)
        .bind(challenge_id)
        .bind(user_id)
        .bind(joined_at)
        .fetch_one(executor)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DBService,
        models::challenge::{Challenge, ChallengeKind, CreateChallenge},
    };

    #[tokio::test]
    async fn test_duplicate_participation_is_rejected_by_the_store() {
        let db = DBService::new_in_memory().await.unwrap();
        let challenge = Challenge::create(
            &db.pool,
            &CreateChallenge {
                name: "Meditar".to_string(),
                duration: 7,
                kind: ChallengeKind::Group,
                emoji: "🧘".to_string(),
                created_by: Uuid::new_v4(),
                share_code: Some("MED777".to_string()),
            },
            Uuid::new_v4(),
            Utc::now(),
        )
        .await
        .unwrap();
        let user = Uuid::new_v4();

        ChallengeParticipant::create(&db.pool, challenge.id, user, Utc::now())
            .await
            .unwrap();
        let second = ChallengeParticipant::create(&db.pool, challenge.id, user, Utc::now()).await;
        assert!(second.is_err());
        assert_eq!(
            ChallengeParticipant::count_for_challenge(&db.pool, challenge.id)
                .await
                .unwrap(),
            1
        );

        let joined = Challenge::find_joined_by_user(&db.pool, user).await.unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].challenge.id, challenge.id);
    }
}
