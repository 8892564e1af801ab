//! Dual-backend selection: every store operation runs against exactly one of on-device storage
//! (anonymous sessions) or the shared relational store (authenticated sessions).

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use db::DBService;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use utils::storage::{FileStorage, KeyValueStorage};
use uuid::Uuid;

use super::{
    auth::AuthState,
    challenges::{ChallengeBackend, LocalChallenges, RemoteChallenges},
    config::Config,
    database_validator::DatabaseValidator,
    membership::MembershipService,
    migration::{MigrationError, Migrator},
    progress::{LocalProgress, ProgressBackend, RemoteProgress},
    stats::StatsService,
};

/// Tables the remote store must expose before any store is handed out
pub const REQUIRED_TABLES: [&str; 3] = ["challenges", "challenge_participants", "progress_entries"];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote call cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Local,
    Remote { actor: Uuid },
}

impl StorageMode {
    pub fn for_auth(auth: &AuthState) -> Self {
        match auth.user_id() {
            Some(actor) => Self::Remote { actor },
            None => Self::Local,
        }
    }
}

/// Timeout and cancellation applied to every remote call
#[derive(Debug, Clone)]
pub struct RemoteCallPolicy {
    timeout: Duration,
    cancel: CancellationToken,
}

impl RemoteCallPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Abort in-flight and future remote calls made through this policy
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(res) => res.map_err(|e| {
                    error!(op, error = %e, "Remote call failed");
                    BackendError::from(e)
                }),
                Err(_) => {
                    error!(op, timeout = ?self.timeout, "Remote call timed out");
                    Err(BackendError::Timeout(self.timeout))
                }
            },
        }
    }
}

/// Read-path failure policy: log and fall back to an empty result so views stay renderable.
pub(crate) fn degrade<T: Default, E: std::fmt::Display>(op: &'static str, result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!(op, error = %e, "Read failed, returning empty result");
            T::default()
        }
    }
}

/// Owns both backends and hands out the one matching the caller's auth state
#[derive(Clone)]
pub struct Backends {
    local: Arc<dyn KeyValueStorage>,
    db: DBService,
    policy: RemoteCallPolicy,
}

impl Backends {
    pub fn new(local: Arc<dyn KeyValueStorage>, db: DBService, policy: RemoteCallPolicy) -> Self {
        Self { local, db, policy }
    }

    /// File-backed local storage plus a validated connection to the configured remote store
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let local = FileStorage::new(&config.data_dir).with_context(|| {
            format!("opening local storage at {}", config.data_dir.display())
        })?;
        let db = DBService::new(&config.database_url)
            .await
            .context("connecting to the remote store")?;

        let validation = DatabaseValidator::new(db.pool.clone())
            .validate(&REQUIRED_TABLES)
            .await?;
        if !validation.is_ok() {
            anyhow::bail!(validation.summary());
        }

        info!(timeout = ?config.remote_timeout(), "Backends ready");
        Ok(Self::new(
            Arc::new(local),
            db,
            RemoteCallPolicy::new(config.remote_timeout()),
        ))
    }

    pub fn local_storage(&self) -> &Arc<dyn KeyValueStorage> {
        &self.local
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn policy(&self) -> &RemoteCallPolicy {
        &self.policy
    }

    pub fn challenges(&self, auth: &AuthState) -> Arc<dyn ChallengeBackend> {
        match StorageMode::for_auth(auth) {
            StorageMode::Local => Arc::new(LocalChallenges::new(self.local.clone())),
            StorageMode::Remote { actor } => Arc::new(RemoteChallenges::new(
                self.db.clone(),
                actor,
                self.policy.clone(),
            )),
        }
    }

    pub fn progress(&self, auth: &AuthState, challenge_id: &str) -> Arc<dyn ProgressBackend> {
        match StorageMode::for_auth(auth) {
            StorageMode::Local => Arc::new(LocalProgress::new(self.local.clone(), challenge_id)),
            StorageMode::Remote { actor } => Arc::new(RemoteProgress::new(
                self.db.clone(),
                actor,
                challenge_id,
                self.policy.clone(),
            )),
        }
    }

    pub fn membership(&self, auth: &AuthState) -> MembershipService {
        MembershipService::new(self.db.clone(), auth.user_id(), self.policy.clone())
    }

    /// Migration copies local state into the remote store and therefore needs an identity
    pub fn migrator(&self, auth: &AuthState) -> Result<Migrator, MigrationError> {
        let actor = auth.user_id().ok_or(MigrationError::LoginRequired)?;
        Ok(Migrator::new(
            self.local.clone(),
            self.db.clone(),
            actor,
            self.policy.clone(),
        ))
    }

    pub fn stats(&self, auth: &AuthState) -> StatsService {
        StatsService::new(self.clone(), auth.clone())
    }

    pub fn shutdown(&self) {
        self.policy.cancel();
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_mode_follows_auth_state() {
        let user = Uuid::new_v4();
        assert_eq!(
            StorageMode::for_auth(&AuthState::authenticated(user)),
            StorageMode::Remote { actor: user }
        );
        let anonymous = AuthState::Anonymous {
            session_id: "session_1_abc".to_string(),
        };
        assert_eq!(StorageMode::for_auth(&anonymous), StorageMode::Local);
    }

    #[tokio::test]
    async fn test_policy_times_out_slow_calls() {
        let policy = RemoteCallPolicy::new(Duration::from_millis(20));
        let result: Result<(), BackendError> = policy
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BackendError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_policy_cancellation() {
        let policy = RemoteCallPolicy::new(Duration::from_secs(5));
        policy.cancel();
        let result: Result<u8, BackendError> = policy.run("cancelled", async { Ok(1) }).await;
        assert!(matches!(result, Err(BackendError::Cancelled)));
    }

    #[test]
    fn test_degrade_returns_default_on_error() {
        let failed: Result<Vec<u8>, &str> = Err("boom");
        assert!(degrade("list", failed).is_empty());
        assert_eq!(degrade("list", Ok::<_, &str>(vec![1u8])), vec![1]);
    }

    #[tokio::test]
    async fn test_connect_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_url: format!("sqlite://{}", dir.path().join("remote.sqlite").display()),
            data_dir: dir.path().join("local"),
            remote_timeout_secs: 2,
        };
        let backends = Backends::connect(&config).await.unwrap();
        assert_eq!(backends.policy().timeout(), Duration::from_secs(2));
        assert!(config.data_dir.exists());
    }
}
