//! Dashboard figures for the current actor: every own challenge with its progress summary, and
//! the totals derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ts_rs::TS;

use super::{
    auth::AuthState,
    backend::Backends,
    challenges::{ChallengeStore, ChallengeView},
    progress::{ChallengeStatus, ProgressStore, ProgressSummary},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeOverview {
    #[serde(flatten)]
    #[ts(flatten)]
    pub challenge: ChallengeView,
    pub summary: ProgressSummary,
}

impl ChallengeOverview {
    pub fn status(&self) -> ChallengeStatus {
        self.summary.status
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ActorStats {
    pub total_challenges: usize,
    pub completed_challenges: usize,
    pub active_challenges: usize,
    pub not_started_challenges: usize,
}

impl ActorStats {
    pub fn from_overviews(overviews: &[ChallengeOverview]) -> Self {
        overviews.iter().fold(
            Self {
                total_challenges: overviews.len(),
                ..Self::default()
            },
            |mut stats, overview| {
                match overview.status() {
                    ChallengeStatus::Completed => stats.completed_challenges += 1,
                    ChallengeStatus::InProgress => stats.active_challenges += 1,
                    ChallengeStatus::NotStarted => stats.not_started_challenges += 1,
                }
                stats
            },
        )
    }
}

/// Overviews in `status`, order preserved
pub fn with_status(
    overviews: &[ChallengeOverview],
    status: ChallengeStatus,
) -> Vec<ChallengeOverview> {
    overviews
        .iter()
        .filter(|o| o.status() == status)
        .cloned()
        .collect()
}

/// Reads only; every failure degrades the same way the underlying stores do
pub struct StatsService {
    backends: Backends,
    auth: AuthState,
}

impl StatsService {
    pub fn new(backends: Backends, auth: AuthState) -> Self {
        Self { backends, auth }
    }

    pub async fn overview(&self) -> Vec<ChallengeOverview> {
        self.overview_at(Utc::now()).await
    }

    pub async fn overview_at(&self, now: DateTime<Utc>) -> Vec<ChallengeOverview> {
        let challenges = ChallengeStore::new(self.backends.challenges(&self.auth))
            .refresh()
            .await;

        let mut overviews = Vec::with_capacity(challenges.len());
        for challenge in challenges {
            let progress = ProgressStore::new(self.backends.progress(&self.auth, &challenge.id));
            if let Err(e) = progress.load_at(now).await {
                // deleted between the two reads
                warn!(challenge_id = %challenge.id, error = %e, "Skipping challenge in overview");
                continue;
            }
            overviews.push(ChallengeOverview {
                summary: progress.summary().await,
                challenge,
            });
        }
        debug!(count = overviews.len(), "Challenge overview built");
        overviews
    }

    pub async fn stats(&self) -> ActorStats {
        self.stats_at(Utc::now()).await
    }

    pub async fn stats_at(&self, now: DateTime<Utc>) -> ActorStats {
        ActorStats::from_overviews(&self.overview_at(now).await)
    }
}
