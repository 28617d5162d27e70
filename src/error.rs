use thiserror::Error;

use crate::ingest::IngestStage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded: requested {requested} token(s) from a bucket of {capacity}")]
pub struct RateLimitExceeded {
    pub requested: u32,
    pub capacity: u32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("riot api key is not configured")]
    MissingApiKey,

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream quota exceeded (http 429)")]
    QuotaExceeded,

    #[error("http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid recent games json: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    pub fn is_quota(&self) -> bool {
        matches!(self, FetchError::QuotaExceeded)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stats payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("league/{0} not found")]
    LeagueNotFound(String),

    #[error("league/{league_id}/team/{team_id} not found")]
    TeamNotFound { league_id: String, team_id: String },

    #[error("roster lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for RosterError {
    fn from(err: rusqlite::Error) -> Self {
        RosterError::Store(StoreError::Sqlite(err))
    }
}

/// Job-aborting failures. Per-key write failures never surface here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to resolve roster: {0}")]
    Roster(#[from] RosterError),

    #[error("fetching recent games for player {player_id} failed: {source}")]
    Fetch {
        player_id: i64,
        #[source]
        source: FetchError,
    },

    #[error("deadline exceeded during {stage:?}")]
    DeadlineExceeded { stage: IngestStage },
}
