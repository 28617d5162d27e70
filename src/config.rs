use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::game_client::DEFAULT_API_BASE;
use crate::http_client::DEFAULT_REQUEST_TIMEOUT_SECS;

const APP_DIR: &str = "team_history";

pub const DEFAULT_MIN_TEAM_MEMBERS: usize = 3;
/// A team fields five players.
pub const MAX_MIN_TEAM_MEMBERS: usize = 5;
pub const DEFAULT_RATE_LIMIT_TOKENS: u32 = 10;
pub const DEFAULT_RATE_LIMIT_PERIOD_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub min_team_members: usize,
    pub rate_limit_tokens: u32,
    pub rate_limit_period: Duration,
    pub http_timeout: Duration,
    pub job_timeout: Option<Duration>,
    pub parallelism: usize,
    pub db_path: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            min_team_members: DEFAULT_MIN_TEAM_MEMBERS,
            rate_limit_tokens: DEFAULT_RATE_LIMIT_TOKENS,
            rate_limit_period: Duration::from_secs(DEFAULT_RATE_LIMIT_PERIOD_SECS),
            http_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            job_timeout: None,
            parallelism: 4,
            db_path: None,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: env_string("RIOT_API_KEY"),
            api_base: env_string("RIOT_API_BASE").unwrap_or(defaults.api_base),
            min_team_members: clamp_min_team_members(
                env_parse::<usize>("MIN_TEAM_MEMBERS").unwrap_or(defaults.min_team_members),
            ),
            rate_limit_tokens: env_parse::<u32>("RIOT_RATE_LIMIT_TOKENS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.rate_limit_tokens),
            rate_limit_period: env_parse::<u64>("RIOT_RATE_LIMIT_PERIOD_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_period),
            http_timeout: env_parse::<u64>("HTTP_TIMEOUT_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            job_timeout: env_parse::<u64>("INGEST_TIMEOUT_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs),
            parallelism: env_parse::<usize>("INGEST_PARALLELISM")
                .unwrap_or(defaults.parallelism)
                .clamp(1, 16),
            db_path: env_string("TEAM_HISTORY_DB").map(PathBuf::from),
        }
    }
}

/// Membership thresholds outside `1..=5` either keep every game or none.
pub fn clamp_min_team_members(raw: usize) -> usize {
    raw.clamp(1, MAX_MIN_TEAM_MEMBERS)
}

/// `$XDG_CACHE_HOME/team_history`, falling back to `~/.cache/team_history`.
pub fn app_data_dir() -> Option<PathBuf> {
    if let Some(base) = env_string("XDG_CACHE_HOME") {
        return Some(PathBuf::from(base).join(APP_DIR));
    }
    let home = env_string("HOME")?;
    Some(PathBuf::from(home).join(".cache").join(APP_DIR))
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}
