use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_REGION: &str = "na";

/// Platform shard a league plays on. Always lowercase (`na`, `euw`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Region(String);

impl Region {
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self(DEFAULT_REGION.to_string());
        }
        Self(trimmed.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Region {
    fn default() -> Self {
        Self(DEFAULT_REGION.to_string())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `(region, externalGameId)`; the persistence key is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GameId {
    pub region: Region,
    pub external_id: u64,
}

impl GameId {
    pub fn new(region: Region, external_id: u64) -> Self {
        Self {
            region,
            external_id,
        }
    }

    pub fn key(&self) -> String {
        format!("{}-{}", self.region, self.external_id)
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.region, self.external_id)
    }
}

pub fn player_key(region: &Region, player_id: i64) -> String {
    format!("{region}-{player_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerRef {
    pub riot_id: i64,
    pub summoner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamRef {
    pub league_id: String,
    pub team_id: String,
}

impl TeamRef {
    pub fn new(league_id: &str, team_id: &str) -> Self {
        Self {
            league_id: league_id.to_string(),
            team_id: team_id.to_string(),
        }
    }
}

impl fmt::Display for TeamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "league/{}/team/{}", self.league_id, self.team_id)
    }
}

/// One game as reported in a single player's recent-games list.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub game_id: u64,
    pub created_at: DateTime<Utc>,
    pub game_mode: Option<String>,
    pub game_type: Option<String>,
    pub sub_type: Option<String>,
    pub side: Option<i64>,
    pub champion_id: Option<i64>,
    /// Other players in the game, excluding the reporting player.
    pub participants: Vec<i64>,
    /// Raw upstream stats object, stored verbatim.
    pub stats: Value,
}

/// Metadata used to create the canonical game row.
#[derive(Debug, Clone)]
pub struct NewGame {
    pub id: GameId,
    pub sample_player_id: i64,
    pub created_at: DateTime<Utc>,
    pub game_mode: Option<String>,
    pub game_type: Option<String>,
    pub sub_type: Option<String>,
}

impl NewGame {
    pub fn from_sample(id: &GameId, sample_player_id: i64, sample: &GameRecord) -> Self {
        Self {
            id: id.clone(),
            sample_player_id,
            created_at: sample.created_at,
            game_mode: sample.game_mode.clone(),
            game_type: sample.game_type.clone(),
            sub_type: sample.sub_type.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPlayerStats<'a> {
    pub game: &'a GameId,
    pub player_id: i64,
    pub stats: &'a Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredGame {
    pub game_key: String,
    pub region: String,
    pub external_game_id: u64,
    pub sample_player_id: i64,
    pub created_at: String,
    pub game_mode: Option<String>,
    pub game_type: Option<String>,
    pub sub_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPlayerGameStats {
    pub game_key: String,
    pub player_id: i64,
    pub player_key: String,
    pub saved: bool,
    pub stats: Option<Value>,
    pub saved_at: Option<String>,
}
