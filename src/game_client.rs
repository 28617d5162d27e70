use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde::de::Error as _;
use serde_json::Value;
use tracing::debug;

use crate::error::FetchError;
use crate::http_client::http_client;
use crate::model::{GameRecord, Region};

pub const DEFAULT_API_BASE: &str = "https://{region}.api.pvp.net";

/// Upstream source of a player's recent games.
///
/// Implementations make exactly one call per invocation and never retry.
/// An empty `Ok` means the player has no recent games.
pub trait GameStatsSource: Send + Sync {
    fn fetch_recent_games(
        &self,
        region: &Region,
        player_id: i64,
    ) -> Result<Vec<GameRecord>, FetchError>;
}

pub struct RiotClient {
    client: &'static Client,
    api_key: String,
    api_base: String,
}

impl RiotClient {
    pub fn new(api_key: Option<&str>, api_base: &str, timeout: Duration) -> Result<Self, FetchError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(FetchError::MissingApiKey)?;
        let client = http_client(timeout)?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn recent_games_url(&self, region: &Region, player_id: i64) -> String {
        let base = self.api_base.replace("{region}", region.as_str());
        format!(
            "{base}/api/lol/{region}/v1.3/game/by-summoner/{player_id}/recent?api_key={}",
            self.api_key
        )
    }
}

impl GameStatsSource for RiotClient {
    fn fetch_recent_games(
        &self,
        region: &Region,
        player_id: i64,
    ) -> Result<Vec<GameRecord>, FetchError> {
        let url = self.recent_games_url(region, player_id);
        let resp = self.client.get(&url).send()?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::QuotaExceeded);
        }
        let body = resp.text()?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let games = parse_recent_games_json(&body)?;
        debug!(%region, player_id, games = games.len(), "fetched recent games");
        Ok(games)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentGamesDto {
    #[serde(default)]
    games: Vec<GameDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameDto {
    game_id: u64,
    create_date: i64,
    game_mode: Option<String>,
    game_type: Option<String>,
    sub_type: Option<String>,
    team_id: Option<i64>,
    champion_id: Option<i64>,
    #[serde(default)]
    fellow_players: Vec<PlayerDto>,
    #[serde(default)]
    stats: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerDto {
    summoner_id: i64,
}

pub fn parse_recent_games_json(raw: &str) -> Result<Vec<GameRecord>, serde_json::Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let parsed: RecentGamesDto = serde_json::from_str(trimmed)?;
    parsed.games.into_iter().map(game_record_from_dto).collect()
}

fn game_record_from_dto(dto: GameDto) -> Result<GameRecord, serde_json::Error> {
    let created_at = DateTime::<Utc>::from_timestamp_millis(dto.create_date).ok_or_else(|| {
        serde_json::Error::custom(format!(
            "game {} has createDate {} out of range",
            dto.game_id, dto.create_date
        ))
    })?;
    let mut participants = dto
        .fellow_players
        .into_iter()
        .map(|p| p.summoner_id)
        .collect::<Vec<_>>();
    participants.sort_unstable();
    participants.dedup();
    Ok(GameRecord {
        game_id: dto.game_id,
        created_at,
        game_mode: dto.game_mode,
        game_type: dto.game_type,
        sub_type: dto.sub_type,
        side: dto.team_id,
        champion_id: dto.champion_id,
        participants,
        stats: dto.stats,
    })
}
