#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::DateTime;
use serde_json::{Value, json};

use team_history::error::{FetchError, RosterError, StoreError};
use team_history::game_client::GameStatsSource;
use team_history::model::{GameRecord, NewGame, NewPlayerStats, PlayerRef, Region, TeamRef};
use team_history::roster::{Roster, RosterSource};
use team_history::store::{GameStore, GameWrite, SqliteStore, StatsWrite};

pub fn record(game_id: u64, participants: &[i64], stats: Value) -> GameRecord {
    GameRecord {
        game_id,
        created_at: DateTime::from_timestamp_millis(1_400_000_000_000 + game_id as i64 * 1_000)
            .unwrap(),
        game_mode: Some("CLASSIC".to_string()),
        game_type: Some("CUSTOM_GAME".to_string()),
        sub_type: None,
        side: Some(100),
        champion_id: None,
        participants: participants.to_vec(),
        stats,
    }
}

pub fn players(ids: &[i64]) -> Vec<PlayerRef> {
    ids.iter()
        .map(|id| PlayerRef {
            riot_id: *id,
            summoner: format!("P{id}"),
        })
        .collect()
}

pub struct FakeRoster {
    pub region: Region,
    pub players: Vec<PlayerRef>,
}

impl FakeRoster {
    pub fn new(ids: &[i64]) -> Self {
        Self {
            region: Region::new("na"),
            players: players(ids),
        }
    }
}

impl RosterSource for FakeRoster {
    fn team_roster(&self, league_id: &str, _team_id: &str) -> Result<Roster, RosterError> {
        if league_id == "missing" {
            return Err(RosterError::LeagueNotFound(league_id.to_string()));
        }
        Ok(Roster {
            region: self.region.clone(),
            players: self.players.clone(),
        })
    }
}

#[derive(Clone)]
pub enum Reply {
    Games(Vec<GameRecord>),
    Quota,
    Status(u16),
}

/// Canned upstream. Players without a reply have no recent games.
#[derive(Default)]
pub struct FakeGames {
    replies: HashMap<i64, Reply>,
    calls: Mutex<Vec<i64>>,
}

impl FakeGames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, player_id: i64, reply: Reply) -> Self {
        self.replies.insert(player_id, reply);
        self
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

impl GameStatsSource for FakeGames {
    fn fetch_recent_games(
        &self,
        _region: &Region,
        player_id: i64,
    ) -> Result<Vec<GameRecord>, FetchError> {
        self.calls.lock().unwrap().push(player_id);
        match self.replies.get(&player_id).cloned() {
            None => Ok(Vec::new()),
            Some(Reply::Games(games)) => Ok(games),
            Some(Reply::Quota) => Err(FetchError::QuotaExceeded),
            Some(Reply::Status(status)) => Err(FetchError::Status {
                status,
                body: "upstream error".to_string(),
            }),
        }
    }
}

/// Wraps a real store and fails writes for chosen keys.
pub struct FlakyStore<'a> {
    pub inner: &'a SqliteStore,
    pub fail_games: HashSet<String>,
    pub fail_stats: HashSet<(String, i64)>,
}

impl GameStore for FlakyStore<'_> {
    fn ensure_game_exists(&self, game: &NewGame, team: &TeamRef) -> Result<GameWrite, StoreError> {
        if self.fail_games.contains(&game.id.key()) {
            return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
        }
        self.inner.ensure_game_exists(game, team)
    }

    fn ensure_player_stats_exists(
        &self,
        stats: &NewPlayerStats<'_>,
    ) -> Result<StatsWrite, StoreError> {
        if self
            .fail_stats
            .contains(&(stats.game.key(), stats.player_id))
        {
            return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
        }
        self.inner.ensure_player_stats_exists(stats)
    }
}

pub fn stats_for(player_id: i64) -> Value {
    json!({ "player": player_id, "championsKilled": player_id % 10 })
}
