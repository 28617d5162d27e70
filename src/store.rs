use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};

use crate::config::app_data_dir;
use crate::error::{RosterError, StoreError};
use crate::ingest::IngestReport;
use crate::model::{
    GameId, NewGame, NewPlayerStats, PlayerRef, Region, StoredGame, StoredPlayerGameStats,
    TeamRef, player_key,
};
use crate::roster::{Roster, RosterSource};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameWrite {
    /// This call created the canonical game row.
    pub created: bool,
    /// This call added the (game, team) association.
    pub linked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsWrite {
    Written,
    AlreadySaved,
}

/// Single-key transactional writes for games and per-player stats.
///
/// Both operations are safe to repeat and to race: a missing row is the
/// normal precondition, and losing a race to another writer is a no-op.
pub trait GameStore: Send + Sync {
    fn ensure_game_exists(&self, game: &NewGame, team: &TeamRef) -> Result<GameWrite, StoreError>;

    fn ensure_player_stats_exists(&self, stats: &NewPlayerStats<'_>)
    -> Result<StatsWrite, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

pub fn default_db_path() -> Option<PathBuf> {
    app_data_dir().map(|dir| dir.join("team_history.sqlite"))
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened sqlite store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert_league(&self, league_id: &str, name: &str, region: &Region) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO leagues (league_id, name, region) VALUES (?1, ?2, ?3)
             ON CONFLICT(league_id) DO UPDATE SET name = excluded.name, region = excluded.region",
            params![league_id, name, region.as_str()],
        )?;
        Ok(())
    }

    pub fn upsert_team(&self, team: &TeamRef, name: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO teams (league_id, team_id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(league_id, team_id) DO UPDATE SET name = excluded.name",
            params![team.league_id, team.team_id, name],
        )?;
        Ok(())
    }

    /// Appends a player to the end of the team's roster, or renames an
    /// existing one in place.
    pub fn add_team_player(&self, team: &TeamRef, player: &PlayerRef) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next_position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM team_players WHERE league_id = ?1 AND team_id = ?2",
            params![team.league_id, team.team_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO team_players (league_id, team_id, riot_id, summoner, position)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(league_id, team_id, riot_id) DO UPDATE SET summoner = excluded.summoner",
            params![
                team.league_id,
                team.team_id,
                player.riot_id,
                player.summoner,
                next_position
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_game(&self, id: &GameId) -> Result<Option<StoredGame>, StoreError> {
        let game = self
            .lock()
            .query_row(
                &format!("SELECT {GAME_COLUMNS} FROM games WHERE game_key = ?1"),
                params![id.key()],
                stored_game_from_row,
            )
            .optional()?;
        Ok(game)
    }

    pub fn load_player_stats(
        &self,
        id: &GameId,
        player_id: i64,
    ) -> Result<Option<StoredPlayerGameStats>, StoreError> {
        let row = self
            .lock()
            .query_row(
                "SELECT game_key, player_id, player_key, saved, riot_data, saved_at
                 FROM player_game_stats WHERE game_key = ?1 AND player_id = ?2",
                params![id.key(), player_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)? != 0,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((game_key, player_id, player_key, saved, raw, saved_at)) = row else {
            return Ok(None);
        };
        let stats = raw.map(|s| serde_json::from_str(&s)).transpose()?;
        Ok(Some(StoredPlayerGameStats {
            game_key,
            player_id,
            player_key,
            saved,
            stats,
            saved_at,
        }))
    }

    /// Games linked to `team`, newest first.
    pub fn games_for_team(&self, team: &TeamRef) -> Result<Vec<StoredGame>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT g.game_key, g.region, g.external_game_id, g.sample_player_id, g.created_at,
                    g.game_mode, g.game_type, g.sub_type
             FROM game_teams t
             JOIN games g ON g.game_key = t.game_key
             WHERE t.league_id = ?1 AND t.team_id = ?2
             ORDER BY t.game_created_at DESC, g.game_key ASC",
        )?;
        let rows = stmt.query_map(params![team.league_id, team.team_id], stored_game_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_games(&self) -> Result<usize, StoreError> {
        self.count("SELECT COUNT(*) FROM games")
    }

    pub fn count_game_links(&self) -> Result<usize, StoreError> {
        self.count("SELECT COUNT(*) FROM game_teams")
    }

    pub fn count_player_stats(&self) -> Result<usize, StoreError> {
        self.count("SELECT COUNT(*) FROM player_game_stats")
    }

    fn count(&self, sql: &str) -> Result<usize, StoreError> {
        let n: i64 = self.lock().query_row(sql, [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    pub fn record_ingest_run(&self, report: &IngestReport) -> Result<i64, StoreError> {
        let errors_json = serde_json::to_string(&report.write_failures)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ingest_runs (
                started_at, finished_at, league_id, team_id, region,
                players_total, players_fetched, rate_limited,
                games_found, games_created, stats_written, errors_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                report.started_at,
                report.finished_at,
                report.team.league_id,
                report.team.team_id,
                report.region.as_str(),
                report.players.len() as i64,
                report.players_fetched as i64,
                bool_to_i64(report.rate_limited),
                report.games_found as i64,
                report.games_created as i64,
                report.stats_written as i64,
                errors_json,
            ],
        )?;
        let run_id = conn.last_insert_rowid();
        info!(run_id, team = %report.team, "recorded ingest run");
        Ok(run_id)
    }
}

impl GameStore for SqliteStore {
    fn ensure_game_exists(&self, game: &NewGame, team: &TeamRef) -> Result<GameWrite, StoreError> {
        let key = game.id.key();
        let created_at = game.created_at.to_rfc3339();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM games WHERE game_key = ?1",
                params![key],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        let created = if exists {
            false
        } else {
            tx.execute(
                "INSERT INTO games (
                    game_key, region, external_game_id, sample_player_id, created_at,
                    game_mode, game_type, sub_type, inserted_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(game_key) DO NOTHING",
                params![
                    key,
                    game.id.region.as_str(),
                    game.id.external_id as i64,
                    game.sample_player_id,
                    created_at,
                    game.game_mode,
                    game.game_type,
                    game.sub_type,
                    now,
                ],
            )? == 1
        };
        let linked = tx.execute(
            "INSERT INTO game_teams (game_key, league_id, team_id, game_created_at, linked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(game_key, league_id, team_id) DO NOTHING",
            params![key, team.league_id, team.team_id, created_at, now],
        )? == 1;
        tx.commit()?;

        debug!(game = %key, created, linked, "ensured game");
        Ok(GameWrite { created, linked })
    }

    fn ensure_player_stats_exists(
        &self,
        stats: &NewPlayerStats<'_>,
    ) -> Result<StatsWrite, StoreError> {
        let key = stats.game.key();
        let pkey = player_key(&stats.game.region, stats.player_id);
        let payload = serde_json::to_string(stats.stats)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let saved = tx
            .query_row(
                "SELECT saved FROM player_game_stats WHERE game_key = ?1 AND player_id = ?2",
                params![key, stats.player_id],
                |row| Ok(row.get::<_, i64>(0)? != 0),
            )
            .optional()?;
        // Each write is conditioned on the state just read; zero affected rows
        // means another writer got there first.
        let written = match saved {
            Some(true) => false,
            None => {
                tx.execute(
                    "INSERT INTO player_game_stats (game_key, player_id, player_key, saved, riot_data, saved_at)
                     VALUES (?1, ?2, ?3, 1, ?4, ?5)
                     ON CONFLICT(game_key, player_id) DO NOTHING",
                    params![key, stats.player_id, pkey, payload, now],
                )? == 1
            }
            Some(false) => {
                tx.execute(
                    "UPDATE player_game_stats
                     SET player_key = ?3, saved = 1, riot_data = ?4, saved_at = ?5
                     WHERE game_key = ?1 AND player_id = ?2 AND saved = 0",
                    params![key, stats.player_id, pkey, payload, now],
                )? == 1
            }
        };
        tx.commit()?;

        debug!(game = %key, player_id = stats.player_id, written, "ensured player stats");
        Ok(if written {
            StatsWrite::Written
        } else {
            StatsWrite::AlreadySaved
        })
    }
}

impl RosterSource for SqliteStore {
    fn team_roster(&self, league_id: &str, team_id: &str) -> Result<Roster, RosterError> {
        let conn = self.lock();
        let region = conn
            .query_row(
                "SELECT region FROM leagues WHERE league_id = ?1",
                params![league_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| RosterError::LeagueNotFound(league_id.to_string()))?;
        let team_exists = conn
            .query_row(
                "SELECT 1 FROM teams WHERE league_id = ?1 AND team_id = ?2",
                params![league_id, team_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !team_exists {
            return Err(RosterError::TeamNotFound {
                league_id: league_id.to_string(),
                team_id: team_id.to_string(),
            });
        }

        let mut stmt = conn.prepare(
            "SELECT riot_id, summoner FROM team_players
             WHERE league_id = ?1 AND team_id = ?2
             ORDER BY position ASC, riot_id ASC",
        )?;
        let rows = stmt.query_map(params![league_id, team_id], |row| {
            Ok(PlayerRef {
                riot_id: row.get(0)?,
                summoner: row.get(1)?,
            })
        })?;
        let mut players = Vec::new();
        for row in rows {
            players.push(row?);
        }
        Ok(Roster {
            region: Region::new(&region),
            players,
        })
    }
}

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS leagues (
            league_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            region TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS teams (
            league_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (league_id, team_id)
        );
        CREATE TABLE IF NOT EXISTS team_players (
            league_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            riot_id INTEGER NOT NULL,
            summoner TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (league_id, team_id, riot_id)
        );

        CREATE TABLE IF NOT EXISTS games (
            game_key TEXT PRIMARY KEY,
            region TEXT NOT NULL,
            external_game_id INTEGER NOT NULL,
            sample_player_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            game_mode TEXT NULL,
            game_type TEXT NULL,
            sub_type TEXT NULL,
            inserted_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS game_teams (
            game_key TEXT NOT NULL,
            league_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            game_created_at TEXT NOT NULL,
            linked_at TEXT NOT NULL,
            PRIMARY KEY (game_key, league_id, team_id)
        );
        CREATE INDEX IF NOT EXISTS idx_game_teams_team
            ON game_teams(league_id, team_id, game_created_at);

        CREATE TABLE IF NOT EXISTS player_game_stats (
            game_key TEXT NOT NULL,
            player_id INTEGER NOT NULL,
            player_key TEXT NOT NULL,
            saved INTEGER NOT NULL DEFAULT 0,
            riot_data TEXT NULL,
            saved_at TEXT NULL,
            PRIMARY KEY (game_key, player_id)
        );
        CREATE INDEX IF NOT EXISTS idx_player_game_stats_player
            ON player_game_stats(player_key);

        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            league_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            region TEXT NOT NULL,
            players_total INTEGER NOT NULL,
            players_fetched INTEGER NOT NULL,
            rate_limited INTEGER NOT NULL,
            games_found INTEGER NOT NULL,
            games_created INTEGER NOT NULL,
            stats_written INTEGER NOT NULL,
            errors_json TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

const GAME_COLUMNS: &str = "game_key, region, external_game_id, sample_player_id, created_at, \
                            game_mode, game_type, sub_type";

fn stored_game_from_row(row: &Row<'_>) -> rusqlite::Result<StoredGame> {
    Ok(StoredGame {
        game_key: row.get(0)?,
        region: row.get(1)?,
        external_game_id: row.get::<_, u64>(2)?,
        sample_player_id: row.get(3)?,
        created_at: row.get(4)?,
        game_mode: row.get(5)?,
        game_type: row.get(6)?,
        sub_type: row.get(7)?,
    })
}

fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}
