use std::fmt::Write;
use std::time::Duration;

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::aggregate::CollectiveGameStats;
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::game_client::GameStatsSource;
use crate::model::{GameId, NewGame, NewPlayerStats, PlayerRef, Region, TeamRef};
use crate::rate_limiter::{Clock, DefaultClock, Reference, TokenBucket};
use crate::roster::RosterSource;
use crate::store::{GameStore, StatsWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestStage {
    ResolvingRoster,
    Fetching,
    Aggregating,
    Filtering,
    WritingGames,
    WritingStats,
    Done,
}

/// Collaborators of one job. Everything here may be shared by jobs running
/// concurrently. `clock` should be the one the limiter was built with.
pub struct IngestDeps<'a, C: Clock = DefaultClock> {
    pub roster: &'a dyn RosterSource,
    pub games: &'a dyn GameStatsSource,
    pub limiter: &'a TokenBucket<C>,
    pub store: &'a dyn GameStore,
    pub clock: &'a C,
}

impl<C: Clock> Clone for IngestDeps<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Clock> Copy for IngestDeps<'_, C> {}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub min_team_members: usize,
    pub tokens_per_fetch: u32,
    pub timeout: Option<Duration>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            min_team_members: crate::config::DEFAULT_MIN_TEAM_MEMBERS,
            tokens_per_fetch: 1,
            timeout: None,
        }
    }
}

impl IngestOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            min_team_members: config.min_team_members,
            tokens_per_fetch: 1,
            timeout: config.job_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFailure {
    pub game_key: String,
    pub player_id: Option<i64>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub team: TeamRef,
    pub region: Region,
    pub players: Vec<PlayerRef>,
    pub started_at: String,
    pub finished_at: String,
    pub min_team_members: usize,
    pub players_fetched: usize,
    pub rate_limited: bool,
    pub rate_limit_reason: Option<String>,
    pub observations: usize,
    pub games_found: usize,
    pub games_dropped: usize,
    pub games_created: usize,
    pub games_linked: usize,
    pub stats_written: usize,
    pub stats_already_saved: usize,
    pub stats_missing: usize,
    pub write_failures: Vec<WriteFailure>,
    pub debug_dump: String,
}

impl IngestReport {
    pub fn is_partial(&self) -> bool {
        self.rate_limited
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Found {} games with at least {} players from:",
            self.games_found, self.min_team_members
        );
        for player in &self.players {
            let _ = writeln!(out, "  {} ({})", player.summoner, player.riot_id);
        }
        let _ = writeln!(
            out,
            "Fetched {}/{} players ({} region){}",
            self.players_fetched,
            self.players.len(),
            self.region,
            if self.rate_limited {
                " - stopped early, rate limit reached"
            } else {
                ""
            }
        );
        let _ = writeln!(
            out,
            "Games: {} created, {} newly linked to {}; stats: {} written, {} already saved, {} without stats",
            self.games_created,
            self.games_linked,
            self.team,
            self.stats_written,
            self.stats_already_saved,
            self.stats_missing
        );
        if !self.write_failures.is_empty() {
            let _ = writeln!(out, "Write failures: {}", self.write_failures.len());
            for failure in &self.write_failures {
                match failure.player_id {
                    Some(player_id) => {
                        let _ = writeln!(out, " - {}/{}: {}", failure.game_key, player_id, failure.error);
                    }
                    None => {
                        let _ = writeln!(out, " - {}: {}", failure.game_key, failure.error);
                    }
                }
            }
        }
        out.push_str(&self.debug_dump);
        out
    }
}

/// Fetches the recent games of every player on `team`, keeps the games played
/// by at least `min_team_members` roster players and persists them.
///
/// Running out of rate-limit tokens (locally, or an upstream 429) stops the
/// fetch loop but everything already gathered is still written. Any other
/// fetch error aborts the job before anything is written. Individual write
/// failures are logged and reported without stopping the remaining writes.
pub fn fetch_team_match_history<C: Clock>(
    deps: &IngestDeps<'_, C>,
    team: &TeamRef,
    options: &IngestOptions,
) -> Result<IngestReport, IngestError> {
    let started_at = Utc::now().to_rfc3339();
    let deadline = options.timeout.map(|timeout| Deadline {
        start: deps.clock.now(),
        timeout,
    });

    enter(team, IngestStage::ResolvingRoster);
    let roster = deps.roster.team_roster(&team.league_id, &team.team_id)?;
    let region = roster.region.clone();

    enter(team, IngestStage::Fetching);
    let mut collective = CollectiveGameStats::new();
    let mut players_fetched = 0usize;
    let mut observations = 0usize;
    let mut rate_limit_reason = None;
    for player in &roster.players {
        check_deadline(deps.clock, deadline.as_ref(), IngestStage::Fetching)?;
        if let Err(err) = deps.limiter.try_consume(options.tokens_per_fetch) {
            warn!(%team, player_id = player.riot_id, %err, "rate limit reached, keeping fetched games");
            rate_limit_reason = Some(err.to_string());
            break;
        }
        let records = match deps.games.fetch_recent_games(&region, player.riot_id) {
            Ok(records) => records,
            Err(err) if err.is_quota() => {
                warn!(%team, player_id = player.riot_id, %err, "upstream quota reached, keeping fetched games");
                rate_limit_reason = Some(err.to_string());
                break;
            }
            Err(source) => {
                error!(%team, player_id = player.riot_id, error = %source, "fetch failed, aborting job");
                return Err(IngestError::Fetch {
                    player_id: player.riot_id,
                    source,
                });
            }
        };
        players_fetched += 1;

        enter(team, IngestStage::Aggregating);
        for record in records {
            observations += 1;
            let id = GameId::new(region.clone(), record.game_id);
            collective.add(id, player.riot_id, record);
        }
    }

    enter(team, IngestStage::Filtering);
    let games_dropped =
        collective.filter_to_games_with_at_least(options.min_team_members, &roster.players);
    info!(
        %team,
        players_fetched,
        observations,
        games_found = collective.len(),
        games_dropped,
        "aggregated recent games"
    );

    let mut write_failures = Vec::new();

    enter(team, IngestStage::WritingGames);
    let mut games_created = 0usize;
    let mut games_linked = 0usize;
    for entry in collective.games() {
        check_deadline(deps.clock, deadline.as_ref(), IngestStage::WritingGames)?;
        let game = NewGame::from_sample(entry.id, entry.sample_player_id, entry.sample);
        match deps.store.ensure_game_exists(&game, team) {
            Ok(write) => {
                games_created += usize::from(write.created);
                games_linked += usize::from(write.linked);
            }
            Err(err) => {
                error!(game = %entry.id, %team, %err, "failed to create game");
                write_failures.push(WriteFailure {
                    game_key: entry.id.key(),
                    player_id: None,
                    error: err.to_string(),
                });
            }
        }
    }

    enter(team, IngestStage::WritingStats);
    let mut stats_written = 0usize;
    let mut stats_already_saved = 0usize;
    let mut stats_missing = 0usize;
    for entry in collective.stats() {
        let Some(record) = entry.record else {
            stats_missing += 1;
            continue;
        };
        check_deadline(deps.clock, deadline.as_ref(), IngestStage::WritingStats)?;
        let stats = NewPlayerStats {
            game: entry.game,
            player_id: entry.player_id,
            stats: &record.stats,
        };
        match deps.store.ensure_player_stats_exists(&stats) {
            Ok(StatsWrite::Written) => stats_written += 1,
            Ok(StatsWrite::AlreadySaved) => stats_already_saved += 1,
            Err(err) => {
                error!(game = %entry.game, player_id = entry.player_id, %err, "failed to store stats");
                write_failures.push(WriteFailure {
                    game_key: entry.game.key(),
                    player_id: Some(entry.player_id),
                    error: err.to_string(),
                });
            }
        }
    }

    let mut debug_dump = String::new();
    let _ = collective.write_debug(&mut debug_dump);

    enter(team, IngestStage::Done);
    Ok(IngestReport {
        team: team.clone(),
        region,
        players: roster.players,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        min_team_members: options.min_team_members,
        players_fetched,
        rate_limited: rate_limit_reason.is_some(),
        rate_limit_reason,
        observations,
        games_found: collective.len(),
        games_dropped,
        games_created,
        games_linked,
        stats_written,
        stats_already_saved,
        stats_missing,
        write_failures,
        debug_dump,
    })
}

/// Runs one job per team on a pool of `parallelism` threads. All jobs share
/// the same limiter and store. Results come back in `teams` order.
pub fn run_team_jobs<C>(
    deps: &IngestDeps<'_, C>,
    teams: &[TeamRef],
    options: &IngestOptions,
    parallelism: usize,
) -> Vec<Result<IngestReport, IngestError>>
where
    C: Clock + Sync,
{
    let run = || {
        teams
            .par_iter()
            .map(|team| fetch_team_match_history(deps, team, options))
            .collect::<Vec<_>>()
    };
    match rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism.max(1))
        .build()
    {
        Ok(pool) => pool.install(run),
        Err(_) => run(),
    }
}

fn enter(team: &TeamRef, stage: IngestStage) {
    debug!(%team, ?stage, "ingest stage");
}

struct Deadline<I> {
    start: I,
    timeout: Duration,
}

fn check_deadline<C: Clock>(
    clock: &C,
    deadline: Option<&Deadline<C::Instant>>,
    stage: IngestStage,
) -> Result<(), IngestError> {
    match deadline {
        Some(deadline)
            if Duration::from(clock.now().duration_since(deadline.start)) >= deadline.timeout =>
        {
            warn!(?stage, "ingest deadline exceeded");
            Err(IngestError::DeadlineExceeded { stage })
        }
        _ => Ok(()),
    }
}
