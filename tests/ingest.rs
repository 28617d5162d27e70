mod common;

use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;

use common::{FakeGames, FakeRoster, FlakyStore, Reply, record, stats_for};
use team_history::error::{FetchError, IngestError, StoreError};
use team_history::game_client::GameStatsSource;
use team_history::ingest::{
    IngestDeps, IngestOptions, IngestStage, fetch_team_match_history, run_team_jobs,
};
use team_history::model::{GameId, GameRecord, NewGame, NewPlayerStats, Region, TeamRef};
use team_history::rate_limiter::{FakeRelativeClock, TokenBucket};
use team_history::store::{GameStore, GameWrite, SqliteStore, StatsWrite};

const G1: u64 = 1_001;
const G2: u64 = 1_002;

fn gid(id: u64) -> GameId {
    GameId::new(Region::new("na"), id)
}

fn team() -> TeamRef {
    TeamRef::new("spring", "blue")
}

fn options(min: usize) -> IngestOptions {
    IngestOptions {
        min_team_members: min,
        ..IngestOptions::default()
    }
}

/// Roster [1, 2, 3, 4]: G1 is played by 1, 2 and 3; G2 by 1 alone.
fn scenario_games() -> FakeGames {
    FakeGames::new()
        .with(
            1,
            Reply::Games(vec![
                record(G1, &[2, 3, 500], stats_for(1)),
                record(G2, &[600, 601], stats_for(1)),
            ]),
        )
        .with(2, Reply::Games(vec![record(G1, &[1, 3, 500], stats_for(2))]))
        .with(3, Reply::Games(vec![record(G1, &[1, 2, 500], stats_for(3))]))
}

#[test]
fn keeps_the_game_three_roster_players_share() {
    let roster = FakeRoster::new(&[1, 2, 3, 4]);
    let games = scenario_games();
    let store = SqliteStore::open_in_memory().unwrap();
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(10, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };

    let report = fetch_team_match_history(&deps, &team(), &options(3)).unwrap();

    assert_eq!(report.games_found, 1);
    assert_eq!(report.games_dropped, 1);
    assert_eq!(report.players_fetched, 4);
    assert!(!report.is_partial());
    assert_eq!(report.games_created, 1);
    assert_eq!(report.stats_written, 3);
    // Opponent 500 was only seen as a participant.
    assert_eq!(report.stats_missing, 1);
    assert!(report.write_failures.is_empty());

    assert!(store.load_game(&gid(G1)).unwrap().is_some());
    assert!(store.load_game(&gid(G2)).unwrap().is_none());
    for player in [1, 2, 3] {
        let stored = store.load_player_stats(&gid(G1), player).unwrap().unwrap();
        assert!(stored.saved);
        assert_eq!(stored.stats, Some(stats_for(player)));
    }
    assert!(store.load_player_stats(&gid(G1), 4).unwrap().is_none());
    assert!(store.load_player_stats(&gid(G1), 500).unwrap().is_none());
    assert_eq!(store.games_for_team(&team()).unwrap().len(), 1);

    let text = report.render_text();
    assert!(text.starts_with("Found 1 games with at least 3 players from:"));
    assert!(text.contains("  P4 (4)"));
    assert!(text.contains("game na-1001"));
}

#[test]
fn second_run_changes_nothing() {
    let roster = FakeRoster::new(&[1, 2, 3, 4]);
    let store = SqliteStore::open_in_memory().unwrap();
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(100, &clock);

    let first_games = scenario_games();
    let deps = IngestDeps {
        roster: &roster,
        games: &first_games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };
    fetch_team_match_history(&deps, &team(), &options(3)).unwrap();
    let games_before = store.games_for_team(&team()).unwrap();

    // Upstream now reports different numbers for the same game.
    let second_games = FakeGames::new()
        .with(1, Reply::Games(vec![record(G1, &[2, 3], json!({ "changed": 1 }))]))
        .with(2, Reply::Games(vec![record(G1, &[1, 3], json!({ "changed": 2 }))]))
        .with(3, Reply::Games(vec![record(G1, &[1, 2], json!({ "changed": 3 }))]));
    let deps = IngestDeps {
        games: &second_games,
        ..deps
    };
    let report = fetch_team_match_history(&deps, &team(), &options(3)).unwrap();

    assert_eq!(report.games_found, 1);
    assert_eq!(report.games_created, 0);
    assert_eq!(report.games_linked, 0);
    assert_eq!(report.stats_written, 0);
    assert_eq!(report.stats_already_saved, 3);
    assert_eq!(store.count_games().unwrap(), 1);
    assert_eq!(store.count_game_links().unwrap(), 1);
    assert_eq!(store.count_player_stats().unwrap(), 3);
    assert_eq!(store.games_for_team(&team()).unwrap(), games_before);
    for player in [1, 2, 3] {
        let stored = store.load_player_stats(&gid(G1), player).unwrap().unwrap();
        assert_eq!(stored.stats, Some(stats_for(player)));
    }
}

#[test]
fn each_run_is_recorded_in_the_ledger() {
    let roster = FakeRoster::new(&[1, 2, 3, 4]);
    let games = scenario_games();
    let store = SqliteStore::open_in_memory().unwrap();
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(100, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };

    let first = fetch_team_match_history(&deps, &team(), &options(3)).unwrap();
    let second = fetch_team_match_history(&deps, &team(), &options(3)).unwrap();
    let first_id = store.record_ingest_run(&first).unwrap();
    let second_id = store.record_ingest_run(&second).unwrap();
    assert!(second_id > first_id);
}

#[test]
fn exhausted_limiter_stops_fetching_but_still_writes() {
    let roster = FakeRoster::new(&[1, 2, 3, 4, 5]);
    let games = FakeGames::new()
        .with(1, Reply::Games(vec![record(G1, &[2, 3], stats_for(1))]))
        .with(2, Reply::Games(vec![record(G1, &[1, 3], stats_for(2))]))
        .with(3, Reply::Games(vec![record(G1, &[1, 2], stats_for(3))]));
    let store = SqliteStore::open_in_memory().unwrap();
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(2, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };

    let report = fetch_team_match_history(&deps, &team(), &options(3)).unwrap();

    assert_eq!(games.calls(), vec![1, 2]);
    assert_eq!(report.players_fetched, 2);
    assert!(report.is_partial());
    assert!(report.rate_limit_reason.is_some());
    // Player 3 was never fetched but is listed in the fetched games.
    assert_eq!(report.games_found, 1);
    assert_eq!(report.stats_written, 2);
    assert_eq!(report.stats_missing, 1);
    assert!(store.load_player_stats(&gid(G1), 3).unwrap().is_none());
    assert_eq!(store.count_player_stats().unwrap(), 2);
}

#[test]
fn upstream_quota_is_a_partial_result() {
    let roster = FakeRoster::new(&[1, 2, 3]);
    let games = FakeGames::new()
        .with(1, Reply::Games(vec![record(G1, &[2, 3], stats_for(1))]))
        .with(2, Reply::Quota);
    let store = SqliteStore::open_in_memory().unwrap();
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(10, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };

    let report = fetch_team_match_history(&deps, &team(), &options(3)).unwrap();

    assert_eq!(games.calls(), vec![1, 2]);
    assert!(report.rate_limited);
    assert_eq!(report.players_fetched, 1);
    assert_eq!(report.games_created, 1);
    assert_eq!(report.stats_written, 1);
}

#[test]
fn upstream_error_aborts_before_any_write() {
    let roster = FakeRoster::new(&[1, 2, 3]);
    let games = scenario_games().with(2, Reply::Status(500));
    let store = SqliteStore::open_in_memory().unwrap();
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(10, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };

    let err = fetch_team_match_history(&deps, &team(), &options(1)).unwrap_err();

    match err {
        IngestError::Fetch { player_id, source } => {
            assert_eq!(player_id, 2);
            assert!(matches!(source, FetchError::Status { status: 500, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(games.calls(), vec![1, 2]);
    assert_eq!(store.count_games().unwrap(), 0);
    assert_eq!(store.count_player_stats().unwrap(), 0);
}

#[test]
fn roster_failure_is_fatal() {
    let roster = FakeRoster::new(&[1]);
    let games = FakeGames::new();
    let store = SqliteStore::open_in_memory().unwrap();
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(10, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };

    let err = fetch_team_match_history(&deps, &TeamRef::new("missing", "x"), &options(1))
        .unwrap_err();
    assert!(matches!(err, IngestError::Roster(_)));
    assert!(games.calls().is_empty());
    limiter.try_consume(10).expect("no tokens spent");
}

#[test]
fn failed_writes_do_not_stop_the_batch() {
    let roster = FakeRoster::new(&[1, 2]);
    let games = FakeGames::new()
        .with(
            1,
            Reply::Games(vec![
                record(G1, &[2], stats_for(1)),
                record(G2, &[2], stats_for(1)),
            ]),
        )
        .with(
            2,
            Reply::Games(vec![
                record(G1, &[1], stats_for(2)),
                record(G2, &[1], stats_for(2)),
            ]),
        );
    let inner = SqliteStore::open_in_memory().unwrap();
    let store = FlakyStore {
        inner: &inner,
        fail_games: HashSet::from([gid(G1).key()]),
        fail_stats: HashSet::from([(gid(G2).key(), 1)]),
    };
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(10, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };

    let report = fetch_team_match_history(&deps, &team(), &options(2)).unwrap();

    assert_eq!(report.games_found, 2);
    assert_eq!(report.games_created, 1);
    assert_eq!(report.stats_written, 3);
    assert_eq!(report.write_failures.len(), 2);
    assert!(
        report
            .write_failures
            .iter()
            .any(|f| f.game_key == "na-1001" && f.player_id.is_none())
    );
    assert!(
        report
            .write_failures
            .iter()
            .any(|f| f.game_key == "na-1002" && f.player_id == Some(1))
    );
    assert!(inner.load_game(&gid(G1)).unwrap().is_none());
    assert!(inner.load_game(&gid(G2)).unwrap().is_some());
    assert!(inner.load_player_stats(&gid(G2), 1).unwrap().is_none());
    assert!(inner.load_player_stats(&gid(G2), 2).unwrap().is_some());
}

struct SlowGames<'a> {
    inner: FakeGames,
    clock: &'a FakeRelativeClock,
    per_call: Duration,
}

impl GameStatsSource for SlowGames<'_> {
    fn fetch_recent_games(
        &self,
        region: &Region,
        player_id: i64,
    ) -> Result<Vec<GameRecord>, FetchError> {
        self.clock.advance(self.per_call);
        self.inner.fetch_recent_games(region, player_id)
    }
}

#[test]
fn deadline_aborts_between_players() {
    let roster = FakeRoster::new(&[1, 2, 3]);
    let clock = FakeRelativeClock::default();
    let games = SlowGames {
        inner: scenario_games(),
        clock: &clock,
        per_call: Duration::from_secs(10),
    };
    let store = SqliteStore::open_in_memory().unwrap();
    let limiter = TokenBucket::fixed(10, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };
    let opts = IngestOptions {
        timeout: Some(Duration::from_secs(15)),
        ..options(1)
    };

    let err = fetch_team_match_history(&deps, &team(), &opts).unwrap_err();

    assert!(matches!(
        err,
        IngestError::DeadlineExceeded {
            stage: IngestStage::Fetching
        }
    ));
    assert_eq!(games.inner.calls(), vec![1, 2]);
    assert_eq!(store.count_games().unwrap(), 0);
}

/// Store whose every write takes `per_call` on the clock.
struct SlowStore<'a> {
    inner: &'a SqliteStore,
    clock: &'a FakeRelativeClock,
    per_call: Duration,
}

impl GameStore for SlowStore<'_> {
    fn ensure_game_exists(&self, game: &NewGame, team: &TeamRef) -> Result<GameWrite, StoreError> {
        let write = self.inner.ensure_game_exists(game, team);
        self.clock.advance(self.per_call);
        write
    }

    fn ensure_player_stats_exists(
        &self,
        stats: &NewPlayerStats<'_>,
    ) -> Result<StatsWrite, StoreError> {
        let write = self.inner.ensure_player_stats_exists(stats);
        self.clock.advance(self.per_call);
        write
    }
}

#[test]
fn deadline_aborts_between_game_writes() {
    let roster = FakeRoster::new(&[1, 2, 3]);
    let games = scenario_games();
    let clock = FakeRelativeClock::default();
    let inner = SqliteStore::open_in_memory().unwrap();
    let store = SlowStore {
        inner: &inner,
        clock: &clock,
        per_call: Duration::from_secs(10),
    };
    let limiter = TokenBucket::fixed(10, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };
    let opts = IngestOptions {
        timeout: Some(Duration::from_secs(5)),
        ..options(1)
    };

    let err = fetch_team_match_history(&deps, &team(), &opts).unwrap_err();

    assert!(matches!(
        err,
        IngestError::DeadlineExceeded {
            stage: IngestStage::WritingGames
        }
    ));
    // The first game was committed before the deadline and stays.
    assert!(inner.load_game(&gid(G1)).unwrap().is_some());
    assert!(inner.load_game(&gid(G2)).unwrap().is_none());
    assert_eq!(inner.count_game_links().unwrap(), 1);
    assert_eq!(inner.count_player_stats().unwrap(), 0);
}

#[test]
fn deadline_aborts_between_stats_writes() {
    let roster = FakeRoster::new(&[1, 2, 3]);
    let games = scenario_games();
    let clock = FakeRelativeClock::default();
    let inner = SqliteStore::open_in_memory().unwrap();
    let store = SlowStore {
        inner: &inner,
        clock: &clock,
        per_call: Duration::from_secs(10),
    };
    let limiter = TokenBucket::fixed(10, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };
    // Two game writes fit, then one stats write.
    let opts = IngestOptions {
        timeout: Some(Duration::from_secs(25)),
        ..options(1)
    };

    let err = fetch_team_match_history(&deps, &team(), &opts).unwrap_err();

    assert!(matches!(
        err,
        IngestError::DeadlineExceeded {
            stage: IngestStage::WritingStats
        }
    ));
    assert_eq!(inner.count_games().unwrap(), 2);
    assert_eq!(inner.count_player_stats().unwrap(), 1);
    let stored = inner.load_player_stats(&gid(G1), 1).unwrap().unwrap();
    assert!(stored.saved);
    assert_eq!(stored.stats, Some(stats_for(1)));
    assert!(inner.load_player_stats(&gid(G1), 2).unwrap().is_none());
}

#[test]
fn concurrent_jobs_share_games_and_quota() {
    let roster = FakeRoster::new(&[1, 2, 3]);
    let games = scenario_games();
    let store = SqliteStore::open_in_memory().unwrap();
    let clock = FakeRelativeClock::default();
    let limiter = TokenBucket::fixed(6, &clock);
    let deps = IngestDeps {
        roster: &roster,
        games: &games,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };
    let teams = vec![TeamRef::new("spring", "blue"), TeamRef::new("spring", "red")];

    let results = run_team_jobs(&deps, &teams, &options(3), 2);

    let reports = results
        .into_iter()
        .map(|r| r.expect("both jobs succeed"))
        .collect::<Vec<_>>();
    assert_eq!(reports[0].team, teams[0]);
    assert_eq!(reports[1].team, teams[1]);
    assert_eq!(reports.iter().map(|r| r.games_created).sum::<usize>(), 1);
    assert_eq!(reports.iter().map(|r| r.stats_written).sum::<usize>(), 3);
    assert_eq!(games.calls().len(), 6);
    assert!(limiter.try_consume(1).is_err());
    assert_eq!(store.count_games().unwrap(), 1);
    assert_eq!(store.count_game_links().unwrap(), 2);
    assert_eq!(store.count_player_stats().unwrap(), 3);
}
