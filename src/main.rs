use std::path::PathBuf;
use anyhow::{Context, Result, anyhow};
use tracing::{error, warn};

use team_history::config::{IngestConfig, clamp_min_team_members};
use team_history::game_client::RiotClient;
use team_history::ingest::{IngestDeps, IngestOptions, run_team_jobs};
use team_history::logging::init_tracing;
use team_history::model::TeamRef;
use team_history::rate_limiter::{DefaultClock, TokenBucket};
use team_history::store::{self, SqliteStore};

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    init_tracing("team_history=info")?;

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let config = IngestConfig::from_env();

    let league = flag_values(&args, "--league")
        .into_iter()
        .next()
        .context("missing --league")?;
    let teams = flag_values(&args, "--team")
        .iter()
        .flat_map(|raw| raw.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|team| TeamRef::new(&league, team))
        .collect::<Vec<_>>();
    if teams.is_empty() {
        return Err(anyhow!("no --team given"));
    }

    let db_path = flag_values(&args, "--db")
        .into_iter()
        .next()
        .map(PathBuf::from)
        .or_else(|| config.db_path.clone())
        .or_else(store::default_db_path)
        .context("unable to resolve sqlite path")?;
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("open sqlite db {}", db_path.display()))?;

    let client = RiotClient::new(config.api_key.as_deref(), &config.api_base, config.http_timeout)
        .context("failed to set up riot api client")?;
    let clock = DefaultClock::default();
    let limiter = TokenBucket::new(config.rate_limit_tokens, config.rate_limit_period, &clock);

    let mut options = IngestOptions::from_config(&config);
    if let Some(min) = flag_values(&args, "--min-members")
        .into_iter()
        .next()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
    {
        options.min_team_members = clamp_min_team_members(min);
    }
    let as_json = args.iter().any(|a| a == "--json");

    let deps = IngestDeps {
        roster: &store,
        games: &client,
        limiter: &limiter,
        store: &store,
        clock: &clock,
    };
    let results = run_team_jobs(&deps, &teams, &options, config.parallelism);
    if !as_json {
        println!("DB: {}", db_path.display());
    }

    let mut failed = 0usize;
    for (team, result) in teams.iter().zip(results) {
        match result {
            Ok(report) => {
                if let Err(err) = store.record_ingest_run(&report) {
                    warn!(%team, %err, "failed to record ingest run");
                }
                if as_json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("== {team}");
                    print!("{}", report.render_text());
                }
            }
            Err(err) => {
                failed += 1;
                error!(%team, %err, "ingest job failed");
                println!("== {team}\nFailed: {err}");
            }
        }
    }

    if failed == teams.len() {
        return Err(anyhow!("all {failed} ingest job(s) failed"));
    }
    Ok(())
}

/// Values of `--name value` and `--name=value`, in order.
fn flag_values(args: &[String], name: &str) -> Vec<String> {
    let prefix = format!("{name}=");
    let mut out = Vec::new();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            if !value.trim().is_empty() {
                out.push(value.trim().to_string());
            }
            continue;
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            out.push(next.trim().to_string());
        }
    }
    out
}
