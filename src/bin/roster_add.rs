use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use team_history::config::IngestConfig;
use team_history::model::{PlayerRef, Region, TeamRef};
use team_history::roster::RosterSource;
use team_history::store::{self, SqliteStore};

// roster_add --league L1 [--league-name "Spring"] [--region na] --team T1 [--team-name "Blue"]
//            --player 12345:Summoner [--player ...]
fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let league_id = parse_arg(&args, "--league").context("missing --league")?;
    let team_id = parse_arg(&args, "--team").context("missing --team")?;
    let league_name = parse_arg(&args, "--league-name").unwrap_or_else(|| league_id.clone());
    let team_name = parse_arg(&args, "--team-name").unwrap_or_else(|| team_id.clone());
    let region = Region::new(&parse_arg(&args, "--region").unwrap_or_default());

    let mut players = Vec::new();
    for (idx, arg) in args.iter().enumerate() {
        if arg == "--player" {
            let raw = args.get(idx + 1).context("--player needs a value")?;
            players.push(parse_player(raw)?);
        }
    }

    let db_path = parse_arg(&args, "--db")
        .map(PathBuf::from)
        .or_else(|| IngestConfig::from_env().db_path)
        .or_else(store::default_db_path)
        .context("unable to resolve sqlite path")?;
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("open sqlite db {}", db_path.display()))?;

    let team = TeamRef::new(&league_id, &team_id);
    store.upsert_league(&league_id, &league_name, &region)?;
    store.upsert_team(&team, &team_name)?;
    for player in &players {
        store.add_team_player(&team, player)?;
    }

    let roster = store.team_roster(&league_id, &team_id)?;
    println!("DB: {}", db_path.display());
    println!("{team} ({}) has {} player(s):", roster.region, roster.players.len());
    for player in &roster.players {
        println!("  {} ({})", player.summoner, player.riot_id);
    }
    Ok(())
}

fn parse_arg(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(next.trim().to_string());
            }
        }
    }
    None
}

fn parse_player(raw: &str) -> Result<PlayerRef> {
    let (id, summoner) = raw.split_once(':').unwrap_or((raw, ""));
    let riot_id = id
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid riot id in --player {raw}"))?;
    if riot_id <= 0 {
        return Err(anyhow!("riot id must be positive: {raw}"));
    }
    let summoner = if summoner.trim().is_empty() {
        riot_id.to_string()
    } else {
        summoner.trim().to_string()
    };
    Ok(PlayerRef { riot_id, summoner })
}
