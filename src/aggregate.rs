use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Write};

use crate::model::{GameId, GameRecord, PlayerRef};

/// Every observation of one game gathered during a single pass.
///
/// A contributor maps to `None` when the player was only seen as a participant
/// in someone else's record and their own stats were never fetched.
#[derive(Debug, Clone)]
pub struct AggregatedGame {
    id: GameId,
    sample_player_id: i64,
    contributors: BTreeMap<i64, Option<GameRecord>>,
}

impl AggregatedGame {
    fn new(id: GameId, sample_player_id: i64) -> Self {
        Self {
            id,
            sample_player_id,
            contributors: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &GameId {
        &self.id
    }

    pub fn contributor_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.contributors.keys().copied()
    }

    pub fn contributor_count(&self) -> usize {
        self.contributors.len()
    }

    pub fn payload(&self, player_id: i64) -> Option<&GameRecord> {
        self.contributors.get(&player_id).and_then(Option::as_ref)
    }

    pub fn sample(&self) -> Option<(i64, &GameRecord)> {
        if let Some(record) = self.payload(self.sample_player_id) {
            return Some((self.sample_player_id, record));
        }
        self.contributors
            .iter()
            .find_map(|(id, record)| record.as_ref().map(|r| (*id, r)))
    }

    fn roster_members(&self, roster: &HashSet<i64>) -> usize {
        self.contributors
            .keys()
            .filter(|id| roster.contains(id))
            .count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GameEntry<'a> {
    pub id: &'a GameId,
    pub sample_player_id: i64,
    pub sample: &'a GameRecord,
}

#[derive(Debug, Clone, Copy)]
pub struct StatEntry<'a> {
    pub game: &'a GameId,
    pub player_id: i64,
    pub record: Option<&'a GameRecord>,
}

/// Per-game view of the recent games of a whole roster.
#[derive(Debug, Default, Clone)]
pub struct CollectiveGameStats {
    games: BTreeMap<GameId, AggregatedGame>,
}

impl CollectiveGameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `contributor`'s view of `game`. A later record from the same
    /// contributor replaces the earlier one. Participants listed in the record
    /// are registered without a payload unless they already have one.
    pub fn add(&mut self, game: GameId, contributor: i64, record: GameRecord) {
        let entry = self
            .games
            .entry(game)
            .or_insert_with_key(|id| AggregatedGame::new(id.clone(), contributor));
        for participant in &record.participants {
            entry.contributors.entry(*participant).or_insert(None);
        }
        entry.contributors.insert(contributor, Some(record));
    }

    /// Drops every game with fewer than `min_members` roster players among
    /// its contributors. Returns how many games were dropped.
    pub fn filter_to_games_with_at_least(&mut self, min_members: usize, roster: &[PlayerRef]) -> usize {
        let roster_ids = roster.iter().map(|p| p.riot_id).collect::<HashSet<_>>();
        let before = self.games.len();
        self.games
            .retain(|_, game| game.roster_members(&roster_ids) >= min_members);
        before - self.games.len()
    }

    /// One entry per retained game, in game id order.
    pub fn games(&self) -> impl Iterator<Item = GameEntry<'_>> + '_ {
        self.games.values().filter_map(|game| {
            let (sample_player_id, sample) = game.sample()?;
            Some(GameEntry {
                id: &game.id,
                sample_player_id,
                sample,
            })
        })
    }

    /// One entry per (game, contributor) pair of the retained games. Entries
    /// whose `record` is `None` carry no stats and must be skipped by writers.
    pub fn stats(&self) -> impl Iterator<Item = StatEntry<'_>> + '_ {
        self.games.values().flat_map(|game| {
            game.contributors.iter().map(move |(player_id, record)| StatEntry {
                game: &game.id,
                player_id: *player_id,
                record: record.as_ref(),
            })
        })
    }

    pub fn get(&self, id: &GameId) -> Option<&AggregatedGame> {
        self.games.get(id)
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub fn write_debug<W: Write>(&self, out: &mut W) -> fmt::Result {
        for game in self.games.values() {
            let created = game
                .sample()
                .map(|(_, r)| r.created_at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "game {} ({created}): {} contributor(s)",
                game.id,
                game.contributors.len()
            )?;
            for (player_id, record) in &game.contributors {
                let marker = if record.is_some() { "" } else { " (no stats)" };
                writeln!(out, "    {player_id}{marker}")?;
            }
        }
        Ok(())
    }
}
