use serde::Serialize;

use crate::error::RosterError;
use crate::model::{PlayerRef, Region};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Roster {
    pub region: Region,
    pub players: Vec<PlayerRef>,
}

/// Resolves a league's team into its region and ordered player list.
pub trait RosterSource: Send + Sync {
    fn team_roster(&self, league_id: &str, team_id: &str) -> Result<Roster, RosterError>;
}
