//! Structured JSON replays, used for matches reconstructed by third-party
//! tools rather than exported by the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{MatchMetadata, PlayerProfile, TurnSnapshot};

use super::action_log::MatchedActions;
use super::snapshot::ParsedSnapshots;

pub const TREE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeReplay {
    pub format_version: u32,
    pub metadata: MatchMetadata,
    pub players: Vec<PlayerProfile>,
    pub turns: Vec<TurnSnapshot>,
    /// Raw action payloads, one list per turn
    #[serde(default)]
    pub actions: Vec<Vec<Value>>,
}

impl TreeReplay {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let document: Value = serde_json::from_slice(bytes)?;
        let version = document.get("formatVersion").and_then(Value::as_u64);
        if version != Some(u64::from(TREE_FORMAT_VERSION)) {
            return Err(Error::corrupted(format!(
                "unsupported tree format version {}",
                document.get("formatVersion").unwrap_or(&Value::Null)
            )));
        }
        let tree: TreeReplay = serde_json::from_value(document)?;
        if tree.turns.is_empty() {
            return Err(Error::malformed("tree replay contains no turns"));
        }
        if tree.actions.len() > tree.turns.len() {
            return Err(Error::malformed(format!(
                "tree replay has actions for {} turns but only {} turns",
                tree.actions.len(),
                tree.turns.len()
            )));
        }
        for turn in &tree.turns {
            if !tree.players.iter().any(|p| p.id == turn.active_player_id) {
                return Err(Error::missing(format!(
                    "active player {}",
                    turn.active_player_id
                )));
            }
        }
        Ok(tree)
    }

    /// Splits the tree into the same shapes the text streams produce.
    pub fn into_parts(self) -> (ParsedSnapshots, MatchedActions) {
        let mut per_turn = self.actions;
        per_turn.resize_with(self.turns.len(), Vec::new);
        (
            ParsedSnapshots {
                metadata: self.metadata,
                players: self.players,
                turns: self.turns,
            },
            MatchedActions {
                per_turn,
                anomalies: Vec::new(),
            },
        )
    }
}
