//! Repairs applied to matched action lists before they are built.

use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{ParseAnomaly, TurnSnapshot};
use crate::types::PlayerId;

const END_TURN_DISCRIMINATORS: [&str; 2] = ["End", "Tag"];

fn next_player(payload: &Value) -> Option<i64> {
    let next = payload.get("updatedInfo")?.get("nextPId")?;
    next.as_i64()
        .or_else(|| next.as_str().and_then(|text| text.parse().ok()))
}

fn is_end_turn(payload: &Value) -> bool {
    payload
        .get("action")
        .and_then(Value::as_str)
        .is_some_and(|action| END_TURN_DISCRIMINATORS.contains(&action))
}

/// An end-turn that hands the turn to the very player it was logged under
/// belongs to the end of the previous turn.
pub fn is_misplaced_end_turn(payload: &Value, logged_under: PlayerId) -> bool {
    is_end_turn(payload) && next_player(payload) == Some(i64::from(logged_under.raw()))
}

/// Moves misplaced end-turn payloads from the head of a turn to the tail of
/// the turn they close. Each move is recorded as an anomaly.
///
/// A turn that already ends with an end-turn cannot take a second one; that
/// log is inconsistent and rejected.
pub fn relocate_misplaced_end_turns(
    turns: &[TurnSnapshot],
    per_turn: &mut [Vec<Value>],
    anomalies: &mut Vec<ParseAnomaly>,
) -> Result<()> {
    for turn in 1..per_turn.len().min(turns.len()) {
        let misplaced = per_turn[turn]
            .first()
            .is_some_and(|payload| is_misplaced_end_turn(payload, turns[turn].active_player_id));
        if !misplaced {
            continue;
        }
        if per_turn[turn - 1].last().is_some_and(is_end_turn) {
            return Err(Error::invariant(
                "end of turn",
                "a single end-turn action",
                "two end-turn actions",
            )
            .with_turn(turn - 1));
        }

        let payload = per_turn[turn].remove(0);
        per_turn[turn - 1].push(payload);
        warn!(from = turn, to = turn - 1, "relocated end-turn action");
        anomalies.push(ParseAnomaly::RelocatedEndTurn {
            from_turn: turn,
            to_turn: turn - 1,
        });
    }
    Ok(())
}
