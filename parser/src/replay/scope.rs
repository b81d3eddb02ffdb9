//! Viewer-scoped payload values.
//!
//! Fog-dependent payload fields are emitted once per viewer: keyed by a
//! player id, by a team name, and under `global`. The acting player's own
//! entry is the authoritative one.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::PlayerId;

pub const GLOBAL_SCOPE: &str = "global";

fn present<'v>(node: &'v serde_json::Map<String, Value>, key: &str) -> Option<&'v Value> {
    node.get(key).filter(|value| !value.is_null())
}

/// Picks the value visible to `player_id`: the player's own entry, then the
/// team entry (when a team is given), then the global entry.
pub fn resolve<'v>(node: &'v Value, team: Option<&str>, player_id: PlayerId) -> Result<&'v Value> {
    let Value::Object(map) = node else {
        return Err(Error::malformed(format!(
            "expected a viewer-scoped object, found {node}"
        )));
    };

    present(map, &player_id.to_string())
        .or_else(|| team.and_then(|team| present(map, team)))
        .or_else(|| present(map, GLOBAL_SCOPE))
        .ok_or_else(|| {
            Error::missing(format!(
                "no value visible to player {player_id} (team {team:?}) in scoped field"
            ))
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::ErrorKind;

    use super::*;

    #[test]
    fn player_entry_wins() {
        let node = json!({"11": 1, "red": 2, "global": 3});
        assert_eq!(resolve(&node, Some("red"), PlayerId(11)).unwrap(), &json!(1));
    }

    #[test]
    fn team_entry_before_global() {
        let node = json!({"red": 2, "global": 3});
        assert_eq!(resolve(&node, Some("red"), PlayerId(11)).unwrap(), &json!(2));
        assert_eq!(resolve(&node, None, PlayerId(11)).unwrap(), &json!(3));
    }

    #[test]
    fn null_entries_count_as_absent() {
        let node = json!({"11": null, "global": {"units_id": 4}});
        assert_eq!(
            resolve(&node, None, PlayerId(11)).unwrap(),
            &json!({"units_id": 4})
        );
    }

    #[test]
    fn nothing_visible_is_missing() {
        let node = json!({"12": 1});
        let err = resolve(&node, Some("red"), PlayerId(11)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MissingReferencedEntity(_)));
    }

    #[test]
    fn non_object_is_malformed() {
        let err = resolve(&json!(5), None, PlayerId(11)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MalformedRecord { .. }));
    }
}
