use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::model::{ParseAnomaly, TurnSnapshot};
use crate::types::PlayerId;

use super::decoder::FormatDecoder;

/// One `p:<player>;d:<day>;a:<actions>` line of the action log.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionLine {
    /// Zero-based line number inside the stream
    pub line: usize,
    pub player_id: PlayerId,
    pub day: i64,
    /// Raw JSON payloads in log order
    pub payloads: Vec<Value>,
}

/// Action payloads grouped by the turn they belong to.
#[derive(Debug, Clone, Default)]
pub struct MatchedActions {
    /// One list per turn snapshot, same indexing
    pub per_turn: Vec<Vec<Value>>,
    pub anomalies: Vec<ParseAnomaly>,
}

pub struct ActionLogReader<'a> {
    decoder: FormatDecoder<'a>,
}

impl<'a> ActionLogReader<'a> {
    pub fn new(text: &'a str) -> Self {
        ActionLogReader {
            decoder: FormatDecoder::new(text),
        }
    }

    /// Decodes every line without looking at the turns they refer to.
    pub fn read_lines(mut self) -> Result<Vec<ActionLine>> {
        let mut lines = Vec::new();
        self.decoder.skip_line_breaks()?;
        while !self.decoder.is_at_end() {
            let line = lines.len();
            lines.push(self.read_line(line)?);
            self.decoder.skip_line_breaks()?;
        }
        Ok(lines)
    }

    /// Decodes every line and files its payloads under the first turn whose
    /// (active player, day) matches the line header. Lines matching no turn
    /// are dropped and reported as anomalies.
    pub fn read_matched(self, turns: &[TurnSnapshot]) -> Result<MatchedActions> {
        let mut matched = MatchedActions {
            per_turn: vec![Vec::new(); turns.len()],
            anomalies: Vec::new(),
        };

        for line in self.read_lines()? {
            let target = turns.iter().position(|turn| {
                turn.active_player_id == line.player_id && turn.day == line.day
            });
            match target {
                Some(turn) => {
                    debug!(
                        line = line.line,
                        turn,
                        actions = line.payloads.len(),
                        "matched action line"
                    );
                    matched.per_turn[turn].extend(line.payloads);
                }
                None => {
                    warn!(
                        line = line.line,
                        player = %line.player_id,
                        day = line.day,
                        "action line matches no turn, discarding"
                    );
                    matched.anomalies.push(ParseAnomaly::OrphanActionLine {
                        line: line.line,
                        player_id: line.player_id,
                        day: line.day,
                        action_count: line.payloads.len(),
                    });
                }
            }
        }
        Ok(matched)
    }

    fn read_line(&mut self, line: usize) -> Result<ActionLine> {
        let decoder = &mut self.decoder;
        let player_id = PlayerId::try_from(decoder.read_tagged_int('p')?)?;
        let day = decoder.read_tagged_int('d')?;
        decoder.expect_literal("a:")?;

        let count = decoder.read_array_start()?;
        let mut payloads = Vec::with_capacity(count);
        for expected in 0..count {
            let found = decoder.read_array_index()?;
            if usize::try_from(found).ok() != Some(expected) {
                return Err(ErrorKind::OutOfOrderAction { expected, found }.into());
            }
            let raw = decoder.read_string()?;
            let payload = serde_json::from_str::<Value>(&raw).map_err(|e| {
                Error::malformed(format!("action {expected} on line {line} is not JSON: {e}"))
            })?;
            payloads.push(payload);
        }
        decoder.read_array_end()?;

        Ok(ActionLine {
            line,
            player_id,
            day,
            payloads,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn entry(index: usize, payload: &str) -> String {
        format!("i:{index};s:{}:\"{payload}\";", payload.len())
    }

    fn line(player: u32, day: i64, payloads: &[&str]) -> String {
        let body: String = payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| entry(index, payload))
            .collect();
        format!("p:{player};d:{day};a:a:{}:{{{body}}}", payloads.len())
    }

    fn turn(player: u32, day: i64) -> TurnSnapshot {
        TurnSnapshot {
            day,
            active_player_id: PlayerId(player),
            active_team: player.to_string(),
            weather: None,
            active: true,
            activity_date: None,
            aet_interval: None,
            aet_date: None,
            players: BTreeMap::new(),
            buildings: BTreeMap::new(),
            units: BTreeMap::new(),
        }
    }

    #[test]
    fn decodes_payloads_in_order() {
        let text = line(11, 1, &[r#"{"action":"Delete"}"#, "[]"]);
        let lines = ActionLogReader::new(&text).read_lines().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].player_id, PlayerId(11));
        assert_eq!(lines[0].payloads[0], json!({"action": "Delete"}));
        assert_eq!(lines[0].payloads[1], json!([]));
    }

    #[test]
    fn index_mismatch_is_out_of_order() {
        let text = format!("p:11;d:1;a:a:2:{{{}{}}}", entry(0, "[]"), entry(5, "[]"));
        let err = ActionLogReader::new(&text).read_lines().unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::OutOfOrderAction {
                expected: 1,
                found: 5
            }
        ));
    }

    #[test]
    fn orphan_line_is_recorded_and_skipped() {
        let text = format!(
            "{}\n{}\n{}",
            line(11, 1, &["[]"]),
            line(12, 9, &["[]", "[]"]),
            line(12, 1, &["[]"])
        );
        let turns = [turn(11, 1), turn(12, 1)];
        let matched = ActionLogReader::new(&text).read_matched(&turns).unwrap();
        assert_eq!(matched.per_turn[0].len(), 1);
        assert_eq!(matched.per_turn[1].len(), 1);
        assert_eq!(
            matched.anomalies,
            vec![ParseAnomaly::OrphanActionLine {
                line: 1,
                player_id: PlayerId(12),
                day: 9,
                action_count: 2,
            }]
        );
    }

    #[test]
    fn lines_for_one_turn_are_appended() {
        let text = format!(
            "{}\n{}",
            line(11, 1, &[r#"{"n":1}"#]),
            line(11, 1, &[r#"{"n":2}"#])
        );
        let matched = ActionLogReader::new(&text)
            .read_matched(&[turn(11, 1)])
            .unwrap();
        assert_eq!(matched.per_turn[0], vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn non_json_payload_is_malformed() {
        let text = line(11, 1, &["{nope"]);
        let err = ActionLogReader::new(&text).read_lines().unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MalformedRecord { .. }));
    }
}
