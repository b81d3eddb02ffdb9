mod common;

use kinded::Kinded;
use serde_json::json;

use awbw_replays::model::ParseAnomaly;
use awbw_replays::replay::ReplayActionKind;
use awbw_replays::replay::controller::FoldMismatch;
use awbw_replays::types::{PlayerId, Position, UnitId};
use awbw_replays::{
    ContainerFormat, ErrorKind, GameConstants, ParserConfig, ParserConfigBuilder, Rc, ReplayFile,
};

use common::*;

#[test]
fn zip_container_parses_turns_and_actions() {
    let replay = parse_zip();
    assert_eq!(replay.container, ContainerFormat::Zip);

    let data = &replay.data;
    assert_eq!(data.metadata.id.raw(), 1001);
    assert_eq!(data.metadata.name, "fixture duel");
    assert_eq!(data.players.len(), 2);
    assert_eq!(data.turns.len(), 3);
    assert_eq!(data.action_count(), 4);
    assert!(data.anomalies.is_empty());

    let kinds: Vec<ReplayActionKind> = data.turns[0].actions.iter().map(Kinded::kind).collect();
    assert_eq!(kinds, vec![ReplayActionKind::Build, ReplayActionKind::EndTurn]);
    assert!(data.turns[2].actions.is_empty());
}

#[test]
fn legacy_gzip_has_snapshots_only() {
    let bytes = gzip(&snapshot_stream());
    let replay = ReplayFile::from_bytes(&bytes, &ParserConfig::default()).unwrap();
    assert_eq!(replay.container, ContainerFormat::Gzip);
    assert_eq!(replay.data.turns.len(), 3);
    assert_eq!(replay.data.action_count(), 0);
}

#[test]
fn tree_container_matches_text_streams() {
    let replay = ReplayFile::from_bytes(&tree_container(), &ParserConfig::default()).unwrap();
    assert_eq!(replay.container, ContainerFormat::Tree);

    let zipped = parse_zip();
    assert_eq!(
        serde_json::to_value(&replay.data).unwrap(),
        serde_json::to_value(&zipped.data).unwrap()
    );
}

#[test]
fn parsing_is_deterministic() {
    let first = serde_json::to_string(&parse_zip().data).unwrap();
    let second = serde_json::to_string(&parse_zip().data).unwrap();
    assert_eq!(first, second);
}

#[test]
fn orphan_line_is_reported() {
    let orphan = action_line(12, 9, &[json!({"action": "Delete", "unitId": {"global": 302}})]);
    let actions = action_stream() + &orphan;
    let data =
        ReplayFile::from_streams(&snapshot_stream(), Some(&actions), &ParserConfig::default())
            .unwrap();

    assert_eq!(data.action_count(), 4);
    assert_eq!(
        data.anomalies,
        vec![ParseAnomaly::OrphanActionLine {
            line: 2,
            player_id: PlayerId(12),
            day: 9,
            action_count: 1,
        }]
    );
}

#[test]
fn misplaced_end_turn_is_relocated() {
    let turns = action_payloads();
    let mut second = vec![turns[0][1].clone()];
    second.extend(turns[1].iter().cloned());
    let actions = action_line(11, 1, &turns[0][..1]) + &action_line(12, 1, &second);

    let data =
        ReplayFile::from_streams(&snapshot_stream(), Some(&actions), &ParserConfig::default())
            .unwrap();
    assert_eq!(
        data.anomalies,
        vec![ParseAnomaly::RelocatedEndTurn {
            from_turn: 1,
            to_turn: 0
        }]
    );
    assert_eq!(data.turns[0].actions.len(), 2);
    assert!(data.turns[0].actions[1].ends_turn());
    assert_eq!(data.turns[1].actions.len(), 2);
}

#[test]
fn misplaced_end_turn_is_kept_when_repair_is_off() {
    let turns = action_payloads();
    let mut second = vec![turns[0][1].clone()];
    second.extend(turns[1].iter().cloned());
    let actions = action_line(11, 1, &turns[0][..1]) + &action_line(12, 1, &second);

    let config = ParserConfigBuilder::default()
        .repair_turn_order(false)
        .build()
        .unwrap();
    let data = ReplayFile::from_streams(&snapshot_stream(), Some(&actions), &config).unwrap();
    assert!(data.anomalies.is_empty());
    assert_eq!(data.turns[1].actions.len(), 3);
    let update = data.turns[1].actions[0].turn_update().unwrap();
    assert!(update.misplaced);
}

#[test]
fn unknown_snapshot_field_is_rejected() {
    let stream = snapshot_stream().replacen(
        "s:6:\"active\";s:1:\"Y\";",
        "s:6:\"active\";s:1:\"Y\";s:7:\"mystery\";i:1;",
        1,
    );
    let stream = stream.replacen("\"awbwGame\":33:", "\"awbwGame\":34:", 1);

    let err = ReplayFile::from_streams(&stream, None, &ParserConfig::default()).unwrap_err();
    assert!(matches!(
        err.kind,
        ErrorKind::UnknownField { record: "awbwGame", ref field } if field == "mystery"
    ));
    assert_eq!(err.location.turn, Some(0));
}

#[test]
fn skipped_action_index_is_out_of_order() {
    let payload = build_payload().to_string();
    let line = format!("p:11;d:1;a:a:2:{{i:0;{}i:2;{}}}\n", s(&payload), s(&payload));

    let err = ReplayFile::from_streams(&snapshot_stream(), Some(&line), &ParserConfig::default())
        .unwrap_err();
    assert!(matches!(
        err.kind,
        ErrorKind::OutOfOrderAction { expected: 1, found: 2 }
    ));
}

#[test]
fn controller_folds_onto_next_snapshots() {
    let replay = parse_zip();
    let constants = Rc::new(GameConstants::defaults().unwrap());
    let mut controller = replay.controller(constants).unwrap();

    assert!(controller.verify_all().unwrap().is_empty());

    controller.seek(0, 1).unwrap();
    let context = controller.context();
    assert!(context.unit(UnitId(303)).is_some());
    assert_eq!(context.ledger(PlayerId(11)).unwrap().funds, 4000);

    controller.seek(1, 1).unwrap();
    let city = controller.context().building(Position::new(4, 5)).unwrap();
    assert_eq!(city.capture, 10);
    assert_eq!(city.last_capture, 20);
}

#[test]
fn fold_drift_is_reported() {
    let turns = action_payloads();
    let short_end = vec![build_payload(), end_payload(12, 1, 2500)];
    let actions = action_line(11, 1, &short_end) + &action_line(12, 1, &turns[1]);
    let data =
        ReplayFile::from_streams(&snapshot_stream(), Some(&actions), &ParserConfig::default())
            .unwrap();

    let file = ReplayFile {
        container: ContainerFormat::Zip,
        data,
    };
    let mut controller = file
        .controller(Rc::new(GameConstants::defaults().unwrap()))
        .unwrap();
    let mismatches = controller.verify_turn_fold(0).unwrap();
    assert_eq!(
        mismatches,
        vec![FoldMismatch::Funds {
            player: PlayerId(12),
            expected: 3000,
            found: 2500,
        }]
    );
}

#[test]
fn fold_verification_rejects_drift() {
    let turns = action_payloads();
    let short_end = vec![build_payload(), end_payload(12, 1, 2500)];
    let actions = action_line(11, 1, &short_end) + &action_line(12, 1, &turns[1]);
    let config = ParserConfigBuilder::default()
        .verify_folds(true)
        .build()
        .unwrap();

    let clean = ReplayFile::from_streams(&snapshot_stream(), Some(&action_stream()), &config);
    assert!(clean.is_ok());

    let err = ReplayFile::from_streams(&snapshot_stream(), Some(&actions), &config).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvariantViolation { .. }));
    assert_eq!(err.location.turn, Some(0));
    assert_eq!(err.location.match_id.map(|id| id.raw()), Some(1001));
}
