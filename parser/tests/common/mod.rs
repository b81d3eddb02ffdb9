//! Builders for small synthetic replays in the snapshot and action log
//! grammars, plus the containers they ship in.

#![allow(dead_code)]

use std::io::{Cursor, Write};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};

use awbw_replays::wire::{TREE_FORMAT_VERSION, TreeReplay, TurnSnapshotReader};
use awbw_replays::{ParserConfig, ReplayFile};

pub const MATCH_ID: i64 = 1001;
pub const NULL: &str = "N;";

pub fn s(value: &str) -> String {
    format!("s:{}:\"{}\";", value.len(), value)
}

pub fn i(value: i64) -> String {
    format!("i:{value};")
}

pub fn record(name: &str, fields: &[(&str, String)]) -> String {
    let mut out = format!("O:{}:\"{}\":{}:{{", name.len(), name, fields.len());
    for (key, value) in fields {
        out.push_str(&s(key));
        out.push_str(value);
    }
    out.push('}');
    out
}

pub fn array(items: &[String]) -> String {
    let mut out = format!("a:{}:{{", items.len());
    for (index, item) in items.iter().enumerate() {
        out.push_str(&i(index as i64));
        out.push_str(item);
    }
    out.push('}');
    out
}

pub fn player(id: i64, order: i64, funds: i64) -> String {
    record(
        "awbwPlayer",
        &[
            ("id", i(id)),
            ("users_id", i(id + 500)),
            ("games_id", i(MATCH_ID)),
            ("countries_id", i(order)),
            ("team", s(&id.to_string())),
            ("order", i(order)),
            ("funds", i(funds)),
            ("co_id", i(1)),
            ("co_power", i(0)),
            ("co_power_on", s("N")),
            ("tags_co_id", NULL.to_owned()),
            ("eliminated", s("N")),
        ],
    )
}

pub fn building(id: i64, x: i64, y: i64, terrain: i64, capture: i64, team: Option<&str>) -> String {
    record(
        "awbwBuilding",
        &[
            ("id", i(id)),
            ("games_id", i(MATCH_ID)),
            ("terrain_id", i(terrain)),
            ("x", i(x)),
            ("y", i(y)),
            ("capture", i(capture)),
            ("last_capture", i(20)),
            ("last_updated", NULL.to_owned()),
            ("team", team.map(s).unwrap_or_else(|| NULL.to_owned())),
        ],
    )
}

/// An infantry unit, written both as a snapshot record and as a payload patch.
pub struct Infantry {
    pub id: i64,
    pub player: i64,
    pub x: i64,
    pub y: i64,
    pub moved: i64,
}

impl Infantry {
    pub fn record(&self) -> String {
        record(
            "awbwUnit",
            &[
                ("id", i(self.id)),
                ("games_id", i(MATCH_ID)),
                ("players_id", i(self.player)),
                ("name", s("Infantry")),
                ("x", i(self.x)),
                ("y", i(self.y)),
                ("hit_points", i(10)),
                ("fuel", i(99)),
                ("ammo", i(0)),
                ("moved", i(self.moved)),
                ("fired", i(0)),
                ("capture", i(0)),
            ],
        )
    }

    pub fn patch(&self) -> Value {
        json!({
            "units_id": self.id,
            "units_games_id": MATCH_ID,
            "units_players_id": self.player,
            "units_name": "Infantry",
            "units_x": self.x,
            "units_y": self.y,
            "units_hit_points": 10,
            "units_fuel": 99,
            "units_ammo": 0,
            "units_moved": self.moved,
            "units_fired": 0,
            "units_capture": 0,
        })
    }
}

pub const RED_INFANTRY: Infantry = Infantry { id: 301, player: 11, x: 1, y: 0, moved: 0 };
pub const BLUE_INFANTRY: Infantry = Infantry { id: 302, player: 12, x: 4, y: 5, moved: 0 };

pub fn game(turn: i64, day: i64, players: &[String], buildings: &[String], units: &[String]) -> String {
    record(
        "awbwGame",
        &[
            ("id", i(MATCH_ID)),
            ("name", s("fixture duel")),
            ("password", NULL.to_owned()),
            ("creator", i(511)),
            ("start_date", s("2024-03-01 12:00:00")),
            ("end_date", NULL.to_owned()),
            ("maps_id", i(77)),
            ("weather_type", s("Clear")),
            ("weather_start", NULL.to_owned()),
            ("win_condition", NULL.to_owned()),
            ("funds", i(1000)),
            ("capture_win", i(21)),
            ("fog", s("N")),
            ("comment", NULL.to_owned()),
            ("type", s("N")),
            ("boot_interval", i(90)),
            ("starting_funds", i(5000)),
            ("official", s("N")),
            ("min_rating", NULL.to_owned()),
            ("max_rating", NULL.to_owned()),
            ("league", NULL.to_owned()),
            ("team", s("N")),
            ("use_powers", s("Y")),
            ("timers_initial", i(0)),
            ("timers_increment", i(0)),
            ("timers_max_turn", i(0)),
            ("turn", i(turn)),
            ("day", i(day)),
            ("weather_code", s("C")),
            ("active", s("Y")),
            ("players", array(players)),
            ("buildings", array(buildings)),
            ("units", array(units)),
        ],
    )
}

/// Three turns: player 11 builds and ends, player 12 starts a capture and
/// ends, then player 11 opens day 2.
pub fn snapshot_stream() -> String {
    let built = Infantry { id: 303, player: 11, x: 0, y: 0, moved: 0 };
    let hq = building(201, 0, 0, 42, 20, Some("11"));
    let city = |capture| building(203, 4, 5, 34, capture, None);

    let turns = [
        game(
            11,
            1,
            &[player(11, 1, 5000), player(12, 2, 3000)],
            &[hq.clone(), city(20)],
            &[RED_INFANTRY.record(), BLUE_INFANTRY.record()],
        ),
        game(
            12,
            1,
            &[player(11, 1, 4000), player(12, 2, 3000)],
            &[hq.clone(), city(20)],
            &[RED_INFANTRY.record(), BLUE_INFANTRY.record(), built.record()],
        ),
        game(
            11,
            2,
            &[player(11, 1, 5000), player(12, 2, 3000)],
            &[hq, city(10)],
            &[RED_INFANTRY.record(), BLUE_INFANTRY.record(), built.record()],
        ),
    ];
    turns.join("\n") + "\n"
}

pub fn build_payload() -> Value {
    let built = Infantry { id: 303, player: 11, x: 0, y: 0, moved: 1 };
    json!({"action": "Build", "newUnit": {"global": built.patch()}})
}

pub fn capture_payload() -> Value {
    json!({
        "action": "Capt",
        "buildingInfo": {"buildings_id": 203, "buildings_x": 4, "buildings_y": 5, "buildings_capture": 10}
    })
}

pub fn end_payload(next: i64, day: i64, funds: i64) -> Value {
    json!({
        "action": "End",
        "updatedInfo": {"nextPId": next, "day": day, "nextFunds": {"global": funds}}
    })
}

pub fn action_payloads() -> Vec<Vec<Value>> {
    vec![
        vec![build_payload(), end_payload(12, 1, 3000)],
        vec![capture_payload(), end_payload(11, 2, 5000)],
        Vec::new(),
    ]
}

pub fn action_line(player: i64, day: i64, payloads: &[Value]) -> String {
    let body: String = payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| format!("{}{}", i(index as i64), s(&payload.to_string())))
        .collect();
    format!("p:{player};d:{day};a:a:{}:{{{body}}}\n", payloads.len())
}

pub fn action_stream() -> String {
    let turns = action_payloads();
    action_line(11, 1, &turns[0]) + &action_line(12, 1, &turns[1])
}

pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

pub fn zip_container(snapshots: &str, actions: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    writer.start_file("1001", options).unwrap();
    writer.write_all(&gzip(snapshots)).unwrap();
    writer.start_file("a1001", options).unwrap();
    writer.write_all(&gzip(actions)).unwrap();
    writer.finish().unwrap().into_inner()
}

pub fn tree_container() -> Vec<u8> {
    let stream = snapshot_stream();
    let parsed = TurnSnapshotReader::new(&stream).read_all().unwrap();
    let tree = TreeReplay {
        format_version: TREE_FORMAT_VERSION,
        metadata: parsed.metadata,
        players: parsed.players,
        turns: parsed.turns,
        actions: action_payloads(),
    };
    serde_json::to_vec(&tree).unwrap()
}

pub fn parse_zip() -> ReplayFile {
    let bytes = zip_container(&snapshot_stream(), &action_stream());
    ReplayFile::from_bytes(&bytes, &ParserConfig::default()).unwrap()
}
