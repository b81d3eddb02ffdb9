use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

use crate::Error;
use crate::replay::actions::ReplayAction;
use crate::types::{
    BuildingId, CoId, CountryId, GameId, MapId, PlayerId, Position, TerrainId, UnitId, UserId,
};

/// Values keyed by something they already carry, serialized as a plain list so
/// that non-string keys survive JSON.
pub trait Keyed {
    type Key: Ord;
    fn key(&self) -> Self::Key;
}

pub(crate) mod keyed_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Keyed;

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<V::Key, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de> + Keyed,
    {
        let values = Vec::<V>::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| (v.key(), v)).collect())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, IntoStaticStr,
)]
pub enum Weather {
    #[strum(serialize = "C")]
    Clear,
    #[strum(serialize = "R")]
    Rain,
    #[strum(serialize = "S")]
    Snow,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, IntoStaticStr,
)]
pub enum MatchType {
    #[strum(serialize = "N")]
    Normal,
    #[strum(serialize = "L")]
    League,
    #[strum(serialize = "T")]
    Tag,
}

/// Whether a CO power is currently running for a player.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
pub enum CoPowerState {
    #[default]
    #[strum(serialize = "N")]
    None,
    #[strum(serialize = "Y")]
    Power,
    #[strum(serialize = "S")]
    SuperPower,
}

/// Fields that are fixed for the whole match. Every turn snapshot repeats
/// them and they must agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchMetadata {
    pub id: GameId,
    pub name: String,
    pub password: Option<String>,
    pub creator: UserId,
    pub start_date: String,
    pub end_date: Option<String>,
    pub map_id: MapId,
    pub weather_type: String,
    pub weather_start: Option<i64>,
    pub win_condition: Option<String>,
    pub funds_per_property: i64,
    pub capture_win: i64,
    pub fog: bool,
    pub comment: Option<String>,
    pub match_type: MatchType,
    pub boot_interval: i64,
    pub starting_funds: i64,
    pub official: bool,
    pub min_rating: Option<i64>,
    pub max_rating: Option<i64>,
    pub league: Option<String>,
    pub team_game: bool,
    pub powers_allowed: bool,
    pub timers_initial: i64,
    pub timers_increment: i64,
    pub timers_max_turn: i64,
}

impl MatchMetadata {
    /// Checks that `other` (read from a later turn) agrees with `self` on
    /// every field.
    pub fn ensure_matches(&self, other: &MatchMetadata) -> Result<(), Error> {
        macro_rules! check {
            ($($field:ident),+ $(,)?) => {
                $(
                    if self.$field != other.$field {
                        return Err(Error::invariant(
                            stringify!($field),
                            &self.$field,
                            &other.$field,
                        ));
                    }
                )+
            };
        }

        check!(
            id,
            name,
            password,
            creator,
            start_date,
            end_date,
            map_id,
            weather_type,
            weather_start,
            win_condition,
            funds_per_property,
            capture_win,
            fog,
            comment,
            match_type,
            boot_interval,
            starting_funds,
            official,
            min_rating,
            max_rating,
            league,
            team_game,
            powers_allowed,
            timers_initial,
            timers_increment,
            timers_max_turn,
        );
        Ok(())
    }
}

/// Who a player is. Created the first time a player index shows up and only
/// re-validated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    /// Position of the player inside the snapshot's player array
    pub index: u32,
    pub id: PlayerId,
    pub user_id: UserId,
    pub team: String,
    pub country_id: CountryId,
    /// Round order, 1-based
    pub order: i64,
    /// Every CO this player fielded, tag partners included
    pub co_ids: BTreeSet<CoId>,
}

/// Player facts that change turn to turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerTurnState {
    pub funds: i64,
    pub co_id: CoId,
    pub co_power: i64,
    pub power_state: CoPowerState,
    pub co_max_power: Option<i64>,
    pub co_max_spower: Option<i64>,
    pub tag_co_id: Option<CoId>,
    pub tag_co_power: Option<i64>,
    pub tag_co_max_power: Option<i64>,
    pub tag_co_max_spower: Option<i64>,
    pub eliminated: bool,
    pub accept_draw: bool,
    pub turn_clock: Option<i64>,
    pub aet_count: Option<i64>,
}

/// A unit record. Every field but the id is optional: baselines fill them all
/// in, patches carried by actions only set what changed. `None` always means
/// "unchanged", never "cleared".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayUnit {
    pub id: UnitId,
    pub player_id: Option<PlayerId>,
    pub name: Option<String>,
    pub movement_points: Option<i64>,
    pub vision: Option<i64>,
    pub fuel: Option<i64>,
    pub fuel_per_turn: Option<i64>,
    pub sub_dive: Option<bool>,
    pub ammo: Option<i64>,
    pub short_range: Option<i64>,
    pub long_range: Option<i64>,
    pub second_weapon: Option<bool>,
    pub cost: Option<i64>,
    pub movement_type: Option<String>,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub moved: Option<i64>,
    pub capture: Option<i64>,
    pub fired: Option<i64>,
    pub hit_points: Option<f64>,
    pub cargo: Option<Vec<UnitId>>,
    pub carried: Option<bool>,
}

impl Keyed for ReplayUnit {
    type Key = UnitId;

    fn key(&self) -> UnitId {
        self.id
    }
}

impl ReplayUnit {
    pub fn new(id: UnitId) -> Self {
        ReplayUnit {
            id,
            ..Default::default()
        }
    }

    /// Copies every field that is set on `patch` into `self`.
    pub fn overwrite(&mut self, patch: &ReplayUnit) {
        macro_rules! take {
            ($($field:ident),+ $(,)?) => {
                $(
                    if let Some(value) = &patch.$field {
                        self.$field = Some(value.clone());
                    }
                )+
            };
        }

        take!(
            player_id,
            name,
            movement_points,
            vision,
            fuel,
            fuel_per_turn,
            sub_dive,
            ammo,
            short_range,
            long_range,
            second_weapon,
            cost,
            movement_type,
            x,
            y,
            moved,
            capture,
            fired,
            hit_points,
            cargo,
            carried,
        );
    }

    pub fn position(&self) -> Option<Position> {
        Some(Position::new(self.x?, self.y?))
    }

    pub fn set_position(&mut self, position: Position) {
        self.x = Some(position.x);
        self.y = Some(position.y);
    }

    pub fn cargo_ids(&self) -> &[UnitId] {
        self.cargo.as_deref().unwrap_or_default()
    }

    pub fn is_carried(&self) -> bool {
        self.carried.unwrap_or(false)
    }

    pub fn is_destroyed(&self) -> bool {
        self.hit_points.is_some_and(|hp| hp <= 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayBuilding {
    pub id: BuildingId,
    pub position: Position,
    pub terrain_id: TerrainId,
    pub capture: i64,
    pub last_capture: i64,
    pub last_updated: Option<String>,
    /// Owning team, `None` for neutral buildings
    pub team: Option<String>,
}

impl Keyed for ReplayBuilding {
    type Key = Position;

    fn key(&self) -> Position {
        self.position
    }
}

/// A complete description of the match at the start of one player's turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSnapshot {
    pub day: i64,
    pub active_player_id: PlayerId,
    pub active_team: String,
    pub weather: Option<Weather>,
    pub active: bool,
    pub activity_date: Option<String>,
    pub aet_interval: Option<i64>,
    pub aet_date: Option<String>,
    pub players: BTreeMap<PlayerId, PlayerTurnState>,
    #[serde(with = "keyed_map")]
    pub buildings: BTreeMap<Position, ReplayBuilding>,
    #[serde(with = "keyed_map")]
    pub units: BTreeMap<UnitId, ReplayUnit>,
}

/// One of the two tolerated irregularities, kept so callers can report them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ParseAnomaly {
    /// An action line whose (player, day) header matched no turn snapshot.
    OrphanActionLine {
        line: usize,
        player_id: PlayerId,
        day: i64,
        action_count: usize,
    },
    /// An end-turn action found at the head of the following turn and moved
    /// back to the end of the turn it closes.
    RelocatedEndTurn { from_turn: usize, to_turn: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnData {
    pub snapshot: TurnSnapshot,
    pub actions: Vec<ReplayAction>,
}

/// Everything parsed out of a replay container.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayData {
    pub metadata: MatchMetadata,
    /// Player profiles in player-array order
    pub players: Vec<PlayerProfile>,
    pub turns: Vec<TurnData>,
    pub anomalies: Vec<ParseAnomaly>,
}

impl ReplayData {
    pub fn player(&self, id: PlayerId) -> Option<&PlayerProfile> {
        self.players.iter().find(|player| player.id == id)
    }

    pub fn snapshot(&self, turn: usize) -> Option<&TurnSnapshot> {
        self.turns.get(turn).map(|turn| &turn.snapshot)
    }

    pub fn action_count(&self) -> usize {
        self.turns.iter().map(|turn| turn.actions.len()).sum()
    }
}
