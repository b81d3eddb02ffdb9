use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use tracing::{Level, debug, span, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::model::{
    CoPowerState, MatchMetadata, MatchType, PlayerProfile, PlayerTurnState, ReplayBuilding,
    ReplayUnit, TurnSnapshot, Weather,
};
use crate::types::{
    BuildingId, CoId, CountryId, GameId, MapId, PlayerId, Position, TerrainId, UnitId, UserId,
};

use super::decoder::FormatDecoder;

const GAME_RECORD: &str = "awbwGame";
const PLAYER_RECORD: &str = "awbwPlayer";
const BUILDING_RECORD: &str = "awbwBuilding";
const UNIT_RECORD: &str = "awbwUnit";

const KEY_ID: &str = "id";
const KEY_NAME: &str = "name";
const KEY_PASSWORD: &str = "password";
const KEY_CREATOR: &str = "creator";
const KEY_START_DATE: &str = "start_date";
const KEY_END_DATE: &str = "end_date";
const KEY_MAPS_ID: &str = "maps_id";
const KEY_WEATHER_TYPE: &str = "weather_type";
const KEY_WEATHER_START: &str = "weather_start";
const KEY_WIN_CONDITION: &str = "win_condition";
const KEY_FUNDS: &str = "funds";
const KEY_CAPTURE_WIN: &str = "capture_win";
const KEY_FOG: &str = "fog";
const KEY_COMMENT: &str = "comment";
const KEY_TYPE: &str = "type";
const KEY_BOOT_INTERVAL: &str = "boot_interval";
const KEY_STARTING_FUNDS: &str = "starting_funds";
const KEY_OFFICIAL: &str = "official";
const KEY_MIN_RATING: &str = "min_rating";
const KEY_MAX_RATING: &str = "max_rating";
const KEY_LEAGUE: &str = "league";
const KEY_TEAM: &str = "team";
const KEY_USE_POWERS: &str = "use_powers";
const KEY_TIMERS_INITIAL: &str = "timers_initial";
const KEY_TIMERS_INCREMENT: &str = "timers_increment";
const KEY_TIMERS_MAX_TURN: &str = "timers_max_turn";
const KEY_TURN: &str = "turn";
const KEY_DAY: &str = "day";
const KEY_WEATHER_CODE: &str = "weather_code";
const KEY_ACTIVE: &str = "active";
const KEY_ACTIVITY_DATE: &str = "activity_date";
const KEY_AET_INTERVAL: &str = "aet_interval";
const KEY_AET_DATE: &str = "aet_date";
const KEY_PLAYERS: &str = "players";
const KEY_BUILDINGS: &str = "buildings";
const KEY_UNITS: &str = "units";

const KEY_USERS_ID: &str = "users_id";
const KEY_GAMES_ID: &str = "games_id";
const KEY_COUNTRIES_ID: &str = "countries_id";
const KEY_ORDER: &str = "order";
const KEY_CO_ID: &str = "co_id";
const KEY_CO_POWER: &str = "co_power";
const KEY_CO_POWER_ON: &str = "co_power_on";
const KEY_CO_MAX_POWER: &str = "co_max_power";
const KEY_CO_MAX_SPOWER: &str = "co_max_spower";
const KEY_TAGS_CO_ID: &str = "tags_co_id";
const KEY_TAGS_CO_POWER: &str = "tags_co_power";
const KEY_TAGS_CO_MAX_POWER: &str = "tags_co_max_power";
const KEY_TAGS_CO_MAX_SPOWER: &str = "tags_co_max_spower";
const KEY_ELIMINATED: &str = "eliminated";
const KEY_ACCEPT_DRAW: &str = "accept_draw";
const KEY_TURN_CLOCK: &str = "turn_clock";
const KEY_AET_COUNT: &str = "aet_count";

const KEY_TERRAIN_ID: &str = "terrain_id";
const KEY_X: &str = "x";
const KEY_Y: &str = "y";
const KEY_CAPTURE: &str = "capture";
const KEY_LAST_CAPTURE: &str = "last_capture";
const KEY_LAST_UPDATED: &str = "last_updated";

const KEY_PLAYERS_ID: &str = "players_id";
const KEY_MOVEMENT_POINTS: &str = "movement_points";
const KEY_VISION: &str = "vision";
const KEY_FUEL: &str = "fuel";
const KEY_FUEL_PER_TURN: &str = "fuel_per_turn";
const KEY_SUB_DIVE: &str = "sub_dive";
const KEY_AMMO: &str = "ammo";
const KEY_SHORT_RANGE: &str = "short_range";
const KEY_LONG_RANGE: &str = "long_range";
const KEY_SECOND_WEAPON: &str = "second_weapon";
const KEY_COST: &str = "cost";
const KEY_MOVEMENT_TYPE: &str = "movement_type";
const KEY_MOVED: &str = "moved";
const KEY_FIRED: &str = "fired";
const KEY_HIT_POINTS: &str = "hit_points";
const KEY_CARGO1_UNITS_ID: &str = "cargo1_units_id";
const KEY_CARGO2_UNITS_ID: &str = "cargo2_units_id";
const KEY_CARRIED: &str = "carried";

/// Stores a value the first time its key is seen.
fn fill<T>(slot: &mut Option<T>, value: T, record: &str, key: &str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::malformed(format!(
            "{record} record repeats the `{key}` field"
        )));
    }
    *slot = Some(value);
    Ok(())
}

fn required<T>(slot: Option<T>, record: &str, key: &str) -> Result<T> {
    slot.ok_or_else(|| Error::malformed(format!("{record} record is missing `{key}`")))
}

fn unknown_field(record: &'static str, key: String) -> Error {
    ErrorKind::UnknownField { record, field: key }.into()
}

fn coordinate(value: i64) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::malformed(format!("coordinate out of range: {value}")))
}

fn parse_code<T: FromStr>(value: &str, what: &str) -> Result<T> {
    T::from_str(value).map_err(|_| Error::malformed(format!("unknown {what} code {value:?}")))
}

/// Unit hit points are floats, but integral values show up as `i:` tokens too.
fn read_nullable_number(decoder: &mut FormatDecoder<'_>) -> Result<Option<f64>> {
    if decoder.remaining().starts_with("i:") {
        return decoder.read_int().map(|v| Some(v as f64));
    }
    decoder.read_nullable_float()
}

fn read_array<'a, T>(
    decoder: &mut FormatDecoder<'a>,
    mut read_item: impl FnMut(&mut FormatDecoder<'a>) -> Result<T>,
) -> Result<Vec<T>> {
    let count = decoder.read_array_start()?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        decoder.read_array_index()?;
        items.push(read_item(decoder)?);
    }
    decoder.read_array_end()?;
    Ok(items)
}

/// Match-invariant slots of one `awbwGame` record.
#[derive(Default)]
struct MetadataSlots {
    id: Option<i64>,
    name: Option<String>,
    password: Option<Option<String>>,
    creator: Option<i64>,
    start_date: Option<String>,
    end_date: Option<Option<String>>,
    maps_id: Option<i64>,
    weather_type: Option<String>,
    weather_start: Option<Option<i64>>,
    win_condition: Option<Option<String>>,
    funds: Option<i64>,
    capture_win: Option<i64>,
    fog: Option<bool>,
    comment: Option<Option<String>>,
    match_type: Option<String>,
    boot_interval: Option<i64>,
    starting_funds: Option<i64>,
    official: Option<bool>,
    min_rating: Option<Option<i64>>,
    max_rating: Option<Option<i64>>,
    league: Option<Option<String>>,
    team: Option<bool>,
    use_powers: Option<bool>,
    timers_initial: Option<i64>,
    timers_increment: Option<i64>,
    timers_max_turn: Option<i64>,
}

impl MetadataSlots {
    /// Reads the value for `key` if it is a match-invariant field. Returns
    /// `false` when the key belongs elsewhere.
    fn read(&mut self, key: &str, decoder: &mut FormatDecoder<'_>) -> Result<bool> {
        let r = GAME_RECORD;
        match key {
            KEY_ID => fill(&mut self.id, decoder.read_int()?, r, key)?,
            KEY_NAME => fill(&mut self.name, decoder.read_string()?, r, key)?,
            KEY_PASSWORD => fill(&mut self.password, decoder.read_nullable_string()?, r, key)?,
            KEY_CREATOR => fill(&mut self.creator, decoder.read_int()?, r, key)?,
            KEY_START_DATE => fill(&mut self.start_date, decoder.read_string()?, r, key)?,
            KEY_END_DATE => fill(&mut self.end_date, decoder.read_nullable_string()?, r, key)?,
            KEY_MAPS_ID => fill(&mut self.maps_id, decoder.read_int()?, r, key)?,
            KEY_WEATHER_TYPE => fill(&mut self.weather_type, decoder.read_string()?, r, key)?,
            KEY_WEATHER_START => {
                fill(&mut self.weather_start, decoder.read_nullable_int()?, r, key)?
            }
            KEY_WIN_CONDITION => {
                fill(&mut self.win_condition, decoder.read_nullable_string()?, r, key)?
            }
            KEY_FUNDS => fill(&mut self.funds, decoder.read_int()?, r, key)?,
            KEY_CAPTURE_WIN => fill(&mut self.capture_win, decoder.read_int()?, r, key)?,
            KEY_FOG => fill(&mut self.fog, decoder.read_bool()?, r, key)?,
            KEY_COMMENT => fill(&mut self.comment, decoder.read_nullable_string()?, r, key)?,
            KEY_TYPE => fill(&mut self.match_type, decoder.read_string()?, r, key)?,
            KEY_BOOT_INTERVAL => fill(&mut self.boot_interval, decoder.read_int()?, r, key)?,
            KEY_STARTING_FUNDS => fill(&mut self.starting_funds, decoder.read_int()?, r, key)?,
            KEY_OFFICIAL => fill(&mut self.official, decoder.read_bool()?, r, key)?,
            KEY_MIN_RATING => fill(&mut self.min_rating, decoder.read_nullable_int()?, r, key)?,
            KEY_MAX_RATING => fill(&mut self.max_rating, decoder.read_nullable_int()?, r, key)?,
            KEY_LEAGUE => fill(&mut self.league, decoder.read_nullable_string()?, r, key)?,
            KEY_TEAM => fill(&mut self.team, decoder.read_bool()?, r, key)?,
            KEY_USE_POWERS => fill(&mut self.use_powers, decoder.read_bool()?, r, key)?,
            KEY_TIMERS_INITIAL => fill(&mut self.timers_initial, decoder.read_int()?, r, key)?,
            KEY_TIMERS_INCREMENT => {
                fill(&mut self.timers_increment, decoder.read_int()?, r, key)?
            }
            KEY_TIMERS_MAX_TURN => fill(&mut self.timers_max_turn, decoder.read_int()?, r, key)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn into_metadata(self) -> Result<MatchMetadata> {
        let r = GAME_RECORD;
        let match_type: String = required(self.match_type, r, KEY_TYPE)?;
        Ok(MatchMetadata {
            id: GameId::try_from(required(self.id, r, KEY_ID)?)?,
            name: required(self.name, r, KEY_NAME)?,
            password: required(self.password, r, KEY_PASSWORD)?,
            creator: UserId::try_from(required(self.creator, r, KEY_CREATOR)?)?,
            start_date: required(self.start_date, r, KEY_START_DATE)?,
            end_date: required(self.end_date, r, KEY_END_DATE)?,
            map_id: MapId::try_from(required(self.maps_id, r, KEY_MAPS_ID)?)?,
            weather_type: required(self.weather_type, r, KEY_WEATHER_TYPE)?,
            weather_start: required(self.weather_start, r, KEY_WEATHER_START)?,
            win_condition: required(self.win_condition, r, KEY_WIN_CONDITION)?,
            funds_per_property: required(self.funds, r, KEY_FUNDS)?,
            capture_win: required(self.capture_win, r, KEY_CAPTURE_WIN)?,
            fog: required(self.fog, r, KEY_FOG)?,
            comment: required(self.comment, r, KEY_COMMENT)?,
            match_type: parse_code::<MatchType>(&match_type, "match type")?,
            boot_interval: required(self.boot_interval, r, KEY_BOOT_INTERVAL)?,
            starting_funds: required(self.starting_funds, r, KEY_STARTING_FUNDS)?,
            official: required(self.official, r, KEY_OFFICIAL)?,
            min_rating: required(self.min_rating, r, KEY_MIN_RATING)?,
            max_rating: required(self.max_rating, r, KEY_MAX_RATING)?,
            league: required(self.league, r, KEY_LEAGUE)?,
            team_game: required(self.team, r, KEY_TEAM)?,
            powers_allowed: required(self.use_powers, r, KEY_USE_POWERS)?,
            timers_initial: required(self.timers_initial, r, KEY_TIMERS_INITIAL)?,
            timers_increment: required(self.timers_increment, r, KEY_TIMERS_INCREMENT)?,
            timers_max_turn: required(self.timers_max_turn, r, KEY_TIMERS_MAX_TURN)?,
        })
    }
}

/// A decoded `awbwPlayer` record before it is split into profile and
/// turn state.
struct PlayerRecord {
    id: PlayerId,
    user_id: UserId,
    games_id: GameId,
    country_id: CountryId,
    team: String,
    order: i64,
    state: PlayerTurnState,
}

fn read_player(decoder: &mut FormatDecoder<'_>) -> Result<PlayerRecord> {
    let r = PLAYER_RECORD;
    let field_count = decoder.read_record_start(r)?;

    let mut id = None;
    let mut users_id = None;
    let mut games_id = None;
    let mut countries_id = None;
    let mut team = None;
    let mut order = None;
    let mut funds = None;
    let mut co_id = None;
    let mut co_power = None;
    let mut co_power_on = None;
    let mut co_max_power = None;
    let mut co_max_spower = None;
    let mut tags_co_id = None;
    let mut tags_co_power = None;
    let mut tags_co_max_power = None;
    let mut tags_co_max_spower = None;
    let mut eliminated = None;
    let mut accept_draw = None;
    let mut turn_clock = None;
    let mut aet_count = None;

    for _ in 0..field_count {
        let key = decoder.read_string()?;
        let k = key.as_str();
        match k {
            KEY_ID => fill(&mut id, decoder.read_int()?, r, k)?,
            KEY_USERS_ID => fill(&mut users_id, decoder.read_int()?, r, k)?,
            KEY_GAMES_ID => fill(&mut games_id, decoder.read_int()?, r, k)?,
            KEY_COUNTRIES_ID => fill(&mut countries_id, decoder.read_int()?, r, k)?,
            KEY_TEAM => fill(&mut team, decoder.read_string()?, r, k)?,
            KEY_ORDER => fill(&mut order, decoder.read_int()?, r, k)?,
            KEY_FUNDS => fill(&mut funds, decoder.read_int()?, r, k)?,
            KEY_CO_ID => fill(&mut co_id, decoder.read_int()?, r, k)?,
            KEY_CO_POWER => fill(&mut co_power, decoder.read_int()?, r, k)?,
            KEY_CO_POWER_ON => fill(&mut co_power_on, decoder.read_string()?, r, k)?,
            KEY_CO_MAX_POWER => fill(&mut co_max_power, decoder.read_nullable_int()?, r, k)?,
            KEY_CO_MAX_SPOWER => fill(&mut co_max_spower, decoder.read_nullable_int()?, r, k)?,
            KEY_TAGS_CO_ID => fill(&mut tags_co_id, decoder.read_nullable_int()?, r, k)?,
            KEY_TAGS_CO_POWER => fill(&mut tags_co_power, decoder.read_nullable_int()?, r, k)?,
            KEY_TAGS_CO_MAX_POWER => {
                fill(&mut tags_co_max_power, decoder.read_nullable_int()?, r, k)?
            }
            KEY_TAGS_CO_MAX_SPOWER => {
                fill(&mut tags_co_max_spower, decoder.read_nullable_int()?, r, k)?
            }
            KEY_ELIMINATED => fill(&mut eliminated, decoder.read_bool()?, r, k)?,
            KEY_ACCEPT_DRAW => fill(&mut accept_draw, decoder.read_bool()?, r, k)?,
            KEY_TURN_CLOCK => fill(&mut turn_clock, decoder.read_nullable_int()?, r, k)?,
            KEY_AET_COUNT => fill(&mut aet_count, decoder.read_nullable_int()?, r, k)?,
            _ => return Err(unknown_field(r, key)),
        }
    }
    decoder.read_record_end()?;

    let power_state: String = required(co_power_on, r, KEY_CO_POWER_ON)?;
    let state = PlayerTurnState {
        funds: required(funds, r, KEY_FUNDS)?,
        co_id: CoId::try_from(required(co_id, r, KEY_CO_ID)?)?,
        co_power: required(co_power, r, KEY_CO_POWER)?,
        power_state: parse_code::<CoPowerState>(&power_state, "power state")?,
        co_max_power: co_max_power.flatten(),
        co_max_spower: co_max_spower.flatten(),
        tag_co_id: tags_co_id.flatten().map(CoId::try_from).transpose()?,
        tag_co_power: tags_co_power.flatten(),
        tag_co_max_power: tags_co_max_power.flatten(),
        tag_co_max_spower: tags_co_max_spower.flatten(),
        eliminated: required(eliminated, r, KEY_ELIMINATED)?,
        accept_draw: accept_draw.unwrap_or(false),
        turn_clock: turn_clock.flatten(),
        aet_count: aet_count.flatten(),
    };

    Ok(PlayerRecord {
        id: PlayerId::try_from(required(id, r, KEY_ID)?)?,
        user_id: UserId::try_from(required(users_id, r, KEY_USERS_ID)?)?,
        games_id: GameId::try_from(required(games_id, r, KEY_GAMES_ID)?)?,
        country_id: CountryId::try_from(required(countries_id, r, KEY_COUNTRIES_ID)?)?,
        team: required(team, r, KEY_TEAM)?,
        order: required(order, r, KEY_ORDER)?,
        state,
    })
}

fn read_building(decoder: &mut FormatDecoder<'_>) -> Result<(GameId, ReplayBuilding)> {
    let r = BUILDING_RECORD;
    let field_count = decoder.read_record_start(r)?;

    let mut id = None;
    let mut games_id = None;
    let mut terrain_id = None;
    let mut x = None;
    let mut y = None;
    let mut capture = None;
    let mut last_capture = None;
    let mut last_updated = None;
    let mut team = None;

    for _ in 0..field_count {
        let key = decoder.read_string()?;
        let k = key.as_str();
        match k {
            KEY_ID => fill(&mut id, decoder.read_int()?, r, k)?,
            KEY_GAMES_ID => fill(&mut games_id, decoder.read_int()?, r, k)?,
            KEY_TERRAIN_ID => fill(&mut terrain_id, decoder.read_int()?, r, k)?,
            KEY_X => fill(&mut x, decoder.read_int()?, r, k)?,
            KEY_Y => fill(&mut y, decoder.read_int()?, r, k)?,
            KEY_CAPTURE => fill(&mut capture, decoder.read_int()?, r, k)?,
            KEY_LAST_CAPTURE => fill(&mut last_capture, decoder.read_int()?, r, k)?,
            KEY_LAST_UPDATED => fill(&mut last_updated, decoder.read_nullable_string()?, r, k)?,
            KEY_TEAM => fill(&mut team, decoder.read_nullable_string()?, r, k)?,
            _ => return Err(unknown_field(r, key)),
        }
    }
    decoder.read_record_end()?;

    let building = ReplayBuilding {
        id: BuildingId::try_from(required(id, r, KEY_ID)?)?,
        position: Position::new(
            coordinate(required(x, r, KEY_X)?)?,
            coordinate(required(y, r, KEY_Y)?)?,
        ),
        terrain_id: TerrainId::try_from(required(terrain_id, r, KEY_TERRAIN_ID)?)?,
        capture: required(capture, r, KEY_CAPTURE)?,
        last_capture: required(last_capture, r, KEY_LAST_CAPTURE)?,
        last_updated: last_updated.flatten(),
        team: team.flatten(),
    };
    Ok((GameId::try_from(required(games_id, r, KEY_GAMES_ID)?)?, building))
}

fn read_unit(decoder: &mut FormatDecoder<'_>) -> Result<(Option<GameId>, ReplayUnit)> {
    let r = UNIT_RECORD;
    let field_count = decoder.read_record_start(r)?;

    let mut id = None;
    let mut games_id = None;
    let mut players_id = None;
    let mut name = None;
    let mut movement_points = None;
    let mut vision = None;
    let mut fuel = None;
    let mut fuel_per_turn = None;
    let mut sub_dive = None;
    let mut ammo = None;
    let mut short_range = None;
    let mut long_range = None;
    let mut second_weapon = None;
    let mut cost = None;
    let mut movement_type = None;
    let mut x = None;
    let mut y = None;
    let mut moved = None;
    let mut capture = None;
    let mut fired = None;
    let mut hit_points = None;
    let mut cargo1 = None;
    let mut cargo2 = None;
    let mut carried = None;

    for _ in 0..field_count {
        let key = decoder.read_string()?;
        let k = key.as_str();
        match k {
            KEY_ID => fill(&mut id, decoder.read_int()?, r, k)?,
            KEY_GAMES_ID => fill(&mut games_id, decoder.read_nullable_int()?, r, k)?,
            KEY_PLAYERS_ID => fill(&mut players_id, decoder.read_nullable_int()?, r, k)?,
            KEY_NAME => fill(&mut name, decoder.read_nullable_string()?, r, k)?,
            KEY_MOVEMENT_POINTS => {
                fill(&mut movement_points, decoder.read_nullable_int()?, r, k)?
            }
            KEY_VISION => fill(&mut vision, decoder.read_nullable_int()?, r, k)?,
            KEY_FUEL => fill(&mut fuel, decoder.read_nullable_int()?, r, k)?,
            KEY_FUEL_PER_TURN => fill(&mut fuel_per_turn, decoder.read_nullable_int()?, r, k)?,
            KEY_SUB_DIVE => fill(&mut sub_dive, decoder.read_nullable_bool()?, r, k)?,
            KEY_AMMO => fill(&mut ammo, decoder.read_nullable_int()?, r, k)?,
            KEY_SHORT_RANGE => fill(&mut short_range, decoder.read_nullable_int()?, r, k)?,
            KEY_LONG_RANGE => fill(&mut long_range, decoder.read_nullable_int()?, r, k)?,
            KEY_SECOND_WEAPON => fill(&mut second_weapon, decoder.read_nullable_bool()?, r, k)?,
            KEY_COST => fill(&mut cost, decoder.read_nullable_int()?, r, k)?,
            KEY_MOVEMENT_TYPE => fill(&mut movement_type, decoder.read_nullable_string()?, r, k)?,
            KEY_X => fill(&mut x, decoder.read_nullable_int()?, r, k)?,
            KEY_Y => fill(&mut y, decoder.read_nullable_int()?, r, k)?,
            KEY_MOVED => fill(&mut moved, decoder.read_nullable_int()?, r, k)?,
            KEY_CAPTURE => fill(&mut capture, decoder.read_nullable_int()?, r, k)?,
            KEY_FIRED => fill(&mut fired, decoder.read_nullable_int()?, r, k)?,
            KEY_HIT_POINTS => fill(&mut hit_points, read_nullable_number(decoder)?, r, k)?,
            KEY_CARGO1_UNITS_ID => fill(&mut cargo1, decoder.read_nullable_int()?, r, k)?,
            KEY_CARGO2_UNITS_ID => fill(&mut cargo2, decoder.read_nullable_int()?, r, k)?,
            KEY_CARRIED => fill(&mut carried, decoder.read_nullable_bool()?, r, k)?,
            _ => return Err(unknown_field(r, key)),
        }
    }
    decoder.read_record_end()?;

    let cargo = match (cargo1.flatten(), cargo2.flatten()) {
        (None, None) => None,
        (first, second) => Some(
            [first, second]
                .into_iter()
                .flatten()
                .filter(|id| *id != 0)
                .map(UnitId::try_from)
                .collect::<Result<Vec<_>>>()?,
        ),
    };

    let unit = ReplayUnit {
        id: UnitId::try_from(required(id, r, KEY_ID)?)?,
        player_id: players_id.flatten().map(PlayerId::try_from).transpose()?,
        name: name.flatten(),
        movement_points: movement_points.flatten(),
        vision: vision.flatten(),
        fuel: fuel.flatten(),
        fuel_per_turn: fuel_per_turn.flatten(),
        sub_dive: sub_dive.flatten(),
        ammo: ammo.flatten(),
        short_range: short_range.flatten(),
        long_range: long_range.flatten(),
        second_weapon: second_weapon.flatten(),
        cost: cost.flatten(),
        movement_type: movement_type.flatten(),
        x: x.flatten().map(coordinate).transpose()?,
        y: y.flatten().map(coordinate).transpose()?,
        moved: moved.flatten(),
        capture: capture.flatten(),
        fired: fired.flatten(),
        hit_points: hit_points.flatten(),
        cargo,
        carried: carried.flatten(),
    };
    let games_id = games_id.flatten().map(GameId::try_from).transpose()?;
    Ok((games_id, unit))
}

/// Everything the snapshot stream yields.
#[derive(Debug, Clone)]
pub struct ParsedSnapshots {
    pub metadata: MatchMetadata,
    pub players: Vec<PlayerProfile>,
    pub turns: Vec<TurnSnapshot>,
}

/// Reads the newline separated `awbwGame` records, one per turn.
pub struct TurnSnapshotReader<'a> {
    decoder: FormatDecoder<'a>,
    metadata: Option<MatchMetadata>,
    profiles: BTreeMap<u32, PlayerProfile>,
    turns: Vec<TurnSnapshot>,
}

impl<'a> TurnSnapshotReader<'a> {
    pub fn new(text: &'a str) -> Self {
        TurnSnapshotReader {
            decoder: FormatDecoder::new(text),
            metadata: None,
            profiles: BTreeMap::new(),
            turns: Vec::new(),
        }
    }

    pub fn read_all(mut self) -> Result<ParsedSnapshots> {
        self.decoder.skip_line_breaks()?;
        while !self.decoder.is_at_end() {
            let index = self.turns.len();
            let turn = self.read_turn(index).map_err(|e| {
                let e = e.with_turn(index);
                match &self.metadata {
                    Some(metadata) => e.with_match(metadata.id),
                    None => e,
                }
            })?;
            self.turns.push(turn);
            self.decoder.skip_line_breaks()?;
        }

        let Some(metadata) = self.metadata else {
            return Err(Error::malformed("snapshot stream contains no turns"));
        };
        debug!(match_id = %metadata.id, turns = self.turns.len(), "read turn snapshots");

        Ok(ParsedSnapshots {
            metadata,
            players: self.profiles.into_values().collect(),
            turns: self.turns,
        })
    }

    fn read_turn(&mut self, index: usize) -> Result<TurnSnapshot> {
        let span = span!(Level::DEBUG, "turn", index);
        let _enter = span.enter();

        let decoder = &mut self.decoder;
        let r = GAME_RECORD;
        let field_count = decoder.read_record_start(r)?;

        let mut slots = MetadataSlots::default();
        let mut turn = None;
        let mut day = None;
        let mut weather_code = None;
        let mut active = None;
        let mut activity_date = None;
        let mut aet_interval = None;
        let mut aet_date = None;
        let mut players = None;
        let mut buildings = None;
        let mut units = None;

        for _ in 0..field_count {
            let key = decoder.read_string()?;
            if slots.read(&key, decoder)? {
                continue;
            }
            let k = key.as_str();
            match k {
                KEY_TURN => fill(&mut turn, decoder.read_int()?, r, k)?,
                KEY_DAY => fill(&mut day, decoder.read_int()?, r, k)?,
                KEY_WEATHER_CODE => {
                    fill(&mut weather_code, decoder.read_nullable_string()?, r, k)?
                }
                KEY_ACTIVE => fill(&mut active, decoder.read_bool()?, r, k)?,
                KEY_ACTIVITY_DATE => {
                    fill(&mut activity_date, decoder.read_nullable_string()?, r, k)?
                }
                KEY_AET_INTERVAL => fill(&mut aet_interval, decoder.read_nullable_int()?, r, k)?,
                KEY_AET_DATE => fill(&mut aet_date, decoder.read_nullable_string()?, r, k)?,
                KEY_PLAYERS => fill(&mut players, read_array(decoder, read_player)?, r, k)?,
                KEY_BUILDINGS => fill(&mut buildings, read_array(decoder, read_building)?, r, k)?,
                KEY_UNITS => fill(&mut units, read_array(decoder, read_unit)?, r, k)?,
                _ => return Err(unknown_field(r, key)),
            }
        }
        decoder.read_record_end()?;

        let metadata = slots.into_metadata()?;
        match &self.metadata {
            Some(established) => established
                .ensure_matches(&metadata)
                .map_err(|e| e.with_match(established.id))?,
            None => self.metadata = Some(metadata.clone()),
        }
        let match_id = metadata.id;

        let mut player_states = BTreeMap::new();
        for (index, record) in required(players, r, KEY_PLAYERS)?.into_iter().enumerate() {
            let index = u32::try_from(index)
                .map_err(|_| Error::malformed("player array is too large"))?;
            if record.games_id != match_id {
                return Err(Error::invariant("players.games_id", match_id, record.games_id));
            }
            self.track_profile(index, &record)?;
            if player_states.insert(record.id, record.state).is_some() {
                return Err(Error::malformed(format!("player {} listed twice", record.id)));
            }
        }

        let mut building_map = BTreeMap::new();
        for (games_id, building) in required(buildings, r, KEY_BUILDINGS)? {
            if games_id != match_id {
                return Err(Error::invariant("buildings.games_id", match_id, games_id));
            }
            let position = building.position;
            if building_map.insert(position, building).is_some() {
                return Err(Error::malformed(format!(
                    "two buildings share position {position}"
                )));
            }
        }

        let mut unit_map = BTreeMap::new();
        for (games_id, unit) in required(units, r, KEY_UNITS)? {
            if let Some(games_id) = games_id.filter(|id| *id != match_id) {
                return Err(Error::invariant("units.games_id", match_id, games_id));
            }
            let id = unit.id;
            if unit_map.insert(id, unit).is_some() {
                return Err(Error::malformed(format!("unit {id} listed twice")));
            }
        }

        let active_player_id = PlayerId::try_from(required(turn, r, KEY_TURN)?)?;
        let active_team = self
            .profiles
            .values()
            .find(|profile| profile.id == active_player_id)
            .map(|profile| profile.team.clone())
            .ok_or_else(|| Error::missing(format!("active player {active_player_id}")))?;
        let weather = weather_code
            .flatten()
            .map(|code| parse_code::<Weather>(&code, "weather"))
            .transpose()?;

        trace!(
            players = player_states.len(),
            buildings = building_map.len(),
            units = unit_map.len(),
            "decoded turn record"
        );

        Ok(TurnSnapshot {
            day: required(day, r, KEY_DAY)?,
            active_player_id,
            active_team,
            weather,
            active: required(active, r, KEY_ACTIVE)?,
            activity_date: activity_date.flatten(),
            aet_interval: aet_interval.flatten(),
            aet_date: aet_date.flatten(),
            players: player_states,
            buildings: building_map,
            units: unit_map,
        })
    }

    /// Creates the profile for a new player index, or re-validates the
    /// identity fields of a known one.
    fn track_profile(&mut self, index: u32, record: &PlayerRecord) -> Result<()> {
        let Some(profile) = self.profiles.get_mut(&index) else {
            let mut co_ids = BTreeSet::from([record.state.co_id]);
            co_ids.extend(record.state.tag_co_id);
            self.profiles.insert(
                index,
                PlayerProfile {
                    index,
                    id: record.id,
                    user_id: record.user_id,
                    team: record.team.clone(),
                    country_id: record.country_id,
                    order: record.order,
                    co_ids,
                },
            );
            return Ok(());
        };

        if profile.id != record.id {
            return Err(Error::invariant("players.id", profile.id, record.id));
        }
        if profile.user_id != record.user_id {
            return Err(Error::invariant("players.users_id", profile.user_id, record.user_id));
        }
        if profile.team != record.team {
            return Err(Error::invariant("players.team", &profile.team, &record.team));
        }
        if profile.country_id != record.country_id {
            return Err(Error::invariant(
                "players.countries_id",
                profile.country_id,
                record.country_id,
            ));
        }
        if profile.order != record.order {
            return Err(Error::invariant("players.order", profile.order, record.order));
        }
        profile.co_ids.insert(record.state.co_id);
        profile.co_ids.extend(record.state.tag_co_id);
        Ok(())
    }
}
