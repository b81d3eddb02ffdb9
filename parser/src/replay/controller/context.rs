use std::collections::BTreeMap;

use serde::Serialize;
use tracing::trace;

use crate::Rc;
use crate::error::{Error, Result};
use crate::game_constants::GameConstants;
use crate::model::{
    CoPowerState, MatchMetadata, PlayerProfile, ReplayBuilding, ReplayUnit, TurnSnapshot, Weather,
};
use crate::types::{CoId, PlayerId, Position, TerrainId, UnitId};

/// Running totals for one player.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerLedger {
    pub team: String,
    /// Round order, used to rank simultaneous eliminations
    pub order: i64,
    pub funds: i64,
    pub income: i64,
    pub co_id: CoId,
    pub tag_co_id: Option<CoId>,
    pub power: i64,
    pub tag_power: Option<i64>,
    pub eliminated: bool,
    pub eliminated_on_day: Option<i64>,
    /// Day and round order of the turn the player went out on
    pub eliminated_on_turn: Option<(i64, i64)>,
}

/// A CO power that is currently running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePower {
    pub state: CoPowerState,
    pub co_id: CoId,
    pub power_name: Option<String>,
    pub movement_bonus: i64,
    pub vision_bonus: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameOverState {
    pub winners: Vec<PlayerId>,
    pub losers: Vec<PlayerId>,
    pub message: Option<String>,
}

/// Whose turn it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TurnCursor {
    pub active_player_id: PlayerId,
    pub day: i64,
    pub weather: Option<Weather>,
}

/// Pre-values captured while an action sets up, the first time each key is
/// touched. Rolling a journal back restores exactly those values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Journal {
    units: BTreeMap<UnitId, Option<ReplayUnit>>,
    buildings: BTreeMap<Position, Option<ReplayBuilding>>,
    ledgers: BTreeMap<PlayerId, PlayerLedger>,
    discoveries: BTreeMap<(String, Position), Option<TerrainId>>,
    powers: BTreeMap<PlayerId, Option<ActivePower>>,
    cursor: Option<TurnCursor>,
    game_over: Option<Option<GameOverState>>,
}

impl Journal {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
            && self.buildings.is_empty()
            && self.ledgers.is_empty()
            && self.discoveries.is_empty()
            && self.powers.is_empty()
            && self.cursor.is_none()
            && self.game_over.is_none()
    }

    pub fn touched_units(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.units.keys().copied()
    }
}

/// One difference between a folded context and an independently parsed
/// snapshot. `expected` is the snapshot's value, `found` the context's.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum FoldMismatch {
    MissingUnit {
        id: UnitId,
    },
    UnexpectedUnit {
        id: UnitId,
    },
    Unit {
        id: UnitId,
        expected: Box<ReplayUnit>,
        found: Box<ReplayUnit>,
    },
    MissingBuilding {
        position: Position,
    },
    UnexpectedBuilding {
        position: Position,
    },
    Building {
        position: Position,
        expected: Box<ReplayBuilding>,
        found: Box<ReplayBuilding>,
    },
    Funds {
        player: PlayerId,
        expected: i64,
        found: i64,
    },
    Co {
        player: PlayerId,
        expected: CoId,
        found: CoId,
    },
    TagCo {
        player: PlayerId,
        expected: Option<CoId>,
        found: Option<CoId>,
    },
    Power {
        player: PlayerId,
        expected: i64,
        found: i64,
    },
    TagPower {
        player: PlayerId,
        expected: Option<i64>,
        found: Option<i64>,
    },
    PowerState {
        player: PlayerId,
        expected: CoPowerState,
        found: CoPowerState,
    },
    Eliminated {
        player: PlayerId,
        expected: bool,
        found: bool,
    },
    MissingPlayer {
        player: PlayerId,
    },
    ActivePlayer {
        expected: PlayerId,
        found: PlayerId,
    },
    Day {
        expected: i64,
        found: i64,
    },
    Weather {
        expected: Option<Weather>,
        found: Option<Weather>,
    },
}

/// The match state actions fold onto and off of.
///
/// Every mutating helper records the pre-value of what it touches into each
/// journal opened by [`ReplaySetupContext::record`], so actions never
/// snapshot by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySetupContext {
    constants: Rc<GameConstants>,
    funds_per_property: i64,
    units: BTreeMap<UnitId, ReplayUnit>,
    buildings: BTreeMap<Position, ReplayBuilding>,
    ledgers: BTreeMap<PlayerId, PlayerLedger>,
    discoveries: BTreeMap<String, BTreeMap<Position, TerrainId>>,
    active_powers: BTreeMap<PlayerId, ActivePower>,
    cursor: TurnCursor,
    game_over: Option<GameOverState>,
    journals: Vec<Journal>,
}

impl ReplaySetupContext {
    pub fn from_snapshot(
        metadata: &MatchMetadata,
        players: &[PlayerProfile],
        snapshot: &TurnSnapshot,
        constants: Rc<GameConstants>,
    ) -> Result<Self> {
        let mut ledgers = BTreeMap::new();
        let mut active_powers = BTreeMap::new();
        for profile in players {
            let state = snapshot
                .players
                .get(&profile.id)
                .ok_or_else(|| Error::missing(format!("turn state for player {}", profile.id)))?;
            let owned = snapshot
                .buildings
                .values()
                .filter(|building| building.team.as_deref() == Some(profile.team.as_str()))
                .count() as i64;
            ledgers.insert(
                profile.id,
                PlayerLedger {
                    team: profile.team.clone(),
                    order: profile.order,
                    funds: state.funds,
                    income: owned * metadata.funds_per_property,
                    co_id: state.co_id,
                    tag_co_id: state.tag_co_id,
                    power: state.co_power,
                    tag_power: state.tag_co_power,
                    eliminated: state.eliminated,
                    eliminated_on_day: None,
                    eliminated_on_turn: None,
                },
            );
            if state.power_state != CoPowerState::None {
                active_powers.insert(
                    profile.id,
                    ActivePower {
                        state: state.power_state,
                        co_id: state.co_id,
                        power_name: None,
                        movement_bonus: 0,
                        vision_bonus: 0,
                    },
                );
            }
        }

        Ok(ReplaySetupContext {
            constants,
            funds_per_property: metadata.funds_per_property,
            units: snapshot.units.clone(),
            buildings: snapshot.buildings.clone(),
            ledgers,
            discoveries: BTreeMap::new(),
            active_powers,
            cursor: TurnCursor {
                active_player_id: snapshot.active_player_id,
                day: snapshot.day,
                weather: snapshot.weather,
            },
            game_over: None,
            journals: Vec::new(),
        })
    }

    pub fn constants(&self) -> &GameConstants {
        &self.constants
    }

    pub fn funds_per_property(&self) -> i64 {
        self.funds_per_property
    }

    pub fn units(&self) -> &BTreeMap<UnitId, ReplayUnit> {
        &self.units
    }

    pub fn buildings(&self) -> &BTreeMap<Position, ReplayBuilding> {
        &self.buildings
    }

    pub fn ledgers(&self) -> &BTreeMap<PlayerId, PlayerLedger> {
        &self.ledgers
    }

    pub fn discoveries(&self) -> &BTreeMap<String, BTreeMap<Position, TerrainId>> {
        &self.discoveries
    }

    pub fn active_powers(&self) -> &BTreeMap<PlayerId, ActivePower> {
        &self.active_powers
    }

    pub fn cursor(&self) -> TurnCursor {
        self.cursor
    }

    pub fn game_over(&self) -> Option<&GameOverState> {
        self.game_over.as_ref()
    }

    pub fn unit(&self, id: UnitId) -> Option<&ReplayUnit> {
        self.units.get(&id)
    }

    pub fn require_unit(&self, id: UnitId) -> Result<&ReplayUnit> {
        self.units
            .get(&id)
            .ok_or_else(|| Error::missing(format!("unit {id}")))
    }

    pub fn building(&self, position: Position) -> Option<&ReplayBuilding> {
        self.buildings.get(&position)
    }

    pub fn ledger(&self, player: PlayerId) -> Result<&PlayerLedger> {
        self.ledgers
            .get(&player)
            .ok_or_else(|| Error::missing(format!("player {player}")))
    }

    pub fn team_of(&self, player: PlayerId) -> Result<&str> {
        self.ledger(player).map(|ledger| ledger.team.as_str())
    }

    /// Runs `apply` with a fresh journal open. On success the journal is
    /// returned for a later [`rollback`](Self::rollback); on failure every
    /// change `apply` made is rolled back before the error propagates.
    pub fn record<F>(&mut self, apply: F) -> Result<Journal>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.journals.push(Journal::default());
        let outcome = apply(self);
        let journal = self.journals.pop().unwrap_or_default();
        match outcome {
            Ok(()) => Ok(journal),
            Err(e) => {
                self.rollback(journal);
                Err(e)
            }
        }
    }

    /// Restores every pre-value captured in `journal`.
    pub fn rollback(&mut self, journal: Journal) {
        trace!(units = journal.units.len(), "rolling back journal");
        let Journal {
            units,
            buildings,
            ledgers,
            discoveries,
            powers,
            cursor,
            game_over,
        } = journal;

        for (id, previous) in units {
            match previous {
                Some(unit) => self.units.insert(id, unit),
                None => self.units.remove(&id),
            };
        }
        for (position, previous) in buildings {
            match previous {
                Some(building) => self.buildings.insert(position, building),
                None => self.buildings.remove(&position),
            };
        }
        self.ledgers.extend(ledgers);
        for ((team, position), previous) in discoveries {
            self.undo_discovery(&team, position, previous);
        }
        for (player, previous) in powers {
            match previous {
                Some(power) => self.active_powers.insert(player, power),
                None => self.active_powers.remove(&player),
            };
        }
        if let Some(cursor) = cursor {
            self.cursor = cursor;
        }
        if let Some(game_over) = game_over {
            self.game_over = game_over;
        }
    }

    fn note_unit(&mut self, id: UnitId) {
        for journal in &mut self.journals {
            journal
                .units
                .entry(id)
                .or_insert_with(|| self.units.get(&id).cloned());
        }
    }

    fn note_building(&mut self, position: Position) {
        for journal in &mut self.journals {
            journal
                .buildings
                .entry(position)
                .or_insert_with(|| self.buildings.get(&position).cloned());
        }
    }

    fn note_ledger(&mut self, player: PlayerId) {
        let Some(ledger) = self.ledgers.get(&player) else {
            return;
        };
        for journal in &mut self.journals {
            journal
                .ledgers
                .entry(player)
                .or_insert_with(|| ledger.clone());
        }
    }

    /// Mutable access to a unit, recorded before it is handed out.
    pub fn unit_mut(&mut self, id: UnitId) -> Result<&mut ReplayUnit> {
        if !self.units.contains_key(&id) {
            return Err(Error::missing(format!("unit {id}")));
        }
        self.note_unit(id);
        self.units
            .get_mut(&id)
            .ok_or_else(|| Error::missing(format!("unit {id}")))
    }

    /// Inserts `unit`, returning whatever had its id before.
    pub fn replace_unit(&mut self, unit: ReplayUnit) -> Option<ReplayUnit> {
        self.note_unit(unit.id);
        self.units.insert(unit.id, unit)
    }

    /// Overwrites the fields `patch` sets on an existing unit.
    pub fn patch_unit(&mut self, patch: &ReplayUnit) -> Result<()> {
        self.unit_mut(patch.id)?.overwrite(patch);
        Ok(())
    }

    /// Removes a unit and, recursively, everything it carries. Returns the
    /// removed records, transport first.
    pub fn remove_unit_with_cargo(&mut self, id: UnitId) -> Result<Vec<ReplayUnit>> {
        let mut removed = Vec::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            self.note_unit(next);
            let unit = self
                .units
                .remove(&next)
                .ok_or_else(|| Error::missing(format!("unit {next}")))?;
            pending.extend(unit.cargo_ids().iter().rev());
            removed.push(unit);
        }
        Ok(removed)
    }

    pub fn restore_units(&mut self, units: Vec<ReplayUnit>) {
        for unit in units {
            self.replace_unit(unit);
        }
    }

    /// Places a unit and everything it carries on `position`.
    pub fn move_unit_tree(&mut self, id: UnitId, position: Position) -> Result<()> {
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            let unit = self.unit_mut(next)?;
            unit.set_position(position);
            pending.extend(unit.cargo_ids().iter().copied());
        }
        Ok(())
    }

    pub fn building_mut(&mut self, position: Position) -> Result<&mut ReplayBuilding> {
        if !self.buildings.contains_key(&position) {
            return Err(Error::missing(format!("building at {position}")));
        }
        self.note_building(position);
        self.buildings
            .get_mut(&position)
            .ok_or_else(|| Error::missing(format!("building at {position}")))
    }

    pub fn replace_building(&mut self, building: ReplayBuilding) -> Option<ReplayBuilding> {
        self.note_building(building.position);
        self.buildings.insert(building.position, building)
    }

    pub fn ledger_mut(&mut self, player: PlayerId) -> Result<&mut PlayerLedger> {
        if !self.ledgers.contains_key(&player) {
            return Err(Error::missing(format!("player {player}")));
        }
        self.note_ledger(player);
        self.ledgers
            .get_mut(&player)
            .ok_or_else(|| Error::missing(format!("player {player}")))
    }

    /// Sets a player's funds, returning the previous amount.
    pub fn set_funds(&mut self, player: PlayerId, funds: i64) -> Result<i64> {
        let ledger = self.ledger_mut(player)?;
        Ok(std::mem::replace(&mut ledger.funds, funds))
    }

    /// Records that `team` now knows the true terrain at `position`.
    /// Returns what the team knew before.
    pub fn register_discovery(
        &mut self,
        team: &str,
        position: Position,
        terrain: TerrainId,
    ) -> Option<TerrainId> {
        let known = self.discoveries.get(team).and_then(|map| map.get(&position)).copied();
        for journal in &mut self.journals {
            journal
                .discoveries
                .entry((team.to_owned(), position))
                .or_insert(known);
        }
        self.discoveries
            .entry(team.to_owned())
            .or_default()
            .insert(position, terrain)
    }

    pub fn undo_discovery(&mut self, team: &str, position: Position, previous: Option<TerrainId>) {
        match previous {
            Some(terrain) => {
                self.discoveries
                    .entry(team.to_owned())
                    .or_default()
                    .insert(position, terrain);
            }
            None => {
                if let Some(known) = self.discoveries.get_mut(team) {
                    known.remove(&position);
                    if known.is_empty() {
                        self.discoveries.remove(team);
                    }
                }
            }
        }
    }

    pub fn set_active_power(
        &mut self,
        player: PlayerId,
        power: Option<ActivePower>,
    ) -> Option<ActivePower> {
        let current = self.active_powers.get(&player).cloned();
        for journal in &mut self.journals {
            journal.powers.entry(player).or_insert_with(|| current.clone());
        }
        match power {
            Some(power) => self.active_powers.insert(player, power),
            None => self.active_powers.remove(&player),
        }
    }

    pub fn set_cursor(&mut self, cursor: TurnCursor) -> TurnCursor {
        for journal in &mut self.journals {
            journal.cursor.get_or_insert(self.cursor);
        }
        std::mem::replace(&mut self.cursor, cursor)
    }

    pub fn set_game_over(&mut self, state: Option<GameOverState>) -> Option<GameOverState> {
        for journal in &mut self.journals {
            journal
                .game_over
                .get_or_insert_with(|| self.game_over.clone());
        }
        std::mem::replace(&mut self.game_over, state)
    }

    /// Applies an HP delta to every uncarried unit within `radius` tiles of
    /// `center`. Hit points stay within 0.1 and 10.
    pub fn apply_area_damage(&mut self, center: Position, radius: u32, delta: f64) -> Result<()> {
        let targets: Vec<UnitId> = self
            .units
            .values()
            .filter(|unit| !unit.is_carried())
            .filter(|unit| {
                unit.position()
                    .is_some_and(|position| position.manhattan(center) <= radius)
            })
            .map(|unit| unit.id)
            .collect();
        for id in targets {
            let unit = self.unit_mut(id)?;
            unit.hit_points = Some(clamp_hit_points(unit.hit_points.unwrap_or(10.0) + delta));
        }
        Ok(())
    }

    /// Recomputes every player's income from the buildings their team owns.
    pub fn relevel_income(&mut self) -> Result<()> {
        let players: Vec<(PlayerId, String)> = self
            .ledgers
            .iter()
            .map(|(id, ledger)| (*id, ledger.team.clone()))
            .collect();
        for (player, team) in players {
            let owned = self
                .buildings
                .values()
                .filter(|building| building.team.as_deref() == Some(team.as_str()))
                .count() as i64;
            let income = owned * self.funds_per_property;
            if self.ledger(player)?.income != income {
                self.ledger_mut(player)?.income = income;
            }
        }
        Ok(())
    }

    /// Compares this context with a parsed snapshot. Income and building
    /// update stamps are not part of the snapshot and are skipped. CO ids and
    /// meters are compared per slot, so a missed tag swap shows up.
    pub fn diff_against(&self, snapshot: &TurnSnapshot) -> Vec<FoldMismatch> {
        let mut mismatches = Vec::new();

        for (id, expected) in &snapshot.units {
            match self.units.get(id) {
                None => mismatches.push(FoldMismatch::MissingUnit { id: *id }),
                Some(found) if found != expected => mismatches.push(FoldMismatch::Unit {
                    id: *id,
                    expected: Box::new(expected.clone()),
                    found: Box::new(found.clone()),
                }),
                Some(_) => {}
            }
        }
        mismatches.extend(
            self.units
                .keys()
                .filter(|id| !snapshot.units.contains_key(id))
                .map(|id| FoldMismatch::UnexpectedUnit { id: *id }),
        );

        for (position, expected) in &snapshot.buildings {
            match self.buildings.get(position) {
                None => mismatches.push(FoldMismatch::MissingBuilding {
                    position: *position,
                }),
                Some(found) => {
                    let comparable = ReplayBuilding {
                        last_updated: expected.last_updated.clone(),
                        ..found.clone()
                    };
                    if &comparable != expected {
                        mismatches.push(FoldMismatch::Building {
                            position: *position,
                            expected: Box::new(expected.clone()),
                            found: Box::new(found.clone()),
                        });
                    }
                }
            }
        }
        mismatches.extend(
            self.buildings
                .keys()
                .filter(|position| !snapshot.buildings.contains_key(position))
                .map(|position| FoldMismatch::UnexpectedBuilding {
                    position: *position,
                }),
        );

        for (player, state) in &snapshot.players {
            let Some(ledger) = self.ledgers.get(player) else {
                mismatches.push(FoldMismatch::MissingPlayer { player: *player });
                continue;
            };
            if ledger.funds != state.funds {
                mismatches.push(FoldMismatch::Funds {
                    player: *player,
                    expected: state.funds,
                    found: ledger.funds,
                });
            }
            if ledger.co_id != state.co_id {
                mismatches.push(FoldMismatch::Co {
                    player: *player,
                    expected: state.co_id,
                    found: ledger.co_id,
                });
            }
            if ledger.tag_co_id != state.tag_co_id {
                mismatches.push(FoldMismatch::TagCo {
                    player: *player,
                    expected: state.tag_co_id,
                    found: ledger.tag_co_id,
                });
            }
            if ledger.power != state.co_power {
                mismatches.push(FoldMismatch::Power {
                    player: *player,
                    expected: state.co_power,
                    found: ledger.power,
                });
            }
            if ledger.tag_power != state.tag_co_power {
                mismatches.push(FoldMismatch::TagPower {
                    player: *player,
                    expected: state.tag_co_power,
                    found: ledger.tag_power,
                });
            }
            let power = self
                .active_powers
                .get(player)
                .map(|power| power.state)
                .unwrap_or_default();
            if power != state.power_state {
                mismatches.push(FoldMismatch::PowerState {
                    player: *player,
                    expected: state.power_state,
                    found: power,
                });
            }
            if ledger.eliminated != state.eliminated {
                mismatches.push(FoldMismatch::Eliminated {
                    player: *player,
                    expected: state.eliminated,
                    found: ledger.eliminated,
                });
            }
        }

        if self.cursor.active_player_id != snapshot.active_player_id {
            mismatches.push(FoldMismatch::ActivePlayer {
                expected: snapshot.active_player_id,
                found: self.cursor.active_player_id,
            });
        }
        if self.cursor.day != snapshot.day {
            mismatches.push(FoldMismatch::Day {
                expected: snapshot.day,
                found: self.cursor.day,
            });
        }
        if self.cursor.weather != snapshot.weather {
            mismatches.push(FoldMismatch::Weather {
                expected: snapshot.weather,
                found: self.cursor.weather,
            });
        }
        mismatches
    }
}

pub fn clamp_hit_points(hit_points: f64) -> f64 {
    hit_points.clamp(0.1, 10.0)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use crate::model::{MatchType, PlayerTurnState};
    use crate::types::{BuildingId, CountryId, GameId, MapId, UserId};

    use super::*;

    pub(crate) fn metadata() -> MatchMetadata {
        MatchMetadata {
            id: GameId(7),
            name: "test".to_owned(),
            password: None,
            creator: UserId(1),
            start_date: "2024-01-01".to_owned(),
            end_date: None,
            map_id: MapId(1),
            weather_type: "Clear".to_owned(),
            weather_start: None,
            win_condition: None,
            funds_per_property: 1000,
            capture_win: 21,
            fog: false,
            comment: None,
            match_type: MatchType::Normal,
            boot_interval: 90,
            starting_funds: 0,
            official: false,
            min_rating: None,
            max_rating: None,
            league: None,
            team_game: false,
            powers_allowed: true,
            timers_initial: 0,
            timers_increment: 0,
            timers_max_turn: 0,
        }
    }

    pub(crate) fn profile(id: u32, order: i64, co: u32) -> PlayerProfile {
        PlayerProfile {
            index: order as u32 - 1,
            id: PlayerId(id),
            user_id: UserId(id + 100),
            team: id.to_string(),
            country_id: CountryId(order as u32),
            order,
            co_ids: BTreeSet::from([CoId(co)]),
        }
    }

    pub(crate) fn unit(id: u32, player: u32, x: i32, y: i32) -> ReplayUnit {
        ReplayUnit {
            id: UnitId(id),
            player_id: Some(PlayerId(player)),
            name: Some("Infantry".to_owned()),
            movement_points: Some(3),
            vision: Some(2),
            fuel: Some(99),
            fuel_per_turn: Some(0),
            sub_dive: Some(false),
            ammo: Some(0),
            short_range: Some(0),
            long_range: Some(0),
            second_weapon: Some(false),
            cost: Some(1000),
            movement_type: Some("F".to_owned()),
            x: Some(x),
            y: Some(y),
            moved: Some(0),
            capture: Some(0),
            fired: Some(0),
            hit_points: Some(10.0),
            cargo: Some(Vec::new()),
            carried: Some(false),
        }
    }

    pub(crate) fn building(id: u32, x: i32, y: i32, terrain: u32, team: Option<&str>) -> ReplayBuilding {
        ReplayBuilding {
            id: BuildingId(id),
            position: Position::new(x, y),
            terrain_id: TerrainId(terrain),
            capture: 20,
            last_capture: 20,
            last_updated: None,
            team: team.map(str::to_owned),
        }
    }

    pub(crate) fn player_state(funds: i64, co: u32) -> PlayerTurnState {
        PlayerTurnState {
            funds,
            co_id: CoId(co),
            ..Default::default()
        }
    }

    /// Player 11's first turn: two players (11 and 12), two infantry, three
    /// buildings.
    pub(crate) fn snapshot() -> TurnSnapshot {
        TurnSnapshot {
            day: 1,
            active_player_id: PlayerId(11),
            active_team: "11".to_owned(),
            weather: None,
            active: true,
            activity_date: None,
            aet_interval: None,
            aet_date: None,
            players: BTreeMap::from([
                (PlayerId(11), player_state(5000, 1)),
                (PlayerId(12), player_state(3000, 17)),
            ]),
            buildings: [
                building(201, 0, 0, 42, Some("11")),
                building(202, 5, 5, 44, Some("12")),
                building(203, 2, 0, 34, None),
            ]
            .into_iter()
            .map(|b| (b.position, b))
            .collect(),
            units: [unit(301, 11, 1, 0), unit(302, 12, 4, 5)]
                .into_iter()
                .map(|u| (u.id, u))
                .collect(),
        }
    }

    pub(crate) fn players() -> Vec<PlayerProfile> {
        vec![profile(11, 1, 1), profile(12, 2, 17)]
    }

    pub(crate) fn context() -> ReplaySetupContext {
        let constants = Rc::new(GameConstants::defaults().unwrap());
        ReplaySetupContext::from_snapshot(&metadata(), &players(), &snapshot(), constants)
            .unwrap()
    }

    #[test]
    fn income_counts_owned_buildings() {
        let ctx = context();
        assert_eq!(ctx.ledger(PlayerId(11)).unwrap().income, 1000);
        assert_eq!(ctx.ledger(PlayerId(12)).unwrap().income, 1000);
    }

    #[test]
    fn record_then_rollback_restores_everything() {
        let mut ctx = context();
        let before = ctx.clone();
        let journal = ctx
            .record(|ctx| {
                ctx.unit_mut(UnitId(301))?.hit_points = Some(3.0);
                ctx.remove_unit_with_cargo(UnitId(302))?;
                ctx.replace_unit(unit(303, 11, 2, 2));
                ctx.set_funds(PlayerId(11), 0)?;
                ctx.building_mut(Position::new(2, 0))?.capture = 10;
                ctx.register_discovery("11", Position::new(5, 5), TerrainId(44));
                ctx.set_cursor(TurnCursor {
                    active_player_id: PlayerId(12),
                    day: 1,
                    weather: Some(Weather::Rain),
                });
                ctx.set_game_over(Some(GameOverState {
                    winners: vec![PlayerId(11)],
                    losers: vec![PlayerId(12)],
                    message: None,
                }));
                Ok(())
            })
            .unwrap();
        assert_ne!(ctx, before);
        ctx.rollback(journal);
        assert_eq!(ctx, before);
    }

    #[test]
    fn failed_record_leaves_no_trace() {
        let mut ctx = context();
        let before = ctx.clone();
        let err = ctx
            .record(|ctx| {
                ctx.set_funds(PlayerId(11), 0)?;
                ctx.remove_unit_with_cargo(UnitId(999))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err.kind,
            crate::ErrorKind::MissingReferencedEntity(_)
        ));
        assert_eq!(ctx, before);
    }

    #[test]
    fn removal_takes_cargo_along() {
        let mut ctx = context();
        let mut transport = unit(310, 11, 3, 3);
        transport.cargo = Some(vec![UnitId(311)]);
        let mut passenger = unit(311, 11, 3, 3);
        passenger.carried = Some(true);
        ctx.replace_unit(transport);
        ctx.replace_unit(passenger);

        let removed = ctx.remove_unit_with_cargo(UnitId(310)).unwrap();
        let ids: Vec<UnitId> = removed.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![UnitId(310), UnitId(311)]);
        assert!(ctx.unit(UnitId(311)).is_none());
    }

    #[test]
    fn area_damage_clamps_and_skips_distant_units() {
        let mut ctx = context();
        ctx.apply_area_damage(Position::new(1, 1), 2, -30.0).unwrap();
        assert_eq!(ctx.unit(UnitId(301)).unwrap().hit_points, Some(0.1));
        assert_eq!(ctx.unit(UnitId(302)).unwrap().hit_points, Some(10.0));
    }

    #[test]
    fn diff_reports_funds_and_units() {
        let mut ctx = context();
        let mut snapshot_units = ctx.units().clone();
        snapshot_units.remove(&UnitId(302));
        ctx.set_funds(PlayerId(11), 4000).unwrap();
        let snapshot = TurnSnapshot {
            day: 1,
            active_player_id: PlayerId(11),
            active_team: "11".to_owned(),
            weather: None,
            active: true,
            activity_date: None,
            aet_interval: None,
            aet_date: None,
            players: BTreeMap::from([
                (PlayerId(11), player_state(5000, 1)),
                (PlayerId(12), player_state(3000, 17)),
            ]),
            buildings: ctx.buildings().clone(),
            units: snapshot_units,
        };
        let mismatches = ctx.diff_against(&snapshot);
        assert_eq!(
            mismatches,
            vec![
                FoldMismatch::UnexpectedUnit { id: UnitId(302) },
                FoldMismatch::Funds {
                    player: PlayerId(11),
                    expected: 5000,
                    found: 4000,
                },
            ]
        );
    }

    #[test]
    fn diff_reports_co_slots_and_meters() {
        let mut ctx = context();
        let mut expected = snapshot();
        let state = expected.players.get_mut(&PlayerId(12)).unwrap();
        state.tag_co_id = Some(CoId(1));
        state.tag_co_power = Some(0);
        {
            let ledger = ctx.ledger_mut(PlayerId(12)).unwrap();
            ledger.co_id = CoId(1);
            ledger.tag_co_id = Some(CoId(17));
            ledger.power = 900;
            ledger.tag_power = Some(0);
        }

        let mismatches = ctx.diff_against(&expected);
        assert_eq!(
            mismatches,
            vec![
                FoldMismatch::Co {
                    player: PlayerId(12),
                    expected: CoId(17),
                    found: CoId(1),
                },
                FoldMismatch::TagCo {
                    player: PlayerId(12),
                    expected: Some(CoId(1)),
                    found: Some(CoId(17)),
                },
                FoldMismatch::Power {
                    player: PlayerId(12),
                    expected: 0,
                    found: 900,
                },
            ]
        );
    }
}
