use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::replay::controller::{GameOverState, PlayerLedger, ReplaySetupContext};
use crate::types::{PlayerId, Position, TerrainId, UnitId};

use super::payload::{id_field, id_list, items, opt_field, position_field, string};
use super::{ActionBuildContext, ActionFrame, ActionStep, Framed};

/// Splits players into winners and losers once the match is decided.
///
/// Winners are every member of a team that still has a living player. When
/// nobody is left standing, everyone but `just_eliminated` wins. Losers are
/// ranked by the turn they went out on, latest first, then by round order.
pub fn partition(
    ledgers: &BTreeMap<PlayerId, PlayerLedger>,
    just_eliminated: Option<PlayerId>,
) -> (Vec<PlayerId>, Vec<PlayerId>) {
    let living: BTreeSet<&str> = ledgers
        .values()
        .filter(|ledger| !ledger.eliminated)
        .map(|ledger| ledger.team.as_str())
        .collect();

    let (mut winners, mut losers): (Vec<_>, Vec<_>) = if living.is_empty() {
        ledgers
            .iter()
            .partition(|(id, _)| Some(**id) != just_eliminated)
    } else {
        ledgers
            .iter()
            .partition(|(_, ledger)| living.contains(ledger.team.as_str()))
    };

    winners.sort_by_key(|(_, ledger)| ledger.order);
    losers.sort_by_key(|(_, ledger)| (Reverse(ledger.eliminated_on_turn), ledger.order));
    (
        winners.into_iter().map(|(id, _)| *id).collect(),
        losers.into_iter().map(|(id, _)| *id).collect(),
    )
}

/// How a match ended, as logged. Lists left out are derived from the
/// ledgers when the action is applied.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GameOverData {
    pub message: Option<String>,
    pub winners: Option<Vec<PlayerId>>,
    pub losers: Option<Vec<PlayerId>>,
}

impl GameOverData {
    fn from_payload(payload: &Value) -> Result<Self> {
        Ok(GameOverData {
            message: opt_field(payload, "message")
                .map(|message| string(message, "message"))
                .transpose()?,
            winners: opt_field(payload, "winners")
                .map(|winners| id_list(winners, "winners"))
                .transpose()?,
            losers: opt_field(payload, "losers")
                .map(|losers| id_list(losers, "losers"))
                .transpose()?,
        })
    }

    fn apply(&self, ctx: &mut ReplaySetupContext, just_eliminated: Option<PlayerId>) {
        let (winners, losers) = partition(ctx.ledgers(), just_eliminated);
        let state = GameOverState {
            winners: self.winners.clone().unwrap_or(winners),
            losers: self.losers.clone().unwrap_or(losers),
            message: self.message.clone(),
        };
        debug!(winners = ?state.winners, losers = ?state.losers, "game over");
        ctx.set_game_over(Some(state));
    }
}

/// A player leaving the match, by defeat or by resigning. Also carried
/// inside captures that take a player's last property.
#[derive(Debug, Clone, Serialize)]
pub struct Elimination {
    pub player_id: PlayerId,
    pub eliminated_by: Option<PlayerId>,
    pub neutral_buildings: Vec<(Position, TerrainId)>,
    pub game_over: Option<GameOverData>,
}

impl Elimination {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let neutral_buildings = match opt_field(payload, "neutralBuildings") {
            Some(buildings) => items(buildings, "neutralBuildings")?
                .into_iter()
                .map(|building| {
                    Ok((
                        position_field(building, "buildings_x", "buildings_y")?,
                        id_field(building, "buildings_terrain_id")?,
                    ))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Elimination {
            player_id: id_field(payload, "playerId")?,
            eliminated_by: opt_field(payload, "eliminatedByPId")
                .map(|_| id_field(payload, "eliminatedByPId"))
                .transpose()?,
            neutral_buildings,
            game_over: opt_field(payload, "gameOver")
                .map(GameOverData::from_payload)
                .transpose()?,
        })
    }

    pub(crate) fn apply(&self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let player = self.player_id;
        let cursor = ctx.cursor();
        let turn_order = ctx.ledger(cursor.active_player_id)?.order;
        let ledger = ctx.ledger_mut(player)?;
        ledger.eliminated = true;
        ledger.eliminated_on_day = Some(cursor.day);
        ledger.eliminated_on_turn = Some((cursor.day, turn_order));
        let team = ledger.team.clone();
        ctx.set_active_power(player, None);

        let owned: Vec<UnitId> = ctx
            .units()
            .values()
            .filter(|unit| unit.player_id == Some(player) && !unit.is_carried())
            .map(|unit| unit.id)
            .collect();
        for id in owned {
            ctx.remove_unit_with_cargo(id)?;
        }

        for (position, terrain) in &self.neutral_buildings {
            let building = ctx.building_mut(*position)?;
            building.terrain_id = *terrain;
            building.team = None;
        }
        let team_survives = ctx
            .ledgers()
            .values()
            .any(|ledger| ledger.team == team && !ledger.eliminated);
        if !team_survives {
            let held: Vec<Position> = ctx
                .buildings()
                .values()
                .filter(|building| building.team.as_deref() == Some(team.as_str()))
                .map(|building| building.position)
                .collect();
            for position in held {
                ctx.building_mut(position)?.team = None;
            }
        }
        ctx.relevel_income()?;

        match &self.game_over {
            Some(game_over) => game_over.apply(ctx, Some(player)),
            None => {
                let living_teams: BTreeSet<&str> = ctx
                    .ledgers()
                    .values()
                    .filter(|ledger| !ledger.eliminated)
                    .map(|ledger| ledger.team.as_str())
                    .collect();
                if living_teams.len() <= 1 {
                    GameOverData::default().apply(ctx, Some(player));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EliminatedAction {
    #[serde(flatten)]
    pub elimination: Elimination,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl EliminatedAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(EliminatedAction {
            elimination: Elimination::from_payload(payload)?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for EliminatedAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for EliminatedAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let elimination = &self.elimination;
        self.frame.setup(ctx, |ctx| elimination.apply(ctx))
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Eliminated", ctx)
    }
}

/// The terminal action of a finished match.
#[derive(Debug, Clone, Serialize)]
pub struct GameOverAction {
    #[serde(flatten)]
    pub data: GameOverData,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl GameOverAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(GameOverAction {
            data: GameOverData::from_payload(payload)?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for GameOverAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for GameOverAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let data = &self.data;
        self.frame.setup(ctx, |ctx| {
            data.apply(ctx, None);
            Ok(())
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("GameOver", ctx)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::replay::actions::registry::tests::build;
    use crate::replay::actions::tests::round_trip;
    use crate::replay::controller::context::tests::context;
    use crate::types::CoId;

    use super::*;

    fn ledger(team: &str, order: i64, eliminated_on_turn: Option<(i64, i64)>) -> PlayerLedger {
        PlayerLedger {
            team: team.to_owned(),
            order,
            funds: 0,
            income: 0,
            co_id: CoId(1),
            tag_co_id: None,
            power: 0,
            tag_power: None,
            eliminated: eliminated_on_turn.is_some(),
            eliminated_on_day: eliminated_on_turn.map(|(day, _)| day),
            eliminated_on_turn,
        }
    }

    #[test]
    fn later_eliminations_rank_higher() {
        let ledgers = BTreeMap::from([
            (PlayerId(1), ledger("A", 1, None)),
            (PlayerId(2), ledger("B", 2, Some((3, 1)))),
            (PlayerId(3), ledger("C", 3, Some((7, 1)))),
            (PlayerId(4), ledger("D", 4, Some((9, 1)))),
        ]);
        let (winners, losers) = partition(&ledgers, Some(PlayerId(4)));
        assert_eq!(winners, vec![PlayerId(1)]);
        assert_eq!(losers, vec![PlayerId(4), PlayerId(3), PlayerId(2)]);
    }

    #[test]
    fn same_day_eliminations_rank_by_turn() {
        let ledgers = BTreeMap::from([
            (PlayerId(1), ledger("A", 1, None)),
            (PlayerId(2), ledger("B", 2, Some((3, 1)))),
            (PlayerId(3), ledger("C", 3, Some((7, 1)))),
            (PlayerId(4), ledger("D", 4, Some((7, 4)))),
        ]);
        let (winners, losers) = partition(&ledgers, Some(PlayerId(4)));
        assert_eq!(winners, vec![PlayerId(1)]);
        assert_eq!(losers, vec![PlayerId(4), PlayerId(3), PlayerId(2)]);
    }

    #[test]
    fn teammates_of_a_survivor_win() {
        let ledgers = BTreeMap::from([
            (PlayerId(1), ledger("A", 1, Some((2, 2)))),
            (PlayerId(2), ledger("A", 2, None)),
            (PlayerId(3), ledger("B", 3, Some((4, 1)))),
        ]);
        let (winners, losers) = partition(&ledgers, Some(PlayerId(3)));
        assert_eq!(winners, vec![PlayerId(1), PlayerId(2)]);
        assert_eq!(losers, vec![PlayerId(3)]);
    }

    #[test]
    fn nobody_left_means_all_but_the_last_win() {
        let ledgers = BTreeMap::from([
            (PlayerId(1), ledger("A", 1, Some((5, 1)))),
            (PlayerId(2), ledger("B", 2, Some((5, 1)))),
        ]);
        let (winners, losers) = partition(&ledgers, Some(PlayerId(2)));
        assert_eq!(winners, vec![PlayerId(1)]);
        assert_eq!(losers, vec![PlayerId(2)]);
    }

    #[test]
    fn elimination_cascades_into_game_over() {
        let mut ctx = context();
        let mut action = build(&json!({
            "action": "Eliminated",
            "playerId": 12,
            "eliminatedByPId": 11,
        }))
        .unwrap();
        round_trip(&mut ctx, &mut action, |ctx| {
            let ledger = ctx.ledger(PlayerId(12)).unwrap();
            assert!(ledger.eliminated);
            assert_eq!(ledger.eliminated_on_day, Some(1));
            assert_eq!(ledger.eliminated_on_turn, Some((1, 1)));
            assert!(ctx.unit(UnitId(302)).is_none());
            assert_eq!(ctx.building(Position::new(5, 5)).unwrap().team, None);
            let over = ctx.game_over().unwrap();
            assert_eq!(over.winners, vec![PlayerId(11)]);
            assert_eq!(over.losers, vec![PlayerId(12)]);
        });
    }

    #[test]
    fn explicit_game_over_wins_over_derivation() {
        let mut ctx = context();
        let mut action = build(&json!({
            "action": "Resign",
            "playerId": 11,
            "gameOver": {"message": "P11 resigned", "winners": [12], "losers": [11]},
        }))
        .unwrap();
        round_trip(&mut ctx, &mut action, |ctx| {
            let over = ctx.game_over().unwrap();
            assert_eq!(over.message.as_deref(), Some("P11 resigned"));
            assert_eq!(over.winners, vec![PlayerId(12)]);
        });
    }

    #[test]
    fn game_over_records_result() {
        let mut ctx = context();
        let mut action = build(&json!({"action": "GameOver", "message": "draw"})).unwrap();
        round_trip(&mut ctx, &mut action, |ctx| {
            let over = ctx.game_over().unwrap();
            assert_eq!(over.message.as_deref(), Some("draw"));
            assert_eq!(over.winners, vec![PlayerId(11), PlayerId(12)]);
            assert!(over.losers.is_empty());
        });
    }
}
