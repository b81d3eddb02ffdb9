use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{Level, debug, span, warn};

use crate::Rc;
use crate::error::{Error, Result};
use crate::game_constants::GameConstants;
use crate::model::{
    MatchMetadata, PlayerProfile, ReplayBuilding, ReplayData, ReplayUnit, TurnSnapshot,
};
use crate::replay::actions::{ActionStep, ReplayAction};
use crate::types::{PlayerId, Position, UnitId};

use super::context::{
    ActivePower, FoldMismatch, GameOverState, PlayerLedger, ReplaySetupContext, TurnCursor,
};
use super::listener::ReplayControllerState;

/// Where the controller stands: `action` actions of turn `turn` are applied.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ReplayPosition {
    pub turn: usize,
    pub action: usize,
}

impl ReplayPosition {
    pub fn new(turn: usize, action: usize) -> Self {
        ReplayPosition { turn, action }
    }
}

/// Walks a parsed replay forwards and backwards.
///
/// Stepping folds actions one at a time onto a [`ReplaySetupContext`] and
/// undoes them in reverse. Seeking jumps to the snapshot that starts the
/// target turn and replays from there, so it never depends on how the
/// controller got to where it is.
pub struct ReplayController {
    data: ReplayData,
    constants: Rc<GameConstants>,
    actions: Vec<Vec<ReplayAction>>,
    context: ReplaySetupContext,
    position: ReplayPosition,
}

impl ReplayController {
    pub fn new(data: ReplayData, constants: Rc<GameConstants>) -> Result<Self> {
        let first = data
            .turns
            .first()
            .ok_or_else(|| Error::missing("turn 0"))?;
        let context = ReplaySetupContext::from_snapshot(
            &data.metadata,
            &data.players,
            &first.snapshot,
            Rc::clone(&constants),
        )?;
        let actions = pristine_actions(&data);
        Ok(ReplayController {
            data,
            constants,
            actions,
            context,
            position: ReplayPosition::default(),
        })
    }

    pub fn data(&self) -> &ReplayData {
        &self.data
    }

    pub fn context(&self) -> &ReplaySetupContext {
        &self.context
    }

    pub fn turn_count(&self) -> usize {
        self.actions.len()
    }

    pub fn actions(&self, turn: usize) -> Option<&[ReplayAction]> {
        self.actions.get(turn).map(Vec::as_slice)
    }

    fn turn_len(&self, turn: usize) -> usize {
        self.actions.get(turn).map_or(0, Vec::len)
    }

    /// Applies the next action, moving into the following turn when the
    /// current one is exhausted. Returns `false` at the end of the replay.
    pub fn step_forward(&mut self) -> Result<bool> {
        let ReplayPosition { mut turn, mut action } = self.position;
        while action >= self.turn_len(turn) {
            if turn + 1 >= self.actions.len() {
                return Ok(false);
            }
            turn += 1;
            action = 0;
            self.position = ReplayPosition::new(turn, action);
        }

        self.actions[turn][action]
            .setup(&mut self.context)
            .map_err(|e| e.with_turn(turn).with_action(action).with_match(self.data.metadata.id))?;
        self.position = ReplayPosition::new(turn, action + 1);
        Ok(true)
    }

    /// Undoes the last applied action, moving into the previous turn when
    /// the current one has nothing applied. Returns `false` at the start.
    pub fn step_back(&mut self) -> Result<bool> {
        let ReplayPosition { mut turn, mut action } = self.position;
        while action == 0 {
            if turn == 0 {
                return Ok(false);
            }
            turn -= 1;
            action = self.turn_len(turn);
            if folded_through(&self.actions[turn][..action]) {
                self.position = ReplayPosition::new(turn, action);
            } else {
                // Reached this turn by seeking, so its actions were never applied.
                self.seek(turn, action)?;
            }
        }

        self.actions[turn][action - 1]
            .undo(&mut self.context)
            .map_err(|e| e.with_turn(turn).with_action(action - 1).with_match(self.data.metadata.id))?;
        self.position = ReplayPosition::new(turn, action - 1);
        Ok(true)
    }

    /// Resets to the snapshot at the start of `turn` and applies its first
    /// `action` actions.
    pub fn seek(&mut self, turn: usize, action: usize) -> Result<()> {
        let span = span!(Level::DEBUG, "seek", turn, action);
        let _enter = span.enter();

        let snapshot = self
            .data
            .snapshot(turn)
            .ok_or_else(|| Error::missing(format!("turn {turn}")))?;
        if action > self.turn_len(turn) {
            return Err(Error::missing(format!("action {action} of turn {turn}")));
        }

        self.context = ReplaySetupContext::from_snapshot(
            &self.data.metadata,
            &self.data.players,
            snapshot,
            Rc::clone(&self.constants),
        )?;
        self.actions = pristine_actions(&self.data);
        self.position = ReplayPosition::new(turn, 0);
        for index in 0..action {
            self.actions[turn][index]
                .setup(&mut self.context)
                .map_err(|e| e.with_turn(turn).with_action(index).with_match(self.data.metadata.id))?;
            self.position.action = index + 1;
        }
        debug!("seek complete");
        Ok(())
    }

    /// Folds every action of `turn` from its snapshot and compares the
    /// result with the snapshot of the next turn. The controller is left at
    /// the end of `turn`.
    pub fn verify_turn_fold(&mut self, turn: usize) -> Result<Vec<FoldMismatch>> {
        let next = turn + 1;
        if self.data.snapshot(next).is_none() {
            return Err(Error::missing(format!("snapshot after turn {turn}")));
        }
        self.seek(turn, self.turn_len(turn))?;
        let expected: &TurnSnapshot = &self.data.turns[next].snapshot;
        let mismatches = self.context.diff_against(expected);
        if !mismatches.is_empty() {
            warn!(turn, count = mismatches.len(), "fold disagrees with next snapshot");
        }
        Ok(mismatches)
    }

    /// Runs [`verify_turn_fold`](Self::verify_turn_fold) on every turn that
    /// has a successor, keyed by turn index. Turns that fold cleanly are
    /// left out.
    pub fn verify_all(&mut self) -> Result<BTreeMap<usize, Vec<FoldMismatch>>> {
        let mut report = BTreeMap::new();
        for turn in 0..self.actions.len().saturating_sub(1) {
            let mismatches = self.verify_turn_fold(turn)?;
            if !mismatches.is_empty() {
                report.insert(turn, mismatches);
            }
        }
        Ok(report)
    }
}

fn pristine_actions(data: &ReplayData) -> Vec<Vec<ReplayAction>> {
    data.turns.iter().map(|turn| turn.actions.clone()).collect()
}

/// Whether `actions` were all applied by stepping. Placeholders carry no
/// state, so the last real action decides.
fn folded_through(actions: &[ReplayAction]) -> bool {
    match actions
        .iter()
        .rev()
        .find(|action| !matches!(action, ReplayAction::Empty))
    {
        Some(last) => last.is_applied(),
        None => actions.is_empty(),
    }
}

impl ReplayControllerState for ReplayController {
    fn position(&self) -> ReplayPosition {
        self.position
    }

    fn metadata(&self) -> &MatchMetadata {
        &self.data.metadata
    }

    fn players(&self) -> &[PlayerProfile] {
        &self.data.players
    }

    fn units(&self) -> &BTreeMap<UnitId, ReplayUnit> {
        self.context.units()
    }

    fn buildings(&self) -> &BTreeMap<Position, ReplayBuilding> {
        self.context.buildings()
    }

    fn ledgers(&self) -> &BTreeMap<PlayerId, PlayerLedger> {
        self.context.ledgers()
    }

    fn active_powers(&self) -> &BTreeMap<PlayerId, ActivePower> {
        self.context.active_powers()
    }

    fn cursor(&self) -> TurnCursor {
        self.context.cursor()
    }

    fn game_over(&self) -> Option<&GameOverState> {
        self.context.game_over()
    }

    fn last_action(&self) -> Option<&ReplayAction> {
        let ReplayPosition { turn, action } = self.position;
        action
            .checked_sub(1)
            .and_then(|index| self.actions.get(turn)?.get(index))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kinded::Kinded;
    use serde_json::json;

    use crate::model::TurnData;
    use crate::replay::actions::{ActionRegistry, ReplayActionKind};
    use crate::replay::controller::context::tests::{metadata, player_state, players, snapshot};

    use super::*;

    /// Player 11 moves an infantry and hands over to player 12.
    fn replay() -> ReplayData {
        let first = snapshot();
        let mut second = snapshot();
        second.active_player_id = PlayerId(12);
        second.active_team = "12".to_owned();
        second.players = BTreeMap::from([
            (PlayerId(11), player_state(5000, 1)),
            (PlayerId(12), player_state(4000, 17)),
        ]);
        if let Some(unit) = second.units.get_mut(&UnitId(301)) {
            unit.set_position(Position::new(2, 0));
        }

        let payloads = vec![
            json!({
                "action": "Move",
                "unit": {"global": {"units_id": 301, "units_x": 2, "units_y": 0, "units_moved": 1}},
                "paths": {"global": [{"x": 1, "y": 0}, {"x": 2, "y": 0}]},
                "dist": 1,
            }),
            json!([]),
            json!({
                "action": "End",
                "updatedInfo": {"nextPId": 12, "day": 1, "nextFunds": {"global": 4000}},
            }),
        ];
        let registry = ActionRegistry::default();
        let metadata = metadata();
        let players = players();
        let actions = registry
            .build_turn(&metadata, &players, &first, &payloads)
            .unwrap();

        ReplayData {
            metadata,
            players,
            turns: vec![
                TurnData {
                    snapshot: first,
                    actions,
                },
                TurnData {
                    snapshot: second,
                    actions: Vec::new(),
                },
            ],
            anomalies: Vec::new(),
        }
    }

    fn controller() -> ReplayController {
        let constants = Rc::new(GameConstants::defaults().unwrap());
        ReplayController::new(replay(), constants).unwrap()
    }

    #[test]
    fn steps_forward_to_the_end_and_back() {
        let mut controller = controller();
        let start = controller.context().clone();

        let mut steps = 0;
        while controller.step_forward().unwrap() {
            steps += 1;
        }
        assert_eq!(steps, 3);
        assert_eq!(controller.position(), ReplayPosition::new(1, 0));
        assert_eq!(controller.cursor().active_player_id, PlayerId(12));

        while controller.step_back().unwrap() {}
        assert_eq!(controller.position(), ReplayPosition::new(0, 0));
        assert_eq!(controller.context(), &start);
    }

    #[test]
    fn seek_matches_stepping() {
        let mut stepped = controller();
        stepped.step_forward().unwrap();
        stepped.step_forward().unwrap();

        let mut sought = controller();
        sought.seek(0, 2).unwrap();
        assert_eq!(sought.context(), stepped.context());
        assert_eq!(sought.position(), stepped.position());
        assert_eq!(
            sought.last_action().map(Kinded::kind),
            Some(ReplayActionKind::Empty)
        );
    }

    #[test]
    fn step_back_after_seeking_into_a_later_turn() {
        let mut controller = controller();
        controller.seek(1, 0).unwrap();
        assert!(controller.step_back().unwrap());
        assert_eq!(controller.position(), ReplayPosition::new(0, 2));
        assert_eq!(controller.cursor().active_player_id, PlayerId(11));
    }

    #[test]
    fn fold_matches_next_snapshot() {
        let mut controller = controller();
        assert_eq!(controller.verify_turn_fold(0).unwrap(), Vec::new());
        assert!(controller.verify_all().unwrap().is_empty());
        assert!(controller.verify_turn_fold(1).is_err());
    }

    #[test]
    fn fold_reports_drift() {
        let mut data = replay();
        data.turns[1]
            .snapshot
            .players
            .get_mut(&PlayerId(12))
            .unwrap()
            .funds = 9999;
        let mut controller =
            ReplayController::new(data, Rc::new(GameConstants::defaults().unwrap())).unwrap();
        let mismatches = controller.verify_turn_fold(0).unwrap();
        assert_eq!(
            mismatches,
            vec![FoldMismatch::Funds {
                player: PlayerId(12),
                expected: 9999,
                found: 4000,
            }]
        );
    }

    #[test]
    fn trailing_placeholder_does_not_force_a_seek() {
        let mut controller = controller();
        while controller.step_forward().unwrap() {}

        let mut applied = controller.actions(0).unwrap().to_vec();
        applied.push(ReplayAction::Empty);
        assert!(folded_through(&applied));

        let mut pristine = pristine_actions(controller.data()).remove(0);
        pristine.push(ReplayAction::Empty);
        assert!(!folded_through(&pristine));
        assert!(folded_through(&[]));
        assert!(!folded_through(&[ReplayAction::Empty]));
    }

    #[test]
    fn seek_out_of_range_is_rejected() {
        let mut controller = controller();
        assert!(controller.seek(0, 4).is_err());
        assert!(controller.seek(5, 0).is_err());
    }
}
