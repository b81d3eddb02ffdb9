//! The closed set of replay actions and their fold contract.

pub mod combat;
pub mod game_end;
pub mod logistics;
pub mod movement;
pub mod payload;
pub mod power;
pub mod registry;
pub mod turn;

use kinded::Kinded;
use serde::Serialize;
use tracing::trace;
use variantly::Variantly;

use crate::error::{ErrorKind, Result};
use crate::replay::controller::{Journal, ReplaySetupContext};

pub use combat::{AttackAction, ExplodeAction, LaunchAction};
pub use game_end::{EliminatedAction, GameOverAction};
pub use logistics::{
    BuildUnitAction, CaptureAction, DeleteUnitAction, JoinAction, RepairAction, SupplyAction,
};
pub use movement::{HideAction, LoadAction, MoveUnitAction, PathNode, UnhideAction, UnloadAction};
pub use power::PowerAction;
pub use registry::{ActionBuildContext, ActionBuilder, ActionRegistry};
pub use turn::{EndTurnAction, TagAction, TurnUpdate};

/// Forward and backward application of one action.
///
/// `setup` moves the context to its post-action state and remembers what it
/// overwrote; `undo` puts those values back. Calls must nest like a stack:
/// only the most recent setup may be undone next.
pub trait ActionStep {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()>;
    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()>;
}

/// The optional nested move every action may carry, plus the journal of its
/// own last setup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionFrame {
    #[serde(rename = "move", skip_serializing_if = "Option::is_none")]
    pub move_action: Option<Box<MoveUnitAction>>,
    #[serde(skip)]
    journal: Option<Journal>,
}

impl ActionFrame {
    pub fn new(move_action: Option<Box<MoveUnitAction>>) -> Self {
        ActionFrame {
            move_action,
            journal: None,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.journal.is_some()
    }

    pub(crate) fn set_journal(&mut self, journal: Journal) {
        self.journal = Some(journal);
    }

    /// True when the nested move actually displaced its unit.
    pub fn move_relocates(&self) -> bool {
        self.move_action
            .as_ref()
            .is_some_and(|action| action.relocates())
    }

    /// Runs the nested move, then `apply` under a journal. If `apply` fails
    /// the move is undone again so the context is left untouched.
    pub fn setup<F>(&mut self, ctx: &mut ReplaySetupContext, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ReplaySetupContext) -> Result<()>,
    {
        if let Some(action) = self.move_action.as_deref_mut() {
            action.setup(ctx)?;
        }
        match ctx.record(apply) {
            Ok(journal) => {
                self.journal = Some(journal);
                Ok(())
            }
            Err(e) => {
                if let Some(action) = self.move_action.as_deref_mut() {
                    action.undo(ctx)?;
                }
                Err(e)
            }
        }
    }

    pub fn undo(&mut self, action: &'static str, ctx: &mut ReplaySetupContext) -> Result<()> {
        let journal = self
            .journal
            .take()
            .ok_or(ErrorKind::UndoWithoutSetup { action })?;
        ctx.rollback(journal);
        if let Some(nested) = self.move_action.as_deref_mut() {
            nested.undo(ctx)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Kinded, Variantly)]
#[kinded(derive(Serialize))]
#[serde(tag = "type")]
pub enum ReplayAction {
    #[variantly(rename = "unit_move")]
    Move(MoveUnitAction),
    Capture(CaptureAction),
    Attack(AttackAction),
    Build(BuildUnitAction),
    Delete(DeleteUnitAction),
    Supply(SupplyAction),
    Repair(RepairAction),
    Join(JoinAction),
    Load(LoadAction),
    Unload(UnloadAction),
    Hide(HideAction),
    Unhide(UnhideAction),
    Launch(LaunchAction),
    Explode(ExplodeAction),
    Power(PowerAction),
    EndTurn(EndTurnAction),
    Tag(TagAction),
    Eliminated(EliminatedAction),
    GameOver(GameOverAction),
    /// Placeholder entry in the log, folds to nothing
    Empty,
}

macro_rules! dispatch {
    ($self:ident, $action:ident => $body:expr, empty => $empty:expr) => {
        match $self {
            ReplayAction::Move($action) => $body,
            ReplayAction::Capture($action) => $body,
            ReplayAction::Attack($action) => $body,
            ReplayAction::Build($action) => $body,
            ReplayAction::Delete($action) => $body,
            ReplayAction::Supply($action) => $body,
            ReplayAction::Repair($action) => $body,
            ReplayAction::Join($action) => $body,
            ReplayAction::Load($action) => $body,
            ReplayAction::Unload($action) => $body,
            ReplayAction::Hide($action) => $body,
            ReplayAction::Unhide($action) => $body,
            ReplayAction::Launch($action) => $body,
            ReplayAction::Explode($action) => $body,
            ReplayAction::Power($action) => $body,
            ReplayAction::EndTurn($action) => $body,
            ReplayAction::Tag($action) => $body,
            ReplayAction::Eliminated($action) => $body,
            ReplayAction::GameOver($action) => $body,
            ReplayAction::Empty => $empty,
        }
    };
}

impl ReplayAction {
    /// The end-turn update carried by `EndTurn` and `Tag`.
    pub fn turn_update(&self) -> Option<&TurnUpdate> {
        match self {
            ReplayAction::EndTurn(action) => Some(&action.update),
            ReplayAction::Tag(action) => Some(&action.update),
            _ => None,
        }
    }

    pub fn ends_turn(&self) -> bool {
        self.turn_update().is_some()
    }

    pub fn nested_move(&self) -> Option<&MoveUnitAction> {
        dispatch!(self, action => action.frame().move_action.as_deref(), empty => None)
    }

    pub fn is_applied(&self) -> bool {
        dispatch!(self, action => action.frame().is_applied(), empty => false)
    }
}

/// Implemented by every variant payload so the enum can reach the frame.
pub(crate) trait Framed {
    fn frame(&self) -> &ActionFrame;
}

impl ActionStep for ReplayAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        trace!(kind = ?self.kind(), "setup");
        dispatch!(self, action => action.setup(ctx), empty => Ok(()))
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        trace!(kind = ?self.kind(), "undo");
        dispatch!(self, action => action.undo(ctx), empty => Ok(()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::replay::controller::ReplaySetupContext;

    use super::*;

    /// Sets `action` up, checks `after`, undoes it and requires the context
    /// to be back where it started.
    pub(crate) fn round_trip(
        ctx: &mut ReplaySetupContext,
        action: &mut ReplayAction,
        after: impl FnOnce(&ReplaySetupContext),
    ) {
        let before = ctx.clone();
        action.setup(ctx).unwrap();
        after(ctx);
        action.undo(ctx).unwrap();
        assert_eq!(*ctx, before);
    }

    #[test]
    fn undo_without_setup_is_an_error() {
        let mut ctx = crate::replay::controller::context::tests::context();
        let mut action = ReplayAction::Delete(DeleteUnitAction::new(
            crate::types::UnitId(301),
            None,
        ));
        let err = action.undo(&mut ctx).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::UndoWithoutSetup { action: "Delete" }
        ));
    }

    #[test]
    fn empty_folds_to_nothing() {
        let mut ctx = crate::replay::controller::context::tests::context();
        let mut action = ReplayAction::Empty;
        round_trip(&mut ctx, &mut action, |_| {});
        assert_eq!(action.kind(), ReplayActionKind::Empty);
    }
}
