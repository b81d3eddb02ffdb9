use std::collections::HashMap;

use serde_json::Value;
use tracing::{Level, span, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::model::{MatchMetadata, PlayerProfile, TurnSnapshot};
use crate::replay::scope;
use crate::types::PlayerId;

use super::payload::{field, opt_field, string};
use super::{
    AttackAction, BuildUnitAction, CaptureAction, DeleteUnitAction, EliminatedAction,
    EndTurnAction, ExplodeAction, GameOverAction, HideAction, JoinAction, LaunchAction,
    LoadAction, MoveUnitAction, PowerAction, RepairAction, ReplayAction, SupplyAction, TagAction,
    UnhideAction, UnloadAction,
};

const KEY_ACTION: &str = "action";
const KEY_NESTED_MOVE: &str = "Move";

/// Builds one action variant from its payload.
pub type ActionBuilder = fn(&ActionBuildContext<'_>, &Value) -> Result<ReplayAction>;

/// What a builder may consult while turning a payload into an action.
pub struct ActionBuildContext<'a> {
    pub registry: &'a ActionRegistry,
    pub metadata: &'a MatchMetadata,
    pub players: &'a [PlayerProfile],
    pub turn: &'a TurnSnapshot,
}

impl<'a> ActionBuildContext<'a> {
    /// The player whose turn the action belongs to.
    pub fn actor(&self) -> PlayerId {
        self.turn.active_player_id
    }

    /// Team scope only exists in team games; elsewhere the team name is just
    /// the player's own id.
    pub fn scope_team(&self) -> Option<&'a str> {
        self.metadata
            .team_game
            .then_some(self.turn.active_team.as_str())
    }

    pub fn resolve<'v>(&self, node: &'v Value) -> Result<&'v Value> {
        scope::resolve(node, self.scope_team(), self.actor())
    }

    /// Required viewer-scoped field.
    pub fn scoped<'v>(&self, payload: &'v Value, key: &str) -> Result<&'v Value> {
        self.resolve(field(payload, key)?)
    }

    /// Optional viewer-scoped field. When the field is present its scoped
    /// value must be too.
    pub fn opt_scoped<'v>(&self, payload: &'v Value, key: &str) -> Result<Option<&'v Value>> {
        opt_field(payload, key)
            .map(|node| self.resolve(node))
            .transpose()
            .map(|value| value.filter(|value| !value.is_null()))
    }

    pub fn profile(&self, id: PlayerId) -> Result<&'a PlayerProfile> {
        self.players
            .iter()
            .find(|profile| profile.id == id)
            .ok_or_else(|| Error::missing(format!("player {id}")))
    }

    /// Builds the `Move` sub-payload, if there is one.
    pub fn nested_move(&self, payload: &Value) -> Result<Option<Box<MoveUnitAction>>> {
        let Some(nested) = opt_field(payload, KEY_NESTED_MOVE) else {
            return Ok(None);
        };
        match self.registry.build(self, nested)? {
            ReplayAction::Move(action) => Ok(Some(Box::new(action))),
            ReplayAction::Empty => Ok(None),
            other => Err(Error::malformed(format!(
                "nested Move payload built a {:?} action",
                kinded::Kinded::kind(&other)
            ))),
        }
    }
}

/// Maps payload discriminators to builders.
pub struct ActionRegistry {
    builders: HashMap<&'static str, ActionBuilder>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        let mut registry = ActionRegistry {
            builders: HashMap::new(),
        };
        registry.register("Move", |ctx, p| {
            MoveUnitAction::from_payload(ctx, p).map(ReplayAction::Move)
        });
        registry.register("Capt", |ctx, p| {
            CaptureAction::from_payload(ctx, p).map(ReplayAction::Capture)
        });
        registry.register("Fire", |ctx, p| {
            AttackAction::from_payload(ctx, p).map(ReplayAction::Attack)
        });
        registry.register("Build", |ctx, p| {
            BuildUnitAction::from_payload(ctx, p).map(ReplayAction::Build)
        });
        registry.register("Delete", |ctx, p| {
            DeleteUnitAction::from_payload(ctx, p).map(ReplayAction::Delete)
        });
        registry.register("Supply", |ctx, p| {
            SupplyAction::from_payload(ctx, p).map(ReplayAction::Supply)
        });
        registry.register("Repair", |ctx, p| {
            RepairAction::from_payload(ctx, p).map(ReplayAction::Repair)
        });
        registry.register("Join", |ctx, p| {
            JoinAction::from_payload(ctx, p).map(ReplayAction::Join)
        });
        registry.register("Load", |ctx, p| {
            LoadAction::from_payload(ctx, p).map(ReplayAction::Load)
        });
        registry.register("Unload", |ctx, p| {
            UnloadAction::from_payload(ctx, p).map(ReplayAction::Unload)
        });
        registry.register("Hide", |ctx, p| {
            HideAction::from_payload(ctx, p).map(ReplayAction::Hide)
        });
        registry.register("Unhide", |ctx, p| {
            UnhideAction::from_payload(ctx, p).map(ReplayAction::Unhide)
        });
        registry.register("Launch", |ctx, p| {
            LaunchAction::from_payload(ctx, p).map(ReplayAction::Launch)
        });
        registry.register("Explode", |ctx, p| {
            ExplodeAction::from_payload(ctx, p).map(ReplayAction::Explode)
        });
        registry.register("Power", |ctx, p| {
            PowerAction::from_payload(ctx, p).map(ReplayAction::Power)
        });
        registry.register("End", |ctx, p| {
            EndTurnAction::from_payload(ctx, p).map(ReplayAction::EndTurn)
        });
        registry.register("Tag", |ctx, p| {
            TagAction::from_payload(ctx, p).map(ReplayAction::Tag)
        });
        registry.register("Eliminated", |ctx, p| {
            EliminatedAction::from_payload(ctx, p).map(ReplayAction::Eliminated)
        });
        registry.register("Resign", |ctx, p| {
            EliminatedAction::from_payload(ctx, p).map(ReplayAction::Eliminated)
        });
        registry.register("GameOver", |ctx, p| {
            GameOverAction::from_payload(ctx, p).map(ReplayAction::GameOver)
        });
        registry
    }
}

impl ActionRegistry {
    /// Adds or replaces the builder for `discriminator`, returning the one it
    /// displaced.
    pub fn register(
        &mut self,
        discriminator: &'static str,
        builder: ActionBuilder,
    ) -> Option<ActionBuilder> {
        self.builders.insert(discriminator, builder)
    }

    pub fn contains(&self, discriminator: &str) -> bool {
        self.builders.contains_key(discriminator)
    }

    pub fn build(&self, ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<ReplayAction> {
        if payload.as_array().is_some_and(|items| items.is_empty()) {
            return Ok(ReplayAction::Empty);
        }
        let discriminator = payload
            .get(KEY_ACTION)
            .map(|value| string(value, KEY_ACTION))
            .transpose()?
            .ok_or_else(|| ErrorKind::UnknownActionType("<missing>".to_owned()))?;
        let builder = self
            .builders
            .get(discriminator.as_str())
            .ok_or_else(|| ErrorKind::UnknownActionType(discriminator.clone()))?;
        trace!(action = %discriminator, "building action");
        builder(ctx, payload)
    }

    /// Builds one turn's actions, tagging errors with the action index.
    pub fn build_turn(
        &self,
        metadata: &MatchMetadata,
        players: &[PlayerProfile],
        turn: &TurnSnapshot,
        payloads: &[Value],
    ) -> Result<Vec<ReplayAction>> {
        let span = span!(Level::TRACE, "build_turn", actions = payloads.len());
        let _enter = span.enter();

        let ctx = ActionBuildContext {
            registry: self,
            metadata,
            players,
            turn,
        };
        payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| {
                self.build(&ctx, payload)
                    .map_err(|e| e.with_action(index))
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use kinded::Kinded;
    use serde_json::json;

    use crate::replay::actions::ReplayActionKind;
    use crate::replay::controller::context::tests::{metadata, profile};

    use super::*;

    pub(crate) fn turn() -> TurnSnapshot {
        TurnSnapshot {
            day: 1,
            active_player_id: PlayerId(11),
            active_team: "11".to_owned(),
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

    /// Builds `payload` as if it were logged during player 11's first turn.
    pub(crate) fn build(payload: &Value) -> Result<ReplayAction> {
        let registry = ActionRegistry::default();
        let metadata = metadata();
        let players = [profile(11, 1, 1), profile(12, 2, 17)];
        let turn = turn();
        registry.build_turn(&metadata, &players, &turn, std::slice::from_ref(payload))
            .map(|mut actions| actions.remove(0))
    }

    #[test]
    fn placeholder_is_empty() {
        assert_eq!(build(&json!([])).unwrap().kind(), ReplayActionKind::Empty);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let err = build(&json!({"action": "Dance"})).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnknownActionType(ref name) if name == "Dance"));
        assert_eq!(err.location.action, Some(0));
    }

    #[test]
    fn missing_discriminator_is_rejected() {
        let err = build(&json!({"unitId": {"global": 1}})).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnknownActionType(_)));
    }

    #[test]
    fn resign_builds_an_elimination() {
        let action = build(&json!({"action": "Resign", "playerId": 12})).unwrap();
        assert_eq!(action.kind(), ReplayActionKind::Eliminated);
    }

    #[test]
    fn nested_move_must_be_a_move() {
        let err = build(&json!({
            "action": "Delete",
            "Move": {"action": "Delete", "unitId": {"global": 1}},
            "unitId": {"global": 1},
        }))
        .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MalformedRecord { .. }));
    }
}
