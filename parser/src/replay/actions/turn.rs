use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::model::{ReplayUnit, Weather};
use crate::replay::controller::{ReplaySetupContext, TurnCursor};
use crate::types::{PlayerId, UnitId};

use super::combat::settle;
use super::logistics::resupply_all;
use super::payload::{code, field, id_field, id_list, int, int_field, items, opt_field, unit_patch};
use super::{ActionBuildContext, ActionFrame, ActionStep, Framed};

/// The hand-over to the next player, shared by `End` and `Tag`.
#[derive(Debug, Clone, Serialize)]
pub struct TurnUpdate {
    pub next_player: PlayerId,
    pub day: i64,
    pub next_weather: Option<Weather>,
    pub next_funds: i64,
    pub supplied: Vec<UnitId>,
    pub repaired: Vec<ReplayUnit>,
    pub unit_updates: Vec<ReplayUnit>,
    /// Logged at the head of the next player's turn instead of at the end
    /// of the turn it closes
    pub misplaced: bool,
}

impl TurnUpdate {
    fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        let info = field(payload, "updatedInfo")?;
        let patches = |key: &str| -> Result<Vec<ReplayUnit>> {
            match ctx.opt_scoped(info, key)? {
                Some(units) => items(units, key)?.into_iter().map(unit_patch).collect(),
                None => Ok(Vec::new()),
            }
        };
        let next_player: PlayerId = id_field(info, "nextPId")?;
        Ok(TurnUpdate {
            next_player,
            day: int_field(info, "day")?,
            next_weather: opt_field(info, "nextWeather")
                .map(|weather| code(weather, "nextWeather"))
                .transpose()?,
            next_funds: int(ctx.scoped(info, "nextFunds")?, "nextFunds")?,
            supplied: match ctx.opt_scoped(info, "supplied")? {
                Some(ids) => id_list(ids, "supplied")?,
                None => Vec::new(),
            },
            repaired: patches("repaired")?,
            unit_updates: patches("unitUpdates")?,
            misplaced: next_player == ctx.actor(),
        })
    }

    fn apply(&self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let cursor = ctx.cursor();
        let ending = cursor.active_player_id;
        debug!(from = %ending, to = %self.next_player, day = self.day, "turn ends");

        let idle: Vec<UnitId> = ctx
            .units()
            .values()
            .filter(|unit| unit.player_id == Some(ending))
            .filter(|unit| unit.moved.unwrap_or(0) != 0 || unit.fired.unwrap_or(0) != 0)
            .map(|unit| unit.id)
            .collect();
        for id in idle {
            let unit = ctx.unit_mut(id)?;
            unit.moved = Some(0);
            unit.fired = Some(0);
        }

        ctx.set_funds(self.next_player, self.next_funds)?;
        if ctx.active_powers().contains_key(&self.next_player) {
            ctx.set_active_power(self.next_player, None);
        }

        resupply_all(ctx, &self.supplied)?;
        for patch in self.repaired.iter().chain(&self.unit_updates) {
            settle(ctx, patch)?;
        }

        ctx.set_cursor(TurnCursor {
            active_player_id: self.next_player,
            day: self.day,
            weather: self.next_weather.or(cursor.weather),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndTurnAction {
    #[serde(flatten)]
    pub update: TurnUpdate,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl EndTurnAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(EndTurnAction {
            update: TurnUpdate::from_payload(ctx, payload)?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for EndTurnAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for EndTurnAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let update = &self.update;
        self.frame.setup(ctx, |ctx| update.apply(ctx))
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("EndTurn", ctx)
    }
}

/// End of turn in a tag match: the player's two COs trade places.
#[derive(Debug, Clone, Serialize)]
pub struct TagAction {
    #[serde(flatten)]
    pub update: TurnUpdate,
    pub tag_player: PlayerId,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl TagAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(TagAction {
            update: TurnUpdate::from_payload(ctx, payload)?,
            tag_player: id_field(field(payload, "tagCo")?, "playerId")?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for TagAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for TagAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let (update, player) = (&self.update, self.tag_player);
        self.frame.setup(ctx, |ctx| {
            let ledger = ctx.ledger_mut(player)?;
            if let Some(tag_co) = ledger.tag_co_id {
                ledger.tag_co_id = Some(std::mem::replace(&mut ledger.co_id, tag_co));
                let tag_power = ledger.tag_power.unwrap_or(0);
                ledger.tag_power = Some(std::mem::replace(&mut ledger.power, tag_power));
            }
            update.apply(ctx)
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Tag", ctx)
    }
}
