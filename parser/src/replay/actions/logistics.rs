use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::ReplayUnit;
use crate::replay::controller::ReplaySetupContext;
use crate::types::{BuildingId, PlayerId, Position, TerrainId, UnitId};

use super::game_end::Elimination;
use super::movement::{apply_discoveries, read_discoveries};
use super::payload::{
    field, id, id_field, id_list, int, opt_field, opt_int_field, per_player, position_field,
    string, unit_patch,
};
use super::{ActionBuildContext, ActionFrame, ActionStep, Framed};

const CAPTURE_FRESH: i64 = 20;
const CAPTURE_CONTINUED: i64 = 10;

macro_rules! framed {
    ($($action:ty),+ $(,)?) => {
        $(
            impl Framed for $action {
                fn frame(&self) -> &ActionFrame {
                    &self.frame
                }
            }
        )+
    };
}

framed!(
    CaptureAction,
    BuildUnitAction,
    DeleteUnitAction,
    SupplyAction,
    RepairAction,
    JoinAction,
);

/// Refills fuel and ammo to the catalog maxima for the unit's type. Units
/// the catalog does not know are left alone.
fn resupply(ctx: &mut ReplaySetupContext, id: UnitId) -> Result<()> {
    let name = ctx.require_unit(id)?.name.clone();
    let Some(info) = name.and_then(|name| ctx.constants().unit(&name).cloned()) else {
        return Ok(());
    };
    let unit = ctx.unit_mut(id)?;
    unit.fuel = Some(info.max_fuel);
    unit.ammo = Some(info.max_ammo);
    Ok(())
}

pub(crate) fn resupply_all(ctx: &mut ReplaySetupContext, ids: &[UnitId]) -> Result<()> {
    for id in ids {
        resupply(ctx, *id)?;
    }
    Ok(())
}

/// An infantry unit working on a property.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureAction {
    pub player_id: PlayerId,
    pub building_id: BuildingId,
    pub position: Position,
    pub capture: i64,
    /// Taken from the payload when present, otherwise derived on setup
    pub last_capture: Option<i64>,
    pub terrain_id: Option<TerrainId>,
    pub team: Option<String>,
    pub income: Vec<(PlayerId, i64)>,
    pub eliminated: Option<Elimination>,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl CaptureAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        let info = field(payload, "buildingInfo")?;
        let income = match opt_field(payload, "income") {
            Some(income) => per_player(income, "income")?
                .into_iter()
                .map(|(player, entry)| {
                    let amount = match entry.get("income") {
                        Some(amount) => int(amount, "income")?,
                        None => int(entry, "income")?,
                    };
                    Ok((player, amount))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let eliminated = opt_field(payload, "eliminated")
            .map(Elimination::from_payload)
            .transpose()?;

        Ok(CaptureAction {
            player_id: ctx.actor(),
            building_id: id_field(info, "buildings_id")?,
            position: position_field(info, "buildings_x", "buildings_y")?,
            capture: int(field(info, "buildings_capture")?, "buildings_capture")?,
            last_capture: opt_int_field(info, "buildings_last_capture")?,
            terrain_id: opt_field(info, "buildings_terrain_id")
                .map(|value| id(value, "buildings_terrain_id"))
                .transpose()?,
            team: opt_field(info, "buildings_team")
                .map(|value| string(value, "buildings_team"))
                .transpose()?,
            income,
            eliminated,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }

    /// The unit standing on the property, if it is partway through a
    /// capture.
    fn capturing_unit(&self, ctx: &ReplaySetupContext) -> Option<UnitId> {
        ctx.units()
            .values()
            .find(|unit| !unit.is_carried() && unit.position() == Some(self.position))
            .filter(|unit| unit.capture.unwrap_or(0) != 0)
            .map(|unit| unit.id)
    }

    fn apply(
        &self,
        ctx: &mut ReplaySetupContext,
        capturer_relocated: bool,
        interrupted: Option<UnitId>,
    ) -> Result<()> {
        let previous = ctx
            .building(self.position)
            .cloned()
            .ok_or_else(|| Error::missing(format!("building at {}", self.position)))?;
        let capturer = ctx
            .units()
            .values()
            .find(|unit| !unit.is_carried() && unit.position() == Some(self.position))
            .map(|unit| unit.id);
        let same_capturer = !capturer_relocated && capturer.is_some() && capturer == interrupted;
        let terrain_changed = self
            .terrain_id
            .is_some_and(|terrain| terrain != previous.terrain_id);
        let last_capture = self.last_capture.unwrap_or_else(|| {
            if terrain_changed {
                CAPTURE_FRESH
            } else if previous.last_capture != CAPTURE_FRESH && same_capturer {
                CAPTURE_CONTINUED
            } else {
                CAPTURE_FRESH
            }
        });

        let building = ctx.building_mut(self.position)?;
        building.capture = self.capture;
        building.last_capture = last_capture;
        if let Some(terrain) = self.terrain_id {
            building.terrain_id = terrain;
        }
        if let Some(team) = &self.team {
            building.team = Some(team.clone());
        }
        let owner_changed = building.team != previous.team;

        if terrain_changed {
            if let Some(terrain) = self.terrain_id {
                apply_discoveries(ctx, self.player_id, &[(self.position, terrain)])?;
            }
        }

        if !self.income.is_empty() {
            for (player, income) in &self.income {
                ctx.ledger_mut(*player)?.income = *income;
            }
        } else if owner_changed {
            ctx.relevel_income()?;
        }

        if let Some(elimination) = &self.eliminated {
            elimination.apply(ctx)?;
        }
        Ok(())
    }
}

impl ActionStep for CaptureAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let relocated = self.frame.move_relocates();
        let interrupted = self.capturing_unit(ctx);
        let mut frame = std::mem::take(&mut self.frame);
        let outcome = frame.setup(ctx, |ctx| self.apply(ctx, relocated, interrupted));
        self.frame = frame;
        outcome
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Capture", ctx)
    }
}

/// A factory producing a new unit.
#[derive(Debug, Clone, Serialize)]
pub struct BuildUnitAction {
    pub player_id: PlayerId,
    pub unit: ReplayUnit,
    pub discovered: Vec<(Position, TerrainId)>,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl BuildUnitAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        let unit = unit_patch(ctx.scoped(payload, "newUnit")?)?;
        Ok(BuildUnitAction {
            player_id: unit.player_id.unwrap_or_else(|| ctx.actor()),
            unit,
            discovered: read_discoveries(ctx, payload)?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }

    /// Price paid: catalog cost scaled by the CO multiplier and by the
    /// unit's starting health.
    pub fn cost(&self, ctx: &ReplaySetupContext) -> Result<i64> {
        let base = self
            .unit
            .name
            .as_deref()
            .and_then(|name| ctx.constants().unit(name))
            .map(|info| info.cost)
            .or(self.unit.cost)
            .ok_or_else(|| Error::missing(format!("price of unit {}", self.unit.id)))?;

        let ledger = ctx.ledger(self.player_id)?;
        let (co_id, power) = match ctx.active_powers().get(&self.player_id) {
            Some(active) => (active.co_id, active.state),
            None => (ledger.co_id, Default::default()),
        };
        let multiplier = ctx.constants().cost_multiplier(co_id, power);
        let health = self.unit.hit_points.unwrap_or(10.0).ceil();
        Ok((base as f64 * multiplier * health / 10.0).round() as i64)
    }

    fn apply(&self, ctx: &mut ReplaySetupContext) -> Result<()> {
        if ctx.unit(self.unit.id).is_some() {
            return Err(Error::invariant(
                "unit id",
                "an unused id",
                self.unit.id,
            ));
        }
        let cost = self.cost(ctx)?;
        ctx.replace_unit(self.unit.clone());
        ctx.ledger_mut(self.player_id)?.funds -= cost;
        apply_discoveries(ctx, self.player_id, &self.discovered)
    }
}

impl ActionStep for BuildUnitAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let mut frame = std::mem::take(&mut self.frame);
        let outcome = frame.setup(ctx, |ctx| self.apply(ctx));
        self.frame = frame;
        outcome
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Build", ctx)
    }
}

/// A player scrapping one of their own units.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteUnitAction {
    pub unit: UnitId,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl DeleteUnitAction {
    pub fn new(unit: UnitId, move_action: Option<Box<super::MoveUnitAction>>) -> Self {
        DeleteUnitAction {
            unit,
            frame: ActionFrame::new(move_action),
        }
    }

    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(DeleteUnitAction::new(
            id(ctx.scoped(payload, "unitId")?, "unitId")?,
            ctx.nested_move(payload)?,
        ))
    }
}

impl ActionStep for DeleteUnitAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let unit = self.unit;
        self.frame.setup(ctx, |ctx| ctx.remove_unit_with_cargo(unit).map(|_| ()))
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Delete", ctx)
    }
}

/// An APC topping up its neighbours.
#[derive(Debug, Clone, Serialize)]
pub struct SupplyAction {
    pub supplier: UnitId,
    pub supplied: Vec<UnitId>,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl SupplyAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(SupplyAction {
            supplier: id(ctx.scoped(payload, "unit")?, "unit")?,
            supplied: id_list(ctx.scoped(payload, "rows")?, "rows")?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl ActionStep for SupplyAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let (supplier, supplied) = (self.supplier, &self.supplied);
        self.frame.setup(ctx, |ctx| {
            ctx.require_unit(supplier)?;
            resupply_all(ctx, supplied)
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Supply", ctx)
    }
}

/// A black boat mending an adjacent unit.
#[derive(Debug, Clone, Serialize)]
pub struct RepairAction {
    pub player_id: PlayerId,
    pub repairer: UnitId,
    pub repaired: ReplayUnit,
    pub funds: Option<i64>,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl RepairAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(RepairAction {
            player_id: ctx.actor(),
            repairer: id(ctx.scoped(payload, "unit")?, "unit")?,
            repaired: unit_patch(ctx.scoped(payload, "repaired")?)?,
            funds: ctx
                .opt_scoped(payload, "funds")?
                .map(|funds| int(funds, "funds"))
                .transpose()?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl ActionStep for RepairAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let (player, repairer, repaired, funds) =
            (self.player_id, self.repairer, &self.repaired, self.funds);
        self.frame.setup(ctx, |ctx| {
            ctx.require_unit(repairer)?;
            resupply(ctx, repaired.id)?;
            ctx.patch_unit(repaired)?;
            if let Some(funds) = funds {
                ctx.set_funds(player, funds)?;
            }
            Ok(())
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Repair", ctx)
    }
}

/// Two damaged units of the same type merging into one.
#[derive(Debug, Clone, Serialize)]
pub struct JoinAction {
    pub player_id: PlayerId,
    /// The unit that moved in and disappears
    pub joining: UnitId,
    /// Patch for the unit that remains
    pub joined: ReplayUnit,
    pub funds: Option<i64>,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl JoinAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(JoinAction {
            player_id: ctx.actor(),
            joining: id(ctx.scoped(payload, "joinID")?, "joinID")?,
            joined: unit_patch(ctx.scoped(payload, "joinedUnit")?)?,
            funds: ctx
                .opt_scoped(payload, "newFunds")?
                .map(|funds| int(funds, "newFunds"))
                .transpose()?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl ActionStep for JoinAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let (player, joining, joined, funds) =
            (self.player_id, self.joining, &self.joined, self.funds);
        self.frame.setup(ctx, |ctx| {
            ctx.remove_unit_with_cargo(joining)?;
            ctx.patch_unit(joined)?;
            if let Some(funds) = funds {
                ctx.set_funds(player, funds)?;
            }
            Ok(())
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Join", ctx)
    }
}
