use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::model::ReplayUnit;
use crate::replay::controller::ReplaySetupContext;
use crate::types::{PlayerId, Position, TerrainId, UnitId};

use super::payload::{
    field, flag, float, id, id_field, int_field, opt_field, opt_int_field, position_field,
    unit_patch,
};
use super::{ActionBuildContext, ActionFrame, ActionStep, Framed};

const LAUNCH_RADIUS: u32 = 2;
const EXPLODE_RADIUS: u32 = 3;

/// Writes a post-combat patch. A unit left with no health is removed along
/// with its cargo.
pub(crate) fn settle(ctx: &mut ReplaySetupContext, patch: &ReplayUnit) -> Result<()> {
    if patch.is_destroyed() {
        ctx.remove_unit_with_cargo(patch.id)?;
    } else {
        ctx.patch_unit(patch)?;
    }
    Ok(())
}

/// Power meter reading after a fight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerMeter {
    pub player_id: PlayerId,
    pub power: i64,
    pub tag_power: Option<i64>,
}

impl PowerMeter {
    fn from_payload(payload: &Value) -> Result<Self> {
        Ok(PowerMeter {
            player_id: id_field(payload, "playerId")?,
            power: int_field(payload, "copValue")?,
            tag_power: opt_int_field(payload, "tagValue")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttackAction {
    pub attacker: ReplayUnit,
    pub defender: ReplayUnit,
    pub meters: Vec<PowerMeter>,
    /// Counter-attacks resolve before the attack itself
    pub reverse_order: bool,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl AttackAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        let meters = match opt_field(payload, "copValues") {
            Some(values) => ["attacker", "defender"]
                .into_iter()
                .filter_map(|side| opt_field(values, side))
                .map(PowerMeter::from_payload)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(AttackAction {
            attacker: unit_patch(ctx.scoped(payload, "attacker")?)?,
            defender: unit_patch(ctx.scoped(payload, "defender")?)?,
            meters,
            reverse_order: opt_field(payload, "reverseOrder")
                .map(|value| flag(value, "reverseOrder"))
                .transpose()?
                .unwrap_or(false),
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }

    fn apply(&self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let sides = if self.reverse_order {
            [&self.defender, &self.attacker]
        } else {
            [&self.attacker, &self.defender]
        };
        for patch in sides {
            settle(ctx, patch)?;
        }
        for meter in &self.meters {
            let ledger = ctx.ledger_mut(meter.player_id)?;
            ledger.power = meter.power;
            if meter.tag_power.is_some() {
                ledger.tag_power = meter.tag_power;
            }
        }
        Ok(())
    }
}

impl Framed for AttackAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for AttackAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let mut frame = std::mem::take(&mut self.frame);
        let outcome = frame.setup(ctx, |ctx| self.apply(ctx));
        self.frame = frame;
        outcome
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Attack", ctx)
    }
}

/// A missile fired from a silo, which is spent afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchAction {
    pub silo: Position,
    pub target: Position,
    pub hp_damage: f64,
    pub new_terrain_id: TerrainId,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl LaunchAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(LaunchAction {
            silo: position_field(payload, "siloX", "siloY")?,
            target: position_field(payload, "targetX", "targetY")?,
            hp_damage: float(field(payload, "hpDamage")?, "hpDamage")?,
            new_terrain_id: id_field(payload, "newTerrainId")?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for LaunchAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for LaunchAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let (silo, target, damage, terrain) =
            (self.silo, self.target, self.hp_damage, self.new_terrain_id);
        self.frame.setup(ctx, |ctx| {
            ctx.building_mut(silo)?.terrain_id = terrain;
            ctx.apply_area_damage(target, LAUNCH_RADIUS, -damage)
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Launch", ctx)
    }
}

/// A black bomb detonating itself.
#[derive(Debug, Clone, Serialize)]
pub struct ExplodeAction {
    pub unit: UnitId,
    pub hp_damage: f64,
    pub radius: u32,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl ExplodeAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        let radius = match opt_int_field(payload, "radius")? {
            Some(radius) => u32::try_from(radius)
                .map_err(|_| crate::Error::malformed(format!("negative blast radius {radius}")))?,
            None => EXPLODE_RADIUS,
        };
        Ok(ExplodeAction {
            unit: id(ctx.scoped(payload, "unitId")?, "unitId")?,
            hp_damage: float(field(payload, "hpDamage")?, "hpDamage")?,
            radius,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for ExplodeAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for ExplodeAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let (unit, damage, radius) = (self.unit, self.hp_damage, self.radius);
        self.frame.setup(ctx, |ctx| {
            let center = ctx.require_unit(unit)?.position();
            ctx.remove_unit_with_cargo(unit)?;
            match center {
                Some(center) => ctx.apply_area_damage(center, radius, -damage),
                None => Ok(()),
            }
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Explode", ctx)
    }
}
