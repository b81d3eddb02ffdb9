use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::model::{CoPowerState, ReplayUnit, Weather};
use crate::replay::controller::{ActivePower, ReplaySetupContext, clamp_hit_points};
use crate::types::{PlayerId, UnitId};

use super::combat::PowerMeter;
use super::payload::{
    code, field, float, id_field, id_list, int, items, opt_field, opt_int_field, per_player,
    string, unit_patch,
};
use super::{ActionBuildContext, ActionFrame, ActionStep, Framed};

/// Health (and optionally fuel) change applied to every unit of some players.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthChange {
    pub players: Vec<PlayerId>,
    pub hit_points: f64,
    /// Remaining fuel is multiplied by this and rounded down
    pub fuel_factor: Option<f64>,
}

impl HealthChange {
    fn from_payload(payload: &Value, sign: f64) -> Result<Self> {
        Ok(HealthChange {
            players: id_list(field(payload, "players")?, "players")?,
            hit_points: sign * float(field(payload, "hp")?, "hp")?.abs(),
            fuel_factor: opt_field(payload, "units_fuel")
                .map(|fuel| float(fuel, "units_fuel"))
                .transpose()?,
        })
    }

    fn apply(&self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let affected: Vec<UnitId> = ctx
            .units()
            .values()
            .filter(|unit| !unit.is_carried())
            .filter(|unit| unit.player_id.is_some_and(|owner| self.players.contains(&owner)))
            .map(|unit| unit.id)
            .collect();
        for id in affected {
            let unit = ctx.unit_mut(id)?;
            unit.hit_points = Some(clamp_hit_points(
                unit.hit_points.unwrap_or(10.0) + self.hit_points,
            ));
            if let (Some(factor), Some(fuel)) = (self.fuel_factor, unit.fuel) {
                unit.fuel = Some((fuel as f64 * factor).floor() as i64);
            }
        }
        Ok(())
    }
}

/// A CO power or super power being activated.
#[derive(Debug, Clone, Serialize)]
pub struct PowerAction {
    pub player_id: PlayerId,
    pub co_name: Option<String>,
    pub state: CoPowerState,
    pub power_name: Option<String>,
    pub meters: Vec<PowerMeter>,
    pub movement_bonus: i64,
    pub vision_bonus: i64,
    pub health_gain: Option<HealthChange>,
    pub health_loss: Option<HealthChange>,
    pub replaced_units: Vec<ReplayUnit>,
    pub added_units: Vec<ReplayUnit>,
    pub funds: Vec<(PlayerId, i64)>,
    pub weather: Option<Weather>,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl PowerAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        let meters = match opt_field(payload, "playersCOP") {
            Some(meters) => per_player(meters, "playersCOP")?
                .into_iter()
                .map(|(player_id, meter)| {
                    Ok(PowerMeter {
                        player_id,
                        power: int(field(meter, "cop")?, "cop")?,
                        tag_power: opt_int_field(meter, "tagCop")?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let (movement_bonus, vision_bonus) = match opt_field(payload, "global") {
            Some(global) => (
                opt_int_field(global, "units_movement_points")?.unwrap_or(0),
                opt_int_field(global, "units_vision")?.unwrap_or(0),
            ),
            None => (0, 0),
        };

        let hp_change = opt_field(payload, "hpChange");
        let health_gain = hp_change
            .and_then(|change| opt_field(change, "hpGain"))
            .map(|gain| HealthChange::from_payload(gain, 1.0))
            .transpose()?;
        let health_loss = hp_change
            .and_then(|change| opt_field(change, "hpLoss"))
            .map(|loss| HealthChange::from_payload(loss, -1.0))
            .transpose()?;

        let unit_list = |key: &str| -> Result<Vec<ReplayUnit>> {
            match ctx.opt_scoped(payload, key)? {
                Some(units) => items(units, key)?.into_iter().map(unit_patch).collect(),
                None => Ok(Vec::new()),
            }
        };

        let funds = match opt_field(payload, "playerReplace") {
            Some(players) => per_player(players, "playerReplace")?
                .into_iter()
                .filter_map(|(player, replaced)| {
                    opt_field(replaced, "players_funds")
                        .map(|funds| int(funds, "players_funds").map(|funds| (player, funds)))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(PowerAction {
            player_id: id_field(payload, "playerID")?,
            co_name: opt_field(payload, "coName")
                .map(|name| string(name, "coName"))
                .transpose()?,
            state: code(field(payload, "coPower")?, "coPower")?,
            power_name: opt_field(payload, "powerName")
                .map(|name| string(name, "powerName"))
                .transpose()?,
            meters,
            movement_bonus,
            vision_bonus,
            health_gain,
            health_loss,
            replaced_units: unit_list("unitReplace")?,
            added_units: unit_list("unitAdd")?,
            funds,
            weather: opt_field(payload, "weather")
                .map(|weather| code(field(weather, "weatherCode")?, "weatherCode"))
                .transpose()?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }

    fn apply(&self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let co_id = ctx.ledger(self.player_id)?.co_id;
        debug!(player = %self.player_id, state = %self.state, power = ?self.power_name, "power activated");
        ctx.set_active_power(
            self.player_id,
            Some(ActivePower {
                state: self.state,
                co_id,
                power_name: self.power_name.clone(),
                movement_bonus: self.movement_bonus,
                vision_bonus: self.vision_bonus,
            }),
        );

        for meter in &self.meters {
            let ledger = ctx.ledger_mut(meter.player_id)?;
            ledger.power = meter.power;
            if meter.tag_power.is_some() {
                ledger.tag_power = meter.tag_power;
            }
        }

        for change in [&self.health_gain, &self.health_loss].into_iter().flatten() {
            change.apply(ctx)?;
        }
        for patch in &self.replaced_units {
            ctx.patch_unit(patch)?;
        }
        for unit in &self.added_units {
            ctx.replace_unit(unit.clone());
        }
        for (player, funds) in &self.funds {
            ctx.set_funds(*player, *funds)?;
        }
        if let Some(weather) = self.weather {
            let mut cursor = ctx.cursor();
            cursor.weather = Some(weather);
            ctx.set_cursor(cursor);
        }
        Ok(())
    }
}

impl Framed for PowerAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for PowerAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let mut frame = std::mem::take(&mut self.frame);
        let outcome = frame.setup(ctx, |ctx| self.apply(ctx));
        self.frame = frame;
        outcome
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Power", ctx)
    }
}
